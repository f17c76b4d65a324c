pub mod delegates;
pub mod export;
pub mod graph;
pub mod policy;
pub mod retry;
pub mod run_log;
pub mod telemetry;

pub use delegates::DelegateSet;
pub use export::{export_completed, JsonFileExporter};
pub use graph::{dev_pipeline, Stage, WorkflowContext, WorkflowEngine, WorkflowGraph};
pub use policy::{MarkerPolicy, RefinementPolicy, StructuredPolicy};
pub use run_log::RunLogger;
pub use telemetry::TracingSink;
