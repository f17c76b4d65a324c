//! Stage graph and run state.
//!
//! A workflow is a linear chain of `Stage`s with a single conditional
//! back-edge from the evaluate stage to the refine target. Stages exchange
//! data through a per-run `WorkflowContext` in which every key has exactly
//! one owning stage.

pub mod context;
pub mod executor;
pub mod stage;
pub mod state;
pub mod workflow;

pub use context::{ContextSnapshot, WorkflowContext};
pub use executor::WorkflowEngine;
pub use stage::Stage;
pub use state::RunState;
pub use workflow::{dev_pipeline, WorkflowGraph};
