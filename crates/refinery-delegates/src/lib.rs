pub mod command;
pub mod http;
pub mod static_output;

use std::sync::Arc;
use std::time::Duration;

use refinery_core::config::DelegateConfig;
use refinery_core::error::Result;
use refinery_core::traits::AgentDelegate;

pub use command::CommandDelegate;
pub use http::HttpDelegate;
pub use static_output::StaticDelegate;

/// Build a delegate from its config section. `name` shows up in logs.
pub fn from_config(name: &str, config: &DelegateConfig) -> Result<Arc<dyn AgentDelegate>> {
    let delegate: Arc<dyn AgentDelegate> = match config {
        DelegateConfig::Http {
            base_url,
            api_key,
            connect_timeout_secs,
        } => Arc::new(HttpDelegate::new(
            name,
            base_url,
            api_key.clone(),
            Duration::from_secs(*connect_timeout_secs),
        )?),
        DelegateConfig::Command {
            program,
            args,
            working_dir,
            env,
        } => Arc::new(
            CommandDelegate::new(name, program.as_str())
                .with_args(args.clone())
                .with_working_dir(working_dir.clone())
                .with_env(env.clone()),
        ),
        DelegateConfig::Static { output } => Arc::new(StaticDelegate::new(name, output.clone())),
    };
    Ok(delegate)
}
