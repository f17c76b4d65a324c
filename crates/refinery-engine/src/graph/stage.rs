use serde::{Deserialize, Serialize};

use refinery_core::config::StageConfig;
use refinery_core::types::Capability;

/// A stage in the workflow graph.
///
/// Stages are stateless descriptors: which keys to read from the
/// `WorkflowContext`, which key to write, and which delegate capability
/// performs the work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique name within the graph.
    pub name: String,
    /// Delegate capability that executes this stage.
    pub capability: Capability,
    /// Keys to pull from the context as input, in declared order.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Key this stage owns and writes.
    pub output_key: String,
}

impl Stage {
    /// Create a stage with no inputs.
    pub fn new(
        name: impl Into<String>,
        capability: Capability,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            capability,
            input_keys: vec![],
            output_key: output_key.into(),
        }
    }

    /// Set the input keys.
    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this stage declares `key` as an input.
    pub fn reads(&self, key: &str) -> bool {
        self.input_keys.iter().any(|k| k == key)
    }
}

impl From<&StageConfig> for Stage {
    fn from(config: &StageConfig) -> Self {
        Self {
            name: config.name.clone(),
            capability: config.capability,
            input_keys: config.input_keys.clone(),
            output_key: config.output_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_builder() {
        let stage = Stage::new("implement", Capability::Implement, "implementation")
            .with_inputs(["description", "design"]);

        assert_eq!(stage.name, "implement");
        assert_eq!(stage.capability, Capability::Implement);
        assert_eq!(stage.input_keys, vec!["description", "design"]);
        assert_eq!(stage.output_key, "implementation");
        assert!(stage.reads("design"));
        assert!(!stage.reads("evaluation"));
    }

    #[test]
    fn test_from_config() {
        let config = StageConfig {
            name: "review".into(),
            capability: Capability::Evaluate,
            input_keys: vec!["code".into()],
            output_key: "review".into(),
        };
        let stage = Stage::from(&config);
        assert_eq!(stage.name, "review");
        assert_eq!(stage.input_keys, vec!["code"]);
    }
}
