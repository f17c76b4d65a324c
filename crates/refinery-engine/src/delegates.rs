use std::collections::HashMap;
use std::sync::Arc;

use refinery_core::config::{AppConfig, DelegateConfig};
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::AgentDelegate;
use refinery_core::types::Capability;

/// Routes each capability to the delegate that performs it.
#[derive(Clone, Default)]
pub struct DelegateSet {
    by_capability: HashMap<Capability, Arc<dyn AgentDelegate>>,
    fallback: Option<Arc<dyn AgentDelegate>>,
}

impl DelegateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// One delegate for every capability.
    pub fn uniform(delegate: Arc<dyn AgentDelegate>) -> Self {
        Self {
            by_capability: HashMap::new(),
            fallback: Some(delegate),
        }
    }

    /// Resolve every capability through `AppConfig::delegate_for`. The
    /// `[delegate]` section is built once and shared by every capability
    /// without an override.
    pub fn from_config<F>(config: &AppConfig, mut build: F) -> Result<Self>
    where
        F: FnMut(&str, &DelegateConfig) -> Result<Arc<dyn AgentDelegate>>,
    {
        let mut set = Self::uniform(build("default", &config.delegate)?);
        for capability in Capability::ALL {
            let section = config.delegate_for(capability);
            if !std::ptr::eq(section, &config.delegate) {
                set.insert(capability, build(capability.as_str(), section)?);
            }
        }
        Ok(set)
    }

    pub fn with(mut self, capability: Capability, delegate: Arc<dyn AgentDelegate>) -> Self {
        self.insert(capability, delegate);
        self
    }

    pub fn insert(&mut self, capability: Capability, delegate: Arc<dyn AgentDelegate>) {
        self.by_capability.insert(capability, delegate);
    }

    pub fn get(&self, capability: Capability) -> Option<&Arc<dyn AgentDelegate>> {
        self.by_capability.get(&capability).or(self.fallback.as_ref())
    }

    /// Like `get`, but a missing delegate is a configuration error.
    pub fn require(&self, capability: Capability) -> Result<&Arc<dyn AgentDelegate>> {
        self.get(capability).ok_or_else(|| {
            RefineryError::Config(format!("no delegate configured for capability '{}'", capability))
        })
    }

    /// Delegates serving `capabilities`, each listed once.
    pub fn distinct(&self, capabilities: &[Capability]) -> Vec<Arc<dyn AgentDelegate>> {
        let mut out: Vec<Arc<dyn AgentDelegate>> = Vec::new();
        for cap in capabilities {
            if let Some(d) = self.get(*cap) {
                if !out.iter().any(|seen| Arc::ptr_eq(seen, d)) {
                    out.push(Arc::clone(d));
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for DelegateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (cap, d) in &self.by_capability {
            map.entry(&cap.as_str(), &d.name());
        }
        if let Some(d) = &self.fallback {
            map.entry(&"*", &d.name());
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_test_utils::ScriptedDelegate;

    #[test]
    fn test_override_then_fallback() {
        let default: Arc<dyn AgentDelegate> = Arc::new(ScriptedDelegate::echo("default"));
        let tester: Arc<dyn AgentDelegate> = Arc::new(ScriptedDelegate::echo("tester"));
        let set = DelegateSet::uniform(default).with(Capability::RunTests, tester);

        assert_eq!(set.get(Capability::RunTests).unwrap().name(), "tester");
        assert_eq!(set.get(Capability::Design).unwrap().name(), "default");
    }

    #[test]
    fn test_missing_capability() {
        let set = DelegateSet::new().with(
            Capability::Design,
            Arc::new(ScriptedDelegate::echo("designer")) as Arc<dyn AgentDelegate>,
        );
        assert!(set.get(Capability::Finalize).is_none());
        assert!(matches!(
            set.require(Capability::Finalize),
            Err(RefineryError::Config(_))
        ));
    }

    #[test]
    fn test_from_config_applies_overrides() {
        let config = AppConfig::parse(
            r#"
[delegate]
type = "static"

[delegates.run_tests]
type = "command"
program = "pytest"
"#,
        )
        .unwrap();

        let mut built = Vec::new();
        let set = DelegateSet::from_config(&config, |name, section| {
            built.push((name.to_string(), matches!(section, DelegateConfig::Command { .. })));
            Ok(Arc::new(ScriptedDelegate::echo(name)) as Arc<dyn AgentDelegate>)
        })
        .unwrap();

        assert_eq!(
            built,
            vec![("default".to_string(), false), ("run_tests".to_string(), true)]
        );
        assert_eq!(set.get(Capability::RunTests).unwrap().name(), "run_tests");
        assert_eq!(set.get(Capability::Evaluate).unwrap().name(), "default");
        assert_eq!(set.distinct(&Capability::ALL).len(), 2);
    }

    #[test]
    fn test_distinct_dedups_shared_delegates() {
        let shared: Arc<dyn AgentDelegate> = Arc::new(ScriptedDelegate::echo("shared"));
        let other: Arc<dyn AgentDelegate> = Arc::new(ScriptedDelegate::echo("other"));
        let set = DelegateSet::uniform(shared).with(Capability::Evaluate, other);

        let distinct = set.distinct(&Capability::ALL);
        assert_eq!(distinct.len(), 2);
    }
}
