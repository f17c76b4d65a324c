use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use refinery_core::error::{RefineryError, Result};
use refinery_core::types::{StageValue, Task, TASK_OWNER};

use super::stage::Stage;

/// Shared store threading data between the stages of one run.
///
/// Every key remembers the stage that first wrote it. Only that owner may
/// write the key again, which is what lets a stage re-execute during
/// refinement without clobbering anyone else's output.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    values: HashMap<String, StageValue>,
    owners: HashMap<String, String>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with the task fields, owned by `task`.
    pub fn seeded(task: &Task) -> Self {
        let mut ctx = Self::new();
        for (key, value) in task.context_entries() {
            ctx.values.insert(key.to_string(), value);
            ctx.owners.insert(key.to_string(), TASK_OWNER.to_string());
        }
        ctx
    }

    /// Write `value` under `key` on behalf of `owner`.
    pub fn set(&mut self, owner: &str, key: &str, value: StageValue) -> Result<()> {
        if let Some(existing) = self.owners.get(key) {
            if existing != owner {
                return Err(RefineryError::OwnershipViolation {
                    key: key.to_string(),
                    owner: existing.clone(),
                    writer: owner.to_string(),
                });
            }
        } else {
            self.owners.insert(key.to_string(), owner.to_string());
        }
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Get the current value for `key`.
    pub fn get(&self, key: &str) -> Result<&StageValue> {
        self.values
            .get(key)
            .ok_or_else(|| RefineryError::MissingDependency {
                key: key.to_string(),
            })
    }

    /// The stage (or `task`) that owns `key`.
    pub fn owner_of(&self, key: &str) -> Option<&str> {
        self.owners.get(key).map(|s| s.as_str())
    }

    /// Collect a stage's declared inputs.
    pub fn gather(&self, stage: &Stage) -> Result<BTreeMap<String, StageValue>> {
        stage
            .input_keys
            .iter()
            .map(|key| self.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Immutable copy of the current values, for audit and results.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            values: self
                .values
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Point-in-time copy of a context. No ownership tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextSnapshot {
    values: BTreeMap<String, StageValue>,
}

impl ContextSnapshot {
    pub fn get(&self, key: &str) -> Option<&StageValue> {
        self.values.get(key)
    }

    pub fn into_inner(self) -> BTreeMap<String, StageValue> {
        self.values
    }
}
