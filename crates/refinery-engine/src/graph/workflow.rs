use std::collections::HashSet;

use refinery_core::config::PipelineConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::types::{Capability, TASK_KEYS, TASK_OWNER};

use super::stage::Stage;

/// Static pipeline topology.
///
/// An ordered chain of stages plus one conditional back-edge: after the
/// `evaluate` stage the engine either continues to the tail, or re-enters
/// the chain at `refine_target`. When a `refiner` is present it stands in for
/// the refine target on those passes and writes the target's key.
///
/// Construction validates the whole topology, so a `WorkflowGraph` that
/// exists is always executable.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    stages: Vec<Stage>,
    evaluate: usize,
    refine_target: usize,
    refiner: Option<Stage>,
}

impl WorkflowGraph {
    /// Build and validate a graph.
    pub fn new(
        stages: Vec<Stage>,
        evaluate: &str,
        refine_target: &str,
        refiner: Option<Stage>,
    ) -> Result<Self> {
        let (evaluate, refine_target) =
            validate(&stages, evaluate, refine_target, refiner.as_ref())?;
        Ok(Self {
            stages,
            evaluate,
            refine_target,
            refiner,
        })
    }

    /// Build a graph from its serialized form.
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Self::new(
            config.stages.iter().map(Stage::from).collect(),
            &config.evaluate,
            &config.refine_target,
            config.refiner.as_ref().map(Stage::from),
        )
    }

    /// All stages in base order (the refiner is not part of the chain).
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn evaluate_stage(&self) -> &Stage {
        &self.stages[self.evaluate]
    }

    pub fn refine_target(&self) -> &Stage {
        &self.stages[self.refine_target]
    }

    pub fn refiner(&self) -> Option<&Stage> {
        self.refiner.as_ref()
    }

    /// Stages up to and including the evaluate stage.
    pub fn head(&self) -> &[Stage] {
        &self.stages[..=self.evaluate]
    }

    /// Stages after the evaluate stage.
    pub fn tail(&self) -> &[Stage] {
        &self.stages[self.evaluate + 1..]
    }

    /// Stages executed on a refinement pass, in order.
    ///
    /// The refiner replaces the refine target. Test-creation stages keep
    /// their first output unless `rerun_test_creation` is set.
    pub fn refine_span(&self, rerun_test_creation: bool) -> Vec<&Stage> {
        self.stages[self.refine_target..=self.evaluate]
            .iter()
            .enumerate()
            .filter_map(|(offset, stage)| {
                if offset == 0 {
                    return Some(self.refiner.as_ref().unwrap_or(stage));
                }
                if stage.capability == Capability::CreateTests && !rerun_test_creation {
                    return None;
                }
                Some(stage)
            })
            .collect()
    }

    /// Every output key declared by the chain, in base order.
    pub fn output_keys(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.output_key.as_str()).collect()
    }

    /// Capabilities a delegate set must cover to run this graph.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self
            .stages
            .iter()
            .chain(self.refiner.iter())
            .map(|s| s.capability)
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }
}

/// Check the topology; returns the (evaluate, refine_target) indices.
fn validate(
    stages: &[Stage],
    evaluate: &str,
    refine_target: &str,
    refiner: Option<&Stage>,
) -> Result<(usize, usize)> {
    let invalid = |msg: String| Err(RefineryError::InvalidGraph(msg));

    if stages.is_empty() {
        return invalid("graph has no stages".into());
    }

    let mut names: HashSet<&str> = HashSet::new();
    let mut available: HashSet<&str> = TASK_KEYS.iter().copied().collect();

    for stage in stages {
        if stage.name.is_empty() || stage.output_key.is_empty() {
            return invalid("stage names and output keys must be non-empty".into());
        }
        if stage.name == TASK_OWNER {
            return invalid(format!("stage name '{}' is reserved", TASK_OWNER));
        }
        if !names.insert(stage.name.as_str()) {
            return invalid(format!("duplicate stage name '{}'", stage.name));
        }
        for key in &stage.input_keys {
            if !available.contains(key.as_str()) {
                return invalid(format!(
                    "stage '{}' reads '{}' before any stage produces it",
                    stage.name, key
                ));
            }
        }
        if TASK_KEYS.contains(&stage.output_key.as_str()) {
            return invalid(format!(
                "stage '{}' writes task field '{}'",
                stage.name, stage.output_key
            ));
        }
        if !available.insert(stage.output_key.as_str()) {
            return invalid(format!(
                "output key '{}' is produced by more than one stage",
                stage.output_key
            ));
        }
    }

    let position = |name: &str, role: &str| {
        stages
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RefineryError::InvalidGraph(format!("{} stage '{}' not found", role, name)))
    };
    let evaluate_idx = position(evaluate, "evaluate")?;
    let target_idx = position(refine_target, "refine target")?;

    if target_idx >= evaluate_idx {
        return invalid(format!(
            "refine target '{}' must precede evaluate stage '{}'",
            refine_target, evaluate
        ));
    }

    if let Some(refiner) = refiner {
        if names.contains(refiner.name.as_str()) || refiner.name == TASK_OWNER {
            return invalid(format!("refiner name '{}' is already in use", refiner.name));
        }
        let target = &stages[target_idx];
        if refiner.output_key != target.output_key {
            return invalid(format!(
                "refiner '{}' must write '{}' (the refine target's key), not '{}'",
                refiner.name, target.output_key, refiner.output_key
            ));
        }
        let mut visible: HashSet<&str> = TASK_KEYS.iter().copied().collect();
        visible.extend(stages[..=evaluate_idx].iter().map(|s| s.output_key.as_str()));
        if let Some(key) = refiner.input_keys.iter().find(|k| !visible.contains(k.as_str())) {
            return invalid(format!(
                "refiner '{}' reads '{}', which is not available by the end of evaluation",
                refiner.name, key
            ));
        }
    }

    Ok((evaluate_idx, target_idx))
}

/// The default design → implement → test → evaluate → refine → finalize
/// pipeline.
pub fn dev_pipeline() -> Result<WorkflowGraph> {
    let stages = vec![
        Stage::new("design", Capability::Design, "design")
            .with_inputs(["description", "requirements", "language"]),
        Stage::new("implement", Capability::Implement, "implementation")
            .with_inputs(["description", "requirements", "language", "design"]),
        Stage::new("create_tests", Capability::CreateTests, "test_cases")
            .with_inputs(["requirements", "language", "design", "implementation"]),
        Stage::new("run_tests", Capability::RunTests, "test_results")
            .with_inputs(["language", "repo_path", "implementation", "test_cases"]),
        Stage::new("evaluate", Capability::Evaluate, "evaluation")
            .with_inputs(["requirements", "implementation", "test_results"]),
        Stage::new("finalize", Capability::Finalize, "final_report").with_inputs([
            "description",
            "design",
            "implementation",
            "test_cases",
            "test_results",
            "evaluation",
        ]),
    ];
    let refiner = Stage::new("refine", Capability::Refine, "implementation").with_inputs([
        "requirements",
        "language",
        "design",
        "implementation",
        "evaluation",
    ]);

    WorkflowGraph::new(stages, "evaluate", "implement", Some(refiner))
}
