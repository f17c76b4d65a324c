use refinery_core::types::{HistoryEntry, RunPhase};

/// Mutable per-run state: the phase machine, the iteration counter, and the
/// append-only stage history.
#[derive(Debug, Clone)]
pub struct RunState {
    phase: RunPhase,
    iteration: u32,
    max_iterations: u32,
    history: Vec<HistoryEntry>,
}

impl RunState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            phase: RunPhase::Pending,
            iteration: 0,
            max_iterations,
            history: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn into_history(self) -> Vec<HistoryEntry> {
        self.history
    }

    /// Whether another refinement pass is allowed.
    pub fn can_refine(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Enter `Refining` and bump the iteration. Returns the new iteration,
    /// or `None` when the bound is reached.
    pub fn begin_refinement(&mut self) -> Option<u32> {
        if !self.can_refine() || !self.transition(RunPhase::Refining) {
            return None;
        }
        self.iteration += 1;
        Some(self.iteration)
    }

    /// Move to `next` if the phase machine allows it.
    pub fn transition(&mut self, next: RunPhase) -> bool {
        use RunPhase::*;
        let allowed = matches!(
            (self.phase, next),
            (Pending, Running)
                | (Running, Refining)
                | (Refining, Running)
                | (Running, Finalizing)
                | (Finalizing, Succeeded)
                | (Pending | Running | Refining | Finalizing, Failed)
        );
        if allowed {
            self.phase = next;
        }
        allowed
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }
}
