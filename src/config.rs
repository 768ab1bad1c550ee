//! Compilation options.

use crate::core::{CompileError, CompileResult, BUFFER_ALIGNMENT};
use crate::planner::{OptimalPlanner, PlannerKind};

/// Size of the scratch arena used to measure the real one.
pub const DEFAULT_PROBE_ARENA_BYTES: usize = 1024 * 1024;

/// Search expansions the optimal planner may spend before settling.
pub const DEFAULT_SEARCH_BUDGET: usize = OptimalPlanner::DEFAULT_BUDGET;

/// Options for one compilation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub planner: PlannerKind,
    /// Alignment of every planned buffer, and of the retained region.
    pub alignment: usize,
    pub probe_arena_bytes: usize,
    pub search_budget: usize,
    /// Emit the `// Generated on:` line.
    pub timestamp: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            planner: PlannerKind::default(),
            alignment: BUFFER_ALIGNMENT,
            probe_arena_bytes: DEFAULT_PROBE_ARENA_BYTES,
            search_budget: DEFAULT_SEARCH_BUDGET,
            timestamp: true,
        }
    }
}

impl CompileOptions {
    pub fn validate(&self) -> CompileResult<()> {
        if !self.alignment.is_power_of_two() {
            return Err(CompileError::Config(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        if self.alignment > BUFFER_ALIGNMENT {
            // The host arena only guarantees this much.
            return Err(CompileError::Config(format!(
                "alignment may not exceed {BUFFER_ALIGNMENT}, got {}",
                self.alignment
            )));
        }
        if self.probe_arena_bytes == 0 {
            return Err(CompileError::Config("probe arena size must not be zero".into()));
        }
        Ok(())
    }
}
