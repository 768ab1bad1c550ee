//! Arena memory planning.
//!
//! A planner receives the full list of [`AllocationUnit`]s and assigns an
//! arena offset to every unit that needs allocation. Whatever the strategy,
//! two units whose lifetimes overlap never receive overlapping byte ranges.
//! Sizes arrive already padded; planners never insert padding themselves.
//!
//! - [`GreedyPlanner`] - first fit in order of decreasing size
//! - [`OptimalPlanner`] - bounded exact search seeded with the greedy plan

pub mod greedy;
pub mod optimal;

pub use greedy::GreedyPlanner;
pub use optimal::OptimalPlanner;

use std::fmt;

use crate::core::{AllocationUnit, ArenaHandle, CompileError, CompileResult};

/// A placement strategy.
pub trait MemoryPlanner {
    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Place every unit with `needs_allocation` set.
    fn plan(&self, units: &[AllocationUnit]) -> MemoryPlan;
}

/// Which strategy to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum PlannerKind {
    #[default]
    Greedy,
    Optimal,
}

impl PlannerKind {
    /// Instantiate the strategy. `search_budget` only affects the optimal planner.
    pub fn build(self, search_budget: usize) -> Box<dyn MemoryPlanner> {
        match self {
            PlannerKind::Greedy => Box::new(GreedyPlanner),
            PlannerKind::Optimal => Box::new(OptimalPlanner::with_budget(search_budget)),
        }
    }
}

impl fmt::Display for PlannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerKind::Greedy => f.write_str("greedy"),
            PlannerKind::Optimal => f.write_str("optimal"),
        }
    }
}

/// Offsets for planned units plus the required arena size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    /// One entry per input unit, `None` for units that were not planned.
    offsets: Vec<Option<ArenaHandle>>,
    arena_size: usize,
}

impl MemoryPlan {
    pub(crate) fn from_offsets(units: &[AllocationUnit], offsets: Vec<Option<usize>>) -> Self {
        let arena_size = units
            .iter()
            .zip(&offsets)
            .filter_map(|(unit, offset)| offset.map(|offset| offset + unit.bytes))
            .max()
            .unwrap_or(0);
        Self {
            offsets: offsets.into_iter().map(|o| o.map(ArenaHandle)).collect(),
            arena_size,
        }
    }

    /// High-water mark across all planned ranges.
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    /// Offset assigned to the unit at `index`.
    pub fn offset(&self, index: usize) -> Option<ArenaHandle> {
        self.offsets.get(index).copied().flatten()
    }

    pub fn planned_count(&self) -> usize {
        self.offsets.iter().filter(|o| o.is_some()).count()
    }

    /// Check the plan against the units it was computed for.
    ///
    /// Every unit needing allocation must be placed, the arena size must
    /// cover every range, and no two live-overlapping units may share bytes.
    pub fn verify(&self, units: &[AllocationUnit]) -> CompileResult<()> {
        let placed: Vec<(usize, usize)> = units
            .iter()
            .enumerate()
            .filter(|(_, unit)| unit.needs_allocation)
            .map(|(idx, _)| {
                self.offset(idx)
                    .map(|ArenaHandle(offset)| (idx, offset))
                    .ok_or(CompileError::UnplacedUnit { unit: units[idx].id })
            })
            .collect::<CompileResult<_>>()?;

        for (i, &(a, a_offset)) in placed.iter().enumerate() {
            debug_assert!(a_offset + units[a].bytes <= self.arena_size);
            for &(b, b_offset) in &placed[i + 1..] {
                if !units[a].lifetimes_overlap(&units[b]) {
                    continue;
                }
                let disjoint =
                    a_offset + units[a].bytes <= b_offset || b_offset + units[b].bytes <= a_offset;
                if !disjoint {
                    return Err(CompileError::PlanViolation {
                        first: units[a].id,
                        second: units[b].id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Human readable plan, one line per placed unit.
    pub fn describe(&self, units: &[AllocationUnit]) -> String {
        let mut out = String::new();
        for (idx, unit) in units.iter().enumerate() {
            if let Some(ArenaHandle(offset)) = self.offset(idx) {
                let (first, last) = unit.interval().unwrap_or((0, 0));
                out.push_str(&format!(
                    "{:>18}: offset {:>8}, {:>8} bytes, steps {}..={}\n",
                    unit.id.to_string(),
                    offset,
                    unit.bytes,
                    first,
                    last
                ));
            }
        }
        out.push_str(&format!("arena high-water mark: {} bytes\n", self.arena_size));
        out
    }
}

/// Peak of the summed sizes of units live at the same step.
///
/// No valid plan can be smaller than this.
pub fn live_bytes_lower_bound(units: &[AllocationUnit]) -> usize {
    let last_step = units
        .iter()
        .filter(|u| u.needs_allocation)
        .filter_map(|u| u.last_used)
        .max();
    let Some(last_step) = last_step else {
        return 0;
    };

    // Difference array over steps.
    let mut delta = vec![0isize; last_step + 2];
    for unit in units.iter().filter(|u| u.needs_allocation) {
        if let Some((first, last)) = unit.interval() {
            delta[first] += unit.bytes as isize;
            delta[last + 1] -= unit.bytes as isize;
        }
    }
    let mut live = 0isize;
    let mut peak = 0isize;
    for d in delta {
        live += d;
        peak = peak.max(live);
    }
    peak as usize
}
