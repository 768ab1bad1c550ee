//! Greedy first-fit planning.
//!
//! Units are visited from largest to smallest (ties by original position).
//! Each one goes to the lowest offset that does not collide with an
//! already placed unit whose lifetime overlaps its own.

use super::{MemoryPlan, MemoryPlanner};
use crate::core::AllocationUnit;

/// First-fit-by-decreasing-size planner.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyPlanner;

impl GreedyPlanner {
    /// Indices of units needing allocation, in greedy visiting order.
    pub(crate) fn visiting_order(units: &[AllocationUnit]) -> Vec<usize> {
        let mut order: Vec<usize> = units
            .iter()
            .enumerate()
            .filter(|(_, unit)| unit.needs_allocation)
            .map(|(idx, _)| idx)
            .collect();
        // Stable sort keeps original order among equal sizes.
        order.sort_by(|&a, &b| units[b].bytes.cmp(&units[a].bytes));
        order
    }

    /// Place units in the given order, each at its lowest feasible offset.
    pub(crate) fn place_in_order(
        units: &[AllocationUnit],
        order: &[usize],
    ) -> Vec<Option<usize>> {
        let mut offsets: Vec<Option<usize>> = vec![None; units.len()];
        let mut placed: Vec<usize> = Vec::with_capacity(order.len());
        let mut occupied: Vec<(usize, usize)> = Vec::new();

        for &idx in order {
            let unit = &units[idx];
            occupied.clear();
            for &other in &placed {
                if unit.lifetimes_overlap(&units[other]) {
                    if let Some(offset) = offsets[other] {
                        occupied.push((offset, offset + units[other].bytes));
                    }
                }
            }
            let offset = lowest_fit(&mut occupied, unit.bytes);
            log::trace!("greedy: {} -> offset {}", unit.id, offset);
            offsets[idx] = Some(offset);
            placed.push(idx);
        }
        offsets
    }
}

impl MemoryPlanner for GreedyPlanner {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn plan(&self, units: &[AllocationUnit]) -> MemoryPlan {
        let order = Self::visiting_order(units);
        let offsets = Self::place_in_order(units, &order);
        MemoryPlan::from_offsets(units, offsets)
    }
}

/// Lowest offset where `size` bytes fit between the `occupied` ranges.
///
/// `occupied` holds half-open `[start, end)` ranges and is sorted in place.
pub(crate) fn lowest_fit(occupied: &mut [(usize, usize)], size: usize) -> usize {
    occupied.sort_unstable();
    let mut candidate = 0;
    for &(start, end) in occupied.iter() {
        if candidate + size <= start {
            break;
        }
        candidate = candidate.max(end);
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArenaHandle, UnitId};

    fn unit(idx: usize, bytes: usize, first: usize, last: usize) -> AllocationUnit {
        AllocationUnit::planned(UnitId::Tensor(idx), bytes, first, last)
    }

    #[test]
    fn test_lowest_fit() {
        assert_eq!(lowest_fit(&mut [], 16), 0);
        assert_eq!(lowest_fit(&mut [(0, 16)], 16), 16);
        assert_eq!(lowest_fit(&mut [(32, 48), (0, 16)], 16), 16);
        assert_eq!(lowest_fit(&mut [(32, 48), (0, 16)], 32), 48);
        assert_eq!(lowest_fit(&mut [(16, 32)], 16), 0);
        // Nested ranges.
        assert_eq!(lowest_fit(&mut [(0, 64), (16, 32)], 16), 64);
    }

    #[test]
    fn test_chain_reuses_memory() {
        // Three tensors in a chain; first and last never overlap.
        let units = [unit(0, 16, 0, 0), unit(1, 16, 0, 1), unit(2, 16, 1, 1)];
        let plan = GreedyPlanner.plan(&units);
        plan.verify(&units).unwrap();
        assert_eq!(plan.arena_size(), 32);
        assert_eq!(plan.offset(0), plan.offset(2));
    }

    #[test]
    fn test_all_overlapping() {
        let units = [unit(0, 16, 0, 1), unit(1, 32, 0, 2), unit(2, 16, 1, 2)];
        let plan = GreedyPlanner.plan(&units);
        plan.verify(&units).unwrap();
        assert_eq!(plan.arena_size(), 64);
        // Largest first.
        assert_eq!(plan.offset(1), Some(ArenaHandle(0)));
        assert_eq!(plan.offset(0), Some(ArenaHandle(32)));
        assert_eq!(plan.offset(2), Some(ArenaHandle(48)));
    }

    #[test]
    fn test_unplanned_units_are_skipped() {
        let mut units = [unit(0, 16, 0, 1), unit(1, 1024, 0, 1)];
        units[1].needs_allocation = false;
        let plan = GreedyPlanner.plan(&units);
        assert_eq!(plan.offset(1), None);
        assert_eq!(plan.planned_count(), 1);
        assert_eq!(plan.arena_size(), 16);
    }

    #[test]
    fn test_ties_keep_original_order() {
        let units = [unit(0, 16, 0, 0), unit(1, 16, 0, 0)];
        let plan = GreedyPlanner.plan(&units);
        assert_eq!(plan.offset(0), Some(ArenaHandle(0)));
        assert_eq!(plan.offset(1), Some(ArenaHandle(16)));
    }

    #[test]
    fn test_empty() {
        let plan = GreedyPlanner.plan(&[]);
        assert_eq!(plan.arena_size(), 0);
    }
}
