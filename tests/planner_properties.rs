//! Property tests for the arena planners.

use offline_interp::planner::live_bytes_lower_bound;
use offline_interp::{AllocationUnit, GreedyPlanner, MemoryPlanner, OptimalPlanner, UnitId};
use proptest::prelude::*;

/// Random units with padded sizes and intervals inside a short schedule.
fn units_strategy(max_units: usize) -> impl Strategy<Value = Vec<AllocationUnit>> {
    let spec = (1usize..=8, 0usize..6, 0usize..4, any::<bool>());
    prop::collection::vec(spec, 0..=max_units).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(idx, (blocks, first, span, planned))| {
                let id = UnitId::Tensor(idx);
                let mut unit = AllocationUnit::planned(id, blocks * 16, first, first + span);
                unit.needs_allocation = planned;
                unit
            })
            .collect()
    })
}

fn ranges_overlap(a: (usize, usize), b: (usize, usize)) -> bool {
    a.0 < b.0 + b.1 && b.0 < a.0 + a.1
}

fn assert_no_live_overlap(units: &[AllocationUnit], plan: &offline_interp::MemoryPlan) {
    for i in 0..units.len() {
        for j in i + 1..units.len() {
            let (Some(a), Some(b)) = (plan.offset(i), plan.offset(j)) else {
                continue;
            };
            if units[i].lifetimes_overlap(&units[j]) {
                assert!(
                    !ranges_overlap((a.0, units[i].bytes), (b.0, units[j].bytes)),
                    "{} at {} and {} at {} share bytes",
                    units[i].id,
                    a.0,
                    units[j].id,
                    b.0
                );
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn greedy_never_overlaps_live_units(units in units_strategy(24)) {
        let plan = GreedyPlanner.plan(&units);
        prop_assert!(plan.verify(&units).is_ok());
        assert_no_live_overlap(&units, &plan);
        for (idx, unit) in units.iter().enumerate() {
            prop_assert_eq!(plan.offset(idx).is_some(), unit.needs_allocation);
        }
    }

    #[test]
    fn optimal_never_overlaps_live_units(units in units_strategy(10)) {
        let plan = OptimalPlanner::with_budget(20_000).plan(&units);
        prop_assert!(plan.verify(&units).is_ok());
        assert_no_live_overlap(&units, &plan);
    }

    #[test]
    fn optimal_never_exceeds_greedy(units in units_strategy(10)) {
        let greedy = GreedyPlanner.plan(&units);
        let optimal = OptimalPlanner::with_budget(20_000).plan(&units);
        prop_assert!(optimal.arena_size() <= greedy.arena_size());
        prop_assert!(optimal.arena_size() >= live_bytes_lower_bound(&units));
    }

    #[test]
    fn offsets_stay_aligned(units in units_strategy(16)) {
        let plan = GreedyPlanner.plan(&units);
        for idx in 0..units.len() {
            if let Some(handle) = plan.offset(idx) {
                prop_assert_eq!(handle.0 % 16, 0);
            }
        }
    }
}

#[test]
fn three_unit_example_packs_to_64_bytes() {
    let units = [
        AllocationUnit::planned(UnitId::Tensor(0), 16, 0, 1),
        AllocationUnit::planned(UnitId::Tensor(1), 32, 0, 2),
        AllocationUnit::planned(UnitId::Tensor(2), 16, 1, 2),
    ];
    assert_eq!(GreedyPlanner.plan(&units).arena_size(), 64);
    assert_eq!(OptimalPlanner::default().plan(&units).arena_size(), 64);
}
