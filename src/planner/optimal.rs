// This module implements the optimal planner. It builds an interference graph over the units that
// need allocation (an edge joins two units whose lifetimes overlap, stored as one bitset row per
// unit) and runs a branch-and-bound search over placement orders, putting each unit at the lowest
// offset that clears its already placed neighbours. Every packing can be reproduced this way by
// visiting units in order of their offsets in that packing, so an exhaustive search is exact. The
// search starts from the greedy plan as incumbent, prunes any branch whose high-water mark already
// reaches the incumbent, stops as soon as the peak live-bytes lower bound is met, and gives up at
// a fixed expansion budget. The result is therefore never larger than the greedy plan.

//! Bounded exact interval packing.

use super::greedy::{lowest_fit, GreedyPlanner};
use super::{live_bytes_lower_bound, MemoryPlan, MemoryPlanner};
use crate::core::AllocationUnit;

/// Branch-and-bound planner seeded with the greedy result.
#[derive(Debug, Clone, Copy)]
pub struct OptimalPlanner {
    /// Maximum number of search expansions before settling for the best plan so far.
    budget: usize,
}

impl OptimalPlanner {
    pub const DEFAULT_BUDGET: usize = 200_000;

    pub fn with_budget(budget: usize) -> Self {
        Self { budget }
    }
}

impl Default for OptimalPlanner {
    fn default() -> Self {
        Self::with_budget(Self::DEFAULT_BUDGET)
    }
}

impl MemoryPlanner for OptimalPlanner {
    fn name(&self) -> &'static str {
        "optimal"
    }

    fn plan(&self, units: &[AllocationUnit]) -> MemoryPlan {
        let members = GreedyPlanner::visiting_order(units);
        let greedy = GreedyPlanner::place_in_order(units, &members);
        let greedy_plan = MemoryPlan::from_offsets(units, greedy);

        let lower_bound = live_bytes_lower_bound(units);
        if greedy_plan.arena_size() <= lower_bound || members.len() < 2 {
            log::debug!(
                "optimal: greedy plan of {} bytes meets the lower bound",
                greedy_plan.arena_size()
            );
            return greedy_plan;
        }

        let sizes: Vec<usize> = members.iter().map(|&idx| units[idx].bytes).collect();
        let mut search = Search {
            graph: InterferenceGraph::build(units, &members),
            sizes: &sizes,
            offsets: vec![0; members.len()],
            placed: BitSet::new(members.len()),
            best_size: greedy_plan.arena_size(),
            best_offsets: None,
            lower_bound,
            budget: self.budget,
            expansions: 0,
        };
        search.run(0, 0);

        if search.expansions >= search.budget && search.best_size > lower_bound {
            log::warn!(
                "optimal planner stopped after {} expansions; best plan {} bytes (lower bound {})",
                search.expansions,
                search.best_size,
                lower_bound
            );
        }
        log::debug!(
            "optimal: greedy {} bytes, best {} bytes, lower bound {}, {} expansions",
            greedy_plan.arena_size(),
            search.best_size,
            lower_bound,
            search.expansions
        );

        match search.best_offsets {
            Some(best) => {
                let mut offsets = vec![None; units.len()];
                for (slot, &idx) in members.iter().enumerate() {
                    offsets[idx] = Some(best[slot]);
                }
                MemoryPlan::from_offsets(units, offsets)
            }
            None => greedy_plan,
        }
    }
}

/// Fixed-size bitset over unit slots.
#[derive(Debug, Clone)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
        }
    }

    fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    fn clear(&mut self, idx: usize) {
        self.words[idx / 64] &= !(1u64 << (idx % 64));
    }

    fn contains(&self, idx: usize) -> bool {
        (self.words[idx / 64] & (1u64 << (idx % 64))) != 0
    }

    /// Slots set in both `self` and `other`.
    fn intersection<'a>(&'a self, other: &'a BitSet) -> impl Iterator<Item = usize> + 'a {
        self.words
            .iter()
            .zip(&other.words)
            .enumerate()
            .flat_map(|(word_idx, (&a, &b))| {
                let mut bits = a & b;
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let bit = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some(word_idx * 64 + bit)
                })
            })
    }
}

/// Adjacency rows over the planned units: an edge means overlapping lifetimes.
#[derive(Debug)]
struct InterferenceGraph {
    rows: Vec<BitSet>,
}

impl InterferenceGraph {
    fn build(units: &[AllocationUnit], members: &[usize]) -> Self {
        let mut rows = vec![BitSet::new(members.len()); members.len()];
        for (i, &a) in members.iter().enumerate() {
            for (j, &b) in members.iter().enumerate().skip(i + 1) {
                if units[a].lifetimes_overlap(&units[b]) {
                    rows[i].set(j);
                    rows[j].set(i);
                }
            }
        }
        Self { rows }
    }

    fn row(&self, slot: usize) -> &BitSet {
        &self.rows[slot]
    }
}

struct Search<'a> {
    graph: InterferenceGraph,
    sizes: &'a [usize],
    offsets: Vec<usize>,
    placed: BitSet,
    best_size: usize,
    best_offsets: Option<Vec<usize>>,
    lower_bound: usize,
    budget: usize,
    expansions: usize,
}

impl Search<'_> {
    /// Extend the current partial placement. Returns false once the search should stop.
    fn run(&mut self, depth: usize, high_water: usize) -> bool {
        if self.expansions >= self.budget {
            return false;
        }
        self.expansions += 1;

        let count = self.sizes.len();
        if depth == count {
            if high_water < self.best_size {
                log::trace!("optimal: improved plan to {} bytes", high_water);
                self.best_size = high_water;
                self.best_offsets = Some(self.offsets.clone());
            }
            return self.best_size > self.lower_bound;
        }

        let mut occupied = Vec::new();
        for slot in 0..count {
            if self.placed.contains(slot) {
                continue;
            }
            occupied.clear();
            occupied.extend(
                self.graph
                    .row(slot)
                    .intersection(&self.placed)
                    .map(|other| (self.offsets[other], self.offsets[other] + self.sizes[other])),
            );
            let offset = lowest_fit(&mut occupied, self.sizes[slot]);
            let next_high = high_water.max(offset + self.sizes[slot]);
            if next_high >= self.best_size {
                continue;
            }

            self.offsets[slot] = offset;
            self.placed.set(slot);
            let keep_going = self.run(depth + 1, next_high);
            self.placed.clear(slot);
            if !keep_going {
                return false;
            }
        }
        true
    }
}
