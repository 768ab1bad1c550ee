// This module provides the per-compilation session. CompilationSession borrows a bumpalo arena
// that owns everything copied out of the reference engine during the recording pass (tensor
// index lists, parameter blobs, quantization tables, kernel names), so the recorded trace can
// outlive the engine and its host arena without per-node heap allocations. The session also
// collects SessionStats: tensor/node/registration counts, persistent and scratch buffer counts,
// planned unit count and the resulting arena sizes. Nothing in a session is shared between
// runs; a new model compilation gets a new session.

//! Arena-based compilation session.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// State owned by one compilation run.
pub struct CompilationSession<'arena> {
    /// Arena allocator for recorded data.
    arena: &'arena Bump,

    stats: RefCell<SessionStats>,

    interned_strings: RefCell<HashMap<String, &'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashMap::new()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Copy a slice into the session arena.
    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_copy(slice)
    }

    /// Move a vector's contents into the session arena.
    pub fn alloc_vec<T>(&self, items: Vec<T>) -> &'arena [T] {
        self.arena.alloc_slice_fill_iter(items)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned = self.arena.alloc_str(s);
        strings.insert(s.to_string(), interned);
        interned
    }

    pub fn record_trace(&self, tensors: usize, nodes: usize, persistent: usize, scratch: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.tensors = tensors;
        stats.nodes = nodes;
        stats.persistent_buffers = persistent;
        stats.scratch_buffers = scratch;
    }

    pub fn record_plan(&self, planner: &'static str, planned_units: usize, planned_bytes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.planner = planner;
        stats.planned_units = planned_units;
        stats.planned_bytes = planned_bytes;
    }

    pub fn record_program(&self, registrations: usize, arena_bytes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.registrations = registrations;
        stats.arena_bytes = arena_bytes;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub tensors: usize,
    pub nodes: usize,
    /// Distinct (operator, version) registrations.
    pub registrations: usize,
    pub persistent_buffers: usize,
    pub scratch_buffers: usize,
    /// Name of the planner strategy that produced the plan.
    pub planner: &'static str,
    pub planned_units: usize,
    /// High-water mark of the planned units.
    pub planned_bytes: usize,
    /// Declared size of the generated arena, retained region included.
    pub arena_bytes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Tensors: {}", self.tensors)?;
        writeln!(f, "  Nodes: {}", self.nodes)?;
        writeln!(f, "  Registrations: {}", self.registrations)?;
        writeln!(f, "  Persistent buffers: {}", self.persistent_buffers)?;
        writeln!(f, "  Scratch buffers: {}", self.scratch_buffers)?;
        if !self.planner.is_empty() {
            writeln!(
                f,
                "  Planner ({}): {} units in {} bytes",
                self.planner, self.planned_units, self.planned_bytes
            )?;
        }
        writeln!(f, "  Arena size: {} bytes", self.arena_bytes)?;
        Ok(())
    }
}
