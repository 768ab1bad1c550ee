// This module is the hub for the shared pipeline infrastructure: the per-run compilation session
// (bump arena that owns the recorded trace plus statistics), address classification against the
// arena and constant regions, lifetime analysis that produces allocation units for the planner,
// and the error types. Everything here is independent of the reference engine, the planner
// strategy and the code generator, which all build on top of it.

//! Core pipeline infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based storage for the recorded trace using `bumpalo`
//! - Compilation statistics
//!
//! ## Address Classification (`address`)
//! - Arena / constant region bookkeeping per run
//! - Typed handles and target expressions
//!
//! ## Lifetime Analysis (`lifetime`)
//! - First-created / last-used steps for tensors and scratch buffers

pub mod address;
pub mod error;
pub mod lifetime;
pub mod session;

pub use address::{
    AddressContext, AddressRecord, ArenaHandle, ConstHandle, HostAddr, Region, ARENA_SYMBOL,
    CONST_SYMBOL,
};
pub use error::{CompileError, CompileResult};
pub use lifetime::{AllocationUnit, LifetimeAnalyzer, NodeIo, ScratchInfo, TensorInfo, UnitId};
pub use session::{CompilationSession, SessionStats};

/// Alignment of every tensor and scratch buffer in the arena.
pub const BUFFER_ALIGNMENT: usize = 16;

/// Round `value` up to a multiple of `align`, which must be a power of two.
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(5, 4), 8);
    }
}
