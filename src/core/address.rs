//! Address classification and relocation.
//!
//! The reference engine hands out plain host addresses. Every address that
//! ends up in the generated program has to be rewritten relative to one of
//! two regions that also exist on the target: the tensor arena and the
//! constant model data. [`AddressContext`] holds the two regions for one
//! compilation run and turns raw addresses into typed [`AddressRecord`]s;
//! everything past the engine boundary works with those records.

use std::fmt;

use super::error::{CompileError, CompileResult};

/// A plain address as returned by the reference engine.
pub type HostAddr = usize;

/// Symbol the generated program declares for the tensor arena.
pub const ARENA_SYMBOL: &str = "tensor_arena";

/// Symbol the generated program declares for the constant model data.
pub const CONST_SYMBOL: &str = "g_model_data";

/// A contiguous host memory range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub base: HostAddr,
    pub len: usize,
}

impl Region {
    pub const fn new(base: HostAddr, len: usize) -> Self {
        Self { base, len }
    }

    /// Region covering the given byte slice.
    pub fn of_slice(bytes: &[u8]) -> Self {
        Self::new(bytes.as_ptr() as HostAddr, bytes.len())
    }

    /// Offset of `addr` inside the region, if it lies within it.
    pub fn offset_of(&self, addr: HostAddr) -> Option<usize> {
        if addr >= self.base && addr - self.base < self.len {
            Some(addr - self.base)
        } else {
            None
        }
    }
}

/// Offset into the tensor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArenaHandle(pub usize);

/// Offset into the constant model data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstHandle(pub usize);

/// Where an address points, relative to the regions that exist on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressRecord {
    Null,
    Arena(ArenaHandle),
    Const(ConstHandle),
}

impl AddressRecord {
    /// Target-language expression that evaluates to this address.
    pub fn to_expression(&self) -> String {
        match self {
            AddressRecord::Null => "nullptr".to_string(),
            AddressRecord::Arena(ArenaHandle(offset)) => format!("({ARENA_SYMBOL} + {offset})"),
            AddressRecord::Const(ConstHandle(offset)) => format!("({CONST_SYMBOL} + {offset})"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AddressRecord::Null)
    }
}

impl fmt::Display for AddressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_expression())
    }
}

/// Arena and constant regions of one compilation run.
///
/// Created once per run, after the real arena has been allocated, and passed
/// explicitly to every component that needs to relocate addresses.
#[derive(Debug, Clone, Copy)]
pub struct AddressContext {
    arena: Region,
    constant: Region,
}

impl AddressContext {
    pub fn new(arena: Region, constant: Region) -> Self {
        Self { arena, constant }
    }

    pub fn arena(&self) -> Region {
        self.arena
    }

    pub fn constant(&self) -> Region {
        self.constant
    }

    /// Classify a raw engine address.
    ///
    /// Fails with [`CompileError::OutOfRegion`] when the address lies in
    /// neither region. That only happens if the engine was handed memory the
    /// pipeline does not track.
    pub fn classify(&self, addr: HostAddr) -> CompileResult<AddressRecord> {
        if addr == 0 {
            return Ok(AddressRecord::Null);
        }
        if let Some(offset) = self.arena.offset_of(addr) {
            return Ok(AddressRecord::Arena(ArenaHandle(offset)));
        }
        if let Some(offset) = self.constant.offset_of(addr) {
            return Ok(AddressRecord::Const(ConstHandle(offset)));
        }
        Err(CompileError::OutOfRegion { addr })
    }

    /// Host address a record refers to in this run.
    pub fn resolve(&self, record: AddressRecord) -> HostAddr {
        match record {
            AddressRecord::Null => 0,
            AddressRecord::Arena(ArenaHandle(offset)) => self.arena.base + offset,
            AddressRecord::Const(ConstHandle(offset)) => self.constant.base + offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> AddressContext {
        AddressContext::new(Region::new(0x1000, 0x100), Region::new(0x8000, 0x40))
    }

    #[test]
    fn test_null_is_null() {
        assert_eq!(context().classify(0).unwrap(), AddressRecord::Null);
        assert_eq!(AddressRecord::Null.to_expression(), "nullptr");
    }

    #[test]
    fn test_region_bounds() {
        let ctx = context();
        assert_eq!(
            ctx.classify(0x1000).unwrap(),
            AddressRecord::Arena(ArenaHandle(0))
        );
        assert_eq!(
            ctx.classify(0x10ff).unwrap(),
            AddressRecord::Arena(ArenaHandle(0xff))
        );
        assert_eq!(
            ctx.classify(0x803f).unwrap(),
            AddressRecord::Const(ConstHandle(0x3f))
        );
        assert!(matches!(
            ctx.classify(0x1100),
            Err(CompileError::OutOfRegion { addr: 0x1100 })
        ));
        assert!(matches!(
            ctx.classify(0x8040),
            Err(CompileError::OutOfRegion { .. })
        ));
        assert!(ctx.classify(0xfff).is_err());
    }

    #[test]
    fn test_round_trip() {
        let ctx = context();
        for addr in [0x1000, 0x1010, 0x10ff, 0x8000, 0x8021] {
            let record = ctx.classify(addr).unwrap();
            assert_eq!(ctx.resolve(record), addr);
        }
    }

    #[test]
    fn test_expressions() {
        assert_eq!(
            AddressRecord::Arena(ArenaHandle(48)).to_expression(),
            "(tensor_arena + 48)"
        );
        assert_eq!(
            AddressRecord::Const(ConstHandle(12)).to_string(),
            "(g_model_data + 12)"
        );
    }

    #[test]
    fn test_real_buffers() {
        let arena = vec![0u8; 64];
        let model = vec![0u8; 32];
        let ctx = AddressContext::new(Region::of_slice(&arena), Region::of_slice(&model));

        let p = arena[10..].as_ptr() as HostAddr;
        assert_eq!(ctx.classify(p).unwrap(), AddressRecord::Arena(ArenaHandle(10)));
        let q = model[31..].as_ptr() as HostAddr;
        assert_eq!(ctx.classify(q).unwrap(), AddressRecord::Const(ConstHandle(31)));
    }
}
