//! Target arena layout.
//!
//! The generated arena is `[planned units | retained region]`. Planned units
//! sit at the offsets the memory planner chose. Everything else the reference
//! run placed in its arena (persistent buffers, variable tensors, node user
//! data) is one contiguous retained span, moved as a block to the first
//! offset after the planned units that keeps the host allocator's alignment.

use crate::core::{
    align_up, AddressRecord, AllocationUnit, ArenaHandle, CompileError, CompileResult, UnitId,
    BUFFER_ALIGNMENT,
};
use crate::planner::MemoryPlan;
use crate::recorder::ExecutionTrace;

/// Host span kept as a block, and where it lands in the target arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetainedSpan {
    pub host_start: usize,
    pub host_end: usize,
    pub target_start: usize,
}

impl RetainedSpan {
    pub fn len(&self) -> usize {
        self.host_end - self.host_start
    }

    pub fn is_empty(&self) -> bool {
        self.host_end == self.host_start
    }
}

/// Maps recorded arena addresses to target arena offsets.
#[derive(Debug)]
pub struct ArenaLayout<'p> {
    plan: &'p MemoryPlan,
    units: &'p [AllocationUnit],
    retained: Option<RetainedSpan>,
    arena_size: usize,
}

impl<'p> ArenaLayout<'p> {
    pub fn new(
        plan: &'p MemoryPlan,
        units: &'p [AllocationUnit],
        trace: &ExecutionTrace<'_>,
        alignment: usize,
    ) -> Self {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for buffer in trace.persistent {
            if let AddressRecord::Arena(ArenaHandle(offset)) = buffer.address {
                ranges.push((offset, offset + buffer.bytes));
            }
        }
        for (idx, tensor) in trace.tensors.iter().enumerate() {
            if plan.offset(idx).is_some() {
                continue;
            }
            if let AddressRecord::Arena(ArenaHandle(offset)) = tensor.data {
                ranges.push((offset, offset + tensor.bytes));
            }
        }
        for node in trace.nodes {
            if let AddressRecord::Arena(ArenaHandle(offset)) = node.user_data {
                ranges.push((offset, offset));
            }
        }

        // Buffers in the span were aligned by the host allocator, so the
        // block must move by a multiple of that alignment.
        let block = BUFFER_ALIGNMENT.max(alignment);
        let host_start = ranges.iter().map(|&(start, _)| start).min();
        let host_end = ranges.iter().map(|&(_, end)| end).max();
        let retained = host_start.zip(host_end).map(|(start, end)| RetainedSpan {
            host_start: start & !(block - 1),
            host_end: end,
            target_start: align_up(plan.arena_size(), block),
        });
        let arena_size = match retained {
            Some(span) => span.target_start + span.len(),
            None => plan.arena_size(),
        };

        if let Some(span) = retained {
            log::debug!(
                "retained host span {}..{} moves to {}",
                span.host_start,
                span.host_end,
                span.target_start
            );
        }

        Self {
            plan,
            units,
            retained,
            arena_size,
        }
    }

    /// Declared size of the target arena.
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }

    pub fn retained(&self) -> Option<RetainedSpan> {
        self.retained
    }

    /// Rewrite a recorded address that does not belong to a planned unit.
    pub fn relocate(&self, record: AddressRecord) -> CompileResult<AddressRecord> {
        let AddressRecord::Arena(ArenaHandle(offset)) = record else {
            return Ok(record);
        };
        match self.retained {
            Some(span) if span.host_start <= offset && offset <= span.host_end => {
                let moved = offset - span.host_start + span.target_start;
                Ok(AddressRecord::Arena(ArenaHandle(moved)))
            }
            _ => Err(CompileError::UnrelocatableAddress { offset }),
        }
    }

    /// Target address of tensor `index`'s data.
    pub fn tensor_data(
        &self,
        index: usize,
        recorded: AddressRecord,
    ) -> CompileResult<AddressRecord> {
        match self.plan.offset(index) {
            Some(handle) => Ok(AddressRecord::Arena(handle)),
            None => self.relocate(recorded),
        }
    }

    /// Target address of scratch buffer `index`.
    pub fn scratch_data(&self, index: usize) -> CompileResult<AddressRecord> {
        let unit = self
            .units
            .iter()
            .position(|unit| unit.id == UnitId::Scratch(index))
            .ok_or(CompileError::UnplacedUnit {
                unit: UnitId::Scratch(index),
            })?;
        self.plan
            .offset(unit)
            .map(AddressRecord::Arena)
            .ok_or(CompileError::UnplacedUnit {
                unit: UnitId::Scratch(index),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConstHandle, ScratchInfo};
    use crate::engine::{AllocationKind, KernelPhase};
    use crate::model::TensorType;
    use crate::recorder::{RecordedBuffer, RecordedTensor};

    fn tensor(data: AddressRecord, bytes: usize, is_variable: bool) -> RecordedTensor<'static> {
        RecordedTensor {
            tensor_type: TensorType::Float32,
            bytes,
            is_variable,
            data_preassigned: false,
            allocation: AllocationKind::Arena,
            data,
            dims: AddressRecord::Const(ConstHandle(64)),
            quantization: None,
        }
    }

    fn trace<'a>(
        tensors: &'a [RecordedTensor<'a>],
        persistent: &'a [RecordedBuffer],
        scratch: &'a [ScratchInfo],
    ) -> ExecutionTrace<'a> {
        ExecutionTrace {
            tensors,
            nodes: &[],
            persistent,
            scratch,
            graph_inputs: &[],
            graph_outputs: &[],
        }
    }

    #[test]
    fn test_retained_span_follows_plan() {
        let tensors = [
            tensor(AddressRecord::Arena(ArenaHandle(0)), 48, false),
            tensor(AddressRecord::Arena(ArenaHandle(960)), 32, true),
        ];
        let persistent = [RecordedBuffer {
            node_index: 0,
            phase: KernelPhase::Init,
            bytes: 32,
            address: AddressRecord::Arena(ArenaHandle(992)),
        }];
        let trace = trace(&tensors, &persistent, &[]);

        let mut variable = AllocationUnit::planned(UnitId::Tensor(1), 32, 0, 0);
        variable.needs_allocation = false;
        let units = [AllocationUnit::planned(UnitId::Tensor(0), 48, 0, 0), variable];
        let plan = MemoryPlan::from_offsets(&units, vec![Some(0), None]);

        let layout = ArenaLayout::new(&plan, &units, &trace, 16);
        assert_eq!(
            layout.retained(),
            Some(RetainedSpan {
                host_start: 960,
                host_end: 1024,
                target_start: 48,
            })
        );
        assert_eq!(layout.arena_size(), 48 + 64);

        // The variable moves with the retained block; planned tensors use the plan.
        assert_eq!(
            layout.tensor_data(1, tensors[1].data).unwrap(),
            AddressRecord::Arena(ArenaHandle(48))
        );
        assert_eq!(
            layout.relocate(persistent[0].address).unwrap(),
            AddressRecord::Arena(ArenaHandle(80))
        );
        assert_eq!(
            layout.tensor_data(0, AddressRecord::Arena(ArenaHandle(512))).unwrap(),
            AddressRecord::Arena(ArenaHandle(0))
        );
    }

    #[test]
    fn test_retained_span_keeps_host_alignment() {
        let tensors = [
            tensor(AddressRecord::Arena(ArenaHandle(0)), 40, false),
            tensor(AddressRecord::Arena(ArenaHandle(976)), 16, true),
        ];
        let persistent = [RecordedBuffer {
            node_index: 0,
            phase: KernelPhase::Prepare,
            bytes: 32,
            address: AddressRecord::Arena(ArenaHandle(992)),
        }];
        let trace = trace(&tensors, &persistent, &[]);

        let mut variable = AllocationUnit::planned(UnitId::Tensor(1), 16, 0, 0);
        variable.needs_allocation = false;
        let units = [AllocationUnit::planned(UnitId::Tensor(0), 40, 0, 0), variable];
        let plan = MemoryPlan::from_offsets(&units, vec![Some(0), None]);
        assert_eq!(plan.arena_size(), 40);

        // An 8-byte planning alignment must not shift the block off 16.
        let layout = ArenaLayout::new(&plan, &units, &trace, 8);
        let span = layout.retained().unwrap();
        assert_eq!(span.target_start, 48);
        assert_eq!(span.host_start, 976);
        for record in [tensors[1].data, persistent[0].address] {
            let AddressRecord::Arena(ArenaHandle(moved)) = layout.relocate(record).unwrap() else {
                panic!("retained address left the arena");
            };
            assert_eq!(moved % BUFFER_ALIGNMENT, 0);
        }
        assert_eq!(layout.arena_size(), 48 + 48);
    }

    #[test]
    fn test_relocation_keeps_null_and_const() {
        let units: [AllocationUnit; 0] = [];
        let plan = MemoryPlan::from_offsets(&units, vec![]);
        let trace = trace(&[], &[], &[]);
        let layout = ArenaLayout::new(&plan, &units, &trace, 16);

        assert_eq!(layout.retained(), None);
        assert_eq!(layout.arena_size(), 0);
        assert_eq!(layout.relocate(AddressRecord::Null).unwrap(), AddressRecord::Null);
        let constant = AddressRecord::Const(ConstHandle(12));
        assert_eq!(layout.relocate(constant).unwrap(), constant);
        assert!(matches!(
            layout.relocate(AddressRecord::Arena(ArenaHandle(4))),
            Err(CompileError::UnrelocatableAddress { offset: 4 })
        ));
    }

    #[test]
    fn test_scratch_data() {
        let scratch = [ScratchInfo {
            bytes: 64,
            node_index: 0,
        }];
        let trace = trace(&[], &[], &scratch);
        let units = [AllocationUnit::planned(UnitId::Scratch(0), 64, 0, 0)];
        let plan = MemoryPlan::from_offsets(&units, vec![Some(16)]);
        let layout = ArenaLayout::new(&plan, &units, &trace, 16);
        assert_eq!(layout.scratch_data(0).unwrap(), AddressRecord::Arena(ArenaHandle(16)));
        assert!(layout.scratch_data(1).is_err());
    }
}
