// This module implements the lifetime analysis that turns a fixed operator schedule into
// allocation units for the memory planner. Every tensor and every scratch buffer becomes one
// AllocationUnit carrying its alignment-padded size, the step at which it is first created, the
// step at which it is last used and whether it has to be placed in the arena at all. Tensor
// bounds come from a single backward walk over the nodes; scratch buffers live exactly for the
// step of the node that requested them. Units that are read but never written (weights, other
// constants) are served from the constant model data and never planned.

//! Buffer lifetime analysis.

use std::fmt;

use super::align_up;
use super::error::{CompileError, CompileResult};

/// Identity of an allocation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitId {
    /// Tensor by its index in the tensor table.
    Tensor(usize),
    /// Scratch buffer by its request index.
    Scratch(usize),
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitId::Tensor(idx) => write!(f, "tensor {idx}"),
            UnitId::Scratch(idx) => write!(f, "scratch buffer {idx}"),
        }
    }
}

/// One tensor buffer or scratch buffer tracked for lifetime and placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationUnit {
    pub id: UnitId,
    /// Size in bytes, already padded to the buffer alignment.
    pub bytes: usize,
    /// First step at which the buffer must be valid.
    pub first_created: Option<usize>,
    /// Last step at which the buffer must be valid.
    pub last_used: Option<usize>,
    /// Whether the planner has to place this unit in the arena.
    pub needs_allocation: bool,
}

impl AllocationUnit {
    /// Construct a unit with a fully resolved lifetime that needs allocation.
    pub fn planned(id: UnitId, bytes: usize, first_created: usize, last_used: usize) -> Self {
        Self {
            id,
            bytes,
            first_created: Some(first_created),
            last_used: Some(last_used),
            needs_allocation: true,
        }
    }

    /// Inclusive `[first_created, last_used]` interval when both bounds are known.
    pub fn interval(&self) -> Option<(usize, usize)> {
        Some((self.first_created?, self.last_used?))
    }

    /// Read but never produced inside the graph.
    pub fn is_read_only(&self) -> bool {
        self.first_created.is_none() && self.last_used.is_some()
    }

    /// Whether both units must be valid during at least one common step.
    pub fn lifetimes_overlap(&self, other: &AllocationUnit) -> bool {
        match (self.interval(), other.interval()) {
            (Some((a_first, a_last)), Some((b_first, b_last))) => {
                a_first <= b_last && b_first <= a_last
            }
            _ => false,
        }
    }
}

/// Tensor attributes the analysis needs, as seen before allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorInfo {
    pub bytes: usize,
    /// The tensor already had a data pointer (constant data) before allocation.
    pub data_preassigned: bool,
    pub is_variable: bool,
}

/// Input and output tensor indices of one node. Negative indices mark absent
/// optional operands.
#[derive(Debug, Clone, Copy)]
pub struct NodeIo<'a> {
    pub inputs: &'a [i32],
    pub outputs: &'a [i32],
}

/// A scratch buffer requested while preparing a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchInfo {
    pub bytes: usize,
    pub node_index: usize,
}

/// Computes allocation units for one graph.
///
/// Output order is stable: tensors by index, then scratch buffers by request
/// order. Callers index into the result with that layout.
pub struct LifetimeAnalyzer<'g> {
    tensors: &'g [TensorInfo],
    nodes: &'g [NodeIo<'g>],
    graph_inputs: &'g [i32],
    graph_outputs: &'g [i32],
    scratch: &'g [ScratchInfo],
    alignment: usize,
}

impl<'g> LifetimeAnalyzer<'g> {
    pub fn new(tensors: &'g [TensorInfo], nodes: &'g [NodeIo<'g>]) -> Self {
        Self {
            tensors,
            nodes,
            graph_inputs: &[],
            graph_outputs: &[],
            scratch: &[],
            alignment: super::BUFFER_ALIGNMENT,
        }
    }

    pub fn graph_inputs(mut self, inputs: &'g [i32]) -> Self {
        self.graph_inputs = inputs;
        self
    }

    pub fn graph_outputs(mut self, outputs: &'g [i32]) -> Self {
        self.graph_outputs = outputs;
        self
    }

    pub fn scratch_buffers(mut self, scratch: &'g [ScratchInfo]) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Run the analysis and consume the analyzer.
    pub fn analyze(self) -> CompileResult<Vec<AllocationUnit>> {
        let mut units: Vec<AllocationUnit> = self
            .tensors
            .iter()
            .enumerate()
            .map(|(idx, tensor)| AllocationUnit {
                id: UnitId::Tensor(idx),
                bytes: align_up(tensor.bytes, self.alignment),
                first_created: None,
                last_used: None,
                needs_allocation: !tensor.data_preassigned && !tensor.is_variable,
            })
            .collect();

        for &index in self.graph_inputs {
            if let Some(slot) = self.slot(index)? {
                units[slot].first_created = Some(0);
            }
        }

        // Graph outputs stay live until the end of the invocation.
        let last_step = self.nodes.len().checked_sub(1);
        for &index in self.graph_outputs {
            if let Some(slot) = self.slot(index)? {
                units[slot].last_used = last_step;
            }
        }

        for (step, node) in self.nodes.iter().enumerate().rev() {
            for &index in node.inputs {
                if let Some(slot) = self.slot(index)? {
                    let unit = &mut units[slot];
                    if unit.last_used.map_or(true, |last| last < step) {
                        unit.last_used = Some(step);
                    }
                }
            }
            for &index in node.outputs {
                if let Some(slot) = self.slot(index)? {
                    let unit = &mut units[slot];
                    if unit.first_created.map_or(true, |first| first > step) {
                        unit.first_created = Some(step);
                    }
                }
            }
        }

        for unit in units.iter_mut() {
            if unit.is_read_only() {
                unit.needs_allocation = false;
                continue;
            }
            if !unit.needs_allocation {
                continue;
            }
            match (unit.first_created, unit.last_used) {
                (Some(_), Some(_)) => {}
                (None, None) => {
                    log::warn!("{} is never used by any node; leaving it unallocated", unit.id);
                    unit.needs_allocation = false;
                }
                (first_created, last_used) => {
                    return Err(CompileError::InconsistentLifetime {
                        unit: unit.id,
                        first_created,
                        last_used,
                    });
                }
            }
        }

        units.extend(self.scratch.iter().enumerate().map(|(idx, buffer)| {
            AllocationUnit::planned(
                UnitId::Scratch(idx),
                align_up(buffer.bytes, self.alignment),
                buffer.node_index,
                buffer.node_index,
            )
        }));

        for unit in &units {
            log::debug!(
                "{}: {} bytes, first_created {:?}, last_used {:?}, needs_allocation {}",
                unit.id,
                unit.bytes,
                unit.first_created,
                unit.last_used,
                unit.needs_allocation
            );
        }

        Ok(units)
    }

    fn slot(&self, index: i32) -> CompileResult<Option<usize>> {
        if index < 0 {
            return Ok(None);
        }
        let slot = index as usize;
        if slot >= self.tensors.len() {
            return Err(CompileError::TensorIndex {
                index,
                count: self.tensors.len(),
            });
        }
        Ok(Some(slot))
    }
}
