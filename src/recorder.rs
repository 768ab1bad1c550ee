// This module drives the one recorded reference run. ExecutionRecorder snapshots the entry state
// of every tensor (whether its data is already provided), then calls allocate_tensors on the
// engine with itself installed as the allocation hook, so every persistent buffer address is
// logged in request order. Afterwards it reads back the resolved tensor table, the nodes with
// their registrations, and the scratch buffer requests. Every host address is classified
// against the run's AddressContext right away and every slice is copied into the session's
// bump arena, so the resulting ExecutionTrace holds no reference to the engine or its arena.

//! Reference run recording.

use crate::core::{
    AddressContext, AddressRecord, AllocationUnit, CompilationSession, CompileResult,
    LifetimeAnalyzer, NodeIo, ScratchInfo, TensorInfo,
};
use crate::engine::{
    AllocationHook, AllocationKind, KernelPhase, PersistentAllocation, ReferenceEngine,
};
use crate::model::{BuiltinOperator, TensorType};

/// Quantization parameters copied out of the engine.
#[derive(Debug, Clone, Copy)]
pub struct RecordedQuantization<'arena> {
    pub scales: &'arena [f32],
    pub zero_points: &'arena [i32],
    pub quantized_dimension: i32,
}

impl RecordedQuantization<'_> {
    pub fn channels(&self) -> usize {
        self.scales.len().min(self.zero_points.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecordedTensor<'arena> {
    pub tensor_type: TensorType,
    pub bytes: usize,
    pub is_variable: bool,
    /// Data was already set before allocation (constant tensors).
    pub data_preassigned: bool,
    pub allocation: AllocationKind,
    pub data: AddressRecord,
    pub dims: AddressRecord,
    pub quantization: Option<RecordedQuantization<'arena>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordedNode<'arena> {
    pub opcode: BuiltinOperator,
    pub version: u32,
    pub kernel_name: &'arena str,
    pub has_prepare: bool,
    pub inputs: &'arena [i32],
    pub outputs: &'arena [i32],
    pub inputs_addr: AddressRecord,
    pub outputs_addr: AddressRecord,
    pub builtin_data: &'arena [u8],
    pub custom_data: AddressRecord,
    pub custom_data_len: usize,
    pub user_data: AddressRecord,
}

/// A persistent buffer, in request order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedBuffer {
    pub node_index: usize,
    pub phase: KernelPhase,
    pub bytes: usize,
    pub address: AddressRecord,
}

/// Everything observed during the recorded run.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionTrace<'arena> {
    pub tensors: &'arena [RecordedTensor<'arena>],
    pub nodes: &'arena [RecordedNode<'arena>],
    pub persistent: &'arena [RecordedBuffer],
    pub scratch: &'arena [ScratchInfo],
    pub graph_inputs: &'arena [i32],
    pub graph_outputs: &'arena [i32],
}

impl ExecutionTrace<'_> {
    /// Persistent buffers requested during init, which come first.
    pub fn init_buffer_count(&self) -> usize {
        self.persistent
            .iter()
            .take_while(|buffer| buffer.phase == KernelPhase::Init)
            .count()
    }

    /// Position of the persistent buffer at `address`, if any.
    pub fn persistent_index(&self, address: AddressRecord) -> Option<usize> {
        if address.is_null() {
            return None;
        }
        self.persistent.iter().position(|buffer| buffer.address == address)
    }

    /// Allocation units of the recorded graph, tensors first, then scratch
    /// buffers.
    pub fn analyze_lifetimes(&self, alignment: usize) -> CompileResult<Vec<AllocationUnit>> {
        let infos: Vec<TensorInfo> = self
            .tensors
            .iter()
            .map(|tensor| TensorInfo {
                bytes: tensor.bytes,
                data_preassigned: tensor.data_preassigned,
                is_variable: tensor.is_variable,
            })
            .collect();
        let node_io: Vec<NodeIo<'_>> = self
            .nodes
            .iter()
            .map(|node| NodeIo {
                inputs: node.inputs,
                outputs: node.outputs,
            })
            .collect();

        LifetimeAnalyzer::new(&infos, &node_io)
            .graph_inputs(self.graph_inputs)
            .graph_outputs(self.graph_outputs)
            .scratch_buffers(self.scratch)
            .alignment(alignment)
            .analyze()
    }
}

/// Records one reference run into a compilation session.
pub struct ExecutionRecorder<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    persistent: Vec<PersistentAllocation>,
}

impl AllocationHook for ExecutionRecorder<'_, '_> {
    fn on_persistent_buffer(&mut self, allocation: PersistentAllocation) {
        log::debug!(
            "node {} {:?}: persistent buffer of {} bytes at {:#x}",
            allocation.node_index,
            allocation.phase,
            allocation.bytes,
            allocation.address
        );
        self.persistent.push(allocation);
    }
}

impl<'s, 'arena> ExecutionRecorder<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>) -> Self {
        Self {
            session,
            persistent: Vec::new(),
        }
    }

    /// Run `allocate_tensors` once and capture the result.
    pub fn record(
        mut self,
        engine: &mut dyn ReferenceEngine,
        ctx: &AddressContext,
    ) -> CompileResult<ExecutionTrace<'arena>> {
        let entry_state: Vec<bool> = (0..engine.tensor_count())
            .map(|idx| engine.tensor(idx).data != 0)
            .collect();

        engine.allocate_tensors(&mut self)?;
        log::info!(
            "recorded reference run: {} tensors, {} nodes, {} arena bytes used",
            engine.tensor_count(),
            engine.node_count(),
            engine.arena_used_bytes()
        );

        let session = self.session;
        let mut tensors = Vec::with_capacity(engine.tensor_count());
        for (idx, &data_preassigned) in entry_state.iter().enumerate() {
            let view = engine.tensor(idx);
            let quantization = view.quantization.map(|quant| RecordedQuantization {
                scales: session.alloc_slice(&quant.scales),
                zero_points: session.alloc_slice(&quant.zero_points),
                quantized_dimension: quant.quantized_dimension,
            });
            tensors.push(RecordedTensor {
                tensor_type: view.tensor_type,
                bytes: view.bytes,
                is_variable: view.is_variable,
                data_preassigned,
                allocation: view.allocation,
                data: ctx.classify(view.data)?,
                dims: ctx.classify(view.dims)?,
                quantization,
            });
        }

        let mut nodes = Vec::with_capacity(engine.node_count());
        for idx in 0..engine.node_count() {
            let view = engine.node(idx);
            nodes.push(RecordedNode {
                opcode: view.opcode,
                version: view.version,
                kernel_name: session.intern_str(view.kernel_name),
                has_prepare: view.has_prepare,
                inputs: session.alloc_slice(view.inputs),
                outputs: session.alloc_slice(view.outputs),
                inputs_addr: ctx.classify(view.inputs_addr)?,
                outputs_addr: ctx.classify(view.outputs_addr)?,
                builtin_data: session.alloc_slice(view.builtin_data),
                custom_data: ctx.classify(view.custom_data)?,
                custom_data_len: view.custom_data_len,
                user_data: ctx.classify(view.user_data)?,
            });
        }

        let persistent = self
            .persistent
            .iter()
            .map(|allocation| {
                Ok(RecordedBuffer {
                    node_index: allocation.node_index,
                    phase: allocation.phase,
                    bytes: allocation.bytes,
                    address: ctx.classify(allocation.address)?,
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;

        let scratch: Vec<ScratchInfo> = engine
            .scratch_buffers()
            .iter()
            .map(|request| ScratchInfo {
                bytes: request.bytes,
                node_index: request.node_index,
            })
            .collect();

        session.record_trace(tensors.len(), nodes.len(), persistent.len(), scratch.len());

        Ok(ExecutionTrace {
            tensors: session.alloc_vec(tensors),
            nodes: session.alloc_vec(nodes),
            persistent: session.alloc_vec(persistent),
            scratch: session.alloc_vec(scratch),
            graph_inputs: session.alloc_slice(engine.graph_inputs()),
            graph_outputs: session.alloc_slice(engine.graph_outputs()),
        })
    }
}
