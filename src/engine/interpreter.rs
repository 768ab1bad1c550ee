// This module implements the host-side reference engine. HostInterpreter works inside a
// caller-provided arena and follows the allocation order of the target runtime: builtin
// parameter structs and variable tensors are taken from the arena tail, every kernel runs init
// and then prepare (both may take persistent buffers from the tail; prepare may also request
// scratch buffers), and finally all remaining tensors and the scratch buffers are planned into
// the arena head. Constant tensors point straight into the model data from the start. The
// engine owns no memory of its own, so the caller decides which buffer backs each pass.

//! Host reference engine.

use super::{
    AllocationHook, AllocationKind, EngineError, Kernel, KernelContext, KernelNode, KernelPhase,
    NodeView, OpResolver, PersistentAllocation, ReferenceEngine, ScratchRequest, TensorView,
};
use crate::core::{
    align_up, HostAddr, LifetimeAnalyzer, NodeIo, Region, ScratchInfo, TensorInfo,
    BUFFER_ALIGNMENT,
};
use crate::model::{Model, Subgraph};
use crate::planner::{GreedyPlanner, MemoryPlanner};

/// Alignment of builtin parameter structs.
const BUILTIN_DATA_ALIGNMENT: usize = 8;

/// A heap buffer whose usable part starts on a [`BUFFER_ALIGNMENT`] boundary.
#[derive(Debug)]
pub struct HostArena {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl HostArena {
    /// Allocate an arena of at least `len` bytes, rounded up to the alignment.
    pub fn new(len: usize) -> Self {
        let len = align_up(len, BUFFER_ALIGNMENT);
        let storage = vec![0u8; len + BUFFER_ALIGNMENT];
        let addr = storage.as_ptr() as usize;
        let start = align_up(addr, BUFFER_ALIGNMENT) - addr;
        Self { storage, start, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Host range of the usable part.
    pub fn region(&self) -> Region {
        Region::of_slice(&self.storage[self.start..self.start + self.len])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }
}

/// Two-ended bump allocator over arena offsets.
#[derive(Debug, Clone, Copy)]
struct ArenaAllocator {
    capacity: usize,
    head: usize,
    tail: usize,
}

impl ArenaAllocator {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            head: 0,
            tail: capacity,
        }
    }

    fn exhausted(&self, requested: usize) -> EngineError {
        EngineError::ArenaExhausted {
            requested,
            available: self.tail - self.head,
            capacity: self.capacity,
        }
    }

    fn allocate_from_tail(&mut self, bytes: usize, alignment: usize) -> Result<usize, EngineError> {
        let start = self
            .tail
            .checked_sub(bytes)
            .map(|start| start & !(alignment - 1))
            .filter(|&start| start >= self.head)
            .ok_or_else(|| self.exhausted(bytes))?;
        self.tail = start;
        Ok(start)
    }

    fn reserve_head(&mut self, bytes: usize) -> Result<(), EngineError> {
        if bytes > self.tail {
            return Err(self.exhausted(bytes));
        }
        self.head = bytes;
        Ok(())
    }

    fn used_bytes(&self) -> usize {
        self.head + (self.capacity - self.tail)
    }
}

#[derive(Debug, Clone, Copy)]
struct TensorState {
    data: HostAddr,
    allocation: AllocationKind,
}

#[derive(Clone, Copy)]
struct NodeState<'m> {
    kernel: &'m dyn Kernel,
    /// Arena range of the builtin parameter struct.
    builtin: Option<(usize, usize)>,
    user_data: HostAddr,
}

/// Reference engine running on the host.
pub struct HostInterpreter<'m, 'a> {
    model: &'m Model,
    arena: &'a mut [u8],
    allocator: ArenaAllocator,
    tensors: Vec<TensorState>,
    nodes: Vec<NodeState<'m>>,
    scratch: Vec<ScratchRequest>,
}

impl<'m, 'a> HostInterpreter<'m, 'a> {
    /// Set up an engine for `model` inside `arena`.
    ///
    /// Fails if the resolver has no kernel for one of the model's operators.
    pub fn new(
        model: &'m Model,
        resolver: &'m dyn OpResolver,
        arena: &'a mut [u8],
    ) -> Result<Self, EngineError> {
        let addr = arena.as_ptr() as usize;
        let skip = (align_up(addr, BUFFER_ALIGNMENT) - addr).min(arena.len());
        let arena = &mut arena[skip..];
        let capacity = arena.len() & !(BUFFER_ALIGNMENT - 1);
        let arena = &mut arena[..capacity];

        let subgraph = model.subgraph();
        let model_base = model.bytes().as_ptr() as HostAddr;
        let tensors = subgraph
            .tensors
            .iter()
            .map(|def| match def.data {
                Some(range) => TensorState {
                    data: model_base + range.offset,
                    allocation: AllocationKind::ReadOnly,
                },
                None => TensorState {
                    data: 0,
                    allocation: AllocationKind::Arena,
                },
            })
            .collect();

        let nodes = subgraph
            .operators
            .iter()
            .map(|op| {
                let kernel = resolver.find(op.opcode, op.version).ok_or(
                    EngineError::UnsupportedOperator {
                        op: op.opcode,
                        version: op.version,
                    },
                )?;
                Ok(NodeState {
                    kernel,
                    builtin: None,
                    user_data: 0,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;

        Ok(Self {
            model,
            arena,
            allocator: ArenaAllocator::new(capacity),
            tensors,
            nodes,
            scratch: Vec::new(),
        })
    }

    fn arena_base(&self) -> HostAddr {
        self.arena.as_ptr() as HostAddr
    }

    fn subgraph(&self) -> &'m Subgraph {
        self.model.subgraph()
    }

    fn reset(&mut self) {
        self.allocator = ArenaAllocator::new(self.allocator.capacity);
        self.scratch.clear();
        for (state, def) in self.tensors.iter_mut().zip(&self.model.subgraph().tensors) {
            if def.data.is_none() {
                state.data = 0;
                state.allocation = AllocationKind::Arena;
            }
        }
        for node in &mut self.nodes {
            node.builtin = None;
            node.user_data = 0;
        }
    }

    fn copy_builtin_data(&mut self) -> Result<(), EngineError> {
        let subgraph = self.subgraph();
        for (idx, op) in subgraph.operators.iter().enumerate() {
            let size = self.nodes[idx].kernel.builtin_data_size();
            if size == 0 {
                continue;
            }
            let start = self.allocator.allocate_from_tail(size, BUILTIN_DATA_ALIGNMENT)?;
            let dest = &mut self.arena[start..start + size];
            dest.fill(0);
            if let Some(params) = op.params {
                let src = self.model.blob(params);
                let len = src.len().min(size);
                dest[..len].copy_from_slice(&src[..len]);
            }
            self.nodes[idx].builtin = Some((start, size));
        }
        Ok(())
    }

    fn allocate_variables(&mut self) -> Result<(), EngineError> {
        let base = self.arena_base();
        let subgraph = self.subgraph();
        for (idx, def) in subgraph.tensors.iter().enumerate() {
            if !def.is_variable {
                continue;
            }
            let bytes = def.byte_size();
            let start = self.allocator.allocate_from_tail(bytes, BUFFER_ALIGNMENT)?;
            self.arena[start..start + bytes].fill(0);
            self.tensors[idx] = TensorState {
                data: base + start,
                allocation: AllocationKind::Persistent,
            };
        }
        Ok(())
    }

    fn run_kernels(
        &mut self,
        phase: KernelPhase,
        hook: &mut dyn AllocationHook,
    ) -> Result<(), EngineError> {
        let base = self.arena_base();
        let subgraph = self.subgraph();
        for (idx, op) in subgraph.operators.iter().enumerate() {
            let kernel = self.nodes[idx].kernel;
            let node = KernelNode {
                index: idx,
                opcode: op.opcode,
                inputs: &op.inputs.values,
                outputs: &op.outputs.values,
            };
            let mut services = KernelServices {
                allocator: &mut self.allocator,
                scratch: &mut self.scratch,
                hook: &mut *hook,
                subgraph,
                base,
                node_index: idx,
                phase,
            };
            match phase {
                KernelPhase::Init => {
                    self.nodes[idx].user_data = kernel.init(&mut services, &node)?;
                }
                KernelPhase::Prepare if kernel.has_prepare() => {
                    kernel.prepare(&mut services, &node)?;
                }
                KernelPhase::Prepare => {}
            }
        }
        Ok(())
    }

    /// Plan the remaining tensors and the scratch buffers into the arena head.
    fn plan_head(&mut self) -> Result<(), EngineError> {
        let subgraph = self.subgraph();
        let infos: Vec<TensorInfo> = subgraph
            .tensors
            .iter()
            .map(|def| TensorInfo {
                bytes: def.byte_size(),
                data_preassigned: def.data.is_some(),
                is_variable: def.is_variable,
            })
            .collect();
        let node_io: Vec<NodeIo<'_>> = subgraph
            .operators
            .iter()
            .map(|op| NodeIo {
                inputs: &op.inputs.values,
                outputs: &op.outputs.values,
            })
            .collect();
        let scratch: Vec<ScratchInfo> = self
            .scratch
            .iter()
            .map(|request| ScratchInfo {
                bytes: request.bytes,
                node_index: request.node_index,
            })
            .collect();

        let units = LifetimeAnalyzer::new(&infos, &node_io)
            .graph_inputs(&subgraph.inputs.values)
            .graph_outputs(&subgraph.outputs.values)
            .scratch_buffers(&scratch)
            .analyze()?;
        let plan = GreedyPlanner.plan(&units);
        self.allocator.reserve_head(plan.arena_size())?;

        let base = self.arena_base();
        let tensor_count = self.tensors.len();
        for (idx, state) in self.tensors.iter_mut().enumerate() {
            if let Some(offset) = plan.offset(idx) {
                state.data = base + offset.0;
            }
        }
        for (idx, request) in self.scratch.iter_mut().enumerate() {
            if let Some(offset) = plan.offset(tensor_count + idx) {
                request.data = base + offset.0;
            }
        }
        log::debug!(
            "host engine: head {} bytes, tail {} bytes",
            plan.arena_size(),
            self.allocator.capacity - self.allocator.tail
        );
        Ok(())
    }
}

impl ReferenceEngine for HostInterpreter<'_, '_> {
    fn allocate_tensors(&mut self, hook: &mut dyn AllocationHook) -> Result<(), EngineError> {
        self.reset();
        self.copy_builtin_data()?;
        self.allocate_variables()?;
        self.run_kernels(KernelPhase::Init, hook)?;
        self.run_kernels(KernelPhase::Prepare, hook)?;
        self.plan_head()
    }

    fn arena_used_bytes(&self) -> usize {
        self.allocator.used_bytes()
    }

    fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    fn tensor(&self, index: usize) -> TensorView<'_> {
        let def = &self.subgraph().tensors[index];
        let state = self.tensors[index];
        TensorView {
            tensor_type: def.tensor_type,
            bytes: def.byte_size(),
            data: state.data,
            is_variable: def.is_variable,
            allocation: state.allocation,
            dims: self.model.bytes().as_ptr() as HostAddr + def.shape.offset,
            quantization: def.quantization.as_ref(),
        }
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, index: usize) -> NodeView<'_> {
        let op = &self.subgraph().operators[index];
        let state = &self.nodes[index];
        let model_base = self.model.bytes().as_ptr() as HostAddr;
        let builtin_data: &[u8] = match state.builtin {
            Some((start, size)) => &self.arena[start..start + size],
            None => &[],
        };
        NodeView {
            opcode: op.opcode,
            version: op.version,
            kernel_name: state.kernel.name(),
            has_prepare: state.kernel.has_prepare(),
            inputs: &op.inputs.values,
            outputs: &op.outputs.values,
            inputs_addr: model_base + op.inputs.offset,
            outputs_addr: model_base + op.outputs.offset,
            builtin_data,
            custom_data: op.custom.map_or(0, |range| model_base + range.offset),
            custom_data_len: op.custom.map_or(0, |range| range.len),
            user_data: state.user_data,
        }
    }

    fn scratch_buffers(&self) -> &[ScratchRequest] {
        &self.scratch
    }

    fn graph_inputs(&self) -> &[i32] {
        &self.subgraph().inputs.values
    }

    fn graph_outputs(&self) -> &[i32] {
        &self.subgraph().outputs.values
    }
}

/// Engine services for one kernel call.
struct KernelServices<'x> {
    allocator: &'x mut ArenaAllocator,
    scratch: &'x mut Vec<ScratchRequest>,
    hook: &'x mut dyn AllocationHook,
    subgraph: &'x Subgraph,
    base: HostAddr,
    node_index: usize,
    phase: KernelPhase,
}

impl KernelContext for KernelServices<'_> {
    fn allocate_persistent_buffer(&mut self, bytes: usize) -> Result<HostAddr, EngineError> {
        let start = self.allocator.allocate_from_tail(bytes, BUFFER_ALIGNMENT)?;
        let address = self.base + start;
        self.hook.on_persistent_buffer(PersistentAllocation {
            node_index: self.node_index,
            phase: self.phase,
            bytes,
            address,
        });
        Ok(address)
    }

    fn request_scratch_buffer(&mut self, bytes: usize) -> Result<usize, EngineError> {
        if self.phase != KernelPhase::Prepare {
            return Err(EngineError::InvalidNode {
                node: self.node_index,
                op: self.subgraph.operators[self.node_index].opcode,
                reason: "scratch buffers can only be requested in prepare",
            });
        }
        self.scratch.push(ScratchRequest {
            node_index: self.node_index,
            bytes,
            data: 0,
        });
        Ok(self.scratch.len() - 1)
    }

    fn tensor_shape(&self, index: i32) -> Option<&[i32]> {
        let index = usize::try_from(index).ok()?;
        self.subgraph.tensors.get(index).map(|def| def.shape.values.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BuiltinOpResolver, NoHook};
    use crate::model::{BuiltinOperator, ModelBuilder, OperatorSpec, TensorType};

    #[derive(Default)]
    struct Recording(Vec<PersistentAllocation>);

    impl AllocationHook for Recording {
        fn on_persistent_buffer(&mut self, allocation: PersistentAllocation) {
            self.0.push(allocation);
        }
    }

    /// input -> FULLY_CONNECTED -> hidden -> SOFTMAX -> output
    fn two_layer_model() -> Model {
        let mut builder = ModelBuilder::new();
        let input = builder.add_tensor(TensorType::Float32, &[1, 4]);
        let weights = builder.add_constant(TensorType::Float32, &[8, 4], vec![0u8; 128]);
        let hidden = builder.add_tensor(TensorType::Float32, &[1, 8]);
        let output = builder.add_tensor(TensorType::Float32, &[1, 8]);
        builder.set_inputs(&[input]);
        builder.set_outputs(&[output]);
        builder.add_operator(
            OperatorSpec::new(BuiltinOperator::FULLY_CONNECTED, 1, &[input, weights, -1], &[hidden])
                .params(vec![1, 0, 0, 0]),
        );
        builder.add_operator(
            OperatorSpec::new(BuiltinOperator::SOFTMAX, 1, &[hidden], &[output])
                .params(1.0f32.to_le_bytes().to_vec()),
        );
        Model::from_bytes(builder.build()).unwrap()
    }

    #[test]
    fn test_host_arena_alignment() {
        let mut arena = HostArena::new(100);
        assert_eq!(arena.len(), 112);
        assert_eq!(arena.region().base % BUFFER_ALIGNMENT, 0);
        assert_eq!(arena.as_mut_slice().len(), 112);
    }

    #[test]
    fn test_allocate_tensors() {
        let model = two_layer_model();
        let resolver = BuiltinOpResolver::new();
        let mut arena = HostArena::new(4096);
        let region = arena.region();
        let mut engine = HostInterpreter::new(&model, &resolver, arena.as_mut_slice()).unwrap();
        let mut hook = Recording::default();
        engine.allocate_tensors(&mut hook).unwrap();

        // FULLY_CONNECTED and SOFTMAX each allocate their op data in init.
        assert_eq!(hook.0.len(), 2);
        assert!(hook.0.iter().all(|a| a.phase == KernelPhase::Init));
        assert_eq!(hook.0[0].bytes, 32);
        assert_eq!(engine.node(0).user_data, hook.0[0].address);
        assert!(region.offset_of(hook.0[1].address).is_some());

        let weights = engine.tensor(1);
        assert_eq!(weights.allocation, AllocationKind::ReadOnly);
        assert_eq!(region.offset_of(weights.data), None);

        // Activations live in the planned head.
        for idx in [0, 2, 3] {
            let offset = region.offset_of(engine.tensor(idx).data).unwrap();
            assert!(offset < 64, "tensor {idx} at {offset}");
        }

        let node = engine.node(0);
        assert_eq!(node.kernel_name, "FULLY_CONNECTED");
        assert_eq!(node.builtin_data.len(), 12);
        assert_eq!(&node.builtin_data[..4], &[1, 0, 0, 0]);
        assert_eq!(&node.builtin_data[4..], &[0; 8]);

        // head: 16 + 32 + 32 planned, tail: two builtin structs plus op data.
        assert!(engine.arena_used_bytes() >= 64 + 32 + 32);
    }

    #[test]
    fn test_allocation_is_repeatable() {
        let model = two_layer_model();
        let resolver = BuiltinOpResolver::new();
        let mut arena = HostArena::new(4096);
        let mut engine = HostInterpreter::new(&model, &resolver, arena.as_mut_slice()).unwrap();
        engine.allocate_tensors(&mut NoHook).unwrap();
        let first = engine.arena_used_bytes();
        let data = engine.tensor(2).data;
        engine.allocate_tensors(&mut NoHook).unwrap();
        assert_eq!(engine.arena_used_bytes(), first);
        assert_eq!(engine.tensor(2).data, data);
    }

    #[test]
    fn test_arena_exhausted() {
        let model = two_layer_model();
        let resolver = BuiltinOpResolver::new();
        let mut arena = HostArena::new(64);
        let mut engine = HostInterpreter::new(&model, &resolver, arena.as_mut_slice()).unwrap();
        assert!(matches!(
            engine.allocate_tensors(&mut NoHook),
            Err(EngineError::ArenaExhausted { .. })
        ));
    }

    #[test]
    fn test_unsupported_operator() {
        let mut builder = ModelBuilder::new();
        let a = builder.add_tensor(TensorType::Float32, &[4]);
        let b = builder.add_tensor(TensorType::Float32, &[4]);
        builder.set_inputs(&[a]);
        builder.set_outputs(&[b]);
        builder.add_operator(OperatorSpec::new(BuiltinOperator::CUSTOM, 1, &[a], &[b]));
        let model = Model::from_bytes(builder.build()).unwrap();

        let resolver = BuiltinOpResolver::new();
        let mut arena = HostArena::new(256);
        let err = HostInterpreter::new(&model, &resolver, arena.as_mut_slice()).err();
        assert_eq!(
            err,
            Some(EngineError::UnsupportedOperator {
                op: BuiltinOperator::CUSTOM,
                version: 1
            })
        );
    }

    #[test]
    fn test_variables_and_scratch() {
        let mut builder = ModelBuilder::new();
        let input = builder.add_tensor(TensorType::Float32, &[1, 8, 8, 3]);
        let filter = builder.add_constant(TensorType::Float32, &[4, 3, 3, 3], vec![0u8; 432]);
        let state = builder.add_variable(TensorType::Float32, &[1, 6, 6, 4]);
        let output = builder.add_tensor(TensorType::Float32, &[1, 6, 6, 4]);
        builder.set_inputs(&[input]);
        builder.set_outputs(&[output]);
        builder.add_operator(OperatorSpec::new(
            BuiltinOperator::CONV_2D,
            1,
            &[input, filter, -1],
            &[output],
        ));
        builder.add_operator(OperatorSpec::new(
            BuiltinOperator::ADD,
            1,
            &[output, state],
            &[output],
        ));
        let model = Model::from_bytes(builder.build()).unwrap();

        let resolver = BuiltinOpResolver::new();
        let mut arena = HostArena::new(16 * 1024);
        let region = arena.region();
        let mut engine = HostInterpreter::new(&model, &resolver, arena.as_mut_slice()).unwrap();
        let mut hook = Recording::default();
        engine.allocate_tensors(&mut hook).unwrap();

        let variable = engine.tensor(state as usize);
        assert_eq!(variable.allocation, AllocationKind::Persistent);
        assert!(region.offset_of(variable.data).is_some());

        let prepare: Vec<_> = hook.0.iter().filter(|a| a.phase == KernelPhase::Prepare).collect();
        assert_eq!(prepare.len(), 2);
        assert!(prepare.iter().all(|a| a.bytes == 16 && a.node_index == 0));

        let scratch = engine.scratch_buffers();
        assert_eq!(scratch.len(), 1);
        assert_eq!(scratch[0].bytes, 27 * 4);
        assert!(region.offset_of(scratch[0].data).is_some());
    }
}
