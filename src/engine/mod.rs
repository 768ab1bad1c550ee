// This module defines the instrumentation interface between the pipeline and a reference
// inference engine. The pipeline never reaches into engine internals: it drives the engine
// through ReferenceEngine (tensor allocation, tensor table, node and registration enumeration,
// scratch buffer requests) and observes persistent buffer allocations through an
// AllocationHook that the engine calls after each allocation and before handing the address
// back to the kernel. Kernels are looked up through an OpResolver and only expose what the
// allocator needs (builtin data size, whether a prepare step exists, and the buffers they
// request during init and prepare). HostInterpreter is the host-side engine used by the
// compiler; BuiltinOpResolver is its table of builtin kernel descriptors.

//! Reference engine instrumentation interface.

pub mod interpreter;
pub mod kernels;

pub use interpreter::{HostArena, HostInterpreter};
pub use kernels::{BuiltinOpResolver, KernelDescriptor};

use thiserror::Error;

use crate::core::{CompileError, HostAddr, UnitId};
use crate::model::{BuiltinOperator, Quantization, TensorType};

/// Errors raised by a reference engine while allocating tensors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("didn't find op for builtin opcode '{op}' version '{version}'")]
    UnsupportedOperator { op: BuiltinOperator, version: u32 },

    #[error("arena exhausted: {requested} bytes requested, {available} of {capacity} bytes free")]
    ArenaExhausted {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("node {node} ({op}): {reason}")]
    InvalidNode {
        node: usize,
        op: BuiltinOperator,
        reason: &'static str,
    },

    #[error(
        "{unit} has an invalid lifetime: first_created: {first_created:?}, last_used: {last_used:?}"
    )]
    InconsistentLifetime {
        unit: UnitId,
        first_created: Option<usize>,
        last_used: Option<usize>,
    },

    #[error("tensor index {index} is out of range ({count} tensors)")]
    TensorIndex { index: i32, count: usize },

    #[error("planning the arena head failed: {0}")]
    Planning(String),
}

impl From<CompileError> for EngineError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::InconsistentLifetime {
                unit,
                first_created,
                last_used,
            } => EngineError::InconsistentLifetime {
                unit,
                first_created,
                last_used,
            },
            CompileError::TensorIndex { index, count } => EngineError::TensorIndex { index, count },
            other => EngineError::Planning(other.to_string()),
        }
    }
}

/// How a tensor's storage is provided at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    /// Points into the constant model data.
    ReadOnly,
    /// Planned arena memory.
    Arena,
    /// Arena memory that lives for the whole model lifetime.
    Persistent,
}

impl AllocationKind {
    /// Enumerator of the runtime's `TfLiteAllocationType`.
    pub fn runtime_name(self) -> &'static str {
        match self {
            AllocationKind::ReadOnly => "kTfLiteMmapRo",
            AllocationKind::Arena => "kTfLiteArenaRw",
            AllocationKind::Persistent => "kTfLiteArenaRwPersistent",
        }
    }
}

/// Resolved state of one tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    pub tensor_type: TensorType,
    pub bytes: usize,
    /// Data address, 0 while unset.
    pub data: HostAddr,
    pub is_variable: bool,
    pub allocation: AllocationKind,
    /// Address of the shape integer array.
    pub dims: HostAddr,
    pub quantization: Option<&'a Quantization>,
}

/// One node and its registration, as the engine resolved them.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    pub opcode: BuiltinOperator,
    pub version: u32,
    pub kernel_name: &'static str,
    pub has_prepare: bool,
    pub inputs: &'a [i32],
    pub outputs: &'a [i32],
    /// Address of the inputs integer array.
    pub inputs_addr: HostAddr,
    pub outputs_addr: HostAddr,
    /// Builtin parameter data as the kernel will read it. Empty if the
    /// kernel takes none.
    pub builtin_data: &'a [u8],
    pub custom_data: HostAddr,
    pub custom_data_len: usize,
    pub user_data: HostAddr,
}

/// Kernel lifecycle step that issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelPhase {
    Init,
    Prepare,
}

/// A persistent buffer handed to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentAllocation {
    pub node_index: usize,
    pub phase: KernelPhase,
    pub bytes: usize,
    pub address: HostAddr,
}

/// A scratch buffer requested during prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchRequest {
    pub node_index: usize,
    pub bytes: usize,
    /// Address assigned once the arena head is planned, 0 before.
    pub data: HostAddr,
}

/// Observer for persistent buffer allocations.
///
/// Called after the allocator returned and before the address reaches the
/// kernel. Implementations must not assume anything about the address.
pub trait AllocationHook {
    fn on_persistent_buffer(&mut self, allocation: PersistentAllocation);
}

/// Hook that ignores every allocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHook;

impl AllocationHook for NoHook {
    fn on_persistent_buffer(&mut self, _allocation: PersistentAllocation) {}
}

/// What the pipeline needs from a reference engine.
pub trait ReferenceEngine {
    /// Run kernel init and prepare, then assign memory to every tensor.
    fn allocate_tensors(&mut self, hook: &mut dyn AllocationHook) -> Result<(), EngineError>;

    /// Arena bytes consumed by the last `allocate_tensors`.
    fn arena_used_bytes(&self) -> usize;

    fn tensor_count(&self) -> usize;

    /// Panics if `index >= tensor_count()`.
    fn tensor(&self, index: usize) -> TensorView<'_>;

    fn node_count(&self) -> usize;

    /// Panics if `index >= node_count()`.
    fn node(&self, index: usize) -> NodeView<'_>;

    fn scratch_buffers(&self) -> &[ScratchRequest];

    fn graph_inputs(&self) -> &[i32];

    fn graph_outputs(&self) -> &[i32];
}

/// Node operands as seen by a kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelNode<'a> {
    pub index: usize,
    pub opcode: BuiltinOperator,
    pub inputs: &'a [i32],
    pub outputs: &'a [i32],
}

/// Services the engine offers to kernels during init and prepare.
pub trait KernelContext {
    /// Allocate memory that lives as long as the model.
    fn allocate_persistent_buffer(&mut self, bytes: usize) -> Result<HostAddr, EngineError>;

    /// Request arena memory valid only while the node runs. Returns the
    /// buffer index.
    fn request_scratch_buffer(&mut self, bytes: usize) -> Result<usize, EngineError>;

    /// Shape of a tensor, `None` for optional operands.
    fn tensor_shape(&self, index: i32) -> Option<&[i32]>;
}

/// Allocation-relevant part of an operator kernel.
pub trait Kernel {
    /// Builtin operator enumerator name.
    fn name(&self) -> &'static str;

    /// Size of the runtime's builtin parameter struct.
    fn builtin_data_size(&self) -> usize;

    fn has_prepare(&self) -> bool;

    /// Returns the node's user data address (0 for none).
    fn init(
        &self,
        ctx: &mut dyn KernelContext,
        node: &KernelNode<'_>,
    ) -> Result<HostAddr, EngineError>;

    fn prepare(
        &self,
        ctx: &mut dyn KernelContext,
        node: &KernelNode<'_>,
    ) -> Result<(), EngineError>;
}

/// Looks up kernels by operator code and version.
pub trait OpResolver {
    fn find(&self, op: BuiltinOperator, version: u32) -> Option<&dyn Kernel>;
}
