//! Builtin kernel descriptors.
//!
//! The host engine never runs kernel math. A descriptor only knows what the
//! allocator has to know about a kernel: how large its builtin parameter
//! struct is, whether it has a prepare step, and which buffers it asks for
//! during init and prepare.

use std::collections::BTreeMap;

use super::{EngineError, Kernel, KernelContext, KernelNode, OpResolver};
use crate::core::HostAddr;
use crate::model::BuiltinOperator;

/// Size rule for one buffer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sizing {
    Fixed(usize),
    /// `bytes` per output channel of the filter operand `input`. The channel
    /// count is the first dimension, or the last one if `last_axis` is set.
    PerChannel {
        input: usize,
        last_axis: bool,
        bytes: usize,
    },
    /// One im2col patch of the filter operand `input`: all dimensions except
    /// the first, times `bytes` per element.
    FilterPatch { input: usize, bytes: usize },
}

impl Sizing {
    fn resolve(self, ctx: &dyn KernelContext, node: &KernelNode<'_>) -> Result<usize, EngineError> {
        let filter_shape = |input: usize| {
            node.inputs
                .get(input)
                .and_then(|&index| ctx.tensor_shape(index))
                .ok_or(EngineError::InvalidNode {
                    node: node.index,
                    op: node.opcode,
                    reason: "missing filter operand",
                })
        };
        let overflow = EngineError::InvalidNode {
            node: node.index,
            op: node.opcode,
            reason: "buffer size overflows",
        };
        match self {
            Sizing::Fixed(bytes) => Ok(bytes),
            Sizing::PerChannel {
                input,
                last_axis,
                bytes,
            } => {
                let shape = filter_shape(input)?;
                let channels = if last_axis { shape.last() } else { shape.first() };
                channels
                    .map_or(Some(0), |&c| usize::try_from(c).ok())
                    .and_then(|c| c.checked_mul(bytes))
                    .ok_or(overflow)
            }
            Sizing::FilterPatch { input, bytes } => {
                let shape = filter_shape(input)?;
                shape
                    .iter()
                    .skip(1)
                    .try_fold(bytes, |acc, &d| acc.checked_mul(usize::try_from(d).ok()?))
                    .ok_or(overflow)
            }
        }
    }
}

/// Allocation behaviour of one builtin kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelDescriptor {
    pub name: &'static str,
    pub builtin_data_size: usize,
    pub has_prepare: bool,
    /// Persistent operator data allocated in init; becomes the node's user data.
    pub init_data: Option<Sizing>,
    pub prepare_persistent: &'static [Sizing],
    pub prepare_scratch: &'static [Sizing],
}

impl KernelDescriptor {
    const fn simple(name: &'static str, builtin_data_size: usize) -> Self {
        Self {
            name,
            builtin_data_size,
            has_prepare: true,
            init_data: None,
            prepare_persistent: &[],
            prepare_scratch: &[],
        }
    }

    const fn with_op_data(mut self, bytes: usize) -> Self {
        self.init_data = Some(Sizing::Fixed(bytes));
        self
    }
}

impl Kernel for KernelDescriptor {
    fn name(&self) -> &'static str {
        self.name
    }

    fn builtin_data_size(&self) -> usize {
        self.builtin_data_size
    }

    fn has_prepare(&self) -> bool {
        self.has_prepare
    }

    fn init(
        &self,
        ctx: &mut dyn KernelContext,
        node: &KernelNode<'_>,
    ) -> Result<HostAddr, EngineError> {
        match self.init_data {
            Some(sizing) => {
                let bytes = sizing.resolve(ctx, node)?;
                ctx.allocate_persistent_buffer(bytes)
            }
            None => Ok(0),
        }
    }

    fn prepare(
        &self,
        ctx: &mut dyn KernelContext,
        node: &KernelNode<'_>,
    ) -> Result<(), EngineError> {
        for sizing in self.prepare_persistent {
            let bytes = sizing.resolve(ctx, node)?;
            ctx.allocate_persistent_buffer(bytes)?;
        }
        for sizing in self.prepare_scratch {
            let bytes = sizing.resolve(ctx, node)?;
            ctx.request_scratch_buffer(bytes)?;
        }
        Ok(())
    }
}

// Per-channel output multiplier and shift arrays of the quantized convolutions.
const CONV_CHANNEL_ARRAYS: &[Sizing] = &[
    Sizing::PerChannel {
        input: 1,
        last_axis: false,
        bytes: 4,
    },
    Sizing::PerChannel {
        input: 1,
        last_axis: false,
        bytes: 4,
    },
];

const DEPTHWISE_CHANNEL_ARRAYS: &[Sizing] = &[
    Sizing::PerChannel {
        input: 1,
        last_axis: true,
        bytes: 4,
    },
    Sizing::PerChannel {
        input: 1,
        last_axis: true,
        bytes: 4,
    },
];

const CONV_IM2COL: &[Sizing] = &[Sizing::FilterPatch { input: 1, bytes: 4 }];

/// Resolver over the builtin kernel descriptors.
///
/// Every builtin answers for versions 1 through `max_version`.
#[derive(Debug, Clone)]
pub struct BuiltinOpResolver {
    kernels: BTreeMap<BuiltinOperator, (u32, KernelDescriptor)>,
}

impl BuiltinOpResolver {
    /// Resolver with every builtin the crate knows about.
    pub fn new() -> Self {
        use BuiltinOperator as Op;

        let mut resolver = Self::empty();
        resolver.add(Op::ADD, 2, KernelDescriptor::simple("ADD", 4).with_op_data(48));
        resolver.add(Op::AVERAGE_POOL_2D, 2, KernelDescriptor::simple("AVERAGE_POOL_2D", 40));
        resolver.add(Op::CONCATENATION, 3, KernelDescriptor::simple("CONCATENATION", 8));
        resolver.add(
            Op::CONV_2D,
            3,
            KernelDescriptor {
                prepare_persistent: CONV_CHANNEL_ARRAYS,
                prepare_scratch: CONV_IM2COL,
                ..KernelDescriptor::simple("CONV_2D", 24).with_op_data(64)
            },
        );
        resolver.add(
            Op::DEPTHWISE_CONV_2D,
            3,
            KernelDescriptor {
                prepare_persistent: DEPTHWISE_CHANNEL_ARRAYS,
                ..KernelDescriptor::simple("DEPTHWISE_CONV_2D", 28).with_op_data(64)
            },
        );
        resolver.add(Op::DEQUANTIZE, 2, KernelDescriptor::simple("DEQUANTIZE", 0).with_op_data(16));
        resolver.add(
            Op::FULLY_CONNECTED,
            4,
            KernelDescriptor::simple("FULLY_CONNECTED", 12).with_op_data(32),
        );
        resolver.add(Op::LOGISTIC, 2, KernelDescriptor::simple("LOGISTIC", 0).with_op_data(16));
        resolver.add(Op::MAX_POOL_2D, 2, KernelDescriptor::simple("MAX_POOL_2D", 40));
        resolver.add(Op::MUL, 3, KernelDescriptor::simple("MUL", 4).with_op_data(32));
        resolver.add(Op::QUANTIZE, 2, KernelDescriptor::simple("QUANTIZE", 0).with_op_data(16));
        resolver.add(Op::RELU, 2, KernelDescriptor::simple("RELU", 0));
        resolver.add(
            Op::RESHAPE,
            1,
            KernelDescriptor {
                has_prepare: false,
                ..KernelDescriptor::simple("RESHAPE", 36)
            },
        );
        resolver.add(Op::SOFTMAX, 2, KernelDescriptor::simple("SOFTMAX", 4).with_op_data(24));
        resolver.add(Op::TANH, 2, KernelDescriptor::simple("TANH", 0));
        resolver
    }

    /// Resolver without any kernels.
    pub fn empty() -> Self {
        Self {
            kernels: BTreeMap::new(),
        }
    }

    /// Register (or replace) a kernel for versions `1..=max_version`.
    pub fn add(&mut self, op: BuiltinOperator, max_version: u32, kernel: KernelDescriptor) {
        self.kernels.insert(op, (max_version, kernel));
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl Default for BuiltinOpResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl OpResolver for BuiltinOpResolver {
    fn find(&self, op: BuiltinOperator, version: u32) -> Option<&dyn Kernel> {
        match self.kernels.get(&op) {
            Some((max_version, kernel)) if (1..=*max_version).contains(&version) => Some(kernel),
            _ => None,
        }
    }
}
