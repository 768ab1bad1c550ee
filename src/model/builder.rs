//! Container encoding.
//!
//! [`ModelBuilder`] writes the same format the decoder reads. It is how tests
//! and tools produce models without an external converter.

use super::decoder::{HEADER_SIZE, OPERATOR_RECORD_SIZE, SUBGRAPH_RECORD_SIZE, TENSOR_RECORD_SIZE};
use super::{BuiltinOperator, TensorType, MAGIC, SCHEMA_VERSION};

/// Alignment of constant tensor data inside the file.
const DATA_ALIGNMENT: usize = 16;

#[derive(Debug, Clone)]
struct TensorSpec {
    tensor_type: TensorType,
    is_variable: bool,
    shape: Vec<i32>,
    data: Vec<u8>,
    quantization: Option<(Vec<f32>, Vec<i32>, i32)>,
}

/// One operator to encode.
#[derive(Debug, Clone)]
pub struct OperatorSpec {
    opcode: BuiltinOperator,
    version: u16,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    params: Vec<u8>,
    custom: Vec<u8>,
}

impl OperatorSpec {
    pub fn new(opcode: BuiltinOperator, version: u16, inputs: &[i32], outputs: &[i32]) -> Self {
        Self {
            opcode,
            version,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            params: Vec::new(),
            custom: Vec::new(),
        }
    }

    /// Builtin parameter block, copied verbatim into the file.
    pub fn params(mut self, params: Vec<u8>) -> Self {
        self.params = params;
        self
    }

    pub fn custom(mut self, custom: Vec<u8>) -> Self {
        self.custom = custom;
        self
    }
}

/// Builds a single-subgraph model container.
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    version: u32,
    subgraph_copies: usize,
    tensors: Vec<TensorSpec>,
    inputs: Vec<i32>,
    outputs: Vec<i32>,
    operators: Vec<OperatorSpec>,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSION,
            subgraph_copies: 1,
            tensors: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            operators: Vec::new(),
        }
    }

    /// Override the version written to the header.
    pub fn schema_version(&mut self, version: u32) {
        self.version = version;
    }

    /// Write the subgraph `copies` times. Only one is accepted by the decoder.
    pub fn subgraph_copies(&mut self, copies: usize) {
        self.subgraph_copies = copies;
    }

    fn push_tensor(
        &mut self,
        tensor_type: TensorType,
        shape: &[i32],
        data: Vec<u8>,
        is_variable: bool,
    ) -> i32 {
        self.tensors.push(TensorSpec {
            tensor_type,
            is_variable,
            shape: shape.to_vec(),
            data,
            quantization: None,
        });
        (self.tensors.len() - 1) as i32
    }

    /// Add an activation tensor. Returns its index.
    pub fn add_tensor(&mut self, tensor_type: TensorType, shape: &[i32]) -> i32 {
        self.push_tensor(tensor_type, shape, Vec::new(), false)
    }

    /// Add a tensor with constant contents.
    pub fn add_constant(&mut self, tensor_type: TensorType, shape: &[i32], data: Vec<u8>) -> i32 {
        self.push_tensor(tensor_type, shape, data, false)
    }

    /// Add a variable tensor, whose state survives across invocations.
    pub fn add_variable(&mut self, tensor_type: TensorType, shape: &[i32]) -> i32 {
        self.push_tensor(tensor_type, shape, Vec::new(), true)
    }

    pub fn set_quantization(
        &mut self,
        tensor: i32,
        scales: Vec<f32>,
        zero_points: Vec<i32>,
        quantized_dimension: i32,
    ) {
        if let Some(spec) = self.tensors.get_mut(tensor as usize) {
            spec.quantization = Some((scales, zero_points, quantized_dimension));
        }
    }

    pub fn set_inputs(&mut self, inputs: &[i32]) {
        self.inputs = inputs.to_vec();
    }

    pub fn set_outputs(&mut self, outputs: &[i32]) {
        self.outputs = outputs.to_vec();
    }

    pub fn add_operator(&mut self, op: OperatorSpec) {
        self.operators.push(op);
    }

    /// Encode the container.
    pub fn build(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.bytes.extend_from_slice(MAGIC);
        w.u32(self.version);
        w.u32(self.subgraph_copies as u32);
        debug_assert_eq!(w.bytes.len(), HEADER_SIZE);
        let table = w.reserve(self.subgraph_copies * 4);

        for copy in 0..self.subgraph_copies {
            let offset = self.write_subgraph(&mut w);
            w.patch_u32(table + copy * 4, offset as u32);
        }
        w.bytes
    }

    fn write_subgraph(&self, w: &mut Writer) -> usize {
        struct TensorOffsets {
            shape: usize,
            data: usize,
            quant: usize,
        }

        let mut tensor_offsets = Vec::with_capacity(self.tensors.len());
        for tensor in &self.tensors {
            let shape = w.int_array(&tensor.shape);
            let data = if tensor.data.is_empty() {
                0
            } else {
                w.align(DATA_ALIGNMENT);
                let at = w.bytes.len();
                w.bytes.extend_from_slice(&tensor.data);
                at
            };
            let quant = match &tensor.quantization {
                None => 0,
                Some((scales, zero_points, qdim)) => {
                    w.align(4);
                    let at = w.bytes.len();
                    w.u32(scales.len() as u32);
                    w.u32(*qdim as u32);
                    for scale in scales {
                        w.u32(scale.to_bits());
                    }
                    for zero in zero_points {
                        w.u32(*zero as u32);
                    }
                    at
                }
            };
            tensor_offsets.push(TensorOffsets { shape, data, quant });
        }

        let inputs = w.int_array(&self.inputs);
        let outputs = w.int_array(&self.outputs);

        let mut operator_offsets = Vec::with_capacity(self.operators.len());
        for op in &self.operators {
            let op_inputs = w.int_array(&op.inputs);
            let op_outputs = w.int_array(&op.outputs);
            let params = w.blob(&op.params);
            let custom = w.blob(&op.custom);
            operator_offsets.push((op_inputs, op_outputs, params, custom));
        }

        w.align(4);
        let tensors_at = w.bytes.len();
        for (tensor, offsets) in self.tensors.iter().zip(&tensor_offsets) {
            w.bytes.push(tensor.tensor_type.code());
            w.bytes.push(u8::from(tensor.is_variable));
            w.bytes.extend_from_slice(&[0, 0]);
            w.u32(offsets.shape as u32);
            w.u32(offsets.data as u32);
            w.u32(tensor.data.len() as u32);
            w.u32(offsets.quant as u32);
        }
        debug_assert_eq!(w.bytes.len() - tensors_at, self.tensors.len() * TENSOR_RECORD_SIZE);

        let operators_at = w.bytes.len();
        for (op, &(op_inputs, op_outputs, params, custom)) in
            self.operators.iter().zip(&operator_offsets)
        {
            w.bytes.extend_from_slice(&op.opcode.0.to_le_bytes());
            w.bytes.extend_from_slice(&op.version.to_le_bytes());
            w.u32(op_inputs as u32);
            w.u32(op_outputs as u32);
            w.u32(params as u32);
            w.u32(op.params.len() as u32);
            w.u32(custom as u32);
            w.u32(op.custom.len() as u32);
        }
        debug_assert_eq!(w.bytes.len() - operators_at, self.operators.len() * OPERATOR_RECORD_SIZE);

        let subgraph_at = w.bytes.len();
        w.u32(self.tensors.len() as u32);
        w.u32(tensors_at as u32);
        w.u32(inputs as u32);
        w.u32(outputs as u32);
        w.u32(self.operators.len() as u32);
        w.u32(operators_at as u32);
        debug_assert_eq!(w.bytes.len() - subgraph_at, SUBGRAPH_RECORD_SIZE);
        subgraph_at
    }
}

#[derive(Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn align(&mut self, alignment: usize) {
        let padded = self.bytes.len().next_multiple_of(alignment);
        self.bytes.resize(padded, 0);
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn reserve(&mut self, len: usize) -> usize {
        let at = self.bytes.len();
        self.bytes.resize(at + len, 0);
        at
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn int_array(&mut self, values: &[i32]) -> usize {
        self.align(4);
        let at = self.bytes.len();
        self.u32(values.len() as u32);
        for &v in values {
            self.u32(v as u32);
        }
        at
    }

    fn blob(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        self.align(4);
        let at = self.bytes.len();
        self.bytes.extend_from_slice(data);
        at
    }
}
