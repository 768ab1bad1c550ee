//! Model container.
//!
//! The pipeline reads models from a compact little-endian container. Every
//! record refers to the rest of the file by byte offset, and integer arrays
//! are stored as `[len][values...]`, the same layout the target runtime uses
//! for its integer arrays. Shapes and node index lists can therefore be used
//! in place on the target, straight out of the constant model data.
//!
//! ```text
//! header      "TMDL" | version u32 | subgraph count u32 | subgraph offsets u32...
//! subgraph    tensor count | tensors | inputs | outputs | operator count | operators
//! tensor      type u8 | variable u8 | pad u16 | shape | data offset | data len | quant
//! quant       channels u32 | quantized dimension i32 | scales f32... | zero points i32...
//! operator    opcode u16 | version u16 | inputs | outputs | params off | len | custom off | len
//! ```

pub mod builder;
pub mod decoder;

pub use builder::{ModelBuilder, OperatorSpec};

use std::fmt;

use thiserror::Error;

/// Container magic.
pub const MAGIC: &[u8; 4] = b"TMDL";

/// The only schema version the pipeline accepts.
pub const SCHEMA_VERSION: u32 = 3;

/// Largest tensor the 32-bit target can address.
pub const MAX_TENSOR_BYTES: usize = u32::MAX as usize;

/// Errors from decoding a model container.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("not a model container (bad magic)")]
    BadMagic,

    #[error("model provided is schema version {found} not equal to supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("only 1 subgraph supported, model has {0}")]
    SubgraphCount(usize),

    #[error("truncated model: {what} at offset {offset} needs {needed} bytes, file has {len}")]
    Truncated {
        what: &'static str,
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("{what} at offset {offset} is not 4-byte aligned")]
    Misaligned { what: &'static str, offset: usize },

    #[error("tensor {tensor} has unsupported type code {code}")]
    UnsupportedTensorType { tensor: usize, code: u8 },

    #[error("tensor {tensor} has a negative dimension in its shape")]
    InvalidShape { tensor: usize },

    #[error("tensor {tensor} does not fit in 4 GiB")]
    TensorTooLarge { tensor: usize },

    #[error("{what} refers to tensor {index}, model has {count} tensors")]
    TensorIndex {
        what: &'static str,
        index: i32,
        count: usize,
    },
}

/// Element type of a tensor, as stored in the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TensorType {
    Float32 = 0,
    Float16 = 1,
    Int32 = 2,
    UInt8 = 3,
    Int64 = 4,
    Bool = 6,
    Int16 = 7,
    Complex64 = 8,
    Int8 = 9,
}

impl TensorType {
    pub fn from_code(code: u8) -> Option<Self> {
        use TensorType::*;
        Some(match code {
            0 => Float32,
            1 => Float16,
            2 => Int32,
            3 => UInt8,
            4 => Int64,
            6 => Bool,
            7 => Int16,
            8 => Complex64,
            9 => Int8,
            _ => return None,
        })
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn element_size(self) -> usize {
        use TensorType::*;
        match self {
            Float32 | Int32 => 4,
            Float16 | Int16 => 2,
            UInt8 | Int8 | Bool => 1,
            Int64 | Complex64 => 8,
        }
    }

    /// Value of the runtime's `TfLiteType` enum and its enumerator name.
    pub fn runtime_type(self) -> (u32, &'static str) {
        use TensorType::*;
        match self {
            Float32 => (1, "kTfLiteFloat32"),
            Int32 => (2, "kTfLiteInt32"),
            UInt8 => (3, "kTfLiteUInt8"),
            Int64 => (4, "kTfLiteInt64"),
            Bool => (6, "kTfLiteBool"),
            Int16 => (7, "kTfLiteInt16"),
            Complex64 => (8, "kTfLiteComplex64"),
            Int8 => (9, "kTfLiteInt8"),
            Float16 => (10, "kTfLiteFloat16"),
        }
    }
}

/// Builtin operator code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuiltinOperator(pub u16);

impl BuiltinOperator {
    pub const ADD: Self = Self(0);
    pub const AVERAGE_POOL_2D: Self = Self(1);
    pub const CONCATENATION: Self = Self(2);
    pub const CONV_2D: Self = Self(3);
    pub const DEPTHWISE_CONV_2D: Self = Self(4);
    pub const DEQUANTIZE: Self = Self(6);
    pub const FULLY_CONNECTED: Self = Self(9);
    pub const LOGISTIC: Self = Self(14);
    pub const MAX_POOL_2D: Self = Self(17);
    pub const MUL: Self = Self(18);
    pub const RELU: Self = Self(19);
    pub const RESHAPE: Self = Self(22);
    pub const SOFTMAX: Self = Self(25);
    pub const TANH: Self = Self(28);
    pub const CUSTOM: Self = Self(32);
    pub const QUANTIZE: Self = Self(114);

    /// Enumerator name, also used for the runtime's `Register_<NAME>` functions.
    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::ADD => "ADD",
            Self::AVERAGE_POOL_2D => "AVERAGE_POOL_2D",
            Self::CONCATENATION => "CONCATENATION",
            Self::CONV_2D => "CONV_2D",
            Self::DEPTHWISE_CONV_2D => "DEPTHWISE_CONV_2D",
            Self::DEQUANTIZE => "DEQUANTIZE",
            Self::FULLY_CONNECTED => "FULLY_CONNECTED",
            Self::LOGISTIC => "LOGISTIC",
            Self::MAX_POOL_2D => "MAX_POOL_2D",
            Self::MUL => "MUL",
            Self::RELU => "RELU",
            Self::RESHAPE => "RESHAPE",
            Self::SOFTMAX => "SOFTMAX",
            Self::TANH => "TANH",
            Self::CUSTOM => "CUSTOM",
            Self::QUANTIZE => "QUANTIZE",
            _ => return None,
        })
    }
}

impl fmt::Display for BuiltinOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "BUILTIN_{}", self.0),
        }
    }
}

/// Byte range inside the model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRange {
    pub offset: usize,
    pub len: usize,
}

/// Integer array stored in the model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntArray {
    /// Offset of the length word.
    pub offset: usize,
    pub values: Vec<i32>,
}

/// Per-channel affine quantization parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantization {
    pub scales: Vec<f32>,
    pub zero_points: Vec<i32>,
    pub quantized_dimension: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorDef {
    pub tensor_type: TensorType,
    pub is_variable: bool,
    pub shape: IntArray,
    /// Constant contents, if the tensor has any.
    pub data: Option<BlobRange>,
    pub quantization: Option<Quantization>,
}

impl TensorDef {
    /// Size of the tensor's contents in bytes, `None` if it does not fit
    /// [`MAX_TENSOR_BYTES`] or a dimension is negative.
    pub fn checked_byte_size(&self) -> Option<usize> {
        self.shape
            .values
            .iter()
            .try_fold(self.tensor_type.element_size(), |acc, &d| {
                acc.checked_mul(usize::try_from(d).ok()?)
            })
            .filter(|&bytes| bytes <= MAX_TENSOR_BYTES)
    }

    /// Size of the tensor's contents in bytes.
    ///
    /// Decoded tensors always have a valid size; anything else reports
    /// [`MAX_TENSOR_BYTES`].
    pub fn byte_size(&self) -> usize {
        self.checked_byte_size().unwrap_or(MAX_TENSOR_BYTES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorDef {
    pub opcode: BuiltinOperator,
    pub version: u32,
    pub inputs: IntArray,
    pub outputs: IntArray,
    pub params: Option<BlobRange>,
    pub custom: Option<BlobRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subgraph {
    pub tensors: Vec<TensorDef>,
    pub inputs: IntArray,
    pub outputs: IntArray,
    pub operators: Vec<OperatorDef>,
}

/// A decoded model. Keeps the raw file, which becomes the constant data of
/// the generated program.
#[derive(Debug, Clone)]
pub struct Model {
    bytes: Vec<u8>,
    version: u32,
    subgraph: Subgraph,
}

impl Model {
    /// Decode a container. Takes ownership of the bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ModelError> {
        let (version, subgraph) = decoder::decode(&bytes)?;
        Ok(Self {
            bytes,
            version,
            subgraph,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn subgraph(&self) -> &Subgraph {
        &self.subgraph
    }

    /// Bytes of a range inside the model file.
    pub fn blob(&self, range: BlobRange) -> &[u8] {
        &self.bytes[range.offset..range.offset + range.len]
    }
}
