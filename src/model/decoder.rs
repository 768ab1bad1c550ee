//! Container decoding.
//!
//! Every read is bounds checked; anything that does not fit the file is a
//! [`ModelError::Truncated`]. Integer arrays and records must be 4-byte
//! aligned because the target reads them in place.

use super::{
    BlobRange, BuiltinOperator, IntArray, ModelError, OperatorDef, Quantization, Subgraph,
    TensorDef, TensorType, MAGIC, SCHEMA_VERSION,
};

pub(crate) const HEADER_SIZE: usize = 12;
pub(crate) const SUBGRAPH_RECORD_SIZE: usize = 24;
pub(crate) const TENSOR_RECORD_SIZE: usize = 20;
pub(crate) const OPERATOR_RECORD_SIZE: usize = 28;

/// Decode the header and the single subgraph.
pub fn decode(bytes: &[u8]) -> Result<(u32, Subgraph), ModelError> {
    let reader = Reader { bytes };

    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(ModelError::BadMagic);
    }
    let version = reader.u32(4, "header")?;
    if version != SCHEMA_VERSION {
        return Err(ModelError::UnsupportedVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    let subgraph_count = reader.u32(8, "header")? as usize;
    if subgraph_count != 1 {
        return Err(ModelError::SubgraphCount(subgraph_count));
    }
    let subgraph_offset = reader.u32(HEADER_SIZE, "subgraph table")? as usize;
    let subgraph = reader.subgraph(subgraph_offset)?;
    Ok((version, subgraph))
}

struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn slice(&self, offset: usize, len: usize, what: &'static str) -> Result<&'a [u8], ModelError> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.bytes.len() => Ok(&self.bytes[offset..end]),
            _ => Err(ModelError::Truncated {
                what,
                offset,
                needed: len,
                len: self.bytes.len(),
            }),
        }
    }

    fn aligned(&self, offset: usize, what: &'static str) -> Result<(), ModelError> {
        if offset % 4 != 0 {
            return Err(ModelError::Misaligned { what, offset });
        }
        Ok(())
    }

    fn u8(&self, offset: usize, what: &'static str) -> Result<u8, ModelError> {
        Ok(self.slice(offset, 1, what)?[0])
    }

    fn u16(&self, offset: usize, what: &'static str) -> Result<u16, ModelError> {
        let b = self.slice(offset, 2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, offset: usize, what: &'static str) -> Result<u32, ModelError> {
        let b = self.slice(offset, 4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&self, offset: usize, what: &'static str) -> Result<i32, ModelError> {
        Ok(self.u32(offset, what)? as i32)
    }

    fn f32(&self, offset: usize, what: &'static str) -> Result<f32, ModelError> {
        Ok(f32::from_bits(self.u32(offset, what)?))
    }

    fn int_array(&self, offset: usize, what: &'static str) -> Result<IntArray, ModelError> {
        self.aligned(offset, what)?;
        let len = self.i32(offset, what)?;
        let len = usize::try_from(len).map_err(|_| ModelError::Truncated {
            what,
            offset,
            needed: 0,
            len: self.bytes.len(),
        })?;
        self.slice(offset + 4, len * 4, what)?;
        let values = (0..len)
            .map(|i| self.i32(offset + 4 + i * 4, what))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IntArray { offset, values })
    }

    fn range(
        &self,
        offset: usize,
        len: usize,
        what: &'static str,
    ) -> Result<Option<BlobRange>, ModelError> {
        if len == 0 {
            return Ok(None);
        }
        self.slice(offset, len, what)?;
        Ok(Some(BlobRange { offset, len }))
    }

    fn subgraph(&self, offset: usize) -> Result<Subgraph, ModelError> {
        self.aligned(offset, "subgraph")?;
        self.slice(offset, SUBGRAPH_RECORD_SIZE, "subgraph")?;
        let tensor_count = self.u32(offset, "subgraph")? as usize;
        let tensors_offset = self.u32(offset + 4, "subgraph")? as usize;
        let inputs = self.int_array(self.u32(offset + 8, "subgraph")? as usize, "graph inputs")?;
        let outputs = self.int_array(self.u32(offset + 12, "subgraph")? as usize, "graph outputs")?;
        let operator_count = self.u32(offset + 16, "subgraph")? as usize;
        let operators_offset = self.u32(offset + 20, "subgraph")? as usize;

        let tensors = (0..tensor_count)
            .map(|idx| self.tensor(idx, tensors_offset + idx * TENSOR_RECORD_SIZE))
            .collect::<Result<Vec<_>, _>>()?;
        let operators = (0..operator_count)
            .map(|idx| self.operator(operators_offset + idx * OPERATOR_RECORD_SIZE))
            .collect::<Result<Vec<_>, _>>()?;

        check_indices(&inputs, "graph inputs", tensor_count)?;
        check_indices(&outputs, "graph outputs", tensor_count)?;
        for op in &operators {
            check_indices(&op.inputs, "operator inputs", tensor_count)?;
            check_indices(&op.outputs, "operator outputs", tensor_count)?;
        }

        Ok(Subgraph {
            tensors,
            inputs,
            outputs,
            operators,
        })
    }

    fn tensor(&self, idx: usize, offset: usize) -> Result<TensorDef, ModelError> {
        self.aligned(offset, "tensor")?;
        self.slice(offset, TENSOR_RECORD_SIZE, "tensor")?;
        let code = self.u8(offset, "tensor")?;
        let tensor_type = TensorType::from_code(code)
            .ok_or(ModelError::UnsupportedTensorType { tensor: idx, code })?;
        let is_variable = self.u8(offset + 1, "tensor")? != 0;
        let shape = self.int_array(self.u32(offset + 4, "tensor")? as usize, "tensor shape")?;
        if shape.values.iter().any(|&d| d < 0) {
            return Err(ModelError::InvalidShape { tensor: idx });
        }
        let def = TensorDef {
            tensor_type,
            is_variable,
            shape,
            data: None,
            quantization: None,
        };
        if def.checked_byte_size().is_none() {
            return Err(ModelError::TensorTooLarge { tensor: idx });
        }
        let data = self.range(
            self.u32(offset + 8, "tensor")? as usize,
            self.u32(offset + 12, "tensor")? as usize,
            "tensor data",
        )?;
        let quant_offset = self.u32(offset + 16, "tensor")? as usize;
        let quantization = if quant_offset == 0 {
            None
        } else {
            Some(self.quantization(quant_offset)?)
        };
        Ok(TensorDef {
            data,
            quantization,
            ..def
        })
    }

    fn quantization(&self, offset: usize) -> Result<Quantization, ModelError> {
        self.aligned(offset, "quantization")?;
        let channels = self.u32(offset, "quantization")? as usize;
        let quantized_dimension = self.i32(offset + 4, "quantization")?;
        let scales_at = offset + 8;
        let zeros_at = scales_at + channels * 4;
        self.slice(scales_at, channels * 8, "quantization")?;
        let scales = (0..channels)
            .map(|c| self.f32(scales_at + c * 4, "quantization scales"))
            .collect::<Result<Vec<_>, _>>()?;
        let zero_points = (0..channels)
            .map(|c| self.i32(zeros_at + c * 4, "quantization zero points"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Quantization {
            scales,
            zero_points,
            quantized_dimension,
        })
    }

    fn operator(&self, offset: usize) -> Result<OperatorDef, ModelError> {
        self.aligned(offset, "operator")?;
        self.slice(offset, OPERATOR_RECORD_SIZE, "operator")?;
        let opcode = BuiltinOperator(self.u16(offset, "operator")?);
        let version = u32::from(self.u16(offset + 2, "operator")?);
        let inputs_at = self.u32(offset + 4, "operator")? as usize;
        let outputs_at = self.u32(offset + 8, "operator")? as usize;
        let inputs = self.int_array(inputs_at, "operator inputs")?;
        let outputs = self.int_array(outputs_at, "operator outputs")?;
        let params = self.range(
            self.u32(offset + 12, "operator")? as usize,
            self.u32(offset + 16, "operator")? as usize,
            "operator params",
        )?;
        let custom = self.range(
            self.u32(offset + 20, "operator")? as usize,
            self.u32(offset + 24, "operator")? as usize,
            "operator custom data",
        )?;
        Ok(OperatorDef {
            opcode,
            version,
            inputs,
            outputs,
            params,
            custom,
        })
    }
}

fn check_indices(array: &IntArray, what: &'static str, count: usize) -> Result<(), ModelError> {
    for &index in &array.values {
        if index >= 0 && index as usize >= count {
            return Err(ModelError::TensorIndex { what, index, count });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ModelBuilder, OperatorSpec};

    fn tiny() -> ModelBuilder {
        let mut builder = ModelBuilder::new();
        let input = builder.add_tensor(TensorType::Float32, &[1, 4]);
        let weights = builder.add_constant(TensorType::Float32, &[4, 4], vec![0u8; 64]);
        let output = builder.add_tensor(TensorType::Float32, &[1, 4]);
        builder.set_inputs(&[input]);
        builder.set_outputs(&[output]);
        builder.add_operator(
            OperatorSpec::new(BuiltinOperator::FULLY_CONNECTED, 1, &[input, weights, -1], &[output])
                .params(vec![1, 0, 0, 0]),
        );
        builder
    }

    #[test]
    fn test_decode_round_trip() {
        let model = Model::from_bytes(tiny().build()).unwrap();
        let sg = model.subgraph();
        assert_eq!(model.version(), SCHEMA_VERSION);
        assert_eq!(sg.tensors.len(), 3);
        assert_eq!(sg.inputs.values, vec![0]);
        assert_eq!(sg.outputs.values, vec![2]);
        assert_eq!(sg.tensors[1].byte_size(), 64);
        assert_eq!(sg.tensors[0].shape.values, vec![1, 4]);

        let data = sg.tensors[1].data.unwrap();
        assert_eq!(data.offset % 16, 0);
        assert_eq!(model.blob(data).len(), 64);

        let op = &sg.operators[0];
        assert_eq!(op.opcode, BuiltinOperator::FULLY_CONNECTED);
        assert_eq!(op.inputs.values, vec![0, 1, -1]);
        assert_eq!(model.blob(op.params.unwrap()), &[1, 0, 0, 0]);
        assert!(op.custom.is_none());
    }

    #[test]
    fn test_int_arrays_are_stored_in_place() {
        let model = Model::from_bytes(tiny().build()).unwrap();
        let shape = &model.subgraph().tensors[1].shape;
        let at = shape.offset;
        assert_eq!(at % 4, 0);
        assert_eq!(&model.bytes()[at..at + 4], &2i32.to_le_bytes());
        assert_eq!(&model.bytes()[at + 4..at + 8], &4i32.to_le_bytes());
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut bytes = tiny().build();
        bytes[0] = b'X';
        assert_eq!(Model::from_bytes(bytes).unwrap_err(), ModelError::BadMagic);
        assert_eq!(Model::from_bytes(vec![1, 2]).unwrap_err(), ModelError::BadMagic);
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut builder = tiny();
        builder.schema_version(2);
        assert_eq!(
            Model::from_bytes(builder.build()).unwrap_err(),
            ModelError::UnsupportedVersion {
                found: 2,
                supported: SCHEMA_VERSION
            }
        );
    }

    #[test]
    fn test_rejects_multiple_subgraphs() {
        let mut builder = tiny();
        builder.subgraph_copies(2);
        assert_eq!(
            Model::from_bytes(builder.build()).unwrap_err(),
            ModelError::SubgraphCount(2)
        );
    }

    #[test]
    fn test_rejects_truncation() {
        let bytes = tiny().build();
        let cut = bytes[..bytes.len() - 10].to_vec();
        assert!(matches!(
            Model::from_bytes(cut).unwrap_err(),
            ModelError::Truncated { .. }
        ));
        assert!(matches!(
            Model::from_bytes(bytes[..10].to_vec()).unwrap_err(),
            ModelError::Truncated { .. }
        ));
    }

    #[test]
    fn test_rejects_dangling_tensor_index() {
        let mut builder = tiny();
        builder.set_outputs(&[9]);
        assert!(matches!(
            Model::from_bytes(builder.build()).unwrap_err(),
            ModelError::TensorIndex { index: 9, .. }
        ));
    }

    #[test]
    fn test_rejects_oversized_tensor() {
        let mut builder = tiny();
        builder.add_tensor(TensorType::Float32, &[i32::MAX, i32::MAX, i32::MAX]);
        assert_eq!(
            Model::from_bytes(builder.build()).unwrap_err(),
            ModelError::TensorTooLarge { tensor: 3 }
        );

        // Fits a host usize but not the target.
        let mut builder = tiny();
        builder.add_tensor(TensorType::Int8, &[65536, 65536]);
        assert_eq!(
            Model::from_bytes(builder.build()).unwrap_err(),
            ModelError::TensorTooLarge { tensor: 3 }
        );
    }

    #[test]
    fn test_quantization() {
        let mut builder = tiny();
        builder.set_quantization(1, vec![0.5, 0.25], vec![0, -3], 0);
        let model = Model::from_bytes(builder.build()).unwrap();
        let quant = model.subgraph().tensors[1].quantization.as_ref().unwrap();
        assert_eq!(quant.scales, vec![0.5, 0.25]);
        assert_eq!(quant.zero_points, vec![0, -3]);
        assert_eq!(quant.quantized_dimension, 0);
        assert!(model.subgraph().tensors[0].quantization.is_none());
    }
}
