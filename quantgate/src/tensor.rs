//! Concrete tensor payloads exchanged between pipeline stages.

use derive_more::From;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::Dtype,
    error::{PipelineError, Result},
};

/// Raw payload of a tensor, one variant per element type the pipeline
/// actually moves between stages.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
pub enum TensorData {
    U8(Vec<u8>),
    F32(Vec<f32>),
}

/// A dense tensor with its shape. The element count always equals the
/// product of the shape extents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    shape: Vec<usize>,
    data: TensorData,
}

impl TensorValue {
    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        Self::new(shape, data.into())
    }

    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::new(shape, data.into())
    }

    fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let expected: usize = shape.iter().product();
        let actual = match &data {
            TensorData::U8(v) => v.len(),
            TensorData::F32(v) => v.len(),
        };
        if expected != actual {
            return Err(PipelineError::shape_mismatch(
                "tensor payload",
                format!("{expected} elements"),
                format!("{actual} elements"),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn dtype(&self) -> Dtype {
        match self.data {
            TensorData::U8(_) => Dtype::U8,
            TensorData::F32(_) => Dtype::F32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_u8(&self) -> Option<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Some(v),
            TensorData::F32(_) => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            TensorData::U8(_) => None,
        }
    }

    /// Widen the payload to f32, losslessly for u8 data.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::U8(v) => v.iter().map(|&b| b as f32).collect(),
            TensorData::F32(v) => v.clone(),
        }
    }

    /// Observed (min, max) of the payload, `None` for empty tensors.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        let mut it = self.to_f32_vec().into_iter();
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }

    /// Shape rendered as `1x3x320x320`.
    pub fn shape_string(&self) -> String {
        self.shape.iter().join("x")
    }
}

/// A tensor tagged with the name of the graph value that declared it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub value: TensorValue,
}

impl NamedTensor {
    pub fn new(name: impl Into<String>, value: TensorValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Ordered outputs of one inference, simulated or reference. The order is
/// the order the model declares its outputs in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    outputs: Vec<NamedTensor>,
}

impl InferenceResult {
    pub fn new(outputs: Vec<NamedTensor>) -> Self {
        Self { outputs }
    }

    pub fn outputs(&self) -> &[NamedTensor] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&NamedTensor> {
        self.outputs.get(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn payload_length_must_match_shape() {
        assert!(TensorValue::from_f32(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = TensorValue::from_f32(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn u8_widens_losslessly() {
        let t = TensorValue::from_u8(vec![4], vec![0, 1, 128, 255]).unwrap();
        assert_eq!(t.to_f32_vec(), vec![0.0, 1.0, 128.0, 255.0]);
        assert_eq!(t.dtype(), Dtype::U8);
    }

    #[test]
    fn value_range_spans_the_payload() {
        let t = TensorValue::from_f32(vec![3], vec![-1.5, 0.0, 2.5]).unwrap();
        assert_eq!(t.value_range(), Some((-1.5, 2.5)));
    }

    #[test]
    fn shape_renders_with_x_separator() {
        let t = TensorValue::from_f32(vec![1, 3, 2, 2], vec![0.0; 12]).unwrap();
        assert_eq!(t.shape_string(), "1x3x2x2");
    }
}
