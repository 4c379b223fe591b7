//! Static model metadata parsed from the ONNX protobuf.
//!
//! The descriptor is the pipeline's source of truth for input/output names,
//! dtypes and declared shapes. Output order here drives the positional
//! pairing done by the cross-validator, so it is preserved everywhere.

use std::collections::HashSet;

use derive_more::{Display, From};
use itertools::Itertools;
use prost_tract_compat::Message;
use serde::{Deserialize, Serialize};
use tract_onnx::{pb, prelude::DatumType};

use crate::error::{PipelineError, Result};

/// Element types a graph value can declare.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    #[display("u8")]
    U8,
    #[display("i8")]
    I8,
    #[display("i32")]
    I32,
    #[display("i64")]
    I64,
    #[display("f32")]
    F32,
    #[display("f64")]
    F64,
}

impl Dtype {
    fn from_onnx(elem_type: i32) -> Result<Self> {
        use pb::tensor_proto::DataType;
        match DataType::from_i32(elem_type) {
            Some(DataType::Uint8) => Ok(Self::U8),
            Some(DataType::Int8) => Ok(Self::I8),
            Some(DataType::Int32) => Ok(Self::I32),
            Some(DataType::Int64) => Ok(Self::I64),
            Some(DataType::Float) => Ok(Self::F32),
            Some(DataType::Double) => Ok(Self::F64),
            _ => Err(PipelineError::validation(format!(
                "unsupported tensor element type {elem_type}"
            ))),
        }
    }

    pub(crate) fn to_datum_type(self) -> DatumType {
        match self {
            Self::U8 => DatumType::U8,
            Self::I8 => DatumType::I8,
            Self::I32 => DatumType::I32,
            Self::I64 => DatumType::I64,
            Self::F32 => DatumType::F32,
            Self::F64 => DatumType::F64,
        }
    }

    pub(crate) fn from_datum_type(dt: DatumType) -> Result<Self> {
        match dt {
            DatumType::U8 => Ok(Self::U8),
            DatumType::I8 => Ok(Self::I8),
            DatumType::I32 => Ok(Self::I32),
            DatumType::I64 => Ok(Self::I64),
            DatumType::F32 => Ok(Self::F32),
            DatumType::F64 => Ok(Self::F64),
            other => Err(PipelineError::validation(format!(
                "unsupported element type {other:?}"
            ))),
        }
    }
}

/// One extent of a declared shape. Unknown extents stay symbolic
/// placeholders, they are never collapsed to zero.
#[derive(Debug, Display, Clone, PartialEq, Eq, From, Serialize, Deserialize)]
pub enum Dim {
    #[display("{_0}")]
    Fixed(usize),
    #[display("{_0}")]
    Symbolic(String),
}

impl Dim {
    pub fn as_fixed(&self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Symbolic(_) => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(_))
    }
}

/// Declared name, dtype and shape of one graph input or output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    name: String,
    dtype: Dtype,
    shape: Vec<Dim>,
}

impl TensorDescriptor {
    pub fn new(name: impl Into<String>, dtype: Dtype, shape: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[Dim] {
        &self.shape
    }

    /// The shape as concrete extents, `None` while any dim is symbolic.
    pub fn concrete_shape(&self) -> Option<Vec<usize>> {
        self.shape.iter().map(Dim::as_fixed).collect()
    }

    /// Shape rendered as `1x3x320x320`, symbolic dims by their name.
    pub fn shape_string(&self) -> String {
        self.shape.iter().join("x")
    }

    fn from_value_info(vi: &pb::ValueInfoProto) -> Result<Self> {
        let ty = vi.r#type.as_ref().ok_or_else(|| {
            PipelineError::validation(format!("graph value {} declares no type", vi.name))
        })?;
        let Some(pb::type_proto::Value::TensorType(tensor)) = &ty.value else {
            return Err(PipelineError::validation(format!(
                "graph value {} is not tensor-typed",
                vi.name
            )));
        };
        let dtype = Dtype::from_onnx(tensor.elem_type)?;
        let dims = tensor.shape.as_ref().map(|s| s.dim.as_slice()).unwrap_or(&[]);
        let shape = dims
            .iter()
            .enumerate()
            .map(|(ix, d)| match &d.value {
                Some(pb::tensor_shape_proto::dimension::Value::DimValue(v)) if *v > 0 => {
                    Dim::Fixed(*v as usize)
                }
                Some(pb::tensor_shape_proto::dimension::Value::DimParam(p)) => {
                    Dim::Symbolic(p.clone())
                }
                // Zero or negative extents are another way of spelling
                // "unknown" in the wild.
                _ => Dim::Symbolic(format!("dim{ix}")),
            })
            .collect();
        Ok(Self {
            name: vi.name.clone(),
            dtype,
            shape,
        })
    }
}

/// Ordered input/output contract of a model.
///
/// Inputs backed by an initializer of the same name are weights in disguise
/// and are excluded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
}

impl ModelDescriptor {
    pub fn new(inputs: Vec<TensorDescriptor>, outputs: Vec<TensorDescriptor>) -> Self {
        Self { inputs, outputs }
    }

    pub fn from_onnx_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_proto(&decode_model(bytes)?)
    }

    pub(crate) fn from_proto(proto: &pb::ModelProto) -> Result<Self> {
        let graph = proto
            .graph
            .as_ref()
            .ok_or_else(|| PipelineError::validation("model carries no graph"))?;
        let weights: HashSet<&str> = graph
            .initializer
            .iter()
            .map(|t| t.name.as_str())
            .collect();
        let inputs = graph
            .input
            .iter()
            .filter(|vi| !weights.contains(vi.name.as_str()))
            .map(TensorDescriptor::from_value_info)
            .collect::<Result<Vec<_>>>()?;
        let outputs = graph
            .output
            .iter()
            .map(TensorDescriptor::from_value_info)
            .collect::<Result<Vec<_>>>()?;
        if inputs.is_empty() {
            return Err(PipelineError::validation(
                "model declares no runtime inputs",
            ));
        }
        if outputs.is_empty() {
            return Err(PipelineError::validation("model declares no outputs"));
        }
        Ok(Self { inputs, outputs })
    }

    pub fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    pub fn input(&self, ix: usize) -> Option<&TensorDescriptor> {
        self.inputs.get(ix)
    }

    pub(crate) fn set_input_dtype(&mut self, ix: usize, dtype: Dtype) {
        if let Some(input) = self.inputs.get_mut(ix) {
            input.dtype = dtype;
        }
    }
}

/// Graph-level metadata reported by the inspect stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSummary {
    pub ir_version: i64,
    pub opset: i64,
    pub producer: String,
    pub node_count: usize,
}

impl GraphSummary {
    pub(crate) fn from_proto(proto: &pb::ModelProto) -> Self {
        // Prefer the default-domain opset, models usually carry exactly one.
        let opset = proto
            .opset_import
            .iter()
            .find(|o| o.domain.is_empty())
            .or_else(|| proto.opset_import.first())
            .map(|o| o.version)
            .unwrap_or(0);
        let producer = format!("{} {}", proto.producer_name, proto.producer_version)
            .trim()
            .to_string();
        Self {
            ir_version: proto.ir_version,
            opset,
            producer,
            node_count: proto.graph.as_ref().map(|g| g.node.len()).unwrap_or(0),
        }
    }
}

pub(crate) fn decode_model(bytes: &[u8]) -> Result<pb::ModelProto> {
    pb::ModelProto::decode(bytes)
        .map_err(|e| PipelineError::validation(format!("decoding ModelProto: {e}")))
}

/// Parse the I/O contract and the graph summary in one decode pass.
pub fn inspect(bytes: &[u8]) -> Result<(ModelDescriptor, GraphSummary)> {
    let proto = decode_model(bytes)?;
    let descriptor = ModelDescriptor::from_proto(&proto)?;
    let summary = GraphSummary::from_proto(&proto);
    Ok((descriptor, summary))
}
