//! Graph canonicalization: concrete input shapes, shape inference,
//! simplification.

use std::io::Cursor;

use tract_onnx::prelude::*;
use tracing::info;

use crate::{
    descriptor::{self, Dim, Dtype, GraphSummary, ModelDescriptor, TensorDescriptor},
    error::{PipelineError, Result},
    tensor::TensorValue,
};

/// A simplified graph with every input and output fact concrete.
///
/// The original model bytes are kept alongside the typed graph: backends
/// embed them in their artifacts to rebuild the exact same graph at load
/// time.
#[derive(Debug, Clone)]
pub struct CanonicalGraph {
    source: Vec<u8>,
    typed: TypedModel,
    descriptor: ModelDescriptor,
    summary: GraphSummary,
    input_shapes: Vec<Vec<usize>>,
    node_count: usize,
}

impl CanonicalGraph {
    /// Overwrite the declared input facts with concrete shapes, infer every
    /// intermediate fact and declutter the graph.
    pub fn new(source: Vec<u8>, input_shapes: &[Vec<usize>]) -> Result<Self> {
        let (declared, summary) = descriptor::inspect(&source)?;
        check_requested_shapes(&declared, input_shapes)?;

        let mut model = tract_onnx::onnx()
            .model_for_read(&mut Cursor::new(source.as_slice()))
            .map_err(|e| PipelineError::validation(format!("loading the graph: {e:#}")))?;
        for (ix, shape) in input_shapes.iter().enumerate() {
            let dt = declared.inputs()[ix].dtype().to_datum_type();
            model = model
                .with_input_fact(ix, InferenceFact::dt_shape(dt, shape.clone()))
                .map_err(|e| {
                    PipelineError::validation(format!("setting input {ix} fact: {e:#}"))
                })?;
        }
        let typed = model
            .into_typed()
            .map_err(|e| PipelineError::validation(format!("shape inference: {e:#}")))?;
        let typed = typed
            .into_decluttered()
            .map_err(|e| PipelineError::validation(format!("graph simplification: {e:#}")))?;

        let node_count = typed.nodes().len();
        info!(
            "canonicalized graph: {} -> {} nodes",
            summary.node_count, node_count
        );

        let descriptor = concrete_descriptor(&typed, &declared)?;
        Ok(Self {
            source,
            typed,
            descriptor,
            summary,
            input_shapes: input_shapes.to_vec(),
            node_count,
        })
    }

    /// Canonical I/O contract. Names follow the model's declarations, every
    /// shape is concrete.
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn summary(&self) -> &GraphSummary {
        &self.summary
    }

    pub fn source_bytes(&self) -> &[u8] {
        &self.source
    }

    pub fn input_shapes(&self) -> &[Vec<usize>] {
        &self.input_shapes
    }

    /// Node count after simplification.
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Build an optimized execution plan for the float graph.
    pub fn runnable(&self) -> Result<TypedRunnableModel<TypedModel>> {
        self.typed
            .clone()
            .into_optimized()
            .map_err(|e| PipelineError::validation(format!("graph optimization: {e:#}")))?
            .into_runnable()
            .map_err(|e| PipelineError::validation(format!("building the plan: {e:#}")))
    }
}

/// Execute a float plan over prepared f32 inputs, casting any non-f32
/// output down to f32 on the way out.
pub(crate) fn run_float_plan(
    plan: &TypedRunnableModel<TypedModel>,
    inputs: &[TensorValue],
) -> Result<Vec<TensorValue>> {
    let tensors = inputs
        .iter()
        .map(to_tract_tensor)
        .collect::<Result<TVec<TValue>>>()?;
    let outputs = plan
        .run(tensors)
        .map_err(|e| PipelineError::backend("inference", e))?;
    outputs.into_iter().map(from_tract_tensor).collect()
}

fn to_tract_tensor(value: &TensorValue) -> Result<TValue> {
    let data = value.as_f32().ok_or_else(|| {
        PipelineError::shape_mismatch("graph input", Dtype::F32, value.dtype())
    })?;
    let tensor = Tensor::from_shape(value.shape(), data)
        .map_err(|e| PipelineError::backend("inference", e))?;
    Ok(tensor.into())
}

fn from_tract_tensor(value: TValue) -> Result<TensorValue> {
    let tensor = value.into_tensor();
    let shape = tensor.shape().to_vec();
    let cast = tensor
        .cast_to::<f32>()
        .map_err(|e| PipelineError::backend("inference", e))?;
    let data = cast
        .as_slice::<f32>()
        .map_err(|e| PipelineError::backend("inference", e))?
        .to_vec();
    TensorValue::from_f32(shape, data)
}

/// The requested shapes must cover every runtime input and agree with the
/// extents the model pins down itself.
fn check_requested_shapes(declared: &ModelDescriptor, shapes: &[Vec<usize>]) -> Result<()> {
    if declared.inputs().len() != shapes.len() {
        return Err(PipelineError::config(format!(
            "model declares {} runtime inputs, {} shapes given",
            declared.inputs().len(),
            shapes.len()
        )));
    }
    for (input, shape) in declared.inputs().iter().zip(shapes) {
        let dims = input.shape();
        if dims.is_empty() {
            continue;
        }
        if dims.len() != shape.len() {
            return Err(PipelineError::config(format!(
                "input {} declares rank {}, shape {shape:?} has rank {}",
                input.name(),
                dims.len(),
                shape.len()
            )));
        }
        for (ix, dim) in dims.iter().enumerate() {
            if let Dim::Fixed(d) = dim {
                if *d != shape[ix] {
                    return Err(PipelineError::config(format!(
                        "input {} pins dim {ix} to {d}, shape requests {}",
                        input.name(),
                        shape[ix]
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Read the canonical facts back out of the typed graph, keeping declared
/// names. Everything must be concrete by now.
fn concrete_descriptor(typed: &TypedModel, declared: &ModelDescriptor) -> Result<ModelDescriptor> {
    let tract_err = |e: TractError| PipelineError::validation(format!("reading facts: {e:#}"));

    let input_outlets = typed.input_outlets().map_err(tract_err)?.to_vec();
    let output_outlets = typed.output_outlets().map_err(tract_err)?.to_vec();
    if input_outlets.len() != declared.inputs().len() {
        return Err(PipelineError::validation(format!(
            "graph keeps {} runtime inputs, model declares {}",
            input_outlets.len(),
            declared.inputs().len()
        )));
    }
    if output_outlets.len() != declared.outputs().len() {
        return Err(PipelineError::validation(format!(
            "graph keeps {} outputs, model declares {}",
            output_outlets.len(),
            declared.outputs().len()
        )));
    }

    let read = |outlets: &[OutletId], names: &[TensorDescriptor]| -> Result<Vec<TensorDescriptor>> {
        outlets
            .iter()
            .zip(names)
            .map(|(outlet, declared)| {
                let fact = typed.outlet_fact(*outlet).map_err(tract_err)?;
                let dtype = Dtype::from_datum_type(fact.datum_type)?;
                let shape = fact.shape.as_concrete().ok_or_else(|| {
                    PipelineError::validation(format!(
                        "{} stays symbolic after canonicalization",
                        declared.name()
                    ))
                })?;
                Ok(TensorDescriptor::new(
                    declared.name(),
                    dtype,
                    shape.iter().map(|&d| Dim::Fixed(d)).collect(),
                ))
            })
            .collect()
    };

    Ok(ModelDescriptor::new(
        read(&input_outlets, declared.inputs())?,
        read(&output_outlets, declared.outputs())?,
    ))
}
