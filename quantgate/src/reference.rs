//! Float reference execution over the canonical graph.
//!
//! The reference shares the artifact's graph, preprocessing and input
//! tensors but skips quantization entirely. Its outputs are the ground
//! truth the simulated artifact is scored against.

use tract_onnx::prelude::{TypedModel, TypedRunnableModel};

use crate::{
    descriptor::TensorDescriptor,
    error::{PipelineError, Result},
    graph::{self, CanonicalGraph},
    preprocess::PreprocessSpec,
    tensor::{InferenceResult, NamedTensor, TensorValue},
};

pub struct ReferenceExecutor {
    plan: TypedRunnableModel<TypedModel>,
    outputs: Vec<TensorDescriptor>,
}

impl ReferenceExecutor {
    /// Plan the float graph once. The executor can then serve any number
    /// of inferences.
    pub fn new(graph: &CanonicalGraph) -> Result<Self> {
        Ok(Self {
            plan: graph.runnable()?,
            outputs: graph.descriptor().outputs().to_vec(),
        })
    }

    pub fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    /// Run the float graph. When a preprocessing spec is given, input 0 is
    /// normalized exactly the way a baking backend would, so reference and
    /// artifact see identical graph inputs.
    pub fn infer(
        &self,
        inputs: &[TensorValue],
        preprocess: Option<&PreprocessSpec>,
    ) -> Result<InferenceResult> {
        let prepared: Vec<TensorValue> = inputs
            .iter()
            .enumerate()
            .map(|(ix, input)| match preprocess {
                Some(p) if ix == 0 => p.replicate(input),
                _ => Ok(input.clone()),
            })
            .collect::<Result<_>>()?;
        let raw = graph::run_float_plan(&self.plan, &prepared)?;
        if raw.len() != self.outputs.len() {
            return Err(PipelineError::backend(
                "reference",
                anyhow::anyhow!(
                    "plan produced {} outputs, graph declares {}",
                    raw.len(),
                    self.outputs.len()
                ),
            ));
        }
        Ok(InferenceResult::new(
            raw.into_iter()
                .zip(&self.outputs)
                .map(|(value, desc)| NamedTensor::new(desc.name(), value))
                .collect(),
        ))
    }
}
