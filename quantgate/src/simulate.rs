//! Artifact simulation seam.

use crate::{
    compile::CompiledArtifact,
    descriptor::{Dim, TensorDescriptor},
    error::{PipelineError, Result},
    tensor::{InferenceResult, TensorValue},
};

/// A backend able to execute artifacts of its target on the host.
pub trait ArtifactSimulator {
    /// Target id this simulator accepts.
    fn target(&self) -> &str;

    /// Deserialize the artifact blob and prepare it for execution. Fails
    /// with a validation error on foreign or corrupted blobs.
    fn load(&self, artifact: &CompiledArtifact) -> Result<Box<dyn LoadedArtifact>>;
}

/// One loaded artifact, ready to run any number of times.
pub trait LoadedArtifact: std::fmt::Debug {
    /// Contract of every runtime input, in declared order.
    fn inputs(&self) -> &[TensorDescriptor];

    /// Contract of every output, in declared order.
    fn outputs(&self) -> &[TensorDescriptor];

    /// Run one inference. Inputs must match the declared contracts
    /// exactly. Outputs come back in declared order, one per declared
    /// output, and repeated runs of the same input are bit-identical.
    fn run(&self, inputs: &[TensorValue]) -> Result<InferenceResult>;
}

/// Gate keeping every simulator honest: supplied tensors must match the
/// declared contracts one for one.
pub fn validate_inputs(declared: &[TensorDescriptor], inputs: &[TensorValue]) -> Result<()> {
    if declared.len() != inputs.len() {
        return Err(PipelineError::shape_mismatch(
            "input count",
            declared.len(),
            inputs.len(),
        ));
    }
    for (desc, input) in declared.iter().zip(inputs) {
        if desc.dtype() != input.dtype() {
            return Err(PipelineError::shape_mismatch(
                format!("input {} dtype", desc.name()),
                desc.dtype(),
                input.dtype(),
            ));
        }
        let declared_shape: Vec<Dim> = input.shape().iter().map(|&d| Dim::Fixed(d)).collect();
        if desc.shape() != declared_shape.as_slice() {
            return Err(PipelineError::shape_mismatch(
                format!("input {}", desc.name()),
                desc.shape_string(),
                input.shape_string(),
            ));
        }
    }
    Ok(())
}
