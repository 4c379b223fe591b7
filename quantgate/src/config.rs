//! Caller-facing configuration of the compile stage.
//!
//! Everything that changes artifact accuracy is explicit here; there are no
//! environment lookups and no hidden defaults.

use clap::ValueEnum;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    error::{PipelineError, Result},
    preprocess::{Layout, PreprocessSpec},
};

/// How activation ranges observed during calibration are turned into
/// quantization parameters.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum CalibrateMethod {
    /// Plain observed min/max.
    #[display("min-max")]
    MinMax,
    /// Clip both tails at the 99.99th percentile before deriving the range.
    #[display("percentile")]
    Percentile,
    /// TensorRT-style KL-divergence threshold search.
    #[display("kld")]
    Kld,
}

/// Weight fine-tuning requested from the backend. Backends may reject
/// policies they do not implement.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum FineTunePolicy {
    #[display("none")]
    NoFineTune,
    #[display("squant")]
    Squant,
    #[display("adaround")]
    AdaRound,
}

/// Quantization knobs handed to the compiler backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantConfig {
    pub activation_bits: u32,
    pub weight_bits: u32,
    pub method: CalibrateMethod,
    pub finetune: FineTunePolicy,
    /// Declared number of calibration samples. Must equal the dataset
    /// length handed to the compiler.
    pub samples_count: usize,
}

impl QuantConfig {
    pub fn validate(&self) -> Result<()> {
        for (what, bits) in [
            ("activation", self.activation_bits),
            ("weight", self.weight_bits),
        ] {
            if !matches!(bits, 8 | 16) {
                return Err(PipelineError::config(format!(
                    "{what} bit-width {bits} is not supported (8 or 16)"
                )));
            }
        }
        if self.samples_count == 0 {
            return Err(PipelineError::config(
                "samples_count must be at least one",
            ));
        }
        Ok(())
    }
}

/// Target and input contract of one compile invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Backend identifier the artifact is compiled for.
    pub target: String,
    /// Concrete shape for every runtime input, in declared order.
    pub input_shapes: Vec<Vec<usize>>,
    /// Normalization baked into the artifact boundary, if any.
    pub preprocess: Option<PreprocessSpec>,
    /// Layout the artifact reports its outputs in.
    pub output_layout: Layout,
}

impl CompileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target.is_empty() {
            return Err(PipelineError::config("target id is empty"));
        }
        if self.input_shapes.is_empty() {
            return Err(PipelineError::config("no input shapes given"));
        }
        for (ix, shape) in self.input_shapes.iter().enumerate() {
            if shape.is_empty() || shape.iter().any(|&d| d == 0) {
                return Err(PipelineError::config(format!(
                    "input {ix} shape {shape:?} is not concrete"
                )));
            }
        }
        if let Some(preprocess) = &self.preprocess {
            if self.input_shapes.len() != 1 {
                return Err(PipelineError::config(
                    "preprocessing baking requires a single-input model",
                ));
            }
            let (channels, _, _) = preprocess.layout.chw(&self.input_shapes[0])?;
            preprocess.validate(channels)?;
        }
        Ok(())
    }
}
