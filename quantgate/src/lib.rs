//! Quantize, compile and cross-validate ONNX vision models for NPU-style
//! targets.
//!
//! The pipeline has four stages:
//!
//! 1. inspect: read a model's I/O contract without touching the graph,
//! 2. compile: canonicalize the graph, calibrate it over a sample set and
//!    seal a quantized artifact for one target,
//! 3. simulate: execute the artifact on the host and dump its outputs,
//! 4. compare: score simulated outputs against the float reference with
//!    cosine similarity and classify the drift.
//!
//! Backends plug in through the [`compile::QuantizingCompiler`] and
//! [`simulate::ArtifactSimulator`] traits. The built-in
//! [`backend::QdqBackend`] rounds activations through the calibrated
//! quantization grid at the output boundary.

pub mod backend;
pub mod calibration;
pub(crate) mod codec;
pub mod compare;
pub mod compile;
pub mod config;
pub mod descriptor;
pub mod dump;
pub mod error;
pub mod graph;
pub mod preprocess;
pub mod reference;
pub mod simulate;
pub mod tensor;
pub mod testing;

pub use backend::QdqBackend;
pub use calibration::{CalibrationDataset, CalibrationSource, InputContract};
pub use compare::{compare_outputs, compare_results, ComparisonReport};
pub use compile::{compile_model, CompiledArtifact, QuantizingCompiler};
pub use config::{CalibrateMethod, CompileConfig, FineTunePolicy, QuantConfig};
pub use descriptor::{inspect, GraphSummary, ModelDescriptor, TensorDescriptor};
pub use error::{PipelineError, Result};
pub use graph::CanonicalGraph;
pub use preprocess::{Layout, PreprocessSpec};
pub use reference::ReferenceExecutor;
pub use simulate::{ArtifactSimulator, LoadedArtifact};
pub use tensor::{InferenceResult, NamedTensor, TensorValue};
