//! Compile-stage orchestration and the artifact envelope.
//!
//! The envelope is pipeline-owned metadata wrapped around an opaque backend
//! blob: the concrete I/O contract, the baked preprocessing and the
//! quantization knobs used. Later stages read contract data from here
//! instead of asking the caller again.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    calibration::{CalibrationDataset, InputContract},
    codec,
    config::{CompileConfig, QuantConfig},
    descriptor::{Dtype, ModelDescriptor},
    error::{PipelineError, Result},
    graph::CanonicalGraph,
    preprocess::{Layout, PreprocessSpec},
};

const ARTIFACT_MAGIC: &[u8; 8] = b"QGARTFC1";

/// A compiled artifact: pipeline envelope plus backend blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledArtifact {
    /// Backend the blob was compiled for.
    pub target: String,
    /// Concrete I/O contract at the artifact boundary. With baked
    /// preprocessing the input dtype here is the raw one (u8), not the
    /// float dtype the source graph declares.
    pub io: ModelDescriptor,
    /// Normalization baked into the artifact, if any.
    pub preprocess: Option<PreprocessSpec>,
    /// Quantization knobs the blob was built with.
    pub quant: QuantConfig,
    /// Opaque backend payload.
    pub bytes: Vec<u8>,
}

impl CompiledArtifact {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode_framed(ARTIFACT_MAGIC, self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        codec::decode_framed(ARTIFACT_MAGIC, "artifact envelope", bytes)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, &bytes).map_err(PipelineError::io(path))?;
        info!(
            "artifact written to {} ({:.1} KiB)",
            path.display(),
            bytes.len() as f64 / 1024.0
        );
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::missing(path.display().to_string()));
        }
        let bytes = std::fs::read(path).map_err(PipelineError::io(path))?;
        Self::from_bytes(&bytes)
    }

    /// The raw-input contract a caller must satisfy to feed this artifact.
    pub fn input_contract(&self) -> Result<InputContract> {
        let input = self
            .io
            .input(0)
            .ok_or_else(|| PipelineError::validation("artifact declares no input"))?;
        let shape = input.concrete_shape().ok_or_else(|| {
            PipelineError::validation(format!("artifact input {} is not concrete", input.name()))
        })?;
        Ok(match &self.preprocess {
            Some(p) => InputContract {
                shape,
                dtype: p.input_dtype,
                layout: p.layout,
                range: p.input_range,
            },
            None => InputContract {
                shape,
                dtype: input.dtype(),
                layout: Layout::Nchw,
                range: default_range(input.dtype()),
            },
        })
    }
}

/// A backend that turns a canonical float graph into a quantized artifact.
pub trait QuantizingCompiler {
    /// Stable identifier recorded in the artifacts this backend produces.
    fn target(&self) -> &str;

    /// Produce the artifact. Implementations may assume the orchestrator
    /// has validated configs and dataset against the input contract.
    fn compile(
        &self,
        graph: &CanonicalGraph,
        compile: &CompileConfig,
        quant: &QuantConfig,
        dataset: &CalibrationDataset,
    ) -> Result<CompiledArtifact>;
}

/// The raw-input contract of a compile invocation: shape from the config,
/// dtype/layout/range from the preprocessing spec when one is baked,
/// otherwise the graph's own input dtype over a default range.
pub fn input_contract(compile: &CompileConfig, graph: &CanonicalGraph) -> Result<InputContract> {
    let shape = compile
        .input_shapes
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::config("no input shapes given"))?;
    Ok(match &compile.preprocess {
        Some(p) => InputContract {
            shape,
            dtype: p.input_dtype,
            layout: p.layout,
            range: p.input_range,
        },
        None => {
            let dtype = graph
                .descriptor()
                .input(0)
                .map(|i| i.dtype())
                .unwrap_or(Dtype::F32);
            InputContract {
                shape,
                dtype,
                layout: Layout::Nchw,
                range: default_range(dtype),
            }
        }
    })
}

fn default_range(dtype: Dtype) -> (f32, f32) {
    match dtype {
        Dtype::U8 => (0.0, 255.0),
        _ => (0.0, 1.0),
    }
}

/// Run every pre-flight check, hand the dataset to the backend and return
/// the sealed artifact. Backend failures abort the run; nothing is retried
/// and no partial artifact escapes.
pub fn compile_model(
    backend: &dyn QuantizingCompiler,
    graph: &CanonicalGraph,
    compile: &CompileConfig,
    quant: &QuantConfig,
    dataset: &CalibrationDataset,
) -> Result<CompiledArtifact> {
    compile.validate()?;
    quant.validate()?;
    if compile.target != backend.target() {
        return Err(PipelineError::config(format!(
            "config targets {}, backend provides {}",
            compile.target,
            backend.target()
        )));
    }
    if compile.input_shapes.as_slice() != graph.input_shapes() {
        return Err(PipelineError::config(
            "config input shapes differ from the canonicalized ones",
        ));
    }
    if quant.samples_count != dataset.len() {
        return Err(PipelineError::config(format!(
            "samples_count declares {}, dataset holds {}",
            quant.samples_count,
            dataset.len()
        )));
    }
    let contract = input_contract(compile, graph)?;
    dataset.validate(&contract)?;

    info!(
        "compiling for target {} with {} calibration samples ({})",
        compile.target,
        dataset.len(),
        dataset.origin()
    );
    let artifact = backend.compile(graph, compile, quant, dataset)?;
    info!("backend blob: {} bytes", artifact.bytes.len());
    Ok(artifact)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        calibration::CalibrationSource,
        config::{CalibrateMethod, FineTunePolicy},
        testing,
    };
    use rand::{SeedableRng, rngs::StdRng};

    /// Backend stub that records nothing and returns an empty blob.
    struct NullBackend;

    impl QuantizingCompiler for NullBackend {
        fn target(&self) -> &str {
            "null"
        }

        fn compile(
            &self,
            graph: &CanonicalGraph,
            compile: &CompileConfig,
            quant: &QuantConfig,
            _dataset: &CalibrationDataset,
        ) -> Result<CompiledArtifact> {
            Ok(CompiledArtifact {
                target: compile.target.clone(),
                io: graph.descriptor().clone(),
                preprocess: compile.preprocess.clone(),
                quant: quant.clone(),
                bytes: vec![],
            })
        }
    }

    fn setup() -> (CanonicalGraph, CompileConfig, QuantConfig, CalibrationDataset) {
        let graph =
            CanonicalGraph::new(testing::two_output_model(4, 4), &[vec![1, 3, 4, 4]]).unwrap();
        let compile = CompileConfig {
            target: "null".into(),
            input_shapes: vec![vec![1, 3, 4, 4]],
            preprocess: None,
            output_layout: Layout::Nchw,
        };
        let quant = QuantConfig {
            activation_bits: 8,
            weight_bits: 8,
            method: CalibrateMethod::MinMax,
            finetune: FineTunePolicy::NoFineTune,
            samples_count: 2,
        };
        let contract = input_contract(&compile, &graph).unwrap();
        let dataset = CalibrationDataset::build(
            &CalibrationSource::Synthetic { count: 2 },
            &contract,
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap();
        (graph, compile, quant, dataset)
    }

    #[test]
    fn orchestration_accepts_a_consistent_setup() {
        let (graph, compile, quant, dataset) = setup();
        let artifact = compile_model(&NullBackend, &graph, &compile, &quant, &dataset).unwrap();
        assert_eq!(artifact.target, "null");
        assert_eq!(artifact.io.outputs().len(), 2);
    }

    #[test]
    fn samples_count_must_equal_dataset_length() {
        let (graph, compile, mut quant, dataset) = setup();
        quant.samples_count = 5;
        let err = compile_model(&NullBackend, &graph, &compile, &quant, &dataset).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn target_mismatch_is_rejected_before_the_backend_runs() {
        let (graph, mut compile, quant, dataset) = setup();
        compile.target = "vendor-npu".into();
        let err = compile_model(&NullBackend, &graph, &compile, &quant, &dataset).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn envelope_round_trips_through_files() {
        let (graph, compile, quant, dataset) = setup();
        let artifact = compile_model(&NullBackend, &graph, &compile, &quant, &dataset).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.qga");
        artifact.write(&path).unwrap();
        let back = CompiledArtifact::read(&path).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn reading_a_missing_artifact_says_so() {
        let err = CompiledArtifact::read(Path::new("/nonexistent/model.qga")).unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact(_)));
    }

    #[test]
    fn garbage_artifact_bytes_are_rejected() {
        let err = CompiledArtifact::from_bytes(&[0u8; 32]).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
