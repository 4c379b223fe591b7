//! The built-in `qdq-sim` backend.
//!
//! Compilation runs the float graph over every calibration sample,
//! histograms each declared output and derives affine parameters with the
//! configured method. The blob keeps the source graph plus those
//! parameters; simulation replays the float graph and applies a
//! quantize-dequantize round trip at the output boundary. Weights stay in
//! float, so the artifact measures activation quantization error in
//! isolation.

mod artifact;
mod observer;
mod simulator;

pub use observer::AffineParams;

use tracing::info;

use crate::{
    calibration::CalibrationDataset,
    compile::{CompiledArtifact, QuantizingCompiler},
    config::{CompileConfig, FineTunePolicy, QuantConfig},
    error::{PipelineError, Result},
    graph::{self, CanonicalGraph},
    preprocess::PreprocessSpec,
    simulate::{ArtifactSimulator, LoadedArtifact},
    tensor::TensorValue,
};

use artifact::{OutputQuant, QdqImage, FORMAT_VERSION};
use observer::ActivationObserver;
use simulator::LoadedQdq;

/// Compiler and simulator for the `qdq-sim` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct QdqBackend;

impl QdqBackend {
    pub const TARGET: &'static str = "qdq-sim";
}

impl QuantizingCompiler for QdqBackend {
    fn target(&self) -> &str {
        Self::TARGET
    }

    fn compile(
        &self,
        graph: &CanonicalGraph,
        compile: &CompileConfig,
        quant: &QuantConfig,
        dataset: &CalibrationDataset,
    ) -> Result<CompiledArtifact> {
        if quant.finetune != FineTunePolicy::NoFineTune {
            return Err(PipelineError::config(format!(
                "target {} does not implement {} fine-tuning",
                Self::TARGET,
                quant.finetune
            )));
        }
        if graph.descriptor().inputs().len() != 1 {
            return Err(PipelineError::config(format!(
                "target {} calibrates single-input graphs, this one declares {}",
                Self::TARGET,
                graph.descriptor().inputs().len()
            )));
        }

        let plan = graph.runnable()?;
        let mut observers: Vec<ActivationObserver> = graph
            .descriptor()
            .outputs()
            .iter()
            .map(|o| ActivationObserver::new(o.name()))
            .collect();

        for sample in dataset.samples() {
            let prepared = prepare_input(compile.preprocess.as_ref(), sample)?;
            let raw = graph::run_float_plan(&plan, &[prepared])?;
            if raw.len() != observers.len() {
                return Err(PipelineError::backend(
                    "calibrate",
                    anyhow::anyhow!(
                        "plan produced {} outputs, graph declares {}",
                        raw.len(),
                        observers.len()
                    ),
                ));
            }
            for (observer, value) in observers.iter_mut().zip(&raw) {
                observer.record(&value.to_f32_vec())?;
            }
        }

        let mut outputs = Vec::with_capacity(observers.len());
        for observer in &observers {
            let params = observer.params(quant.method, quant.activation_bits)?;
            if let Some((lo, hi)) = observer.observed_range() {
                info!(
                    "calibrated {}: observed [{lo:.4}, {hi:.4}], scale {:.6}, zero point {}",
                    observer.name(),
                    params.scale,
                    params.zero_point
                );
            }
            outputs.push(OutputQuant {
                name: observer.name().to_string(),
                params,
            });
        }

        let image = QdqImage {
            version: FORMAT_VERSION,
            target: Self::TARGET.into(),
            model: graph.source_bytes().to_vec(),
            input_shapes: graph.input_shapes().to_vec(),
            preprocess: compile.preprocess.clone(),
            activation_bits: quant.activation_bits,
            weight_bits: quant.weight_bits,
            method: quant.method,
            outputs,
        };

        let mut io = graph.descriptor().clone();
        if let Some(p) = &compile.preprocess {
            io.set_input_dtype(0, p.input_dtype);
        }
        Ok(CompiledArtifact {
            target: Self::TARGET.into(),
            io,
            preprocess: compile.preprocess.clone(),
            quant: quant.clone(),
            bytes: image.encode()?,
        })
    }
}

impl ArtifactSimulator for QdqBackend {
    fn target(&self) -> &str {
        Self::TARGET
    }

    fn load(&self, artifact: &CompiledArtifact) -> Result<Box<dyn LoadedArtifact>> {
        if artifact.target != Self::TARGET {
            return Err(PipelineError::validation(format!(
                "artifact targets {}, this simulator handles {}",
                artifact.target,
                Self::TARGET
            )));
        }
        let image = QdqImage::decode(&artifact.bytes)?;
        Ok(Box::new(LoadedQdq::from_image(image)?))
    }
}

fn prepare_input(preprocess: Option<&PreprocessSpec>, sample: &TensorValue) -> Result<TensorValue> {
    match preprocess {
        Some(p) => p.replicate(sample),
        None => Ok(sample.clone()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        calibration::CalibrationSource,
        compile::{self, compile_model},
        config::CalibrateMethod,
        descriptor::Dtype,
        preprocess::Layout,
        testing,
    };
    use rand::{rngs::StdRng, SeedableRng};

    fn configs(preprocess: Option<PreprocessSpec>) -> (CompileConfig, QuantConfig) {
        let compile = CompileConfig {
            target: QdqBackend::TARGET.into(),
            input_shapes: vec![vec![1, 3, 4, 4]],
            preprocess,
            output_layout: Layout::Nchw,
        };
        let quant = QuantConfig {
            activation_bits: 8,
            weight_bits: 8,
            method: CalibrateMethod::MinMax,
            finetune: FineTunePolicy::NoFineTune,
            samples_count: 3,
        };
        (compile, quant)
    }

    fn compiled(preprocess: Option<PreprocessSpec>) -> CompiledArtifact {
        let graph =
            CanonicalGraph::new(testing::two_output_model(4, 4), &[vec![1, 3, 4, 4]]).unwrap();
        let (compile, quant) = configs(preprocess);
        let contract = compile::input_contract(&compile, &graph).unwrap();
        let dataset = CalibrationDataset::build(
            &CalibrationSource::Synthetic { count: 3 },
            &contract,
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap();
        compile_model(&QdqBackend, &graph, &compile, &quant, &dataset).unwrap()
    }

    #[test]
    fn compile_then_simulate_round_trips() {
        let artifact = compiled(None);
        assert_eq!(artifact.target, "qdq-sim");
        let names: Vec<_> = artifact.io.outputs().iter().map(|o| o.name()).collect();
        assert_eq!(names, ["act", "neg"]);

        let loaded = QdqBackend.load(&artifact).unwrap();
        let input = TensorValue::from_f32(vec![1, 3, 4, 4], vec![0.25; 48]).unwrap();
        let result = loaded.run(&[input]).unwrap();
        assert_eq!(result.len(), 2);

        // Synthetic samples span [0, 1], so 0.25 sits well inside the
        // calibrated range and survives the boundary round trip.
        let act = result.outputs()[0].value.to_f32_vec();
        assert!(act.iter().all(|v| (v - 0.25).abs() < 0.05), "{act:?}");
    }

    #[test]
    fn baked_preprocessing_lands_in_the_envelope() {
        let spec = PreprocessSpec {
            input_dtype: Dtype::U8,
            input_range: (0.0, 255.0),
            mean: vec![104.0, 117.0, 123.0],
            std: vec![1.0, 1.0, 1.0],
            layout: Layout::Nchw,
        };
        let artifact = compiled(Some(spec));
        assert_eq!(artifact.io.inputs()[0].dtype(), Dtype::U8);

        let contract = artifact.input_contract().unwrap();
        assert_eq!(contract.dtype, Dtype::U8);
        assert_eq!(contract.range, (0.0, 255.0));

        let loaded = QdqBackend.load(&artifact).unwrap();
        let raw = TensorValue::from_u8(vec![1, 3, 4, 4], vec![130; 48]).unwrap();
        loaded.run(&[raw]).unwrap();
    }

    #[test]
    fn fine_tuning_policies_are_refused() {
        let graph =
            CanonicalGraph::new(testing::two_output_model(4, 4), &[vec![1, 3, 4, 4]]).unwrap();
        let (compile, mut quant) = configs(None);
        quant.finetune = FineTunePolicy::Squant;
        let contract = compile::input_contract(&compile, &graph).unwrap();
        let dataset = CalibrationDataset::build(
            &CalibrationSource::Synthetic { count: 3 },
            &contract,
            &mut StdRng::seed_from_u64(11),
        )
        .unwrap();
        let err = compile_model(&QdqBackend, &graph, &compile, &quant, &dataset).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn foreign_targets_are_refused_at_load() {
        let mut artifact = compiled(None);
        artifact.target = "npu-v2".into();
        let err = QdqBackend.load(&artifact).unwrap_err();
        assert!(err.to_string().contains("npu-v2"));
    }

    #[test]
    fn percentile_and_kld_methods_produce_runnable_artifacts() {
        for method in [CalibrateMethod::Percentile, CalibrateMethod::Kld] {
            let graph =
                CanonicalGraph::new(testing::two_output_model(4, 4), &[vec![1, 3, 4, 4]]).unwrap();
            let (compile, mut quant) = configs(None);
            quant.method = method;
            let contract = compile::input_contract(&compile, &graph).unwrap();
            let dataset = CalibrationDataset::build(
                &CalibrationSource::Synthetic { count: 3 },
                &contract,
                &mut StdRng::seed_from_u64(11),
            )
            .unwrap();
            let artifact =
                compile_model(&QdqBackend, &graph, &compile, &quant, &dataset).unwrap();
            let loaded = QdqBackend.load(&artifact).unwrap();
            let input = TensorValue::from_f32(vec![1, 3, 4, 4], vec![0.5; 48]).unwrap();
            loaded.run(&[input]).unwrap();
        }
    }
}
