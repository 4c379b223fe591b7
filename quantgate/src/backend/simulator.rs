//! Host-side execution of qdq-sim artifacts.

use tract_onnx::prelude::{TypedModel, TypedRunnableModel};

use crate::{
    descriptor::TensorDescriptor,
    error::{PipelineError, Result},
    graph::{self, CanonicalGraph},
    simulate::{validate_inputs, LoadedArtifact},
    tensor::{InferenceResult, NamedTensor, TensorValue},
};

use super::artifact::QdqImage;

/// A decoded blob pinned to an execution plan. The float graph is rebuilt
/// from the embedded model bytes, so a loaded artifact never depends on
/// the original model file still being around.
#[derive(Debug)]
pub(crate) struct LoadedQdq {
    inputs: Vec<TensorDescriptor>,
    outputs: Vec<TensorDescriptor>,
    plan: TypedRunnableModel<TypedModel>,
    image: QdqImage,
    qmax: f32,
}

impl LoadedQdq {
    pub fn from_image(image: QdqImage) -> Result<Self> {
        let graph = CanonicalGraph::new(image.model.clone(), &image.input_shapes)?;
        let declared = graph.descriptor();
        if declared.outputs().len() != image.outputs.len() {
            return Err(PipelineError::validation(format!(
                "blob calibrates {} outputs, graph declares {}",
                image.outputs.len(),
                declared.outputs().len()
            )));
        }
        for (desc, quant) in declared.outputs().iter().zip(&image.outputs) {
            if desc.name() != quant.name {
                return Err(PipelineError::validation(format!(
                    "blob output {} does not line up with graph output {}",
                    quant.name,
                    desc.name()
                )));
            }
        }

        let mut io = declared.clone();
        if let Some(p) = &image.preprocess {
            io.set_input_dtype(0, p.input_dtype);
        }
        let plan = graph.runnable()?;
        let qmax = ((1u64 << image.activation_bits) - 1) as f32;
        Ok(Self {
            inputs: io.inputs().to_vec(),
            outputs: io.outputs().to_vec(),
            plan,
            image,
            qmax,
        })
    }

    /// Raw inputs to graph inputs: input 0 goes through the baked
    /// normalization when there is one, everything else passes through.
    fn prepare(&self, inputs: &[TensorValue]) -> Result<Vec<TensorValue>> {
        inputs
            .iter()
            .enumerate()
            .map(|(ix, input)| match &self.image.preprocess {
                Some(p) if ix == 0 => p.replicate(input),
                _ => Ok(input.clone()),
            })
            .collect()
    }
}

impl LoadedArtifact for LoadedQdq {
    fn inputs(&self) -> &[TensorDescriptor] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDescriptor] {
        &self.outputs
    }

    fn run(&self, inputs: &[TensorValue]) -> Result<InferenceResult> {
        validate_inputs(&self.inputs, inputs)?;
        let prepared = self.prepare(inputs)?;
        let raw = graph::run_float_plan(&self.plan, &prepared)?;
        if raw.len() != self.image.outputs.len() {
            return Err(PipelineError::backend(
                "simulate",
                anyhow::anyhow!(
                    "plan produced {} outputs, blob calibrated {}",
                    raw.len(),
                    self.image.outputs.len()
                ),
            ));
        }

        let mut outputs = Vec::with_capacity(raw.len());
        for (value, quant) in raw.into_iter().zip(&self.image.outputs) {
            let rounded: Vec<f32> = value
                .to_f32_vec()
                .iter()
                .map(|&v| quant.params.qdq(v, self.qmax))
                .collect();
            let value = TensorValue::from_f32(value.shape().to_vec(), rounded)?;
            outputs.push(NamedTensor::new(quant.name.clone(), value));
        }
        Ok(InferenceResult::new(outputs))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backend::{
            artifact::{OutputQuant, FORMAT_VERSION},
            observer::AffineParams,
        },
        config::CalibrateMethod,
        descriptor::Dtype,
        preprocess::{Layout, PreprocessSpec},
        testing,
    };

    fn image(preprocess: Option<PreprocessSpec>) -> QdqImage {
        QdqImage {
            version: FORMAT_VERSION,
            target: "qdq-sim".into(),
            model: testing::two_output_model(2, 2),
            input_shapes: vec![vec![1, 3, 2, 2]],
            preprocess,
            activation_bits: 8,
            weight_bits: 8,
            method: CalibrateMethod::MinMax,
            outputs: vec![
                OutputQuant {
                    name: "act".into(),
                    params: AffineParams::from_range(0.0, 2.0, 8),
                },
                OutputQuant {
                    name: "neg".into(),
                    params: AffineParams::from_range(-2.0, 2.0, 8),
                },
            ],
        }
    }

    #[test]
    fn outputs_keep_declared_names_and_order() {
        let loaded = LoadedQdq::from_image(image(None)).unwrap();
        let input = TensorValue::from_f32(vec![1, 3, 2, 2], vec![0.5; 12]).unwrap();
        let result = loaded.run(&[input]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.outputs()[0].name, "act");
        assert_eq!(result.outputs()[1].name, "neg");
    }

    #[test]
    fn values_round_to_the_quantization_grid() {
        let loaded = LoadedQdq::from_image(image(None)).unwrap();
        let data: Vec<f32> = (0..12).map(|i| i as f32 / 8.0 - 0.5).collect();
        let input = TensorValue::from_f32(vec![1, 3, 2, 2], data.clone()).unwrap();
        let result = loaded.run(&[input]).unwrap();

        let act_scale = 2.0 / 255.0;
        for (got, v) in result.outputs()[0].value.to_f32_vec().iter().zip(&data) {
            let expected = v.max(0.0);
            assert!((got - expected).abs() <= act_scale / 2.0 + 1e-6);
        }
        let neg_scale = 4.0 / 255.0;
        for (got, v) in result.outputs()[1].value.to_f32_vec().iter().zip(&data) {
            assert!((got + v).abs() <= neg_scale / 2.0 + 1e-6);
        }
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let loaded = LoadedQdq::from_image(image(None)).unwrap();
        let input = TensorValue::from_f32(vec![1, 3, 2, 2], vec![0.123; 12]).unwrap();
        let a = loaded.run(&[input.clone()]).unwrap();
        let b = loaded.run(&[input]).unwrap();
        for (x, y) in a.outputs().iter().zip(b.outputs()) {
            assert_eq!(x.value.to_f32_vec(), y.value.to_f32_vec());
        }
    }

    #[test]
    fn baked_preprocessing_swaps_the_input_dtype() {
        let spec = PreprocessSpec {
            input_dtype: Dtype::U8,
            input_range: (0.0, 255.0),
            mean: vec![104.0, 117.0, 123.0],
            std: vec![1.0, 1.0, 1.0],
            layout: Layout::Nchw,
        };
        let loaded = LoadedQdq::from_image(image(Some(spec))).unwrap();
        assert_eq!(loaded.inputs()[0].dtype(), Dtype::U8);

        let raw = TensorValue::from_u8(vec![1, 3, 2, 2], vec![200; 12]).unwrap();
        loaded.run(&[raw]).unwrap();

        let float = TensorValue::from_f32(vec![1, 3, 2, 2], vec![0.0; 12]).unwrap();
        assert!(loaded.run(&[float]).is_err());
    }

    #[test]
    fn misaligned_blob_outputs_are_refused() {
        let mut img = image(None);
        img.outputs.swap(0, 1);
        let err = LoadedQdq::from_image(img).unwrap_err();
        assert!(err.to_string().contains("line up"));
    }

    #[test]
    fn shape_violations_are_caught_before_execution() {
        let loaded = LoadedQdq::from_image(image(None)).unwrap();
        let input = TensorValue::from_f32(vec![1, 3, 4, 4], vec![0.0; 48]).unwrap();
        assert!(loaded.run(&[input]).is_err());
    }
}
