//! Wire format of the qdq-sim backend blob.

use serde::{Deserialize, Serialize};

use crate::{
    codec,
    config::CalibrateMethod,
    error::{PipelineError, Result},
    preprocess::PreprocessSpec,
};

use super::observer::AffineParams;

pub(crate) const BLOB_MAGIC: &[u8; 8] = b"QDQBLOB1";
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Quantization parameters pinned to one declared output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct OutputQuant {
    pub name: String,
    pub params: AffineParams,
}

/// Everything the simulator needs to reproduce the compiled model: the
/// source graph, the pinned input geometry and the per-output calibration
/// results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QdqImage {
    pub version: u32,
    pub target: String,
    pub model: Vec<u8>,
    pub input_shapes: Vec<Vec<usize>>,
    pub preprocess: Option<PreprocessSpec>,
    pub activation_bits: u32,
    pub weight_bits: u32,
    pub method: CalibrateMethod,
    pub outputs: Vec<OutputQuant>,
}

impl QdqImage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        codec::encode_framed(BLOB_MAGIC, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image: Self = codec::decode_framed(BLOB_MAGIC, "backend blob", bytes)?;
        if image.version != FORMAT_VERSION {
            return Err(PipelineError::validation(format!(
                "backend blob version {} is not supported (expected {FORMAT_VERSION})",
                image.version
            )));
        }
        Ok(image)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_image() -> QdqImage {
        QdqImage {
            version: FORMAT_VERSION,
            target: "qdq-sim".into(),
            model: vec![1, 2, 3],
            input_shapes: vec![vec![1, 3, 4, 4]],
            preprocess: None,
            activation_bits: 8,
            weight_bits: 8,
            method: CalibrateMethod::MinMax,
            outputs: vec![OutputQuant {
                name: "act".into(),
                params: AffineParams {
                    scale: 0.5,
                    zero_point: 3,
                },
            }],
        }
    }

    #[test]
    fn blob_round_trips() {
        let image = sample_image();
        let decoded = QdqImage::decode(&image.encode().unwrap()).unwrap();
        assert_eq!(decoded.outputs[0].name, "act");
        assert_eq!(decoded.outputs[0].params, image.outputs[0].params);
        assert_eq!(decoded.input_shapes, image.input_shapes);
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut image = sample_image();
        image.version = 99;
        let bytes = image.encode().unwrap();
        let err = QdqImage::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }
}
