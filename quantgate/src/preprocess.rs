//! Input preprocessing baked into artifacts and replicated by the reference
//! executor.
//!
//! Replication formula, applied per channel: `normalized = (raw - mean[c]) / std[c]`.
//! Compiler and reference must use the same constants or cosine scores
//! silently degrade, so the constants travel inside the artifact envelope and
//! are read back from there.

use clap::ValueEnum;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{
    descriptor::Dtype,
    error::{PipelineError, Result},
    tensor::TensorValue,
};

/// Memory layout of a rank-4 image batch.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Layout {
    /// Batch, channels, height, width.
    #[display("NCHW")]
    Nchw,
    /// Batch, height, width, channels.
    #[display("NHWC")]
    Nhwc,
}

impl Layout {
    pub fn channel_axis(&self) -> usize {
        match self {
            Self::Nchw => 1,
            Self::Nhwc => 3,
        }
    }

    /// (channels, height, width) of a rank-4 shape in this layout.
    pub fn chw(&self, shape: &[usize]) -> Result<(usize, usize, usize)> {
        if shape.len() != 4 {
            return Err(PipelineError::shape_mismatch(
                "image batch",
                "rank 4",
                format!("rank {}", shape.len()),
            ));
        }
        Ok(match self {
            Self::Nchw => (shape[1], shape[2], shape[3]),
            Self::Nhwc => (shape[3], shape[1], shape[2]),
        })
    }
}

/// Normalization constants applied to the raw input before it enters the
/// graph. The compile stage bakes them into the artifact; the reference
/// executor replicates them bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSpec {
    /// Element type the artifact accepts at its boundary.
    pub input_dtype: Dtype,
    /// Value range of the raw input, `(low, high)` with `low < high`.
    pub input_range: (f32, f32),
    /// Per-channel mean, subtracted first.
    pub mean: Vec<f32>,
    /// Per-channel std, divided after the mean.
    pub std: Vec<f32>,
    /// Layout of the raw input batch.
    pub layout: Layout,
}

impl PreprocessSpec {
    pub fn validate(&self, channels: usize) -> Result<()> {
        if !matches!(self.input_dtype, Dtype::U8 | Dtype::F32) {
            return Err(PipelineError::config(format!(
                "preprocessing supports u8 or f32 inputs, not {}",
                self.input_dtype
            )));
        }
        if self.mean.len() != channels {
            return Err(PipelineError::config(format!(
                "mean carries {} values for {channels} channels",
                self.mean.len()
            )));
        }
        if self.std.len() != channels {
            return Err(PipelineError::config(format!(
                "std carries {} values for {channels} channels",
                self.std.len()
            )));
        }
        if self.std.iter().any(|s| s.abs() < f32::EPSILON) {
            return Err(PipelineError::config("std contains a zero entry"));
        }
        let (lo, hi) = self.input_range;
        if !(lo < hi) {
            return Err(PipelineError::config(format!(
                "input range [{lo}, {hi}] is empty"
            )));
        }
        if self.input_dtype == Dtype::U8 && (lo, hi) != (0.0, 255.0) {
            return Err(PipelineError::config(
                "u8 inputs require the full [0, 255] range",
            ));
        }
        Ok(())
    }

    /// Apply `(raw - mean[c]) / std[c]` over the channel axis, widening to
    /// f32. The result has the same shape as `raw`.
    pub fn replicate(&self, raw: &TensorValue) -> Result<TensorValue> {
        if raw.dtype() != self.input_dtype {
            return Err(PipelineError::shape_mismatch(
                "preprocessing input",
                self.input_dtype,
                raw.dtype(),
            ));
        }
        let shape = raw.shape().to_vec();
        let (channels, height, width) = self.layout.chw(&shape)?;
        if channels != self.mean.len() {
            return Err(PipelineError::shape_mismatch(
                "preprocessing input channels",
                self.mean.len(),
                channels,
            ));
        }
        let plane = height * width;
        let data = raw
            .to_f32_vec()
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                let c = match self.layout {
                    Layout::Nchw => (i / plane) % channels,
                    Layout::Nhwc => i % channels,
                };
                (v - self.mean[c]) / self.std[c]
            })
            .collect();
        TensorValue::from_f32(shape, data)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(layout: Layout) -> PreprocessSpec {
        PreprocessSpec {
            input_dtype: Dtype::U8,
            input_range: (0.0, 255.0),
            mean: vec![104.0, 117.0, 123.0],
            std: vec![1.0, 1.0, 1.0],
            layout,
        }
    }

    #[test]
    fn mean_maps_matching_pixels_to_zero() {
        let raw = TensorValue::from_u8(vec![1, 3, 1, 1], vec![104, 117, 123]).unwrap();
        let out = spec(Layout::Nchw).replicate(&raw).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn nhwc_channel_indexing() {
        // Two pixels, channels interleaved.
        let raw =
            TensorValue::from_u8(vec![1, 1, 2, 3], vec![104, 117, 123, 105, 118, 124]).unwrap();
        let out = spec(Layout::Nhwc).replicate(&raw).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn std_divides_after_mean() {
        let mut s = spec(Layout::Nchw);
        s.std = vec![2.0, 4.0, 8.0];
        let raw = TensorValue::from_u8(vec![1, 3, 1, 1], vec![106, 121, 131]).unwrap();
        let out = s.replicate(&raw).unwrap();
        assert_eq!(out.as_f32().unwrap(), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn validation_rejects_bad_arity_and_zero_std() {
        let mut s = spec(Layout::Nchw);
        assert!(s.validate(3).is_ok());
        assert!(s.validate(1).is_err());
        s.std = vec![1.0, 0.0, 1.0];
        assert!(matches!(
            s.validate(3),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn u8_range_is_pinned_to_full_byte() {
        let mut s = spec(Layout::Nchw);
        s.input_range = (0.0, 1.0);
        assert!(s.validate(3).is_err());
    }

    #[test]
    fn dtype_mismatch_is_a_shape_error() {
        let raw = TensorValue::from_f32(vec![1, 3, 1, 1], vec![0.0; 3]).unwrap();
        let err = spec(Layout::Nchw).replicate(&raw).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }
}
