//! Calibration dataset construction.
//!
//! Real datasets come from a directory of images, loaded in lexicographic
//! file-name order so runs are reproducible no matter how the filesystem
//! enumerates. When no usable image exists the builder falls back to a
//! small synthetic dataset, which keeps the pipeline runnable but makes the
//! calibrated ranges meaningless for accuracy purposes.

use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
};

use derive_more::Display;
use image::imageops::FilterType;
use itertools::Itertools;
use rand::Rng;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::{
    descriptor::Dtype,
    error::{PipelineError, Result},
    preprocess::Layout,
    tensor::TensorValue,
};

/// Samples used when an image directory turns out to be empty.
pub const DEFAULT_SYNTHETIC_SAMPLES: usize = 3;

const IMAGE_EXTENSIONS: &[&str] = &["bmp", "jpeg", "jpg", "png"];

/// Where calibration samples come from.
#[derive(Debug, Clone)]
pub enum CalibrationSource {
    /// Decode every supported image under this directory.
    ImageDir(PathBuf),
    /// Draw `count` samples uniformly from the declared input range.
    Synthetic { count: usize },
}

/// Everything the builder needs to know about the tensor it must produce.
#[derive(Debug, Clone)]
pub struct InputContract {
    /// Concrete rank-4 shape of one sample, batch included.
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub layout: Layout,
    /// Declared value range, used for synthetic draws.
    pub range: (f32, f32),
}

impl InputContract {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// (channels, height, width) under the contract layout.
    pub fn chw(&self) -> Result<(usize, usize, usize)> {
        self.layout.chw(&self.shape)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum DatasetOrigin {
    #[display("images")]
    Images,
    #[display("synthetic")]
    Synthetic,
}

/// An ordered, immutable set of calibration samples. Built once, consumed
/// once by the compile stage.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    samples: Vec<TensorValue>,
    origin: DatasetOrigin,
}

impl CalibrationDataset {
    /// Build from the configured source, falling back to synthetic samples
    /// when the image directory has nothing usable.
    pub fn build(
        source: &CalibrationSource,
        contract: &InputContract,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        match source {
            CalibrationSource::ImageDir(dir) => {
                let paths = list_images(dir)?;
                if paths.is_empty() {
                    warn!(
                        "no calibration images under {}, falling back to {} synthetic samples",
                        dir.display(),
                        DEFAULT_SYNTHETIC_SAMPLES
                    );
                    return Self::synthetic(DEFAULT_SYNTHETIC_SAMPLES, contract, rng);
                }
                Self::from_image_paths(&paths, contract)
            }
            CalibrationSource::Synthetic { count } => Self::synthetic(*count, contract, rng),
        }
    }

    fn from_image_paths(paths: &[PathBuf], contract: &InputContract) -> Result<Self> {
        if contract.shape.first() != Some(&1) {
            return Err(PipelineError::config(
                "image calibration requires batch size 1",
            ));
        }
        let samples = paths
            .par_iter()
            .map(|p| load_image(p, contract))
            .collect::<Result<Vec<_>>>()?;
        info!("loaded {} calibration images", samples.len());
        Ok(Self {
            samples,
            origin: DatasetOrigin::Images,
        })
    }

    /// Draw `count` samples uniformly from the contract range.
    pub fn synthetic(count: usize, contract: &InputContract, rng: &mut impl Rng) -> Result<Self> {
        if count == 0 {
            return Err(PipelineError::config(
                "synthetic calibration needs at least one sample",
            ));
        }
        let (lo, hi) = contract.range;
        if !(lo < hi) {
            return Err(PipelineError::config(format!(
                "input range [{lo}, {hi}] is empty"
            )));
        }
        let n = contract.element_count();
        let samples = (0..count)
            .map(|_| match contract.dtype {
                Dtype::U8 => {
                    let data = (0..n).map(|_| rng.gen_range(lo as u8..=hi as u8)).collect();
                    TensorValue::from_u8(contract.shape.clone(), data)
                }
                Dtype::F32 => {
                    let data = (0..n).map(|_| rng.gen_range(lo..=hi)).collect();
                    TensorValue::from_f32(contract.shape.clone(), data)
                }
                other => Err(PipelineError::config(format!(
                    "cannot synthesize {other} calibration samples"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        info!("synthesized {count} calibration samples in [{lo}, {hi}]");
        Ok(Self {
            samples,
            origin: DatasetOrigin::Synthetic,
        })
    }

    pub fn samples(&self) -> &[TensorValue] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn origin(&self) -> DatasetOrigin {
        self.origin
    }

    /// Every sample must match the contract exactly. Run before the
    /// backend sees the dataset.
    pub fn validate(&self, contract: &InputContract) -> Result<()> {
        for (ix, sample) in self.samples.iter().enumerate() {
            if sample.shape() != contract.shape.as_slice() || sample.dtype() != contract.dtype {
                return Err(PipelineError::shape_mismatch(
                    format!("calibration sample {ix}"),
                    format!(
                        "{} {}",
                        contract.dtype,
                        contract.shape.iter().join("x")
                    ),
                    format!("{} {}", sample.dtype(), sample.shape_string()),
                ));
            }
        }
        Ok(())
    }
}

/// Supported images directly under `dir`, sorted by file name.
fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(PipelineError::io(dir))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(OsStr::to_str)
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// Decode one image into a tensor matching the contract: RGB, bilinear
/// resize to the contract extent, then layout and dtype conversion.
pub fn load_image(path: &Path, contract: &InputContract) -> Result<TensorValue> {
    let (channels, height, width) = contract.chw()?;
    if channels != 3 {
        return Err(PipelineError::config(format!(
            "image calibration requires 3 channels, contract declares {channels}"
        )));
    }
    let img = image::open(path).map_err(|e| PipelineError::Decode {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let rgb = if (img.width(), img.height()) == (width as u32, height as u32) {
        img.to_rgb8()
    } else {
        img.resize_exact(width as u32, height as u32, FilterType::Triangle)
            .to_rgb8()
    };
    let hwc = rgb.into_raw();
    let plane = height * width;
    let data = match contract.layout {
        Layout::Nhwc => hwc,
        Layout::Nchw => {
            let mut chw = vec![0u8; channels * plane];
            for px in 0..plane {
                for c in 0..channels {
                    chw[c * plane + px] = hwc[px * channels + c];
                }
            }
            chw
        }
    };
    match contract.dtype {
        Dtype::U8 => TensorValue::from_u8(contract.shape.clone(), data),
        Dtype::F32 => TensorValue::from_f32(
            contract.shape.clone(),
            data.into_iter().map(|b| b as f32).collect(),
        ),
        other => Err(PipelineError::config(format!(
            "image calibration cannot produce {other} tensors"
        ))),
    }
}
