//! Activation observation and calibration arithmetic.
//!
//! Each declared output gets a fixed-width histogram accumulated over every
//! calibration sample. Once observation is done, the configured method
//! turns the histogram into affine quantization parameters.

use serde::{Deserialize, Serialize};

use crate::{
    config::CalibrateMethod,
    error::{PipelineError, Result},
};

const HISTOGRAM_BINS: usize = 2048;
const PERCENTILE: f32 = 99.99;
const MASS_EPSILON: f64 = 1e-12;

/// Asymmetric affine quantization parameters for one tensor.
///
/// `q = round(v / scale) + zero_point`, clamped to `[0, 2^bits - 1]`;
/// `v' = (q - zero_point) * scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl AffineParams {
    /// Derive parameters covering `[min, max]` with `2^bits` levels.
    pub fn from_range(min: f32, max: f32, bits: u32) -> Self {
        let qmax = ((1u64 << bits) - 1) as f32;
        let span = max - min;
        if !(span > f32::EPSILON) {
            // Constant tensor: any scale represents it, pick a neutral one.
            return Self {
                scale: 1.0,
                zero_point: 0,
            };
        }
        let scale = span / qmax;
        Self {
            scale,
            zero_point: (-min / scale).round() as i32,
        }
    }

    /// Quantize then dequantize one value, the round trip the artifact
    /// boundary applies.
    pub fn qdq(&self, v: f32, qmax: f32) -> f32 {
        let q = ((v / self.scale).round() + self.zero_point as f32).clamp(0.0, qmax);
        (q - self.zero_point as f32) * self.scale
    }
}

/// Equal-width histogram over the observed value range.
#[derive(Debug, Clone)]
pub(crate) struct TensorHistogram {
    min: f32,
    max: f32,
    bins: Vec<u64>,
    total: u64,
}

impl TensorHistogram {
    fn new(min: f32, max: f32) -> Self {
        Self {
            min,
            max,
            bins: vec![0; HISTOGRAM_BINS],
            total: 0,
        }
    }

    pub fn min(&self) -> f32 {
        self.min
    }

    pub fn max(&self) -> f32 {
        self.max
    }

    fn width(&self) -> f32 {
        (self.max - self.min) / self.bins.len() as f32
    }

    /// Fold a batch of values in, widening the covered range first when the
    /// batch falls outside it.
    pub fn record(&mut self, values: &[f32]) {
        let Some((lo, hi)) = min_max(values) else {
            return;
        };
        if lo < self.min || hi > self.max {
            self.rebin(self.min.min(lo), self.max.max(hi));
        }
        let width = self.width();
        for &v in values {
            let ix = if width > 0.0 {
                (((v - self.min) / width) as usize).min(self.bins.len() - 1)
            } else {
                0
            };
            self.bins[ix] += 1;
        }
        self.total += values.len() as u64;
    }

    /// Redistribute current counts over a wider range, splitting each old
    /// bin across the new bins it overlaps, proportionally.
    fn rebin(&mut self, new_min: f32, new_max: f32) {
        if self.total == 0 {
            self.min = new_min;
            self.max = new_max;
            return;
        }
        let n = self.bins.len();
        let old_width = self.width();
        let new_width = (new_max - new_min) / n as f32;
        let mut new_bins = vec![0u64; n];
        if new_width <= 0.0 || old_width <= 0.0 {
            // Degenerate ranges collapse into the bin holding the old min.
            let ix = if new_width > 0.0 {
                (((self.min - new_min) / new_width) as usize).min(n - 1)
            } else {
                0
            };
            new_bins[ix] = self.total;
        } else {
            for (i, &count) in self.bins.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let old_lo = self.min + old_width * i as f32;
                let old_hi = old_lo + old_width;
                let first = (((old_lo - new_min) / new_width) as usize).min(n - 1);
                let last = (((old_hi - new_min) / new_width) as usize).min(n - 1);
                if first == last {
                    new_bins[first] += count;
                    continue;
                }
                for j in first..=last {
                    let new_lo = new_min + new_width * j as f32;
                    let new_hi = new_lo + new_width;
                    let overlap = old_hi.min(new_hi) - old_lo.max(new_lo);
                    if overlap <= 0.0 {
                        continue;
                    }
                    new_bins[j] += (count as f64 * (overlap / old_width) as f64).round() as u64;
                }
            }
        }
        self.min = new_min;
        self.max = new_max;
        self.bins = new_bins;
    }

    /// The value at a percentile in [0, 100], linearly interpolated inside
    /// the bin that crosses it.
    pub fn percentile(&self, pct: f32) -> f32 {
        if self.total == 0 {
            return self.min;
        }
        let target = (pct as f64 / 100.0 * self.total as f64) as u64;
        let width = self.width();
        let mut cumulative = 0u64;
        for (i, &count) in self.bins.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                let bin_start = self.min + width * i as f32;
                if count == 0 {
                    return bin_start;
                }
                let into_bin = (target - (cumulative - count)) as f32 / count as f32;
                return bin_start + into_bin * width;
            }
        }
        self.max
    }

    /// TensorRT-style KL-divergence threshold search: find the clip point
    /// that loses the least information when the clipped distribution is
    /// squeezed into `2^(bits-1)` levels. Returns `None` when the
    /// histogram is too coarse for the requested width.
    pub fn kld_clip(&self, bits: u32) -> Option<(f32, f32)> {
        let target = 1usize << (bits - 1);
        let n = self.bins.len();
        if n < target || self.total == 0 {
            return None;
        }
        let reference: Vec<f64> = self
            .bins
            .iter()
            .map(|&c| c as f64 / self.total as f64)
            .collect();

        let mut best = f64::INFINITY;
        let mut best_bin = n;
        for threshold_bin in target..=n {
            let mut clipped = reference[..threshold_bin].to_vec();
            if threshold_bin < n {
                // Outlier mass folds into the last kept bin.
                let outliers: f64 = reference[threshold_bin..].iter().sum();
                if let Some(last) = clipped.last_mut() {
                    *last += outliers;
                }
            }
            if clipped.iter().sum::<f64>() < MASS_EPSILON {
                continue;
            }

            // Squeeze down to the quantized level count...
            let per_level = threshold_bin as f64 / target as f64;
            let mut squeezed = vec![0.0f64; target];
            for (i, &p) in clipped.iter().enumerate() {
                let level = ((i as f64 / per_level) as usize).min(target - 1);
                squeezed[level] += p;
            }
            // ...then expand back, spreading each level's mass evenly over
            // the bins that were occupied.
            let mut expanded = vec![0.0f64; threshold_bin];
            for (level, &mass) in squeezed.iter().enumerate() {
                let start = (level as f64 * per_level) as usize;
                let end = (((level + 1) as f64 * per_level) as usize).min(threshold_bin);
                let occupied = clipped[start..end]
                    .iter()
                    .filter(|&&p| p > MASS_EPSILON)
                    .count();
                if occupied == 0 {
                    continue;
                }
                let share = mass / occupied as f64;
                for (j, &p) in clipped.iter().enumerate().take(end).skip(start) {
                    if p > MASS_EPSILON {
                        expanded[j] = share;
                    }
                }
            }

            let divergence = kl_divergence(&clipped, &expanded);
            if divergence < best {
                best = divergence;
                best_bin = threshold_bin;
            }
        }

        let threshold = self.min + self.width() * best_bin as f32;
        Some((self.min, threshold))
    }
}

/// `sum(p * ln(p / q))`, skipping bins with negligible mass on either side.
fn kl_divergence(p: &[f64], q: &[f64]) -> f64 {
    p.iter()
        .zip(q)
        .filter(|(&pi, &qi)| pi > MASS_EPSILON && qi > MASS_EPSILON)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum()
}

fn min_max(values: &[f32]) -> Option<(f32, f32)> {
    let mut it = values.iter().copied();
    let first = it.next()?;
    Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
}

/// Accumulates one output's distribution across calibration samples.
#[derive(Debug, Clone)]
pub(crate) struct ActivationObserver {
    name: String,
    hist: Option<TensorHistogram>,
}

impl ActivationObserver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hist: None,
        }
    }

    pub fn record(&mut self, values: &[f32]) -> Result<()> {
        if values.is_empty() {
            return Err(PipelineError::validation(format!(
                "output {} produced no values during calibration",
                self.name
            )));
        }
        let hist = self.hist.get_or_insert_with(|| {
            let (lo, hi) = min_max(values).unwrap_or((0.0, 0.0));
            TensorHistogram::new(lo, hi)
        });
        hist.record(values);
        Ok(())
    }

    /// Turn the observed distribution into quantization parameters.
    pub fn params(&self, method: CalibrateMethod, bits: u32) -> Result<AffineParams> {
        let hist = self.hist.as_ref().ok_or_else(|| {
            PipelineError::validation(format!(
                "output {} was never observed during calibration",
                self.name
            ))
        })?;
        Ok(calibrate(hist, method, bits))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observed_range(&self) -> Option<(f32, f32)> {
        self.hist.as_ref().map(|h| (h.min(), h.max()))
    }
}

pub(crate) fn calibrate(
    hist: &TensorHistogram,
    method: CalibrateMethod,
    bits: u32,
) -> AffineParams {
    match method {
        CalibrateMethod::MinMax => AffineParams::from_range(hist.min(), hist.max(), bits),
        CalibrateMethod::Percentile => AffineParams::from_range(
            hist.percentile(100.0 - PERCENTILE),
            hist.percentile(PERCENTILE),
            bits,
        ),
        CalibrateMethod::Kld => match hist.kld_clip(bits) {
            Some((lo, hi)) => AffineParams::from_range(lo, hi, bits),
            // Histogram too coarse for the requested width.
            None => AffineParams::from_range(hist.min(), hist.max(), bits),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn observe(values: &[f32]) -> ActivationObserver {
        let mut obs = ActivationObserver::new("out");
        obs.record(values).unwrap();
        obs
    }

    #[test]
    fn minmax_params_cover_the_observed_range() {
        let obs = observe(&[-1.0, 0.0, 3.0]);
        let p = obs.params(CalibrateMethod::MinMax, 8).unwrap();
        assert!((p.scale - 4.0 / 255.0).abs() < 1e-6);
        assert_eq!(p.zero_point, (1.0 / p.scale).round() as i32);
    }

    #[test]
    fn constant_tensors_get_neutral_params() {
        let obs = observe(&[2.5; 16]);
        let p = obs.params(CalibrateMethod::MinMax, 8).unwrap();
        assert_eq!(p.scale, 1.0);
        assert_eq!(p.zero_point, 0);
    }

    #[test]
    fn qdq_error_stays_within_half_a_step() {
        let p = AffineParams::from_range(-1.0, 1.0, 8);
        for &v in &[-1.0f32, -0.33, 0.0, 0.5, 1.0] {
            let back = p.qdq(v, 255.0);
            assert!((back - v).abs() <= p.scale / 2.0 + 1e-6, "{v} -> {back}");
        }
    }

    #[test]
    fn qdq_clamps_beyond_the_calibrated_range() {
        let p = AffineParams::from_range(0.0, 1.0, 8);
        let back = p.qdq(2.0, 255.0);
        assert!((back - 1.0).abs() < p.scale + 1e-6);
    }

    #[test]
    fn percentile_interpolates_a_uniform_histogram() {
        let values: Vec<f32> = (0..10_000).map(|i| i as f32 / 10_000.0).collect();
        let obs = observe(&values);
        let hist = obs.hist.as_ref().unwrap();
        let mid = hist.percentile(50.0);
        assert!((mid - 0.5).abs() < 0.01, "median came out at {mid}");
    }

    #[test]
    fn percentile_clips_a_lone_outlier() {
        let mut values: Vec<f32> = (0..5_000).map(|i| i as f32 / 5_000.0).collect();
        values.push(1_000.0);
        let obs = observe(&values);
        let p = obs.params(CalibrateMethod::Percentile, 8).unwrap();
        let full = obs.params(CalibrateMethod::MinMax, 8).unwrap();
        assert!(p.scale < full.scale / 10.0);
    }

    #[test]
    fn range_widens_across_batches() {
        let mut obs = ActivationObserver::new("out");
        obs.record(&[0.0, 1.0]).unwrap();
        obs.record(&[-4.0, 6.0]).unwrap();
        assert_eq!(obs.observed_range(), Some((-4.0, 6.0)));
    }

    #[test]
    fn rebinning_preserves_the_total_count() {
        let mut obs = ActivationObserver::new("out");
        obs.record(&[0.0, 0.25, 0.5, 0.75, 1.0]).unwrap();
        obs.record(&[10.0]).unwrap();
        let hist = obs.hist.as_ref().unwrap();
        let counted: u64 = hist.bins.iter().sum();
        // Proportional splitting rounds per bin, allow one count of slack.
        assert!(counted >= 5 && counted <= 7, "total drifted to {counted}");
        assert_eq!(hist.total, 6);
    }

    #[test]
    fn kld_clip_tightens_a_heavy_tailed_range() {
        // Mass concentrated near zero with a thin far tail.
        let mut values: Vec<f32> = Vec::new();
        for i in 0..20_000 {
            values.push((i % 100) as f32 / 100.0);
        }
        values.extend([50.0, 60.0, 80.0, 100.0]);
        let obs = observe(&values);
        let hist = obs.hist.as_ref().unwrap();
        let (lo, hi) = hist.kld_clip(8).unwrap();
        assert_eq!(lo, hist.min());
        assert!(hi < 100.0);
        assert!(hi >= 1.0);
    }

    #[test]
    fn kld_falls_back_when_bins_are_too_coarse() {
        let obs = observe(&[0.0, 1.0, 2.0]);
        let hist = obs.hist.as_ref().unwrap();
        // 16-bit targets need 32768 levels, more than the histogram holds.
        assert!(hist.kld_clip(16).is_none());
        let p = obs.params(CalibrateMethod::Kld, 16).unwrap();
        let minmax = obs.params(CalibrateMethod::MinMax, 16).unwrap();
        assert_eq!(p, minmax);
    }

    #[test]
    fn unobserved_outputs_are_an_error() {
        let obs = ActivationObserver::new("out");
        assert!(obs.params(CalibrateMethod::MinMax, 8).is_err());
    }
}
