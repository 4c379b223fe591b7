//! Output cross-validation: cosine similarity per output pair, a verdict
//! per pair and an overall recommendation.

use std::fmt::Write as _;

use serde::Serialize;

use crate::{
    error::{PipelineError, Result},
    tensor::{InferenceResult, NamedTensor},
};

const EXCELLENT: f32 = 0.999;
const GOOD: f32 = 0.99;
const ACCEPTABLE: f32 = 0.95;

/// Verdict for one output pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    #[display("excellent")]
    Excellent,
    #[display("good")]
    Good,
    #[display("acceptable")]
    Acceptable,
    #[display("poor")]
    Poor,
}

impl Classification {
    pub fn from_score(score: f32) -> Self {
        if score >= EXCELLENT {
            Self::Excellent
        } else if score >= GOOD {
            Self::Good
        } else if score >= ACCEPTABLE {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }
}

/// One compared output pair.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRecord {
    pub index: usize,
    pub output_name: String,
    pub score: f32,
    pub classification: Classification,
}

/// The full cross-validation verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonReport {
    pub records: Vec<ComparisonRecord>,
    /// Declared outputs the candidate never produced. Reported, but
    /// excluded from the mean.
    pub missing: Vec<String>,
    pub mean_score: Option<f32>,
    pub recommendation: String,
}

impl ComparisonReport {
    /// Plain-text rendering for terminal use.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for r in &self.records {
            let _ = writeln!(
                out,
                "  output {:>2} {:<24} cosine {:.5}  {}",
                r.index, r.output_name, r.score, r.classification
            );
        }
        for name in &self.missing {
            let _ = writeln!(out, "  output    {name:<24} missing");
        }
        match self.mean_score {
            Some(mean) => {
                let _ = writeln!(out, "mean cosine similarity: {mean:.5}");
            }
            None => {
                let _ = writeln!(out, "no outputs were compared");
            }
        }
        let _ = writeln!(out, "recommendation: {}", self.recommendation);
        out
    }
}

/// Cosine similarity over flattened buffers, accumulated in f64. A
/// zero-norm operand scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(PipelineError::shape_mismatch(
            "cosine operand length",
            a.len(),
            b.len(),
        ));
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32)
}

/// Score candidate outputs against the reference, position by position.
/// `None` slots count as missing; names must agree where both sides are
/// present.
pub fn compare_outputs(
    reference: &InferenceResult,
    candidate: &[Option<NamedTensor>],
) -> Result<ComparisonReport> {
    if reference.len() != candidate.len() {
        return Err(PipelineError::shape_mismatch(
            "output count",
            reference.len(),
            candidate.len(),
        ));
    }

    let mut records = Vec::new();
    let mut missing = Vec::new();
    for (index, (expected, got)) in reference.outputs().iter().zip(candidate).enumerate() {
        let Some(got) = got else {
            missing.push(expected.name.clone());
            continue;
        };
        if got.name != expected.name {
            return Err(PipelineError::validation(format!(
                "candidate output {} is paired with declared output {}",
                got.name, expected.name
            )));
        }
        if got.value.element_count() != expected.value.element_count() {
            return Err(PipelineError::shape_mismatch(
                format!("output {} size", expected.name),
                expected.value.element_count(),
                got.value.element_count(),
            ));
        }
        let score = cosine_similarity(&expected.value.to_f32_vec(), &got.value.to_f32_vec())?;
        records.push(ComparisonRecord {
            index,
            output_name: expected.name.clone(),
            score,
            classification: Classification::from_score(score),
        });
    }

    let mean_score = if records.is_empty() {
        None
    } else {
        Some(records.iter().map(|r| r.score).sum::<f32>() / records.len() as f32)
    };
    Ok(ComparisonReport {
        records,
        missing,
        recommendation: recommend(mean_score),
        mean_score,
    })
}

/// Score two complete inference results.
pub fn compare_results(
    reference: &InferenceResult,
    candidate: &InferenceResult,
) -> Result<ComparisonReport> {
    let candidate: Vec<Option<NamedTensor>> =
        candidate.outputs().iter().cloned().map(Some).collect();
    compare_outputs(reference, &candidate)
}

fn recommend(mean: Option<f32>) -> String {
    match mean {
        Some(m) if m >= GOOD => "quantization holds up, the artifact is good to ship".into(),
        Some(m) if m >= ACCEPTABLE => {
            "acceptable drift, recalibrate with representative images before shipping".into()
        }
        Some(_) => "heavy drift, recalibrate and revisit the method or bit width".into(),
        None => "no outputs were compared, nothing to judge".into(),
    }
}
