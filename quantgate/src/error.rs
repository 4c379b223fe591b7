//! Error taxonomy shared by every pipeline stage.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Failure modes of the quantize-compile-validate pipeline.
///
/// Stages abort on the first error; nothing is retried and no partial
/// artifact is persisted.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The graph failed a structural or consistency check.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Caller-supplied configuration is inconsistent or out of range.
    #[error("bad configuration: {0}")]
    Configuration(String),

    /// A tensor does not match the shape or dtype its contract declares.
    #[error("shape mismatch for {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// An expected artifact or dump file is absent.
    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    /// Filesystem failure, tagged with the offending path.
    #[error("io error on {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An image that could not be decoded.
    #[error("failed to decode {}: {message}", path.display())]
    Decode { path: PathBuf, message: String },

    /// Internal failure of the compiler or simulator backend, surfaced
    /// verbatim.
    #[error("{stage} backend failed: {message}")]
    Backend {
        stage: &'static str,
        message: String,
    },
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn missing(what: impl Into<String>) -> Self {
        Self::MissingArtifact(what.into())
    }

    /// Wrap a backend failure, keeping the full error chain in the message.
    pub fn backend(stage: &'static str, source: anyhow::Error) -> Self {
        Self::Backend {
            stage,
            message: format!("{source:#}"),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
