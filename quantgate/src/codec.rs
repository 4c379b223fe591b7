//! Magic-framed MessagePack encoding for the files this pipeline writes.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{PipelineError, Result};

/// Serialize `value` behind an 8-byte magic prefix.
pub(crate) fn encode_framed<T: Serialize>(magic: &[u8; 8], value: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec(value)
        .map_err(|e| PipelineError::validation(format!("serializing payload: {e}")))?;
    let mut out = Vec::with_capacity(magic.len() + payload.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Check the magic prefix and deserialize the remainder.
pub(crate) fn decode_framed<T: DeserializeOwned>(
    magic: &[u8; 8],
    what: &str,
    bytes: &[u8],
) -> Result<T> {
    let payload = bytes
        .strip_prefix(magic.as_slice())
        .ok_or_else(|| PipelineError::validation(format!("{what}: bad or missing magic")))?;
    rmp_serde::from_slice(payload)
        .map_err(|e| PipelineError::validation(format!("{what}: decoding payload: {e}")))
}
