//! Tensor exchange through a dump directory.
//!
//! `simulate` leaves the fed input and every produced output behind as
//! files; `compare` picks them up later without rerunning the artifact.
//! File names encode the output position and name, so pairing against the
//! declared outputs never relies on directory listing order.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{
    codec,
    descriptor::TensorDescriptor,
    error::{PipelineError, Result},
    tensor::{InferenceResult, NamedTensor},
};

const DUMP_MAGIC: &[u8; 8] = b"QGTENSR1";

/// File holding the raw input that produced the dumped outputs.
pub const INPUT_DUMP: &str = "input_data.tensor";

/// Dump file for the output at `index` named `name`.
pub fn result_file_name(index: usize, name: &str) -> String {
    format!("result_{index}_{}.tensor", sanitize(name))
}

/// Graph output names may carry path separators or other characters unfit
/// for file names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_tensor(path: &Path, tensor: &NamedTensor) -> Result<()> {
    let bytes = codec::encode_framed(DUMP_MAGIC, tensor)?;
    std::fs::write(path, bytes).map_err(PipelineError::io(path))
}

fn read_tensor(path: &Path) -> Result<NamedTensor> {
    let bytes = std::fs::read(path).map_err(PipelineError::io(path))?;
    codec::decode_framed(DUMP_MAGIC, "dumped tensor", &bytes)
}

/// Record the raw input under its declared name.
pub fn write_input(dir: &Path, input: &NamedTensor) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(PipelineError::io(dir))?;
    write_tensor(&dir.join(INPUT_DUMP), input)
}

/// The input a previous simulation ran on. Its absence is a hard error,
/// comparison cannot proceed without it.
pub fn read_input(dir: &Path) -> Result<NamedTensor> {
    let path = dir.join(INPUT_DUMP);
    if !path.exists() {
        return Err(PipelineError::missing(path.display().to_string()));
    }
    read_tensor(&path)
}

/// Dump every output of one inference.
pub fn write_outputs(dir: &Path, result: &InferenceResult) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(PipelineError::io(dir))?;
    for (index, output) in result.outputs().iter().enumerate() {
        write_tensor(&dir.join(result_file_name(index, &output.name)), output)?;
    }
    info!(
        "dumped {} output tensors to {}",
        result.len(),
        dir.display()
    );
    Ok(())
}

/// Collect dumped outputs in declared order. A missing file becomes a
/// `None` slot; a present file whose recorded name contradicts the
/// declaration is refused.
pub fn read_outputs(
    dir: &Path,
    declared: &[TensorDescriptor],
) -> Result<Vec<Option<NamedTensor>>> {
    let mut outputs = Vec::with_capacity(declared.len());
    for (index, desc) in declared.iter().enumerate() {
        let path: PathBuf = dir.join(result_file_name(index, desc.name()));
        if !path.exists() {
            warn!("no dump for output {index} ({}), skipping", desc.name());
            outputs.push(None);
            continue;
        }
        let tensor = read_tensor(&path)?;
        if tensor.name != desc.name() {
            return Err(PipelineError::validation(format!(
                "dump {} records output {}, expected {}",
                path.display(),
                tensor.name,
                desc.name()
            )));
        }
        outputs.push(Some(tensor));
    }
    Ok(outputs)
}
