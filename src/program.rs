//! Compiling generated kernel source into device programs, and round
//! tripping programs through their saved device binaries.

use log::warn;

use crate::compute::{ApiError, Context, Device, Program};
use crate::error::{Error, Result};

/// Compiles `source` for `device`.
///
/// A compile error fails with [`Error::BuildProgramFailure`] carrying the
/// device compiler log; the log is also copied into `log_buf` when one is
/// provided. Host-side allocation failures surface as
/// [`Error::OutOfHostMemory`] — a distinct kind, never conflated with a
/// failed build.
pub fn build_program(
    context: &Context,
    device: &Device,
    source: &str,
    options: &str,
    log_buf: Option<&mut String>,
) -> Result<Program> {
    let program = context.create_program_with_source(source)?;

    match program.build(device, options) {
        Ok(()) => Ok(program),
        Err(ApiError::BuildProgramFailure) => {
            let log = program.build_log(device).unwrap_or_default();
            warn!("program build failed: {}", log.lines().next().unwrap_or(""));
            if let Some(buf) = log_buf {
                buf.clear();
                buf.push_str(&log);
            }
            Err(Error::BuildProgramFailure { log })
        }
        Err(err) => Err(err.into()),
    }
}

/// Builds a program from a previously saved device binary.
pub fn build_from_binary(context: &Context, device: &Device, binary: &[u8]) -> Result<Program> {
    let program = context.create_program_with_binary(device, binary)?;
    match program.build(device, "") {
        Ok(()) => Ok(program),
        Err(ApiError::BuildProgramFailure) => {
            let log = program.build_log(device).unwrap_or_default();
            Err(Error::BuildProgramFailure { log })
        }
        Err(err) => Err(err.into()),
    }
}

/// Size in bytes of the first non-empty per-device binary.
pub fn program_binary_size(program: &Program) -> Result<usize> {
    let sizes = program.binary_sizes()?;
    Ok(sizes.into_iter().find(|&s| s != 0).unwrap_or(0))
}

/// The first non-empty per-device binary. The caller owns the returned
/// allocation.
pub fn program_binary(program: &Program) -> Result<Vec<u8>> {
    let binaries = program.binaries()?;
    Ok(binaries
        .into_iter()
        .find(|b| !b.is_empty())
        .unwrap_or_default())
}
