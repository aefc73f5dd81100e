//! Standard error and status types for ocl-blas.

use crate::compute::ApiError;
use crate::kgen::KgenError;
use crate::types::DataType;

pub type Result<T> = std::result::Result<T, Error>;

/// The status surface exposed to C-style callers.
///
/// Every [`Error`] maps onto exactly one of these; the richer error value
/// keeps the diagnostic payload (build logs, failing argument indices)
/// that a bare status cannot carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    InvalidValue,
    InvalidOrder,
    InvalidLeadingDim,
    InvalidIncrement,
    InvalidOffset,
    NotInitialized,
    AlreadyInitialized,
    OutOfHostMemory,
    OutOfResources,
    CompilerNotAvailable,
    BuildProgramFailure,
    LaunchFailure,
    UnsupportedPrecision,
}

/// The phase of a kernel launch at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchPhase {
    SetArgs,
    EnqueueWrite,
    EnqueueKernel,
    Profiling,
    EnqueueRead,
}

/// A launch failure pinned to the compute-API call which caused it.
///
/// `wrong_arg` is set for the per-argument phases (`SetArgs`,
/// `EnqueueWrite`, `EnqueueRead`) and names the argument index whose
/// processing failed.
#[derive(Debug)]
pub struct LaunchError {
    pub phase: LaunchPhase,
    pub wrong_arg: Option<u32>,
    pub source: ApiError,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "kernel launch failed during {:?}", self.phase)?;
        if let Some(idx) = self.wrong_arg {
            write!(f, " (argument {})", idx)?;
        }
        write!(f, ": {}", self.source)
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// An enum covering validation, lifecycle, resource, compilation and
/// execution failures.
///
/// Implements the usual error traits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid value for parameter '{0}'")]
    InvalidValue(&'static str),
    #[error("invalid matrix order")]
    InvalidOrder,
    #[error("invalid leading dimension '{name}': {ld} (minimum {min})")]
    InvalidLeadingDim {
        name: &'static str,
        ld: usize,
        min: usize,
    },
    #[error("invalid increment '{0}'")]
    InvalidIncrement(&'static str),
    #[error("invalid offset '{name}': region [{offset}, {offset} + {len}) exceeds \
        a buffer of {buf_len} elements")]
    InvalidOffset {
        name: &'static str,
        offset: usize,
        len: usize,
        buf_len: usize,
    },
    #[error("the library has not been set up")]
    NotInitialized,
    #[error("the library has already been set up")]
    AlreadyInitialized,
    #[error("host memory allocation failed")]
    OutOfHostMemory,
    #[error("device resources exhausted")]
    OutOfResources,
    #[error("no kernel compiler is available on the device")]
    CompilerNotAvailable,
    #[error("program build failed:\n{log}")]
    BuildProgramFailure { log: String },
    #[error("{0}")]
    Launch(#[from] LaunchError),
    #[error("data type {0:?} is not supported by the device")]
    UnsupportedPrecision(DataType),
    #[error("kernel generation failed: {0}")]
    Kgen(#[from] KgenError),
    #[error("{0}")]
    Api(ApiError),
}

impl Error {
    /// Returns the flat status code corresponding to this error.
    pub fn status(&self) -> Status {
        match *self {
            Error::InvalidValue(_) => Status::InvalidValue,
            Error::InvalidOrder => Status::InvalidOrder,
            Error::InvalidLeadingDim { .. } => Status::InvalidLeadingDim,
            Error::InvalidIncrement(_) => Status::InvalidIncrement,
            Error::InvalidOffset { .. } => Status::InvalidOffset,
            Error::NotInitialized => Status::NotInitialized,
            Error::AlreadyInitialized => Status::AlreadyInitialized,
            Error::OutOfHostMemory => Status::OutOfHostMemory,
            Error::OutOfResources => Status::OutOfResources,
            Error::CompilerNotAvailable => Status::CompilerNotAvailable,
            Error::BuildProgramFailure { .. } => Status::BuildProgramFailure,
            Error::Launch(_) => Status::LaunchFailure,
            Error::UnsupportedPrecision(_) => Status::UnsupportedPrecision,
            Error::Kgen(KgenError::OutOfMemory) => Status::OutOfHostMemory,
            Error::Kgen(_) => Status::BuildProgramFailure,
            Error::Api(ref err) => err.status(),
        }
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Error {
        match err {
            ApiError::OutOfHostMemory => Error::OutOfHostMemory,
            ApiError::OutOfResources => Error::OutOfResources,
            ApiError::CompilerNotAvailable => Error::CompilerNotAvailable,
            other => Error::Api(other),
        }
    }
}
