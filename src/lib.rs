//! Generated, cached BLAS kernels for OpenCL-class accelerators.
//!
//! The crate lowers BLAS calls (the Level-1/2/3 suite in four
//! precisions) to compute kernels generated from parameterized
//! templates, compiled once per (device, decomposition, flavor) and
//! reused through a size-bounded kernel cache.
//!
//! The interesting machinery sits between a call and the accelerator:
//!
//! * pattern selection — each function owns a ranked list of *memory
//!   patterns* (LDS-blocked, image-blocked, cached-global, ...), each a
//!   [`SolverOps`] bundling its kernel generator, argument binder and
//!   thread-geometry calculator;
//! * kernel generation — the [`kgen`] template engine substitutes
//!   element types, vector widths and tile sizes into kernel templates
//!   and emits the type-dependent helpers;
//! * caching — built programs are deduplicated in the [`KernelCache`]
//!   under a byte budget;
//! * launching — the [`launch`] engine binds arguments, stages host
//!   buffers and attributes any failure to the exact API call and
//!   argument.
//!
//! The accelerator itself is reached through the vendor-neutral traits
//! in [`compute`]; real API bindings implement them in their own
//! crates.
//!
//! All library state lives in a [`Library`] value:
//!
//! ```ignore
//! let lib = Library::setup(SetupConfig::from_env())?;
//! let event = lib.gemm::<f32>(Order::RowMajor, Transpose::NoTrans,
//!     Transpose::NoTrans, m, n, k, 1.0, &a, 0, lda, &b, 0, ldb, 0.0,
//!     &c, 0, ldc, &queues, &[])?;
//! event.wait()?;
//! ```

pub mod blas;
pub mod cache;
pub mod compute;
pub mod device;
pub mod error;
pub mod granulation;
pub mod kgen;
pub mod launch;
pub mod library;
pub mod program;
pub mod scimage;
pub mod solver;
pub mod types;

mod dispatch;
mod patterns;

#[cfg(test)]
mod tests;

pub use crate::blas::{BlasFunctionID, NR_BLAS_FUNCTIONS};
pub use crate::cache::{CacheAddError, KernelCache, KernelEntry, KernelKey};
pub use crate::device::{
    identify_device, DeviceCaps, DeviceChip, DeviceFamily, DeviceIdent, DeviceVendor,
    TargetDevice,
};
pub use crate::error::{Error, LaunchError, LaunchPhase, Result, Status};
pub use crate::granulation::{DecompositionAxis, PGranularity, SubproblemDim, MAX_SUBDIMS};
pub use crate::launch::{
    launch_kernel, HostBuf, KernelArg, KernelDesc, MemobjDir, MAX_ARG_SIZE, MAX_KERNEL_ARGS,
    MAX_WORK_DIM,
};
pub use crate::library::{DecomposeEvents, ImplementationVariant, Library, SetupConfig};
pub use crate::program::{build_from_binary, build_program, program_binary, program_binary_size};
pub use crate::scimage::{ScratchImageHandle, ScratchImages};
pub use crate::solver::{
    BuildOptions, CheckCalcMode, FunctionPatterns, ImgPackMode, KernelExtra, KernelExtraFlags,
    MemoryPattern, PatternPerf, SolverFlags, SolverId, SolverOps, SolverRegistry,
};
pub use crate::types::{
    ArgMultiplier, BlasKargs, BlasPrm, DataType, Diag, DoubleComplex, FloatComplex, MatrixRole,
    Order, Side, Transpose, Uplo,
};
