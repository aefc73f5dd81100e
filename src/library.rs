//! Library lifecycle and configuration.
//!
//! All process-wide state of the original C library (kernel cache,
//! scratch-image pool, decompose-events buffer, device identities,
//! pattern defaults) lives in one [`Library`] value created by
//! [`Library::setup`] and released by [`Library::teardown`] (or drop).
//! Independent `Library` instances are fully isolated.

use std::collections::HashMap;
use std::env;
use std::sync::Mutex;

use log::debug;

use crate::blas::BlasFunctionID;
use crate::cache::KernelCache;
use crate::compute::{Context, Device, Event};
use crate::device::{identify_device, TargetDevice};
use crate::error::{Error, Result};
use crate::patterns;
use crate::scimage::{ScratchImageHandle, ScratchImages};
use crate::solver::SolverRegistry;

const GEMM_IMPL_VAR: &str = "AMD_CLBLAS_GEMM_IMPLEMENTATION";
const TRMM_IMPL_VAR: &str = "AMD_CLBLAS_TRMM_IMPLEMENTATION";
const TRSM_IMPL_VAR: &str = "AMD_CLBLAS_TRSM_IMPLEMENTATION";

/// Growth step of the decompose-events buffer.
const ALLOCATION_STEP: usize = 100;

/// Events of intermediate decomposition steps (operand packing and the
/// like). Grows in fixed steps under its mutex and never shrinks before
/// teardown.
#[derive(Debug)]
pub struct DecomposeEvents {
    events: Mutex<Vec<Event>>,
}

impl DecomposeEvents {
    fn new() -> DecomposeEvents {
        DecomposeEvents {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, event: Event) {
        let mut events = self.events.lock().unwrap();
        if events.len() == events.capacity() {
            events.reserve_exact(ALLOCATION_STEP);
        }
        events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Explicit pattern choice for the functions with selectable
/// implementations. The image-backed trmm/trsm variants share the
/// cached pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplementationVariant {
    DefaultGemm,
    LdsBlockGemm,
    ImageBlockGemm,
    BlockGemmWithCaching,
    DefaultTrmm,
    LdsBlockTrmm,
    ImageBlockTrmm,
    BlockTrmmWithCaching,
    DefaultTrsm,
    LdsBlockTrsm,
    ImageBlockTrsm,
    BlockTrsmWithCaching,
    BlockTrsmWithoutLds,
}

/// Setup-time configuration; the single place the `AMD_CLBLAS_*`
/// environment variables are folded into.
#[derive(Debug, Clone, Default)]
pub struct SetupConfig {
    /// The scratch-image capability bit: enables the pool and with it
    /// the image-backed patterns.
    pub scratch_images: bool,
    /// Kernel-cache byte limit; zero leaves the cache unbounded.
    pub cache_size_limit: usize,
    pub gemm_pattern: Option<usize>,
    pub trmm_pattern: Option<usize>,
    pub trsm_pattern: Option<usize>,
}

impl SetupConfig {
    /// Reads the legacy implementation-selection environment variables.
    /// A value of "1" for any of them additionally enables scratch
    /// images, as the original library did.
    pub fn from_env() -> SetupConfig {
        let gemm = env::var(GEMM_IMPL_VAR).ok();
        let trmm = env::var(TRMM_IMPL_VAR).ok();
        let trsm = env::var(TRSM_IMPL_VAR).ok();

        let scratch_images = [&gemm, &trmm, &trsm]
            .iter()
            .any(|v| v.as_deref() == Some("1"));

        SetupConfig {
            scratch_images,
            cache_size_limit: 0,
            gemm_pattern: match gemm.as_deref() {
                Some("0") => Some(0),
                Some("1") => Some(1),
                Some("2") => Some(2),
                _ => None,
            },
            trmm_pattern: match trmm.as_deref() {
                Some("0") => Some(0),
                // The image variant falls back to the cached pattern.
                Some("1") | Some("2") => Some(1),
                _ => None,
            },
            trsm_pattern: match trsm.as_deref() {
                Some("0") => Some(0),
                Some("1") | Some("3") => Some(1),
                Some("2") => Some(2),
                _ => None,
            },
        }
    }
}

/// The library context threaded through every BLAS call.
#[derive(Debug)]
pub struct Library {
    solvers: SolverRegistry,
    kernel_cache: KernelCache,
    scimages: ScratchImages,
    targets: Mutex<HashMap<Device, TargetDevice>>,
    decompose_events: DecomposeEvents,
}

impl Library {
    /// Initializes the pattern registry, kernel cache and scratch-image
    /// pool.
    pub fn setup(config: SetupConfig) -> Result<Library> {
        let mut solvers = patterns::build_registry();

        let defaults = [
            (BlasFunctionID::Gemm, config.gemm_pattern),
            (BlasFunctionID::Trmm, config.trmm_pattern),
            (BlasFunctionID::Trsm, config.trsm_pattern),
        ];
        for (func, pattern) in defaults.iter() {
            if let Some(idx) = pattern {
                if *idx >= solvers.function(func.index()).patterns.len() {
                    return Err(Error::InvalidValue("default pattern index"));
                }
            }
            solvers.set_default_pattern(func.index(), *pattern);
        }

        let kernel_cache = KernelCache::new(solvers.nr_solvers(), config.cache_size_limit);
        debug!(
            "library setup: {} solvers, scratch images {}",
            solvers.nr_solvers(),
            if config.scratch_images { "enabled" } else { "disabled" },
        );

        Ok(Library {
            solvers,
            kernel_cache,
            scimages: ScratchImages::new(config.scratch_images),
            targets: Mutex::new(HashMap::new()),
            decompose_events: DecomposeEvents::new(),
        })
    }

    /// Convenience constructor honoring the environment variables.
    pub fn setup_from_env() -> Result<Library> {
        Library::setup(SetupConfig::from_env())
    }

    /// Releases every cache, pool and buffer. Kernels still referenced
    /// by in-flight callers survive until those references drop.
    pub fn teardown(self) {
        self.kernel_cache.clean();
    }

    /// Forces the default memory pattern for gemm, trmm or trsm.
    pub fn select_implementation(&mut self, variant: ImplementationVariant) {
        use self::ImplementationVariant::*;

        let (func, pattern) = match variant {
            DefaultGemm => (BlasFunctionID::Gemm, None),
            LdsBlockGemm => (BlasFunctionID::Gemm, Some(0)),
            ImageBlockGemm => (BlasFunctionID::Gemm, Some(1)),
            BlockGemmWithCaching => (BlasFunctionID::Gemm, Some(2)),
            DefaultTrmm => (BlasFunctionID::Trmm, None),
            LdsBlockTrmm => (BlasFunctionID::Trmm, Some(0)),
            ImageBlockTrmm | BlockTrmmWithCaching => (BlasFunctionID::Trmm, Some(1)),
            DefaultTrsm => (BlasFunctionID::Trsm, None),
            LdsBlockTrsm => (BlasFunctionID::Trsm, Some(0)),
            ImageBlockTrsm | BlockTrsmWithCaching => (BlasFunctionID::Trsm, Some(1)),
            BlockTrsmWithoutLds => (BlasFunctionID::Trsm, Some(2)),
        };
        self.solvers.set_default_pattern(func.index(), pattern);
    }

    /// Attaches a scratch image to the pool; a disabled pool reports
    /// success without a handle.
    pub fn add_scratch_image(
        &self,
        context: &Context,
        width: usize,
        height: usize,
    ) -> Result<Option<ScratchImageHandle>> {
        self.scimages.add(context, width, height)
    }

    pub fn remove_scratch_image(&self, handle: ScratchImageHandle) -> Result<()> {
        self.scimages.remove(handle)
    }

    /// The probed identity of `device`, cached per handle.
    pub fn target_device(&self, device: &Device) -> Result<TargetDevice> {
        let mut targets = self.targets.lock().unwrap();
        if let Some(target) = targets.get(device) {
            return Ok(target.clone());
        }
        let target = identify_device(device)?;
        targets.insert(device.clone(), target.clone());
        Ok(target)
    }

    pub fn kernel_cache(&self) -> &KernelCache {
        &self.kernel_cache
    }

    pub fn scratch_images(&self) -> &ScratchImages {
        &self.scimages
    }

    pub fn decompose_events(&self) -> &DecomposeEvents {
        &self.decompose_events
    }

    pub(crate) fn solvers(&self) -> &SolverRegistry {
        &self.solvers
    }
}
