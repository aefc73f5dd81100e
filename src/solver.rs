//! The solver interface binding the BLAS frontend to the kernel
//! generators, and the memory-pattern registry built on top of it.
//!
//! A memory pattern is one strategy for staging operands (LDS-blocked,
//! image-backed, cached-global, ...) together with its kernel generator,
//! argument binder and thread-geometry calculator. Patterns of one BLAS
//! function share the fixed [`KernelExtra`] struct; the kernel cache
//! compares extras with the pattern's predicate, structural equality by
//! default.

use bitflags::bitflags;

use crate::cache::{extra_cmp_eq, ExtraCmpFn};
use crate::error::Result;
use crate::granulation::{DecompositionAxis, PGranularity, SubproblemDim};
use crate::kgen;
use crate::launch::KernelArg;
use crate::types::{BlasKargs, DataType, MatrixRole, Order, Side, Transpose, Uplo};

/// Index of a registered (function, pattern) pair in the kernel cache.
pub type SolverId = usize;

bitflags! {
    /// Solver capability flags.
    pub struct SolverFlags: u32 {
        /// Supports a 1D work space.
        const WSPACE_1D = 0x01;
        /// Supports a 2D work space.
        const WSPACE_2D = 0x02;
        /// Top-level input data blocks must be square.
        const TOP_INPUT_SQUARE_BLOCKS = 0x04;
    }
}

bitflags! {
    /// Kernel flavor bits recorded in [`KernelExtra`] and gated through
    /// build options.
    pub struct KernelExtraFlags: u32 {
        const TRANS_A = 0x0001;
        const CONJ_A = 0x0002;
        const TRANS_B = 0x0004;
        const CONJ_B = 0x0008;
        const COLUMN_MAJOR = 0x0010;
        const UPPER_TRIANG = 0x0020;
        const SIDE_RIGHT = 0x0040;
        const UNIT_DIAG = 0x0080;
        const BETA_ZERO = 0x0100;
        const INCX_NEG = 0x0200;
        const INCY_NEG = 0x0400;
        const CONJ_X = 0x0800;
    }
}

/// Pattern-specific kernel information attached to every cache record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelExtra {
    pub dtype: DataType,
    pub flags: KernelExtraFlags,
    pub vec_len: u32,
    /// Private discriminator a solver may use to distinguish otherwise
    /// identical kernels.
    pub solver_priv: u64,
}

impl KernelExtra {
    pub fn new(dtype: DataType) -> KernelExtra {
        KernelExtra {
            dtype,
            flags: KernelExtraFlags::empty(),
            vec_len: 1,
            solver_priv: 0,
        }
    }
}

/// Derives the flavor bits implied by the call arguments.
pub fn kextra_flags(args: &BlasKargs) -> KernelExtraFlags {
    let mut flags = KernelExtraFlags::empty();

    match args.trans_a {
        Transpose::NoTrans => {}
        Transpose::Trans => flags |= KernelExtraFlags::TRANS_A,
        Transpose::ConjTrans => {
            flags |= KernelExtraFlags::TRANS_A | KernelExtraFlags::CONJ_A;
        }
    }
    match args.trans_b {
        Transpose::NoTrans => {}
        Transpose::Trans => flags |= KernelExtraFlags::TRANS_B,
        Transpose::ConjTrans => {
            flags |= KernelExtraFlags::TRANS_B | KernelExtraFlags::CONJ_B;
        }
    }
    if args.order == Order::ColumnMajor {
        flags |= KernelExtraFlags::COLUMN_MAJOR;
    }
    if args.uplo == Uplo::Upper {
        flags |= KernelExtraFlags::UPPER_TRIANG;
    }
    if args.side == Side::Right {
        flags |= KernelExtraFlags::SIDE_RIGHT;
    }
    if args.diag == crate::types::Diag::Unit {
        flags |= KernelExtraFlags::UNIT_DIAG;
    }
    if args.beta.is_zero() {
        flags |= KernelExtraFlags::BETA_ZERO;
    }
    if args.incx < 0 {
        flags |= KernelExtraFlags::INCX_NEG;
    }
    if args.incy < 0 {
        flags |= KernelExtraFlags::INCY_NEG;
    }
    if args.conj_x {
        flags |= KernelExtraFlags::CONJ_X;
    }

    flags
}

/// Pattern ranking for the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatternPerf {
    NotSupported,
    Poor,
    Average,
    Good,
    Best,
}

/// Whether `check_calc_decomp` validates a decomposition or computes the
/// granularity fitting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckCalcMode {
    Check,
    Calc,
}

/// How an image-backed solver packs top-level blocks: how many lines of
/// one block are stored together and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImgPackMode {
    pub rate: u32,
    pub order: Order,
}

/// Compiler option assembly for a kernel build, formatted as `-D` style
/// defines plus free-form switches.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    opts: Vec<String>,
}

impl BuildOptions {
    pub fn new() -> BuildOptions {
        BuildOptions { opts: Vec::with_capacity(8) }
    }

    /// Adds `-D {ident}`.
    pub fn define(&mut self, ident: &str) -> &mut BuildOptions {
        self.opts.push(format!("-D {}", ident));
        self
    }

    /// Adds `-D {ident}={val}`.
    pub fn define_val(&mut self, ident: &str, val: impl std::fmt::Display)
            -> &mut BuildOptions {
        self.opts.push(format!("-D {}={}", ident, val));
        self
    }

    /// Adds a raw compiler switch.
    pub fn option(&mut self, opt: &str) -> &mut BuildOptions {
        self.opts.push(opt.to_string());
        self
    }

    pub fn is_defined(&self, ident: &str) -> bool {
        let exact = format!("-D {}", ident);
        let prefix = format!("-D {}=", ident);
        self.opts.iter().any(|o| *o == exact || o.starts_with(&prefix))
    }

    pub fn as_compiler_string(&self) -> String {
        self.opts.join(" ")
    }
}

/// Solver operations: everything the dispatch loop needs from one memory
/// pattern.
pub trait SolverOps: Send + Sync {
    /// Entry point of the generated compute kernel.
    fn kernel_name(&self) -> &'static str;

    /// Entry point of the operand-packing kernel for image-backed
    /// patterns.
    fn pack_kernel_name(&self) -> Option<&'static str> {
        None
    }

    /// Binds the packing kernel's arguments; only meaningful for
    /// patterns reporting a pack kernel.
    fn assign_pack_kargs(
        &self,
        _kargs: &mut Vec<KernelArg>,
        _args: &BlasKargs,
        _extra: &KernelExtra,
    ) {
    }

    /// Global thread counts for the packing kernel.
    fn calc_pack_threads(
        &self,
        _subdims: &[SubproblemDim],
        _pgran: &PGranularity,
        _args: &BlasKargs,
        _extra: &KernelExtra,
    ) -> [usize; 2] {
        [1, 1]
    }

    /// Generates kernel source into `out`. With `out` of `None` only the
    /// required upper-bound size is computed and reported; nothing else
    /// is touched. A provided buffer whose capacity is exceeded fails
    /// with [`kgen::KgenError::Overflow`].
    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize>;

    /// Binds the kernel arguments in their declared order.
    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, extra: &KernelExtra);

    /// Whether the LDS capacity fits the blocks implied by `subdims`.
    fn is_fit_to_lds(
        &self,
        subdims: &[SubproblemDim],
        dtype: DataType,
        lds_size: u64,
        args: &BlasKargs,
    ) -> bool;

    /// Performance estimation used to rank patterns for a call.
    fn pattern_perf(&self, flags: KernelExtraFlags, args: &BlasKargs) -> PatternPerf;

    /// Inner decomposition axis matching the fastest moving work
    /// dimension; meaningful for 2D decompositions only.
    fn inner_decomposition_axis(&self, _args: &BlasKargs) -> DecompositionAxis {
        DecompositionAxis::Y
    }

    /// Global thread counts per work dimension.
    fn calc_threads(
        &self,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &BlasKargs,
        extra: &KernelExtra,
    ) -> [usize; 2];

    /// Block packing mode for image-backed solvers.
    fn img_pack_mode(
        &self,
        _extra: &KernelExtra,
        _subdims: &[SubproblemDim],
        _data_id: MatrixRole,
    ) -> Option<ImgPackMode> {
        None
    }

    /// Supported work-space dimensionality and shape constraints.
    fn flags(&self) -> SolverFlags;

    /// Pattern-specific argument normalization. Must not change values
    /// visible through the API.
    fn fixup_args(
        &self,
        _args: &mut BlasKargs,
        _subdims: &mut [SubproblemDim],
        _extra: &mut KernelExtra,
    ) {
    }

    /// Default tiling for the problem in `args`.
    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        args: &BlasKargs,
    ) -> Result<()>;

    /// In `Check` mode validates a caller-supplied decomposition and its
    /// granulation; in `Calc` mode computes the granulation fitting the
    /// decomposition. Returns false when the decomposition is unusable.
    fn check_calc_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        dtype: DataType,
        mode: CheckCalcMode,
    ) -> bool;

    /// Appends the `-D` defines gating precision and flavor variants.
    fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs);

    /// Pattern-level vector-width choice, bounded by `vlen`. Patterns
    /// without vectorized emission stay scalar.
    fn select_vectorization(&self, _args: &BlasKargs, _vlen: u32) -> u32 {
        1
    }

    /// Extras predicate for the kernel cache.
    fn extra_cmp(&self) -> ExtraCmpFn {
        extra_cmp_eq
    }
}

/// A named memory pattern and its solver.
pub struct MemoryPattern {
    pub name: &'static str,
    /// Decomposition level count.
    pub nr_levels: u32,
    /// Level the problem is decomposed among compute units at.
    pub cu_level: u32,
    /// Level the problem is decomposed among threads at.
    pub th_level: u32,
    pub sops: &'static dyn SolverOps,
}

impl std::fmt::Debug for MemoryPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MemoryPattern")
            .field("name", &self.name)
            .field("nr_levels", &self.nr_levels)
            .finish()
    }
}

/// The pattern list of one BLAS function.
#[derive(Debug)]
pub struct FunctionPatterns {
    pub patterns: Vec<MemoryPattern>,
    /// Caller-forced default pattern index, if any.
    pub default_pattern: Option<usize>,
    /// Global solver id of each pattern, parallel to `patterns`.
    pub solver_ids: Vec<SolverId>,
}

/// Registry of patterns for every BLAS function, with a global solver-id
/// space shared with the kernel cache.
#[derive(Debug)]
pub struct SolverRegistry {
    funcs: Vec<FunctionPatterns>,
    nr_solvers: usize,
}

impl SolverRegistry {
    pub fn new(nr_funcs: usize) -> SolverRegistry {
        SolverRegistry {
            funcs: (0..nr_funcs)
                .map(|_| FunctionPatterns {
                    patterns: Vec::new(),
                    default_pattern: None,
                    solver_ids: Vec::new(),
                })
                .collect(),
            nr_solvers: 0,
        }
    }

    /// Registers a pattern for `func`, assigning it the next solver id.
    pub fn register(&mut self, func: usize, pattern: MemoryPattern) -> SolverId {
        let sid = self.nr_solvers;
        self.nr_solvers += 1;
        let entry = &mut self.funcs[func];
        entry.patterns.push(pattern);
        entry.solver_ids.push(sid);
        sid
    }

    pub fn function(&self, func: usize) -> &FunctionPatterns {
        &self.funcs[func]
    }

    pub fn set_default_pattern(&mut self, func: usize, pattern: Option<usize>) {
        self.funcs[func].default_pattern = pattern;
    }

    /// Total registered solvers; sizes the kernel cache.
    pub fn nr_solvers(&self) -> usize {
        self.nr_solvers
    }
}
