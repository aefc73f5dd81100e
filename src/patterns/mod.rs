//! Memory patterns: the concrete solvers registered for each BLAS
//! function, plus the generation and decomposition helpers they share.

mod gemm;
mod gemv;
mod syrk;
mod trxm;
mod vector;

use crate::blas::NR_BLAS_FUNCTIONS;
use crate::granulation::{PGranularity, SubproblemDim};
use crate::kgen::{self, KgenError, TemplateEngine};
use crate::solver::{
    kextra_flags, BuildOptions, CheckCalcMode, KernelExtra, KernelExtraFlags, SolverRegistry,
};
use crate::types::{BlasKargs, DataType};

/// Builds the registry of every pattern the library ships.
pub fn build_registry() -> SolverRegistry {
    let mut reg = SolverRegistry::new(NR_BLAS_FUNCTIONS);
    gemm::register(&mut reg);
    trxm::register(&mut reg);
    syrk::register(&mut reg);
    gemv::register(&mut reg);
    vector::register(&mut reg);
    reg
}

pub(crate) fn round_up(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) / multiple * multiple
}

pub(crate) fn ceil_div(value: usize, divisor: usize) -> usize {
    (value + divisor - 1) / divisor
}

/// Completes the two-phase generator contract: size probe with no
/// buffer, capacity-checked fill otherwise.
pub(crate) fn finish_gen(out: Option<&mut String>, source: String) -> kgen::Result<usize> {
    let len = source.len();
    match out {
        None => Ok(len),
        Some(buf) => {
            if buf.capacity() < len {
                return Err(KgenError::Overflow);
            }
            buf.clear();
            buf.push_str(&source);
            Ok(len)
        }
    }
}

/// Template engine configured for one kernel build.
pub(crate) fn engine_for(extra: &KernelExtra, pgran: &PGranularity) -> TemplateEngine {
    TemplateEngine::new(
        extra.dtype,
        extra.vec_len,
        true,
        true,
        pgran.wg_total(),
        pgran.wf_size,
    )
}

/// Zero literal of the element type, for `%ZERO`.
pub(crate) fn zero_literal(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Float => "0.0f",
        DataType::Double => "0.0",
        DataType::ComplexFloat => "(float2)(0.0f, 0.0f)",
        DataType::ComplexDouble => "(double2)(0.0, 0.0)",
        DataType::UnsignedInt => "0u",
    }
}

/// One literal of the element type, for `%ONE`.
pub(crate) fn one_literal(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Float => "1.0f",
        DataType::Double => "1.0",
        DataType::ComplexFloat => "(float2)(1.0f, 0.0f)",
        DataType::ComplexDouble => "(double2)(1.0, 0.0)",
        DataType::UnsignedInt => "1u",
    }
}

/// Preamble shared by every generated program: the double-precision
/// pragma and the storage-order index macros.
pub(crate) const COMMON_DEFINES: &str = "\
#ifdef DOUBLE_PRECISION
#pragma OPENCL EXTENSION cl_khr_fp64 : enable
#endif

#ifdef COLUMN_MAJOR
#define IDX(r, c, ld) ((c) * (ld) + (r))
#else
#define IDX(r, c, ld) ((r) * (ld) + (c))
#endif
#define VIDX(i, inc, n) ((inc) >= 0 ? (uint)((int)(i) * (inc)) \\
    : (uint)((int)((n) - 1 - (i)) * -(inc)))
";

/// `-D` defines for the precision and flavor bits implied by the call.
pub(crate) fn flavor_build_options(opts: &mut BuildOptions, args: &BlasKargs) {
    if args.dtype.is_double_based() {
        opts.define("DOUBLE_PRECISION");
    }
    if args.dtype.is_complex() {
        opts.define("COMPLEX");
    }

    let flags = kextra_flags(args);
    const NAMED: [(KernelExtraFlags, &str); 10] = [
        (KernelExtraFlags::TRANS_A, "TRANS_A"),
        (KernelExtraFlags::CONJ_A, "CONJ_A"),
        (KernelExtraFlags::TRANS_B, "TRANS_B"),
        (KernelExtraFlags::CONJ_B, "CONJ_B"),
        (KernelExtraFlags::COLUMN_MAJOR, "COLUMN_MAJOR"),
        (KernelExtraFlags::UPPER_TRIANG, "UPPER_TRIANG"),
        (KernelExtraFlags::SIDE_RIGHT, "SIDE_RIGHT"),
        (KernelExtraFlags::UNIT_DIAG, "UNIT_DIAG"),
        (KernelExtraFlags::BETA_ZERO, "BETA_ZERO"),
        (KernelExtraFlags::CONJ_X, "CONJ_X"),
    ];
    for (bit, name) in NAMED.iter() {
        if flags.contains(*bit) {
            opts.define(name);
        }
    }
}

/// Default two-level blocked decomposition: a work-group tile of
/// `wg[0] * item` by `wg[1] * item`, each item evaluating an
/// `item` x `item` square over accumulation blocks of `bwidth`.
pub(crate) fn default_block_decomp(
    pgran: &mut PGranularity,
    subdims: &mut [SubproblemDim],
    wg: [u32; 2],
    item: usize,
    bwidth: usize,
) {
    pgran.wg_size = wg;
    pgran.wg_dim = 2;

    let tile_y = wg[0] as usize * item;
    let tile_x = wg[1] as usize * item;
    subdims[0] = SubproblemDim {
        x: tile_x,
        y: tile_y,
        bwidth,
        item_x: tile_x,
        item_y: tile_y,
    };
    subdims[1] = SubproblemDim {
        x: item,
        y: item,
        bwidth,
        item_x: item,
        item_y: item,
    };
}

/// Shared `check_calc_decomp` for the two-level blocked patterns.
pub(crate) fn check_calc_block_decomp(
    pgran: &mut PGranularity,
    subdims: &mut [SubproblemDim],
    _dtype: DataType,
    mode: CheckCalcMode,
) -> bool {
    if subdims.len() < 2 {
        return false;
    }
    let group = subdims[0];
    let item = subdims[1];

    if !group.is_consistent() || !item.is_consistent() {
        return false;
    }
    if item.item_y == 0
        || item.item_x == 0
        || group.y % item.item_y != 0
        || group.x % item.item_x != 0
        || group.bwidth != item.bwidth
    {
        return false;
    }

    let wg_y = (group.y / item.item_y) as u32;
    let wg_x = (group.x / item.item_x) as u32;

    match mode {
        CheckCalcMode::Calc => {
            pgran.wg_size = [wg_y, wg_x];
            pgran.wg_dim = 2;
            pgran.is_valid()
        }
        CheckCalcMode::Check => {
            pgran.wg_dim == 2
                && pgran.wg_size == [wg_y, wg_x]
                && pgran.is_valid()
        }
    }
}

/// Global thread counts for a two-level blocked pattern over an
/// `m` x `n` result.
pub(crate) fn block_threads(
    m: usize,
    n: usize,
    subdims: &[SubproblemDim],
    pgran: &PGranularity,
) -> [usize; 2] {
    let item = &subdims[1];
    [
        round_up(ceil_div(m, item.item_y.max(1)), pgran.wg_size[0] as usize),
        round_up(ceil_div(n, item.item_x.max(1)), pgran.wg_size[1] as usize),
    ]
}

/// Halves the candidate width until every leading dimension and offset
/// aligns with it.
pub(crate) fn select_vec_by_alignment(vlen: u32, lds: &[usize], offsets: &[usize]) -> u32 {
    let mut v = vlen.max(1);
    while v > 1 {
        let aligned = lds.iter().all(|&x| x % v as usize == 0)
            && offsets.iter().all(|&x| x % v as usize == 0);
        if aligned {
            break;
        }
        v /= 2;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::CheckCalcMode;

    #[test]
    fn finish_gen_probe_and_fill() {
        let src = "__kernel void k(void) {}".to_string();
        let size = finish_gen(None, src.clone()).unwrap();
        assert_eq!(size, src.len());

        let mut buf = String::with_capacity(size);
        assert_eq!(finish_gen(Some(&mut buf), src.clone()).unwrap(), size);
        assert_eq!(buf, src);

        let mut small = String::new();
        small.shrink_to_fit();
        assert_eq!(finish_gen(Some(&mut small), src), Err(KgenError::Overflow));
    }

    #[test]
    fn block_decomp_round_trip() {
        let mut pgran = PGranularity::default();
        pgran.max_work_group_size = 256;
        let mut subdims = [SubproblemDim::default(); 4];
        default_block_decomp(&mut pgran, &mut subdims, [8, 8], 4, 8);

        assert_eq!(subdims[0].y, 32);
        assert_eq!(subdims[0].x, 32);
        assert!(check_calc_block_decomp(
            &mut pgran,
            &mut subdims,
            DataType::Float,
            CheckCalcMode::Check
        ));

        // Recalculating granulation from the subdims gives the same
        // work-group shape.
        let mut calc = PGranularity::default();
        calc.max_work_group_size = 256;
        assert!(check_calc_block_decomp(
            &mut calc,
            &mut subdims,
            DataType::Float,
            CheckCalcMode::Calc
        ));
        assert_eq!(calc.wg_size, [8, 8]);
    }

    #[test]
    fn mismatched_granulation_fails_check() {
        let mut pgran = PGranularity::default();
        pgran.max_work_group_size = 256;
        let mut subdims = [SubproblemDim::default(); 4];
        default_block_decomp(&mut pgran, &mut subdims, [8, 8], 4, 8);
        pgran.wg_size = [16, 4];
        assert!(!check_calc_block_decomp(
            &mut pgran,
            &mut subdims,
            DataType::Float,
            CheckCalcMode::Check
        ));
    }

    #[test]
    fn alignment_vectorization() {
        assert_eq!(select_vec_by_alignment(4, &[64, 128], &[0, 16]), 4);
        assert_eq!(select_vec_by_alignment(4, &[64, 130], &[0]), 2);
        assert_eq!(select_vec_by_alignment(4, &[63], &[0]), 1);
    }

    #[test]
    fn registry_covers_core_functions() {
        use crate::blas::BlasFunctionID;

        let reg = build_registry();
        assert!(reg.function(BlasFunctionID::Gemm.index()).patterns.len() >= 3);
        assert!(reg.function(BlasFunctionID::Trsm.index()).patterns.len() >= 3);
        assert!(!reg.function(BlasFunctionID::Axpy.index()).patterns.is_empty());
        assert!(!reg.function(BlasFunctionID::Iamax.index()).patterns.is_empty());
        assert!(reg.nr_solvers() > 10);
    }
}
