//! Symmetric rank-k and rank-2k update patterns.
//!
//! Both write only the stored triangle of C. The single cached-global
//! pattern tiles the result like gemm and masks off elements on the
//! wrong side of the diagonal.

use super::{
    block_threads, check_calc_block_decomp, default_block_decomp, engine_for, finish_gen,
    flavor_build_options, zero_literal, COMMON_DEFINES,
};
use crate::blas::BlasFunctionID;
use crate::error::Result;
use crate::granulation::{PGranularity, SubproblemDim};
use crate::kgen;
use crate::launch::KernelArg;
use crate::solver::{
    BuildOptions, CheckCalcMode, KernelExtra, KernelExtraFlags, MemoryPattern, PatternPerf,
    SolverFlags, SolverOps, SolverRegistry,
};
use crate::types::{BlasKargs, DataType};

/// `IDXA(i, p, ld)` addresses op(A)[i][p] where op(A) is N x K.
const SYRK_DEFINES: &str = "\
#ifdef TRANS_A
#define IDXA(i, p, ld) IDX(p, i, ld)
#else
#define IDXA(i, p, ld) IDX(i, p, ld)
#endif
#ifdef UPPER_TRIANG
#define OUTSIDE(i, j) ((j) < (i))
#else
#define OUTSIDE(i, j) ((j) > (i))
#endif
";

const SYRK_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint N,
    uint K,
    %TYPE alpha,
    %TYPE beta,
    __global const %TYPE *A,
    uint lda,
    uint offA,
    __global %TYPE *C,
    uint ldc,
    uint offC)
{
    A += offA;
    C += offC;

    uint row = get_global_id(0) * %ITEMY;
    uint col = get_global_id(1) * %ITEMX;

    for (uint i = row; i < min(row + %ITEMY, N); i++) {
        for (uint j = col; j < min(col + %ITEMX, N); j++) {
            if (OUTSIDE(i, j)) {
                continue;
            }
            %TYPE acc = %ZERO;
            for (uint p = 0; p < K; p++) {
                %TYPE a = A[IDXA(i, p, lda)];
                %TYPE b = A[IDXA(j, p, lda)];
                %MAD(acc, a, b);
            }
            %TYPE v;
            %MUL(v, alpha, acc);
#ifndef BETA_ZERO
            %TYPE c0 = C[IDX(i, j, ldc)];
            %TYPE t;
            %MUL(t, beta, c0);
            %ADD(v, v, t);
#endif
            C[IDX(i, j, ldc)] = v;
        }
    }
}
";

const SYR2K_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint N,
    uint K,
    %TYPE alpha,
    %TYPE beta,
    __global const %TYPE *A,
    uint lda,
    uint offA,
    __global const %TYPE *B,
    uint ldb,
    uint offB,
    __global %TYPE *C,
    uint ldc,
    uint offC)
{
    A += offA;
    B += offB;
    C += offC;

    uint row = get_global_id(0) * %ITEMY;
    uint col = get_global_id(1) * %ITEMX;

    for (uint i = row; i < min(row + %ITEMY, N); i++) {
        for (uint j = col; j < min(col + %ITEMX, N); j++) {
            if (OUTSIDE(i, j)) {
                continue;
            }
            %TYPE acc = %ZERO;
            for (uint p = 0; p < K; p++) {
                %MAD(acc, A[IDXA(i, p, lda)], B[IDXA(j, p, ldb)]);
                %MAD(acc, B[IDXA(i, p, ldb)], A[IDXA(j, p, lda)]);
            }
            %TYPE v;
            %MUL(v, alpha, acc);
#ifndef BETA_ZERO
            %TYPE c0 = C[IDX(i, j, ldc)];
            %TYPE t;
            %MUL(t, beta, c0);
            %ADD(v, v, t);
#endif
            C[IDX(i, j, ldc)] = v;
        }
    }
}
";

fn gen_rank_update(
    template: &str,
    kname: &str,
    out: Option<&mut String>,
    subdims: &[SubproblemDim],
    pgran: &PGranularity,
    extra: &KernelExtra,
) -> kgen::Result<usize> {
    if subdims.len() < 2 {
        return Err(kgen::KgenError::InvalidArg);
    }

    let mut engine = engine_for(extra, pgran);
    engine.put("%KNAME", kname);
    engine.put("%ZERO", zero_literal(extra.dtype));
    engine.put("%ITEMY", &subdims[1].item_y.to_string());
    engine.put("%ITEMX", &subdims[1].item_x.to_string());

    let body = engine.expand(template)?;
    let mut source = String::with_capacity(body.len() + 1024);
    source.push_str(COMMON_DEFINES);
    source.push_str(SYRK_DEFINES);
    source.push('\n');
    source.push_str(&engine.helper_preamble());
    source.push_str(&body);

    finish_gen(out, source)
}

macro_rules! rank_update_solver {
    ($name:ident, $kname:expr, $template:expr, $with_b:expr) => {
        #[derive(Debug)]
        struct $name;

        impl SolverOps for $name {
            fn kernel_name(&self) -> &'static str {
                $kname
            }

            fn gen_kernel(
                &self,
                out: Option<&mut String>,
                subdims: &[SubproblemDim],
                pgran: &PGranularity,
                extra: &KernelExtra,
            ) -> kgen::Result<usize> {
                gen_rank_update($template, $kname, out, subdims, pgran, extra)
            }

            fn assign_kargs(
                &self,
                kargs: &mut Vec<KernelArg>,
                args: &BlasKargs,
                _extra: &KernelExtra,
            ) {
                kargs.clear();
                kargs.push(KernelArg::size(args.n));
                kargs.push(KernelArg::size(args.k));
                kargs.push(KernelArg::multiplier(&args.alpha));
                kargs.push(KernelArg::multiplier(&args.beta));
                kargs.push(KernelArg::mem(args.a.clone().expect("matrix A is bound")));
                kargs.push(KernelArg::size(args.lda));
                kargs.push(KernelArg::size(args.off_a));
                if $with_b {
                    kargs.push(KernelArg::mem(args.b.clone().expect("matrix B is bound")));
                    kargs.push(KernelArg::size(args.ldb));
                    kargs.push(KernelArg::size(args.off_bx));
                }
                kargs.push(KernelArg::mem(args.c.clone().expect("matrix C is bound")));
                kargs.push(KernelArg::size(args.ldc));
                kargs.push(KernelArg::size(args.off_cy));
            }

            fn is_fit_to_lds(
                &self,
                _subdims: &[SubproblemDim],
                _dtype: DataType,
                _lds_size: u64,
                _args: &BlasKargs,
            ) -> bool {
                true
            }

            fn pattern_perf(&self, _flags: KernelExtraFlags, _args: &BlasKargs) -> PatternPerf {
                PatternPerf::Good
            }

            fn calc_threads(
                &self,
                subdims: &[SubproblemDim],
                pgran: &PGranularity,
                args: &BlasKargs,
                _extra: &KernelExtra,
            ) -> [usize; 2] {
                block_threads(args.n, args.n, subdims, pgran)
            }

            fn flags(&self) -> SolverFlags {
                SolverFlags::WSPACE_2D | SolverFlags::TOP_INPUT_SQUARE_BLOCKS
            }

            fn default_decomp(
                &self,
                pgran: &mut PGranularity,
                subdims: &mut [SubproblemDim],
                _args: &BlasKargs,
            ) -> Result<()> {
                default_block_decomp(pgran, subdims, [8, 8], 4, 8);
                Ok(())
            }

            fn check_calc_decomp(
                &self,
                pgran: &mut PGranularity,
                subdims: &mut [SubproblemDim],
                dtype: DataType,
                mode: CheckCalcMode,
            ) -> bool {
                check_calc_block_decomp(pgran, subdims, dtype, mode)
            }

            fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs) {
                flavor_build_options(opts, args);
            }
        }
    };
}

rank_update_solver!(SyrkCached, "syrkBlock", SYRK_TEMPLATE, false);
rank_update_solver!(Syr2kCached, "syr2kBlock", SYR2K_TEMPLATE, true);

static SYRK_CACHED: SyrkCached = SyrkCached;
static SYR2K_CACHED: Syr2kCached = Syr2kCached;

pub(super) fn register(reg: &mut SolverRegistry) {
    reg.register(BlasFunctionID::Syrk.index(), MemoryPattern {
        name: "blocked syrk with caching",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &SYRK_CACHED,
    });
    reg.register(BlasFunctionID::Syr2k.index(), MemoryPattern {
        name: "blocked syr2k with caching",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &SYR2K_CACHED,
    });
}
