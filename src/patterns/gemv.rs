//! Matrix-vector patterns: the global-cached line solvers for gemv and
//! symv. One work item accumulates one element of y; contiguous rows
//! get vectorized loads when alignment allows.

use super::{
    ceil_div, engine_for, finish_gen, flavor_build_options, round_up, select_vec_by_alignment,
    zero_literal, COMMON_DEFINES,
};
use crate::blas::matrix_dims::kargs_to_prob_dims;
use crate::blas::BlasFunctionID;
use crate::error::Result;
use crate::granulation::{PGranularity, SubproblemDim};
use crate::kgen;
use crate::launch::KernelArg;
use crate::solver::{
    BuildOptions, CheckCalcMode, KernelExtra, KernelExtraFlags, MemoryPattern, PatternPerf,
    SolverFlags, SolverOps, SolverRegistry,
};
use crate::types::{BlasKargs, DataType, Order, Transpose};

const GEMV_DEFINES: &str = "\
#ifdef TRANS_A
#define ELTA(r, p, ld) IDX(p, r, ld)
#else
#define ELTA(r, p, ld) IDX(r, p, ld)
#endif
";

const GEMV_HEAD: &str = "\
__kernel void %KNAME(
    uint M,
    uint N,
    %TYPE alpha,
    __global const %TYPE *A,
    uint lda,
    uint offA,
    __global const %TYPE *X,
    uint offx,
    int incx,
    %TYPE beta,
    __global %TYPE *Y,
    uint offy,
    int incy)
{
    A += offA;
    X += offx;
    Y += offy;
#ifdef TRANS_A
    uint rows = N;
    uint len = M;
#else
    uint rows = M;
    uint len = N;
#endif
    uint r = get_global_id(0);
    if (r >= rows) {
        return;
    }
    %TYPE acc = %ZERO;
";

/// Scalar accumulation; handles every transpose/order/stride flavor.
const GEMV_SCALAR_LOOP: &str = "\
    for (uint p = 0; p < len; p++) {
        %TYPE a = A[ELTA(r, p, lda)];
#ifdef CONJ_A
        %CONJUGATE(a);
#endif
        %MAD(acc, a, X[VIDX(p, incx, len)]);
    }
";

/// Vectorized accumulation over contiguous rows with a scalar tail;
/// only generated when the pattern selected a vector width.
const GEMV_VECTOR_LOOP: &str = "\
    uint p = 0;
    for (; p + %VLEN <= len; p += %VLEN) {
        %TYPE%V av;
        %TYPE%V xv;
        %VLOAD(av, A + (uint)(r * lda) + p);
        %VLOAD(xv, X + p);
        %VMAD_AND_REDUCE(acc, av, xv);
    }
    for (; p < len; p++) {
        %MAD(acc, A[(uint)(r * lda) + p], X[p]);
    }
";

const GEMV_TAIL: &str = "\
    %TYPE v;
    %MUL(v, alpha, acc);
#ifndef BETA_ZERO
    %TYPE y0 = Y[VIDX(r, incy, rows)];
    %TYPE t;
    %MUL(t, beta, y0);
    %ADD(v, v, t);
#endif
    Y[VIDX(r, incy, rows)] = v;
}
";

const SYMV_DEFINES: &str = "\
#ifdef UPPER_TRIANG
#define ELTSY(r, p, ld) (((r) <= (p)) ? IDX(r, p, ld) : IDX(p, r, ld))
#else
#define ELTSY(r, p, ld) (((r) >= (p)) ? IDX(r, p, ld) : IDX(p, r, ld))
#endif
";

const SYMV_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint N,
    %TYPE alpha,
    __global const %TYPE *A,
    uint lda,
    uint offA,
    __global const %TYPE *X,
    uint offx,
    int incx,
    %TYPE beta,
    __global %TYPE *Y,
    uint offy,
    int incy)
{
    A += offA;
    X += offx;
    Y += offy;

    uint r = get_global_id(0);
    if (r >= N) {
        return;
    }
    %TYPE acc = %ZERO;
    for (uint p = 0; p < N; p++) {
        %MAD(acc, A[ELTSY(r, p, lda)], X[VIDX(p, incx, N)]);
    }
    %TYPE v;
    %MUL(v, alpha, acc);
#ifndef BETA_ZERO
    %TYPE y0 = Y[VIDX(r, incy, N)];
    %TYPE t;
    %MUL(t, beta, y0);
    %ADD(v, v, t);
#endif
    Y[VIDX(r, incy, N)] = v;
}
";

/// A row of op(A) is contiguous in memory.
fn rows_contiguous(args: &BlasKargs) -> bool {
    match (args.order, args.trans_a) {
        (Order::RowMajor, Transpose::NoTrans) => true,
        (Order::ColumnMajor, Transpose::Trans)
        | (Order::ColumnMajor, Transpose::ConjTrans) => true,
        _ => false,
    }
}

#[derive(Debug)]
struct GemvLine;

impl SolverOps for GemvLine {
    fn kernel_name(&self) -> &'static str {
        "gemvLine"
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        let mut engine = engine_for(extra, pgran);
        engine.put("%KNAME", self.kernel_name());
        engine.put("%ZERO", zero_literal(extra.dtype));
        engine.put("%VLEN", &extra.vec_len.to_string());

        let mut template = String::with_capacity(2048);
        template.push_str(GEMV_HEAD);
        if extra.vec_len > 1 {
            template.push_str(GEMV_VECTOR_LOOP);
        } else {
            template.push_str(GEMV_SCALAR_LOOP);
        }
        template.push_str(GEMV_TAIL);

        let body = engine.expand(&template)?;
        let mut source = String::with_capacity(body.len() + 512);
        source.push_str(COMMON_DEFINES);
        source.push_str(GEMV_DEFINES);
        source.push('\n');
        source.push_str(&engine.helper_preamble());
        source.push_str(&body);

        finish_gen(out, source)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        kargs.clear();
        kargs.push(KernelArg::size(args.m));
        kargs.push(KernelArg::size(args.n));
        kargs.push(KernelArg::multiplier(&args.alpha));
        kargs.push(KernelArg::mem(args.a.clone().expect("matrix A is bound")));
        kargs.push(KernelArg::size(args.lda));
        kargs.push(KernelArg::size(args.off_a));
        kargs.push(KernelArg::mem(args.b.clone().expect("vector X is bound")));
        kargs.push(KernelArg::size(args.off_bx));
        kargs.push(KernelArg::int(args.incx as i32));
        kargs.push(KernelArg::multiplier(&args.beta));
        kargs.push(KernelArg::mem(args.c.clone().expect("vector Y is bound")));
        kargs.push(KernelArg::size(args.off_cy));
        kargs.push(KernelArg::int(args.incy as i32));
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
        let rows = kargs_to_prob_dims(args, BlasFunctionID::Gemv, false).y;
        let per_item = subdims[1].item_y.max(1);
        [
            round_up(ceil_div(rows, per_item), pgran.wg_size[0] as usize),
            1,
        ]
    }

    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_1D
    }

    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _args: &BlasKargs,
    ) -> Result<()> {
        line_default_decomp(pgran, subdims);
        Ok(())
    }

    fn check_calc_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _dtype: DataType,
        mode: CheckCalcMode,
    ) -> bool {
        line_check_calc(pgran, subdims, mode)
    }

    fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs) {
        flavor_build_options(opts, args);
    }

    fn select_vectorization(&self, args: &BlasKargs, vlen: u32) -> u32 {
        if !rows_contiguous(args) || args.incx != 1 || args.dtype.is_complex() {
            return 1;
        }
        select_vec_by_alignment(vlen, &[args.lda], &[args.off_a])
    }
}

#[derive(Debug)]
struct SymvLine;

impl SolverOps for SymvLine {
    fn kernel_name(&self) -> &'static str {
        "symvLine"
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        let mut engine = engine_for(extra, pgran);
        engine.put("%KNAME", self.kernel_name());
        engine.put("%ZERO", zero_literal(extra.dtype));

        let body = engine.expand(SYMV_TEMPLATE)?;
        let mut source = String::with_capacity(body.len() + 512);
        source.push_str(COMMON_DEFINES);
        source.push_str(SYMV_DEFINES);
        source.push('\n');
        source.push_str(&engine.helper_preamble());
        source.push_str(&body);

        finish_gen(out, source)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        kargs.clear();
        kargs.push(KernelArg::size(args.n));
        kargs.push(KernelArg::multiplier(&args.alpha));
        kargs.push(KernelArg::mem(args.a.clone().expect("matrix A is bound")));
        kargs.push(KernelArg::size(args.lda));
        kargs.push(KernelArg::size(args.off_a));
        kargs.push(KernelArg::mem(args.b.clone().expect("vector X is bound")));
        kargs.push(KernelArg::size(args.off_bx));
        kargs.push(KernelArg::int(args.incx as i32));
        kargs.push(KernelArg::multiplier(&args.beta));
        kargs.push(KernelArg::mem(args.c.clone().expect("vector Y is bound")));
        kargs.push(KernelArg::size(args.off_cy));
        kargs.push(KernelArg::int(args.incy as i32));
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
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &BlasKargs,
        _extra: &KernelExtra,
    ) -> [usize; 2] {
        [round_up(args.n, pgran.wg_size[0] as usize), 1]
    }

    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_1D | SolverFlags::TOP_INPUT_SQUARE_BLOCKS
    }

    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _args: &BlasKargs,
    ) -> Result<()> {
        line_default_decomp(pgran, subdims);
        Ok(())
    }

    fn check_calc_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _dtype: DataType,
        mode: CheckCalcMode,
    ) -> bool {
        line_check_calc(pgran, subdims, mode)
    }

    fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs) {
        flavor_build_options(opts, args);
    }
}

fn line_default_decomp(pgran: &mut PGranularity, subdims: &mut [SubproblemDim]) {
    pgran.wg_size = [64, 1];
    pgran.wg_dim = 1;
    subdims[0] = SubproblemDim {
        x: 1,
        y: 64,
        bwidth: 64,
        item_x: 1,
        item_y: 64,
    };
    subdims[1] = SubproblemDim {
        x: 1,
        y: 1,
        bwidth: 64,
        item_x: 1,
        item_y: 1,
    };
}

fn line_check_calc(
    pgran: &mut PGranularity,
    subdims: &mut [SubproblemDim],
    mode: CheckCalcMode,
) -> bool {
    if subdims.len() < 2 || !subdims[0].is_consistent() || !subdims[1].is_consistent() {
        return false;
    }
    match mode {
        CheckCalcMode::Calc => {
            pgran.wg_size = [64, 1];
            pgran.wg_dim = 1;
            pgran.is_valid()
        }
        CheckCalcMode::Check => pgran.wg_dim == 1 && pgran.is_valid(),
    }
}

static GEMV_LINE: GemvLine = GemvLine;
static SYMV_LINE: SymvLine = SymvLine;

pub(super) fn register(reg: &mut SolverRegistry) {
    reg.register(BlasFunctionID::Gemv.index(), MemoryPattern {
        name: "cached line gemv",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &GEMV_LINE,
    });
    reg.register(BlasFunctionID::Symv.index(), MemoryPattern {
        name: "cached line symv",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &SYMV_LINE,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(vec_len: u32) -> ([SubproblemDim; 4], PGranularity, KernelExtra) {
        let mut pgran = PGranularity::default();
        let mut subdims = [SubproblemDim::default(); 4];
        line_default_decomp(&mut pgran, &mut subdims);
        let mut extra = KernelExtra::new(DataType::Float);
        extra.vec_len = vec_len;
        (subdims, pgran, extra)
    }

    #[test]
    fn scalar_gemv_uses_strided_access() {
        let (subdims, pgran, extra) = setup(1);
        let size = GEMV_LINE.gen_kernel(None, &subdims, &pgran, &extra).unwrap();
        let mut src = String::with_capacity(size);
        GEMV_LINE
            .gen_kernel(Some(&mut src), &subdims, &pgran, &extra)
            .unwrap();
        assert!(src.contains("__kernel void gemvLine("));
        assert!(src.contains("VIDX(p, incx, len)"));
        assert!(!src.contains("vload"));
    }

    #[test]
    fn vectorized_gemv_emits_vloads() {
        let (subdims, pgran, extra) = setup(4);
        let size = GEMV_LINE.gen_kernel(None, &subdims, &pgran, &extra).unwrap();
        let mut src = String::with_capacity(size);
        GEMV_LINE
            .gen_kernel(Some(&mut src), &subdims, &pgran, &extra)
            .unwrap();
        assert!(src.contains("vload4"));
        assert!(src.contains("float4 av"));
        assert!(src.contains(".s3"));
    }

    #[test]
    fn vectorization_needs_contiguity_and_alignment() {
        let mut args = BlasKargs::new(DataType::Float);
        args.order = Order::RowMajor;
        args.trans_a = Transpose::NoTrans;
        args.incx = 1;
        args.lda = 64;
        assert_eq!(GEMV_LINE.select_vectorization(&args, 4), 4);

        args.lda = 66;
        assert_eq!(GEMV_LINE.select_vectorization(&args, 4), 2);

        args.trans_a = Transpose::Trans;
        assert_eq!(GEMV_LINE.select_vectorization(&args, 4), 1);

        args.trans_a = Transpose::NoTrans;
        args.incx = 2;
        assert_eq!(GEMV_LINE.select_vectorization(&args, 4), 1);
    }

    #[test]
    fn symv_reads_only_stored_triangle() {
        let (subdims, pgran, extra) = setup(1);
        let size = SYMV_LINE.gen_kernel(None, &subdims, &pgran, &extra).unwrap();
        let mut src = String::with_capacity(size);
        SYMV_LINE
            .gen_kernel(Some(&mut src), &subdims, &pgran, &extra)
            .unwrap();
        assert!(src.contains("ELTSY(r, p, lda)"));
        assert!(src.contains("#define ELTSY"));
    }

    #[test]
    fn gemv_thread_count_follows_op_rows() {
        let (subdims, pgran, extra) = setup(1);
        let mut args = BlasKargs::new(DataType::Float);
        args.m = 100;
        args.n = 10;
        assert_eq!(GEMV_LINE.calc_threads(&subdims, &pgran, &args, &extra), [128, 1]);
        args.trans_a = Transpose::Trans;
        assert_eq!(GEMV_LINE.calc_threads(&subdims, &pgran, &args, &extra), [64, 1]);
    }
}
