//! Level-1 patterns: a global-cached elementwise family (swap, scal,
//! copy, axpy) and a reduction family (dot, nrm2, asum, iamax) built on
//! the work-group reduction framework.

use super::{
    engine_for, finish_gen, flavor_build_options, round_up, zero_literal, COMMON_DEFINES,
};
use crate::blas::BlasFunctionID;
use crate::error::Result;
use crate::granulation::{PGranularity, SubproblemDim};
use crate::kgen::{self, ReductionType};
use crate::launch::KernelArg;
use crate::solver::{
    BuildOptions, CheckCalcMode, KernelExtra, KernelExtraFlags, MemoryPattern, PatternPerf,
    SolverFlags, SolverOps, SolverRegistry,
};
use crate::types::{BlasKargs, DataType};

/// Work-group width of every level-1 kernel.
const WG: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VecOp {
    Swap,
    Scal,
    Copy,
    Axpy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RedOp {
    Dot,
    Nrm2,
    Asum,
    Iamax,
}

const VEC_HEAD_XY: &str = "\
__kernel void %KNAME(
    uint N,
    __global %TYPE *X,
    uint offx,
    int incx,
    __global %TYPE *Y,
    uint offy,
    int incy)
{
    X += offx;
    Y += offy;
    uint i = get_global_id(0);
    if (i >= N) {
        return;
    }
    uint ix = VIDX(i, incx, N);
    uint iy = VIDX(i, incy, N);
";

const VEC_HEAD_ALPHA_X: &str = "\
__kernel void %KNAME(
    uint N,
    %TYPE alpha,
    __global %TYPE *X,
    uint offx,
    int incx)
{
    X += offx;
    uint i = get_global_id(0);
    if (i >= N) {
        return;
    }
    uint ix = VIDX(i, incx, N);
";

const VEC_HEAD_ALPHA_XY: &str = "\
__kernel void %KNAME(
    uint N,
    %TYPE alpha,
    __global const %TYPE *X,
    uint offx,
    int incx,
    __global %TYPE *Y,
    uint offy,
    int incy)
{
    X += offx;
    Y += offy;
    uint i = get_global_id(0);
    if (i >= N) {
        return;
    }
    uint ix = VIDX(i, incx, N);
    uint iy = VIDX(i, incy, N);
";

fn vec_core(op: VecOp) -> &'static str {
    match op {
        VecOp::Swap => "\
    %TYPE t = X[ix];
    X[ix] = Y[iy];
    Y[iy] = t;
}
",
        VecOp::Scal => "\
    %TYPE v;
    %MUL(v, alpha, X[ix]);
    X[ix] = v;
}
",
        VecOp::Copy => "\
    Y[iy] = X[ix];
}
",
        VecOp::Axpy => "\
    %TYPE v;
    %MUL(v, alpha, X[ix]);
    %ADD(v, v, Y[iy]);
    Y[iy] = v;
}
",
    }
}

fn vec_head(op: VecOp) -> &'static str {
    match op {
        VecOp::Swap | VecOp::Copy => VEC_HEAD_XY,
        VecOp::Scal => VEC_HEAD_ALPHA_X,
        VecOp::Axpy => VEC_HEAD_ALPHA_XY,
    }
}

const DOT_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint N,
    __global %TYPE *D,
    uint offD,
    __global const %TYPE *X,
    uint offx,
    int incx,
    __global const %TYPE *Y,
    uint offy,
    int incy)
{
    __local %TYPE red[%WG];

    X += offx;
    Y += offy;
    D += offD;

    uint lid = get_local_id(0);
    %TYPE acc = %ZERO;
    for (uint i = lid; i < N; i += %WG) {
        %TYPE xv = X[VIDX(i, incx, N)];
        %TYPE yv = Y[VIDX(i, incy, N)];
#ifdef CONJ_X
        %CONJUGATE(xv);
#endif
        %MAD(acc, xv, yv);
    }
    red[lid] = acc;
    %REDUCTION_BY_SUM(red);
    if (lid == 0) {
        D[0] = red[0];
    }
}
";

/// Scalar-accumulator reductions; for complex elements the squared
/// norm and the absolute sum fold both components.
const NRM2_REAL_CORE: &str = "\
        %PTYPE xv = X[VIDX(i, incx, N)];
        acc = mad(xv, xv, acc);
";
const NRM2_COMPLEX_CORE: &str = "\
        %TYPE xv = X[VIDX(i, incx, N)];
        acc = mad(xv.x, xv.x, acc);
        acc = mad(xv.y, xv.y, acc);
";
const ASUM_REAL_CORE: &str = "\
        acc += fabs(X[VIDX(i, incx, N)]);
";
const ASUM_COMPLEX_CORE: &str = "\
        %TYPE xv = X[VIDX(i, incx, N)];
        acc += fabs(xv.x) + fabs(xv.y);
";

const SCALAR_RED_HEAD: &str = "\
__kernel void %KNAME(
    uint N,
    __global %PTYPE *R,
    uint offR,
    __global const %TYPE *X,
    uint offx,
    int incx)
{
    __local %PTYPE red[%WG];

    X += offx;
    R += offR;

    uint lid = get_local_id(0);
    %PTYPE acc = %SZERO;
    for (uint i = lid; i < N; i += %WG) {
";

fn scalar_red_tail(red: ReductionType, result: &str) -> String {
    format!(
        "    }}\n\
         \x20   red[lid] = acc;\n\
         \x20   %{}(red);\n\
         \x20   if (lid == 0) {{\n\
         \x20       R[0] = {};\n\
         \x20   }}\n\
         }}\n",
        red.key(),
        result
    )
}

/// iAMAX tracks the winning index alongside the winning magnitude, so
/// it carries its own tree reduction instead of the framework's.
const IAMAX_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint N,
    __global uint *R,
    uint offR,
    __global const %TYPE *X,
    uint offx,
    int incx)
{
    __local %PTYPE vals[%WG];
    __local uint idxs[%WG];

    X += offx;
    R += offR;

    uint lid = get_local_id(0);
    %PTYPE best = -1.0f;
    uint besti = 0;
    for (uint i = lid; i < N; i += %WG) {
        %ABSEXPR
        if (av > best) {
            best = av;
            besti = i;
        }
    }
    vals[lid] = best;
    idxs[lid] = besti;
    barrier(CLK_LOCAL_MEM_FENCE);
    for (uint s = %WG / 2; s > 0; s >>= 1) {
        if (lid < s) {
            if (vals[lid + s] > vals[lid] ||
                (vals[lid + s] == vals[lid] && idxs[lid + s] < idxs[lid])) {
                vals[lid] = vals[lid + s];
                idxs[lid] = idxs[lid + s];
            }
        }
        barrier(CLK_LOCAL_MEM_FENCE);
    }
    if (lid == 0) {
        R[0] = idxs[0] + 1u;
    }
}
";

const IAMAX_ABS_REAL: &str = "%PTYPE av = fabs(X[VIDX(i, incx, N)]);";
const IAMAX_ABS_COMPLEX: &str = "\
%TYPE xc = X[VIDX(i, incx, N)];
        %PTYPE av = fabs(xc.x) + fabs(xc.y);";

fn scalar_zero(dtype: DataType) -> &'static str {
    if dtype.is_double_based() {
        "0.0"
    } else {
        "0.0f"
    }
}

fn gen_l1(
    template: &str,
    kname: &str,
    out: Option<&mut String>,
    pgran: &PGranularity,
    extra: &KernelExtra,
) -> kgen::Result<usize> {
    let mut engine = engine_for(extra, pgran);
    engine.put("%KNAME", kname);
    engine.put("%ZERO", zero_literal(extra.dtype));
    engine.put("%SZERO", scalar_zero(extra.dtype));
    engine.put("%WG", &WG.to_string());

    let body = engine.expand(template)?;
    let mut source = String::with_capacity(body.len() + 512);
    source.push_str(COMMON_DEFINES);
    source.push('\n');
    source.push_str(&engine.helper_preamble());
    source.push_str(&body);

    finish_gen(out, source)
}

fn push_vec(kargs: &mut Vec<KernelArg>, mem: &Option<crate::compute::Mem>, off: usize,
        inc: isize, what: &str) {
    match mem {
        Some(mem) => kargs.push(KernelArg::mem(mem.clone())),
        None => panic!("{} is not bound", what),
    }
    kargs.push(KernelArg::size(off));
    kargs.push(KernelArg::int(inc as i32));
}

fn l1_default_decomp(pgran: &mut PGranularity, subdims: &mut [SubproblemDim]) {
    pgran.wg_size = [WG, 1];
    pgran.wg_dim = 1;
    subdims[0] = SubproblemDim {
        x: 1,
        y: WG as usize,
        bwidth: WG as usize,
        item_x: 1,
        item_y: WG as usize,
    };
    subdims[1] = SubproblemDim {
        x: 1,
        y: 1,
        bwidth: WG as usize,
        item_x: 1,
        item_y: 1,
    };
}

fn l1_check_calc(
    pgran: &mut PGranularity,
    subdims: &mut [SubproblemDim],
    mode: CheckCalcMode,
) -> bool {
    if subdims.len() < 2 || !subdims[0].is_consistent() || !subdims[1].is_consistent() {
        return false;
    }
    match mode {
        CheckCalcMode::Calc => {
            pgran.wg_size = [WG, 1];
            pgran.wg_dim = 1;
            pgran.is_valid()
        }
        CheckCalcMode::Check => {
            pgran.wg_dim == 1 && pgran.wg_size[0] == WG && pgran.is_valid()
        }
    }
}

#[derive(Debug)]
struct VectorSolver {
    op: VecOp,
}

impl SolverOps for VectorSolver {
    fn kernel_name(&self) -> &'static str {
        match self.op {
            VecOp::Swap => "swapVec",
            VecOp::Scal => "scalVec",
            VecOp::Copy => "copyVec",
            VecOp::Axpy => "axpyVec",
        }
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        let mut template = String::with_capacity(1024);
        template.push_str(vec_head(self.op));
        template.push_str(vec_core(self.op));
        gen_l1(&template, self.kernel_name(), out, pgran, extra)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        kargs.clear();
        kargs.push(KernelArg::size(args.n));
        if matches!(self.op, VecOp::Scal | VecOp::Axpy) {
            kargs.push(KernelArg::multiplier(&args.alpha));
        }
        push_vec(kargs, &args.b, args.off_bx, args.incx, "vector X");
        if self.op != VecOp::Scal {
            push_vec(kargs, &args.c, args.off_cy, args.incy, "vector Y");
        }
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
        SolverFlags::WSPACE_1D
    }

    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _args: &BlasKargs,
    ) -> Result<()> {
        l1_default_decomp(pgran, subdims);
        Ok(())
    }

    fn check_calc_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _dtype: DataType,
        mode: CheckCalcMode,
    ) -> bool {
        l1_check_calc(pgran, subdims, mode)
    }

    fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs) {
        flavor_build_options(opts, args);
    }
}

#[derive(Debug)]
struct ReduceSolver {
    op: RedOp,
}

impl ReduceSolver {
    /// The framework flavor backing this operation; iAMAX carries its
    /// own index-tracking reduction.
    fn reduction(&self) -> Option<ReductionType> {
        match self.op {
            RedOp::Dot | RedOp::Asum => Some(ReductionType::Sum),
            RedOp::Nrm2 => Some(ReductionType::Ssq),
            RedOp::Iamax => None,
        }
    }
}

impl SolverOps for ReduceSolver {
    fn kernel_name(&self) -> &'static str {
        match self.op {
            RedOp::Dot => "dotVec",
            RedOp::Nrm2 => "nrm2Vec",
            RedOp::Asum => "asumVec",
            RedOp::Iamax => "iamaxVec",
        }
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        let complex = extra.dtype.is_complex();
        let template = match self.op {
            RedOp::Dot => DOT_TEMPLATE.to_string(),
            RedOp::Nrm2 => {
                let core = if complex { NRM2_COMPLEX_CORE } else { NRM2_REAL_CORE };
                let red = self.reduction().expect("framework reduction");
                format!("{}{}{}", SCALAR_RED_HEAD, core, scalar_red_tail(red, "sqrt(red[0])"))
            }
            RedOp::Asum => {
                let core = if complex { ASUM_COMPLEX_CORE } else { ASUM_REAL_CORE };
                let red = self.reduction().expect("framework reduction");
                format!("{}{}{}", SCALAR_RED_HEAD, core, scalar_red_tail(red, "red[0]"))
            }
            RedOp::Iamax => {
                let abs = if complex { IAMAX_ABS_COMPLEX } else { IAMAX_ABS_REAL };
                IAMAX_TEMPLATE.replace("%ABSEXPR", abs)
            }
        };
        gen_l1(&template, self.kernel_name(), out, pgran, extra)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        kargs.clear();
        kargs.push(KernelArg::size(args.n));
        match &args.a {
            Some(mem) => kargs.push(KernelArg::mem(mem.clone())),
            None => panic!("result buffer is not bound"),
        }
        kargs.push(KernelArg::size(args.off_a));
        push_vec(kargs, &args.b, args.off_bx, args.incx, "vector X");
        if self.op == RedOp::Dot {
            push_vec(kargs, &args.c, args.off_cy, args.incy, "vector Y");
        }
    }

    fn is_fit_to_lds(
        &self,
        _subdims: &[SubproblemDim],
        dtype: DataType,
        lds_size: u64,
        _args: &BlasKargs,
    ) -> bool {
        // The reduction buffer must fit.
        (WG as u64) * dtype.size() as u64 * 2 <= lds_size
    }

    fn pattern_perf(&self, _flags: KernelExtraFlags, _args: &BlasKargs) -> PatternPerf {
        PatternPerf::Good
    }

    fn calc_threads(
        &self,
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        _args: &BlasKargs,
        _extra: &KernelExtra,
    ) -> [usize; 2] {
        // A single work-group strides over the whole vector.
        [pgran.wg_size[0] as usize, 1]
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
        l1_default_decomp(pgran, subdims);
        Ok(())
    }

    fn check_calc_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        _dtype: DataType,
        mode: CheckCalcMode,
    ) -> bool {
        l1_check_calc(pgran, subdims, mode)
    }

    fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs) {
        flavor_build_options(opts, args);
    }
}

static SWAP_SOLVER: VectorSolver = VectorSolver { op: VecOp::Swap };
static SCAL_SOLVER: VectorSolver = VectorSolver { op: VecOp::Scal };
static COPY_SOLVER: VectorSolver = VectorSolver { op: VecOp::Copy };
static AXPY_SOLVER: VectorSolver = VectorSolver { op: VecOp::Axpy };
static DOT_SOLVER: ReduceSolver = ReduceSolver { op: RedOp::Dot };
static NRM2_SOLVER: ReduceSolver = ReduceSolver { op: RedOp::Nrm2 };
static ASUM_SOLVER: ReduceSolver = ReduceSolver { op: RedOp::Asum };
static IAMAX_SOLVER: ReduceSolver = ReduceSolver { op: RedOp::Iamax };

pub(super) fn register(reg: &mut SolverRegistry) {
    let pairs: [(BlasFunctionID, &'static dyn SolverOps, &'static str); 8] = [
        (BlasFunctionID::Swap, &SWAP_SOLVER, "cached vector swap"),
        (BlasFunctionID::Scal, &SCAL_SOLVER, "cached vector scal"),
        (BlasFunctionID::Copy, &COPY_SOLVER, "cached vector copy"),
        (BlasFunctionID::Axpy, &AXPY_SOLVER, "cached vector axpy"),
        (BlasFunctionID::Dot, &DOT_SOLVER, "reduction dot"),
        (BlasFunctionID::Nrm2, &NRM2_SOLVER, "reduction nrm2"),
        (BlasFunctionID::Asum, &ASUM_SOLVER, "reduction asum"),
        (BlasFunctionID::Iamax, &IAMAX_SOLVER, "reduction iamax"),
    ];
    for &(func, sops, name) in pairs.iter() {
        reg.register(func.index(), MemoryPattern {
            name,
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            sops,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(dtype: DataType) -> (PGranularity, KernelExtra) {
        let mut pgran = PGranularity::default();
        let mut subdims = [SubproblemDim::default(); 4];
        l1_default_decomp(&mut pgran, &mut subdims);
        (pgran, KernelExtra::new(dtype))
    }

    fn generate(sops: &dyn SolverOps, dtype: DataType) -> String {
        let (pgran, extra) = setup(dtype);
        let subdims = [SubproblemDim::default(); 4];
        let size = sops.gen_kernel(None, &subdims, &pgran, &extra).unwrap();
        let mut src = String::with_capacity(size);
        sops.gen_kernel(Some(&mut src), &subdims, &pgran, &extra).unwrap();
        src
    }

    #[test]
    fn axpy_kernel_shape() {
        let src = generate(&AXPY_SOLVER, DataType::Float);
        assert!(src.contains("__kernel void axpyVec("));
        assert!(src.contains("VIDX(i, incx, N)"));
        assert!(!src.contains('%'));
    }

    #[test]
    fn swap_has_no_alpha() {
        let src = generate(&SWAP_SOLVER, DataType::Float);
        assert!(!src.contains("alpha"));
        assert!(src.contains("X[ix] = Y[iy];"));
    }

    #[test]
    fn dot_uses_reduction_framework() {
        let src = generate(&DOT_SOLVER, DataType::Float);
        assert!(src.contains("__local float red[64]"));
        assert!(src.contains("barrier(CLK_LOCAL_MEM_FENCE);"));
        assert!(src.contains("D[0] = red[0];"));
    }

    #[test]
    fn complex_dot_conjugates_under_flag() {
        let src = generate(&DOT_SOLVER, DataType::ComplexFloat);
        assert!(src.contains("#ifdef CONJ_X"));
        assert!(src.contains("(xv).y = -(xv).y;"));
        assert!(src.contains("mulComplexF"));
    }

    #[test]
    fn nrm2_takes_square_root() {
        let real = generate(&NRM2_SOLVER, DataType::Float);
        assert!(real.contains("sqrt(red[0])"));

        let complex = generate(&NRM2_SOLVER, DataType::ComplexFloat);
        assert!(complex.contains("mad(xv.x, xv.x, acc)"));
        // Scalar accumulator even for complex elements.
        assert!(complex.contains("__local float red[64]"));
    }

    #[test]
    fn iamax_reports_one_based_index() {
        let src = generate(&IAMAX_SOLVER, DataType::Float);
        assert!(src.contains("__global uint *R"));
        assert!(src.contains("R[0] = idxs[0] + 1u;"));
        assert!(src.contains("fabs("));
    }

    #[test]
    fn reduction_threads_are_one_group() {
        let (pgran, extra) = setup(DataType::Float);
        let subdims = [SubproblemDim::default(); 4];
        let mut args = BlasKargs::new(DataType::Float);
        args.n = 1_000_000;
        assert_eq!(DOT_SOLVER.calc_threads(&subdims, &pgran, &args, &extra), [64, 1]);
        assert_eq!(AXPY_SOLVER.calc_threads(&subdims, &pgran, &args, &extra)[0] % 64, 0);
    }
}
