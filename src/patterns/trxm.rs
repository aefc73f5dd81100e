//! Triangular matrix multiply and solve patterns.
//!
//! Both functions decompose the same way: the triangular operand fixes
//! one axis, every work item walks one line of B along it. TRMM walks in
//! the order that keeps unread elements intact; TRSM walks in
//! substitution order and divides by the diagonal. The LDS variants
//! stage the whole triangular tile into local memory first.

use super::{
    ceil_div, engine_for, finish_gen, flavor_build_options, one_literal, round_up,
    zero_literal, COMMON_DEFINES,
};
use crate::blas::matrix_dims::kargs_to_prob_dims;
use crate::blas::BlasFunctionID;
use crate::error::Result;
use crate::granulation::{PGranularity, SubproblemDim};
use crate::kgen::{self, GenGuard, KgenContext, TemplateEngine};
use crate::launch::KernelArg;
use crate::solver::{
    BuildOptions, CheckCalcMode, KernelExtra, KernelExtraFlags, MemoryPattern, PatternPerf,
    SolverFlags, SolverOps, SolverRegistry,
};
use crate::types::{BlasKargs, DataType};

/// Largest triangular tile the LDS variants will stage.
const MAX_LDS_TILE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrxmKind {
    Trmm,
    Trsm,
}

/// Effective-triangle and element-addressing macros. `OP_UPPER` holds
/// when op(A) is upper triangular in the iteration space.
const TRXM_DEFINES: &str = "\
#if (defined(UPPER_TRIANG) && !defined(TRANS_A)) || \\
    (!defined(UPPER_TRIANG) && defined(TRANS_A))
#define OP_UPPER
#endif
#ifdef TRANS_A
#define ELTA(i, p, ld) IDX(p, i, ld)
#else
#define ELTA(i, p, ld) IDX(i, p, ld)
#endif
#ifndef SIDE_RIGHT
#define AOP(t, p, ld) ELTA(t, p, ld)
#define BELT(t, w, ld) IDX(t, w, ld)
#else
#define AOP(t, p, ld) ELTA(p, t, ld)
#define BELT(t, w, ld) IDX(w, t, ld)
#endif
";

/// The accumulation runs over `[t, n)` exactly when op(A) is upper and
/// the triangle multiplies from the left, or lower from the right.
const TRXM_RANGE_FROM_T: &str =
    "#if (!defined(SIDE_RIGHT) && defined(OP_UPPER)) || \\\n    \
     (defined(SIDE_RIGHT) && !defined(OP_UPPER))\n";

fn trmm_range_defines() -> String {
    format!(
        "{cond}\
         #define TRX_FORWARD\n\
         #define P_FROM(t) (t)\n\
         #define P_TO(t, n) (n)\n\
         #else\n\
         #define P_FROM(t) 0u\n\
         #define P_TO(t, n) ((t) + 1u)\n\
         #endif\n",
        cond = TRXM_RANGE_FROM_T
    )
}

fn trsm_range_defines() -> String {
    // Substitution consumes already-solved elements, so the iteration
    // direction is the reverse of TRMM's and the diagonal is excluded.
    format!(
        "{cond}\
         #define P_FROM(t) ((t) + 1u)\n\
         #define P_TO(t, n) (n)\n\
         #else\n\
         #define TRX_FORWARD\n\
         #define P_FROM(t) 0u\n\
         #define P_TO(t, n) (t)\n\
         #endif\n",
        cond = TRXM_RANGE_FROM_T
    )
}

const FETCH_GLOBAL_SIG: &str =
    "%TYPE fetchOpA(__global const %TYPE *A, uint t, uint p, uint lda)";
const FETCH_GLOBAL_BODY: &str = "\
%TYPE a = A[AOP(t, p, lda)];
#ifdef CONJ_A
%CONJUGATE(a);
#endif
return a;";

const FETCH_LDS_SIG: &str =
    "%TYPE fetchOpA(__local const %TYPE *ldsA, uint t, uint p, uint pitch)";
const FETCH_LDS_BODY: &str = "return ldsA[t * pitch + p];";

const TRXM_HEAD: &str = "\
__kernel void %KNAME(
    uint M,
    uint N,
    %TYPE alpha,
    __global const %TYPE *A,
    uint lda,
    uint offA,
    __global %TYPE *B,
    uint ldb,
    uint offB)
{
    A += offA;
    B += offB;
#ifndef SIDE_RIGHT
    uint sizeT = M;
    uint sizeO = N;
#else
    uint sizeT = N;
    uint sizeO = M;
#endif
    uint w = get_global_id(0);
";

const TRXM_LDS_STAGE: &str = "\
    __local %TYPE ldsA[%TILE * %TILE];
    for (uint idx = get_local_id(0); idx < sizeT * sizeT; idx += %WGTOTAL) {
        uint r = idx / sizeT;
        uint c = idx % sizeT;
        %TYPE a = A[AOP(r, c, lda)];
#ifdef CONJ_A
        %CONJUGATE(a);
#endif
        ldsA[r * %TILE + c] = a;
    }
    barrier(CLK_LOCAL_MEM_FENCE);
";

const TRXM_LOOP_OPEN: &str = "\
    if (w < sizeO) {
#ifdef TRX_FORWARD
    for (uint t = 0; t < sizeT; t++) {
#else
    for (int tt = (int)sizeT - 1; tt >= 0; tt--) {
        uint t = (uint)tt;
#endif
";

const TRMM_STEP: &str = "\
        %TYPE acc = %ZERO;
        for (uint p = P_FROM(t); p < P_TO(t, sizeT); p++) {
            %TYPE a;
#ifdef UNIT_DIAG
            if (p == t) {
                a = %ONE;
            } else {
                a = %FETCHA(%ABASE, t, p, %APITCH);
            }
#else
            a = %FETCHA(%ABASE, t, p, %APITCH);
#endif
            %MAD(acc, a, B[BELT(p, w, ldb)]);
        }
        %TYPE v;
        %MUL(v, alpha, acc);
        B[BELT(t, w, ldb)] = v;
";

const TRSM_STEP: &str = "\
        %TYPE acc = %ZERO;
        for (uint p = P_FROM(t); p < P_TO(t, sizeT); p++) {
            %TYPE a = %FETCHA(%ABASE, t, p, %APITCH);
            %MAD(acc, a, B[BELT(p, w, ldb)]);
        }
        %TYPE rhs;
        %MUL(rhs, alpha, B[BELT(t, w, ldb)]);
        %SUB(rhs, rhs, acc);
#ifndef UNIT_DIAG
        %TYPE d = %FETCHA(%ABASE, t, t, %APITCH);
        %DIV(rhs, rhs, d);
#endif
        B[BELT(t, w, ldb)] = rhs;
";

const TRXM_TAIL: &str = "\
    }
    }
}
";

/// The triangular extent the call works over: the Y axis of the
/// problem after the right-side swap.
fn tri_dim(args: &BlasKargs) -> usize {
    kargs_to_prob_dims(args, BlasFunctionID::Trmm, false).y
}

fn other_dim(args: &BlasKargs) -> usize {
    kargs_to_prob_dims(args, BlasFunctionID::Trmm, false).x
}

fn gen_trxm(
    kind: TrxmKind,
    kname: &str,
    use_lds: bool,
    out: Option<&mut String>,
    subdims: &[SubproblemDim],
    pgran: &PGranularity,
    extra: &KernelExtra,
) -> kgen::Result<usize> {
    if subdims.is_empty() {
        return Err(kgen::KgenError::InvalidArg);
    }

    let tile = subdims[0].y;
    let mut engine = engine_for(extra, pgran);
    engine.put("%KNAME", kname);
    engine.put("%ZERO", zero_literal(extra.dtype));
    engine.put("%ONE", one_literal(extra.dtype));
    engine.put("%TILE", &tile.to_string());
    engine.put("%WGTOTAL", &pgran.wg_total().to_string());
    if use_lds {
        engine.put("%ABASE", "ldsA");
        engine.put("%APITCH", &tile.to_string());
    } else {
        engine.put("%ABASE", "A");
        engine.put("%APITCH", "lda");
    }

    // The element fetch helper is shared by the accumulation and the
    // diagonal sites; the guard keeps it emitted once.
    let dtype = extra.dtype;
    let vec_len = extra.vec_len;
    let wg = pgran.wg_total();
    let wf = pgran.wf_size;
    let mut helper_ctx = KgenContext::new(None);
    let mut guard = GenGuard::new(
        Box::new(move |ctx, pattern| {
            let eng = TemplateEngine::new(dtype, vec_len, true, true, wg, wf);
            let (sig, body) = if pattern[1] != 0 {
                (FETCH_LDS_SIG, FETCH_LDS_BODY)
            } else {
                (FETCH_GLOBAL_SIG, FETCH_GLOBAL_BODY)
            };
            ctx.declare_function(&eng.expand(sig)?)?;
            ctx.begin_branch(None)?;
            ctx.add_stmt(&eng.expand(body)?)?;
            ctx.end_branch()
        }),
        2,
    );
    let pattern = [kind as u8, use_lds as u8];
    let fetch_name = guard.find_generate(&mut helper_ctx, &pattern)?;
    // Second site resolves to the same helper without re-emission.
    let fetch_again = guard.find_generate(&mut helper_ctx, &pattern)?;
    debug_assert_eq!(fetch_name, fetch_again);
    engine.put("%FETCHA", &fetch_name);

    let range_defines = match kind {
        TrxmKind::Trmm => trmm_range_defines(),
        TrxmKind::Trsm => trsm_range_defines(),
    };
    let step = match kind {
        TrxmKind::Trmm => TRMM_STEP,
        TrxmKind::Trsm => TRSM_STEP,
    };

    let mut template = String::with_capacity(4096);
    template.push_str(TRXM_HEAD);
    if use_lds {
        template.push_str(TRXM_LDS_STAGE);
    }
    template.push_str(TRXM_LOOP_OPEN);
    template.push_str(step);
    template.push_str(TRXM_TAIL);

    let body = engine.expand(&template)?;
    let helper_text = helper_ctx.into_source().unwrap_or_default();

    let mut source = String::with_capacity(body.len() + helper_text.len() + 1024);
    source.push_str(COMMON_DEFINES);
    source.push_str(TRXM_DEFINES);
    source.push_str(&range_defines);
    source.push('\n');
    source.push_str(&engine.helper_preamble());
    source.push_str(&helper_text);
    source.push('\n');
    source.push_str(&body);

    finish_gen(out, source)
}

fn assign_trxm_kargs(kargs: &mut Vec<KernelArg>, args: &BlasKargs) {
    kargs.clear();
    kargs.push(KernelArg::size(args.m));
    kargs.push(KernelArg::size(args.n));
    kargs.push(KernelArg::multiplier(&args.alpha));
    kargs.push(KernelArg::mem(args.a.clone().expect("matrix A is bound")));
    kargs.push(KernelArg::size(args.lda));
    kargs.push(KernelArg::size(args.off_a));
    kargs.push(KernelArg::mem(args.b.clone().expect("matrix B is bound")));
    kargs.push(KernelArg::size(args.ldb));
    kargs.push(KernelArg::size(args.off_bx));
}

fn trxm_default_decomp(
    pgran: &mut PGranularity,
    subdims: &mut [SubproblemDim],
    _args: &BlasKargs,
    items_per_thread: usize,
) -> Result<()> {
    pgran.wg_size = [64, 1];
    pgran.wg_dim = 1;

    let tile = 32;
    subdims[0] = SubproblemDim {
        x: tile,
        y: tile,
        bwidth: tile,
        item_x: tile,
        item_y: tile,
    };
    subdims[1] = SubproblemDim {
        x: items_per_thread,
        y: 1,
        bwidth: tile,
        item_x: items_per_thread,
        item_y: 1,
    };
    Ok(())
}

fn trxm_check_calc(
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

fn trxm_threads(args: &BlasKargs, subdims: &[SubproblemDim], pgran: &PGranularity) -> [usize; 2] {
    let per_item = subdims[1].item_x.max(1);
    [
        round_up(ceil_div(other_dim(args), per_item), pgran.wg_size[0] as usize),
        1,
    ]
}

/// Shrinks the staged tile to the triangle actually used, keeping the
/// work-group shape intact.
fn trxm_lds_fixup(args: &BlasKargs, subdims: &mut [SubproblemDim]) {
    let dim = round_up(tri_dim(args).max(1), 16).min(MAX_LDS_TILE);
    subdims[0].x = dim;
    subdims[0].y = dim;
    subdims[0].item_x = dim;
    subdims[0].item_y = dim;
    subdims[0].bwidth = dim;
    subdims[1].bwidth = dim;
}

fn lds_tile_fits(subdims: &[SubproblemDim], dtype: DataType, lds_size: u64, args: &BlasKargs)
        -> bool {
    let tile = subdims[0].y as u64;
    tri_dim(args) as u64 <= tile && tile * tile * dtype.size() as u64 <= lds_size
}

macro_rules! trxm_solver {
    ($name:ident, $kind:expr, $kname:expr, $lds:expr, $items:expr, $perf:expr) => {
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
                gen_trxm($kind, $kname, $lds, out, subdims, pgran, extra)
            }

            fn assign_kargs(
                &self,
                kargs: &mut Vec<KernelArg>,
                args: &BlasKargs,
                _extra: &KernelExtra,
            ) {
                assign_trxm_kargs(kargs, args);
            }

            fn is_fit_to_lds(
                &self,
                subdims: &[SubproblemDim],
                dtype: DataType,
                lds_size: u64,
                args: &BlasKargs,
            ) -> bool {
                if $lds {
                    lds_tile_fits(subdims, dtype, lds_size, args)
                } else {
                    true
                }
            }

            fn pattern_perf(&self, _flags: KernelExtraFlags, _args: &BlasKargs) -> PatternPerf {
                $perf
            }

            fn calc_threads(
                &self,
                subdims: &[SubproblemDim],
                pgran: &PGranularity,
                args: &BlasKargs,
                _extra: &KernelExtra,
            ) -> [usize; 2] {
                trxm_threads(args, subdims, pgran)
            }

            fn flags(&self) -> SolverFlags {
                SolverFlags::WSPACE_1D | SolverFlags::TOP_INPUT_SQUARE_BLOCKS
            }

            fn fixup_args(
                &self,
                args: &mut BlasKargs,
                subdims: &mut [SubproblemDim],
                _extra: &mut KernelExtra,
            ) {
                if $lds {
                    trxm_lds_fixup(args, subdims);
                }
            }

            fn default_decomp(
                &self,
                pgran: &mut PGranularity,
                subdims: &mut [SubproblemDim],
                args: &BlasKargs,
            ) -> Result<()> {
                trxm_default_decomp(pgran, subdims, args, $items)
            }

            fn check_calc_decomp(
                &self,
                pgran: &mut PGranularity,
                subdims: &mut [SubproblemDim],
                _dtype: DataType,
                mode: CheckCalcMode,
            ) -> bool {
                trxm_check_calc(pgran, subdims, mode)
            }

            fn set_build_options(&self, opts: &mut BuildOptions, args: &BlasKargs) {
                flavor_build_options(opts, args);
            }
        }
    };
}

trxm_solver!(TrmmLds, TrxmKind::Trmm, "trmmLds", true, 1, PatternPerf::Best);
trxm_solver!(TrmmCached, TrxmKind::Trmm, "trmmBlock", false, 2, PatternPerf::Good);
trxm_solver!(TrsmLds, TrxmKind::Trsm, "trsmLds", true, 1, PatternPerf::Best);
trxm_solver!(TrsmCached, TrxmKind::Trsm, "trsmBlock", false, 2, PatternPerf::Good);
trxm_solver!(TrsmLine, TrxmKind::Trsm, "trsmLine", false, 1, PatternPerf::Average);

static TRMM_LDS: TrmmLds = TrmmLds;
static TRMM_CACHED: TrmmCached = TrmmCached;
static TRSM_LDS: TrsmLds = TrsmLds;
static TRSM_CACHED: TrsmCached = TrsmCached;
static TRSM_LINE: TrsmLine = TrsmLine;

pub(super) fn register(reg: &mut SolverRegistry) {
    let trmm = BlasFunctionID::Trmm.index();
    reg.register(trmm, MemoryPattern {
        name: "LDS blocked trmm",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &TRMM_LDS,
    });
    reg.register(trmm, MemoryPattern {
        name: "blocked trmm with caching",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &TRMM_CACHED,
    });

    let trsm = BlasFunctionID::Trsm.index();
    reg.register(trsm, MemoryPattern {
        name: "LDS blocked trsm",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &TRSM_LDS,
    });
    reg.register(trsm, MemoryPattern {
        name: "blocked trsm with caching",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &TRSM_CACHED,
    });
    reg.register(trsm, MemoryPattern {
        name: "trsm without LDS",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &TRSM_LINE,
    });
}
