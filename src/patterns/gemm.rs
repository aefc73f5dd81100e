//! General matrix multiply patterns: LDS-blocked, image-blocked and
//! cached-global. All three share one kernel argument layout so that a
//! pattern change never disturbs the argument binder downstream.

use super::{
    block_threads, ceil_div, default_block_decomp, check_calc_block_decomp, engine_for,
    finish_gen, flavor_build_options, zero_literal, COMMON_DEFINES,
};
use crate::blas::matrix_dims::{kargs_to_prob_dims, matr_block_size};
use crate::blas::BlasFunctionID;
use crate::error::Result;
use crate::granulation::{PGranularity, SubproblemDim};
use crate::kgen;
use crate::launch::KernelArg;
use crate::solver::{
    BuildOptions, CheckCalcMode, KernelExtra, KernelExtraFlags, ImgPackMode, MemoryPattern,
    PatternPerf, SolverFlags, SolverOps, SolverRegistry,
};
use crate::types::{BlasKargs, DataType, MatrixRole, Order, Side};

const TRANS_DEFINES: &str = "\
#ifdef TRANS_A
#define IDXA(i, p, ld) IDX(p, i, ld)
#else
#define IDXA(i, p, ld) IDX(i, p, ld)
#endif
#ifdef TRANS_B
#define IDXB(p, j, ld) IDX(j, p, ld)
#else
#define IDXB(p, j, ld) IDX(p, j, ld)
#endif
";

/// Straight blocked kernel relying on the global-memory caches: each
/// work item accumulates its own result tile.
const GEMM_BLOCK_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint M,
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

    for (uint i = row; i < min(row + %ITEMY, M); i++) {
        for (uint j = col; j < min(col + %ITEMX, N); j++) {
            %TYPE acc = %ZERO;
            for (uint p = 0; p < K; p++) {
                %TYPE a = A[IDXA(i, p, lda)];
                %TYPE b = B[IDXB(p, j, ldb)];
#ifdef CONJ_A
                %CONJUGATE(a);
#endif
#ifdef CONJ_B
                %CONJUGATE(b);
#endif
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

/// LDS-blocked kernel: the work-group cooperatively stages A and B
/// panels into local memory before accumulating.
const GEMM_LDS_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint M,
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
    __local %TYPE ldsA[%TILEY * %BW];
    __local %TYPE ldsB[%BW * %TILEX];

    A += offA;
    B += offB;
    C += offC;

    uint ly = get_local_id(0);
    uint lx = get_local_id(1);
    uint rowBase = get_group_id(0) * %TILEY;
    uint colBase = get_group_id(1) * %TILEX;

    %TYPE acc[%ITEMY][%ITEMX];
    for (uint i = 0; i < %ITEMY; i++) {
        for (uint j = 0; j < %ITEMX; j++) {
            acc[i][j] = %ZERO;
        }
    }

    for (uint pb = 0; pb < K; pb += %BW) {
        for (uint t = ly * %WGX + lx; t < %TILEY * %BW; t += %WGTOTAL) {
            uint r = t / %BW;
            uint p = t % %BW;
            %TYPE va = %ZERO;
            if (rowBase + r < M && pb + p < K) {
                va = A[IDXA(rowBase + r, pb + p, lda)];
#ifdef CONJ_A
                %CONJUGATE(va);
#endif
            }
            ldsA[t] = va;
        }
        for (uint t = ly * %WGX + lx; t < %BW * %TILEX; t += %WGTOTAL) {
            uint p = t / %TILEX;
            uint c = t % %TILEX;
            %TYPE vb = %ZERO;
            if (pb + p < K && colBase + c < N) {
                vb = B[IDXB(pb + p, colBase + c, ldb)];
#ifdef CONJ_B
                %CONJUGATE(vb);
#endif
            }
            ldsB[t] = vb;
        }
        barrier(CLK_LOCAL_MEM_FENCE);

        uint pend = min((uint)%BW, K - pb);
        for (uint p = 0; p < pend; p++) {
            for (uint i = 0; i < %ITEMY; i++) {
                %TYPE a = ldsA[(ly * %ITEMY + i) * %BW + p];
                for (uint j = 0; j < %ITEMX; j++) {
                    %TYPE b = ldsB[p * %TILEX + lx * %ITEMX + j];
                    %MAD(acc[i][j], a, b);
                }
            }
        }
        barrier(CLK_LOCAL_MEM_FENCE);
    }

    for (uint i = 0; i < %ITEMY; i++) {
        uint gi = rowBase + ly * %ITEMY + i;
        if (gi >= M) {
            continue;
        }
        for (uint j = 0; j < %ITEMX; j++) {
            uint gj = colBase + lx * %ITEMX + j;
            if (gj >= N) {
                continue;
            }
            %TYPE v;
            %MUL(v, alpha, acc[i][j]);
#ifndef BETA_ZERO
            %TYPE c0 = C[IDX(gi, gj, ldc)];
            %TYPE t;
            %MUL(t, beta, c0);
            %ADD(v, v, t);
#endif
            C[IDX(gi, gj, ldc)] = v;
        }
    }
}
";

/// Packs op(A) into the scratch image row by row, one float4-sized
/// texel per work item.
const GEMM_PACK_TEMPLATE: &str = "\
__kernel void %PACKNAME(
    __write_only image2d_t dstImg,
    __global const %TYPE *A,
    uint lda,
    uint offA,
    uint rows,
    uint cols)
{
    uint tx = get_global_id(0);
    uint y = get_global_id(1);
    uint x0 = tx * %EPT;

    if (y >= rows || x0 >= cols) {
        return;
    }

    uint4 texel = (uint4)(0u, 0u, 0u, 0u);
    __private %TYPE elems[%EPT];
    for (uint e = 0; e < %EPT; e++) {
        %TYPE v = %ZERO;
        if (x0 + e < cols) {
            v = A[offA + IDXA(y, x0 + e, lda)];
#ifdef CONJ_A
            %CONJUGATE(v);
#endif
        }
        elems[e] = v;
    }
    texel = ((__private uint4 *)elems)[0];
    write_imageui(dstImg, (int2)((int)tx, (int)y), texel);
}
";

/// Image-backed kernel: rows of op(A) come from the scratch image, B
/// stays in global memory.
const GEMM_IMAGE_TEMPLATE: &str = "\
__kernel void %KNAME(
    uint M,
    uint N,
    uint K,
    %TYPE alpha,
    %TYPE beta,
    __read_only image2d_t imgA,
    __global const %TYPE *B,
    uint ldb,
    uint offB,
    __global %TYPE *C,
    uint ldc,
    uint offC)
{
    const sampler_t smp = CLK_NORMALIZED_COORDS_FALSE | CLK_ADDRESS_NONE |
        CLK_FILTER_NEAREST;

    B += offB;
    C += offC;

    uint row = get_global_id(0) * %ITEMY;
    uint col = get_global_id(1) * %ITEMX;

    for (uint i = row; i < min(row + %ITEMY, M); i++) {
        for (uint j = col; j < min(col + %ITEMX, N); j++) {
            %TYPE acc = %ZERO;
            for (uint p = 0; p < K; p += %EPT) {
                uint4 texel = read_imageui(imgA, smp, (int2)((int)(p / %EPT), (int)i));
                __private uint4 raw = texel;
                __private %TYPE *a = (__private %TYPE *)&raw;
                uint pend = min((uint)%EPT, K - p);
                for (uint e = 0; e < pend; e++) {
                    %TYPE b = B[IDXB(p + e, j, ldb)];
#ifdef CONJ_B
                    %CONJUGATE(b);
#endif
                    %MAD(acc, a[e], b);
                }
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

/// Elements of the kernel type per image texel.
fn elems_per_texel(dtype: DataType) -> usize {
    16 / dtype.size()
}

fn gen_blocked(
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
    engine.put("%PACKNAME", "gemmPackImage");
    engine.put("%ZERO", zero_literal(extra.dtype));
    engine.put("%ITEMY", &subdims[1].item_y.to_string());
    engine.put("%ITEMX", &subdims[1].item_x.to_string());
    engine.put("%TILEY", &subdims[0].y.to_string());
    engine.put("%TILEX", &subdims[0].x.to_string());
    engine.put("%BW", &subdims[0].bwidth.to_string());
    engine.put("%WGX", &pgran.wg_size[1].to_string());
    engine.put("%WGTOTAL", &pgran.wg_total().to_string());
    engine.put("%EPT", &elems_per_texel(extra.dtype).to_string());

    let body = engine.expand(template)?;
    let mut source = String::with_capacity(body.len() + 1024);
    source.push_str(COMMON_DEFINES);
    source.push_str(TRANS_DEFINES);
    source.push('\n');
    source.push_str(&engine.helper_preamble());
    source.push_str(&body);

    finish_gen(out, source)
}

/// Argument order shared by the buffer-backed gemm kernels.
fn assign_buffer_kargs(kargs: &mut Vec<KernelArg>, args: &BlasKargs) {
    kargs.clear();
    kargs.push(KernelArg::size(args.m));
    kargs.push(KernelArg::size(args.n));
    kargs.push(KernelArg::size(args.k));
    kargs.push(KernelArg::multiplier(&args.alpha));
    kargs.push(KernelArg::multiplier(&args.beta));
    kargs.push(KernelArg::mem(args.a.clone().expect("matrix A is bound")));
    kargs.push(KernelArg::size(args.lda));
    kargs.push(KernelArg::size(args.off_a));
    kargs.push(KernelArg::mem(args.b.clone().expect("matrix B is bound")));
    kargs.push(KernelArg::size(args.ldb));
    kargs.push(KernelArg::size(args.off_bx));
    kargs.push(KernelArg::mem(args.c.clone().expect("matrix C is bound")));
    kargs.push(KernelArg::size(args.ldc));
    kargs.push(KernelArg::size(args.off_cy));
}

fn gemm_default_decomp(
    pgran: &mut PGranularity,
    subdims: &mut [SubproblemDim],
    _args: &BlasKargs,
) -> Result<()> {
    default_block_decomp(pgran, subdims, [8, 8], 4, 8);
    Ok(())
}

/// The LDS-blocked pattern.
#[derive(Debug)]
struct GemmLds;

impl SolverOps for GemmLds {
    fn kernel_name(&self) -> &'static str {
        "gemmLds"
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        gen_blocked(GEMM_LDS_TEMPLATE, self.kernel_name(), out, subdims, pgran, extra)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        assign_buffer_kargs(kargs, args);
    }

    fn is_fit_to_lds(
        &self,
        subdims: &[SubproblemDim],
        dtype: DataType,
        lds_size: u64,
        _args: &BlasKargs,
    ) -> bool {
        let a = matr_block_size(&subdims[0], MatrixRole::A, dtype, Side::Left);
        let b = matr_block_size(&subdims[0], MatrixRole::B, dtype, Side::Left);
        (a + b) * dtype.size() as u64 <= lds_size
    }

    fn pattern_perf(&self, _flags: KernelExtraFlags, _args: &BlasKargs) -> PatternPerf {
        PatternPerf::Best
    }

    fn calc_threads(
        &self,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &BlasKargs,
        _extra: &KernelExtra,
    ) -> [usize; 2] {
        block_threads(args.m, args.n, subdims, pgran)
    }

    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_2D
    }

    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        args: &BlasKargs,
    ) -> Result<()> {
        gemm_default_decomp(pgran, subdims, args)
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

/// The image-blocked pattern; op(A) is staged into a scratch image by a
/// separate packing launch.
#[derive(Debug)]
struct GemmImage;

impl GemmImage {
    /// Extent of op(A): rows x cols as read by the compute kernel.
    fn op_a_extent(args: &BlasKargs) -> (usize, usize) {
        let dim = kargs_to_prob_dims(args, BlasFunctionID::Gemm, false);
        (dim.y, dim.bwidth)
    }
}

impl SolverOps for GemmImage {
    fn kernel_name(&self) -> &'static str {
        "gemmImage"
    }

    fn pack_kernel_name(&self) -> Option<&'static str> {
        Some("gemmPackImage")
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        let mut combined = String::with_capacity(GEMM_PACK_TEMPLATE.len()
            + GEMM_IMAGE_TEMPLATE.len());
        combined.push_str(GEMM_PACK_TEMPLATE);
        combined.push('\n');
        combined.push_str(GEMM_IMAGE_TEMPLATE);
        gen_blocked(&combined, self.kernel_name(), out, subdims, pgran, extra)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        kargs.clear();
        kargs.push(KernelArg::size(args.m));
        kargs.push(KernelArg::size(args.n));
        kargs.push(KernelArg::size(args.k));
        kargs.push(KernelArg::multiplier(&args.alpha));
        kargs.push(KernelArg::multiplier(&args.beta));
        kargs.push(KernelArg::mem(args.scimage.clone().expect("scratch image is bound")));
        kargs.push(KernelArg::mem(args.b.clone().expect("matrix B is bound")));
        kargs.push(KernelArg::size(args.ldb));
        kargs.push(KernelArg::size(args.off_bx));
        kargs.push(KernelArg::mem(args.c.clone().expect("matrix C is bound")));
        kargs.push(KernelArg::size(args.ldc));
        kargs.push(KernelArg::size(args.off_cy));
    }

    fn assign_pack_kargs(
        &self,
        kargs: &mut Vec<KernelArg>,
        args: &BlasKargs,
        _extra: &KernelExtra,
    ) {
        let (rows, cols) = GemmImage::op_a_extent(args);
        kargs.clear();
        kargs.push(KernelArg::mem(args.scimage.clone().expect("scratch image is bound")));
        kargs.push(KernelArg::mem(args.a.clone().expect("matrix A is bound")));
        kargs.push(KernelArg::size(args.lda));
        kargs.push(KernelArg::size(args.off_a));
        kargs.push(KernelArg::size(rows));
        kargs.push(KernelArg::size(cols));
    }

    fn calc_pack_threads(
        &self,
        _subdims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &BlasKargs,
        extra: &KernelExtra,
    ) -> [usize; 2] {
        let (rows, cols) = GemmImage::op_a_extent(args);
        let texels = ceil_div(cols, elems_per_texel(extra.dtype));
        [
            super::round_up(texels, pgran.wf_size as usize),
            rows,
        ]
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
        PatternPerf::Average
    }

    fn calc_threads(
        &self,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &BlasKargs,
        _extra: &KernelExtra,
    ) -> [usize; 2] {
        block_threads(args.m, args.n, subdims, pgran)
    }

    fn img_pack_mode(
        &self,
        extra: &KernelExtra,
        _subdims: &[SubproblemDim],
        data_id: MatrixRole,
    ) -> Option<ImgPackMode> {
        match data_id {
            MatrixRole::A => Some(ImgPackMode {
                rate: elems_per_texel(extra.dtype) as u32,
                order: Order::RowMajor,
            }),
            _ => None,
        }
    }

    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_2D
    }

    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        args: &BlasKargs,
    ) -> Result<()> {
        gemm_default_decomp(pgran, subdims, args)
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

/// The cached-global pattern: no staging at all, leaning on the L1/L2
/// caches.
#[derive(Debug)]
struct GemmCached;

impl SolverOps for GemmCached {
    fn kernel_name(&self) -> &'static str {
        "gemmBlock"
    }

    fn gen_kernel(
        &self,
        out: Option<&mut String>,
        subdims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> kgen::Result<usize> {
        gen_blocked(GEMM_BLOCK_TEMPLATE, self.kernel_name(), out, subdims, pgran, extra)
    }

    fn assign_kargs(&self, kargs: &mut Vec<KernelArg>, args: &BlasKargs, _extra: &KernelExtra) {
        assign_buffer_kargs(kargs, args);
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
        block_threads(args.m, args.n, subdims, pgran)
    }

    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_1D | SolverFlags::WSPACE_2D
    }

    fn default_decomp(
        &self,
        pgran: &mut PGranularity,
        subdims: &mut [SubproblemDim],
        args: &BlasKargs,
    ) -> Result<()> {
        gemm_default_decomp(pgran, subdims, args)
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

static GEMM_LDS: GemmLds = GemmLds;
static GEMM_IMAGE: GemmImage = GemmImage;
static GEMM_CACHED: GemmCached = GemmCached;

pub(super) fn register(reg: &mut SolverRegistry) {
    let func = BlasFunctionID::Gemm.index();
    reg.register(func, MemoryPattern {
        name: "LDS blocked gemm",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &GEMM_LDS,
    });
    reg.register(func, MemoryPattern {
        name: "image blocked gemm",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &GEMM_IMAGE,
    });
    reg.register(func, MemoryPattern {
        name: "blocked gemm with caching",
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        sops: &GEMM_CACHED,
    });
}
