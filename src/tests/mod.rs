//! Scenario tests running the whole dispatch pipeline against the
//! software compute backend in [`soft`].

pub mod soft;

mod binary;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

pub fn random_vec(rng: &mut SmallRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

/// Host reference gemm, mirroring the kernel contract.
#[allow(clippy::too_many_arguments)]
pub fn host_gemm_f32(
    column_major: bool,
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    beta: f32,
    c: &mut [f32],
    ldc: usize,
) {
    let idx = |r: usize, cc: usize, ld: usize| {
        if column_major {
            cc * ld + r
        } else {
            r * ld + cc
        }
    };

    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                let av = if trans_a { a[idx(p, i, lda)] } else { a[idx(i, p, lda)] };
                let bv = if trans_b { b[idx(j, p, ldb)] } else { b[idx(p, j, ldb)] };
                acc += av * bv;
            }
            let ci = idx(i, j, ldc);
            c[ci] = alpha * acc + beta * c[ci];
        }
    }
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}
