//! Program binary round trip: a program rebuilt from its saved binary
//! behaves identically to the original.

use std::sync::Arc;

use super::soft::{self, SoftState};
use super::init_logger;
use crate::compute::{Context, Device, Program, Queue};
use crate::launch::{launch_kernel, KernelArg, KernelDesc};
use crate::program::{build_from_binary, build_program, program_binary, program_binary_size};

const AXPY_SRC: &str = "\
__kernel void axpyVec(
    uint N,
    float alpha,
    __global const float *X,
    uint offx,
    int incx,
    __global float *Y,
    uint offy,
    int incy)
{
    uint i = get_global_id(0);
    if (i >= N) {
        return;
    }
    Y[offy + i] = mad(alpha, X[offx + i], Y[offy + i]);
}
";

struct Fixture {
    state: Arc<SoftState>,
    context: Context,
    device: Device,
    queue: Queue,
}

fn fixture() -> Fixture {
    init_logger();
    let state = soft::state();
    let context = soft::context(&state);
    let device = soft::device(true);
    let queue = soft::queue(&state, &context, &device);
    Fixture { state, context, device, queue }
}

fn run_axpy(fx: &Fixture, program: &Program, x: &[f32], y: &[f32]) -> Vec<f32> {
    let kernel = program.create_kernel("axpyVec").unwrap();
    let x_buf = soft::buffer_from_f32(&fx.state, x);
    let y_buf = soft::buffer_from_f32(&fx.state, y);

    let mut desc = KernelDesc::new(kernel);
    desc.args.push(KernelArg::size(x.len()));
    desc.args.push(KernelArg::float(3.0));
    desc.args.push(KernelArg::mem(x_buf));
    desc.args.push(KernelArg::size(0));
    desc.args.push(KernelArg::int(1));
    desc.args.push(KernelArg::mem(y_buf.clone()));
    desc.args.push(KernelArg::size(0));
    desc.args.push(KernelArg::int(1));
    desc.global_threads = [x.len(), 1, 1];
    desc.local_threads = [1, 1, 1];

    launch_kernel(&mut desc, &fx.queue).unwrap();
    soft::read_f32(&fx.state, &y_buf)
}

#[test]
fn binary_size_matches_binary() {
    let fx = fixture();
    let program = build_program(&fx.context, &fx.device, AXPY_SRC, "", None).unwrap();

    let size = program_binary_size(&program).unwrap();
    assert!(size > 0);
    let binary = program_binary(&program).unwrap();
    assert_eq!(binary.len(), size);
}

#[test]
fn rebuilt_program_produces_identical_results() {
    let fx = fixture();
    let original = build_program(&fx.context, &fx.device, AXPY_SRC, "", None).unwrap();

    let binary = program_binary(&original).unwrap();
    let rebuilt = build_from_binary(&fx.context, &fx.device, &binary).unwrap();

    let x: Vec<f32> = (0..64).map(|i| i as f32 * 0.25).collect();
    let y: Vec<f32> = (0..64).map(|i| (63 - i) as f32).collect();

    let from_original = run_axpy(&fx, &original, &x, &y);
    let from_rebuilt = run_axpy(&fx, &rebuilt, &x, &y);
    assert_eq!(from_original, from_rebuilt);
}

#[test]
fn build_failure_carries_the_log() {
    let fx = fixture();
    fx.state.fail_source_containing("axpyVec");

    let mut log = String::new();
    let err = build_program(&fx.context, &fx.device, AXPY_SRC, "", Some(&mut log))
        .unwrap_err();
    match err {
        crate::error::Error::BuildProgramFailure { log: inner } => {
            assert!(inner.contains("forced build failure"));
            assert_eq!(inner, log);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
