//! The solution sequence: turns one validated BLAS call into a built,
//! cached kernel and a launch.
//!
//! Patterns are ranked by their own performance estimate (a configured
//! default pattern goes first), then tried in order. Generation and
//! build failures demote the call to the next pattern; launch failures
//! are terminal. Image-backed patterns stage their operand with a pack
//! launch whose event feeds the main launch's wait list.

use log::{debug, warn};

use crate::blas::BlasFunctionID;
use crate::cache::{KernelEntry, KernelKey};
use crate::compute::{Context, Device, Event, Queue};
use crate::error::{Error, Result};
use crate::granulation::{PGranularity, SubproblemDim, MAX_SUBDIMS};
use crate::launch::{launch_kernel, KernelDesc};
use crate::library::Library;
use crate::program::build_program;
use crate::solver::{kextra_flags, BuildOptions, CheckCalcMode, KernelExtra, PatternPerf,
    SolverOps};
use crate::types::BlasKargs;

pub(crate) fn make_solution_seq(
    lib: &Library,
    func: BlasFunctionID,
    kargs: BlasKargs,
    queues: &[Queue],
    wait_list: &[Event],
) -> Result<Event> {
    let queue = queues.first().ok_or(Error::InvalidValue("commandQueues"))?;
    let device = queue.device();
    let context = queue.context();
    let target = lib.target_device(&device)?;

    if kargs.dtype.is_double_based() && !target.caps.native_double {
        return Err(Error::UnsupportedPrecision(kargs.dtype));
    }

    let mut kargs = kargs;
    kargs.addr_bits = target.caps.addr_bits;

    debug!("dispatching level-{} function {:?}", func.level(), func);

    let fpats = lib.solvers().function(func.index());
    let mut flags = kextra_flags(&kargs);
    if !func.has_beta() {
        flags.remove(crate::solver::KernelExtraFlags::BETA_ZERO);
    }

    let mut order: Vec<(usize, PatternPerf)> = fpats
        .patterns
        .iter()
        .enumerate()
        .map(|(i, p)| (i, p.sops.pattern_perf(flags, &kargs)))
        .filter(|(_, perf)| *perf != PatternPerf::NotSupported)
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1));
    if let Some(def) = fpats.default_pattern {
        if let Some(pos) = order.iter().position(|(i, _)| *i == def) {
            let forced = order.remove(pos);
            order.insert(0, forced);
        }
    }

    let mut last_err: Option<Error> = None;

    for (pat_idx, perf) in order {
        let pattern = &fpats.patterns[pat_idx];
        let sid = fpats.solver_ids[pat_idx];
        let sops = pattern.sops;

        let mut pgran = PGranularity::default();
        pgran.wf_size = target.caps.wavefront;
        pgran.max_work_group_size = target.caps.max_work_group_size as u32;
        let mut subdims = [SubproblemDim::default(); MAX_SUBDIMS];

        if let Err(err) = sops.default_decomp(&mut pgran, &mut subdims, &kargs) {
            debug!("pattern '{}': no decomposition ({})", pattern.name, err);
            last_err = Some(err);
            continue;
        }
        if !sops.check_calc_decomp(&mut pgran, &mut subdims, kargs.dtype, CheckCalcMode::Check) {
            debug!("pattern '{}': decomposition rejected", pattern.name);
            continue;
        }

        let mut call_args = kargs.clone();
        let mut extra = KernelExtra::new(call_args.dtype);
        extra.flags = flags;
        extra.vec_len = sops.select_vectorization(&call_args, call_args.dtype.vec_len());

        sops.fixup_args(&mut call_args, &mut subdims, &mut extra);

        if !sops.is_fit_to_lds(&subdims, call_args.dtype, target.caps.lds_size, &call_args) {
            debug!("pattern '{}': does not fit LDS", pattern.name);
            continue;
        }

        if sops.pack_kernel_name().is_some()
            && !claim_scratch_image(lib, sops, &context, &device, &subdims, &pgran,
                &mut call_args, &extra)
        {
            debug!("pattern '{}': no scratch image available", pattern.name);
            continue;
        }
        let claimed = call_args.scimage.clone();

        debug!(
            "{:?}: trying pattern '{}' (perf {:?}, solver {})",
            func, pattern.name, perf, sid
        );

        let key = KernelKey {
            device: device.clone(),
            context: context.clone(),
            nr_dims: pattern.nr_levels,
            subdims,
        };

        let entry = match lib.kernel_cache().find(sid, &key, &extra) {
            Some(entry) => entry,
            None => match generate_and_build(
                lib, sops, sid, &key, &subdims, &pgran, &call_args, &extra, &context, &device,
            ) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("pattern '{}' failed to build, falling back: {}", pattern.name, err);
                    release_claim(lib, &device, &claimed);
                    last_err = Some(err);
                    continue;
                }
            },
        };

        let result = run_solution(
            lib, sops, &call_args, &extra, &subdims, &pgran, queue, wait_list, &entry,
        );
        release_claim(lib, &device, &claimed);
        return result;
    }

    Err(last_err.unwrap_or(Error::BuildProgramFailure {
        log: "no usable memory pattern for the call".to_string(),
    }))
}

/// Claims a pooled scratch image sized for the pack launch and binds it
/// into the call arguments.
fn claim_scratch_image(
    lib: &Library,
    sops: &dyn SolverOps,
    context: &Context,
    device: &Device,
    subdims: &[SubproblemDim],
    pgran: &PGranularity,
    call_args: &mut BlasKargs,
    extra: &KernelExtra,
) -> bool {
    let threads = sops.calc_pack_threads(subdims, pgran, call_args, extra);
    let width = threads[0].max(1);
    let height = threads[1].max(1);
    let size = (width * height) as u64;

    match lib.scratch_images().get(context, device, size, size, width) {
        Some(image) => {
            call_args.scimage = Some(image);
            true
        }
        None => false,
    }
}

fn release_claim(lib: &Library, device: &Device, image: &Option<crate::compute::Mem>) {
    if let Some(image) = image {
        lib.scratch_images().put(device, image);
    }
}

fn generate_and_build(
    lib: &Library,
    sops: &dyn SolverOps,
    sid: usize,
    key: &KernelKey,
    subdims: &[SubproblemDim],
    pgran: &PGranularity,
    call_args: &BlasKargs,
    extra: &KernelExtra,
    context: &Context,
    device: &Device,
) -> Result<std::sync::Arc<KernelEntry>> {
    let size = sops.gen_kernel(None, subdims, pgran, extra)?;
    if size == 0 {
        return Err(Error::InvalidValue("generated kernel size"));
    }

    let mut source = String::with_capacity(size);
    sops.gen_kernel(Some(&mut source), subdims, pgran, extra)?;

    let mut opts = BuildOptions::new();
    sops.set_build_options(&mut opts, call_args);

    let program = build_program(context, device, &source, &opts.as_compiler_string(), None)?;
    let entry = KernelEntry::new(program, *extra, false);

    if let Err(err) = lib
        .kernel_cache()
        .add(sid, entry.clone(), key.clone(), sops.extra_cmp())
    {
        debug!("kernel not cached: {}", err);
    }

    Ok(entry)
}

#[allow(clippy::too_many_arguments)]
fn run_solution(
    lib: &Library,
    sops: &dyn SolverOps,
    call_args: &BlasKargs,
    extra: &KernelExtra,
    subdims: &[SubproblemDim],
    pgran: &PGranularity,
    queue: &Queue,
    wait_list: &[Event],
    entry: &KernelEntry,
) -> Result<Event> {
    let mut wait: Vec<Event> = wait_list.to_vec();

    if let Some(pack_name) = sops.pack_kernel_name() {
        let pack_kernel = entry.program().create_kernel(pack_name).map_err(Error::from)?;
        let mut desc = KernelDesc::new(pack_kernel);
        sops.assign_pack_kargs(&mut desc.args, call_args, extra);
        let threads = sops.calc_pack_threads(subdims, pgran, call_args, extra);
        desc.work_dim = 2;
        desc.global_threads = [threads[0], threads[1].max(1), 1];
        desc.local_threads = [pgran.wf_size as usize, 1, 1];
        desc.wait_list = wait.clone();
        desc.nowait = true;

        let pack_event = launch_kernel(&mut desc, queue)?;
        lib.decompose_events().push(pack_event.clone());
        wait.push(pack_event);
    }

    let kernel = entry.program().create_kernel(sops.kernel_name()).map_err(Error::from)?;
    let mut desc = KernelDesc::new(kernel);
    sops.assign_kargs(&mut desc.args, call_args, extra);

    let threads = sops.calc_threads(subdims, pgran, call_args, extra);
    let two_d = pgran.wg_dim == 2 || threads[1] > 1;
    desc.work_dim = if two_d { 2 } else { 1 };
    desc.global_threads = [threads[0], threads[1].max(1), 1];
    desc.local_threads = [
        pgran.wg_size[0] as usize,
        if two_d { pgran.wg_size[1] as usize } else { 1 },
        1,
    ];
    desc.wait_list = wait;
    desc.nowait = true;

    launch_kernel(&mut desc, queue)
}
