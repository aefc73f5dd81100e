//! The kernel launch engine: binds arguments, stages host buffers,
//! enqueues the kernel and attributes any failure to the exact
//! compute-API call and argument that caused it.
//!
//! The engine knows nothing about BLAS; it translates a descriptor of
//! (kernel, arguments, geometry) into the ordered sequence of API calls:
//! argument setting interleaved with write stagings, the NDRange
//! enqueue, an optional wait and profiling read, then read stagings.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::compute::{ArgVal, Event, Kernel, Mem, Queue};
use crate::error::{Error, LaunchError, LaunchPhase, Result};
use crate::types::ArgMultiplier;

pub const MAX_KERNEL_ARGS: usize = 32;
/// Largest scalar argument, the size of a kernel-side `double2`.
pub const MAX_ARG_SIZE: usize = 16;
pub const MAX_WORK_DIM: usize = 3;

bitflags! {
    /// Memory-object data transfer direction for host staging.
    pub struct MemobjDir: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
    }
}

/// A host staging buffer attached to a memory-object argument.
pub type HostBuf = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Clone)]
enum ArgData {
    Mem(Mem),
    Bytes { data: [u8; MAX_ARG_SIZE], len: usize },
}

/// One argument of a kernel launch, in declaration order.
#[derive(Debug, Clone)]
pub struct KernelArg {
    value: ArgData,
    host_buf: Option<(HostBuf, MemobjDir)>,
}

impl KernelArg {
    pub fn mem(mem: Mem) -> KernelArg {
        KernelArg {
            value: ArgData::Mem(mem),
            host_buf: None,
        }
    }

    /// A memory-object argument with a host buffer staged in the given
    /// direction around the kernel run.
    pub fn staged_mem(mem: Mem, host: HostBuf, dir: MemobjDir) -> KernelArg {
        KernelArg {
            value: ArgData::Mem(mem),
            host_buf: Some((host, dir)),
        }
    }

    /// A raw scalar argument of at most [`MAX_ARG_SIZE`] bytes.
    pub fn bytes(bytes: &[u8]) -> KernelArg {
        let len = bytes.len().min(MAX_ARG_SIZE);
        let mut data = [0u8; MAX_ARG_SIZE];
        data[..len].copy_from_slice(&bytes[..len]);
        KernelArg {
            value: ArgData::Bytes { data, len },
            host_buf: None,
        }
    }

    pub fn uint(value: u32) -> KernelArg {
        KernelArg::bytes(&value.to_le_bytes())
    }

    pub fn int(value: i32) -> KernelArg {
        KernelArg::bytes(&value.to_le_bytes())
    }

    pub fn float(value: f32) -> KernelArg {
        KernelArg::bytes(&value.to_le_bytes())
    }

    pub fn double(value: f64) -> KernelArg {
        KernelArg::bytes(&value.to_le_bytes())
    }

    /// A `size_t` kernel argument. Passed at unsigned-int width to match
    /// the 32-bit kernel ABI.
    pub fn size(value: usize) -> KernelArg {
        KernelArg::uint(value as u32)
    }

    pub fn multiplier(value: &ArgMultiplier) -> KernelArg {
        let (data, len) = value.to_bytes();
        KernelArg::bytes(&data[..len])
    }

    fn as_arg_val(&self) -> ArgVal {
        match self.value {
            ArgData::Mem(ref mem) => ArgVal::Mem(mem),
            ArgData::Bytes { ref data, len } => ArgVal::Bytes(&data[..len]),
        }
    }

    fn staging(&self, dir: MemobjDir) -> Option<(&Mem, &HostBuf)> {
        match (&self.value, &self.host_buf) {
            (ArgData::Mem(mem), Some((host, d))) if d.contains(dir) => Some((mem, host)),
            _ => None,
        }
    }
}

/// Descriptor of one kernel launch.
#[derive(Debug, Clone)]
pub struct KernelDesc {
    pub kernel: Kernel,
    pub work_dim: u32,
    pub global_threads: [usize; MAX_WORK_DIM],
    pub local_threads: [usize; MAX_WORK_DIM],
    pub wait_list: Vec<Event>,
    /// Return without waiting on the completion event.
    pub nowait: bool,
    /// Record execution time from the event's profiling info.
    pub need_exec_time: bool,
    pub args: Vec<KernelArg>,
    /// Kernel execution time in nanoseconds, when requested.
    pub exec_time: u64,
}

impl KernelDesc {
    pub fn new(kernel: Kernel) -> KernelDesc {
        KernelDesc {
            kernel,
            work_dim: 1,
            global_threads: [1; MAX_WORK_DIM],
            local_threads: [1; MAX_WORK_DIM],
            wait_list: Vec::new(),
            nowait: false,
            need_exec_time: false,
            args: Vec::with_capacity(MAX_KERNEL_ARGS),
            exec_time: 0,
        }
    }
}

fn launch_err(phase: LaunchPhase, wrong_arg: Option<u32>, source: crate::compute::ApiError)
        -> Error {
    Error::Launch(LaunchError { phase, wrong_arg, source })
}

/// Stores the kernel arguments, launches the kernel and reads back its
/// results. The number of arguments is taken from the kernel itself.
pub fn launch_kernel(desc: &mut KernelDesc, queue: &Queue) -> Result<Event> {
    let nr_args = desc.kernel.num_args().map_err(Error::from)?;

    for i in 0..nr_args {
        let arg = desc.args.get(i as usize).ok_or_else(|| {
            launch_err(
                LaunchPhase::SetArgs,
                Some(i),
                crate::compute::ApiError::InvalidArgIndex(i),
            )
        })?;

        desc.kernel
            .set_arg(i, arg.as_arg_val())
            .map_err(|err| launch_err(LaunchPhase::SetArgs, Some(i), err))?;

        if let Some((mem, host)) = arg.staging(MemobjDir::WRITE) {
            let data = host.lock().unwrap();
            queue
                .enqueue_write_buffer(mem, true, &data)
                .map_err(|err| launch_err(LaunchPhase::EnqueueWrite, Some(i), err))?;
        }
    }

    let dim = desc.work_dim as usize;
    let event = queue
        .enqueue_kernel(
            &desc.kernel,
            desc.work_dim,
            &desc.global_threads[..dim],
            &desc.local_threads[..dim],
            &desc.wait_list,
        )
        .map_err(|err| launch_err(LaunchPhase::EnqueueKernel, None, err))?;

    if !desc.nowait {
        event
            .wait()
            .map_err(|err| launch_err(LaunchPhase::EnqueueKernel, None, err))?;
    }

    if desc.need_exec_time {
        if desc.nowait {
            event
                .wait()
                .map_err(|err| launch_err(LaunchPhase::Profiling, None, err))?;
        }
        let start = event
            .profiling_command_start()
            .map_err(|err| launch_err(LaunchPhase::Profiling, None, err))?;
        let end = event
            .profiling_command_end()
            .map_err(|err| launch_err(LaunchPhase::Profiling, None, err))?;
        desc.exec_time = end.saturating_sub(start);
    }

    for i in 0..nr_args {
        let arg = match desc.args.get(i as usize) {
            Some(arg) => arg,
            None => break,
        };
        if let Some((mem, host)) = arg.staging(MemobjDir::READ) {
            let mut data = host.lock().unwrap();
            queue
                .enqueue_read_buffer(mem, true, &mut data)
                .map_err(|err| launch_err(LaunchPhase::EnqueueRead, Some(i), err))?;
        }
    }

    Ok(event)
}
