//! The vendor-neutral compute-API surface consumed by the library.
//!
//! Every accelerator object the library touches is expressed as an
//! object-safe trait (`DeviceApi`, `ContextApi`, ...) wrapped in a cheap
//! cloneable handle. Real accelerator bindings implement these traits in
//! their own crates; the library core never talks to a driver directly.
//!
//! Handle equality and hashing are identity based, which is what the
//! kernel cache and scratch-image pool key on: two handles compare equal
//! exactly when they wrap the same underlying object, the same role raw
//! `cl_context`/`cl_device_id` values play in the C API.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::Status;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// A failure reported by the underlying compute API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("device resources exhausted")]
    OutOfResources,
    #[error("host memory allocation failed")]
    OutOfHostMemory,
    #[error("no kernel compiler available")]
    CompilerNotAvailable,
    #[error("program build failed")]
    BuildProgramFailure,
    #[error("no kernel named '{0}' in program")]
    InvalidKernelName(String),
    #[error("kernel argument index {0} out of range")]
    InvalidArgIndex(u32),
    #[error("invalid value for kernel argument {0}")]
    InvalidArgValue(u32),
    #[error("invalid work-group geometry: {0}")]
    InvalidWorkGroupSize(String),
    #[error("profiling info not available")]
    ProfilingInfoNotAvailable,
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("{0}")]
    Backend(String),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match *self {
            ApiError::OutOfResources => Status::OutOfResources,
            ApiError::OutOfHostMemory => Status::OutOfHostMemory,
            ApiError::CompilerNotAvailable => Status::CompilerNotAvailable,
            ApiError::BuildProgramFailure | ApiError::InvalidKernelName(_) => {
                Status::BuildProgramFailure
            }
            ApiError::InvalidArgIndex(_)
            | ApiError::InvalidArgValue(_)
            | ApiError::InvalidWorkGroupSize(_)
            | ApiError::ProfilingInfoNotAvailable => Status::LaunchFailure,
            ApiError::InvalidValue(_) | ApiError::Backend(_) => Status::InvalidValue,
        }
    }
}

/// A value passed to [`KernelApi::set_arg`]: either raw bytes of a scalar
/// or a memory-object handle.
#[derive(Debug, Clone, Copy)]
pub enum ArgVal<'a> {
    Mem(&'a Mem),
    Bytes(&'a [u8]),
}

/// Channel layout of a 2D image. The scratch-image pool only ever asks
/// for RGBA / 32-bit unsigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub channel_order: ChannelOrder,
    pub channel_data_type: ChannelDataType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgba,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDataType {
    UnsignedInt32,
}

impl ImageFormat {
    pub const RGBA_U32: ImageFormat = ImageFormat {
        channel_order: ChannelOrder::Rgba,
        channel_data_type: ChannelDataType::UnsignedInt32,
    };
}

/// Device capability queries.
pub trait DeviceApi: fmt::Debug + Send + Sync {
    fn vendor(&self) -> ApiResult<String>;
    fn name(&self) -> ApiResult<String>;
    fn max_compute_units(&self) -> ApiResult<u32>;
    fn max_work_group_size(&self) -> ApiResult<usize>;
    fn local_mem_size(&self) -> ApiResult<u64>;
    fn min_data_type_align(&self) -> ApiResult<u32>;
    fn address_bits(&self) -> ApiResult<u32>;
    fn preferred_vector_width_double(&self) -> ApiResult<u32>;
    fn extensions(&self) -> ApiResult<String>;
}

/// Resource creation within a context.
pub trait ContextApi: fmt::Debug + Send + Sync {
    fn create_buffer(&self, len: usize) -> ApiResult<Mem>;
    fn create_image_2d(&self, format: ImageFormat, width: usize, height: usize)
        -> ApiResult<Mem>;
    fn create_program_with_source(&self, source: &str) -> ApiResult<Program>;
    fn create_program_with_binary(&self, device: &Device, binary: &[u8]) -> ApiResult<Program>;
}

/// A buffer or image.
pub trait MemApi: fmt::Debug + Send + Sync {
    /// Allocation size in bytes.
    fn len(&self) -> usize;
}

/// A program, built or not.
pub trait ProgramApi: fmt::Debug + Send + Sync {
    /// Compiles the program for `device`. A compile error is reported as
    /// `ApiError::BuildProgramFailure`; the log is then retrievable via
    /// [`ProgramApi::build_log`].
    fn build(&self, device: &Device, options: &str) -> ApiResult<()>;
    fn build_log(&self, device: &Device) -> ApiResult<String>;
    /// Per-device binary sizes. Unbuilt devices report zero.
    fn binary_sizes(&self) -> ApiResult<Vec<usize>>;
    fn binaries(&self) -> ApiResult<Vec<Vec<u8>>>;
    fn create_kernel(&self, name: &str) -> ApiResult<Kernel>;
}

/// A kernel instance with settable arguments.
pub trait KernelApi: fmt::Debug + Send + Sync {
    fn num_args(&self) -> ApiResult<u32>;
    fn set_arg(&self, index: u32, value: ArgVal) -> ApiResult<()>;
}

/// An in-order command queue bound to one device of one context.
pub trait QueueApi: fmt::Debug + Send + Sync {
    fn device(&self) -> Device;
    fn context(&self) -> Context;
    fn enqueue_write_buffer(&self, mem: &Mem, blocking: bool, data: &[u8]) -> ApiResult<()>;
    fn enqueue_read_buffer(&self, mem: &Mem, blocking: bool, out: &mut [u8]) -> ApiResult<()>;
    fn enqueue_kernel(
        &self,
        kernel: &Kernel,
        work_dim: u32,
        global_work_size: &[usize],
        local_work_size: &[usize],
        wait_list: &[Event],
    ) -> ApiResult<Event>;
}

/// A completion event with optional profiling info.
pub trait EventApi: fmt::Debug + Send + Sync {
    fn wait(&self) -> ApiResult<()>;
    /// Device timestamp, in nanoseconds, at which the command started.
    fn profiling_command_start(&self) -> ApiResult<u64>;
    /// Device timestamp, in nanoseconds, at which the command finished.
    fn profiling_command_end(&self) -> ApiResult<u64>;
}

macro_rules! handle_newtype {
    ($(#[$attr:meta])* $name:ident, $api:ident) => {
        $(#[$attr])*
        #[derive(Debug, Clone)]
        pub struct $name(Arc<dyn $api>);

        impl $name {
            pub fn new(api: Arc<dyn $api>) -> $name {
                $name(api)
            }

            /// Returns a reference to the underlying API object.
            pub fn api(&self) -> &dyn $api {
                &*self.0
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &$name) -> bool {
                // Identity comparison, as with raw API handles.
                Arc::ptr_eq(&self.0, &other.0)
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                (Arc::as_ptr(&self.0) as *const () as usize).hash(state);
            }
        }
    };
}

handle_newtype!(
    /// An accelerator device handle.
    Device, DeviceApi);
handle_newtype!(
    /// A compute context handle.
    Context, ContextApi);
handle_newtype!(
    /// A buffer or image handle.
    Mem, MemApi);
handle_newtype!(
    /// A program handle.
    Program, ProgramApi);
handle_newtype!(
    /// A kernel handle.
    Kernel, KernelApi);
handle_newtype!(
    /// A command-queue handle.
    Queue, QueueApi);
handle_newtype!(
    /// An event handle.
    Event, EventApi);

impl Device {
    pub fn vendor(&self) -> ApiResult<String> {
        self.0.vendor()
    }

    pub fn name(&self) -> ApiResult<String> {
        self.0.name()
    }

    pub fn max_compute_units(&self) -> ApiResult<u32> {
        self.0.max_compute_units()
    }

    pub fn max_work_group_size(&self) -> ApiResult<usize> {
        self.0.max_work_group_size()
    }

    pub fn local_mem_size(&self) -> ApiResult<u64> {
        self.0.local_mem_size()
    }

    pub fn min_data_type_align(&self) -> ApiResult<u32> {
        self.0.min_data_type_align()
    }

    pub fn address_bits(&self) -> ApiResult<u32> {
        self.0.address_bits()
    }

    pub fn preferred_vector_width_double(&self) -> ApiResult<u32> {
        self.0.preferred_vector_width_double()
    }

    pub fn extensions(&self) -> ApiResult<String> {
        self.0.extensions()
    }
}

impl Context {
    pub fn create_buffer(&self, len: usize) -> ApiResult<Mem> {
        self.0.create_buffer(len)
    }

    pub fn create_image_2d(&self, format: ImageFormat, width: usize, height: usize)
            -> ApiResult<Mem> {
        self.0.create_image_2d(format, width, height)
    }

    pub fn create_program_with_source(&self, source: &str) -> ApiResult<Program> {
        self.0.create_program_with_source(source)
    }

    pub fn create_program_with_binary(&self, device: &Device, binary: &[u8])
            -> ApiResult<Program> {
        self.0.create_program_with_binary(device, binary)
    }
}

impl Mem {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }
}

impl Program {
    pub fn build(&self, device: &Device, options: &str) -> ApiResult<()> {
        self.0.build(device, options)
    }

    pub fn build_log(&self, device: &Device) -> ApiResult<String> {
        self.0.build_log(device)
    }

    pub fn binary_sizes(&self) -> ApiResult<Vec<usize>> {
        self.0.binary_sizes()
    }

    pub fn binaries(&self) -> ApiResult<Vec<Vec<u8>>> {
        self.0.binaries()
    }

    pub fn create_kernel(&self, name: &str) -> ApiResult<Kernel> {
        self.0.create_kernel(name)
    }
}

impl Kernel {
    pub fn num_args(&self) -> ApiResult<u32> {
        self.0.num_args()
    }

    pub fn set_arg(&self, index: u32, value: ArgVal) -> ApiResult<()> {
        self.0.set_arg(index, value)
    }
}

impl Queue {
    pub fn device(&self) -> Device {
        self.0.device()
    }

    pub fn context(&self) -> Context {
        self.0.context()
    }

    pub fn enqueue_write_buffer(&self, mem: &Mem, blocking: bool, data: &[u8]) -> ApiResult<()> {
        self.0.enqueue_write_buffer(mem, blocking, data)
    }

    pub fn enqueue_read_buffer(&self, mem: &Mem, blocking: bool, out: &mut [u8])
            -> ApiResult<()> {
        self.0.enqueue_read_buffer(mem, blocking, out)
    }

    pub fn enqueue_kernel(
        &self,
        kernel: &Kernel,
        work_dim: u32,
        global_work_size: &[usize],
        local_work_size: &[usize],
        wait_list: &[Event],
    ) -> ApiResult<Event> {
        self.0
            .enqueue_kernel(kernel, work_dim, global_work_size, local_work_size, wait_list)
    }
}

impl Event {
    pub fn wait(&self) -> ApiResult<()> {
        self.0.wait()
    }

    pub fn profiling_command_start(&self) -> ApiResult<u64> {
        self.0.profiling_command_start()
    }

    pub fn profiling_command_end(&self) -> ApiResult<u64> {
        self.0.profiling_command_end()
    }
}
