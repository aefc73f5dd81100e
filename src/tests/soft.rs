//! A software implementation of the compute facade.
//!
//! Programs are "compiled" by checking that every template key was
//! resolved, entry points and argument counts are parsed out of the
//! generated source, and a handful of kernels (the buffer-backed gemm
//! variants, axpy, dot) execute natively so the scenarios can check
//! numeric results end to end. Build and transfer failures can be
//! forced for the fallback and attribution tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::compute::{
    ApiError, ApiResult, ArgVal, Context, ContextApi, Device, DeviceApi, Event, EventApi,
    ImageFormat, Kernel, KernelApi, Mem, MemApi, Program, ProgramApi, Queue, QueueApi,
};

/// Shared bookkeeping of one software context.
#[derive(Debug, Default)]
pub struct SoftState {
    mems: Mutex<HashMap<Mem, Arc<SoftMem>>>,
    kernels: Mutex<HashMap<Kernel, Arc<SoftKernel>>>,
    /// Successful program builds.
    pub builds: AtomicUsize,
    /// Source fragments whose programs must fail to compile.
    pub fail_sources: Mutex<Vec<String>>,
    /// Entry names of every executed kernel, in order.
    pub executed: Mutex<Vec<String>>,
    ticks: AtomicU64,
}

impl SoftState {
    pub fn executed_kernels(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn fail_source_containing(&self, fragment: &str) {
        self.fail_sources.lock().unwrap().push(fragment.to_string());
    }
}

#[derive(Debug)]
struct SoftMem {
    data: Mutex<Vec<u8>>,
    fail_write: bool,
    fail_read: bool,
}

#[derive(Debug)]
struct SoftMemApi {
    mem: Arc<SoftMem>,
}

impl MemApi for SoftMemApi {
    fn len(&self) -> usize {
        self.mem.data.lock().unwrap().len()
    }
}

#[derive(Debug)]
struct SoftArgSlot(Option<SoftArg>);

#[derive(Debug, Clone)]
enum SoftArg {
    Bytes(Vec<u8>),
    Mem(Mem),
}

#[derive(Debug)]
struct SoftKernel {
    name: String,
    options: String,
    nargs: u32,
    args: Mutex<Vec<SoftArgSlot>>,
}

#[derive(Debug)]
struct SoftContextApi {
    state: Arc<SoftState>,
}

#[derive(Debug)]
struct SoftProgramApi {
    state: Arc<SoftState>,
    source: String,
    built: Mutex<bool>,
    options: Mutex<String>,
    log: Mutex<String>,
}

#[derive(Debug)]
struct SoftKernelApi {
    kernel: Arc<SoftKernel>,
}

#[derive(Debug)]
struct SoftDeviceApi {
    native_double: bool,
}

#[derive(Debug)]
struct SoftQueueApi {
    state: Arc<SoftState>,
    device: Device,
    context: Context,
}

#[derive(Debug)]
struct SoftEventApi {
    start: u64,
    end: u64,
}

pub fn state() -> Arc<SoftState> {
    Arc::new(SoftState::default())
}

pub fn context(state: &Arc<SoftState>) -> Context {
    Context::new(Arc::new(SoftContextApi { state: state.clone() }))
}

pub fn device(native_double: bool) -> Device {
    Device::new(Arc::new(SoftDeviceApi { native_double }))
}

pub fn queue(state: &Arc<SoftState>, context: &Context, device: &Device) -> Queue {
    Queue::new(Arc::new(SoftQueueApi {
        state: state.clone(),
        device: device.clone(),
        context: context.clone(),
    }))
}

fn register_mem(state: &Arc<SoftState>, data: Vec<u8>, fail_write: bool, fail_read: bool)
        -> Mem {
    let mem = Arc::new(SoftMem {
        data: Mutex::new(data),
        fail_write,
        fail_read,
    });
    let handle = Mem::new(Arc::new(SoftMemApi { mem: mem.clone() }));
    state.mems.lock().unwrap().insert(handle.clone(), mem);
    handle
}

pub fn buffer_raw(state: &Arc<SoftState>, len: usize) -> Mem {
    register_mem(state, vec![0u8; len], false, false)
}

/// A buffer whose staging transfers fail on demand, for the launch
/// attribution tests.
pub fn poisoned_buffer(
    state: &Arc<SoftState>,
    len: usize,
    fail_write: bool,
    fail_read: bool,
) -> Mem {
    register_mem(state, vec![0u8; len], fail_write, fail_read)
}

pub fn buffer_from_f32(state: &Arc<SoftState>, data: &[f32]) -> Mem {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    register_mem(state, bytes, false, false)
}

pub fn buffer_from_f64(state: &Arc<SoftState>, data: &[f64]) -> Mem {
    let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    register_mem(state, bytes, false, false)
}

fn resolve(state: &Arc<SoftState>, mem: &Mem) -> ApiResult<Arc<SoftMem>> {
    state
        .mems
        .lock()
        .unwrap()
        .get(mem)
        .cloned()
        .ok_or_else(|| ApiError::Backend("unknown memory object".into()))
}

pub fn mem_bytes(state: &Arc<SoftState>, mem: &Mem) -> Vec<u8> {
    resolve(state, mem).unwrap().data.lock().unwrap().clone()
}

pub fn read_f32(state: &Arc<SoftState>, mem: &Mem) -> Vec<f32> {
    mem_bytes(state, mem)
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn read_f64(state: &Arc<SoftState>, mem: &Mem) -> Vec<f64> {
    mem_bytes(state, mem)
        .chunks_exact(8)
        .map(|c| {
            f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
        })
        .collect()
}

impl ContextApi for SoftContextApi {
    fn create_buffer(&self, len: usize) -> ApiResult<Mem> {
        Ok(buffer_raw(&self.state, len))
    }

    fn create_image_2d(&self, _format: ImageFormat, width: usize, height: usize)
            -> ApiResult<Mem> {
        Ok(buffer_raw(&self.state, width * height * 16))
    }

    fn create_program_with_source(&self, source: &str) -> ApiResult<Program> {
        Ok(Program::new(Arc::new(SoftProgramApi {
            state: self.state.clone(),
            source: source.to_string(),
            built: Mutex::new(false),
            options: Mutex::new(String::new()),
            log: Mutex::new(String::new()),
        })))
    }

    fn create_program_with_binary(&self, _device: &Device, binary: &[u8])
            -> ApiResult<Program> {
        // The software "binary" is the program source itself.
        let source = String::from_utf8(binary.to_vec())
            .map_err(|_| ApiError::InvalidValue("malformed program binary".into()))?;
        Ok(Program::new(Arc::new(SoftProgramApi {
            state: self.state.clone(),
            source,
            built: Mutex::new(false),
            options: Mutex::new(String::new()),
            log: Mutex::new(String::new()),
        })))
    }
}

/// Counts the declared arguments of `name`'s signature in `source`.
fn parse_arg_count(source: &str, name: &str) -> Option<u32> {
    let needle = format!("void {}(", name);
    let start = source.find(&needle)? + needle.len();
    let mut depth = 1usize;
    let mut commas = 0u32;
    let mut any = false;
    for ch in source[start..].chars() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(if any { commas + 1 } else { 0 });
                }
            }
            ',' if depth == 1 => commas += 1,
            c if !c.is_whitespace() => any = true,
            _ => {}
        }
    }
    None
}

impl ProgramApi for SoftProgramApi {
    fn build(&self, _device: &Device, options: &str) -> ApiResult<()> {
        for fragment in self.state.fail_sources.lock().unwrap().iter() {
            if self.source.contains(fragment.as_str()) {
                *self.log.lock().unwrap() =
                    format!("error: forced build failure (matched '{}')", fragment);
                return Err(ApiError::BuildProgramFailure);
            }
        }
        if self.source.contains('%') {
            *self.log.lock().unwrap() =
                "error: use of undeclared identifier (unresolved template key)".to_string();
            return Err(ApiError::BuildProgramFailure);
        }

        *self.options.lock().unwrap() = options.to_string();
        *self.built.lock().unwrap() = true;
        self.state.builds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn build_log(&self, _device: &Device) -> ApiResult<String> {
        Ok(self.log.lock().unwrap().clone())
    }

    fn binary_sizes(&self) -> ApiResult<Vec<usize>> {
        if *self.built.lock().unwrap() {
            Ok(vec![self.source.len()])
        } else {
            Ok(vec![0])
        }
    }

    fn binaries(&self) -> ApiResult<Vec<Vec<u8>>> {
        if *self.built.lock().unwrap() {
            Ok(vec![self.source.clone().into_bytes()])
        } else {
            Ok(vec![Vec::new()])
        }
    }

    fn create_kernel(&self, name: &str) -> ApiResult<Kernel> {
        if !*self.built.lock().unwrap() {
            return Err(ApiError::InvalidKernelName(name.to_string()));
        }
        let nargs = parse_arg_count(&self.source, name)
            .ok_or_else(|| ApiError::InvalidKernelName(name.to_string()))?;

        let kernel = Arc::new(SoftKernel {
            name: name.to_string(),
            options: self.options.lock().unwrap().clone(),
            nargs,
            args: Mutex::new((0..nargs).map(|_| SoftArgSlot(None)).collect()),
        });
        let handle = Kernel::new(Arc::new(SoftKernelApi { kernel: kernel.clone() }));
        self.state.kernels.lock().unwrap().insert(handle.clone(), kernel);
        Ok(handle)
    }
}

impl KernelApi for SoftKernelApi {
    fn num_args(&self) -> ApiResult<u32> {
        Ok(self.kernel.nargs)
    }

    fn set_arg(&self, index: u32, value: ArgVal) -> ApiResult<()> {
        if index >= self.kernel.nargs {
            return Err(ApiError::InvalidArgIndex(index));
        }
        let arg = match value {
            ArgVal::Bytes(bytes) => SoftArg::Bytes(bytes.to_vec()),
            ArgVal::Mem(mem) => SoftArg::Mem(mem.clone()),
        };
        self.kernel.args.lock().unwrap()[index as usize] = SoftArgSlot(Some(arg));
        Ok(())
    }
}

impl DeviceApi for SoftDeviceApi {
    fn vendor(&self) -> ApiResult<String> {
        Ok("Advanced Micro Devices, Inc.".to_string())
    }

    fn name(&self) -> ApiResult<String> {
        Ok("Tahiti".to_string())
    }

    fn max_compute_units(&self) -> ApiResult<u32> {
        Ok(8)
    }

    fn max_work_group_size(&self) -> ApiResult<usize> {
        Ok(256)
    }

    fn local_mem_size(&self) -> ApiResult<u64> {
        Ok(32 * 1024)
    }

    fn min_data_type_align(&self) -> ApiResult<u32> {
        Ok(128)
    }

    fn address_bits(&self) -> ApiResult<u32> {
        Ok(32)
    }

    fn preferred_vector_width_double(&self) -> ApiResult<u32> {
        if self.native_double {
            Ok(2)
        } else {
            Ok(0)
        }
    }

    fn extensions(&self) -> ApiResult<String> {
        if self.native_double {
            Ok("cl_khr_global_int32_base_atomics cl_khr_fp64".to_string())
        } else {
            Ok("cl_khr_global_int32_base_atomics".to_string())
        }
    }
}

impl QueueApi for SoftQueueApi {
    fn device(&self) -> Device {
        self.device.clone()
    }

    fn context(&self) -> Context {
        self.context.clone()
    }

    fn enqueue_write_buffer(&self, mem: &Mem, _blocking: bool, data: &[u8]) -> ApiResult<()> {
        let soft = resolve(&self.state, mem)?;
        if soft.fail_write {
            return Err(ApiError::Backend("forced write failure".into()));
        }
        let mut dst = soft.data.lock().unwrap();
        let len = dst.len().min(data.len());
        dst[..len].copy_from_slice(&data[..len]);
        Ok(())
    }

    fn enqueue_read_buffer(&self, mem: &Mem, _blocking: bool, out: &mut [u8]) -> ApiResult<()> {
        let soft = resolve(&self.state, mem)?;
        if soft.fail_read {
            return Err(ApiError::Backend("forced read failure".into()));
        }
        let src = soft.data.lock().unwrap();
        let len = src.len().min(out.len());
        out[..len].copy_from_slice(&src[..len]);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        kernel: &Kernel,
        _work_dim: u32,
        _global_work_size: &[usize],
        _local_work_size: &[usize],
        _wait_list: &[Event],
    ) -> ApiResult<Event> {
        let soft = self
            .state
            .kernels
            .lock()
            .unwrap()
            .get(kernel)
            .cloned()
            .ok_or_else(|| ApiError::Backend("unknown kernel".into()))?;

        execute_kernel(&self.state, &soft)?;
        self.state.executed.lock().unwrap().push(soft.name.clone());

        let start = self.state.ticks.fetch_add(1000, Ordering::SeqCst);
        Ok(Event::new(Arc::new(SoftEventApi { start, end: start + 800 })))
    }
}

impl EventApi for SoftEventApi {
    fn wait(&self) -> ApiResult<()> {
        Ok(())
    }

    fn profiling_command_start(&self) -> ApiResult<u64> {
        Ok(self.start)
    }

    fn profiling_command_end(&self) -> ApiResult<u64> {
        Ok(self.end)
    }
}

// ---------------------------------------------------------------------
// native execution of the modeled kernels

fn defined(options: &str, name: &str) -> bool {
    options.split("-D ").any(|tok| {
        let tok = tok.trim();
        tok == name || tok.starts_with(&format!("{}=", name))
    })
}

fn arg(kernel: &SoftKernel, index: usize) -> ApiResult<SoftArg> {
    kernel
        .args
        .lock()
        .unwrap()
        .get(index)
        .and_then(|slot| slot.0.clone())
        .ok_or(ApiError::InvalidArgValue(index as u32))
}

fn arg_bytes(kernel: &SoftKernel, index: usize) -> ApiResult<Vec<u8>> {
    match arg(kernel, index)? {
        SoftArg::Bytes(bytes) => Ok(bytes),
        SoftArg::Mem(_) => Err(ApiError::InvalidArgValue(index as u32)),
    }
}

fn arg_u32(kernel: &SoftKernel, index: usize) -> ApiResult<u32> {
    let bytes = arg_bytes(kernel, index)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn arg_i32(kernel: &SoftKernel, index: usize) -> ApiResult<i32> {
    let bytes = arg_bytes(kernel, index)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn arg_mem(state: &Arc<SoftState>, kernel: &SoftKernel, index: usize)
        -> ApiResult<Arc<SoftMem>> {
    match arg(kernel, index)? {
        SoftArg::Mem(mem) => resolve(state, &mem),
        SoftArg::Bytes(_) => Err(ApiError::InvalidArgValue(index as u32)),
    }
}

/// Element arithmetic shared by the f32/f64 executors.
trait HostFloat: Copy + Default + std::ops::Add<Output = Self> + std::ops::Mul<Output = Self> {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn read(buf: &[u8], index: usize) -> Self;
    fn write(buf: &mut [u8], index: usize, value: Self);
}

impl HostFloat for f32 {
    const SIZE: usize = 4;

    fn from_le(bytes: &[u8]) -> f32 {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn read(buf: &[u8], index: usize) -> f32 {
        f32::from_le(&buf[index * 4..])
    }

    fn write(buf: &mut [u8], index: usize, value: f32) {
        buf[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl HostFloat for f64 {
    const SIZE: usize = 8;

    fn from_le(bytes: &[u8]) -> f64 {
        f64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }

    fn read(buf: &[u8], index: usize) -> f64 {
        f64::from_le(&buf[index * 8..])
    }

    fn write(buf: &mut [u8], index: usize, value: f64) {
        buf[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    }
}

fn execute_kernel(state: &Arc<SoftState>, kernel: &SoftKernel) -> ApiResult<()> {
    if defined(&kernel.options, "COMPLEX") {
        // Complex arithmetic is not modeled natively.
        return Ok(());
    }
    let double = defined(&kernel.options, "DOUBLE_PRECISION");

    match kernel.name.as_str() {
        "gemmBlock" | "gemmLds" => {
            if double {
                exec_gemm::<f64>(state, kernel)
            } else {
                exec_gemm::<f32>(state, kernel)
            }
        }
        "axpyVec" => {
            if double {
                exec_axpy::<f64>(state, kernel)
            } else {
                exec_axpy::<f32>(state, kernel)
            }
        }
        "dotVec" => {
            if double {
                exec_dot::<f64>(state, kernel)
            } else {
                exec_dot::<f32>(state, kernel)
            }
        }
        // Packing and the kernels without native execution succeed
        // without touching data.
        _ => Ok(()),
    }
}

fn storage_index(row: usize, col: usize, ld: usize, column_major: bool) -> usize {
    if column_major {
        col * ld + row
    } else {
        row * ld + col
    }
}

fn exec_gemm<T: HostFloat>(state: &Arc<SoftState>, kernel: &SoftKernel) -> ApiResult<()> {
    let m = arg_u32(kernel, 0)? as usize;
    let n = arg_u32(kernel, 1)? as usize;
    let k = arg_u32(kernel, 2)? as usize;
    let alpha = T::from_le(&arg_bytes(kernel, 3)?);
    let beta = T::from_le(&arg_bytes(kernel, 4)?);
    let a = arg_mem(state, kernel, 5)?;
    let lda = arg_u32(kernel, 6)? as usize;
    let off_a = arg_u32(kernel, 7)? as usize;
    let b = arg_mem(state, kernel, 8)?;
    let ldb = arg_u32(kernel, 9)? as usize;
    let off_b = arg_u32(kernel, 10)? as usize;
    let c = arg_mem(state, kernel, 11)?;
    let ldc = arg_u32(kernel, 12)? as usize;
    let off_c = arg_u32(kernel, 13)? as usize;

    let column_major = defined(&kernel.options, "COLUMN_MAJOR");
    let trans_a = defined(&kernel.options, "TRANS_A");
    let trans_b = defined(&kernel.options, "TRANS_B");
    let beta_zero = defined(&kernel.options, "BETA_ZERO");

    let a_data = a.data.lock().unwrap();
    let b_data = b.data.lock().unwrap();
    let mut c_data = c.data.lock().unwrap();

    for i in 0..m {
        for j in 0..n {
            let mut acc = T::default();
            for p in 0..k {
                let ai = if trans_a {
                    storage_index(p, i, lda, column_major)
                } else {
                    storage_index(i, p, lda, column_major)
                };
                let bi = if trans_b {
                    storage_index(j, p, ldb, column_major)
                } else {
                    storage_index(p, j, ldb, column_major)
                };
                acc = acc + T::read(&a_data, off_a + ai) * T::read(&b_data, off_b + bi);
            }
            let ci = off_c + storage_index(i, j, ldc, column_major);
            let mut v = alpha * acc;
            if !beta_zero {
                v = v + beta * T::read(&c_data, ci);
            }
            T::write(&mut c_data, ci, v);
        }
    }
    Ok(())
}

fn strided_index(i: usize, inc: i32, n: usize) -> usize {
    if inc >= 0 {
        i * inc as usize
    } else {
        (n - 1 - i) * inc.unsigned_abs() as usize
    }
}

fn exec_axpy<T: HostFloat>(state: &Arc<SoftState>, kernel: &SoftKernel) -> ApiResult<()> {
    let n = arg_u32(kernel, 0)? as usize;
    let alpha = T::from_le(&arg_bytes(kernel, 1)?);
    let x = arg_mem(state, kernel, 2)?;
    let off_x = arg_u32(kernel, 3)? as usize;
    let incx = arg_i32(kernel, 4)?;
    let y = arg_mem(state, kernel, 5)?;
    let off_y = arg_u32(kernel, 6)? as usize;
    let incy = arg_i32(kernel, 7)?;

    let x_data = x.data.lock().unwrap();
    let mut y_data = y.data.lock().unwrap();
    for i in 0..n {
        let xi = off_x + strided_index(i, incx, n);
        let yi = off_y + strided_index(i, incy, n);
        let v = alpha * T::read(&x_data, xi) + T::read(&y_data, yi);
        T::write(&mut y_data, yi, v);
    }
    Ok(())
}

fn exec_dot<T: HostFloat>(state: &Arc<SoftState>, kernel: &SoftKernel) -> ApiResult<()> {
    let n = arg_u32(kernel, 0)? as usize;
    let d = arg_mem(state, kernel, 1)?;
    let off_d = arg_u32(kernel, 2)? as usize;
    let x = arg_mem(state, kernel, 3)?;
    let off_x = arg_u32(kernel, 4)? as usize;
    let incx = arg_i32(kernel, 5)?;
    let y = arg_mem(state, kernel, 6)?;
    let off_y = arg_u32(kernel, 7)? as usize;
    let incy = arg_i32(kernel, 8)?;

    let x_data = x.data.lock().unwrap();
    let y_data = y.data.lock().unwrap();
    let mut acc = T::default();
    for i in 0..n {
        let xi = off_x + strided_index(i, incx, n);
        let yi = off_y + strided_index(i, incy, n);
        acc = acc + T::read(&x_data, xi) * T::read(&y_data, yi);
    }
    let mut d_data = d.data.lock().unwrap();
    T::write(&mut d_data, off_d, acc);
    Ok(())
}
