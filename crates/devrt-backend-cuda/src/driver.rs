use std::ffi::{c_char, c_void, CStr};
use std::sync::{Arc, OnceLock};

use devrt::backend::{BackendError, BackendResult};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
pub type CUdeviceptr = u64;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;
const DEVICE_NAME_LEN: usize = 256;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(count: *mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDeviceGetNameFn =
    unsafe extern "C" fn(name: *mut c_char, len: i32, device: CUdevice) -> CUresult;
type CuCtxCreateV2Fn =
    unsafe extern "C" fn(ctx: *mut CUcontext, flags: u32, dev: CUdevice) -> CUresult;
type CuCtxDestroyV2Fn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuMemAllocV2Fn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeV2Fn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;
type CuMemcpyHtoDV2Fn = unsafe extern "C" fn(
    dst_device: CUdeviceptr,
    src_host: *const c_void,
    byte_count: usize,
) -> CUresult;
type CuMemcpyDtoHV2Fn = unsafe extern "C" fn(
    dst_host: *mut c_void,
    src_device: CUdeviceptr,
    byte_count: usize,
) -> CUresult;
type CuMemGetInfoV2Fn = unsafe extern "C" fn(free: *mut usize, total: *mut usize) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get_count: CuDeviceGetCountFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_get_name: CuDeviceGetNameFn,
    cu_ctx_create_v2: CuCtxCreateV2Fn,
    cu_ctx_destroy_v2: CuCtxDestroyV2Fn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_mem_alloc_v2: CuMemAllocV2Fn,
    cu_mem_free_v2: CuMemFreeV2Fn,
    cu_memcpy_hto_d_v2: CuMemcpyHtoDV2Fn,
    cu_memcpy_dto_h_v2: CuMemcpyDtoHV2Fn,
    cu_mem_get_info_v2: CuMemGetInfoV2Fn,
}

struct DeviceContext {
    name: String,
    // Stored as usize so the driver is Send + Sync.
    ctx: usize,
}

/// Loaded CUDA driver with one context per visible device.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    contexts: Vec<DeviceContext>,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        for context in &mut self.contexts {
            if context.ctx != 0 {
                // SAFETY: Context is owned by this driver and destroyed once on drop.
                let _ = unsafe { (self.fns.cu_ctx_destroy_v2)(context.ctx as CUcontext) };
                context.ctx = 0;
            }
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

/// Process-wide driver, loaded on first use. A failed load is remembered.
pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => {
            log::info!(
                "CUDA driver loaded with {} device(s)",
                driver.device_count()
            );
            Ok(Arc::new(driver))
        }
        Err(err) => {
            log::debug!("CUDA driver unavailable: {err}");
            Err(err.to_string())
        }
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::unavailable(format!(
            "CUDA driver unavailable: {msg}"
        ))),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get_count: load_symbol(&lib, b"cuDeviceGetCount\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_get_name: load_symbol(&lib, b"cuDeviceGetName\0")?,
            cu_ctx_create_v2: load_symbol(&lib, b"cuCtxCreate_v2\0")?,
            cu_ctx_destroy_v2: load_symbol(&lib, b"cuCtxDestroy_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_mem_alloc_v2: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free_v2: load_symbol(&lib, b"cuMemFree_v2\0")?,
            cu_memcpy_hto_d_v2: load_symbol(&lib, b"cuMemcpyHtoD_v2\0")?,
            cu_memcpy_dto_h_v2: load_symbol(&lib, b"cuMemcpyDtoH_v2\0")?,
            cu_mem_get_info_v2: load_symbol(&lib, b"cuMemGetInfo_v2\0")?,
        };

        let mut driver = Self {
            _lib: lib,
            fns,
            contexts: Vec::new(),
        };

        // SAFETY: Calls are made with valid out pointers and follow the CUDA driver API contract.
        unsafe {
            check_cuda((driver.fns.cu_init)(0), "cuInit")?;
            let mut count: i32 = 0;
            check_cuda(
                (driver.fns.cu_device_get_count)(&mut count as *mut i32),
                "cuDeviceGetCount",
            )?;
            if count <= 0 {
                return Err(BackendError::unavailable("no CUDA devices visible"));
            }
            for ordinal in 0..count {
                let mut dev: CUdevice = 0;
                check_cuda(
                    (driver.fns.cu_device_get)(&mut dev as *mut CUdevice, ordinal),
                    "cuDeviceGet",
                )?;
                let mut name = [0 as c_char; DEVICE_NAME_LEN];
                check_cuda(
                    (driver.fns.cu_device_get_name)(name.as_mut_ptr(), DEVICE_NAME_LEN as i32, dev),
                    "cuDeviceGetName",
                )?;
                let mut ctx: CUcontext = std::ptr::null_mut();
                check_cuda(
                    (driver.fns.cu_ctx_create_v2)(&mut ctx as *mut CUcontext, 0, dev),
                    "cuCtxCreate_v2",
                )?;
                // Pushed before anything else can fail so Drop destroys it.
                driver.contexts.push(DeviceContext {
                    name: CStr::from_ptr(name.as_ptr()).to_string_lossy().into_owned(),
                    ctx: ctx as usize,
                });
            }
        }
        Ok(driver)
    }

    pub fn device_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn device_name(&self, device: usize) -> Option<&str> {
        self.contexts
            .get(device)
            .map(|context| context.name.as_str())
    }

    /// Free and total bytes on `device`.
    pub fn mem_info(&self, device: usize) -> BackendResult<(usize, usize)> {
        self.make_current(device)?;
        let mut free = 0usize;
        let mut total = 0usize;
        // SAFETY: Both out pointers are valid for the duration of the call.
        unsafe {
            check_cuda(
                (self.fns.cu_mem_get_info_v2)(&mut free as *mut usize, &mut total as *mut usize),
                "cuMemGetInfo_v2",
            )?;
        }
        Ok((free, total))
    }

    pub fn alloc(&self, device: usize, bytes: usize) -> BackendResult<CUdeviceptr> {
        self.make_current(device)?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: `ptr` is a valid out pointer for the allocation.
        let code =
            unsafe { (self.fns.cu_mem_alloc_v2)(&mut ptr as *mut CUdeviceptr, bytes.max(1)) };
        if code == CUDA_ERROR_OUT_OF_MEMORY {
            let available = self.mem_info(device).map(|(free, _)| free).unwrap_or(0);
            return Err(BackendError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        check_cuda(code, "cuMemAlloc_v2")?;
        Ok(ptr)
    }

    pub fn free(&self, device: usize, ptr: CUdeviceptr) {
        if self.make_current(device).is_err() {
            return;
        }
        // SAFETY: Pointer was returned by `alloc` on this device and is released once.
        let code = unsafe { (self.fns.cu_mem_free_v2)(ptr) };
        if code != CUDA_SUCCESS {
            log::warn!("cuMemFree_v2 on device {device} failed with code {code}");
        }
    }

    pub fn upload(&self, device: usize, dst: CUdeviceptr, bytes: &[u8]) -> BackendResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.make_current(device)?;
        // SAFETY: Destination is a live allocation of at least `bytes.len()` bytes.
        unsafe {
            check_cuda(
                (self.fns.cu_memcpy_hto_d_v2)(dst, bytes.as_ptr() as *const c_void, bytes.len()),
                "cuMemcpyHtoD_v2",
            )
        }
    }

    pub fn download(
        &self,
        device: usize,
        src: CUdeviceptr,
        bytes: usize,
    ) -> BackendResult<Vec<u8>> {
        let mut out = vec![0u8; bytes];
        if bytes != 0 {
            self.make_current(device)?;
            // SAFETY: Source is valid for `bytes`; destination host buffer is writable.
            unsafe {
                check_cuda(
                    (self.fns.cu_memcpy_dto_h_v2)(out.as_mut_ptr() as *mut c_void, src, bytes),
                    "cuMemcpyDtoH_v2",
                )?;
            }
        }
        Ok(out)
    }

    fn make_current(&self, device: usize) -> BackendResult<()> {
        let context = self.contexts.get(device).ok_or_else(|| {
            BackendError::device(format!(
                "device {device} out of range; {} CUDA device(s) visible",
                self.contexts.len()
            ))
        })?;
        // SAFETY: Context was created by this driver and remains valid until drop.
        unsafe {
            check_cuda(
                (self.fns.cu_ctx_set_current)(context.ctx as CUcontext),
                "cuCtxSetCurrent",
            )
        }
    }
}

fn load_cuda_library() -> BackendResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Only checks that the library loads; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            log::debug!("loaded CUDA driver from {candidate}");
            return Ok(lib);
        }
    }

    Err(BackendError::unavailable(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: Caller provides the expected symbol type from the CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::unavailable(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::device(format!(
            "CUDA driver call {op} failed with code {code}"
        )))
    }
}
