//! CUDA platform for devrt, loaded from the system driver at runtime.
//!
//! Linking this crate registers the platform as `"gpu"` and `"cuda"`. On a
//! machine without a usable driver, acquiring it fails with `NotFound`.

mod allocator;
mod backend;
mod driver;

use devrt::backend::{erase, BackendResult, ErasedBackend};
use devrt::options::{GpuOptions, PlatformOptions};
use devrt::registry::PlatformRegistry;

pub use backend::{CudaBuffer, CudaExecutable, CudaPlatform, CUDA_PLATFORM_NAME};
pub use driver::is_available;

fn cuda_factory(options: &PlatformOptions) -> BackendResult<Box<dyn ErasedBackend>> {
    let gpu_options = match options {
        PlatformOptions::Gpu(gpu) => gpu.clone(),
        _ => GpuOptions::default(),
    };
    Ok(erase(CudaPlatform::new(gpu_options)?))
}

fn register_into(registry: &PlatformRegistry) {
    registry.register(devrt::acquire::GPU_PLATFORM, cuda_factory);
    registry.register(CUDA_PLATFORM_NAME, cuda_factory);
}

#[devrt::linkme::distributed_slice(devrt::registry::PLATFORM_REGISTRARS)]
static REGISTER_CUDA_PLATFORM: fn(&PlatformRegistry) = register_into;
