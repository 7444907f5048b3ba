//! Client acquisition.
//!
//! The host platform is built in and always available. Every other platform
//! is looked up in the registry; a missing registration and a platform that
//! cannot come up in this process are both `NotFound`.

use crate::backend::host::HostPlatform;
use crate::backend::erase;
use crate::client::RuntimeClient;
use crate::error::{RuntimeError, RuntimeResult};
use crate::options::{AllocatorKind, GpuOptions, HostOptions, PlatformOptions};
use crate::registry;

/// Platform names the acquisition functions look up.
pub const GPU_PLATFORM: &str = "gpu";
pub const TPU_PLATFORM: &str = "tpu";

/// Which platform to connect to.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSpec {
    Host,
    Gpu(GpuOptions),
    Tpu,
    Plugin { device_type: String },
}

pub fn get_client(spec: ClientSpec) -> RuntimeResult<RuntimeClient> {
    match spec {
        ClientSpec::Host => host_client(),
        ClientSpec::Gpu(options) => gpu_client_with(options),
        ClientSpec::Tpu => tpu_client(),
        ClientSpec::Plugin { device_type } => plugin_client(&device_type),
    }
}

/// Host client configured from the environment.
pub fn host_client() -> RuntimeResult<RuntimeClient> {
    host_client_with(HostOptions::default())
}

pub fn host_client_with(options: HostOptions) -> RuntimeResult<RuntimeClient> {
    let platform = HostPlatform::new(options).map_err(|err| err.into_runtime("host_client", None))?;
    Ok(RuntimeClient::from_backend(erase(platform)))
}

/// GPU client. `memory_fraction` must be in (0, 1].
pub fn gpu_client(
    memory_fraction: f64,
    preallocate: bool,
    allocator: AllocatorKind,
) -> RuntimeResult<RuntimeClient> {
    gpu_client_with(GpuOptions {
        memory_fraction,
        preallocate,
        allocator,
    })
}

pub fn gpu_client_with(options: GpuOptions) -> RuntimeResult<RuntimeClient> {
    const OP: &str = "gpu_client";
    options
        .validate()
        .map_err(|detail| RuntimeError::invalid_argument(OP, detail))?;
    from_registry(OP, GPU_PLATFORM, &PlatformOptions::Gpu(options))
}

pub fn tpu_client() -> RuntimeResult<RuntimeClient> {
    from_registry("tpu_client", TPU_PLATFORM, &PlatformOptions::Tpu)
}

/// Client for a platform registered under `device_type`.
pub fn plugin_client(device_type: &str) -> RuntimeResult<RuntimeClient> {
    const OP: &str = "plugin_client";
    if device_type.trim().is_empty() {
        return Err(RuntimeError::invalid_argument(OP, "device type is empty"));
    }
    from_registry(
        OP,
        device_type,
        &PlatformOptions::Plugin {
            device_type: device_type.to_string(),
        },
    )
}

fn from_registry(
    op: &'static str,
    name: &str,
    options: &PlatformOptions,
) -> RuntimeResult<RuntimeClient> {
    match registry::create_platform(name, options) {
        Some(Ok(backend)) => Ok(RuntimeClient::from_backend(backend)),
        Some(Err(err)) => {
            log::debug!("platform '{name}' failed to come up: {err}");
            Err(err.into_runtime(op, None))
        }
        None => Err(RuntimeError::not_found(
            op,
            format!(
                "no platform registered as '{name}' (registered: {})",
                registry::list_platforms().join(", ")
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_plugin_name_is_invalid() {
        let err = plugin_client("  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn fraction_is_checked_before_lookup() {
        let err = gpu_client(1.5, false, AllocatorKind::Default).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("memory_fraction"));
    }
}
