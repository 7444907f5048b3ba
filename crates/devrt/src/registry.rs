//! Platform registry for runtime platform selection.
//!
//! Platforms are registered by name with a factory. The host platform is
//! built in; other crates contribute theirs through [`PLATFORM_REGISTRARS`]
//! at link time or by calling [`register_platform`].

use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::backend::host::{HostPlatform, HOST_PLATFORM_NAME};
use crate::backend::{erase, BackendError, BackendResult, ErasedBackend};
use crate::options::{HostOptions, PlatformOptions};

/// Factory that brings up a platform instance.
pub type PlatformFactory =
    Box<dyn Fn(&PlatformOptions) -> BackendResult<Box<dyn ErasedBackend>> + Send + Sync>;

/// Link-time registrars, run once when the registry is first touched.
#[linkme::distributed_slice]
pub static PLATFORM_REGISTRARS: [fn(&PlatformRegistry)] = [..];

/// Name-to-factory map behind the global registry.
pub struct PlatformRegistry {
    platforms: RwLock<HashMap<String, PlatformFactory>>,
}

impl PlatformRegistry {
    fn new() -> Self {
        Self {
            platforms: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PlatformOptions) -> BackendResult<Box<dyn ErasedBackend>> + Send + Sync + 'static,
    {
        let name = name.into();
        log::info!("registering platform '{name}'");
        self.platforms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Box::new(factory));
    }

    fn create(
        &self,
        name: &str,
        options: &PlatformOptions,
    ) -> Option<BackendResult<Box<dyn ErasedBackend>>> {
        let platforms = self
            .platforms
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let factory = platforms.get(name)?;
        Some(factory(options))
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .platforms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.platforms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<PlatformRegistry> = OnceLock::new();

fn global_registry() -> &'static PlatformRegistry {
    GLOBAL_REGISTRY.get_or_init(|| {
        let registry = PlatformRegistry::new();
        register_host(&registry);
        for registrar in PLATFORM_REGISTRARS {
            registrar(&registry);
        }
        registry
    })
}

fn host_factory(options: &PlatformOptions) -> BackendResult<Box<dyn ErasedBackend>> {
    let host_options = match options {
        PlatformOptions::Host(host) => host.clone(),
        _ => HostOptions::default(),
    };
    Ok(erase(HostPlatform::new(host_options)?))
}

fn register_host(registry: &PlatformRegistry) {
    registry.register(HOST_PLATFORM_NAME, host_factory);
    registry.register("cpu", host_factory);
}

/// Registers a platform factory under `name`, replacing any previous entry.
///
/// # Example
/// ```ignore
/// devrt::registry::register_platform("my_accel", |options| {
///     Ok(devrt::backend::erase(MyAccel::open(options)?))
/// });
/// ```
pub fn register_platform<F>(name: impl Into<String>, factory: F)
where
    F: Fn(&PlatformOptions) -> BackendResult<Box<dyn ErasedBackend>> + Send + Sync + 'static,
{
    global_registry().register(name, factory);
}

/// Brings up the platform registered as `name`.
///
/// Returns `None` if nothing is registered under that name.
pub fn create_platform(
    name: &str,
    options: &PlatformOptions,
) -> Option<BackendResult<Box<dyn ErasedBackend>>> {
    global_registry().create(name, options)
}

/// Lists registered platform names in sorted order.
pub fn list_platforms() -> Vec<String> {
    global_registry().list()
}

pub fn has_platform(name: &str) -> bool {
    global_registry().contains(name)
}

/// Convenience used by factories that cannot serve a request.
pub fn unavailable(name: &str, reason: impl std::fmt::Display) -> BackendError {
    BackendError::unavailable(format!("platform {name}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_is_always_registered() {
        assert!(has_platform("host"));
        assert!(has_platform("cpu"));
        let names = list_platforms();
        assert!(names.contains(&"host".to_string()));

        let backend = create_platform("cpu", &PlatformOptions::Tpu)
            .expect("cpu registered")
            .expect("host platform comes up");
        assert_eq!(backend.platform_name(), "host");
    }

    #[test]
    fn unknown_names_yield_none() {
        assert!(!has_platform("registry-test-missing"));
        let created = create_platform("registry-test-missing", &PlatformOptions::Tpu);
        assert!(created.is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        register_platform("registry-test-replace", |_| {
            Err(unavailable("registry-test-replace", "first"))
        });
        register_platform("registry-test-replace", |_| {
            Err(unavailable("registry-test-replace", "second"))
        });
        let err = match create_platform("registry-test-replace", &PlatformOptions::Tpu) {
            Some(Err(err)) => err,
            _ => panic!("expected a failing factory"),
        };
        assert!(err.to_string().contains("second"));
    }
}
