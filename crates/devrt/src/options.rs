use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::shape::{DeviceId, Shape};

/// Replication and placement options for `RuntimeClient::compile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    pub num_replicas: usize,
    pub num_partitions: usize,
    /// Pins a single-replica program to one device.
    pub device_ordinal: Option<DeviceId>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            num_replicas: 1,
            num_partitions: 1,
            device_ordinal: None,
        }
    }
}

impl BuildOptions {
    pub fn with_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas;
        self
    }

    pub fn with_device_ordinal(mut self, device: DeviceId) -> Self {
        self.device_ordinal = Some(device);
        self
    }

    /// Devices a non-portable program is bound to, in replica-major order.
    pub fn device_assignment(&self, device_count: usize) -> Result<Vec<DeviceId>, String> {
        let slots = self
            .num_replicas
            .checked_mul(self.num_partitions)
            .ok_or_else(|| "replica x partition count overflows".to_string())?;
        if slots == 0 {
            return Err("num_replicas and num_partitions must be at least 1".into());
        }
        if let Some(ordinal) = self.device_ordinal {
            if slots != 1 {
                return Err(format!(
                    "device_ordinal {ordinal} requires a single replica and partition, got {slots} slots"
                ));
            }
            if ordinal >= device_count {
                return Err(format!(
                    "device_ordinal {ordinal} is out of range for {device_count} device(s)"
                ));
            }
            return Ok(vec![ordinal]);
        }
        if slots > device_count {
            return Err(format!(
                "assignment needs {slots} device(s) but the client has {device_count}"
            ));
        }
        Ok((0..slots).collect())
    }
}

/// Everything a platform needs to lower a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub build: BuildOptions,
    pub portable: bool,
    /// Empty for portable programs.
    pub device_assignment: Vec<DeviceId>,
    pub argument_layouts: Vec<Shape>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocatorKind {
    #[default]
    Default,
    Platform,
    BestFit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuOptions {
    /// Share of free device memory the client may use, in (0, 1].
    pub memory_fraction: f64,
    pub preallocate: bool,
    pub allocator: AllocatorKind,
}

impl Default for GpuOptions {
    fn default() -> Self {
        Self {
            memory_fraction: 0.9,
            preallocate: true,
            allocator: AllocatorKind::Default,
        }
    }
}

impl GpuOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_fraction > 0.0 && self.memory_fraction <= 1.0 {
            Ok(())
        } else {
            Err(format!(
                "memory_fraction must be in (0, 1], got {}",
                self.memory_fraction
            ))
        }
    }
}

/// Host platform settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    pub device_count: usize,
    pub memory_limit: Option<usize>,
    pub infeed_capacity: usize,
    pub outfeed_timeout: Duration,
    pub feed_timeout: Duration,
}

impl HostOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            device_count: config.host_device_count,
            memory_limit: config.host_memory_limit,
            infeed_capacity: config.infeed_capacity,
            outfeed_timeout: config.outfeed_timeout(),
            feed_timeout: config.feed_timeout(),
        }
    }

    pub fn with_device_count(mut self, device_count: usize) -> Self {
        self.device_count = device_count;
        self
    }

    pub fn with_memory_limit(mut self, limit: usize) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_infeed_capacity(mut self, capacity: usize) -> Self {
        self.infeed_capacity = capacity;
        self
    }

    pub fn with_outfeed_timeout(mut self, timeout: Duration) -> Self {
        self.outfeed_timeout = timeout;
        self
    }

    pub fn with_feed_timeout(mut self, timeout: Duration) -> Self {
        self.feed_timeout = timeout;
        self
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::from_config(RuntimeConfig::global())
    }
}

/// Options handed to a platform factory by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformOptions {
    Host(HostOptions),
    Gpu(GpuOptions),
    Tpu,
    Plugin { device_type: String },
}
