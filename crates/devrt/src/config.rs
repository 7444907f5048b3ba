use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const HOST_DEVICE_COUNT_VAR: &str = "DEVRT_HOST_DEVICE_COUNT";
pub const HOST_MEMORY_LIMIT_VAR: &str = "DEVRT_HOST_MEMORY_LIMIT";
pub const INFEED_CAPACITY_VAR: &str = "DEVRT_INFEED_CAPACITY";
pub const OUTFEED_TIMEOUT_VAR: &str = "DEVRT_OUTFEED_TIMEOUT_MS";
pub const FEED_TIMEOUT_VAR: &str = "DEVRT_FEED_TIMEOUT_MS";
pub const DUMP_PROGRAMS_VAR: &str = "DEVRT_DUMP_PROGRAMS";

static ENV_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-level runtime knobs.
///
/// Explicit values passed to acquisition functions always take precedence;
/// this only supplies defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub host_device_count: usize,
    /// Per-device byte limit for host buffers. `None` means unlimited.
    pub host_memory_limit: Option<usize>,
    pub infeed_capacity: usize,
    pub outfeed_timeout_ms: u64,
    /// How long a running program waits on an empty infeed.
    pub feed_timeout_ms: u64,
    /// Log the textual form of every compiled program at debug level.
    pub dump_programs: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_device_count: 1,
            host_memory_limit: None,
            infeed_capacity: 1024,
            outfeed_timeout_ms: 30_000,
            feed_timeout_ms: 60_000,
            dump_programs: false,
        }
    }
}

impl RuntimeConfig {
    /// Returns the environment-derived config, read once per process.
    pub fn global() -> &'static RuntimeConfig {
        ENV_CONFIG.get_or_init(RuntimeConfig::from_env)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source. Malformed values are
    /// ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(count) = parse_var::<usize>(&lookup, HOST_DEVICE_COUNT_VAR) {
            if count == 0 {
                log::warn!(
                    "{HOST_DEVICE_COUNT_VAR}=0 ignored; at least one host device is required"
                );
            } else {
                config.host_device_count = count;
            }
        }
        if let Some(limit) = parse_var::<usize>(&lookup, HOST_MEMORY_LIMIT_VAR) {
            config.host_memory_limit = Some(limit);
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, INFEED_CAPACITY_VAR) {
            if capacity == 0 {
                log::warn!("{INFEED_CAPACITY_VAR}=0 ignored; queues need room for one entry");
            } else {
                config.infeed_capacity = capacity;
            }
        }
        if let Some(ms) = parse_var::<u64>(&lookup, OUTFEED_TIMEOUT_VAR) {
            config.outfeed_timeout_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, FEED_TIMEOUT_VAR) {
            config.feed_timeout_ms = ms;
        }
        if let Some(raw) = lookup(DUMP_PROGRAMS_VAR) {
            config.dump_programs = parse_bool(&raw);
        }
        config
    }

    pub fn outfeed_timeout(&self) -> Duration {
        Duration::from_millis(self.outfeed_timeout_ms)
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {name}={raw:?}");
            None
        }
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = RuntimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (HOST_DEVICE_COUNT_VAR, "4"),
            (HOST_MEMORY_LIMIT_VAR, "1048576"),
            (INFEED_CAPACITY_VAR, " 8 "),
            (OUTFEED_TIMEOUT_VAR, "250"),
            (FEED_TIMEOUT_VAR, "500"),
            (DUMP_PROGRAMS_VAR, "true"),
        ]));
        assert_eq!(config.host_device_count, 4);
        assert_eq!(config.host_memory_limit, Some(1 << 20));
        assert_eq!(config.infeed_capacity, 8);
        assert_eq!(config.outfeed_timeout(), Duration::from_millis(250));
        assert_eq!(config.feed_timeout(), Duration::from_millis(500));
        assert!(config.dump_programs);
    }

    #[test]
    fn malformed_and_zero_values_fall_back() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (HOST_DEVICE_COUNT_VAR, "0"),
            (INFEED_CAPACITY_VAR, "lots"),
            (OUTFEED_TIMEOUT_VAR, "-1"),
        ]));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn deserializes_partial_json() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"host_device_count": 2}"#).unwrap();
        assert_eq!(config.host_device_count, 2);
        assert_eq!(config.infeed_capacity, 1024);
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(parse_bool("ON"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("0"));
    }
}
