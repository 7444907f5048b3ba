use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{BackendError, BackendResult};
use crate::shape::MemoryStats;

#[derive(Debug, Default)]
struct Usage {
    bytes_in_use: usize,
    peak_bytes_in_use: usize,
    num_allocs: u64,
}

/// Byte accounting for one host device.
#[derive(Debug)]
pub(crate) struct DeviceMemory {
    limit: Option<usize>,
    usage: Mutex<Usage>,
}

impl DeviceMemory {
    pub(crate) fn new(limit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            usage: Mutex::new(Usage::default()),
        })
    }

    /// Reserves `bytes`, failing with `OutOfMemory` past the limit.
    pub(crate) fn reserve(self: &Arc<Self>, bytes: usize) -> BackendResult<MemoryLease> {
        let mut usage = self.lock();
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(usage.bytes_in_use);
            if bytes > available {
                return Err(BackendError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        usage.bytes_in_use += bytes;
        usage.peak_bytes_in_use = usage.peak_bytes_in_use.max(usage.bytes_in_use);
        usage.num_allocs += 1;
        Ok(MemoryLease {
            memory: Arc::clone(self),
            bytes,
        })
    }

    pub(crate) fn stats(&self) -> MemoryStats {
        let usage = self.lock();
        MemoryStats {
            bytes_in_use: usage.bytes_in_use,
            peak_bytes_in_use: usage.peak_bytes_in_use,
            num_allocs: usage.num_allocs,
            bytes_limit: self.limit,
        }
    }

    fn release(&self, bytes: usize) {
        let mut usage = self.lock();
        usage.bytes_in_use = usage.bytes_in_use.saturating_sub(bytes);
    }

    fn lock(&self) -> MutexGuard<'_, Usage> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outstanding reservation; returns its bytes when dropped.
#[derive(Debug)]
pub(crate) struct MemoryLease {
    memory: Arc<DeviceMemory>,
    bytes: usize,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.memory.release(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_returns_bytes_on_drop() {
        let memory = DeviceMemory::new(Some(100));
        let first = memory.reserve(60).unwrap();
        assert_eq!(
            memory.reserve(50).unwrap_err(),
            BackendError::OutOfMemory {
                requested: 50,
                available: 40
            }
        );
        drop(first);
        let second = memory.reserve(100).unwrap();
        let stats = memory.stats();
        assert_eq!(stats.bytes_in_use, 100);
        assert_eq!(stats.peak_bytes_in_use, 100);
        assert_eq!(stats.num_allocs, 2);
        drop(second);
        assert_eq!(memory.stats().bytes_in_use, 0);
    }

    #[test]
    fn unlimited_memory_never_refuses() {
        let memory = DeviceMemory::new(None);
        let _lease = memory.reserve(usize::MAX / 2).unwrap();
        assert_eq!(memory.stats().bytes_limit, None);
    }
}
