use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use devrt::backend::host::interpreter::{self, FeedPort};
use devrt::backend::host::ProgramArtifact;
use devrt::backend::{
    BackendBuffer, BackendError, BackendExecutable, BackendResult, DeviceBackend,
};
use devrt::feed::FeedQueue;
use devrt::options::{AllocatorKind, CompileOptions, GpuOptions};
use devrt::program::{Literal, Program};
use devrt::shape::{DeviceDescription, DeviceId, DeviceKind, MemoryStats, Shape};
use devrt::RuntimeConfig;

use crate::allocator::{BestFitArena, BlockCache, ARENA_ALIGNMENT};
use crate::driver::{self, CUdeviceptr, CudaDriver};

pub const CUDA_PLATFORM_NAME: &str = "cuda";

/// How a device hands out memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolStrategy {
    /// One region reserved up front, sub-allocated best-fit.
    Arena,
    /// Driver allocations, with freed blocks kept for best-fit reuse.
    Cached,
    /// One driver allocation per buffer.
    Direct,
}

impl PoolStrategy {
    fn select(options: &GpuOptions) -> Self {
        match (options.allocator, options.preallocate) {
            (AllocatorKind::Default | AllocatorKind::BestFit, true) => PoolStrategy::Arena,
            (AllocatorKind::Default | AllocatorKind::BestFit, false) => PoolStrategy::Cached,
            (AllocatorKind::Platform, _) => PoolStrategy::Direct,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Base pointer and sub-allocator of the reserved region.
    arena: Option<(CUdeviceptr, BestFitArena)>,
    cache: BlockCache,
    /// Bytes of live blocks, including rounding by the arena or cache.
    reserved: usize,
    stats: MemoryStats,
}

struct CudaDevice {
    ordinal: usize,
    name: String,
    driver: Arc<CudaDriver>,
    strategy: PoolStrategy,
    limit: usize,
    pool: Mutex<PoolState>,
    infeed: FeedQueue,
    outfeed: FeedQueue,
    execution: Mutex<()>,
}

impl CudaDevice {
    fn lock_pool(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reserve_arena(&self, pool: &mut PoolState) -> BackendResult<()> {
        let base = self.driver.alloc(self.ordinal, self.limit)?;
        let arena = BestFitArena::new(self.limit);
        log::debug!(
            "cuda device {}: reserved {} byte arena",
            self.ordinal,
            arena.capacity()
        );
        pool.arena = Some((base, arena));
        Ok(())
    }

    fn allocate(self: &Arc<Self>, bytes: usize) -> BackendResult<CudaAllocation> {
        let mut pool = self.lock_pool();
        let (ptr, block, arena_offset) = match self.strategy {
            PoolStrategy::Arena => {
                let Some((base, arena)) = pool.arena.as_mut() else {
                    return Err(BackendError::device("device arena was never reserved"));
                };
                let Some(offset) = arena.allocate(bytes) else {
                    log::debug!(
                        "cuda device {}: arena exhausted ({} of {} bytes in use)",
                        self.ordinal,
                        arena.bytes_in_use(),
                        arena.capacity()
                    );
                    return Err(BackendError::OutOfMemory {
                        requested: bytes,
                        available: arena.largest_free_block(),
                    });
                };
                let block = bytes.max(1).next_multiple_of(ARENA_ALIGNMENT);
                (*base + offset as CUdeviceptr, block, Some(offset))
            }
            PoolStrategy::Cached => match pool.cache.take(bytes) {
                Some((ptr, block)) => (ptr, block, None),
                None => {
                    if pool.reserved + pool.cache.cached_bytes() + bytes > self.limit {
                        for ptr in pool.cache.drain() {
                            self.driver.free(self.ordinal, ptr);
                        }
                    }
                    self.check_budget(&pool, bytes)?;
                    (self.driver.alloc(self.ordinal, bytes)?, bytes, None)
                }
            },
            PoolStrategy::Direct => {
                self.check_budget(&pool, bytes)?;
                (self.driver.alloc(self.ordinal, bytes)?, bytes, None)
            }
        };

        pool.reserved += block;
        let stats = &mut pool.stats;
        stats.bytes_in_use += bytes;
        stats.peak_bytes_in_use = stats.peak_bytes_in_use.max(stats.bytes_in_use);
        stats.num_allocs += 1;
        Ok(CudaAllocation {
            device: Arc::clone(self),
            ptr,
            bytes,
            block,
            arena_offset,
        })
    }

    fn check_budget(&self, pool: &PoolState, bytes: usize) -> BackendResult<()> {
        let available = self.limit.saturating_sub(pool.reserved);
        if bytes > available {
            return Err(BackendError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        Ok(())
    }

    fn release(&self, allocation: &CudaAllocation) {
        let mut pool = self.lock_pool();
        match (allocation.arena_offset, self.strategy) {
            (Some(offset), _) => {
                if let Some((_, arena)) = pool.arena.as_mut() {
                    arena.release(offset);
                }
            }
            (None, PoolStrategy::Cached) => pool.cache.put(allocation.ptr, allocation.block),
            (None, _) => self.driver.free(self.ordinal, allocation.ptr),
        }
        pool.reserved = pool.reserved.saturating_sub(allocation.block);
        pool.stats.bytes_in_use = pool.stats.bytes_in_use.saturating_sub(allocation.bytes);
    }
}

impl Drop for CudaDevice {
    fn drop(&mut self) {
        let pool = self.pool.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some((base, _)) = pool.arena.take() {
            self.driver.free(self.ordinal, base);
        }
        for ptr in pool.cache.drain() {
            self.driver.free(self.ordinal, ptr);
        }
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaDevice")
            .field("ordinal", &self.ordinal)
            .field("name", &self.name)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Device memory released when the last buffer referring to it drops.
#[derive(Debug)]
struct CudaAllocation {
    device: Arc<CudaDevice>,
    ptr: CUdeviceptr,
    bytes: usize,
    /// Size of the underlying block, at least `bytes`.
    block: usize,
    arena_offset: Option<usize>,
}

impl Drop for CudaAllocation {
    fn drop(&mut self) {
        self.device.release(self);
    }
}

#[derive(Debug, Clone)]
pub struct CudaBuffer {
    device: DeviceId,
    shape: Shape,
    allocation: Arc<CudaAllocation>,
}

impl CudaBuffer {
    fn download(&self) -> BackendResult<Vec<u8>> {
        let allocation = &self.allocation;
        allocation
            .device
            .driver
            .download(allocation.device.ordinal, allocation.ptr, allocation.bytes)
    }
}

impl BackendBuffer for CudaBuffer {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn on_device_size(&self) -> usize {
        self.allocation.bytes
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct CudaExecutable {
    artifact: Arc<ProgramArtifact>,
    fingerprint: String,
}

impl BackendExecutable for CudaExecutable {
    fn parameter_shapes(&self) -> &[Shape] {
        &self.artifact.parameter_shapes
    }

    fn result_shapes(&self) -> &[Shape] {
        &self.artifact.result_shapes
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct DevicePort<'a> {
    device: &'a CudaDevice,
    timeout: Duration,
}

impl FeedPort for DevicePort<'_> {
    fn infeed(&self, shape: &Shape) -> BackendResult<Literal> {
        self.device.infeed.pop_matching(shape, self.timeout)
    }

    fn outfeed(&self, value: Literal) -> BackendResult<()> {
        self.device.outfeed.push(value)
    }
}

/// CUDA platform. Buffers live in device memory; programs are staged
/// through host memory and evaluated by the reference interpreter.
pub struct CudaPlatform {
    devices: Vec<Arc<CudaDevice>>,
    outfeed_timeout: Duration,
    feed_timeout: Duration,
}

impl CudaPlatform {
    /// Opens every visible device. Fails with `Unavailable` when the driver
    /// cannot be loaded.
    pub fn new(options: GpuOptions) -> BackendResult<Self> {
        options.validate().map_err(BackendError::invalid_argument)?;
        let driver = driver::driver()?;
        let config = RuntimeConfig::global();

        let strategy = PoolStrategy::select(&options);
        let mut devices = Vec::with_capacity(driver.device_count());
        for ordinal in 0..driver.device_count() {
            let (free, _) = driver.mem_info(ordinal)?;
            let limit = (free as f64 * options.memory_fraction) as usize;
            let mut pool = PoolState::default();
            pool.stats.bytes_limit = Some(limit);
            let device = Arc::new(CudaDevice {
                ordinal,
                name: driver
                    .device_name(ordinal)
                    .unwrap_or("cuda device")
                    .to_string(),
                driver: Arc::clone(&driver),
                strategy,
                limit,
                pool: Mutex::new(pool),
                infeed: FeedQueue::new(config.infeed_capacity),
                outfeed: FeedQueue::new(config.infeed_capacity),
                execution: Mutex::new(()),
            });
            if strategy == PoolStrategy::Arena {
                let mut pool = device.lock_pool();
                device.reserve_arena(&mut pool)?;
            }
            devices.push(device);
        }
        log::info!(
            "cuda platform: {} device(s), memory fraction {}, {strategy:?} pool",
            devices.len(),
            options.memory_fraction
        );
        Ok(Self {
            devices,
            outfeed_timeout: config.outfeed_timeout(),
            feed_timeout: config.feed_timeout(),
        })
    }

    fn device(&self, device: DeviceId) -> BackendResult<&Arc<CudaDevice>> {
        self.devices.get(device).ok_or_else(|| {
            BackendError::device(format!(
                "device {device} is out of range for {} CUDA device(s)",
                self.devices.len()
            ))
        })
    }

    fn upload(&self, device: DeviceId, shape: &Shape, bytes: &[u8]) -> BackendResult<CudaBuffer> {
        let cuda_device = self.device(device)?;
        let allocation = cuda_device.allocate(bytes.len())?;
        cuda_device
            .driver
            .upload(cuda_device.ordinal, allocation.ptr, bytes)?;
        Ok(CudaBuffer {
            device,
            shape: shape.clone(),
            allocation: Arc::new(allocation),
        })
    }
}

impl DeviceBackend for CudaPlatform {
    type Buffer = CudaBuffer;
    type Executable = CudaExecutable;

    fn platform_name(&self) -> &str {
        CUDA_PLATFORM_NAME
    }

    fn platform_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn devices(&self) -> Vec<DeviceDescription> {
        self.devices
            .iter()
            .enumerate()
            .map(|(id, device)| DeviceDescription {
                id,
                kind: DeviceKind::Gpu,
                name: device.name.clone(),
            })
            .collect()
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn memory_stats(&self, device: DeviceId) -> BackendResult<MemoryStats> {
        Ok(self.device(device)?.lock_pool().stats)
    }

    fn buffer_from_host(
        &self,
        bytes: &[u8],
        shape: &Shape,
        device: DeviceId,
    ) -> BackendResult<CudaBuffer> {
        self.upload(device, shape, bytes)
    }

    fn copy_to_device(&self, buffer: &CudaBuffer, target: DeviceId) -> BackendResult<CudaBuffer> {
        let bytes = buffer.download()?;
        self.upload(target, &buffer.shape, &bytes)
    }

    fn to_host(&self, buffer: &CudaBuffer) -> BackendResult<Vec<u8>> {
        buffer.download()
    }

    fn device_pointer(&self, buffer: &CudaBuffer) -> BackendResult<usize> {
        usize::try_from(buffer.allocation.ptr)
            .map_err(|_| BackendError::device("device pointer does not fit in usize"))
    }

    fn compile(
        &self,
        program: &Program,
        _options: &CompileOptions,
    ) -> BackendResult<CudaExecutable> {
        let artifact = ProgramArtifact::lower(program)?;
        let fingerprint = artifact.fingerprint(CUDA_PLATFORM_NAME)?;
        Ok(CudaExecutable {
            artifact: Arc::new(artifact),
            fingerprint,
        })
    }

    fn serialize_executable(&self, executable: &CudaExecutable) -> BackendResult<Vec<u8>> {
        executable.artifact.to_bytes()
    }

    fn deserialize_executable(&self, bytes: &[u8]) -> BackendResult<CudaExecutable> {
        let artifact = ProgramArtifact::from_bytes(bytes)?;
        let fingerprint = artifact
            .fingerprint(CUDA_PLATFORM_NAME)
            .map_err(|err| BackendError::corrupt(err.to_string()))?;
        Ok(CudaExecutable {
            artifact: Arc::new(artifact),
            fingerprint,
        })
    }

    fn fingerprint(&self, executable: &CudaExecutable) -> Option<String> {
        Some(executable.fingerprint.clone())
    }

    fn execute(
        &self,
        executable: &CudaExecutable,
        arguments: &[&CudaBuffer],
        device: DeviceId,
    ) -> BackendResult<Vec<CudaBuffer>> {
        let cuda_device = self.device(device)?;
        let function = executable.artifact.entry()?;
        let inputs = arguments
            .iter()
            .map(|buffer| Ok(Literal::new(buffer.shape.clone(), buffer.download()?)))
            .collect::<BackendResult<Vec<_>>>()?;
        let port = DevicePort {
            device: cuda_device,
            timeout: self.feed_timeout,
        };

        let _running = cuda_device
            .execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let results = interpreter::run_function(function, inputs, &port)?;

        results
            .iter()
            .map(|literal| {
                self.upload(device, &literal.shape, &literal.bytes)
                    .map_err(|err| match err {
                        BackendError::OutOfMemory { .. } => BackendError::execution(format!(
                            "materializing result {}: {err}",
                            literal.shape
                        )),
                        other => other,
                    })
            })
            .collect()
    }

    fn transfer_to_infeed(&self, device: DeviceId, value: Literal) -> BackendResult<()> {
        self.device(device)?.infeed.push(value)
    }

    fn transfer_from_outfeed(&self, device: DeviceId, shape: &Shape) -> BackendResult<Literal> {
        self.device(device)?
            .outfeed
            .pop_matching(shape, self.outfeed_timeout)
    }

    fn close_feeds(&self, device: DeviceId) -> BackendResult<()> {
        let device = self.device(device)?;
        device.infeed.close();
        device.outfeed.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(allocator: AllocatorKind, preallocate: bool) -> GpuOptions {
        GpuOptions {
            allocator,
            preallocate,
            ..GpuOptions::default()
        }
    }

    #[test]
    fn default_options_reserve_an_arena() {
        assert_eq!(
            PoolStrategy::select(&GpuOptions::default()),
            PoolStrategy::Arena
        );
    }

    #[test]
    fn preallocate_picks_arena_or_cache() {
        for allocator in [AllocatorKind::Default, AllocatorKind::BestFit] {
            assert_eq!(
                PoolStrategy::select(&options(allocator, true)),
                PoolStrategy::Arena
            );
            assert_eq!(
                PoolStrategy::select(&options(allocator, false)),
                PoolStrategy::Cached
            );
        }
    }

    #[test]
    fn platform_allocator_allocates_directly() {
        for preallocate in [true, false] {
            assert_eq!(
                PoolStrategy::select(&options(AllocatorKind::Platform, preallocate)),
                PoolStrategy::Direct
            );
        }
    }
}
