//! Host platform: logical devices backed by process memory.
//!
//! Always available. Each logical device has its own memory accounting,
//! infeed/outfeed queues, and execution lock, so a multi-device host client
//! behaves like a small multi-accelerator machine.

mod artifact;
pub mod interpreter;
mod memory;

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::backend::{
    BackendBuffer, BackendError, BackendExecutable, BackendResult, DeviceBackend,
};
use crate::feed::FeedQueue;
use crate::options::{CompileOptions, HostOptions};
use crate::program::{Literal, Program};
use crate::shape::{DeviceDescription, DeviceId, DeviceKind, MemoryStats, Shape};

pub use artifact::{ProgramArtifact, PROGRAM_ARTIFACT_VERSION};
use interpreter::FeedPort;
use memory::{DeviceMemory, MemoryLease};

pub const HOST_PLATFORM_NAME: &str = "host";

#[derive(Debug)]
struct HostStorage {
    bytes: Arc<[u8]>,
    _lease: MemoryLease,
}

/// Buffer resident in host memory on one logical device.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    device: DeviceId,
    shape: Shape,
    storage: Arc<HostStorage>,
}

impl HostBuffer {
    pub fn bytes(&self) -> &[u8] {
        &self.storage.bytes
    }

    fn to_literal(&self) -> Literal {
        Literal {
            shape: self.shape.clone(),
            bytes: Arc::clone(&self.storage.bytes),
        }
    }
}

impl BackendBuffer for HostBuffer {
    fn device(&self) -> DeviceId {
        self.device
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn on_device_size(&self) -> usize {
        self.storage.bytes.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
pub struct HostExecutable {
    artifact: Arc<ProgramArtifact>,
    fingerprint: String,
}

impl HostExecutable {
    pub fn artifact(&self) -> &ProgramArtifact {
        &self.artifact
    }
}

impl BackendExecutable for HostExecutable {
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

#[derive(Debug)]
struct HostDevice {
    memory: Arc<DeviceMemory>,
    infeed: FeedQueue,
    outfeed: FeedQueue,
    execution: Mutex<()>,
}

struct DevicePort<'a> {
    device: &'a HostDevice,
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

#[derive(Debug)]
pub struct HostPlatform {
    options: HostOptions,
    devices: Vec<HostDevice>,
}

impl HostPlatform {
    pub fn new(options: HostOptions) -> BackendResult<Self> {
        if options.device_count == 0 {
            return Err(BackendError::invalid_argument(
                "host platform needs at least one device",
            ));
        }
        if options.infeed_capacity == 0 {
            return Err(BackendError::invalid_argument(
                "feed queues need a capacity of at least one entry",
            ));
        }
        let devices = (0..options.device_count)
            .map(|_| HostDevice {
                memory: DeviceMemory::new(options.memory_limit),
                infeed: FeedQueue::new(options.infeed_capacity),
                outfeed: FeedQueue::new(options.infeed_capacity),
                execution: Mutex::new(()),
            })
            .collect();
        log::debug!(
            "host platform with {} device(s), memory limit {:?}",
            options.device_count,
            options.memory_limit
        );
        Ok(Self { options, devices })
    }

    fn device(&self, device: DeviceId) -> BackendResult<&HostDevice> {
        self.devices.get(device).ok_or_else(|| {
            BackendError::device(format!(
                "device {device} is out of range for {} host device(s)",
                self.devices.len()
            ))
        })
    }

    fn allocate(&self, device: DeviceId, shape: &Shape, bytes: &[u8]) -> BackendResult<HostBuffer> {
        let lease = self.device(device)?.memory.reserve(bytes.len())?;
        Ok(HostBuffer {
            device,
            shape: shape.clone(),
            storage: Arc::new(HostStorage {
                bytes: Arc::from(bytes),
                _lease: lease,
            }),
        })
    }
}

impl DeviceBackend for HostPlatform {
    type Buffer = HostBuffer;
    type Executable = HostExecutable;

    fn platform_name(&self) -> &str {
        HOST_PLATFORM_NAME
    }

    fn platform_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
    }

    fn devices(&self) -> Vec<DeviceDescription> {
        (0..self.devices.len())
            .map(|id| DeviceDescription {
                id,
                kind: DeviceKind::Host,
                name: format!("host:{id}"),
            })
            .collect()
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn memory_stats(&self, device: DeviceId) -> BackendResult<MemoryStats> {
        Ok(self.device(device)?.memory.stats())
    }

    fn buffer_from_host(
        &self,
        bytes: &[u8],
        shape: &Shape,
        device: DeviceId,
    ) -> BackendResult<HostBuffer> {
        self.allocate(device, shape, bytes)
    }

    fn copy_to_device(&self, buffer: &HostBuffer, target: DeviceId) -> BackendResult<HostBuffer> {
        self.allocate(target, &buffer.shape, buffer.bytes())
    }

    fn to_host(&self, buffer: &HostBuffer) -> BackendResult<Vec<u8>> {
        Ok(buffer.bytes().to_vec())
    }

    fn device_pointer(&self, buffer: &HostBuffer) -> BackendResult<usize> {
        Ok(buffer.storage.bytes.as_ptr() as usize)
    }

    fn compile(
        &self,
        program: &Program,
        _options: &CompileOptions,
    ) -> BackendResult<HostExecutable> {
        let artifact = ProgramArtifact::lower(program)?;
        let fingerprint = artifact.fingerprint(HOST_PLATFORM_NAME)?;
        Ok(HostExecutable {
            artifact: Arc::new(artifact),
            fingerprint,
        })
    }

    fn serialize_executable(&self, executable: &HostExecutable) -> BackendResult<Vec<u8>> {
        executable.artifact.to_bytes()
    }

    fn deserialize_executable(&self, bytes: &[u8]) -> BackendResult<HostExecutable> {
        let artifact = ProgramArtifact::from_bytes(bytes)?;
        let fingerprint = artifact
            .fingerprint(HOST_PLATFORM_NAME)
            .map_err(|err| BackendError::corrupt(err.to_string()))?;
        Ok(HostExecutable {
            artifact: Arc::new(artifact),
            fingerprint,
        })
    }

    fn fingerprint(&self, executable: &HostExecutable) -> Option<String> {
        Some(executable.fingerprint.clone())
    }

    fn execute(
        &self,
        executable: &HostExecutable,
        arguments: &[&HostBuffer],
        device: DeviceId,
    ) -> BackendResult<Vec<HostBuffer>> {
        let host_device = self.device(device)?;
        let function = executable.artifact.entry()?;
        let inputs = arguments.iter().map(|buffer| buffer.to_literal()).collect();
        let port = DevicePort {
            device: host_device,
            timeout: self.options.feed_timeout,
        };

        let _running = host_device
            .execution
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let results = interpreter::run_function(function, inputs, &port)?;

        results
            .iter()
            .map(|literal| {
                self.allocate(device, &literal.shape, &literal.bytes)
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
            .pop_matching(shape, self.options.outfeed_timeout)
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
    use crate::options::BuildOptions;
    use crate::program::{BinaryOp, Operand, Operation, ProgramBuilder};
    use crate::shape::DType;

    fn platform(devices: usize, limit: Option<usize>) -> HostPlatform {
        let mut options = HostOptions::from_config(&Default::default()).with_device_count(devices);
        options.memory_limit = limit;
        HostPlatform::new(options).unwrap()
    }

    fn compile_options() -> CompileOptions {
        CompileOptions {
            build: BuildOptions::default(),
            portable: false,
            device_assignment: vec![0],
            argument_layouts: Vec::new(),
        }
    }

    #[test]
    fn zero_devices_is_rejected() {
        let options = HostOptions::from_config(&Default::default()).with_device_count(0);
        assert!(matches!(
            HostPlatform::new(options),
            Err(BackendError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn copies_are_independent_allocations() {
        let host = platform(2, None);
        let shape = Shape::new(DType::U8, [3]);
        let original = host.buffer_from_host(&[1, 2, 3], &shape, 0).unwrap();
        let same_device = host.copy_to_device(&original, 0).unwrap();
        let other_device = host.copy_to_device(&original, 1).unwrap();
        assert_ne!(
            host.device_pointer(&original).unwrap(),
            host.device_pointer(&same_device).unwrap()
        );
        assert_eq!(other_device.device(), 1);
        assert_eq!(host.to_host(&other_device).unwrap(), vec![1, 2, 3]);
        assert_eq!(host.memory_stats(0).unwrap().bytes_in_use, 6);
        assert_eq!(host.memory_stats(1).unwrap().bytes_in_use, 3);
    }

    #[test]
    fn result_allocation_failure_is_an_execution_fault() {
        let host = platform(1, Some(8));
        let shape = Shape::new(DType::F32, [2]);
        let mut builder = ProgramBuilder::new();
        let x = builder.add_parameter(shape.clone());
        let y = builder.emit(
            Operation::Binary(BinaryOp::Add),
            vec![Operand::Value(x), Operand::Value(x)],
            shape.clone(),
        );
        let program = Program::from_entry(builder.finish("main", vec![y]).unwrap());
        let executable = host.compile(&program, &compile_options()).unwrap();
        let input = host
            .buffer_from_host(&[0u8; 8], &shape, 0)
            .unwrap();
        let err = host.execute(&executable, &[&input], 0).unwrap_err();
        assert!(matches!(err, BackendError::Execution { .. }), "{err}");
    }
}
