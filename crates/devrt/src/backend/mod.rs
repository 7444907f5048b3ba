//! Platform contract.
//!
//! A platform implements [`DeviceBackend`] with its own buffer and executable
//! types. The client layer only ever sees the type-erased [`ErasedBackend`],
//! so platforms can be selected at runtime through the registry.

mod error;
pub mod host;

use std::any::Any;
use std::sync::Arc;

use crate::options::CompileOptions;
use crate::program::{Literal, Program};
use crate::shape::{DeviceDescription, DeviceId, DeviceKind, MemoryStats, Shape};

pub use error::{BackendError, BackendResult};

/// Metadata every platform buffer exposes to the client layer.
pub trait BackendBuffer: Any + Send + Sync {
    fn device(&self) -> DeviceId;

    fn shape(&self) -> &Shape;

    /// Bytes the allocation occupies on the device.
    fn on_device_size(&self) -> usize;

    fn as_any(&self) -> &dyn Any;
}

/// Metadata every platform executable exposes to the client layer.
pub trait BackendExecutable: Any + Send + Sync {
    fn parameter_shapes(&self) -> &[Shape];

    fn result_shapes(&self) -> &[Shape];

    fn as_any(&self) -> &dyn Any;
}

/// Type-erased buffer owned by exactly one `DeviceBuffer`.
pub type BufferHandle = Box<dyn BackendBuffer>;

/// Type-erased executable, shared by concurrent runs.
pub type ExecutableHandle = Arc<dyn BackendExecutable>;

/// A device platform: memory, transfers, compilation and execution.
///
/// Every method blocks until the platform finishes or fails.
pub trait DeviceBackend: Send + Sync + 'static {
    type Buffer: BackendBuffer;
    type Executable: BackendExecutable;

    /// Returns a stable platform identifier (e.g. `"host"`, `"cuda"`).
    fn platform_name(&self) -> &str;

    fn platform_version(&self) -> String;

    fn kind(&self) -> DeviceKind;

    fn devices(&self) -> Vec<DeviceDescription>;

    fn device_count(&self) -> usize {
        self.devices().len()
    }

    fn memory_stats(&self, device: DeviceId) -> BackendResult<MemoryStats>;

    /// Allocates a buffer on `device` holding a copy of `bytes`. The caller
    /// guarantees `bytes.len()` matches `shape`.
    fn buffer_from_host(
        &self,
        bytes: &[u8],
        shape: &Shape,
        device: DeviceId,
    ) -> BackendResult<Self::Buffer>;

    fn copy_to_device(&self, buffer: &Self::Buffer, target: DeviceId)
        -> BackendResult<Self::Buffer>;

    fn to_host(&self, buffer: &Self::Buffer) -> BackendResult<Vec<u8>>;

    /// Raw device address of the buffer, stable for the buffer's lifetime.
    fn device_pointer(&self, _buffer: &Self::Buffer) -> BackendResult<usize> {
        Err(BackendError::unimplemented(
            "device_pointer",
            format!(
                "platform {} does not expose device pointers",
                self.platform_name()
            ),
        ))
    }

    fn compile(&self, program: &Program, options: &CompileOptions)
        -> BackendResult<Self::Executable>;

    fn serialize_executable(&self, executable: &Self::Executable) -> BackendResult<Vec<u8>>;

    fn deserialize_executable(&self, bytes: &[u8]) -> BackendResult<Self::Executable>;

    /// Stable identifier of the compiled program, if the platform has one.
    fn fingerprint(&self, _executable: &Self::Executable) -> Option<String> {
        None
    }

    fn execute(
        &self,
        executable: &Self::Executable,
        arguments: &[&Self::Buffer],
        device: DeviceId,
    ) -> BackendResult<Vec<Self::Buffer>>;

    fn transfer_to_infeed(&self, device: DeviceId, value: Literal) -> BackendResult<()>;

    /// Pops the next outfeed value of `shape`, waiting up to the platform's
    /// outfeed deadline.
    fn transfer_from_outfeed(&self, device: DeviceId, shape: &Shape) -> BackendResult<Literal>;

    /// Closes both feed queues of `device`. Later transfers fail with
    /// `QueueClosed`; queued values can still be drained.
    fn close_feeds(&self, device: DeviceId) -> BackendResult<()>;
}

/// Object-safe view of a [`DeviceBackend`], working on erased handles.
pub trait ErasedBackend: Send + Sync {
    fn platform_name(&self) -> &str;

    fn platform_version(&self) -> String;

    fn kind(&self) -> DeviceKind;

    fn devices(&self) -> Vec<DeviceDescription>;

    fn device_count(&self) -> usize;

    fn memory_stats(&self, device: DeviceId) -> BackendResult<MemoryStats>;

    fn buffer_from_host(
        &self,
        bytes: &[u8],
        shape: &Shape,
        device: DeviceId,
    ) -> BackendResult<BufferHandle>;

    fn copy_to_device(
        &self,
        buffer: &dyn BackendBuffer,
        target: DeviceId,
    ) -> BackendResult<BufferHandle>;

    fn to_host(&self, buffer: &dyn BackendBuffer) -> BackendResult<Vec<u8>>;

    fn device_pointer(&self, buffer: &dyn BackendBuffer) -> BackendResult<usize>;

    fn compile(&self, program: &Program, options: &CompileOptions)
        -> BackendResult<ExecutableHandle>;

    fn serialize_executable(&self, executable: &dyn BackendExecutable) -> BackendResult<Vec<u8>>;

    fn deserialize_executable(&self, bytes: &[u8]) -> BackendResult<ExecutableHandle>;

    fn fingerprint(&self, executable: &dyn BackendExecutable) -> Option<String>;

    fn execute(
        &self,
        executable: &dyn BackendExecutable,
        arguments: &[&dyn BackendBuffer],
        device: DeviceId,
    ) -> BackendResult<Vec<BufferHandle>>;

    fn transfer_to_infeed(&self, device: DeviceId, value: Literal) -> BackendResult<()>;

    fn transfer_from_outfeed(&self, device: DeviceId, shape: &Shape) -> BackendResult<Literal>;

    fn close_feeds(&self, device: DeviceId) -> BackendResult<()>;
}

/// Wrapper that implements [`ErasedBackend`] for any concrete [`DeviceBackend`].
pub struct BackendWrapper<B: DeviceBackend> {
    inner: Arc<B>,
}

impl<B: DeviceBackend> BackendWrapper<B> {
    pub fn new(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    fn typed_buffer<'a>(&self, buffer: &'a dyn BackendBuffer) -> BackendResult<&'a B::Buffer> {
        buffer.as_any().downcast_ref::<B::Buffer>().ok_or_else(|| {
            BackendError::device(format!(
                "buffer handle type mismatch for platform {}",
                self.inner.platform_name()
            ))
        })
    }

    fn typed_executable<'a>(
        &self,
        executable: &'a dyn BackendExecutable,
    ) -> BackendResult<&'a B::Executable> {
        executable
            .as_any()
            .downcast_ref::<B::Executable>()
            .ok_or_else(|| {
                BackendError::device(format!(
                    "executable handle type mismatch for platform {}",
                    self.inner.platform_name()
                ))
            })
    }
}

/// Boxes a concrete backend as a trait object.
pub fn erase<B: DeviceBackend>(backend: B) -> Box<dyn ErasedBackend> {
    Box::new(BackendWrapper::new(backend))
}

impl<B: DeviceBackend> ErasedBackend for BackendWrapper<B> {
    fn platform_name(&self) -> &str {
        self.inner.platform_name()
    }

    fn platform_version(&self) -> String {
        self.inner.platform_version()
    }

    fn kind(&self) -> DeviceKind {
        self.inner.kind()
    }

    fn devices(&self) -> Vec<DeviceDescription> {
        self.inner.devices()
    }

    fn device_count(&self) -> usize {
        self.inner.device_count()
    }

    fn memory_stats(&self, device: DeviceId) -> BackendResult<MemoryStats> {
        self.inner.memory_stats(device)
    }

    fn buffer_from_host(
        &self,
        bytes: &[u8],
        shape: &Shape,
        device: DeviceId,
    ) -> BackendResult<BufferHandle> {
        let buffer = self.inner.buffer_from_host(bytes, shape, device)?;
        Ok(Box::new(buffer) as BufferHandle)
    }

    fn copy_to_device(
        &self,
        buffer: &dyn BackendBuffer,
        target: DeviceId,
    ) -> BackendResult<BufferHandle> {
        let typed = self.typed_buffer(buffer)?;
        let copy = self.inner.copy_to_device(typed, target)?;
        Ok(Box::new(copy) as BufferHandle)
    }

    fn to_host(&self, buffer: &dyn BackendBuffer) -> BackendResult<Vec<u8>> {
        self.inner.to_host(self.typed_buffer(buffer)?)
    }

    fn device_pointer(&self, buffer: &dyn BackendBuffer) -> BackendResult<usize> {
        self.inner.device_pointer(self.typed_buffer(buffer)?)
    }

    fn compile(
        &self,
        program: &Program,
        options: &CompileOptions,
    ) -> BackendResult<ExecutableHandle> {
        let executable = self.inner.compile(program, options)?;
        Ok(Arc::new(executable) as ExecutableHandle)
    }

    fn serialize_executable(&self, executable: &dyn BackendExecutable) -> BackendResult<Vec<u8>> {
        self.inner
            .serialize_executable(self.typed_executable(executable)?)
    }

    fn deserialize_executable(&self, bytes: &[u8]) -> BackendResult<ExecutableHandle> {
        let executable = self.inner.deserialize_executable(bytes)?;
        Ok(Arc::new(executable) as ExecutableHandle)
    }

    fn fingerprint(&self, executable: &dyn BackendExecutable) -> Option<String> {
        let typed = self.typed_executable(executable).ok()?;
        self.inner.fingerprint(typed)
    }

    fn execute(
        &self,
        executable: &dyn BackendExecutable,
        arguments: &[&dyn BackendBuffer],
        device: DeviceId,
    ) -> BackendResult<Vec<BufferHandle>> {
        let typed_executable = self.typed_executable(executable)?;
        let mut typed_arguments = Vec::with_capacity(arguments.len());
        for buffer in arguments {
            typed_arguments.push(self.typed_buffer(*buffer)?);
        }

        let outputs = self
            .inner
            .execute(typed_executable, &typed_arguments, device)?;

        Ok(outputs
            .into_iter()
            .map(|buffer| Box::new(buffer) as BufferHandle)
            .collect())
    }

    fn transfer_to_infeed(&self, device: DeviceId, value: Literal) -> BackendResult<()> {
        self.inner.transfer_to_infeed(device, value)
    }

    fn transfer_from_outfeed(&self, device: DeviceId, shape: &Shape) -> BackendResult<Literal> {
        self.inner.transfer_from_outfeed(device, shape)
    }

    fn close_feeds(&self, device: DeviceId) -> BackendResult<()> {
        self.inner.close_feeds(device)
    }
}
