use std::fmt;

use crate::backend::{BackendBuffer, BufferHandle};
use crate::client::RuntimeClient;
use crate::error::{RuntimeError, RuntimeResult};
use crate::profiling;
use crate::program::Literal;
use crate::shape::{DeviceId, Shape};

/// One array value resident on one device.
///
/// The buffer keeps its client alive. Its device never changes; copies are
/// new buffers. After [`DeviceBuffer::deallocate`] every operation that
/// touches the value fails with `UseAfterFree`.
pub struct DeviceBuffer {
    client: RuntimeClient,
    id: u64,
    device: DeviceId,
    handle: Option<BufferHandle>,
}

impl DeviceBuffer {
    pub(crate) fn new(client: RuntimeClient, id: u64, handle: BufferHandle) -> Self {
        let device = handle.device();
        Self {
            client,
            id,
            device,
            handle: Some(handle),
        }
    }

    /// Client-unique buffer id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }

    pub fn is_deleted(&self) -> bool {
        self.handle.is_none()
    }

    pub(crate) fn live_handle(&self, op: &'static str) -> RuntimeResult<&dyn BackendBuffer> {
        self.handle
            .as_deref()
            .ok_or(RuntimeError::UseAfterFree { op, buffer: self.id })
    }

    pub fn shape(&self) -> RuntimeResult<&Shape> {
        Ok(self.live_handle("shape")?.shape())
    }

    pub fn on_device_size_in_bytes(&self) -> RuntimeResult<usize> {
        let handle = self.live_handle("on_device_size_in_bytes")?;
        Ok(handle.on_device_size())
    }

    /// Copies the value to `target`, which may be the buffer's own device.
    pub fn copy_to_device(&self, target: DeviceId) -> RuntimeResult<DeviceBuffer> {
        const OP: &str = "copy_to_device";
        let handle = self.live_handle(OP)?;
        let _scope = profiling::scope("buffer.copy_to_device", Some(target), || {
            format!("{} from device {}", handle.shape(), self.device)
        });
        self.client.check_device(OP, target)?;
        let copy = self
            .client
            .backend()
            .copy_to_device(handle, target)
            .map_err(|err| err.into_runtime(OP, Some(target)))?;
        Ok(self.client.wrap_buffer(copy))
    }

    /// Reads the value back. `expected_size` must equal the on-device size.
    pub fn to_host_bytes(&self, expected_size: usize) -> RuntimeResult<Vec<u8>> {
        const OP: &str = "to_host_bytes";
        let handle = self.live_handle(OP)?;
        let _scope = profiling::scope("buffer.to_host_bytes", Some(self.device), || {
            handle.shape().to_string()
        });
        let actual = handle.on_device_size();
        if expected_size != actual {
            return Err(RuntimeError::invalid_argument(
                OP,
                format!(
                    "expected {expected_size} bytes but buffer #{} of shape {} holds {actual}",
                    self.id,
                    handle.shape()
                ),
            ));
        }
        self.client
            .backend()
            .to_host(handle)
            .map_err(|err| err.into_runtime(OP, Some(self.device)))
    }

    pub fn to_literal(&self) -> RuntimeResult<Literal> {
        let shape = self.shape()?.clone();
        let bytes = self.to_host_bytes(self.on_device_size_in_bytes()?)?;
        Ok(Literal::new(shape, bytes))
    }

    /// Releases the device memory now. A second call fails with
    /// `UseAfterFree`, as do shape, size, transfer, copy, pointer and run
    /// calls. `id`, `device`, `client` and `is_deleted` describe the handle
    /// rather than the value and keep answering.
    pub fn deallocate(&mut self) -> RuntimeResult<()> {
        match self.handle.take() {
            Some(handle) => {
                log::debug!(
                    "buffer #{} ({}) on device {} deallocated",
                    self.id,
                    handle.shape(),
                    self.device
                );
                Ok(())
            }
            None => Err(RuntimeError::UseAfterFree {
                op: "deallocate",
                buffer: self.id,
            }),
        }
    }

    /// Raw device address, stable for the lifetime of the buffer.
    pub fn device_pointer(&self) -> RuntimeResult<usize> {
        const OP: &str = "device_pointer";
        let handle = self.live_handle(OP)?;
        self.client
            .backend()
            .device_pointer(handle)
            .map_err(|err| err.into_runtime(OP, Some(self.device)))
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DeviceBuffer");
        debug
            .field("id", &self.id)
            .field("device", &self.device)
            .field("client", &self.client.id());
        match &self.handle {
            Some(handle) => debug.field("shape", handle.shape()),
            None => debug.field("deleted", &true),
        };
        debug.finish()
    }
}
