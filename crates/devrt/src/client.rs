use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::{BackendError, BufferHandle, ErasedBackend};
use crate::buffer::DeviceBuffer;
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::executable::{self, CompiledProgram};
use crate::options::{BuildOptions, CompileOptions};
use crate::profiling;
use crate::program::{verify, Literal, Program};
use crate::shape::{DeviceDescription, DeviceId, DeviceKind, MemoryStats, Shape};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

struct ClientInner {
    id: u64,
    backend: Box<dyn ErasedBackend>,
    next_buffer_id: AtomicU64,
    dump_programs: bool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        log::debug!(
            "client {} ({}) torn down",
            self.id,
            self.backend.platform_name()
        );
    }
}

/// Connection to one device platform.
///
/// Cloning is cheap and shares the platform. Buffers and compiled programs
/// keep a clone, so the platform stays up until the last of them is dropped.
#[derive(Clone)]
pub struct RuntimeClient {
    inner: Arc<ClientInner>,
}

impl RuntimeClient {
    /// Wraps an already constructed platform.
    pub fn from_backend(backend: Box<dyn ErasedBackend>) -> Self {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "client {id}: platform {} {} with {} device(s)",
            backend.platform_name(),
            backend.platform_version(),
            backend.device_count()
        );
        Self {
            inner: Arc::new(ClientInner {
                id,
                backend,
                next_buffer_id: AtomicU64::new(1),
                dump_programs: RuntimeConfig::global().dump_programs,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn platform_name(&self) -> &str {
        self.inner.backend.platform_name()
    }

    pub fn platform_version(&self) -> String {
        self.inner.backend.platform_version()
    }

    pub fn kind(&self) -> DeviceKind {
        self.inner.backend.kind()
    }

    pub fn devices(&self) -> Vec<DeviceDescription> {
        self.inner.backend.devices()
    }

    pub fn device_count(&self) -> usize {
        self.inner.backend.device_count()
    }

    pub fn memory_stats(&self, device: DeviceId) -> RuntimeResult<MemoryStats> {
        const OP: &str = "memory_stats";
        self.check_device(OP, device)?;
        self.inner
            .backend
            .memory_stats(device)
            .map_err(|err| err.into_runtime(OP, Some(device)))
    }

    /// Compiles `program` for this platform.
    ///
    /// `argument_layouts` must list one shape per entry parameter, equal to
    /// the declared parameter shape. Non-portable programs are bound to the
    /// devices derived from `build_options`; portable ones may run on any
    /// device of this client.
    pub fn compile(
        &self,
        program: &Program,
        argument_layouts: &[Shape],
        build_options: &BuildOptions,
        portable: bool,
    ) -> RuntimeResult<CompiledProgram> {
        const OP: &str = "compile";
        let _scope = profiling::scope("client.compile", None, || program.entry.clone());

        verify(program).map_err(|err| RuntimeError::compilation(OP, err.to_string()))?;
        let entry = program.entry_function().ok_or_else(|| {
            RuntimeError::compilation(OP, format!("entry function '{}' not found", program.entry))
        })?;

        if argument_layouts.len() != entry.parameters.len() {
            return Err(RuntimeError::compilation(
                OP,
                format!(
                    "{} argument layouts given for {} parameters of @{}",
                    argument_layouts.len(),
                    entry.parameters.len(),
                    entry.name
                ),
            ));
        }
        for (index, (layout, declared)) in
            argument_layouts.iter().zip(&entry.parameters).enumerate()
        {
            if layout != declared {
                return Err(RuntimeError::compilation(
                    OP,
                    format!("argument {index} layout {layout} does not match parameter {declared}"),
                ));
            }
        }

        let device_assignment = if portable {
            Vec::new()
        } else {
            build_options
                .device_assignment(self.device_count())
                .map_err(|detail| RuntimeError::compilation(OP, detail))?
        };

        if self.inner.dump_programs {
            log::debug!("compiling for {}:\n{program}", self.platform_name());
        }

        let options = CompileOptions {
            build: build_options.clone(),
            portable,
            device_assignment,
            argument_layouts: argument_layouts.to_vec(),
        };
        let handle = self
            .inner
            .backend
            .compile(program, &options)
            .map_err(|err| match err {
                BackendError::Unimplemented { .. } => {
                    RuntimeError::compilation(OP, err.to_string())
                }
                other => other.into_runtime(OP, None),
            })?;
        let fingerprint = self.inner.backend.fingerprint(handle.as_ref());
        log::debug!(
            "compiled @{} (fingerprint {}, portable {portable}, assignment {:?})",
            program.entry,
            fingerprint.as_deref().unwrap_or("none"),
            options.device_assignment
        );
        Ok(CompiledProgram::new(
            self.clone(),
            handle,
            fingerprint,
            portable,
            options.device_assignment,
        ))
    }

    /// Copies `bytes` into a new buffer of `shape` on `device`.
    pub fn buffer_from_host_bytes(
        &self,
        bytes: &[u8],
        shape: &Shape,
        device: DeviceId,
    ) -> RuntimeResult<DeviceBuffer> {
        const OP: &str = "buffer_from_host_bytes";
        let _scope = profiling::scope("client.buffer_from_host_bytes", Some(device), || {
            shape.to_string()
        });
        let expected = shape
            .checked_byte_size()
            .ok_or_else(|| RuntimeError::invalid_argument(OP, format!("shape {shape} overflows")))?;
        if bytes.len() != expected {
            return Err(RuntimeError::invalid_argument(
                OP,
                format!(
                    "{} bytes given for shape {shape} which needs {expected}",
                    bytes.len()
                ),
            ));
        }
        self.check_device(OP, device)?;
        let handle = self
            .inner
            .backend
            .buffer_from_host(bytes, shape, device)
            .map_err(|err| err.into_runtime(OP, Some(device)))?;
        Ok(self.wrap_buffer(handle))
    }

    pub fn buffer_from_literal(
        &self,
        literal: &Literal,
        device: DeviceId,
    ) -> RuntimeResult<DeviceBuffer> {
        self.buffer_from_host_bytes(&literal.bytes, &literal.shape, device)
    }

    /// Rebuilds a program from bytes produced by
    /// [`CompiledProgram::serialize_executable`].
    pub fn deserialize_executable(&self, blob: &[u8]) -> RuntimeResult<CompiledProgram> {
        let _scope = profiling::scope("client.deserialize_executable", None, || {
            format!("{} bytes", blob.len())
        });
        executable::deserialize(self, blob)
    }

    /// Queues one value per `(bytes, shape)` pair on `device`'s infeed, in
    /// order.
    ///
    /// The batch is validated before anything is queued. If the platform
    /// fails partway, values already queued stay queued.
    pub fn transfer_to_infeed(
        &self,
        buffers: &[&[u8]],
        shapes: &[Shape],
        device: DeviceId,
    ) -> RuntimeResult<()> {
        const OP: &str = "transfer_to_infeed";
        let _scope = profiling::scope("client.transfer_to_infeed", Some(device), || {
            format!("{} value(s)", buffers.len())
        });
        self.check_device(OP, device)?;
        if buffers.len() != shapes.len() {
            return Err(RuntimeError::invalid_argument(
                OP,
                format!(
                    "{} buffers given with {} shapes",
                    buffers.len(),
                    shapes.len()
                ),
            ));
        }
        for (index, (bytes, shape)) in buffers.iter().zip(shapes).enumerate() {
            if shape.checked_byte_size() != Some(bytes.len()) {
                return Err(RuntimeError::invalid_argument(
                    OP,
                    format!(
                        "value {index}: {} bytes do not match shape {shape}",
                        bytes.len()
                    ),
                ));
            }
        }
        for (index, (bytes, shape)) in buffers.iter().zip(shapes).enumerate() {
            self.inner
                .backend
                .transfer_to_infeed(device, Literal::new(shape.clone(), bytes.to_vec()))
                .map_err(|err| {
                    log::debug!("infeed batch on device {device} stopped at value {index}: {err}");
                    err.into_runtime(OP, Some(device))
                })?;
        }
        Ok(())
    }

    /// Pops the next value of `shape` from `device`'s outfeed, blocking up to
    /// the platform's outfeed deadline.
    pub fn transfer_from_outfeed(&self, shape: &Shape, device: DeviceId) -> RuntimeResult<Vec<u8>> {
        const OP: &str = "transfer_from_outfeed";
        let _scope = profiling::scope("client.transfer_from_outfeed", Some(device), || {
            shape.to_string()
        });
        if shape.checked_byte_size().is_none() {
            return Err(RuntimeError::invalid_argument(
                OP,
                format!("shape {shape} overflows"),
            ));
        }
        self.check_device(OP, device)?;
        let literal = self
            .inner
            .backend
            .transfer_from_outfeed(device, shape)
            .map_err(|err| err.into_runtime(OP, Some(device)))?;
        Ok(literal.bytes.to_vec())
    }

    /// Shuts down `device`'s infeed and outfeed. Further transfers fail with
    /// `DeviceError`, and a program blocked on a feed is woken with an
    /// error. Values already in the outfeed can still be read.
    pub fn close_feeds(&self, device: DeviceId) -> RuntimeResult<()> {
        const OP: &str = "close_feeds";
        self.check_device(OP, device)?;
        log::debug!("closing feeds of device {device}");
        self.inner
            .backend
            .close_feeds(device)
            .map_err(|err| err.into_runtime(OP, Some(device)))
    }

    pub(crate) fn backend(&self) -> &dyn ErasedBackend {
        self.inner.backend.as_ref()
    }

    pub(crate) fn same_client(&self, other: &RuntimeClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn check_device(&self, op: &'static str, device: DeviceId) -> RuntimeResult<()> {
        let count = self.device_count();
        if device < count {
            Ok(())
        } else {
            Err(RuntimeError::device(
                op,
                Some(device),
                format!("device out of range; client has {count} device(s)"),
            ))
        }
    }

    pub(crate) fn wrap_buffer(&self, handle: BufferHandle) -> DeviceBuffer {
        let id = self.inner.next_buffer_id.fetch_add(1, Ordering::Relaxed);
        DeviceBuffer::new(self.clone(), id, handle)
    }
}

impl fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("id", &self.inner.id)
            .field("platform", &self.platform_name())
            .field("devices", &self.device_count())
            .finish()
    }
}
