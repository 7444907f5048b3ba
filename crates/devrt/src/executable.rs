use std::fmt;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::backend::{BackendBuffer, BackendError, ExecutableHandle};
use crate::buffer::DeviceBuffer;
use crate::client::RuntimeClient;
use crate::error::{RuntimeError, RuntimeResult};
use crate::profiling;
use crate::shape::{DeviceId, Shape};

/// Leading bytes of every serialized executable.
pub const EXECUTABLE_MAGIC: &[u8; 8] = b"DEVRTEXE";
pub const EXECUTABLE_ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ExecutableEnvelope {
    envelope_version: u32,
    platform_name: String,
    platform_version: String,
    fingerprint: Option<String>,
    portable: bool,
    device_assignment: Vec<DeviceId>,
    payload: Vec<u8>,
}

/// A compiled program bound to the client that compiled it.
pub struct CompiledProgram {
    client: RuntimeClient,
    handle: ExecutableHandle,
    fingerprint: Option<String>,
    portable: bool,
    device_assignment: Vec<DeviceId>,
}

impl CompiledProgram {
    pub(crate) fn new(
        client: RuntimeClient,
        handle: ExecutableHandle,
        fingerprint: Option<String>,
        portable: bool,
        device_assignment: Vec<DeviceId>,
    ) -> Self {
        Self {
            client,
            handle,
            fingerprint,
            portable,
            device_assignment,
        }
    }

    pub fn client(&self) -> &RuntimeClient {
        &self.client
    }

    /// Stable identifier of the compiled program; survives serialization.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn is_portable(&self) -> bool {
        self.portable
    }

    /// Devices a non-portable program runs on, one per replica. Empty for
    /// portable programs.
    pub fn device_assignment(&self) -> &[DeviceId] {
        &self.device_assignment
    }

    pub fn parameter_shapes(&self) -> &[Shape] {
        self.handle.parameter_shapes()
    }

    pub fn result_shapes(&self) -> &[Shape] {
        self.handle.result_shapes()
    }

    /// Executes on `device` and returns one fresh buffer per result.
    ///
    /// All argument checks happen before the platform is involved, so a
    /// rejected call has no device-side effect.
    pub fn run(
        &self,
        arguments: &[&DeviceBuffer],
        device: DeviceId,
    ) -> RuntimeResult<Vec<DeviceBuffer>> {
        const OP: &str = "run";
        let _scope = profiling::scope("executable.run", Some(device), || {
            format!(
                "{} argument(s), fingerprint {}",
                arguments.len(),
                self.fingerprint().unwrap_or("none")
            )
        });
        let handles = self.check_run(OP, arguments, device)?;
        self.execute(OP, &handles, device)
    }

    /// Runs replica `i` with `per_replica_arguments[i]` on assignment device
    /// `i`. Replicas run concurrently; the first failure is returned.
    pub fn run_replicated(
        &self,
        per_replica_arguments: &[Vec<&DeviceBuffer>],
    ) -> RuntimeResult<Vec<Vec<DeviceBuffer>>> {
        const OP: &str = "run_replicated";
        let _scope = profiling::scope("executable.run_replicated", None, || {
            format!("{} replica(s)", per_replica_arguments.len())
        });
        if self.portable {
            return Err(RuntimeError::invalid_argument(
                OP,
                "portable programs have no device assignment; use run",
            ));
        }
        if per_replica_arguments.len() != self.device_assignment.len() {
            return Err(RuntimeError::invalid_argument(
                OP,
                format!(
                    "{} argument lists given for {} replica(s)",
                    per_replica_arguments.len(),
                    self.device_assignment.len()
                ),
            ));
        }

        let mut checked = Vec::with_capacity(per_replica_arguments.len());
        for (arguments, device) in per_replica_arguments.iter().zip(&self.device_assignment) {
            checked.push((self.check_run(OP, arguments, *device)?, *device));
        }

        thread::scope(|scope| {
            let workers: Vec<_> = checked
                .iter()
                .map(|(handles, device)| {
                    scope.spawn(move || self.execute(OP, handles, *device))
                })
                .collect();
            workers
                .into_iter()
                .zip(&self.device_assignment)
                .map(|(worker, device)| {
                    worker.join().unwrap_or_else(|_| {
                        Err(RuntimeError::Execution {
                            op: OP,
                            device: Some(*device),
                            detail: "replica worker panicked".to_string(),
                        })
                    })
                })
                .collect()
        })
    }

    /// Encodes the program with its metadata so
    /// [`RuntimeClient::deserialize_executable`] can rebuild it.
    pub fn serialize_executable(&self) -> RuntimeResult<Vec<u8>> {
        const OP: &str = "serialize_executable";
        let backend = self.client.backend();
        let payload = backend
            .serialize_executable(self.handle.as_ref())
            .map_err(|err| err.into_runtime(OP, None))?;
        let envelope = ExecutableEnvelope {
            envelope_version: EXECUTABLE_ENVELOPE_VERSION,
            platform_name: backend.platform_name().to_string(),
            platform_version: backend.platform_version(),
            fingerprint: self.fingerprint.clone(),
            portable: self.portable,
            device_assignment: self.device_assignment.clone(),
            payload,
        };
        let body = bincode::serialize(&envelope).map_err(|err| {
            RuntimeError::device(OP, None, format!("envelope encoding failed: {err}"))
        })?;
        let mut blob = Vec::with_capacity(EXECUTABLE_MAGIC.len() + body.len());
        blob.extend_from_slice(EXECUTABLE_MAGIC);
        blob.extend_from_slice(&body);
        Ok(blob)
    }

    fn check_run<'a>(
        &self,
        op: &'static str,
        arguments: &[&'a DeviceBuffer],
        device: DeviceId,
    ) -> RuntimeResult<Vec<&'a dyn BackendBuffer>> {
        self.client.check_device(op, device)?;
        if !self.portable && !self.device_assignment.contains(&device) {
            return Err(RuntimeError::device_mismatch(
                op,
                format!(
                    "device {device} is not in the program's assignment {:?}",
                    self.device_assignment
                ),
            ));
        }

        let mut handles = Vec::with_capacity(arguments.len());
        for (index, argument) in arguments.iter().enumerate() {
            if !argument.client().same_client(&self.client) {
                return Err(RuntimeError::invalid_argument(
                    op,
                    format!(
                        "argument {index} (buffer #{}) belongs to client {}, not client {}",
                        argument.id(),
                        argument.client().id(),
                        self.client.id()
                    ),
                ));
            }
            let handle = argument.live_handle(op)?;
            if argument.device() != device {
                return Err(RuntimeError::device_mismatch(
                    op,
                    format!(
                        "argument {index} (buffer #{}) lives on device {}, run targets device {device}",
                        argument.id(),
                        argument.device()
                    ),
                ));
            }
            handles.push(handle);
        }

        let expected = self.parameter_shapes();
        if handles.len() != expected.len() {
            return Err(RuntimeError::invalid_argument(
                op,
                format!(
                    "program takes {} argument(s), got {}",
                    expected.len(),
                    handles.len()
                ),
            ));
        }
        for (index, (handle, shape)) in handles.iter().zip(expected).enumerate() {
            if handle.shape() != shape {
                return Err(RuntimeError::invalid_argument(
                    op,
                    format!(
                        "argument {index} has shape {} but the program expects {shape}",
                        handle.shape()
                    ),
                ));
            }
        }
        Ok(handles)
    }

    fn execute(
        &self,
        op: &'static str,
        handles: &[&dyn BackendBuffer],
        device: DeviceId,
    ) -> RuntimeResult<Vec<DeviceBuffer>> {
        let outputs = self
            .client
            .backend()
            .execute(self.handle.as_ref(), handles, device)
            .map_err(|err| match err {
                BackendError::Execution { .. }
                | BackendError::Device { .. }
                | BackendError::OutOfMemory { .. }
                | BackendError::Timeout { .. }
                | BackendError::QueueClosed => RuntimeError::Execution {
                    op,
                    device: Some(device),
                    detail: err.to_string(),
                },
                other => other.into_runtime(op, Some(device)),
            })?;
        Ok(outputs
            .into_iter()
            .map(|handle| self.client.wrap_buffer(handle))
            .collect())
    }
}

impl fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("client", &self.client.id())
            .field("fingerprint", &self.fingerprint)
            .field("portable", &self.portable)
            .field("device_assignment", &self.device_assignment)
            .finish()
    }
}

/// Validates and decodes a serialized executable for `client`. Any mismatch
/// is `CorruptData`.
pub(crate) fn deserialize(client: &RuntimeClient, blob: &[u8]) -> RuntimeResult<CompiledProgram> {
    const OP: &str = "deserialize_executable";
    let body = blob
        .strip_prefix(EXECUTABLE_MAGIC.as_slice())
        .ok_or_else(|| RuntimeError::corrupt(OP, "missing executable header"))?;
    let envelope: ExecutableEnvelope = bincode::deserialize(body)
        .map_err(|err| RuntimeError::corrupt(OP, format!("envelope decoding failed: {err}")))?;

    if envelope.envelope_version != EXECUTABLE_ENVELOPE_VERSION {
        return Err(RuntimeError::corrupt(
            OP,
            format!(
                "envelope version {} does not match expected {EXECUTABLE_ENVELOPE_VERSION}",
                envelope.envelope_version
            ),
        ));
    }
    let backend = client.backend();
    if envelope.platform_name != backend.platform_name()
        || envelope.platform_version != backend.platform_version()
    {
        return Err(RuntimeError::corrupt(
            OP,
            format!(
                "executable was built for {} {}, client runs {} {}",
                envelope.platform_name,
                envelope.platform_version,
                backend.platform_name(),
                backend.platform_version()
            ),
        ));
    }
    if envelope.portable != envelope.device_assignment.is_empty() {
        return Err(RuntimeError::corrupt(
            OP,
            "device assignment disagrees with the portable flag",
        ));
    }
    if let Some(device) = envelope
        .device_assignment
        .iter()
        .find(|device| **device >= client.device_count())
    {
        return Err(RuntimeError::corrupt(
            OP,
            format!(
                "assignment names device {device} but the client has {}",
                client.device_count()
            ),
        ));
    }

    let handle = backend
        .deserialize_executable(&envelope.payload)
        .map_err(|err| match err {
            BackendError::Corrupt { message } => RuntimeError::corrupt(OP, message),
            other => RuntimeError::corrupt(OP, other.to_string()),
        })?;
    let fingerprint = match (backend.fingerprint(handle.as_ref()), envelope.fingerprint) {
        (Some(actual), Some(recorded)) if actual != recorded => {
            return Err(RuntimeError::corrupt(
                OP,
                format!("fingerprint {actual} does not match recorded {recorded}"),
            ));
        }
        (Some(actual), _) => Some(actual),
        (None, recorded) => recorded,
    };
    Ok(CompiledProgram::new(
        client.clone(),
        handle,
        fingerprint,
        envelope.portable,
        envelope.device_assignment,
    ))
}
