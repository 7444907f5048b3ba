use std::fmt;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::shape::{DeviceId, Shape};

/// Failure reported by a platform implementation.
///
/// The client layer converts these into [`RuntimeError`]s, attaching the
/// operation name and device.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    OutOfMemory { requested: usize, available: usize },
    Device { message: String },
    Compilation { message: String },
    Execution { message: String },
    Unimplemented { op: &'static str, reason: String },
    Timeout { waited: Duration },
    QueueClosed,
    QueueFull { capacity: usize },
    ShapeMismatch { expected: Shape, found: Shape },
    Corrupt { message: String },
    /// The platform cannot be brought up in this process (missing driver,
    /// no devices).
    Unavailable { message: String },
    InvalidArgument { message: String },
}

impl BackendError {
    pub fn device(message: impl Into<String>) -> Self {
        BackendError::Device {
            message: message.into(),
        }
    }

    pub fn compilation(message: impl Into<String>) -> Self {
        BackendError::Compilation {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        BackendError::Corrupt {
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        BackendError::Unavailable {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BackendError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Maps the failure onto the caller-facing error taxonomy.
    pub fn into_runtime(self, op: &'static str, device: Option<DeviceId>) -> RuntimeError {
        match self {
            BackendError::OutOfMemory { .. }
            | BackendError::Device { .. }
            | BackendError::QueueClosed
            | BackendError::QueueFull { .. } => RuntimeError::DeviceError {
                op,
                device,
                detail: self.to_string(),
            },
            BackendError::Compilation { message } => RuntimeError::Compilation {
                op,
                detail: message,
            },
            BackendError::Execution { message } => RuntimeError::Execution {
                op,
                device,
                detail: message,
            },
            BackendError::Unimplemented { .. } => RuntimeError::NotSupported {
                op,
                detail: self.to_string(),
            },
            BackendError::Timeout { waited } => RuntimeError::Timeout { op, device, waited },
            BackendError::ShapeMismatch { .. } => RuntimeError::InvalidArgument {
                op,
                detail: self.to_string(),
            },
            BackendError::InvalidArgument { message } => RuntimeError::InvalidArgument {
                op,
                detail: message,
            },
            BackendError::Corrupt { message } => RuntimeError::CorruptData {
                op,
                detail: message,
            },
            BackendError::Unavailable { message } => RuntimeError::NotFound {
                op,
                detail: message,
            },
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {requested} bytes, {available} bytes available"
            ),
            BackendError::Device { message } => write!(f, "device failure: {message}"),
            BackendError::Compilation { message } => write!(f, "compilation failure: {message}"),
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Timeout { waited } => {
                write!(f, "timed out after {} ms", waited.as_millis())
            }
            BackendError::QueueClosed => f.write_str("feed queue is closed"),
            BackendError::QueueFull { capacity } => {
                write!(f, "feed queue is full ({capacity} entries)")
            }
            BackendError::ShapeMismatch { expected, found } => {
                write!(f, "shape mismatch: expected {expected}, found {found}")
            }
            BackendError::Corrupt { message } => write!(f, "corrupt payload: {message}"),
            BackendError::Unavailable { message } => write!(f, "platform unavailable: {message}"),
            BackendError::InvalidArgument { message } => write!(f, "invalid argument: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::shape::DType;

    #[test]
    fn maps_onto_runtime_kinds() {
        let cases = [
            (
                BackendError::OutOfMemory {
                    requested: 64,
                    available: 16,
                },
                ErrorKind::DeviceError,
            ),
            (BackendError::QueueFull { capacity: 2 }, ErrorKind::DeviceError),
            (BackendError::compilation("bad op"), ErrorKind::CompilationError),
            (BackendError::execution("fault"), ErrorKind::ExecutionError),
            (
                BackendError::unimplemented("device_pointer", "host only"),
                ErrorKind::NotSupported,
            ),
            (
                BackendError::Timeout {
                    waited: Duration::from_millis(5),
                },
                ErrorKind::Timeout,
            ),
            (
                BackendError::ShapeMismatch {
                    expected: Shape::new(DType::F32, [2]),
                    found: Shape::new(DType::F32, [3]),
                },
                ErrorKind::InvalidArgument,
            ),
            (BackendError::corrupt("truncated"), ErrorKind::CorruptData),
            (BackendError::unavailable("no driver"), ErrorKind::NotFound),
        ];
        for (err, kind) in cases {
            let mapped = err.clone().into_runtime("op", Some(0));
            assert_eq!(mapped.kind(), kind, "{err}");
        }
    }

    #[test]
    fn device_errors_keep_backend_diagnostic() {
        let err = BackendError::OutOfMemory {
            requested: 64,
            available: 16,
        }
        .into_runtime("buffer_from_host_bytes", Some(1));
        assert_eq!(
            err.to_string(),
            "buffer_from_host_bytes: device error on device 1: out of memory: requested 64 bytes, 16 bytes available"
        );
    }
}
