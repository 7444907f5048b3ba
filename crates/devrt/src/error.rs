//! Errors surfaced to callers of the runtime.
//!
//! Every variant names the operation that failed and carries the device,
//! shape, or size that caused it, so a failure can be diagnosed without
//! knowing backend internals.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::shape::DeviceId;

/// Coarse classification of a [`RuntimeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    DeviceMismatch,
    DeviceError,
    CompilationError,
    ExecutionError,
    CorruptData,
    Timeout,
    UseAfterFree,
    NotSupported,
    NotFound,
    Io,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{op}: invalid argument: {detail}")]
    InvalidArgument { op: &'static str, detail: String },

    #[error("{op}: device mismatch: {detail}")]
    DeviceMismatch { op: &'static str, detail: String },

    #[error("{op}: device error{}: {detail}", device_suffix(.device))]
    DeviceError {
        op: &'static str,
        device: Option<DeviceId>,
        detail: String,
    },

    #[error("{op}: compilation failed: {detail}")]
    Compilation { op: &'static str, detail: String },

    #[error("{op}: execution failed{}: {detail}", device_suffix(.device))]
    Execution {
        op: &'static str,
        device: Option<DeviceId>,
        detail: String,
    },

    #[error("{op}: corrupt data: {detail}")]
    CorruptData { op: &'static str, detail: String },

    #[error("{op}: timed out after {} ms{}", .waited.as_millis(), device_suffix(.device))]
    Timeout {
        op: &'static str,
        device: Option<DeviceId>,
        waited: Duration,
    },

    #[error("{op}: buffer #{buffer} was used after it was deallocated")]
    UseAfterFree { op: &'static str, buffer: u64 },

    #[error("{op}: not supported: {detail}")]
    NotSupported { op: &'static str, detail: String },

    #[error("{op}: not found: {detail}")]
    NotFound { op: &'static str, detail: String },

    #[error("{op}: i/o error at {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn device_suffix(device: &Option<DeviceId>) -> String {
    match device {
        Some(id) => format!(" on device {id}"),
        None => String::new(),
    }
}

impl RuntimeError {
    pub fn invalid_argument(op: &'static str, detail: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument {
            op,
            detail: detail.into(),
        }
    }

    pub fn device_mismatch(op: &'static str, detail: impl Into<String>) -> Self {
        RuntimeError::DeviceMismatch {
            op,
            detail: detail.into(),
        }
    }

    pub fn device(op: &'static str, device: Option<DeviceId>, detail: impl Into<String>) -> Self {
        RuntimeError::DeviceError {
            op,
            device,
            detail: detail.into(),
        }
    }

    pub fn compilation(op: &'static str, detail: impl Into<String>) -> Self {
        RuntimeError::Compilation {
            op,
            detail: detail.into(),
        }
    }

    pub fn corrupt(op: &'static str, detail: impl Into<String>) -> Self {
        RuntimeError::CorruptData {
            op,
            detail: detail.into(),
        }
    }

    pub fn not_found(op: &'static str, detail: impl Into<String>) -> Self {
        RuntimeError::NotFound {
            op,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            RuntimeError::DeviceMismatch { .. } => ErrorKind::DeviceMismatch,
            RuntimeError::DeviceError { .. } => ErrorKind::DeviceError,
            RuntimeError::Compilation { .. } => ErrorKind::CompilationError,
            RuntimeError::Execution { .. } => ErrorKind::ExecutionError,
            RuntimeError::CorruptData { .. } => ErrorKind::CorruptData,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::UseAfterFree { .. } => ErrorKind::UseAfterFree,
            RuntimeError::NotSupported { .. } => ErrorKind::NotSupported,
            RuntimeError::NotFound { .. } => ErrorKind::NotFound,
            RuntimeError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Name of the operation that produced this error.
    pub fn operation(&self) -> &'static str {
        match self {
            RuntimeError::InvalidArgument { op, .. }
            | RuntimeError::DeviceMismatch { op, .. }
            | RuntimeError::DeviceError { op, .. }
            | RuntimeError::Compilation { op, .. }
            | RuntimeError::Execution { op, .. }
            | RuntimeError::CorruptData { op, .. }
            | RuntimeError::Timeout { op, .. }
            | RuntimeError::UseAfterFree { op, .. }
            | RuntimeError::NotSupported { op, .. }
            | RuntimeError::NotFound { op, .. }
            | RuntimeError::Io { op, .. } => op,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
