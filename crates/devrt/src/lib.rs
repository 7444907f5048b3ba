//! Host-side device runtime: acquire a client for a platform, move bytes
//! into typed device buffers and back, compile programs ahead of time, and
//! dispatch them to devices, including infeed/outfeed streaming.

pub use linkme;

pub mod acquire;
pub mod backend;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod executable;
pub mod feed;
pub mod hashing;
pub mod options;
pub mod profiling;
pub mod program;
pub mod registry;
pub mod shape;

pub use acquire::{
    get_client, gpu_client, host_client, host_client_with, plugin_client, tpu_client, ClientSpec,
};
pub use buffer::DeviceBuffer;
pub use client::RuntimeClient;
pub use config::RuntimeConfig;
pub use error::{ErrorKind, RuntimeError, RuntimeResult};
pub use executable::CompiledProgram;
pub use options::{AllocatorKind, BuildOptions, GpuOptions, HostOptions};
pub use profiling::ProfilingSession;
pub use program::{Literal, Program, ProgramBuilder};
pub use shape::{DType, DeviceId, DeviceKind, Shape};
