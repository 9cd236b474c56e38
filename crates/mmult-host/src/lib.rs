//! Host-side pipeline for a matrix-multiply accelerator.
//!
//! This crate provides:
//! - [`resolver`]: platform and accelerator device selection by exact name
//! - [`loader`]: loading the pre-built device binary image
//! - [`context`]: context, queue, program and kernel with ordered teardown
//! - [`buffers`]: bank-placed device buffers and host/device transfers
//! - [`dispatch`]: kernel argument binding and single-invocation launch
//! - [`verify`]: element-wise comparison against the host reference
//! - [`pipeline`]: the linear driver tying the stages together
//! - [`runtime`]: the accelerator runtime seam, with an OpenCL backend
//!   (feature `opencl-runtime`) and a simulated one

pub mod buffers;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod loader;
pub mod matrix;
pub mod pipeline;
pub mod resolver;
pub mod runtime;
pub mod verify;

// Re-export primary public types.
pub use buffers::{BankPlacement, DeviceBufferSet, MemoryBank, Operand};
pub use config::{ConfigError, HostConfig, LogFormat};
pub use context::{ContextOptions, ExecutionContext};
pub use dispatch::{dispatch, Dimensions};
pub use error::{HostError, Result, Stage};
pub use loader::{load_binary_image, BinaryImage};
pub use matrix::{reference_multiply, Matrix};
pub use pipeline::{default_operands, run_default, run_pipeline, PipelineOutcome};
pub use resolver::{resolve_device, ResolvedDevice};
pub use runtime::{ComputeRuntime, RuntimeStatus};
pub use verify::{verify, Mismatch, VerificationReport};
