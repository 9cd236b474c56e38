//! Error types for the accelerator pipeline.

use std::path::PathBuf;

use thiserror::Error;

use crate::buffers::{MemoryBank, Operand};
use crate::config::ConfigError;
use crate::runtime::{ResourceKind, RuntimeStatus};
use crate::verify::Mismatch;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HostError>;

/// Every way a pipeline run can fail. All variants are terminal for the run.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("platform with vendor '{vendor}' not found")]
    PlatformNotFound { vendor: String },

    #[error("target device '{device}' not found under platform '{vendor}'")]
    DeviceNotFound { vendor: String, device: String },

    #[error("runtime query '{query}' failed: {status}")]
    RuntimeQuery { query: &'static str, status: RuntimeStatus },

    #[error("failed to open device binary '{}'", .path.display())]
    FileOpenError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "short read on device binary '{}': expected {expected} bytes, read {actual}",
        .path.display()
    )]
    FileReadError { path: PathBuf, expected: u64, actual: u64 },

    #[error("failed to create compute context: {0}")]
    ContextCreation(RuntimeStatus),

    #[error("failed to create command queue: {0}")]
    QueueCreation(RuntimeStatus),

    #[error("failed to create program from binary: {0}")]
    ProgramLoadError(RuntimeStatus),

    #[error("failed to build program executable: {status}\n{log}")]
    ProgramBuildError { status: RuntimeStatus, log: String },

    #[error("kernel '{name}' not found in program: {status}")]
    KernelNotFound { name: String, status: RuntimeStatus },

    #[error("memory bank {bank} out of range: device reports {available} bank(s)")]
    BankOutOfRange { bank: MemoryBank, available: u32 },

    #[error("failed to allocate {bytes} bytes for operand {operand} in bank {bank}: {status}")]
    BufferAllocError { operand: Operand, bank: MemoryBank, bytes: usize, status: RuntimeStatus },

    #[error("transfer of operand {operand} failed: {status}")]
    TransferError { operand: Operand, status: RuntimeStatus },

    #[error("failed to set kernel argument {index}: {status}")]
    ArgumentBindError { index: u32, status: RuntimeStatus },

    #[error("failed to execute kernel: {0}")]
    KernelLaunchError(RuntimeStatus),

    #[error("result mismatch at {} element(s)", .mismatches.len())]
    VerificationMismatch { mismatches: Vec<Mismatch> },

    #[error("matrix length mismatch: expected {expected} elements, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{kind} already released")]
    Released { kind: ResourceKind },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HostError {
    /// Pipeline stage the error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::PlatformNotFound { .. }
            | Self::DeviceNotFound { .. }
            | Self::RuntimeQuery { .. } => Stage::Resolve,
            Self::FileOpenError { .. } | Self::FileReadError { .. } => Stage::Load,
            Self::ContextCreation(_)
            | Self::QueueCreation(_)
            | Self::ProgramLoadError(_)
            | Self::ProgramBuildError { .. }
            | Self::KernelNotFound { .. }
            | Self::Released { .. } => Stage::Context,
            Self::BankOutOfRange { .. }
            | Self::BufferAllocError { .. }
            | Self::TransferError { .. } => Stage::Buffers,
            Self::ArgumentBindError { .. } | Self::KernelLaunchError(_) => Stage::Dispatch,
            Self::VerificationMismatch { .. } | Self::DimensionMismatch { .. } => Stage::Verify,
            Self::InvalidConfig(_) | Self::Config(_) => Stage::Configure,
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Configure,
    Resolve,
    Load,
    Context,
    Buffers,
    Dispatch,
    Verify,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configure => write!(f, "configure"),
            Self::Resolve => write!(f, "resolve"),
            Self::Load => write!(f, "load"),
            Self::Context => write!(f, "context"),
            Self::Buffers => write!(f, "buffers"),
            Self::Dispatch => write!(f, "dispatch"),
            Self::Verify => write!(f, "verify"),
        }
    }
}
