//! Linear driver: resolve, load, build, write, dispatch, read, verify.

use std::path::Path;

use tracing::info;

use crate::buffers::DeviceBufferSet;
use crate::config::HostConfig;
use crate::context::ExecutionContext;
use crate::dispatch::dispatch;
use crate::error::{HostError, Result};
use crate::loader::load_binary_image;
use crate::matrix::{reference_multiply, Matrix};
use crate::resolver::resolve_device;
use crate::runtime::ComputeRuntime;
use crate::verify::{verify, VerificationReport};

/// Modulus of the default operand pattern.
pub const OPERAND_MODULUS: i32 = 10;

/// Everything a finished run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub device_output: Matrix,
    pub reference: Matrix,
    pub report: VerificationReport,
}

impl PipelineOutcome {
    pub fn passed(&self) -> bool {
        self.report.passed()
    }

    /// Fail with [`HostError::VerificationMismatch`] unless every element
    /// matched.
    pub fn ensure_verified(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(HostError::VerificationMismatch { mismatches: self.report.mismatches })
        }
    }
}

/// Operands A and B with `A[i] = B[i] = i % 10`.
pub fn default_operands(dim: usize) -> (Matrix, Matrix) {
    let a = Matrix::sequential_mod(dim, OPERAND_MODULUS);
    let b = a.clone();
    (a, b)
}

/// Run the whole pipeline for `a x b` on the device selected by `config`.
///
/// Both operands must be `config.dimension` square; a mismatch is
/// rejected before any runtime call.
///
/// Returns the outcome even when verification finds mismatches; use
/// [`PipelineOutcome::ensure_verified`] to turn that into an error. Every
/// runtime resource acquired along the way is released before this
/// returns, on success and on every error path.
pub fn run_pipeline<R: ComputeRuntime>(
    runtime: &R,
    config: &HostConfig,
    image_path: &Path,
    a: &Matrix,
    b: &Matrix,
) -> Result<PipelineOutcome> {
    config.validate()?;
    if a.dim() != b.dim() {
        return Err(HostError::DimensionMismatch { expected: a.len(), actual: b.len() });
    }
    if a.dim() != config.dimension {
        // validate() already bounded dimension^2
        let expected = config.dimension * config.dimension;
        return Err(HostError::DimensionMismatch { expected, actual: a.len() });
    }

    let target = resolve_device(runtime, &config.platform_vendor, &config.device_name)?;
    let image = load_binary_image(image_path)?;
    let ctx = ExecutionContext::build(runtime, target, image, &config.context_options())?;

    let mut buffers = DeviceBufferSet::allocate(&ctx, &config.placement, a.len())?;
    buffers.write_operands(a, b)?;
    dispatch(&ctx, &buffers, config.dimensions())?;

    let mut device_output = Matrix::zeros(config.dimension);
    buffers.read_result(&mut device_output)?;
    drop(buffers);
    drop(ctx);

    let reference = reference_multiply(a, b)?;
    let report = verify(&device_output, &reference)?;
    info!(
        "pipeline finished: {} element(s) compared, {} mismatch(es)",
        report.compared,
        report.mismatches.len()
    );
    Ok(PipelineOutcome { device_output, reference, report })
}

/// [`run_pipeline`] with [`default_operands`] of `config.dimension`.
pub fn run_default<R: ComputeRuntime>(
    runtime: &R,
    config: &HostConfig,
    image_path: &Path,
) -> Result<PipelineOutcome> {
    let (a, b) = default_operands(config.dimension);
    run_pipeline(runtime, config, image_path, &a, &b)
}
