//! Kernel argument binding and single-invocation dispatch.
//!
//! The kernel runs as one opaque unit of work: a one-dimensional NDRange
//! with global and local size 1. All parallelism lives inside the device
//! image. After the launch the host blocks on a full queue drain, so any
//! read issued afterwards observes the finished result.

use tracing::{debug, info};

use crate::buffers::{DeviceBufferSet, Operand};
use crate::context::ExecutionContext;
use crate::error::{HostError, Result};
use crate::runtime::{ComputeRuntime, KernelArg};

/// Global NDRange size for the launch.
pub const GLOBAL_WORK_SIZE: usize = 1;
/// Work-group size for the launch.
pub const LOCAL_WORK_SIZE: usize = 1;

/// Scalar dimensions passed to the kernel after the three buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub a_rows: usize,
    pub a_cols: usize,
    pub b_cols: usize,
}

impl Dimensions {
    /// Dimensions for an `n x n` by `n x n` product.
    pub fn square(n: usize) -> Self {
        Self { a_rows: n, a_cols: n, b_cols: n }
    }

    /// The three values as kernel `int` arguments.
    pub fn as_scalars(&self) -> Result<[i32; 3]> {
        let convert = |name: &str, v: usize| {
            i32::try_from(v).map_err(|_| {
                HostError::InvalidConfig(format!("{name}={v} does not fit a kernel int argument"))
            })
        };
        Ok([
            convert("a_rows", self.a_rows)?,
            convert("a_cols", self.a_cols)?,
            convert("b_cols", self.b_cols)?,
        ])
    }
}

/// The positional argument list of the kernel: A, B, C, rows(A), cols(A),
/// cols(B).
pub fn kernel_arguments<'a, R: ComputeRuntime>(
    buffers: &'a DeviceBufferSet<'_, '_, R>,
    dims: Dimensions,
) -> Result<[KernelArg<'a, R::Buffer>; 6]> {
    let [a_rows, a_cols, b_cols] = dims.as_scalars()?;
    Ok([
        KernelArg::Buffer(buffers.handle(Operand::A)?),
        KernelArg::Buffer(buffers.handle(Operand::B)?),
        KernelArg::Buffer(buffers.handle(Operand::C)?),
        KernelArg::Int(a_rows),
        KernelArg::Int(a_cols),
        KernelArg::Int(b_cols),
    ])
}

/// Bind `args` in order, stopping at the first one the runtime rejects.
pub fn bind_arguments<R: ComputeRuntime>(
    ctx: &ExecutionContext<'_, R>,
    args: &[KernelArg<'_, R::Buffer>],
) -> Result<()> {
    let kernel = ctx.kernel()?;
    for (index, arg) in (0u32..).zip(args.iter().copied()) {
        ctx.runtime()
            .set_kernel_arg(kernel, index, arg)
            .map_err(|status| HostError::ArgumentBindError { index, status })?;
    }
    debug!("bound {} kernel arguments", args.len());
    Ok(())
}

/// Bind the argument list, launch the kernel once and wait for the queue to
/// drain.
pub fn dispatch<R: ComputeRuntime>(
    ctx: &ExecutionContext<'_, R>,
    buffers: &DeviceBufferSet<'_, '_, R>,
    dims: Dimensions,
) -> Result<()> {
    let args = kernel_arguments(buffers, dims)?;
    bind_arguments(ctx, &args)?;

    let runtime = ctx.runtime();
    let queue = ctx.queue()?;
    runtime
        .enqueue_kernel(queue, ctx.kernel()?, GLOBAL_WORK_SIZE, LOCAL_WORK_SIZE)
        .map_err(HostError::KernelLaunchError)?;
    debug!("kernel '{}' enqueued", ctx.kernel_name());

    runtime.finish(queue).map_err(HostError::KernelLaunchError)?;
    info!("kernel '{}' completed", ctx.kernel_name());
    Ok(())
}
