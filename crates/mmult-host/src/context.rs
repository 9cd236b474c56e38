//! Execution context: compute context, command queue, program and kernel
//! for one selected device.
//!
//! Construction is strictly ordered and teardown runs in reverse
//! (kernel, program, queue, context). Teardown is idempotent and runs on
//! drop, so a context that failed halfway through construction still
//! releases exactly what it acquired.

use tracing::{debug, error, info};

use crate::error::{HostError, Result};
use crate::loader::BinaryImage;
use crate::resolver::ResolvedDevice;
use crate::runtime::{ComputeRuntime, QueueProperties, ResourceKind};

/// Default upper bound for a captured build log, in bytes.
pub const DEFAULT_BUILD_LOG_LIMIT: usize = 2048;

/// Settings for [`ExecutionContext::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextOptions {
    /// Entry point to extract from the program.
    pub kernel_name: String,
    pub queue: QueueProperties,
    /// Maximum number of build-log bytes kept on a build failure.
    pub build_log_limit: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            kernel_name: "mmult".to_string(),
            queue: QueueProperties::default(),
            build_log_limit: DEFAULT_BUILD_LOG_LIMIT,
        }
    }
}

/// All runtime handles for a single run on a single device.
pub struct ExecutionContext<'r, R: ComputeRuntime> {
    runtime: &'r R,
    platform: R::Platform,
    device: R::Device,
    device_name: String,
    kernel_name: String,
    context: Option<R::Context>,
    queue: Option<R::Queue>,
    program: Option<R::Program>,
    kernel: Option<R::Kernel>,
}

impl<'r, R: ComputeRuntime> ExecutionContext<'r, R> {
    /// Create context, queue, program and kernel for `target`.
    ///
    /// The image is consumed and dropped as soon as the program has been
    /// created from it, whether or not creation succeeded.
    pub fn build(
        runtime: &'r R,
        target: ResolvedDevice<R>,
        image: BinaryImage,
        options: &ContextOptions,
    ) -> Result<Self> {
        let ResolvedDevice { platform, device, device_name, .. } = target;
        let mut ctx = Self {
            runtime,
            platform,
            device,
            device_name,
            kernel_name: options.kernel_name.clone(),
            context: None,
            queue: None,
            program: None,
            kernel: None,
        };

        let context = runtime.create_context(&ctx.device).map_err(HostError::ContextCreation)?;
        let context = ctx.context.insert(context);
        debug!("compute context created");

        let queue = runtime
            .create_queue(context, &ctx.device, options.queue)
            .map_err(HostError::QueueCreation)?;
        ctx.queue = Some(queue);
        debug!(
            "command queue created (out_of_order={}, profiling={})",
            options.queue.out_of_order, options.queue.profiling
        );

        let created = runtime.create_program_with_binary(context, &ctx.device, image.as_bytes());
        drop(image);
        let program = ctx.program.insert(created.map_err(HostError::ProgramLoadError)?);

        if let Err(status) = runtime.build_program(program, &ctx.device) {
            let raw = runtime.build_log(program, &ctx.device);
            let log = truncate_log(raw, options.build_log_limit);
            error!("failed to build program executable: {status}");
            return Err(HostError::ProgramBuildError { status, log });
        }
        debug!("program built");

        let kernel = runtime.create_kernel(program, &options.kernel_name).map_err(|status| {
            HostError::KernelNotFound { name: options.kernel_name.clone(), status }
        })?;
        ctx.kernel = Some(kernel);

        info!("execution context ready: kernel '{}' on {}", ctx.kernel_name, ctx.device_name);
        Ok(ctx)
    }

    pub fn runtime(&self) -> &'r R {
        self.runtime
    }

    pub fn platform(&self) -> &R::Platform {
        &self.platform
    }

    pub fn device(&self) -> &R::Device {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn context(&self) -> Result<&R::Context> {
        self.context.as_ref().ok_or(HostError::Released { kind: ResourceKind::Context })
    }

    pub fn queue(&self) -> Result<&R::Queue> {
        self.queue.as_ref().ok_or(HostError::Released { kind: ResourceKind::Queue })
    }

    pub fn program(&self) -> Result<&R::Program> {
        self.program.as_ref().ok_or(HostError::Released { kind: ResourceKind::Program })
    }

    pub fn kernel(&self) -> Result<&R::Kernel> {
        self.kernel.as_ref().ok_or(HostError::Released { kind: ResourceKind::Kernel })
    }

    /// Whether any handle is still held.
    pub fn is_live(&self) -> bool {
        self.context.is_some()
            || self.queue.is_some()
            || self.program.is_some()
            || self.kernel.is_some()
    }

    /// Release kernel, program, queue and context, in that order.
    ///
    /// Absent handles are skipped, so this is safe on a partially built
    /// context and safe to call repeatedly.
    pub fn teardown(&mut self) {
        if let Some(kernel) = self.kernel.take() {
            self.runtime.release_kernel(kernel);
        }
        if let Some(program) = self.program.take() {
            self.runtime.release_program(program);
        }
        if let Some(queue) = self.queue.take() {
            self.runtime.release_queue(queue);
        }
        if let Some(context) = self.context.take() {
            self.runtime.release_context(context);
            debug!("execution context released");
        }
    }
}

impl<R: ComputeRuntime> Drop for ExecutionContext<'_, R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<R: ComputeRuntime> std::fmt::Debug for ExecutionContext<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("device", &self.device_name)
            .field("kernel", &self.kernel_name)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Keep at most `limit` bytes of `log`, cut on a character boundary.
fn truncate_log(mut log: String, limit: usize) -> String {
    if log.len() > limit {
        let mut cut = limit;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        log.truncate(cut);
    }
    log
}
