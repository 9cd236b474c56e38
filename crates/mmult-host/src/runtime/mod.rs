//! Compute-runtime seam.
//!
//! The pipeline never talks to an accelerator API directly. Everything it
//! needs (platform/device queries, context and queue creation, program
//! loading, buffer management, argument binding, dispatch and
//! synchronization) goes through [`ComputeRuntime`]. Two backends exist:
//!
//! - `opencl::OpenClRuntime`: real devices via the OpenCL ICD loader
//!   (requires the `opencl-runtime` feature).
//! - [`simulated::SimulatedRuntime`]: an in-process accelerator that runs
//!   the kernel in software and keeps a create/release ledger.
//!
//! Every handle that the runtime creates is handed back through a matching
//! `release_*` method. Callers own the handles in between; the runtime does
//! not track them for the caller.

use std::fmt;

use crate::buffers::MemoryBank;

#[cfg(feature = "opencl-runtime")]
pub mod opencl;
pub mod simulated;

/// Raw status code reported by the accelerator runtime.
///
/// Values follow the OpenCL numbering (`0` is success, negative values are
/// errors) so diagnostics read the same regardless of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeStatus(pub i32);

impl RuntimeStatus {
    pub const SUCCESS: Self = Self(0);
    pub const DEVICE_NOT_FOUND: Self = Self(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Self = Self(-4);
    pub const OUT_OF_RESOURCES: Self = Self(-5);
    pub const BUILD_PROGRAM_FAILURE: Self = Self(-11);
    pub const INVALID_VALUE: Self = Self(-30);
    pub const INVALID_CONTEXT: Self = Self(-34);
    pub const INVALID_COMMAND_QUEUE: Self = Self(-36);
    pub const INVALID_MEM_OBJECT: Self = Self(-38);
    pub const INVALID_BINARY: Self = Self(-42);
    pub const INVALID_PROGRAM_EXECUTABLE: Self = Self(-45);
    pub const INVALID_KERNEL_NAME: Self = Self(-46);
    pub const INVALID_ARG_INDEX: Self = Self(-49);
    pub const INVALID_ARG_VALUE: Self = Self(-50);
    pub const INVALID_KERNEL_ARGS: Self = Self(-52);
    pub const INVALID_WORK_GROUP_SIZE: Self = Self(-54);
    pub const INVALID_BUFFER_SIZE: Self = Self(-61);
    pub const PLATFORM_NOT_FOUND_KHR: Self = Self(-1001);

    /// Symbolic name of the status, when it is a well-known code.
    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -2 => "CL_DEVICE_NOT_AVAILABLE",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
            -30 => "CL_INVALID_VALUE",
            -32 => "CL_INVALID_PLATFORM",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -38 => "CL_INVALID_MEM_OBJECT",
            -42 => "CL_INVALID_BINARY",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
            _ => return None,
        };
        Some(name)
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "status {}", self.0),
        }
    }
}

/// Command-queue creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueProperties {
    /// Permit out-of-order execution of independently enqueued commands.
    pub out_of_order: bool,
    /// Record per-command timestamps.
    pub profiling: bool,
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self { out_of_order: true, profiling: true }
    }
}

/// One positional kernel argument.
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    /// A device buffer handle.
    Buffer(&'a B),
    /// A 32-bit signed scalar.
    Int(i32),
}

impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

/// Kinds of runtime objects whose lifetime the pipeline manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
    Event,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Context,
        ResourceKind::Queue,
        ResourceKind::Program,
        ResourceKind::Kernel,
        ResourceKind::Buffer,
        ResourceKind::Event,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Context => write!(f, "context"),
            Self::Queue => write!(f, "command queue"),
            Self::Program => write!(f, "program"),
            Self::Kernel => write!(f, "kernel"),
            Self::Buffer => write!(f, "buffer"),
            Self::Event => write!(f, "event"),
        }
    }
}

/// Accelerator runtime operations used by the host pipeline.
///
/// All blocking calls block the calling thread until the device reports
/// completion; there is no timeout.
pub trait ComputeRuntime {
    type Platform;
    type Device;
    type Context;
    type Queue;
    type Program;
    type Kernel;
    type Buffer;
    type Event;

    /// Every platform known to the runtime, in enumeration order.
    fn platforms(&self) -> Result<Vec<Self::Platform>, RuntimeStatus>;

    fn platform_vendor(&self, platform: &Self::Platform) -> Result<String, RuntimeStatus>;

    /// Accelerator-class devices under `platform`, in enumeration order.
    fn accelerator_devices(
        &self,
        platform: &Self::Platform,
    ) -> Result<Vec<Self::Device>, RuntimeStatus>;

    fn device_name(&self, device: &Self::Device) -> Result<String, RuntimeStatus>;

    /// Number of independently addressable memory banks on `device`.
    fn memory_bank_count(&self, device: &Self::Device) -> Result<u32, RuntimeStatus>;

    fn create_context(&self, device: &Self::Device) -> Result<Self::Context, RuntimeStatus>;

    fn create_queue(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        properties: QueueProperties,
    ) -> Result<Self::Queue, RuntimeStatus>;

    /// Create a program from a pre-compiled device binary.
    fn create_program_with_binary(
        &self,
        context: &Self::Context,
        device: &Self::Device,
        binary: &[u8],
    ) -> Result<Self::Program, RuntimeStatus>;

    fn build_program(
        &self,
        program: &mut Self::Program,
        device: &Self::Device,
    ) -> Result<(), RuntimeStatus>;

    /// Build log of the last build of `program` for `device`.
    fn build_log(&self, program: &Self::Program, device: &Self::Device) -> String;

    fn create_kernel(
        &self,
        program: &Self::Program,
        name: &str,
    ) -> Result<Self::Kernel, RuntimeStatus>;

    /// Allocate a read-write buffer of `bytes` bytes placed in `bank`.
    fn create_buffer(
        &self,
        context: &Self::Context,
        bank: MemoryBank,
        bytes: usize,
    ) -> Result<Self::Buffer, RuntimeStatus>;

    /// Blocking host-to-device write starting at offset zero.
    fn write_buffer(
        &self,
        queue: &Self::Queue,
        buffer: &mut Self::Buffer,
        data: &[i32],
    ) -> Result<(), RuntimeStatus>;

    /// Blocking device-to-host read starting at offset zero.
    ///
    /// Returns the completion event of the read; the data in `dst` is only
    /// valid once [`wait_for_event`](Self::wait_for_event) succeeds.
    fn read_buffer(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        dst: &mut [i32],
    ) -> Result<Self::Event, RuntimeStatus>;

    fn wait_for_event(&self, event: Self::Event) -> Result<(), RuntimeStatus>;

    fn set_kernel_arg(
        &self,
        kernel: &Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Buffer>,
    ) -> Result<(), RuntimeStatus>;

    /// Enqueue one-dimensional NDRange execution of `kernel`.
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        global_size: usize,
        local_size: usize,
    ) -> Result<(), RuntimeStatus>;

    /// Block until every command in `queue` has completed.
    fn finish(&self, queue: &Self::Queue) -> Result<(), RuntimeStatus>;

    fn release_buffer(&self, buffer: Self::Buffer);
    fn release_kernel(&self, kernel: Self::Kernel);
    fn release_program(&self, program: Self::Program);
    fn release_queue(&self, queue: Self::Queue);
    fn release_context(&self, context: Self::Context);
}
