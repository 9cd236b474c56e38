//! OpenCL backend built on `opencl3`.
//!
//! Buffers are placed in explicit DDR banks through the Xilinx extended
//! memory pointer (`CL_MEM_EXT_PTR_XILINX`), using the `XCL_MEM_DDR_BANKn`
//! flag encoding with no kernel attached. With a kernel in `param` the
//! runtime would read `flags` as a kernel argument index instead, so a
//! placement like `a = 3` would follow scalar argument 3 rather than bank 3.
//! Banks cannot be queried through core OpenCL, so the count comes from
//! configuration.

use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{
    CommandQueue, CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE, CL_QUEUE_PROFILING_ENABLE,
};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ACCELERATOR};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_WRITE};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{cl_bitfield, cl_int, CL_BLOCKING};
use tracing::{debug, warn};

use crate::buffers::MemoryBank;
use crate::runtime::{ComputeRuntime, KernelArg, QueueProperties, RuntimeStatus};

/// Flag telling the Xilinx runtime that `host_ptr` is an extension struct.
const CL_MEM_EXT_PTR_XILINX: cl_bitfield = 1 << 31;

/// `XCL_MEM_DDR_BANK0`; bank `n` is this shifted left by `n`.
const XCL_MEM_DDR_BANK0: u32 = 1 << 8;

/// Layout of `cl_mem_ext_ptr_t` from the Xilinx OpenCL extensions.
#[repr(C)]
struct MemExtPtr {
    flags: u32,
    obj: *mut c_void,
    param: *mut c_void,
}

impl MemExtPtr {
    /// Extension pointer selecting DDR `bank`, not tied to any kernel.
    fn ddr_bank(bank: MemoryBank) -> Self {
        Self {
            flags: XCL_MEM_DDR_BANK0 << bank.index(),
            obj: ptr::null_mut(),
            param: ptr::null_mut(),
        }
    }
}

fn status(err: ClError) -> RuntimeStatus {
    RuntimeStatus(err.0)
}

/// Runtime talking to the installed OpenCL ICD.
#[derive(Debug, Clone)]
pub struct OpenClRuntime {
    memory_banks: u32,
}

impl OpenClRuntime {
    /// `memory_banks` is the number of DDR banks the target card exposes.
    pub fn new(memory_banks: u32) -> Self {
        Self { memory_banks }
    }
}

impl ComputeRuntime for OpenClRuntime {
    type Platform = Platform;
    type Device = Device;
    type Context = Context;
    type Queue = CommandQueue;
    type Program = Program;
    type Kernel = Kernel;
    type Buffer = Buffer<cl_int>;
    type Event = Event;

    fn platforms(&self) -> Result<Vec<Platform>, RuntimeStatus> {
        get_platforms().map_err(status)
    }

    fn platform_vendor(&self, platform: &Platform) -> Result<String, RuntimeStatus> {
        platform.vendor().map_err(status)
    }

    fn accelerator_devices(&self, platform: &Platform) -> Result<Vec<Device>, RuntimeStatus> {
        let ids = platform.get_devices(CL_DEVICE_TYPE_ACCELERATOR).map_err(status)?;
        Ok(ids.into_iter().map(Device::new).collect())
    }

    fn device_name(&self, device: &Device) -> Result<String, RuntimeStatus> {
        device.name().map_err(status)
    }

    fn memory_bank_count(&self, _device: &Device) -> Result<u32, RuntimeStatus> {
        Ok(self.memory_banks)
    }

    fn create_context(&self, device: &Device) -> Result<Context, RuntimeStatus> {
        Context::from_device(device).map_err(status)
    }

    fn create_queue(
        &self,
        context: &Context,
        _device: &Device,
        properties: QueueProperties,
    ) -> Result<CommandQueue, RuntimeStatus> {
        let mut props = 0;
        if properties.out_of_order {
            props |= CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE;
        }
        if properties.profiling {
            props |= CL_QUEUE_PROFILING_ENABLE;
        }
        #[allow(deprecated)]
        CommandQueue::create_default(context, props).map_err(status)
    }

    fn create_program_with_binary(
        &self,
        context: &Context,
        device: &Device,
        binary: &[u8],
    ) -> Result<Program, RuntimeStatus> {
        // SAFETY: the binary slice outlives the call and the device belongs
        // to `context`.
        unsafe { Program::create_from_binary(context, &[device.id()], &[binary]) }.map_err(status)
    }

    fn build_program(&self, program: &mut Program, device: &Device) -> Result<(), RuntimeStatus> {
        program.build(&[device.id()], "").map_err(status)
    }

    fn build_log(&self, program: &Program, device: &Device) -> String {
        program.get_build_log(device.id()).unwrap_or_else(|e| {
            warn!("could not fetch build log: {}", status(e));
            String::new()
        })
    }

    fn create_kernel(&self, program: &Program, name: &str) -> Result<Kernel, RuntimeStatus> {
        Kernel::create(program, name).map_err(status)
    }

    fn create_buffer(
        &self,
        context: &Context,
        bank: MemoryBank,
        bytes: usize,
    ) -> Result<Buffer<cl_int>, RuntimeStatus> {
        let count = bytes / std::mem::size_of::<cl_int>();
        let mut ext = MemExtPtr::ddr_bank(bank);
        debug!("allocating {bytes} bytes in {bank}");
        // SAFETY: `ext` lives across the call and matches the layout the
        // extension flag announces; no host memory is aliased.
        unsafe {
            Buffer::<cl_int>::create(
                context,
                CL_MEM_READ_WRITE | CL_MEM_EXT_PTR_XILINX,
                count,
                &mut ext as *mut MemExtPtr as *mut c_void,
            )
        }
        .map_err(status)
    }

    fn write_buffer(
        &self,
        queue: &CommandQueue,
        buffer: &mut Buffer<cl_int>,
        data: &[i32],
    ) -> Result<(), RuntimeStatus> {
        // SAFETY: blocking write, `data` stays borrowed until it returns.
        let event = unsafe { queue.enqueue_write_buffer(buffer, CL_BLOCKING, 0, data, &[]) }
            .map_err(status)?;
        event.wait().map_err(status)
    }

    fn read_buffer(
        &self,
        queue: &CommandQueue,
        buffer: &Buffer<cl_int>,
        dst: &mut [i32],
    ) -> Result<Event, RuntimeStatus> {
        // SAFETY: blocking read into a live exclusive slice.
        unsafe { queue.enqueue_read_buffer(buffer, CL_BLOCKING, 0, dst, &[]) }.map_err(status)
    }

    fn wait_for_event(&self, event: Event) -> Result<(), RuntimeStatus> {
        event.wait().map_err(status)
    }

    fn set_kernel_arg(
        &self,
        kernel: &Kernel,
        index: u32,
        arg: KernelArg<'_, Buffer<cl_int>>,
    ) -> Result<(), RuntimeStatus> {
        // SAFETY: argument types match the kernel signature (global int*
        // for buffers, int for scalars).
        let result = match arg {
            KernelArg::Buffer(buffer) => unsafe { kernel.set_arg(index, &buffer.get()) },
            KernelArg::Int(value) => unsafe { kernel.set_arg(index, &value) },
        };
        result.map_err(status)
    }

    fn enqueue_kernel(
        &self,
        queue: &CommandQueue,
        kernel: &Kernel,
        global_size: usize,
        local_size: usize,
    ) -> Result<(), RuntimeStatus> {
        let global = [global_size];
        let local = [local_size];
        // SAFETY: one-dimensional range; the size arrays outlive the call.
        unsafe {
            queue.enqueue_nd_range_kernel(
                kernel.get(),
                1,
                ptr::null(),
                global.as_ptr(),
                local.as_ptr(),
                &[],
            )
        }
        .map(drop)
        .map_err(status)
    }

    fn finish(&self, queue: &CommandQueue) -> Result<(), RuntimeStatus> {
        queue.finish().map_err(status)
    }

    fn release_buffer(&self, buffer: Buffer<cl_int>) {
        drop(buffer);
    }

    fn release_kernel(&self, kernel: Kernel) {
        drop(kernel);
    }

    fn release_program(&self, program: Program) {
        drop(program);
    }

    fn release_queue(&self, queue: CommandQueue) {
        drop(queue);
    }

    fn release_context(&self, context: Context) {
        drop(context);
    }
}
