//! In-process accelerator used for tests and for running the pipeline on
//! machines without a card.
//!
//! The simulated device follows OpenCL semantics closely enough to
//! exercise every stage of the pipeline:
//!
//! - programs are only accepted from images that start with
//!   [`XCLBIN_MAGIC`];
//! - launched kernels are queued and only execute when the queue is
//!   drained with [`ComputeRuntime::finish`], so a read issued before the
//!   drain observes stale data;
//! - every create/release is recorded in a [`ResourceLedger`];
//! - any stage can be forced to fail with a [`Fault`].
//!
//! The only kernel it knows how to execute is the integer matrix multiply
//! (`C = A x B` with arguments A, B, C, rows(A), cols(A), cols(B)).

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::buffers::MemoryBank;
use crate::runtime::{ComputeRuntime, KernelArg, QueueProperties, ResourceKind, RuntimeStatus};

/// Leading bytes of a device binary container.
pub const XCLBIN_MAGIC: &[u8; 8] = b"xclbin2\0";

/// Number of arguments taken by the matrix-multiply kernel.
const MMULT_ARITY: u32 = 6;

/// A forced failure at one runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Platform enumeration fails.
    PlatformQuery,
    /// Reading a platform's vendor string fails.
    PlatformVendorQuery,
    /// Device enumeration fails with something other than "no devices".
    DeviceQuery,
    /// Reading a device's name fails.
    DeviceNameQuery,
    CreateContext,
    CreateQueue,
    /// Program creation rejects the binary.
    LoadProgram,
    /// Program build fails with this log.
    BuildProgram { log: String },
    /// Allocation in this bank fails.
    AllocateBuffer { bank: MemoryBank },
    /// Writes into the buffer placed in this bank fail.
    WriteBuffer { bank: MemoryBank },
    SetKernelArg { index: u32 },
    LaunchKernel,
    /// Draining the queue fails.
    Finish,
    ReadBuffer,
    /// Element `index` of every read is replaced with `value`.
    CorruptOutput { index: usize, value: i32 },
}

/// A simulated platform with its accelerator devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimPlatform {
    vendor: String,
    devices: Vec<SimDevice>,
}

impl SimPlatform {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self { vendor: vendor.into(), devices: Vec::new() }
    }

    /// Add an accelerator device exposing `banks` memory banks.
    pub fn with_device(mut self, name: impl Into<String>, banks: u32) -> Self {
        self.devices.push(SimDevice { name: name.into(), banks });
        self
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    name: String,
    banks: u32,
}

impl SimDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bank_count(&self) -> u32 {
        self.banks
    }
}

#[derive(Debug)]
pub struct SimContext {
    id: u64,
    banks: u32,
}

#[derive(Debug)]
pub struct SimQueue {
    id: u64,
    properties: QueueProperties,
    pending: RefCell<Vec<Vec<SimArg>>>,
}

impl SimQueue {
    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    /// Launches enqueued but not yet executed.
    pub fn pending_launches(&self) -> usize {
        self.pending.borrow().len()
    }
}

#[derive(Debug)]
pub struct SimProgram {
    id: u64,
    built: bool,
    build_log: String,
}

#[derive(Debug)]
pub struct SimKernel {
    id: u64,
    name: String,
    args: RefCell<Vec<Option<SimArg>>>,
}

#[derive(Debug)]
pub struct SimBuffer {
    id: u64,
    bank: MemoryBank,
    data: Rc<RefCell<Vec<i32>>>,
}

impl SimBuffer {
    pub fn bank(&self) -> MemoryBank {
        self.bank
    }

    /// Current device-side contents.
    pub fn contents(&self) -> Vec<i32> {
        self.data.borrow().clone()
    }
}

#[derive(Debug)]
pub struct SimEvent {
    id: u64,
}

#[derive(Debug, Clone)]
enum SimArg {
    Buffer(Rc<RefCell<Vec<i32>>>),
    Int(i32),
}

/// Commands observed by the simulated device, in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCommand {
    Write { bank: MemoryBank },
    Launch { global: usize, local: usize },
    Finish,
    Read { bank: MemoryBank },
    Wait,
}

/// Create/release counts per resource kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLedger {
    created: BTreeMap<ResourceKind, usize>,
    released: BTreeMap<ResourceKind, usize>,
    release_order: Vec<ResourceKind>,
}

impl ResourceLedger {
    fn record_create(&mut self, kind: ResourceKind) {
        *self.created.entry(kind).or_default() += 1;
    }

    fn record_release(&mut self, kind: ResourceKind) {
        *self.released.entry(kind).or_default() += 1;
        self.release_order.push(kind);
    }

    pub fn created(&self, kind: ResourceKind) -> usize {
        self.created.get(&kind).copied().unwrap_or(0)
    }

    pub fn released(&self, kind: ResourceKind) -> usize {
        self.released.get(&kind).copied().unwrap_or(0)
    }

    /// Handles of `kind` created but not yet released.
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.created(kind).saturating_sub(self.released(kind))
    }

    pub fn total_created(&self) -> usize {
        self.created.values().sum()
    }

    /// Every created handle has been released exactly once.
    pub fn is_balanced(&self) -> bool {
        ResourceKind::ALL.iter().all(|&kind| self.created(kind) == self.released(kind))
    }

    /// Kinds in the order they were released.
    pub fn release_order(&self) -> &[ResourceKind] {
        &self.release_order
    }
}

/// Builder for [`SimulatedRuntime`].
#[derive(Debug, Clone)]
pub struct SimulatedRuntimeBuilder {
    platforms: Vec<SimPlatform>,
    kernels: Vec<String>,
    faults: Vec<Fault>,
}

impl Default for SimulatedRuntimeBuilder {
    fn default() -> Self {
        Self { platforms: Vec::new(), kernels: vec!["mmult".to_string()], faults: Vec::new() }
    }
}

impl SimulatedRuntimeBuilder {
    pub fn platforms(mut self, platforms: Vec<SimPlatform>) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn platform(mut self, platform: SimPlatform) -> Self {
        self.platforms.push(platform);
        self
    }

    /// Kernel entry points exposed by every accepted image.
    pub fn kernels(mut self, kernels: Vec<String>) -> Self {
        self.kernels = kernels;
        self
    }

    pub fn faults(mut self, faults: Vec<Fault>) -> Self {
        self.faults = faults;
        self
    }

    pub fn fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn build(self) -> SimulatedRuntime {
        SimulatedRuntime {
            platforms: self.platforms,
            kernels: self.kernels,
            faults: self.faults,
            next_id: Cell::new(1),
            ledger: RefCell::new(ResourceLedger::default()),
            commands: RefCell::new(Vec::new()),
        }
    }
}

/// Software accelerator implementing [`ComputeRuntime`].
#[derive(Debug)]
pub struct SimulatedRuntime {
    platforms: Vec<SimPlatform>,
    kernels: Vec<String>,
    faults: Vec<Fault>,
    next_id: Cell<u64>,
    ledger: RefCell<ResourceLedger>,
    commands: RefCell<Vec<SimCommand>>,
}

impl SimulatedRuntime {
    pub fn builder() -> SimulatedRuntimeBuilder {
        SimulatedRuntimeBuilder::default()
    }

    /// One platform from `vendor` with one device named `device_name`.
    pub fn single_device(vendor: &str, device_name: &str, banks: u32) -> Self {
        Self::builder().platform(SimPlatform::new(vendor).with_device(device_name, banks)).build()
    }

    /// Snapshot of the create/release ledger.
    pub fn ledger(&self) -> ResourceLedger {
        self.ledger.borrow().clone()
    }

    /// Snapshot of the commands issued so far.
    pub fn commands(&self) -> Vec<SimCommand> {
        self.commands.borrow().clone()
    }

    /// Number of kernel launches enqueued so far.
    pub fn launches(&self) -> usize {
        self.commands.borrow().iter().filter(|c| matches!(c, SimCommand::Launch { .. })).count()
    }

    fn has_fault(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn created(&self, kind: ResourceKind) -> u64 {
        self.ledger.borrow_mut().record_create(kind);
        let id = self.next_id();
        trace!("sim: created {kind} #{id}");
        id
    }

    fn released(&self, kind: ResourceKind, id: u64) {
        self.ledger.borrow_mut().record_release(kind);
        trace!("sim: released {kind} #{id}");
    }

    fn issue(&self, command: SimCommand) {
        self.commands.borrow_mut().push(command);
    }
}

impl ComputeRuntime for SimulatedRuntime {
    type Platform = SimPlatform;
    type Device = SimDevice;
    type Context = SimContext;
    type Queue = SimQueue;
    type Program = SimProgram;
    type Kernel = SimKernel;
    type Buffer = SimBuffer;
    type Event = SimEvent;

    fn platforms(&self) -> Result<Vec<SimPlatform>, RuntimeStatus> {
        if self.has_fault(&Fault::PlatformQuery) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        Ok(self.platforms.clone())
    }

    fn platform_vendor(&self, platform: &SimPlatform) -> Result<String, RuntimeStatus> {
        if self.has_fault(&Fault::PlatformVendorQuery) {
            return Err(RuntimeStatus::INVALID_VALUE);
        }
        Ok(platform.vendor.clone())
    }

    fn accelerator_devices(
        &self,
        platform: &SimPlatform,
    ) -> Result<Vec<SimDevice>, RuntimeStatus> {
        if self.has_fault(&Fault::DeviceQuery) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        if platform.devices.is_empty() {
            return Err(RuntimeStatus::DEVICE_NOT_FOUND);
        }
        Ok(platform.devices.clone())
    }

    fn device_name(&self, device: &SimDevice) -> Result<String, RuntimeStatus> {
        if self.has_fault(&Fault::DeviceNameQuery) {
            return Err(RuntimeStatus::INVALID_VALUE);
        }
        Ok(device.name.clone())
    }

    fn memory_bank_count(&self, device: &SimDevice) -> Result<u32, RuntimeStatus> {
        Ok(device.banks)
    }

    fn create_context(&self, device: &SimDevice) -> Result<SimContext, RuntimeStatus> {
        if self.has_fault(&Fault::CreateContext) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        Ok(SimContext { id: self.created(ResourceKind::Context), banks: device.banks })
    }

    fn create_queue(
        &self,
        _context: &SimContext,
        _device: &SimDevice,
        properties: QueueProperties,
    ) -> Result<SimQueue, RuntimeStatus> {
        if self.has_fault(&Fault::CreateQueue) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        Ok(SimQueue {
            id: self.created(ResourceKind::Queue),
            properties,
            pending: RefCell::new(Vec::new()),
        })
    }

    fn create_program_with_binary(
        &self,
        _context: &SimContext,
        _device: &SimDevice,
        binary: &[u8],
    ) -> Result<SimProgram, RuntimeStatus> {
        if self.has_fault(&Fault::LoadProgram) || !binary.starts_with(XCLBIN_MAGIC) {
            return Err(RuntimeStatus::INVALID_BINARY);
        }
        Ok(SimProgram {
            id: self.created(ResourceKind::Program),
            built: false,
            build_log: String::new(),
        })
    }

    fn build_program(
        &self,
        program: &mut SimProgram,
        _device: &SimDevice,
    ) -> Result<(), RuntimeStatus> {
        let failure = self.faults.iter().find_map(|f| match f {
            Fault::BuildProgram { log } => Some(log.clone()),
            _ => None,
        });
        match failure {
            Some(log) => {
                program.build_log = log;
                Err(RuntimeStatus::BUILD_PROGRAM_FAILURE)
            }
            None => {
                program.built = true;
                Ok(())
            }
        }
    }

    fn build_log(&self, program: &SimProgram, _device: &SimDevice) -> String {
        program.build_log.clone()
    }

    fn create_kernel(&self, program: &SimProgram, name: &str) -> Result<SimKernel, RuntimeStatus> {
        if !program.built {
            return Err(RuntimeStatus::INVALID_PROGRAM_EXECUTABLE);
        }
        if !self.kernels.iter().any(|k| k == name) {
            return Err(RuntimeStatus::INVALID_KERNEL_NAME);
        }
        debug!("sim: kernel '{name}' from program #{}", program.id);
        Ok(SimKernel {
            id: self.created(ResourceKind::Kernel),
            name: name.to_string(),
            args: RefCell::new(vec![None; MMULT_ARITY as usize]),
        })
    }

    fn create_buffer(
        &self,
        context: &SimContext,
        bank: MemoryBank,
        bytes: usize,
    ) -> Result<SimBuffer, RuntimeStatus> {
        if bank.index() >= context.banks {
            return Err(RuntimeStatus::INVALID_VALUE);
        }
        if bytes == 0 || bytes % std::mem::size_of::<i32>() != 0 {
            return Err(RuntimeStatus::INVALID_BUFFER_SIZE);
        }
        if self.has_fault(&Fault::AllocateBuffer { bank }) {
            return Err(RuntimeStatus::MEM_OBJECT_ALLOCATION_FAILURE);
        }
        let elements = bytes / std::mem::size_of::<i32>();
        Ok(SimBuffer {
            id: self.created(ResourceKind::Buffer),
            bank,
            data: Rc::new(RefCell::new(vec![0; elements])),
        })
    }

    fn write_buffer(
        &self,
        _queue: &SimQueue,
        buffer: &mut SimBuffer,
        data: &[i32],
    ) -> Result<(), RuntimeStatus> {
        self.issue(SimCommand::Write { bank: buffer.bank });
        if self.has_fault(&Fault::WriteBuffer { bank: buffer.bank }) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        let mut dst = buffer.data.borrow_mut();
        if data.len() > dst.len() {
            return Err(RuntimeStatus::INVALID_VALUE);
        }
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(
        &self,
        _queue: &SimQueue,
        buffer: &SimBuffer,
        dst: &mut [i32],
    ) -> Result<SimEvent, RuntimeStatus> {
        self.issue(SimCommand::Read { bank: buffer.bank });
        if self.has_fault(&Fault::ReadBuffer) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        let src = buffer.data.borrow();
        if dst.len() > src.len() {
            return Err(RuntimeStatus::INVALID_VALUE);
        }
        dst.copy_from_slice(&src[..dst.len()]);
        for fault in &self.faults {
            if let Fault::CorruptOutput { index, value } = *fault {
                if let Some(slot) = dst.get_mut(index) {
                    *slot = value;
                }
            }
        }
        Ok(SimEvent { id: self.created(ResourceKind::Event) })
    }

    fn wait_for_event(&self, event: SimEvent) -> Result<(), RuntimeStatus> {
        self.issue(SimCommand::Wait);
        self.released(ResourceKind::Event, event.id);
        Ok(())
    }

    fn set_kernel_arg(
        &self,
        kernel: &SimKernel,
        index: u32,
        arg: KernelArg<'_, SimBuffer>,
    ) -> Result<(), RuntimeStatus> {
        if index >= MMULT_ARITY {
            return Err(RuntimeStatus::INVALID_ARG_INDEX);
        }
        if self.has_fault(&Fault::SetKernelArg { index }) {
            return Err(RuntimeStatus::INVALID_ARG_VALUE);
        }
        let value = match arg {
            KernelArg::Buffer(buffer) => SimArg::Buffer(Rc::clone(&buffer.data)),
            KernelArg::Int(v) => SimArg::Int(v),
        };
        kernel.args.borrow_mut()[index as usize] = Some(value);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: &SimQueue,
        kernel: &SimKernel,
        global_size: usize,
        local_size: usize,
    ) -> Result<(), RuntimeStatus> {
        self.issue(SimCommand::Launch { global: global_size, local: local_size });
        if self.has_fault(&Fault::LaunchKernel) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        if local_size == 0 || global_size % local_size != 0 {
            return Err(RuntimeStatus::INVALID_WORK_GROUP_SIZE);
        }
        let args: Option<Vec<SimArg>> = kernel.args.borrow().iter().cloned().collect();
        let args = args.ok_or(RuntimeStatus::INVALID_KERNEL_ARGS)?;
        debug!("sim: kernel '{}' #{} queued on queue #{}", kernel.name, kernel.id, queue.id);
        queue.pending.borrow_mut().push(args);
        Ok(())
    }

    fn finish(&self, queue: &SimQueue) -> Result<(), RuntimeStatus> {
        self.issue(SimCommand::Finish);
        if self.has_fault(&Fault::Finish) {
            return Err(RuntimeStatus::OUT_OF_RESOURCES);
        }
        let pending: Vec<Vec<SimArg>> = queue.pending.borrow_mut().drain(..).collect();
        for args in &pending {
            execute_mmult(args)?;
        }
        Ok(())
    }

    fn release_buffer(&self, buffer: SimBuffer) {
        self.released(ResourceKind::Buffer, buffer.id);
    }

    fn release_kernel(&self, kernel: SimKernel) {
        self.released(ResourceKind::Kernel, kernel.id);
    }

    fn release_program(&self, program: SimProgram) {
        self.released(ResourceKind::Program, program.id);
    }

    fn release_queue(&self, queue: SimQueue) {
        self.released(ResourceKind::Queue, queue.id);
    }

    fn release_context(&self, context: SimContext) {
        self.released(ResourceKind::Context, context.id);
    }
}

/// Run the matrix-multiply kernel on bound arguments.
fn execute_mmult(args: &[SimArg]) -> Result<(), RuntimeStatus> {
    let (a, b, c, a_rows, a_cols, b_cols) = match args {
        [
            SimArg::Buffer(a),
            SimArg::Buffer(b),
            SimArg::Buffer(c),
            SimArg::Int(ar),
            SimArg::Int(ac),
            SimArg::Int(bc),
        ] => (a, b, c, *ar, *ac, *bc),
        _ => return Err(RuntimeStatus::INVALID_KERNEL_ARGS),
    };
    let dim = |v: i32| usize::try_from(v).map_err(|_| RuntimeStatus::INVALID_VALUE);
    let (rows, inner, cols) = (dim(a_rows)?, dim(a_cols)?, dim(b_cols)?);

    // Snapshot inputs first: the output buffer may alias an input.
    let a = a.borrow().clone();
    let b = b.borrow().clone();
    let mut c = c.borrow_mut();
    if a.len() < rows * inner || b.len() < inner * cols || c.len() < rows * cols {
        return Err(RuntimeStatus::OUT_OF_RESOURCES);
    }

    for i in 0..rows {
        for j in 0..cols {
            let mut acc = 0i32;
            for k in 0..inner {
                acc = acc.wrapping_add(a[i * inner + k].wrapping_mul(b[k * cols + j]));
            }
            c[i * cols + j] = acc;
        }
    }
    Ok(())
}
