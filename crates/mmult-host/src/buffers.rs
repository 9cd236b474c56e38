//! Device buffer management with explicit memory-bank placement.
//!
//! The three operands are spread over distinct physical memory banks so
//! that the kernel's reads of A and B and its writes of C do not contend
//! for one memory channel. Banks are validated against what the device
//! reports before anything is allocated.
//!
//! Buffers borrow the [`ExecutionContext`] they were allocated from, so
//! the borrow checker guarantees they are released before the context is
//! torn down.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::ExecutionContext;
use crate::error::{HostError, Result};
use crate::matrix::Matrix;
use crate::runtime::{ComputeRuntime, ResourceKind};

/// Physical memory bank on the accelerator card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MemoryBank {
    Bank0,
    Bank1,
    Bank2,
    Bank3,
}

impl MemoryBank {
    pub const ALL: [MemoryBank; 4] =
        [MemoryBank::Bank0, MemoryBank::Bank1, MemoryBank::Bank2, MemoryBank::Bank3];

    /// Zero-based bank index as understood by the platform.
    pub fn index(self) -> u32 {
        match self {
            Self::Bank0 => 0,
            Self::Bank1 => 1,
            Self::Bank2 => 2,
            Self::Bank3 => 3,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

impl TryFrom<u8> for MemoryBank {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        Self::from_index(u32::from(value))
            .ok_or_else(|| format!("memory bank {value} is not one of 0..=3"))
    }
}

impl From<MemoryBank> for u8 {
    fn from(bank: MemoryBank) -> Self {
        bank.index() as u8
    }
}

impl fmt::Display for MemoryBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// The three matrices that live on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    A,
    B,
    C,
}

impl Operand {
    pub const ALL: [Operand; 3] = [Operand::A, Operand::B, Operand::C];
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
        }
    }
}

/// Bank assignment for each operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankPlacement {
    pub a: MemoryBank,
    pub b: MemoryBank,
    pub c: MemoryBank,
}

impl Default for BankPlacement {
    fn default() -> Self {
        Self { a: MemoryBank::Bank0, b: MemoryBank::Bank1, c: MemoryBank::Bank2 }
    }
}

impl BankPlacement {
    pub fn bank_for(&self, operand: Operand) -> MemoryBank {
        match operand {
            Operand::A => self.a,
            Operand::B => self.b,
            Operand::C => self.c,
        }
    }

    /// Every operand must sit in its own bank.
    pub fn ensure_distinct(&self) -> Result<()> {
        if self.a == self.b || self.a == self.c || self.b == self.c {
            return Err(HostError::InvalidConfig(format!(
                "operands must use distinct memory banks, got A={} B={} C={}",
                self.a, self.b, self.c
            )));
        }
        Ok(())
    }

    /// Check each bank against the number of banks the device exposes.
    pub fn ensure_within(&self, available: u32) -> Result<()> {
        for operand in Operand::ALL {
            let bank = self.bank_for(operand);
            if bank.index() >= available {
                return Err(HostError::BankOutOfRange { bank, available });
            }
        }
        Ok(())
    }
}

/// A runtime buffer tagged with its operand, bank and capacity.
#[derive(Debug)]
pub struct DeviceBuffer<B> {
    operand: Operand,
    bank: MemoryBank,
    bytes: usize,
    handle: B,
}

impl<B> DeviceBuffer<B> {
    pub fn operand(&self) -> Operand {
        self.operand
    }

    pub fn bank(&self) -> MemoryBank {
        self.bank
    }

    /// Capacity in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn handle(&self) -> &B {
        &self.handle
    }
}

/// Device buffers for A, B and C, allocated from one execution context.
pub struct DeviceBufferSet<'c, 'r, R: ComputeRuntime> {
    ctx: &'c ExecutionContext<'r, R>,
    elements: usize,
    a: Option<DeviceBuffer<R::Buffer>>,
    b: Option<DeviceBuffer<R::Buffer>>,
    c: Option<DeviceBuffer<R::Buffer>>,
}

impl<'c, 'r, R: ComputeRuntime> DeviceBufferSet<'c, 'r, R> {
    /// Allocate all three buffers, each holding `elements` `i32` values.
    ///
    /// If any allocation fails, buffers already allocated are released
    /// before the error is returned.
    pub fn allocate(
        ctx: &'c ExecutionContext<'r, R>,
        placement: &BankPlacement,
        elements: usize,
    ) -> Result<Self> {
        placement.ensure_distinct()?;
        let runtime = ctx.runtime();
        let available = runtime
            .memory_bank_count(ctx.device())
            .map_err(|status| HostError::RuntimeQuery { query: "memory bank count", status })?;
        placement.ensure_within(available)?;

        let bytes = elements
            .checked_mul(std::mem::size_of::<i32>())
            .ok_or_else(|| HostError::InvalidConfig(format!("{elements} elements overflow")))?;

        let mut set = Self { ctx, elements, a: None, b: None, c: None };
        for operand in Operand::ALL {
            let bank = placement.bank_for(operand);
            let handle = runtime
                .create_buffer(ctx.context()?, bank, bytes)
                .map_err(|status| HostError::BufferAllocError { operand, bank, bytes, status })?;
            debug!("allocated buffer {operand}: {bytes} bytes in bank {bank}");
            *set.slot_mut(operand) = Some(DeviceBuffer { operand, bank, bytes, handle });
        }
        info!("device buffers allocated ({} bytes each)", bytes);
        Ok(set)
    }

    /// Element capacity of each buffer.
    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn buffer(&self, operand: Operand) -> Option<&DeviceBuffer<R::Buffer>> {
        match operand {
            Operand::A => self.a.as_ref(),
            Operand::B => self.b.as_ref(),
            Operand::C => self.c.as_ref(),
        }
    }

    fn slot_mut(&mut self, operand: Operand) -> &mut Option<DeviceBuffer<R::Buffer>> {
        match operand {
            Operand::A => &mut self.a,
            Operand::B => &mut self.b,
            Operand::C => &mut self.c,
        }
    }

    pub(crate) fn handle(&self, operand: Operand) -> Result<&R::Buffer> {
        self.buffer(operand)
            .map(DeviceBuffer::handle)
            .ok_or(HostError::Released { kind: ResourceKind::Buffer })
    }

    /// Blocking upload of both operands. Each write is checked on its own
    /// so a failure names the operand that did not transfer.
    pub fn write_operands(&mut self, a: &Matrix, b: &Matrix) -> Result<()> {
        self.write(Operand::A, a)?;
        self.write(Operand::B, b)?;
        debug!("operands A and B written to device");
        Ok(())
    }

    fn write(&mut self, operand: Operand, host: &Matrix) -> Result<()> {
        if host.len() != self.elements {
            return Err(HostError::DimensionMismatch {
                expected: self.elements,
                actual: host.len(),
            });
        }
        let ctx = self.ctx;
        let queue = ctx.queue()?;
        let buffer = self
            .slot_mut(operand)
            .as_mut()
            .ok_or(HostError::Released { kind: ResourceKind::Buffer })?;
        ctx.runtime()
            .write_buffer(queue, &mut buffer.handle, host.as_slice())
            .map_err(|status| HostError::TransferError { operand, status })
    }

    /// Blocking download of C into `out`, followed by a wait on the read's
    /// completion event.
    ///
    /// Callers must have drained the queue after dispatch first.
    pub fn read_result(&self, out: &mut Matrix) -> Result<()> {
        if out.len() != self.elements {
            return Err(HostError::DimensionMismatch { expected: self.elements, actual: out.len() });
        }
        let runtime = self.ctx.runtime();
        let event = runtime
            .read_buffer(self.ctx.queue()?, self.handle(Operand::C)?, out.as_mut_slice())
            .map_err(|status| HostError::TransferError { operand: Operand::C, status })?;
        runtime
            .wait_for_event(event)
            .map_err(|status| HostError::TransferError { operand: Operand::C, status })?;
        debug!("result C read back from device");
        Ok(())
    }

    /// Release every buffer still held. Safe to call more than once.
    pub fn release(&mut self) {
        let runtime = self.ctx.runtime();
        for operand in Operand::ALL {
            if let Some(buffer) = self.slot_mut(operand).take() {
                debug!("releasing buffer {operand}");
                runtime.release_buffer(buffer.handle);
            }
        }
    }
}

impl<R: ComputeRuntime> Drop for DeviceBufferSet<'_, '_, R> {
    fn drop(&mut self) {
        self.release();
    }
}
