//! Messages and buses connecting the driver to the surrounding system.
//!
//! The driver lives on four buses. Disk requests come in through
//! [`crate::port::HostAhciPort::receive`] and completions go out through
//! [`DiskCommitBus`]. Host services (IO memory mapping, address translation,
//! IOMMU assignment, interrupt routing) are reached through [`HostOp`].
//! Interrupt-line assertions come in through
//! [`crate::ctrl::HostAhci::receive`] after the controller registered
//! itself on the [`HostIrqBus`].

use alloc::sync::Arc;
use core::ptr::NonNull;

use spin::Mutex;

use crate::ata::DiskParameter;
use crate::ctrl::HostAhci;
use crate::port::HostAhciPort;

/// One scatter/gather element of a disk request.
///
/// Offsets are relative to the caller's published DMA region.
#[derive(Debug, Clone, Copy)]
pub struct DmaDescriptor {
    /// Byte offset of this element inside the published region.
    pub byteoffset: u64,
    /// Length of this element in bytes.
    pub bytecount: u32,
}

/// The operation a disk request asks for.
#[derive(Debug)]
pub enum DiskOp<'a> {
    /// Read whole sectors into the caller's DMA elements.
    Read {
        /// First sector to read.
        sector: u64,
        /// Scatter list receiving the data.
        dma: &'a [DmaDescriptor],
    },
    /// Write whole sectors from the caller's DMA elements.
    Write {
        /// First sector to write.
        sector: u64,
        /// Scatter list supplying the data.
        dma: &'a [DmaDescriptor],
    },
    /// Flush the drive's write cache.
    FlushCache,
    /// Synchronously snapshot the disk parameters. No hardware involved.
    GetParams(&'a mut DiskParameter),
}

/// A disk request message.
#[derive(Debug)]
pub struct MessageDisk<'a> {
    /// The disk this request addresses; ports filter on it.
    pub disknr: usize,
    /// Opaque caller identifier, echoed on the completion bus.
    pub usertag: u64,
    /// Driver-visible base of the caller's published DMA region.
    pub physoffset: usize,
    /// Size of the published region in bytes.
    pub physsize: u64,
    /// The requested operation.
    pub op: DiskOp<'a>,
}

/// Outcome of a disk request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    /// The command completed.
    Ok,
    /// The command was lost to a drive error.
    Error,
}

/// A completion published on the [`DiskCommitBus`].
#[derive(Debug, Clone, Copy)]
pub struct MessageDiskCommit {
    /// The disk the completed request addressed.
    pub disknr: usize,
    /// The caller identifier recorded at submission.
    pub usertag: u64,
    /// Outcome.
    pub status: DiskStatus,
}

/// Kind of an interrupt-line message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqType {
    /// The line was asserted.
    Assert,
    /// The line was deasserted. Ignored by this driver.
    Deassert,
}

/// An interrupt-line message. Controllers match on `line`.
#[derive(Debug, Clone, Copy)]
pub struct MessageIrq {
    /// The interrupt line this message reports on.
    pub line: u32,
    /// What happened on the line.
    pub irq_type: IrqType,
}

/// The driver's time source.
pub trait Clock {
    /// Current time in `freq`-Hz ticks.
    fn clock(&self, freq: u64) -> u64;
}

/// Host operations the driver depends on.
pub trait HostOp {
    /// Maps `size` bytes of IO memory at physical `phys` into driver-visible
    /// memory.
    fn alloc_iomem(&self, phys: u64, size: usize) -> Option<NonNull<u8>>;

    /// Translates a driver-visible address to a physical address.
    ///
    /// Returns 0 on failure. Only consulted when no IOMMU pre-translates
    /// DMA addresses.
    fn virt_to_phys(&self, virt: *const u8) -> u64;

    /// Hands the device at `bdf` to the IOMMU.
    ///
    /// A `true` reply means DMA addresses are translated by hardware and the
    /// driver must pass caller pointers through untouched.
    fn assign_pci(&self, bdf: u32) -> bool;

    /// Routes the interrupt line to this driver.
    fn attach_host_irq(&self, line: u32) -> bool;
}

/// The completion bus: one message per hardware-completed slot.
pub trait DiskCommitBus {
    /// Publishes a completion.
    fn send(&self, msg: MessageDiskCommit);
}

/// The disk registry: hands out disk numbers and takes ownership shares of
/// initialized ports.
pub trait DiskBus {
    /// Number of disks registered so far; the next disk gets this number.
    fn count(&self) -> usize;

    /// Registers an initialized port as disk `disknr`.
    fn add(&mut self, disknr: usize, disk: Arc<Mutex<HostAhciPort>>);
}

/// The interrupt dispatch registry.
pub trait HostIrqBus {
    /// Registers a controller interested in assertions of `line`.
    fn add(&mut self, line: u32, ctrl: Arc<Mutex<HostAhci>>);
}
