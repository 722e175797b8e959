//! Host driver for AHCI SATA controllers.
//!
//! Discovers AHCI host bus adapters on the PCI bus, brings every implemented
//! and populated port online and exposes each attached disk as an
//! asynchronous block device: sector reads and writes, cache flush and a
//! synchronous parameter query. Completions are matched back to callers
//! through opaque user tags.
//!
//! The driver is built from two pieces. A [`ctrl::HostAhci`] owns one mapped
//! HBA register window, performs the global bring-up and fans hardware
//! interrupts out to its ports. A [`port::HostAhciPort`] owns one port's
//! hardware-shared memory and implements the command submission/completion
//! protocol on top of it.
//!
//! Everything the driver needs from its environment comes in over narrow
//! interfaces: a PCI accessor, a host-operation bus for mappings and address
//! translation, a clock, and the disk/completion buses (see [`bus`]). The
//! [`setup`] entry point wires it all together, the way a
//! `hostahci:mask,irq` startup parameter would.
//!
//! Register programming follows [Serial ATA AHCI: Specification, Rev. 1.3.1].
//!
//! [Serial ATA AHCI: Specification, Rev. 1.3.1]: http://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/serial-ata-ahci-spec-rev1-3-1.pdf

#![no_std]
// rustc warnings
#![warn(unused)]
#![warn(missing_debug_implementations)]
#![allow(unused_unsafe)]
#![cfg_attr(test, allow(unused_imports))]
// rustdoc warnings
#![warn(missing_docs)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod ata;
pub mod bus;
pub mod ctrl;
pub mod error;
pub mod fis;
pub mod hba;
pub mod io;
pub mod pci;
pub mod port;
pub mod zero_box;

#[cfg(test)]
mod mock;

use alloc::sync::Arc;

use log::{error, info};
use spin::Mutex;

use crate::bus::{Clock, DiskBus, DiskCommitBus, HostIrqBus, HostOp};
use crate::ctrl::HostAhci;
use crate::pci::{PciAccess, CLASS_STORAGE, SUBCLASS_SATA};

/// Startup parameters of the driver, the parsed form of
/// `hostahci:mask,irq`.
#[derive(Debug, Clone, Copy)]
pub struct HostAhciParams {
    /// Inclusion bitmap: bit *n* selects the *n*-th AHCI controller found.
    pub mask: u32,
    /// Interrupt line hint seeding GSI resolution.
    pub irq: u8,
}

impl Default for HostAhciParams {
    /// All controllers, legacy line 0x13.
    fn default() -> HostAhciParams {
        HostAhciParams { mask: !0, irq: 0x13 }
    }
}

/// Provides a host driver for all AHCI controllers.
///
/// Walks the PCI bus for SATA-class devices, skips the ones masked out by
/// `params`, and builds a [`HostAhci`] for each remaining controller: the
/// device is handed to the IOMMU if there is one, its interrupt line is
/// resolved, MSI delivery is switched on where available, and the
/// controller is registered for interrupt-line messages. Disks appear on
/// `bus_disk` as ports come up. Controllers that fail to initialize are
/// logged and skipped; the rest of the system keeps running.
pub fn setup(
    pci: &dyn PciAccess,
    bus_hostop: Arc<dyn HostOp>,
    bus_disk: &mut dyn DiskBus,
    bus_commit: Arc<dyn DiskCommitBus>,
    bus_hostirq: &mut dyn HostIrqBus,
    clock: Arc<dyn Clock>,
    params: HostAhciParams,
) {
    let mut num = 0;
    while let Some(bdf) = pci.search_device(CLASS_STORAGE, SUBCLASS_SATA, num) {
        if num >= 32 || params.mask & (1 << num) == 0 {
            info!("ahci: ignore controller #{} at {:#x}", num, bdf);
            num += 1;
            continue;
        }

        let dmar = bus_hostop.assign_pci(bdf);
        let irqline = pci.get_gsi(bdf, params.irq);
        match HostAhci::new(
            pci,
            bus_hostop.clone(),
            bus_disk,
            bus_commit.clone(),
            clock.clone(),
            bdf,
            irqline,
            dmar,
        ) {
            Ok(ctrl) => {
                info!(
                    "ahci: controller #{} at {:#x} id {:#x}",
                    num,
                    bdf,
                    pci.conf_read(bdf, 0)
                );
                bus_hostirq.add(irqline, Arc::new(Mutex::new(ctrl)));
                if !pci.enable_msi(bdf, irqline) {
                    info!("ahci: MSI not enabled for {:#x}", irqline);
                }
                if !bus_hostop.attach_host_irq(irqline) {
                    error!("ahci: failed to attach host irq {:#x}", irqline);
                }
            }
            Err(e) => {
                error!("ahci: controller #{} at {:#x} initialization failed: {}", num, bdf, e)
            }
        }
        num += 1;
    }
}
