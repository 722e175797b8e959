//! The AHCI controller.
//!
//! One [`HostAhci`] per HBA found on the PCI bus. Construction maps the
//! register window published through `BAR5`, switches the controller to
//! AHCI mode, brings every implemented and populated port online and
//! registers each one as the next disk on the disk bus. At runtime the
//! controller's only job is fanning interrupt-line assertions out to the
//! affected port engines.

use alloc::sync::Arc;
use core::fmt::{self, Debug, Formatter};

use bit_field::BitField;
use log::{error, info};
use spin::Mutex;

use crate::bus::{Clock, DiskBus, DiskCommitBus, HostOp, IrqType, MessageIrq};
use crate::error::AhciError;
use crate::hba::{HbaMemoryRegisters, Px};
use crate::pci::{PciAccess, CFG_BAR5, CFG_COMMAND, CMD_BUS_MASTER, CMD_MEM_SPACE};
use crate::port::HostAhciPort;

/// A simple driver for one AHCI host bus adapter.
pub struct HostAhci {
    /// The device's PCI address, for log messages.
    bdf: u32,
    /// The interrupt line this controller answers to.
    hostirq: u32,
    /// The primary register window: generic block plus ports 0-29.
    regs: &'static HbaMemoryRegisters,
    /// Register blocks of ports 30-31, on the second page.
    regs_high: Option<&'static [Px; 2]>,
    /// Port engines, indexed by port number.
    ports: [Option<Arc<Mutex<HostAhciPort>>>; 32],
}

impl HostAhci {
    /// Discovers and initializes one controller.
    ///
    /// `dmar` tells the ports whether an IOMMU already translates DMA
    /// addresses. Every successfully initialized port is registered on
    /// `bus_disk` under the next free disk number; ports that fail are
    /// logged and skipped. A controller-level failure abandons the whole
    /// device.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pci: &dyn PciAccess,
        bus_hostop: Arc<dyn HostOp>,
        bus_disk: &mut dyn DiskBus,
        bus_commit: Arc<dyn DiskCommitBus>,
        clock: Arc<dyn Clock>,
        bdf: u32,
        hostirq: u32,
        dmar: bool,
    ) -> Result<HostAhci, AhciError> {
        // we need mem-decode and busmaster dma
        if pci.conf_read(bdf, CFG_COMMAND) & (CMD_MEM_SPACE | CMD_BUS_MASTER)
            != (CMD_MEM_SPACE | CMD_BUS_MASTER)
        {
            return Err(AhciError::BadPciCommand);
        }
        // and a 32-bit memory bar
        let bar = pci.conf_read(bdf, CFG_BAR5);
        if bar & 0x7 != 0 {
            return Err(AhciError::BadBar);
        }

        let regs: &'static HbaMemoryRegisters = match bus_hostop.alloc_iomem(u64::from(bar), 0x1000)
        {
            Some(ptr) => unsafe { &*(ptr.as_ptr() as *const HbaMemoryRegisters) },
            None => {
                error!("ahci: {:#x} could not map the HBA registers", bdf);
                return Err(AhciError::MapFailed);
            }
        };
        let ghc = &regs.generic_host_control;

        // ports 30-31 live on the next page
        let mut regs_high = None;
        if ghc.pi.read() >> 30 != 0 {
            match bus_hostop.alloc_iomem(u64::from(bar) + 0x1000, 0x1000) {
                Some(ptr) => {
                    // the high page is not necessarily port-block aligned
                    let high = unsafe { ptr.as_ptr().add(bar as usize & 0xFE0) };
                    regs_high = Some(unsafe { &*(high as *const [Px; 2]) });
                }
                None => {
                    error!("ahci: {:#x} could not map the high HBA registers", bdf);
                    return Err(AhciError::MapFailed);
                }
            }
        }

        // announce AHCI awareness
        let mut g = ghc.ghc.read();
        g.set_ae(true);
        ghc.ghc.write(g);

        info!(
            "ahci: cap {:#x} cap2 {:#x} global {:#x} ports {:#x} version {:#x} bohc {:#x}",
            u32::from(ghc.cap.read()),
            ghc.cap2.read(),
            u32::from(ghc.ghc.read()),
            ghc.pi.read(),
            ghc.vs.read(),
            ghc.bohc.read()
        );
        if ghc.bohc.read() != 0 {
            return Err(AhciError::BiosHandoff);
        }

        let max_slots = ghc.cap.read().ncs() as usize + 1;
        let mut ctrl = HostAhci { bdf, hostirq, regs, regs_high, ports: Default::default() };

        for nr in 0..30 {
            let portreg = &regs.ports[nr];
            ctrl.create_ahci_port(nr, portreg, &bus_hostop, bus_disk, &bus_commit, &clock,
                                  max_slots, dmar);
        }
        if let Some(high) = ctrl.regs_high {
            for nr in 30..32 {
                ctrl.create_ahci_port(nr, &high[nr - 30], &bus_hostop, bus_disk, &bus_commit,
                                      &clock, max_slots, dmar);
            }
        }

        // acknowledge everything that fired during bring-up, then let
        // interrupts through
        ghc.is.write(ghc.pi.read());
        let mut g = ghc.ghc.read();
        g.set_ie(true);
        ghc.ghc.write(g);

        Ok(ctrl)
    }

    /// Builds and initializes one port, if it is implemented and populated.
    #[allow(clippy::too_many_arguments)]
    fn create_ahci_port(
        &mut self,
        nr: usize,
        portreg: &'static Px,
        bus_hostop: &Arc<dyn HostOp>,
        bus_disk: &mut dyn DiskBus,
        bus_commit: &Arc<dyn DiskCommitBus>,
        clock: &Arc<dyn Clock>,
        max_slots: usize,
        dmar: bool,
    ) {
        if !self.regs.generic_host_control.pi.read().get_bit(nr) {
            return;
        }
        // a signature of all-ones means nothing answered on the link
        let sig = portreg.sig.read();
        if sig == !0 {
            return;
        }
        info!("ahci: {:#x} port {:#x} sig {:#x}", self.bdf, nr, sig);

        let disknr = bus_disk.count();
        let mut port = HostAhciPort::new(
            portreg,
            bus_hostop.clone(),
            bus_commit.clone(),
            clock.clone(),
            disknr,
            max_slots,
            dmar,
        );
        let mut buffer = [0u16; 256];
        match port.init(&mut buffer) {
            Ok(()) => {
                let port = Arc::new(Mutex::new(port));
                bus_disk.add(disknr, port.clone());
                self.ports[nr] = Some(port);
            }
            Err(e) => error!("ahci: {:#x} port {:#x} init failed: {}", self.bdf, nr, e),
        }
    }

    /// Serves one interrupt-line message.
    ///
    /// Snapshots the HBA interrupt-pending bitmap, dispatches every flagged
    /// port lowest-first, then acknowledges the snapshot (write-one-to-
    /// clear). Returns false for messages of other lines.
    pub fn receive(&mut self, msg: &MessageIrq) -> bool {
        if msg.line != self.hostirq || msg.irq_type != IrqType::Assert {
            return false;
        }
        let ghc = &self.regs.generic_host_control;
        let is = ghc.is.read();
        let mut pending = is;
        while pending != 0 {
            let nr = pending.trailing_zeros() as usize;
            if let Some(port) = &self.ports[nr] {
                port.lock().irq();
            }
            pending.set_bit(nr, false);
        }
        ghc.is.write(is);
        true
    }
}

impl Debug for HostAhci {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAhci")
            .field("bdf", &format_args!("{:#x}", self.bdf))
            .field("hostirq", &self.hostirq)
            .field("generic_host_control", &self.regs.generic_host_control)
            .finish()
    }
}
