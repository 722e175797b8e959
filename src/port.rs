//! The per-port command engine.
//!
//! A port owns its hardware-shared memory (command list, command tables,
//! received-FIS area), a rotating command-slot cursor and the bookkeeping
//! that pairs hardware completions back up with caller requests.
//!
//! Submission never blocks: a request is serialized into the slot under the
//! cursor and handed to the hardware through `PxCI`. Completion arrives by
//! interrupt, where every slot that is in progress for us but no longer in
//! `PxCI` gets committed back to the caller under its recorded user tag.
//! Only initialization polls, bounded to 200 ms per wait.

use alloc::sync::Arc;
use core::fmt::{self, Debug, Formatter};
use core::hint::spin_loop;

use bit_field::BitField;
use log::{debug, error, info, warn};

use crate::ata::AtaParams;
use crate::bus::{Clock, DiskCommitBus, DiskOp, DmaDescriptor, DiskStatus, HostOp, MessageDisk,
                 MessageDiskCommit};
use crate::error::AhciError;
use crate::hba::{CmdHeaderArray, CmdHeaderFlags, CmdTable, CmdTableArray, Px, PxIE, PxIS,
                 ReceivedFisArea, MAX_PRD_COUNT, PORT_IRQ_MASK};
use crate::io::Mmio;
use crate::zero_box::ZeroBox;

/// Poll clock granularity in Hz.
const FREQ: u64 = 1000;
/// Register poll timeout, in `FREQ` ticks.
const TIMEOUT: u64 = 200;

/// A single AHCI port with its command list and receive-FIS buffer.
///
/// Supports: read-sectors, write-sectors, flush-cache, identify-drive,
/// set-features. Missing: ATAPI detection.
pub struct HostAhciPort {
    /// The port register block. Mapped once, lives forever.
    regs: &'static Px,
    /// Host services: address translation.
    bus_hostop: Arc<dyn HostOp>,
    /// Where completions are published.
    bus_commit: Arc<dyn DiskCommitBus>,
    /// Time source for bounded register polls.
    clock: Arc<dyn Clock>,
    /// The disk number requests are filtered on.
    disknr: usize,
    /// Usable command slots, `CAP.NCS + 1`.
    max_slots: usize,
    /// True when an IOMMU translates DMA addresses for us.
    dmar: bool,
    /// The command list, one header per slot.
    cl: ZeroBox<CmdHeaderArray>,
    /// The command tables, one per slot.
    ct: ZeroBox<CmdTableArray>,
    /// The received-FIS landing area.
    fis: ZeroBox<ReceivedFisArea>,
    /// Next candidate slot.
    tag: usize,
    /// Identify data of the attached drive.
    params: AtaParams,
    /// Caller tag per outstanding slot. Only meaningful under `inprogress`.
    usertags: [u64; 32],
    /// Slots whose completion has not been reported yet.
    inprogress: u32,
}

impl HostAhciPort {
    /// Creates the engine and allocates its hardware-shared memory.
    ///
    /// The port is not usable before [`HostAhciPort::init`] ran.
    pub(crate) fn new(
        regs: &'static Px,
        bus_hostop: Arc<dyn HostOp>,
        bus_commit: Arc<dyn DiskCommitBus>,
        clock: Arc<dyn Clock>,
        disknr: usize,
        max_slots: usize,
        dmar: bool,
    ) -> HostAhciPort {
        let cl = ZeroBox::<CmdHeaderArray>::new_zeroed();
        let ct = ZeroBox::<CmdTableArray>::new_zeroed();
        let fis = ZeroBox::<ReceivedFisArea>::new_zeroed();
        debug!("ahci: disk {:#x} cl {:p} ct {:p} fis {:p}", disknr, &*cl, &*ct, &*fis);
        HostAhciPort {
            regs,
            bus_hostop,
            bus_commit,
            clock,
            disknr,
            max_slots,
            dmar,
            cl,
            ct,
            fis,
            tag: 0,
            params: AtaParams::new(),
            usertags: [!0; 32],
            inprogress: 0,
        }
    }

    /// Polls `reg` until `(reg & mask) == value`, bounded to 200 ms at 1 kHz
    /// granularity, pausing the CPU between reads.
    fn wait_timeout<T>(&self, reg: &Mmio<T>, mask: u32, value: u32) -> Result<(), AhciError>
    where
        T: Copy + Into<u32>,
    {
        let timeout = self.clock.clock(FREQ) + TIMEOUT;

        let mut raw: u32 = reg.read().into();
        while (raw & mask) != value && self.clock.clock(FREQ) < timeout {
            spin_loop();
            raw = reg.read().into();
        }
        if (raw & mask) != value {
            return Err(AhciError::Timeout);
        }
        Ok(())
    }

    /// Translates a driver-visible address to the device-visible DMA address.
    ///
    /// With an IOMMU in effect the address goes through untouched.
    ///
    /// # Panics
    ///
    /// An address the host cannot resolve is a driver bug: every pointer
    /// that reaches this function refers to memory the driver or its caller
    /// published.
    fn addr2phys(&self, ptr: *const u8) -> u64 {
        if self.dmar {
            return ptr as usize as u64;
        }
        let phys = self.bus_hostop.virt_to_phys(ptr);
        if phys == 0 {
            panic!("ahci: could not resolve physical address {:p}", ptr);
        }
        phys
    }

    /// Writes the command header and command FIS of the slot under the
    /// cursor. PRDs are appended afterwards.
    #[allow(clippy::too_many_arguments)]
    fn set_command(
        &mut self,
        command: u8,
        sector: u64,
        read: bool,
        count: u16,
        atapi: bool,
        pmp: u8,
        features: u16,
    ) {
        let header = &self.cl.slots[self.tag];
        let mut flags = CmdHeaderFlags::from(0);
        // the Register H2D FIS is 5 dwords
        flags.set_cfl(5);
        flags.set_w(!read);
        flags.set_a(atapi);
        flags.set_pmp(u16::from(pmp));
        header.flags.write(flags);
        header.prdtl.write(0);
        header.prdbc.write(0);

        let table = &self.ct.tables[self.tag];
        let phys = self.addr2phys(table as *const CmdTable as *const u8);
        header.ctba.write(phys as u32);
        header.ctbau.write(0);

        table.cfis.setup_command(pmp, command, features, sector, count);
    }

    /// Appends one physical region to the slot under the cursor.
    ///
    /// Rejects odd or zero byte counts, counts of 4 MiB or more, and more
    /// than [`MAX_PRD_COUNT`] regions per slot.
    fn add_dma(&mut self, ptr: *const u8, count: u32) -> Result<(), AhciError> {
        if count == 0 || count & 1 != 0 || count >> 22 != 0 {
            return Err(AhciError::InvalidArg);
        }
        let header = &self.cl.slots[self.tag];
        let prd = header.prdtl.read() as usize;
        if prd >= MAX_PRD_COUNT {
            return Err(AhciError::BufferTooScattered);
        }
        header.prdtl.write(prd as u16 + 1);

        let entry = &self.ct.tables[self.tag].prdt[prd];
        let phys = self.addr2phys(ptr);
        entry.dba.write(phys as u32);
        entry.dbau.write(0);
        entry.dbc.write(count - 1);
        Ok(())
    }

    /// PRD append for driver-generated transfers. The constraints hold by
    /// construction there, so violations are bugs, not request errors.
    fn add_prd(&mut self, ptr: *const u8, count: u32) -> Result<(), AhciError> {
        assert_eq!(count & 1, 0, "odd PRD byte count");
        assert_eq!(count >> 22, 0, "PRD byte count of 4 MiB or more");
        self.add_dma(ptr, count)
    }

    /// Hands the slot under the cursor to the hardware.
    ///
    /// The slot is marked in progress and the caller tag recorded *before*
    /// `PxCI` is written: a completion interrupt may preempt us right after
    /// the register write and must already see the slot as ours.
    fn start_command(&mut self, usertag: u64) -> usize {
        let tag = self.tag;
        self.usertags[tag] = usertag;
        self.inprogress.set_bit(tag, true);

        self.regs.ci.write(1 << tag);
        self.tag = (tag + 1) % self.max_slots;
        tag
    }

    /// Sends IDENTIFY DEVICE and parses the reply in `buffer`.
    ///
    /// This is a PIO data-in command: no completion interrupt fires, so the
    /// slot is polled out of `PxCI` instead.
    fn identify_drive(&mut self, buffer: &mut [u16; 256]) -> Result<(), AhciError> {
        for w in buffer.iter_mut() {
            *w = 0;
        }
        self.set_command(0xEC, 0, true, 0, false, 0, 0);
        self.add_prd(buffer.as_ptr() as *const u8, 512)?;
        let tag = self.start_command(0);

        let waited = self.wait_timeout(&self.regs.ci, 1 << tag, 0);
        self.inprogress.set_bit(tag, false);
        waited?;

        if buffer[2] != 0xC837 {
            warn!(
                "ahci: disk {:#x} wants a spin-up first (word 2 {:#x}), skipping it",
                self.disknr, buffer[2]
            );
            return Err(AhciError::NeedsSpinup);
        }
        self.params.update_params(buffer);
        info!(
            "ahci: disk {:#x} has {:#x} sectors (lba48: {})",
            self.disknr,
            self.params.sectors(),
            self.params.lba48
        );
        Ok(())
    }

    /// Sends SET FEATURES, a PIO non-data command, polled like IDENTIFY.
    pub fn set_features(&mut self, features: u16, count: u16) -> Result<(), AhciError> {
        self.set_command(0xEF, 0, false, count, false, 0, features);
        let tag = self.start_command(0);

        let waited = self.wait_timeout(&self.regs.ci, 1 << tag, 0);
        self.inprogress.set_bit(tag, false);
        waited
    }

    /// Brings the port from an arbitrary state into the running state.
    ///
    /// Follows the stop/start discipline of the AHCI specification
    /// (sections 10.1.2 and 10.3): quiesce, program the memory bases,
    /// clear stale error/interrupt state, restart FIS receive and command
    /// processing, then identify the drive through `buffer`.
    pub(crate) fn init(&mut self, buffer: &mut [u16; 256]) -> Result<(), AhciError> {
        let px = self.regs;

        // ST, CLO, FR or CR still set: quiesce first
        if u32::from(px.cmd.read()) & 0xC009 != 0 {
            // stop processing by clearing ST
            let mut cmd = px.cmd.read();
            cmd.set_st(false);
            px.cmd.write(cmd);
            self.wait_timeout(&px.cmd, 1 << 15, 0)?;

            // stop FIS receiving and wait until nothing is received anymore
            let mut cmd = px.cmd.read();
            cmd.set_fre(false);
            px.cmd.write(cmd);
            self.wait_timeout(&px.cmd, 1 << 14, 0)?;
        }

        // publish the command list and the received-FIS area
        let clb = self.addr2phys(&*self.cl as *const CmdHeaderArray as *const u8);
        px.clb.write(clb as u32);
        px.clbu.write(0);
        let fb = self.addr2phys(&*self.fis as *const ReceivedFisArea as *const u8);
        px.fb.write(fb as u32);
        px.fbu.write(0);

        // drop stale error and interrupt state
        px.serr.write(!0u32);
        px.is.write(PxIS::from(!0u32));

        // enable FIS processing; CR goes through a mandated transient
        let mut cmd = px.cmd.read();
        cmd.set_fre(true);
        px.cmd.write(cmd);
        self.wait_timeout(&px.cmd, 1 << 15, 0)?;

        // force a clean task file, then restart command processing
        let mut cmd = px.cmd.read();
        cmd.set_clo(true);
        px.cmd.write(cmd);
        self.wait_timeout(&px.cmd, 1 << 3, 0)?;
        let mut cmd = px.cmd.read();
        cmd.set_st(true);
        px.cmd.write(cmd);

        // nothing in progress anymore
        self.inprogress = 0;

        px.ie.write(PxIE::from(PORT_IRQ_MASK));
        self.identify_drive(buffer)
    }

    /// Serves one interrupt of this port.
    ///
    /// Every slot that is in progress for us but no longer in `PxCI` is a
    /// completion; each one is committed under its recorded user tag,
    /// lowest slot first. A set task-file error bit afterwards means the
    /// drive failed a command: the only recovery is a full reinit, which
    /// drops whatever was still in flight.
    pub fn irq(&mut self) {
        let px = self.regs;
        let is = px.is.read();
        // clear interrupt status
        px.is.write(is);

        let mut done = self.inprogress & !px.ci.read();
        while done != 0 {
            let tag = done.trailing_zeros() as usize;
            self.bus_commit.send(MessageDiskCommit {
                disknr: self.disknr,
                usertag: self.usertags[tag],
                status: DiskStatus::Ok,
            });
            self.usertags[tag] = !0;
            self.inprogress.set_bit(tag, false);
            done.set_bit(tag, false);
        }

        if px.tfd.read().err_flag() {
            error!(
                "ahci: disk {:#x} command failed, tfd {:#x}, fis error {:#x}",
                self.disknr,
                u32::from(px.tfd.read()),
                self.fis.rfis().error.read()
            );
            for tag in 0..32 {
                if self.inprogress.get_bit(tag) {
                    warn!(
                        "ahci: disk {:#x} drops in-flight tag {:#x} (usertag {:#x})",
                        self.disknr, tag, self.usertags[tag]
                    );
                }
            }
            let mut buffer = [0u16; 256];
            if let Err(e) = self.init(&mut buffer) {
                error!("ahci: disk {:#x} reinit failed: {}", self.disknr, e);
            }
        }
    }

    /// Serves one disk request. Returns false when the request is not for
    /// this disk or had to be refused; no slot is consumed in either case.
    pub fn receive(&mut self, msg: &mut MessageDisk<'_>) -> bool {
        if msg.disknr != self.disknr {
            return false;
        }

        match &mut msg.op {
            DiskOp::Read { sector, dma } => {
                self.read_write(*sector, dma, false, msg.physoffset, msg.physsize, msg.usertag)
            }
            DiskOp::Write { sector, dma } => {
                self.read_write(*sector, dma, true, msg.physoffset, msg.physsize, msg.usertag)
            }
            DiskOp::FlushCache => {
                let command = if self.params.lba48 { 0xEA } else { 0xE7 };
                self.set_command(command, 0, true, 0, false, 0, 0);
                self.start_command(msg.usertag);
                true
            }
            DiskOp::GetParams(params) => {
                self.params.get_disk_parameter(params);
                true
            }
        }
    }

    /// Serializes a sector read or write into the slot under the cursor.
    fn read_write(
        &mut self,
        sector: u64,
        dma: &[DmaDescriptor],
        write: bool,
        physoffset: usize,
        physsize: u64,
        usertag: u64,
    ) -> bool {
        let length: u64 = dma.iter().map(|d| u64::from(d.bytecount)).sum();
        // whole sectors only
        if length & 0x1FF != 0 {
            return false;
        }

        let command = match (write, self.params.lba48) {
            (false, false) => 0xC8,
            (false, true) => 0x25,
            (true, false) => 0xCA,
            (true, true) => 0x35,
        };
        self.set_command(command, sector, !write, (length >> 9) as u16, false, 0, 0);

        for d in dma {
            let end = match d.byteoffset.checked_add(u64::from(d.bytecount)) {
                Some(end) => end,
                None => return false,
            };
            if end > physsize {
                return false;
            }
            let ptr = (physoffset as u64 + d.byteoffset) as usize as *const u8;
            if self.add_dma(ptr, d.bytecount).is_err() {
                return false;
            }
        }
        self.start_command(usertag);
        true
    }

}

impl Debug for HostAhciPort {
    /// Debug reads the live registers next to the engine state.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAhciPort")
            .field("disknr", &self.disknr)
            .field("tag", &self.tag)
            .field("inprogress", &format_args!("{:#x}", self.inprogress))
            .field("is", &self.regs.is)
            .field("ci", &self.regs.ci)
            .field("ie", &self.regs.ie)
            .field("cmd", &self.regs.cmd)
            .field("tfd", &self.regs.tfd)
            .finish()
    }
}
