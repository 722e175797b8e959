//! Mocked collaborators and a register+DMA HBA emulator for the tests.
//!
//! The emulator is driven explicitly: nothing traps the driver's register
//! stores, so hardware behavior is applied lazily by [`HbaEmulator::step`].
//! The mock clock steps the emulator once per tick, which covers every
//! polled wait; outside of waits, tests call `step()` after each driver
//! action so the shadow state stays in sync with the memory cells (`PxCI`
//! in particular is a plain store from the driver's side, so two issues
//! without a step in between would clobber each other).
//!
//! Write-one-to-clear cells (`IS`, `SERR`) keep a shadow of pending bits
//! plus the last value the emulator itself stored; a memory value that
//! differs from that must have been written by the driver and clears the
//! bits it carries.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::Arc;
use std::vec;
use std::vec::Vec;

use core::ptr::NonNull;

use spin::Mutex;

use crate::bus::{DiskBus, DiskCommitBus, Clock, HostIrqBus, HostOp, MessageDiskCommit};
use crate::ctrl::HostAhci;
use crate::fis::FisRegH2D;
use crate::pci::{PciAccess, CLASS_STORAGE, SUBCLASS_SATA};
use crate::port::HostAhciPort;

/// The port most tests talk to.
pub const PORT0: usize = 0;

/// Span assigned to each lazily discovered virtual region.
const AUTO_SPAN: usize = 0x20000;

/// Byte offset of port `nr`'s register block inside the window.
pub fn port_base(nr: usize) -> usize {
    0x100 + nr * 0x80
}

/// Allocates a zeroed two-page register window, page aligned. Leaked for
/// the lifetime of the test process, like a real MMIO mapping would be.
pub fn alloc_window() -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align(0x2000, 0x1000).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null());
    ptr
}

unsafe fn write32(window: *mut u8, off: usize, v: u32) {
    (window.add(off) as *mut u32).write_volatile(v)
}

/// Seeds a freshly allocated window: `CAP.NCS`, `PI` and per-port
/// signatures. Implemented ports without an entry in `sigs` answer with
/// the all-ones signature of an empty link.
pub fn window_setup(window: *mut u8, ncs: u32, pi: u32, sigs: &[(usize, u32)]) {
    unsafe {
        write32(window, 0x00, ncs << 8);
        write32(window, 0x0C, pi);
    }
    for nr in 0..32 {
        if pi & (1 << nr) != 0 {
            unsafe { write32(window, port_base(nr) + 0x24, !0) };
        }
    }
    for (nr, sig) in sigs {
        unsafe { write32(window, port_base(*nr) + 0x24, *sig) };
    }
}

/// One contiguous driver-visible region with an assigned bus address.
struct Region {
    virt: usize,
    len: usize,
    phys: u64,
}

/// Host-op bus double: IO-memory windows, a growing virt-to-phys map and
/// call recording.
pub struct MockHostOp {
    regions: RefCell<Vec<Region>>,
    iomem: RefCell<Vec<(u64, *mut u8, usize)>>,
    maps: Cell<usize>,
    next_phys: Cell<u64>,
    /// Reply given to `assign_pci`; true simulates an active IOMMU.
    pub assign_reply: Cell<bool>,
    /// Reply given to `attach_host_irq`.
    pub attach_ok: Cell<bool>,
    assigned: RefCell<Vec<u32>>,
    attached: RefCell<Vec<u32>>,
}

impl MockHostOp {
    pub fn new() -> MockHostOp {
        MockHostOp {
            regions: RefCell::new(Vec::new()),
            iomem: RefCell::new(Vec::new()),
            maps: Cell::new(0),
            next_phys: Cell::new(0x10_0000),
            assign_reply: Cell::new(false),
            attach_ok: Cell::new(true),
            assigned: RefCell::new(Vec::new()),
            attached: RefCell::new(Vec::new()),
        }
    }

    /// Registers a window served by `alloc_iomem`.
    pub fn add_iomem(&self, phys: u64, ptr: *mut u8, size: usize) {
        self.iomem.borrow_mut().push((phys, ptr, size));
    }

    /// Number of successful `alloc_iomem` calls.
    pub fn iomem_maps(&self) -> usize {
        self.maps.get()
    }

    /// Devices handed to `assign_pci` so far.
    pub fn assigned(&self) -> Vec<u32> {
        self.assigned.borrow().clone()
    }

    /// Interrupt lines attached so far.
    pub fn attached(&self) -> Vec<u32> {
        self.attached.borrow().clone()
    }

    /// Resolves a bus address handed out by `virt_to_phys` back to a
    /// driver-visible pointer. This is the emulator's view of DMA.
    pub fn phys_to_virt(&self, phys: u64) -> Option<*mut u8> {
        let regions = self.regions.borrow();
        for r in regions.iter() {
            if phys >= r.phys && phys < r.phys + r.len as u64 {
                return Some((r.virt + (phys - r.phys) as usize) as *mut u8);
            }
        }
        None
    }
}

impl HostOp for MockHostOp {
    fn alloc_iomem(&self, phys: u64, size: usize) -> Option<NonNull<u8>> {
        for (p, ptr, sz) in self.iomem.borrow().iter() {
            if *p == phys && size <= *sz {
                self.maps.set(self.maps.get() + 1);
                return NonNull::new(*ptr);
            }
        }
        None
    }

    fn virt_to_phys(&self, virt: *const u8) -> u64 {
        let v = virt as usize;
        {
            let regions = self.regions.borrow();
            for r in regions.iter() {
                if v >= r.virt && v < r.virt + r.len {
                    return r.phys + (v - r.virt) as u64;
                }
            }
        }
        // first sighting: hand out the next span
        let phys = self.next_phys.get();
        self.next_phys.set(phys + AUTO_SPAN as u64);
        self.regions.borrow_mut().push(Region { virt: v, len: AUTO_SPAN, phys });
        phys
    }

    fn assign_pci(&self, bdf: u32) -> bool {
        self.assigned.borrow_mut().push(bdf);
        self.assign_reply.get()
    }

    fn attach_host_irq(&self, line: u32) -> bool {
        self.attached.borrow_mut().push(line);
        self.attach_ok.get()
    }
}

/// A 1 kHz clock advancing one tick per query, stepping the emulator so
/// polled waits observe hardware progress.
pub struct MockClock {
    ticks: Cell<u64>,
    emu: RefCell<Option<Arc<HbaEmulator>>>,
}

impl MockClock {
    pub fn new() -> MockClock {
        MockClock { ticks: Cell::new(0), emu: RefCell::new(None) }
    }

    pub fn attach(&self, emu: Arc<HbaEmulator>) {
        *self.emu.borrow_mut() = Some(emu);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }
}

impl Clock for MockClock {
    fn clock(&self, _freq: u64) -> u64 {
        let t = self.ticks.get() + 1;
        self.ticks.set(t);
        if let Some(emu) = &*self.emu.borrow() {
            emu.step();
        }
        t
    }
}

/// Completion bus double: records everything.
pub struct MockCommitBus {
    msgs: RefCell<Vec<MessageDiskCommit>>,
}

impl MockCommitBus {
    pub fn new() -> MockCommitBus {
        MockCommitBus { msgs: RefCell::new(Vec::new()) }
    }

    /// Drains the recorded completions.
    pub fn take(&self) -> Vec<MessageDiskCommit> {
        core::mem::replace(&mut *self.msgs.borrow_mut(), Vec::new())
    }
}

impl DiskCommitBus for MockCommitBus {
    fn send(&self, msg: MessageDiskCommit) {
        self.msgs.borrow_mut().push(msg);
    }
}

/// Disk bus double.
pub struct MockDiskBus {
    pub disks: Vec<(usize, Arc<Mutex<HostAhciPort>>)>,
}

impl MockDiskBus {
    pub fn new() -> MockDiskBus {
        MockDiskBus { disks: Vec::new() }
    }
}

impl DiskBus for MockDiskBus {
    fn count(&self) -> usize {
        self.disks.len()
    }

    fn add(&mut self, disknr: usize, disk: Arc<Mutex<HostAhciPort>>) {
        self.disks.push((disknr, disk));
    }
}

/// Host-IRQ bus double.
pub struct MockIrqBus {
    pub ctrls: Vec<(u32, Arc<Mutex<HostAhci>>)>,
}

impl MockIrqBus {
    pub fn new() -> MockIrqBus {
        MockIrqBus { ctrls: Vec::new() }
    }
}

impl HostIrqBus for MockIrqBus {
    fn add(&mut self, line: u32, ctrl: Arc<Mutex<HostAhci>>) {
        self.ctrls.push((line, ctrl));
    }
}

/// PCI accessor double with a sparse configuration space.
pub struct MockPci {
    regs: RefCell<HashMap<(u32, u16), u32>>,
    devices: Vec<u32>,
    /// `enable_msi` calls, as `(bdf, gsi)`.
    pub msi: RefCell<Vec<(u32, u32)>>,
    /// `get_gsi` calls, as `(bdf, hint)`.
    pub gsi_calls: RefCell<Vec<(u32, u8)>>,
}

impl MockPci {
    pub fn new(devices: Vec<u32>) -> MockPci {
        MockPci {
            regs: RefCell::new(HashMap::new()),
            devices,
            msi: RefCell::new(Vec::new()),
            gsi_calls: RefCell::new(Vec::new()),
        }
    }

    pub fn set_reg(&self, bdf: u32, offset: u16, value: u32) {
        self.regs.borrow_mut().insert((bdf, offset), value);
    }
}

impl PciAccess for MockPci {
    fn conf_read(&self, bdf: u32, offset: u16) -> u32 {
        *self.regs.borrow().get(&(bdf, offset)).unwrap_or(&0)
    }

    fn conf_write(&self, bdf: u32, offset: u16, value: u32) {
        self.set_reg(bdf, offset, value);
    }

    fn search_device(&self, class: u8, subclass: u8, index: usize) -> Option<u32> {
        if class != CLASS_STORAGE || subclass != SUBCLASS_SATA {
            return None;
        }
        self.devices.get(index).copied()
    }

    fn get_gsi(&self, bdf: u32, hint: u8) -> u32 {
        self.gsi_calls.borrow_mut().push((bdf, hint));
        u32::from(hint)
    }

    fn enable_msi(&self, bdf: u32, gsi: u32) -> bool {
        self.msi.borrow_mut().push((bdf, gsi));
        true
    }
}

/// The last command a drive executed, as decoded from the command table.
#[derive(Debug, Clone, Copy)]
pub struct LastCmd {
    pub cmd: u8,
    pub lba: u64,
    pub count: u16,
    pub features: u16,
    pub pmp: u8,
    pub write: bool,
}

/// A write-one-to-clear register cell with a pending-bit shadow.
struct Rw1c {
    pending: Cell<u32>,
    last_written: Cell<u32>,
}

impl Rw1c {
    fn new() -> Rw1c {
        Rw1c { pending: Cell::new(0), last_written: Cell::new(0) }
    }

    /// Applies a driver write, recognized by the memory value differing
    /// from what the emulator stored last.
    fn reconcile(&self, mem: u32) {
        if mem != self.last_written.get() {
            self.pending.set(self.pending.get() & !mem);
        }
    }

    fn add(&self, bits: u32) {
        self.pending.set(self.pending.get() | bits);
    }

    fn flush(&self) -> u32 {
        let p = self.pending.get();
        self.last_written.set(p);
        p
    }
}

/// A behavioral model of one HBA with identical drives on every
/// implemented port.
pub struct HbaEmulator {
    window: *mut u8,
    hostop: Arc<MockHostOp>,
    /// Backing store shared by all emulated drives.
    pub disk: RefCell<Vec<u8>>,
    /// The identify block served on command 0xEC.
    pub identify: RefCell<[u16; 256]>,
    /// When false, issued commands stay pending until [`HbaEmulator::complete`].
    pub auto_complete: Cell<bool>,
    /// The most recently executed command.
    pub last_cmd: Cell<Option<LastCmd>>,
    /// The PRD list of the most recently executed command, `(phys, dbc)`.
    pub last_prds: RefCell<Vec<(u64, u32)>>,
    active_ci: Vec<Cell<u32>>,
    port_is: Vec<Rw1c>,
    port_serr: Vec<Rw1c>,
    hba_is: Rw1c,
}

impl HbaEmulator {
    pub fn new(window: *mut u8, hostop: Arc<MockHostOp>) -> Arc<HbaEmulator> {
        let emu = Arc::new(HbaEmulator {
            window,
            hostop,
            disk: RefCell::new(vec![0u8; 0x10_0000]),
            identify: RefCell::new([0u16; 256]),
            auto_complete: Cell::new(true),
            last_cmd: Cell::new(None),
            last_prds: RefCell::new(Vec::new()),
            active_ci: (0..32).map(|_| Cell::new(0)).collect(),
            port_is: (0..32).map(|_| Rw1c::new()).collect(),
            port_serr: (0..32).map(|_| Rw1c::new()).collect(),
            hba_is: Rw1c::new(),
        });
        emu.set_identify(0x10000, false);
        emu
    }

    /// Reads a 32-bit register at byte offset `off` inside the window.
    pub fn reg(&self, off: usize) -> u32 {
        unsafe { (self.window.add(off) as *const u32).read_volatile() }
    }

    /// Stores a 32-bit register at byte offset `off` inside the window.
    pub fn set_reg(&self, off: usize, v: u32) {
        unsafe { (self.window.add(off) as *mut u32).write_volatile(v) }
    }

    /// Rebuilds the identify block for a drive of `sectors` sectors.
    pub fn set_identify(&self, sectors: u64, lba48: bool) {
        let mut id = [0u16; 256];
        id[2] = 0xC837;
        if lba48 {
            id[83] = 0x4000 | 1 << 10;
            id[100] = sectors as u16;
            id[101] = (sectors >> 16) as u16;
            id[102] = (sectors >> 32) as u16;
            id[103] = (sectors >> 48) as u16;
        } else {
            id[83] = 0x4000;
            id[60] = sectors as u16;
            id[61] = (sectors >> 16) as u16;
        }
        let model = b"HOSTAHCI EMULATED DISK                  ";
        for (i, pair) in model.chunks(2).enumerate() {
            id[27 + i] = u16::from_be_bytes([pair[0], pair[1]]);
        }
        let serial = b"00000000001234567890";
        for (i, pair) in serial.chunks(2).enumerate() {
            id[10 + i] = u16::from_be_bytes([pair[0], pair[1]]);
        }
        *self.identify.borrow_mut() = id;
    }

    /// Applies one round of hardware behavior to every implemented port.
    pub fn step(&self) {
        self.hba_is.reconcile(self.reg(0x08));
        let pi = self.reg(0x0C);
        for nr in 0..32 {
            if pi & (1 << nr) != 0 {
                self.step_port(nr);
            }
        }
        self.set_reg(0x08, self.hba_is.flush());
    }

    fn step_port(&self, nr: usize) {
        let base = port_base(nr);
        self.port_is[nr].reconcile(self.reg(base + 0x10));
        self.port_serr[nr].reconcile(self.reg(base + 0x30));

        // CR tracks ST, FR tracks FRE, CLO self-clears
        let mut cmd = self.reg(base + 0x18);
        if cmd & 0x1 != 0 {
            cmd |= 1 << 15;
        } else {
            cmd &= !(1 << 15);
        }
        if cmd & 0x10 != 0 {
            cmd |= 1 << 14;
        } else {
            cmd &= !(1 << 14);
        }
        if cmd & 0x8 != 0 {
            cmd &= !0x8;
        }
        self.set_reg(base + 0x18, cmd);

        if cmd & 0x1 == 0 {
            // a stopped port forgets its issued commands
            self.active_ci[nr].set(0);
            self.set_reg(base + 0x38, 0);
        } else {
            let mut active = self.active_ci[nr].get() | self.reg(base + 0x38);
            if self.auto_complete.get() {
                let mut pending = active;
                while pending != 0 {
                    let tag = pending.trailing_zeros() as usize;
                    self.execute(nr, tag);
                    active &= !(1 << tag);
                    pending &= !(1 << tag);
                    self.port_is[nr].add(0x1);
                    self.hba_is.add(1 << nr);
                }
            }
            self.active_ci[nr].set(active);
            self.set_reg(base + 0x38, active);
        }

        self.set_reg(base + 0x10, self.port_is[nr].flush());
        self.set_reg(base + 0x30, self.port_serr[nr].flush());
    }

    /// Completes one pending slot out of order.
    pub fn complete(&self, nr: usize, tag: usize) {
        let base = port_base(nr);
        assert!(self.active_ci[nr].get() & (1 << tag) != 0, "slot {} is not pending", tag);
        self.execute(nr, tag);
        let active = self.active_ci[nr].get() & !(1 << tag);
        self.active_ci[nr].set(active);
        self.set_reg(base + 0x38, active);
        self.port_is[nr].add(0x1);
        self.set_reg(base + 0x10, self.port_is[nr].flush());
        self.hba_is.add(1 << nr);
        self.set_reg(0x08, self.hba_is.flush());
    }

    /// Flags interrupt causes without completing anything.
    pub fn raise_port_irq(&self, nr: usize, bits: u32) {
        let base = port_base(nr);
        self.port_is[nr].add(bits);
        self.set_reg(base + 0x10, self.port_is[nr].flush());
        self.hba_is.add(1 << nr);
        self.set_reg(0x08, self.hba_is.flush());
    }

    /// Runs the command in `tag`'s slot against the emulated drive.
    fn execute(&self, nr: usize, tag: usize) {
        let base = port_base(nr);
        let clb = u64::from(self.reg(base));
        let cl = self.hostop.phys_to_virt(clb).expect("command list not mapped");
        unsafe {
            let hdr = cl.add(tag * 32) as *const u32;
            let dw0 = hdr.read();
            let prdtl = (dw0 >> 16) as usize;
            let ctba = u64::from(hdr.add(2).read());
            let ct = self.hostop.phys_to_virt(ctba).expect("command table not mapped");
            let fis = &*(ct as *const FisRegH2D);
            let cmd = fis.command.read();
            let lba = fis.lba();
            self.last_cmd.set(Some(LastCmd {
                cmd,
                lba,
                count: fis.count(),
                features: fis.features(),
                pmp: fis.pmp(),
                write: dw0 & 0x40 != 0,
            }));

            let mut prds = Vec::new();
            for i in 0..prdtl {
                let e = ct.add(0x80 + i * 16) as *const u32;
                prds.push((u64::from(e.read()), e.add(3).read()));
            }
            *self.last_prds.borrow_mut() = prds.clone();

            match cmd {
                0xEC => {
                    let id = self.identify.borrow();
                    let mut bytes = [0u8; 512];
                    for (i, w) in id.iter().enumerate() {
                        bytes[2 * i] = *w as u8;
                        bytes[2 * i + 1] = (*w >> 8) as u8;
                    }
                    self.scatter(&prds, &bytes);
                }
                0xC8 | 0x25 => {
                    let total: usize = prds.iter().map(|(_, dbc)| *dbc as usize + 1).sum();
                    let disk = self.disk.borrow();
                    let off = lba as usize * 512;
                    self.scatter(&prds, &disk[off..off + total]);
                }
                0xCA | 0x35 => {
                    let total: usize = prds.iter().map(|(_, dbc)| *dbc as usize + 1).sum();
                    let data = self.gather(&prds);
                    let mut disk = self.disk.borrow_mut();
                    let off = lba as usize * 512;
                    if off + total <= disk.len() {
                        disk[off..off + total].copy_from_slice(&data);
                    }
                }
                0xE7 | 0xEA | 0xEF => {}
                other => panic!("emulated drive got command {:#x}", other),
            }
            // drive ready, no error
            self.set_reg(base + 0x20, 0x50);
        }
    }

    fn scatter(&self, prds: &[(u64, u32)], data: &[u8]) {
        let mut off = 0usize;
        for (phys, dbc) in prds {
            if off >= data.len() {
                break;
            }
            let len = (*dbc as usize + 1).min(data.len() - off);
            let dst = self.hostop.phys_to_virt(*phys).expect("prd target not mapped");
            unsafe { std::ptr::copy_nonoverlapping(data.as_ptr().add(off), dst, len) };
            off += len;
        }
    }

    fn gather(&self, prds: &[(u64, u32)]) -> Vec<u8> {
        let mut data = Vec::new();
        for (phys, dbc) in prds {
            let len = *dbc as usize + 1;
            let src = self.hostop.phys_to_virt(*phys).expect("prd source not mapped");
            let mut chunk = vec![0u8; len];
            unsafe { std::ptr::copy_nonoverlapping(src as *const u8, chunk.as_mut_ptr(), len) };
            data.extend_from_slice(&chunk);
        }
        data
    }
}
