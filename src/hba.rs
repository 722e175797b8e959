//! HBA register layout and port-local DMA structures
//!
//! Based on [Serial ATA AHCI: Specification, Rev. 1.3.1].
//! In this module, "See spec section N" makes reference to this document.
//!
//! The register window is found at the physical address in PCI configuration
//! register `BAR5`. Every register is a 32-bit [`Mmio`] cell; the 64-bit
//! base-address pairs are kept as separate low/high words so the structs
//! need no packing and every access stays a single 32-bit load or store.
//!
//! [Serial ATA AHCI: Specification, Rev. 1.3.1]: http://www.intel.com/content/dam/www/public/us/en/documents/technical-specifications/serial-ata-ahci-spec-rev1-3-1.pdf

use core::fmt::{self, Debug, Formatter};

use bitfield::bitfield;
use static_assertions::assert_eq_size;

use crate::fis::{FisDmaSetup, FisPioSetup, FisRegD2H, FisRegH2D, FisSetDeviceBits};
use crate::io::Mmio;
use crate::zero_box::ZeroInitialized;

/// Maximum number of physical region descriptors per command slot.
pub const MAX_PRD_COUNT: usize = 64;

/// The port interrupt sources the driver enables.
///
/// Cold-port detect, task-file error, host-bus fatal/data error,
/// interface fatal/non-fatal, overflow, port-connect change, device
/// mechanical presence, PhyRdy change, descriptor processed, unknown FIS,
/// set-device-bits and D2H register FIS.
pub const PORT_IRQ_MASK: u32 = 0xF980_00F1;

// ---------------------------------------------------------------------------------------------- //
//                                              Hba                                               //
// ---------------------------------------------------------------------------------------------- //

/// HBA memory registers, first 4 KiB page.
///
/// See spec section 3.1.
///
/// Holds the generic host control block and port register blocks 0-29.
/// Ports 30 and 31, when implemented, live on the following page, which has
/// to be mapped separately.
#[repr(C)]
pub struct HbaMemoryRegisters {
    /// Generic host control registers, 0x00-0x2B.
    pub generic_host_control: GenericHostControl,
    /// Reserved, 0x2C-0x9F.
    _rsv: [Mmio<u32>; 29],
    /// Vendor specific registers, 0xA0-0xFF.
    _vendor: [Mmio<u32>; 24],
    /// Port control registers 0-29, 0x100-0xFFF.
    pub ports: [Px; 30],
}

assert_eq_size!(HbaMemoryRegisters, [u8; 4096]);

unsafe impl ZeroInitialized for HbaMemoryRegisters {}

impl Debug for HbaMemoryRegisters {
    /// Debug prints the generic block only, ports are reached through it.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("HbaMemoryRegisters")
            .field("generic_host_control", &self.generic_host_control)
            .finish()
    }
}

/// HBA Generic Host Control.
///
/// See spec section 3.1.
#[repr(C)]
pub struct GenericHostControl {
    /// Host capabilities.
    pub cap: Mmio<CAP>,
    /// Global host control.
    pub ghc: Mmio<GHC>,
    /// Interrupt status, one bit per port, write '1' to clear.
    pub is: Mmio<u32>,
    /// Ports implemented.
    pub pi: Mmio<u32>,
    /// Version.
    pub vs: Mmio<u32>,
    /// Command completion coalescing control.
    pub ccc_ctl: Mmio<u32>,
    /// Command completion coalescing ports.
    pub ccc_pts: Mmio<u32>,
    /// Enclosure management location.
    pub em_loc: Mmio<u32>,
    /// Enclosure management control.
    pub em_ctl: Mmio<u32>,
    /// Host capabilities extended.
    pub cap2: Mmio<u32>,
    /// BIOS/OS handoff control and status.
    pub bohc: Mmio<u32>,
}

assert_eq_size!(GenericHostControl, [u8; 44]);

impl Debug for GenericHostControl {
    /// Debug does not access reserved registers.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericHostControl")
            .field("cap", &self.cap)
            .field("ghc", &self.ghc)
            .field("is", &self.is)
            .field("pi", &self.pi)
            .field("vs", &self.vs)
            .field("cap2", &self.cap2)
            .field("bohc", &self.bohc)
            .finish()
    }
}

bitfield! {
    /// `CAP` "HBA Capabilities" register bitfield.
    ///
    /// Defined in section 3.1.1.
    #[derive(Clone, Copy)]
    pub struct CAP(u32);
    impl Debug;
    pub s64a,     _: 31;
    pub sncq,     _: 30;
    pub ssntf,    _: 29;
    pub smps,     _: 28;
    pub sss,      _: 27;
    pub salp,     _: 26;
    pub sal,      _: 25;
    pub sclo,     _: 24;
    pub iss,      _: 23, 20;
    // 19 reserved
    pub sam,      _: 18;
    pub spm,      _: 17;
    pub fbss,     _: 16;
    pub pmd,      _: 15;
    pub scc,      _: 14;
    pub psc,      _: 13;
    pub ncs,      _: 12, 8;
    pub cccs,     _: 7;
    pub ems,      _: 6;
    pub sxs,      _: 5;
    pub np,       _: 4, 0;
}

bitfield! {
    /// `GHC` "Global HBA Control" register bitfield.
    ///
    /// Defined in section 3.1.2.
    #[derive(Clone, Copy)]
    pub struct GHC(u32);
    impl Debug;
    pub ae,  set_ae: 31;
    // 30:03 reserved
    pub mrsm,         _: 2;
    pub ie,  set_ie: 1;
    pub hr,  set_hr: 0;
}

// ---------------------------------------------------------------------------------------------- //
//                                         Port Registers                                         //
// ---------------------------------------------------------------------------------------------- //

/// HBA Memory Port registers.
///
/// See spec section 3.3.
///
/// Port blocks 0-29 follow the generic block at `BAR5 + 0x100`; blocks for
/// ports 30-31 start exactly one page later. The list of ports that are
/// actually implemented is in `PI`; unimplemented blocks must never be
/// accessed.
#[repr(C)]
pub struct Px {
    /// Command list base address, 1 KiB aligned, low word.
    pub clb: Mmio<u32>,
    /// Command list base address, high word. Always written zero.
    pub clbu: Mmio<u32>,
    /// FIS base address, low word.
    pub fb: Mmio<u32>,
    /// FIS base address, high word. Always written zero.
    pub fbu: Mmio<u32>,
    /// Interrupt status, write '1' to clear.
    pub is: Mmio<PxIS>,
    /// Interrupt enable.
    pub ie: Mmio<PxIE>,
    /// Command and status.
    pub cmd: Mmio<PxCMD>,
    /// Reserved, 0x1C.
    _rsv0: Mmio<u32>,
    /// Task file data.
    pub tfd: Mmio<PxTFD>,
    /// Signature. 0xFFFFFFFF when nothing answered.
    pub sig: Mmio<u32>,
    /// SATA status (SCR0: SStatus).
    pub ssts: Mmio<u32>,
    /// SATA control (SCR2: SControl).
    pub sctl: Mmio<u32>,
    /// SATA error (SCR1: SError), write '1' to clear.
    pub serr: Mmio<u32>,
    /// SATA active (SCR3: SActive).
    pub sact: Mmio<u32>,
    /// Command issue, one bit per slot.
    pub ci: Mmio<u32>,
    /// SATA notification (SCR4: SNotification).
    pub sntf: Mmio<u32>,
    /// FIS-based switching control.
    pub fbs: Mmio<u32>,
    /// Reserved, 0x44-0x6F.
    _rsv1: [Mmio<u32>; 11],
    /// Vendor specific, 0x70-0x7F.
    _vendor: [Mmio<u32>; 4],
}

assert_eq_size!(Px, [u8; 128]);

impl Debug for Px {
    /// Debug does not access reserved registers.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Px")
            .field("clb", &self.clb)
            .field("fb", &self.fb)
            .field("is", &self.is)
            .field("ie", &self.ie)
            .field("cmd", &self.cmd)
            .field("tfd", &self.tfd)
            .field("sig", &self.sig)
            .field("ssts", &self.ssts)
            .field("serr", &self.serr)
            .field("sact", &self.sact)
            .field("ci", &self.ci)
            .finish()
    }
}

bitfield! {
    /// `PxIS` "Port x Interrupt Status" register bitfield.
    ///
    /// A '1' indicates a pending interrupt. Write '1' to clear.
    ///
    /// Defined in section 3.3.5.
    #[derive(Clone, Copy)]
    pub struct PxIS(u32);
    impl Debug;
    pub cpds, _: 31;
    pub tfes, _: 30;
    pub hbfs, _: 29;
    pub hbds, _: 28;
    pub ifs,  _: 27;
    pub infs, _: 26;
    // 25 reserved
    pub ofs,  _: 24;
    pub ipms, _: 23;
    pub prcs, _: 22;
    // 21:08 reserved
    pub dmps, _: 7;
    pub pcs,  _: 6;
    pub dps,  _: 5;
    pub ufs,  _: 4;
    pub sbds, _: 3;
    pub dss,  _: 2;
    pub pss,  _: 1;
    pub dhrs, _: 0;
}

bitfield! {
    /// `PxIE` "Port x Interrupt Enable" register bitfield.
    ///
    /// Symmetrical with `PxIS`; a set bit forwards the matching interrupt
    /// condition to the HBA interrupt line.
    ///
    /// Defined in section 3.3.6.
    #[derive(Clone, Copy)]
    pub struct PxIE(u32);
    impl Debug;
    pub cpde, set_cpde: 31;
    pub tfee, set_tfee: 30;
    pub hbfe, set_hbfe: 29;
    pub hbde, set_hbde: 28;
    pub ife,  set_ife: 27;
    pub infe, set_infe: 26;
    // 25 reserved
    pub ofe,  set_ofe: 24;
    pub ipme, set_ipme: 23;
    pub prce, set_prce: 22;
    // 21:08 reserved
    pub dmpe, set_dmpe: 7;
    pub pce,  set_pce: 6;
    pub dpe,  set_dpe: 5;
    pub ufe,  set_ufe: 4;
    pub sbde, set_sbde: 3;
    pub dse,  set_dse: 2;
    pub pse,  set_pse: 1;
    pub dhre, set_dhre: 0;
}

bitfield! {
    /// `PxCMD` "Port x Command and Status" register bitfield.
    ///
    /// Defined in section 3.3.7.
    #[derive(Clone, Copy)]
    pub struct PxCMD(u32);
    impl Debug;
    pub icc,   set_icc: 31, 28;
    pub asp,   set_asp: 27;
    pub alpe,  set_alpe: 26;
    pub dlae,  set_dlae: 25;
    pub atapi, set_atapi: 24;
    pub apste, set_apste: 23;
    pub fbscp,            _: 22;
    pub esp,              _: 21;
    pub cpd,              _: 20;
    pub mpsp,             _: 19;
    pub hpcp,             _: 18;
    pub pma,   set_pma: 17;
    pub cps,              _: 16;
    pub cr,               _: 15;
    pub fr,               _: 14;
    pub mpss,             _: 13;
    pub ccs,              _: 12, 8;
    // 07:05 reserved
    pub fre,   set_fre: 4;
    pub clo,   set_clo: 3;
    pub pod,   set_pod: 2;
    pub sud,   set_sud: 1;
    pub st,    set_st: 0;
}

bitfield! {
    /// `PxTFD` "Port x Task File Data" register bitfield.
    ///
    /// Defined in section 3.3.8.
    #[derive(Clone, Copy)]
    pub struct PxTFD(u32);
    impl Debug;
    // 31:16 reserved
    pub err,      _: 15, 8;
    pub bsy,      _: 7;
    pub cs0,      _: 6, 4;
    pub drq,      _: 3;
    pub cs1,      _: 2, 1;
    pub err_flag, _: 0;
}

// Raw conversions, for mask checks, waits and logging.

impl From<CAP> for u32 {
    fn from(r: CAP) -> u32 {
        r.0
    }
}

impl From<GHC> for u32 {
    fn from(r: GHC) -> u32 {
        r.0
    }
}

impl From<PxIS> for u32 {
    fn from(r: PxIS) -> u32 {
        r.0
    }
}

impl From<u32> for PxIS {
    fn from(raw: u32) -> PxIS {
        PxIS(raw)
    }
}

impl From<u32> for PxIE {
    fn from(raw: u32) -> PxIE {
        PxIE(raw)
    }
}

impl From<PxIE> for u32 {
    fn from(r: PxIE) -> u32 {
        r.0
    }
}

impl From<PxCMD> for u32 {
    fn from(r: PxCMD) -> u32 {
        r.0
    }
}

impl From<PxTFD> for u32 {
    fn from(r: PxTFD) -> u32 {
        r.0
    }
}

impl From<CmdHeaderFlags> for u16 {
    fn from(r: CmdHeaderFlags) -> u16 {
        r.0
    }
}

impl From<u16> for CmdHeaderFlags {
    fn from(raw: u16) -> CmdHeaderFlags {
        CmdHeaderFlags(raw)
    }
}

// ---------------------------------------------------------------------------------------------- //
//                                         Command List                                           //
// ---------------------------------------------------------------------------------------------- //

bitfield! {
    /// Command header word 0, low half.
    ///
    /// Defined in section 4.2.2. The PRD entry count occupies the upper
    /// half of the word and lives in [`CmdHeader::prdtl`].
    #[derive(Clone, Copy)]
    pub struct CmdHeaderFlags(u16);
    impl Debug;
    /// Port Multiplier Port.
    pub pmp, set_pmp: 15, 12;
    // 11 reserved
    /// Clear Busy upon R_OK.
    pub c,   set_c: 10;
    /// BIST.
    pub b,   set_b: 9;
    /// Reset.
    pub r,   set_r: 8;
    /// Prefetchable.
    pub p,   set_p: 7;
    /// Write. Indicates the device is the transfer target.
    pub w,   set_w: 6;
    /// ATAPI transfer.
    pub a,   set_a: 5;
    /// Command FIS Length, in DWORDs.
    pub cfl, set_cfl: 4, 0;
}

/// Command Header. Entry `i` of the command list describes slot `i`.
///
/// See spec section 4.2.2.
#[repr(C)]
pub struct CmdHeader {
    /// Flags word: FIS length, direction, atapi, port-multiplier.
    pub flags: Mmio<CmdHeaderFlags>,
    /// Physical region descriptor table length, in entries.
    pub prdtl: Mmio<u16>,
    /// Physical region descriptor byte count transferred.
    pub prdbc: Mmio<u32>,
    /// Command table base address, low word.
    pub ctba: Mmio<u32>,
    /// Command table base address, high word. Always written zero.
    pub ctbau: Mmio<u32>,
    /// Reserved.
    _rsv: [Mmio<u32>; 4],
}

assert_eq_size!(CmdHeader, [u8; 32]);

impl Debug for CmdHeader {
    /// Debug does not access reserved words.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdHeader")
            .field("flags", &self.flags)
            .field("prdtl", &self.prdtl)
            .field("prdbc", &self.prdbc)
            .field("ctba", &self.ctba)
            .finish()
    }
}

/// The command list: one header per slot.
///
/// The hardware only walks the first `CAP.NCS + 1` entries; allocating the
/// architectural maximum keeps the layout independent of the controller.
///
/// Its physical address is written to `PxCLB`. Required alignment is 1 KiB.
#[repr(C, align(1024))]
pub struct CmdHeaderArray {
    /// The 32 command slots.
    pub slots: [CmdHeader; 32],
}

assert_eq_size!(CmdHeaderArray, [u8; 1024]);

unsafe impl ZeroInitialized for CmdHeaderArray {}

impl Debug for CmdHeaderArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

// ---------------------------------------------------------------------------------------------- //
//                                         Command Table                                          //
// ---------------------------------------------------------------------------------------------- //

/// Physical Region Descriptor Table entry.
///
/// One scatter/gather element: a physical base address and a byte count,
/// encoded as `count - 1` with bit 0 always zero (counts are even).
///
/// See spec section 4.2.3.3.
#[repr(C)]
pub struct PrdEntry {
    /// Data base address, low word. Must be word aligned.
    pub dba: Mmio<u32>,
    /// Data base address, high word. Always written zero.
    pub dbau: Mmio<u32>,
    /// Reserved.
    _rsv: Mmio<u32>,
    /// Byte count - 1, 4 MiB max. Bit 31 requests an interrupt.
    pub dbc: Mmio<u32>,
}

assert_eq_size!(PrdEntry, [u8; 16]);

impl Debug for PrdEntry {
    /// Debug does not access the reserved word.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrdEntry")
            .field("dba", &self.dba)
            .field("dbc", &self.dbc)
            .finish()
    }
}

/// Command Table of one slot: the command FIS plus the PRD table.
///
/// See spec section 4.2.3.
#[repr(C)]
pub struct CmdTable {
    /// Command FIS, 0x00. Only the Register H2D layout is ever sent.
    pub cfis: FisRegH2D,
    /// Pad to the 64-byte command FIS area.
    _cfis_pad: [Mmio<u8>; 44],
    /// ATAPI command, 12 or 16 bytes, 0x40.
    pub acmd: [Mmio<u8>; 16],
    /// Reserved, 0x50.
    _rsv: [Mmio<u8>; 48],
    /// Physical region descriptor table entries, 0x80.
    pub prdt: [PrdEntry; MAX_PRD_COUNT],
}

assert_eq_size!(CmdTable, [u8; 1152]);

unsafe impl ZeroInitialized for CmdTable {}

impl Debug for CmdTable {
    /// Debug prints the command FIS; the PRDT is summarized by its length
    /// in the owning header.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdTable").field("cfis", &self.cfis).finish()
    }
}

/// The command tables of all 32 slots, physically contiguous.
///
/// Each table is 128-byte aligned as required; the array base is 1 KiB
/// aligned so the first table can share the command list's alignment class.
#[repr(C, align(1024))]
pub struct CmdTableArray {
    /// One command table per slot.
    pub tables: [CmdTable; 32],
}

assert_eq_size!(CmdTableArray, [u8; 36864]);

unsafe impl ZeroInitialized for CmdTableArray {}

impl Debug for CmdTableArray {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tables.iter()).finish()
    }
}

// ---------------------------------------------------------------------------------------------- //
//                                         Received FIS                                           //
// ---------------------------------------------------------------------------------------------- //

/// Received FIS area. Pointed to by `PxFB`.
///
/// FIS received by the port are copied here by hardware, each variant to
/// its architectural offset. The area spans a whole page so the base can be
/// page aligned without sharing the page with anything else.
///
/// See spec section 4.2.1.
#[repr(C, align(4096))]
pub struct ReceivedFisArea {
    /// DMA setup FIS landing zone, 0x00.
    dsfis: FisDmaSetup,
    _rsv0: [Mmio<u8>; 4],
    /// PIO setup FIS landing zone, 0x20.
    psfis: FisPioSetup,
    _rsv1: [Mmio<u8>; 12],
    /// Register D2H FIS landing zone, 0x40.
    rfis: FisRegD2H,
    _rsv2: [Mmio<u8>; 4],
    /// Set-device-bits FIS landing zone, 0x58.
    sdbfis: FisSetDeviceBits,
    /// Unknown FIS landing zone, 0x60.
    ufis: [Mmio<u8>; 64],
    _rsv3: [Mmio<u8>; 96],
    _rsv_page: [Mmio<u8>; 4096 - 256],
}

assert_eq_size!(ReceivedFisArea, [u8; 4096]);

unsafe impl ZeroInitialized for ReceivedFisArea {}

impl ReceivedFisArea {
    /// The last received DMA Setup FIS.
    pub fn dsfis(&self) -> &FisDmaSetup {
        &self.dsfis
    }

    /// The last received PIO Setup FIS.
    pub fn psfis(&self) -> &FisPioSetup {
        &self.psfis
    }

    /// The last received D2H Register FIS.
    pub fn rfis(&self) -> &FisRegD2H {
        &self.rfis
    }

    /// The last received Set Device Bits FIS.
    pub fn sdbfis(&self) -> &FisSetDeviceBits {
        &self.sdbfis
    }
}

impl Debug for ReceivedFisArea {
    /// Debug prints the D2H register FIS, the part error paths care about.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFisArea").field("rfis", &self.rfis).finish()
    }
}
