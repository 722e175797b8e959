//! Frame Information Structures
//!
//! A FIS is a packet or frame of information that is transferred between the
//! host and device. The only FIS the driver builds itself is the Register
//! H2D command FIS; the device-to-host variants show up in the received-FIS
//! area that the hardware fills. Refer to the Serial ATA specification for
//! more information.

use crate::io::Mmio;
use crate::zero_box::ZeroInitialized;
use static_assertions::assert_eq_size;

/// The types of a FIS.
///
/// Stored on byte 0 of every FIS, determines the length of the structure.
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum FisType {
    /// Register FIS - host to device
    RegH2D = 0x27,
    /// Register FIS - device to host
    RegD2H = 0x34,
    /// DMA setup FIS - bidirectional
    DmaSetup = 0x41,
    /// PIO setup FIS - device to host
    PioSetup = 0x5F,
    /// Set device bits FIS - device to host
    DevBits = 0xA1,
}

/// Device register value selecting LBA addressing.
const DEVICE_LBA: u8 = 0x40;

/// Register FIS - host to device
///
/// `fis_type` must be set to 0x27.
#[repr(C)]
#[derive(Debug)]
pub struct FisRegH2D {
    // DWORD 0
    /// FIS type, 0x27.
    pub fis_type: Mmio<u8>,
    /// Bit 7: command (not control) update. Bits 3:0: port multiplier port.
    pub pm: Mmio<u8>,
    /// ATA command register.
    pub command: Mmio<u8>,
    /// Feature register, 7:0.
    pub featurel: Mmio<u8>,

    // DWORD 1
    /// LBA low register, 7:0.
    pub lba0: Mmio<u8>,
    /// LBA mid register, 15:8.
    pub lba1: Mmio<u8>,
    /// LBA high register, 23:16.
    pub lba2: Mmio<u8>,
    /// Device register.
    pub device: Mmio<u8>,

    // DWORD 2
    /// LBA register, 31:24.
    pub lba3: Mmio<u8>,
    /// LBA register, 39:32.
    pub lba4: Mmio<u8>,
    /// LBA register, 47:40.
    pub lba5: Mmio<u8>,
    /// Feature register, 15:8.
    pub featureh: Mmio<u8>,

    // DWORD 3
    /// Count register, 7:0.
    pub countl: Mmio<u8>,
    /// Count register, 15:8.
    pub counth: Mmio<u8>,
    /// Isochronous command completion.
    pub icc: Mmio<u8>,
    /// Control register.
    pub control: Mmio<u8>,

    // DWORD 4
    /// Reserved.
    pub rsv1: [Mmio<u8>; 4],
}

assert_eq_size!(FisRegH2D, [u8; 20]);

unsafe impl ZeroInitialized for FisRegH2D {}

impl FisRegH2D {
    /// Fills in a command FIS, overwriting every byte.
    ///
    /// `sector` is split LBA48-style over the six LBA bytes; the device
    /// register always selects LBA mode. 28-bit commands simply ignore the
    /// high bytes.
    pub fn setup_command(&self, pmp: u8, command: u8, features: u16, sector: u64, count: u16) {
        self.fis_type.write(FisType::RegH2D as u8);
        self.pm.write(0x80 | (pmp & 0xF));
        self.command.write(command);
        self.featurel.write(features as u8);
        self.lba0.write(sector as u8);
        self.lba1.write((sector >> 8) as u8);
        self.lba2.write((sector >> 16) as u8);
        self.device.write(DEVICE_LBA);
        self.lba3.write((sector >> 24) as u8);
        self.lba4.write((sector >> 32) as u8);
        self.lba5.write((sector >> 40) as u8);
        self.featureh.write((features >> 8) as u8);
        self.countl.write(count as u8);
        self.counth.write((count >> 8) as u8);
        self.icc.write(0);
        self.control.write(0);
        for b in self.rsv1.iter() {
            b.write(0);
        }
    }

    /// The 48-bit sector address carried by this FIS.
    pub fn lba(&self) -> u64 {
        u64::from(self.lba0.read())
            | u64::from(self.lba1.read()) << 8
            | u64::from(self.lba2.read()) << 16
            | u64::from(self.lba3.read()) << 24
            | u64::from(self.lba4.read()) << 32
            | u64::from(self.lba5.read()) << 40
    }

    /// The sector count field.
    pub fn count(&self) -> u16 {
        u16::from(self.countl.read()) | u16::from(self.counth.read()) << 8
    }

    /// The 16-bit features field.
    pub fn features(&self) -> u16 {
        u16::from(self.featurel.read()) | u16::from(self.featureh.read()) << 8
    }

    /// The port-multiplier port this command selects.
    pub fn pmp(&self) -> u8 {
        self.pm.read() & 0xF
    }

    /// True if this FIS updates the command register rather than control.
    pub fn is_command(&self) -> bool {
        self.pm.read() & 0x80 != 0
    }
}

/// Register FIS - device to host
#[repr(C)]
#[derive(Debug)]
pub struct FisRegD2H {
    // DWORD 0
    /// FIS type, 0x34.
    pub fis_type: Mmio<u8>,
    /// Bit 6: interrupt. Bits 3:0: port multiplier port.
    pub pm: Mmio<u8>,
    /// Status register.
    pub status: Mmio<u8>,
    /// Error register.
    pub error: Mmio<u8>,

    // DWORD 1
    /// LBA low register, 7:0.
    pub lba0: Mmio<u8>,
    /// LBA mid register, 15:8.
    pub lba1: Mmio<u8>,
    /// LBA high register, 23:16.
    pub lba2: Mmio<u8>,
    /// Device register.
    pub device: Mmio<u8>,

    // DWORD 2
    /// LBA register, 31:24.
    pub lba3: Mmio<u8>,
    /// LBA register, 39:32.
    pub lba4: Mmio<u8>,
    /// LBA register, 47:40.
    pub lba5: Mmio<u8>,
    /// Reserved.
    pub rsv2: Mmio<u8>,

    // DWORD 3
    /// Count register, 7:0.
    pub countl: Mmio<u8>,
    /// Count register, 15:8.
    pub counth: Mmio<u8>,
    /// Reserved.
    pub rsv3: [Mmio<u8>; 2],

    // DWORD 4
    /// Reserved.
    pub rsv4: [Mmio<u8>; 4],
}

assert_eq_size!(FisRegD2H, [u8; 20]);

/// PIO setup FIS - device to host
#[repr(C)]
#[derive(Debug)]
pub struct FisPioSetup {
    // DWORD 0
    /// FIS type, 0x5F.
    pub fis_type: Mmio<u8>,
    /// Bit 5: direction (1 = device to host). Bit 6: interrupt.
    pub pm: Mmio<u8>,
    /// Status register.
    pub status: Mmio<u8>,
    /// Error register.
    pub error: Mmio<u8>,

    // DWORD 1
    /// LBA low register, 7:0.
    pub lba0: Mmio<u8>,
    /// LBA mid register, 15:8.
    pub lba1: Mmio<u8>,
    /// LBA high register, 23:16.
    pub lba2: Mmio<u8>,
    /// Device register.
    pub device: Mmio<u8>,

    // DWORD 2
    /// LBA register, 31:24.
    pub lba3: Mmio<u8>,
    /// LBA register, 39:32.
    pub lba4: Mmio<u8>,
    /// LBA register, 47:40.
    pub lba5: Mmio<u8>,
    /// Reserved.
    pub rsv2: Mmio<u8>,

    // DWORD 3
    /// Count register, 7:0.
    pub countl: Mmio<u8>,
    /// Count register, 15:8.
    pub counth: Mmio<u8>,
    /// Reserved.
    pub rsv3: Mmio<u8>,
    /// New value of the status register.
    pub e_status: Mmio<u8>,

    // DWORD 4
    /// Transfer count.
    pub tc: Mmio<u16>,
    /// Reserved.
    pub rsv4: [Mmio<u8>; 2],
}

assert_eq_size!(FisPioSetup, [u8; 20]);

/// DMA setup FIS - bidirectional
///
/// The DMA buffer identifier is kept as two words so the struct needs no
/// packing.
#[repr(C)]
#[derive(Debug)]
pub struct FisDmaSetup {
    // DWORD 0
    /// FIS type, 0x41.
    pub fis_type: Mmio<u8>,
    /// Direction: 4, interrupt: 2, auto-activate: 1.
    pub pm: Mmio<u8>,
    /// Reserved.
    pub rsv1: [Mmio<u8>; 2],

    // DWORD 1-2
    /// DMA buffer identifier, low half. Host specific.
    pub dma_buffer_id_low: Mmio<u32>,
    /// DMA buffer identifier, high half.
    pub dma_buffer_id_high: Mmio<u32>,

    // DWORD 3
    /// Reserved.
    pub rsv3: Mmio<u32>,

    // DWORD 4
    /// Byte offset into the buffer. First 2 bits must be 0.
    pub dma_buffer_offset: Mmio<u32>,

    // DWORD 5
    /// Number of bytes to transfer. Bit 0 must be 0.
    pub transfer_count: Mmio<u32>,

    // DWORD 6
    /// Reserved.
    pub rsv6: Mmio<u32>,
}

assert_eq_size!(FisDmaSetup, [u8; 28]);

/// Set device bits FIS - device to host
#[repr(C)]
#[derive(Debug)]
pub struct FisSetDeviceBits {
    // DWORD 0
    /// FIS type, 0xA1.
    pub fis_type: Mmio<u8>,
    /// Interrupt bit: 6.
    pub i: Mmio<u8>,
    /// Status hi 6:4, status lo 2:0.
    pub status: Mmio<u8>,
    /// Error 7:0.
    pub error: Mmio<u8>,

    // DWORD 1
    /// Reserved.
    pub rsv: Mmio<u32>,
}

assert_eq_size!(FisSetDeviceBits, [u8; 8]);
