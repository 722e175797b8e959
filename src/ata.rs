//! Generic ATA identify-data handling.
//!
//! A successful IDENTIFY DEVICE command fills a 512-byte block whose words
//! describe the drive. The driver only needs a handful of them: addressing
//! mode, sector count and the identity strings served to parameter queries.

use bit_field::BitField;

/// Disk identity snapshot served to parameter queries.
#[derive(Debug, Clone, Copy)]
pub struct DiskParameter {
    /// Number of addressable sectors.
    pub sectors: u64,
    /// Logical sector size in bytes.
    pub sector_size: u32,
    /// Largest request, in sectors, a single command can carry.
    pub max_request_count: u32,
    /// Model string, identify words 27-46, byte order fixed up.
    pub model: [u8; 40],
    /// Serial string, identify words 10-19, byte order fixed up.
    pub serial: [u8; 20],
}

impl DiskParameter {
    /// The all-empty snapshot, before any identify data was seen.
    pub const fn empty() -> DiskParameter {
        DiskParameter {
            sectors: 0,
            sector_size: 0,
            max_request_count: 0,
            model: [0; 40],
            serial: [0; 20],
        }
    }
}

/// Parsed IDENTIFY DEVICE data of one drive.
#[derive(Debug, Clone, Copy)]
pub struct AtaParams {
    /// Whether the drive accepts the 48-bit command set.
    pub lba48: bool,
    /// The externally visible identity snapshot.
    params: DiskParameter,
}

impl AtaParams {
    /// An empty parameter set.
    pub const fn new() -> AtaParams {
        AtaParams { lba48: false, params: DiskParameter::empty() }
    }

    /// Digests a raw identify block.
    ///
    /// Word 83 advertises the 48-bit feature set in bit 10, guarded by the
    /// 01b validity pattern in its top bits. Sector counts come from words
    /// 100-103 for 48-bit drives and words 60-61 otherwise.
    pub fn update_params(&mut self, identify: &[u16; 256]) {
        let w83 = identify[83];
        self.lba48 = w83 >> 14 == 0b01 && w83.get_bit(10);

        self.params.sectors = if self.lba48 {
            u64::from(identify[100])
                | u64::from(identify[101]) << 16
                | u64::from(identify[102]) << 32
                | u64::from(identify[103]) << 48
        } else {
            u64::from(identify[60]) | u64::from(identify[61]) << 16
        };
        self.params.sector_size = 512;
        self.params.max_request_count = if self.lba48 { 65536 } else { 256 };
        copy_identify_string(&identify[27..47], &mut self.params.model);
        copy_identify_string(&identify[10..20], &mut self.params.serial);
    }

    /// Copies the current snapshot into `dst`.
    pub fn get_disk_parameter(&self, dst: &mut DiskParameter) {
        *dst = self.params;
    }

    /// Number of addressable sectors.
    pub fn sectors(&self) -> u64 {
        self.params.sectors
    }
}

/// Identify strings store their characters two per word, swapped.
fn copy_identify_string(words: &[u16], dst: &mut [u8]) {
    for (i, w) in words.iter().enumerate() {
        dst[2 * i] = (w >> 8) as u8;
        dst[2 * i + 1] = *w as u8;
    }
}
