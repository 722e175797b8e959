//! Driver errors.
//!
//! Three classes share one enum: setup failures that abandon a whole
//! controller, port failures that abandon (or reinitialize) one port, and
//! request rejections that refuse a single transfer without consuming a
//! command slot.

use core::fmt::{self, Display, Formatter};

/// Everything that can go wrong inside the AHCI driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciError {
    /// A polled register did not reach the expected state within 200 ms.
    Timeout,
    /// The PCI command register lacks memory-decode or bus-master.
    BadPciCommand,
    /// BAR5 does not hold a 32-bit memory BAR.
    BadBar,
    /// The host refused to map a register window.
    MapFailed,
    /// The BIOS still owns the controller (BOHC handoff pending).
    BiosHandoff,
    /// The drive wants a spin-up before it will serve commands.
    NeedsSpinup,
    /// A transfer argument violates the PRD constraints.
    InvalidArg,
    /// A transfer needs more physical regions than a slot can hold.
    BufferTooScattered,
}

impl Display for AhciError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AhciError::Timeout => "register poll timed out",
            AhciError::BadPciCommand => "memory-decode or bus-master disabled",
            AhciError::BadBar => "BAR5 is not a 32-bit memory BAR",
            AhciError::MapFailed => "could not map IO memory",
            AhciError::BiosHandoff => "BIOS/OS handoff in progress",
            AhciError::NeedsSpinup => "drive requires spin-up",
            AhciError::InvalidArg => "invalid transfer argument",
            AhciError::BufferTooScattered => "physical region table exhausted",
        };
        f.write_str(msg)
    }
}
