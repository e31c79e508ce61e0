/*!
PCI plumbing shared by switch ports and devices: bus/device/function
addressing, register-level configuration space models and the BAR-backed
MMIO register block.

The fabric's own identity numbers live here too; enumeration results are
asserted against them byte for byte.
*/

use std::fmt;

pub mod config_space;
pub mod mmio;

pub use config_space::ConfigSpace;
pub use mmio::{DeviceMmio, MmioRegisterBlock, SwitchMmio};

/// Vendor id every fabric-native function reports
pub const VENDOR_ID: u16 = 0x1DC5;
/// Type-3 single logical device
pub const SLD_DID: u16 = 0xF001;
/// Switch upstream port bridge
pub const SW_USP_DID: u16 = 0xF002;
/// Virtual PCI-to-PCI bridge (vPPB) / downstream port
pub const SW_DSP_DID: u16 = 0xF003;
/// Type-3 multi-logical device
pub const MLD_DID: u16 = 0xF004;

/// Bus/device/function triple, packed bus[15:8] dev[7:3] fn[2:0]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bdf(u16);

impl Bdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32 && function < 8);
        Self(u16::from(bus) << 8 | u16::from(device & 0x1f) << 3 | u16::from(function & 0x7))
    }

    pub fn bus(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn device(self) -> u8 {
        ((self.0 >> 3) & 0x1f) as u8
    }

    pub fn function(self) -> u8 {
        (self.0 & 0x7) as u8
    }
}

impl From<u16> for Bdf {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Bdf> for u16 {
    fn from(bdf: Bdf) -> u16 {
        bdf.0
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bdf_packs_like_a_requester_id() {
        let bdf = Bdf::new(2, 1, 0);
        assert_eq!(u16::from(bdf), 0x0208);
        assert_eq!(bdf.bus(), 2);
        assert_eq!(bdf.device(), 1);
        assert_eq!(bdf.function(), 0);
        assert_eq!(bdf.to_string(), "02:01.0");
    }
}
