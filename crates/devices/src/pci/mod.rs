//! PCI configuration plumbing: typed addressing, per-function config space
//! state and the config-mechanism-#1 port pair.

mod bus;
mod config;

pub use bus::{register_pci_config_ports, PciBus, PciConfigPorts, PCI_CONFIG_ADDR, PCI_CONFIG_DATA};
pub use config::{PciBarDefinition, PciConfigSpace, PciConfigWriteEffects};

/// A bus/device/function triple. Devices are handed theirs at attachment and
/// keep it for their whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        debug_assert!(device < 32);
        debug_assert!(function < 8);
        Self {
            bus,
            device,
            function,
        }
    }

    /// Packs into the 16-bit `bus:8 | device:5 | function:3` form used by the
    /// config-mechanism address register.
    pub fn pack_u16(&self) -> u16 {
        (u16::from(self.bus) << 8) | (u16::from(self.device & 0x1f) << 3) | u16::from(self.function & 0x7)
    }

    pub fn unpack_u16(raw: u16) -> Self {
        Self {
            bus: (raw >> 8) as u8,
            device: ((raw >> 3) & 0x1f) as u8,
            function: (raw & 0x7) as u8,
        }
    }
}

impl core::fmt::Display for PciBdf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Legacy PCI interrupt pins. `None` reads back as 0x3D == 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PciInterruptPin {
    IntA = 1,
    IntB = 2,
    IntC = 3,
    IntD = 4,
}

/// One config-space responder occupying a (bus, device) slot.
///
/// The `function` argument of every access is forwarded as decoded from the
/// mechanism address register, out-of-range values included; a single-function
/// device answers all-ones for the functions it does not implement.
pub trait PciFunction: Send {
    fn name(&self) -> &str;

    /// Byte-granular config read. `size` is 1, 2 or 4; wider reads are
    /// little-endian at `reg`.
    fn config_read(&mut self, function: u8, reg: u16, size: u8) -> u32;

    fn config_write(&mut self, function: u8, reg: u16, size: u8, value: u32);

    /// (Re)installs whatever memory or port mappings the function's current
    /// config state calls for. Invoked once at attachment and again on reset.
    fn map_special_regions(&mut self);

    /// Restores power-on config state, then remaps.
    fn reset(&mut self);
}
