use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use platform::{IoPortSpace, PortIoHandler};
use tracing::{debug, trace};

use super::{PciBdf, PciFunction};

/// Config-mechanism #1 address register.
pub const PCI_CONFIG_ADDR: u16 = 0x0cf8;
/// Config-mechanism #1 data window.
pub const PCI_CONFIG_DATA: u16 = 0x0cfc;

/// The root PCI bus: a sparse map of (bus, device) slots.
///
/// Functions within a device are dispatched by the device itself, so a
/// multi-function part can fold its functions into one responder; the decoded
/// function number travels with every access. Absent slots float all-ones and
/// swallow writes.
#[derive(Default)]
pub struct PciBus {
    slots: BTreeMap<(u8, u8), Box<dyn PciFunction>>,
}

impl PciBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `function` at `(bus, device)` and lets it establish its
    /// power-on mappings. Panics on a slot collision: slot assignment is a
    /// build-time decision, not guest-reachable.
    pub fn attach(&mut self, bus: u8, device: u8, mut function: Box<dyn PciFunction>) {
        assert!(
            !self.slots.contains_key(&(bus, device)),
            "PCI slot {bus:02x}:{device:02x} already occupied"
        );
        debug!("attaching {:?} at {bus:02x}:{device:02x}", function.name());
        function.map_special_regions();
        self.slots.insert((bus, device), function);
    }

    pub fn read_config(&mut self, bdf: PciBdf, reg: u16, size: u8) -> u32 {
        match self.slots.get_mut(&(bdf.bus, bdf.device)) {
            Some(function) => function.config_read(bdf.function, reg, size),
            None => {
                trace!("config read from empty slot {bdf} reg {reg:#04x}");
                match size {
                    1 => 0xff,
                    2 => 0xffff,
                    _ => 0xffff_ffff,
                }
            }
        }
    }

    pub fn write_config(&mut self, bdf: PciBdf, reg: u16, size: u8, value: u32) {
        match self.slots.get_mut(&(bdf.bus, bdf.device)) {
            Some(function) => function.config_write(bdf.function, reg, size, value),
            None => trace!("config write to empty slot {bdf} reg {reg:#04x} dropped"),
        }
    }

    /// Resets every attached function to power-on config state.
    pub fn reset(&mut self) {
        for function in self.slots.values_mut() {
            function.reset();
        }
    }

    /// Replays every function's mappings from its current config state
    /// (soft reset: the config survives, decode windows are rebuilt).
    pub fn remap_all(&mut self) {
        for function in self.slots.values_mut() {
            function.map_special_regions();
        }
    }
}

/// Port handler for the 0xCF8/0xCFC register pair.
///
/// The address register is four independently writable bytes (the port space
/// is byte-granular on the wire); the data window forwards each byte lane to
/// the addressed function as a size-1 config access at `(addr & 0xFC) + lane`.
/// With the enable bit (bit 31) clear the data window floats open bus.
pub struct PciConfigPorts {
    bus: Arc<Mutex<PciBus>>,
    addr: Mutex<u32>,
}

impl PciConfigPorts {
    pub fn new(bus: Arc<Mutex<PciBus>>) -> Self {
        Self {
            bus,
            addr: Mutex::new(0),
        }
    }

    fn lock_addr(&self) -> MutexGuard<'_, u32> {
        match self.addr.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_bus(&self) -> MutexGuard<'_, PciBus> {
        match self.bus.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Decodes the current address register into a target, or `None` when
    /// config cycles are not enabled.
    fn decode(&self, lane: u16) -> Option<(PciBdf, u16)> {
        let addr = *self.lock_addr();
        if addr & 0x8000_0000 == 0 {
            return None;
        }
        let bdf = PciBdf::unpack_u16((addr >> 8) as u16);
        let reg = (addr & 0xfc) as u16 + lane;
        Some((bdf, reg))
    }
}

impl PortIoHandler for PciConfigPorts {
    fn read(&self, port: u16) -> u8 {
        match port {
            PCI_CONFIG_ADDR..=0x0cfb => {
                let shift = 8 * (port - PCI_CONFIG_ADDR);
                (*self.lock_addr() >> shift) as u8
            }
            _ => match self.decode(port - PCI_CONFIG_DATA) {
                Some((bdf, reg)) => self.lock_bus().read_config(bdf, reg, 1) as u8,
                None => 0xff,
            },
        }
    }

    fn write(&self, port: u16, value: u8) {
        match port {
            PCI_CONFIG_ADDR..=0x0cfb => {
                let shift = 8 * (port - PCI_CONFIG_ADDR);
                let mut addr = self.lock_addr();
                *addr = (*addr & !(0xffu32 << shift)) | (u32::from(value) << shift);
            }
            _ => {
                if let Some((bdf, reg)) = self.decode(port - PCI_CONFIG_DATA) {
                    self.lock_bus().write_config(bdf, reg, 1, u32::from(value));
                }
            }
        }
    }
}

/// Binds the mechanism-#1 register pair into `io`.
pub fn register_pci_config_ports(io: &IoPortSpace, bus: Arc<Mutex<PciBus>>) -> bool {
    let ports = Arc::new(PciConfigPorts::new(bus));
    io.register_range(PCI_CONFIG_ADDR, 0x0cff, "pci-config", ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Probe {
        writes: Arc<Mutex<Vec<(u8, u16, u32)>>>,
    }

    impl PciFunction for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn config_read(&mut self, function: u8, reg: u16, _size: u8) -> u32 {
            u32::from(function) << 16 | u32::from(reg)
        }

        fn config_write(&mut self, function: u8, reg: u16, _size: u8, value: u32) {
            self.writes.lock().unwrap().push((function, reg, value));
        }

        fn map_special_regions(&mut self) {}

        fn reset(&mut self) {}
    }

    #[test]
    fn bdf_packs_and_unpacks() {
        let bdf = PciBdf::new(0, 7, 1);
        assert_eq!(bdf.pack_u16(), 0x0039);
        assert_eq!(PciBdf::unpack_u16(0x0039), bdf);
    }

    #[test]
    fn empty_slot_floats_all_ones() {
        let mut bus = PciBus::new();
        let bdf = PciBdf::new(0, 3, 0);
        assert_eq!(bus.read_config(bdf, 0x00, 1), 0xff);
        assert_eq!(bus.read_config(bdf, 0x00, 2), 0xffff);
        assert_eq!(bus.read_config(bdf, 0x00, 4), 0xffff_ffff);
        bus.write_config(bdf, 0x04, 2, 0x0005);
    }

    #[test]
    fn mechanism_routes_function_and_register() {
        let io = IoPortSpace::new();
        let bus = Arc::new(Mutex::new(PciBus::new()));
        let writes = Arc::new(Mutex::new(Vec::new()));
        bus.lock().unwrap().attach(0, 7, Box::new(Probe {
            writes: Arc::clone(&writes),
        }));
        assert!(register_pci_config_ports(&io, Arc::clone(&bus)));

        // 00:07.1 register 0x0c, enable set.
        io.write_u32(PCI_CONFIG_ADDR, 0x8000_0000 | (0x0039 << 8) | 0x0c);
        assert_eq!(io.read_u8(PCI_CONFIG_DATA + 2), 0x0e);
        io.write_u8(PCI_CONFIG_DATA + 1, 0xab);
        // Byte lane 1 lands at register 0x0d of function 1.
        assert_eq!(writes.lock().unwrap().as_slice(), &[(1, 0x0d, 0xab)]);
    }

    #[test]
    fn disabled_address_floats_data_window() {
        let io = IoPortSpace::new();
        let bus = Arc::new(Mutex::new(PciBus::new()));
        bus.lock().unwrap().attach(0, 7, Box::new(Probe::default()));
        assert!(register_pci_config_ports(&io, Arc::clone(&bus)));

        io.write_u32(PCI_CONFIG_ADDR, (0x0039 << 8) | 0x0c);
        assert_eq!(io.read_u32(PCI_CONFIG_DATA), 0xffff_ffff);
    }

    #[test]
    fn mechanism_registration_reports_a_port_clash() {
        let io = IoPortSpace::new();
        let bus = Arc::new(Mutex::new(PciBus::new()));
        assert!(register_pci_config_ports(&io, Arc::clone(&bus)));
        assert!(!register_pci_config_ports(&io, bus));
    }

    #[test]
    fn address_register_reads_back() {
        let io = IoPortSpace::new();
        let bus = Arc::new(Mutex::new(PciBus::new()));
        assert!(register_pci_config_ports(&io, bus));
        io.write_u32(PCI_CONFIG_ADDR, 0x8000_3944);
        assert_eq!(io.read_u32(PCI_CONFIG_ADDR), 0x8000_3944);
        assert_eq!(io.read_u8(PCI_CONFIG_ADDR + 3), 0x80);
    }
}
