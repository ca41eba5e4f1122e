//! Board assembly: address space, port space, PCI bus with the chipset
//! functions attached, and the CPU backend seam.

mod cpu;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use devices::pci::{register_pci_config_ports, PciBus};
use devices::{HostBridge, IdeController};
use memory::{AddressSpace, AddressSpaceError, RegionKind};
use platform::IoPortSpace;
use thiserror::Error;
use tracing::{debug, warn};

pub use cpu::{CpuBackend, IrqSink, MachineBus, NullCpu, RecordingIrqSink};

/// Caller-owned board configuration. There is no global config store; every
/// collaborator receives what it needs through a constructor.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub conventional_kb: u32,
    pub extended_kb: u32,
    /// Firmware image for the top of the first MiB. `None` installs a stub
    /// that parks the CPU at the reset vector.
    pub bios_path: Option<PathBuf>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            conventional_kb: 640,
            extended_kb: 1024,
            bios_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("failed to read BIOS image {path}: {source}")]
    BiosRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    AddressSpace(#[from] AddressSpaceError),
}

/// A 64 KiB image whose reset vector spins in place.
fn stub_bios() -> Vec<u8> {
    let mut image = vec![0u8; 0x1_0000];
    image[0xfff0] = 0xeb;
    image[0xfff1] = 0xfe;
    image
}

/// The assembled board.
///
/// Owns the three managers and wires the chipset functions into them. CPU
/// execution is external: hand [`Machine::bus`] to a [`CpuBackend`].
pub struct Machine {
    mem: Arc<AddressSpace>,
    io: Arc<IoPortSpace>,
    pci: Arc<Mutex<PciBus>>,
    irq_sink: Arc<dyn IrqSink>,
}

impl Machine {
    pub fn new(config: &MachineConfig) -> Result<Machine, MachineError> {
        let bios = match &config.bios_path {
            Some(path) => std::fs::read(path).map_err(|source| MachineError::BiosRead {
                path: path.clone(),
                source,
            })?,
            None => stub_bios(),
        };
        let mem = Arc::new(AddressSpace::new(
            config.conventional_kb,
            config.extended_kb,
            &bios,
        )?);
        let io = Arc::new(IoPortSpace::new());
        let pci = Arc::new(Mutex::new(PciBus::new()));
        {
            let mut bus = lock(&pci);
            bus.attach(0, 0, Box::new(HostBridge::new(Arc::clone(&mem))));
            bus.attach(0, 7, Box::new(IdeController::new(Arc::clone(&io))));
        }
        if !register_pci_config_ports(&io, Arc::clone(&pci)) {
            warn!("config mechanism ports 0xcf8-0xcff already claimed");
        }
        debug!(
            "board up: {} KiB conventional, {} KiB extended, {} byte BIOS",
            config.conventional_kb,
            config.extended_kb,
            bios.len()
        );
        Ok(Machine {
            mem,
            io,
            pci,
            irq_sink: Arc::new(RecordingIrqSink::default()),
        })
    }

    pub fn memory(&self) -> &Arc<AddressSpace> {
        &self.mem
    }

    pub fn io(&self) -> &Arc<IoPortSpace> {
        &self.io
    }

    pub fn pci(&self) -> &Arc<Mutex<PciBus>> {
        &self.pci
    }

    /// A bus handle for a CPU backend.
    pub fn bus(&self) -> MachineBus {
        MachineBus::new(Arc::clone(&self.mem), Arc::clone(&self.io))
    }

    pub fn set_irq_sink(&mut self, sink: Arc<dyn IrqSink>) {
        self.irq_sink = sink;
    }

    /// Forwards a device interrupt to the installed sink. The board records
    /// or relays the assertion; interpreting it is the sink's business.
    pub fn raise_irq(&self, line: u8, level: bool) {
        self.irq_sink.assert_irq(line, level);
    }

    /// Replaces the ROM region bytes with the image at `path`. The image
    /// must match the ROM region size exactly.
    pub fn load_bios(&self, path: &std::path::Path) -> bool {
        let image = match std::fs::read(path) {
            Ok(image) => image,
            Err(err) => {
                warn!("failed to read BIOS image {}: {err}", path.display());
                return false;
            }
        };
        let Some(rom) = self
            .mem
            .regions()
            .into_iter()
            .find(|r| r.kind == RegionKind::Rom && r.name == "bios")
        else {
            warn!("no BIOS ROM region to load into");
            return false;
        };
        if image.len() != rom.size as usize {
            warn!(
                "BIOS image {} is {} bytes, ROM region holds {}",
                path.display(),
                image.len(),
                rom.size
            );
            return false;
        }
        self.mem.load_image(rom.start, &image)
    }

    /// Soft reset: zero-fills RAM, keeps ROM bytes and all PCI config
    /// programming, and rebuilds every decode window from that state.
    pub fn reset(&self) {
        self.mem.reset();
        lock(&self.pci).remap_all();
    }

    /// Hard reset: additionally returns every PCI function to power-on
    /// config state.
    pub fn power_cycle(&self) {
        self.mem.reset();
        lock(&self.pci).reset();
    }
}

fn lock(pci: &Arc<Mutex<PciBus>>) -> MutexGuard<'_, PciBus> {
    match pci.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
