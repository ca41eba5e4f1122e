//! The host-to-PCI bridge at 00:00.0.
//!
//! Owns the chipset view of the first megabyte: shadow-RAM window control,
//! SMRAM relocation, and the AGP aperture registers. All remapping is
//! unmap-then-remap against the shared address space, so a half-updated
//! window is never visible.

use std::sync::Arc;

use memory::{AddressSpace, MemoryRegion, RegionKind, RegionPerms};
use tracing::{debug, warn};

use crate::pci::{PciBarDefinition, PciConfigSpace, PciFunction};

/// Shadow window control, dword. Bit `i` read-enables window `i`, bit
/// `16 + i` write-enables it.
pub const SHADOW_CTRL_REG: u16 = 0x60;
/// SMRAM control, byte. Bit 3 enables the mapping, bits 0..=2 select a row
/// of [`SMRAM_MAP`].
pub const SMRAM_CTRL_REG: u16 = 0x70;
/// AGP aperture size, byte.
pub const APSIZE_REG: u16 = 0xb4;

/// The thirteen shadow windows: twelve 16 KiB windows covering
/// 0xC0000..0xF0000 and one 64 KiB window for the F segment.
pub const SHADOW_WINDOWS: [(u32, u32); 13] = [
    (0xc0000, 0x4000),
    (0xc4000, 0x4000),
    (0xc8000, 0x4000),
    (0xcc000, 0x4000),
    (0xd0000, 0x4000),
    (0xd4000, 0x4000),
    (0xd8000, 0x4000),
    (0xdc000, 0x4000),
    (0xe0000, 0x4000),
    (0xe4000, 0x4000),
    (0xe8000, 0x4000),
    (0xec000, 0x4000),
    (0xf0000, 0x1_0000),
];

/// SMRAM relocation rows: (guest-visible start, size, backing arena offset).
/// The select field of the control byte indexes this table directly.
pub const SMRAM_MAP: [(u32, u32, u32); 8] = [
    (0xa0000, 0x2_0000, 0xa0000),
    (0xa0000, 0x1_0000, 0xa0000),
    (0xb0000, 0x1_0000, 0xb0000),
    (0xe0000, 0x1_0000, 0xa0000),
    (0xe0000, 0x1_0000, 0xb0000),
    (0xe0000, 0x1_0000, 0xe0000),
    (0xf0000, 0x1_0000, 0xa0000),
    (0xb0000, 0x1_0000, 0xa0000),
];

fn aperture_bytes(apsize: u8) -> Option<u32> {
    match apsize & 0x3f {
        0x00 => Some(256 << 20),
        0x20 => Some(128 << 20),
        0x30 => Some(64 << 20),
        0x38 => Some(32 << 20),
        0x3c => Some(16 << 20),
        0x3e => Some(8 << 20),
        0x3f => Some(4 << 20),
        _ => None,
    }
}

pub struct HostBridge {
    mem: Arc<AddressSpace>,
    config: PciConfigSpace,
    shadow_mapped: [bool; 13],
    smram_mapped: Option<(u32, u32)>,
    /// ROM regions displaced by a shadow or SMRAM mapping, restored verbatim
    /// once nothing overlaps them any more.
    displaced_roms: Vec<MemoryRegion>,
}

impl HostBridge {
    pub fn new(mem: Arc<AddressSpace>) -> Self {
        Self {
            mem,
            config: Self::power_on_config(),
            shadow_mapped: [false; 13],
            smram_mapped: None,
            displaced_roms: Vec::new(),
        }
    }

    fn power_on_config() -> PciConfigSpace {
        let mut config = PciConfigSpace::new(0x8086, 0x7190);
        config.set_class(0x06, 0x00, 0x00);
        config.set_revision(0x02);
        config.set_header_type(0x00);
        config.set_command(0x0006);
        config.define_bar(0, PciBarDefinition::Mmio32 {
            size: aperture_bytes(0).unwrap_or(256 << 20),
            prefetchable: true,
        });
        // AGP 2.0 capability: revision byte, pad, status dword, command dword.
        let cap = config.add_capability(0x02, &[0x20, 0x00, 0x07, 0x02, 0x00, 0x1f, 0x00, 0x00, 0x00, 0x00]);
        config.set_read_only(u16::from(cap) + 2, 6);
        config
    }

    /// Pulls every ROM region overlapping `[start, start+size)` out of the
    /// map, remembering it for later restoration.
    fn displace_roms(&mut self, start: u32, size: u32) {
        loop {
            let rom = self
                .mem
                .regions()
                .into_iter()
                .find(|r| r.kind == RegionKind::Rom && r.overlaps(start, size));
            let Some(rom) = rom else {
                break;
            };
            debug!("displacing ROM {:?} for chipset mapping at {start:#x}", rom.name);
            self.mem.unregister_region(rom.start, rom.size);
            self.displaced_roms.push(rom);
        }
    }

    /// Puts displaced ROM regions back wherever no chipset mapping overlaps
    /// them any more.
    fn restore_roms(&mut self) {
        let mut kept = Vec::new();
        for rom in std::mem::take(&mut self.displaced_roms) {
            let shadowed = self
                .shadow_mapped
                .iter()
                .zip(SHADOW_WINDOWS.iter())
                .any(|(mapped, &(start, size))| *mapped && rom.overlaps(start, size));
            let in_smram = self
                .smram_mapped
                .is_some_and(|(start, size)| rom.overlaps(start, size));
            if shadowed || in_smram {
                kept.push(rom);
            } else if !self.mem.register_region(
                rom.start,
                rom.size,
                rom.kind,
                &rom.name,
                rom.perms,
                rom.backing_offset,
            ) {
                warn!("could not restore displaced ROM {:?} at {:#x}", rom.name, rom.start);
                kept.push(rom);
            }
        }
        self.displaced_roms = kept;
    }

    /// Rebuilds all thirteen shadow windows from the control dword.
    fn resync_shadow(&mut self) {
        let ctrl = self.config.read(SHADOW_CTRL_REG, 4);
        let mut want = [None; 13];
        for (i, slot) in want.iter_mut().enumerate() {
            let readable = ctrl & (1 << i) != 0;
            let writable = ctrl & (1 << (16 + i)) != 0;
            *slot = match (readable, writable) {
                (false, false) => None,
                (true, false) => Some(RegionPerms::RX),
                (false, true) => Some(RegionPerms::WRITE),
                (true, true) => Some(RegionPerms::RWX),
            };
        }

        for (mapped, &(start, size)) in self.shadow_mapped.iter_mut().zip(SHADOW_WINDOWS.iter()) {
            if *mapped {
                self.mem.unregister_region(start, size);
                *mapped = false;
            }
        }
        for (i, &(start, size)) in SHADOW_WINDOWS.iter().enumerate() {
            let Some(perms) = want[i] else {
                continue;
            };
            self.displace_roms(start, size);
            let name = format!("shadow-{start:05x}");
            self.shadow_mapped[i] =
                self.mem
                    .register_region(start, size, RegionKind::Shadow, &name, perms, start);
        }
        self.restore_roms();
    }

    /// Rebuilds the SMRAM alias from the control byte.
    fn resync_smram(&mut self) {
        let ctl = self.config.read(SMRAM_CTRL_REG, 1) as u8;
        if let Some((start, size)) = self.smram_mapped.take() {
            self.mem.unregister_region(start, size);
        }
        if ctl & 0x08 != 0 {
            let (start, size, source) = SMRAM_MAP[usize::from(ctl & 0x07)];
            self.displace_roms(start, size);
            if self.mem.register_region(
                start,
                size,
                RegionKind::Shadow,
                "smram",
                RegionPerms::RWX,
                source,
            ) {
                self.smram_mapped = Some((start, size));
            } else {
                warn!("SMRAM row {} at {start:#x} could not be mapped", ctl & 0x07);
            }
        }
        self.restore_roms();
    }

    /// Re-masks the aperture BAR after an APSIZE write. Unrecognized size
    /// patterns leave the current aperture alone.
    fn resync_aperture(&mut self) {
        let apsize = self.config.read(APSIZE_REG, 1) as u8;
        match aperture_bytes(apsize) {
            Some(size) => self.config.define_bar(0, PciBarDefinition::Mmio32 {
                size,
                prefetchable: true,
            }),
            None => warn!("ignoring unrecognized APSIZE pattern {apsize:#04x}"),
        }
    }
}

fn touches(reg: u16, size: u8, field_reg: u16, field_len: u16) -> bool {
    reg < field_reg + field_len && field_reg < reg + u16::from(size)
}

impl PciFunction for HostBridge {
    fn name(&self) -> &str {
        "host bridge"
    }

    fn config_read(&mut self, function: u8, reg: u16, size: u8) -> u32 {
        if function != 0 {
            return match size {
                1 => 0xff,
                2 => 0xffff,
                _ => 0xffff_ffff,
            };
        }
        self.config.read(reg, size)
    }

    fn config_write(&mut self, function: u8, reg: u16, size: u8, value: u32) {
        if function != 0 {
            return;
        }
        self.config.write(reg, size, value);
        if touches(reg, size, SHADOW_CTRL_REG, 4) {
            self.resync_shadow();
        }
        if touches(reg, size, SMRAM_CTRL_REG, 1) {
            self.resync_smram();
        }
        if touches(reg, size, APSIZE_REG, 1) {
            self.resync_aperture();
        }
    }

    fn map_special_regions(&mut self) {
        self.resync_shadow();
        self.resync_smram();
        self.resync_aperture();
    }

    fn reset(&mut self) {
        self.config = Self::power_on_config();
        self.map_special_regions();
    }
}
