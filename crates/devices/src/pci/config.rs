use tracing::debug;

use super::PciInterruptPin;

/// Size class of one base address register.
///
/// BAR slots store the raw value the guest last wrote; the guest-visible view
/// masks off the bits below the decode size and ORs in the space-indicator
/// flags, which is exactly what makes all-ones sizing probes read back as the
/// size mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBarDefinition {
    /// I/O-space BAR. `size` is the decode span in ports, a power of two.
    Io { size: u32 },
    /// 32-bit non-64-bit-capable memory BAR.
    Mmio32 { size: u32, prefetchable: bool },
}

impl PciBarDefinition {
    fn base_mask(&self) -> u32 {
        match *self {
            PciBarDefinition::Io { size } => !(size - 1) & 0xffff_fffc,
            PciBarDefinition::Mmio32 { size, .. } => !(size - 1) & 0xffff_fff0,
        }
    }

    fn flag_bits(&self) -> u32 {
        match *self {
            PciBarDefinition::Io { .. } => 0x1,
            PciBarDefinition::Mmio32 { prefetchable, .. } => {
                if prefetchable {
                    0x8
                } else {
                    0x0
                }
            }
        }
    }
}

/// What a guest config write actually changed, so the owning device knows
/// which mappings to rebuild.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PciConfigWriteEffects {
    pub command_changed: bool,
    pub prog_if_changed: bool,
    /// One bit per BAR index whose raw value changed.
    pub bars_changed: u8,
}

impl PciConfigWriteEffects {
    pub fn any(&self) -> bool {
        self.command_changed || self.prog_if_changed || self.bars_changed != 0
    }
}

/// The 256-byte type-0 configuration space of one PCI function.
///
/// Byte-granular: wider guest accesses are little-endian compositions, so the
/// config mechanism can forward its byte-enable decode directly. Header
/// identity bytes are read-only to the guest; device-side `set_*` methods
/// bypass that. The prog-if byte is writable only through an explicit per-bit
/// mask (zero by default).
pub struct PciConfigSpace {
    bytes: [u8; 256],
    read_only: [bool; 256],
    bars: [Option<PciBarDefinition>; 6],
    prog_if_write_mask: u8,
    last_cap_offset: Option<u8>,
    next_free_cap: u8,
}

const PROG_IF: usize = 0x09;
const BAR_FIRST: usize = 0x10;
const BAR_END: usize = 0x28;

impl PciConfigSpace {
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut config = Self {
            bytes: [0; 256],
            read_only: [false; 256],
            bars: [None; 6],
            prog_if_write_mask: 0,
            last_cap_offset: None,
            next_free_cap: 0x40,
        };
        config.bytes[0x00..0x02].copy_from_slice(&vendor_id.to_le_bytes());
        config.bytes[0x02..0x04].copy_from_slice(&device_id.to_le_bytes());
        for reg in [0x00, 0x01, 0x02, 0x03, 0x06, 0x07, 0x08, 0x0a, 0x0b, 0x0e, 0x34, 0x3d] {
            config.read_only[reg] = true;
        }
        // Subsystem identity and the (unimplemented) expansion ROM register.
        for reg in 0x2c..0x34 {
            config.read_only[reg] = true;
        }
        config
    }

    pub fn set_class(&mut self, base: u8, sub: u8, prog_if: u8) {
        self.bytes[0x0b] = base;
        self.bytes[0x0a] = sub;
        self.bytes[PROG_IF] = prog_if;
    }

    pub fn set_revision(&mut self, revision: u8) {
        self.bytes[0x08] = revision;
    }

    pub fn set_header_type(&mut self, header_type: u8) {
        self.bytes[0x0e] = header_type;
    }

    pub fn set_subsystem(&mut self, vendor_id: u16, device_id: u16) {
        self.bytes[0x2c..0x2e].copy_from_slice(&vendor_id.to_le_bytes());
        self.bytes[0x2e..0x30].copy_from_slice(&device_id.to_le_bytes());
    }

    pub fn set_command(&mut self, command: u16) {
        self.bytes[0x04..0x06].copy_from_slice(&command.to_le_bytes());
    }

    pub fn set_interrupt_pin(&mut self, pin: Option<PciInterruptPin>) {
        self.bytes[0x3d] = pin.map_or(0, |p| p as u8);
    }

    /// Device-side override of which prog-if bits the guest may flip.
    pub fn set_prog_if_write_mask(&mut self, mask: u8) {
        self.prog_if_write_mask = mask;
    }

    /// Device-side prog-if store, mask-exempt.
    pub fn set_prog_if(&mut self, prog_if: u8) {
        self.bytes[PROG_IF] = prog_if;
    }

    pub fn command(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0x04], self.bytes[0x05]])
    }

    pub fn prog_if(&self) -> u8 {
        self.bytes[PROG_IF]
    }

    /// Declares (or resizes) a BAR slot. `size` must be a power of two and at
    /// least the minimum decode granule of the space. The raw stored value is
    /// kept, so resizing an aperture register re-masks the existing base.
    pub fn define_bar(&mut self, index: usize, definition: PciBarDefinition) {
        let size = match definition {
            PciBarDefinition::Io { size } => size,
            PciBarDefinition::Mmio32 { size, .. } => size,
        };
        debug_assert!(size.is_power_of_two());
        debug_assert!(size >= 4);
        self.bars[index] = Some(definition);
    }

    /// Device-side base store (power-on defaults).
    pub fn set_bar_base(&mut self, index: usize, base: u32) {
        let reg = BAR_FIRST + index * 4;
        self.bytes[reg..reg + 4].copy_from_slice(&base.to_le_bytes());
    }

    fn bar_raw(&self, index: usize) -> u32 {
        let reg = BAR_FIRST + index * 4;
        u32::from_le_bytes([
            self.bytes[reg],
            self.bytes[reg + 1],
            self.bytes[reg + 2],
            self.bytes[reg + 3],
        ])
    }

    /// The guest-visible dword of BAR `index`.
    pub fn bar_value(&self, index: usize) -> u32 {
        match self.bars[index] {
            None => 0,
            Some(def) => (self.bar_raw(index) & def.base_mask()) | def.flag_bits(),
        }
    }

    /// The decoded base of BAR `index`, or `None` when the slot is undefined,
    /// unprogrammed, or mid sizing probe.
    pub fn bar_base(&self, index: usize) -> Option<u32> {
        let def = self.bars[index]?;
        let raw = self.bar_raw(index);
        if raw == 0xffff_ffff {
            return None;
        }
        let base = raw & def.base_mask();
        (base != 0).then_some(base)
    }

    pub fn bar_definition(&self, index: usize) -> Option<PciBarDefinition> {
        self.bars[index]
    }

    /// Appends a capability node (`id` + `body`) to the linked list, marking
    /// the id/next bytes read-only and setting the capabilities status bit.
    /// Returns the register offset of the node.
    pub fn add_capability(&mut self, id: u8, body: &[u8]) -> u8 {
        let offset = self.next_free_cap;
        let off = offset as usize;
        assert!(off + 2 + body.len() <= 0x100, "capability list overflows config space");
        self.bytes[off] = id;
        self.bytes[off + 1] = 0;
        self.bytes[off + 2..off + 2 + body.len()].copy_from_slice(body);
        self.read_only[off] = true;
        self.read_only[off + 1] = true;
        match self.last_cap_offset {
            Some(prev) => self.bytes[prev as usize + 1] = offset,
            None => {
                self.bytes[0x34] = offset;
                self.bytes[0x06] |= 0x10;
            }
        }
        self.last_cap_offset = Some(offset);
        self.next_free_cap = ((off + 2 + body.len() + 3) & !3) as u8;
        offset
    }

    /// Freezes a span of registers against guest writes (capability status
    /// words and similar).
    pub fn set_read_only(&mut self, reg: u16, len: usize) {
        for i in 0..len {
            self.read_only[reg as usize + i] = true;
        }
    }

    fn view_byte(&self, reg: usize) -> u8 {
        if reg >= 0x100 {
            return 0xff;
        }
        if (BAR_FIRST..BAR_END).contains(&reg) {
            let index = (reg - BAR_FIRST) / 4;
            let shift = 8 * ((reg - BAR_FIRST) % 4);
            return (self.bar_value(index) >> shift) as u8;
        }
        self.bytes[reg]
    }

    /// Little-endian read of `size` (1, 2 or 4) bytes at `reg`. Bytes past
    /// the end of config space float high.
    pub fn read(&self, reg: u16, size: u8) -> u32 {
        let mut value = 0u32;
        for i in 0..usize::from(size) {
            value |= u32::from(self.view_byte(reg as usize + i)) << (8 * i as u32);
        }
        value
    }

    fn write_byte(&mut self, reg: usize, value: u8) {
        if reg >= 0x100 {
            return;
        }
        if (BAR_FIRST..BAR_END).contains(&reg) {
            let index = (reg - BAR_FIRST) / 4;
            if self.bars[index].is_some() {
                self.bytes[reg] = value;
            }
            return;
        }
        if reg == PROG_IF {
            let mask = self.prog_if_write_mask;
            self.bytes[reg] = (self.bytes[reg] & !mask) | (value & mask);
            return;
        }
        if self.read_only[reg] {
            debug!("dropping write of {value:#04x} to read-only config byte {reg:#04x}");
            return;
        }
        self.bytes[reg] = value;
    }

    /// Little-endian write of `size` (1, 2 or 4) bytes at `reg`. Read-only
    /// bytes within the span are silently skipped.
    pub fn write(&mut self, reg: u16, size: u8, value: u32) {
        for i in 0..u32::from(size) {
            self.write_byte(reg as usize + i as usize, (value >> (8 * i)) as u8);
        }
    }

    /// [`Self::write`] plus a diff of the mapping-relevant state, so callers
    /// can rebuild decode windows only when something they track moved.
    pub fn write_with_effects(&mut self, reg: u16, size: u8, value: u32) -> PciConfigWriteEffects {
        let command_before = self.command();
        let prog_if_before = self.prog_if();
        let bars_before: [u32; 6] = core::array::from_fn(|i| self.bar_raw(i));
        self.write(reg, size, value);
        let mut effects = PciConfigWriteEffects {
            command_changed: self.command() != command_before,
            prog_if_changed: self.prog_if() != prog_if_before,
            bars_changed: 0,
        };
        for (i, before) in bars_before.iter().enumerate() {
            if self.bar_raw(i) != *before {
                effects.bars_changed |= 1 << i;
            }
        }
        effects
    }
}
