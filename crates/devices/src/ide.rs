//! The PCI IDE controller at 00:07.1.
//!
//! Two channels, each decodable at the legacy fixed ports or wherever the
//! first four BARs point, selected per channel by the prog-if bits. The
//! command protocol itself is out of scope here: the task-file registers are
//! plain latches and status always reports ready.

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use platform::{IoPortSpace, PortIoHandler};
use tracing::debug;

use crate::pci::{PciBarDefinition, PciConfigSpace, PciFunction, PciInterruptPin};

/// Chipset extension register; bit 0 selects compatible (legacy-only) mode.
pub const IDE_COMPAT_REG: u16 = 0x40;

const IDE_FUNCTION: u8 = 1;

const LEGACY_PRIMARY_CMD: u16 = 0x1f0;
const LEGACY_PRIMARY_CTRL: u16 = 0x3f4;
const LEGACY_SECONDARY_CMD: u16 = 0x170;
const LEGACY_SECONDARY_CTRL: u16 = 0x374;

/// Drive ready, seek complete, not busy.
const STATUS_READY: u8 = 0x50;

/// The eight-port command block. Registers are latches except status, which
/// is hardwired ready.
#[derive(Default)]
struct CommandBlockPorts {
    base: AtomicU16,
    regs: [AtomicU8; 8],
}

impl PortIoHandler for CommandBlockPorts {
    fn read(&self, port: u16) -> u8 {
        let reg = usize::from(port.wrapping_sub(self.base.load(Ordering::Relaxed))) & 7;
        if reg == 7 {
            STATUS_READY
        } else {
            self.regs[reg].load(Ordering::Relaxed)
        }
    }

    fn write(&self, port: u16, value: u8) {
        let reg = usize::from(port.wrapping_sub(self.base.load(Ordering::Relaxed))) & 7;
        self.regs[reg].store(value, Ordering::Relaxed);
    }
}

/// The four-port control block. Only offset 2 (alternate status / device
/// control) is decoded; the rest floats.
#[derive(Default)]
struct ControlBlockPorts {
    base: AtomicU16,
    control: AtomicU8,
}

impl PortIoHandler for ControlBlockPorts {
    fn read(&self, port: u16) -> u8 {
        let reg = port.wrapping_sub(self.base.load(Ordering::Relaxed)) & 3;
        if reg == 2 {
            STATUS_READY
        } else {
            0xff
        }
    }

    fn write(&self, port: u16, value: u8) {
        let reg = port.wrapping_sub(self.base.load(Ordering::Relaxed)) & 3;
        if reg == 2 {
            self.control.store(value, Ordering::Relaxed);
        }
    }
}

/// The sixteen-port bus-master block (BAR4); pure latches.
#[derive(Default)]
struct BusMasterPorts {
    base: AtomicU16,
    regs: [AtomicU8; 16],
}

impl PortIoHandler for BusMasterPorts {
    fn read(&self, port: u16) -> u8 {
        let reg = usize::from(port.wrapping_sub(self.base.load(Ordering::Relaxed))) & 15;
        self.regs[reg].load(Ordering::Relaxed)
    }

    fn write(&self, port: u16, value: u8) {
        let reg = usize::from(port.wrapping_sub(self.base.load(Ordering::Relaxed))) & 15;
        self.regs[reg].store(value, Ordering::Relaxed);
    }
}

struct Channel {
    cmd: Arc<CommandBlockPorts>,
    ctrl: Arc<ControlBlockPorts>,
}

pub struct IdeController {
    io: Arc<IoPortSpace>,
    config: PciConfigSpace,
    channels: [Channel; 2],
    busmaster: Arc<BusMasterPorts>,
    /// Port ranges currently registered, torn down wholesale on every remap.
    mapped: Vec<(u16, u16)>,
}

impl IdeController {
    pub fn new(io: Arc<IoPortSpace>) -> Self {
        Self {
            io,
            config: Self::power_on_config(),
            channels: [
                Channel {
                    cmd: Arc::new(CommandBlockPorts::default()),
                    ctrl: Arc::new(ControlBlockPorts::default()),
                },
                Channel {
                    cmd: Arc::new(CommandBlockPorts::default()),
                    ctrl: Arc::new(ControlBlockPorts::default()),
                },
            ],
            busmaster: Arc::new(BusMasterPorts::default()),
            mapped: Vec::new(),
        }
    }

    fn power_on_config() -> PciConfigSpace {
        let mut config = PciConfigSpace::new(0x8086, 0x7111);
        // Native-capable on both channels, bus-master capable, native at
        // power-on with the BARs parked on the legacy addresses.
        config.set_class(0x01, 0x01, 0x8f);
        config.set_revision(0x01);
        config.set_header_type(0x80);
        config.set_command(0x0005);
        config.set_interrupt_pin(Some(PciInterruptPin::IntA));
        config.set_prog_if_write_mask(0x05);
        config.define_bar(0, PciBarDefinition::Io { size: 8 });
        config.define_bar(1, PciBarDefinition::Io { size: 4 });
        config.define_bar(2, PciBarDefinition::Io { size: 8 });
        config.define_bar(3, PciBarDefinition::Io { size: 4 });
        config.define_bar(4, PciBarDefinition::Io { size: 16 });
        config.set_bar_base(0, u32::from(LEGACY_PRIMARY_CMD));
        config.set_bar_base(1, u32::from(LEGACY_PRIMARY_CTRL));
        config.set_bar_base(2, u32::from(LEGACY_SECONDARY_CMD));
        config.set_bar_base(3, u32::from(LEGACY_SECONDARY_CTRL));
        config
    }

    /// Where a channel currently decodes: the legacy pair when its native
    /// prog-if bit is clear, else its BAR pair (nothing while unprogrammed).
    fn channel_ports(&self, channel: usize) -> Option<(u16, u16)> {
        let native_bit = if channel == 0 { 0x01 } else { 0x04 };
        if self.config.prog_if() & native_bit == 0 {
            return Some(if channel == 0 {
                (LEGACY_PRIMARY_CMD, LEGACY_PRIMARY_CTRL)
            } else {
                (LEGACY_SECONDARY_CMD, LEGACY_SECONDARY_CTRL)
            });
        }
        let cmd = self.config.bar_base(channel * 2)?;
        let ctrl = self.config.bar_base(channel * 2 + 1)?;
        if cmd > 0xffff - 7 || ctrl > 0xffff - 3 {
            debug!("IDE channel {channel} BAR base out of port range, not decoding");
            return None;
        }
        Some((cmd as u16, ctrl as u16))
    }

    /// Tears down every decoded range and rebuilds from current config
    /// state. The port space never sees a half-moved channel.
    fn remap(&mut self) {
        for (start, end) in self.mapped.drain(..) {
            self.io.unregister_range(start, end);
        }
        for channel in 0..2 {
            let Some((cmd, ctrl)) = self.channel_ports(channel) else {
                continue;
            };
            let ports = &self.channels[channel];
            ports.cmd.base.store(cmd, Ordering::Relaxed);
            ports.ctrl.base.store(ctrl, Ordering::Relaxed);
            let cmd_handler = Arc::clone(&ports.cmd) as Arc<dyn PortIoHandler>;
            let ctrl_handler = Arc::clone(&ports.ctrl) as Arc<dyn PortIoHandler>;
            let name = if channel == 0 { "ide0" } else { "ide1" };
            if self.io.register_range(cmd, cmd + 7, name, cmd_handler) {
                self.mapped.push((cmd, cmd + 7));
            }
            if self.io.register_range(ctrl, ctrl + 3, name, ctrl_handler) {
                self.mapped.push((ctrl, ctrl + 3));
            }
        }
        if let Some(base) = self.config.bar_base(4) {
            if base <= 0xffff - 15 {
                let base = base as u16;
                self.busmaster.base.store(base, Ordering::Relaxed);
                let handler = Arc::clone(&self.busmaster) as Arc<dyn PortIoHandler>;
                if self.io.register_range(base, base + 15, "ide-bm", handler) {
                    self.mapped.push((base, base + 15));
                }
            }
        }
    }

    /// Applies a flip of the compatible-mode bit: forcing compatible clears
    /// all four prog-if mode bits and parks the interrupt pin; leaving it
    /// restores native decode and INTA.
    fn apply_compat_mode(&mut self, compatible: bool) {
        if compatible {
            let prog_if = self.config.prog_if() & !0x0f;
            self.config.set_prog_if(prog_if);
            self.config.set_interrupt_pin(None);
        } else {
            let prog_if = self.config.prog_if() | 0x0f;
            self.config.set_prog_if(prog_if);
            self.config.set_interrupt_pin(Some(PciInterruptPin::IntA));
        }
    }
}

impl PciFunction for IdeController {
    fn name(&self) -> &str {
        "ide"
    }

    fn config_read(&mut self, function: u8, reg: u16, size: u8) -> u32 {
        let mut value = 0u32;
        for i in 0..u16::from(size) {
            let r = reg + i;
            // The header-type byte is hardwired, whatever function was asked.
            let byte = if r == 0x0e {
                0x80
            } else if function != IDE_FUNCTION {
                0xff
            } else {
                self.config.read(r, 1) as u8
            };
            value |= u32::from(byte) << (8 * i);
        }
        value
    }

    fn config_write(&mut self, function: u8, reg: u16, size: u8, value: u32) {
        if function != IDE_FUNCTION {
            return;
        }
        let compat_before = self.config.read(IDE_COMPAT_REG, 1) as u8 & 1;
        let effects = self.config.write_with_effects(reg, size, value);
        let compat_after = self.config.read(IDE_COMPAT_REG, 1) as u8 & 1;
        if compat_after != compat_before {
            self.apply_compat_mode(compat_after != 0);
            self.remap();
        } else if effects.prog_if_changed || effects.bars_changed & 0x1f != 0 {
            self.remap();
        }
    }

    fn map_special_regions(&mut self) {
        self.remap();
    }

    fn reset(&mut self) {
        self.config = Self::power_on_config();
        self.remap();
    }
}
