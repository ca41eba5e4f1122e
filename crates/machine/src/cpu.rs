//! The CPU backend seam.
//!
//! The board does not interpret instructions; an execution engine is plugged
//! in behind [`CpuBackend`] and drives the buses through [`MachineBus`].

use std::sync::{Arc, Mutex};

use memory::AddressSpace;
use platform::IoPortSpace;

/// Everything a CPU backend may touch: physical memory (data and fetch
/// paths) and port I/O. Clones are cheap handles onto the same board.
#[derive(Clone)]
pub struct MachineBus {
    mem: Arc<AddressSpace>,
    io: Arc<IoPortSpace>,
}

impl MachineBus {
    pub(crate) fn new(mem: Arc<AddressSpace>, io: Arc<IoPortSpace>) -> Self {
        Self { mem, io }
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.mem.read_u8(addr)
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        self.mem.read_u16(addr)
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.mem.read_u32(addr)
    }

    pub fn write_u8(&self, addr: u32, value: u8) {
        self.mem.write_u8(addr, value);
    }

    pub fn write_u16(&self, addr: u32, value: u16) {
        self.mem.write_u16(addr, value);
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        self.mem.write_u32(addr, value);
    }

    pub fn fetch_u8(&self, addr: u32) -> u8 {
        self.mem.fetch_u8(addr)
    }

    pub fn fetch_u16(&self, addr: u32) -> u16 {
        self.mem.fetch_u16(addr)
    }

    pub fn io_read_u8(&self, port: u16) -> u8 {
        self.io.read_u8(port)
    }

    pub fn io_read_u16(&self, port: u16) -> u16 {
        self.io.read_u16(port)
    }

    pub fn io_read_u32(&self, port: u16) -> u32 {
        self.io.read_u32(port)
    }

    pub fn io_write_u8(&self, port: u16, value: u8) {
        self.io.write_u8(port, value);
    }

    pub fn io_write_u16(&self, port: u16, value: u16) {
        self.io.write_u16(port, value);
    }

    pub fn io_write_u32(&self, port: u16, value: u32) {
        self.io.write_u32(port, value);
    }
}

/// A pluggable execution engine.
pub trait CpuBackend: Send {
    /// Runs the backend for one slice; returns executed cycles.
    fn step(&mut self, bus: &mut MachineBus) -> u64;

    /// Interrupt line level change, delivered by the board.
    fn assert_irq(&mut self, line: u8, level: bool);

    fn reset(&mut self);
}

/// A backend that executes nothing. Lets integration tests drive the buses
/// directly while keeping the board wiring identical to a real setup.
#[derive(Debug, Default)]
pub struct NullCpu;

impl CpuBackend for NullCpu {
    fn step(&mut self, _bus: &mut MachineBus) -> u64 {
        0
    }

    fn assert_irq(&mut self, _line: u8, _level: bool) {}

    fn reset(&mut self) {}
}

/// Destination for IRQ assertions the board itself does not interpret.
pub trait IrqSink: Send + Sync {
    fn assert_irq(&self, line: u8, level: bool);
}

/// Default sink: remembers every assertion, in order.
#[derive(Default)]
pub struct RecordingIrqSink {
    events: Mutex<Vec<(u8, bool)>>,
}

impl RecordingIrqSink {
    pub fn events(&self) -> Vec<(u8, bool)> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IrqSink for RecordingIrqSink {
    fn assert_irq(&self, line: u8, level: bool) {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push((line, level));
    }
}
