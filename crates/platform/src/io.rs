use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Value floated for a byte read nothing claims.
pub const OPEN_BUS_PORT: u8 = 0xFF;

/// A port-range handler. Port I/O is byte-granular on the wire; wider
/// accesses are composed by [`IoPortSpace`]. Handlers take `&self` and use
/// interior mutability so a handler may re-enter the port space (a device
/// responding to a write can perform its own I/O).
pub trait PortIoHandler: Send + Sync {
    fn read(&self, port: u16) -> u8;
    fn write(&self, port: u16, value: u8);
}

/// Metadata snapshot of a registered range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRangeInfo {
    pub start: u16,
    pub end: u16,
    pub device: String,
}

struct PortRange {
    start: u16,
    end: u16, // inclusive
    device: String,
    handler: Arc<dyn PortIoHandler>,
}

impl PortRange {
    #[inline]
    fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    #[inline]
    fn overlaps(&self, start: u16, end: u16) -> bool {
        start <= self.end && self.start <= end
    }
}

/// The 16-bit I/O port space.
///
/// One coarse lock protects the range list; the owning handler is cloned out
/// and the lock released before dispatch, so handlers may re-enter the port
/// space without deadlocking. Unclaimed ports float high on reads and swallow
/// writes, logged at debug level.
#[derive(Default)]
pub struct IoPortSpace {
    ranges: Mutex<Vec<PortRange>>,
}

impl IoPortSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `[start, end]` (inclusive) to `device`. Fails (false, logged)
    /// when the interval is inverted or overlaps a live range; existing
    /// registrations are left untouched on failure.
    pub fn register_range(
        &self,
        start: u16,
        end: u16,
        device: &str,
        handler: Arc<dyn PortIoHandler>,
    ) -> bool {
        if start > end {
            debug!("rejecting inverted port range {start:#x}..={end:#x} for {device:?}");
            return false;
        }
        let mut ranges = self.lock();
        if let Some(existing) = ranges.iter().find(|r| r.overlaps(start, end)) {
            let clash = existing.device.clone();
            drop(ranges);
            debug!(
                "port range {start:#x}..={end:#x} for {device:?} overlaps {clash:?}; rejecting"
            );
            return false;
        }
        ranges.push(PortRange {
            start,
            end,
            device: device.to_owned(),
            handler,
        });
        true
    }

    /// Removes the range registered with exactly `(start, end)`.
    pub fn unregister_range(&self, start: u16, end: u16) -> bool {
        let mut ranges = self.lock();
        let before = ranges.len();
        ranges.retain(|r| !(r.start == start && r.end == end));
        ranges.len() != before
    }

    /// The range owning `port`, if any.
    pub fn range_at(&self, port: u16) -> Option<PortRangeInfo> {
        self.lock().iter().find(|r| r.contains(port)).map(|r| PortRangeInfo {
            start: r.start,
            end: r.end,
            device: r.device.clone(),
        })
    }

    pub fn read_u8(&self, port: u16) -> u8 {
        match self.handler_for(port) {
            Some(handler) => handler.read(port),
            None => {
                debug!("port read {port:#x} unclaimed; floating {OPEN_BUS_PORT:#x}");
                OPEN_BUS_PORT
            }
        }
    }

    pub fn write_u8(&self, port: u16, value: u8) {
        match self.handler_for(port) {
            Some(handler) => handler.write(port, value),
            None => debug!("port write {port:#x} <- {value:#x} unclaimed; dropped"),
        }
    }

    /// Word access composed from byte accesses, low byte at the lower port.
    pub fn read_u16(&self, port: u16) -> u16 {
        let lo = self.read_u8(port);
        let hi = self.read_u8(port.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    pub fn write_u16(&self, port: u16, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(port, lo);
        self.write_u8(port.wrapping_add(1), hi);
    }

    pub fn read_u32(&self, port: u16) -> u32 {
        let mut bytes = [0u8; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.read_u8(port.wrapping_add(i as u16));
        }
        u32::from_le_bytes(bytes)
    }

    pub fn write_u32(&self, port: u16, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.write_u8(port.wrapping_add(i as u16), b);
        }
    }

    fn handler_for(&self, port: u16) -> Option<Arc<dyn PortIoHandler>> {
        // Clone the Arc and release the lock before dispatch: handlers may
        // re-enter the port space.
        self.lock()
            .iter()
            .find(|r| r.contains(port))
            .map(|r| Arc::clone(&r.handler))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PortRange>> {
        match self.ranges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

    /// A register file shared by every port of a range.
    #[derive(Default)]
    struct LatchPorts {
        base: u16,
        regs: [AtomicU8; 8],
    }

    impl PortIoHandler for LatchPorts {
        fn read(&self, port: u16) -> u8 {
            self.regs[usize::from(port - self.base) & 7].load(Ordering::SeqCst)
        }

        fn write(&self, port: u16, value: u8) {
            self.regs[usize::from(port - self.base) & 7].store(value, Ordering::SeqCst);
        }
    }

    #[test]
    fn unclaimed_ports_float_high_and_drop_writes() {
        let io = IoPortSpace::new();
        assert_eq!(io.read_u8(0x0999), 0xFF);
        assert_eq!(io.read_u16(0x0999), 0xFFFF);
        assert_eq!(io.read_u32(0x0999), 0xFFFF_FFFF);
        io.write_u8(0x0999, 0x42);
        assert_eq!(io.read_u8(0x0999), 0xFF);
    }

    #[test]
    fn overlapping_registration_is_rejected() {
        let io = IoPortSpace::new();
        assert!(io.register_range(
            0x1F0,
            0x1F7,
            "ide0",
            Arc::new(LatchPorts { base: 0x1F0, ..Default::default() }),
        ));
        // Second registration covering part of the same interval must fail.
        assert!(!io.register_range(
            0x1F0,
            0x1F3,
            "ide0-again",
            Arc::new(LatchPorts { base: 0x1F0, ..Default::default() }),
        ));
        assert!(!io.register_range(
            0x1EF,
            0x1F0,
            "edge",
            Arc::new(LatchPorts { base: 0x1EF, ..Default::default() }),
        ));
        // Inverted interval.
        assert!(!io.register_range(
            0x200,
            0x1FF,
            "inverted",
            Arc::new(LatchPorts { base: 0x200, ..Default::default() }),
        ));
        // Adjacent is fine.
        assert!(io.register_range(
            0x1F8,
            0x1FF,
            "neighbor",
            Arc::new(LatchPorts { base: 0x1F8, ..Default::default() }),
        ));
        assert_eq!(io.range_at(0x1F0).unwrap().device, "ide0");
    }

    #[test]
    fn wide_accesses_compose_little_endian() {
        let io = IoPortSpace::new();
        assert!(io.register_range(
            0x300,
            0x307,
            "latch",
            Arc::new(LatchPorts { base: 0x300, ..Default::default() }),
        ));

        io.write_u16(0x300, 0xBEEF);
        assert_eq!(io.read_u8(0x300), 0xEF);
        assert_eq!(io.read_u8(0x301), 0xBE);
        assert_eq!(io.read_u16(0x300), 0xBEEF);

        io.write_u32(0x304, 0x0102_0304);
        assert_eq!(io.read_u8(0x304), 0x04);
        assert_eq!(io.read_u8(0x307), 0x01);
        assert_eq!(io.read_u32(0x304), 0x0102_0304);
    }

    #[test]
    fn wide_access_straddling_a_range_mixes_open_bus_bytes() {
        let io = IoPortSpace::new();
        assert!(io.register_range(
            0x3F4,
            0x3F7,
            "ctl",
            Arc::new(LatchPorts { base: 0x3F4, ..Default::default() }),
        ));
        io.write_u8(0x3F7, 0x12);
        // Low byte from the range, high byte floats.
        assert_eq!(io.read_u16(0x3F7), 0xFF12);
    }

    #[test]
    fn unregister_then_remap_leaves_no_stale_handlers() {
        let io = IoPortSpace::new();
        let first = Arc::new(LatchPorts { base: 0x1F0, ..Default::default() });
        assert!(io.register_range(0x1F0, 0x1F7, "ide-legacy", first));
        io.write_u8(0x1F0, 0xAA);
        assert_eq!(io.read_u8(0x1F0), 0xAA);

        assert!(io.unregister_range(0x1F0, 0x1F7));
        assert!(!io.unregister_range(0x1F0, 0x1F7));
        assert_eq!(io.read_u8(0x1F0), 0xFF);
        io.write_u8(0x1F0, 0xBB);
        assert_eq!(io.read_u8(0x1F0), 0xFF);

        let second = Arc::new(LatchPorts { base: 0xC000, ..Default::default() });
        assert!(io.register_range(0xC000, 0xC007, "ide-native", second));
        io.write_u8(0xC000, 0xCC);
        assert_eq!(io.read_u8(0xC000), 0xCC);
        assert_eq!(io.read_u8(0x1F0), 0xFF);
    }

    #[test]
    fn handlers_may_reenter_the_port_space() {
        struct Chained {
            io: Arc<IoPortSpace>,
            observed: AtomicU32,
        }

        impl PortIoHandler for Chained {
            fn read(&self, _port: u16) -> u8 {
                self.observed.load(Ordering::SeqCst) as u8
            }

            fn write(&self, _port: u16, value: u8) {
                // A device reacting to a write by driving another device.
                self.io.write_u8(0x310, value);
                self.observed.store(u32::from(value), Ordering::SeqCst);
            }
        }

        let io = Arc::new(IoPortSpace::new());
        assert!(io.register_range(
            0x310,
            0x317,
            "latch",
            Arc::new(LatchPorts { base: 0x310, ..Default::default() }),
        ));
        assert!(io.register_range(
            0x320,
            0x320,
            "chained",
            Arc::new(Chained { io: io.clone(), observed: AtomicU32::new(0) }),
        ));

        io.write_u8(0x320, 0x42);
        assert_eq!(io.read_u8(0x310), 0x42);
        assert_eq!(io.read_u8(0x320), 0x42);
    }
}
