use crate::region::{MemoryRegion, RegionKind, RegionPerms};
use core::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Value floated on the bus for a byte access nothing claims.
pub const OPEN_BUS_BYTE: u8 = 0xFF;
pub const OPEN_BUS_WORD: u16 = 0xFFFF;
pub const OPEN_BUS_DWORD: u32 = 0xFFFF_FFFF;

/// Largest backing arena we are willing to allocate (bounded prefix of the
/// 32-bit physical space; everything above is open bus).
const MAX_ARENA_SIZE: u64 = 256 * 1024 * 1024;

/// Largest BIOS image accepted at the top of the first MiB.
const MAX_BIOS_SIZE: usize = 0x2_0000;

/// Errors constructing an [`AddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Conventional memory must be 1..=640 KiB.
    InvalidConventionalSize { kb: u32 },
    /// The requested arena exceeds the bounded backing size.
    ArenaTooLarge { bytes: u64 },
    /// The BIOS image is empty or larger than the top-of-1MiB window.
    InvalidBiosImage { len: usize },
}

impl fmt::Display for AddressSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpaceError::InvalidConventionalSize { kb } => {
                write!(f, "invalid conventional memory size: {kb} KiB")
            }
            AddressSpaceError::ArenaTooLarge { bytes } => {
                write!(f, "backing arena too large: {bytes} bytes")
            }
            AddressSpaceError::InvalidBiosImage { len } => {
                write!(f, "invalid BIOS image length: {len} bytes")
            }
        }
    }
}

impl std::error::Error for AddressSpaceError {}

/// The direction of an observed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Snapshot of one access, delivered to observers after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEvent {
    pub address: u32,
    pub size: u8,
    pub kind: AccessKind,
    pub value: u32,
}

type ObserverFn = Arc<dyn Fn(AccessEvent) + Send + Sync>;

struct Observer {
    id: u64,
    start: u32,
    size: u32,
    kind: AccessKind,
    callback: ObserverFn,
}

impl Observer {
    fn matches(&self, event: &AccessEvent) -> bool {
        if self.kind != event.kind {
            return false;
        }
        let obs_end = u64::from(self.start) + u64::from(self.size);
        let acc_end = u64::from(event.address) + u64::from(event.size);
        u64::from(event.address) < obs_end && u64::from(self.start) < acc_end
    }
}

struct SpaceState {
    arena: Box<[u8]>,
    regions: Vec<MemoryRegion>,
    observers: Vec<Observer>,
    next_observer_id: u64,
}

/// The flat physical address space.
///
/// One coarse lock protects the arena, the region list and the observer list
/// so a remap flush can never interleave with an access. Observer callbacks
/// (and log rendering) happen strictly after the lock is released: observers
/// may re-enter the address space.
pub struct AddressSpace {
    state: Mutex<SpaceState>,
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AddressSpace")
            .field("arena_bytes", &state.arena.len())
            .field("regions", &state.regions.len())
            .field("observers", &state.observers.len())
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// Builds the space and registers the built-in regions: conventional RAM
    /// at 0, extended RAM at 1 MiB, and the BIOS ROM at the top of the first
    /// MiB. RAM is identity-mapped (backing offset == physical address) so
    /// chipset shadow windows can alias it by offset; the ROM bytes live past
    /// the RAM span, distinct from the shadow RAM underneath them.
    pub fn new(
        conventional_kb: u32,
        extended_kb: u32,
        bios: &[u8],
    ) -> Result<AddressSpace, AddressSpaceError> {
        if conventional_kb == 0 || conventional_kb > 640 {
            return Err(AddressSpaceError::InvalidConventionalSize {
                kb: conventional_kb,
            });
        }
        if bios.is_empty() || bios.len() > MAX_BIOS_SIZE {
            return Err(AddressSpaceError::InvalidBiosImage { len: bios.len() });
        }

        let ram_span = 0x10_0000u64 + u64::from(extended_kb) * 1024;
        let arena_size = ram_span + bios.len() as u64;
        if arena_size > MAX_ARENA_SIZE {
            return Err(AddressSpaceError::ArenaTooLarge { bytes: arena_size });
        }

        let mut arena = vec![0u8; arena_size as usize].into_boxed_slice();

        let rom_backing = ram_span as u32;
        arena[rom_backing as usize..].copy_from_slice(bios);
        let rom_start = 0x10_0000 - bios.len() as u32;

        let mut regions = Vec::new();
        regions.push(MemoryRegion {
            start: 0,
            size: conventional_kb * 1024,
            kind: RegionKind::Ram,
            perms: RegionPerms::RWX,
            name: "conventional".into(),
            backing_offset: 0,
        });
        if extended_kb > 0 {
            regions.push(MemoryRegion {
                start: 0x10_0000,
                size: extended_kb * 1024,
                kind: RegionKind::Ram,
                perms: RegionPerms::RWX,
                name: "extended".into(),
                backing_offset: 0x10_0000,
            });
        }
        regions.push(MemoryRegion {
            start: rom_start,
            size: bios.len() as u32,
            kind: RegionKind::Rom,
            perms: RegionPerms::RX,
            name: "bios".into(),
            backing_offset: rom_backing,
        });

        Ok(AddressSpace {
            state: Mutex::new(SpaceState {
                arena,
                regions,
                observers: Vec::new(),
                next_observer_id: 1,
            }),
        })
    }

    /// Total bytes in the backing arena.
    pub fn size(&self) -> u64 {
        self.lock().arena.len() as u64
    }

    /// Metadata snapshot of every live region, in registration order.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.lock().regions.clone()
    }

    /// First region containing `addr`, as a metadata copy.
    pub fn region_at(&self, addr: u32) -> Option<MemoryRegion> {
        self.lock()
            .regions
            .iter()
            .find(|r| r.contains(addr))
            .cloned()
    }

    /// Maps `[start, start + size)` onto the arena at `backing_offset`.
    ///
    /// Fails (false, with a warning) when the interval overlaps a live region,
    /// wraps past the top of the 32-bit space, or its backing does not fit
    /// inside the arena. Existing registrations are left untouched on failure.
    pub fn register_region(
        &self,
        start: u32,
        size: u32,
        kind: RegionKind,
        name: &str,
        perms: RegionPerms,
        backing_offset: u32,
    ) -> bool {
        let mut state = self.lock();
        if size == 0 {
            drop(state);
            warn!("rejecting empty region {name:?} at {start:#x}");
            return false;
        }
        if u64::from(start) + u64::from(size) > 1 << 32 {
            drop(state);
            warn!("region {name:?} [{start:#x}+{size:#x}] wraps the physical address space");
            return false;
        }
        if u64::from(backing_offset) + u64::from(size) > state.arena.len() as u64 {
            drop(state);
            warn!("region {name:?} [{start:#x}+{size:#x}] exceeds backing arena");
            return false;
        }
        if let Some(existing) = state.regions.iter().find(|r| r.overlaps(start, size)) {
            let clash = existing.name.clone();
            drop(state);
            warn!("region {name:?} [{start:#x}+{size:#x}] overlaps existing region {clash:?}");
            return false;
        }
        state.regions.push(MemoryRegion {
            start,
            size,
            kind,
            perms,
            name: name.to_owned(),
            backing_offset,
        });
        true
    }

    /// Removes the region registered with exactly `(start, size)`.
    pub fn unregister_region(&self, start: u32, size: u32) -> bool {
        let mut state = self.lock();
        let before = state.regions.len();
        state
            .regions
            .retain(|r| !(r.start == start && r.size == size));
        state.regions.len() != before
    }

    /// Registers an access observer over `[start, start + size)` for `kind`
    /// accesses. Observers are purely observational: they see the access after
    /// it completed and can neither block nor redirect it.
    pub fn register_callback<F>(&self, start: u32, size: u32, kind: AccessKind, callback: F) -> u64
    where
        F: Fn(AccessEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_observer_id;
        state.next_observer_id += 1;
        state.observers.push(Observer {
            id,
            start,
            size,
            kind,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn unregister_callback(&self, id: u64) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|o| o.id != id);
        state.observers.len() != before
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.read(addr, 1, AccessKind::Read) as u8
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        self.read(addr, 2, AccessKind::Read) as u16
    }

    pub fn read_u32(&self, addr: u32) -> u32 {
        self.read(addr, 4, AccessKind::Read)
    }

    /// Instruction-fetch reads, gated on the EXEC permission.
    pub fn fetch_u8(&self, addr: u32) -> u8 {
        self.read(addr, 1, AccessKind::Execute) as u8
    }

    pub fn fetch_u16(&self, addr: u32) -> u16 {
        self.read(addr, 2, AccessKind::Execute) as u16
    }

    pub fn write_u8(&self, addr: u32, value: u8) {
        self.write(addr, 1, u32::from(value));
    }

    pub fn write_u16(&self, addr: u32, value: u16) {
        self.write(addr, 2, u32::from(value));
    }

    pub fn write_u32(&self, addr: u32, value: u32) {
        self.write(addr, 4, value);
    }

    /// Copies `data` into the backing bytes at `start`, ignoring region
    /// permissions. Device-side API for firmware/option-ROM installation;
    /// fails when the range is not covered by a single region.
    pub fn load_image(&self, start: u32, data: &[u8]) -> bool {
        let mut state = self.lock();
        let Some(region) = state
            .regions
            .iter()
            .find(|r| r.contains_range(start, data.len()))
            .cloned()
        else {
            drop(state);
            warn!("image load at {start:#x} ({} bytes) hits no region", data.len());
            return false;
        };
        let off = (region.backing_offset + (start - region.start)) as usize;
        state.arena[off..off + data.len()].copy_from_slice(data);
        true
    }

    /// Zero-fills the backing bytes of every Ram-kind region. ROM, MMIO and
    /// shadow mappings are untouched.
    pub fn reset(&self) {
        let mut state = self.lock();
        let spans: Vec<(usize, usize)> = state
            .regions
            .iter()
            .filter(|r| r.kind == RegionKind::Ram)
            .map(|r| (r.backing_offset as usize, r.size as usize))
            .collect();
        for (offset, len) in spans {
            state.arena[offset..offset + len].fill(0);
        }
    }

    /// Debugging escape hatch: writes `[start, start + size)` to `path`,
    /// rendering unmapped bytes as open bus. Not part of the hot path.
    pub fn dump(&self, path: &Path, start: u32, size: u32) -> bool {
        let mut out = vec![OPEN_BUS_BYTE; size as usize];
        {
            let state = self.lock();
            for region in &state.regions {
                let r_start = u64::from(region.start);
                let r_end = region.end_exclusive();
                let d_start = u64::from(start);
                let d_end = d_start + u64::from(size);
                let lo = r_start.max(d_start);
                let hi = r_end.min(d_end);
                if lo >= hi {
                    continue;
                }
                let src = region.backing_offset as u64 + (lo - r_start);
                out[(lo - d_start) as usize..(hi - d_start) as usize]
                    .copy_from_slice(&state.arena[src as usize..(src + (hi - lo)) as usize]);
            }
        }
        match std::fs::write(path, &out) {
            Ok(()) => true,
            Err(err) => {
                warn!(path = %path.display(), %err, "memory dump failed");
                false
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpaceState> {
        // A poisoned lock only happens if an access path panicked while
        // holding it; the arena itself is still consistent.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read(&self, addr: u32, size: u8, kind: AccessKind) -> u32 {
        let needed = match kind {
            AccessKind::Execute => RegionPerms::EXEC,
            _ => RegionPerms::READ,
        };

        let mut fault: Option<&'static str> = None;
        let (value, events) = {
            let state = self.lock();
            let value = match state
                .regions
                .iter()
                .find(|r| r.contains_range(addr, size as usize))
            {
                None => {
                    fault = Some("unmapped");
                    open_bus(size)
                }
                Some(region) if !region.perms.contains(needed) => {
                    fault = Some("permission");
                    open_bus(size)
                }
                Some(region) => {
                    let off = (region.backing_offset + (addr - region.start)) as usize;
                    let mut value = 0u32;
                    for i in 0..size as usize {
                        value |= u32::from(state.arena[off + i]) << (8 * i);
                    }
                    value
                }
            };
            let event = AccessEvent {
                address: addr,
                size,
                kind,
                value,
            };
            (value, collect_observers(&state, &event))
        };

        if let Some(reason) = fault {
            warn!("memory read at {addr:#x} (size {size}) floats open bus: {reason}");
        }
        self.dispatch(events);
        value
    }

    fn write(&self, addr: u32, size: u8, value: u32) {
        let mut fault: Option<&'static str> = None;
        let events = {
            let mut state = self.lock();
            let target = state
                .regions
                .iter()
                .position(|r| r.contains_range(addr, size as usize));
            match target {
                None => fault = Some("unmapped"),
                Some(idx) if !state.regions[idx].perms.contains(RegionPerms::WRITE) => {
                    fault = Some("permission");
                }
                Some(idx) => {
                    let region = &state.regions[idx];
                    let off = (region.backing_offset + (addr - region.start)) as usize;
                    for i in 0..size as usize {
                        state.arena[off + i] = ((value >> (8 * i)) & 0xFF) as u8;
                    }
                }
            }
            let event = AccessEvent {
                address: addr,
                size,
                kind: AccessKind::Write,
                value,
            };
            collect_observers(&state, &event)
        };

        if let Some(reason) = fault {
            warn!("memory write at {addr:#x} (size {size}) dropped: {reason}");
        }
        self.dispatch(events);
    }

    fn dispatch(&self, events: Vec<(ObserverFn, AccessEvent)>) {
        for (callback, event) in events {
            // One faulty observer must not destabilize the access path.
            let _ = catch_unwind(AssertUnwindSafe(|| callback(event)));
        }
    }
}

fn collect_observers(state: &SpaceState, event: &AccessEvent) -> Vec<(ObserverFn, AccessEvent)> {
    if state.observers.is_empty() {
        return Vec::new();
    }
    state
        .observers
        .iter()
        .filter(|o| o.matches(event))
        .map(|o| (Arc::clone(&o.callback), *event))
        .collect()
}

#[inline]
fn open_bus(size: u8) -> u32 {
    match size {
        1 => u32::from(OPEN_BUS_BYTE),
        2 => u32::from(OPEN_BUS_WORD),
        _ => OPEN_BUS_DWORD,
    }
}
