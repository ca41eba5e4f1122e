use bitflags::bitflags;
use core::fmt;

/// What a mapped physical range represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Ram,
    Rom,
    Mmio,
    Vram,
    Shadow,
    Reserved,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegionKind::Ram => "ram",
            RegionKind::Rom => "rom",
            RegionKind::Mmio => "mmio",
            RegionKind::Vram => "vram",
            RegionKind::Shadow => "shadow",
            RegionKind::Reserved => "reserved",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Access permissions of a mapped region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl RegionPerms {
    pub const RWX: RegionPerms = RegionPerms::READ.union(RegionPerms::WRITE).union(RegionPerms::EXEC);
    pub const RX: RegionPerms = RegionPerms::READ.union(RegionPerms::EXEC);
    pub const RW: RegionPerms = RegionPerms::READ.union(RegionPerms::WRITE);
}

/// A mapped view into the address-space arena.
///
/// Regions carry no storage of their own: `backing_offset` locates the
/// region's bytes inside the arena owned by the address space. The manager
/// guarantees `backing_offset + size` stays inside the arena for the region's
/// whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u32,
    pub size: u32,
    pub kind: RegionKind,
    pub perms: RegionPerms,
    pub name: String,
    pub backing_offset: u32,
}

impl MemoryRegion {
    #[inline]
    pub fn end_exclusive(&self) -> u64 {
        u64::from(self.start) + u64::from(self.size)
    }

    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && u64::from(addr) < self.end_exclusive()
    }

    /// Whether the whole `[addr, addr + len)` access lies inside this region.
    #[inline]
    pub fn contains_range(&self, addr: u32, len: usize) -> bool {
        self.contains(addr) && u64::from(addr) + len as u64 <= self.end_exclusive()
    }

    #[inline]
    pub fn overlaps(&self, start: u32, size: u32) -> bool {
        let other_end = u64::from(start) + u64::from(size);
        u64::from(start) < self.end_exclusive() && u64::from(self.start) < other_end
    }
}
