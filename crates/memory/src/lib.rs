//! Flat physical address space for the emulated baseboard.
//!
//! One contiguous arena backs the whole bounded physical prefix; every mapped
//! region is an (offset, length) view into that arena and all access goes
//! through [`AddressSpace`], never through a retained slice. Accesses that
//! resolve to nothing (or to a region lacking the requested permission) float
//! the bus high instead of failing.

mod region;
mod space;

pub use region::{MemoryRegion, RegionKind, RegionPerms};
pub use space::{
    AccessEvent, AccessKind, AddressSpace, AddressSpaceError, OPEN_BUS_BYTE, OPEN_BUS_DWORD,
    OPEN_BUS_WORD,
};

#[cfg(test)]
mod tests;
