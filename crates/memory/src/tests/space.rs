use crate::{
    AccessEvent, AccessKind, AddressSpace, AddressSpaceError, RegionKind, RegionPerms,
    OPEN_BUS_BYTE, OPEN_BUS_DWORD, OPEN_BUS_WORD,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn space_640k() -> AddressSpace {
    AddressSpace::new(640, 1024, &[0xEA; 0x1_0000]).unwrap()
}

#[test]
fn built_in_regions_cover_conventional_extended_and_bios() {
    let mem = space_640k();
    assert_eq!(mem.region_at(0x1000).unwrap().name, "conventional");
    assert_eq!(mem.region_at(0x10_0000).unwrap().name, "extended");

    let bios = mem.region_at(0xF0000).unwrap();
    assert_eq!(bios.kind, RegionKind::Rom);
    assert_eq!(bios.perms, RegionPerms::RX);
    assert_eq!(mem.read_u8(0xF0000), 0xEA);
}

#[test]
fn constructor_rejects_bad_parameters() {
    assert_eq!(
        AddressSpace::new(0, 0, &[0; 0x1_0000]).unwrap_err(),
        AddressSpaceError::InvalidConventionalSize { kb: 0 }
    );
    assert_eq!(
        AddressSpace::new(640, 0, &[]).unwrap_err(),
        AddressSpaceError::InvalidBiosImage { len: 0 }
    );
    assert!(matches!(
        AddressSpace::new(640, 1024 * 1024, &[0; 0x1_0000]).unwrap_err(),
        AddressSpaceError::ArenaTooLarge { .. }
    ));
}

#[test]
fn debug_output_summarizes_without_dumping_the_arena() {
    let mem = space_640k();
    let rendered = format!("{mem:?}");
    assert!(rendered.starts_with("AddressSpace"));
    assert!(rendered.contains("regions"));
}

#[test]
fn ram_round_trips_at_every_width() {
    let mem = space_640k();

    mem.write_u8(0x1000, 0x42);
    assert_eq!(mem.read_u8(0x1000), 0x42);

    mem.write_u16(0x2000, 0xBEEF);
    assert_eq!(mem.read_u16(0x2000), 0xBEEF);
    assert_eq!(mem.read_u8(0x2000), 0xEF); // little-endian

    mem.write_u32(0x3000, 0xDEAD_BEEF);
    assert_eq!(mem.read_u32(0x3000), 0xDEAD_BEEF);
    assert_eq!(mem.read_u8(0x3003), 0xDE);
}

#[test]
fn unmapped_accesses_float_open_bus() {
    let mem = space_640k();

    // The hole between top of conventional RAM and the C segment.
    assert_eq!(mem.read_u8(0xA0000), OPEN_BUS_BYTE);
    assert_eq!(mem.read_u16(0xA0000), OPEN_BUS_WORD);
    assert_eq!(mem.read_u32(0xA0000), OPEN_BUS_DWORD);
    mem.write_u32(0xA0000, 0x1234_5678);
    assert_eq!(mem.read_u32(0xA0000), OPEN_BUS_DWORD);

    // Beyond the bounded arena entirely.
    assert_eq!(mem.read_u32(0xF000_0000), OPEN_BUS_DWORD);
}

#[test]
fn rom_writes_are_dropped() {
    let mem = space_640k();
    let before = mem.read_u8(0xF1234);
    mem.write_u8(0xF1234, before.wrapping_add(1));
    assert_eq!(mem.read_u8(0xF1234), before);
}

#[test]
fn write_only_region_reads_open_bus_but_latches_writes() {
    let mem = space_640k();
    assert!(mem.register_region(
        0xC0000,
        0x4000,
        RegionKind::Shadow,
        "shadow-w",
        RegionPerms::WRITE,
        0xC0000,
    ));

    mem.write_u8(0xC0000, 0x5A);
    assert_eq!(mem.read_u8(0xC0000), OPEN_BUS_BYTE);

    // Remap the same bytes readable: the earlier write persisted.
    assert!(mem.unregister_region(0xC0000, 0x4000));
    assert!(mem.register_region(
        0xC0000,
        0x4000,
        RegionKind::Shadow,
        "shadow-rw",
        RegionPerms::RW,
        0xC0000,
    ));
    assert_eq!(mem.read_u8(0xC0000), 0x5A);
}

#[test]
fn overlapping_registration_fails_and_leaves_existing_mappings() {
    let mem = space_640k();
    let regions_before = mem.regions();

    // Collides with conventional RAM.
    assert!(!mem.register_region(
        0x8000,
        0x1000,
        RegionKind::Mmio,
        "clash",
        RegionPerms::RW,
        0x8000,
    ));
    assert_eq!(mem.regions(), regions_before);
}

#[test]
fn out_of_bounds_registration_fails_and_leaves_existing_mappings() {
    let mem = space_640k();
    let regions_before = mem.regions();
    let arena = u32::try_from(mem.size()).unwrap();

    // Backing runs off the end of the arena.
    assert!(!mem.register_region(
        0xD0000,
        0x4000,
        RegionKind::Shadow,
        "tail",
        RegionPerms::RW,
        arena - 0x2000,
    ));
    // Guest interval wraps past the top of the 32-bit space.
    assert!(!mem.register_region(
        0xFFFF_F000,
        0x2000,
        RegionKind::Mmio,
        "wrap",
        RegionPerms::RW,
        0,
    ));
    assert_eq!(mem.regions(), regions_before);
}

#[test]
fn unregister_requires_exact_interval() {
    let mem = space_640k();
    assert!(mem.register_region(
        0xD0000,
        0x4000,
        RegionKind::Shadow,
        "win",
        RegionPerms::RW,
        0xD0000,
    ));
    assert!(!mem.unregister_region(0xD0000, 0x2000));
    assert!(!mem.unregister_region(0xD1000, 0x4000));
    assert!(mem.unregister_region(0xD0000, 0x4000));
    assert_eq!(mem.read_u8(0xD0000), OPEN_BUS_BYTE);
}

#[test]
fn access_straddling_a_region_boundary_is_open_bus() {
    let mem = space_640k();
    // Conventional RAM ends at 0xA0000; a dword at 0x9FFFE leaks past it.
    mem.write_u32(0x9FFFE, 0x1122_3344);
    assert_eq!(mem.read_u32(0x9FFFE), OPEN_BUS_DWORD);
    assert_eq!(mem.read_u16(0x9FFFE), 0);
}

#[test]
fn exec_permission_gates_fetches_not_reads() {
    let mem = space_640k();
    assert!(mem.register_region(
        0xC8000,
        0x4000,
        RegionKind::Mmio,
        "no-exec",
        RegionPerms::RW,
        0xC8000,
    ));
    mem.write_u8(0xC8000, 0x90);
    assert_eq!(mem.read_u8(0xC8000), 0x90);
    assert_eq!(mem.fetch_u8(0xC8000), OPEN_BUS_BYTE);

    // The BIOS ROM is fetchable.
    assert_eq!(mem.fetch_u8(0xF0000), 0xEA);
}

#[test]
fn reset_zeroes_ram_only() {
    let mem = space_640k();
    mem.write_u32(0x1000, 0xDEAD_BEEF);
    mem.write_u32(0x10_0000, 0xCAFE_F00D);
    let rom_byte = mem.read_u8(0xF0000);

    mem.reset();

    assert_eq!(mem.read_u32(0x1000), 0);
    assert_eq!(mem.read_u32(0x10_0000), 0);
    assert_eq!(mem.read_u8(0xF0000), rom_byte);
}

#[test]
fn observers_fire_on_matching_accesses_only() {
    let mem = space_640k();
    let hits: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));
    let last = Arc::new(AtomicU32::new(0));

    let id = {
        let hits = hits.clone();
        let last = last.clone();
        mem.register_callback(0x4000, 0x100, AccessKind::Write, move |ev: AccessEvent| {
            hits.fetch_add(1, Ordering::SeqCst);
            last.store(ev.value, Ordering::SeqCst);
        })
    };

    mem.write_u8(0x4000, 0xAB); // inside, write: fires
    mem.read_u8(0x4000); // inside, read: wrong kind
    mem.write_u8(0x4100, 0xCD); // outside
    mem.write_u16(0x40FF, 0x1234); // straddles the observed range end: fires

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(last.load(Ordering::SeqCst), 0x1234);

    assert!(mem.unregister_callback(id));
    assert!(!mem.unregister_callback(id));
    mem.write_u8(0x4000, 0xEF);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn panicking_observer_does_not_destabilize_the_access_path() {
    let mem = space_640k();
    mem.register_callback(0x5000, 4, AccessKind::Write, |_| panic!("bad observer"));

    mem.write_u32(0x5000, 0x0102_0304);
    assert_eq!(mem.read_u32(0x5000), 0x0102_0304);

    // Subsequent accesses (and registrations) still work.
    mem.write_u8(0x5000, 0x77);
    assert_eq!(mem.read_u8(0x5000), 0x77);
    assert!(mem.register_region(
        0xE0000,
        0x1000,
        RegionKind::Reserved,
        "after-panic",
        RegionPerms::READ,
        0xE0000,
    ));
}

#[test]
fn observers_may_reenter_the_address_space() {
    let mem = Arc::new(space_640k());
    let inner = mem.clone();
    mem.register_callback(0x6000, 1, AccessKind::Write, move |_| {
        // Re-entrant access must not deadlock on the manager lock.
        inner.write_u8(0x6100, 0x55);
    });

    mem.write_u8(0x6000, 1);
    assert_eq!(mem.read_u8(0x6100), 0x55);
}

#[test]
fn dump_renders_holes_as_open_bus() {
    let mem = space_640k();
    mem.write_u8(0x9FFFF, 0x11);

    let path = std::env::temp_dir().join(format!("memdump-{}.bin", std::process::id()));
    assert!(mem.dump(&path, 0x9FFFF, 4));
    let data = std::fs::read(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(data, vec![0x11, 0xFF, 0xFF, 0xFF]);
}
