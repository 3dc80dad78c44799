//! End-to-end extraction scenarios on synthetic flash images.
//!
//! Every fixture is built byte by byte the way real firmware lays it out,
//! run through the full detector stack, and (where the format covers all
//! payload bytes) re-assembled and compared against the input.

use romcarve::DETECTORS;
use romcarve::rom::detect::detect_regions;
use romcarve::rom::region::{Region, RegionKind};

const IFD_SIGNATURE: u32 = 0x0ff0_a55a;

fn put(data: &mut [u8], off: usize, bytes: &[u8]) {
    data[off..off + bytes.len()].copy_from_slice(bytes);
}

fn put_u16(data: &mut [u8], off: usize, v: u16) {
    put(data, off, &v.to_le_bytes());
}

fn put_u32(data: &mut [u8], off: usize, v: u32) {
    put(data, off, &v.to_le_bytes());
}

fn put_u64(data: &mut [u8], off: usize, v: u64) {
    put(data, off, &v.to_le_bytes());
}

fn extract(data: &[u8]) -> Region {
    let root = Region::full_image(data.len() as u32);
    let mut tree = detect_regions(DETECTORS, data, root);
    tree.fill_raw(data);
    tree
}

fn assert_roundtrip(tree: &Region, data: &[u8]) {
    assert_eq!(tree.reassemble().unwrap(), data, "rebuilt image differs");
}

fn find<'t>(region: &'t Region, name: &str) -> &'t Region {
    fn walk<'t>(region: &'t Region, name: &str) -> Option<&'t Region> {
        if region.name == name {
            return Some(region);
        }
        region.children.iter().find_map(|c| walk(c, name))
    }
    walk(region, name).unwrap_or_else(|| panic!("no region named {name}"))
}

fn child_names(region: &Region) -> Vec<&str> {
    region.children.iter().map(|c| c.name.as_str()).collect()
}

/// 4 MiB image with a descriptor: ifd 0x0-0x1000, me 0x1000-0x300000,
/// bios 0x300000-0x400000, gbe marked not-present.
fn ifd_image(sig_off: usize) -> Vec<u8> {
    let mut data = vec![0xffu8; 0x40_0000];
    put_u32(&mut data, sig_off, IFD_SIGNATURE);
    // FLMAP0: NR = 3, FRBA byte 0x04 -> region table at 0x40
    put_u32(&mut data, sig_off + 4, 0x0304_0000);
    put_u32(&mut data, sig_off + 8, 0);
    put_u32(&mut data, sig_off + 12, 0);
    put_u32(&mut data, sig_off + 16, 0);
    put_u32(&mut data, 0x40, 0x0000_0000); // ifd: 0x0..0x1000
    put_u32(&mut data, 0x44, 0x03ff_0300); // bios: 0x300000..0x400000
    put_u32(&mut data, 0x48, 0x02ff_0001); // me: 0x1000..0x300000
    put_u32(&mut data, 0x4c, 0x0000_7fff); // gbe: not present
    // recognizable payload in the partitions
    data[0x4321] = 0x11;
    data[0x30_0042] = 0x22;
    data
}

#[test]
fn minimal_ifd_splits_into_regions() {
    let data = ifd_image(0);
    let tree = extract(&data);
    assert_eq!(tree.kind, RegionKind::Container);
    assert_eq!(tree.name, "full");
    assert_eq!(child_names(&tree), vec!["ifd", "me", "bios"]);
    assert_eq!(tree.children[0].kind, RegionKind::Raw);
    assert_eq!(tree.children[0].size, 0x1000);
    // nothing structured inside, so the partitions fall back to raw
    assert_eq!(find(&tree, "me").kind, RegionKind::Raw);
    assert_eq!(find(&tree, "bios").offset, 0x30_0000);
    assert_roundtrip(&tree, &data);
}

#[test]
fn shifted_descriptor_signature_is_found() {
    let data = ifd_image(0x10);
    let tree = extract(&data);
    assert_eq!(child_names(&tree), vec!["ifd", "me", "bios"]);
    assert_roundtrip(&tree, &data);
}

#[test]
fn fpt_inside_the_me_region() {
    let mut data = ifd_image(0);
    // $FPT at the start of the me region
    put(&mut data, 0x1010, b"$FPT");
    put_u32(&mut data, 0x1014, 3); // entries
    let mut entry = |n: usize, name: &[u8; 4], offset: u32, length: u32| {
        let base = 0x1030 + n * 32;
        put(&mut data, base, name);
        put_u32(&mut data, base + 8, offset);
        put_u32(&mut data, base + 12, length);
    };
    entry(0, b"FTPR", 0x1000, 0x2000);
    entry(1, b"FTUP", 0x3000, 0x1000); // super-partition, must be skipped
    entry(2, b"MFS\0", 0xf000, 0x10000);
    data[0x4321] = 0xff; // the base fixture's marker would survive as a gap
    data[0x2100] = 0x33; // FTPR payload
    data[0x10_100] = 0x44; // MFS payload

    let tree = extract(&data);
    let me = find(&tree, "me");
    assert_eq!(me.kind, RegionKind::Container);
    assert_eq!(child_names(me), vec!["me/FPT", "me/FTPR", "me/MFS"]);
    let fpt = find(&tree, "me/FPT");
    assert_eq!((fpt.offset, fpt.size), (0x1000, 0xe00));
    let ftpr = find(&tree, "me/FTPR");
    assert_eq!((ftpr.offset, ftpr.size), (0x2000, 0x2000));
    assert_roundtrip(&tree, &data);
}

fn fmap_header(data: &mut [u8], off: usize, total: u32, areas: &[(u32, u32, &str)]) {
    put(data, off, b"__FMAP__");
    data[off + 8] = 1; // ver_major
    data[off + 9] = 1; // ver_minor
    put_u32(data, off + 18, total);
    data[off + 22..off + 54].fill(0);
    put(data, off + 22, b"FLASH");
    put_u16(data, off + 54, areas.len() as u16);
    for (n, (area_off, area_size, name)) in areas.iter().enumerate() {
        let base = off + 56 + n * 42;
        put_u32(data, base, *area_off);
        put_u32(data, base + 4, *area_size);
        data[base + 8..base + 40].fill(0);
        put(data, base + 8, name.as_bytes());
    }
}

#[test]
fn fmap_areas_become_children() {
    let mut data = vec![0xffu8; 0x40_0000];
    fmap_header(
        &mut data,
        0x20_0000,
        0x40_0000,
        &[
            (0, 0x20_0000, "SI_ALL"),
            (0x20_0000, 0x1000, "FMAP"),
            (0x20_1000, 0x1f_f000, "BIOS"),
        ],
    );
    data[0x100] = 0x10;
    data[0x20_1100] = 0x20;

    let tree = extract(&data);
    // the single full-span container replaces the root outright
    assert_eq!(tree.name, "fmap");
    assert_eq!(tree.kind, RegionKind::Container);
    assert_eq!(
        child_names(&tree),
        vec!["fmap/SI_ALL", "fmap/FMAP", "fmap/BIOS"]
    );
    assert_eq!(find(&tree, "fmap/FMAP").kind, RegionKind::Raw);
    assert_roundtrip(&tree, &data);
}

#[test]
fn nested_fmap_areas_reparent() {
    let mut data = vec![0xffu8; 0x40_0000];
    fmap_header(
        &mut data,
        0,
        0x40_0000,
        &[
            (0x10_0000, 0x20_0000, "BIOS"),
            (0x15_0000, 0xb_0000, "RW_A"),
            (0x20_0000, 0x5_0000, "RW_B"),
        ],
    );

    let tree = extract(&data);
    assert_eq!(tree.name, "fmap");
    assert_eq!(child_names(&tree), vec!["fmap/BIOS"]);
    let bios = find(&tree, "fmap/BIOS");
    assert_eq!(bios.kind, RegionKind::Container);
    assert_eq!(child_names(bios), vec!["fmap/RW_A", "fmap/RW_B"]);
    assert_eq!(bios.children[0].kind, RegionKind::Raw);
}

#[test]
fn cbfs_inside_an_fmap_area() {
    let mut data = vec![0xffu8; 0x40_0000];
    fmap_header(
        &mut data,
        0x20_0000,
        0x40_0000,
        &[
            (0, 0x20_0000, "COREBOOT"),
            (0x20_0000, 0x1000, "FMAP"),
            (0x20_1000, 0x1f_f000, "BIOS"),
        ],
    );
    // one CBFS file at the start of COREBOOT: big-endian header,
    // data at 0x38 (leaving 20 bytes of name room), 0x100 bytes of payload
    put(&mut data, 0, b"LARCHIVE");
    put(&mut data, 8, &0x100u32.to_be_bytes());
    put(&mut data, 12, &0x20u32.to_be_bytes());
    put(&mut data, 16, &0u32.to_be_bytes());
    put(&mut data, 20, &0x38u32.to_be_bytes());
    put(&mut data, 24, b"fallback/romstage\0\0\0");
    data[0x38..0x138].fill(0x5a);

    let tree = extract(&data);
    let coreboot = find(&tree, "fmap/COREBOOT");
    assert_eq!(coreboot.kind, RegionKind::Container);
    let file = find(&tree, "fmap/COREBOOT/fallback/romstage");
    assert_eq!(file.size, 0x140); // 0x38 + 0x100 aligned up to 0x40
    assert_eq!(
        child_names(file),
        vec![
            "fmap/COREBOOT/fallback/romstage/header",
            "fmap/COREBOOT/fallback/romstage/data"
        ]
    );
    assert_roundtrip(&tree, &data);
}

fn uefi_image() -> Vec<u8> {
    let mut data = vec![0xffu8; 0x10_0000];
    // volume header, 0x48 bytes, spanning the whole megabyte
    put(&mut data, 0, &[0u8; 16]); // zero vector
    put(&mut data, 0x10, &[0x78u8; 16]); // filesystem guid
    put_u64(&mut data, 0x20, 0x10_0000);
    put_u32(&mut data, 0x28, 0x4856_465f); // "_FVH"
    put_u32(&mut data, 0x2c, 0x0004_feff);
    put_u16(&mut data, 0x30, 0x48); // header length
    data[0x37] = 2; // revision
    put_u32(&mut data, 0x38, 0x100);
    put_u32(&mut data, 0x3c, 0x1000);
    put_u64(&mut data, 0x40, 0); // terminating block entry
    // one FFS file: 0x18 header + 0x108 of sections = 0x120
    put(&mut data, 0x48, &[0xaau8; 16]);
    data[0x48 + 0x12] = 0x07; // driver
    put(&mut data, 0x48 + 0x14, &0x120u32.to_le_bytes()[..3]);
    data[0x48 + 0x17] = 0xf8; // state
    // section 1: type 0x10 (PE32), 0xf0 bytes
    put(&mut data, 0x60, &0xf0u32.to_le_bytes()[..3]);
    data[0x63] = 0x10;
    data[0x64..0x150].fill(0x5a);
    // section 2: type 0x19 (raw), 0x18 bytes
    put(&mut data, 0x150, &0x18u32.to_le_bytes()[..3]);
    data[0x153] = 0x19;
    data[0x154..0x168].fill(0x33);
    data
}

#[test]
fn uefi_volume_nests_five_deep() {
    let data = uefi_image();
    let tree = extract(&data);
    // fv -> data -> ffs -> data -> sections
    assert_eq!(tree.name, "full/fv_00000000");
    assert_eq!(
        child_names(&tree),
        vec!["full/fv_00000000/header", "full/fv_00000000/data"]
    );
    let files = find(&tree, "full/fv_00000000/data");
    assert_eq!(child_names(files), vec!["full/fv_00000000/data/ffs_0000"]);
    let file = &files.children[0];
    let guid = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
    assert_eq!(
        child_names(file),
        vec![
            format!("full/fv_00000000/data/ffs_0000/header.{guid}"),
            format!("full/fv_00000000/data/ffs_0000/data.{guid}")
        ]
    );
    let sections = &file.children[1];
    assert_eq!(sections.children.len(), 2);
    assert_eq!(
        sections.children[0].name,
        format!("full/fv_00000000/data/ffs_0000/data.{guid}/sec_0000_10")
    );
    assert_eq!(sections.children[0].size, 0xf0);
    assert_roundtrip(&tree, &data);
}

fn fit_image() -> Vec<u8> {
    let mut data = vec![0xffu8; 0x80_0000];
    let fit = 0x7c_0000;
    let flash_address = |off: u64| off.wrapping_sub(0x80_0000);
    // one 16-byte entry: address, 3-byte length + reserved byte, version,
    // type, checksum
    let mut entry = |off: usize, address: u64, len24: u32, kind: u8| {
        put_u64(&mut data, off, address);
        put_u32(&mut data, off + 8, len24); // low 3 bytes + zero reserved
        put_u16(&mut data, off + 12, 0x0100);
        data[off + 14] = kind;
        data[off + 15] = 0;
    };
    // header entry: 3 entries inclusive of itself
    entry(fit, 0x2020_205f_5449_465f, 3, 0x00);
    // microcode at 0x7d0000, 0x800 * 0x10 = 0x8000 bytes
    entry(fit + 0x10, flash_address(0x7d_0000), 0x800, 0x01);
    // startup ACM at 0x7e0000, length taken from the module header
    entry(fit + 0x20, flash_address(0x7e_0000), 0, 0x02);
    // ACM module header: type 2, subtype 1, 0x4000 dwords -> 0x10000 bytes
    put_u16(&mut data, 0x7e_0000, 0x0002);
    put_u16(&mut data, 0x7e_0002, 0x0001);
    put_u32(&mut data, 0x7e_0018, 0x4000);
    // payloads
    data[0x7d_0100..0x7d_0200].fill(0x66);
    data[0x7e_1000..0x7e_2000].fill(0x77);
    data
}

#[test]
fn fit_resolves_microcode_and_acm() {
    let data = fit_image();
    let tree = extract(&data);
    let fit = find(&tree, "full/fit");
    assert_eq!(fit.kind, RegionKind::Container);
    assert_eq!(
        child_names(fit),
        vec!["full/fit/header", "full/fit/microcode", "full/fit/startup_acm"]
    );
    // the table length counts the header entry itself
    let table = find(&tree, "full/fit/header");
    assert_eq!((table.offset, table.size), (0x7c_0000, 0x30));
    let microcode = find(&tree, "full/fit/microcode");
    assert_eq!((microcode.offset, microcode.size), (0x7d_0000, 0x8000));
    // ACM length comes from its module header, in dwords
    let acm = find(&tree, "full/fit/startup_acm");
    assert_eq!((acm.offset, acm.size), (0x7e_0000, 0x1_0000));
    assert_roundtrip(&tree, &data);
}

#[test]
fn layout_survives_the_disk() {
    let mut data = ifd_image(0);
    put(&mut data, 0x1010, b"$FPT");
    put_u32(&mut data, 0x1014, 1);
    put(&mut data, 0x1030, b"FTPR");
    put_u32(&mut data, 0x1038, 0x1000);
    put_u32(&mut data, 0x103c, 0x2000);
    data[0x2200] = 0x55;

    let tree = extract(&data);
    assert_roundtrip(&tree, &data);

    let dir = tempfile::tempdir().unwrap();
    tree.save(dir.path()).unwrap();
    assert!(dir.path().join("summary.json").is_file());
    assert!(dir.path().join("ifd.raw").is_file());
    assert!(dir.path().join("me/FPT.raw").is_file());
    assert!(dir.path().join("me/FTPR.raw").is_file());

    let loaded = Region::load(dir.path()).unwrap();
    assert_eq!(loaded.reassemble().unwrap(), data);
}

#[test]
fn unrecognized_image_is_one_raw_leaf() {
    let mut data = vec![0u8; 0x8000];
    data[0x123] = 0x42;
    let tree = extract(&data);
    assert_eq!(tree.kind, RegionKind::Raw);
    assert!(tree.children.is_empty());
    assert_roundtrip(&tree, &data);
}
