//! Small helpers shared by the detectors.

/// Round `off` up to the next multiple of `align` (a power of two).
pub fn align_up(off: u64, align: u64) -> u64 {
    (align + off - 1) & !(align - 1)
}

/// A 24-bit little-endian length, as used by UEFI FFS files/sections and FIT
/// entries.
pub fn size24(len: [u8; 3]) -> u32 {
    u32::from(len[0]) | u32::from(len[1]) << 8 | u32::from(len[2]) << 16
}

/// Canonical string form of a UEFI GUID. The first three groups are stored
/// little-endian, the rest as-is.
pub fn guid_string(guid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        guid[3], guid[2], guid[1], guid[0],
        guid[5], guid[4],
        guid[7], guid[6],
        guid[8], guid[9],
        guid[10], guid[11], guid[12], guid[13], guid[14], guid[15],
    )
}

#[test]
fn align_up_powers_of_two() {
    assert_eq!(align_up(0, 0x40), 0);
    assert_eq!(align_up(1, 0x40), 0x40);
    assert_eq!(align_up(0x40, 0x40), 0x40);
    assert_eq!(align_up(0x41, 0x40), 0x80);
}

#[test]
fn size24_little_endian() {
    assert_eq!(size24([0x20, 0x01, 0x00]), 0x120);
    assert_eq!(size24([0xff, 0xff, 0xff]), 0xff_ffff);
}

#[test]
fn guid_mixed_endianness() {
    let mut guid = [0u8; 16];
    guid[..4].copy_from_slice(&[0x78, 0xe5, 0x8c, 0x8c]);
    guid[4..6].copy_from_slice(&[0x3d, 0x8a]);
    guid[6..8].copy_from_slice(&[0x1c, 0x4f]);
    guid[8..10].copy_from_slice(&[0x99, 0x35]);
    guid[10..].copy_from_slice(&[0x89, 0x61, 0x85, 0xc3, 0x2d, 0xd3]);
    assert_eq!(guid_string(&guid), "8c8ce578-8a3d-4f1c-9935-896185c32dd3");
}
