//! Intel Firmware Interface Table (FIT)
//!
//! The FIT is a run of 16-byte entries sitting on a 64 KiB boundary near the
//! top of flash. Its first entry doubles as the header: the address field
//! holds the `_FIT_   ` signature and the length field the entry count,
//! itself included. Component addresses are memory-mapped, i.e. negative
//! offsets from 4 GiB, which wrap around to flash offsets when added to the
//! image size. See the Intel FIT BIOS specification.
//! All fields are little-endian.

use log::{debug, info};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::rom::detect::{Detector, detect_regions};
use crate::rom::region::{Region, RegionKind};
use crate::rom::util::{align_up, size24};

// NOTE: This is the LE representation of "_FIT_   ".
const FIT_SIGNATURE: u64 = 0x2020_205f_5449_465f;
const FIT_VERSION: u16 = 0x0100;
const FIT_ALIGN: u64 = 0x10000;
const ENTRY_SIZE: u32 = 0x10;

/// Entries of this type are to be ignored by the boot flow, and by us.
const TYPE_SKIP: u8 = 0x7f;
const TYPE_STARTUP_ACM: u8 = 0x02;

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct Entry {
    pub address: u64,
    /// Component length in 16-byte units, or the entry count for the header.
    pub len24: [u8; 3],
    pub reserved: u8,
    pub version: u16,
    /// Bit 7 flags checksum validity; the low bits are the component type.
    pub kind: u8,
    pub checksum: u8,
}

impl Entry {
    fn valid_header(&self) -> bool {
        self.address == FIT_SIGNATURE && self.reserved == 0 && self.version == FIT_VERSION
    }
}

fn type_name(kind: u8) -> Option<&'static str> {
    Some(match kind {
        0x00 => "header",
        0x01 => "microcode",
        0x02 => "startup_acm",
        0x07 => "bios_startup_module",
        0x08 => "tpm_policy",
        0x09 => "bios_policy",
        0x0a => "txt_policy",
        0x0b => "key_manifest",
        0x0c => "boot_policy_manifest",
        0x10 => "cse_secure_boot",
        0x2d => "txtsx_policy",
        0x2f => "jmp_debug_policy",
        0x7f => "skip",
        _ => return None,
    })
}

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct StartupAcmHeader {
    pub module_type: u16,
    pub module_sub_type: u16,
    pub misc: [u8; 0x14],
    /// Module length in dwords.
    pub size: u32,
}

/// ACMs do not state a length in their FIT entry; it comes from the module
/// header at the pointed-to offset.
fn startup_acm_len(data: &[u8], offset: u32) -> u32 {
    let Some(bytes) = data.get(offset as usize..) else {
        return 0;
    };
    let Ok((header, _)) = StartupAcmHeader::read_from_prefix(bytes) else {
        return 0;
    };
    if header.module_type == 0x0002 && header.module_sub_type == 0x0001 {
        header.size.saturating_mul(4)
    } else {
        0
    }
}

/// Scan for a FIT on 64 KiB boundaries of the *absolute* flash address
/// space. On a hit, the span from the table to the region's end becomes a
/// `fit` subregion, resolved by [`detect_fit_entries`].
pub fn detect_fit(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);

    let mut off = (align_up(u64::from(region.offset), FIT_ALIGN) - u64::from(region.offset)) as u32;
    let mut hit = false;
    while off < region.size {
        if let Ok((entry, _)) = Entry::read_from_prefix(&bytes[off as usize..]) {
            if entry.valid_header() {
                hit = true;
                break;
            }
        }
        match off.checked_add(FIT_ALIGN as u32) {
            Some(next) => off = next,
            None => break,
        }
    }
    if !hit {
        return None;
    }

    let fit = region.child(
        region.offset + off,
        region.size - off,
        RegionKind::Unknown,
        "fit",
    );
    let fit = detect_regions(&[detect_fit_entries as Detector], data, fit);
    Some(vec![fit])
}

/// Resolve the entries of a FIT sitting at the start of the region.
///
/// The table itself becomes one raw leaf; every component entry whose span
/// falls inside the region becomes another. Addresses are translated from
/// top-of-4GiB to flash offsets via the full image size.
fn detect_fit_entries(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);
    let (header, mut rest) = Entry::read_from_prefix(bytes).ok()?;
    if !header.valid_header() {
        return None;
    }
    // the header's length field is the entry count, itself included
    let num_entries = size24(header.len24);
    if num_entries == 0 {
        return None;
    }
    let table_size = num_entries.checked_mul(ENTRY_SIZE)?;
    if table_size > region.size {
        return None;
    }
    info!(
        "FIT @ {:08x}: {num_entries} entries (header included)",
        region.offset
    );
    let table = region.child(
        region.offset,
        table_size,
        RegionKind::Raw,
        type_name(header.kind).unwrap_or("header"),
    );

    let full_size = data.len() as u32;
    let mut regions = Vec::new();
    for n in 0..num_entries - 1 {
        let Ok((entry, tail)) = Entry::read_from_prefix(rest) else {
            break;
        };
        rest = tail;
        if entry.reserved != 0 || entry.kind == TYPE_SKIP {
            continue;
        }
        debug!("FIT entry {n}: {entry:x?}");
        let rom_off = full_size.wrapping_add(entry.address as u32);
        if !region.contains(rom_off, 0) || table.contains(rom_off, 0) {
            continue;
        }
        let mut len = size24(entry.len24).saturating_mul(ENTRY_SIZE);
        if len == 0 && entry.kind == TYPE_STARTUP_ACM {
            len = startup_acm_len(data, rom_off);
        }
        if len == 0 {
            continue;
        }
        let Some(name) = type_name(entry.kind) else {
            continue;
        };
        if u64::from(rom_off) + u64::from(len) > u64::from(region.end()) {
            continue;
        }
        regions.push(region.child(rom_off, len, RegionKind::Raw, name));
    }
    regions.push(table);
    Some(regions)
}
