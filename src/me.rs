//! Intel (CS)ME `$FPT` partition table
//!
//! The ME region of the flash starts with a Flash Partition Table: 16 bytes
//! of ROM-bypass instructions, the `$FPT` marker, a header, and one entry
//! per partition. See <https://troopers.de/downloads/troopers17/TR17_ME11_Static.pdf>
//! and <https://github.com/linuxboot/fiano/blob/main/pkg/intel/me/structures.go>.
//! All fields are little-endian.

use std::fmt::{self, Display};

use log::{info, warn};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::rom::region::{Region, RegionKind};

// NOTE: This is the LE representation.
pub const FPT_MAGIC: u32 = 0x5450_4624;

/// The slice of the ME region kept verbatim as the `FPT` leaf: header plus
/// entries plus a platform-specific footer at 0xd80..0xe00 that nobody has
/// explained yet.
const FPT_AREA_SIZE: u32 = 0xe00;

/// FTUP is a super-partition spanning NFTP+WCOD+LOCL; emitting it would
/// overlap the partitions it is made of.
const FTUP: &str = "FTUP";

/// Offset used by NVRAM-backed entries that occupy no flash.
const INVALID_OFFSET: u32 = 0xffff_ffff;

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FptHeader {
    pub rom_bypass: [u8; 16],
    pub marker: u32,
    pub num_entries: u32,
    pub header_version: u8,
    pub entry_version: u8,
    pub header_length: u8,
    pub header_checksum: u8,
    pub ticks_to_add: u16,
    pub tokens_to_add: u16,
    pub uma_size_or_reserved: u32,
    pub flash_layout_or_flags: u32,
    // Not present in ME version 7
    pub fitc_major: u16,
    pub fitc_minor: u16,
    pub fitc_hotfix: u16,
    pub fitc_build: u16,
}

impl FptHeader {
    fn valid(&self) -> bool {
        self.marker == FPT_MAGIC
    }
}

impl Display for FptHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hv = format!("  Header version: {}", self.header_version);
        let ev = format!("  Entry version:  {}", self.entry_version);
        let en = format!("  Entries:        {}", self.num_entries);
        let cs = format!("  Checksum:       {:02x}", self.header_checksum);
        let v = format!(
            "  FITC version:   {}.{}.{}.{}",
            self.fitc_major, self.fitc_minor, self.fitc_hotfix, self.fitc_build
        );
        write!(f, "{hv}\n{ev}\n{en}\n{cs}\n{v}")
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FptEntry {
    pub name: [u8; 4],
    pub reserved: u32,
    pub offset: u32,
    pub length: u32,
    pub reserved1: [u8; 12],
    pub attributes: u32,
}

impl FptEntry {
    pub fn name(&self) -> String {
        match std::str::from_utf8(&self.name) {
            Ok(n) => n.trim_end_matches('\0').to_string(),
            Err(_) => format!("{:02x?}", &self.name),
        }
    }
}

impl Display for FptEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.offset;
        let s = self.length;
        let end = o.wrapping_add(s);
        let name = self.name();
        let a = self.attributes;
        write!(f, "{name:>4} @ 0x{o:08x}:0x{end:08x} (0x{s:08x})  {a:08x}")
    }
}

/// Detect a `$FPT` at the start of the region, typically the descriptor's
/// "me" region.
///
/// The first 0xe00 bytes come out as one raw `FPT` leaf; every listed
/// partition becomes a raw leaf of its own. Entries that occupy no flash
/// (zero span or NVRAM offset) and the FTUP super-partition are skipped.
pub fn detect_me(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);
    let (header, mut rest) = FptHeader::read_from_prefix(bytes).ok()?;
    if !header.valid() {
        return None;
    }
    if region.size < FPT_AREA_SIZE {
        return None;
    }
    info!("ME $FPT @ {:08x}:\n{header}", region.offset);

    let mut regions = vec![region.child(region.offset, FPT_AREA_SIZE, RegionKind::Raw, "FPT")];
    for _ in 0..header.num_entries {
        let (entry, tail) = FptEntry::read_from_prefix(rest).ok()?;
        rest = tail;
        let name = entry.name();
        if (entry.offset == 0 && entry.length == 0)
            || name == FTUP
            || entry.offset == INVALID_OFFSET
        {
            continue;
        }
        let Some(offset) = region.offset.checked_add(entry.offset) else {
            warn!("ME partition out of range, skipping: {entry}");
            continue;
        };
        if !region.contains(offset, entry.length) {
            warn!("ME partition leaves the region, skipping: {entry}");
            continue;
        }
        info!("ME partition: {entry}");
        regions.push(region.child(offset, entry.length, RegionKind::Raw, &name));
    }
    regions.sort_by_key(|r| r.offset);
    Some(regions)
}
