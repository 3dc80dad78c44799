//! coreboot FMAP
//!
//! A flat map of named areas, found by scanning for the `__FMAP__`
//! signature at a 16-byte stride. Unlike every other format here, areas may
//! nest (`BIOS` containing `RW_SECTION_A` and friends), so the detector
//! rebuilds that containment from the declared spans. See coreboot
//! `util/flashmap/fmap.h`. All fields are little-endian.

use std::fmt::{self, Display};

use log::{debug, info};
use zerocopy::{FromBytes, Ref};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::rom::region::{Region, RegionKind};

const FMAP_SIGNATURE: [u8; 8] = *b"__FMAP__";
const FMAP_VERSION_MAJOR: u8 = 1;
const FMAP_STRLEN: usize = 32;
const SCAN_STRIDE: usize = 0x10;

/// The area holding the map itself; kept raw so the header bytes survive.
const FMAP_AREA: &str = "FMAP";

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Clone, Copy)]
#[repr(C, packed)]
pub struct FmapHeader {
    pub signature: [u8; 8],
    pub ver_major: u8,
    pub ver_minor: u8,
    pub base: u64,
    pub size: u32,
    pub name: [u8; FMAP_STRLEN],
    pub num_areas: u16,
}

const HEADER_SIZE: usize = std::mem::size_of::<FmapHeader>();

impl FmapHeader {
    fn valid(&self) -> bool {
        // minor version bumps are compatible, only the major one gates
        self.signature == FMAP_SIGNATURE && self.ver_major == FMAP_VERSION_MAJOR
    }
}

impl Display for FmapHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = self.base;
        let size = self.size;
        let areas = self.num_areas;
        write!(f, "base=0x{base:016x} size=0x{size:08x} areas={areas}")
    }
}

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Clone, Copy)]
#[repr(C, packed)]
pub struct FmapArea {
    pub offset: u32,
    pub size: u32,
    pub name: [u8; FMAP_STRLEN],
    pub flags: u16,
}

impl FmapArea {
    pub fn name(&self) -> String {
        let name = self.name;
        match std::str::from_utf8(&name) {
            Ok(n) => n.trim_end_matches('\0').to_string(),
            Err(_) => format!("{name:02x?}"),
        }
    }
}

impl Display for FmapArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.offset;
        let s = self.size;
        let fl = self.flags;
        let n = self.name();
        write!(f, "offset=0x{o:08x} size=0x{s:08x} flags=0x{fl:04x} name='{n}'")
    }
}

/// Append the innermost open area to the one below it on the stack.
fn fold_into_parent(stack: &mut Vec<Region>) {
    if let Some(done) = stack.pop() {
        if let Some(parent) = stack.last_mut() {
            parent.kind = RegionKind::Container;
            parent.children.push(done);
        }
    }
}

/// Detect a coreboot FMAP anywhere in the region.
///
/// On a hit the whole region becomes a container named `fmap`. Area names
/// stay flat under it regardless of nesting; the nesting itself is
/// structural. Areas pointing outside the region (descriptor/ME references
/// on some boards) are skipped.
pub fn detect_fmap(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);

    let mut hit = None;
    let mut off = 0;
    while off + HEADER_SIZE <= bytes.len() {
        let (header, rest) = FmapHeader::read_from_prefix(&bytes[off..]).ok()?;
        if header.valid() {
            hit = Some((header, rest));
            break;
        }
        off += SCAN_STRIDE;
    }
    let (header, rest) = hit?;
    info!("FMAP @ {:08x}: {header}", region.offset as usize + off);
    let (areas, _) =
        Ref::<_, [FmapArea]>::from_prefix_with_elems(rest, usize::from(header.num_areas)).ok()?;

    let fmap = Region::new(RegionKind::Container, "fmap", region.offset, region.size);
    let mut stack = vec![fmap];
    for (i, area) in areas.iter().enumerate() {
        debug!("FMAP area {i}: {area}");
        if !region.contains(area.offset, area.size) {
            info!("FMAP area outside the span, skipping: {area}");
            continue;
        }
        let name = area.name();
        let kind = if name == FMAP_AREA {
            RegionKind::Raw
        } else {
            RegionKind::Unknown
        };
        let sub = stack[0].child(area.offset, area.size, kind, &name);
        while stack.len() > 1 && !stack[stack.len() - 1].contains(sub.offset, sub.size) {
            fold_into_parent(&mut stack);
        }
        stack.push(sub);
    }
    while stack.len() > 1 {
        fold_into_parent(&mut stack);
    }
    Some(vec![stack.pop()?])
}
