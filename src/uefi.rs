//! UEFI Firmware Volumes
//!
//! Volumes are found by scanning at page (0x1000) stride for the `_FVH`
//! signature. Each volume splits into its header and a data span holding
//! FFS files; each file splits into its header and a data span holding
//! sections. FFS v3 files can carry a 64-bit length when the 24-bit field
//! saturates. See the UEFI Platform Initialization spec, volume 3.
//! All fields are little-endian.

use log::{debug, info, warn};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::rom::detect::{Detector, detect_regions};
use crate::rom::region::{Region, RegionKind};
use crate::rom::util::{align_up, guid_string, size24};

// NOTE: This is the LE representation.
const VOLUME_SIGNATURE: u32 = 0x4856_465f;
const PAGE_SIZE: u32 = 0x1000;

/// GUID of pad files; their payload carries no structure.
const FILE_GUID_EMPTY: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct VolumeHeader {
    pub zero_vector: [u8; 16],
    pub guid: [u8; 16],
    pub len: u64,
    pub sig: u32,
    pub attr: u32,
    pub header_len: u16,
    pub checksum: u16,
    pub ext_header_off: u16,
    pub reserved: u8,
    pub revision: u8,
    pub num_blocks: u32,
    pub block_size: u32,
    pub terminate_block: u64,
}

impl VolumeHeader {
    fn valid(&self) -> bool {
        self.sig == VOLUME_SIGNATURE && self.terminate_block == 0
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FileHeader {
    pub guid: [u8; 16],
    pub header_sum: u8,
    pub file_sum: u8,
    pub kind: u8,
    pub attr: u8,
    pub len24: [u8; 3],
    pub state: u8,
    /// FFS v3 extended length; only meaningful when `len24` saturates.
    pub len64: u64,
}

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct SectionHeader {
    pub len24: [u8; 3],
    pub kind: u8,
}

/// Detect UEFI Firmware Volumes anywhere in the region, at page stride.
///
/// Each volume becomes a container with a raw `header` child and a `data`
/// child that the file detector fills in. A declared length that does not
/// fit the span is treated as a scan miss.
pub fn detect_volumes(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);

    let mut volumes = Vec::new();
    let mut offset: u32 = 0;
    while offset < region.size {
        let header = match VolumeHeader::read_from_prefix(&bytes[offset as usize..]) {
            Ok((header, _)) if header.valid() => header,
            _ => {
                match offset.checked_add(PAGE_SIZE) {
                    Some(next) => offset = next,
                    None => break,
                }
                continue;
            }
        };
        let size = header.len as u32;
        let header_len = u32::from(header.header_len);
        if u64::from(size) != header.len
            || size == 0
            || header_len == 0
            || header_len > size
            || u64::from(offset) + u64::from(size) > u64::from(region.size)
        {
            warn!(
                "implausible volume header @ {:08x} (len {:x}), skipping",
                region.offset + offset,
                header.len
            );
            match offset.checked_add(PAGE_SIZE) {
                Some(next) => offset = next,
                None => break,
            }
            continue;
        }

        let abs = region.offset + offset;
        info!(
            "UEFI volume @ {abs:08x}: len={size:08x} guid={}",
            guid_string(&header.guid)
        );
        let name = format!("{}/fv_{abs:08x}", region.name);
        let mut volume = Region::new(RegionKind::Container, &name, abs, size);
        volume.children.push(Region::new(
            RegionKind::Raw,
            &format!("{name}/header"),
            abs,
            header_len,
        ));
        let payload = Region::new(
            RegionKind::Unknown,
            &format!("{name}/data"),
            abs + header_len,
            size - header_len,
        );
        let payload = detect_regions(&[detect_files as Detector], data, payload);
        volume.children.push(payload);
        volumes.push(volume);

        offset += size;
    }

    if volumes.is_empty() {
        None
    } else {
        Some(volumes)
    }
}

/// Walk the FFS files inside a volume's data span.
fn detect_files(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);
    let end = region.size;

    let mut files = Vec::new();
    let mut offset: u32 = 0;
    while offset < end {
        let Ok((header, _)) = FileHeader::read_from_prefix(&bytes[offset as usize..]) else {
            break;
        };
        let mut size = size24(header.len24);
        let mut header_len = 0x18;
        if size == 0xff_ffff {
            size = header.len64 as u32;
            header_len = 0x20;
        }
        if size >= end {
            break;
        }
        if size < header_len {
            break;
        }
        let inc = align_up(u64::from(size), 8) as u32;
        if inc == 0 || u64::from(offset) + u64::from(inc) > u64::from(end) {
            break;
        }

        let guid = guid_string(&header.guid);
        let abs = region.offset + offset;
        debug!(
            "UEFI file {:04}: guid={guid} off={abs:08x} len={size:08x} inc={inc:08x}",
            files.len()
        );
        let name = format!("{}/ffs_{:04}", region.name, files.len());
        let mut file = Region::new(RegionKind::Container, &name, abs, inc);
        file.children.push(Region::new(
            RegionKind::Raw,
            &format!("{name}/header.{guid}"),
            abs,
            header_len,
        ));
        let mut payload = Region::new(
            RegionKind::Unknown,
            &format!("{name}/data.{guid}"),
            abs + header_len,
            inc - header_len,
        );
        if guid == FILE_GUID_EMPTY {
            payload.kind = RegionKind::Raw;
        } else {
            payload = detect_regions(&[detect_sections as Detector], data, payload);
        }
        if !payload.empty(data) {
            file.children.push(payload);
        }
        files.push(file);

        offset += inc;
    }

    if files.is_empty() {
        None
    } else {
        Some(files)
    }
}

/// Walk the sections inside an FFS file's data span. Sections must tile the
/// span exactly (modulo the final 8-byte padding); anything else is a
/// mis-parse and the whole span is declined.
fn detect_sections(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);

    let mut sections = Vec::new();
    let mut offset: u32 = 0;
    while offset < region.size {
        let Ok((header, rest)) = SectionHeader::read_from_prefix(&bytes[offset as usize..]) else {
            return None;
        };
        let mut len = size24(header.len24);
        if len == 0 {
            break;
        }
        if len == 0xff_ffff {
            let Ok((len64, _)) = u64::read_from_prefix(rest) else {
                return None;
            };
            len = len64 as u32;
        }
        let len = align_up(u64::from(len), 4) as u32;
        if u64::from(offset) + u64::from(len) > u64::from(region.size) {
            warn!(
                "bad UEFI section @ {:08x}: len {len:08x} leaves the file",
                region.offset + offset
            );
            return None;
        }
        if len == 0 {
            break;
        }
        let kind = header.kind;
        let name = format!("{}/sec_{:04}_{kind:02x}", region.name, sections.len());
        debug!(
            "UEFI section {:04}: type=0x{kind:02x} @ {:08x} len={len:08x}",
            sections.len(),
            region.offset + offset
        );
        sections.push(Region::new(
            RegionKind::Raw,
            &name,
            region.offset + offset,
            len,
        ));

        offset += len;
    }

    // the file may be 0xff-padded out to an 8-byte boundary, nothing more
    if align_up(u64::from(offset), 8) as u32 != region.size {
        return None;
    }
    if sections.is_empty() {
        None
    } else {
        Some(sections)
    }
}
