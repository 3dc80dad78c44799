//! coreboot CBFS
//!
//! A CBFS is a run of `LARCHIVE` files, each aligned to 0x40 bytes: a
//! big-endian header, a zero-padded name, optional attributes, then the
//! payload. This is the only big-endian format in the tool, so the header
//! fields use explicit byte-order types. See coreboot
//! `Documentation/technotes/cbfs.txt`.

use log::debug;
use zerocopy::FromBytes;
use zerocopy::big_endian::U32;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::rom::region::{Region, RegionKind};
use crate::rom::util::align_up;

const FILE_MAGIC: [u8; 8] = *b"LARCHIVE";

/// coreboot's default; a master header can override it, which no image seen
/// so far makes use of.
const FILE_ALIGN: u64 = 0x40;

/// Type of null (padding) files.
const TYPE_NULL: u32 = 0xffff_ffff;

const FILE_HEADER_LEN: u32 = 24;

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy, Debug)]
#[repr(C)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub len: U32,
    pub kind: U32,
    pub attributes_offset: U32,
    pub offset: U32,
}

impl FileHeader {
    fn valid(&self) -> bool {
        self.magic == FILE_MAGIC
    }
}

/// Detect a run of CBFS files at the start of the region.
///
/// Each file becomes a container with a raw `header` child (magic, header
/// and name) and a `data` child left for the other detectors; a fully
/// erased payload is dropped. The walk ends at the first span that is not a
/// file.
pub fn detect_cbfs(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);

    let mut files = Vec::new();
    let mut off: u32 = 0;
    while off < region.size {
        let Ok((header, rest)) = FileHeader::read_from_prefix(&bytes[off as usize..]) else {
            break;
        };
        if !header.valid() {
            break;
        }
        let data_off = header.offset.get();
        let name_end = if header.attributes_offset.get() != 0 {
            header.attributes_offset.get()
        } else {
            data_off
        };
        let Some(name_len) = name_end.checked_sub(FILE_HEADER_LEN) else {
            break;
        };
        let Some(name_bytes) = rest.get(..name_len as usize) else {
            break;
        };
        // the name is zero-padded out to the attribute/data offset
        let name_bytes = match name_bytes.iter().position(|b| *b == 0) {
            Some(end) => &name_bytes[..end],
            None => name_bytes,
        };
        let name = if header.kind.get() == TYPE_NULL {
            format!("null_{off:08x}")
        } else {
            String::from_utf8_lossy(name_bytes).into_owned()
        };
        debug!("CBFS file @ {off:08x} '{name}': {header:?}");

        let size = align_up(u64::from(data_off) + u64::from(header.len.get()), FILE_ALIGN) as u32;
        if size == 0 || u64::from(off) + u64::from(size) > u64::from(region.size) {
            // truncated tail; the gap fallback keeps the bytes
            break;
        }
        if data_off > size {
            break;
        }

        let mut file = region.child(region.offset + off, size, RegionKind::Container, &name);
        let header_region = file.child(file.offset, data_off, RegionKind::Raw, "header");
        let payload = file.child(
            file.offset + data_off,
            size - data_off,
            RegionKind::Unknown,
            "data",
        );
        file.children.push(header_region);
        if !payload.empty(data) {
            file.children.push(payload);
        }
        files.push(file);

        off += size;
    }

    if files.is_empty() {
        None
    } else {
        Some(files)
    }
}
