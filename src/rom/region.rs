//! The region tree.
//!
//! A [`Region`] is a labeled span of bytes inside a flash image. Containers
//! carry children and no payload of their own; raw regions are leaves whose
//! bytes are kept verbatim. Regions store `(offset, size)` only and fetch
//! bytes from the image on demand, so the tree serializes cleanly and the
//! detectors never copy. The `raw` payload of a leaf is populated late,
//! either from the image after detection or from the layout on disk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EMPTY;

/// Gap regions synthesized between detected siblings carry this prefix.
/// They are transparent for naming: a child cut out of a gap is labeled
/// under the nearest real ancestor instead.
pub const UNKNOWN_PREFIX: &str = "unknown_";

/// Name of the root region wrapping a whole image.
pub const FULL_IMAGE: &str = "full";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RegionKind {
    /// Not classified yet; only exists while detection runs.
    Unknown,
    /// Structural node, reconstructed from its children.
    Container,
    /// Leaf, bytes stored verbatim.
    Raw,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Region {
    #[serde(rename = "Type")]
    pub kind: RegionKind,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Offset")]
    pub offset: u32,
    #[serde(rename = "Size")]
    pub size: u32,
    #[serde(skip)]
    pub raw: Vec<u8>,
    #[serde(rename = "Children", default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Region>,
}

#[derive(Debug, Error)]
pub enum RegionError {
    #[error("regions {a} and {b} overlap")]
    Overlap { a: String, b: String },
    #[error("leaf {name} carries {actual} bytes, expected {expected}")]
    LeafSize {
        name: String,
        expected: u32,
        actual: usize,
    },
    #[error("leaf {name} does not fit the image ({size:#x} bytes)")]
    OutOfImage { name: String, size: u32 },
}

impl Region {
    pub fn new(kind: RegionKind, name: &str, offset: u32, size: u32) -> Self {
        Self {
            kind,
            name: name.to_string(),
            offset,
            size,
            raw: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Wrap a whole image as the unclassified root of a new tree.
    pub fn full_image(size: u32) -> Self {
        Self::new(RegionKind::Unknown, FULL_IMAGE, 0, size)
    }

    /// One past the last byte of the span.
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// The span's bytes within the full image.
    pub fn bytes<'d>(&self, data: &'d [u8]) -> &'d [u8] {
        &data[self.offset as usize..][..self.size as usize]
    }

    /// All bytes of the span are in the erased state.
    pub fn empty(&self, data: &[u8]) -> bool {
        self.bytes(data).iter().all(|b| *b == EMPTY)
    }

    /// Whether `[offset, offset+size)` lies inside the span. The lower bound
    /// is exclusive of the span's end, so a zero-sized range sitting exactly
    /// at the end is outside.
    pub fn contains(&self, offset: u32, size: u32) -> bool {
        let start = u64::from(self.offset);
        let end = start + u64::from(self.size);
        let o = u64::from(offset);
        o >= start && o < end && o + u64::from(size) <= end
    }

    /// The name under which children are labeled: trailing gap placeholder
    /// segments do not show up in descendant names.
    pub fn known_name(&self) -> &str {
        let mut name = self.name.as_str();
        while let Some((head, tail)) = name.rsplit_once('/') {
            if tail.starts_with(UNKNOWN_PREFIX) {
                name = head;
            } else {
                break;
            }
        }
        name
    }

    /// Cut a subregion out of this one. The label is joined under the
    /// nearest non-gap ancestor. The caller appends it where it belongs;
    /// nothing is inserted here.
    pub fn child(&self, offset: u32, size: u32, kind: RegionKind, name: &str) -> Region {
        assert!(
            offset >= self.offset && u64::from(offset) + u64::from(size) <= u64::from(self.end()),
            "child {name} at {offset:#x}+{size:#x} leaves parent {} ({:#x}+{:#x})",
            self.name,
            self.offset,
            self.size,
        );
        let name = format!("{}/{}", self.known_name(), name);
        Region::new(kind, &name, offset, size)
    }

    /// An unclassified gap child, named after its offset.
    pub fn gap_child(&self, offset: u32, size: u32) -> Region {
        self.child(
            offset,
            size,
            RegionKind::Unknown,
            &format!("{UNKNOWN_PREFIX}{offset:08x}"),
        )
    }

    /// Copy the span's bytes into every raw leaf. Called once detection has
    /// settled, right before the tree is saved or checked.
    pub fn fill_raw(&mut self, data: &[u8]) {
        if self.kind == RegionKind::Raw {
            self.raw = self.bytes(data).to_vec();
        }
        for child in &mut self.children {
            child.fill_raw(data);
        }
    }

    fn collect_raw<'a>(&'a self, leaves: &mut Vec<&'a Region>) {
        if self.kind == RegionKind::Raw {
            leaves.push(self);
            return;
        }
        for child in &self.children {
            child.collect_raw(leaves);
        }
    }

    /// Rebuild the flat image: an erased buffer of this region's size with
    /// every raw leaf copied in at its offset. Leaves must not overlap.
    pub fn reassemble(&self) -> Result<Vec<u8>, RegionError> {
        let mut leaves = Vec::new();
        self.collect_raw(&mut leaves);
        leaves.sort_by_key(|r| r.offset);
        for pair in leaves.windows(2) {
            if u64::from(pair[0].offset) + u64::from(pair[0].size) > u64::from(pair[1].offset) {
                return Err(RegionError::Overlap {
                    a: pair[0].name.clone(),
                    b: pair[1].name.clone(),
                });
            }
        }

        let mut buf = vec![EMPTY; self.size as usize];
        for leaf in leaves {
            if leaf.raw.len() != leaf.size as usize {
                return Err(RegionError::LeafSize {
                    name: leaf.name.clone(),
                    expected: leaf.size,
                    actual: leaf.raw.len(),
                });
            }
            let start = u64::from(leaf.offset).checked_sub(u64::from(self.offset));
            let Some(start) = start else {
                return Err(RegionError::OutOfImage {
                    name: leaf.name.clone(),
                    size: self.size,
                });
            };
            let end = start + leaf.raw.len() as u64;
            if end > buf.len() as u64 {
                return Err(RegionError::OutOfImage {
                    name: leaf.name.clone(),
                    size: self.size,
                });
            }
            buf[start as usize..end as usize].copy_from_slice(&leaf.raw);
        }
        Ok(buf)
    }
}
