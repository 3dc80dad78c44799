//! Intel Flash Descriptor (IFD)
//!
//! The descriptor sits at the very start of the flash (or behind a 16-byte
//! "flumap" prepend on some platforms) and partitions the chip into up to
//! ten regions. For reference, see
//! <https://opensecuritytraining.info/IntroBIOS_files/Day2_02_Advanced%20x86%20-%20BIOS%20and%20SMM%20Internals%20-%20Flash%20Descriptor.pdf>
//! and coreboot `util/ifdtool/`.
//!
//! Section offsets are described via the Descriptor Map as base addresses,
//! commonly abbreviated as xxBA. The base addresses are compact values and
//! really mean bits 4..11 of the real offsets, so we expand them by shifting.
//! All fields are little-endian.

// We retain the all-uppercase acronyms in the struct definitions.
// Lowercase helpers are provided through implementations.
#![allow(non_snake_case)]

use std::fmt::{self, Display};

use bitfield_struct::bitfield;
use log::info;
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::rom::region::{Region, RegionKind};

// NOTE: This is the LE representation.
const SIGNATURE: u32 = 0x0ff0_a55a;

/// Offset of the signature on platforms with the 16-byte prepend.
const SHIFTED_SIGNATURE_OFFSET: usize = 0x10;

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes)]
pub struct FLMAP0 {
    FCBA: u8,
    #[bits(2)]
    NC: u8,
    #[bits(6)]
    _0: u8,
    FRBA: u8,
    #[bits(3)]
    NR: u8,
    #[bits(5)]
    _1: u8,
}

impl FLMAP0 {
    fn fcba(self) -> u32 {
        u32::from(self.FCBA()) << 4
    }
    fn nc(self) -> u32 {
        u32::from(self.NC()) + 1
    }

    fn frba(self) -> u32 {
        u32::from(self.FRBA()) << 4
    }
    /// Index of the last region, or 0 meaning "all ten".
    fn nr(self) -> u32 {
        u32::from(self.NR())
    }
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes)]
pub struct FLMAP1 {
    FMBA: u8,
    #[bits(2)]
    NM: u8,
    #[bits(6)]
    _0: u8,
    FPSBA: u8,
    ISL: u8,
}

impl FLMAP1 {
    fn fmba(self) -> u32 {
        u32::from(self.FMBA()) << 4
    }
    fn nm(self) -> u32 {
        u32::from(self.NM())
    }

    // NOTE: On earlier platforms these were called FISBA/ISL (ICH strap),
    // later FPSBA/PSL (PCH strap). Same bits either way.
    fn fpsba(self) -> u32 {
        u32::from(self.FPSBA()) << 4
    }
    fn psl(self) -> u32 {
        u32::from(self.ISL())
    }
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes)]
pub struct FLMAP2 {
    FCPUSBA: u8,
    CPUSL: u8,
    ICCRIBA: u8,
    _0: u8,
}

impl FLMAP2 {
    fn fcpusba(self) -> u32 {
        u32::from(self.FCPUSBA()) << 4
    }
    fn cpusl(self) -> u32 {
        u32::from(self.CPUSL())
    }
    fn iccriba(self) -> u32 {
        u32::from(self.ICCRIBA()) << 4
    }
}

#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes)]
pub struct FLUMAP0 {
    VTBA: u8,
    VTL: u8,
    _0: u16,
}

impl FLUMAP0 {
    fn vtba(self) -> u32 {
        u32::from(self.VTBA()) << 4
    }
    fn vtl(self) -> u32 {
        u32::from(self.VTL())
    }
}

/// The descriptor map, starting right after the signature. The reserved
/// stretch up to the upper map is carried so FLUMAP0 lands at its fixed
/// spot.
#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy)]
#[repr(C)]
pub struct Header {
    flmap0: FLMAP0,
    flmap1: FLMAP1,
    flmap2: FLMAP2,
    flmap3: u32,
    _reserved: [u8; 0xed8],
    flumap0: FLUMAP0,
}

impl Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = format!(
            "  components: {}, base: 0x{:08x}",
            self.flmap0.nc(),
            self.flmap0.fcba()
        );
        let r = format!(
            "     regions: {}, base: 0x{:08x}",
            self.flmap0.nr(),
            self.flmap0.frba()
        );
        let m = format!(
            "     masters: {}, base: 0x{:08x}",
            self.flmap1.nm(),
            self.flmap1.fmba()
        );
        let s = format!(
            "  PCH straps: {:2}, base: 0x{:08x}",
            self.flmap1.psl(),
            self.flmap1.fpsba()
        );
        let u = format!(
            "  CPU straps: {:2}, base: 0x{:08x}, ICC: 0x{:08x}",
            self.flmap2.cpusl(),
            self.flmap2.fcpusba(),
            self.flmap2.iccriba()
        );
        let v = format!(
            "  VSCC table: {:2}, base: 0x{:08x}",
            self.flumap0.vtl(),
            self.flumap0.vtba()
        );
        write!(f, "{c}\n{r}\n{m}\n{s}\n{u}\n{v}")
    }
}

/// One FLREG word: 4 KiB-granular base and limit of a region. A base of
/// 0x7fff flags the region as not present.
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes)]
pub struct FLREG {
    #[bits(15)]
    base: u16,
    #[bits(1)]
    _0: u8,
    #[bits(15)]
    limit: u16,
    #[bits(1)]
    _1: u8,
}

const REGION_NOT_PRESENT: u16 = 0x7fff;

impl FLREG {
    fn start(self) -> u32 {
        u32::from(self.base()) << 12
    }
    fn end(self) -> u32 {
        (u32::from(self.limit()) + 1) << 12
    }
    fn present(self) -> bool {
        self.base() != REGION_NOT_PRESENT
    }
}

impl Display for FLREG {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.start();
        let e = self.end();
        let u = if self.present() { "" } else { " (not present)" };
        write!(f, "{b:08x} - {e:08x}{u}")
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Clone, Copy)]
#[repr(C)]
pub struct RegionTable {
    flregs: [FLREG; 10],
}

/// Region names by table index. Index 5..=7 and 9 are reserved on every
/// platform this tool has seen.
const REGION_NAMES: [&str; 10] = [
    "ifd", "bios", "me", "gbe", "pd", "res5", "res6", "res7", "ec", "res9",
];

fn signature_offset(bytes: &[u8]) -> Option<usize> {
    for off in [0, SHIFTED_SIGNATURE_OFFSET] {
        let sig = bytes.get(off..off + 4)?;
        if u32::from_le_bytes(sig.try_into().ok()?) == SIGNATURE {
            return Some(off);
        }
    }
    None
}

/// Detect an Intel Flash Descriptor at the start of the region.
///
/// The descriptor region itself comes out raw; every other present region is
/// left unclassified for the downstream detectors.
pub fn detect_ifd(data: &[u8], region: &Region) -> Option<Vec<Region>> {
    let bytes = region.bytes(data);
    let sig_off = signature_offset(bytes)?;
    let (header, _) = Header::read_from_prefix(bytes.get(sig_off + 4..)?).ok()?;
    let frba = header.flmap0.frba() as usize;
    let (table, _) = RegionTable::read_from_prefix(bytes.get(frba..)?).ok()?;

    info!("IFD descriptor, signature @ {sig_off:#04x}:\n{header}");

    let nr = header.flmap0.nr();
    let mut regions = Vec::new();
    for (n, name) in REGION_NAMES.iter().enumerate() {
        if nr > 0 && n as u32 > nr {
            break;
        }
        let flreg = table.flregs[n];
        if !flreg.present() {
            continue;
        }
        let (start, end) = (flreg.start(), flreg.end());
        if end < start {
            return None;
        }
        if !region.contains(start, end - start) {
            // the table disagrees with the probed span; let it be raw
            return None;
        }
        let kind = if n == 0 {
            RegionKind::Raw
        } else {
            RegionKind::Unknown
        };
        info!("IFD region {n}/{name}: {flreg}");
        regions.push(Region::new(kind, name, start, end - start));
    }
    regions.sort_by_key(|r| r.offset);
    Some(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flmap0_expansion() {
        // NR = 3, FRBA byte 0x04 -> 0x40
        let flmap0 = FLMAP0::from_bits(0x0304_0000);
        assert_eq!(flmap0.nr(), 3);
        assert_eq!(flmap0.frba(), 0x40);
        assert_eq!(flmap0.fcba(), 0);
    }

    #[test]
    fn flreg_expansion() {
        // base 0x300, limit 0x3ff -> 0x300000..0x400000
        let flreg = FLREG::from_bits(0x03ff_0300);
        assert!(flreg.present());
        assert_eq!(flreg.start(), 0x0030_0000);
        assert_eq!(flreg.end(), 0x0040_0000);
        assert!(!FLREG::from_bits(0x0000_7fff).present());
    }

    #[test]
    fn declines_without_signature() {
        let data = vec![0u8; 0x2000];
        let region = Region::full_image(0x2000);
        assert!(detect_ifd(&data, &region).is_none());
    }
}
