#![doc = include_str!("../README.md")]

pub mod cbfs;
pub mod fit;
pub mod fmap;
pub mod ifd;
pub mod me;
pub mod rom;
pub mod uefi;

use rom::detect::Detector;

// An empty byte in a NOR flash is all-1's.
pub const EMPTY: u8 = 0xff;

/// Fixed detector priority for full images.
///
/// The descriptor only ever sits at the image root, the `$FPT` inside the
/// descriptor's ME region. FIT goes last: it anchors on a bare 64 KiB
/// alignment, so every more structured format must get its chance first.
pub const DETECTORS: &[Detector] = &[
    ifd::detect_ifd,
    me::detect_me,
    fmap::detect_fmap,
    cbfs::detect_cbfs,
    uefi::detect_volumes,
    fit::detect_fit,
];
