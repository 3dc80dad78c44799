//! The recursive detection engine.
//!
//! Detectors are pure functions: given the full image and one unclassified
//! region, they either decline or claim a set of subregions. They never
//! recurse themselves; the engine owns the recursion, the gap bookkeeping
//! and the final shape of the tree.

use log::debug;

use crate::rom::region::{Region, RegionKind};

/// A format detector. `None` (or an empty set) means the detector does not
/// recognize the region; that is normal control flow, not an error. Claimed
/// subregions must lie inside the input span.
pub type Detector = fn(&[u8], &Region) -> Option<Vec<Region>>;

/// Classify a region, recursively.
///
/// The first detector that claims subregions wins. Uncovered spans between
/// claims become gap children unless they are fully erased. Every claim and
/// every gap is fed back through the engine. A single claim covering the
/// whole input replaces it outright; anything else turns the input into a
/// container.
pub fn detect_regions(detectors: &[Detector], data: &[u8], mut region: Region) -> Region {
    if region.kind != RegionKind::Unknown {
        let children = std::mem::take(&mut region.children);
        region.children = children
            .into_iter()
            .map(|child| detect_regions(detectors, data, child))
            .collect();
        return region;
    }
    debug!("detect: {:08x} - {:08x}", region.offset, region.end());

    let mut found = Vec::new();
    for detector in detectors {
        if let Some(regions) = detector(data, &region) {
            if !regions.is_empty() {
                found = regions;
                break;
            }
        }
    }
    if found.is_empty() {
        region.kind = RegionKind::Raw;
        return region;
    }

    found.sort_by_key(|r| r.offset);
    let mut children = Vec::new();
    let mut last = region.offset;
    for sub in found {
        if sub.offset > last {
            let gap = region.gap_child(last, sub.offset - last);
            if !gap.empty(data) {
                children.push(detect_regions(detectors, data, gap));
            }
        }
        last = sub.end();
        children.push(detect_regions(detectors, data, sub));
    }
    if last < region.end() {
        let gap = region.gap_child(last, region.end() - last);
        if !gap.empty(data) {
            children.push(detect_regions(detectors, data, gap));
        }
    }

    if children.len() == 1
        && children[0].offset == region.offset
        && children[0].size == region.size
    {
        return children.remove(0);
    }
    region.kind = RegionKind::Container;
    region.children = children;
    region
}
