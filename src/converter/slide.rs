//! Slide info processing for pointer rebasing.
//!
//! Pointers in slid mappings are stored as chains whose nodes carry the
//! distance to the next node in their high bits. This step walks every
//! chain that starts in a page overlapping the image and writes the plain
//! target back at each node.

use std::collections::BTreeSet;

use tracing::debug;

use crate::dyld::{ChainRegion, SharedCache};
use crate::error::Result;
use crate::macho::MachOContext;

use super::accelerator::Accelerator;
use super::pointer::PointerTracker;
use super::ExtractionContext;

/// Rebases every chained pointer inside the image's segments.
///
/// Returns the number of pointers rewritten.
pub fn process_slide_info<C: SharedCache>(
    ctx: &mut ExtractionContext<'_, C>,
    tracker: &PointerTracker<'_>,
    accel: &mut Accelerator,
) -> Result<usize> {
    ctx.info("Processing slide info...");

    let mut rebased = 0;
    for region in tracker.regions() {
        let pages = overlapping_pages(&ctx.macho, region);
        if pages.is_empty() {
            continue;
        }

        let width = region.format.slot_width(tracker.arch());
        let mut count = 0;
        for page in pages {
            for chain in tracker.resolve_page_chains(accel, region, page)? {
                for (&addr, pointer) in chain.iter() {
                    // Chains may run through data of neighbouring images.
                    let Some(offset) = ctx.macho.addr_to_offset(addr) else {
                        continue;
                    };
                    if width == 4 {
                        ctx.macho.write_u32(offset, pointer.target as u32)?;
                    } else {
                        ctx.macho.write_u64(offset, pointer.target)?;
                    }
                    count += 1;
                }
            }
        }

        debug!(
            "{}: rebased {} pointers in region {:#x} ({:?})",
            ctx.image_name(),
            count,
            region.address,
            region.format
        );
        rebased += count;
    }

    Ok(rebased)
}

/// Pages of `region` that overlap a segment of the image with file
/// contents.
fn overlapping_pages(macho: &MachOContext, region: &ChainRegion) -> BTreeSet<usize> {
    let region_end = region.address + region.size;
    let mut pages = BTreeSet::new();

    for seg in macho.segments().filter(|seg| seg.command.filesize > 0) {
        let start = seg.command.vmaddr.max(region.address);
        let end = (seg.command.vmaddr + seg.command.vmsize).min(region_end);
        if start >= end {
            continue;
        }
        let (Some(first), Some(last)) = (region.page_index(start), region.page_index(end - 1)) else {
            continue;
        };
        pages.extend((first..=last).filter(|&page| page < region.page_count()));
    }

    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::dyld::testing::{
        slide_v2_region, v2_slot, ImageBuilder, TestCache, DATA_OFFSET, IMAGE_SIZE,
    };
    use crate::dyld::AddressSpace;

    const BASE: u64 = 0x1_8000_0000;
    const DATA: u64 = BASE + DATA_OFFSET;
    const NO_REBASE: u16 = 0x4000;

    fn setup() -> TestCache {
        let builder = ImageBuilder::new(Architecture::Arm64, "/usr/lib/libslide.dylib", BASE);
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(&builder);

        // Page 0 holds a two node chain from offset 0x10, page 2 a single
        // node at 0x8.
        cache.add_region(slide_v2_region(DATA, 0x4000, vec![4, NO_REBASE, 2, NO_REBASE]));
        cache.write_u64(DATA + 0x10, v2_slot(BASE + 0x1000, 8));
        cache.write_u64(DATA + 0x18, v2_slot(BASE + 0x1040, 0));
        cache.write_u64(DATA + 0x2008, v2_slot(BASE + 0x1080, 0));

        // A region elsewhere in the cache.
        cache.map_zeroed(0x1_9000_0000, 0x1000);
        cache.add_region(slide_v2_region(0x1_9000_0000, 0x1000, vec![0]));
        cache
    }

    #[test]
    fn test_process_slide_info() {
        let cache = setup();
        let image = cache.images()[0].clone();
        let bytes = cache.data_at_addr(BASE, IMAGE_SIZE as usize).unwrap().to_vec();
        let mut ctx = ExtractionContext::new(&cache, MachOContext::new(bytes).unwrap(), &image);
        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();

        let rebased = process_slide_info(&mut ctx, &tracker, &mut accel).unwrap();
        assert_eq!(rebased, 3);

        let read = |addr: u64| ctx.macho.read_u64((addr - BASE) as usize).unwrap();
        assert_eq!(read(DATA + 0x10), BASE + 0x1000);
        assert_eq!(read(DATA + 0x18), BASE + 0x1040);
        assert_eq!(read(DATA + 0x2008), BASE + 0x1080);

        // The chains are cached for later passes.
        assert!(accel.chain(Architecture::Arm64, DATA + 0x10).is_some());
    }

    #[test]
    fn test_overlapping_pages() {
        let cache = setup();
        let bytes = cache.data_at_addr(BASE, IMAGE_SIZE as usize).unwrap().to_vec();
        let macho = MachOContext::new(bytes).unwrap();

        let region = slide_v2_region(DATA + 0x1000, 0x8000, vec![0; 8]);
        let pages = overlapping_pages(&macho, &region);
        // __DATA covers pages 0..3, __LINKEDIT pages 3..7.
        assert_eq!(pages.into_iter().collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());

        let region = slide_v2_region(0x1_9000_0000, 0x1000, vec![0]);
        assert!(overlapping_pages(&macho, &region).is_empty());
    }
}
