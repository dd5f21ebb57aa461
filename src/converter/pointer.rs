//! Chained pointer resolution.
//!
//! Slid mappings store pointers as per-page linked lists. The tracker walks
//! those lists, decodes every node into a plain address (or a bind), and
//! memoizes the result in the run's [`Accelerator`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::arch::Architecture;
use crate::dyld::{AddressSpace, ChainRegion, NodeValue, PointerAuth, SharedCache};
use crate::error::{Error, Result};
use crate::util;

use super::accelerator::Accelerator;

/// A decoded chain node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPointer {
    /// Plain target address (zero for an unresolved bind)
    pub target: u64,
    /// Authentication data carried by the slot
    pub auth: Option<PointerAuth>,
    /// Import ordinal if the slot is a bind
    pub bind: Option<u32>,
}

/// Every node of one chain, by slot address.
pub type ChainMap = BTreeMap<u64, ResolvedPointer>;

/// Supplies addresses for bind nodes.
pub trait BindResolver {
    /// Returns the address an import resolves to, addend applied.
    fn resolve_bind(&self, ordinal: u32, addend: i64) -> Option<u64>;
}

/// Resolves no binds at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBinds;

impl BindResolver for NoBinds {
    fn resolve_bind(&self, _ordinal: u32, _addend: i64) -> Option<u64> {
        None
    }
}

static NO_BINDS: NoBinds = NoBinds;

/// Walks and decodes pointer chains for one architecture.
pub struct PointerTracker<'a> {
    cache: &'a dyn AddressSpace,
    arch: Architecture,
    regions: Vec<ChainRegion>,
    binds: &'a dyn BindResolver,
}

impl<'a> PointerTracker<'a> {
    /// Creates a tracker over every slid region of the cache.
    pub fn new<C: SharedCache>(cache: &'a C, arch: Architecture) -> Result<Self> {
        let regions = cache.chain_regions()?;
        Ok(Self::with_regions(cache, arch, regions))
    }

    /// Creates a tracker over an explicit set of regions.
    pub fn with_regions(
        cache: &'a dyn AddressSpace,
        arch: Architecture,
        regions: Vec<ChainRegion>,
    ) -> Self {
        Self {
            cache,
            arch,
            regions,
            binds: &NO_BINDS,
        }
    }

    /// Uses `binds` to resolve bind nodes instead of leaving them at zero.
    pub fn with_binds(mut self, binds: &'a dyn BindResolver) -> Self {
        self.binds = binds;
        self
    }

    pub fn arch(&self) -> Architecture {
        self.arch
    }

    pub fn regions(&self) -> &[ChainRegion] {
        &self.regions
    }

    /// The address space the tracker reads from.
    pub fn cache(&self) -> &'a dyn AddressSpace {
        self.cache
    }

    /// Returns the region holding `addr`.
    pub fn region_for(&self, addr: u64) -> Option<&ChainRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// Resolves the chain starting at `start`.
    ///
    /// A second call for the same start returns the cached map without
    /// walking again.
    pub fn resolve_chain(&self, accel: &mut Accelerator, start: u64) -> Result<Arc<ChainMap>> {
        if let Some(chain) = accel.chain(self.arch, start) {
            return Ok(chain);
        }
        let region = self
            .region_for(start)
            .ok_or_else(|| Error::malformed_chain(start, self.arch, "outside every slid region"))?;
        self.walk(accel, region, start)
    }

    /// Resolves every chain that starts in page `page` of `region`.
    pub fn resolve_page_chains(
        &self,
        accel: &mut Accelerator,
        region: &ChainRegion,
        page: usize,
    ) -> Result<Vec<Arc<ChainMap>>> {
        let page_base = region.address + page as u64 * region.page_size;
        region
            .chain_starts(page)
            .into_iter()
            .map(|offset| {
                let start = page_base + offset;
                match accel.chain(self.arch, start) {
                    Some(chain) => Ok(chain),
                    None => self.walk(accel, region, start),
                }
            })
            .collect()
    }

    /// Resolves a single slot.
    ///
    /// Slots inside a slid region are decoded on their own; anywhere else
    /// the stored pointer is already plain. Unmapped slots and zero
    /// targets give `None`.
    pub fn resolve_pointer(&self, accel: &mut Accelerator, addr: u64) -> Result<Option<u64>> {
        if let Some(target) = accel.pointer(self.arch, addr) {
            return Ok((target != 0).then_some(target));
        }

        let target = match self.region_for(addr) {
            Some(region) => {
                let width = region.format.slot_width(self.arch);
                let Some(raw) = self.read_slot(addr, width) else {
                    return Ok(None);
                };
                let target = self.resolve_value(region.format.decode(raw).value).target;
                accel.insert_pointer(self.arch, addr, target);
                target
            }
            None => match self.read_slot(addr, self.arch.pointer_size()) {
                Some(raw) => raw,
                None => return Ok(None),
            },
        };

        Ok((target != 0).then_some(target))
    }

    fn walk(&self, accel: &mut Accelerator, region: &ChainRegion, start: u64) -> Result<Arc<ChainMap>> {
        let format = region.format;
        let width = format.slot_width(self.arch) as u64;
        let max_stride = format.max_stride(region.page_size);
        let span = if region.page_size > 0 {
            region.page_size
        } else {
            region.size
        };
        let bound = span / format.stride_unit() + 1;

        let mut chain = ChainMap::new();
        let mut addr = start;
        for _ in 0..bound {
            if !region.contains(addr) || !region.contains(addr + width - 1) {
                return Err(Error::malformed_chain(addr, self.arch, "chain leaves its region"));
            }
            let raw = self
                .read_slot(addr, width as usize)
                .ok_or_else(|| Error::malformed_chain(addr, self.arch, "slot is not mapped"))?;

            let node = format.decode(raw);
            let resolved = self.resolve_value(node.value);
            trace!("{:#x}: {:#018x} -> {:#x} (next {:#x})", addr, raw, resolved.target, node.next);
            chain.insert(addr, resolved);

            if node.next == 0 {
                let chain = Arc::new(chain);
                accel.insert_chain(self.arch, start, Arc::clone(&chain));
                return Ok(chain);
            }
            if node.next > max_stride {
                return Err(Error::malformed_chain(
                    addr,
                    self.arch,
                    format!("stride {:#x} exceeds {:#x}", node.next, max_stride),
                ));
            }
            addr += node.next;
        }

        Err(Error::malformed_chain(start, self.arch, "chain does not terminate"))
    }

    fn resolve_value(&self, value: NodeValue) -> ResolvedPointer {
        match value {
            NodeValue::Rebase { target, auth } => ResolvedPointer {
                target,
                auth,
                bind: None,
            },
            NodeValue::Bind {
                ordinal,
                addend,
                auth,
            } => ResolvedPointer {
                target: self.binds.resolve_bind(ordinal, addend).unwrap_or(0),
                auth,
                bind: Some(ordinal),
            },
        }
    }

    fn read_slot(&self, addr: u64, width: usize) -> Option<u64> {
        let bytes = self.cache.data_at_addr(addr, width).ok()?;
        Some(match width {
            4 => util::read_u32_le(bytes) as u64,
            _ => util::read_u64_le(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::testing::{slide_v2_region, v2_slot, TestCache};
    use crate::dyld::ChainFormat;

    const REGION: u64 = 0x20_0000;

    fn cache_with_region(size: u64) -> TestCache {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.map_zeroed(REGION, size as usize);
        let pages = (size / 0x1000) as usize;
        cache.add_region(slide_v2_region(REGION, size, vec![0; pages]));
        cache
    }

    #[test]
    fn test_resolve_chain() {
        let mut cache = cache_with_region(0x1000);
        cache.write_u64(REGION, v2_slot(0x1000, 8));
        cache.write_u64(REGION + 8, v2_slot(0x2000, 0));

        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();
        let chain = tracker.resolve_chain(&mut accel, REGION).unwrap();

        assert_eq!(chain.len(), 2);
        assert_eq!(chain[&REGION].target, 0x1000);
        assert_eq!(chain[&(REGION + 8)].target, 0x2000);
        assert_eq!(accel.pointer(Architecture::Arm64, REGION + 8), Some(0x2000));
    }

    #[test]
    fn test_resolve_chain_is_cached() {
        let mut cache = cache_with_region(0x1000);
        cache.write_u64(REGION, v2_slot(0x1000, 0));

        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();
        let first = tracker.resolve_chain(&mut accel, REGION).unwrap();
        let second = tracker.resolve_chain(&mut accel, REGION).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(accel.stats().chain_misses, 1);
        assert_eq!(accel.stats().chain_hits, 1);
    }

    #[test]
    fn test_malformed_chains() {
        let mut cache = cache_with_region(0x1000);
        // Stride larger than a page.
        cache.write_u64(REGION, v2_slot(0x1000, 0x2000));
        // Runs off the end of the region.
        cache.write_u64(REGION + 0xFF8, v2_slot(0x1000, 0x10));

        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();

        assert!(matches!(
            tracker.resolve_chain(&mut accel, REGION),
            Err(Error::MalformedChain { addr: REGION, .. })
        ));
        assert!(matches!(
            tracker.resolve_chain(&mut accel, REGION + 0xFF8),
            Err(Error::MalformedChain { .. })
        ));
        assert!(matches!(
            tracker.resolve_chain(&mut accel, 0x10),
            Err(Error::MalformedChain { addr: 0x10, .. })
        ));
    }

    #[test]
    fn test_non_terminating_chain() {
        let mut cache = cache_with_region(0x4000);
        for slot in (REGION..REGION + 0x4000).step_by(8) {
            cache.write_u64(slot, v2_slot(0x1000, 8));
        }

        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();
        let err = tracker.resolve_chain(&mut accel, REGION).unwrap_err();
        assert!(matches!(err, Error::MalformedChain { ref reason, .. } if reason.contains("terminate")));
    }

    struct FixedBinds;

    impl BindResolver for FixedBinds {
        fn resolve_bind(&self, ordinal: u32, addend: i64) -> Option<u64> {
            (ordinal == 5).then(|| (0x9000 + addend) as u64)
        }
    }

    #[test]
    fn test_binds() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.map_zeroed(REGION, 0x1000);
        let region = ChainRegion {
            address: REGION,
            size: 0x1000,
            page_size: 0x1000,
            format: ChainFormat::Ptr64,
            page_starts: vec![0],
            page_extras: Vec::new(),
            bitmaps: Vec::new(),
        };
        // bind ordinal 5, addend 0x10, next 8; then bind ordinal 6.
        cache.write_u64(REGION, (1 << 63) | (2 << 51) | (0x10 << 24) | 5);
        cache.write_u64(REGION + 8, (1 << 63) | 6);

        let mut accel = Accelerator::new();
        let tracker = PointerTracker::with_regions(&cache, Architecture::Arm64, vec![region.clone()]);
        let chain = tracker.resolve_chain(&mut accel, REGION).unwrap();
        assert_eq!(chain[&REGION].target, 0);
        assert_eq!(chain[&REGION].bind, Some(5));

        let mut accel = Accelerator::new();
        let tracker =
            PointerTracker::with_regions(&cache, Architecture::Arm64, vec![region]).with_binds(&FixedBinds);
        let chain = tracker.resolve_chain(&mut accel, REGION).unwrap();
        assert_eq!(chain[&REGION].target, 0x9010);
        assert_eq!(chain[&(REGION + 8)].bind, Some(6));
    }

    #[test]
    fn test_resolve_pointer() {
        let mut cache = cache_with_region(0x1000);
        cache.write_u64(REGION + 0x10, v2_slot(0x1234, 0));
        cache.map_zeroed(0x30_0000, 0x100);
        cache.write_u64(0x30_0008, 0x5678);

        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();

        assert_eq!(tracker.resolve_pointer(&mut accel, REGION + 0x10).unwrap(), Some(0x1234));
        assert_eq!(tracker.resolve_pointer(&mut accel, REGION + 0x20).unwrap(), None);
        assert_eq!(tracker.resolve_pointer(&mut accel, 0x30_0008).unwrap(), Some(0x5678));
        assert_eq!(tracker.resolve_pointer(&mut accel, 0x40_0000).unwrap(), None);
    }

    #[test]
    fn test_page_chains() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.map_zeroed(REGION, 0x2000);
        // Page 0 has no rebases, page 1 starts at offset 0x10.
        let region = slide_v2_region(REGION, 0x2000, vec![0x4000, 0x10 / 4]);
        cache.write_u64(REGION + 0x1010, v2_slot(0xAAAA, 0));
        cache.add_region(region.clone());

        let tracker = PointerTracker::new(&cache, Architecture::Arm64).unwrap();
        let mut accel = Accelerator::new();
        assert!(tracker.resolve_page_chains(&mut accel, &region, 0).unwrap().is_empty());

        let chains = tracker.resolve_page_chains(&mut accel, &region, 1).unwrap();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0][&(REGION + 0x1010)].target, 0xAAAA);
    }
}
