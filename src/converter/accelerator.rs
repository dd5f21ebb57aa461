//! Per-run memoization shared by every image in an extraction run.
//!
//! Pointer chains, export tables and stub chains are identical no matter
//! which image asks for them, so each is computed once and handed out as
//! an [`Arc`]. An accelerator belongs to one worker; batch runs create one
//! per thread instead of sharing a locked one.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::arch::Architecture;
use crate::dyld::ImageEntry;

use super::pointer::ChainMap;
use super::stubs::{Classification, CodeRegions};
use super::symbolizer::{ExportIndex, ImageExports};

/// Hit and miss counters, reported when a run ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AcceleratorStats {
    /// Chain lookups answered from the cache
    pub chain_hits: u64,
    /// Chains walked
    pub chain_misses: u64,
    /// Pointer lookups answered from the flat index
    pub pointer_hits: u64,
    /// Export indexes reused
    pub export_hits: u64,
    /// Export indexes built
    pub export_misses: u64,
    /// Stub chains reused
    pub stub_hits: u64,
    /// Stub chains followed
    pub stub_misses: u64,
}

/// Memo tables for one extraction run.
#[derive(Debug, Default)]
pub struct Accelerator {
    path_to_image: HashMap<String, usize>,
    chains: HashMap<(Architecture, u64), Arc<ChainMap>>,
    pointers: HashMap<(Architecture, u64), u64>,
    tries: HashMap<String, Arc<ImageExports>>,
    exports: HashMap<String, Arc<ExportIndex>>,
    stub_chains: HashMap<(Architecture, u64), Classification>,
    code_regions: Option<Arc<CodeRegions>>,
    stats: AcceleratorStats,
}

impl Accelerator {
    /// Creates an empty accelerator.
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Images
    // -------------------------------------------------------------------------

    /// Indexes the image table by install path. Later duplicates lose.
    pub fn load_images(&mut self, images: &[ImageEntry]) {
        for (index, image) in images.iter().enumerate() {
            self.path_to_image.entry(image.path.clone()).or_insert(index);
        }
    }

    /// Returns true once [`Accelerator::load_images`] has run.
    pub fn has_images(&self) -> bool {
        !self.path_to_image.is_empty()
    }

    /// Table index of the image with this install path.
    pub fn image_index(&self, path: &str) -> Option<usize> {
        self.path_to_image.get(path).copied()
    }

    // -------------------------------------------------------------------------
    // Pointer chains
    // -------------------------------------------------------------------------

    /// Returns the resolved chain starting at `start`.
    pub fn chain(&mut self, arch: Architecture, start: u64) -> Option<Arc<ChainMap>> {
        let found = self.chains.get(&(arch, start)).cloned();
        if found.is_some() {
            self.stats.chain_hits += 1;
        }
        found
    }

    /// Stores a resolved chain and publishes each of its slots.
    pub fn insert_chain(&mut self, arch: Architecture, start: u64, chain: Arc<ChainMap>) {
        self.stats.chain_misses += 1;
        for (&addr, pointer) in chain.iter() {
            self.pointers.insert((arch, addr), pointer.target);
        }
        self.chains.insert((arch, start), chain);
    }

    /// Resolved target of a slot that belongs to an already walked chain.
    pub fn pointer(&mut self, arch: Architecture, addr: u64) -> Option<u64> {
        let found = self.pointers.get(&(arch, addr)).copied();
        if found.is_some() {
            self.stats.pointer_hits += 1;
        }
        found
    }

    /// Records a single resolved slot.
    pub fn insert_pointer(&mut self, arch: Architecture, addr: u64, target: u64) {
        self.pointers.insert((arch, addr), target);
    }

    // -------------------------------------------------------------------------
    // Exports
    // -------------------------------------------------------------------------

    /// Raw trie contents of an image.
    pub fn trie(&self, path: &str) -> Option<Arc<ImageExports>> {
        self.tries.get(path).cloned()
    }

    pub fn insert_trie(&mut self, path: &str, exports: Arc<ImageExports>) {
        self.tries.insert(path.to_string(), exports);
    }

    /// Resolved export index of an image.
    pub fn exports(&mut self, path: &str) -> Option<Arc<ExportIndex>> {
        let found = self.exports.get(path).cloned();
        if found.is_some() {
            self.stats.export_hits += 1;
        }
        found
    }

    pub fn insert_exports(&mut self, path: &str, index: Arc<ExportIndex>) {
        self.stats.export_misses += 1;
        self.exports.insert(path.to_string(), index);
    }

    // -------------------------------------------------------------------------
    // Stubs
    // -------------------------------------------------------------------------

    /// Outcome of following the stub chain that starts at `start`.
    pub fn stub_chain(&mut self, arch: Architecture, start: u64) -> Option<Classification> {
        let found = self.stub_chains.get(&(arch, start)).copied();
        if found.is_some() {
            self.stats.stub_hits += 1;
        }
        found
    }

    pub fn insert_stub_chain(&mut self, arch: Architecture, start: u64, result: Classification) {
        self.stats.stub_misses += 1;
        self.stub_chains.insert((arch, start), result);
    }

    /// Executable sections of every image, once collected.
    pub fn code_regions(&self) -> Option<Arc<CodeRegions>> {
        self.code_regions.clone()
    }

    pub fn set_code_regions(&mut self, regions: Arc<CodeRegions>) {
        self.code_regions = Some(regions);
    }

    // -------------------------------------------------------------------------
    // Reporting
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> AcceleratorStats {
        self.stats
    }

    /// Logs the counters at debug level.
    pub fn log_stats(&self) {
        let s = &self.stats;
        debug!(
            "accelerator: chains {} hit / {} walked, pointers {} hit ({} known), exports {} hit / {} built, stubs {} hit / {} followed",
            s.chain_hits,
            s.chain_misses,
            s.pointer_hits,
            self.pointers.len(),
            s.export_hits,
            s.export_misses,
            s.stub_hits,
            s.stub_misses,
        );
    }
}
