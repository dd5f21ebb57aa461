//! Export symbol indexing.
//!
//! Each image's export trie is parsed once per run. Re-exports are chased
//! through the dependency lists of the images involved, and the exports of
//! `LC_REEXPORT_DYLIB` dependencies are folded into the re-exporting image's
//! index, so the index answers the same questions dyld would.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::dyld::{ExportInfo, ExportTrieParser, ImageEntry, SharedCache};
use crate::error::{Error, Result};
use crate::macho::LC_REEXPORT_DYLIB;

use super::accelerator::Accelerator;

/// Longest chain of re-exports followed before giving up.
pub const MAX_REEXPORT_DEPTH: usize = 32;

// =============================================================================
// Symbols
// =============================================================================

/// An exported symbol.
///
/// Identity is `(name, flags, ordinal)`; the address is payload. Symbols
/// sort by name, then re-exports before own exports (by ordinal), then by
/// flags.
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Ordinal of the dependency this symbol is re-exported from
    pub ordinal: Option<u32>,
    /// Resolved address
    pub address: u64,
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Symbol {}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| match (self.ordinal, other.ordinal) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.flags.cmp(&other.flags))
    }
}

// =============================================================================
// Export Index
// =============================================================================

/// Resolved exports of one image, searchable by name and by address.
#[derive(Debug, Default)]
pub struct ExportIndex {
    symbols: BTreeSet<Symbol>,
    by_addr: BTreeMap<u64, Vec<Symbol>>,
}

impl ExportIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a symbol. An exact duplicate is rejected and the first one
    /// kept; returns whether the symbol was added.
    pub fn insert(&mut self, symbol: Symbol) -> bool {
        if !self.symbols.insert(symbol.clone()) {
            return false;
        }
        let address = symbol.address;
        self.add_alias(address, symbol);
        true
    }

    /// Makes `symbol` answer address queries at `address` as well.
    pub fn add_alias(&mut self, address: u64, mut symbol: Symbol) {
        symbol.address = address;
        let list = self.by_addr.entry(address).or_default();
        if let Err(pos) = list.binary_search(&symbol) {
            list.insert(pos, symbol);
        }
    }

    /// The least symbol at an address.
    pub fn resolve_addr(&self, addr: u64) -> Option<&Symbol> {
        self.by_addr.get(&addr).and_then(|list| list.first())
    }

    /// Address of the least symbol with this name.
    pub fn resolve_name(&self, name: &str) -> Option<u64> {
        let lowest = Symbol {
            name: name.to_string(),
            flags: 0,
            ordinal: Some(0),
            address: 0,
        };
        self.symbols
            .range(lowest..)
            .next()
            .filter(|symbol| symbol.name == name)
            .map(|symbol| symbol.address)
    }

    /// Every symbol at an address, least first.
    pub fn symbols_at(&self, addr: u64) -> &[Symbol] {
        self.by_addr.get(&addr).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All symbols in order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

// =============================================================================
// Raw Image Exports
// =============================================================================

/// The unresolved contents of one image's export trie.
#[derive(Debug)]
pub struct ImageExports {
    /// Install path
    pub path: String,
    /// Address of the image's Mach-O header
    pub base: u64,
    /// Dependency install paths in ordinal order
    pub dependencies: Vec<String>,
    /// Dependencies loaded with `LC_REEXPORT_DYLIB`
    pub reexported: Vec<String>,
    /// Trie entries by name
    pub entries: BTreeMap<String, ExportInfo>,
}

impl ImageExports {
    /// Address of a non re-export entry.
    pub fn address_of(&self, entry: &ExportInfo) -> u64 {
        if entry.is_absolute() {
            entry.address
        } else {
            self.base.wrapping_add(entry.address)
        }
    }

    /// Ordinal under which `dependency` is loaded.
    pub fn ordinal_of(&self, dependency: &str) -> Option<u32> {
        self.dependencies
            .iter()
            .position(|dep| dep == dependency)
            .map(|index| index as u32 + 1)
    }
}

// =============================================================================
// Symbolizer
// =============================================================================

struct Hop {
    image: String,
    name: String,
    depth: usize,
    /// Reached through a re-export entry rather than a re-exported dylib
    explicit: bool,
}

enum Step {
    Enter(Hop),
    /// Every path below this `(image, name)` has been searched.
    Leave((String, String)),
}

/// Builds and queries export indexes for the images of a cache.
pub struct Symbolizer<'a, C: SharedCache + ?Sized> {
    cache: &'a C,
}

impl<'a, C: SharedCache + ?Sized> Symbolizer<'a, C> {
    pub fn new(cache: &'a C) -> Self {
        Self { cache }
    }

    /// Returns the export index of an image, building it on first use.
    pub fn index(&self, accel: &mut Accelerator, image: &str) -> Result<Arc<ExportIndex>> {
        if let Some(index) = accel.exports(image) {
            return Ok(index);
        }

        let own = self
            .image_exports(accel, image)?
            .ok_or_else(|| Error::ImageNotFound {
                name: image.to_string(),
            })?;

        let mut index = ExportIndex::new();
        for entry in own.entries.values() {
            if entry.is_reexport() {
                let resolved = self.resolve_export(accel, image, &entry.name);
                if let Some(address) = settle(image, &entry.name, resolved)? {
                    index.insert(Symbol {
                        name: entry.name.clone(),
                        flags: entry.flags,
                        ordinal: entry.reexport_ordinal,
                        address,
                    });
                }
                continue;
            }

            let symbol = Symbol {
                name: entry.name.clone(),
                flags: entry.flags,
                ordinal: None,
                address: own.address_of(entry),
            };
            if let Some(resolver) = entry.resolver_address {
                index.add_alias(own.base.wrapping_add(resolver), symbol.clone());
            }
            index.insert(symbol);
        }

        self.fold_reexported_dylibs(accel, &own, &mut index)?;

        debug!("{}: indexed {} exports", image, index.len());
        let index = Arc::new(index);
        accel.insert_exports(image, Arc::clone(&index));
        Ok(index)
    }

    /// Resolves `name` as exported by `image`, following re-exports.
    ///
    /// A missing image or name is `Ok(None)`, and so is a pair already
    /// searched through another path. Reaching an `(image, name)` pair again
    /// through a re-export entry while it is still on the current path, or
    /// following more than [`MAX_REEXPORT_DEPTH`] hops, fails with
    /// [`Error::CyclicReExport`].
    pub fn resolve_export(
        &self,
        accel: &mut Accelerator,
        image: &str,
        name: &str,
    ) -> Result<Option<u64>> {
        let cyclic = || Error::CyclicReExport {
            name: name.to_string(),
            image: image.to_string(),
        };

        let mut on_path = HashSet::new();
        let mut searched = HashSet::new();
        let mut stack = vec![Step::Enter(Hop {
            image: image.to_string(),
            name: name.to_string(),
            depth: 0,
            explicit: true,
        })];

        while let Some(step) = stack.pop() {
            let hop = match step {
                Step::Enter(hop) => hop,
                Step::Leave(key) => {
                    on_path.remove(&key);
                    searched.insert(key);
                    continue;
                }
            };

            let key = (hop.image.clone(), hop.name.clone());
            if on_path.contains(&key) {
                if hop.explicit {
                    return Err(cyclic());
                }
                continue;
            }
            if searched.contains(&key) {
                continue;
            }
            if hop.depth > MAX_REEXPORT_DEPTH {
                return Err(cyclic());
            }

            let Some(exports) = self.image_exports(accel, &hop.image)? else {
                debug!("{}: dependency {} is not in the cache", image, hop.image);
                searched.insert(key);
                continue;
            };

            // Children are pushed after the marker so they pop first.
            on_path.insert(key.clone());
            stack.push(Step::Leave(key));

            match exports.entries.get(&hop.name) {
                Some(entry) if entry.is_reexport() => {
                    let dependency = entry
                        .reexport_ordinal
                        .and_then(|ordinal| (ordinal as usize).checked_sub(1))
                        .and_then(|index| exports.dependencies.get(index));
                    match dependency {
                        Some(dependency) => stack.push(Step::Enter(Hop {
                            image: dependency.clone(),
                            name: entry.import_name().to_string(),
                            depth: hop.depth + 1,
                            explicit: true,
                        })),
                        None => debug!(
                            "{}: {} re-exports from bad ordinal {:?}",
                            hop.image, hop.name, entry.reexport_ordinal
                        ),
                    }
                }
                Some(entry) => return Ok(Some(exports.address_of(entry))),
                None => {
                    // Re-exported dylibs are searched in load order.
                    for dependency in exports.reexported.iter().rev() {
                        stack.push(Step::Enter(Hop {
                            image: dependency.clone(),
                            name: hop.name.clone(),
                            depth: hop.depth + 1,
                            explicit: false,
                        }));
                    }
                }
            }
        }

        debug!("{}: {} not found", image, name);
        Ok(None)
    }

    /// Finds where an undefined symbol of `importer` is defined, searching
    /// its dependencies in load order.
    pub fn resolve_import(
        &self,
        accel: &mut Accelerator,
        importer: &str,
        name: &str,
    ) -> Result<Option<u64>> {
        let Some(own) = self.image_exports(accel, importer)? else {
            return Ok(None);
        };
        for dependency in &own.dependencies {
            let resolved = self.resolve_export(accel, dependency, name);
            if let Some(address) = settle(dependency, name, resolved)? {
                return Ok(Some(address));
            }
        }
        Ok(None)
    }

    /// Adds every export of the image's re-exported dylibs, transitively,
    /// under the ordinal of the top-level dependency.
    fn fold_reexported_dylibs(
        &self,
        accel: &mut Accelerator,
        own: &ImageExports,
        index: &mut ExportIndex,
    ) -> Result<()> {
        let mut seen = HashSet::from([own.path.clone()]);
        let mut queue: VecDeque<(String, u32)> = own
            .reexported
            .iter()
            .filter_map(|dep| own.ordinal_of(dep).map(|ordinal| (dep.clone(), ordinal)))
            .collect();

        while let Some((dependency, ordinal)) = queue.pop_front() {
            if !seen.insert(dependency.clone()) {
                continue;
            }
            let Some(exports) = self.image_exports(accel, &dependency)? else {
                debug!("{}: re-exported {} is not in the cache", own.path, dependency);
                continue;
            };

            for entry in exports.entries.values() {
                let address = if entry.is_reexport() {
                    let resolved = self.resolve_export(accel, &dependency, &entry.name);
                    settle(&dependency, &entry.name, resolved)?
                } else {
                    Some(exports.address_of(entry))
                };
                if let Some(address) = address {
                    index.insert(Symbol {
                        name: entry.name.clone(),
                        flags: entry.flags,
                        ordinal: Some(ordinal),
                        address,
                    });
                }
            }

            queue.extend(exports.reexported.iter().map(|dep| (dep.clone(), ordinal)));
        }

        Ok(())
    }

    /// Parses an image's export trie, once per run.
    fn image_exports(
        &self,
        accel: &mut Accelerator,
        path: &str,
    ) -> Result<Option<Arc<ImageExports>>> {
        if let Some(exports) = accel.trie(path) {
            return Ok(Some(exports));
        }
        let Some(image) = self.find_image(accel, path) else {
            return Ok(None);
        };
        let macho = match self.cache.image_macho(image) {
            Ok(macho) => macho,
            Err(err) => {
                debug!("{}: unreadable header: {}", path, err);
                return Ok(None);
            }
        };

        let parsed = match macho.export_trie_range() {
            Some((offset, size)) if size > 0 => {
                let invalid = Error::InvalidExportTrie {
                    offset: offset as usize,
                };
                let addr = macho
                    .linkedit_offset_to_addr(offset as u64)
                    .ok_or(invalid)?;
                let data = self
                    .cache
                    .data_at_addr(addr, size as usize)
                    .map_err(|_| Error::InvalidExportTrie {
                        offset: offset as usize,
                    })?;
                ExportTrieParser::new(data).parse_all()?
            }
            _ => Vec::new(),
        };

        let dependencies = macho.dependencies();
        let exports = Arc::new(ImageExports {
            path: path.to_string(),
            base: image.address,
            dependencies: dependencies.iter().map(|(dep, _)| dep.to_string()).collect(),
            reexported: dependencies
                .iter()
                .filter(|&&(_, cmd)| cmd == LC_REEXPORT_DYLIB)
                .map(|(dep, _)| dep.to_string())
                .collect(),
            entries: parsed.into_iter().map(|e| (e.name.clone(), e)).collect(),
        });

        accel.insert_trie(path, Arc::clone(&exports));
        Ok(Some(exports))
    }

    fn find_image(&self, accel: &mut Accelerator, path: &str) -> Option<&'a ImageEntry> {
        if !accel.has_images() {
            accel.load_images(self.cache.images());
        }
        let cache: &'a C = self.cache;
        accel
            .image_index(path)
            .and_then(|index| cache.images().get(index))
    }
}

/// Turns a query-scoped resolution failure into a logged miss.
fn settle(image: &str, name: &str, resolved: Result<Option<u64>>) -> Result<Option<u64>> {
    match resolved {
        Ok(found) => {
            if found.is_none() {
                debug!("{}: re-export {} is unresolved", image, name);
            }
            Ok(found)
        }
        Err(err) if !err.is_image_fatal() => {
            warn!("{}: {}", image, err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::dyld::testing::{ImageBuilder, TestCache, IMAGE_SIZE};
    use crate::dyld::{EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER, EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION};
    use crate::macho::LC_LOAD_DYLIB;

    const LIB_A: &str = "/usr/lib/libA.dylib";
    const LIB_B: &str = "/usr/lib/libB.dylib";
    const LIB_C: &str = "/usr/lib/libC.dylib";

    fn base(n: u64) -> u64 {
        0x1_8000_0000 + n * IMAGE_SIZE
    }

    fn symbol(name: &str, flags: u64, ordinal: Option<u32>, address: u64) -> Symbol {
        Symbol {
            name: name.to_string(),
            flags,
            ordinal,
            address,
        }
    }

    #[test]
    fn test_symbol_order() {
        let mut symbols = vec![
            symbol("_b", 0, None, 1),
            symbol("_a", 0, None, 2),
            symbol("_a", 4, Some(2), 3),
            symbol("_a", 0, Some(2), 4),
            symbol("_a", 0, Some(1), 5),
        ];
        symbols.sort();
        let order: Vec<u64> = symbols.iter().map(|s| s.address).collect();
        assert_eq!(order, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut index = ExportIndex::new();
        assert!(index.insert(symbol("_a", 0, None, 0x1000)));
        assert!(!index.insert(symbol("_a", 0, None, 0x2000)));
        assert!(index.insert(symbol("_a", 0, Some(1), 0x3000)));

        assert_eq!(index.len(), 2);
        assert_eq!(index.resolve_name("_a"), Some(0x3000));
        assert_eq!(index.resolve_addr(0x1000).unwrap().name, "_a");
        assert!(index.symbols_at(0x2000).is_empty());
        assert_eq!(index.resolve_name("_missing"), None);
    }

    #[test]
    fn test_symbols_at() {
        let mut index = ExportIndex::new();
        index.insert(symbol("_z", 0, None, 0x1000));
        index.insert(symbol("_y", EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, None, 0x1000));
        let names: Vec<&str> = index.symbols_at(0x1000).iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["_y", "_z"]);
        assert_eq!(index.resolve_addr(0x1000).unwrap().name, "_y");
    }

    #[test]
    fn test_own_exports() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(&ImageBuilder::new(Architecture::Arm64, LIB_A, base(0)).export("_foo", 0x1000));

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        let index = symbolizer.index(&mut accel, LIB_A).unwrap();

        assert_eq!(index.resolve_name("_foo"), Some(base(0) + 0x1000));
        assert_eq!(index.resolve_addr(base(0) + 0x1000).unwrap().name, "_foo");

        let again = symbolizer.index(&mut accel, LIB_A).unwrap();
        assert!(Arc::ptr_eq(&index, &again));
        assert!(matches!(
            symbolizer.index(&mut accel, "/usr/lib/libnope.dylib"),
            Err(Error::ImageNotFound { .. })
        ));
    }

    #[test]
    fn test_stub_and_resolver() {
        let mut builder = ImageBuilder::new(Architecture::Arm64, LIB_A, base(0)).export("_r", 0x1000);
        builder.exports[0].flags = EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER;
        builder.exports[0].resolver_address = Some(0x1040);
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(&builder);

        let mut accel = Accelerator::new();
        let index = Symbolizer::new(&cache).index(&mut accel, LIB_A).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.resolve_name("_r"), Some(base(0) + 0x1000));
        assert_eq!(index.resolve_addr(base(0) + 0x1040).unwrap().name, "_r");
    }

    #[test]
    fn test_reexport_chain() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_A, base(0))
                .reexport("_foo", 1, None)
                .dependency(LC_LOAD_DYLIB, LIB_B),
        );
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_B, base(1))
                .reexport("_foo", 1, Some("_c_foo"))
                .dependency(LC_LOAD_DYLIB, LIB_C),
        );
        cache.add_built_image(&ImageBuilder::new(Architecture::Arm64, LIB_C, base(2)).export("_c_foo", 0x1010));

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        assert_eq!(
            symbolizer.resolve_export(&mut accel, LIB_A, "_foo").unwrap(),
            Some(base(2) + 0x1010)
        );

        let index = symbolizer.index(&mut accel, LIB_A).unwrap();
        let found = index.resolve_addr(base(2) + 0x1010).unwrap();
        assert_eq!(found.name, "_foo");
        assert_eq!(found.ordinal, Some(1));
    }

    #[test]
    fn test_cyclic_reexport() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_A, base(0))
                .reexport("_loop", 1, None)
                .export("_fine", 0x1000)
                .dependency(LC_LOAD_DYLIB, LIB_B),
        );
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_B, base(1))
                .reexport("_loop", 1, None)
                .dependency(LC_LOAD_DYLIB, LIB_A),
        );

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        assert!(matches!(
            symbolizer.resolve_export(&mut accel, LIB_A, "_loop"),
            Err(Error::CyclicReExport { .. })
        ));

        // Only the cyclic query fails.
        let index = symbolizer.index(&mut accel, LIB_A).unwrap();
        assert_eq!(index.resolve_name("_fine"), Some(base(0) + 0x1000));
        assert_eq!(index.resolve_name("_loop"), None);
    }

    #[test]
    fn test_diamond_reexport_is_a_miss() {
        const LIB_D: &str = "/usr/lib/libD.dylib";
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_A, base(0))
                .dependency(LC_REEXPORT_DYLIB, LIB_B)
                .dependency(LC_REEXPORT_DYLIB, LIB_C),
        );
        for (n, path) in [(1, LIB_B), (2, LIB_C)] {
            cache.add_built_image(
                &ImageBuilder::new(Architecture::Arm64, path, base(n))
                    .reexport("_x", 1, None)
                    .dependency(LC_LOAD_DYLIB, LIB_D),
            );
        }
        cache.add_built_image(&ImageBuilder::new(Architecture::Arm64, LIB_D, base(3)).export("_y", 0x1000));

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        assert_eq!(symbolizer.resolve_export(&mut accel, LIB_A, "_x").unwrap(), None);
        assert_eq!(
            symbolizer.resolve_export(&mut accel, LIB_A, "_y").unwrap(),
            None,
            "_y is not re-exported by B or C"
        );

        // Both branches reaching D is not a cycle.
        let index = symbolizer.index(&mut accel, LIB_A).unwrap();
        assert_eq!(index.resolve_name("_x"), None);
    }

    #[test]
    fn test_reexport_depth_bound() {
        let path = |n: u64| format!("/usr/lib/libchain{}.dylib", n);
        let mut cache = TestCache::new(Architecture::Arm64);
        for n in 0..40 {
            let mut builder = ImageBuilder::new(Architecture::Arm64, &path(n), base(n));
            builder = if n == 39 {
                builder.export("_deep", 0x1000)
            } else {
                builder.reexport("_deep", 1, None).dependency(LC_LOAD_DYLIB, &path(n + 1))
            };
            cache.add_built_image(&builder);
        }

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);

        // 39 hops, no cycle, still too deep.
        assert!(matches!(
            symbolizer.resolve_export(&mut accel, &path(0), "_deep"),
            Err(Error::CyclicReExport { .. })
        ));

        // 29 hops is within the bound.
        assert_eq!(
            symbolizer.resolve_export(&mut accel, &path(10), "_deep").unwrap(),
            Some(base(39) + 0x1000)
        );
        assert_eq!(
            symbolizer.resolve_export(&mut accel, &path(39 - MAX_REEXPORT_DEPTH as u64), "_deep").unwrap(),
            Some(base(39) + 0x1000)
        );
    }

    #[test]
    fn test_missing_dependency_is_a_miss() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_A, base(0))
                .reexport("_gone", 1, None)
                .reexport("_worse", 7, None)
                .dependency(LC_LOAD_DYLIB, "/usr/lib/libmissing.dylib"),
        );

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        assert_eq!(symbolizer.resolve_export(&mut accel, LIB_A, "_gone").unwrap(), None);
        assert_eq!(symbolizer.resolve_export(&mut accel, LIB_A, "_worse").unwrap(), None);
        assert!(symbolizer.index(&mut accel, LIB_A).unwrap().is_empty());
    }

    #[test]
    fn test_reexported_dylibs() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_A, base(0))
                .export("_own", 0x1000)
                .dependency(LC_LOAD_DYLIB, "/usr/lib/libother.dylib")
                .dependency(LC_REEXPORT_DYLIB, LIB_B),
        );
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_B, base(1))
                .export("_from_b", 0x1000)
                .dependency(LC_REEXPORT_DYLIB, LIB_C),
        );
        cache.add_built_image(&ImageBuilder::new(Architecture::Arm64, LIB_C, base(2)).export("_from_c", 0x1004));

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        let index = symbolizer.index(&mut accel, LIB_A).unwrap();

        assert_eq!(index.len(), 3);
        assert_eq!(index.resolve_name("_from_b"), Some(base(1) + 0x1000));
        assert_eq!(index.resolve_name("_from_c"), Some(base(2) + 0x1004));
        assert_eq!(index.resolve_addr(base(2) + 0x1004).unwrap().ordinal, Some(2));

        // Lookups through A also reach the re-exported dylibs.
        assert_eq!(
            symbolizer.resolve_export(&mut accel, LIB_A, "_from_c").unwrap(),
            Some(base(2) + 0x1004)
        );
    }

    #[test]
    fn test_resolve_import() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_A, base(0))
                .dependency(LC_LOAD_DYLIB, "/usr/lib/libmissing.dylib")
                .dependency(LC_LOAD_DYLIB, LIB_B)
                .dependency(LC_LOAD_DYLIB, LIB_C),
        );
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_B, base(1))
                .reexport("_open", 1, Some("_c_open"))
                .dependency(LC_LOAD_DYLIB, LIB_C),
        );
        cache.add_built_image(
            &ImageBuilder::new(Architecture::Arm64, LIB_C, base(2))
                .export("_c_open", 0x1000)
                .export("_close", 0x1010),
        );

        let mut accel = Accelerator::new();
        let symbolizer = Symbolizer::new(&cache);
        assert_eq!(
            symbolizer.resolve_import(&mut accel, LIB_A, "_open").unwrap(),
            Some(base(2) + 0x1000)
        );
        assert_eq!(
            symbolizer.resolve_import(&mut accel, LIB_A, "_close").unwrap(),
            Some(base(2) + 0x1010)
        );
        assert_eq!(symbolizer.resolve_import(&mut accel, LIB_A, "_nothing").unwrap(), None);
        assert_eq!(symbolizer.resolve_import(&mut accel, "/usr/lib/libnone.dylib", "_open").unwrap(), None);
    }
}
