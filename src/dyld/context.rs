//! Dyld shared cache context and file handling.
//!
//! This module provides the main interface for working with dyld shared caches,
//! including memory mapping, address conversion, and subcache management.

use std::fs::File;
use std::mem::offset_of;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;
use zerocopy::FromBytes;

use super::chain::{ChainFormat, ChainRegion};
use super::space::{AddressSpace, SharedCache};
use super::structs::*;
use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::macho::{VM_PROT_EXECUTE, VM_PROT_WRITE};
use crate::util;

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry that works with both basic and extended mapping formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: u32,
    /// Initial protection
    pub init_prot: u32,
    /// File offset to slide info (0 if none)
    pub slide_info_offset: u64,
    /// Size of slide info (0 if none)
    pub slide_info_size: u64,
    /// Mapping flags
    pub flags: u64,
    /// Index of the subcache containing this mapping (0 = main cache)
    pub subcache_index: usize,
}

impl From<&DyldCacheMappingInfo> for MappingEntry {
    fn from(info: &DyldCacheMappingInfo) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            slide_info_offset: 0,
            slide_info_size: 0,
            flags: 0,
            subcache_index: 0,
        }
    }
}

impl From<&DyldCacheMappingAndSlideInfo> for MappingEntry {
    fn from(info: &DyldCacheMappingAndSlideInfo) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: info.max_prot,
            init_prot: info.init_prot,
            slide_info_offset: info.slide_info_file_offset,
            slide_info_size: info.slide_info_file_size,
            flags: info.flags,
            subcache_index: 0,
        }
    }
}

impl MappingEntry {
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// File offset of `addr`, which must lie inside the mapping.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.init_prot & VM_PROT_WRITE != 0
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.init_prot & VM_PROT_EXECUTE != 0
    }

    /// Returns true if this mapping has slide info.
    #[inline]
    pub fn has_slide_info(&self) -> bool {
        self.slide_info_size > 0
    }

    /// Returns the mapping flags.
    #[inline]
    pub fn mapping_flags(&self) -> MappingFlags {
        MappingFlags::from_bits_truncate(self.flags)
    }
}

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Path of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Index of the file containing the header
    pub subcache_index: usize,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path matches the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Subcache Entry
// =============================================================================

/// A loaded subcache file.
#[derive(Debug)]
pub struct SubcacheFile {
    /// Memory-mapped file data
    pub mmap: Mmap,
    /// Path to the file
    pub path: PathBuf,
    /// UUID of the subcache
    pub uuid: [u8; 16],
    /// VM offset from the main cache
    pub vm_offset: u64,
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// Holds the memory-mapped cache files and the parsed tables. The files
/// are only ever read.
#[derive(Debug)]
pub struct DyldContext {
    /// Main cache file (memory-mapped)
    pub mmap: Mmap,
    /// Path to the main cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
    /// Architecture from the header magic
    pub arch: Architecture,
    /// All mappings (including from subcaches), sorted by address
    pub mappings: Vec<MappingEntry>,
    /// All images
    pub images: Vec<ImageEntry>,
    /// Subcache files
    pub subcaches: Vec<SubcacheFile>,
    /// Symbols file (if separate)
    pub symbols_file: Option<SubcacheFile>,
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    ///
    /// This will automatically detect and load any subcaches.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = Self::map_file(&path)?;

        let header = Self::parse_header(&mmap)?;
        let arch = Architecture::from_cache_name(header.arch_name())
            .ok_or_else(|| Error::UnsupportedArchitecture(header.arch_name().to_string()))?;

        let mappings = Self::parse_mappings(&mmap, &header, 0)?;

        let mut ctx = Self {
            mmap,
            path: path.clone(),
            header,
            arch,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
            symbols_file: None,
        };

        ctx.load_subcaches(&path)?;
        ctx.load_symbols_file(&path)?;

        // Translation binary-searches the mappings.
        ctx.mappings.sort_by_key(|m| m.address);

        ctx.images = ctx.parse_images()?;

        debug!(
            "opened {} cache: {} mappings, {} images, {} subcaches",
            ctx.arch,
            ctx.mappings.len(),
            ctx.images.len(),
            ctx.subcaches.len()
        );

        Ok(ctx)
    }

    /// Memory-maps a file read-only.
    fn map_file(path: &Path) -> Result<Mmap> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: the cache files are opened read-only and not modified while mapped.
        unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        let header = DyldCacheHeader::read_from_prefix(data)
            .map_err(|_| {
                Error::buffer_too_small(std::mem::size_of::<DyldCacheHeader>(), data.len())
            })?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMagic([
                header.magic[0],
                header.magic[1],
                header.magic[2],
                header.magic[3],
            ]));
        }

        Ok(header)
    }

    /// Reads a record at a file offset, failing with a parse error.
    fn read_record<T: FromBytes>(data: &[u8], offset: usize, what: &str) -> Result<T> {
        data.get(offset..)
            .and_then(|tail| T::read_from_prefix(tail).ok())
            .map(|(value, _)| value)
            .ok_or_else(|| Error::parse(offset, format!("failed to parse {}", what)))
    }

    /// Reads `count` consecutive records starting at `offset`.
    fn read_table<T: FromBytes>(
        data: &[u8],
        offset: usize,
        count: usize,
        what: &str,
    ) -> Result<Vec<T>> {
        (0..count)
            .map(|i| Self::read_record(data, offset + i * std::mem::size_of::<T>(), what))
            .collect()
    }

    /// Parses the mapping table of one cache file.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        let extended = header.contains_field(offset_of!(DyldCacheHeader, mapping_with_slide_offset))
            && header.mapping_with_slide_offset != 0;

        let mut mappings: Vec<MappingEntry> = if extended {
            Self::read_table::<DyldCacheMappingAndSlideInfo>(
                data,
                header.mapping_with_slide_offset as usize,
                header.mapping_with_slide_count as usize,
                "extended mapping",
            )?
            .iter()
            .map(MappingEntry::from)
            .collect()
        } else {
            let mut basic: Vec<MappingEntry> = Self::read_table::<DyldCacheMappingInfo>(
                data,
                header.mapping_offset as usize,
                header.mapping_count as usize,
                "mapping",
            )?
            .iter()
            .map(MappingEntry::from)
            .collect();

            // Before per-mapping slide info, the header described the one
            // slid mapping, which is always the second.
            if subcache_index == 0 && header.slide_info_size_unused != 0 {
                if let Some(data_mapping) = basic.get_mut(1) {
                    data_mapping.slide_info_offset = header.slide_info_offset_unused;
                    data_mapping.slide_info_size = header.slide_info_size_unused;
                }
            }
            basic
        };

        for mapping in &mut mappings {
            mapping.subcache_index = subcache_index;
        }
        Ok(mappings)
    }

    /// Path of a file next to the main cache, e.g. `.01` or `.symbols`.
    fn sibling_path(main_path: &Path, suffix: &str) -> PathBuf {
        let mut name = main_path.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Loads subcache files.
    fn load_subcaches(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let count = self.header.sub_cache_array_count as usize;
        let offset = self.header.sub_cache_array_offset as usize;
        let v2 = self.has_v2_subcache_entries();

        let entry_size = if v2 {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        for i in 0..count {
            let entry_offset = offset + i * entry_size;

            let (uuid, vm_offset, suffix) = if v2 {
                let entry: DyldSubcacheEntry2 =
                    Self::read_record(&self.mmap, entry_offset, "subcache entry v2")?;
                (
                    entry.uuid,
                    entry.cache_vm_offset,
                    entry.suffix_str().to_string(),
                )
            } else {
                let entry: DyldSubcacheEntry =
                    Self::read_record(&self.mmap, entry_offset, "subcache entry")?;
                (entry.uuid, entry.cache_vm_offset, format!(".{}", i + 1))
            };

            let subcache_path = Self::sibling_path(main_path, &suffix);
            self.load_subcache_file(&subcache_path, uuid, vm_offset, i + 1)?;
        }

        Ok(())
    }

    /// Loads a single subcache file and appends its mappings.
    fn load_subcache_file(
        &mut self,
        path: &Path,
        expected_uuid: [u8; 16],
        vm_offset: u64,
        subcache_index: usize,
    ) -> Result<()> {
        if !path.exists() {
            return Err(Error::SubcacheNotFound {
                path: path.to_path_buf(),
            });
        }

        let mmap = Self::map_file(path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != expected_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(&expected_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        let subcache_mappings = Self::parse_mappings(&mmap, &header, subcache_index)?;
        self.mappings.extend(subcache_mappings);

        self.subcaches.push(SubcacheFile {
            mmap,
            path: path.to_path_buf(),
            uuid: header.uuid,
            vm_offset,
        });

        Ok(())
    }

    /// Loads the symbols file if present.
    fn load_symbols_file(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }

        let symbols_path = Self::sibling_path(main_path, ".symbols");

        // The symbols file is optional.
        if !symbols_path.exists() {
            return Ok(());
        }

        let mmap = Self::map_file(&symbols_path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != self.header.symbol_file_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: symbols_path,
                expected: uuid_to_string(&self.header.symbol_file_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        self.symbols_file = Some(SubcacheFile {
            mmap,
            path: symbols_path,
            uuid: header.uuid,
            vm_offset: 0,
        });

        Ok(())
    }

    /// Parses the image list.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;

        let infos: Vec<DyldCacheImageInfo> =
            Self::read_table(&self.mmap, offset, count, "image info")?;

        infos
            .iter()
            .enumerate()
            .map(|(index, info)| {
                Ok(ImageEntry {
                    index,
                    address: info.address,
                    path: self.read_string(info.path_file_offset as usize)?,
                    subcache_index: self.translate(info.address).map_or(0, |(_, file)| file),
                })
            })
            .collect()
    }

    /// Checks if this cache uses v2 subcache entries.
    fn has_v2_subcache_entries(&self) -> bool {
        if self.header.sub_cache_array_count == 0 {
            return false;
        }

        // v2 entries embed a suffix that starts with '.'.
        let offset = self.header.sub_cache_array_offset as usize;
        self.mmap
            .get(offset..)
            .and_then(|tail| DyldSubcacheEntry2::read_from_prefix(tail).ok())
            .is_some_and(|(entry, _)| entry.file_suffix[0] == b'.')
    }

    /// Reads a null-terminated string from the main cache file.
    pub fn read_string(&self, offset: usize) -> Result<String> {
        let bytes = self
            .mmap
            .get(offset..)
            .ok_or_else(|| Error::parse(offset, "string offset out of bounds"))?;
        let end = util::memchr_null(bytes);
        String::from_utf8(bytes[..end].to_vec())
            .map_err(|_| Error::parse(offset, "invalid UTF-8 string"))
    }

    /// Returns the mmap data for a given subcache index.
    #[inline]
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.mmap[..]
        } else if let Some(subcache) = self.subcaches.get(index - 1) {
            &subcache.mmap[..]
        } else {
            &[]
        }
    }

    /// Returns the mapping for a given virtual address.
    #[inline]
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self
            .mappings
            .partition_point(|m| m.address + m.size <= addr);
        self.mappings.get(idx).filter(|m| m.contains_addr(addr))
    }

    /// Finds an image by path or basename.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.image_by_path(name)
            .or_else(|| self.images.iter().find(|img| img.matches_filter(name)))
    }

    /// Returns the number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Returns true if this cache has subcaches.
    pub fn has_subcaches(&self) -> bool {
        !self.subcaches.is_empty()
    }

    /// Returns the total size of all cache files.
    pub fn total_size(&self) -> u64 {
        let main_size = self.mmap.len() as u64;
        let subcache_size: u64 = self.subcaches.iter().map(|s| s.mmap.len() as u64).sum();
        let symbols_size = self
            .symbols_file
            .as_ref()
            .map(|s| s.mmap.len() as u64)
            .unwrap_or(0);
        main_size + subcache_size + symbols_size
    }

    /// Parses the slide info blob of one mapping into a chain region.
    fn parse_slide_info(&self, mapping: &MappingEntry) -> Result<ChainRegion> {
        let data = self.data_for_subcache(mapping.subcache_index);
        let start = mapping.slide_info_offset as usize;
        let blob = data
            .get(start..start.saturating_add(mapping.slide_info_size as usize))
            .ok_or_else(|| Error::InvalidSlideInfo {
                offset: mapping.slide_info_offset,
                reason: "slide info extends past the end of the file".into(),
            })?;

        parse_slide_info(blob, mapping.address, mapping.size).map_err(|err| match err {
            Error::Parse { reason, .. } => Error::InvalidSlideInfo {
                offset: mapping.slide_info_offset,
                reason,
            },
            other => other,
        })
    }
}

/// Parses a slide info blob for a mapping at `address` of `size` bytes.
pub fn parse_slide_info(blob: &[u8], address: u64, size: u64) -> Result<ChainRegion> {
    if blob.len() < 4 {
        return Err(Error::parse(0, "truncated slide info header"));
    }
    let version = util::read_u32_le(blob);

    let read_u16s = |offset: usize, count: usize, what: &str| -> Result<Vec<u16>> {
        let bytes = blob
            .get(offset..offset + count * 2)
            .ok_or_else(|| Error::parse(offset, format!("{} out of bounds", what)))?;
        Ok(bytes.chunks_exact(2).map(util::read_u16_le).collect())
    };

    let region = match version {
        1 => {
            let info = DyldCacheSlideInfo1::read_from_prefix(blob)
                .map_err(|_| Error::parse(0, "truncated v1 slide info"))?
                .0;
            let toc = read_u16s(info.toc_offset as usize, info.toc_count as usize, "toc")?;
            let entries_start = info.entries_offset as usize;
            let entries_len = info.entries_count as usize * info.entries_size as usize;
            let bitmaps = blob
                .get(entries_start..entries_start + entries_len)
                .ok_or_else(|| Error::parse(entries_start, "bitmap entries out of bounds"))?
                .to_vec();
            ChainRegion {
                address,
                size,
                page_size: SLIDE_V1_PAGE_SIZE,
                format: ChainFormat::SlideV1 {
                    entry_size: info.entries_size,
                },
                page_starts: toc,
                page_extras: Vec::new(),
                bitmaps,
            }
        }

        2 | 4 => {
            let info = DyldCacheSlideInfo2::read_from_prefix(blob)
                .map_err(|_| Error::parse(0, "truncated v2/v4 slide info"))?
                .0;
            let page_starts = read_u16s(
                info.page_starts_offset as usize,
                info.page_starts_count as usize,
                "page starts",
            )?;
            let page_extras = read_u16s(
                info.page_extras_offset as usize,
                info.page_extras_count as usize,
                "page extras",
            )?;
            let format = if version == 2 {
                ChainFormat::SlideV2 {
                    delta_mask: info.delta_mask,
                    value_add: info.value_add,
                }
            } else {
                ChainFormat::SlideV4 {
                    delta_mask: info.delta_mask,
                    value_add: info.value_add,
                }
            };
            ChainRegion {
                address,
                size,
                page_size: info.page_size as u64,
                format,
                page_starts,
                page_extras,
                bitmaps: Vec::new(),
            }
        }

        3 => {
            let info = DyldCacheSlideInfo3::read_from_prefix(blob)
                .map_err(|_| Error::parse(0, "truncated v3 slide info"))?
                .0;
            ChainRegion {
                address,
                size,
                page_size: info.page_size as u64,
                format: ChainFormat::SlideV3 {
                    auth_value_add: info.auth_value_add,
                },
                page_starts: read_u16s(
                    DyldCacheSlideInfo3::PAGE_STARTS_OFFSET,
                    info.page_starts_count as usize,
                    "page starts",
                )?,
                page_extras: Vec::new(),
                bitmaps: Vec::new(),
            }
        }

        5 => {
            let info = DyldCacheSlideInfo5::read_from_prefix(blob)
                .map_err(|_| Error::parse(0, "truncated v5 slide info"))?
                .0;
            ChainRegion {
                address,
                size,
                page_size: info.page_size as u64,
                format: ChainFormat::SlideV5 {
                    value_add: info.value_add,
                },
                page_starts: read_u16s(
                    DyldCacheSlideInfo5::PAGE_STARTS_OFFSET,
                    info.page_starts_count as usize,
                    "page starts",
                )?,
                page_extras: Vec::new(),
                bitmaps: Vec::new(),
            }
        }

        other => return Err(Error::UnsupportedSlideVersion(other)),
    };

    if region.page_size == 0 {
        return Err(Error::parse(4, "zero page size"));
    }

    Ok(region)
}

impl AddressSpace for DyldContext {
    #[inline]
    fn translate(&self, addr: u64) -> Option<(u64, usize)> {
        self.mapping_for_addr(addr)
            .map(|m| (m.addr_to_offset(addr), m.subcache_index))
    }

    #[inline]
    fn read_bytes(&self, file_index: usize, offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.data_for_subcache(file_index)
            .get(start..start.checked_add(len)?)
    }
}

impl SharedCache for DyldContext {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    fn chain_regions(&self) -> Result<Vec<ChainRegion>> {
        self.mappings
            .iter()
            .filter(|m| m.has_slide_info())
            .map(|m| self.parse_slide_info(m))
            .collect()
    }
}
