//! In-memory caches for tests.
//!
//! [`TestCache`] implements [`SharedCache`] over plain byte vectors, and
//! [`ImageBuilder`] lays out a small dylib the way the cache builder does:
//! `__TEXT`, `__DATA` and `__LINKEDIT` back to back, with file offsets equal
//! to the offsets from the image base.

use zerocopy::IntoBytes;

use super::chain::{ChainFormat, ChainRegion};
use super::context::ImageEntry;
use super::space::{AddressSpace, SharedCache};
use super::trie::ExportInfo;
use crate::arch::Architecture;
use crate::error::Result;
use crate::macho::*;
use crate::util;

/// Offset of `__TEXT,__text` from the image base.
pub const TEXT_OFFSET: u64 = 0x1000;
/// Offset of `__TEXT,__stubs` from the image base.
pub const STUBS_OFFSET: u64 = 0x3000;
/// Offset of `__DATA` from the image base.
pub const DATA_OFFSET: u64 = 0x4000;
/// Offset of the symbol pointer section from the image base.
pub const POINTERS_OFFSET: u64 = 0x6000;
/// Offset of `__LINKEDIT` from the image base.
pub const LINKEDIT_OFFSET: u64 = 0x8000;
/// Total size of a built image.
pub const IMAGE_SIZE: u64 = 0xC000;

/// Delta mask used by [`slide_v2_region`].
pub const V2_DELTA_MASK: u64 = 0x00FF_FF00_0000_0000;

/// A cache held entirely in memory. Every mapped range is its own file.
#[derive(Debug)]
pub struct TestCache {
    arch: Architecture,
    files: Vec<(u64, Vec<u8>)>,
    images: Vec<ImageEntry>,
    regions: Vec<ChainRegion>,
}

impl TestCache {
    pub fn new(arch: Architecture) -> Self {
        Self {
            arch,
            files: Vec::new(),
            images: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Maps `data` at `address` and returns the file index.
    pub fn map(&mut self, address: u64, data: Vec<u8>) -> usize {
        self.files.push((address, data));
        self.files.len() - 1
    }

    /// Maps `size` zero bytes at `address`.
    pub fn map_zeroed(&mut self, address: u64, size: usize) -> usize {
        self.map(address, vec![0u8; size])
    }

    /// Overwrites mapped bytes. Panics if the range is not mapped.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let (base, data) = self
            .files
            .iter_mut()
            .find(|(base, data)| addr >= *base && addr - *base < data.len() as u64)
            .expect("address not mapped");
        let start = (addr - *base) as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Writes a sequence of instruction words.
    pub fn write_code(&mut self, addr: u64, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            self.write_u32(addr + i as u64 * 4, word);
        }
    }

    pub fn add_region(&mut self, region: ChainRegion) {
        self.regions.push(region);
    }

    /// Registers an image already present in the mapped bytes.
    pub fn add_image(&mut self, path: &str, address: u64) {
        self.images.push(ImageEntry {
            index: self.images.len(),
            address,
            path: path.to_string(),
            subcache_index: 0,
        });
    }

    /// Maps a built image at its base and registers it.
    pub fn add_built_image(&mut self, image: &ImageBuilder) {
        self.map(image.base, image.build());
        self.add_image(&image.path, image.base);
    }
}

impl AddressSpace for TestCache {
    fn translate(&self, addr: u64) -> Option<(u64, usize)> {
        self.files
            .iter()
            .position(|(base, data)| addr >= *base && addr - *base < data.len() as u64)
            .map(|index| (addr - self.files[index].0, index))
    }

    fn read_bytes(&self, file_index: usize, offset: u64, len: usize) -> Option<&[u8]> {
        let (_, data) = self.files.get(file_index)?;
        let start = usize::try_from(offset).ok()?;
        data.get(start..start.checked_add(len)?)
    }
}

impl SharedCache for TestCache {
    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    fn chain_regions(&self) -> Result<Vec<ChainRegion>> {
        Ok(self.regions.clone())
    }
}

/// A v2 slide region with 4KiB pages, no value add and the given starts.
pub fn slide_v2_region(address: u64, size: u64, page_starts: Vec<u16>) -> ChainRegion {
    ChainRegion {
        address,
        size,
        page_size: 0x1000,
        format: ChainFormat::SlideV2 {
            delta_mask: V2_DELTA_MASK,
            value_add: 0,
        },
        page_starts,
        page_extras: Vec::new(),
        bitmaps: Vec::new(),
    }
}

/// Encodes a v2 slot for [`slide_v2_region`].
pub fn v2_slot(target: u64, next: u64) -> u64 {
    target | ((next / 4) << 40)
}

/// Encodes a flat export trie: the root carries one edge per export.
pub fn build_export_trie(exports: &[ExportInfo]) -> Vec<u8> {
    let terminals: Vec<Vec<u8>> = exports.iter().map(encode_terminal).collect();

    let mut root_size = 2;
    loop {
        let mut out = vec![0x00, exports.len() as u8];
        let mut child = root_size;
        for (export, terminal) in exports.iter().zip(&terminals) {
            out.extend_from_slice(export.name.as_bytes());
            out.push(0);
            util::write_uleb128(&mut out, child as u64);
            child += uleb_len(terminal.len() as u64) + terminal.len() + 1;
        }

        // Edge offsets depend on the root's own size; repeat until stable.
        if out.len() != root_size {
            root_size = out.len();
            continue;
        }

        for terminal in &terminals {
            util::write_uleb128(&mut out, terminal.len() as u64);
            out.extend_from_slice(terminal);
            out.push(0);
        }
        return out;
    }
}

fn encode_terminal(export: &ExportInfo) -> Vec<u8> {
    let mut out = Vec::new();
    util::write_uleb128(&mut out, export.flags);
    if export.is_reexport() {
        util::write_uleb128(&mut out, export.reexport_ordinal.unwrap_or(0) as u64);
        if let Some(name) = &export.reexport_name {
            out.extend_from_slice(name.as_bytes());
        }
        out.push(0);
    } else {
        util::write_uleb128(&mut out, export.address);
        if let Some(resolver) = export.resolver_address {
            util::write_uleb128(&mut out, resolver);
        }
    }
    out
}

fn uleb_len(value: u64) -> usize {
    let mut out = Vec::new();
    util::write_uleb128(&mut out, value);
    out.len()
}

/// Builds the bytes of a small dylib as it appears inside a cache.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pub arch: Architecture,
    pub path: String,
    pub base: u64,
    pub code: Vec<u8>,
    pub data: Vec<u8>,
    pub function_starts: Vec<u64>,
    pub exports: Vec<ExportInfo>,
    pub dependencies: Vec<(u32, String)>,
    /// Contents of `__TEXT,__stubs`
    pub stubs: Vec<u8>,
    pub stub_size: u32,
    pub stub_names: Vec<String>,
    /// Name of the symbol pointer section in `__DATA`
    pub pointer_section: &'static str,
    pub pointer_names: Vec<String>,
    omitted: Vec<&'static str>,
}

/// A section header before it is laid out for a given width.
struct SectionSpec {
    name: &'static str,
    segment: &'static str,
    addr: u64,
    size: u64,
    offset: u64,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
}

impl ImageBuilder {
    pub fn new(arch: Architecture, path: &str, base: u64) -> Self {
        Self {
            arch,
            path: path.to_string(),
            base,
            code: vec![0u8; 0x100],
            data: Vec::new(),
            function_starts: vec![TEXT_OFFSET],
            exports: Vec::new(),
            dependencies: Vec::new(),
            stubs: Vec::new(),
            stub_size: 0,
            stub_names: Vec::new(),
            pointer_section: "__got",
            pointer_names: Vec::new(),
            omitted: Vec::new(),
        }
    }

    /// Sets the contents of `__TEXT,__text` from instruction words.
    pub fn code_words(mut self, words: &[u32]) -> Self {
        self.code = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self
    }

    /// Sets the function start offsets (from the image base). A set low
    /// bit marks a Thumb function.
    pub fn function_starts(mut self, starts: &[u64]) -> Self {
        self.function_starts = starts.to_vec();
        self
    }

    /// Adds a regular export at an offset from the image base.
    pub fn export(mut self, name: &str, offset: u64) -> Self {
        self.exports.push(ExportInfo {
            name: name.to_string(),
            flags: 0,
            address: offset,
            reexport_ordinal: None,
            reexport_name: None,
            resolver_address: None,
        });
        self
    }

    /// Adds a re-export of `import` (or the same name) from a dependency.
    pub fn reexport(mut self, name: &str, ordinal: u32, import: Option<&str>) -> Self {
        self.exports.push(ExportInfo {
            name: name.to_string(),
            flags: super::trie::EXPORT_SYMBOL_FLAGS_REEXPORT,
            address: 0,
            reexport_ordinal: Some(ordinal),
            reexport_name: import.map(str::to_string),
            resolver_address: None,
        });
        self
    }

    /// Adds a dylib load command after `LC_ID_DYLIB`.
    pub fn dependency(mut self, cmd: u32, path: &str) -> Self {
        self.dependencies.push((cmd, path.to_string()));
        self
    }

    /// Adds `__TEXT,__stubs` at [`STUBS_OFFSET`] holding `words`, one `size`
    /// byte stub per name.
    pub fn stubs(mut self, size: u32, words: &[u32], names: &[&str]) -> Self {
        self.stubs = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.stubs.resize(size as usize * names.len(), 0);
        self.stub_size = size;
        self.stub_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Adds a symbol pointer section to `__DATA` at [`POINTERS_OFFSET`].
    /// `__la_symbol_ptr` is lazy, every other name non-lazy.
    pub fn pointers(mut self, section: &'static str, names: &[&str]) -> Self {
        self.pointer_section = section;
        self.pointer_names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Leaves out a structure: `"__DATA"`, `"__LINKEDIT"`, `"__text"`,
    /// `"symtab"`, `"dysymtab"` or `"function_starts"`.
    pub fn without(mut self, part: &'static str) -> Self {
        self.omitted.push(part);
        self
    }

    fn has(&self, part: &str) -> bool {
        !self.omitted.contains(&part)
    }

    /// Lays out the image.
    pub fn build(&self) -> Vec<u8> {
        let is_64 = self.arch.is_64bit();
        let mut image = vec![0u8; IMAGE_SIZE as usize];

        // Linkedit contents first, their offsets go into the commands.
        let mut linkedit = Vec::new();
        let fstarts_off = LINKEDIT_OFFSET;
        let mut last = 0u64;
        for &start in &self.function_starts {
            util::write_uleb128(&mut linkedit, start - last);
            last = start;
        }
        linkedit.push(0);
        let fstarts_size = linkedit.len() as u32;
        while linkedit.len() % 8 != 0 {
            linkedit.push(0);
        }
        let trie_off = LINKEDIT_OFFSET + linkedit.len() as u64;
        let trie = build_export_trie(&self.exports);
        linkedit.extend_from_slice(&trie);
        let trie_size = trie.len() as u32;

        // Undefined symbols for every stub and pointer name, then the
        // indirect table: stubs first, pointers after.
        let mut names: Vec<&str> = Vec::new();
        for name in self.stub_names.iter().chain(&self.pointer_names) {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        let mut strings = if names.is_empty() { Vec::new() } else { vec![b' ', 0] };
        let mut symbols = Vec::new();
        for name in &names {
            let n_strx = strings.len() as u32;
            strings.extend_from_slice(name.as_bytes());
            strings.push(0);
            if is_64 {
                let nlist = Nlist64 {
                    n_strx,
                    n_type: N_UNDF | N_EXT,
                    ..Default::default()
                };
                symbols.extend_from_slice(nlist.as_bytes());
            } else {
                let nlist = Nlist {
                    n_strx,
                    n_type: N_UNDF | N_EXT,
                    n_sect: 0,
                    n_desc: 0,
                    n_value: 0,
                };
                symbols.extend_from_slice(nlist.as_bytes());
            }
        }

        while linkedit.len() % 8 != 0 {
            linkedit.push(0);
        }
        let symoff = LINKEDIT_OFFSET as usize + linkedit.len();
        linkedit.extend_from_slice(&symbols);
        let stroff = LINKEDIT_OFFSET as usize + linkedit.len();
        linkedit.extend_from_slice(&strings);
        while linkedit.len() % 4 != 0 {
            linkedit.push(0);
        }
        let indirectoff = LINKEDIT_OFFSET as usize + linkedit.len();
        let indirect: Vec<&String> = self.stub_names.iter().chain(&self.pointer_names).collect();
        for name in &indirect {
            let index = names.iter().position(|n| *n == name.as_str()).unwrap_or(0) as u32;
            linkedit.extend_from_slice(&index.to_le_bytes());
        }

        let start = LINKEDIT_OFFSET as usize;
        image[start..start + linkedit.len()].copy_from_slice(&linkedit);

        let data_start = DATA_OFFSET as usize;
        image[data_start..data_start + self.data.len()].copy_from_slice(&self.data);
        let text_start = TEXT_OFFSET as usize;
        image[text_start..text_start + self.code.len()].copy_from_slice(&self.code);
        let stubs_start = STUBS_OFFSET as usize;
        image[stubs_start..stubs_start + self.stubs.len()].copy_from_slice(&self.stubs);

        let mut cmds: Vec<Vec<u8>> = Vec::new();
        cmds.push(self.segment(is_64, "__TEXT", 0, DATA_OFFSET, VM_PROT_READ | VM_PROT_EXECUTE));
        if self.has("__DATA") {
            cmds.push(self.segment(is_64, "__DATA", DATA_OFFSET, 0x4000, VM_PROT_READ | VM_PROT_WRITE));
        }
        if self.has("__LINKEDIT") {
            cmds.push(self.segment(is_64, "__LINKEDIT", LINKEDIT_OFFSET, 0x4000, VM_PROT_READ));
        }
        if self.has("symtab") {
            let symtab = SymtabCommand {
                cmd: LC_SYMTAB,
                cmdsize: SymtabCommand::SIZE as u32,
                symoff: if names.is_empty() { 0 } else { symoff as u32 },
                nsyms: names.len() as u32,
                stroff: if strings.is_empty() { 0 } else { stroff as u32 },
                strsize: strings.len() as u32,
            };
            cmds.push(symtab.as_bytes().to_vec());
        }
        if self.has("dysymtab") {
            let mut dysymtab = vec![0u8; DysymtabCommand::SIZE];
            util::write_u32_le(&mut dysymtab[0..4], LC_DYSYMTAB);
            util::write_u32_le(&mut dysymtab[4..8], DysymtabCommand::SIZE as u32);
            if !indirect.is_empty() {
                util::write_u32_le(&mut dysymtab[56..60], indirectoff as u32);
                util::write_u32_le(&mut dysymtab[60..64], indirect.len() as u32);
            }
            cmds.push(dysymtab);
        }
        if self.has("function_starts") {
            cmds.push(linkedit_cmd(LC_FUNCTION_STARTS, fstarts_off as u32, fstarts_size));
        }
        cmds.push(linkedit_cmd(LC_DYLD_EXPORTS_TRIE, trie_off as u32, trie_size));
        cmds.push(dylib_cmd(LC_ID_DYLIB, &self.path));
        for (cmd, path) in &self.dependencies {
            cmds.push(dylib_cmd(*cmd, path));
        }

        let sizeofcmds: usize = cmds.iter().map(Vec::len).sum();
        let (cputype, cpusubtype) = match self.arch {
            Architecture::Arm => (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7),
            Architecture::Arm64 => (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL),
            Architecture::Arm64_32 => (CPU_TYPE_ARM64_32, 1),
            Architecture::X86_64 => (CPU_TYPE_X86_64, 3),
        };

        let mut off = if is_64 {
            let header = MachHeader64 {
                magic: MH_MAGIC_64,
                cputype,
                cpusubtype,
                filetype: MH_DYLIB,
                ncmds: cmds.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: 0,
                reserved: 0,
            };
            image[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
            MachHeader64::SIZE
        } else {
            let header = MachHeader {
                magic: MH_MAGIC,
                cputype,
                cpusubtype,
                filetype: MH_DYLIB,
                ncmds: cmds.len() as u32,
                sizeofcmds: sizeofcmds as u32,
                flags: 0,
            };
            image[..MachHeader::SIZE].copy_from_slice(header.as_bytes());
            MachHeader::SIZE
        };

        for cmd in cmds {
            image[off..off + cmd.len()].copy_from_slice(&cmd);
            off += cmd.len();
        }

        image
    }

    fn sections_of(&self, segment: &str) -> Vec<SectionSpec> {
        let mut sections = Vec::new();
        if segment == "__TEXT" && self.has("__text") {
            sections.push(SectionSpec {
                name: "__text",
                segment: "__TEXT",
                addr: self.base + TEXT_OFFSET,
                size: self.code.len() as u64,
                offset: TEXT_OFFSET,
                flags: S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                reserved1: 0,
                reserved2: 0,
            });
        }
        if segment == "__TEXT" && !self.stub_names.is_empty() {
            sections.push(SectionSpec {
                name: "__stubs",
                segment: "__TEXT",
                addr: self.base + STUBS_OFFSET,
                size: self.stubs.len() as u64,
                offset: STUBS_OFFSET,
                flags: S_SYMBOL_STUBS | S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS,
                reserved1: 0,
                reserved2: self.stub_size,
            });
        }
        if segment == "__DATA" && !self.pointer_names.is_empty() {
            let kind = if self.pointer_section == "__la_symbol_ptr" {
                S_LAZY_SYMBOL_POINTERS
            } else {
                S_NON_LAZY_SYMBOL_POINTERS
            };
            sections.push(SectionSpec {
                name: self.pointer_section,
                segment: "__DATA",
                addr: self.base + POINTERS_OFFSET,
                size: (self.pointer_names.len() * self.arch.pointer_size()) as u64,
                offset: POINTERS_OFFSET,
                flags: kind,
                reserved1: self.stub_names.len() as u32,
                reserved2: 0,
            });
        }
        sections
    }

    fn segment(&self, is_64: bool, name: &str, offset: u64, size: u64, prot: u32) -> Vec<u8> {
        let sections = self.sections_of(name);
        let nsects = sections.len() as u32;

        if is_64 {
            let mut seg = SegmentCommand64::default();
            seg.set_name(name);
            seg.cmdsize = (SegmentCommand64::SIZE + sections.len() * Section64::SIZE) as u32;
            seg.vmaddr = self.base + offset;
            seg.vmsize = size;
            seg.fileoff = offset;
            seg.filesize = size;
            seg.maxprot = prot;
            seg.initprot = prot;
            seg.nsects = nsects;
            let mut out = seg.as_bytes().to_vec();
            for spec in &sections {
                let mut sect = Section64::default();
                sect.set_name(spec.name);
                sect.set_segment_name(spec.segment);
                sect.addr = spec.addr;
                sect.size = spec.size;
                sect.offset = spec.offset as u32;
                sect.align = 2;
                sect.flags = spec.flags;
                sect.reserved1 = spec.reserved1;
                sect.reserved2 = spec.reserved2;
                out.extend_from_slice(sect.as_bytes());
            }
            out
        } else {
            let seg = SegmentCommand {
                cmd: LC_SEGMENT,
                cmdsize: (SegmentCommand::SIZE + sections.len() * Section::SIZE) as u32,
                segname: fixed(name),
                vmaddr: (self.base + offset) as u32,
                vmsize: size as u32,
                fileoff: offset as u32,
                filesize: size as u32,
                maxprot: prot,
                initprot: prot,
                nsects,
                flags: 0,
            };
            let mut out = seg.as_bytes().to_vec();
            for spec in &sections {
                let sect = Section {
                    sectname: fixed(spec.name),
                    segname: fixed(spec.segment),
                    addr: spec.addr as u32,
                    size: spec.size as u32,
                    offset: spec.offset as u32,
                    align: 2,
                    reloff: 0,
                    nreloc: 0,
                    flags: spec.flags,
                    reserved1: spec.reserved1,
                    reserved2: spec.reserved2,
                };
                out.extend_from_slice(sect.as_bytes());
            }
            out
        }
    }
}

fn fixed(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..name.len()].copy_from_slice(name.as_bytes());
    out
}

fn linkedit_cmd(cmd: u32, dataoff: u32, datasize: u32) -> Vec<u8> {
    LinkeditDataCommand {
        cmd,
        cmdsize: LinkeditDataCommand::SIZE as u32,
        dataoff,
        datasize,
    }
    .as_bytes()
    .to_vec()
}

fn dylib_cmd(cmd: u32, path: &str) -> Vec<u8> {
    let size = util::align_up((DylibCommand::SIZE + path.len() + 1) as u64, 8) as usize;
    let command = DylibCommand {
        cmd,
        cmdsize: size as u32,
        dylib: Dylib {
            name_offset: DylibCommand::SIZE as u32,
            timestamp: 0,
            current_version: 0x10000,
            compatibility_version: 0x10000,
        },
    };
    let mut out = command.as_bytes().to_vec();
    out.extend_from_slice(path.as_bytes());
    out.resize(size, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dyld::ExportTrieParser;

    #[test]
    fn test_built_image_parses() {
        let image = ImageBuilder::new(Architecture::Arm64, "/usr/lib/libfoo.dylib", 0x1_8000_0000)
            .export("_foo", 0x1000)
            .reexport("_bar", 1, Some("_baz"))
            .dependency(LC_REEXPORT_DYLIB, "/usr/lib/libbar.dylib");
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.add_built_image(&image);

        let entry = cache.image_by_path("/usr/lib/libfoo.dylib").unwrap().clone();
        let macho = cache.image_macho(&entry).unwrap();
        assert_eq!(macho.install_name(), Some("/usr/lib/libfoo.dylib"));
        assert_eq!(macho.dependencies(), vec![("/usr/lib/libbar.dylib", LC_REEXPORT_DYLIB)]);

        let (off, size) = macho.export_trie_range().unwrap();
        let addr = macho.linkedit_offset_to_addr(off as u64).unwrap();
        let trie = cache.data_at_addr(addr, size as usize).unwrap();
        let exports = ExportTrieParser::new(trie).parse_all().unwrap();
        assert_eq!(exports, image.exports);
    }

    #[test]
    fn test_built_32bit_image() {
        let image = ImageBuilder::new(Architecture::Arm, "/usr/lib/libarm.dylib", 0x2000_0000);
        let mut cache = TestCache::new(Architecture::Arm);
        cache.add_built_image(&image);

        let entry = cache.images()[0].clone();
        let macho = cache.image_macho(&entry).unwrap();
        assert!(!macho.is_64bit);
        assert_eq!(macho.architecture(), Some(Architecture::Arm));
        assert!(macho.section("__TEXT", "__text").is_some());
    }

    #[test]
    fn test_built_stub_sections() {
        let image = ImageBuilder::new(Architecture::Arm64, "/usr/lib/libstubs.dylib", 0x1_8000_0000)
            .stubs(12, &[], &["_open", "_close"])
            .pointers("__got", &["_close", "_open"]);
        let macho = MachOContext::new(image.build()).unwrap();

        let stubs = macho.section("__TEXT", "__stubs").unwrap();
        assert!(stubs.section.is_stubs());
        assert_eq!(stubs.section.size, 24);
        assert_eq!(macho.indirect_symbol_name(0).unwrap(), Some("_open"));
        assert_eq!(macho.indirect_symbol_name(1).unwrap(), Some("_close"));

        let got = macho.section("__DATA", "__got").unwrap();
        assert!(got.section.is_symbol_pointers());
        assert_eq!(got.section.reserved1, 2);
        assert_eq!(macho.indirect_symbol_name(2).unwrap(), Some("_close"));
        assert_eq!(macho.indirect_symbol_name(4).unwrap(), None);
    }

    #[test]
    fn test_translate() {
        let mut cache = TestCache::new(Architecture::Arm64);
        cache.map_zeroed(0x1000, 0x100);
        cache.map_zeroed(0x8000, 0x100);
        cache.write_u64(0x8010, 0xDEAD);

        assert_eq!(cache.translate(0x1010), Some((0x10, 0)));
        assert_eq!(cache.translate(0x8010), Some((0x10, 1)));
        assert_eq!(cache.translate(0x1100), None);
        assert_eq!(cache.read_u64_at(0x8010).unwrap(), 0xDEAD);
    }
}
