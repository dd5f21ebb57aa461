//! Mach-O context for reading and modifying Mach-O files.

use std::collections::HashMap;

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::util;

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command, widened to the 64-bit layout
    pub command: SegmentCommand64,
    /// Offset of the segment command in the file
    pub command_offset: usize,
    /// Sections in this segment
    pub sections: Vec<SectionInfo>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&SectionInfo> {
        self.sections.iter().find(|s| s.section.name() == name)
    }
}

/// Parsed section information.
#[derive(Debug, Clone)]
pub struct SectionInfo {
    /// The section structure, widened to the 64-bit layout
    pub section: Section64,
    /// Offset of the section structure in the file
    pub struct_offset: usize,
}

impl SectionInfo {
    /// Returns the section name.
    pub fn name(&self) -> &str {
        self.section.name()
    }

    /// Returns true if the address falls inside the section.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.section.addr && addr - self.section.addr < self.section.size
    }
}

// =============================================================================
// Function Ranges
// =============================================================================

/// A function's address range, decoded from `LC_FUNCTION_STARTS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRange {
    /// Start address with the Thumb bit cleared
    pub start: u64,
    /// Size in bytes
    pub size: u64,
    /// Function is Thumb code
    pub thumb: bool,
}

impl FunctionRange {
    /// Returns the end address (exclusive).
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
///
/// Represents the load command types the extractor needs; everything else
/// is kept as `Unknown` with its position so it survives a rewrite.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab {
        command: SymtabCommand,
        offset: usize,
    },
    Dysymtab {
        command: DysymtabCommand,
        offset: usize,
    },
    DyldInfo {
        command: DyldInfoCommand,
        offset: usize,
    },
    LinkeditData {
        command: LinkeditDataCommand,
        offset: usize,
    },
    Dylib {
        command: DylibCommand,
        name: String,
        offset: usize,
    },
    Uuid {
        command: UuidCommand,
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

impl LoadCommandInfo {
    /// Returns the load command offset.
    pub fn offset(&self) -> usize {
        match self {
            LoadCommandInfo::Segment(s) => s.command_offset,
            LoadCommandInfo::Symtab { offset, .. }
            | LoadCommandInfo::Dysymtab { offset, .. }
            | LoadCommandInfo::DyldInfo { offset, .. }
            | LoadCommandInfo::LinkeditData { offset, .. }
            | LoadCommandInfo::Dylib { offset, .. }
            | LoadCommandInfo::Uuid { offset, .. }
            | LoadCommandInfo::Unknown { offset, .. } => *offset,
        }
    }

    /// Returns the load command type.
    pub fn cmd(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmd,
            LoadCommandInfo::Symtab { command, .. } => command.cmd,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmd,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmd,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmd,
            LoadCommandInfo::Dylib { command, .. } => command.cmd,
            LoadCommandInfo::Uuid { command, .. } => command.cmd,
            LoadCommandInfo::Unknown { cmd, .. } => *cmd,
        }
    }

    /// Returns the load command size.
    pub fn size(&self) -> u32 {
        match self {
            LoadCommandInfo::Segment(s) => s.command.cmdsize,
            LoadCommandInfo::Symtab { command, .. } => command.cmdsize,
            LoadCommandInfo::Dysymtab { command, .. } => command.cmdsize,
            LoadCommandInfo::DyldInfo { command, .. } => command.cmdsize,
            LoadCommandInfo::LinkeditData { command, .. } => command.cmdsize,
            LoadCommandInfo::Dylib { command, .. } => command.cmdsize,
            LoadCommandInfo::Uuid { command, .. } => command.cmdsize,
            LoadCommandInfo::Unknown { cmdsize, .. } => *cmdsize,
        }
    }
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Context for working with a Mach-O file.
///
/// Holds a private copy of the image bytes plus a normalised view of its
/// load commands. Both 32-bit and 64-bit images are accepted.
#[derive(Debug)]
pub struct MachOContext {
    /// The Mach-O header, widened to the 64-bit layout
    pub header: MachHeader64,
    /// The image uses the 64-bit header and segment layout
    pub is_64bit: bool,
    /// Mutable copy of the Mach-O data
    pub data: Vec<u8>,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

impl MachOContext {
    /// Creates a new MachO context, taking ownership of the raw data.
    ///
    /// The data must hold at least the header and all load commands; it
    /// may hold more (the full file image).
    pub fn new(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::buffer_too_small(4, data.len()));
        }

        let magic = util::read_u32_le(&data);
        let (header, is_64bit) = match magic {
            MH_MAGIC_64 => {
                let header = MachHeader64::read_from_prefix(&data)
                    .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, data.len()))?
                    .0;
                (header, true)
            }
            MH_MAGIC => {
                let header = MachHeader::read_from_prefix(&data)
                    .map_err(|_| Error::buffer_too_small(MachHeader::SIZE, data.len()))?
                    .0;
                (MachHeader64::from(header), false)
            }
            other => return Err(Error::InvalidMachoMagic(other)),
        };

        let mut ctx = Self {
            header,
            is_64bit,
            data,
            load_commands: Vec::new(),
            segment_indices: HashMap::new(),
        };

        ctx.parse_load_commands()?;

        Ok(ctx)
    }

    /// Size of the header for this image's width.
    #[inline]
    pub fn header_size(&self) -> usize {
        if self.is_64bit {
            MachHeader64::SIZE
        } else {
            MachHeader::SIZE
        }
    }

    /// Size of a pointer in this image.
    #[inline]
    pub fn pointer_size(&self) -> usize {
        if self.is_64bit {
            8
        } else {
            4
        }
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self) -> Result<()> {
        let mut offset = self.header_size();
        let end_offset = offset + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset
                || offset + LoadCommand::SIZE > self.data.len()
            {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&self.data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            let cmdsize = lc.cmdsize as usize;
            if cmdsize < LoadCommand::SIZE || offset + cmdsize > self.data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let cmd_info = self.parse_load_command(lc.cmd, offset, cmdsize)?;

            if let LoadCommandInfo::Segment(ref seg) = cmd_info {
                self.segment_indices
                    .insert(seg.name().to_string(), self.load_commands.len());
            }

            self.load_commands.push(cmd_info);
            offset += cmdsize;
        }

        Ok(())
    }

    /// Reads a fixed-size command structure, failing with a parse error.
    fn read_command<T: FromBytes>(data: &[u8], offset: usize, what: &str) -> Result<T> {
        T::read_from_prefix(data)
            .map(|(value, _)| value)
            .map_err(|_| Error::parse(offset, format!("failed to parse {}", what)))
    }

    /// Parses a single load command.
    fn parse_load_command(&self, cmd: u32, offset: usize, cmdsize: usize) -> Result<LoadCommandInfo> {
        let data = &self.data[offset..offset + cmdsize];

        match cmd {
            LC_SEGMENT_64 | LC_SEGMENT => {
                let (command, command_size, section_size) = if cmd == LC_SEGMENT_64 {
                    let seg: SegmentCommand64 =
                        Self::read_command(data, offset, "segment command")?;
                    (seg, SegmentCommand64::SIZE, Section64::SIZE)
                } else {
                    let seg: SegmentCommand = Self::read_command(data, offset, "segment command")?;
                    (SegmentCommand64::from(seg), SegmentCommand::SIZE, Section::SIZE)
                };

                let mut sections = Vec::with_capacity(command.nsects as usize);
                let mut sect_offset = offset + command_size;

                for _ in 0..command.nsects {
                    if sect_offset + section_size > offset + cmdsize {
                        return Err(Error::LoadCommandOverflow { offset: sect_offset });
                    }
                    let raw = &self.data[sect_offset..];
                    let section = if cmd == LC_SEGMENT_64 {
                        Self::read_command::<Section64>(raw, sect_offset, "section")?
                    } else {
                        Section64::from(Self::read_command::<Section>(
                            raw,
                            sect_offset,
                            "section",
                        )?)
                    };

                    sections.push(SectionInfo {
                        section,
                        struct_offset: sect_offset,
                    });

                    sect_offset += section_size;
                }

                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command,
                    command_offset: offset,
                    sections,
                }))
            }

            LC_SYMTAB => Ok(LoadCommandInfo::Symtab {
                command: Self::read_command(data, offset, "symtab command")?,
                offset,
            }),

            LC_DYSYMTAB => Ok(LoadCommandInfo::Dysymtab {
                command: Self::read_command(data, offset, "dysymtab command")?,
                offset,
            }),

            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => Ok(LoadCommandInfo::DyldInfo {
                command: Self::read_command(data, offset, "dyld info command")?,
                offset,
            }),

            LC_CODE_SIGNATURE
            | LC_SEGMENT_SPLIT_INFO
            | LC_FUNCTION_STARTS
            | LC_DATA_IN_CODE
            | LC_DYLD_EXPORTS_TRIE
            | LC_DYLD_CHAINED_FIXUPS => Ok(LoadCommandInfo::LinkeditData {
                command: Self::read_command(data, offset, "linkedit data command")?,
                offset,
            }),

            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                let command: DylibCommand = Self::read_command(data, offset, "dylib command")?;

                let name_offset = command.dylib.name_offset as usize;
                let name = if name_offset < data.len() {
                    let name_bytes = &data[name_offset..];
                    let end = util::memchr_null(name_bytes);
                    String::from_utf8_lossy(&name_bytes[..end]).into_owned()
                } else {
                    String::new()
                };

                Ok(LoadCommandInfo::Dylib {
                    command,
                    name,
                    offset,
                })
            }

            LC_UUID => Ok(LoadCommandInfo::Uuid {
                command: Self::read_command(data, offset, "uuid command")?,
                offset,
            }),

            _ => Ok(LoadCommandInfo::Unknown {
                cmd,
                cmdsize: cmdsize as u32,
                offset,
            }),
        }
    }

    /// Returns a reference to a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&SectionInfo> {
        self.segment(segment)?.section(section)
    }

    /// Returns an iterator over every section of every segment.
    pub fn sections(&self) -> impl Iterator<Item = &SectionInfo> {
        self.segments().flat_map(|seg| seg.sections.iter())
    }

    /// Returns the __TEXT segment.
    pub fn text_segment(&self) -> Option<&SegmentInfo> {
        self.segment(SEG_TEXT)
    }

    /// Returns the __LINKEDIT segment.
    pub fn linkedit_segment(&self) -> Option<&SegmentInfo> {
        self.segment(SEG_LINKEDIT)
    }

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Symtab { command, .. } = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns the dynamic symbol table command.
    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::Dysymtab { command, .. } = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Reads symbol table entry `index`, widened to the 64-bit layout.
    pub fn symbol(&self, index: u32) -> Result<Nlist64> {
        let symtab = self.symtab().ok_or(Error::MissingStructure {
            element: "LC_SYMTAB",
        })?;
        if index >= symtab.nsyms {
            return Err(Error::parse(
                symtab.symoff as usize,
                format!("symbol index {} out of range", index),
            ));
        }

        if self.is_64bit {
            let offset = symtab.symoff as usize + index as usize * Nlist64::SIZE;
            Self::read_command(self.read_at(offset, Nlist64::SIZE)?, offset, "nlist")
        } else {
            let offset = symtab.symoff as usize + index as usize * Nlist::SIZE;
            let nlist: Nlist = Self::read_command(self.read_at(offset, Nlist::SIZE)?, offset, "nlist")?;
            Ok(Nlist64::from(nlist))
        }
    }

    /// Returns the name of a symbol from the string table.
    pub fn symbol_name(&self, symbol: &Nlist64) -> Result<&str> {
        let symtab = self.symtab().ok_or(Error::MissingStructure {
            element: "LC_SYMTAB",
        })?;
        let start = symtab.stroff as usize + symbol.n_strx as usize;
        let end = (symtab.stroff as usize + symtab.strsize as usize).min(self.data.len());
        if start >= end {
            return Err(Error::parse(start, "symbol name outside the string table"));
        }
        let bytes = &self.data[start..end];
        std::str::from_utf8(&bytes[..util::memchr_null(bytes)])
            .map_err(|_| Error::parse(start, "symbol name is not UTF-8"))
    }

    /// Resolves indirect symbol table entry `index` to a symbol name.
    ///
    /// Local and absolute entries have no name and yield `None`.
    pub fn indirect_symbol_name(&self, index: u32) -> Result<Option<&str>> {
        let dysymtab = self.dysymtab().ok_or(Error::MissingStructure {
            element: "LC_DYSYMTAB",
        })?;
        if index >= dysymtab.nindirectsyms {
            return Ok(None);
        }

        let entry = self.read_u32(dysymtab.indirectsymoff as usize + index as usize * 4)?;
        if entry & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS) != 0 {
            return Ok(None);
        }
        let symbol = self.symbol(entry)?;
        self.symbol_name(&symbol).map(Some)
    }

    /// Returns the dyld info command.
    pub fn dyld_info(&self) -> Option<&DyldInfoCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let LoadCommandInfo::DyldInfo { command, .. } = lc {
                Some(command)
            } else {
                None
            }
        })
    }

    /// Returns the first linkedit data command of the given type.
    pub fn linkedit_data(&self, cmd: u32) -> Option<&LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::LinkeditData { command, .. } if command.cmd == cmd => Some(command),
            _ => None,
        })
    }

    /// Returns an iterator over dylib commands as `(path, cmd)`.
    pub fn dylibs(&self) -> impl Iterator<Item = (&str, u32)> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Dylib { command, name, .. } = lc {
                Some((name.as_str(), command.cmd))
            } else {
                None
            }
        })
    }

    /// Returns the dependencies in load order, without `LC_ID_DYLIB`.
    ///
    /// Two-level namespace ordinals index this list starting at 1.
    pub fn dependencies(&self) -> Vec<(&str, u32)> {
        self.dylibs().filter(|&(_, cmd)| cmd != LC_ID_DYLIB).collect()
    }

    /// Returns the install name from `LC_ID_DYLIB`.
    pub fn install_name(&self) -> Option<&str> {
        self.dylibs()
            .find(|&(_, cmd)| cmd == LC_ID_DYLIB)
            .map(|(name, _)| name)
    }

    /// Returns the architecture of the image, if it is one the crate handles.
    pub fn architecture(&self) -> Option<Architecture> {
        Architecture::from_cpu(self.header.cputype)
    }

    /// Returns the location of the export trie as `(file offset, size)`.
    ///
    /// `LC_DYLD_EXPORTS_TRIE` wins over the dyld info export range.
    pub fn export_trie_range(&self) -> Option<(u32, u32)> {
        if let Some(cmd) = self.linkedit_data(LC_DYLD_EXPORTS_TRIE) {
            return Some((cmd.dataoff, cmd.datasize));
        }
        self.dyld_info()
            .filter(|info| info.export_size > 0)
            .map(|info| (info.export_off, info.export_size))
    }

    /// Converts a `__LINKEDIT` file offset into a virtual address.
    pub fn linkedit_offset_to_addr(&self, offset: u64) -> Option<u64> {
        let seg = &self.linkedit_segment()?.command;
        if offset < seg.fileoff || offset - seg.fileoff >= seg.filesize.max(seg.vmsize) {
            return None;
        }
        Some(seg.vmaddr + (offset - seg.fileoff))
    }

    /// Decodes `LC_FUNCTION_STARTS` into function ranges.
    ///
    /// The first delta is relative to the start of `__TEXT`. The last
    /// function is taken to end where `__TEXT,__text` ends.
    pub fn function_ranges(&self) -> Result<Vec<FunctionRange>> {
        let cmd = self
            .linkedit_data(LC_FUNCTION_STARTS)
            .ok_or(Error::MissingStructure {
                element: "LC_FUNCTION_STARTS",
            })?;
        let text = self.text_segment().ok_or(Error::MissingStructure {
            element: "__TEXT segment",
        })?;
        let text_end = self
            .section(SEG_TEXT, SECT_TEXT)
            .map(|s| s.section.addr + s.section.size)
            .ok_or(Error::MissingStructure {
                element: "__TEXT,__text section",
            })?;

        let data = self.read_at(cmd.dataoff as usize, cmd.datasize as usize)?;

        let mut starts = Vec::new();
        let mut addr = text.command.vmaddr;
        let mut cursor = 0usize;
        while cursor < data.len() {
            let (delta, len) = util::read_uleb128(&data[cursor..]).ok_or_else(|| {
                Error::parse(cmd.dataoff as usize + cursor, "truncated function starts")
            })?;
            cursor += len;
            if delta == 0 {
                break;
            }
            addr = addr.wrapping_add(delta);
            starts.push(addr);
        }

        let mut ranges = Vec::with_capacity(starts.len());
        for (i, &raw) in starts.iter().enumerate() {
            let start = raw & !1;
            let end = starts.get(i + 1).map(|&next| next & !1).unwrap_or(text_end);
            if end <= start {
                continue;
            }
            ranges.push(FunctionRange {
                start,
                size: end - start,
                thumb: raw & 1 != 0,
            });
        }

        Ok(ranges)
    }

    /// Reads data at the specified offset within the Mach-O.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::buffer_too_small(usize::MAX, self.data.len()))?;
        if end > self.data.len() {
            return Err(Error::buffer_too_small(end, self.data.len()));
        }
        Ok(&self.data[offset..end])
    }

    /// Reads a u32 at the specified offset.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        Ok(util::read_u32_le(self.read_at(offset, 4)?))
    }

    /// Reads a u64 at the specified offset.
    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        Ok(util::read_u64_le(self.read_at(offset, 8)?))
    }

    /// Writes data at the specified offset.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or(Error::buffer_too_small(usize::MAX, self.data.len()))?;
        if end > self.data.len() {
            return Err(Error::buffer_too_small(end, self.data.len()));
        }
        self.data[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Writes a u32 at the specified offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Writes a u64 at the specified offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Reads a pointer of the image's width.
    pub fn read_pointer(&self, offset: usize) -> Result<u64> {
        if self.is_64bit {
            self.read_u64(offset)
        } else {
            self.read_u32(offset).map(u64::from)
        }
    }

    /// Writes a pointer of the image's width.
    pub fn write_pointer(&mut self, offset: usize, value: u64) -> Result<()> {
        if self.is_64bit {
            self.write_u64(offset, value)
        } else {
            self.write_u32(offset, value as u32)
        }
    }

    /// Converts a virtual address to a file offset within this Mach-O.
    pub fn addr_to_offset(&self, addr: u64) -> Option<usize> {
        self.segments()
            .find(|seg| seg.command.contains_addr(addr))
            .and_then(|seg| {
                let delta = addr - seg.command.vmaddr;
                // Zero-fill tails have no bytes behind them.
                (delta < seg.command.filesize).then(|| (seg.command.fileoff + delta) as usize)
            })
    }

    /// Converts a file offset to a virtual address.
    pub fn offset_to_addr(&self, offset: usize) -> Option<u64> {
        let offset = offset as u64;
        self.segments()
            .find(|seg| {
                offset >= seg.command.fileoff && offset - seg.command.fileoff < seg.command.filesize
            })
            .map(|seg| seg.command.vmaddr + (offset - seg.command.fileoff))
    }

    /// Returns true if the address is within this Mach-O.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segments().any(|seg| seg.command.contains_addr(addr))
    }

    /// Returns the raw data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
