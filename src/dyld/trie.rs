//! Export trie parsing.
//!
//! The export trie is a compact prefix tree of exported symbols. Each node
//! may carry terminal information (flags plus an address, a re-export or a
//! stub and resolver pair) and a list of labelled edges to child nodes.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::util;

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

/// Absolute symbol (not relative to any section).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;

/// Weak definition.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;

/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

/// Stub and resolver.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

// =============================================================================
// Export Info
// =============================================================================

/// Information about an exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Symbol address (relative to image base)
    pub address: u64,
    /// For re-exports: ordinal of the source dylib
    pub reexport_ordinal: Option<u32>,
    /// For re-exports: imported symbol name (if different)
    pub reexport_name: Option<String>,
    /// For stub+resolver: resolver function address
    pub resolver_address: Option<u64>,
}

impl ExportInfo {
    /// Returns true if this is a re-export.
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    /// Returns true if this is a stub with resolver.
    #[inline]
    pub fn is_stub_and_resolver(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0
    }

    /// Returns true if the address is absolute rather than image-relative.
    #[inline]
    pub fn is_absolute(&self) -> bool {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
    }

    /// Name to look up in the re-exporting dependency.
    pub fn import_name(&self) -> &str {
        self.reexport_name.as_deref().unwrap_or(&self.name)
    }
}

// =============================================================================
// Export Trie Parser
// =============================================================================

/// Parser for export tries.
pub struct ExportTrieParser<'a> {
    data: &'a [u8],
}

impl<'a> ExportTrieParser<'a> {
    /// Creates a new parser for the given export trie data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Parses all exports from the trie.
    ///
    /// The walk keeps an explicit stack and refuses to visit a node twice,
    /// so corrupt tries with loops fail instead of recursing forever.
    pub fn parse_all(&self) -> Result<Vec<ExportInfo>> {
        let mut exports = Vec::new();
        if self.data.is_empty() {
            return Ok(exports);
        }

        let mut visited = HashSet::new();
        let mut stack = vec![(0usize, String::new())];

        while let Some((offset, prefix)) = stack.pop() {
            if offset >= self.data.len() || !visited.insert(offset) {
                return Err(Error::InvalidExportTrie { offset });
            }

            let (terminal_size, mut cursor) = self.uleb(offset)?;
            let terminal_start = cursor;
            let terminal_end = terminal_start
                .checked_add(terminal_size as usize)
                .filter(|&end| end <= self.data.len())
                .ok_or(Error::InvalidExportTrie { offset })?;

            if terminal_size > 0 {
                exports.push(self.parse_terminal_info(terminal_start, terminal_end, &prefix)?);
            }
            cursor = terminal_end;

            if cursor >= self.data.len() {
                continue;
            }

            let child_count = self.data[cursor] as usize;
            cursor += 1;

            let mut children = Vec::with_capacity(child_count);
            for _ in 0..child_count {
                let label_len = util::memchr_null(&self.data[cursor.min(self.data.len())..]);
                let label_end = cursor + label_len;
                if label_end >= self.data.len() {
                    return Err(Error::InvalidExportTrie { offset: cursor });
                }
                let label = String::from_utf8_lossy(&self.data[cursor..label_end]);
                cursor = label_end + 1;

                let (child_offset, next) = self.uleb(cursor)?;
                cursor = next;

                children.push((child_offset as usize, format!("{}{}", prefix, label)));
            }

            // Reverse so children are visited in edge order.
            stack.extend(children.into_iter().rev());
        }

        Ok(exports)
    }

    /// Reads a ULEB128 at an absolute offset, returning the value and the
    /// offset just past it.
    fn uleb(&self, offset: usize) -> Result<(u64, usize)> {
        self.data
            .get(offset..)
            .and_then(util::read_uleb128)
            .map(|(value, len)| (value, offset + len))
            .ok_or(Error::InvalidExportTrie { offset })
    }

    /// Parses terminal export info in `start..end`.
    fn parse_terminal_info(&self, start: usize, end: usize, name: &str) -> Result<ExportInfo> {
        let (flags, mut cursor) = self.uleb(start)?;

        let mut export = ExportInfo {
            name: name.to_string(),
            flags,
            address: 0,
            reexport_ordinal: None,
            reexport_name: None,
            resolver_address: None,
        };

        if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
            let (ordinal, next) = self.uleb(cursor)?;
            cursor = next;
            export.reexport_ordinal = Some(ordinal as u32);

            // An empty import name means the same name as the export.
            if cursor < end {
                let len = util::memchr_null(&self.data[cursor..end]);
                if len > 0 {
                    export.reexport_name =
                        Some(String::from_utf8_lossy(&self.data[cursor..cursor + len]).into_owned());
                }
            }
        } else {
            let (addr, next) = self.uleb(cursor)?;
            cursor = next;
            export.address = addr;

            if (flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0 {
                let (resolver, _) = self.uleb(cursor)?;
                export.resolver_address = Some(resolver);
            }
        }

        Ok(export)
    }
}
