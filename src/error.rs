//! Error types for the shared cache extractor.
//!
//! Errors are grouped by the area that raises them. Image-fatal errors abort
//! the extraction of the current image only; symbol errors are scoped to the
//! single query that raised them.

use std::path::PathBuf;

use thiserror::Error;

use crate::arch::Architecture;

/// The main error type for extraction operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported cache architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("image is missing required structure: {element}")]
    MissingStructure { element: &'static str },

    #[error("image layout is malformed: {reason}")]
    MalformedLayout { reason: &'static str },

    // ==================== Chain Errors ====================
    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    #[error("invalid slide info at offset {offset:#x}: {reason}")]
    InvalidSlideInfo { offset: u64, reason: String },

    #[error("malformed pointer chain at {addr:#x} ({arch}): {reason}")]
    MalformedChain {
        addr: u64,
        arch: Architecture,
        reason: String,
    },

    // ==================== Symbol Errors ====================
    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("cyclic re-export of '{name}' through '{image}'")]
    CyclicReExport { name: String, image: String },

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for extraction operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error aborts the extraction of the whole image.
    ///
    /// Symbol resolution errors only fail the query that raised them; the
    /// remaining queries on the same image carry on.
    #[inline]
    pub fn is_image_fatal(&self) -> bool {
        !matches!(
            self,
            Error::CyclicReExport { .. } | Error::InvalidExportTrie { .. }
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a malformed chain error.
    #[inline]
    pub fn malformed_chain(addr: u64, arch: Architecture, reason: impl Into<String>) -> Self {
        Error::MalformedChain {
            addr,
            arch,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}
