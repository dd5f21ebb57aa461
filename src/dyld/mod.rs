//! Dyld shared cache handling.
//!
//! This module provides types and utilities for parsing and working with
//! Apple's dyld shared cache format. The cache is used on iOS and macOS to
//! optimize loading of system frameworks.
//!
//! # Cache Structure
//!
//! A dyld shared cache consists of:
//! - A header with metadata about the cache
//! - Mappings that describe how regions of the cache map to virtual memory
//! - Image information for each dylib in the cache
//! - Slide information describing the chained pointers of writable mappings
//!
//! # Sub-caches
//!
//! Starting with iOS 15 / macOS 12, caches can be split into multiple files:
//! - Main cache: `dyld_shared_cache_arm64e`
//! - Sub-caches: `dyld_shared_cache_arm64e.1`, `.2`, etc.
//! - Symbols: `dyld_shared_cache_arm64e.symbols`
//!
//! All of them are presented as one address space through [`AddressSpace`].

mod chain;
mod context;
mod space;
mod structs;
pub mod trie;

#[cfg(test)]
pub mod testing;

pub use chain::*;
pub use context::*;
pub use space::*;
pub use structs::*;
pub use trie::*;
