//! Converters for extracting images from the dyld shared cache.
//!
//! This module contains the core extraction logic that turns a Mach-O image
//! embedded in the shared cache back into a standalone dylib.
//!
//! # Extraction Pipeline
//!
//! 1. **Assembly** - Copies the image's segments into a private buffer
//! 2. **Validation** - Checks the structures the later steps rely on
//! 3. **Slide Info Processing** - Rebases chained pointers to plain ones
//! 4. **Stub Fixing** - Restores the image's own stubs and symbol pointers,
//!    then points call sites at their final targets or at those stubs
//! 5. **Symbolization** - Indexes exported and re-exported names
//!
//! Work that repeats across images of one run is memoized in an
//! [`Accelerator`], owned by the run and passed explicitly.

mod accelerator;
mod context;
mod pointer;
mod slide;
mod stubs;
mod symbolizer;
mod validator;
mod writer;

pub use accelerator::*;
pub use context::*;
pub use pointer::*;
pub use slide::*;
pub use stubs::*;
pub use symbolizer::*;
pub use validator::*;
pub use writer::*;
