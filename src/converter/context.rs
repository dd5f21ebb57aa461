//! Per-image state shared by the pipeline steps.

use tracing::{info, warn};

use crate::dyld::{ImageEntry, SharedCache};
use crate::macho::MachOContext;

/// Context for one image extraction.
///
/// Holds the source cache, the private image buffer being rebuilt and the
/// options that shape logging.
pub struct ExtractionContext<'a, C: SharedCache> {
    /// The cache the image comes from
    pub cache: &'a C,
    /// The image buffer being reconstructed
    pub macho: MachOContext,
    /// Install path of the image
    pub image_path: String,
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    pub verbosity: u8,
}

impl<'a, C: SharedCache> ExtractionContext<'a, C> {
    /// Creates a context for `image` over an already loaded buffer.
    pub fn new(cache: &'a C, macho: MachOContext, image: &ImageEntry) -> Self {
        Self {
            cache,
            macho,
            image_path: image.path.clone(),
            verbosity: 1,
        }
    }

    /// Sets the verbosity level.
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Returns the basename of the image path.
    pub fn image_name(&self) -> &str {
        self.image_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.image_path)
    }

    /// Logs a warning message if verbosity is high enough.
    pub fn warn(&self, message: &str) {
        if self.verbosity >= 1 {
            warn!("{}: {}", self.image_name(), message);
        }
    }

    /// Logs an info message if verbosity is high enough.
    pub fn info(&self, message: &str) {
        if self.verbosity >= 2 {
            info!("{}: {}", self.image_name(), message);
        }
    }
}
