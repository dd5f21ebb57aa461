//! dscx - reconstructs standalone Mach-O images from a dyld shared cache.
//!
//! The cache builder packs every system library into one set of files,
//! compresses their pointers into chains and routes calls through shared
//! stubs. This library reverses those steps for one image at a time.
//!
//! # Features
//!
//! - Memory-mapped, split caches (main file, subcaches and `.symbols`)
//! - Chained pointers of every slide info version (v1 to v5)
//! - Stub repair for arm64, arm64e, arm64_32 and ARM/Thumb, with calls into
//!   other images routed through the image's own stubs
//! - Export and re-export symbolization with cross-image caching
//!
//! # Example
//!
//! ```no_run
//! use dscx::{extract_image, DyldContext};
//!
//! fn main() -> dscx::Result<()> {
//!     let cache = DyldContext::open("/path/to/dyld_shared_cache_arm64e")?;
//!     let report = extract_image(&cache, "/usr/lib/libobjc.A.dylib", "out/libobjc.A.dylib")?;
//!     println!("{} stubs fixed", report.stubs.fixed);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod arch;
pub mod arm;
pub mod arm64;
pub mod converter;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod util;

// Re-export main types
pub use arch::Architecture;
pub use converter::{Accelerator, ExportIndex, FixReport, SectionReport, Symbol};
pub use dyld::{AddressSpace, DyldContext, ImageEntry, MappingEntry, SharedCache};
pub use error::{Error, Result};
pub use macho::MachOContext;

use std::path::Path;
use std::sync::Arc;

use converter::{
    fixer_for, load_image, process_slide_info, repair_stub_sections, validate, write_macho,
    CodeRegions, ExtractionContext, PointerTracker, StubSections, Symbolizer,
};

/// Options for image extraction.
#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    pub verbosity: u8,
    /// Skip slide info processing
    pub skip_slide_info: bool,
    /// Skip stub fixing
    pub skip_stubs: bool,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            verbosity: 1,
            skip_slide_info: false,
            skip_stubs: false,
        }
    }
}

/// What one extraction did.
#[derive(Debug, Clone)]
pub struct ExtractionReport {
    /// Install path of the image
    pub image: String,
    /// Chained pointers rewritten to plain ones
    pub pointers_rebased: usize,
    /// Stub fixing totals
    pub stubs: FixReport,
    /// Repair totals for the image's own stubs
    pub stub_sections: SectionReport,
    /// Symbols in the image's export index
    pub exports: usize,
}

/// A reconstructed image, still in memory.
#[derive(Debug)]
pub struct Reconstruction {
    /// The standalone image buffer
    pub macho: MachOContext,
    /// The image's export index, when its exports could be read
    pub exports: Option<Arc<ExportIndex>>,
    /// What the run did
    pub report: ExtractionReport,
}

/// Extracts a single image from the cache.
///
/// # Arguments
///
/// * `cache` - The shared cache
/// * `image_path` - Path of the image in the cache (e.g., "/usr/lib/libc.dylib")
/// * `output_path` - Path where the extracted dylib will be written
pub fn extract_image<C: SharedCache, P: AsRef<Path>>(
    cache: &C,
    image_path: &str,
    output_path: P,
) -> Result<ExtractionReport> {
    extract_image_with_options(cache, image_path, output_path, ExtractionOptions::default())
}

/// Extracts a single image from the cache with custom options.
pub fn extract_image_with_options<C: SharedCache, P: AsRef<Path>>(
    cache: &C,
    image_path: &str,
    output_path: P,
    options: ExtractionOptions,
) -> Result<ExtractionReport> {
    let mut accel = Accelerator::new();
    extract_image_in_run(cache, &mut accel, image_path, output_path, &options)
}

/// Extracts an image as part of a longer run, reusing the run's
/// accelerator.
///
/// A failure leaves the accelerator valid for the next image.
pub fn extract_image_in_run<C: SharedCache, P: AsRef<Path>>(
    cache: &C,
    accel: &mut Accelerator,
    image_path: &str,
    output_path: P,
    options: &ExtractionOptions,
) -> Result<ExtractionReport> {
    let rebuilt = reconstruct_image(cache, accel, image_path, options)?;
    write_macho(&rebuilt.macho, output_path)?;
    Ok(rebuilt.report)
}

/// Runs every pipeline step except writing the result to disk.
pub fn reconstruct_image<C: SharedCache>(
    cache: &C,
    accel: &mut Accelerator,
    image_path: &str,
    options: &ExtractionOptions,
) -> Result<Reconstruction> {
    let image = find_image(cache, image_path).ok_or_else(|| Error::ImageNotFound {
        name: image_path.to_string(),
    })?;

    let macho = load_image(cache, image)?;
    let mut ctx =
        ExtractionContext::new(cache, macho, image).with_verbosity(options.verbosity);
    validate(&ctx.macho)?;
    if ctx.macho.architecture() != Some(cache.architecture()) {
        ctx.warn(&format!(
            "image cpu type {:#x} does not match the {} cache",
            ctx.macho.header.cputype,
            cache.architecture()
        ));
    }

    let tracker = PointerTracker::new(cache, cache.architecture())?;

    let pointers_rebased = if options.skip_slide_info {
        0
    } else {
        process_slide_info(&mut ctx, &tracker, accel)?
    };

    let (stubs, stub_sections) = if options.skip_stubs {
        (FixReport::default(), SectionReport::default())
    } else {
        fix_stubs(&mut ctx, &tracker, accel, &image.path)?
    };

    ctx.info("Indexing exports...");
    let exports = match Symbolizer::new(cache).index(accel, &image.path) {
        Ok(index) => Some(index),
        Err(err) if !err.is_image_fatal() => {
            ctx.warn(&format!("exports unavailable: {}", err));
            None
        }
        Err(err) => return Err(err),
    };

    let report = ExtractionReport {
        image: image.path.clone(),
        pointers_rebased,
        stubs,
        stub_sections,
        exports: exports.as_ref().map_or(0, |index| index.len()),
    };
    ctx.info(&format!(
        "{} pointers rebased, {} stubs fixed, {} unresolved lazy stubs",
        report.pointers_rebased, report.stubs.fixed, report.stubs.unresolved
    ));

    Ok(Reconstruction {
        macho: ctx.macho,
        exports,
        report,
    })
}

fn fix_stubs<C: SharedCache>(
    ctx: &mut ExtractionContext<'_, C>,
    tracker: &PointerTracker<'_>,
    accel: &mut Accelerator,
    image_path: &str,
) -> Result<(FixReport, SectionReport)> {
    let Some(fixer) = fixer_for(tracker) else {
        ctx.info(&format!("no stub fixer for {}, stubs left alone", tracker.arch()));
        return Ok((FixReport::default(), SectionReport::default()));
    };
    ctx.info("Fixing stubs...");

    if accel.code_regions().is_none() {
        accel.set_code_regions(Arc::new(CodeRegions::collect(ctx.cache)));
    }

    let sections = StubSections::collect(&ctx.macho)?;
    let symbolizer = Symbolizer::new(ctx.cache);
    let (routes, repaired) = repair_stub_sections(
        fixer.as_ref(),
        accel,
        &mut ctx.macho,
        &sections,
        &mut |accel: &mut Accelerator, name: &str| symbolizer.resolve_import(accel, image_path, name),
    )?;
    if repaired.failed > 0 {
        ctx.warn(&format!("{} stubs could not be repaired", repaired.failed));
    }

    let ranges = ctx.macho.function_ranges()?;
    let report = fixer.fix_stubs(accel, &mut ctx.macho, &ranges, &routes)?;
    Ok((report, repaired))
}

/// Finds an image by exact path, falling back to the first path or
/// basename containing `name`.
pub fn find_image<'a, C: SharedCache + ?Sized>(
    cache: &'a C,
    name: &str,
) -> Option<&'a ImageEntry> {
    cache
        .image_by_path(name)
        .or_else(|| cache.images().iter().find(|img| img.matches_filter(name)))
}

/// Lists all images in the cache.
pub fn list_images<C: SharedCache + ?Sized>(cache: &C) -> impl Iterator<Item = &ImageEntry> {
    cache.images().iter()
}

/// Finds images matching a filter.
pub fn find_images<'a, C: SharedCache + ?Sized>(
    cache: &'a C,
    filter: &'a str,
) -> impl Iterator<Item = &'a ImageEntry> {
    cache
        .images()
        .iter()
        .filter(move |img| img.matches_filter(filter))
}
