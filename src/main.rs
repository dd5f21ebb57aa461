//! dscx - extracts standalone dylibs from a dyld shared cache.
//!
//! Extract one image, a filtered set, or look up what lives at an address.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dscx::converter::{CodeRegions, Symbolizer};
use dscx::dyld::uuid_to_string;
use dscx::{
    extract_image_in_run, find_image, find_images, list_images, Accelerator, DyldContext,
    ExtractionOptions, ImageEntry, SharedCache,
};

/// Well-known cache directories, newest layout first.
const DEFAULT_CACHE_PATHS: &[&str] = &[
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    "/System/Library/dyld",
    "/var/db/dyld",
];

/// Extracts standalone images from a dyld shared cache.
#[derive(Parser, Debug)]
#[command(name = "dscx")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Selects one cache file.
#[derive(Args, Debug)]
struct CacheArgs {
    /// Cache file, or a directory holding caches. Defaults to the system
    /// locations.
    cache: Option<PathBuf>,

    /// Architecture substring ("arm64" matches "arm64e") used to pick a
    /// cache from a directory
    #[arg(short, long)]
    arch: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Rebuild images as standalone dylibs
    Extract {
        #[command(flatten)]
        source: CacheArgs,

        /// Image path or name, e.g. "libobjc" or "/usr/lib/libobjc.A.dylib"
        #[arg(short, long)]
        image: Option<String>,

        /// Extract every image whose path contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// Output file for one image, output directory for several
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Mirror install paths under the output directory (defaults to on
        /// when several images are extracted)
        #[arg(long)]
        preserve_paths: Option<bool>,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,

        /// Worker threads for batch extraction
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Leave chained pointers as they are
        #[arg(long)]
        skip_slide: bool,

        /// Leave call sites pointing at their stubs
        #[arg(long)]
        skip_stubs: bool,
    },

    /// Print the image table
    List {
        #[command(flatten)]
        source: CacheArgs,

        /// Only images whose path contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// Print load addresses
        #[arg(short = 'A', long)]
        addresses: bool,

        /// Print basenames instead of install paths
        #[arg(short, long)]
        basenames: bool,
    },

    /// Describe the cache header, mappings and slide info
    Info {
        #[command(flatten)]
        source: CacheArgs,
    },

    /// List the caches of a directory
    Arches {
        /// Directory to search. Defaults to the system locations.
        path: Option<PathBuf>,
    },

    /// Name the image and exported symbol at an address
    Lookup {
        /// Hex address, with or without 0x
        address: String,

        #[command(flatten)]
        source: CacheArgs,
    },
}

/// A main cache file found in a directory.
#[derive(Debug, Clone)]
struct CacheInfo {
    path: PathBuf,
    /// Filename suffix, e.g. "arm64e"
    arch: String,
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Extract {
            source,
            image,
            filter,
            output,
            preserve_paths,
            verbosity,
            jobs,
            skip_slide,
            skip_stubs,
        } => {
            setup_logging(verbosity);
            let request = ExtractRequest {
                image,
                filter,
                output,
                preserve_paths,
                jobs,
                options: ExtractionOptions {
                    verbosity,
                    skip_slide_info: skip_slide,
                    skip_stubs,
                },
            };
            cmd_extract(source, request)
        }
        Commands::List {
            source,
            filter,
            addresses,
            basenames,
        } => cmd_list(source, filter, addresses, basenames),
        Commands::Info { source } => cmd_info(source),
        Commands::Arches { path } => cmd_arches(path),
        Commands::Lookup { source, address } => cmd_lookup(source, address),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

const CACHE_PREFIX: &str = "dyld_shared_cache_";

/// Picks the first default location that holds at least one cache.
fn find_default_cache_dir() -> Result<PathBuf> {
    DEFAULT_CACHE_PATHS
        .iter()
        .map(Path::new)
        .find(|dir| discover_caches(dir).is_ok_and(|caches| !caches.is_empty()))
        .map(Path::to_path_buf)
        .with_context(|| {
            format!(
                "No dyld shared cache found in default locations:\n  {}",
                DEFAULT_CACHE_PATHS.join("\n  ")
            )
        })
}

fn get_cache_path(cache: Option<PathBuf>) -> Result<PathBuf> {
    match cache {
        Some(path) => Ok(path),
        None => find_default_cache_dir(),
    }
}

/// Lists the main cache files of a directory, sorted by architecture.
///
/// Subcaches (`.01`, `.symbols`, ...) carry an extension and are skipped;
/// `DyldContext::open` finds them from the main file.
fn discover_caches(dir: &Path) -> Result<Vec<CacheInfo>> {
    if !dir.is_dir() {
        bail!("Path is not a directory: {}", dir.display());
    }

    let mut caches = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match name.strip_prefix(CACHE_PREFIX) {
            Some(arch) if !arch.is_empty() && !arch.contains('.') => caches.push(CacheInfo {
                arch: arch.to_string(),
                path: path.clone(),
            }),
            _ => {}
        }
    }

    caches.sort_by(|a, b| a.arch.cmp(&b.arch));
    Ok(caches)
}

/// Resolves a cache file from a file or directory path.
///
/// A directory must hold exactly one cache whose architecture contains
/// `arch` (or exactly one cache when no architecture is given).
fn resolve_cache_path(path: &Path, arch: Option<&str>) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if !path.is_dir() {
        bail!("Cache path does not exist: {}", path.display());
    }

    let caches = discover_caches(path)?;
    if caches.is_empty() {
        bail!("No dyld shared caches found in: {}", path.display());
    }

    let matching: Vec<&CacheInfo> = caches
        .iter()
        .filter(|c| arch.map_or(true, |a| c.arch.contains(a)))
        .collect();
    let names = |list: &[&CacheInfo]| {
        list.iter()
            .map(|c| c.arch.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };

    match matching.as_slice() {
        [only] => Ok(only.path.clone()),
        [] => bail!(
            "No cache matches architecture '{}'. Available: {}",
            arch.unwrap_or(""),
            names(&caches.iter().collect::<Vec<_>>())
        ),
        several => bail!(
            "Multiple caches match. Please specify --arch. Available: {}",
            names(several)
        ),
    }
}

/// Output path of an image: its install path made relative, or its
/// basename.
fn image_to_output_path(image_path: &str, preserve_paths: bool) -> PathBuf {
    if preserve_paths {
        PathBuf::from(image_path.trim_start_matches('/'))
    } else {
        PathBuf::from(image_path.rsplit('/').next().unwrap_or(image_path))
    }
}

/// What `extract` was asked to do.
#[derive(Debug)]
struct ExtractRequest {
    image: Option<String>,
    filter: Option<String>,
    output: Option<PathBuf>,
    preserve_paths: Option<bool>,
    jobs: Option<usize>,
    options: ExtractionOptions,
}

fn open_cache(source: CacheArgs) -> Result<(PathBuf, DyldContext)> {
    let cache_path = get_cache_path(source.cache)?;
    let resolved_path = resolve_cache_path(&cache_path, source.arch.as_deref())?;

    info!("Opening cache: {}", resolved_path.display());
    let cache = DyldContext::open(&resolved_path)
        .with_context(|| format!("Failed to open cache: {}", resolved_path.display()))?;
    Ok((resolved_path, cache))
}

fn cmd_extract(source: CacheArgs, request: ExtractRequest) -> Result<()> {
    let start = Instant::now();
    let (_, cache) = open_cache(source)?;

    let images: Vec<ImageEntry> = if let Some(ref name) = request.image {
        let img = find_image(&cache, name).with_context(|| format!("Image not found: {}", name))?;
        vec![img.clone()]
    } else if let Some(ref filter) = request.filter {
        find_images(&cache, filter).cloned().collect()
    } else {
        bail!("Either --image or --filter must be specified");
    };

    if images.is_empty() {
        warn!("No images match the criteria");
        return Ok(());
    }

    // Preserve paths by default when extracting several images.
    let preserve = request.preserve_paths.unwrap_or(images.len() > 1);

    if let [img] = images.as_slice() {
        let output_path = request
            .output
            .unwrap_or_else(|| image_to_output_path(&img.path, preserve));

        info!("Extracting {} to {}", img.path, output_path.display());
        let mut accel = Accelerator::new();
        let report =
            extract_image_in_run(&cache, &mut accel, &img.path, &output_path, &request.options)
                .with_context(|| format!("Failed to extract: {}", img.path))?;

        info!(
            "Extracted {} in {:.2}s: {} pointers rebased, {} stubs fixed, {} unresolved lazy stubs, {} exports",
            img.basename(),
            start.elapsed().as_secs_f64(),
            report.pointers_rebased,
            report.stubs.fixed,
            report.stubs.unresolved,
            report.exports
        );
        if request.options.verbosity >= 3 {
            accel.log_stats();
        }
        return Ok(());
    }

    let output_dir = request.output.unwrap_or_else(|| PathBuf::from("extracted"));
    info!("Extracting {} images to {}", images.len(), output_dir.display());

    let progress = ProgressBar::new(images.len() as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .context("Invalid progress template")?
        .progress_chars("#>-");
    progress.set_style(style);

    if let Some(n) = request.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    let options = ExtractionOptions {
        verbosity: request.options.verbosity.saturating_sub(1),
        ..request.options
    };

    // rayon runs the init once per split, not once per worker. The code
    // regions are shared rather than collected again each time.
    let regions = Arc::new(CodeRegions::collect(&cache));
    let errors: Vec<(String, anyhow::Error)> = images
        .par_iter()
        .map_init(
            || {
                let mut accel = Accelerator::new();
                accel.set_code_regions(Arc::clone(&regions));
                accel
            },
            |accel, img| {
                let output_path = output_dir.join(image_to_output_path(&img.path, preserve));
                let result = extract_image_in_run(&cache, accel, &img.path, &output_path, &options);
                progress.inc(1);
                result.err().map(|e| (img.path.clone(), anyhow::Error::from(e)))
            },
        )
        .flatten()
        .collect();

    progress.finish_with_message("Done");

    if !errors.is_empty() {
        warn!("{} images failed to extract:", errors.len());
        for (path, err) in &errors {
            error!("  {}: {:#}", path, err);
        }
    }

    info!(
        "Extracted {}/{} images in {:.2}s",
        images.len() - errors.len(),
        images.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn cmd_list(
    source: CacheArgs,
    filter: Option<String>,
    addresses: bool,
    basenames: bool,
) -> Result<()> {
    let (_, cache) = open_cache(source)?;

    let images: Box<dyn Iterator<Item = &ImageEntry>> = match filter {
        Some(ref f) => Box::new(find_images(&cache, f)),
        None => Box::new(list_images(&cache)),
    };

    for img in images {
        let name = if basenames { img.basename() } else { &img.path };
        if addresses {
            println!("{:#018x}  {}", img.address, name);
        } else {
            println!("{}", name);
        }
    }

    Ok(())
}

fn cmd_info(source: CacheArgs) -> Result<()> {
    let (path, cache) = open_cache(source)?;

    println!("Dyld Shared Cache Information");
    println!("==============================");
    println!("Path:         {}", path.display());
    println!("UUID:         {}", uuid_to_string(&cache.header.uuid));
    println!("Architecture: {}", cache.architecture());
    println!("Images:       {}", cache.image_count());
    println!("Mappings:     {}", cache.mappings.len());
    println!("Subcaches:    {}", cache.subcaches.len());
    println!("Total size:   {}", format_size(cache.total_size()));

    println!("\nMappings:");
    for (i, mapping) in cache.mappings.iter().enumerate() {
        let prot = format!(
            "r{}{}",
            if mapping.is_writable() { "w" } else { "-" },
            if mapping.is_executable() { "x" } else { "-" },
        );
        println!(
            "  [{:2}] {:#018x} - {:#018x} ({:>8}) {} {}{}",
            i,
            mapping.address,
            mapping.address + mapping.size,
            format_size(mapping.size),
            prot,
            mapping.mapping_flags(),
            if mapping.has_slide_info() { " [slide]" } else { "" }
        );
    }

    let regions = cache.chain_regions().context("Failed to parse slide info")?;
    if !regions.is_empty() {
        println!("\nSlide info:");
        for region in &regions {
            println!(
                "  {:#018x} ({:>8}) {:?}, {} pages",
                region.address,
                format_size(region.size),
                region.format,
                region.page_count()
            );
        }
    }

    if !cache.subcaches.is_empty() {
        println!("\nSubcaches:");
        for (i, sc) in cache.subcaches.iter().enumerate() {
            println!(
                "  [{:2}] {} ({})",
                i + 1,
                sc.path.file_name().unwrap_or_default().to_string_lossy(),
                format_size(sc.mmap.len() as u64)
            );
        }
    }

    if let Some(ref symbols) = cache.symbols_file {
        println!("\nSymbols file:");
        println!(
            "  {} ({})",
            symbols.path.file_name().unwrap_or_default().to_string_lossy(),
            format_size(symbols.mmap.len() as u64)
        );
    }

    Ok(())
}

fn cmd_arches(path: Option<PathBuf>) -> Result<()> {
    let cache_path = get_cache_path(path)?;
    let caches = discover_caches(&cache_path)?;

    if caches.is_empty() {
        println!("No dyld shared caches found in: {}", cache_path.display());
        return Ok(());
    }

    println!("Available architectures in {}:", cache_path.display());
    for cache in &caches {
        println!("  {} - {}", cache.arch, cache.path.display());
    }

    Ok(())
}

/// Finds the image whose segments cover `address`.
fn image_containing<C: SharedCache>(cache: &C, address: u64) -> Option<&ImageEntry> {
    cache.images().iter().find(|img| {
        cache.image_macho(img).is_ok_and(|macho| {
            macho.segments().any(|seg| {
                let start = seg.command.vmaddr;
                address >= start && address < start + seg.command.vmsize
            })
        })
    })
}

fn cmd_lookup(source: CacheArgs, address_str: String) -> Result<()> {
    let (_, cache) = open_cache(source)?;

    let digits = address_str
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    let address = u64::from_str_radix(digits, 16)
        .with_context(|| format!("Invalid address: {}", address_str))?;

    let Some(img) = image_containing(&cache, address) else {
        println!("Address {:#x} not found in any image", address);
        return Ok(());
    };

    println!("Address {:#x} is in:", address);
    println!("  Image:  {}", img.path);
    println!("  Base:   {:#x}", img.address);

    let mut accel = Accelerator::new();
    match Symbolizer::new(&cache).index(&mut accel, &img.path) {
        Ok(index) => match index.resolve_addr(address) {
            Some(symbol) => println!("  Symbol: {}", symbol.name),
            None => println!("  Symbol: (not exported)"),
        },
        Err(e) => warn!("Exports unavailable for {}: {}", img.path, e),
    }

    Ok(())
}

fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
