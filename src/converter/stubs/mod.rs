//! Call-site repair for stubs that only work inside the cache.
//!
//! The cache builder routes calls through stub islands and lazy-binding
//! stubs whose slots point at other cache images. Each call site in an
//! extracted image is classified by what its branch lands on, and sites
//! whose final destination is known are rewritten to branch there directly.
//!
//! Targets inside the image are branched to directly. Targets in other
//! images are reached through the image's own stubs, which are first put
//! back into a form that loads from the image's symbol pointers.
//!
//! The shape of a stub depends on the instruction set, so the work is split
//! into one [`StubFixer`] per architecture family.

mod arm;
mod arm64;
mod section;

use std::collections::HashSet;
use std::ops::AddAssign;

use tracing::debug;

use crate::arch::Architecture;
use crate::dyld::SharedCache;
use crate::error::Result;
use crate::macho::{FunctionRange, MachOContext};

use super::accelerator::Accelerator;
use super::pointer::PointerTracker;

pub use self::arm::ArmStubFixer;
pub use self::arm64::Arm64StubFixer;
pub use self::section::*;

// =============================================================================
// Classification
// =============================================================================

/// What a call site's branch lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubKind {
    /// Real code, nothing to do.
    Direct,
    /// A stub that loads its target from a pointer slot.
    StubNormal,
    /// A stub that branches to a fixed target.
    StubOptimized,
    /// A lazy resolver; the final target is only known at run time.
    StubResolver,
}

/// A site's kind plus its final destination, when one can be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: StubKind,
    pub target: Option<u64>,
}

impl Classification {
    pub fn direct(target: u64) -> Self {
        Self {
            kind: StubKind::Direct,
            target: Some(target),
        }
    }

    pub fn unresolved() -> Self {
        Self {
            kind: StubKind::StubResolver,
            target: None,
        }
    }
}

/// Totals for one fixing pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixReport {
    /// Sites rewritten to branch straight to their target
    pub fixed: usize,
    /// Sites that go through a lazy resolver
    pub unresolved: usize,
    /// Resolvable sites whose target the branch form cannot reach
    pub skipped: usize,
    /// Sites that already branch to real code
    pub direct: usize,
    /// Sites into other images with no stub of the image to go through
    pub unlinked: usize,
}

impl AddAssign for FixReport {
    fn add_assign(&mut self, other: Self) {
        self.fixed += other.fixed;
        self.unresolved += other.unresolved;
        self.skipped += other.skipped;
        self.direct += other.direct;
        self.unlinked += other.unlinked;
    }
}

/// A branch found while scanning a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Address of the branch instruction
    pub address: u64,
    /// Decoded destination, with the Thumb bit for 32-bit ARM
    pub target: u64,
}

/// One stub: its kind and the address it passes control to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hop {
    pub kind: StubKind,
    /// `None` when a slot could not be resolved
    pub next: Option<u64>,
}

// =============================================================================
// Code Regions
// =============================================================================

/// Executable, non-stub sections of every image in the cache.
///
/// A branch into one of these is real code and never needs shape matching.
#[derive(Debug, Default, Clone)]
pub struct CodeRegions {
    ranges: Vec<(u64, u64)>,
}

impl CodeRegions {
    /// Builds the set from `(start, end)` ranges.
    pub fn from_ranges(mut ranges: Vec<(u64, u64)>) -> Self {
        ranges.retain(|&(start, end)| end > start);
        ranges.sort_unstable();
        Self { ranges }
    }

    /// Collects the code sections of every image. Images whose header
    /// cannot be read are left out.
    pub fn collect<C: SharedCache + ?Sized>(cache: &C) -> Self {
        let mut ranges = Vec::new();
        for image in cache.images() {
            let macho = match cache.image_macho(image) {
                Ok(macho) => macho,
                Err(err) => {
                    debug!("{}: skipped for code regions: {}", image.path, err);
                    continue;
                }
            };
            ranges.extend(
                macho
                    .sections()
                    .map(|s| &s.section)
                    .filter(|s| s.has_instructions() && !s.is_stubs())
                    .map(|s| (s.addr, s.addr + s.size)),
            );
        }
        debug!("collected {} code regions", ranges.len());
        Self::from_ranges(ranges)
    }

    /// Returns true if `addr` lies in a code section.
    pub fn contains(&self, addr: u64) -> bool {
        let index = self.ranges.partition_point(|&(start, _)| start <= addr);
        index > 0 && addr < self.ranges[index - 1].1
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// =============================================================================
// Stub Fixer
// =============================================================================

/// Per-architecture stub repair.
pub trait StubFixer {
    /// Architecture this fixer handles.
    fn arch(&self) -> Architecture;

    /// Classifies a call site of `image`.
    fn classify(
        &self,
        accel: &mut Accelerator,
        image: &MachOContext,
        site: &CallSite,
    ) -> Result<Classification>;

    /// Scans every function range and rewrites the sites whose final target
    /// is known, sending those bound for other images through `routes`.
    /// Instruction sizes never change.
    fn fix_stubs(
        &self,
        accel: &mut Accelerator,
        image: &mut MachOContext,
        ranges: &[FunctionRange],
        routes: &StubRoutes,
    ) -> Result<FixReport>;

    /// Returns the slot an image stub loads its target from, read from the
    /// image's own bytes.
    fn stub_slot(&self, image: &MachOContext, stub: u64) -> Option<u64>;

    /// Rewrites the stub at `stub` into the standard form loading from
    /// `slot`. Returns false when no standard form fits in `size` bytes.
    fn write_stub(&self, image: &mut MachOContext, stub: u64, size: u64, slot: u64) -> Result<bool>;
}

/// Returns the fixer for the tracker's architecture. x86_64 has none.
pub fn fixer_for<'a>(tracker: &'a PointerTracker<'a>) -> Option<Box<dyn StubFixer + 'a>> {
    match tracker.arch() {
        Architecture::Arm64 | Architecture::Arm64_32 => Some(Box::new(Arm64StubFixer::new(tracker))),
        Architecture::Arm => Some(Box::new(ArmStubFixer::new(tracker))),
        Architecture::X86_64 => None,
    }
}

/// Follows stubs from `start` until control reaches something that is not
/// a stub, memoizing the outcome per architecture.
///
/// The kind is that of the first stub. A resolver anywhere along the way,
/// a slot that cannot be resolved, or a loop makes the chain unresolved.
pub(crate) fn follow_stub_chain(
    accel: &mut Accelerator,
    arch: Architecture,
    start: u64,
    mut hop: impl FnMut(&mut Accelerator, u64) -> Result<Option<Hop>>,
) -> Result<Classification> {
    if let Some(found) = accel.stub_chain(arch, start) {
        return Ok(found);
    }

    let code = accel.code_regions();
    let mut visited = HashSet::new();
    let mut first = None;
    let mut current = start;

    let result = loop {
        if !visited.insert(current) {
            break Classification::unresolved();
        }
        let in_code = code.as_deref().is_some_and(|c| c.contains(current & !1));
        let step = if in_code { None } else { hop(accel, current)? };

        match step {
            None => {
                break Classification {
                    kind: first.unwrap_or(StubKind::Direct),
                    target: Some(current),
                }
            }
            Some(Hop {
                kind: StubKind::StubResolver,
                ..
            })
            | Some(Hop { next: None, .. }) => break Classification::unresolved(),
            Some(Hop {
                kind,
                next: Some(next),
            }) => {
                first.get_or_insert(kind);
                current = next;
            }
        }
    };

    accel.insert_stub_chain(arch, start, result);
    Ok(result)
}

/// Reads up to `count` instruction words of the image, stopping at the
/// first one it does not hold.
pub(crate) fn image_words(image: &MachOContext, addr: u64, count: usize) -> Vec<u32> {
    (0..count as u64)
        .map_while(|i| {
            let offset = image.addr_to_offset(addr + i * 4)?;
            image.read_u32(offset).ok()
        })
        .collect()
}

/// Writes instruction words at `addr`. Returns false if the image does not
/// hold the address.
pub(crate) fn write_words(image: &mut MachOContext, addr: u64, words: &[u32]) -> Result<bool> {
    let Some(offset) = image.addr_to_offset(addr) else {
        return Ok(false);
    };
    for (i, &word) in words.iter().enumerate() {
        image.write_u32(offset + i * 4, word)?;
    }
    Ok(true)
}

/// Returns true if `target` is code of the image itself rather than one of
/// its stubs.
pub(crate) fn lands_in_image(image: &MachOContext, target: u64) -> bool {
    let addr = target & !1;
    image.contains_addr(addr)
        && !image
            .sections()
            .any(|s| s.section.is_stubs() && s.contains_addr(addr))
}

/// Counts a classified site and returns the address to rewrite it to.
///
/// A target inside the image is branched to directly; one in another image
/// is reached through the image's stub for it, if it has one.
pub(crate) fn rewrite_target(
    report: &mut FixReport,
    class: &Classification,
    site: &CallSite,
    image: &MachOContext,
    routes: &StubRoutes,
) -> Option<u64> {
    let target = match (class.kind, class.target) {
        (StubKind::StubResolver, _) | (_, None) => {
            report.unresolved += 1;
            return None;
        }
        (_, Some(target)) => target,
    };

    let destination = if image.contains_addr(target & !1) {
        target
    } else if let Some(stub) = routes.route(target) {
        stub
    } else {
        debug!("{:#x}: no stub for {:#x}", site.address, target);
        report.unlinked += 1;
        return None;
    };

    if destination == site.target {
        report.direct += 1;
        return None;
    }
    Some(destination)
}
