//! The image's own `__stubs` and symbol pointer sections.
//!
//! The cache builder points an image's stubs straight at their targets in
//! other images and leaves its symbol pointers unused. Those stubs are put
//! back into the load-through-pointer form, each loading from a pointer of
//! the image named after the same symbol, and call sites into other images
//! are routed through them so that every branch stays inside the image.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::arch::Architecture;
use crate::error::Result;
use crate::macho::MachOContext;

use super::{CallSite, StubFixer};
use crate::converter::accelerator::Accelerator;

/// One stub of an `S_SYMBOL_STUBS` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStub {
    pub address: u64,
    /// Stub size from the section's `reserved2`
    pub size: u64,
    /// Symbol from the indirect symbol table
    pub name: Option<String>,
}

/// One slot of a lazy or non-lazy symbol pointer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolPointer {
    pub address: u64,
    pub name: String,
    /// Lives in an authenticated section such as `__auth_got`
    pub auth: bool,
}

/// The stubs and named symbol pointers of an image.
#[derive(Debug, Default, Clone)]
pub struct StubSections {
    pub stubs: Vec<ImageStub>,
    pub pointers: Vec<SymbolPointer>,
}

impl StubSections {
    /// Reads every stub and symbol pointer section, naming entries through
    /// the indirect symbol table.
    pub fn collect(image: &MachOContext) -> Result<Self> {
        let mut found = Self::default();
        let pointer_size = image.pointer_size() as u64;

        for info in image.sections() {
            let section = &info.section;
            if section.is_stubs() {
                let size = u64::from(section.reserved2);
                if size == 0 {
                    debug!("{}: stub section without a stub size", section.name());
                    continue;
                }
                for i in 0..section.size / size {
                    found.stubs.push(ImageStub {
                        address: section.addr + i * size,
                        size,
                        name: image
                            .indirect_symbol_name(section.reserved1 + i as u32)?
                            .map(str::to_string),
                    });
                }
            } else if section.is_symbol_pointers() {
                let auth = section.name().contains("auth");
                for i in 0..section.size / pointer_size {
                    if let Some(name) = image.indirect_symbol_name(section.reserved1 + i as u32)? {
                        found.pointers.push(SymbolPointer {
                            address: section.addr + i * pointer_size,
                            name: name.to_string(),
                            auth,
                        });
                    }
                }
            }
        }

        debug!(
            "{} stubs, {} named symbol pointers",
            found.stubs.len(),
            found.pointers.len()
        );
        Ok(found)
    }

    /// Picks a pointer named `name` that no other stub uses, preferring one
    /// whose authentication matches.
    pub fn pointer_for(&self, name: &str, auth: bool, used: &HashSet<u64>) -> Option<u64> {
        let candidates: Vec<&SymbolPointer> = self
            .pointers
            .iter()
            .filter(|p| p.name == name && !used.contains(&p.address))
            .collect();
        candidates
            .iter()
            .find(|p| p.auth == auth)
            .or_else(|| candidates.first())
            .map(|p| p.address)
    }

    /// Returns true if `addr` is one of the image's symbol pointers.
    pub fn is_pointer(&self, addr: u64) -> bool {
        self.pointers.iter().any(|p| p.address == addr)
    }

    pub fn is_empty(&self) -> bool {
        self.stubs.is_empty()
    }
}

/// Maps addresses in other images to the image's own stub for them.
#[derive(Debug, Default, Clone)]
pub struct StubRoutes {
    by_target: HashMap<u64, u64>,
}

impl StubRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `target` through `stub`. The first stub for a target wins.
    pub fn insert(&mut self, target: u64, stub: u64) {
        self.by_target.entry(target).or_insert(stub);
    }

    /// Returns the stub for `target`, ignoring a Thumb bit on either side.
    pub fn route(&self, target: u64) -> Option<u64> {
        self.by_target
            .get(&target)
            .or_else(|| self.by_target.get(&(target ^ 1)))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.by_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty()
    }
}

/// Totals for the stub section pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectionReport {
    /// Stubs that already load from a pointer of the image
    pub intact: usize,
    /// Stubs rewritten to load from a pointer of the image
    pub repaired: usize,
    /// Stubs left as they were, for want of a name or a pointer
    pub failed: usize,
}

/// Repairs the image's own stubs and symbol pointers, and returns the
/// routes call sites into other images should take.
///
/// `import` gives the address a symbol name resolves to among the image's
/// dependencies. Each repaired stub's pointer receives the stub's final
/// target when one is known; binding information is not regenerated.
pub fn repair_stub_sections(
    fixer: &dyn StubFixer,
    accel: &mut Accelerator,
    image: &mut MachOContext,
    sections: &StubSections,
    import: &mut dyn FnMut(&mut Accelerator, &str) -> Result<Option<u64>>,
) -> Result<(StubRoutes, SectionReport)> {
    let mut routes = StubRoutes::new();
    let mut report = SectionReport::default();
    let mut used = HashSet::new();

    // Stubs that already load through one of the image's pointers claim
    // them before any stub is rewritten.
    let mut pending = Vec::new();
    for stub in &sections.stubs {
        match fixer.stub_slot(image, stub.address) {
            Some(slot) if sections.is_pointer(slot) => {
                used.insert(slot);
                pending.push((stub, Some(slot)));
            }
            _ => pending.push((stub, None)),
        }
    }

    for (stub, slot) in pending {
        let site = CallSite {
            address: stub.address,
            target: stub.address,
        };
        let target = fixer.classify(accel, image, &site)?.target;

        if let Some(target) = target {
            routes.insert(target, stub.address);
        }
        if let Some(name) = &stub.name {
            if let Some(exported) = import(accel, name)? {
                routes.insert(exported, stub.address);
            }
        }

        let slot = match slot {
            Some(slot) => {
                report.intact += 1;
                slot
            }
            None => {
                let auth = fixer.arch() == Architecture::Arm64 && stub.size >= 16;
                let pointer = stub
                    .name
                    .as_deref()
                    .and_then(|name| sections.pointer_for(name, auth, &used));
                let Some(pointer) = pointer else {
                    warn!("{:#x}: no symbol pointer to repair the stub with", stub.address);
                    report.failed += 1;
                    continue;
                };
                if !fixer.write_stub(image, stub.address, stub.size, pointer)? {
                    warn!("{:#x}: a {} byte stub has no standard form", stub.address, stub.size);
                    report.failed += 1;
                    continue;
                }
                used.insert(pointer);
                report.repaired += 1;
                pointer
            }
        };

        if let (Some(target), Some(offset)) = (target, image.addr_to_offset(slot)) {
            image.write_pointer(offset, target)?;
        }
    }

    debug!(
        "stub sections: {} intact, {} repaired, {} failed, {} routes",
        report.intact,
        report.repaired,
        report.failed,
        routes.len()
    );
    Ok((routes, report))
}
