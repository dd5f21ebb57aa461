//! Stub repair for arm64, arm64e and arm64_32.

use tracing::debug;

use crate::arch::Architecture;
use crate::arm64::{self, X16, X17};
use crate::error::Result;
use crate::macho::{FunctionRange, MachOContext};

use super::{
    follow_stub_chain, image_words, lands_in_image, rewrite_target, write_words, CallSite,
    Classification, FixReport, Hop, StubFixer, StubKind, StubRoutes,
};
use crate::converter::accelerator::Accelerator;
use crate::converter::pointer::PointerTracker;

/// How far into a resolver body its closing branch may sit.
const RESOLVER_SEARCH_LIMIT: usize = 50;

/// What a stub does with control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// Loads the target from a pointer slot.
    Load { slot: u64 },
    /// Branches to a fixed address.
    Branch { target: u64 },
}

/// Matches the stub forms the linker and the cache builder emit.
fn shape(w: &[u32], addr: u64) -> Option<Shape> {
    if w.len() < 3 || !arm64::is_adrp(w[0]) {
        return None;
    }
    let page = arm64::decode_adrp(w[0], addr);

    match arm64::rd(w[0]) {
        X16 => {
            let is_load = (arm64::is_ldr_x_imm(w[1]) || arm64::is_ldr_w_imm(w[1]))
                && arm64::rn(w[1]) == X16
                && arm64::rd(w[1]) == X16;
            let exits = (arm64::is_br(w[2]) || arm64::is_braaz(w[2])) && arm64::rn(w[2]) == X16;
            if is_load && exits {
                return Some(Shape::Load {
                    slot: page.wrapping_add(arm64::decode_ldr_offset(w[1])),
                });
            }

            // Covers the authenticated variant too, which pads with BRK #1.
            let is_add = arm64::is_add_imm(w[1]) && arm64::rn(w[1]) == X16 && arm64::rd(w[1]) == X16;
            if is_add && arm64::is_br(w[2]) && arm64::rn(w[2]) == X16 {
                return Some(Shape::Branch {
                    target: page.wrapping_add(arm64::decode_add_imm(w[1])),
                });
            }
            None
        }
        X17 if w.len() == 4 => {
            let matches = arm64::is_add_imm(w[1])
                && arm64::rn(w[1]) == X17
                && arm64::rd(w[1]) == X17
                && arm64::is_ldr_x_imm(w[2])
                && arm64::rn(w[2]) == X17
                && arm64::rd(w[2]) == X16
                && arm64::is_braa(w[3])
                && arm64::rn(w[3]) == X16;
            matches.then(|| Shape::Load {
                slot: page
                    .wrapping_add(arm64::decode_add_imm(w[1]))
                    .wrapping_add(arm64::decode_ldr_offset(w[2])),
            })
        }
        _ => None,
    }
}

/// Stub fixer for the 64-bit ARM family.
pub struct Arm64StubFixer<'a> {
    tracker: &'a PointerTracker<'a>,
}

impl<'a> Arm64StubFixer<'a> {
    pub fn new(tracker: &'a PointerTracker<'a>) -> Self {
        Self { tracker }
    }

    /// Reads up to `count` instruction words, stopping at the first
    /// unmapped one.
    fn words(&self, addr: u64, count: usize) -> Vec<u32> {
        let cache = self.tracker.cache();
        (0..count as u64)
            .map_while(|i| cache.read_u32_at(addr + i * 4).ok())
            .collect()
    }

    fn match_shape(&self, addr: u64) -> Option<Shape> {
        shape(&self.words(addr, 4), addr)
    }

    /// Recognises a lazy resolver body: it saves registers, calls the
    /// resolver, stores the result into the stub's slot, restores and
    /// branches to the result.
    fn is_resolver(&self, addr: u64) -> bool {
        let w = self.words(addr, RESOLVER_SEARCH_LIMIT);
        if w.len() < 2 || !arm64::is_stp_pre(w[0]) || !arm64::is_mov_sp(w[1]) {
            return false;
        }
        let Some(exit) = (2..w.len()).find(|&i| arm64::is_register_branch(w[i])) else {
            return false;
        };
        let Some(call) = (2..exit).find(|&i| arm64::is_bl(w[i])) else {
            return false;
        };
        if call + 3 >= w.len() {
            return false;
        }

        arm64::is_ldp_post(w[exit - 1])
            && arm64::is_adrp(w[call + 1])
            && arm64::rd(w[call + 1]) == X16
            && arm64::is_add_imm(w[call + 2])
            && arm64::is_str_x_imm(w[call + 3])
    }

    fn hop(&self, accel: &mut Accelerator, addr: u64) -> Result<Option<Hop>> {
        let hop = match self.match_shape(addr) {
            Some(Shape::Load { slot }) => match self.tracker.resolve_pointer(accel, slot)? {
                Some(target) => Hop {
                    kind: StubKind::StubNormal,
                    next: Some(target),
                },
                None => Hop {
                    kind: StubKind::StubResolver,
                    next: None,
                },
            },
            Some(Shape::Branch { target }) => Hop {
                kind: StubKind::StubOptimized,
                next: Some(target),
            },
            None if self.is_resolver(addr) => Hop {
                kind: StubKind::StubResolver,
                next: None,
            },
            None => return Ok(None),
        };
        Ok(Some(hop))
    }
}

impl StubFixer for Arm64StubFixer<'_> {
    fn arch(&self) -> Architecture {
        self.tracker.arch()
    }

    fn classify(
        &self,
        accel: &mut Accelerator,
        image: &MachOContext,
        site: &CallSite,
    ) -> Result<Classification> {
        if lands_in_image(image, site.target) {
            return Ok(Classification::direct(site.target));
        }
        let class = follow_stub_chain(accel, self.arch(), site.target, |accel, addr| {
            self.hop(accel, addr)
        })?;
        debug!("{:#x}: {:?} -> {:?}", site.address, class.kind, class.target);
        Ok(class)
    }

    fn fix_stubs(
        &self,
        accel: &mut Accelerator,
        image: &mut MachOContext,
        ranges: &[FunctionRange],
        routes: &StubRoutes,
    ) -> Result<FixReport> {
        let mut report = FixReport::default();

        for range in ranges {
            let mut rewrites = Vec::new();
            let mut pc = range.start;
            while pc + 4 <= range.end() {
                let Some(offset) = image.addr_to_offset(pc) else {
                    break;
                };
                let instr = image.read_u32(offset)?;
                if arm64::is_branch(instr) {
                    let site = CallSite {
                        address: pc,
                        target: arm64::decode_branch(instr, pc),
                    };
                    let class = self.classify(accel, image, &site)?;
                    if let Some(target) = rewrite_target(&mut report, &class, &site, image, routes) {
                        match arm64::retarget_branch(instr, pc, target) {
                            Some(fixed) => rewrites.push((offset, fixed)),
                            None => {
                                debug!("{:#x}: target {:#x} out of branch range", pc, target);
                                report.skipped += 1;
                            }
                        }
                    }
                }
                pc += 4;
            }

            report.fixed += rewrites.len();
            for (offset, instr) in rewrites {
                image.write_u32(offset, instr)?;
            }
        }

        Ok(report)
    }

    fn stub_slot(&self, image: &MachOContext, stub: u64) -> Option<u64> {
        match shape(&image_words(image, stub, 4), stub)? {
            Shape::Load { slot } => Some(slot),
            Shape::Branch { .. } => None,
        }
    }

    fn write_stub(&self, image: &mut MachOContext, stub: u64, size: u64, slot: u64) -> Result<bool> {
        let offset = slot & 0xFFF;
        let words = match self.arch() {
            Architecture::Arm64 if size >= 16 => vec![
                arm64::encode_adrp(X17, stub, slot),
                arm64::encode_add_imm(X17, X17, offset as u32),
                arm64::encode_ldr_x(X16, X17, 0),
                arm64::encode_braa(X16, X17),
            ],
            Architecture::Arm64_32 if size >= 12 => vec![
                arm64::encode_adrp(X16, stub, slot),
                arm64::encode_ldr_w(X16, X16, offset),
                arm64::encode_br(X16),
            ],
            _ if size >= 12 => vec![
                arm64::encode_adrp(X16, stub, slot),
                arm64::encode_ldr_x(X16, X16, offset),
                arm64::encode_br(X16),
            ],
            _ => return Ok(false),
        };
        write_words(image, stub, &words)
    }
}
