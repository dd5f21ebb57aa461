//! Stub repair for 32-bit ARM caches, where functions mix ARM and Thumb.
//!
//! Stubs are always ARM code. A call site keeps its instruction size, but
//! may change between `BL` and `BLX` when the final target runs in the
//! other mode.

use tracing::debug;

use crate::arch::Architecture;
use crate::arm::{self, ArmBranch, ThumbBranch, COND_AL};
use crate::converter::accelerator::Accelerator;
use crate::converter::pointer::PointerTracker;
use crate::error::Result;
use crate::macho::{FunctionRange, MachOContext};
use crate::util;

use super::{
    follow_stub_chain, image_words, lands_in_image, rewrite_target, write_words, CallSite,
    Classification, FixReport, Hop, StubFixer, StubKind, StubRoutes,
};

/// `ldr ip, [pc, #4]; add ip, pc, ip; ldr pc, [ip]`, then the slot offset.
const NORMAL_STUB: [u32; 3] = [0xE59F_C004, 0xE08F_C00C, 0xE59C_F000];
const NORMAL_STUB_SIZE: u64 = 16;

/// `ldr ip, [pc]; add pc, pc, ip`, then the target offset and a trap.
const OPTIMIZED_STUB: [u32; 2] = [0xE59F_C000, 0xE08F_F00C];
const OPTIMIZED_TRAP: u32 = 0xE7FF_DEFE;

/// Mask and expected value of each instruction of a lazy resolver stub:
/// `stmdb; blx; ldr; add; str; cpy; ldmia; bx`.
const RESOLVER_STUB: [(u32, u32); 8] = [
    (0x0FD0_0000, 0x0900_0000),
    (0xFE00_0000, 0xFA00_0000),
    (0x0E50_0000, 0x0410_0000),
    (0x0FE0_0010, 0x0080_0000),
    (0x0E50_0000, 0x0400_0000),
    (0x0FEF_0FF0, 0x01A0_0000),
    (0x0FD0_0000, 0x0890_0000),
    (0x0FFF_FFF0, 0x012F_FF10),
];

/// Offsets in ARM stubs are relative to the pc of their add, in 32-bit
/// arithmetic.
fn pc_relative(stub: u64, data: u32) -> u64 {
    (stub as u32).wrapping_add(12).wrapping_add(data) as u64
}

/// Stub fixer for ARM and Thumb code.
pub struct ArmStubFixer<'a> {
    tracker: &'a PointerTracker<'a>,
}

impl<'a> ArmStubFixer<'a> {
    pub fn new(tracker: &'a PointerTracker<'a>) -> Self {
        Self { tracker }
    }

    fn words(&self, addr: u64, count: usize) -> Vec<u32> {
        let cache = self.tracker.cache();
        (0..count as u64)
            .map_while(|i| cache.read_u32_at(addr + i * 4).ok())
            .collect()
    }

    fn hop(&self, accel: &mut Accelerator, addr: u64) -> Result<Option<Hop>> {
        let base = addr & !3;
        let w = self.words(base, RESOLVER_STUB.len());

        if w.len() >= 4 && w[..3] == NORMAL_STUB {
            let hop = match self.tracker.resolve_pointer(accel, pc_relative(base, w[3]))? {
                Some(target) => Hop {
                    kind: StubKind::StubNormal,
                    next: Some(target),
                },
                None => Hop {
                    kind: StubKind::StubResolver,
                    next: None,
                },
            };
            return Ok(Some(hop));
        }

        if w.len() >= 4 && w[..2] == OPTIMIZED_STUB && w[3] == OPTIMIZED_TRAP {
            return Ok(Some(Hop {
                kind: StubKind::StubOptimized,
                next: Some(pc_relative(base, w[2])),
            }));
        }

        let is_resolver = w.len() == RESOLVER_STUB.len()
            && w.iter()
                .zip(RESOLVER_STUB)
                .all(|(&instr, (mask, expected))| instr & mask == expected);
        if is_resolver {
            return Ok(Some(Hop {
                kind: StubKind::StubResolver,
                next: None,
            }));
        }

        Ok(None)
    }

    /// Scans an ARM function. Returns `(offset, instruction)` rewrites.
    fn scan_arm(
        &self,
        accel: &mut Accelerator,
        image: &MachOContext,
        range: &FunctionRange,
        routes: &StubRoutes,
        report: &mut FixReport,
    ) -> Result<Vec<(usize, u32)>> {
        let mut rewrites = Vec::new();
        let mut pc = range.start;
        while pc + 4 <= range.end() {
            let Some(offset) = image.addr_to_offset(pc) else {
                break;
            };
            let instr = image.read_u32(offset)?;
            if let Some(kind) = arm::arm_branch_kind(instr) {
                let site = CallSite {
                    address: pc,
                    target: arm::decode_arm_branch(instr, pc),
                };
                let class = self.classify(accel, image, &site)?;
                if let Some(target) = rewrite_target(report, &class, &site, image, routes) {
                    match retarget_arm(instr, kind, pc, target) {
                        Some(fixed) => rewrites.push((offset, fixed)),
                        None => {
                            debug!("{:#x}: cannot reach {:#x} from {:?}", pc, target, kind);
                            report.skipped += 1;
                        }
                    }
                }
            }
            pc += 4;
        }
        Ok(rewrites)
    }

    /// Scans a Thumb function, stepping over 16-bit instructions.
    fn scan_thumb(
        &self,
        accel: &mut Accelerator,
        image: &MachOContext,
        range: &FunctionRange,
        routes: &StubRoutes,
        report: &mut FixReport,
    ) -> Result<Vec<(usize, u32)>> {
        let mut rewrites = Vec::new();
        let mut pc = range.start;
        while pc + 2 <= range.end() {
            let Some(offset) = image.addr_to_offset(pc) else {
                break;
            };
            let hw1 = util::read_u16_le(image.read_at(offset, 2)?);
            if !arm::is_thumb32(hw1) {
                pc += 2;
                continue;
            }
            if pc + 4 > range.end() {
                break;
            }
            let hw2 = util::read_u16_le(image.read_at(offset + 2, 2)?);

            if let Some(kind) = arm::thumb_branch_kind(hw1, hw2) {
                let site = CallSite {
                    address: pc,
                    target: arm::decode_thumb_branch(hw1, hw2, pc),
                };
                let class = self.classify(accel, image, &site)?;
                if let Some(target) = rewrite_target(report, &class, &site, image, routes) {
                    match retarget_thumb(kind, pc, target) {
                        Some((lo, hi)) => rewrites.push((offset, u32::from(lo) | u32::from(hi) << 16)),
                        None => {
                            debug!("{:#x}: cannot reach {:#x} from {:?}", pc, target, kind);
                            report.skipped += 1;
                        }
                    }
                }
            }
            pc += 4;
        }
        Ok(rewrites)
    }
}

/// Re-encodes an ARM branch for `target`, switching between `BL` and `BLX`
/// as its mode requires. A plain `B` cannot switch mode, and a conditional
/// `BL` has no `BLX` form.
fn retarget_arm(instr: u32, kind: ArmBranch, pc: u64, target: u64) -> Option<u32> {
    let thumb = target & 1 != 0;
    match kind {
        ArmBranch::Bl | ArmBranch::Blx if thumb => {
            if kind == ArmBranch::Bl && arm::arm_cond(instr) != COND_AL {
                return None;
            }
            arm::encode_arm_branch(ArmBranch::Blx, COND_AL, pc, target)
        }
        ArmBranch::Bl | ArmBranch::Blx => {
            let cond = match kind {
                ArmBranch::Blx => COND_AL,
                _ => arm::arm_cond(instr),
            };
            arm::encode_arm_branch(ArmBranch::Bl, cond, pc, target)
        }
        ArmBranch::B if thumb => None,
        ArmBranch::B => arm::encode_arm_branch(ArmBranch::B, arm::arm_cond(instr), pc, target),
    }
}

/// Re-encodes a Thumb branch for `target`. `B.W` cannot switch mode.
fn retarget_thumb(kind: ThumbBranch, pc: u64, target: u64) -> Option<(u16, u16)> {
    let thumb = target & 1 != 0;
    let kind = match kind {
        ThumbBranch::Bl | ThumbBranch::Blx if thumb => ThumbBranch::Bl,
        ThumbBranch::Bl | ThumbBranch::Blx => ThumbBranch::Blx,
        ThumbBranch::BW if thumb => ThumbBranch::BW,
        ThumbBranch::BW => return None,
    };
    arm::encode_thumb_branch(kind, pc, target)
}

impl StubFixer for ArmStubFixer<'_> {
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
            let rewrites = if range.thumb {
                self.scan_thumb(accel, image, range, routes, &mut report)?
            } else {
                self.scan_arm(accel, image, range, routes, &mut report)?
            };

            report.fixed += rewrites.len();
            for (offset, instr) in rewrites {
                image.write_u32(offset, instr)?;
            }
        }

        Ok(report)
    }

    fn stub_slot(&self, image: &MachOContext, stub: u64) -> Option<u64> {
        let base = stub & !3;
        let w = image_words(image, base, 4);
        (w.len() == 4 && w[..3] == NORMAL_STUB).then(|| pc_relative(base, w[3]))
    }

    fn write_stub(&self, image: &mut MachOContext, stub: u64, size: u64, slot: u64) -> Result<bool> {
        if size < NORMAL_STUB_SIZE {
            return Ok(false);
        }
        let base = stub & !3;
        let offset = (slot as u32).wrapping_sub(base as u32 + 12);
        write_words(
            image,
            base,
            &[NORMAL_STUB[0], NORMAL_STUB[1], NORMAL_STUB[2], offset],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::{
        arm_branch_kind, decode_arm_branch, decode_thumb_branch, encode_arm_branch,
        encode_thumb_branch, thumb_branch_kind,
    };
    use crate::converter::stubs::{repair_stub_sections, StubSections};
    use crate::dyld::testing::{ImageBuilder, TestCache, POINTERS_OFFSET, STUBS_OFFSET};

    const BASE: u64 = 0x2000_0000;
    const CODE: u64 = BASE + 0x1000;
    const THUMB: u64 = CODE + 0x40;
    const STUBS: u64 = 0x2080_0000;
    const SLOTS: u64 = STUBS + 0x1000;
    const FAR: u64 = 0x3000_0000;

    fn offset_from_stub(stub: u64, to: u64) -> u32 {
        (to as u32).wrapping_sub(stub as u32 + 12)
    }

    fn normal_stub(addr: u64, slot: u64) -> [u32; 4] {
        [NORMAL_STUB[0], NORMAL_STUB[1], NORMAL_STUB[2], offset_from_stub(addr, slot)]
    }

    fn thumb_words(pairs: &[(u16, u16)]) -> Vec<u32> {
        pairs
            .iter()
            .map(|&(lo, hi)| u32::from(lo) | u32::from(hi) << 16)
            .collect()
    }

    fn setup() -> (TestCache, MachOContext) {
        let arm_bl = |pc: u64, to: u64| encode_arm_branch(ArmBranch::Bl, COND_AL, pc, to).unwrap();
        let arm_b = |pc: u64, to: u64| encode_arm_branch(ArmBranch::B, COND_AL, pc, to).unwrap();

        let mut code = vec![0u32; 0x20];
        code[0] = arm_bl(CODE, STUBS);
        code[1] = arm_b(CODE + 4, STUBS + 0x10);
        code[2] = arm_bl(CODE + 8, STUBS + 0x20);
        code[3] = arm_bl(CODE + 12, STUBS + 0x80);
        code[4] = arm_b(CODE + 16, STUBS);

        let thumb = thumb_words(&[
            encode_thumb_branch(ThumbBranch::Blx, THUMB, STUBS + 0x10).unwrap(),
            encode_thumb_branch(ThumbBranch::Blx, THUMB + 4, STUBS).unwrap(),
            encode_thumb_branch(ThumbBranch::BW, THUMB + 8, STUBS + 0x10).unwrap(),
            (0x4770, 0xBF00), // bx lr; nop
        ]);
        code[0x10..0x14].copy_from_slice(&thumb);

        let builder = ImageBuilder::new(Architecture::Arm, "/usr/lib/libarm.dylib", BASE)
            .code_words(&code)
            .function_starts(&[0x1000, 0x1041]);
        let mut cache = TestCache::new(Architecture::Arm);
        cache.add_built_image(&builder);
        cache.map_zeroed(STUBS, 0x2000);

        // Normal stub to the Thumb function.
        cache.write_code(STUBS, &normal_stub(STUBS, SLOTS));
        cache.write_u32(SLOTS, (THUMB | 1) as u32);

        // Optimized stub to the ARM code at CODE + 0x20.
        let addr = STUBS + 0x10;
        cache.write_code(
            addr,
            &[
                OPTIMIZED_STUB[0],
                OPTIMIZED_STUB[1],
                offset_from_stub(addr, CODE + 0x20),
                OPTIMIZED_TRAP,
            ],
        );

        // Lazy stub still bound to its resolver.
        cache.write_code(STUBS + 0x20, &normal_stub(STUBS + 0x20, SLOTS + 4));
        cache.write_u32(SLOTS + 4, (STUBS + 0x40) as u32);
        cache.write_code(
            STUBS + 0x40,
            &[
                0xE92D_400F, // stmdb sp!, {r0-r3, lr}
                0xFA00_0010, // blx resolver
                0xE59F_1010, // ldr r1, [pc, #16]
                0xE080_1001, // add r1, r0, r1
                0xE581_0000, // str r0, [r1]
                0xE1A0_C000, // cpy ip, r0
                0xE8BD_400F, // ldmia sp!, {r0-r3, lr}
                0xE12F_FF1C, // bx ip
                0x0000_1000,
            ],
        );

        // Stub to code out of reach.
        cache.write_code(STUBS + 0x80, &normal_stub(STUBS + 0x80, SLOTS + 8));
        cache.write_u32(SLOTS + 8, FAR as u32);

        let image = MachOContext::new(builder.build()).unwrap();
        (cache, image)
    }

    fn read_arm(image: &MachOContext, pc: u64) -> u32 {
        image.read_u32(image.addr_to_offset(pc).unwrap()).unwrap()
    }

    fn read_thumb(image: &MachOContext, pc: u64) -> (u16, u16) {
        let word = read_arm(image, pc);
        (word as u16, (word >> 16) as u16)
    }

    #[test]
    fn test_stub_shapes() {
        let (cache, _) = setup();
        let tracker = PointerTracker::new(&cache, Architecture::Arm).unwrap();
        let fixer = ArmStubFixer::new(&tracker);
        let mut accel = Accelerator::new();

        let hop = fixer.hop(&mut accel, STUBS).unwrap().unwrap();
        assert_eq!(hop.kind, StubKind::StubNormal);
        assert_eq!(hop.next, Some(THUMB | 1));

        // Thumb bit on the way in is ignored.
        let hop = fixer.hop(&mut accel, STUBS + 0x11).unwrap().unwrap();
        assert_eq!(hop.kind, StubKind::StubOptimized);
        assert_eq!(hop.next, Some(CODE + 0x20));

        let hop = fixer.hop(&mut accel, STUBS + 0x40).unwrap().unwrap();
        assert_eq!(hop.kind, StubKind::StubResolver);

        assert!(fixer.hop(&mut accel, CODE + 0x20).unwrap().is_none());
        assert!(fixer.hop(&mut accel, FAR).unwrap().is_none());
    }

    #[test]
    fn test_retarget() {
        // BL to Thumb code becomes BLX.
        let bl = encode_arm_branch(ArmBranch::Bl, COND_AL, 0x1000, 0x2000).unwrap();
        let fixed = retarget_arm(bl, ArmBranch::Bl, 0x1000, 0x3001).unwrap();
        assert_eq!(arm_branch_kind(fixed), Some(ArmBranch::Blx));
        assert_eq!(decode_arm_branch(fixed, 0x1000), 0x3001);

        // Conditional BL has no BLX form.
        let blne = encode_arm_branch(ArmBranch::Bl, 0x1, 0x1000, 0x2000).unwrap();
        assert_eq!(retarget_arm(blne, ArmBranch::Bl, 0x1000, 0x3001), None);
        let fixed = retarget_arm(blne, ArmBranch::Bl, 0x1000, 0x3000).unwrap();
        assert_eq!(arm::arm_cond(fixed), 0x1);

        // Thumb BLX to Thumb code becomes BL.
        let (hw1, hw2) = retarget_thumb(ThumbBranch::Blx, 0x1000, 0x4001).unwrap();
        assert_eq!(thumb_branch_kind(hw1, hw2), Some(ThumbBranch::Bl));
        assert_eq!(decode_thumb_branch(hw1, hw2, 0x1000), 0x4001);

        assert_eq!(retarget_thumb(ThumbBranch::BW, 0x1000, 0x4000), None);
    }

    #[test]
    fn test_fix_stubs() {
        let (cache, mut image) = setup();
        let tracker = PointerTracker::new(&cache, Architecture::Arm).unwrap();
        let fixer = ArmStubFixer::new(&tracker);
        let mut accel = Accelerator::new();
        let ranges = image.function_ranges().unwrap();
        assert_eq!(ranges.len(), 2);

        let report = fixer
            .fix_stubs(&mut accel, &mut image, &ranges, &StubRoutes::new())
            .unwrap();
        assert_eq!(
            report,
            FixReport {
                fixed: 4,
                unresolved: 1,
                skipped: 2,
                direct: 0,
                unlinked: 1,
            }
        );

        // ARM BL to a Thumb function switches to BLX.
        let instr = read_arm(&image, CODE);
        assert_eq!(arm_branch_kind(instr), Some(ArmBranch::Blx));
        assert_eq!(decode_arm_branch(instr, CODE), THUMB | 1);

        let instr = read_arm(&image, CODE + 4);
        assert_eq!(arm_branch_kind(instr), Some(ArmBranch::B));
        assert_eq!(decode_arm_branch(instr, CODE + 4), CODE + 0x20);

        // Skipped, unlinked and unresolved sites are untouched.
        assert_eq!(decode_arm_branch(read_arm(&image, CODE + 8), CODE + 8), STUBS + 0x20);
        assert_eq!(decode_arm_branch(read_arm(&image, CODE + 12), CODE + 12), STUBS + 0x80);
        assert_eq!(decode_arm_branch(read_arm(&image, CODE + 16), CODE + 16), STUBS);

        // Thumb BLX to ARM code stays BLX; to Thumb code it becomes BL.
        let (hw1, hw2) = read_thumb(&image, THUMB);
        assert_eq!(thumb_branch_kind(hw1, hw2), Some(ThumbBranch::Blx));
        assert_eq!(decode_thumb_branch(hw1, hw2, THUMB), CODE + 0x20);

        let (hw1, hw2) = read_thumb(&image, THUMB + 4);
        assert_eq!(thumb_branch_kind(hw1, hw2), Some(ThumbBranch::Bl));
        assert_eq!(decode_thumb_branch(hw1, hw2, THUMB + 4), THUMB | 1);

        let (hw1, hw2) = read_thumb(&image, THUMB + 8);
        assert_eq!(thumb_branch_kind(hw1, hw2), Some(ThumbBranch::BW));
    }

    #[test]
    fn test_fix_stubs_is_idempotent() {
        let (cache, mut image) = setup();
        let tracker = PointerTracker::new(&cache, Architecture::Arm).unwrap();
        let fixer = ArmStubFixer::new(&tracker);
        let ranges = image.function_ranges().unwrap();

        let routes = StubRoutes::new();
        fixer.fix_stubs(&mut Accelerator::new(), &mut image, &ranges, &routes).unwrap();
        let once = image.as_bytes().to_vec();
        let report = fixer.fix_stubs(&mut Accelerator::new(), &mut image, &ranges, &routes).unwrap();

        assert_eq!(image.as_bytes(), &once[..]);
        assert_eq!(report.fixed, 0);
        assert_eq!(report.direct, 4);
    }

    #[test]
    fn test_far_call_goes_through_own_stub() {
        let own = BASE + STUBS_OFFSET;
        let slot = BASE + POINTERS_OFFSET;
        let mut code = vec![0u32; 0x10];
        code[0] = encode_arm_branch(ArmBranch::Bl, COND_AL, CODE, STUBS + 0x80).unwrap();

        let stub = [
            OPTIMIZED_STUB[0],
            OPTIMIZED_STUB[1],
            offset_from_stub(own, FAR),
            OPTIMIZED_TRAP,
        ];
        let builder = ImageBuilder::new(Architecture::Arm, "/usr/lib/libarm.dylib", BASE)
            .code_words(&code)
            .stubs(16, &stub, &["_far"])
            .pointers("__la_symbol_ptr", &["_far"]);
        let mut cache = TestCache::new(Architecture::Arm);
        cache.add_built_image(&builder);
        cache.map_zeroed(STUBS, 0x2000);
        cache.write_code(STUBS + 0x80, &normal_stub(STUBS + 0x80, SLOTS + 8));
        cache.write_u32(SLOTS + 8, FAR as u32);
        let mut image = MachOContext::new(builder.build()).unwrap();

        let tracker = PointerTracker::new(&cache, Architecture::Arm).unwrap();
        let fixer = ArmStubFixer::new(&tracker);
        let mut accel = Accelerator::new();

        let sections = StubSections::collect(&image).unwrap();
        let (routes, repaired) =
            repair_stub_sections(&fixer, &mut accel, &mut image, &sections, &mut |_, _| Ok(None)).unwrap();
        assert_eq!(repaired.repaired, 1);
        assert_eq!(fixer.stub_slot(&image, own), Some(slot));
        assert_eq!(image.read_pointer(image.addr_to_offset(slot).unwrap()).unwrap(), FAR);

        let ranges = image.function_ranges().unwrap();
        let report = fixer.fix_stubs(&mut accel, &mut image, &ranges, &routes).unwrap();
        assert_eq!(report.fixed, 1);
        let instr = read_arm(&image, CODE);
        assert_eq!(arm_branch_kind(instr), Some(ArmBranch::Bl));
        assert_eq!(decode_arm_branch(instr, CODE), own);

        // A stub too small for the load form is left alone.
        assert!(!fixer.write_stub(&mut image, own, 12, slot).unwrap());
    }
}
