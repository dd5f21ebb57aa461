//! ARM (A32) and Thumb-2 branch encoding and decoding.
//!
//! 32-bit ARM caches mix both instruction sets. A branch target's mode is
//! carried in bit 0 of its address: set for Thumb, clear for ARM.

use crate::util::sign_extend;

/// Reach of an A32 B/BL/BLX immediate in either direction.
pub const ARM_BRANCH_RANGE: i64 = 32 * 1024 * 1024;

/// Reach of a Thumb-2 BL/BLX/B.W immediate in either direction.
pub const THUMB_BRANCH_RANGE: i64 = 16 * 1024 * 1024;

/// Condition field value for "always".
pub const COND_AL: u32 = 0xE;

/// A32 immediate branch forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmBranch {
    /// `B<c> label`
    B,
    /// `BL<c> label`
    Bl,
    /// `BLX label`, switching to Thumb
    Blx,
}

/// Thumb-2 32-bit immediate branch forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbBranch {
    /// `B.W label` (encoding T4)
    BW,
    /// `BL label`
    Bl,
    /// `BLX label`, switching to ARM
    Blx,
}

// =============================================================================
// A32
// =============================================================================

/// Classifies an A32 immediate branch.
pub fn arm_branch_kind(instr: u32) -> Option<ArmBranch> {
    if instr & 0xFE00_0000 == 0xFA00_0000 {
        return Some(ArmBranch::Blx);
    }
    if instr >> 28 == 0xF {
        return None;
    }
    match instr & 0x0F00_0000 {
        0x0A00_0000 => Some(ArmBranch::B),
        0x0B00_0000 => Some(ArmBranch::Bl),
        _ => None,
    }
}

/// Decodes an A32 immediate branch at `pc`. A `BLX` target has bit 0 set.
pub fn decode_arm_branch(instr: u32, pc: u64) -> u64 {
    let imm24 = (instr & 0x00FF_FFFF) as u64;
    let base = pc.wrapping_add(8);
    if arm_branch_kind(instr) == Some(ArmBranch::Blx) {
        let h = ((instr >> 24) & 1) as u64;
        let offset = sign_extend((imm24 << 2) | (h << 1), 26);
        base.wrapping_add(offset as u64) | 1
    } else {
        let offset = sign_extend(imm24 << 2, 26);
        base.wrapping_add(offset as u64)
    }
}

/// Encodes an A32 immediate branch of the given kind.
///
/// `cond` is ignored for `BLX`. `target` carries the mode bit for `BLX`;
/// it is not checked here. Returns `None` when the target is out of reach
/// or misaligned for the form.
pub fn encode_arm_branch(kind: ArmBranch, cond: u32, pc: u64, target: u64) -> Option<u32> {
    let target = target & !1;
    let offset = target.wrapping_sub(pc.wrapping_add(8)) as i64;
    if !(-ARM_BRANCH_RANGE..ARM_BRANCH_RANGE).contains(&offset) {
        return None;
    }

    match kind {
        ArmBranch::Blx => {
            if offset & 1 != 0 {
                return None;
            }
            let h = ((offset >> 1) & 1) as u32;
            let imm24 = ((offset >> 2) & 0x00FF_FFFF) as u32;
            Some(0xFA00_0000 | (h << 24) | imm24)
        }
        ArmBranch::B | ArmBranch::Bl => {
            if offset & 0b11 != 0 {
                return None;
            }
            let op = if kind == ArmBranch::Bl { 0x0B00_0000 } else { 0x0A00_0000 };
            let imm24 = ((offset >> 2) & 0x00FF_FFFF) as u32;
            Some(((cond & 0xF) << 28) | op | imm24)
        }
    }
}

/// Condition field of an A32 instruction.
#[inline]
pub fn arm_cond(instr: u32) -> u32 {
    instr >> 28
}

// =============================================================================
// Thumb-2
// =============================================================================

/// Returns true if the halfword starts a 32-bit Thumb instruction.
#[inline]
pub fn is_thumb32(hw1: u16) -> bool {
    matches!(hw1 >> 11, 0b11101 | 0b11110 | 0b11111)
}

/// Classifies a 32-bit Thumb immediate branch.
pub fn thumb_branch_kind(hw1: u16, hw2: u16) -> Option<ThumbBranch> {
    if hw1 & 0xF800 != 0xF000 {
        return None;
    }
    match hw2 & 0xD000 {
        0xD000 => Some(ThumbBranch::Bl),
        0xC000 if hw2 & 1 == 0 => Some(ThumbBranch::Blx),
        0x9000 => Some(ThumbBranch::BW),
        _ => None,
    }
}

/// Decodes a 32-bit Thumb branch at `pc`. Targets that stay in Thumb have
/// bit 0 set; a `BLX` target is ARM code and has it clear.
pub fn decode_thumb_branch(hw1: u16, hw2: u16, pc: u64) -> u64 {
    let s = ((hw1 >> 10) & 1) as u64;
    let imm10 = (hw1 & 0x3FF) as u64;
    let j1 = ((hw2 >> 13) & 1) as u64;
    let j2 = ((hw2 >> 11) & 1) as u64;
    let imm11 = (hw2 & 0x7FF) as u64;
    let i1 = (j1 ^ s) ^ 1;
    let i2 = (j2 ^ s) ^ 1;

    let imm = (s << 24) | (i1 << 23) | (i2 << 22) | (imm10 << 12) | (imm11 << 1);
    let offset = sign_extend(imm, 25) as u64;

    if thumb_branch_kind(hw1, hw2) == Some(ThumbBranch::Blx) {
        (pc.wrapping_add(4) & !3).wrapping_add(offset)
    } else {
        pc.wrapping_add(4).wrapping_add(offset) | 1
    }
}

/// Encodes a 32-bit Thumb branch of the given kind as `(hw1, hw2)`.
///
/// Returns `None` when the target is out of reach or misaligned for the
/// form.
pub fn encode_thumb_branch(kind: ThumbBranch, pc: u64, target: u64) -> Option<(u16, u16)> {
    let target = target & !1;
    let base = match kind {
        ThumbBranch::Blx => pc.wrapping_add(4) & !3,
        _ => pc.wrapping_add(4),
    };
    let offset = target.wrapping_sub(base) as i64;
    if !(-THUMB_BRANCH_RANGE..THUMB_BRANCH_RANGE).contains(&offset) {
        return None;
    }
    let misaligned = match kind {
        ThumbBranch::Blx => offset & 0b11 != 0,
        _ => offset & 1 != 0,
    };
    if misaligned {
        return None;
    }

    let s = ((offset >> 24) & 1) as u16;
    let i1 = ((offset >> 23) & 1) as u16;
    let i2 = ((offset >> 22) & 1) as u16;
    let imm10 = ((offset >> 12) & 0x3FF) as u16;
    let imm11 = ((offset >> 1) & 0x7FF) as u16;
    let j1 = (i1 ^ 1) ^ s;
    let j2 = (i2 ^ 1) ^ s;

    let op = match kind {
        ThumbBranch::Bl => 0xD000,
        ThumbBranch::Blx => 0xC000,
        ThumbBranch::BW => 0x9000,
    };

    let hw1 = 0xF000 | (s << 10) | imm10;
    let hw2 = op | (j1 << 13) | (j2 << 11) | imm11;
    Some((hw1, hw2))
}
