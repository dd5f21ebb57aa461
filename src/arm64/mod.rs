//! ARM64 instruction encoding and decoding.
//!
//! This module provides the handful of AArch64 instructions needed to
//! recognise stub shapes and to patch call sites.

use crate::util::sign_extend;

/// Reach of a B/BL immediate in either direction.
pub const BRANCH_RANGE: i64 = 128 * 1024 * 1024;

/// Scratch registers used by stubs.
pub const X16: u8 = 16;
/// Second stub scratch register.
pub const X17: u8 = 17;

// =============================================================================
// Instruction Detection
// =============================================================================

/// Returns true if the instruction is ADRP.
#[inline]
pub fn is_adrp(instr: u32) -> bool {
    (instr & 0x9F00_0000) == 0x9000_0000
}

/// Returns true if the instruction is a 64-bit ADD (immediate).
#[inline]
pub fn is_add_imm(instr: u32) -> bool {
    (instr & 0xFFC0_0000) == 0x9100_0000
}

/// Returns true if the instruction is a 64-bit LDR (unsigned immediate).
#[inline]
pub fn is_ldr_x_imm(instr: u32) -> bool {
    (instr & 0xFFC0_0000) == 0xF940_0000
}

/// Returns true if the instruction is a 32-bit LDR (unsigned immediate).
#[inline]
pub fn is_ldr_w_imm(instr: u32) -> bool {
    (instr & 0xFFC0_0000) == 0xB940_0000
}

/// Returns true if the instruction is a 64-bit STR (unsigned immediate).
#[inline]
pub fn is_str_x_imm(instr: u32) -> bool {
    (instr & 0xFFC0_0000) == 0xF900_0000
}

/// Returns true if the instruction is STP (pre-index).
#[inline]
pub fn is_stp_pre(instr: u32) -> bool {
    (instr & 0x7FC0_0000) == 0x2980_0000
}

/// Returns true if the instruction is LDP (post-index).
#[inline]
pub fn is_ldp_post(instr: u32) -> bool {
    (instr & 0x7FC0_0000) == 0x28C0_0000
}

/// Returns true if the instruction is MOV to or from SP (ADD #0).
#[inline]
pub fn is_mov_sp(instr: u32) -> bool {
    (instr & 0x7F3F_FC00) == 0x1100_0000
}

/// Returns true if the instruction is BR.
#[inline]
pub fn is_br(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_0000
}

/// Returns true if the instruction is B or BL (branch).
#[inline]
pub fn is_branch(instr: u32) -> bool {
    (instr & 0x7C00_0000) == 0x1400_0000
}

/// Returns true if the instruction is BL (branch with link).
#[inline]
pub fn is_bl(instr: u32) -> bool {
    (instr & 0xFC00_0000) == 0x9400_0000
}

/// Returns true if the instruction is BRAA.
#[inline]
pub fn is_braa(instr: u32) -> bool {
    (instr & 0xFFFF_FC00) == 0xD71F_0800
}

/// Returns true if the instruction is BRAAZ.
#[inline]
pub fn is_braaz(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_081F
}

/// Returns true for any authenticated register branch (BRAA, BRAB, BRAAZ,
/// BRABZ).
#[inline]
pub fn is_auth_branch(instr: u32) -> bool {
    (instr & 0xFEFF_F800) == 0xD61F_0800
}

/// Returns true for any register branch, plain or authenticated.
#[inline]
pub fn is_register_branch(instr: u32) -> bool {
    (instr & 0xFE9F_F000) == 0xD61F_0000
}

// =============================================================================
// Instruction Decoding
// =============================================================================

/// Destination register of ADRP, ADD, LDR and friends.
#[inline]
pub fn rd(instr: u32) -> u8 {
    (instr & 0x1F) as u8
}

/// Base register of ADD, LDR, STR and register branches.
#[inline]
pub fn rn(instr: u32) -> u8 {
    ((instr >> 5) & 0x1F) as u8
}

/// Decodes an ADRP instruction, returning the target page.
pub fn decode_adrp(instr: u32, pc: u64) -> u64 {
    let immlo = ((instr >> 29) & 0x3) as u64;
    let immhi = ((instr >> 5) & 0x7_FFFF) as u64;
    let imm = sign_extend((immhi << 2) | immlo, 21);
    (pc & !0xFFF).wrapping_add((imm << 12) as u64)
}

/// Decodes an ADD (immediate) instruction, returning the immediate value.
pub fn decode_add_imm(instr: u32) -> u64 {
    let imm12 = ((instr >> 10) & 0xFFF) as u64;
    if (instr >> 22) & 0x3 == 1 {
        imm12 << 12
    } else {
        imm12
    }
}

/// Decodes an LDR/STR (unsigned immediate) instruction, returning the
/// scaled offset.
pub fn decode_ldr_offset(instr: u32) -> u64 {
    let imm12 = ((instr >> 10) & 0xFFF) as u64;
    let size = (instr >> 30) & 0x3;
    imm12 << size
}

/// Decodes a B/BL instruction, returning the target address.
pub fn decode_branch(instr: u32, pc: u64) -> u64 {
    let offset = sign_extend((instr & 0x03FF_FFFF) as u64, 26) << 2;
    pc.wrapping_add(offset as u64)
}

// =============================================================================
// Instruction Encoding
// =============================================================================

/// Returns true if a B/BL at `pc` can reach `target`.
#[inline]
pub fn branch_in_range(pc: u64, target: u64) -> bool {
    let delta = target.wrapping_sub(pc) as i64;
    delta & 0b11 == 0 && (-BRANCH_RANGE..BRANCH_RANGE).contains(&delta)
}

/// Encodes a B instruction, or `None` if the target is out of reach.
pub fn encode_b(pc: u64, target: u64) -> Option<u32> {
    branch_in_range(pc, target).then(|| 0x1400_0000 | branch_imm26(pc, target))
}

/// Encodes a BL instruction, or `None` if the target is out of reach.
pub fn encode_bl(pc: u64, target: u64) -> Option<u32> {
    branch_in_range(pc, target).then(|| 0x9400_0000 | branch_imm26(pc, target))
}

/// Re-targets an existing B or BL, keeping its link bit.
pub fn retarget_branch(instr: u32, pc: u64, target: u64) -> Option<u32> {
    if is_bl(instr) {
        encode_bl(pc, target)
    } else {
        encode_b(pc, target)
    }
}

#[inline]
fn branch_imm26(pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    ((offset >> 2) & 0x03FF_FFFF) as u32
}

/// Encodes an ADRP instruction.
pub fn encode_adrp(rd: u8, pc: u64, target: u64) -> u32 {
    let delta = (target & !0xFFF).wrapping_sub(pc & !0xFFF) as i64;
    let imm = (delta >> 12) as u32;

    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_FFFF) << 5;

    0x9000_0000 | immlo | immhi | (rd as u32)
}

/// Encodes a 64-bit ADD (immediate) instruction.
pub fn encode_add_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    0x9100_0000 | ((imm & 0xFFF) << 10) | ((rn as u32) << 5) | (rd as u32)
}

/// Encodes a 64-bit LDR (unsigned immediate). `offset` is in bytes and
/// must be a multiple of 8.
pub fn encode_ldr_x(rt: u8, rn: u8, offset: u64) -> u32 {
    let imm12 = ((offset >> 3) & 0xFFF) as u32;
    0xF940_0000 | (imm12 << 10) | ((rn as u32) << 5) | (rt as u32)
}

/// Encodes a 32-bit LDR (unsigned immediate). `offset` is in bytes and
/// must be a multiple of 4.
pub fn encode_ldr_w(rt: u8, rn: u8, offset: u64) -> u32 {
    let imm12 = ((offset >> 2) & 0xFFF) as u32;
    0xB940_0000 | (imm12 << 10) | ((rn as u32) << 5) | (rt as u32)
}

/// Encodes a BR instruction.
pub fn encode_br(rn: u8) -> u32 {
    0xD61F_0000 | ((rn as u32) << 5)
}

/// Encodes a BRAA instruction.
pub fn encode_braa(rn: u8, rm: u8) -> u32 {
    0xD71F_0800 | ((rn as u32) << 5) | (rm as u32)
}

/// Encodes a BRAAZ instruction.
pub fn encode_braaz(rn: u8) -> u32 {
    0xD61F_081F | ((rn as u32) << 5)
}
