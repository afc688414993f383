//! AArch64 (ARM64) instruction encoding primitives
//!
//! Lighter than the RISC-V encoder, same rationale as the x86-64 module:
//! ARM64 shares the stub/lowering surface through the same traits, with its
//! own fixed-32-bit-word encoding.

pub mod reg {
    pub const X0: u8 = 0;
    pub const X1: u8 = 1;
    pub const X2: u8 = 2;
    pub const X3: u8 = 3;
    pub const X9: u8 = 9;
    pub const X10: u8 = 10;
    pub const FP: u8 = 29;
    pub const LR: u8 = 30;
    /// Encodes as register 31 in load/store and add/sub immediate forms.
    pub const SP: u8 = 31;
    pub const XZR: u8 = 31;
}

pub fn movz(rd: u8, imm16: u16, shift: u32) -> u32 {
    0xD2800000 | (((shift / 16) & 0x3) << 21) | ((imm16 as u32) << 5) | rd as u32
}

pub fn movk(rd: u8, imm16: u16, shift: u32) -> u32 {
    0xF2800000 | (((shift / 16) & 0x3) << 21) | ((imm16 as u32) << 5) | rd as u32
}

/// Materialize a 64-bit constant in at most 4 chunks: one `MOVZ` plus a
/// `MOVK` for every non-zero 16-bit chunk above it.
pub fn emit_mov_imm64(rd: u8, value: u64, mut emit: impl FnMut(u32)) {
    let chunks = [
        (value & 0xFFFF) as u16,
        ((value >> 16) & 0xFFFF) as u16,
        ((value >> 32) & 0xFFFF) as u16,
        ((value >> 48) & 0xFFFF) as u16,
    ];
    emit(movz(rd, chunks[0], 0));
    for (i, &chunk) in chunks.iter().enumerate().skip(1) {
        if chunk != 0 {
            emit(movk(rd, chunk, (i as u32) * 16));
        }
    }
}

pub fn add(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8B000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}
pub fn sub(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}
pub fn and(rd: u8, rn: u8, rm: u8) -> u32 {
    0x8A000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}
pub fn orr(rd: u8, rn: u8, rm: u8) -> u32 {
    0xAA000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}
pub fn eor(rd: u8, rn: u8, rm: u8) -> u32 {
    0xCA000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}
/// `sub rd, rn, #imm12` (immediate form, no shift).
pub fn sub_imm(rd: u8, rn: u8, imm12: u32) -> u32 {
    0xD1000000 | ((imm12 & 0xFFF) << 10) | ((rn as u32) << 5) | rd as u32
}
/// `add rd, rn, #imm12` (immediate form, no shift).
pub fn add_imm(rd: u8, rn: u8, imm12: u32) -> u32 {
    0x91000000 | ((imm12 & 0xFFF) << 10) | ((rn as u32) << 5) | rd as u32
}

pub fn mul(rd: u8, rn: u8, rm: u8) -> u32 {
    // MADD rd, rn, rm, xzr
    0x9B000000 | ((rm as u32) << 16) | ((reg::XZR as u32) << 10) | ((rn as u32) << 5) | rd as u32
}
/// `cmp rn, rm` (alias for `SUBS XZR, Rn, Rm`).
pub fn cmp(rn: u8, rm: u8) -> u32 {
    0xEB000000 | ((rm as u32) << 16) | ((rn as u32) << 5) | reg::XZR as u32
}

/// `ldr xt, [xn, #imm]`, unsigned offset scaled by 8 (`imm` must be a
/// non-negative multiple of 8, up to `32760`).
pub fn ldr_imm(rt: u8, rn: u8, imm: u32) -> u32 {
    debug_assert!(imm % 8 == 0);
    0xF9400000 | (((imm / 8) & 0xFFF) << 10) | ((rn as u32) << 5) | rt as u32
}

/// `str xt, [xn, #imm]`, unsigned offset scaled by 8.
pub fn str_imm(rt: u8, rn: u8, imm: u32) -> u32 {
    debug_assert!(imm % 8 == 0);
    0xF9000000 | (((imm / 8) & 0xFFF) << 10) | ((rn as u32) << 5) | rt as u32
}

/// Condition codes for `B.cond`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Ltu => Cond::Geu,
            Cond::Geu => Cond::Ltu,
        }
    }
    fn bits(self) -> u32 {
        match self {
            Cond::Eq => 0b0000,
            Cond::Ne => 0b0001,
            Cond::Ge => 0b1010,
            Cond::Lt => 0b1011,
            Cond::Geu => 0b0010,
            Cond::Ltu => 0b0011,
        }
    }
}

/// `B.cond` with a word-granularity `imm19` displacement.
pub fn b_cond(cond: Cond, imm19: i32) -> u32 {
    0x54000000 | (((imm19 as u32) & 0x7FFFF) << 5) | cond.bits()
}

/// `B` (unconditional), `imm26` word-granularity displacement.
pub fn b(imm26: i32) -> u32 {
    0x14000000 | ((imm26 as u32) & 0x3FFFFFF)
}

/// `BL`, `imm26` word-granularity displacement.
pub fn bl(imm26: i32) -> u32 {
    0x94000000 | ((imm26 as u32) & 0x3FFFFFF)
}

/// `BR xn` (indirect branch).
pub fn br(rn: u8) -> u32 {
    0xD61F0000 | ((rn as u32) << 5)
}

/// `BLR xn` (indirect call).
pub fn blr(rn: u8) -> u32 {
    0xD63F0000 | ((rn as u32) << 5)
}

/// `RET` (defaults to `x30`/LR).
pub fn ret() -> u32 {
    0xD65F0000 | ((reg::LR as u32) << 5)
}

/// Largest displacement (in bytes) `B.cond`'s 19-bit word-granularity
/// immediate can directly reach.
pub const B_COND_RANGE_BYTES: i32 = (1 << 20) / 2;
/// Largest displacement (in bytes) `B`/`BL`'s 26-bit word-granularity
/// immediate can directly reach.
pub const B_RANGE_BYTES: i32 = (1 << 27) / 2;

/// `sdiv rd, rn, rm`.
pub fn sdiv(rd: u8, rn: u8, rm: u8) -> u32 {
    0x9AC00C00 | ((rm as u32) << 16) | ((rn as u32) << 5) | rd as u32
}

/// `cbnz rt, imm19` (word-granularity displacement).
pub fn cbnz(rt: u8, imm19: i32) -> u32 {
    0xB5000000 | (((imm19 as u32) & 0x7FFFF) << 5) | rt as u32
}

/// `cbz rt, imm19`.
pub fn cbz(rt: u8, imm19: i32) -> u32 {
    0xB4000000 | (((imm19 as u32) & 0x7FFFF) << 5) | rt as u32
}

/// `ldr dt, [xn, #imm]` - double-precision float load, unsigned offset
/// scaled by 8.
pub fn ldr_d_imm(dt: u8, rn: u8, imm: u32) -> u32 {
    debug_assert!(imm % 8 == 0);
    0xFD400000 | (((imm / 8) & 0xFFF) << 10) | ((rn as u32) << 5) | dt as u32
}

/// `str dt, [xn, #imm]`.
pub fn str_d_imm(dt: u8, rn: u8, imm: u32) -> u32 {
    debug_assert!(imm % 8 == 0);
    0xFD000000 | (((imm / 8) & 0xFFF) << 10) | ((rn as u32) << 5) | dt as u32
}

/// `fmov dd, dn` - float-to-float move.
pub fn fmov_d(dd: u8, dn: u8) -> u32 {
    0x1E604000 | ((dn as u32) << 5) | dd as u32
}

/// `fadd`/`fmul dd, dn, dm`, used by the scalar fallback for the scoped
/// vector lowering.
pub fn fadd_d(dd: u8, dn: u8, dm: u8) -> u32 {
    0x1E602800 | ((dm as u32) << 16) | ((dn as u32) << 5) | dd as u32
}
pub fn fmul_d(dd: u8, dn: u8, dm: u8) -> u32 {
    0x1E600800 | ((dm as u32) << 16) | ((dn as u32) << 5) | dd as u32
}
pub fn fsub_d(dd: u8, dn: u8, dm: u8) -> u32 {
    0x1E603800 | ((dm as u32) << 16) | ((dn as u32) << 5) | dd as u32
}

/// `ldxr xt, [xn]` - exclusive load, first half of a CAS/RMW loop.
pub fn ldxr(rt: u8, rn: u8) -> u32 {
    0xC85F7C00 | ((rn as u32) << 5) | rt as u32
}

/// `stxr ws, xt, [xn]` - exclusive store; `ws` set to 0 on success.
pub fn stxr(ws: u8, rt: u8, rn: u8) -> u32 {
    0xC8007C00 | ((ws as u32) << 16) | ((rn as u32) << 5) | rt as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_imm64_emits_one_chunk_for_small_values() {
        let mut words = Vec::new();
        emit_mov_imm64(reg::X0, 42, |w| words.push(w));
        assert_eq!(words.len(), 1);
    }

    #[test]
    fn mov_imm64_emits_all_chunks_for_large_values() {
        let mut words = Vec::new();
        emit_mov_imm64(reg::X0, 0xFFFF_FFFF_FFFF_FFFF, |w| words.push(w));
        assert_eq!(words.len(), 4);
    }

    #[test]
    fn cond_invert_is_involution() {
        for c in [Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Ltu, Cond::Geu] {
            assert_eq!(c.invert().invert(), c);
        }
    }

    #[test]
    fn ret_matches_known_encoding() {
        assert_eq!(ret(), 0xD65F03C0);
    }

    #[test]
    fn sdiv_and_cbnz_are_nonzero() {
        assert_ne!(sdiv(0, 1, 2), 0);
        assert_ne!(cbnz(3, 4), 0);
    }

    #[test]
    fn ldxr_stxr_differ() {
        assert_ne!(ldxr(0, 1), stxr(2, 0, 1));
    }
}
