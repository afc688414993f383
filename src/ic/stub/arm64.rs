//! ARM64 (AArch64) IC stub generator.
//!
//! Same stub shapes as the RISC-V reference backend, built on
//! `crate::arch::arm64`'s fixed-32-bit-word encoder. AAPCS64 ABI: `x0` =
//! object, `x1` = name (unused on the fast path), `x2` = site/cache id,
//! `x0` = return value.

use crate::abi::ObjectLayout;
use crate::arch::arm64::{self, reg};
use crate::error::AeroError;
use crate::exec::ExecutableBuffer;
use crate::ic::cache::{MethodCacheEntry, PropertyCacheEntry};
use crate::ic::stub::{MissHandlers, StubGenerator};

const SCRATCH: u8 = reg::X9;
const SCRATCH2: u8 = reg::X10;
const SHAPE_TMP: u8 = 11;

struct Asm {
    words: Vec<u32>,
}

impl Asm {
    fn new() -> Asm {
        Asm { words: Vec::new() }
    }
    fn push(&mut self, word: u32) {
        self.words.push(word);
    }
    fn mov_imm64(&mut self, rd: u8, value: u64) {
        arm64::emit_mov_imm64(rd, value, |w| self.words.push(w));
    }
    fn bcond_placeholder(&mut self) -> usize {
        let idx = self.words.len();
        self.words.push(0);
        idx
    }
    fn patch_bcond(&mut self, idx: usize, cond: arm64::Cond) {
        let disp_words = (self.words.len() - idx) as i32;
        self.words[idx] = arm64::b_cond(cond, disp_words);
    }
    fn flush(self, buf: &mut ExecutableBuffer) -> Result<(), AeroError> {
        for word in self.words {
            buf.emit32(word)?;
        }
        Ok(())
    }
}

fn emit_property_hit(asm: &mut Asm, entry: &PropertyCacheEntry) {
    // `LDR`'s unsigned-offset encoding only represents multiples of 8,
    // enforced by `ldr_imm`'s own debug assertion; both paths below land
    // on a multiple of 8 since `ObjectLayout::SLOT_WIDTH` is 8.
    if entry.is_inline {
        asm.push(arm64::ldr_imm(reg::X0, reg::X0, entry.slot_offset));
    } else {
        asm.push(arm64::ldr_imm(SCRATCH, reg::X0, ObjectLayout::SLOTS_PTR_OFFSET));
        let byte_offset = entry.slot_offset * ObjectLayout::SLOT_WIDTH;
        asm.push(arm64::ldr_imm(reg::X0, SCRATCH, byte_offset));
    }
    asm.push(arm64::ret());
}

fn emit_tail_branch(asm: &mut Asm, target: u64) {
    asm.mov_imm64(SCRATCH, target);
    asm.push(arm64::br(SCRATCH));
}

/// ARM64 IC stub generator.
pub struct Aarch64;

impl StubGenerator for Aarch64 {
    fn emit_property_mono(
        buf: &mut ExecutableBuffer,
        entry: &PropertyCacheEntry,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(arm64::ldr_imm(SHAPE_TMP, reg::X0, ObjectLayout::SHAPE_ID_OFFSET));
        asm.mov_imm64(SCRATCH, entry.shape_id);
        asm.push(arm64::cmp(SHAPE_TMP, SCRATCH));
        let miss = asm.bcond_placeholder();
        emit_property_hit(&mut asm, entry);
        asm.patch_bcond(miss, arm64::Cond::Ne);
        asm.mov_imm64(reg::X2, site_id);
        emit_tail_branch(&mut asm, handlers.property_miss);
        asm.flush(buf)
    }

    fn emit_property_poly(
        buf: &mut ExecutableBuffer,
        entries: &[PropertyCacheEntry],
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(arm64::ldr_imm(SHAPE_TMP, reg::X0, ObjectLayout::SHAPE_ID_OFFSET));
        for entry in entries {
            asm.mov_imm64(SCRATCH, entry.shape_id);
            asm.push(arm64::cmp(SHAPE_TMP, SCRATCH));
            let next = asm.bcond_placeholder();
            emit_property_hit(&mut asm, entry);
            asm.patch_bcond(next, arm64::Cond::Ne);
        }
        asm.mov_imm64(reg::X2, site_id);
        emit_tail_branch(&mut asm, handlers.property_miss);
        asm.flush(buf)
    }

    fn emit_property_mega(
        buf: &mut ExecutableBuffer,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.mov_imm64(reg::X2, site_id);
        emit_tail_branch(&mut asm, handlers.property_miss);
        asm.flush(buf)
    }

    fn emit_method_mono(
        buf: &mut ExecutableBuffer,
        entry: &MethodCacheEntry,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(arm64::ldr_imm(SHAPE_TMP, reg::X0, ObjectLayout::SHAPE_ID_OFFSET));
        asm.mov_imm64(SCRATCH, entry.shape_id);
        asm.push(arm64::cmp(SHAPE_TMP, SCRATCH));
        let miss = asm.bcond_placeholder();
        emit_tail_branch(&mut asm, entry.code_address as u64);
        asm.patch_bcond(miss, arm64::Cond::Ne);
        asm.mov_imm64(reg::X2, site_id);
        emit_tail_branch(&mut asm, handlers.method_miss);
        asm.flush(buf)
    }

    fn emit_method_poly(
        buf: &mut ExecutableBuffer,
        entries: &[MethodCacheEntry],
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(arm64::ldr_imm(SHAPE_TMP, reg::X0, ObjectLayout::SHAPE_ID_OFFSET));
        for entry in entries {
            asm.mov_imm64(SCRATCH, entry.shape_id);
            asm.push(arm64::cmp(SHAPE_TMP, SCRATCH));
            let next = asm.bcond_placeholder();
            emit_tail_branch(&mut asm, entry.code_address as u64);
            asm.patch_bcond(next, arm64::Cond::Ne);
        }
        asm.mov_imm64(reg::X2, site_id);
        emit_tail_branch(&mut asm, handlers.method_miss);
        asm.flush(buf)
    }

    fn emit_method_mega(
        buf: &mut ExecutableBuffer,
        table_ptr: u64,
        mask: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(arm64::sub_imm(reg::SP, reg::SP, 32));
        asm.push(arm64::str_imm(reg::X0, reg::SP, 0));
        asm.push(arm64::str_imm(reg::X1, reg::SP, 8));
        asm.push(arm64::str_imm(reg::LR, reg::SP, 16));
        asm.mov_imm64(reg::X2, table_ptr);
        asm.mov_imm64(reg::X3, mask);
        asm.mov_imm64(SCRATCH, handlers.megamorphic_method_miss);
        asm.push(arm64::blr(SCRATCH));
        asm.push(arm64::orr(SCRATCH2, reg::XZR, reg::X0)); // mov scratch2, x0
        asm.push(arm64::ldr_imm(reg::X0, reg::SP, 0));
        asm.push(arm64::ldr_imm(reg::X1, reg::SP, 8));
        asm.push(arm64::ldr_imm(reg::LR, reg::SP, 16));
        asm.push(arm64::add_imm(reg::SP, reg::SP, 32));
        asm.push(arm64::br(SCRATCH2));
        asm.flush(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handlers() -> MissHandlers {
        MissHandlers {
            property_miss: 0x1000,
            method_miss: 0x2000,
            megamorphic_method_miss: 0x3000,
        }
    }

    fn fresh_buf() -> ExecutableBuffer {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(4096).unwrap();
        buf
    }

    #[test]
    fn mono_property_stub_emits_nonempty_code() {
        let mut buf = fresh_buf();
        let entry = PropertyCacheEntry { shape_id: 0xAA, slot_offset: 16, is_inline: true, hit_count: 0 };
        Aarch64::emit_property_mono(&mut buf, &entry, 1, &handlers()).unwrap();
        assert!(buf.len() > 0);
        assert_eq!(buf.len() % 4, 0);
    }

    #[test]
    fn poly_property_stub_scales_with_entries() {
        let mut one_buf = fresh_buf();
        let one = [PropertyCacheEntry { shape_id: 1, slot_offset: 0, is_inline: true, hit_count: 0 }];
        Aarch64::emit_property_poly(&mut one_buf, &one, 1, &handlers()).unwrap();

        let mut two_buf = fresh_buf();
        let two = [
            PropertyCacheEntry { shape_id: 1, slot_offset: 0, is_inline: true, hit_count: 0 },
            PropertyCacheEntry { shape_id: 2, slot_offset: 8, is_inline: false, hit_count: 0 },
        ];
        Aarch64::emit_property_poly(&mut two_buf, &two, 1, &handlers()).unwrap();
        assert!(two_buf.len() > one_buf.len());
    }

    #[test]
    fn method_mega_stub_emits_frame_prologue_and_epilogue() {
        let mut buf = fresh_buf();
        Aarch64::emit_method_mega(&mut buf, 0x4000, 0x3F, &handlers()).unwrap();
        assert!(buf.len() > 0);
    }
}
