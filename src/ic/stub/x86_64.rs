//! x86-64 IC stub generator.
//!
//! Same stub shapes as the RISC-V reference backend, built on
//! `crate::arch::x86_64`'s byte-oriented encoder. SysV ABI: `rdi` = object,
//! `rsi` = name (unused on the fast path), `rdx` = site/cache id, `rax` =
//! return value.

use crate::abi::ObjectLayout;
use crate::arch::x86_64::{self, reg};
use crate::error::AeroError;
use crate::exec::ExecutableBuffer;
use crate::ic::cache::{MethodCacheEntry, PropertyCacheEntry};
use crate::ic::stub::{MissHandlers, StubGenerator};

const SCRATCH: u8 = reg::R10;
const SCRATCH2: u8 = reg::R11;

/// Byte-level assembler mirroring `riscv64::Asm`: buffers bytes in memory
/// so forward branch displacements are known before anything is written
/// to executable memory.
struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    fn new() -> Asm {
        Asm { bytes: Vec::new() }
    }
    fn push(&mut self, bytes: Vec<u8>) {
        self.bytes.extend_from_slice(&bytes);
    }
    fn here(&self) -> usize {
        self.bytes.len()
    }
    /// Emit a placeholder `Jcc rel32` and return the offset of its
    /// displacement field.
    fn jcc_placeholder(&mut self, cond: x86_64::Cond) -> usize {
        self.push(x86_64::jcc_rel32(cond, 0));
        self.bytes.len() - 4
    }
    fn patch_rel32(&mut self, disp_offset: usize) {
        let target = self.bytes.len() as i32;
        let rel = target - (disp_offset as i32 + 4);
        self.bytes[disp_offset..disp_offset + 4].copy_from_slice(&rel.to_le_bytes());
    }
    fn flush(self, buf: &mut ExecutableBuffer) -> Result<(), AeroError> {
        buf.emit_bytes(&self.bytes)?;
        Ok(())
    }
}

fn emit_property_hit(asm: &mut Asm, entry: &PropertyCacheEntry) {
    if entry.is_inline {
        asm.push(x86_64::load_disp(reg::RAX, reg::RDI, entry.slot_offset as i32));
    } else {
        asm.push(x86_64::load_disp(SCRATCH, reg::RDI, ObjectLayout::SLOTS_PTR_OFFSET as i32));
        let byte_offset = entry.slot_offset * ObjectLayout::SLOT_WIDTH;
        asm.push(x86_64::load_disp(reg::RAX, SCRATCH, byte_offset as i32));
    }
    asm.push(x86_64::ret());
}

fn emit_tail_jump(asm: &mut Asm, target: u64) {
    asm.push(x86_64::mov_imm64(SCRATCH, target));
    asm.push(x86_64::jmp_reg(SCRATCH));
}

/// x86-64 IC stub generator.
pub struct X86_64;

impl StubGenerator for X86_64 {
    fn emit_property_mono(
        buf: &mut ExecutableBuffer,
        entry: &PropertyCacheEntry,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(x86_64::load_disp(reg::RAX, reg::RDI, ObjectLayout::SHAPE_ID_OFFSET as i32));
        asm.push(x86_64::mov_imm64(SCRATCH, entry.shape_id));
        asm.push(x86_64::cmp_reg(reg::RAX, SCRATCH));
        let miss = asm.jcc_placeholder(x86_64::Cond::Ne);
        emit_property_hit(&mut asm, entry);
        asm.patch_rel32(miss);
        asm.push(x86_64::mov_imm64(reg::RDX, site_id));
        emit_tail_jump(&mut asm, handlers.property_miss);
        asm.flush(buf)
    }

    fn emit_property_poly(
        buf: &mut ExecutableBuffer,
        entries: &[PropertyCacheEntry],
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(x86_64::load_disp(reg::RAX, reg::RDI, ObjectLayout::SHAPE_ID_OFFSET as i32));
        asm.push(x86_64::mov_reg(SCRATCH2, reg::RAX));
        for entry in entries {
            asm.push(x86_64::mov_imm64(SCRATCH, entry.shape_id));
            asm.push(x86_64::cmp_reg(SCRATCH2, SCRATCH));
            let next = asm.jcc_placeholder(x86_64::Cond::Ne);
            emit_property_hit(&mut asm, entry);
            asm.patch_rel32(next);
        }
        asm.push(x86_64::mov_imm64(reg::RDX, site_id));
        emit_tail_jump(&mut asm, handlers.property_miss);
        asm.flush(buf)
    }

    fn emit_property_mega(
        buf: &mut ExecutableBuffer,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(x86_64::mov_imm64(reg::RDX, site_id));
        emit_tail_jump(&mut asm, handlers.property_miss);
        asm.flush(buf)
    }

    fn emit_method_mono(
        buf: &mut ExecutableBuffer,
        entry: &MethodCacheEntry,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(x86_64::load_disp(reg::RAX, reg::RDI, ObjectLayout::SHAPE_ID_OFFSET as i32));
        asm.push(x86_64::mov_imm64(SCRATCH, entry.shape_id));
        asm.push(x86_64::cmp_reg(reg::RAX, SCRATCH));
        let miss = asm.jcc_placeholder(x86_64::Cond::Ne);
        emit_tail_jump(&mut asm, entry.code_address as u64);
        asm.patch_rel32(miss);
        asm.push(x86_64::mov_imm64(reg::RDX, site_id));
        emit_tail_jump(&mut asm, handlers.method_miss);
        asm.flush(buf)
    }

    fn emit_method_poly(
        buf: &mut ExecutableBuffer,
        entries: &[MethodCacheEntry],
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(x86_64::load_disp(reg::RAX, reg::RDI, ObjectLayout::SHAPE_ID_OFFSET as i32));
        asm.push(x86_64::mov_reg(SCRATCH2, reg::RAX));
        for entry in entries {
            asm.push(x86_64::mov_imm64(SCRATCH, entry.shape_id));
            asm.push(x86_64::cmp_reg(SCRATCH2, SCRATCH));
            let next = asm.jcc_placeholder(x86_64::Cond::Ne);
            emit_tail_jump(&mut asm, entry.code_address as u64);
            asm.patch_rel32(next);
        }
        asm.push(x86_64::mov_imm64(reg::RDX, site_id));
        emit_tail_jump(&mut asm, handlers.method_miss);
        asm.flush(buf)
    }

    fn emit_method_mega(
        buf: &mut ExecutableBuffer,
        table_ptr: u64,
        mask: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError> {
        let mut asm = Asm::new();
        asm.push(x86_64::push(reg::RDI));
        asm.push(x86_64::push(reg::RSI));
        asm.push(x86_64::mov_imm64(reg::RDX, table_ptr));
        asm.push(x86_64::mov_imm64(reg::RCX, mask));
        asm.push(x86_64::mov_imm64(SCRATCH, handlers.megamorphic_method_miss));
        // `call` pushes a return address; stack is kept 16-byte aligned by
        // the two prior pushes plus this call's own push.
        asm.push(vec![0x41, 0xFF, 0xD2]); // call r10
        asm.push(x86_64::mov_reg(SCRATCH2, reg::RAX));
        asm.push(x86_64::pop(reg::RSI));
        asm.push(x86_64::pop(reg::RDI));
        asm.push(x86_64::jmp_reg(SCRATCH2));
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
        X86_64::emit_property_mono(&mut buf, &entry, 1, &handlers()).unwrap();
        assert!(buf.len() > 0);
    }

    #[test]
    fn poly_property_stub_scales_with_entries() {
        let mut one_buf = fresh_buf();
        let one = [PropertyCacheEntry { shape_id: 1, slot_offset: 0, is_inline: true, hit_count: 0 }];
        X86_64::emit_property_poly(&mut one_buf, &one, 1, &handlers()).unwrap();

        let mut two_buf = fresh_buf();
        let two = [
            PropertyCacheEntry { shape_id: 1, slot_offset: 0, is_inline: true, hit_count: 0 },
            PropertyCacheEntry { shape_id: 2, slot_offset: 8, is_inline: false, hit_count: 0 },
        ];
        X86_64::emit_property_poly(&mut two_buf, &two, 1, &handlers()).unwrap();
        assert!(two_buf.len() > one_buf.len());
    }

    #[test]
    fn mega_method_stub_balances_push_pop() {
        let mut buf = fresh_buf();
        X86_64::emit_method_mega(&mut buf, 0x4000, 0x3F, &handlers()).unwrap();
        assert!(buf.len() > 0);
    }
}
