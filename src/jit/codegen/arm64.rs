//! AArch64 code generator.
//!
//! Fixed-32-bit-word encoding, same shape as the RISC-V backend but with
//! AAPCS64 register conventions. Absolute calls/relocations are
//! materialized as a `MOVZ`+3x`MOVK` sequence patched in place, rather
//! than an `ADRP`/`ADD` pair, to reuse the same constant-materialization
//! idiom the IC stub generator already relies on.

use rustc_hash::FxHashMap;

use crate::arch::arm64::{self, reg, Cond};
use crate::jit::codegen::{CodegenBackend, CodegenError, CompiledCode, DeoptInfo, ModuleContext, StackMapEntry, TargetArch, TargetInfo};
use crate::jit::frame::FrameLayout;
use crate::jit::ir::{AtomicOpKind, BranchCond, CallTarget, IrFunction, IrOpcode, Reg, RegClass, Terminator, VectorOpKind};
use crate::jit::regalloc::{self, Location, RegisterPool};
use crate::jit::relocation::{Relocation, RelocationKind, RelocationTarget, SymbolResolver};

const SCRATCH0: u8 = reg::X9;
const SCRATCH1: u8 = reg::X10;
const SCRATCH2: u8 = 11;

fn int_pool() -> RegisterPool {
    RegisterPool {
        caller_saved: vec![0, 1, 2, 3, 4, 5, 6, 7],
        callee_saved: vec![19, 20, 21, 22, 23, 24, 25, 26, 27, 28],
    }
}
fn float_pool() -> RegisterPool {
    RegisterPool { caller_saved: vec![0, 1, 2, 3, 4, 5, 6, 7], callee_saved: vec![8, 9, 10, 11, 12, 13, 14, 15] }
}

fn to_cond(c: BranchCond) -> Cond {
    match c {
        BranchCond::Eq => Cond::Eq,
        BranchCond::Ne => Cond::Ne,
        BranchCond::Lt => Cond::Lt,
        BranchCond::Ge => Cond::Ge,
        BranchCond::LtU => Cond::Ltu,
        BranchCond::GeU => Cond::Geu,
    }
}

enum Fixup {
    BCond { word: usize, target: crate::jit::ir::BlockId },
    B { word: usize, target: crate::jit::ir::BlockId },
    Cbnz { word: usize, target: crate::jit::ir::BlockId },
}

struct Asm {
    words: Vec<u32>,
    block_offsets: FxHashMap<crate::jit::ir::BlockId, usize>,
    fixups: Vec<Fixup>,
    relocations: Vec<Relocation>,
}

impl Asm {
    fn new() -> Asm {
        Asm { words: Vec::new(), block_offsets: FxHashMap::default(), fixups: Vec::new(), relocations: Vec::new() }
    }
    fn push(&mut self, w: u32) {
        self.words.push(w);
    }
    fn record(&mut self, id: crate::jit::ir::BlockId) {
        self.block_offsets.insert(id, self.words.len());
    }
    fn byte_offset(&self) -> u32 {
        (self.words.len() * 4) as u32
    }
    fn finish(mut self) -> (Vec<u32>, Vec<Relocation>) {
        for fixup in &self.fixups {
            match fixup {
                Fixup::BCond { word, target } => {
                    let t = *self.block_offsets.get(target).unwrap();
                    let disp = t as i32 - *word as i32;
                    let cond_bits = self.words[*word] & 0xF;
                    let cond = match cond_bits {
                        0 => Cond::Eq,
                        1 => Cond::Ne,
                        0b1010 => Cond::Ge,
                        0b1011 => Cond::Lt,
                        0b0010 => Cond::Geu,
                        _ => Cond::Ltu,
                    };
                    self.words[*word] = arm64::b_cond(cond, disp);
                }
                Fixup::B { word, target } => {
                    let t = *self.block_offsets.get(target).unwrap();
                    let disp = t as i32 - *word as i32;
                    self.words[*word] = arm64::b(disp);
                }
                Fixup::Cbnz { word, target } => {
                    let t = *self.block_offsets.get(target).unwrap();
                    let disp = t as i32 - *word as i32;
                    let rt = (self.words[*word] & 0x1F) as u8;
                    self.words[*word] = arm64::cbnz(rt, disp);
                }
            }
        }
        (self.words, self.relocations)
    }
}

struct Lowering<'a> {
    func: &'a IrFunction,
    alloc: regalloc::RegAlloc,
    frame: FrameLayout,
    asm: Asm,
}

impl<'a> Lowering<'a> {
    fn spill_offset(&self, slot: u32, class: RegClass) -> u32 {
        let base = -self.frame.spill_base();
        let index = match class {
            RegClass::Int => slot,
            RegClass::Float => self.alloc.int_spill_count + slot,
        };
        (base as u32) + index * 8
    }

    fn reload_int(&mut self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(slot) => {
                let off = self.spill_offset(slot, RegClass::Int);
                self.asm.push(arm64::sub_imm(scratch, reg::FP, off));
                self.asm.push(arm64::ldr_imm(scratch, scratch, 0));
                scratch
            }
        }
    }

    fn reload_float(&mut self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(slot) => {
                let off = self.spill_offset(slot, RegClass::Float);
                self.asm.push(arm64::sub_imm(SCRATCH2, reg::FP, off));
                self.asm.push(arm64::ldr_d_imm(scratch, SCRATCH2, 0));
                scratch
            }
        }
    }

    fn dest_int(&self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(_) => scratch,
        }
    }

    fn spill_store_int(&mut self, r: Reg, scratch: u8) {
        if let Location::Spill(slot) = self.alloc.location(r) {
            let off = self.spill_offset(slot, RegClass::Int);
            self.asm.push(arm64::sub_imm(SCRATCH2, reg::FP, off));
            self.asm.push(arm64::str_imm(scratch, SCRATCH2, 0));
        }
    }

    fn spill_store_float(&mut self, r: Reg, scratch: u8) {
        if let Location::Spill(slot) = self.alloc.location(r) {
            let off = self.spill_offset(slot, RegClass::Float);
            self.asm.push(arm64::sub_imm(SCRATCH2, reg::FP, off));
            self.asm.push(arm64::str_d_imm(scratch, SCRATCH2, 0));
        }
    }

    fn emit_absolute_call(&mut self, target: RelocationTarget) {
        let off = self.asm.byte_offset();
        self.asm.push(0);
        self.asm.push(0);
        self.asm.push(0);
        self.asm.push(0);
        self.asm.push(arm64::blr(SCRATCH0));
        self.asm.relocations.push(Relocation { code_offset: off, kind: RelocationKind::Absolute64, target });
    }

    fn lower_instr(&mut self, instr: &IrOpcode, ctx: &ModuleContext) -> Result<(), CodegenError> {
        match instr {
            IrOpcode::Add { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, arm64::add),
            IrOpcode::Sub { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, arm64::sub),
            IrOpcode::Mul { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, arm64::mul),
            IrOpcode::And { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, arm64::and),
            IrOpcode::Or { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, arm64::orr),
            IrOpcode::Xor { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, arm64::eor),
            IrOpcode::Div { dest, lhs, rhs, check_div_by_zero } => {
                let l = self.reload_int(*lhs, SCRATCH0);
                let r = self.reload_int(*rhs, SCRATCH1);
                if *check_div_by_zero {
                    self.asm.push(arm64::cmp(r, reg::XZR));
                    // Trap-on-zero branches to code emitted immediately
                    // below, not to another IR block, so it patches its
                    // own displacement directly instead of going through
                    // the block-level fixup list.
                    let skip_idx = self.asm.words.len();
                    self.asm.push(0);
                    self.emit_absolute_call(RelocationTarget::RuntimeHelper(crate::jit::relocation::RuntimeHelperId::DivideByZero));
                    let after = self.asm.words.len();
                    self.asm.words[skip_idx] = arm64::b_cond(Cond::Ne, (after - skip_idx) as i32);
                }
                let d = self.dest_int(*dest, SCRATCH0);
                self.asm.push(arm64::sdiv(d, l, r));
                self.spill_store_int(*dest, d);
            }
            IrOpcode::LoadConstant { dest, imm } => {
                let d = self.dest_int(*dest, SCRATCH0);
                arm64::emit_mov_imm64(d, *imm as u64, |w| self.asm.push(w));
                self.spill_store_int(*dest, d);
            }
            IrOpcode::Load { dest, base, offset, ty } => {
                let b = self.reload_int(*base, SCRATCH0);
                match ty.class() {
                    RegClass::Int => {
                        let d = self.dest_int(*dest, SCRATCH1);
                        self.asm.push(arm64::ldr_imm(d, b, *offset as u32));
                        self.spill_store_int(*dest, d);
                    }
                    RegClass::Float => {
                        let d = match self.alloc.location(*dest) {
                            Location::Physical(p) => p,
                            Location::Spill(_) => 0,
                        };
                        self.asm.push(arm64::ldr_d_imm(d, b, *offset as u32));
                        self.spill_store_float(*dest, d);
                    }
                }
            }
            IrOpcode::Store { base, value, offset, ty } => {
                let b = self.reload_int(*base, SCRATCH0);
                match ty.class() {
                    RegClass::Int => {
                        let v = self.reload_int(*value, SCRATCH1);
                        self.asm.push(arm64::str_imm(v, b, *offset as u32));
                    }
                    RegClass::Float => {
                        let v = self.reload_float(*value, 0);
                        self.asm.push(arm64::str_d_imm(v, b, *offset as u32));
                    }
                }
            }
            IrOpcode::Move { dest, src } => match self.func.reg_class(*dest) {
                RegClass::Int => {
                    let s = self.reload_int(*src, SCRATCH0);
                    let d = self.dest_int(*dest, SCRATCH0);
                    if s != d {
                        self.asm.push(arm64::orr(d, reg::XZR, s));
                    }
                    self.spill_store_int(*dest, d);
                }
                RegClass::Float => {
                    let s = self.reload_float(*src, 0);
                    let d = match self.alloc.location(*dest) {
                        Location::Physical(p) => p,
                        Location::Spill(_) => 0,
                    };
                    if s != d {
                        self.asm.push(arm64::fmov_d(d, s));
                    }
                    self.spill_store_float(*dest, d);
                }
            },
            IrOpcode::VectorOp { dest, lhs, rhs, op, lanes, ty } => {
                if !ctx.use_vector_extensions {
                    return Err(CodegenError::UnsupportedInstruction {
                        function: self.func.name.clone(),
                        detail: "vector extension disabled by configuration".to_string(),
                    });
                }
                let _ = ty;
                let l = self.reload_float(*lhs, 0);
                let r = self.reload_float(*rhs, 1);
                let d = match self.alloc.location(*dest) {
                    Location::Physical(p) => p,
                    Location::Spill(_) => 0,
                };
                for _ in 0..*lanes {
                    match op {
                        VectorOpKind::Add => self.asm.push(arm64::fadd_d(d, l, r)),
                        VectorOpKind::Sub => self.asm.push(arm64::fsub_d(d, l, r)),
                        VectorOpKind::Mul => self.asm.push(arm64::fmul_d(d, l, r)),
                    }
                }
                self.spill_store_float(*dest, d);
            }
            IrOpcode::AtomicOp { dest, addr, value, op, .. } => {
                let a = self.reload_int(*addr, SCRATCH0);
                let v = self.reload_int(*value, SCRATCH1);
                let d = self.dest_int(*dest, SCRATCH0);
                let retry = self.asm.words.len();
                self.asm.push(arm64::ldxr(d, a));
                match op {
                    AtomicOpKind::Add => {
                        self.asm.push(arm64::add(SCRATCH2, d, v));
                        self.asm.push(arm64::stxr(12, SCRATCH2, a));
                    }
                    AtomicOpKind::Swap => {
                        self.asm.push(arm64::stxr(12, v, a));
                    }
                    AtomicOpKind::CompareAndSwap => {
                        self.asm.push(arm64::cmp(d, v));
                        self.asm.push(arm64::b_cond(Cond::Ne, 3));
                        self.asm.push(arm64::stxr(12, v, a));
                    }
                }
                let back = (retry as i32) - (self.asm.words.len() as i32);
                self.asm.push(arm64::cbnz(12, back));
                self.spill_store_int(*dest, d);
            }
            IrOpcode::Call { dest, target, args } => {
                let indirect = match target {
                    CallTarget::Indirect(r) => Some(self.reload_int(*r, SCRATCH1)),
                    _ => None,
                };
                for (i, arg) in args.iter().take(8).enumerate() {
                    let a = self.reload_int(*arg, SCRATCH0);
                    if a != i as u8 {
                        self.asm.push(arm64::orr(i as u8, reg::XZR, a));
                    }
                }
                match target {
                    CallTarget::Indirect(_) => self.asm.push(arm64::blr(indirect.unwrap())),
                    CallTarget::Function(idx) => self.emit_absolute_call(RelocationTarget::Function(*idx)),
                    CallTarget::RuntimeHelper(h) => self.emit_absolute_call(RelocationTarget::RuntimeHelper(*h)),
                }
                if let Some(d) = dest {
                    let target_reg = self.dest_int(*d, SCRATCH0);
                    if target_reg != reg::X0 {
                        self.asm.push(arm64::orr(target_reg, reg::XZR, reg::X0));
                    }
                    self.spill_store_int(*d, target_reg);
                }
            }
            IrOpcode::GcSafepoint => {
                arm64::emit_mov_imm64(SCRATCH0, ctx.safepoint_flag_address, |w| self.asm.push(w));
                self.asm.push(arm64::ldr_imm(SCRATCH0, SCRATCH0, 0));
                let skip_idx = self.asm.words.len();
                self.asm.push(0);
                self.emit_absolute_call(RelocationTarget::RuntimeHelper(crate::jit::relocation::RuntimeHelperId::GcPoll));
                let after = self.asm.words.len();
                self.asm.words[skip_idx] = arm64::cbz(SCRATCH0, (after - skip_idx) as i32);
            }
        }
        Ok(())
    }

    fn binop(&mut self, dest: Reg, lhs: Reg, rhs: Reg, f: impl Fn(u8, u8, u8) -> u32) {
        let l = self.reload_int(lhs, SCRATCH0);
        let r = self.reload_int(rhs, SCRATCH1);
        let d = self.dest_int(dest, SCRATCH0);
        self.asm.push(f(d, l, r));
        self.spill_store_int(dest, d);
    }

    fn lower_terminator(&mut self, term: &Terminator) {
        match term {
            Terminator::Jump(target) => {
                let idx = self.asm.words.len();
                self.asm.push(0);
                self.asm.fixups.push(Fixup::B { word: idx, target: *target });
            }
            Terminator::Branch { cond, lhs, rhs, taken, not_taken } => {
                let l = self.reload_int(*lhs, SCRATCH0);
                let r = self.reload_int(*rhs, SCRATCH1);
                self.asm.push(arm64::cmp(l, r));
                let idx = self.asm.words.len();
                self.asm.push(arm64::b_cond(to_cond(*cond), 0));
                self.asm.fixups.push(Fixup::BCond { word: idx, target: *taken });
                let idx2 = self.asm.words.len();
                self.asm.push(0);
                self.asm.fixups.push(Fixup::B { word: idx2, target: *not_taken });
            }
            Terminator::OptimizedLoop { counter, body, exit } => {
                let c = self.reload_int(*counter, SCRATCH0);
                self.asm.push(arm64::sub_imm(c, c, 1));
                self.spill_store_int(*counter, c);
                let idx = self.asm.words.len();
                self.asm.push(0);
                self.asm.fixups.push(Fixup::Cbnz { word: idx, target: *body });
                let idx2 = self.asm.words.len();
                self.asm.push(0);
                self.asm.fixups.push(Fixup::B { word: idx2, target: *exit });
            }
            Terminator::Return(value) => {
                if let Some(v) = value {
                    let r = self.reload_int(*v, SCRATCH0);
                    if r != reg::X0 {
                        self.asm.push(arm64::orr(reg::X0, reg::XZR, r));
                    }
                }
                emit_epilogue(&mut self.asm, &self.frame);
                self.asm.push(arm64::ret());
            }
            Terminator::Unreachable | Terminator::None => {
                self.asm.push(arm64::orr(reg::XZR, reg::XZR, reg::XZR)); // nop
            }
        }
    }
}

fn emit_prologue(asm: &mut Asm, frame: &FrameLayout, used_callee_saved: &[u8]) {
    let size = frame.total_size();
    asm.push(arm64::sub_imm(reg::SP, reg::SP, size));
    asm.push(arm64::str_imm(reg::LR, reg::SP, size - 8));
    asm.push(arm64::str_imm(reg::FP, reg::SP, size - 16));
    asm.push(arm64::add_imm(reg::FP, reg::SP, size));
    for (i, &r) in used_callee_saved.iter().enumerate() {
        let off = (-frame.callee_saved_base()) as u32 + (i as u32) * 8;
        asm.push(arm64::str_imm(r, reg::SP, size - off));
    }
}

fn emit_epilogue(asm: &mut Asm, frame: &FrameLayout) {
    let size = frame.total_size();
    asm.push(arm64::ldr_imm(reg::LR, reg::SP, size - 8));
    asm.push(arm64::ldr_imm(reg::FP, reg::SP, size - 16));
    asm.push(arm64::add_imm(reg::SP, reg::SP, size));
}

pub struct Aarch64Backend;

impl CodegenBackend for Aarch64Backend {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn compile_function(&self, func: &IrFunction, ctx: &ModuleContext) -> Result<CompiledCode, CodegenError> {
        let int_pool = int_pool();
        let float_pool = float_pool();
        let alloc = regalloc::allocate(func, &int_pool, &float_pool);
        let frame = FrameLayout {
            callee_saved_count: alloc.used_callee_saved.len() as u32,
            spill_slot_count: alloc.int_spill_count + alloc.float_spill_count,
            max_outgoing_slots: 0,
        };

        let mut asm = Asm::new();
        emit_prologue(&mut asm, &frame, &alloc.used_callee_saved);
        let mut lowering = Lowering { func, alloc, frame, asm };
        for block in &func.blocks {
            lowering.asm.record(block.id);
            for instr in &block.instrs {
                lowering.lower_instr(instr, ctx)?;
            }
            lowering.lower_terminator(&block.terminator);
        }
        let (words, relocations) = lowering.asm.finish();
        let mut code = Vec::with_capacity(words.len() * 4);
        for w in words {
            code.extend_from_slice(&w.to_le_bytes());
        }

        Ok(CompiledCode { code, relocations, stack_maps: Vec::<StackMapEntry>::new(), deopt_points: Vec::<DeoptInfo>::new(), frame_size: frame.total_size() })
    }

    fn finalize(&self, code: &mut CompiledCode, _base_address: u64, resolver: &dyn SymbolResolver) -> Result<(), CodegenError> {
        for reloc in &code.relocations {
            let target_addr = match reloc.target {
                RelocationTarget::Function(idx) => resolver.resolve_function(idx).ok_or(CodegenError::UnresolvedRelocation(reloc.target))?,
                RelocationTarget::RuntimeHelper(h) => resolver.resolve_runtime_helper(h),
                RelocationTarget::Absolute(a) => a,
            };
            let off = reloc.code_offset as usize;
            let mut words = Vec::with_capacity(4);
            arm64::emit_mov_imm64(SCRATCH0, target_addr, |w| words.push(w));
            while words.len() < 4 {
                words.push(arm64::orr(SCRATCH0, reg::XZR, SCRATCH0)); // nop-equivalent pad
            }
            for (i, w) in words.into_iter().enumerate() {
                code.code[off + i * 4..off + i * 4 + 4].copy_from_slice(&w.to_le_bytes());
            }
        }
        Ok(())
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::Aarch64, int_register_count: 32, float_register_count: 32, has_vector_extension: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{IrFunction, RegClass};
    use crate::jit::relocation::test_support::FixedResolver;
    use rustc_hash::FxHashMap;

    fn ctx() -> ModuleContext {
        ModuleContext { use_vector_extensions: true, safepoint_flag_address: 0x5000 }
    }

    #[test]
    fn add_function_compiles_to_word_aligned_code() {
        let mut func = IrFunction::new("add", vec![RegClass::Int, RegClass::Int]);
        let a = func.alloc_reg(RegClass::Int);
        let b = func.alloc_reg(RegClass::Int);
        let sum = func.alloc_reg(RegClass::Int);
        func.block_mut(func.entry).instrs.push(IrOpcode::LoadConstant { dest: a, imm: 1 });
        func.block_mut(func.entry).instrs.push(IrOpcode::LoadConstant { dest: b, imm: 2 });
        func.block_mut(func.entry).instrs.push(IrOpcode::Add { dest: sum, lhs: a, rhs: b });
        func.block_mut(func.entry).terminator = Terminator::Return(Some(sum));

        let backend = Aarch64Backend;
        let code = backend.compile_function(&func, &ctx()).unwrap();
        assert!(!code.code.is_empty());
        assert_eq!(code.code.len() % 4, 0);
        super::super::verify_encoding(&code.code, TargetArch::Aarch64).unwrap();
    }

    #[test]
    fn finalize_patches_absolute_call_sequence() {
        let mut func = IrFunction::new("caller", vec![]);
        let dest = func.alloc_reg(RegClass::Int);
        func.block_mut(func.entry).instrs.push(IrOpcode::Call { dest: Some(dest), target: CallTarget::Function(9), args: vec![] });
        func.block_mut(func.entry).terminator = Terminator::Return(Some(dest));

        let backend = Aarch64Backend;
        let mut code = backend.compile_function(&func, &ctx()).unwrap();
        let mut functions = FxHashMap::default();
        functions.insert(9u32, 0xABCD_0000u64);
        let resolver = FixedResolver { functions, helpers: FxHashMap::default() };
        backend.finalize(&mut code, 0x1000, &resolver).unwrap();
        super::super::verify_encoding(&code.code, TargetArch::Aarch64).unwrap();
    }

    #[test]
    fn branching_function_compiles() {
        let mut func = IrFunction::new("branchy", vec![]);
        let a = func.alloc_reg(RegClass::Int);
        let then_block = func.add_block();
        let else_block = func.add_block();
        func.block_mut(func.entry).instrs.push(IrOpcode::LoadConstant { dest: a, imm: 0 });
        func.block_mut(func.entry).terminator = Terminator::Branch { cond: BranchCond::Eq, lhs: a, rhs: a, taken: then_block, not_taken: else_block };
        func.block_mut(then_block).terminator = Terminator::Return(Some(a));
        func.block_mut(else_block).terminator = Terminator::Return(Some(a));

        let backend = Aarch64Backend;
        let code = backend.compile_function(&func, &ctx()).unwrap();
        super::super::verify_encoding(&code.code, TargetArch::Aarch64).unwrap();
    }
}
