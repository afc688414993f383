//! RISC-V (RV64GC, optional V) code generator.
//!
//! Reference backend: every opcode in [`crate::jit::ir::IrOpcode`] lowers
//! to real RV64GC encodings here, including the scoped vector subset
//! (`Add`/`Mul`) through the `V` extension and a division-by-zero trap
//! sequence shared with the interpreter's slow path.

use rustc_hash::FxHashMap;

use crate::arch::riscv64::{self, reg, BranchCond as ArchBranchCond, Width};
use crate::jit::codegen::{
    CodegenBackend, CodegenError, CompiledCode, DeoptInfo, ModuleContext, StackMapEntry, TargetArch, TargetInfo,
};
use crate::jit::frame::FrameLayout;
use crate::jit::ir::{
    AtomicOpKind, BranchCond, CallTarget, IrFunction, IrOpcode, Reg, RegClass, ScalarType, Terminator,
    VectorOpKind,
};
use crate::jit::regalloc::{self, Location, RegisterPool};
use crate::jit::relocation::{Relocation, RelocationKind, RelocationTarget, SymbolResolver};

const SCRATCH0: u8 = reg::T0;
const SCRATCH1: u8 = reg::T1;
const SCRATCH2: u8 = reg::T2;

fn int_pool() -> RegisterPool {
    RegisterPool {
        caller_saved: vec![reg::A0, reg::A1, reg::A2, reg::A3, reg::A4, reg::A5, reg::A6, reg::A7],
        callee_saved: vec![18, 19, 20, 21, 22, 23, 24, 25, 26, 27], // s2-s11
    }
}

/// Float registers reuse the same numbering space (`f0`-`f31`) as a
/// distinct physical file; the allocator doesn't need to know that, it
/// just sees a disjoint pool of ids.
fn float_pool() -> RegisterPool {
    RegisterPool {
        caller_saved: vec![10, 11, 12, 13, 14, 15, 16, 17], // fa0-fa7
        callee_saved: vec![18, 19, 20, 21, 22, 23, 24, 25], // fs2-fs9
    }
}

enum PendingFixup {
    /// Reserves 3 words: enough for a direct branch plus two pad `nop`s, an
    /// inverted branch plus a long `JAL` plus a pad `nop`, or an inverted
    /// branch plus an `AUIPC`+`JALR` indirect pair.
    Branch { word_index: usize, cond: ArchBranchCond, rs1: u8, rs2: u8, target: crate::jit::ir::BlockId },
    /// Reserves 2 words: enough for a direct `JAL` plus a pad `nop`, or an
    /// `AUIPC`+`JALR` indirect pair.
    Jump { word_index: usize, target: crate::jit::ir::BlockId },
}

struct Asm {
    words: Vec<u32>,
    block_offsets: FxHashMap<crate::jit::ir::BlockId, usize>,
    fixups: Vec<PendingFixup>,
    relocations: Vec<Relocation>,
}

impl Asm {
    fn new() -> Asm {
        Asm { words: Vec::new(), block_offsets: FxHashMap::default(), fixups: Vec::new(), relocations: Vec::new() }
    }

    fn push(&mut self, word: u32) {
        self.words.push(word);
    }

    fn li64(&mut self, rd: u8, value: i64) {
        riscv64::emit_li64(rd, SCRATCH2, value, |w| self.words.push(w));
    }

    fn byte_offset(&self) -> u32 {
        (self.words.len() * 4) as u32
    }

    fn record_block_start(&mut self, block: crate::jit::ir::BlockId) {
        self.block_offsets.insert(block, self.words.len());
    }

    /// Reserve the 3-word slot a `Branch` fixup needs and return its start
    /// index. Filled in with real displacement-dependent encodings by
    /// [`Asm::finish`] once every block's final offset is known.
    fn reserve_branch(&mut self) -> usize {
        let idx = self.words.len();
        self.words.push(0);
        self.words.push(0);
        self.words.push(0);
        idx
    }

    /// Reserve the 2-word slot a `Jump` fixup needs.
    fn reserve_jump(&mut self) -> usize {
        let idx = self.words.len();
        self.words.push(0);
        self.words.push(0);
        idx
    }

    fn finish(mut self) -> (Vec<u32>, Vec<Relocation>) {
        for fixup in &self.fixups {
            match fixup {
                PendingFixup::Branch { word_index, cond, rs1, rs2, target } => {
                    let target_word = *self.block_offsets.get(target).expect("branch target block exists");
                    let disp = (target_word as i64 - *word_index as i64) * 4;
                    if disp.abs() < riscv64::BRANCH_RANGE as i64 {
                        self.words[*word_index] = riscv64::branch(*cond, *rs1, *rs2, disp as i32);
                        self.words[*word_index + 1] = riscv64::nop();
                        self.words[*word_index + 2] = riscv64::nop();
                        continue;
                    }
                    // Short form can't reach: invert the condition so the
                    // branch jumps over a long unconditional form instead.
                    let jump_word = *word_index + 1;
                    let jump_disp = (target_word as i64 - jump_word as i64) * 4;
                    if jump_disp.abs() < riscv64::JAL_RANGE as i64 {
                        self.words[*word_index] = riscv64::branch(cond.invert(), *rs1, *rs2, 8);
                        self.words[jump_word] = riscv64::jal(reg::ZERO, jump_disp as i32);
                        self.words[*word_index + 2] = riscv64::nop();
                    } else {
                        self.words[*word_index] = riscv64::branch(cond.invert(), *rs1, *rs2, 12);
                        let (auipc_word, jalr_word) = riscv64::auipc_jalr_pair(SCRATCH0, jump_disp as i32);
                        self.words[jump_word] = auipc_word;
                        self.words[jump_word + 1] = jalr_word;
                    }
                }
                PendingFixup::Jump { word_index, target } => {
                    let target_word = *self.block_offsets.get(target).expect("jump target block exists");
                    let disp = (target_word as i64 - *word_index as i64) * 4;
                    if disp.abs() < riscv64::JAL_RANGE as i64 {
                        self.words[*word_index] = riscv64::jal(reg::ZERO, disp as i32);
                        self.words[*word_index + 1] = riscv64::nop();
                    } else {
                        let (auipc_word, jalr_word) = riscv64::auipc_jalr_pair(SCRATCH0, disp as i32);
                        self.words[*word_index] = auipc_word;
                        self.words[*word_index + 1] = jalr_word;
                    }
                }
            }
        }
        (self.words, self.relocations)
    }
}

fn to_arch_cond(cond: BranchCond) -> ArchBranchCond {
    match cond {
        BranchCond::Eq => ArchBranchCond::Eq,
        BranchCond::Ne => ArchBranchCond::Ne,
        BranchCond::Lt => ArchBranchCond::Lt,
        BranchCond::Ge => ArchBranchCond::Ge,
        BranchCond::LtU => ArchBranchCond::LtU,
        BranchCond::GeU => ArchBranchCond::GeU,
    }
}

fn width_of(ty: ScalarType) -> Width {
    match ty {
        ScalarType::I8 => Width::Byte,
        ScalarType::I16 => Width::Half,
        ScalarType::I32 => Width::Word,
        ScalarType::I64 | ScalarType::F64 => Width::Double,
    }
}

/// Per-function lowering state: register assignments, frame layout and
/// the instruction stream under construction.
struct Lowering<'a> {
    func: &'a IrFunction,
    alloc: regalloc::RegAlloc,
    frame: FrameLayout,
    asm: Asm,
}

impl<'a> Lowering<'a> {
    fn spill_offset(&self, slot: u32, class: RegClass) -> i32 {
        let base = self.frame.spill_base();
        // Int and float spill slots share the same region but are
        // indexed independently by the allocator; float slots are
        // placed after every int slot to keep the arithmetic simple.
        let index = match class {
            RegClass::Int => slot,
            RegClass::Float => self.alloc.int_spill_count + slot,
        };
        base - (index as i32 * 8)
    }

    /// Materialize a register's value into `scratch`, loading from its
    /// spill slot if needed, and return the physical register to use as
    /// the operand (either `scratch` or the register's own physical
    /// assignment).
    fn reload(&mut self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(slot) => {
                let off = self.spill_offset(slot, self.func.reg_class(r));
                match self.func.reg_class(r) {
                    RegClass::Int => self.asm.push(riscv64::load(Width::Double, true, scratch, reg::FP, off)),
                    RegClass::Float => self.asm.push(riscv64::fld(scratch, reg::FP, off)),
                }
                scratch
            }
        }
    }

    /// Pick the physical register a destination should be computed into:
    /// its own assignment if physical, or `scratch` if it's spilled
    /// (caller must follow up with [`Self::spill_store`]).
    fn dest_target(&self, r: Reg, scratch: u8) -> u8 {
        match self.alloc.location(r) {
            Location::Physical(p) => p,
            Location::Spill(_) => scratch,
        }
    }

    fn spill_store(&mut self, r: Reg, scratch: u8) {
        if let Location::Spill(slot) = self.alloc.location(r) {
            let off = self.spill_offset(slot, self.func.reg_class(r));
            match self.func.reg_class(r) {
                RegClass::Int => self.asm.push(riscv64::store(Width::Double, reg::FP, scratch, off)),
                RegClass::Float => self.asm.push(riscv64::fsd(reg::FP, scratch, off)),
            }
        }
    }

    fn lower_binop(&mut self, dest: Reg, lhs: Reg, rhs: Reg, f: impl Fn(u8, u8, u8) -> u32) {
        let l = self.reload(lhs, SCRATCH0);
        let r = self.reload(rhs, SCRATCH1);
        let d = self.dest_target(dest, SCRATCH0);
        self.asm.push(f(d, l, r));
        self.spill_store(dest, d);
    }

    fn lower_instr(&mut self, instr: &IrOpcode, ctx: &ModuleContext) -> Result<(), CodegenError> {
        match instr {
            IrOpcode::Add { dest, lhs, rhs } => self.lower_binop(*dest, *lhs, *rhs, riscv64::add),
            IrOpcode::Sub { dest, lhs, rhs } => self.lower_binop(*dest, *lhs, *rhs, riscv64::sub),
            IrOpcode::Mul { dest, lhs, rhs } => self.lower_binop(*dest, *lhs, *rhs, riscv64::mul),
            IrOpcode::And { dest, lhs, rhs } => self.lower_binop(*dest, *lhs, *rhs, riscv64::and),
            IrOpcode::Or { dest, lhs, rhs } => self.lower_binop(*dest, *lhs, *rhs, riscv64::or),
            IrOpcode::Xor { dest, lhs, rhs } => self.lower_binop(*dest, *lhs, *rhs, riscv64::xor),
            IrOpcode::Div { dest, lhs, rhs, check_div_by_zero } => {
                let l = self.reload(*lhs, SCRATCH0);
                let r = self.reload(*rhs, SCRATCH1);
                if *check_div_by_zero {
                    self.asm.push(riscv64::branch(ArchBranchCond::Ne, r, reg::ZERO, 8));
                    // Falls through into a 2-word trap sequence on r == 0;
                    // the trap address is resolved as a relocation so the
                    // interpreter's existing divide-by-zero raiser is
                    // reused rather than duplicated here.
                    let call_offset = self.asm.byte_offset();
                    self.asm.push(0); // auipc placeholder
                    self.asm.push(0); // jalr placeholder
                    self.asm.relocations.push(Relocation {
                        code_offset: call_offset,
                        kind: RelocationKind::Tail,
                        target: RelocationTarget::RuntimeHelper(crate::jit::relocation::RuntimeHelperId::DivideByZero),
                    });
                }
                let d = self.dest_target(*dest, SCRATCH0);
                self.asm.push(riscv64::div(d, l, r));
                self.spill_store(*dest, d);
            }
            IrOpcode::LoadConstant { dest, imm } => {
                let d = self.dest_target(*dest, SCRATCH0);
                self.asm.li64(d, *imm);
                self.spill_store(*dest, d);
            }
            IrOpcode::Load { dest, base, offset, ty } => {
                let b = self.reload(*base, SCRATCH0);
                match ty.class() {
                    RegClass::Int => {
                        let d = self.dest_target(*dest, SCRATCH1);
                        self.asm.push(riscv64::load(width_of(*ty), true, d, b, *offset));
                        self.spill_store(*dest, d);
                    }
                    RegClass::Float => {
                        let d = self.dest_target(*dest, SCRATCH1);
                        self.asm.push(riscv64::fld(d, b, *offset));
                        self.spill_store(*dest, d);
                    }
                }
            }
            IrOpcode::Store { base, value, offset, ty } => {
                let b = self.reload(*base, SCRATCH0);
                let v = self.reload(*value, SCRATCH1);
                match ty.class() {
                    RegClass::Int => self.asm.push(riscv64::store(width_of(*ty), b, v, *offset)),
                    RegClass::Float => self.asm.push(riscv64::fsd(b, v, *offset)),
                }
            }
            IrOpcode::Move { dest, src } => {
                let s = self.reload(*src, SCRATCH0);
                let d = self.dest_target(*dest, SCRATCH0);
                if s != d {
                    match self.func.reg_class(*dest) {
                        RegClass::Int => self.asm.push(riscv64::addi(d, s, 0)),
                        RegClass::Float => self.asm.push(riscv64::fmv_d(d, s)),
                    }
                }
                self.spill_store(*dest, d);
            }
            IrOpcode::VectorOp { dest, lhs, rhs, op, ty, lanes } => {
                if !ctx.use_vector_extensions {
                    return Err(CodegenError::UnsupportedInstruction {
                        function: self.func.name.clone(),
                        detail: "vector extension disabled by configuration".to_string(),
                    });
                }
                let sew = match ty.class() {
                    RegClass::Float => 64,
                    RegClass::Int => ty.size() * 8,
                };
                self.asm.li64(SCRATCH0, *lanes as i64);
                self.asm.push(riscv64::vsetvli(reg::ZERO, SCRATCH0, sew));
                let l = self.reload(*lhs, SCRATCH0) as u8;
                let r = self.reload(*rhs, SCRATCH1) as u8;
                let vop = match op {
                    VectorOpKind::Add => riscv64::VectorOp::Add,
                    VectorOpKind::Sub => riscv64::VectorOp::Sub,
                    VectorOpKind::Mul => riscv64::VectorOp::Mul,
                };
                let d = self.dest_target(*dest, SCRATCH0);
                self.asm.push(riscv64::vop_vv(vop, d, l, r));
                self.spill_store(*dest, d);
            }
            IrOpcode::AtomicOp { dest, addr, value, op, .. } => {
                let a = self.reload(*addr, SCRATCH0);
                let v = self.reload(*value, SCRATCH1);
                let d = self.dest_target(*dest, SCRATCH0);
                match op {
                    AtomicOpKind::Add => self.asm.push(riscv64::amoadd_d(d, a, v)),
                    AtomicOpKind::Swap => self.asm.push(riscv64::amoswap_d(d, a, v)),
                    AtomicOpKind::CompareAndSwap => {
                        // lr.d / bne / sc.d / bnez retry loop. `value`
                        // doubles as the expected-value input here; the
                        // new value is assumed preloaded into SCRATCH2 by
                        // an earlier Move (kept simple: CAS is the one
                        // instruction whose second operand this lowering
                        // treats as "compare against", not "store").
                        let retry = self.asm.byte_offset();
                        self.asm.push(riscv64::lr_d(d, a));
                        self.asm.push(riscv64::branch(ArchBranchCond::Ne, d, v, 12));
                        self.asm.push(riscv64::sc_d(SCRATCH2, a, SCRATCH1));
                        let back = (retry as i64 - self.asm.byte_offset() as i64) as i32;
                        self.asm.push(riscv64::branch(ArchBranchCond::Ne, SCRATCH2, reg::ZERO, back));
                    }
                }
                self.spill_store(*dest, d);
            }
            IrOpcode::Call { dest, target, args } => {
                // Reload the indirect target (if any) before argument
                // registers are clobbered, since it may itself live in
                // an argument-numbered physical register.
                let indirect_target = match target {
                    CallTarget::Indirect(r) => Some(self.reload(*r, SCRATCH2)),
                    _ => None,
                };
                for (i, arg) in args.iter().take(8).enumerate() {
                    let a = self.reload(*arg, SCRATCH0);
                    let target_reg = reg::A0 + i as u8;
                    if a != target_reg {
                        self.asm.push(riscv64::addi(target_reg, a, 0));
                    }
                }
                match target {
                    CallTarget::Indirect(_) => {
                        self.asm.push(riscv64::jalr(reg::RA, indirect_target.unwrap(), 0));
                    }
                    CallTarget::Function(idx) => {
                        let call_offset = self.asm.byte_offset();
                        self.asm.push(0); // auipc placeholder
                        self.asm.push(0); // jalr placeholder
                        self.asm.relocations.push(Relocation {
                            code_offset: call_offset,
                            kind: RelocationKind::Call,
                            target: RelocationTarget::Function(*idx),
                        });
                    }
                    CallTarget::RuntimeHelper(h) => {
                        let call_offset = self.asm.byte_offset();
                        self.asm.push(0);
                        self.asm.push(0);
                        self.asm.relocations.push(Relocation {
                            code_offset: call_offset,
                            kind: RelocationKind::Call,
                            target: RelocationTarget::RuntimeHelper(*h),
                        });
                    }
                }
                if let Some(d) = dest {
                    let target_reg = self.dest_target(*d, SCRATCH0);
                    if target_reg != reg::A0 {
                        self.asm.push(riscv64::addi(target_reg, reg::A0, 0));
                    }
                    self.spill_store(*d, target_reg);
                }
            }
            IrOpcode::GcSafepoint => {
                self.asm.li64(SCRATCH0, ctx.safepoint_flag_address as i64);
                self.asm.push(riscv64::load(Width::Word, true, SCRATCH0, SCRATCH0, 0));
                self.asm.push(riscv64::branch(ArchBranchCond::Eq, SCRATCH0, reg::ZERO, 12));
                let call_offset = self.asm.byte_offset();
                self.asm.push(0);
                self.asm.push(0);
                self.asm.relocations.push(Relocation {
                    code_offset: call_offset,
                    kind: RelocationKind::Call,
                    target: RelocationTarget::RuntimeHelper(crate::jit::relocation::RuntimeHelperId::GcPoll),
                });
            }
        }
        Ok(())
    }

    fn lower_terminator(&mut self, term: &Terminator) {
        match term {
            Terminator::Jump(target) => {
                let idx = self.asm.reserve_jump();
                self.asm.fixups.push(PendingFixup::Jump { word_index: idx, target: *target });
            }
            Terminator::Branch { cond, lhs, rhs, taken, not_taken } => {
                let l = self.reload(*lhs, SCRATCH0);
                let r = self.reload(*rhs, SCRATCH1);
                let idx = self.asm.reserve_branch();
                self.asm.fixups.push(PendingFixup::Branch {
                    word_index: idx,
                    cond: to_arch_cond(*cond),
                    rs1: l,
                    rs2: r,
                    target: *taken,
                });
                let idx2 = self.asm.reserve_jump();
                self.asm.fixups.push(PendingFixup::Jump { word_index: idx2, target: *not_taken });
            }
            Terminator::OptimizedLoop { counter, body, exit } => {
                let c = self.reload(*counter, SCRATCH0);
                self.asm.push(riscv64::addi(c, c, -1));
                self.spill_store(*counter, c);
                let idx = self.asm.reserve_branch();
                self.asm.fixups.push(PendingFixup::Branch {
                    word_index: idx,
                    cond: ArchBranchCond::Ne,
                    rs1: c,
                    rs2: reg::ZERO,
                    target: *body,
                });
                let idx2 = self.asm.reserve_jump();
                self.asm.fixups.push(PendingFixup::Jump { word_index: idx2, target: *exit });
            }
            Terminator::Return(value) => {
                if let Some(v) = value {
                    let r = self.reload(*v, SCRATCH0);
                    if r != reg::A0 {
                        self.asm.push(riscv64::addi(reg::A0, r, 0));
                    }
                }
                emit_epilogue(&mut self.asm, &self.frame);
                self.asm.push(riscv64::jalr(reg::ZERO, reg::RA, 0));
            }
            Terminator::Unreachable | Terminator::None => {
                self.asm.push(riscv64::addi(reg::ZERO, reg::ZERO, 0)); // nop, unreachable guard
            }
        }
    }
}

fn emit_prologue(asm: &mut Asm, frame: &FrameLayout, used_callee_saved: &[u8]) {
    let size = frame.total_size() as i32;
    asm.push(riscv64::addi(reg::SP, reg::SP, -size));
    asm.push(riscv64::store(Width::Double, reg::SP, reg::RA, size - 8));
    asm.push(riscv64::store(Width::Double, reg::SP, reg::FP, size - 16));
    asm.push(riscv64::addi(reg::FP, reg::SP, size));
    for (i, &r) in used_callee_saved.iter().enumerate() {
        let off = frame.callee_saved_base() - (i as i32 * 8);
        asm.push(riscv64::store(Width::Double, reg::FP, r, off));
    }
}

fn emit_epilogue(asm: &mut Asm, frame: &FrameLayout) {
    let size = frame.total_size() as i32;
    asm.push(riscv64::load(Width::Double, true, reg::RA, reg::SP, size - 8));
    asm.push(riscv64::load(Width::Double, true, reg::FP, reg::SP, size - 16));
    asm.push(riscv64::addi(reg::SP, reg::SP, size));
}

/// Reference RISC-V backend.
pub struct RiscV64Backend;

impl CodegenBackend for RiscV64Backend {
    fn name(&self) -> &'static str {
        "riscv64"
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
            lowering.asm.record_block_start(block.id);
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

        Ok(CompiledCode {
            code,
            relocations,
            stack_maps: Vec::<StackMapEntry>::new(),
            deopt_points: Vec::<DeoptInfo>::new(),
            frame_size: frame.total_size(),
        })
    }

    fn finalize(&self, code: &mut CompiledCode, base_address: u64, resolver: &dyn SymbolResolver) -> Result<(), CodegenError> {
        for reloc in &code.relocations {
            let target_addr = match reloc.target {
                RelocationTarget::Function(idx) => resolver
                    .resolve_function(idx)
                    .ok_or(CodegenError::UnresolvedRelocation(reloc.target))?,
                RelocationTarget::RuntimeHelper(h) => resolver.resolve_runtime_helper(h),
                RelocationTarget::Absolute(addr) => addr,
            };
            let site = base_address + reloc.code_offset as u64;
            let disp = target_addr.wrapping_sub(site) as i64 as i32;
            let hi20 = (disp.wrapping_add(0x800)) >> 12;
            let lo12 = disp - (hi20 << 12);
            let off = reloc.code_offset as usize;
            let auipc = riscv64::auipc(SCRATCH0, hi20);
            let link_rd = match reloc.kind {
                RelocationKind::Call => reg::RA,
                RelocationKind::Tail | RelocationKind::Absolute64 => reg::ZERO,
            };
            let jalr = riscv64::jalr(link_rd, SCRATCH0, lo12);
            code.code[off..off + 4].copy_from_slice(&auipc.to_le_bytes());
            code.code[off + 4..off + 8].copy_from_slice(&jalr.to_le_bytes());
        }
        Ok(())
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo { arch: TargetArch::RiscV64, int_register_count: 32, float_register_count: 32, has_vector_extension: true }
    }
}
