//! Two-class linear-scan register allocator.
//!
//! Virtual registers in [`RegClass::Int`] and [`RegClass::Float`] are
//! allocated independently against two separate physical pools. Live
//! ranges are approximated as `[first def/use, last def/use]` over a
//! linearized instruction order (blocks visited in id order) — adequate
//! for the straight-line and lightly-branching functions this generator
//! targets, and considerably simpler than a full SSA-based allocator.

use rustc_hash::FxHashMap;

use crate::jit::ir::{IrFunction, Reg, RegClass};

/// Where a virtual register ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A physical register, numbered within its class's pool.
    Physical(u8),
    /// A spill slot index, counted from zero within its class.
    Spill(u32),
}

/// The physical registers available to one class, split into
/// caller-saved (clobbered across calls, preferred for short-lived
/// temporaries) and callee-saved (must be saved/restored in the
/// prologue/epilogue if used).
#[derive(Debug, Clone)]
pub struct RegisterPool {
    pub caller_saved: Vec<u8>,
    pub callee_saved: Vec<u8>,
}

impl RegisterPool {
    fn total(&self) -> usize {
        self.caller_saved.len() + self.callee_saved.len()
    }

    /// Physical register number at `index`, preferring caller-saved slots
    /// first since most virtual registers don't live across a call.
    fn nth(&self, index: usize) -> Option<u8> {
        if index < self.caller_saved.len() {
            Some(self.caller_saved[index])
        } else {
            self.callee_saved.get(index - self.caller_saved.len()).copied()
        }
    }

    fn is_callee_saved(&self, phys: u8) -> bool {
        self.callee_saved.contains(&phys)
    }
}

struct LiveRange {
    reg: Reg,
    class: RegClass,
    start: u32,
    end: u32,
}

/// Allocation result for a whole function.
#[derive(Debug)]
pub struct RegAlloc {
    pub assignments: FxHashMap<Reg, Location>,
    /// Physical callee-saved registers actually used, so the prologue
    /// only saves what's clobbered.
    pub used_callee_saved: Vec<u8>,
    /// Spill slots needed, per class, in allocation order.
    pub int_spill_count: u32,
    pub float_spill_count: u32,
}

impl RegAlloc {
    pub fn location(&self, reg: Reg) -> Location {
        *self.assignments.get(&reg).expect("register allocated before use")
    }
}

/// Run linear-scan allocation for `func` against the given pools.
pub fn allocate(func: &IrFunction, int_pool: &RegisterPool, float_pool: &RegisterPool) -> RegAlloc {
    let ranges = compute_live_ranges(func);
    let mut int_ranges: Vec<&LiveRange> = ranges.iter().filter(|r| r.class == RegClass::Int).collect();
    let mut float_ranges: Vec<&LiveRange> = ranges.iter().filter(|r| r.class == RegClass::Float).collect();
    int_ranges.sort_by_key(|r| r.start);
    float_ranges.sort_by_key(|r| r.start);

    let mut assignments = FxHashMap::default();
    let mut used_callee_saved = Vec::new();

    let int_spill_count = scan_class(&int_ranges, int_pool, &mut assignments, &mut used_callee_saved);
    let float_spill_count = scan_class(&float_ranges, float_pool, &mut assignments, &mut used_callee_saved);

    RegAlloc { assignments, used_callee_saved, int_spill_count, float_spill_count }
}

/// Linear scan over one class's sorted ranges. Active set tracked as
/// `(end, physical_index)`; expired entries free their slot for reuse.
fn scan_class(
    ranges: &[&LiveRange],
    pool: &RegisterPool,
    assignments: &mut FxHashMap<Reg, Location>,
    used_callee_saved: &mut Vec<u8>,
) -> u32 {
    let mut active: Vec<(u32, usize)> = Vec::new(); // (end, pool index)
    let mut free_indices: Vec<usize> = (0..pool.total()).rev().collect();
    let mut next_spill = 0u32;

    for range in ranges {
        active.retain(|&(end, idx)| {
            if end < range.start {
                free_indices.push(idx);
                false
            } else {
                true
            }
        });

        if let Some(idx) = free_indices.pop() {
            let phys = pool.nth(idx).expect("index within pool bounds");
            if pool.is_callee_saved(phys) && !used_callee_saved.contains(&phys) {
                used_callee_saved.push(phys);
            }
            assignments.insert(range.reg, Location::Physical(phys));
            active.push((range.end, idx));
        } else {
            assignments.insert(range.reg, Location::Spill(next_spill));
            next_spill += 1;
        }
    }

    next_spill
}

/// Linearize blocks in id order and compute `[first, last]` touch points
/// per register across that order. Block parameters (the function's own
/// parameters) start live at position 0.
fn compute_live_ranges(func: &IrFunction) -> Vec<LiveRange> {
    let mut first_seen: FxHashMap<Reg, u32> = FxHashMap::default();
    let mut last_seen: FxHashMap<Reg, u32> = FxHashMap::default();

    let mut pos = 0u32;
    for block in &func.blocks {
        for instr in &block.instrs {
            for used in instr.uses() {
                first_seen.entry(used).or_insert(pos);
                last_seen.insert(used, pos);
            }
            if let Some(d) = instr.dest() {
                first_seen.entry(d).or_insert(pos);
                last_seen.insert(d, pos);
            }
            pos += 1;
        }
        for reg in block_terminator_uses(block) {
            first_seen.entry(reg).or_insert(pos);
            last_seen.insert(reg, pos);
        }
        pos += 1;
    }

    first_seen
        .into_iter()
        .map(|(reg, start)| {
            let end = *last_seen.get(&reg).unwrap_or(&start);
            LiveRange { reg, class: func.reg_class(reg), start, end }
        })
        .collect()
}

fn block_terminator_uses(block: &crate::jit::ir::BasicBlock) -> Vec<Reg> {
    use crate::jit::ir::Terminator;
    match &block.terminator {
        Terminator::Branch { lhs, rhs, .. } => vec![*lhs, *rhs],
        Terminator::Return(Some(r)) => vec![*r],
        Terminator::OptimizedLoop { counter, .. } => vec![*counter],
        _ => vec![],
    }
}
