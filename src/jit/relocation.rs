//! Relocations between emitted machine code and the symbols it calls.
//!
//! Codegen backends never bake absolute addresses for cross-function or
//! runtime-helper calls directly into the instruction stream, since the
//! final code address in the executable buffer isn't known until the
//! function is finalized. Instead they emit a placeholder immediate and
//! record a [`Relocation`] describing how to patch it once every function
//! in the module has a fixed address.

/// Well-known runtime entry points a compiled function may call into
/// without going through the host's general symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHelperId {
    /// Raised when an integer division's divisor is zero.
    DivideByZero,
    /// Voluntary GC safepoint poll.
    GcPoll,
    /// Slow-path allocation when a bump allocator's local buffer is
    /// exhausted.
    AllocateSlow,
    /// Property miss handler, shared with the interpreter's inline cache
    /// subsystem.
    PropertyMiss,
    /// Method-call miss handler, shared with the interpreter's inline
    /// cache subsystem.
    MethodMiss,
}

/// What a relocation's patched value ultimately refers to.
#[derive(Debug, Clone, Copy)]
pub enum RelocationTarget {
    /// Another JIT-compiled function, identified by its module-local
    /// index.
    Function(u32),
    /// A runtime helper resolved through [`SymbolResolver`].
    RuntimeHelper(RuntimeHelperId),
    /// A host-provided absolute address, resolved once at finalize time.
    Absolute(u64),
}

/// The shape of the code-offset being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// A PC-relative call sequence (hi20/lo12 pair on RISC-V, adrp/add on
    /// ARM64, rel32 `CALL` on x86-64).
    Call,
    /// A PC-relative tail-call / unconditional jump sequence.
    Tail,
    /// A full 64-bit absolute value materialized in-place (used by
    /// `LoadConstant` lowering when the constant is itself a relocatable
    /// address, e.g. a literal pool entry).
    Absolute64,
}

/// One pending fixup against a function's code buffer.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Byte offset into the function's code buffer where the fixup
    /// begins.
    pub code_offset: u32,
    pub kind: RelocationKind,
    pub target: RelocationTarget,
}

/// Host-provided address resolution for relocations, applied once every
/// function in a compilation unit has a fixed base address.
pub trait SymbolResolver {
    /// Resolve a function index to its final code address.
    fn resolve_function(&self, func_index: u32) -> Option<u64>;
    /// Resolve a runtime helper to its entry point.
    fn resolve_runtime_helper(&self, helper: RuntimeHelperId) -> u64;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rustc_hash::FxHashMap;

    pub struct FixedResolver {
        pub functions: FxHashMap<u32, u64>,
        pub helpers: FxHashMap<RuntimeHelperId, u64>,
    }

    impl SymbolResolver for FixedResolver {
        fn resolve_function(&self, func_index: u32) -> Option<u64> {
            self.functions.get(&func_index).copied()
        }

        fn resolve_runtime_helper(&self, helper: RuntimeHelperId) -> u64 {
            *self.helpers.get(&helper).unwrap_or(&0)
        }
    }
}
