//! Crate-wide error type
//!
//! Every fallible public entry point returns `Result<T, AeroError>`. Modules
//! with a narrower failure domain (the executable buffer, JIT codegen)
//! define their own `thiserror` enum and convert into `AeroError` at the
//! crate boundary via `#[from]`.

use crate::exec::BufferError;
use crate::jit::codegen::CodegenError;

/// Errors surfaced by the AeroJS runtime substrate
#[derive(Debug, thiserror::Error)]
pub enum AeroError {
    /// GC allocate failed after a full collection still could not free enough memory
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failing allocation
        requested: usize,
    },

    /// The code buffer could not transition from RW to RX
    #[error("permission error: {0}")]
    PermissionError(#[from] BufferError),

    /// The JIT could not encode a branch/call even using the long form
    #[error("relocation out of range: {0}")]
    RelocationOutOfRange(String),

    /// JIT lowering saw an opcode it cannot lower
    #[error("unknown opcode: {0}")]
    UnknownOpcode(String),

    /// Codegen failure not covered by a more specific variant
    #[error("internal codegen error: {0}")]
    Codegen(#[from] CodegenError),

    /// A debug-only cache invariant was violated (duplicate shape, state regression, ...)
    #[error("cache invariant violation: {0}")]
    CacheInvariantViolation(String),

    /// A `Config` value failed validation
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias used throughout the crate
pub type AeroResult<T> = Result<T, AeroError>;
