//! Per-architecture IC stub generation
//!
//! A single stub template — mono/poly/mega property load, mono/poly/mega
//! method call — is shared across architectures through the
//! [`StubGenerator`] trait; each arch module supplies only its own
//! instruction encodings via `crate::arch`. RISC-V64 is the fully fleshed
//! out reference backend; x86-64 and ARM64 implement the same contract with
//! their own encoders.

mod arm64;
mod riscv64;
mod x86_64;

pub use arm64::Aarch64;
pub use riscv64::RiscV64;
pub use x86_64::X86_64;

use crate::error::AeroError;
use crate::exec::ExecutableBuffer;
use crate::ic::cache::{MethodCacheEntry, PropertyCacheEntry};

/// Miss-handler entry points baked into every stub by address. The host
/// supplies these when the `InlineCacheManager` is constructed.
#[derive(Debug, Clone, Copy)]
pub struct MissHandlers {
    /// `fn handle_property_miss(obj, name, site_id) -> Value`
    pub property_miss: u64,
    /// `fn handle_method_miss(obj, name, site_id) -> *const u8`
    pub method_miss: u64,
    /// `fn handle_megamorphic_method_miss(obj, name, table_entry) -> *const u8`
    pub megamorphic_method_miss: u64,
}

/// Implemented once per target architecture. Every stub is emitted into an
/// already-`reserve`d [`ExecutableBuffer`]; the caller calls
/// `make_executable` once generation finishes.
///
/// Object ABI assumed by every stub: `shape_id` at byte 0, out-of-line
/// slots pointer at byte 8 (`crate::abi::ObjectLayout`). `slot_offset` on a
/// [`PropertyCacheEntry`] is always a byte offset, used directly for both
/// the inline path (`obj + slot_offset`) and the out-of-line path
/// (`slots + slot_offset`).
pub trait StubGenerator {
    /// Monomorphic property load: check one shape, load the slot or fall
    /// back to the miss handler.
    fn emit_property_mono(
        buf: &mut ExecutableBuffer,
        entry: &PropertyCacheEntry,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError>;

    /// Polymorphic property load: linear shape dispatch over `entries`,
    /// falling through to the miss handler if none match.
    fn emit_property_poly(
        buf: &mut ExecutableBuffer,
        entries: &[PropertyCacheEntry],
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError>;

    /// Megamorphic property stub: unconditional tail into the miss
    /// handler with the site id in the third argument register.
    fn emit_property_mega(
        buf: &mut ExecutableBuffer,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError>;

    /// Monomorphic method call: check one shape, tail-call the baked-in
    /// code address or fall back to the method-miss handler.
    fn emit_method_mono(
        buf: &mut ExecutableBuffer,
        entry: &MethodCacheEntry,
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError>;

    /// Polymorphic method call: shape dispatch to one of N baked-in code
    /// addresses.
    fn emit_method_poly(
        buf: &mut ExecutableBuffer,
        entries: &[MethodCacheEntry],
        site_id: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError>;

    /// Megamorphic method call: hash `(shape_id, method_hash) & mask` into
    /// the process-wide table; tail-call on a double match, else call the
    /// handler and jump to the address it returns.
    fn emit_method_mega(
        buf: &mut ExecutableBuffer,
        table_ptr: u64,
        mask: u64,
        handlers: &MissHandlers,
    ) -> Result<(), AeroError>;
}
