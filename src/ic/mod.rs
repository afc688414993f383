//! Inline cache subsystem
//!
//! A call site starts `Uninit`, becomes `Mono` on its first shape, `Poly`
//! as more distinct shapes show up, and `Mega` once shape diversity or
//! miss rate crosses a configured threshold. Each state owns its own
//! generated stub, written once into an [`crate::exec::ExecutableBuffer`]
//! and patched into every call site that references it.

pub mod cache;
pub mod manager;
pub mod megamorphic;
pub mod patch;
pub mod stub;

pub use cache::{CacheState, MethodCache, MethodCacheEntry, PropertyCache, PropertyCacheEntry};
pub use manager::{InlineCacheManager, MethodResolver, PropertyLocation, PropertyResolver};
pub use megamorphic::{MegamorphicEntry, MegamorphicTable};
pub use patch::{CodeCache, CodeIndex, NativeCode, NativeCodeKind, PatchSite};
pub use stub::{Aarch64, MissHandlers, RiscV64, StubGenerator, X86_64};
