//! JIT compilation infrastructure: IR, per-architecture code generators,
//! register allocation, relocations, code cache, and tiering policy.

pub mod codecache;
pub mod codegen;
pub mod frame;
pub mod ir;
pub mod profiling;
pub mod regalloc;
pub mod relocation;

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::config::{JitConfig, VectorPolicy};
use crate::error::AeroError;
use crate::exec::ExecutableBuffer;
use crate::jit::codecache::JitCodeCache;
use crate::jit::codegen::arm64::Aarch64Backend;
use crate::jit::codegen::riscv64::RiscV64Backend;
use crate::jit::codegen::x86_64::X86_64Backend;
use crate::jit::codegen::{CodegenBackend, ModuleContext, TargetArch};
use crate::jit::ir::IrFunction;
use crate::jit::profiling::{CompilationPolicy, ModuleProfile};
use crate::jit::relocation::{RuntimeHelperId, SymbolResolver};

/// Resolves relocations against the engine's own code cache (for
/// already-compiled sibling functions) and a host-supplied runtime
/// helper address table.
struct EngineResolver<'a> {
    cache: &'a JitCodeCache,
    module_id: u64,
    helpers: &'a FxHashMap<RuntimeHelperId, u64>,
}

impl SymbolResolver for EngineResolver<'_> {
    fn resolve_function(&self, func_index: u32) -> Option<u64> {
        self.cache.entry(self.module_id, func_index).map(|ptr| ptr as u64)
    }

    fn resolve_runtime_helper(&self, helper: RuntimeHelperId) -> u64 {
        *self.helpers.get(&helper).unwrap_or(&0)
    }
}

/// Top-level JIT engine: picks a [`CodegenBackend`] for the configured
/// target, owns the code cache, and drives the interpret-to-compile
/// tiering decision from per-function profiles.
pub struct JitEngine {
    backend: Box<dyn CodegenBackend>,
    cache: JitCodeCache,
    profiles: parking_lot::RwLock<FxHashMap<u64, Arc<ModuleProfile>>>,
    policy: CompilationPolicy,
    module_ctx: ModuleContext,
    runtime_helpers: FxHashMap<RuntimeHelperId, u64>,
}

// Every field is either Sync already or protected by a lock; the backend
// is stateless beyond its own immutable encoding tables.
unsafe impl Send for JitEngine {}
unsafe impl Sync for JitEngine {}

impl JitEngine {
    /// Build an engine for `config.target_arch`, polling the GC at
    /// `safepoint_flag_address` and resolving runtime-helper calls
    /// through `runtime_helpers`. `max_code_cache_bytes` bounds the
    /// total size of compiled code kept resident.
    pub fn new(
        config: &JitConfig,
        safepoint_flag_address: u64,
        runtime_helpers: FxHashMap<RuntimeHelperId, u64>,
        max_code_cache_bytes: usize,
    ) -> JitEngine {
        let backend: Box<dyn CodegenBackend> = match config.target_arch {
            TargetArch::RiscV64 => Box::new(RiscV64Backend),
            TargetArch::X86_64 => Box::new(X86_64Backend),
            TargetArch::Aarch64 => Box::new(Aarch64Backend),
        };
        let info = backend.target_info();
        let use_vector_extensions = match config.enable_vector_extensions {
            VectorPolicy::Off => false,
            VectorPolicy::On => true,
            VectorPolicy::Auto => info.has_vector_extension,
        };

        JitEngine {
            backend,
            cache: JitCodeCache::new(max_code_cache_bytes),
            profiles: parking_lot::RwLock::new(FxHashMap::default()),
            policy: CompilationPolicy::new(),
            module_ctx: ModuleContext { use_vector_extensions, safepoint_flag_address },
            runtime_helpers,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Register a module's function count and return its cache/profile
    /// key.
    pub fn register_module(&self, function_count: usize) -> u64 {
        let module_id = self.cache.allocate_module_id();
        self.profiles.write().insert(module_id, Arc::new(ModuleProfile::new(function_count)));
        module_id
    }

    /// Record one interpreted call, returning the updated count.
    pub fn record_call(&self, module_id: u64, func_index: u32) -> u32 {
        match self.profiles.read().get(&module_id) {
            Some(profile) => profile.function(func_index).record_call(),
            None => 0,
        }
    }

    /// Record one taken backward branch.
    pub fn record_loop_iteration(&self, module_id: u64, func_index: u32) -> u32 {
        match self.profiles.read().get(&module_id) {
            Some(profile) => profile.function(func_index).record_loop_iteration(),
            None => 0,
        }
    }

    /// Native entry point for an already-compiled function, or `None` if
    /// it hasn't been compiled (or was invalidated) yet.
    pub fn entry_point(&self, module_id: u64, func_index: u32) -> Option<*const u8> {
        self.cache.entry(module_id, func_index)
    }

    pub fn invalidate(&self, module_id: u64, func_index: u32) {
        self.cache.invalidate(module_id, func_index);
    }

    /// Compile `func` if its profile has crossed the hot threshold and no
    /// other thread has already claimed it. Returns whether compilation
    /// happened (successfully or not); check [`Self::entry_point`] for
    /// the result.
    pub fn compile_if_hot(&self, module_id: u64, func_index: u32, func: &IrFunction) -> Result<bool, AeroError> {
        let profile = match self.profiles.read().get(&module_id) {
            Some(p) => Arc::clone(p),
            None => return Ok(false),
        };
        let fp = profile.function(func_index);
        if !self.policy.should_compile(fp, func.instr_count()) {
            return Ok(false);
        }
        if !fp.try_start_compile() {
            return Ok(false);
        }

        let result = self.compile_and_install(module_id, func_index, func);
        fp.finish_compile(result.is_ok());
        result?;
        Ok(true)
    }

    fn compile_and_install(&self, module_id: u64, func_index: u32, func: &IrFunction) -> Result<(), AeroError> {
        let mut code = self.backend.compile_function(func, &self.module_ctx)?;

        let mut buffer = ExecutableBuffer::new();
        buffer.reserve(code.code.len().max(1))?;
        let base_address = buffer.base_ptr() as u64;

        let resolver = EngineResolver { cache: &self.cache, module_id, helpers: &self.runtime_helpers };
        self.backend.finalize(&mut code, base_address, &resolver)?;

        buffer.emit_bytes(&code.code)?;
        buffer.make_executable()?;
        self.cache.insert(module_id, func_index, buffer);
        Ok(())
    }
}
