//! Per-function compilation counters.
//!
//! Call counts and loop iteration counts drive the tiering decision
//! (interpret vs compile); a CAS-guarded `compiling` flag keeps two
//! worker threads from compiling the same function twice.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Counters for one function, updated from the interpreter's hot path
/// without locking.
#[derive(Debug)]
pub struct FunctionProfile {
    call_count: AtomicU32,
    loop_count: AtomicU32,
    compiling: AtomicBool,
    jit_available: AtomicBool,
}

impl FunctionProfile {
    pub fn new() -> FunctionProfile {
        FunctionProfile {
            call_count: AtomicU32::new(0),
            loop_count: AtomicU32::new(0),
            compiling: AtomicBool::new(false),
            jit_available: AtomicBool::new(false),
        }
    }

    /// Record one interpreted call, returning the updated count.
    pub fn record_call(&self) -> u32 {
        self.call_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record one taken backward branch (loop iteration).
    pub fn record_loop_iteration(&self) -> u32 {
        self.loop_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count.load(Ordering::Relaxed)
    }

    /// Attempt to claim this function for compilation. Returns `true` if
    /// this caller won the race and should proceed to compile it; a
    /// losing caller should keep interpreting.
    pub fn try_start_compile(&self) -> bool {
        self.compiling.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Mark compilation finished, publishing whether it produced usable
    /// code.
    pub fn finish_compile(&self, available: bool) {
        self.jit_available.store(available, Ordering::Release);
        self.compiling.store(false, Ordering::Release);
    }

    pub fn is_jit_available(&self) -> bool {
        self.jit_available.load(Ordering::Acquire)
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling.load(Ordering::Acquire)
    }
}

impl Default for FunctionProfile {
    fn default() -> Self {
        FunctionProfile::new()
    }
}

/// Counters for every function in a module, indexed by function id.
#[derive(Debug, Default)]
pub struct ModuleProfile {
    functions: Vec<FunctionProfile>,
}

impl ModuleProfile {
    pub fn new(function_count: usize) -> ModuleProfile {
        let mut functions = Vec::with_capacity(function_count);
        functions.resize_with(function_count, FunctionProfile::new);
        ModuleProfile { functions }
    }

    pub fn function(&self, index: u32) -> &FunctionProfile {
        &self.functions[index as usize]
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_start_compile_only_lets_one_caller_through() {
        let profile = FunctionProfile::new();
        assert!(profile.try_start_compile());
        assert!(!profile.try_start_compile());
        profile.finish_compile(true);
        assert!(profile.try_start_compile());
    }

    #[test]
    fn record_call_and_loop_increment_independently() {
        let profile = FunctionProfile::new();
        profile.record_call();
        profile.record_call();
        profile.record_loop_iteration();
        assert_eq!(profile.call_count(), 2);
        assert_eq!(profile.loop_count(), 1);
    }

    #[test]
    fn module_profile_indexes_by_function_id() {
        let module = ModuleProfile::new(3);
        module.function(1).record_call();
        assert_eq!(module.function(1).call_count(), 1);
        assert_eq!(module.function(0).call_count(), 0);
    }
}
