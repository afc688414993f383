//! Code cache for JIT-compiled functions.
//!
//! Keyed by `(module_id, func_index)` rather than a single arena index,
//! since a JIT function's identity (which module, which function) is
//! meaningful to the host in a way an inline cache stub's never is.
//! Invalidation is a soft flag rather than a real reclaim: a deoptimized
//! function just stops being returned by [`JitCodeCache::entry`] until
//! it's recompiled and re-inserted.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::exec::ExecutableBuffer;
use crate::jit::codegen::ExecutableCode;

type CacheKey = (u64, u32);

struct CacheEntry {
    code: ExecutableCode,
    _buffer: ExecutableBuffer,
    invalidated: AtomicBool,
}

/// Thread-safe cache of JIT-compiled function code, sized by a byte
/// budget rather than an entry count.
pub struct JitCodeCache {
    entries: RwLock<FxHashMap<CacheKey, CacheEntry>>,
    total_code_size: AtomicUsize,
    max_size: usize,
    next_module_id: AtomicU64,
}

impl JitCodeCache {
    pub fn new(max_size: usize) -> JitCodeCache {
        JitCodeCache {
            entries: RwLock::new(FxHashMap::default()),
            total_code_size: AtomicUsize::new(0),
            max_size,
            next_module_id: AtomicU64::new(0),
        }
    }

    pub fn allocate_module_id(&self) -> u64 {
        self.next_module_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a compiled function's finished, executable buffer. Returns
    /// `false` without inserting if doing so would exceed the size
    /// budget.
    pub fn insert(&self, module_id: u64, func_index: u32, buffer: ExecutableBuffer) -> bool {
        let code_size = buffer.len();
        let current = self.total_code_size.load(Ordering::Relaxed);
        if current + code_size > self.max_size {
            return false;
        }
        let code = ExecutableCode { code_ptr: buffer.base_ptr(), code_len: buffer.len() };

        let key = (module_id, func_index);
        let mut entries = self.entries.write();
        if let Some(old) = entries.remove(&key) {
            self.total_code_size.fetch_sub(old.code.code_len, Ordering::Relaxed);
        }
        self.total_code_size.fetch_add(code_size, Ordering::Relaxed);
        entries.insert(key, CacheEntry { code, _buffer: buffer, invalidated: AtomicBool::new(false) });
        true
    }

    /// Entry point address for a compiled function, or `None` if it
    /// hasn't been compiled or has been invalidated.
    pub fn entry(&self, module_id: u64, func_index: u32) -> Option<*const u8> {
        let entries = self.entries.read();
        let entry = entries.get(&(module_id, func_index))?;
        if entry.invalidated.load(Ordering::Acquire) {
            None
        } else {
            Some(entry.code.code_ptr)
        }
    }

    pub fn invalidate(&self, module_id: u64, func_index: u32) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&(module_id, func_index)) {
            entry.invalidated.store(true, Ordering::Release);
        }
    }

    pub fn contains(&self, module_id: u64, func_index: u32) -> bool {
        self.entry(module_id, func_index).is_some()
    }

    pub fn total_size(&self) -> usize {
        self.total_code_size.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_buffer() -> ExecutableBuffer {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(16).unwrap();
        buf.emit32(0x1300_0013).unwrap(); // nop-equivalent RV64 word
        buf.make_executable().unwrap();
        buf
    }

    #[test]
    fn insert_then_entry_returns_code_pointer() {
        let cache = JitCodeCache::new(4096);
        let mid = cache.allocate_module_id();
        assert!(cache.insert(mid, 0, tiny_buffer()));
        assert!(cache.entry(mid, 0).is_some());
    }

    #[test]
    fn invalidate_hides_the_entry_without_removing_it() {
        let cache = JitCodeCache::new(4096);
        let mid = cache.allocate_module_id();
        cache.insert(mid, 0, tiny_buffer());
        cache.invalidate(mid, 0);
        assert!(!cache.contains(mid, 0));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn insert_rejects_once_budget_exhausted() {
        let cache = JitCodeCache::new(4);
        let mid = cache.allocate_module_id();
        assert!(!cache.insert(mid, 0, tiny_buffer()));
    }

    #[test]
    fn module_ids_are_distinct_and_increasing() {
        let cache = JitCodeCache::new(4096);
        assert_eq!(cache.allocate_module_id(), 0);
        assert_eq!(cache.allocate_module_id(), 1);
    }
}
