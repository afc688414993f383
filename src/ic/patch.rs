use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::exec::ExecutableBuffer;

/// Kind of stub or compiled unit an arena slot holds, for diagnostics and
/// heap-snapshot style dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCodeKind {
    /// A property-load stub (mono/poly/mega).
    PropertyStub,
    /// A method-call stub (mono/poly/mega).
    MethodStub,
    /// JIT-compiled function body.
    JitFunction,
}

/// One piece of generated code living in an executable buffer.
///
/// Ownership: held by the code cache arena; callers hold an index, not a
/// pointer, so retirement cannot dangle a live reference.
pub struct NativeCode {
    buffer: ExecutableBuffer,
    entry: *const u8,
    kind: NativeCodeKind,
    /// Free-form tag (e.g. the site id this stub was generated for).
    meta: u64,
    /// Number of `PatchSite`s currently pointing at this entry. Retirement
    /// (returning a slot to the free list) only happens once this reaches
    /// zero and the host confirms no thread is still executing the code
    /// (a safepoint the arena itself does not implement).
    refcount: AtomicUsize,
}

// Safety: `entry` points into `buffer`'s mapped executable region, which
// is never written to again once `NativeCode` is constructed.
unsafe impl Send for NativeCode {}
unsafe impl Sync for NativeCode {}

impl NativeCode {
    fn new(buffer: ExecutableBuffer, kind: NativeCodeKind, meta: u64) -> NativeCode {
        let entry = buffer.base_ptr();
        NativeCode {
            buffer,
            entry,
            kind,
            meta,
            refcount: AtomicUsize::new(0),
        }
    }

    /// Entry address of this code, valid once the owning buffer has been
    /// made executable.
    pub fn entry(&self) -> *const u8 {
        self.entry
    }

    /// What kind of unit this is.
    pub fn kind(&self) -> NativeCodeKind {
        self.kind
    }

    /// The free-form tag passed at insertion time.
    pub fn meta(&self) -> u64 {
        self.meta
    }

    /// Size of the emitted code in bytes.
    pub fn code_size(&self) -> usize {
        self.buffer.len()
    }
}

/// A location inside emitted code holding a pointer-sized slot that
/// currently points at the active stub for some call site.
///
/// All patch sites registered for a call site are updated together
/// whenever that site's stub is regenerated.
pub struct PatchSite {
    /// Address of the pointer-sized slot to overwrite.
    slot: *mut *const u8,
}

// Safety: the slot address is inside host-owned executable memory the
// host guarantees outlives the patch site's registration.
unsafe impl Send for PatchSite {}
unsafe impl Sync for PatchSite {}

impl PatchSite {
    /// Register a patch site at `slot`, writing `initial` immediately if
    /// given.
    pub fn new(slot: *mut *const u8) -> PatchSite {
        PatchSite { slot }
    }

    /// Atomically overwrite the slot with `target`. Uses release ordering
    /// so a reader on another core that observes the new pointer also
    /// observes the fully-written, executable code it points to.
    pub fn patch(&self, target: *const u8) {
        // AtomicPtr<u8> has the same size and alignment as a raw pointer,
        // so this reinterpretation is sound for a naturally aligned slot.
        let atomic = unsafe { &*(self.slot as *const AtomicPtr<u8>) };
        atomic.store(target as *mut u8, Ordering::Release);
    }
}

/// Arena of [`NativeCode`], indexed rather than pointed-to so stubs,
/// caches, and patch sites can refer to code without forming reference
/// cycles.
///
/// Uses the same index-over-pointer discipline as the JIT function code
/// cache, generalized to also hold IC stubs.
pub struct CodeCache {
    entries: RwLock<Vec<Option<NativeCode>>>,
    free_list: RwLock<Vec<usize>>,
    total_code_size: AtomicUsize,
}

/// Opaque index into the code cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeIndex(usize);

impl CodeCache {
    /// Create an empty code cache.
    pub fn new() -> CodeCache {
        CodeCache {
            entries: RwLock::new(Vec::new()),
            free_list: RwLock::new(Vec::new()),
            total_code_size: AtomicUsize::new(0),
        }
    }

    /// Insert a freshly generated, already-executable buffer and return
    /// its index.
    pub fn insert(&self, buffer: ExecutableBuffer, kind: NativeCodeKind, meta: u64) -> CodeIndex {
        let code = NativeCode::new(buffer, kind, meta);
        self.total_code_size.fetch_add(code.code_size(), Ordering::Relaxed);

        if let Some(index) = self.free_list.write().pop() {
            self.entries.write()[index] = Some(code);
            return CodeIndex(index);
        }

        let mut entries = self.entries.write();
        entries.push(Some(code));
        CodeIndex(entries.len() - 1)
    }

    /// Look up the entry address for `index`, or `None` if retired.
    pub fn entry(&self, index: CodeIndex) -> Option<*const u8> {
        self.entries.read()[index.0].as_ref().map(|c| c.entry())
    }

    /// Increment the reference count tracking live `PatchSite`s for this
    /// entry.
    pub fn retain(&self, index: CodeIndex) {
        if let Some(code) = &self.entries.read()[index.0] {
            code.refcount.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Decrement the reference count; when it reaches zero the slot is
    /// eligible for retirement via [`Self::retire_unreferenced`].
    pub fn release(&self, index: CodeIndex) {
        if let Some(code) = &self.entries.read()[index.0] {
            code.refcount.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Reclaim every entry with a zero refcount. The host must call this
    /// only from a safepoint where no thread can be executing a retired
    /// entry's code.
    pub fn retire_unreferenced(&self) {
        let mut entries = self.entries.write();
        let mut free_list = self.free_list.write();
        for (index, slot) in entries.iter_mut().enumerate() {
            let should_retire = matches!(
                slot,
                Some(code) if code.refcount.load(Ordering::Acquire) == 0
            );
            if should_retire {
                if let Some(code) = slot.take() {
                    self.total_code_size.fetch_sub(code.code_size(), Ordering::Relaxed);
                }
                free_list.push(index);
            }
        }
    }

    /// Total bytes of live (non-retired) generated code.
    pub fn total_code_size(&self) -> usize {
        self.total_code_size.load(Ordering::Relaxed)
    }

    /// Number of occupied slots, including ones pending retirement.
    pub fn len(&self) -> usize {
        self.entries.read().iter().filter(|e| e.is_some()).count()
    }
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_buffer() -> ExecutableBuffer {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        buf.emit8(0xC3).unwrap();
        buf.make_executable().unwrap();
        buf
    }

    #[test]
    fn insert_and_look_up_entry() {
        let cache = CodeCache::new();
        let index = cache.insert(stub_buffer(), NativeCodeKind::PropertyStub, 1);
        assert!(cache.entry(index).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn retirement_only_happens_at_zero_refcount() {
        let cache = CodeCache::new();
        let index = cache.insert(stub_buffer(), NativeCodeKind::PropertyStub, 1);
        cache.retain(index);
        cache.retire_unreferenced();
        assert!(cache.entry(index).is_some());
        cache.release(index);
        cache.retire_unreferenced();
        assert!(cache.entry(index).is_none());
    }

    #[test]
    fn retired_slot_is_reused() {
        let cache = CodeCache::new();
        let first = cache.insert(stub_buffer(), NativeCodeKind::PropertyStub, 1);
        cache.retire_unreferenced();
        let second = cache.insert(stub_buffer(), NativeCodeKind::MethodStub, 2);
        assert_eq!(first, second);
    }

    #[test]
    fn patch_site_overwrites_slot() {
        let mut slot: *const u8 = std::ptr::null();
        let site = PatchSite::new(&mut slot as *mut *const u8);
        let target = 0x1234usize as *const u8;
        site.patch(target);
        assert_eq!(slot, target);
    }
}
