//! Inline cache manager
//!
//! Owns one [`PropertyCache`] per property-access call site and one
//! [`MethodCache`] per method-call call site, decides when to regenerate
//! stubs, and keeps every registered patch site pointed at the current
//! stub. Parameterized by a [`StubGenerator`] so the same manager logic
//! drives whichever architecture the host targets.

use std::marker::PhantomData;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::abi::{HostObject, ObjectLayout};
use crate::config::IcConfig;
use crate::error::AeroError;
use crate::exec::ExecutableBuffer;
use crate::ic::cache::{CacheState, MethodCache, MethodCacheEntry, PropertyCache, PropertyCacheEntry};
use crate::ic::megamorphic::MegamorphicTable;
use crate::ic::patch::{CodeCache, CodeIndex, NativeCodeKind, PatchSite};
use crate::ic::stub::{MissHandlers, StubGenerator};

/// Where a resolved property lives, returned by the host's property
/// resolution logic.
#[derive(Debug, Clone, Copy)]
pub struct PropertyLocation {
    /// Inline path: a byte offset from the object base, used directly
    /// (`obj[slot_offset]`). Out-of-line path: a slot *index*, scaled by
    /// [`ObjectLayout::SLOT_WIDTH`] to get the byte offset into the
    /// out-of-line slot array (`slots[slot_offset * 8]`).
    pub slot_offset: u32,
    /// Whether the slot lives inline in the object or in its out-of-line
    /// slot array.
    pub is_inline: bool,
}

/// Supplied by the host to resolve a property name on a concrete object
/// when a call site misses. The core never interprets property names
/// itself.
pub trait PropertyResolver {
    /// Resolve `name` on `obj`. `None` means the property does not exist
    /// (or resolution otherwise failed); the cache records a miss but is
    /// not otherwise touched.
    fn resolve(&self, obj: &dyn HostObject, name: &str) -> Option<PropertyLocation>;
}

/// Supplied by the host to resolve a method name on a concrete object.
pub trait MethodResolver {
    /// Resolve `name` on `obj`, returning the resolved function id and its
    /// compiled or stub entry address.
    fn resolve(&self, obj: &dyn HostObject, name: &str) -> Option<(u64, *const u8)>;
}

fn read_property_value(obj: &dyn HostObject, slot_offset: u32, inline: bool) -> u64 {
    if inline {
        obj.inline_slot(slot_offset)
    } else {
        obj.out_of_line_slot(slot_offset * ObjectLayout::SLOT_WIDTH)
    }
}

/// Per-call-site inline cache manager, generic over the target
/// architecture's [`StubGenerator`].
pub struct InlineCacheManager<A: StubGenerator> {
    property_caches: RwLock<FxHashMap<u64, Mutex<PropertyCache>>>,
    method_caches: RwLock<FxHashMap<u64, Mutex<MethodCache>>>,
    property_patch_sites: Mutex<FxHashMap<u64, Vec<PatchSite>>>,
    method_patch_sites: Mutex<FxHashMap<u64, Vec<PatchSite>>>,
    property_stub_code: Mutex<FxHashMap<u64, CodeIndex>>,
    method_stub_code: Mutex<FxHashMap<u64, CodeIndex>>,
    code_cache: CodeCache,
    megamorphic_table: MegamorphicTable,
    handlers: MissHandlers,
    config: IcConfig,
    _arch: PhantomData<A>,
}

const STUB_BUFFER_BASE_BYTES: usize = 256;
const STUB_BUFFER_PER_ENTRY_BYTES: usize = 128;
const DEFAULT_MEGAMORPHIC_CAPACITY: usize = 4096;

impl<A: StubGenerator> InlineCacheManager<A> {
    /// Create an empty manager bound to `handlers` and `config`.
    pub fn new(config: IcConfig, handlers: MissHandlers) -> InlineCacheManager<A> {
        InlineCacheManager {
            property_caches: RwLock::new(FxHashMap::default()),
            method_caches: RwLock::new(FxHashMap::default()),
            property_patch_sites: Mutex::new(FxHashMap::default()),
            method_patch_sites: Mutex::new(FxHashMap::default()),
            property_stub_code: Mutex::new(FxHashMap::default()),
            method_stub_code: Mutex::new(FxHashMap::default()),
            code_cache: CodeCache::new(),
            megamorphic_table: MegamorphicTable::new(DEFAULT_MEGAMORPHIC_CAPACITY),
            handlers,
            config,
            _arch: PhantomData,
        }
    }

    /// Process-wide megamorphic method dispatch table, shared by every
    /// megamorphic method stub this manager generates.
    pub fn megamorphic_table(&self) -> &MegamorphicTable {
        &self.megamorphic_table
    }

    /// Total bytes of live stub code.
    pub fn stub_code_size(&self) -> usize {
        self.code_cache.total_code_size()
    }

    /// Return a stable per-site property cache, creating it if this is the
    /// first time `site_id` has been seen.
    pub fn get_or_create_property_cache(&self, site_id: u64) {
        if self.property_caches.read().contains_key(&site_id) {
            return;
        }
        self.property_caches
            .write()
            .entry(site_id)
            .or_insert_with(|| Mutex::new(PropertyCache::new(site_id)));
    }

    /// Return a stable per-site method cache, creating it if this is the
    /// first time `site_id` has been seen.
    pub fn get_or_create_method_cache(&self, site_id: u64) {
        if self.method_caches.read().contains_key(&site_id) {
            return;
        }
        self.method_caches
            .write()
            .entry(site_id)
            .or_insert_with(|| Mutex::new(MethodCache::new(site_id)));
    }

    /// Slow-path property access: searches the cache by shape, regenerates
    /// and patches the stub on a state transition, and asks `resolver` to
    /// look up the property on a miss.
    pub fn handle_property_access(
        &self,
        site_id: u64,
        obj: &dyn HostObject,
        name: &str,
        resolver: &dyn PropertyResolver,
    ) -> Result<Option<u64>, AeroError> {
        self.get_or_create_property_cache(site_id);
        let shape_id = obj.shape_id();

        let caches = self.property_caches.read();
        let cache_lock = &caches[&site_id];
        let mut cache = cache_lock.lock();

        if let Some(entry) = cache.find_and_touch(shape_id) {
            trace!("ic: property hit site={site_id} shape={shape_id}");
            return Ok(Some(read_property_value(obj, entry.slot_offset, entry.is_inline)));
        }

        let Some(location) = resolver.resolve(obj, name) else {
            let transition = cache.record_miss(self.config.miss_threshold);
            let state = cache.state;
            let entries = cache.entries.clone();
            drop(cache);
            drop(caches);
            if let Some((from, to)) = transition {
                debug!("ic: property site={site_id} miss-promoted {from:?} -> {to:?}");
                self.regenerate_property_stub(site_id, state, &entries)?;
            }
            return Ok(None);
        };

        let transition = cache.add_entry(
            shape_id,
            location.slot_offset,
            location.is_inline,
            self.config.megamorphic_threshold,
        );
        let value = read_property_value(obj, location.slot_offset, location.is_inline);
        let state = cache.state;
        let entries = cache.entries.clone();
        drop(cache);
        drop(caches);

        if let Some((from, to)) = transition {
            debug!("ic: property site={site_id} {from:?} -> {to:?} ({} shapes)", entries.len());
            self.regenerate_property_stub(site_id, state, &entries)?;
        }

        Ok(Some(value))
    }

    /// Slow-path method call: symmetric to [`Self::handle_property_access`].
    pub fn handle_method_call(
        &self,
        site_id: u64,
        obj: &dyn HostObject,
        name: &str,
        resolver: &dyn MethodResolver,
    ) -> Result<Option<*const u8>, AeroError> {
        self.get_or_create_method_cache(site_id);
        let shape_id = obj.shape_id();

        let caches = self.method_caches.read();
        let cache_lock = &caches[&site_id];
        let mut cache = cache_lock.lock();

        if let Some(entry) = cache.find_and_touch(shape_id) {
            trace!("ic: method hit site={site_id} shape={shape_id}");
            return Ok(Some(entry.code_address));
        }

        let Some((function_id, code_address)) = resolver.resolve(obj, name) else {
            let transition = cache.record_miss(self.config.miss_threshold);
            let state = cache.state;
            let entries = cache.entries.clone();
            drop(cache);
            drop(caches);
            if let Some((from, to)) = transition {
                debug!("ic: method site={site_id} miss-promoted {from:?} -> {to:?}");
                self.regenerate_method_stub(site_id, state, &entries)?;
            }
            return Ok(None);
        };

        let transition = cache.add_entry(
            shape_id,
            function_id,
            code_address,
            self.config.megamorphic_threshold,
        );
        let state = cache.state;
        let entries = cache.entries.clone();
        drop(cache);
        drop(caches);

        if let Some((from, to)) = transition {
            debug!("ic: method site={site_id} {from:?} -> {to:?} ({} shapes)", entries.len());
            self.regenerate_method_stub(site_id, state, &entries)?;
        }

        Ok(Some(code_address))
    }

    /// Register a patch site for a property-access call site, writing the
    /// currently active stub's address immediately if one exists.
    pub fn patch_property_access(&self, site_id: u64, slot: *mut *const u8) {
        let site = PatchSite::new(slot);
        if let Some(index) = self.property_stub_code.lock().get(&site_id).copied() {
            if let Some(entry) = self.code_cache.entry(index) {
                site.patch(entry);
            }
        }
        self.property_patch_sites.lock().entry(site_id).or_default().push(site);
    }

    /// Register a patch site for a method-call call site.
    pub fn patch_method_call(&self, site_id: u64, slot: *mut *const u8) {
        let site = PatchSite::new(slot);
        if let Some(index) = self.method_stub_code.lock().get(&site_id).copied() {
            if let Some(entry) = self.code_cache.entry(index) {
                site.patch(entry);
            }
        }
        self.method_patch_sites.lock().entry(site_id).or_default().push(site);
    }

    /// Drop every entry matching `shape_id` from every cache and fall back
    /// every registered site to a megamorphic stub that always defers to
    /// the miss handler.
    pub fn invalidate_for_shape(&self, shape_id: u64) -> Result<(), AeroError> {
        let property_sites: Vec<u64> = {
            let caches = self.property_caches.read();
            caches
                .iter()
                .filter_map(|(&site_id, cache)| {
                    let mut cache = cache.lock();
                    let had_it = cache.entries.iter().any(|e| e.shape_id == shape_id);
                    cache.invalidate_shape(shape_id);
                    had_it.then_some(site_id)
                })
                .collect()
        };
        for site_id in property_sites {
            self.regenerate_property_mega_stub(site_id)?;
        }

        let method_sites: Vec<u64> = {
            let caches = self.method_caches.read();
            caches
                .iter()
                .filter_map(|(&site_id, cache)| {
                    let mut cache = cache.lock();
                    let had_it = cache.entries.iter().any(|e| e.shape_id == shape_id);
                    cache.invalidate_shape(shape_id);
                    had_it.then_some(site_id)
                })
                .collect()
        };
        for site_id in method_sites {
            self.regenerate_method_mega_stub(site_id)?;
        }
        Ok(())
    }

    /// Conservatively invalidate every property cache, since entries do not
    /// carry the property name that would let a narrower invalidation be
    /// precise.
    pub fn invalidate_for_property(&self, _name: &str) -> Result<(), AeroError> {
        let site_ids: Vec<u64> = {
            let caches = self.property_caches.read();
            for cache in caches.values() {
                cache.lock().invalidate();
            }
            caches.keys().copied().collect()
        };
        for site_id in site_ids {
            self.regenerate_property_mega_stub(site_id)?;
        }
        Ok(())
    }

    /// Invalidate every property and method cache.
    pub fn invalidate_all(&self) -> Result<(), AeroError> {
        let property_sites: Vec<u64> = {
            let caches = self.property_caches.read();
            for cache in caches.values() {
                cache.lock().invalidate();
            }
            caches.keys().copied().collect()
        };
        for site_id in property_sites {
            self.regenerate_property_mega_stub(site_id)?;
        }

        let method_sites: Vec<u64> = {
            let caches = self.method_caches.read();
            for cache in caches.values() {
                cache.lock().invalidate();
            }
            caches.keys().copied().collect()
        };
        for site_id in method_sites {
            self.regenerate_method_mega_stub(site_id)?;
        }
        Ok(())
    }

    fn regenerate_property_stub(
        &self,
        site_id: u64,
        state: CacheState,
        entries: &[PropertyCacheEntry],
    ) -> Result<(), AeroError> {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(STUB_BUFFER_BASE_BYTES + entries.len() * STUB_BUFFER_PER_ENTRY_BYTES)?;
        match state {
            CacheState::Uninit => return Ok(()),
            CacheState::Mono => A::emit_property_mono(&mut buf, &entries[0], site_id, &self.handlers)?,
            CacheState::Poly => A::emit_property_poly(&mut buf, entries, site_id, &self.handlers)?,
            CacheState::Mega => A::emit_property_mega(&mut buf, site_id, &self.handlers)?,
        }
        self.install_property_stub(site_id, buf)
    }

    fn regenerate_property_mega_stub(&self, site_id: u64) -> Result<(), AeroError> {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(STUB_BUFFER_BASE_BYTES)?;
        A::emit_property_mega(&mut buf, site_id, &self.handlers)?;
        self.install_property_stub(site_id, buf)
    }

    fn install_property_stub(&self, site_id: u64, mut buf: ExecutableBuffer) -> Result<(), AeroError> {
        buf.make_executable()?;
        let index = self.code_cache.insert(buf, NativeCodeKind::PropertyStub, site_id);
        let entry = self.code_cache.entry(index).expect("just inserted");

        let mut stub_code = self.property_stub_code.lock();
        let previous = stub_code.insert(site_id, index);
        drop(stub_code);
        if let Some(previous) = previous {
            self.code_cache.release(previous);
        }
        self.code_cache.retain(index);

        let sites = self.property_patch_sites.lock();
        if let Some(patch_sites) = sites.get(&site_id) {
            for site in patch_sites {
                site.patch(entry);
            }
        }
        Ok(())
    }

    fn regenerate_method_stub(
        &self,
        site_id: u64,
        state: CacheState,
        entries: &[MethodCacheEntry],
    ) -> Result<(), AeroError> {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(STUB_BUFFER_BASE_BYTES + entries.len() * STUB_BUFFER_PER_ENTRY_BYTES)?;
        match state {
            CacheState::Uninit => return Ok(()),
            CacheState::Mono => A::emit_method_mono(&mut buf, &entries[0], site_id, &self.handlers)?,
            CacheState::Poly => A::emit_method_poly(&mut buf, entries, site_id, &self.handlers)?,
            CacheState::Mega => {
                let table_ptr = self.megamorphic_table.entries_ptr() as u64;
                let mask = self.megamorphic_table.mask();
                A::emit_method_mega(&mut buf, table_ptr, mask, &self.handlers)?
            }
        }
        self.install_method_stub(site_id, buf)
    }

    fn regenerate_method_mega_stub(&self, site_id: u64) -> Result<(), AeroError> {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(STUB_BUFFER_BASE_BYTES)?;
        let table_ptr = self.megamorphic_table.entries_ptr() as u64;
        let mask = self.megamorphic_table.mask();
        A::emit_method_mega(&mut buf, table_ptr, mask, &self.handlers)?;
        self.install_method_stub(site_id, buf)
    }

    fn install_method_stub(&self, site_id: u64, mut buf: ExecutableBuffer) -> Result<(), AeroError> {
        buf.make_executable()?;
        let index = self.code_cache.insert(buf, NativeCodeKind::MethodStub, site_id);
        let entry = self.code_cache.entry(index).expect("just inserted");

        let mut stub_code = self.method_stub_code.lock();
        let previous = stub_code.insert(site_id, index);
        drop(stub_code);
        if let Some(previous) = previous {
            self.code_cache.release(previous);
        }
        self.code_cache.retain(index);

        let sites = self.method_patch_sites.lock();
        if let Some(patch_sites) = sites.get(&site_id) {
            for site in patch_sites {
                site.patch(entry);
            }
        }
        Ok(())
    }

    /// Reclaim stub code with no live patch-site reference. The host must
    /// only call this from a safepoint.
    pub fn retire_unreferenced_stubs(&self) {
        let before = self.code_cache.len();
        self.code_cache.retire_unreferenced();
        let after = self.code_cache.len();
        if after < before {
            warn!("ic: retired {} stub(s), {} remain", before - after, after);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::test_support::TestObject;
    use crate::ic::stub::RiscV64;

    fn handlers() -> MissHandlers {
        MissHandlers {
            property_miss: 0x1000,
            method_miss: 0x2000,
            megamorphic_method_miss: 0x3000,
        }
    }

    struct FixedResolver {
        location: Option<PropertyLocation>,
    }
    impl PropertyResolver for FixedResolver {
        fn resolve(&self, _obj: &dyn HostObject, _name: &str) -> Option<PropertyLocation> {
            self.location
        }
    }

    #[test]
    fn monomorphic_hit_returns_value_and_promotes_state() {
        let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
        let obj = TestObject::new(0xAA, vec![42]);
        let resolver = FixedResolver { location: Some(PropertyLocation { slot_offset: 0, is_inline: true }) };

        let result = manager.handle_property_access(1, &obj, "x", &resolver).unwrap();
        assert_eq!(result, Some(42));

        let caches = manager.property_caches.read();
        assert_eq!(caches[&1].lock().state, CacheState::Mono);
    }

    #[test]
    fn second_shape_promotes_to_poly_and_regenerates_stub() {
        let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
        let resolver = FixedResolver { location: Some(PropertyLocation { slot_offset: 0, is_inline: true }) };

        let obj1 = TestObject::new(1, vec![10]);
        manager.handle_property_access(5, &obj1, "x", &resolver).unwrap();
        let obj2 = TestObject::new(2, vec![20]);
        manager.handle_property_access(5, &obj2, "x", &resolver).unwrap();

        let caches = manager.property_caches.read();
        assert_eq!(caches[&5].lock().state, CacheState::Poly);
        drop(caches);
        assert!(manager.stub_code_size() > 0);
    }

    #[test]
    fn miss_without_resolution_returns_none_and_bumps_miss_count() {
        let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
        let resolver = FixedResolver { location: None };
        let obj = TestObject::new(1, vec![]);

        let result = manager.handle_property_access(9, &obj, "missing", &resolver).unwrap();
        assert_eq!(result, None);

        let caches = manager.property_caches.read();
        assert_eq!(caches[&9].lock().miss_count, 1);
        assert_eq!(caches[&9].lock().state, CacheState::Uninit);
    }

    #[test]
    fn patch_site_receives_current_stub_on_registration() {
        let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
        let resolver = FixedResolver { location: Some(PropertyLocation { slot_offset: 0, is_inline: true }) };
        let obj = TestObject::new(1, vec![7]);
        manager.handle_property_access(3, &obj, "x", &resolver).unwrap();

        let mut slot: *const u8 = std::ptr::null();
        manager.patch_property_access(3, &mut slot as *mut *const u8);
        assert!(!slot.is_null());
    }

    #[test]
    fn invalidate_for_shape_resets_state_to_uninit() {
        let manager: InlineCacheManager<RiscV64> = InlineCacheManager::new(IcConfig::default(), handlers());
        let resolver = FixedResolver { location: Some(PropertyLocation { slot_offset: 0, is_inline: true }) };
        let obj = TestObject::new(1, vec![7]);
        manager.handle_property_access(4, &obj, "x", &resolver).unwrap();
        manager.invalidate_for_shape(1).unwrap();

        let caches = manager.property_caches.read();
        assert_eq!(caches[&4].lock().state, CacheState::Uninit);
    }
}
