/// Monotonic lifecycle of a per-call-site cache.
///
/// Never regresses except through an explicit `invalidate_*` call, which
/// resets a cache to `Uninit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheState {
    /// No entries yet.
    Uninit,
    /// Exactly one shape seen.
    Mono,
    /// Two to `megamorphic_threshold - 1` distinct shapes seen.
    Poly,
    /// Shape diversity or miss rate too high to track individually; the
    /// site falls back to the process-wide megamorphic path.
    Mega,
}

/// One shape's resolution for a property-access call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyCacheEntry {
    /// Shape this entry applies to.
    pub shape_id: u64,
    /// Byte offset of the resolved slot, for both inline and out-of-line
    /// paths.
    pub slot_offset: u32,
    /// Whether the slot lives inline in the object or in its out-of-line
    /// slot array.
    pub is_inline: bool,
    /// Times this entry has been read since creation.
    pub hit_count: u64,
}

/// One shape's resolution for a method-call call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodCacheEntry {
    /// Shape this entry applies to.
    pub shape_id: u64,
    /// Identifier of the resolved function.
    pub function_id: u64,
    /// Entry address of the resolved function's compiled or stub code.
    pub code_address: *const u8,
    /// Times this entry has been read since creation.
    pub hit_count: u64,
}

// Safety: `code_address` points at either a live `NativeCode` entry owned
// by the code cache, or host-compiled code that outlives the VM; the
// manager never dereferences it itself, only hands it back to the caller.
unsafe impl Send for MethodCacheEntry {}
unsafe impl Sync for MethodCacheEntry {}

/// Per-call-site cache for property loads.
#[derive(Debug, Clone)]
pub struct PropertyCache {
    /// The call site this cache belongs to.
    pub site_id: u64,
    /// Current lifecycle state.
    pub state: CacheState,
    /// Known shape resolutions, at most one per shape id.
    pub entries: Vec<PropertyCacheEntry>,
    /// Misses observed since the last state reset.
    pub miss_count: u64,
}

impl PropertyCache {
    /// Create an empty, `Uninit` cache for `site_id`.
    pub fn new(site_id: u64) -> PropertyCache {
        PropertyCache {
            site_id,
            state: CacheState::Uninit,
            entries: Vec::new(),
            miss_count: 0,
        }
    }

    /// Find the entry for `shape_id`, if any, bumping its hit counter.
    pub fn find_and_touch(&mut self, shape_id: u64) -> Option<PropertyCacheEntry> {
        let entry = self.entries.iter_mut().find(|e| e.shape_id == shape_id)?;
        entry.hit_count += 1;
        Some(*entry)
    }

    /// Insert or refresh the entry for `shape_id`. Returns the resulting
    /// state transition, if any occurred.
    pub fn add_entry(
        &mut self,
        shape_id: u64,
        slot_offset: u32,
        is_inline: bool,
        megamorphic_threshold: usize,
    ) -> Option<(CacheState, CacheState)> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.shape_id == shape_id) {
            existing.slot_offset = slot_offset;
            existing.is_inline = is_inline;
            return None;
        }

        self.entries.push(PropertyCacheEntry {
            shape_id,
            slot_offset,
            is_inline,
            hit_count: 0,
        });

        self.advance_state(megamorphic_threshold)
    }

    fn advance_state(&mut self, megamorphic_threshold: usize) -> Option<(CacheState, CacheState)> {
        let from = self.state;
        let to = match from {
            CacheState::Uninit => CacheState::Mono,
            CacheState::Mono => CacheState::Poly,
            CacheState::Poly | CacheState::Mega => {
                if self.entries.len() >= megamorphic_threshold {
                    CacheState::Mega
                } else {
                    CacheState::Poly
                }
            }
        };
        if to != from {
            self.state = to;
            Some((from, to))
        } else {
            None
        }
    }

    /// Record a miss, possibly promoting to `Mega` on its own if the miss
    /// threshold is exceeded.
    pub fn record_miss(&mut self, miss_threshold: u64) -> Option<(CacheState, CacheState)> {
        self.miss_count += 1;
        if self.miss_count > miss_threshold && self.state != CacheState::Mega {
            let from = self.state;
            self.state = CacheState::Mega;
            Some((from, CacheState::Mega))
        } else {
            None
        }
    }

    /// Reset to `Uninit`, dropping every entry.
    pub fn invalidate(&mut self) {
        self.state = CacheState::Uninit;
        self.entries.clear();
        self.miss_count = 0;
    }

    /// Drop only the entry for `shape_id`, if present.
    pub fn invalidate_shape(&mut self, shape_id: u64) {
        self.entries.retain(|e| e.shape_id != shape_id);
        if self.entries.is_empty() {
            self.state = CacheState::Uninit;
        }
    }
}

/// Per-call-site cache for method calls. Mirrors [`PropertyCache`].
#[derive(Debug, Clone)]
pub struct MethodCache {
    /// The call site this cache belongs to.
    pub site_id: u64,
    /// Current lifecycle state.
    pub state: CacheState,
    /// Known shape resolutions, at most one per shape id.
    pub entries: Vec<MethodCacheEntry>,
    /// Misses observed since the last state reset.
    pub miss_count: u64,
}

impl MethodCache {
    /// Create an empty, `Uninit` cache for `site_id`.
    pub fn new(site_id: u64) -> MethodCache {
        MethodCache {
            site_id,
            state: CacheState::Uninit,
            entries: Vec::new(),
            miss_count: 0,
        }
    }

    /// Find the entry for `shape_id`, if any, bumping its hit counter.
    pub fn find_and_touch(&mut self, shape_id: u64) -> Option<MethodCacheEntry> {
        let entry = self.entries.iter_mut().find(|e| e.shape_id == shape_id)?;
        entry.hit_count += 1;
        Some(*entry)
    }

    /// Insert or refresh the entry for `shape_id`. Returns the resulting
    /// state transition, if any occurred.
    pub fn add_entry(
        &mut self,
        shape_id: u64,
        function_id: u64,
        code_address: *const u8,
        megamorphic_threshold: usize,
    ) -> Option<(CacheState, CacheState)> {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.shape_id == shape_id) {
            existing.function_id = function_id;
            existing.code_address = code_address;
            return None;
        }

        self.entries.push(MethodCacheEntry {
            shape_id,
            function_id,
            code_address,
            hit_count: 0,
        });

        self.advance_state(megamorphic_threshold)
    }

    fn advance_state(&mut self, megamorphic_threshold: usize) -> Option<(CacheState, CacheState)> {
        let from = self.state;
        let to = match from {
            CacheState::Uninit => CacheState::Mono,
            CacheState::Mono => CacheState::Poly,
            CacheState::Poly | CacheState::Mega => {
                if self.entries.len() >= megamorphic_threshold {
                    CacheState::Mega
                } else {
                    CacheState::Poly
                }
            }
        };
        if to != from {
            self.state = to;
            Some((from, to))
        } else {
            None
        }
    }

    /// Record a miss, possibly promoting to `Mega` on its own if the miss
    /// threshold is exceeded.
    pub fn record_miss(&mut self, miss_threshold: u64) -> Option<(CacheState, CacheState)> {
        self.miss_count += 1;
        if self.miss_count > miss_threshold && self.state != CacheState::Mega {
            let from = self.state;
            self.state = CacheState::Mega;
            Some((from, CacheState::Mega))
        } else {
            None
        }
    }

    /// Reset to `Uninit`, dropping every entry.
    pub fn invalidate(&mut self) {
        self.state = CacheState::Uninit;
        self.entries.clear();
        self.miss_count = 0;
    }

    /// Drop only the entry for `shape_id`, if present.
    pub fn invalidate_shape(&mut self, shape_id: u64) {
        self.entries.retain(|e| e.shape_id != shape_id);
        if self.entries.is_empty() {
            self.state = CacheState::Uninit;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninit_to_mono_on_first_entry() {
        let mut cache = PropertyCache::new(1);
        let transition = cache.add_entry(0xAA, 0, true, 8);
        assert_eq!(transition, Some((CacheState::Uninit, CacheState::Mono)));
        assert_eq!(cache.state, CacheState::Mono);
    }

    #[test]
    fn mono_to_poly_on_second_shape() {
        let mut cache = PropertyCache::new(1);
        cache.add_entry(0xAA, 0, true, 8);
        let transition = cache.add_entry(0xBB, 8, true, 8);
        assert_eq!(transition, Some((CacheState::Mono, CacheState::Poly)));
    }

    #[test]
    fn poly_to_mega_at_threshold() {
        let mut cache = PropertyCache::new(1);
        for shape in 0..8u64 {
            cache.add_entry(shape, 0, true, 8);
        }
        assert_eq!(cache.state, CacheState::Mega);
    }

    #[test]
    fn entries_stay_unique_per_shape() {
        let mut cache = PropertyCache::new(1);
        cache.add_entry(0xAA, 0, true, 8);
        cache.add_entry(0xAA, 16, false, 8);
        assert_eq!(cache.entries.len(), 1);
        assert_eq!(cache.entries[0].slot_offset, 16);
        assert!(!cache.entries[0].is_inline);
    }

    #[test]
    fn miss_threshold_promotes_to_mega() {
        let mut cache = PropertyCache::new(1);
        cache.add_entry(0xAA, 0, true, 8);
        for _ in 0..65 {
            cache.record_miss(64);
        }
        assert_eq!(cache.state, CacheState::Mega);
    }

    #[test]
    fn invalidate_resets_to_uninit() {
        let mut cache = PropertyCache::new(1);
        cache.add_entry(0xAA, 0, true, 8);
        cache.invalidate();
        assert_eq!(cache.state, CacheState::Uninit);
        assert!(cache.entries.is_empty());
    }

    #[test]
    fn state_never_regresses_without_invalidate() {
        let mut cache = PropertyCache::new(1);
        cache.add_entry(0xAA, 0, true, 8);
        cache.add_entry(0xBB, 8, true, 8);
        assert_eq!(cache.state, CacheState::Poly);
        // Re-adding an existing shape must not regress state.
        cache.add_entry(0xAA, 0, true, 8);
        assert_eq!(cache.state, CacheState::Poly);
    }
}
