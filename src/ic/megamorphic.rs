use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

/// One slot of the process-wide megamorphic method cache.
///
/// 32 bytes: `shape_id`, `method_hash`, `code`, `hit_count`. This is the
/// RISC-V naming from the original sources (over the ARM64 variant's
/// `hiddenClass/method/propertyHash/lastAccessed`), picked because
/// `hit_count` is read by the stats path while `lastAccessed` has no
/// reader anywhere in this crate's contracts.
#[repr(C)]
pub struct MegamorphicEntry {
    shape_id: AtomicU64,
    method_hash: AtomicU64,
    code: AtomicPtr<u8>,
    hit_count: AtomicU64,
}

impl MegamorphicEntry {
    fn empty() -> MegamorphicEntry {
        MegamorphicEntry {
            shape_id: AtomicU64::new(0),
            method_hash: AtomicU64::new(0),
            code: AtomicPtr::new(std::ptr::null_mut()),
            hit_count: AtomicU64::new(0),
        }
    }
}

/// Fixed-size, power-of-two-sized hash table shared by every megamorphic
/// method-call stub in the process.
///
/// Indexed by `(shape_id, method_hash) & mask`; a double match on shape
/// and method hash tail-calls the cached code directly, otherwise the
/// stub falls back to the method-miss handler, which repopulates the
/// slot.
pub struct MegamorphicTable {
    entries: Vec<MegamorphicEntry>,
    mask: u64,
}

impl MegamorphicTable {
    /// Create a table with `capacity` slots, rounded up to a power of two.
    pub fn new(capacity: usize) -> MegamorphicTable {
        let capacity = capacity.max(1).next_power_of_two();
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, MegamorphicEntry::empty);
        MegamorphicTable {
            entries,
            mask: (capacity - 1) as u64,
        }
    }

    fn slot_index(&self, shape_id: u64, method_hash: u64) -> usize {
        (shape_id ^ method_hash.rotate_left(17)) as usize & self.mask as usize
    }

    /// Look up `(shape_id, method_hash)`. Returns the cached code address
    /// on a double match and bumps the hit counter; `None` otherwise.
    pub fn lookup(&self, shape_id: u64, method_hash: u64) -> Option<*const u8> {
        let entry = &self.entries[self.slot_index(shape_id, method_hash)];
        if entry.shape_id.load(Ordering::Acquire) == shape_id
            && entry.method_hash.load(Ordering::Acquire) == method_hash
        {
            entry.hit_count.fetch_add(1, Ordering::Relaxed);
            let code = entry.code.load(Ordering::Acquire);
            if code.is_null() {
                None
            } else {
                Some(code as *const u8)
            }
        } else {
            None
        }
    }

    /// Write back a resolution, evicting whatever previously occupied the
    /// slot.
    pub fn insert(&self, shape_id: u64, method_hash: u64, code: *const u8) {
        let entry = &self.entries[self.slot_index(shape_id, method_hash)];
        entry.shape_id.store(shape_id, Ordering::Relaxed);
        entry.method_hash.store(method_hash, Ordering::Relaxed);
        entry.hit_count.store(0, Ordering::Relaxed);
        entry.code.store(code as *mut u8, Ordering::Release);
    }

    /// Number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Base address of the slot array, for baking into megamorphic method
    /// stubs that pass it on to the miss handler.
    pub fn entries_ptr(&self) -> *const MegamorphicEntry {
        self.entries.as_ptr()
    }

    /// Index mask (`capacity - 1`), baked into megamorphic method stubs
    /// alongside [`Self::entries_ptr`].
    pub fn mask(&self) -> u64 {
        self.mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_lookup_hits() {
        let table = MegamorphicTable::new(16);
        let code = 0x2000usize as *const u8;
        table.insert(0xAA, 0x01, code);
        assert_eq!(table.lookup(0xAA, 0x01), Some(code));
    }

    #[test]
    fn lookup_misses_on_hash_mismatch() {
        let table = MegamorphicTable::new(16);
        table.insert(0xAA, 0x01, 0x2000usize as *const u8);
        assert_eq!(table.lookup(0xAA, 0x02), None);
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let table = MegamorphicTable::new(10);
        assert_eq!(table.capacity(), 16);
    }

    #[test]
    fn insert_evicts_previous_occupant_on_collision() {
        let table = MegamorphicTable::new(1);
        table.insert(1, 1, 0x1000 as *const u8);
        table.insert(2, 2, 0x2000 as *const u8);
        assert_eq!(table.lookup(1, 1), None);
        assert_eq!(table.lookup(2, 2), Some(0x2000 as *const u8));
    }
}
