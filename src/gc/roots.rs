use parking_lot::Mutex;
use rustc_hash::FxHashSet;

/// A pointer to a slot the host owns that may hold a managed object
/// pointer, registered so the marker treats it as a root.
///
/// The raw address is stored as a `usize` so the set can be `Send`/`Sync`;
/// the host is responsible for keeping the slot alive for as long as it is
/// registered.
pub type RootSlot = *mut *mut u8;

/// The set of root slots the host has registered with the collector.
///
/// Registration and mark-root iteration are both serialized by the same
/// mutex, matching the root-set mutex called out for the concurrency model.
pub struct RootSet {
    slots: Mutex<FxHashSet<usize>>,
}

impl RootSet {
    /// Create an empty root set.
    pub fn new() -> RootSet {
        RootSet {
            slots: Mutex::new(FxHashSet::default()),
        }
    }

    /// Register a root slot. Registering the same slot twice is a no-op.
    pub fn register(&self, slot: RootSlot) {
        self.slots.lock().insert(slot as usize);
    }

    /// Unregister a root slot. Unregistering an unknown slot is a no-op.
    pub fn unregister(&self, slot: RootSlot) {
        self.slots.lock().remove(&(slot as usize));
    }

    /// Number of currently registered roots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether there are no registered roots.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Read every currently non-null root slot's pointee. Slots are read
    /// while holding the lock and copied out so the caller never observes a
    /// torn registration set, but the pointed-to object pointer itself is
    /// whatever the mutator last stored there.
    pub fn snapshot_roots(&self) -> Vec<*mut u8> {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter_map(|&addr| {
                let slot = addr as RootSlot;
                let value = unsafe { *slot };
                if value.is_null() {
                    None
                } else {
                    Some(value)
                }
            })
            .collect()
    }
}

impl Default for RootSet {
    fn default() -> Self {
        Self::new()
    }
}
