use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::config::GcConfig;
use crate::error::AeroError;

use super::barrier::{BarrierAction, WriteBarrierType};
use super::header::{GcHeader, ObjectColor, TypeInfo};
use super::heap::Heap;
use super::marker::MarkerHandle;
use super::roots::{RootSet, RootSlot};

/// Collection phase, matching the fixed cycle
/// `IDLE -> MARKING -> SWEEPING -> FINALIZING -> IDLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhase {
    /// No collection in progress.
    Idle = 0,
    /// Tracing reachable objects from the root set.
    Marking = 1,
    /// Reclaiming unreached (White) objects.
    Sweeping = 2,
    /// Rolling up per-cycle counters before returning to `Idle`.
    Finalizing = 3,
}

impl GcPhase {
    fn from_u8(v: u8) -> GcPhase {
        match v {
            1 => GcPhase::Marking,
            2 => GcPhase::Sweeping,
            3 => GcPhase::Finalizing,
            _ => GcPhase::Idle,
        }
    }
}

/// Cumulative and per-cycle collector statistics.
#[derive(Debug, Clone, Default)]
pub struct GcStats {
    /// Number of full collection cycles completed.
    pub total_collections: u64,
    /// Number of bounded increments performed (marking or sweeping).
    pub total_increments: u64,
    /// Total time spent marking, across all cycles.
    pub total_marking_time: Duration,
    /// Total time spent sweeping, across all cycles.
    pub total_sweeping_time: Duration,
    /// Mean wall time of one increment.
    pub average_increment_time: Duration,
    /// Longest single increment observed, in microseconds.
    pub max_increment_time_us: u64,
    /// Objects blackened since the last stats reset.
    pub objects_marked: u64,
    /// Objects freed since the last stats reset.
    pub objects_swept: u64,
    /// Times the write barrier actually shaded something.
    pub write_barrier_activations: u64,
    /// Fraction of wall time the mutator ran uninterrupted, estimated from
    /// increment durations versus time between collections.
    pub mutator_utilization: f64,
}

/// Point-in-time heap occupancy.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    /// Total bytes reserved across all pages.
    pub heap_size: usize,
    /// Bytes currently charged to live or not-yet-swept objects.
    pub used_memory: usize,
    /// Number of pages allocated.
    pub page_count: usize,
}

struct SweepCursor {
    worklist: Vec<NonNull<GcHeader>>,
    index: usize,
}

/// Incremental tri-color mark-and-sweep collector.
///
/// Non-moving: pages never compact, so raw pointers held by the mutator
/// stay valid across increments. Marking and sweeping are both resumable
/// bounded-time operations driven by [`GarbageCollector::perform_increment`].
pub struct GarbageCollector {
    config: GcConfig,
    phase: AtomicU8,
    heap: Mutex<Heap>,
    roots: RootSet,
    gray_stack: Mutex<Vec<*mut u8>>,
    sweep: Mutex<Option<SweepCursor>>,
    stats: Mutex<GcStats>,
    allocations_since_last_gc: AtomicU64,
    bytes_allocated_since_last_gc: AtomicU64,
    write_barrier_activations: AtomicU64,
    last_gc: Mutex<Instant>,
    collection_requested: std::sync::atomic::AtomicBool,
    marker: Mutex<Option<MarkerHandle>>,
}

// Safety: the only raw pointers held (`gray_stack`, `sweep` worklist) are
// always accessed through their owning `Mutex`; no thread ever reads or
// writes them without holding that lock, matching the gray-stack/root-set
// mutex discipline described for the collector's concurrency model.
unsafe impl Send for GarbageCollector {}
unsafe impl Sync for GarbageCollector {}

impl GarbageCollector {
    /// Construct a collector from validated configuration.
    pub fn new(config: GcConfig) -> GarbageCollector {
        GarbageCollector {
            heap: Mutex::new(Heap::new(config.page_size, config.object_alignment)),
            roots: RootSet::new(),
            gray_stack: Mutex::new(Vec::new()),
            sweep: Mutex::new(None),
            stats: Mutex::new(GcStats::default()),
            allocations_since_last_gc: AtomicU64::new(0),
            bytes_allocated_since_last_gc: AtomicU64::new(0),
            write_barrier_activations: AtomicU64::new(0),
            last_gc: Mutex::new(Instant::now()),
            collection_requested: std::sync::atomic::AtomicBool::new(false),
            marker: Mutex::new(None),
            config,
        }
    }

    /// Current collection phase.
    pub fn phase(&self) -> GcPhase {
        GcPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: GcPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Whether a collection is currently in any phase but `Idle`.
    pub fn is_running(&self) -> bool {
        self.phase() != GcPhase::Idle
    }

    /// Register a root slot the host owns.
    pub fn register_root(&self, slot: RootSlot) {
        self.roots.register(slot);
    }

    /// Unregister a previously registered root slot.
    pub fn unregister_root(&self, slot: RootSlot) {
        self.roots.unregister(slot);
    }

    /// Allocate `payload_size` bytes described by `type_info` (pass a null
    /// pointer for an opaque, non-traceable allocation).
    ///
    /// During `MARKING`, new objects are allocated `Gray` and pushed to the
    /// gray stack so the mutator cannot allocate an object the marker has
    /// already passed by (the snapshot-at-the-beginning invariant on new
    /// allocations).
    pub fn allocate(
        &self,
        payload_size: usize,
        type_info: *const TypeInfo,
    ) -> Result<*mut u8, AeroError> {
        let initial_color = if self.phase() == GcPhase::Marking {
            ObjectColor::Gray
        } else {
            ObjectColor::White
        };

        let payload = {
            let mut heap = self.heap.lock();
            match heap.allocate(payload_size, type_info, initial_color) {
                Some(p) => p,
                None => {
                    drop(heap);
                    self.collect();
                    let mut heap = self.heap.lock();
                    heap.allocate(payload_size, type_info, initial_color)
                        .ok_or(AeroError::OutOfMemory {
                            requested: payload_size,
                        })?
                }
            }
        };

        if initial_color == ObjectColor::Gray {
            self.gray_stack.lock().push(payload.as_ptr());
        }

        self.allocations_since_last_gc.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated_since_last_gc
            .fetch_add(payload_size as u64, Ordering::Relaxed);

        if self.should_trigger_collection() {
            self.collection_requested.store(true, Ordering::Relaxed);
        }

        trace!("gc: allocated {} bytes at {:p}", payload_size, payload.as_ptr());
        Ok(payload.as_ptr())
    }

    fn should_trigger_collection(&self) -> bool {
        let heap = self.heap.lock();
        let utilization = if heap.heap_size() == 0 {
            0.0
        } else {
            heap.used_memory() as f64 / heap.heap_size() as f64
        };
        drop(heap);

        utilization > self.config.heap_target_utilization
            || self.allocations_since_last_gc.load(Ordering::Relaxed)
                > self.config.allocation_trigger_count
            || self.last_gc.lock().elapsed() > Duration::from_secs(self.config.time_trigger_secs)
    }

    /// Fire the write barrier for `holder.field := new_value`.
    ///
    /// Outside `MARKING` this degrades to the documented single branch: no
    /// atomic work happens and the activation counter is untouched.
    pub fn write_barrier(&self, holder: *mut u8, new_value: *mut u8) {
        if self.phase() != GcPhase::Marking {
            return;
        }
        let heap = self.heap.lock();
        let holder_black = if heap.contains(holder) {
            let header = unsafe { &*heap.header_of(holder) };
            header.color() == ObjectColor::Black
        } else {
            false
        };
        let new_white = !new_value.is_null()
            && heap.contains(new_value)
            && unsafe { &*heap.header_of(new_value) }.color() == ObjectColor::White;
        drop(heap);

        let BarrierAction {
            shade_holder,
            shade_new_value,
        } = self.config.write_barrier_type.decide(holder_black, new_white);

        if !shade_holder && !shade_new_value {
            return;
        }

        let heap = self.heap.lock();
        if shade_holder {
            let header = unsafe { &*heap.header_of(holder) };
            header.set_color(ObjectColor::Gray);
            self.gray_stack.lock().push(holder);
        }
        if shade_new_value {
            let header = unsafe { &*heap.header_of(new_value) };
            header.set_color(ObjectColor::Gray);
            self.gray_stack.lock().push(new_value);
        }
        drop(heap);

        self.write_barrier_activations.fetch_add(1, Ordering::Relaxed);
    }

    fn start_collection(&self) {
        debug!("gc: starting collection, phase -> Marking");
        self.initialize_marking();
        self.set_phase(GcPhase::Marking);
        self.collection_requested.store(false, Ordering::Relaxed);

        if self.config.concurrent_mode {
            let collector = SelfRef(self as *const GarbageCollector);
            let handle = MarkerHandle::spawn(move |budget_us| {
                // Safety: the collector outlives the marker thread; the
                // thread is stopped (joined) before `self` is dropped via
                // `Drop for GarbageCollector`.
                let gc = unsafe { &*collector.0 };
                gc.phase() != GcPhase::Marking || gc.perform_marking_increment(budget_us)
            });
            *self.marker.lock() = Some(handle);
        }
    }

    fn initialize_marking(&self) {
        self.gray_stack.lock().clear();
        for header in self.heap.lock().iter_headers() {
            unsafe { header.as_ref() }.set_color(ObjectColor::White);
        }
        let roots = self.roots.snapshot_roots();
        let heap = self.heap.lock();
        let mut gray_stack = self.gray_stack.lock();
        for root in roots {
            if root.is_null() || !heap.contains(root) {
                continue;
            }
            let header = unsafe { &*heap.header_of(root) };
            if header.color() == ObjectColor::White {
                header.set_color(ObjectColor::Gray);
                gray_stack.push(root);
            }
        }
    }

    /// Pop and blacken objects from the gray stack until it is empty or
    /// `budget_us` has elapsed. Returns `true` once the stack is empty
    /// (marking complete).
    pub fn perform_marking_increment(&self, budget_us: u64) -> bool {
        let start = Instant::now();
        let budget = Duration::from_micros(budget_us);
        let mut marked = 0u64;

        loop {
            let next = self.gray_stack.lock().pop();
            let object = match next {
                Some(obj) => obj,
                None => {
                    self.record_increment(GcPhase::Marking, start.elapsed(), marked, 0);
                    self.finish_marking();
                    return true;
                }
            };
            self.blacken(object);
            marked += 1;
            if start.elapsed() >= budget {
                break;
            }
        }
        self.record_increment(GcPhase::Marking, start.elapsed(), marked, 0);
        false
    }

    fn blacken(&self, object: *mut u8) {
        let heap = self.heap.lock();
        if !heap.contains(object) {
            return;
        }
        let header = unsafe { &*heap.header_of(object) };
        let type_info = header.type_info();
        if !type_info.is_null() {
            let mut to_push = Vec::new();
            let trace = unsafe { (*type_info).trace };
            let object_nonnull = unsafe { NonNull::new_unchecked(object) };
            unsafe {
                trace(object_nonnull, &mut |child: *mut u8| {
                    if child.is_null() || !heap.contains(child) {
                        return;
                    }
                    let child_header = &*heap.header_of(child);
                    if child_header.color() == ObjectColor::White {
                        child_header.set_color(ObjectColor::Gray);
                        to_push.push(child);
                    }
                });
            }
            drop(heap);
            self.gray_stack.lock().extend(to_push);
        } else {
            drop(heap);
        }
        let heap = self.heap.lock();
        unsafe { &*heap.header_of(object) }.set_color(ObjectColor::Black);
    }

    fn finish_marking(&self) {
        if let Some(marker) = self.marker.lock().take() {
            marker.stop();
        }
        self.initialize_sweeping();
        self.set_phase(GcPhase::Sweeping);
        debug!("gc: marking complete, phase -> Sweeping");
    }

    fn initialize_sweeping(&self) {
        let worklist = self.heap.lock().iter_headers().collect();
        *self.sweep.lock() = Some(SweepCursor { worklist, index: 0 });
    }

    /// Reclaim White objects and reset Gray/Black objects to White, up to
    /// `budget_us`. Returns `true` once every page has been swept.
    pub fn perform_sweeping_increment(&self, budget_us: u64) -> bool {
        let start = Instant::now();
        let budget = Duration::from_micros(budget_us);
        let mut swept = 0u64;

        loop {
            let header = {
                let mut sweep = self.sweep.lock();
                let cursor = sweep.as_mut().expect("sweep cursor missing in Sweeping phase");
                if cursor.index >= cursor.worklist.len() {
                    None
                } else {
                    let h = cursor.worklist[cursor.index];
                    cursor.index += 1;
                    Some(h)
                }
            };

            let header = match header {
                Some(h) => h,
                None => {
                    self.record_increment(GcPhase::Sweeping, start.elapsed(), 0, swept);
                    self.finish_sweeping();
                    return true;
                }
            };

            let color = unsafe { header.as_ref() }.color();
            match color {
                ObjectColor::White => {
                    self.heap.lock().free(header);
                    swept += 1;
                }
                ObjectColor::Gray | ObjectColor::Black => {
                    unsafe { header.as_ref() }.set_color(ObjectColor::White);
                }
            }

            if start.elapsed() >= budget {
                break;
            }
        }
        self.record_increment(GcPhase::Sweeping, start.elapsed(), 0, swept);
        false
    }

    fn finish_sweeping(&self) {
        *self.sweep.lock() = None;
        self.set_phase(GcPhase::Finalizing);
        debug!("gc: sweeping complete, phase -> Finalizing");
        self.finalize();
    }

    fn finalize(&self) {
        let mut stats = self.stats.lock();
        stats.total_collections += 1;
        self.allocations_since_last_gc.store(0, Ordering::Relaxed);
        self.bytes_allocated_since_last_gc.store(0, Ordering::Relaxed);
        *self.last_gc.lock() = Instant::now();
        self.set_phase(GcPhase::Idle);
        debug!("gc: finalized, phase -> Idle ({} collections total)", stats.total_collections);
    }

    fn record_increment(&self, phase: GcPhase, elapsed: Duration, marked: u64, swept: u64) {
        let mut stats = self.stats.lock();
        stats.total_increments += 1;
        stats.objects_marked += marked;
        stats.objects_swept += swept;
        match phase {
            GcPhase::Marking => stats.total_marking_time += elapsed,
            GcPhase::Sweeping => stats.total_sweeping_time += elapsed,
            _ => {}
        }
        let elapsed_us = elapsed.as_micros() as u64;
        stats.max_increment_time_us = stats.max_increment_time_us.max(elapsed_us);
        let n = stats.total_increments;
        let prev_avg_us = stats.average_increment_time.as_micros() as u64;
        let new_avg_us = prev_avg_us + (elapsed_us.saturating_sub(prev_avg_us)) / n.max(1);
        stats.average_increment_time = Duration::from_micros(new_avg_us);
        stats.write_barrier_activations = self.write_barrier_activations.load(Ordering::Relaxed);

        if elapsed_us > GcConfig::MAX_INCREMENT_TIME_US {
            warn!(
                "gc: increment exceeded max budget: {}us > {}us",
                elapsed_us,
                GcConfig::MAX_INCREMENT_TIME_US
            );
        }
    }

    /// Perform one bounded unit of collection work, starting a new cycle
    /// if one is not already running and a trigger has fired.
    pub fn perform_increment(&self, budget_us: u64) {
        let budget_us = budget_us.min(GcConfig::MAX_INCREMENT_TIME_US);
        match self.phase() {
            GcPhase::Idle => {
                if self.collection_requested.load(Ordering::Relaxed) || self.should_trigger_collection()
                {
                    self.start_collection();
                    self.perform_marking_increment(budget_us);
                }
            }
            GcPhase::Marking => {
                self.perform_marking_increment(budget_us);
            }
            GcPhase::Sweeping => {
                self.perform_sweeping_increment(budget_us);
            }
            GcPhase::Finalizing => {
                self.finalize();
            }
        }
    }

    /// Run increments back to back until the collector returns to `Idle`.
    /// Must not be called from a managed-code fast path.
    pub fn collect(&self) {
        if self.phase() == GcPhase::Idle {
            self.start_collection();
        }
        while self.phase() != GcPhase::Idle {
            self.perform_increment(GcConfig::MAX_INCREMENT_TIME_US);
        }
    }

    /// Snapshot of cumulative collector statistics.
    pub fn stats(&self) -> GcStats {
        self.stats.lock().clone()
    }

    /// Snapshot of current heap occupancy.
    pub fn heap_stats(&self) -> HeapStats {
        let heap = self.heap.lock();
        HeapStats {
            heap_size: heap.heap_size(),
            used_memory: heap.used_memory(),
            page_count: heap.page_count(),
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.lock().take() {
            marker.stop();
        }
    }
}

/// Wrapper to move a raw pointer to `self` into the marker thread closure.
/// The collector is guaranteed to outlive the marker (it is stopped in
/// `finish_marking` and in `Drop`), so dereferencing it from the marker
/// thread is sound.
struct SelfRef(*const GarbageCollector);
unsafe impl Send for SelfRef {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GcConfig {
        let mut cfg = GcConfig::default();
        cfg.write_barrier_type = WriteBarrierType::SnapshotAtBeginning;
        cfg
    }

    #[test]
    fn allocate_returns_usable_pointer() {
        let gc = GarbageCollector::new(test_config());
        let ptr = gc.allocate(16, std::ptr::null()).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(gc.heap_stats().page_count, 1);
    }

    #[test]
    fn collect_on_empty_heap_returns_to_idle() {
        let gc = GarbageCollector::new(test_config());
        gc.collect();
        assert_eq!(gc.phase(), GcPhase::Idle);
        assert_eq!(gc.stats().total_collections, 1);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let gc = GarbageCollector::new(test_config());
        for _ in 0..64 {
            gc.allocate(32, std::ptr::null()).unwrap();
        }
        let used_before = gc.heap_stats().used_memory;
        gc.collect();
        assert!(gc.heap_stats().used_memory < used_before);
        assert!(gc.stats().objects_swept >= 64);
    }

    #[test]
    fn rooted_object_survives_collection() {
        let gc = GarbageCollector::new(test_config());
        let obj = gc.allocate(16, std::ptr::null()).unwrap();
        let mut slot = obj;
        gc.register_root(&mut slot);
        gc.collect();
        assert_eq!(slot, obj);
        gc.unregister_root(&mut slot);
        gc.collect();
    }

    #[test]
    fn perform_increment_respects_idle_with_no_trigger() {
        let gc = GarbageCollector::new(test_config());
        gc.allocate(16, std::ptr::null()).unwrap();
        gc.perform_increment(1000);
        assert_eq!(gc.phase(), GcPhase::Idle);
    }
}
