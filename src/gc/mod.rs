//! Incremental tri-color garbage collector
//!
//! Non-moving, non-generational by default (a generation tag is reserved
//! in the header for a future pass). Collection work is driven in bounded
//! increments so the mutator is never stalled by a full mark-and-sweep
//! pass; an optional background thread can run marking concurrently with
//! the mutator.
//!
//! # Architecture
//!
//! - **GcHeader**: 16-byte metadata prepended to every managed allocation.
//! - **Heap**: page-based bump allocator with a reuse free list.
//! - **RootSet**: host-registered pointer-to-slot roots.
//! - **GarbageCollector**: phase state machine, gray stack, write barrier,
//!   and statistics.

mod barrier;
mod collector;
mod header;
mod heap;
mod marker;
mod roots;

pub use barrier::{BarrierAction, WriteBarrierType};
pub use collector::{GarbageCollector, GcPhase, GcStats, HeapStats};
pub use header::{GcHeader, ObjectColor, TypeInfo};
pub use heap::Heap;
pub use roots::{RootSet, RootSlot};
