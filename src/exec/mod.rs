//! Executable code buffer
//!
//! Hands out W-then-X memory shared by the IC stub generator and the JIT
//! backend. Built on raw `mmap`/`mprotect` via `libc`, the way the corpus's
//! lowest-level crates (`raya-runtime`, `raya-ffi`) reach for OS primitives
//! directly rather than through a higher-level wrapper crate.

mod buffer;

pub use buffer::{BufferError, ExecutableBuffer};
