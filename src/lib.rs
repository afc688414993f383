//! AeroJS runtime performance substrate
//!
//! The parts of a JavaScript engine that live below the interpreter and
//! above the OS: inline caches that turn repeated property/method lookups
//! into a handful of guarded loads, a JIT backend that lowers a small
//! closed IR to RISC-V/x86-64/ARM64 machine code, and an incremental
//! tri-color garbage collector that never stalls the mutator for more
//! than one bounded increment. The host engine owns the interpreter, the
//! object model, and the `Value` representation; this crate only assumes
//! the seams defined in [`abi`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod arch;
pub mod config;
pub mod error;
pub mod exec;
pub mod gc;
pub mod ic;
pub mod jit;

pub use abi::{HostObject, HostValue, ObjectLayout};
pub use config::Config;
pub use error::{AeroError, AeroResult};
pub use exec::{BufferError, ExecutableBuffer};
