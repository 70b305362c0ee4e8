//! Garbage collection
//!
//! - [`Heap`]: mark-sweep string arena
//! - [`ThreadRegistry`]: which OS threads may touch managed memory, and the
//!   stop-the-world handshake a collection needs before it can run

mod heap;
mod threads;

pub use heap::{GcRef, GcStats, Heap};
pub use threads::{ThreadError, ThreadRegistry};
