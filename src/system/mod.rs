//! Thread-safe primitives shared by the build-orchestration components:
//! a per-key exclusivity registry and a broadcast-based fan-out pool.

mod keyed_lock;
mod sink;

pub use keyed_lock::{KeyedLockGuard, KeyedLockRegistry};
pub use sink::SinkPool;
