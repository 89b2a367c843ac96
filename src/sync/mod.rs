//! Synchronization primitives shared by every core.

pub mod spinlock;

pub use spinlock::{Locked, LockedGuard, SpinLock};
