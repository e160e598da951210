//! Synchronization primitives for the resource core.
//!
//! Spin-style mutual exclusion comes from the `spin` crate; this module adds
//! the sleep-style lock that guards a buffer's content across disk I/O.

pub mod sleeplock;

pub use sleeplock::SleepLock;
