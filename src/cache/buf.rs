use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};

use super::NIL;
use crate::config::BLOCK_SIZE;
use crate::sync::SleepLock;

/// One buffer descriptor: the in-memory mirror of a single disk block.
///
/// The descriptor splits into two ownership domains. The metadata (identity,
/// reference count, recency stamp, bucket link) is serialized by the lock of
/// whichever bucket the descriptor currently belongs to, which is why those
/// fields are atomics rather than being inside a lock of their own. The
/// content lives inside the descriptor's [`SleepLock`] and belongs to
/// whoever holds it, for as long as a disk transfer takes.
///
/// Descriptors are allocated once, live in a fixed arena, and are recycled
/// across unrelated blocks forever; `next` is an arena index (`NIL` ends a
/// bucket's list).
pub(crate) struct Buf {
    pub(super) dev: AtomicU32,
    pub(super) blockno: AtomicU32,
    /// Outstanding holders; only a zero-count descriptor may be evicted.
    pub(super) refcnt: AtomicU32,
    /// Whether `data` holds the block's bytes. Cleared on recycling.
    pub(super) valid: AtomicBool,
    /// Tick of the release that last dropped `refcnt` to zero.
    pub(super) stamp: AtomicU64,
    pub(super) next: AtomicUsize,
    pub(super) data: SleepLock<[u8; BLOCK_SIZE]>,
}

impl Buf {
    pub(super) const fn new() -> Self {
        Buf {
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            stamp: AtomicU64::new(0),
            next: AtomicUsize::new(NIL),
            data: SleepLock::new([0; BLOCK_SIZE]),
        }
    }
}
