//! Physical frame allocation for the resource core.
//!
//! This module provides:
//! - Per-core free lists of page-sized frames, each behind its own spin lock
//! - Cross-core stealing when the local pool runs dry
//! - Junk fill patterns on both free and allocate to surface stale pointers
//!
//! Every frame of the managed range starts on the initializing core's pool;
//! other cores fill their pools lazily by stealing under allocation
//! pressure, so no rebalancing step ever runs.

pub(crate) mod freelist;

#[cfg(test)]
mod tests;

use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use conquer_once::spin::OnceCell;
use log::{debug, info};
use spin::Mutex;

use crate::config::{ALLOC_FILL, CPU_COUNT, FREED_FILL, PAGE_SIZE, STEAL_BATCH};
use crate::frames::freelist::FreeList;
use crate::platform::Platform;

/// The frame pool sized for the configured core count.
pub type KernelFramePool<P> = FramePool<P, CPU_COUNT>;

/// Allocation failed because no core had a free frame left.
///
/// This is the allocator's one recoverable error: the caller decides how the
/// operation that wanted the memory degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfFrames;

impl fmt::Display for OutOfFrames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no free frames on any core")
    }
}

impl core::error::Error for OutOfFrames {}

/// The extent of physical memory handed to [`FramePool::init`].
struct ManagedRange {
    start: usize,
    end: usize,
}

/// A per-core pool of free page frames with cross-core stealing.
///
/// `CPUS` is the number of pools; [`Platform::cpu_id`] selects the calling
/// thread's pool. Within one pool all operations are serialized by its spin
/// lock; across pools the only interaction is stealing, which holds the
/// donor's lock only while detaching a batch.
pub struct FramePool<P: Platform, const CPUS: usize> {
    pools: [Mutex<FreeList>; CPUS],
    range: OnceCell<ManagedRange>,
    _platform: PhantomData<P>,
}

impl<P: Platform, const CPUS: usize> FramePool<P, CPUS> {
    /// Creates a pool with no managed memory. Call [`FramePool::init`]
    /// before allocating.
    pub fn new() -> Self {
        FramePool {
            pools: core::array::from_fn(|_| Mutex::new(FreeList::new())),
            range: OnceCell::uninit(),
            _platform: PhantomData,
        }
    }

    /// Hands the physical range `[start, end)` to the allocator, freeing
    /// every whole page-aligned frame in it onto the calling core's pool.
    ///
    /// # Safety
    ///
    /// The caller must own the range exclusively, and nothing may touch it
    /// afterwards except through frames returned by [`FramePool::alloc`].
    ///
    /// # Panics
    ///
    /// Panics if the pool was already initialized.
    pub unsafe fn init(&self, start: NonNull<u8>, end: NonNull<u8>) {
        let first = page_round_up(start.as_ptr() as usize);
        let end = end.as_ptr() as usize;
        self.range
            .try_init_once(|| ManagedRange { start: first, end })
            .expect("frame pool already initialized");

        let mut page = first;
        let mut count = 0usize;
        while page + PAGE_SIZE <= end {
            unsafe {
                self.free(NonNull::new_unchecked(page as *mut u8));
            }
            page += PAGE_SIZE;
            count += 1;
        }

        info!("frame pool initialized with {count} frames on cpu {}", P::cpu_id());
    }

    /// Returns a frame to the calling core's pool.
    ///
    /// The frame is filled with [`FREED_FILL`] so a caller still reading
    /// through a stale pointer sees garbage, not its old data.
    ///
    /// # Safety
    ///
    /// `page` must have come from [`FramePool::alloc`] on this pool (or be
    /// a fresh frame during [`FramePool::init`]) and must not be used again
    /// until reallocated.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not page-aligned or lies outside the managed
    /// range; both indicate a bug in the caller, never a runtime condition.
    pub unsafe fn free(&self, page: NonNull<u8>) {
        let range = self.range.try_get().expect("frame pool not initialized");
        let addr = page.as_ptr() as usize;
        assert!(addr % PAGE_SIZE == 0, "freeing misaligned frame");
        assert!(
            addr >= range.start && addr + PAGE_SIZE <= range.end,
            "freeing frame outside managed range"
        );

        unsafe {
            ptr::write_bytes(page.as_ptr(), FREED_FILL, PAGE_SIZE);
        }

        let mut pool = self.pools[P::cpu_id()].lock();
        pool.push(page.cast());
    }

    /// Allocates one page-sized frame, preferring the calling core's pool
    /// and stealing from other cores when it is empty.
    ///
    /// The frame comes back filled with [`ALLOC_FILL`]; callers that read
    /// before initializing see garbage with a recognizable signature. Never
    /// blocks beyond the pool spin locks; exhaustion is an [`OutOfFrames`]
    /// result, not a halt.
    pub fn alloc(&self) -> Result<NonNull<u8>, OutOfFrames> {
        let cpu = P::cpu_id();
        let mut local = self.pools[cpu].lock();

        let page = match local.pop() {
            Some(page) => page,
            None => {
                // The local lock stays held: the pool is empty and must
                // still be empty when the stolen remainder replaces it.
                let mut taken = self.steal(cpu);
                match taken.pop() {
                    Some(page) => {
                        *local = taken;
                        page
                    }
                    None => return Err(OutOfFrames),
                }
            }
        };
        drop(local);

        let page = page.cast::<u8>();
        unsafe {
            ptr::write_bytes(page.as_ptr(), ALLOC_FILL, PAGE_SIZE);
        }
        Ok(page)
    }

    /// Detaches up to [`STEAL_BATCH`] frames from other cores' pools,
    /// visiting them in index order and stopping as soon as the batch is
    /// full, even mid-list. Holds one donor lock at a time.
    fn steal(&self, cpu: usize) -> FreeList {
        let mut taken = FreeList::new();
        for (donor, pool) in self.pools.iter().enumerate() {
            if donor == cpu {
                continue;
            }
            pool.lock().donate(&mut taken, STEAL_BATCH);
            if taken.len() == STEAL_BATCH {
                break;
            }
        }
        if !taken.is_empty() {
            debug!("cpu {cpu} stole {} frames", taken.len());
        }
        taken
    }

    /// Number of free frames on one core's pool.
    pub fn pool_len(&self, cpu: usize) -> usize {
        self.pools[cpu].lock().len()
    }

    /// Number of free frames across all pools.
    pub fn free_frames(&self) -> usize {
        self.pools.iter().map(|pool| pool.lock().len()).sum()
    }
}

impl<P: Platform, const CPUS: usize> Default for FramePool<P, CPUS> {
    fn default() -> Self {
        Self::new()
    }
}

const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
