//! The block buffer cache.
//!
//! This module provides:
//! - A fixed arena of buffer descriptors holding cached disk blocks
//! - Hashed lookup across independently locked buckets
//! - Cross-bucket LRU eviction that never holds more than two bucket locks
//! - Pinning, so a block survives eviction across several acquire cycles
//!
//! The cache is both a read cache and the synchronization point for disk
//! blocks shared between kernel threads: [`BufferCache::read`] hands back a
//! [`BlockGuard`] whose holder has the block's content to itself until the
//! guard drops.

pub(crate) mod buf;


use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::Ordering;

use log::{info, trace};
use spin::{Mutex, MutexGuard};

use crate::cache::buf::Buf;
use crate::config::{BLOCK_SIZE, BUCKET_COUNT, BUF_COUNT};
use crate::platform::{BlockDevice, Platform};

/// The buffer cache sized for the configured descriptor and bucket counts.
pub type KernelBufferCache<P, D> = BufferCache<P, D, BUF_COUNT, BUCKET_COUNT>;

/// End-of-list marker for intra-bucket links.
pub(crate) const NIL: usize = usize::MAX;

/// One hash partition: the head of a singly linked list of descriptor
/// indices, threaded through [`Buf::next`].
struct Bucket {
    head: usize,
}

/// A sharded cache of `N` disk-block buffers across `SHARDS` buckets.
///
/// Lookups lock a single bucket. Only a miss escalates to the eviction
/// scan, and even that holds at most two bucket locks at once (the bucket
/// being examined plus the bucket owning the best victim so far), so no
/// operation ever stops the whole cache.
pub struct BufferCache<P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize> {
    device: D,
    buffers: [Buf; N],
    buckets: [Mutex<Bucket>; SHARDS],
    _platform: PhantomData<P>,
}

impl<P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize>
    BufferCache<P, D, N, SHARDS>
{
    /// Creates the cache with every descriptor unused and parked in bucket
    /// zero, from where eviction redistributes them on demand.
    pub fn new(device: D) -> Self {
        let cache = BufferCache {
            device,
            buffers: core::array::from_fn(|_| Buf::new()),
            buckets: core::array::from_fn(|_| Mutex::new(Bucket { head: NIL })),
            _platform: PhantomData,
        };
        {
            let mut bucket = cache.buckets[0].lock();
            for index in 0..N {
                cache.buffers[index].next.store(bucket.head, Ordering::Relaxed);
                bucket.head = index;
            }
        }
        info!("buffer cache initialized: {N} buffers across {SHARDS} buckets");
        cache
    }

    /// Returns the requested block with its content loaded and exclusively
    /// held. Issues a device read only if the cached copy is not valid, so
    /// concurrent first readers of one block coalesce into a single
    /// transfer.
    pub fn read(&self, dev: u32, blockno: u32) -> BlockGuard<'_, P, D, N, SHARDS> {
        let index = self.get(dev, blockno);
        let buf = &self.buffers[index];
        if !buf.valid.load(Ordering::Relaxed) {
            // The use-lock is held, so the content is exclusively ours.
            let data = unsafe { &mut *buf.data.get() };
            self.device.read(dev, blockno, data);
            buf.valid.store(true, Ordering::Relaxed);
        }
        BlockGuard { cache: self, index }
    }

    /// Drops one pin. The block becomes evictable again once its reference
    /// count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor is unreferenced, which means the pin
    /// bookkeeping of some caller is broken.
    pub fn unpin(&self, pin: PinnedBlock) {
        let buf = &self.buffers[pin.index];
        let _bucket = self.buckets[self.bucket_of(pin.dev, pin.blockno)].lock();
        let refs = buf.refcnt.load(Ordering::Relaxed);
        assert!(refs > 0, "unpinning unreferenced buffer");
        buf.refcnt.store(refs - 1, Ordering::Relaxed);
    }

    /// Finds the descriptor for `(dev, blockno)`, recycling the least
    /// recently used unreferenced descriptor on a miss. Returns its index
    /// with the reference count raised and the use-lock held.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        let key = self.bucket_of(dev, blockno);

        {
            let bucket = self.buckets[key].lock();
            if let Some(index) = self.scan(&bucket, dev, blockno) {
                self.buffers[index].refcnt.fetch_add(1, Ordering::Relaxed);
                drop(bucket);
                self.buffers[index].data.acquire::<P>();
                return index;
            }
        }

        // Not cached. Recycle the unreferenced descriptor with the oldest
        // release, scanning buckets in ascending order and keeping only the
        // best candidate's bucket locked behind the scan. The victim is
        // unlinked under that same lock, so two concurrent evictions cannot
        // pick the same descriptor.
        let mut best: Option<(usize, MutexGuard<'_, Bucket>)> = None;
        let mut best_stamp = u64::MAX;
        for shard in &self.buckets {
            let bucket = shard.lock();
            let mut found = None;
            let mut index = bucket.head;
            while index != NIL {
                let buf = &self.buffers[index];
                if buf.refcnt.load(Ordering::Relaxed) == 0 {
                    let stamp = buf.stamp.load(Ordering::Relaxed);
                    if stamp < best_stamp {
                        best_stamp = stamp;
                        found = Some(index);
                    }
                }
                index = buf.next.load(Ordering::Relaxed);
            }
            if let Some(index) = found {
                // Assigning releases the previous best's bucket.
                best = Some((index, bucket));
            }
        }

        let Some((victim, mut owner)) = best else {
            panic!("buffer cache: no unreferenced buffers to evict");
        };
        trace!("evicting buffer {victim} for block ({dev}, {blockno})");
        self.unlink(&mut owner, victim);
        drop(owner);

        let mut bucket = self.buckets[key].lock();
        if let Some(index) = self.scan(&bucket, dev, blockno) {
            // A concurrent lookup populated the block while no lock was
            // held. Take the hit, and give the victim (still carrying its
            // old identity and content) back to its home bucket as
            // reclaimed capacity.
            self.buffers[index].refcnt.fetch_add(1, Ordering::Relaxed);
            drop(bucket);

            let old = &self.buffers[victim];
            let home = self.bucket_of(
                old.dev.load(Ordering::Relaxed),
                old.blockno.load(Ordering::Relaxed),
            );
            let mut home_bucket = self.buckets[home].lock();
            self.push(&mut home_bucket, victim);
            drop(home_bucket);

            self.buffers[index].data.acquire::<P>();
            return index;
        }

        let buf = &self.buffers[victim];
        buf.dev.store(dev, Ordering::Relaxed);
        buf.blockno.store(blockno, Ordering::Relaxed);
        buf.valid.store(false, Ordering::Relaxed);
        buf.refcnt.store(1, Ordering::Relaxed);
        self.push(&mut bucket, victim);
        drop(bucket);

        buf.data.acquire::<P>();
        victim
    }

    fn bucket_of(&self, dev: u32, blockno: u32) -> usize {
        (dev as usize + blockno as usize) % SHARDS
    }

    /// Looks for `(dev, blockno)` in one bucket's list. Caller holds the
    /// bucket's lock.
    fn scan(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut index = bucket.head;
        while index != NIL {
            let buf = &self.buffers[index];
            if buf.dev.load(Ordering::Relaxed) == dev
                && buf.blockno.load(Ordering::Relaxed) == blockno
            {
                return Some(index);
            }
            index = buf.next.load(Ordering::Relaxed);
        }
        None
    }

    fn push(&self, bucket: &mut Bucket, index: usize) {
        self.buffers[index].next.store(bucket.head, Ordering::Relaxed);
        bucket.head = index;
    }

    fn unlink(&self, bucket: &mut Bucket, index: usize) {
        let next = self.buffers[index].next.load(Ordering::Relaxed);
        if bucket.head == index {
            bucket.head = next;
            return;
        }
        let mut cur = bucket.head;
        while cur != NIL {
            let after = self.buffers[cur].next.load(Ordering::Relaxed);
            if after == index {
                self.buffers[cur].next.store(next, Ordering::Relaxed);
                return;
            }
            cur = after;
        }
        panic!("buffer cache: descriptor missing from its bucket");
    }
}

/// Exclusive hold on one cached block.
///
/// Derefs to the block's payload. Dropping the guard is the release
/// operation: the use-lock opens first, then the reference count drops
/// under the owning bucket's lock, and a count of zero records the current
/// tick as the block's recency stamp. Recency is measured from last
/// release, not last acquisition.
pub struct BlockGuard<'a, P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize> {
    cache: &'a BufferCache<P, D, N, SHARDS>,
    index: usize,
}

impl<P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize>
    BlockGuard<'_, P, D, N, SHARDS>
{
    /// Device identifier of the held block.
    pub fn dev(&self) -> u32 {
        self.cache.buffers[self.index].dev.load(Ordering::Relaxed)
    }

    /// Block number of the held block.
    pub fn blockno(&self) -> u32 {
        self.cache.buffers[self.index].blockno.load(Ordering::Relaxed)
    }

    /// Writes the held content through to the device, blocking until the
    /// transfer completes.
    pub fn write(&self) {
        self.cache.device.write(self.dev(), self.blockno(), self);
    }

    /// Takes an extra reference that outlives this guard, keeping the block
    /// resident across later acquire/release cycles until the returned
    /// token is passed to [`BufferCache::unpin`].
    #[must_use]
    pub fn pin(&self) -> PinnedBlock {
        let buf = &self.cache.buffers[self.index];
        let dev = buf.dev.load(Ordering::Relaxed);
        let blockno = buf.blockno.load(Ordering::Relaxed);
        let _bucket = self.cache.buckets[self.cache.bucket_of(dev, blockno)].lock();
        buf.refcnt.fetch_add(1, Ordering::Relaxed);
        PinnedBlock {
            index: self.index,
            dev,
            blockno,
        }
    }
}

impl<P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize> Deref
    for BlockGuard<'_, P, D, N, SHARDS>
{
    type Target = [u8; BLOCK_SIZE];

    fn deref(&self) -> &Self::Target {
        // The guard witnesses the use-lock.
        unsafe { &*self.cache.buffers[self.index].data.get() }
    }
}

impl<P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize> DerefMut
    for BlockGuard<'_, P, D, N, SHARDS>
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.cache.buffers[self.index].data.get() }
    }
}

impl<P: Platform, D: BlockDevice, const N: usize, const SHARDS: usize> Drop
    for BlockGuard<'_, P, D, N, SHARDS>
{
    fn drop(&mut self) {
        let buf = &self.cache.buffers[self.index];
        let dev = buf.dev.load(Ordering::Relaxed);
        let blockno = buf.blockno.load(Ordering::Relaxed);
        unsafe {
            buf.data.release::<P>();
        }
        let _bucket = self.cache.buckets[self.cache.bucket_of(dev, blockno)].lock();
        if buf.refcnt.fetch_sub(1, Ordering::Relaxed) == 1 {
            buf.stamp.store(P::ticks(), Ordering::Relaxed);
        }
    }
}

/// Witness of one [`BlockGuard::pin`] call. Not copyable, so every pin is
/// balanced by exactly one [`BufferCache::unpin`].
pub struct PinnedBlock {
    index: usize,
    dev: u32,
    blockno: u32,
}
