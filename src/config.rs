//! Build-time configuration for the resource core.
//!
//! None of these are runtime-tunable; the service types take the counts as
//! const generics, and the aliases in [`crate::cache`] and [`crate::frames`]
//! bake these values in for the embedding kernel.

/// Size of one disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Number of buffer descriptors in the cache.
pub const BUF_COUNT: usize = 30;

/// Number of independently locked hash buckets in the buffer cache.
pub const BUCKET_COUNT: usize = 13;

/// Number of processor cores, and therefore per-core frame pools.
pub const CPU_COUNT: usize = 8;

/// Size of one physical memory frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Most frames one allocation may take from other cores' pools.
pub const STEAL_BATCH: usize = 16;

/// Junk byte written over a frame when it is freed, to surface
/// use-after-free in callers.
pub const FREED_FILL: u8 = 0x01;

/// Junk byte written over a frame when it is allocated, to surface reads of
/// uninitialized memory. Distinct from [`FREED_FILL`] so the two bug classes
/// leave different signatures.
pub const ALLOC_FILL: u8 = 0x05;
