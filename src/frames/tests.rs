use std::collections::HashSet;
use std::ptr::NonNull;
use std::thread;

use super::{FramePool, OutOfFrames};
use crate::config::{ALLOC_FILL, FREED_FILL, PAGE_SIZE, STEAL_BATCH};
use crate::frames::freelist::FreeNode;
use crate::testing::{TestPlatform, TestRegion, on_cpu};

type SmallPool = FramePool<TestPlatform, 4>;

fn pool_with(pages: usize) -> (SmallPool, TestRegion) {
    let region = TestRegion::new(pages);
    let pool = FramePool::new();
    unsafe {
        pool.init(region.start(), region.end());
    }
    (pool, region)
}

#[test]
fn init_fills_the_initializing_cores_pool() {
    let (pool, _region) = pool_with(32);

    assert_eq!(pool.pool_len(0), 32);
    for cpu in 1..4 {
        assert_eq!(pool.pool_len(cpu), 0);
    }
    assert_eq!(pool.free_frames(), 32);
}

#[test]
fn junk_patterns_mark_both_transitions() {
    let (pool, _region) = pool_with(4);

    let page = pool.alloc().unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(page.as_ptr(), PAGE_SIZE) };
    assert!(bytes.iter().all(|&b| b == ALLOC_FILL));

    unsafe {
        pool.free(page);
    }
    // The head of a freed page is the list node; the rest keeps the fill.
    let tail = unsafe {
        std::slice::from_raw_parts(
            page.as_ptr().add(size_of::<FreeNode>()),
            PAGE_SIZE - size_of::<FreeNode>(),
        )
    };
    assert!(tail.iter().all(|&b| b == FREED_FILL));
}

#[test]
fn allocation_is_exhaustive_and_unique() {
    let (pool, _region) = pool_with(32);

    let mut seen = HashSet::new();
    while let Ok(page) = pool.alloc() {
        assert!(seen.insert(page.as_ptr() as usize), "frame issued twice");
    }
    assert_eq!(seen.len(), 32);
    assert_eq!(pool.alloc(), Err(OutOfFrames));
    assert_eq!(pool.free_frames(), 0);

    // Every freed frame becomes allocatable again.
    for &addr in &seen {
        unsafe {
            pool.free(NonNull::new(addr as *mut u8).unwrap());
        }
    }
    assert_eq!(pool.free_frames(), 32);
    assert!(pool.alloc().is_ok());
}

#[test]
fn empty_core_steals_a_bounded_batch() {
    let (pool, _region) = pool_with(32);

    // Core 1 starts empty; its first allocation takes a whole batch from
    // core 0 and keeps the remainder locally.
    on_cpu(1);
    let page = pool.alloc().unwrap();

    assert_eq!(pool.pool_len(0), 32 - STEAL_BATCH);
    assert_eq!(pool.pool_len(1), STEAL_BATCH - 1);

    unsafe {
        pool.free(page);
    }
    assert_eq!(pool.pool_len(1), STEAL_BATCH);
    assert_eq!(pool.free_frames(), 32);
}

#[test]
fn stealing_takes_what_little_there_is() {
    let (pool, _region) = pool_with(3);

    on_cpu(2);
    let _page = pool.alloc().unwrap();

    assert_eq!(pool.pool_len(0), 0);
    assert_eq!(pool.pool_len(2), 2);
}

#[test]
fn frames_are_conserved_under_contention() {
    let (pool, _region) = pool_with(32);

    thread::scope(|s| {
        let pool = &pool;
        for _ in 0..4 {
            s.spawn(move || {
                for _ in 0..100 {
                    let mut held = Vec::new();
                    for _ in 0..4 {
                        if let Ok(page) = pool.alloc() {
                            held.push(page.as_ptr() as usize);
                        }
                    }
                    for addr in held {
                        unsafe {
                            pool.free(NonNull::new_unchecked(addr as *mut u8));
                        }
                    }
                }
            });
        }
    });

    assert_eq!(pool.free_frames(), 32);
}

#[test]
#[should_panic(expected = "misaligned")]
fn misaligned_free_halts() {
    let (pool, region) = pool_with(4);

    unsafe {
        pool.free(NonNull::new_unchecked(region.start().as_ptr().add(1)));
    }
}

#[test]
#[should_panic(expected = "outside managed range")]
fn out_of_range_free_halts() {
    let (pool, region) = pool_with(4);

    unsafe {
        pool.free(region.end());
    }
}

#[test]
#[should_panic(expected = "already initialized")]
fn double_init_halts() {
    let (pool, region) = pool_with(4);

    unsafe {
        pool.init(region.start(), region.end());
    }
}

#[test]
#[should_panic(expected = "not initialized")]
fn free_before_init_halts() {
    let region = TestRegion::new(1);
    let pool: SmallPool = FramePool::new();

    unsafe {
        pool.free(region.start());
    }
}
