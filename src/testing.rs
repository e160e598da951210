//! Test doubles for the consumed primitives.
//!
//! Everything here runs on the host: cores are a thread-local index, the
//! tick counter is a shared atomic, sleeping is a yield, and the disk is a
//! hash map that counts its transfers.

use std::alloc::Layout;
use std::cell::Cell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::config::{BLOCK_SIZE, PAGE_SIZE};
use crate::platform::{BlockDevice, Platform};

pub struct TestPlatform;

thread_local! {
    static CPU: Cell<usize> = Cell::new(0);
}

static CLOCK: AtomicU64 = AtomicU64::new(0);

impl Platform for TestPlatform {
    fn cpu_id() -> usize {
        CPU.with(Cell::get)
    }

    // Advances on every read, standing in for the timer that would tick
    // between any two operations; consecutive releases get distinct stamps.
    fn ticks() -> u64 {
        CLOCK.fetch_add(1, Ordering::Relaxed)
    }

    fn sleep(_channel: usize) {
        std::thread::yield_now();
    }

    fn wake(_channel: usize) {}
}

/// Runs the rest of the current test thread as core `cpu`. New threads
/// start on core 0.
pub fn on_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

/// In-memory block device that counts transfers. Unwritten blocks read as
/// zeroes.
pub struct MemDisk {
    blocks: Mutex<HashMap<(u32, u32), [u8; BLOCK_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDisk {
    pub fn new() -> Self {
        MemDisk {
            blocks: Mutex::new(HashMap::new()),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn preload(&self, dev: u32, blockno: u32, fill: u8) {
        self.blocks
            .lock()
            .unwrap()
            .insert((dev, blockno), [fill; BLOCK_SIZE]);
    }

    pub fn contents(&self, dev: u32, blockno: u32) -> Option<[u8; BLOCK_SIZE]> {
        self.blocks.lock().unwrap().get(&(dev, blockno)).copied()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let blocks = self.blocks.lock().unwrap();
        *data = blocks.get(&(dev, blockno)).copied().unwrap_or([0; BLOCK_SIZE]);
    }

    fn write(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock().unwrap().insert((dev, blockno), *data);
    }
}

/// A page-aligned memory region for frame pool tests. Deliberately leaked;
/// the pool keeps linking nodes through it for the rest of the process.
pub struct TestRegion {
    base: *mut u8,
    bytes: usize,
}

impl TestRegion {
    pub fn new(pages: usize) -> Self {
        let bytes = pages * PAGE_SIZE;
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null());
        TestRegion { base, bytes }
    }

    pub fn start(&self) -> NonNull<u8> {
        NonNull::new(self.base).unwrap()
    }

    pub fn end(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.add(self.bytes)) }
    }
}
