//! Contracts for the primitives the resource core consumes.
//!
//! The embedding kernel implements:
//! - [`Platform`]: core identity, the tick counter, and the suspension
//!   hooks the sleep lock parks on
//! - [`BlockDevice`]: synchronous single-block transfer to and from
//!   persistent storage

use crate::config::BLOCK_SIZE;

/// The kernel-side services the resource core runs on top of.
///
/// Everything here is expected to be cheap and callable from any core at
/// any time the kernel would normally take a spin lock.
pub trait Platform {
    /// Index of the core the calling thread is executing on, below the
    /// pool count the services were instantiated with.
    fn cpu_id() -> usize;

    /// Monotonically increasing tick counter, advanced by the timer
    /// interrupt. Read-only here; used to order buffer releases.
    fn ticks() -> u64;

    /// Suspend the calling thread until [`Platform::wake`] is called with
    /// the same channel. May return spuriously; callers re-check their
    /// condition in a loop, so a scheduler-less implementation can simply
    /// yield.
    fn sleep(channel: usize);

    /// Wake every thread currently sleeping on `channel`.
    fn wake(channel: usize);
}

/// A device that moves whole blocks between memory and persistent storage,
/// blocking the caller until the transfer is complete.
pub trait BlockDevice {
    /// Read block `blockno` of device `dev` into `data`.
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]);

    /// Write `data` to block `blockno` of device `dev`.
    fn write(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]);
}

impl<T: BlockDevice> BlockDevice for &T {
    fn read(&self, dev: u32, blockno: u32, data: &mut [u8; BLOCK_SIZE]) {
        (**self).read(dev, blockno, data);
    }

    fn write(&self, dev: u32, blockno: u32, data: &[u8; BLOCK_SIZE]) {
        (**self).write(dev, blockno, data);
    }
}
