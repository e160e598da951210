use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::platform::Platform;

/// A long-term exclusive lock that suspends contending threads instead of
/// spinning.
///
/// Spin locks are wrong for critical sections that span disk I/O: the owner
/// can hold the lock for milliseconds, and a spinning waiter would burn its
/// core (with interrupts off, in kernel convention) the whole time. A
/// `SleepLock` parks waiters through [`Platform::sleep`], keyed on the lock's
/// own address, and [`Platform::wake`]s them on release.
///
/// The interface is deliberately low-level: `acquire`/`release` rather than
/// a guard, because the buffer cache composes release with bookkeeping of
/// its own. Access to the protected value goes through the raw pointer from
/// [`SleepLock::get`] and is only sound between an acquire and the matching
/// release.
pub struct SleepLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Creates an unlocked `SleepLock` holding `data`.
    pub const fn new(data: T) -> Self {
        SleepLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, suspending the calling thread while it is held
    /// elsewhere.
    pub fn acquire<P: Platform>(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            P::sleep(self.channel());
        }
    }

    /// Releases the lock and wakes any sleeping waiters.
    ///
    /// # Safety
    ///
    /// The caller must have acquired this lock and not yet released it, and
    /// must no longer hold any pointer obtained from [`SleepLock::get`].
    pub unsafe fn release<P: Platform>(&self) {
        self.locked.store(false, Ordering::Release);
        P::wake(self.channel());
    }

    /// Whether the lock is currently held by someone.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Raw pointer to the protected value. Dereferencing it is only sound
    /// while the caller holds the lock.
    pub fn get(&self) -> *mut T {
        self.data.get()
    }

    fn channel(&self) -> usize {
        self as *const Self as usize
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::SleepLock;
    use crate::testing::TestPlatform;

    #[test]
    fn protects_its_value() {
        let lock = SleepLock::new(0u64);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        lock.acquire::<TestPlatform>();
                        let value = lock.get();
                        unsafe {
                            *value += 1;
                            lock.release::<TestPlatform>();
                        }
                    }
                });
            }
        });
        lock.acquire::<TestPlatform>();
        assert_eq!(unsafe { *lock.get() }, 4000);
        unsafe { lock.release::<TestPlatform>() };
    }

    #[test]
    fn one_holder_at_a_time() {
        let lock = SleepLock::new(());
        let holders = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..500 {
                        lock.acquire::<TestPlatform>();
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                        holders.fetch_sub(1, Ordering::SeqCst);
                        unsafe { lock.release::<TestPlatform>() };
                    }
                });
            }
        });
        assert!(!lock.is_locked());
    }
}
