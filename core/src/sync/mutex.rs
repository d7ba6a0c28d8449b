//! Recursive mutex: a binary semaphore plus holder tracking.

use core::cell::UnsafeCell;

use basalt_lib::IntrGuard;

use crate::scheduler::current_thread;
use crate::scheduler::thread::Thread;
use crate::sync::Semaphore;

struct MutexInner {
    holder: *mut Thread,
    depth: u32,
}

/// A sleeping mutex that the holder may re-acquire. Each `lock` must be
/// matched by an `unlock` from the same thread; the semaphore is only
/// touched at the outermost level.
pub struct Mutex {
    sem: Semaphore,
    inner: UnsafeCell<MutexInner>,
}

// SAFETY: holder/depth are only mutated under IntrGuard by the owning
// thread on the single CPU.
unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1, 1),
            inner: UnsafeCell::new(MutexInner {
                holder: core::ptr::null_mut(),
                depth: 0,
            }),
        }
    }

    pub fn lock(&self) {
        let current = current_thread();
        let _guard = IntrGuard::new();
        let inner = unsafe { &mut *self.inner.get() };

        if inner.holder == current {
            inner.depth += 1;
            return;
        }

        self.sem.decrease();
        let inner = unsafe { &mut *self.inner.get() };
        debug_assert!(inner.holder.is_null());
        inner.holder = current;
        inner.depth = 1;
    }

    pub fn unlock(&self) {
        let current = current_thread();
        let _guard = IntrGuard::new();
        let inner = unsafe { &mut *self.inner.get() };

        assert!(inner.holder == current, "unlock by a non-holder thread");
        if inner.depth > 1 {
            inner.depth -= 1;
            return;
        }

        inner.holder = core::ptr::null_mut();
        inner.depth = 0;
        self.sem.increase();
    }

    /// RAII convenience around `lock`/`unlock`.
    pub fn guard(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    pub fn is_held_by_current(&self) -> bool {
        let _guard = IntrGuard::new();
        unsafe { (*self.inner.get()).holder == current_thread() }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
