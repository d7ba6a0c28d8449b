//! Counting semaphore with a FIFO wait list.

use core::cell::UnsafeCell;

use basalt_abi::task::ThreadStatus;
use basalt_lib::{IntrGuard, TagList, container_of};

use crate::scheduler::thread::Thread;
use crate::scheduler::{block_current, current_thread, unblock};

struct SemInner {
    value: u32,
    max: u32,
    waiters: TagList,
}

/// A counting semaphore bounded at `max`. Waiters block on the scheduler
/// rather than spinning; wake-ups re-check the guard, so a woken thread
/// that loses the race simply queues again.
pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// SAFETY: all state transitions run under IntrGuard on the single CPU.
unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub const fn new(initial: u32, max: u32) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner {
                value: initial,
                max,
                waiters: TagList::new(),
            }),
        }
    }

    /// A binary semaphore starting unavailable (disk-completion style).
    pub const fn binary() -> Self {
        Self::new(0, 1)
    }

    /// P operation: wait until the count is positive, then take one.
    pub fn decrease(&self) {
        let _guard = IntrGuard::new();
        let inner = unsafe { &mut *self.inner.get() };

        while inner.value == 0 {
            let current = current_thread();
            unsafe {
                debug_assert!(!inner.waiters.contains(&(*current).general_tag));
                inner.waiters.push_back(&mut (*current).general_tag);
            }
            block_current(ThreadStatus::Blocked);
            // Re-check after waking: another thread may have taken the
            // count between the wake and this thread running.
        }

        inner.value -= 1;
    }

    /// V operation: wake the head waiter, then raise the count up to the
    /// bound.
    pub fn increase(&self) {
        let _guard = IntrGuard::new();
        let inner = unsafe { &mut *self.inner.get() };

        let waiter = inner.waiters.pop_front();
        if !waiter.is_null() {
            unblock(container_of!(waiter, Thread, general_tag));
        }

        if inner.value < inner.max {
            inner.value += 1;
        }
    }

    pub fn value(&self) -> u32 {
        let _guard = IntrGuard::new();
        unsafe { (*self.inner.get()).value }
    }
}
