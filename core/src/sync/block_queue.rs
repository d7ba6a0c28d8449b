//! Bounded blocking queue over a circular buffer.
//!
//! For a queue of capacity `n` the buffer holds `n + 1` slots so that
//! `head == tail` means empty and `next(head) == tail` means full. At most
//! one waiting producer and one waiting consumer are tracked, which is
//! sufficient on a single CPU where the usual pairing is one ISR feeding
//! one consumer thread.
//!
//! All operations require interrupts to be disabled by the caller — the
//! queue is exactly as single-CPU as the machine it runs on.

use core::cell::UnsafeCell;

use basalt_abi::task::ThreadStatus;
use basalt_lib::cpu;

use crate::scheduler::thread::Thread;
use crate::scheduler::{block_current, current_thread, unblock};
use crate::sync::Mutex;

struct QueueInner<T, const SLOTS: usize> {
    buf: [T; SLOTS],
    head: usize,
    tail: usize,
    producer: *mut Thread,
    consumer: *mut Thread,
}

/// A blocking queue with `SLOTS - 1` usable elements.
pub struct BlockQueue<T: Copy, const SLOTS: usize> {
    inner: UnsafeCell<QueueInner<T, SLOTS>>,
    lock: Mutex,
}

// SAFETY: accessed with interrupts disabled on the single CPU.
unsafe impl<T: Copy + Send, const SLOTS: usize> Sync for BlockQueue<T, SLOTS> {}
unsafe impl<T: Copy + Send, const SLOTS: usize> Send for BlockQueue<T, SLOTS> {}

impl<T: Copy, const SLOTS: usize> BlockQueue<T, SLOTS> {
    /// `fill` seeds the (never observed) initial buffer contents.
    pub const fn new(fill: T) -> Self {
        assert!(SLOTS >= 2);
        Self {
            inner: UnsafeCell::new(QueueInner {
                buf: [fill; SLOTS],
                head: 0,
                tail: 0,
                producer: core::ptr::null_mut(),
                consumer: core::ptr::null_mut(),
            }),
            lock: Mutex::new(),
        }
    }

    const fn next_pos(pos: usize) -> usize {
        (pos + 1) % SLOTS
    }

    pub fn is_empty(&self) -> bool {
        debug_assert!(!cpu::are_interrupts_enabled());
        let inner = unsafe { &*self.inner.get() };
        inner.head == inner.tail
    }

    pub fn is_full(&self) -> bool {
        debug_assert!(!cpu::are_interrupts_enabled());
        let inner = unsafe { &*self.inner.get() };
        Self::next_pos(inner.head) == inner.tail
    }

    fn wait(waiter: &mut *mut Thread) {
        debug_assert!(waiter.is_null());
        *waiter = current_thread();
        block_current(ThreadStatus::Blocked);
    }

    fn wake(waiter: &mut *mut Thread) {
        debug_assert!(!waiter.is_null());
        let thread = *waiter;
        *waiter = core::ptr::null_mut();
        unblock(thread);
    }

    /// Append `value`, blocking while the queue is full.
    pub fn push(&self, value: T) {
        debug_assert!(!cpu::are_interrupts_enabled());

        while self.is_full() {
            // Only one thread at a time may become the waiting producer.
            let _guard = self.lock.guard();
            let inner = unsafe { &mut *self.inner.get() };
            Self::wait(&mut inner.producer);
        }

        let inner = unsafe { &mut *self.inner.get() };
        inner.buf[inner.head] = value;
        inner.head = Self::next_pos(inner.head);

        if !inner.consumer.is_null() {
            Self::wake(&mut inner.consumer);
        }
    }

    /// Remove the oldest element, blocking while the queue is empty.
    pub fn pop(&self) -> T {
        debug_assert!(!cpu::are_interrupts_enabled());

        while self.is_empty() {
            // Only one thread at a time may become the waiting consumer.
            let _guard = self.lock.guard();
            let inner = unsafe { &mut *self.inner.get() };
            Self::wait(&mut inner.consumer);
        }

        let inner = unsafe { &mut *self.inner.get() };
        let value = inner.buf[inner.tail];
        inner.tail = Self::next_pos(inner.tail);

        if !inner.producer.is_null() {
            Self::wake(&mut inner.producer);
        }
        value
    }

    /// Non-blocking push for ISR context; drops `value` when full.
    pub fn try_push(&self, value: T) -> bool {
        debug_assert!(!cpu::are_interrupts_enabled());
        if self.is_full() {
            return false;
        }
        let inner = unsafe { &mut *self.inner.get() };
        inner.buf[inner.head] = value;
        inner.head = Self::next_pos(inner.head);
        if !inner.consumer.is_null() {
            Self::wake(&mut inner.consumer);
        }
        true
    }

    /// Non-blocking pop for contexts that cannot sleep.
    pub fn try_pop(&self) -> Option<T> {
        debug_assert!(!cpu::are_interrupts_enabled());
        if self.is_empty() {
            return None;
        }
        let inner = unsafe { &mut *self.inner.get() };
        let value = inner.buf[inner.tail];
        inner.tail = Self::next_pos(inner.tail);
        if !inner.producer.is_null() {
            Self::wake(&mut inner.producer);
        }
        Some(value)
    }
}
