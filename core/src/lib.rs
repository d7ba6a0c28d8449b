//! Threads, scheduling, synchronization, processes and trap dispatch.
//!
//! Every thread lives in exactly one 4 KiB page: the control block at the
//! page base, the kernel stack growing down from the page end, and a guard
//! word between them to catch overflow. The scheduler is a single ready
//! list with priority-sized time slices; preemption happens only when a
//! slice runs out or a thread blocks or yields.

#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod gdt;
pub mod irq;
pub mod platform;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod syscall;

#[cfg(feature = "builtin-tests")]
pub mod tests;

pub use scheduler::thread::{SwitchContext, Thread};
pub use scheduler::{
    block_current, current_thread, init_threading, scheduler_tick, sleep_ms, thread_create,
    thread_yield, unblock,
};
pub use sync::{BlockQueue, Mutex, Semaphore};
