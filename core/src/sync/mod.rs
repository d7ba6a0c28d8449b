//! Synchronization primitives built on the scheduler: a counting
//! semaphore, a recursive mutex and a bounded blocking queue.

mod block_queue;
mod mutex;
mod semaphore;

pub use block_queue::BlockQueue;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
