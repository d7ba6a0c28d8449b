//! In-kernel self-tests for threading and synchronization.

use core::sync::atomic::{AtomicU32, Ordering};

use basalt_abi::task::{DEFAULT_PRIORITY, KERNEL_PID, STACK_GUARD_MAGIC, ThreadStatus};
use basalt_lib::testing::TestResult;
use basalt_lib::{IntrGuard, assert_eq_test, assert_not_null, assert_test, define_test_suite, pass};

use crate::platform;
use crate::scheduler::{
    self, block_current, current_thread, sleep_ms, thread_create, thread_yield, unblock,
};
use crate::sync::{BlockQueue, Mutex, Semaphore};

fn test_current_thread_guard() -> TestResult {
    let current = current_thread();
    assert_not_null!(current);
    unsafe {
        assert_eq_test!((*current).stack_guard, STACK_GUARD_MAGIC);
        assert_eq_test!((*current).status, ThreadStatus::Running);
    }
    pass!()
}

fn test_thread_runs_callback() -> TestResult {
    static DONE: AtomicU32 = AtomicU32::new(0);

    fn worker(arg: usize) {
        DONE.store(arg as u32, Ordering::Release);
    }

    let thread = thread_create("worker", DEFAULT_PRIORITY, worker, 42, KERNEL_PID);
    assert_not_null!(thread);

    let start = platform::timer_ticks();
    while DONE.load(Ordering::Acquire) == 0 {
        assert_test!(
            platform::timer_ticks().wrapping_sub(start) < 1000,
            "worker thread never ran"
        );
        thread_yield();
    }
    assert_eq_test!(DONE.load(Ordering::Acquire), 42);
    pass!()
}

fn test_yield_requeues_at_back() -> TestResult {
    // After a yield the caller is Running again and off the ready list.
    thread_yield();
    let current = current_thread();
    unsafe {
        assert_eq_test!((*current).status, ThreadStatus::Running);
    }
    pass!()
}

fn test_block_and_unblock() -> TestResult {
    static PHASE: AtomicU32 = AtomicU32::new(0);

    fn worker(_arg: usize) {
        PHASE.store(1, Ordering::Release);
        block_current(ThreadStatus::Hanging);
        PHASE.store(2, Ordering::Release);
    }

    let thread = thread_create("blocker", DEFAULT_PRIORITY, worker, 0, KERNEL_PID);
    assert_not_null!(thread);

    // The worker may be preempted between publishing the phase and
    // blocking, so wait on the status itself.
    while unsafe { (*thread).status } != ThreadStatus::Hanging {
        thread_yield();
    }
    assert_eq_test!(PHASE.load(Ordering::Acquire), 1);

    unblock(thread);
    while PHASE.load(Ordering::Acquire) < 2 {
        thread_yield();
    }
    pass!()
}

fn test_semaphore_hand_off() -> TestResult {
    static SEM: Semaphore = Semaphore::new(0, 1);
    static POSTED: AtomicU32 = AtomicU32::new(0);

    fn poster(_arg: usize) {
        POSTED.store(1, Ordering::Release);
        SEM.increase();
    }

    let thread = thread_create("poster", DEFAULT_PRIORITY, poster, 0, KERNEL_PID);
    assert_not_null!(thread);

    // Blocks until the poster signals, then takes the count.
    SEM.decrease();
    assert_eq_test!(POSTED.load(Ordering::Acquire), 1);
    assert_eq_test!(SEM.value(), 0);

    // The bound caps repeated signals.
    SEM.increase();
    SEM.increase();
    assert_eq_test!(SEM.value(), 1);
    SEM.decrease();
    pass!()
}

fn test_mutex_is_recursive() -> TestResult {
    static LOCK: Mutex = Mutex::new();

    LOCK.lock();
    LOCK.lock();
    assert_test!(LOCK.is_held_by_current());
    LOCK.unlock();
    assert_test!(LOCK.is_held_by_current(), "inner unlock released the mutex");
    LOCK.unlock();
    assert_test!(!LOCK.is_held_by_current());
    pass!()
}

fn test_block_queue_ordering() -> TestResult {
    static QUEUE: BlockQueue<u8, 4> = BlockQueue::new(0);

    let _guard = IntrGuard::new();
    assert_test!(QUEUE.is_empty());
    QUEUE.push(1);
    QUEUE.push(2);
    QUEUE.push(3);
    assert_test!(QUEUE.is_full());

    assert_eq_test!(QUEUE.pop(), 1);
    assert_eq_test!(QUEUE.pop(), 2);
    assert_eq_test!(QUEUE.try_pop(), Some(3));
    assert_eq_test!(QUEUE.try_pop(), None);
    pass!()
}

fn test_sleep_waits_for_ticks() -> TestResult {
    let start = platform::timer_ticks();
    sleep_ms(30);
    let elapsed = platform::timer_ticks().wrapping_sub(start);
    // 30 ms at 100 Hz is three ticks; allow scheduling slack upwards.
    assert_test!(elapsed >= 2, "sleep returned after {} ticks", elapsed);
    pass!()
}

fn test_ready_list_has_no_duplicates() -> TestResult {
    let mut seen_current = 0;
    let current = current_thread();
    scheduler::for_each_thread(|thread| {
        if thread == current {
            seen_current += 1;
        }
    });
    assert_eq_test!(seen_current, 1, "current thread duplicated in all-list");
    pass!()
}

define_test_suite!(sched, [
    test_current_thread_guard,
    test_thread_runs_callback,
    test_yield_requeues_at_back,
    test_block_and_unblock,
    test_semaphore_hand_off,
    test_mutex_is_recursive,
    test_block_queue_ordering,
    test_sleep_waits_for_ticks,
    test_ready_list_has_no_duplicates,
]);
