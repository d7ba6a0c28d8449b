//! The scheduler: one ready list, priority-sized time slices, explicit
//! block/unblock, and an idle thread that keeps the CPU halted when no one
//! else wants it.

pub mod switch_asm;
pub mod thread;

use core::cell::UnsafeCell;

use basalt_abi::addr::VirtAddr;
use basalt_abi::task::{IDLE_PRIORITY, KERNEL_PID, ThreadStatus};
use basalt_lib::{IntrGuard, ListTag, TagList, container_of, cpu, klog_info};
use basalt_mm::{PoolKind, pools};

use crate::platform;
use crate::process;
use switch_asm::{switch_registers, thread_entry_trampoline};
use thread::{SwitchContext, Thread, ThreadCallback, assert_stack_guard};

pub use thread::current_thread;

struct ThreadLists {
    ready: TagList,
    all: TagList,
}

/// Scheduler state. Everything here is only touched with interrupts
/// disabled on the single CPU, which is exactly the exclusion the lists
/// need; holding a lock across `switch_registers` would deadlock instead.
struct SchedState {
    lists: UnsafeCell<ThreadLists>,
    idle: UnsafeCell<*mut Thread>,
    main: UnsafeCell<*mut Thread>,
}

// SAFETY: single CPU; all access happens under IntrGuard.
unsafe impl Sync for SchedState {}

static SCHED: SchedState = SchedState {
    lists: UnsafeCell::new(ThreadLists {
        ready: TagList::new(),
        all: TagList::new(),
    }),
    idle: UnsafeCell::new(core::ptr::null_mut()),
    main: UnsafeCell::new(core::ptr::null_mut()),
};

/// # Safety
/// Caller must have interrupts disabled.
unsafe fn lists() -> &'static mut ThreadLists {
    debug_assert!(!cpu::are_interrupts_enabled());
    &mut *SCHED.lists.get()
}

fn thread_of(tag: *mut ListTag) -> *mut Thread {
    container_of!(tag, Thread, general_tag)
}

fn thread_of_all(tag: *mut ListTag) -> *mut Thread {
    container_of!(tag, Thread, all_tag)
}

// ---------------------------------------------------------------------------
// Creation and startup
// ---------------------------------------------------------------------------

/// Allocate a thread page, initialise its control block and make it
/// runnable. Returns null when the kernel pool is exhausted.
pub fn thread_create(
    name: &str,
    priority: u8,
    callback: ThreadCallback,
    arg: usize,
    pid: u32,
) -> *mut Thread {
    let page = pools::alloc_pages(PoolKind::Kernel, 1);
    if page.is_null() {
        klog_info!("thread_create: no page for thread '{name}'");
        return core::ptr::null_mut();
    }

    let thread = unsafe { Thread::init_at(page, name, priority, pid) };
    prepare_first_run_frame(thread, callback, arg);

    let _guard = IntrGuard::new();
    let lists = unsafe { lists() };
    unsafe {
        debug_assert!(!lists.all.contains(&(*thread).all_tag));
        lists.all.push_back(&mut (*thread).all_tag);

        (*thread).status = ThreadStatus::Ready;
        debug_assert!(!lists.ready.contains(&(*thread).general_tag));
        lists.ready.push_back(&mut (*thread).general_tag);
    }
    thread
}

/// Lay out the startup stack so the first context switch "returns" into
/// the trampoline, which enables interrupts and calls `callback(arg)`.
fn prepare_first_run_frame(thread: *mut Thread, callback: ThreadCallback, arg: usize) {
    unsafe {
        let stack_top = (*thread).kernel_stack_top();
        // The switch's final `ret` consumes one slot: the trampoline.
        let ret_slot = (stack_top - 4) as *mut u32;
        *ret_slot = thread_entry_trampoline as usize as u32;

        let mut ctx = SwitchContext::zero();
        ctx.esi = callback as usize as u32;
        ctx.edi = arg as u32;
        ctx.esp = ret_slot as u32;
        (*thread).switch_ctx = ctx;
    }
}

/// Adopt the control flow that booted the kernel as the `main` thread. The
/// loader placed the boot stack inside a dedicated page, so the page base
/// becomes the control block.
pub fn init_main_thread() {
    let page = VirtAddr::new(cpu::read_esp()).page_base();
    let thread = unsafe {
        Thread::init_at(
            page,
            "main",
            basalt_abi::task::DEFAULT_PRIORITY,
            KERNEL_PID,
        )
    };
    unsafe {
        (*thread).status = ThreadStatus::Running;
        let _guard = IntrGuard::new();
        lists().all.push_back(&mut (*thread).all_tag);
        *SCHED.main.get() = thread;
    }
}

fn idle_entry(_arg: usize) {
    loop {
        block_current(ThreadStatus::Blocked);
        // Re-enabled interrupts keep the timer alive while the CPU halts.
        cpu::enable_interrupts();
        cpu::hlt();
    }
}

pub fn init_idle_thread() {
    let idle = thread_create("idle", IDLE_PRIORITY, idle_entry, 0, KERNEL_PID);
    assert!(!idle.is_null(), "cannot create the idle thread");
    let _guard = IntrGuard::new();
    unsafe {
        // The idle thread starts parked, not competing for the CPU.
        TagList::remove(&mut (*idle).general_tag);
        (*idle).status = ThreadStatus::Blocked;
        *SCHED.idle.get() = idle;
    }
}

/// Bring up the scheduler: adopt the boot flow as `main`, then start the
/// idle thread.
pub fn init_threading() {
    init_main_thread();
    init_idle_thread();
    klog_info!("threading initialised");
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Pick the next thread and switch to it. Interrupts must be disabled.
///
/// A still-running caller is rotated to the back of the ready list with a
/// fresh time slice; a blocked caller simply stays off the list. When the
/// ready list is empty the idle thread is woken to soak up the CPU.
pub fn schedule() {
    debug_assert!(!cpu::are_interrupts_enabled());

    let current = current_thread();
    assert_stack_guard(current);

    let lists = unsafe { lists() };
    unsafe {
        if (*current).status == ThreadStatus::Running {
            debug_assert!(!lists.ready.contains(&(*current).general_tag));
            (*current).reset_ticks();
            (*current).status = ThreadStatus::Ready;
            lists.ready.push_back(&mut (*current).general_tag);
        }
    }

    if lists.ready.is_empty() {
        let idle = unsafe { *SCHED.idle.get() };
        debug_assert!(!idle.is_null());
        unblock(idle);
    }

    let next_tag = lists.ready.pop_front();
    debug_assert!(!next_tag.is_null());
    let next = thread_of(next_tag);

    unsafe {
        (*next).status = ThreadStatus::Running;
        load_kernel_env(next);
        if next != current {
            switch_registers(&mut (*current).switch_ctx, &(*next).switch_ctx);
        }
    }
}

/// Install the incoming thread's address space and, for user threads, point
/// the TSS at its kernel stack so traps from ring 3 land correctly.
unsafe fn load_kernel_env(thread: *mut Thread) {
    let pid = (*thread).pid;
    if pid == KERNEL_PID {
        basalt_mm::paging::activate_page_dir(basalt_mm::paging::kernel_page_dir_phys());
    } else {
        let dir = process::page_dir_phys_of(pid);
        debug_assert!(!dir.is_null());
        basalt_mm::paging::activate_page_dir(dir);
        crate::gdt::tss_set_esp0((*thread).kernel_stack_top());
    }
}

/// Block the caller with one of the blocked statuses and reschedule.
pub fn block_current(status: ThreadStatus) {
    debug_assert!(status.is_blocked_kind());
    let _guard = IntrGuard::new();
    let current = current_thread();
    unsafe { (*current).status = status };
    schedule();
}

/// Make a blocked thread runnable again. It jumps the queue: unblocked
/// threads enter the ready list at the front so they run soon.
pub fn unblock(thread: *mut Thread) {
    let _guard = IntrGuard::new();
    assert_stack_guard(thread);
    unsafe {
        assert!(
            (*thread).status.is_blocked_kind(),
            "unblocking a thread that is not blocked"
        );
        let lists = lists();
        debug_assert!(!lists.ready.contains(&(*thread).general_tag));
        (*thread).status = ThreadStatus::Ready;
        lists.ready.push_front(&mut (*thread).general_tag);
    }
}

/// Surrender the CPU, keeping the remaining slice budget, and requeue at
/// the back of the ready list.
pub fn thread_yield() {
    let _guard = IntrGuard::new();
    let current = current_thread();
    unsafe {
        let lists = lists();
        debug_assert!(!lists.ready.contains(&(*current).general_tag));
        (*current).status = ThreadStatus::Ready;
        lists.ready.push_back(&mut (*current).general_tag);
    }
    schedule();
}

/// Timer-interrupt hook: account the tick and reschedule on exhaustion.
pub fn scheduler_tick() {
    let current = current_thread();
    assert_stack_guard(current);
    if !unsafe { (*current).tick() } {
        schedule();
    }
}

/// Retire the calling thread. The control-block page is leaked on purpose:
/// it carries the very stack this function runs on.
pub extern "C" fn thread_exit() -> ! {
    cpu::disable_interrupts();
    let current = current_thread();
    unsafe {
        TagList::remove(&mut (*current).all_tag);
        (*current).status = ThreadStatus::Died;
    }
    schedule();
    unreachable!("a dead thread was rescheduled");
}

/// Register a forked thread. Unlike [`thread_create`] the control block
/// arrives fully built (copied from the parent); it only needs linkage.
/// The caller must have set the status to `Ready` beforehand.
pub fn enqueue_forked_thread(thread: *mut Thread) {
    let _guard = IntrGuard::new();
    let lists = unsafe { lists() };
    unsafe {
        debug_assert!((*thread).status == ThreadStatus::Ready);
        debug_assert!(!lists.all.contains(&(*thread).all_tag));
        lists.all.push_back(&mut (*thread).all_tag);
        debug_assert!(!lists.ready.contains(&(*thread).general_tag));
        lists.ready.push_back(&mut (*thread).general_tag);
    }
}

/// Sleep by yielding until enough timer ticks have elapsed.
pub fn sleep_ms(milliseconds: u32) {
    let freq = platform::timer_frequency() as u64;
    let ms = milliseconds.max(1) as u64;
    let sleep_ticks = (ms * freq).div_ceil(1000).max(1);

    let start = platform::timer_ticks();
    while platform::timer_ticks().wrapping_sub(start) < sleep_ticks {
        thread_yield();
    }
}

/// Walk the all-threads list (diagnostics and self-tests).
pub fn for_each_thread(mut f: impl FnMut(*mut Thread)) {
    let _guard = IntrGuard::new();
    unsafe { lists() }.all.find(|tag| {
        f(thread_of_all(tag));
        false
    });
}

/// Number of threads currently queued as ready (self-tests).
pub fn ready_thread_count() -> usize {
    let _guard = IntrGuard::new();
    unsafe { lists() }.ready.len()
}
