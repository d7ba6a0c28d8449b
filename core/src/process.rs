//! User processes: address-space construction, the ring-0 → ring-3
//! trampoline, and fork.
//!
//! A process is a kernel thread plus a user address space: its own page
//! directory (kernel half shared), a user virtual-address pool covering
//! `[USER_IMAGE_BASE, KERNEL_BASE)`, a block-descriptor table for its heap
//! and an 8-slot descriptor table. The only way into ring 3 is a forged
//! interrupt frame handed to the shared interrupt exit.

use core::cell::UnsafeCell;
use core::mem::size_of;

use basalt_abi::PAGE_SIZE;
use basalt_abi::addr::{PhysAddr, VirtAddr};
use basalt_abi::page_count_for;
use basalt_abi::task::{DEFAULT_PRIORITY, INVALID_PID, KERNEL_PID, MAX_PROCESSES, ThreadStatus};
use basalt_lib::{IntrGuard, IrqMutex, cpu, klog_info};
use basalt_mm::heap::MemBlockDescTable;
use basalt_mm::mm_constants::{KERNEL_BASE, USER_IMAGE_BASE, USER_STACK_PAGE, USER_STACK_TOP};
use basalt_mm::pools::VrAddrPool;
use basalt_mm::{PoolKind, paging, pools};

use crate::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::irq::{IntrFrame, intr_exit_addr};
use crate::scheduler::thread::Thread;
use crate::scheduler::{self, current_thread, thread_create};

pub struct Process {
    pub pid: u32,
    pub parent_pid: u32,
    pub page_dir_va: VirtAddr,
    pub page_dir_phys: PhysAddr,
    pub vaddr_pool: VrAddrPool,
    pub block_descs: MemBlockDescTable,
    pub main_thread: *mut Thread,
}

impl Process {
    const fn unused() -> Self {
        Self {
            pid: INVALID_PID,
            parent_pid: INVALID_PID,
            page_dir_va: VirtAddr::NULL,
            page_dir_phys: PhysAddr::NULL,
            vaddr_pool: VrAddrPool::empty(),
            block_descs: MemBlockDescTable::new(),
            main_thread: core::ptr::null_mut(),
        }
    }
}

struct ProcessTable {
    slots: [Process; MAX_PROCESSES],
}

// SAFETY: single CPU; slots are only mutated with interrupts disabled.
struct TableCell(UnsafeCell<ProcessTable>);
unsafe impl Sync for TableCell {}

static PROCESSES: TableCell = TableCell(UnsafeCell::new(ProcessTable {
    slots: [const { Process::unused() }; MAX_PROCESSES],
}));

static NEXT_PID: IrqMutex<u32> = IrqMutex::new(0);

fn new_pid() -> u32 {
    let mut pid = NEXT_PID.lock();
    *pid += 1;
    *pid
}

/// # Safety
/// Caller must have interrupts disabled.
unsafe fn table() -> &'static mut ProcessTable {
    debug_assert!(!cpu::are_interrupts_enabled());
    &mut *PROCESSES.0.get()
}

fn find_process(pid: u32) -> *mut Process {
    let _guard = IntrGuard::new();
    let table = unsafe { table() };
    for slot in table.slots.iter_mut() {
        if slot.pid == pid {
            return slot as *mut Process;
        }
    }
    core::ptr::null_mut()
}

/// The process owning the calling thread, or null for kernel threads.
pub fn current_process() -> *mut Process {
    let pid = unsafe { (*current_thread()).pid };
    if pid == KERNEL_PID {
        return core::ptr::null_mut();
    }
    find_process(pid)
}

/// Physical address of a process page directory ([`PhysAddr::NULL`] when
/// the pid is unknown). The scheduler installs this on every switch.
pub fn page_dir_phys_of(pid: u32) -> PhysAddr {
    let process = find_process(pid);
    if process.is_null() {
        return PhysAddr::NULL;
    }
    unsafe { (*process).page_dir_phys }
}

// ---------------------------------------------------------------------------
// mm providers: route "current user pool / heap" lookups back here
// ---------------------------------------------------------------------------

fn current_user_pool() -> *mut VrAddrPool {
    let process = current_process();
    if process.is_null() {
        return core::ptr::null_mut();
    }
    unsafe { &raw mut (*process).vaddr_pool }
}

fn current_user_heap() -> *mut MemBlockDescTable {
    let process = current_process();
    if process.is_null() {
        return core::ptr::null_mut();
    }
    unsafe { &raw mut (*process).block_descs }
}

/// Hook the process layer into the memory subsystem. Called once at boot.
pub fn process_init() {
    pools::register_user_pool_provider(current_user_pool);
    basalt_mm::heap::register_user_heap_provider(current_user_heap);
}

// ---------------------------------------------------------------------------
// Address-space construction
// ---------------------------------------------------------------------------

/// Bytes of bitmap needed to track the whole user half.
const USER_POOL_BITMAP_LEN: usize =
    ((KERNEL_BASE - USER_IMAGE_BASE) / PAGE_SIZE / 8) as usize;

fn init_user_vaddr_pool(pool: &mut VrAddrPool) -> bool {
    let pages = page_count_for(USER_POOL_BITMAP_LEN);
    let bits = pools::alloc_pages(PoolKind::Kernel, pages);
    if bits.is_null() {
        klog_info!("process: no memory for a user address-pool bitmap");
        return false;
    }
    unsafe {
        pool.init(
            VirtAddr::new(USER_IMAGE_BASE),
            bits.as_mut_ptr(),
            USER_POOL_BITMAP_LEN,
        )
    };
    true
}

fn init_page_dir(process: &mut Process) -> bool {
    let dir = pools::alloc_pages(PoolKind::Kernel, 1);
    if dir.is_null() {
        klog_info!("process: no page for a page directory");
        return false;
    }
    paging::init_process_page_dir(dir);
    process.page_dir_va = dir;
    process.page_dir_phys = paging::virt_to_phys(dir).page_base();
    true
}

// ---------------------------------------------------------------------------
// Ring transition
// ---------------------------------------------------------------------------

/// Jump into the shared interrupt exit with a prepared frame.
#[cfg(target_arch = "x86")]
unsafe fn jump_to_intr_exit(frame: *const IntrFrame) -> ! {
    core::arch::asm!(
        "mov esp, {frame}",
        "jmp {exit}",
        frame = in(reg) frame,
        exit = in(reg) intr_exit_addr(),
        options(noreturn),
    );
}

#[cfg(not(target_arch = "x86"))]
unsafe fn jump_to_intr_exit(_frame: *const IntrFrame) -> ! {
    unreachable!("ring transitions only exist on the kernel target");
}

/// Forge the interrupt frame that drops a fresh process into ring 3.
///
/// Runs as the main-thread callback of a new process. The frame carries
/// user selectors, `IF` set so the clock keeps preempting, the entry point
/// as the interrupted `eip`, and the top of a newly mapped user stack page.
fn start_user_process(code: usize) {
    let mut frame = IntrFrame {
        gs: USER_DATA_SELECTOR as u32,
        fs: USER_DATA_SELECTOR as u32,
        es: USER_DATA_SELECTOR as u32,
        ds: USER_DATA_SELECTOR as u32,
        edi: 0,
        esi: 0,
        ebp: 0,
        esp_dummy: 0,
        ebx: 0,
        edx: 0,
        ecx: 0,
        eax: 0,
        vector: 0,
        err_code: 0,
        eip: code as u32,
        cs: USER_CODE_SELECTOR as u32,
        eflags: cpu::EFLAGS_DEFAULT,
        user_esp: 0,
        user_ss: USER_DATA_SELECTOR as u32,
    };

    let stack = pools::alloc_page_at(PoolKind::User, VirtAddr::new(USER_STACK_PAGE));
    assert!(!stack.is_null(), "cannot map the user stack page");
    frame.user_esp = USER_STACK_TOP;

    unsafe { jump_to_intr_exit(&frame) };
}

/// Create a user process executing `code` and hand it to the scheduler.
/// Returns the new pid, or [`INVALID_PID`] on resource exhaustion.
pub fn process_execute(name: &str, code: VirtAddr) -> u32 {
    let _guard = IntrGuard::new();

    let table = unsafe { table() };
    let Some(slot) = table.slots.iter_mut().find(|slot| slot.pid == INVALID_PID) else {
        klog_info!("process: the process table is full");
        return INVALID_PID;
    };

    if !init_user_vaddr_pool(&mut slot.vaddr_pool) {
        return INVALID_PID;
    }
    if !init_page_dir(slot) {
        return INVALID_PID;
    }
    slot.block_descs = MemBlockDescTable::new();
    slot.pid = new_pid();
    slot.parent_pid = INVALID_PID;

    if !basalt_fs::fileio::fileio_create_table(slot.pid) {
        slot.pid = INVALID_PID;
        return INVALID_PID;
    }

    let thread = thread_create(
        name,
        DEFAULT_PRIORITY,
        start_user_process,
        code.as_u32() as usize,
        slot.pid,
    );
    if thread.is_null() {
        slot.pid = INVALID_PID;
        return INVALID_PID;
    }
    slot.main_thread = thread;
    slot.pid
}

// ---------------------------------------------------------------------------
// Fork
// ---------------------------------------------------------------------------

/// Duplicate the calling thread's control-block page for the child and
/// aim its first run at the interrupt exit, so the child resumes in user
/// mode as if its own syscall just returned — with `eax` forced to zero.
fn fork_thread(parent: *mut Thread, child_pid: u32) -> *mut Thread {
    let page = pools::alloc_pages(PoolKind::Kernel, 1);
    if page.is_null() {
        klog_info!("fork: no page for the child thread");
        return core::ptr::null_mut();
    }

    let child = page.as_mut_ptr::<Thread>();
    unsafe {
        core::ptr::copy_nonoverlapping(
            (*parent).page_base().as_ptr::<u8>(),
            page.as_mut_ptr::<u8>(),
            PAGE_SIZE as usize,
        );

        (*child).pid = child_pid;
        (*child).status = ThreadStatus::Died;
        (*child).elapsed_ticks = 0;
        (*child).reset_ticks();
        (*child).general_tag = basalt_lib::ListTag::new();
        (*child).all_tag = basalt_lib::ListTag::new();

        // The parent entered the kernel through the syscall stub, so the
        // copied page carries its interrupt frame at the stack top.
        let frame = ((*child).kernel_stack_top() as usize - size_of::<IntrFrame>())
            as *mut IntrFrame;
        (*frame).eax = 0;

        // First switch: `ret` straight into the interrupt exit with the
        // frame address on the stack.
        let ret_slot = (frame as u32 - 4) as *mut u32;
        *ret_slot = intr_exit_addr();
        (*child).switch_ctx = crate::scheduler::thread::SwitchContext::zero();
        (*child).switch_ctx.esp = ret_slot as u32;
    }
    child
}

/// Copy every allocated user page of `parent` into `child` through a
/// kernel staging buffer, switching CR3 to reach each side.
fn copy_user_memory(parent: &Process, child: &mut Process) -> bool {
    let staging = pools::alloc_pages(PoolKind::Kernel, 1);
    if staging.is_null() {
        klog_info!("fork: no staging page");
        return false;
    }

    for idx in 0..parent.vaddr_pool.capacity() {
        if !parent.vaddr_pool.is_allocated(idx) {
            continue;
        }
        let va = parent.vaddr_pool.page_at(idx);

        unsafe {
            // Parent mapping is active: stage the page in kernel memory,
            // which both address spaces share.
            core::ptr::copy_nonoverlapping(
                va.as_ptr::<u8>(),
                staging.as_mut_ptr::<u8>(),
                PAGE_SIZE as usize,
            );

            paging::activate_page_dir(child.page_dir_phys);
            let mapped = pools::alloc_page_at_in(PoolKind::User, &mut child.vaddr_pool, va);
            if mapped.is_null() {
                paging::activate_page_dir(parent.page_dir_phys);
                pools::free_pages(staging, 1);
                return false;
            }
            core::ptr::copy_nonoverlapping(
                staging.as_ptr::<u8>(),
                va.as_mut_ptr::<u8>(),
                PAGE_SIZE as usize,
            );
            paging::activate_page_dir(parent.page_dir_phys);
        }
    }

    pools::free_pages(staging, 1);
    true
}

/// Fork the calling process. Returns the child pid to the caller; the
/// child itself resumes after the syscall with a return value of zero.
/// Interrupts must already be disabled (syscalls arrive through an
/// interrupt gate).
pub fn fork_current() -> u32 {
    debug_assert!(!cpu::are_interrupts_enabled());

    let parent_thread = current_thread();
    let parent = current_process();
    if parent.is_null() {
        klog_info!("fork: only user processes can fork");
        return INVALID_PID;
    }
    let parent = unsafe { &mut *parent };

    let table = unsafe { table() };
    let Some(child) = table.slots.iter_mut().find(|slot| slot.pid == INVALID_PID) else {
        klog_info!("fork: the process table is full");
        return INVALID_PID;
    };

    child.pid = new_pid();
    child.parent_pid = parent.pid;
    child.block_descs = MemBlockDescTable::new();
    if !init_user_vaddr_pool(&mut child.vaddr_pool) {
        child.pid = INVALID_PID;
        return INVALID_PID;
    }
    if !init_page_dir(child) {
        child.pid = INVALID_PID;
        return INVALID_PID;
    }

    let child_thread = fork_thread(parent_thread, child.pid);
    if child_thread.is_null() {
        child.pid = INVALID_PID;
        return INVALID_PID;
    }
    child.main_thread = child_thread;

    if !basalt_fs::fileio::fileio_fork_table(parent.pid, child.pid) {
        child.pid = INVALID_PID;
        return INVALID_PID;
    }

    if !copy_user_memory(parent, child) {
        child.pid = INVALID_PID;
        return INVALID_PID;
    }

    // The child becomes schedulable only after its memory is consistent.
    let child_pid = child.pid;
    unsafe {
        (*child_thread).status = ThreadStatus::Ready;
        scheduler::enqueue_forked_thread(child_thread);
    }
    child_pid
}
