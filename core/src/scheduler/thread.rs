//! The thread control block and its page layout.
//!
//! A thread occupies exactly one page:
//!
//! ```text
//! page base ┌──────────────────┐
//!           │  Thread (below)  │  control block, guard word last
//!           ├──────────────────┤
//!           │    free space    │
//!           │        ↑         │  kernel stack grows down
//! page end  └──────────────────┘  ← interrupt/startup stack top
//! ```
//!
//! Because the page is the allocation unit, `esp & !0xFFF` recovers the
//! running thread's control block — the address is the handle.

use core::mem::offset_of;

use basalt_abi::PAGE_SIZE;
use basalt_abi::addr::VirtAddr;
use basalt_abi::task::{STACK_GUARD_MAGIC, THREAD_NAME_LEN, ThreadStatus};
use basalt_lib::{ListTag, cpu, string};

/// Callee-saved register state for the software context switch.
///
/// Layout must match the offsets used by `switch_registers` in
/// `switch_asm.rs`; the assertions below pin every field.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchContext {
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eflags: u32,
    pub eip: u32,
}

pub const SWITCH_CTX_OFF_EBX: usize = offset_of!(SwitchContext, ebx);
pub const SWITCH_CTX_OFF_ESI: usize = offset_of!(SwitchContext, esi);
pub const SWITCH_CTX_OFF_EDI: usize = offset_of!(SwitchContext, edi);
pub const SWITCH_CTX_OFF_EBP: usize = offset_of!(SwitchContext, ebp);
pub const SWITCH_CTX_OFF_ESP: usize = offset_of!(SwitchContext, esp);
pub const SWITCH_CTX_OFF_EFLAGS: usize = offset_of!(SwitchContext, eflags);
pub const SWITCH_CTX_OFF_EIP: usize = offset_of!(SwitchContext, eip);

const _: () = {
    assert!(SWITCH_CTX_OFF_EBX == 0);
    assert!(SWITCH_CTX_OFF_ESI == 4);
    assert!(SWITCH_CTX_OFF_EDI == 8);
    assert!(SWITCH_CTX_OFF_EBP == 12);
    assert!(SWITCH_CTX_OFF_ESP == 16);
    assert!(SWITCH_CTX_OFF_EFLAGS == 20);
    assert!(SWITCH_CTX_OFF_EIP == 24);
    assert!(core::mem::size_of::<SwitchContext>() == 28);
};

impl SwitchContext {
    /// Context with interrupts masked; the first-run trampoline executes
    /// `sti` itself once the new stack is in place.
    pub const fn zero() -> Self {
        Self {
            ebx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eflags: 0x2,
            eip: 0,
        }
    }
}

pub type ThreadCallback = fn(usize);

/// The per-thread control block, pinned at its page base.
#[repr(C)]
pub struct Thread {
    pub name: [u8; THREAD_NAME_LEN],
    pub status: ThreadStatus,
    /// Tick budget granted each time the thread is scheduled.
    pub priority: u8,
    /// Ticks left in the current slice.
    pub remaining_ticks: u8,
    pub elapsed_ticks: u32,
    /// Owning process, or `KERNEL_PID` for kernel threads.
    pub pid: u32,
    pub switch_ctx: SwitchContext,
    /// Linkage for the ready list and for synchronization wait lists.
    pub general_tag: ListTag,
    /// Linkage for the all-threads list.
    pub all_tag: ListTag,
    /// Must stay [`STACK_GUARD_MAGIC`]; the kernel stack grows toward it.
    pub stack_guard: u32,
}

// The control block plus a sensible stack budget must fit the page.
const _: () = assert!(core::mem::size_of::<Thread>() + 3072 <= PAGE_SIZE as usize);

impl Thread {
    /// Initialise the control block at `page` for a thread named `name`.
    ///
    /// # Safety
    /// `page` must be a page-aligned, writable kernel page owned by the
    /// caller.
    pub unsafe fn init_at(
        page: VirtAddr,
        name: &str,
        priority: u8,
        pid: u32,
    ) -> *mut Thread {
        debug_assert!(page.is_page_aligned());
        let thread = page.as_mut_ptr::<Thread>();
        string::copy_name(&mut (*thread).name, name);
        (*thread).status = ThreadStatus::Died;
        (*thread).priority = priority;
        (*thread).remaining_ticks = priority;
        (*thread).elapsed_ticks = 0;
        (*thread).pid = pid;
        (*thread).switch_ctx = SwitchContext::zero();
        (*thread).general_tag = ListTag::new();
        (*thread).all_tag = ListTag::new();
        (*thread).stack_guard = STACK_GUARD_MAGIC;
        thread
    }

    /// The page base of the thread, which doubles as its identity.
    #[inline]
    pub fn page_base(&self) -> VirtAddr {
        VirtAddr::from(self as *const Thread).page_base()
    }

    /// One past the highest stack address: traps from user mode land here.
    #[inline]
    pub fn kernel_stack_top(&self) -> u32 {
        self.page_base().as_u32() + PAGE_SIZE
    }

    #[inline]
    pub fn is_kernel_thread(&self) -> bool {
        self.pid == basalt_abi::task::KERNEL_PID
    }

    #[inline]
    pub fn reset_ticks(&mut self) {
        self.remaining_ticks = self.priority;
    }

    /// Account one tick; returns `false` when the slice is exhausted.
    pub fn tick(&mut self) -> bool {
        self.elapsed_ticks = self.elapsed_ticks.wrapping_add(1);
        if self.remaining_ticks > 0 {
            self.remaining_ticks -= 1;
            true
        } else {
            false
        }
    }

    /// Whether the kernel stack has stayed clear of the control block.
    #[inline]
    pub fn stack_intact(&self) -> bool {
        self.stack_guard == STACK_GUARD_MAGIC
    }

    pub fn name_str(&self) -> &str {
        string::name_str(&self.name)
    }
}

/// The running thread, recovered from the stack pointer.
#[inline]
pub fn current_thread() -> *mut Thread {
    (cpu::read_esp() & !(PAGE_SIZE - 1)) as *mut Thread
}

/// Panic when `thread`'s stack has overflowed into its control block.
pub fn assert_stack_guard(thread: *const Thread) {
    let intact = unsafe { (*thread).stack_intact() };
    if !intact {
        panic!(
            "kernel stack overflow in thread '{}'",
            unsafe { (*thread).name_str() }
        );
    }
}
