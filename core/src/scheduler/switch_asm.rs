//! Low-level context switching with compile-time struct offsets.
//!
//! Offsets come from `offset_of!`, so a change to [`SwitchContext`] that
//! the assembly does not expect fails at compile time rather than at 3 a.m.

#[cfg(target_arch = "x86")]
mod imp {
    use core::arch::naked_asm;

    use super::super::thread::{
        SWITCH_CTX_OFF_EBP, SWITCH_CTX_OFF_EBX, SWITCH_CTX_OFF_EDI, SWITCH_CTX_OFF_EFLAGS,
        SWITCH_CTX_OFF_EIP, SWITCH_CTX_OFF_ESI, SWITCH_CTX_OFF_ESP, SwitchContext,
    };

    /// Switch from `prev` to `next`.
    ///
    /// Saves the callee-saved registers, flags and stack pointer into
    /// `prev`, then restores them from `next` and returns on the new
    /// stack. A null `prev` skips the save (first switch from boot and
    /// exiting threads).
    ///
    /// # Safety
    ///
    /// - Must be called with interrupts disabled.
    /// - `next` must describe a valid kernel stack whose top word is a
    ///   return address (the first-run trampoline, the interrupt exit, or
    ///   a previously saved resume point).
    #[unsafe(naked)]
    pub extern "C" fn switch_registers(prev: *mut SwitchContext, next: *const SwitchContext) {
        naked_asm!(
            // cdecl: [esp+4] = prev, [esp+8] = next
            "mov eax, [esp + 4]",
            "mov edx, [esp + 8]",

            "test eax, eax",
            "jz 2f",

            // Save callee-saved state; [esp] is our return address, which
            // becomes the resume point.
            "mov [eax + {off_ebx}], ebx",
            "mov [eax + {off_esi}], esi",
            "mov [eax + {off_edi}], edi",
            "mov [eax + {off_ebp}], ebp",
            "mov [eax + {off_esp}], esp",
            "pushfd",
            "pop dword ptr [eax + {off_eflags}]",
            "mov ecx, [esp]",
            "mov [eax + {off_eip}], ecx",

            "2:",
            "mov ebx, [edx + {off_ebx}]",
            "mov esi, [edx + {off_esi}]",
            "mov edi, [edx + {off_edi}]",
            "mov ebp, [edx + {off_ebp}]",
            "push dword ptr [edx + {off_eflags}]",
            "popfd",

            // The actual switch point.
            "mov esp, [edx + {off_esp}]",
            "ret",

            off_ebx = const SWITCH_CTX_OFF_EBX,
            off_esi = const SWITCH_CTX_OFF_ESI,
            off_edi = const SWITCH_CTX_OFF_EDI,
            off_ebp = const SWITCH_CTX_OFF_EBP,
            off_esp = const SWITCH_CTX_OFF_ESP,
            off_eflags = const SWITCH_CTX_OFF_EFLAGS,
            off_eip = const SWITCH_CTX_OFF_EIP,
        );
    }

    /// First-run entry for new threads.
    ///
    /// `SwitchContext` seeds `esi` with the callback and `edi` with its
    /// argument; the scheduler parks this function's address on the new
    /// stack so `switch_registers`' final `ret` lands here. Interrupts are
    /// enabled before the callback runs.
    #[unsafe(naked)]
    pub extern "C" fn thread_entry_trampoline() {
        naked_asm!(
            "sti",
            "push edi",
            "call esi",
            "add esp, 4",

            // The callback returned: retire the thread.
            "call {exit}",
            "ud2",

            exit = sym crate::scheduler::thread_exit,
        );
    }
}

#[cfg(not(target_arch = "x86"))]
mod imp {
    use super::super::thread::SwitchContext;

    pub extern "C" fn switch_registers(_prev: *mut SwitchContext, _next: *const SwitchContext) {
        unreachable!("context switches only exist on the kernel target");
    }

    pub extern "C" fn thread_entry_trampoline() {
        unreachable!("context switches only exist on the kernel target");
    }
}

pub use imp::{switch_registers, thread_entry_trampoline};
