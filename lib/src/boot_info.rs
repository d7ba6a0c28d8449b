//! The bootloader handoff.
//!
//! The real-mode loader probes memory with E820 and leaves the total memory
//! size in bytes at physical `0xB00`, which the kernel mapping exposes at
//! `0xC0000B00`. That single value is the entire boot contract.

use core::sync::atomic::{AtomicU32, Ordering};

/// Virtual address of the loader-published total memory size.
pub const BOOT_TOTAL_MEMORY_ADDR: u32 = 0xC000_0B00;

static TOTAL_MEMORY: AtomicU32 = AtomicU32::new(0);

/// Capture the boot handoff. Must run before memory-pool initialisation.
pub fn boot_info_init() {
    #[cfg(target_arch = "x86")]
    {
        let bytes = unsafe { core::ptr::read_volatile(BOOT_TOTAL_MEMORY_ADDR as *const u32) };
        TOTAL_MEMORY.store(bytes, Ordering::Release);
    }
}

/// Override the detected memory size (hosted tests and early bring-up).
pub fn set_total_memory(bytes: u32) {
    TOTAL_MEMORY.store(bytes, Ordering::Release);
}

/// Total physical memory in bytes as published by the loader.
pub fn total_memory() -> u32 {
    TOTAL_MEMORY.load(Ordering::Acquire)
}
