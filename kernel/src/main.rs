//! The kernel binary: boot sequence, panic handling and the global
//! allocator.
//!
//! The loader enters `_start` in 32-bit protected mode with paging on,
//! the boot page directory self-referenced, a page-aligned boot stack and
//! the probed memory size at the handoff address. Bring-up follows the
//! dependency order of the subsystems: trap plumbing first, then memory,
//! threading and time, and only then — with interrupts live — the disk
//! stack and the file system, which need working IRQs to finish a single
//! read.
//!
//! On a non-kernel target this crate builds as an inert binary so that
//! `cargo test` can traverse the whole workspace.

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod kernel {
    use core::panic::PanicInfo;

    use basalt_core::{gdt, irq, process, scheduler, syscall};
    use basalt_drivers::{ide, keyboard, part, pic, pit, serial};
    use basalt_fs::fileio;
    use basalt_lib::ports::PIT_DEFAULT_FREQUENCY_HZ;
    use basalt_lib::{boot_info, cpu, klog_error, klog_info};
    use basalt_mm::KernelAllocator;

    #[global_allocator]
    static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        cpu::disable_interrupts();
        klog_error!("KERNEL PANIC: {}", info.message());
        if let Some(location) = info.location() {
            klog_error!("  at {}:{}", location.file(), location.line());
        }
        cpu::halt_loop();
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn _start() -> ! {
        kernel_main();
    }

    fn kernel_main() -> ! {
        basalt_lib::klog_init();
        serial::serial_init();
        boot_info::boot_info_init();
        klog_info!("basalt kernel starting, {} KiB memory", boot_info::total_memory() / 1024);

        gdt::gdt_init();
        irq::irq_init();
        pic::pic_init();

        basalt_mm::mm_init();
        process::process_init();
        scheduler::init_threading();
        syscall::syscall_init();

        pit::pit_init(PIT_DEFAULT_FREQUENCY_HZ);
        keyboard::keyboard_init();
        fileio::register_console(serial::serial_write, keyboard::keyboard_read);

        // The disk stack sleeps on IRQs, so interrupts go live first.
        cpu::enable_interrupts();

        ide::ide_init();
        if !part::mount_default_partition() {
            klog_error!("no usable file system; continuing without one");
        }

        #[cfg(feature = "builtin-tests")]
        {
            let summary = basalt_lib::testing::run_registered_suites();
            if !summary.all_passed() {
                panic!("built-in test suites failed");
            }
        }

        klog_info!("basalt is up");
        cpu::halt_loop();
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {}
