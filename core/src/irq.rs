//! Interrupt dispatch: the IDT, the entry stubs, the handler table and the
//! shared exit path.
//!
//! Every vector funnels through a per-vector stub that records the vector
//! number, saves the full register frame and calls [`intr_dispatch`]. The
//! exit path `intr_exit` restores the frame and `iretd`s; it is also the
//! landing strip for two deliberate forgeries: a new user process "returns"
//! through it into ring 3, and a forked child resumes through it with a
//! copied frame whose `eax` is zero.

use core::sync::atomic::{AtomicUsize, Ordering};

use basalt_lib::{klog_info, klog_warn};

/// Number of vectors the kernel installs (exceptions, 16 IRQs, syscall).
pub const INTR_COUNT: usize = 0x31;

/// First hardware interrupt vector after PIC remapping.
pub const IRQ_BASE_VECTOR: usize = 0x20;

pub const CLOCK_VECTOR: usize = IRQ_BASE_VECTOR;
pub const KEYBOARD_VECTOR: usize = IRQ_BASE_VECTOR + 1;
pub const PRIMARY_IDE_VECTOR: usize = IRQ_BASE_VECTOR + 14;
pub const SECONDARY_IDE_VECTOR: usize = IRQ_BASE_VECTOR + 15;

/// The PIC raises these on its IRQ 7/15 lines without a real source; they
/// are dropped without acknowledgement.
pub const SPURIOUS_IRQ7_VECTOR: usize = 0x27;
pub const SPURIOUS_IRQ15_VECTOR: usize = 0x2F;

/// The register frame the stubs build on the kernel stack, lowest address
/// first. Matches the push sequence in `stub_common` exactly.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IntrFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    // pushad order, edi pushed last.
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // Only present when the interrupt crossed from ring 3.
    pub user_esp: u32,
    pub user_ss: u32,
}

pub type IntrHandler = fn(&mut IntrFrame);

const HANDLER_INIT: AtomicUsize = AtomicUsize::new(0);
static HANDLERS: [AtomicUsize; INTR_COUNT] = [HANDLER_INIT; INTR_COUNT];

/// Install `handler` for `vector`, replacing any previous one.
pub fn register_handler(vector: usize, handler: IntrHandler) {
    assert!(vector < INTR_COUNT);
    HANDLERS[vector].store(handler as usize, Ordering::Release);
}

/// Common dispatch entry, called by the stubs with the frame address.
pub extern "C" fn intr_dispatch(frame: *mut IntrFrame) {
    let frame = unsafe { &mut *frame };
    let vector = frame.vector as usize;

    if vector >= INTR_COUNT {
        klog_warn!("interrupt: vector {vector:#x} out of range");
        return;
    }

    let raw = HANDLERS[vector].load(Ordering::Acquire);
    if raw == 0 {
        // The PIC raises phantom IRQ 7/15 without a source; with no driver
        // claiming those vectors they are dropped without acknowledgement.
        if vector == SPURIOUS_IRQ7_VECTOR || vector == SPURIOUS_IRQ15_VECTOR {
            return;
        }
        if vector < IRQ_BASE_VECTOR {
            panic!(
                "unhandled exception {:#x}, err={:#x}, eip={:#x}",
                vector, frame.err_code, frame.eip
            );
        }
        klog_info!("interrupt: no handler for vector {vector:#x}");
        return;
    }

    let handler: IntrHandler = unsafe { core::mem::transmute(raw) };
    handler(frame);
}

// ---------------------------------------------------------------------------
// IDT
// ---------------------------------------------------------------------------

#[cfg(target_arch = "x86")]
mod arch {
    use core::arch::{asm, naked_asm};
    use core::cell::UnsafeCell;

    use super::{INTR_COUNT, intr_dispatch};
    use crate::gdt::KERNEL_CODE_SELECTOR;

    #[derive(Clone, Copy)]
    #[repr(C)]
    struct IdtEntry {
        offset_low: u16,
        selector: u16,
        zero: u8,
        attributes: u8,
        offset_high: u16,
    }

    impl IdtEntry {
        const fn missing() -> Self {
            Self {
                offset_low: 0,
                selector: 0,
                zero: 0,
                attributes: 0,
                offset_high: 0,
            }
        }

        fn interrupt_gate(handler: u32, dpl: u8) -> Self {
            Self {
                offset_low: handler as u16,
                selector: KERNEL_CODE_SELECTOR,
                zero: 0,
                attributes: 0x8E | (dpl << 5), // present, 32-bit interrupt gate
                offset_high: (handler >> 16) as u16,
            }
        }
    }

    struct IdtCell(UnsafeCell<[IdtEntry; INTR_COUNT]>);

    // SAFETY: written once during single-threaded boot.
    unsafe impl Sync for IdtCell {}

    static IDT: IdtCell = IdtCell(UnsafeCell::new([IdtEntry::missing(); INTR_COUNT]));

    #[repr(C, packed)]
    struct IdtPointer {
        limit: u16,
        base: u32,
    }

    /// The shared register-restore + `iretd` path. `esp` must point at the
    /// `gs` slot of an [`super::IntrFrame`].
    #[unsafe(naked)]
    pub extern "C" fn intr_exit() -> ! {
        naked_asm!(
            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            // Skip vector and error code.
            "add esp, 8",
            "iretd",
        );
    }

    #[unsafe(naked)]
    extern "C" fn stub_common() {
        naked_asm!(
            // The cpu (+ the vector stub) already pushed eflags..err/vector.
            "pushad",
            "push ds",
            "push es",
            "push fs",
            "push gs",

            // Interrupts run on kernel data segments.
            "mov ax, {kdata}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",

            "push esp",
            "call {dispatch}",
            "add esp, 4",

            "pop gs",
            "pop fs",
            "pop es",
            "pop ds",
            "popad",
            "add esp, 8",
            "iretd",

            kdata = const super::super::gdt::KERNEL_DATA_SELECTOR as u32,
            dispatch = sym intr_dispatch,
        );
    }

    macro_rules! intr_stub {
        ($name:ident, $vector:literal, has_err) => {
            #[unsafe(naked)]
            extern "C" fn $name() {
                naked_asm!(
                    "push {vector}",
                    "jmp {common}",
                    vector = const $vector,
                    common = sym stub_common,
                );
            }
        };
        ($name:ident, $vector:literal) => {
            #[unsafe(naked)]
            extern "C" fn $name() {
                naked_asm!(
                    "push 0",
                    "push {vector}",
                    "jmp {common}",
                    vector = const $vector,
                    common = sym stub_common,
                );
            }
        };
    }

    intr_stub!(stub_00, 0x00);
    intr_stub!(stub_01, 0x01);
    intr_stub!(stub_02, 0x02);
    intr_stub!(stub_03, 0x03);
    intr_stub!(stub_04, 0x04);
    intr_stub!(stub_05, 0x05);
    intr_stub!(stub_06, 0x06);
    intr_stub!(stub_07, 0x07);
    intr_stub!(stub_08, 0x08, has_err);
    intr_stub!(stub_09, 0x09);
    intr_stub!(stub_0a, 0x0A, has_err);
    intr_stub!(stub_0b, 0x0B, has_err);
    intr_stub!(stub_0c, 0x0C, has_err);
    intr_stub!(stub_0d, 0x0D, has_err);
    intr_stub!(stub_0e, 0x0E, has_err);
    intr_stub!(stub_0f, 0x0F);
    intr_stub!(stub_10, 0x10);
    intr_stub!(stub_11, 0x11, has_err);
    intr_stub!(stub_12, 0x12);
    intr_stub!(stub_13, 0x13);
    intr_stub!(stub_14, 0x14);
    intr_stub!(stub_15, 0x15);
    intr_stub!(stub_16, 0x16);
    intr_stub!(stub_17, 0x17);
    intr_stub!(stub_18, 0x18);
    intr_stub!(stub_19, 0x19);
    intr_stub!(stub_1a, 0x1A);
    intr_stub!(stub_1b, 0x1B);
    intr_stub!(stub_1c, 0x1C);
    intr_stub!(stub_1d, 0x1D);
    intr_stub!(stub_1e, 0x1E);
    intr_stub!(stub_1f, 0x1F);
    intr_stub!(stub_20, 0x20);
    intr_stub!(stub_21, 0x21);
    intr_stub!(stub_22, 0x22);
    intr_stub!(stub_23, 0x23);
    intr_stub!(stub_24, 0x24);
    intr_stub!(stub_25, 0x25);
    intr_stub!(stub_26, 0x26);
    intr_stub!(stub_27, 0x27);
    intr_stub!(stub_28, 0x28);
    intr_stub!(stub_29, 0x29);
    intr_stub!(stub_2a, 0x2A);
    intr_stub!(stub_2b, 0x2B);
    intr_stub!(stub_2c, 0x2C);
    intr_stub!(stub_2d, 0x2D);
    intr_stub!(stub_2e, 0x2E);
    intr_stub!(stub_2f, 0x2F);
    intr_stub!(stub_30, 0x30);

    const STUBS: [extern "C" fn(); INTR_COUNT] = [
        stub_00, stub_01, stub_02, stub_03, stub_04, stub_05, stub_06, stub_07, stub_08, stub_09,
        stub_0a, stub_0b, stub_0c, stub_0d, stub_0e, stub_0f, stub_10, stub_11, stub_12, stub_13,
        stub_14, stub_15, stub_16, stub_17, stub_18, stub_19, stub_1a, stub_1b, stub_1c, stub_1d,
        stub_1e, stub_1f, stub_20, stub_21, stub_22, stub_23, stub_24, stub_25, stub_26, stub_27,
        stub_28, stub_29, stub_2a, stub_2b, stub_2c, stub_2d, stub_2e, stub_2f, stub_30,
    ];

    /// Build every gate and load the IDT. The syscall gate is reachable
    /// from ring 3; everything else is DPL 0.
    pub fn idt_init() {
        unsafe {
            let idt = &mut *IDT.0.get();
            for (vector, stub) in STUBS.iter().enumerate() {
                let dpl = if vector == basalt_abi::syscall::SYSCALL_VECTOR {
                    3
                } else {
                    0
                };
                idt[vector] = IdtEntry::interrupt_gate(*stub as usize as u32, dpl);
            }

            let pointer = IdtPointer {
                limit: (core::mem::size_of::<[IdtEntry; INTR_COUNT]>() - 1) as u16,
                base: IDT.0.get() as u32,
            };
            asm!("lidt [{}]", in(reg) &raw const pointer);
        }
    }

    /// Address of the exit path, for the forged frames of fork and the
    /// user-process startup.
    pub fn intr_exit_addr() -> u32 {
        intr_exit as usize as u32
    }
}

#[cfg(not(target_arch = "x86"))]
mod arch {
    pub fn idt_init() {}

    pub fn intr_exit_addr() -> u32 {
        0
    }
}

pub use arch::{idt_init, intr_exit_addr};

/// Install the IDT. Handlers register separately as subsystems come up.
pub fn irq_init() {
    idt_init();
    klog_info!("interrupt dispatch initialised ({INTR_COUNT} vectors)");
}
