//! Flat segmentation and the task-state segment.
//!
//! The loader boots with its own GDT; the kernel installs a permanent one
//! with flat ring-0/ring-3 code and data segments plus a single TSS. The
//! TSS exists for exactly one purpose here: publishing the kernel stack
//! pointer (`esp0`) used when a trap arrives from user mode.

use core::cell::UnsafeCell;
use core::mem::size_of;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// The 32-bit task-state segment. Only `ss0`/`esp0` (and the I/O bitmap
/// base) are meaningful for stack switching; the rest is unused.
#[repr(C, packed)]
struct TaskStateSegment {
    prev_task_link: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt_selector: u32,
    trap: u16,
    iomap_base: u16,
}

const _: () = assert!(size_of::<TaskStateSegment>() == 104);

struct TssCell(UnsafeCell<TaskStateSegment>);

// SAFETY: single CPU; esp0 updates happen with interrupts disabled during
// context switches.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment {
    prev_task_link: 0,
    esp0: 0,
    ss0: KERNEL_DATA_SELECTOR as u32,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    cs: 0,
    ss: 0,
    ds: 0,
    fs: 0,
    gs: 0,
    ldt_selector: 0,
    trap: 0,
    iomap_base: size_of::<TaskStateSegment>() as u16,
}));

/// Publish the kernel stack used for the next trap out of ring 3.
#[inline]
pub fn tss_set_esp0(esp0: u32) {
    unsafe { (*TSS.0.get()).esp0 = esp0 };
}

// ---------------------------------------------------------------------------
// GDT
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
#[repr(transparent)]
struct GdtEntry(u64);

impl GdtEntry {
    const fn null() -> Self {
        Self(0)
    }

    /// A flat 4 GiB segment descriptor.
    const fn flat(code: bool, dpl: u8) -> Self {
        // base 0, limit 0xFFFFF, 4 KiB granularity, 32-bit.
        let access: u64 = 0x80 | ((dpl as u64) << 5) | 0x10 | if code { 0x0A } else { 0x02 };
        let flags: u64 = 0x0C; // G + D/B
        Self(0x0000_FFFF | (access << 40) | (flags << 52) | (0xF_u64 << 48))
    }

    /// An available 32-bit TSS descriptor for `base`/`limit`.
    fn tss(base: u32, limit: u32) -> Self {
        let base = base as u64;
        let limit = limit as u64;
        let access: u64 = 0x89; // present, type 9 (available 32-bit TSS)
        Self(
            (limit & 0xFFFF)
                | ((base & 0xFF_FFFF) << 16)
                | (access << 40)
                | (((limit >> 16) & 0xF) << 48)
                | (((base >> 24) & 0xFF) << 56),
        )
    }
}

struct GdtCell(UnsafeCell<[GdtEntry; 6]>);

// SAFETY: written once during single-threaded boot, read-only afterwards.
unsafe impl Sync for GdtCell {}

static GDT: GdtCell = GdtCell(UnsafeCell::new([
    GdtEntry::null(),
    GdtEntry::flat(true, 0),
    GdtEntry::flat(false, 0),
    GdtEntry::flat(true, 3),
    GdtEntry::flat(false, 3),
    GdtEntry::null(), // TSS, patched at init
]));

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Install the kernel GDT, reload the segment registers and load the TSS.
pub fn gdt_init() {
    unsafe {
        let gdt = &mut *GDT.0.get();
        gdt[5] = GdtEntry::tss(
            TSS.0.get() as u32,
            size_of::<TaskStateSegment>() as u32 - 1,
        );
    }

    #[cfg(target_arch = "x86")]
    unsafe {
        use core::arch::asm;

        let pointer = DescriptorTablePointer {
            limit: (size_of::<[GdtEntry; 6]>() - 1) as u16,
            base: GDT.0.get() as u32,
        };

        asm!(
            "lgdt [{ptr}]",
            // Reload CS with a far jump, then the data segments.
            "push {kcode}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {kdata:x}",
            "mov es, {kdata:x}",
            "mov fs, {kdata:x}",
            "mov gs, {kdata:x}",
            "mov ss, {kdata:x}",
            "ltr {tss:x}",
            ptr = in(reg) &raw const pointer,
            kcode = const KERNEL_CODE_SELECTOR as u32,
            kdata = in(reg) KERNEL_DATA_SELECTOR as u32,
            tss = in(reg) TSS_SELECTOR,
            tmp = out(reg) _,
        );
    }
}
