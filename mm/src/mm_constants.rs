//! Memory layout constants and page-entry flags.
//!
//! The loader places the kernel image at the bottom of the higher half and
//! builds 256 boot page tables so the first gigabyte of the kernel window is
//! wired before `mm_init` runs. Physical memory left over after the image,
//! the boot directory and the boot tables is split evenly between the kernel
//! and user pools.

use basalt_abi::PAGE_SIZE;
use bitflags::bitflags;

pub use basalt_abi::PAGE_SIZE as PAGE_SIZE_4KB;

/// Virtual base of the kernel half of every address space.
pub const KERNEL_BASE: u32 = 0xC000_0000;

/// First page-directory index of the shared kernel window.
pub const KERNEL_PDE_START: usize = (KERNEL_BASE >> 22) as usize;

/// Physical address of the boot page directory.
pub const BOOT_PAGE_DIR_PHYS: u32 = 0x0010_0000;

/// Memory budget of the kernel image.
pub const KERNEL_IMAGE_SIZE: u32 = 0x0010_0000;

/// Number of page tables prepared by the loader for the kernel window.
pub const BOOT_PAGE_TABLE_COUNT: u32 = 256;

/// Staging area (below the EBDA) that backs the three boot-time bitmaps.
pub const BITMAP_STAGING_BASE: u32 = 0xC009_A000;

/// Base of the kernel virtual-address pool.
pub const KERNEL_HEAP_BASE: u32 = KERNEL_BASE + KERNEL_IMAGE_SIZE;

/// Load address of user-process images.
pub const USER_IMAGE_BASE: u32 = 0x0804_8000;

/// Top of the single user stack page; the page itself sits right below the
/// kernel window.
pub const USER_STACK_TOP: u32 = KERNEL_BASE;
pub const USER_STACK_PAGE: u32 = KERNEL_BASE - PAGE_SIZE;

bitflags! {
    /// PDE/PTE control bits. Only the bits the kernel manages are modelled;
    /// accessed/dirty are hardware-maintained and ignored.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl PageFlags {
    pub const KERNEL_RW: Self = Self::PRESENT.union(Self::WRITABLE);
    pub const USER_RW: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

/// Which pair of pools an allocation draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    Kernel,
    User,
}
