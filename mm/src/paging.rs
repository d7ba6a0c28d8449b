//! Page-directory and page-table manipulation through the recursive window.
//!
//! The last page-directory entry points at the directory itself. Seen
//! through that entry the directory doubles as a page table, which pins the
//! paging structures of the *current* address space at fixed virtual
//! addresses:
//!
//! ```text
//! 0xFFFF_F000 + pde * 4              the PDE for any address
//! 0xFFC0_0000 + (pde << 12) + pte*4  the PTE for any address
//! ```
//!
//! All functions here operate on whichever address space is loaded in CR3.
//! Cross-space access (fork) switches CR3 around calls into this module.

use basalt_abi::addr::{PhysAddr, VirtAddr};
use basalt_abi::{PAGE_DIR_ENTRY_COUNT, PAGE_DIR_SELF_REF, PAGE_SIZE};
use basalt_lib::cpu;

use crate::mm_constants::{BOOT_PAGE_DIR_PHYS, KERNEL_PDE_START, PageFlags};
use crate::pools;

/// A page-directory or page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    const FRAME_MASK: u32 = !(PAGE_SIZE - 1);

    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn new(frame: PhysAddr, flags: PageFlags) -> Self {
        Self((frame.as_u32() & Self::FRAME_MASK) | flags.bits())
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & Self::FRAME_MASK)
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn clear_present(&mut self) {
        self.0 &= !PageFlags::PRESENT.bits();
    }
}

/// The current page directory, visible as a page table through the
/// self-reference.
pub const PAGE_DIR_WINDOW: VirtAddr =
    VirtAddr::from_indices(PAGE_DIR_SELF_REF, PAGE_DIR_SELF_REF, 0);

/// Address of the PDE covering `va` in the current address space.
#[inline]
pub fn pde_for(va: VirtAddr) -> *mut PageEntry {
    VirtAddr::from_indices(
        PAGE_DIR_SELF_REF,
        PAGE_DIR_SELF_REF,
        (va.pde_index() * core::mem::size_of::<PageEntry>()) as u32,
    )
    .as_mut_ptr()
}

/// Address of the PTE covering `va` in the current address space.
/// Only valid while the PDE is present.
#[inline]
pub fn pte_for(va: VirtAddr) -> *mut PageEntry {
    VirtAddr::from_indices(
        PAGE_DIR_SELF_REF,
        va.pde_index(),
        (va.pte_index() * core::mem::size_of::<PageEntry>()) as u32,
    )
    .as_mut_ptr()
}

/// Base of the page table covering `va`, seen through the window.
#[inline]
fn page_table_window(va: VirtAddr) -> *mut u8 {
    VirtAddr::from_indices(PAGE_DIR_SELF_REF, va.pde_index(), 0).as_mut_ptr()
}

/// Whether `va` is mapped in the current address space.
pub fn is_mapped(va: VirtAddr) -> bool {
    unsafe { (*pde_for(va)).is_present() && (*pte_for(va)).is_present() }
}

/// Map `va` to the physical page `frame` in the current address space.
///
/// If the covering page table is absent, a fresh page is drawn from the
/// kernel physical pool, installed writable and user-accessible (the PTE
/// carries the effective protection) and zeroed.
///
/// Double-mapping a present page is a programming error and panics.
pub fn map_to_phys(va: VirtAddr, frame: PhysAddr, flags: PageFlags) {
    debug_assert!(!frame.is_null() && frame.is_page_aligned());
    unsafe {
        let pde = pde_for(va);
        if !(*pde).is_present() {
            let table = pools::alloc_phys_page(crate::mm_constants::PoolKind::Kernel);
            assert!(!table.is_null(), "out of kernel pages for a page table");
            *pde = PageEntry::new(table, PageFlags::USER_RW);
            core::ptr::write_bytes(page_table_window(va), 0, PAGE_SIZE as usize);
        }

        let pte = pte_for(va);
        assert!(!(*pte).is_present(), "virtual page is already mapped");
        *pte = PageEntry::new(frame, flags);
    }
}

/// Unmap `va` in the current address space. A no-op when the covering page
/// table is absent; flushes the TLB entry when a PTE is cleared.
pub fn unmap(va: VirtAddr) {
    unsafe {
        let pde = pde_for(va);
        if !(*pde).is_present() {
            return;
        }
        let pte = pte_for(va);
        (*pte).clear_present();
        cpu::invlpg(va.as_u32());
    }
}

/// Translate `va` through the current page tables. Returns
/// [`PhysAddr::NULL`] when the address is not mapped.
pub fn virt_to_phys(va: VirtAddr) -> PhysAddr {
    unsafe {
        if !(*pde_for(va)).is_present() {
            return PhysAddr::NULL;
        }
        let pte = *pte_for(va);
        if !pte.is_present() {
            return PhysAddr::NULL;
        }
        pte.frame().offset(va.page_offset())
    }
}

/// Physical address of the kernel's master page directory.
///
/// CR3 may point at a process directory by the time this is first needed,
/// so the boot-time constant is used rather than reading CR3.
#[inline]
pub fn kernel_page_dir_phys() -> PhysAddr {
    PhysAddr::new(BOOT_PAGE_DIR_PHYS)
}

/// Load `dir` into CR3.
#[inline]
pub fn activate_page_dir(dir: PhysAddr) {
    cpu::write_cr3(dir.as_u32());
}

#[inline]
pub fn current_page_dir_phys() -> PhysAddr {
    PhysAddr::new(cpu::read_cr3())
}

/// Populate a freshly allocated process page directory at `dir_va`.
///
/// The kernel half (PDE indices ≥ [`KERNEL_PDE_START`]) is copied verbatim
/// from the current directory so every process shares the kernel mapping,
/// and the self-reference is installed in the last slot.
pub fn init_process_page_dir(dir_va: VirtAddr) {
    assert!(dir_va.is_page_aligned());
    let dir = dir_va.as_mut_ptr::<PageEntry>();
    let current = PAGE_DIR_WINDOW.as_ptr::<PageEntry>();
    unsafe {
        core::ptr::write_bytes(dir, 0, KERNEL_PDE_START);
        core::ptr::copy_nonoverlapping(
            current.add(KERNEL_PDE_START),
            dir.add(KERNEL_PDE_START),
            PAGE_DIR_ENTRY_COUNT - KERNEL_PDE_START,
        );

        let dir_phys = virt_to_phys(dir_va);
        assert!(!dir_phys.is_null());
        *dir.add(PAGE_DIR_SELF_REF) = PageEntry::new(dir_phys, PageFlags::KERNEL_RW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_frame_and_flags() {
        let entry = PageEntry::new(PhysAddr::new(0x0020_3000), PageFlags::USER_RW);
        assert!(entry.is_present());
        assert_eq!(entry.frame(), PhysAddr::new(0x0020_3000));
        assert_eq!(entry.flags(), PageFlags::USER_RW);
        assert_eq!(entry.raw(), 0x0020_3007);
    }

    #[test]
    fn clear_present_keeps_frame() {
        let mut entry = PageEntry::new(PhysAddr::new(0x5000), PageFlags::KERNEL_RW);
        entry.clear_present();
        assert!(!entry.is_present());
        assert_eq!(entry.frame(), PhysAddr::new(0x5000));
    }

    #[test]
    fn window_addresses() {
        assert_eq!(PAGE_DIR_WINDOW.as_u32(), 0xFFFF_F000);

        let va = VirtAddr::new(0xC010_2345);
        let pde = pde_for(va) as u32;
        let pte = pte_for(va) as u32;
        assert_eq!(pde, 0xFFFF_F000 + (va.pde_index() as u32) * 4);
        assert_eq!(pte, 0xFFC0_0000 + ((va.pde_index() as u32) << 12) + (va.pte_index() as u32) * 4);
    }
}
