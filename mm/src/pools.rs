//! Physical page pools and virtual-address pools.
//!
//! Free physical memory is split into two disjoint, bitmap-tracked ranges:
//! one backing kernel allocations, one backing user pages. Virtual
//! addresses are tracked the same way — one kernel pool in high memory and
//! one per-process pool covering `[USER_IMAGE_BASE, KERNEL_BASE)`.
//!
//! The composed operations at the bottom pair the two: reserve virtual
//! pages, back each with a physical page, map, zero, and roll back cleanly
//! on partial failure.

use core::sync::atomic::{AtomicUsize, Ordering};

use basalt_abi::NPOS;
use basalt_abi::addr::{PhysAddr, VirtAddr};
use basalt_abi::PAGE_SIZE;
use basalt_lib::boot_info;
use basalt_lib::{Bitmap, IrqMutex, klog_info};

use crate::mm_constants::{
    BITMAP_STAGING_BASE, BOOT_PAGE_TABLE_COUNT, KERNEL_BASE, KERNEL_HEAP_BASE, KERNEL_IMAGE_SIZE,
    PageFlags, PoolKind,
};
use crate::paging;

// ---------------------------------------------------------------------------
// Physical pools
// ---------------------------------------------------------------------------

struct PhysPool {
    start: PhysAddr,
    bitmap: Bitmap,
    free_count: usize,
}

impl PhysPool {
    const fn empty() -> Self {
        Self {
            start: PhysAddr::NULL,
            bitmap: Bitmap::empty(),
            free_count: 0,
        }
    }

    /// Allocate `count` contiguous page frames. Returns [`PhysAddr::NULL`]
    /// when no run of that length is free.
    fn alloc(&mut self, count: usize) -> PhysAddr {
        debug_assert!(count > 0);
        let begin = self.bitmap.alloc(count);
        if begin == NPOS {
            return PhysAddr::NULL;
        }
        debug_assert!(self.free_count >= count);
        self.free_count -= count;
        self.start.offset((begin as u32) * PAGE_SIZE)
    }

    fn free(&mut self, base: PhysAddr, count: usize) {
        assert!(base.is_page_aligned() && base >= self.start);
        let begin = ((base.as_u32() - self.start.as_u32()) / PAGE_SIZE) as usize;
        self.bitmap.free(begin, count);
        self.free_count += count;
    }

    fn contains(&self, addr: PhysAddr) -> bool {
        let end = self
            .start
            .as_u32()
            .wrapping_add((self.bitmap.capacity() as u32) * PAGE_SIZE);
        addr >= self.start && addr.as_u32() < end
    }
}

static KERNEL_PHYS_POOL: IrqMutex<PhysPool> = IrqMutex::new(PhysPool::empty());
static USER_PHYS_POOL: IrqMutex<PhysPool> = IrqMutex::new(PhysPool::empty());

// ---------------------------------------------------------------------------
// Virtual-address pools
// ---------------------------------------------------------------------------

/// A bitmap-tracked pool of page-aligned virtual addresses. The kernel owns
/// one; every process embeds one for its user half.
pub struct VrAddrPool {
    start: VirtAddr,
    bitmap: Bitmap,
    free_count: usize,
}

impl VrAddrPool {
    pub const fn empty() -> Self {
        Self {
            start: VirtAddr::NULL,
            bitmap: Bitmap::empty(),
            free_count: 0,
        }
    }

    /// # Safety
    /// `bits` must be valid for `byte_len` bytes for the pool's lifetime.
    pub unsafe fn init(&mut self, start: VirtAddr, bits: *mut u8, byte_len: usize) {
        debug_assert!(start.is_page_aligned());
        self.start = start;
        self.bitmap = unsafe { Bitmap::new(bits, byte_len, true) };
        self.free_count = self.bitmap.capacity();
    }

    /// Reserve `count` contiguous virtual pages. Returns
    /// [`VirtAddr::NULL`] on exhaustion.
    pub fn alloc(&mut self, count: usize) -> VirtAddr {
        debug_assert!(count > 0);
        let begin = self.bitmap.alloc(count);
        if begin == NPOS {
            return VirtAddr::NULL;
        }
        debug_assert!(self.free_count >= count);
        self.free_count -= count;
        self.start.offset((begin as u32) * PAGE_SIZE)
    }

    /// Pin the page containing `va`, which must not already be reserved.
    pub fn alloc_at(&mut self, va: VirtAddr) -> VirtAddr {
        let page = va.page_base();
        let bit = ((page.as_u32() - self.start.as_u32()) / PAGE_SIZE) as usize;
        debug_assert!(!self.bitmap.is_allocated(bit));
        self.bitmap.force_alloc(bit, 1);
        debug_assert!(self.free_count >= 1);
        self.free_count -= 1;
        page
    }

    pub fn free(&mut self, base: VirtAddr, count: usize) {
        assert!(base.is_page_aligned() && base >= self.start);
        let begin = ((base.as_u32() - self.start.as_u32()) / PAGE_SIZE) as usize;
        self.bitmap.free(begin, count);
        self.free_count += count;
    }

    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.bitmap.capacity()
    }

    /// Whether the page at bit index `idx` is reserved. Fork walks the
    /// parent pool with this.
    #[inline]
    pub fn is_allocated(&self, idx: usize) -> bool {
        self.bitmap.is_allocated(idx)
    }

    /// The virtual address corresponding to bit index `idx`.
    #[inline]
    pub fn page_at(&self, idx: usize) -> VirtAddr {
        self.start.offset((idx as u32) * PAGE_SIZE)
    }
}

static KERNEL_VADDR_POOL: IrqMutex<VrAddrPool> = IrqMutex::new(VrAddrPool::empty());

// ---------------------------------------------------------------------------
// Current-process pool provider
// ---------------------------------------------------------------------------
//
// The process layer lives above this crate, so user-pool lookups go through
// a registered callback instead of a direct dependency.

/// Returns the user virtual-address pool of the current process, or null
/// when the caller is a kernel thread.
pub type UserPoolProvider = fn() -> *mut VrAddrPool;

static USER_POOL_PROVIDER: AtomicUsize = AtomicUsize::new(0);

pub fn register_user_pool_provider(provider: UserPoolProvider) {
    USER_POOL_PROVIDER.store(provider as usize, Ordering::Release);
}

fn current_user_pool() -> *mut VrAddrPool {
    let raw = USER_POOL_PROVIDER.load(Ordering::Acquire);
    if raw == 0 {
        return core::ptr::null_mut();
    }
    let provider: UserPoolProvider = unsafe { core::mem::transmute(raw) };
    provider()
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

/// Carve the physical pools and the kernel virtual-address pool out of the
/// memory size published by the loader. Kernel and user pools each get half
/// of the free pages; the three boot bitmaps live in the staging area below
/// the EBDA.
pub fn mm_init() {
    let total = boot_info::total_memory();
    assert!(total > 0, "loader did not publish a memory size");

    let page_dir_size = PAGE_SIZE;
    let boot_tables_size = PAGE_SIZE * BOOT_PAGE_TABLE_COUNT;
    let used = page_dir_size + boot_tables_size + KERNEL_IMAGE_SIZE;
    let free_pages = ((total - used) / PAGE_SIZE) as usize;

    let kernel_free = free_pages / 2;
    let user_free = free_pages - kernel_free;

    let kernel_phys_base = PhysAddr::new(used);
    let user_phys_base = kernel_phys_base.offset((kernel_free as u32) * PAGE_SIZE);

    let kernel_bm_len = kernel_free / 8;
    let user_bm_len = user_free / 8;

    let kernel_bm = BITMAP_STAGING_BASE as *mut u8;
    let user_bm = (BITMAP_STAGING_BASE as usize + kernel_bm_len) as *mut u8;
    let vaddr_bm = (BITMAP_STAGING_BASE as usize + kernel_bm_len + user_bm_len) as *mut u8;

    unsafe {
        let mut pool = KERNEL_PHYS_POOL.lock();
        pool.start = kernel_phys_base;
        pool.bitmap = Bitmap::new(kernel_bm, kernel_bm_len, true);
        pool.free_count = pool.bitmap.capacity();

        let mut pool = USER_PHYS_POOL.lock();
        pool.start = user_phys_base;
        pool.bitmap = Bitmap::new(user_bm, user_bm_len, true);
        pool.free_count = pool.bitmap.capacity();

        let mut pool = KERNEL_VADDR_POOL.lock();
        pool.init(VirtAddr::new(KERNEL_HEAP_BASE), vaddr_bm, kernel_bm_len);
    }

    klog_info!("memory pools initialised ({} KiB total)", total / 1024);
    klog_info!("  kernel frames at {:#x}", kernel_phys_base.as_u32());
    klog_info!("  user frames at {:#x}", user_phys_base.as_u32());
}

// ---------------------------------------------------------------------------
// Composed operations
// ---------------------------------------------------------------------------

pub(crate) fn alloc_phys_page(kind: PoolKind) -> PhysAddr {
    match kind {
        PoolKind::Kernel => KERNEL_PHYS_POOL.lock().alloc(1),
        PoolKind::User => USER_PHYS_POOL.lock().alloc(1),
    }
}

fn free_phys_page(frame: PhysAddr) {
    let mut user = USER_PHYS_POOL.lock();
    if user.contains(frame) {
        user.free(frame, 1);
        return;
    }
    drop(user);
    KERNEL_PHYS_POOL.lock().free(frame, 1);
}

fn map_flags(kind: PoolKind) -> PageFlags {
    match kind {
        PoolKind::Kernel => PageFlags::KERNEL_RW,
        PoolKind::User => PageFlags::USER_RW,
    }
}

fn reserve_vaddrs(kind: PoolKind, count: usize) -> VirtAddr {
    match kind {
        PoolKind::Kernel => KERNEL_VADDR_POOL.lock().alloc(count),
        PoolKind::User => {
            let pool = current_user_pool();
            assert!(!pool.is_null(), "user allocation without a current process");
            unsafe { (*pool).alloc(count) }
        }
    }
}

fn release_vaddrs(base: VirtAddr, count: usize) {
    if base.as_u32() >= KERNEL_BASE {
        KERNEL_VADDR_POOL.lock().free(base, count);
    } else {
        let pool = current_user_pool();
        assert!(!pool.is_null(), "user free without a current process");
        unsafe { (*pool).free(base, count) };
    }
}

/// Allocate and map `count` virtual pages from the given pool pair.
/// The returned region is zeroed. On partial failure every page already
/// allocated is unwound and [`VirtAddr::NULL`] is returned.
pub fn alloc_pages(kind: PoolKind, count: usize) -> VirtAddr {
    let base = reserve_vaddrs(kind, count);
    if base.is_null() {
        klog_info!("alloc_pages: no {count}-page run of virtual addresses");
        return VirtAddr::NULL;
    }

    for i in 0..count {
        let va = base.offset((i as u32) * PAGE_SIZE);
        let frame = alloc_phys_page(kind);
        if frame.is_null() {
            klog_info!("alloc_pages: out of physical pages");
            for j in 0..i {
                let mapped = base.offset((j as u32) * PAGE_SIZE);
                free_phys_page(paging::virt_to_phys(mapped).page_base());
                paging::unmap(mapped);
            }
            release_vaddrs(base, count);
            return VirtAddr::NULL;
        }
        paging::map_to_phys(va, frame, map_flags(kind));
    }

    unsafe { core::ptr::write_bytes(base.as_mut_ptr::<u8>(), 0, count * PAGE_SIZE as usize) };
    base
}

/// Allocate one page at a specific virtual address out of the current
/// pool for `kind`.
pub fn alloc_page_at(kind: PoolKind, va: VirtAddr) -> VirtAddr {
    match kind {
        PoolKind::Kernel => {
            let page = KERNEL_VADDR_POOL.lock().alloc_at(va);
            map_one(kind, page)
        }
        PoolKind::User => {
            let pool = current_user_pool();
            assert!(!pool.is_null(), "user allocation without a current process");
            alloc_page_at_in(kind, unsafe { &mut *pool }, va)
        }
    }
}

/// Allocate one page at `va` using an explicit address pool. Fork uses this
/// to populate the child while its page directory is active.
pub fn alloc_page_at_in(kind: PoolKind, pool: &mut VrAddrPool, va: VirtAddr) -> VirtAddr {
    let page = pool.alloc_at(va);
    map_one(kind, page)
}

fn map_one(kind: PoolKind, page: VirtAddr) -> VirtAddr {
    let frame = alloc_phys_page(kind);
    if frame.is_null() {
        klog_info!("alloc_page_at: out of physical pages");
        return VirtAddr::NULL;
    }
    paging::map_to_phys(page, frame, map_flags(kind));
    unsafe { core::ptr::write_bytes(page.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize) };
    page
}

/// Unmap `count` pages starting at `base` and return them to their pools.
pub fn free_pages(base: VirtAddr, count: usize) {
    assert!(base.is_page_aligned());
    for i in 0..count {
        let va = base.offset((i as u32) * PAGE_SIZE);
        let frame = paging::virt_to_phys(va).page_base();
        assert!(!frame.is_null(), "freeing an unmapped page");
        paging::unmap(va);
        free_phys_page(frame);
    }
    release_vaddrs(base, count);
}

/// Free-page counters for diagnostics and self-tests.
pub fn free_page_counts() -> (usize, usize, usize) {
    let kernel_phys = KERNEL_PHYS_POOL.lock().free_count;
    let user_phys = USER_PHYS_POOL.lock().free_count;
    let kernel_vaddr = KERNEL_VADDR_POOL.lock().free_count();
    (kernel_phys, user_phys, kernel_vaddr)
}
