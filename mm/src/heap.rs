//! Byte-granularity allocation over the page pools.
//!
//! Seven block descriptors (16–1024 bytes) each keep a free list of
//! fixed-size blocks threaded through the blocks themselves. Backing
//! storage comes in *arenas*: a single page whose header names the owning
//! descriptor and counts its free blocks. Requests above 1024 bytes bypass
//! the descriptors entirely — a multi-page arena is allocated and the
//! header records the page count instead.
//!
//! The kernel owns one descriptor table; every process embeds its own, so
//! user-heap state dies with the process.

use core::sync::atomic::{AtomicUsize, Ordering};

use basalt_abi::PAGE_SIZE;
use basalt_abi::addr::VirtAddr;
use basalt_lib::{IntrGuard, IrqMutex, ListTag, TagList, klog_info};

use crate::mm_constants::{KERNEL_BASE, PoolKind};
use crate::pools;

/// Number of block size classes.
pub const BLOCK_DESC_COUNT: usize = 7;

/// The largest size served from a block descriptor; anything bigger gets a
/// multi-page arena of its own.
pub const MAX_BLOCK_SIZE: usize = 1024;

const BLOCK_SIZES: [usize; BLOCK_DESC_COUNT] = [16, 32, 64, 128, 256, 512, 1024];

/// Bytes reserved at the start of every arena page. Sixteen keeps every
/// block 16-byte aligned, which is the strongest alignment the kernel's
/// `GlobalAlloc` clients require.
const ARENA_HEADER_SIZE: usize = 16;

#[cfg(target_arch = "x86")]
const _: () = assert!(core::mem::size_of::<ArenaHeader>() <= ARENA_HEADER_SIZE);

/// Header at the base of every arena page.
#[repr(C)]
struct ArenaHeader {
    /// Owning descriptor, or null for a large arena.
    desc: *mut MemBlockDesc,
    /// Free blocks remaining (small arena) or total pages (large arena).
    count: usize,
    large: bool,
}

/// One size class: its block size, capacity per arena and free list.
pub struct MemBlockDesc {
    block_size: usize,
    blocks_per_arena: usize,
    free_blocks: TagList,
}

impl MemBlockDesc {
    const fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks_per_arena: (PAGE_SIZE as usize - ARENA_HEADER_SIZE) / block_size,
            free_blocks: TagList::new(),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn blocks_per_arena(&self) -> usize {
        self.blocks_per_arena
    }
}

/// The per-owner descriptor table (one static for the kernel, one embedded
/// in each process).
pub struct MemBlockDescTable {
    descs: [MemBlockDesc; BLOCK_DESC_COUNT],
}

impl MemBlockDescTable {
    pub const fn new() -> Self {
        Self {
            descs: [
                MemBlockDesc::new(BLOCK_SIZES[0]),
                MemBlockDesc::new(BLOCK_SIZES[1]),
                MemBlockDesc::new(BLOCK_SIZES[2]),
                MemBlockDesc::new(BLOCK_SIZES[3]),
                MemBlockDesc::new(BLOCK_SIZES[4]),
                MemBlockDesc::new(BLOCK_SIZES[5]),
                MemBlockDesc::new(BLOCK_SIZES[6]),
            ],
        }
    }

    /// The smallest descriptor whose block size satisfies `size`.
    fn min_desc(&mut self, size: usize) -> Option<&mut MemBlockDesc> {
        self.descs.iter_mut().find(|d| d.block_size >= size)
    }

    /// Free blocks currently listed for the class serving `size`.
    pub fn free_block_count(&mut self, size: usize) -> usize {
        self.min_desc(size).map(|d| d.free_blocks.len()).unwrap_or(0)
    }
}

impl Default for MemBlockDescTable {
    fn default() -> Self {
        Self::new()
    }
}

static KERNEL_BLOCK_DESCS: IrqMutex<MemBlockDescTable> = IrqMutex::new(MemBlockDescTable::new());

// ---------------------------------------------------------------------------
// Current-process descriptor-table provider (same pattern as the VA pools)
// ---------------------------------------------------------------------------

pub type UserHeapProvider = fn() -> *mut MemBlockDescTable;

static USER_HEAP_PROVIDER: AtomicUsize = AtomicUsize::new(0);

pub fn register_user_heap_provider(provider: UserHeapProvider) {
    USER_HEAP_PROVIDER.store(provider as usize, Ordering::Release);
}

fn current_user_heap() -> *mut MemBlockDescTable {
    let raw = USER_HEAP_PROVIDER.load(Ordering::Acquire);
    if raw == 0 {
        return core::ptr::null_mut();
    }
    let provider: UserHeapProvider = unsafe { core::mem::transmute(raw) };
    provider()
}

// ---------------------------------------------------------------------------
// Allocation
// ---------------------------------------------------------------------------

#[inline]
fn arena_of(ptr: *mut u8) -> *mut ArenaHeader {
    VirtAddr::from(ptr).page_base().as_mut_ptr()
}

#[inline]
unsafe fn arena_block(arena: *mut ArenaHeader, block_size: usize, idx: usize) -> *mut u8 {
    (arena as *mut u8).add(ARENA_HEADER_SIZE + idx * block_size)
}

fn alloc_from_table(kind: PoolKind, table: &mut MemBlockDescTable, size: usize) -> *mut u8 {
    let Some(desc) = table.min_desc(size) else {
        return core::ptr::null_mut();
    };

    if desc.free_blocks.is_empty() {
        // Grow the class by one arena and list every block it holds.
        let arena_va = pools::alloc_pages(kind, 1);
        if arena_va.is_null() {
            return core::ptr::null_mut();
        }
        let arena = arena_va.as_mut_ptr::<ArenaHeader>();
        unsafe {
            (*arena).desc = desc as *mut MemBlockDesc;
            (*arena).count = desc.blocks_per_arena;
            (*arena).large = false;
            for idx in 0..desc.blocks_per_arena {
                let tag = arena_block(arena, desc.block_size, idx) as *mut ListTag;
                // The arena page arrives zeroed, so the tags are unlinked.
                desc.free_blocks.push_back(&mut *tag);
            }
        }
    }

    let tag = desc.free_blocks.pop_front();
    debug_assert!(!tag.is_null());
    let block = tag as *mut u8;
    unsafe {
        let arena = arena_of(block);
        debug_assert!((*arena).count > 0);
        (*arena).count -= 1;
    }
    block
}

/// Allocate `size` bytes from the kernel or the current process heap.
/// Returns null on exhaustion; the error has already been logged.
pub fn sys_alloc(kind: PoolKind, size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }

    if size > MAX_BLOCK_SIZE {
        let pages = (size + ARENA_HEADER_SIZE).div_ceil(PAGE_SIZE as usize);
        let arena_va = pools::alloc_pages(kind, pages);
        if arena_va.is_null() {
            return core::ptr::null_mut();
        }
        let arena = arena_va.as_mut_ptr::<ArenaHeader>();
        unsafe {
            (*arena).desc = core::ptr::null_mut();
            (*arena).count = pages;
            (*arena).large = true;
            arena_va.as_mut_ptr::<u8>().add(ARENA_HEADER_SIZE)
        }
    } else {
        match kind {
            PoolKind::Kernel => {
                let mut table = KERNEL_BLOCK_DESCS.lock();
                alloc_from_table(kind, &mut table, size)
            }
            PoolKind::User => {
                let _guard = IntrGuard::new();
                let table = current_user_heap();
                assert!(!table.is_null(), "user allocation without a current process");
                alloc_from_table(kind, unsafe { &mut *table }, size)
            }
        }
    }
}

fn free_to_table(table: &mut MemBlockDescTable, ptr: *mut u8) {
    let arena = arena_of(ptr);
    unsafe {
        let desc = (*arena).desc;
        debug_assert!(!desc.is_null());
        // The table owning `desc` is exactly `table`; assert it in debug
        // builds by checking the pointer lands inside the array.
        debug_assert!({
            let first = table.descs.as_ptr() as usize;
            let last = first + (BLOCK_DESC_COUNT - 1) * core::mem::size_of::<MemBlockDesc>();
            (desc as usize) >= first && (desc as usize) <= last
        });

        let tag = ptr as *mut ListTag;
        *tag = ListTag::new();
        // LIFO: the block just freed is the next one handed out.
        (*desc).free_blocks.push_front(&mut *tag);
        (*arena).count += 1;

        if (*arena).count == (*desc).blocks_per_arena {
            // Every block is free again: delist them and drop the page.
            for idx in 0..(*desc).blocks_per_arena {
                let block = arena_block(arena, (*desc).block_size, idx) as *mut ListTag;
                TagList::remove(&mut *block);
            }
            pools::free_pages(VirtAddr::from(arena as *mut u8), 1);
        }
    }
}

/// Return memory obtained from [`sys_alloc`].
pub fn sys_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let arena = arena_of(ptr);
    let large = unsafe { (*arena).large };
    if large {
        let pages = unsafe { (*arena).count };
        pools::free_pages(VirtAddr::from(arena as *mut u8), pages);
        return;
    }

    if (ptr as u32) >= KERNEL_BASE {
        let mut table = KERNEL_BLOCK_DESCS.lock();
        free_to_table(&mut table, ptr);
    } else {
        let _guard = IntrGuard::new();
        let table = current_user_heap();
        assert!(!table.is_null(), "user free without a current process");
        free_to_table(unsafe { &mut *table }, ptr);
    }
}

/// Free blocks listed for the kernel class serving `size` (self-tests).
pub fn kernel_free_block_count(size: usize) -> usize {
    KERNEL_BLOCK_DESCS.lock().free_block_count(size)
}

// ---------------------------------------------------------------------------
// GlobalAlloc adapter
// ---------------------------------------------------------------------------

/// Routes `alloc::*` containers to the kernel heap. Arena geometry
/// guarantees 16-byte alignment, which covers every kernel type.
pub struct KernelAllocator;

unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() > ARENA_HEADER_SIZE {
            klog_info!("kernel alloc: unsupported alignment {}", layout.align());
            return core::ptr::null_mut();
        }
        sys_alloc(PoolKind::Kernel, layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        sys_free(ptr)
    }
}
