//! In-kernel self-tests for the memory subsystem. Registered with the
//! harness and run when the kernel is built with `builtin-tests`.

use basalt_abi::PAGE_SIZE;
use basalt_abi::addr::VirtAddr;
use basalt_lib::testing::TestResult;
use basalt_lib::{assert_eq_test, assert_not_null, assert_test, define_test_suite, pass};

use crate::heap::{self, sys_alloc, sys_free};
use crate::mm_constants::PoolKind;
use crate::paging;
use crate::pools;

fn test_page_alloc_maps_and_frees() -> TestResult {
    // Warm-up: fault in the page table covering the pool's first pages so
    // the counters below are not skewed by a one-off table allocation.
    let warmup = pools::alloc_pages(PoolKind::Kernel, 2);
    assert_test!(!warmup.is_null());
    pools::free_pages(warmup, 2);

    let (kernel_before, _, vaddr_before) = pools::free_page_counts();

    let base = pools::alloc_pages(PoolKind::Kernel, 2);
    assert_test!(!base.is_null(), "two-page allocation failed");
    assert_test!(base.is_page_aligned());

    for i in 0..2u32 {
        let va = base.offset(i * PAGE_SIZE);
        assert_test!(paging::is_mapped(va), "allocated page not mapped");
        assert_test!(!paging::virt_to_phys(va).is_null());
    }

    // The region is zeroed on allocation.
    let bytes = unsafe { core::slice::from_raw_parts(base.as_ptr::<u8>(), 2 * PAGE_SIZE as usize) };
    assert_test!(bytes.iter().all(|&b| b == 0), "allocation not zeroed");

    let (kernel_mid, _, vaddr_mid) = pools::free_page_counts();
    assert_test!(kernel_mid + 2 <= kernel_before);
    assert_eq_test!(vaddr_mid, vaddr_before - 2);

    pools::free_pages(base, 2);
    let (kernel_after, _, vaddr_after) = pools::free_page_counts();
    assert_eq_test!(vaddr_after, vaddr_before);
    assert_eq_test!(kernel_after, kernel_before);

    // Unmapping already-freed pages is a no-op.
    paging::unmap(base);
    pass!()
}

fn test_unmapped_translation_is_null() -> TestResult {
    let base = pools::alloc_pages(PoolKind::Kernel, 1);
    assert_test!(!base.is_null());
    pools::free_pages(base, 1);
    assert_test!(paging::virt_to_phys(base).is_null());
    pass!()
}

fn test_self_reference_window() -> TestResult {
    let window = paging::PAGE_DIR_WINDOW;
    let self_entry = unsafe { *paging::pde_for(VirtAddr::new(0xFFFF_F000)) };
    assert_test!(self_entry.is_present(), "self-reference PDE absent");
    assert_eq_test!(self_entry.frame(), paging::current_page_dir_phys());
    assert_eq_test!(window.as_u32(), 0xFFFF_F000);
    pass!()
}

fn test_heap_reuses_freed_block() -> TestResult {
    // Two live 128-class blocks guarantee the arena of the first cannot
    // be retired when it is freed, whatever earlier suites allocated.
    let a = sys_alloc(PoolKind::Kernel, 100);
    let b = sys_alloc(PoolKind::Kernel, 100);
    let big = sys_alloc(PoolKind::Kernel, 300);
    assert_not_null!(a);
    assert_not_null!(b);
    assert_not_null!(big);
    let after_allocs = heap::kernel_free_block_count(100);

    sys_free(a);
    assert_eq_test!(heap::kernel_free_block_count(100), after_allocs + 1);

    let c = sys_alloc(PoolKind::Kernel, 100);
    assert_eq_test!(c, a, "freed 128-byte block not reused");
    assert_eq_test!(heap::kernel_free_block_count(100), after_allocs);

    sys_free(big);
    sys_free(b);
    sys_free(c);
    pass!()
}

fn test_heap_large_allocation() -> TestResult {
    let p = sys_alloc(PoolKind::Kernel, 2000);
    assert_not_null!(p);
    // Large allocations start one header past a page boundary.
    assert_eq_test!((p as u32) & (PAGE_SIZE - 1), 16);

    unsafe { core::ptr::write_bytes(p, 0xA5, 2000) };
    sys_free(p);

    let q = sys_alloc(PoolKind::Kernel, 2000);
    assert_eq_test!(q, p, "large arena pages not reused");
    sys_free(q);
    pass!()
}

fn test_heap_size_class_separation() -> TestResult {
    let small = sys_alloc(PoolKind::Kernel, 16);
    let medium = sys_alloc(PoolKind::Kernel, 500);
    assert_not_null!(small);
    assert_not_null!(medium);
    // Different classes come from different arenas.
    assert_test!(
        VirtAddr::from(small).page_base() != VirtAddr::from(medium).page_base(),
        "size classes share an arena"
    );
    sys_free(small);
    sys_free(medium);
    pass!()
}

define_test_suite!(mm, [
    test_page_alloc_maps_and_frees,
    test_unmapped_translation_is_null,
    test_self_reference_window,
    test_heap_reuses_freed_block,
    test_heap_large_allocation,
    test_heap_size_class_separation,
]);
