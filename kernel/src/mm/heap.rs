// Kernel Heap Allocator
//
// This module provides a simple, contiguous kernel heap for dynamic memory
// allocation. It wraps page allocations from the kernel pool and exposes
// a `GlobalAlloc` interface for Rust code. It includes basic alignment,
// statistics tracking, and handles failures gracefully during
// initialization. Hosted builds use the platform allocator instead.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::log_info;
use crate::mm::pmm::PAGE_SIZE;

const HEAP_SIZE: usize = 4 * 1024 * 1024;

static HEAP_START: AtomicUsize = AtomicUsize::new(0);
static HEAP_POS: AtomicUsize = AtomicUsize::new(0);
static HEAP_END: AtomicUsize = AtomicUsize::new(0);

pub struct KernelAllocator;

#[cfg(all(not(test), target_os = "none"))]
#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

/// Carve the kernel heap out of the kernel pool. Must run before the
/// first heap allocation on bare metal.
pub fn init(pool: &crate::mm::pmm::PagePool) {
    let num_pages = HEAP_SIZE / PAGE_SIZE;
    let (heap_base, actual_pages) = match pool.alloc_pages(num_pages) {
        Some(base) => (base, num_pages),
        None => match pool.alloc_pages(num_pages / 4) {
            Some(base) => (base, num_pages / 4),
            None => {
                crate::log_panic!("heap", "FATAL: cannot allocate kernel heap");
                loop {
                    crate::arch::halt();
                }
            }
        },
    };

    let actual_size = actual_pages * PAGE_SIZE;
    HEAP_START.store(heap_base, Ordering::Relaxed);
    HEAP_POS.store(heap_base, Ordering::Relaxed);
    HEAP_END.store(heap_base + actual_size, Ordering::Relaxed);

    log_info!("heap", "Initialized with {} bytes at 0x{:X}", actual_size, heap_base);
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let heap_start = HEAP_START.load(Ordering::Relaxed);

        if heap_start == 0 {
            return null_mut();
        }

        let size = layout.size();
        let align = layout.align();

        let current = HEAP_POS.load(Ordering::Relaxed);
        let aligned = align_up(current, align);

        let new_pos = aligned + size;
        let heap_end = HEAP_END.load(Ordering::Relaxed);

        if new_pos > heap_end {
            return null_mut();
        }

        HEAP_POS.store(new_pos, Ordering::Relaxed);

        aligned as *mut u8
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
}

fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

#[allow(dead_code)]
pub fn get_stats() -> (usize, usize) {
    let start = HEAP_START.load(Ordering::Relaxed);
    let end = HEAP_END.load(Ordering::Relaxed);
    let pos = HEAP_POS.load(Ordering::Relaxed);

    if start == 0 {
        return (0, 0);
    }

    (end - start, pos - start)
}
