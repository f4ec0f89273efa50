// Memory Management Subsystem
//
// Serves as the top-level entry point for kernel memory management
// components. This module coordinates initialization of the physical page
// pools, the kernel heap, and exposes the address-space layout constants
// shared by the MMU adaptor and the virtual memory core.
//
// Key responsibilities:
// - Initialize memory management layers in the correct dependency order
// - Own the global kernel and user page pools
// - Define the user/kernel address-space split and the user stack ceiling
//
// Initialization flow:
// - `init` builds the kernel pool (page tables, heap) and the user pool
//   (user frames, the eviction target) from boot-provided arenas
// - `heap::init` carves the kernel heap out of the kernel pool
// - `vm::init` is called afterwards by the boot path to wire the virtual
//   memory core to the user pool and the swap device
//
// Design principles:
// - Strict layering: each subsystem builds on the previous one
// - Explicit ordering to avoid subtle early-boot memory hazards
// - Minimal logic in this module; responsibilities are delegated downward

pub mod heap;
pub mod mmu;
pub mod pmm;

use alloc::sync::Arc;
use spin::Once;

use crate::log_info;
use crate::mm::pmm::PagePool;

const LOG_ORIGIN: &str = "mm";

/// Base of the kernel half of the address space. Everything below is
/// user territory.
pub const KERNEL_BASE: usize = 0xFFFF_8000_0000_0000;

/// Top of the user stack. The stack grows downward from here; faults more
/// than `MAX_STACK_BYTES` below it are not stack growth.
pub const USER_STACK_TOP: usize = 0x0000_7FFF_FFFF_F000;

/// How far below `USER_STACK_TOP` the stack may grow.
pub const MAX_STACK_BYTES: usize = 1 << 20;

pub fn is_kernel_vaddr(va: usize) -> bool {
    va >= KERNEL_BASE
}

pub fn is_user_vaddr(va: usize) -> bool {
    !is_kernel_vaddr(va)
}

/// Boot-provided arenas backing the two global pools.
pub struct MemoryLayout {
    pub kernel_base: usize,
    pub kernel_pages: usize,
    pub user_base: usize,
    pub user_pages: usize,
}

static KERNEL_POOL: Once<Arc<PagePool>> = Once::new();
static USER_POOL: Once<Arc<PagePool>> = Once::new();

/// Bring up the page pools and the kernel heap.
///
/// # Safety
///
/// The arenas described by `layout` must be valid, disjoint, writable
/// memory reserved for the kernel's exclusive use.
pub unsafe fn init(layout: MemoryLayout) {
    let kernel = Arc::new(PagePool::new(
        "kernel",
        layout.kernel_base,
        layout.kernel_pages,
    ));
    let user = Arc::new(PagePool::new("user", layout.user_base, layout.user_pages));

    heap::init(&kernel);

    let (ktotal, _) = kernel.stats();
    let (utotal, _) = user.stats();

    KERNEL_POOL.call_once(|| kernel);
    USER_POOL.call_once(|| user);

    log_info!(
        LOG_ORIGIN,
        "pools ready: kernel={} pages, user={} pages",
        ktotal,
        utotal
    );
}

pub fn kernel_pool() -> Option<&'static Arc<PagePool>> {
    KERNEL_POOL.get()
}

pub fn user_pool() -> Option<&'static Arc<PagePool>> {
    USER_POOL.get()
}

/// Allocate one frame from the user pool. Returns its kva.
#[allow(dead_code)]
pub fn alloc_user_page() -> Option<usize> {
    user_pool()?.alloc_page()
}

#[allow(dead_code)]
pub fn free_user_page(kva: usize) {
    if let Some(pool) = user_pool() {
        pool.free_page(kva);
    }
}
