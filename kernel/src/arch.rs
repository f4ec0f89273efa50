// Architecture Abstraction Layer
//
// Provides low-level, architecture-specific primitives used by the kernel.
// This module exposes a minimal and explicit interface to CPU instructions
// that cannot be expressed safely or portably in pure Rust.
//
// Key responsibilities:
// - Offer a unified API for halting the CPU across architectures
// - Invalidate stale TLB entries after page-table mutations
//
// Design principles:
// - Architecture-specific code is isolated behind `cfg` gates
// - All functions are small, `#[inline]`, and zero-overhead
// - Hosted builds (the test harness) degrade to safe no-ops: the soft
//   page-table walk is the source of truth there and no TLB exists

#![allow(dead_code)]

#[inline(always)]
pub fn halt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Flush the TLB entry covering `va` on the current CPU. Must be called
/// after any change to a present mapping while its address space is active.
#[inline(always)]
pub fn flush_tlb_page(va: usize) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va as u64));

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}
