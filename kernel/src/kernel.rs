// Kernel library root and subsystem wiring
//
// This crate is the memory-management half of the Cinder kernel: the
// physical page pools, the MMU adaptor, and the virtual memory core with
// lazy paging, swap, and memory-mapped files. The surrounding kernel
// (boot, scheduler, interrupt entry, syscall dispatch, filesystem and
// disk drivers) links against this library and drives it through the
// public module interfaces.
//
// Initialization order expected from the boot path:
// - `serial::init` and `log::init` for early diagnostics
// - `mm::init` with the boot-selected kernel and user arenas
// - `dev::disk::register` for the swap device (channel 1, device 1)
// - `vm::init` with the user pool and the swap device handle
//
// Design and implementation:
// - Freestanding (`no_std` + `alloc`) on bare metal; the same sources
//   build hosted for the test harness, where the soft page-table walk
//   stands in for the hardware MMU
// - Initialization follows a strict, explicit ordering
// - Hardware access is confined to `arch` and `serial` behind
//   `target_os = "none"` gates
//
// Safety and correctness notes:
// - Boot-provided memory arenas are treated as exclusively owned
// - The panic handler halts the CPU to avoid undefined behavior

#![cfg_attr(all(not(test), target_os = "none"), no_std)]

extern crate alloc;

pub mod arch;
pub mod dev;
pub mod fs;
pub mod log;
pub mod mm;
pub mod serial;
pub mod thread;
pub mod vm;

pub use mm::{MAX_STACK_BYTES, USER_STACK_TOP};
pub use vm::{PageFault, PageKind, Vm, VmError, VmStats};

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::log_panic!("kernel", "{}", info);

    loop {
        arch::halt();
    }
}
