// Anonymous Pages
//
// Pages with no backing object: heap, bss, and stack memory. While
// resident their contents live only in the frame; under memory pressure
// they are written to a swap slot and the slot index becomes the page's
// sole backing record.
//
// State machine per descriptor (exactly one holds at any time):
// - resident: `page.frame` set, no slot
// - swapped: no frame, `slot` set and marked used in the swap table
// - fresh: neither, right after promotion from `Uninit`
//
// Locking: slot allocation and every binding transition happen under the
// vm lock; the disk transfer itself runs with the lock released.

use crate::log_debug;
use crate::mm::mmu::Pml4;
use crate::vm::page::{Page, PageBacking};
use crate::vm::swap::{self, SlotId};
use crate::vm::{Vm, VmError};

const LOG_ORIGIN: &str = "vm:anon";

pub(crate) struct AnonPage {
    slot: Option<SlotId>,
}

impl AnonPage {
    pub(crate) fn new() -> Self {
        AnonPage { slot: None }
    }

    #[allow(dead_code)]
    pub(crate) fn slot(&self) -> Option<SlotId> {
        self.slot
    }
}

/// Repopulate the frame at `kva`. A page that has never been evicted has
/// no slot and is simply zero-filled; otherwise the slot contents are
/// read back and the slot is released.
pub(crate) fn swap_in(page: &mut Page, vm: &Vm, kva: usize) -> Result<(), VmError> {
    let PageBacking::Anon(anon) = &page.backing else {
        return Err(VmError::BadAddress);
    };

    let slot = match anon.slot {
        None => {
            crate::vm::uninit::zero_fill(kva);
            return Ok(());
        }
        Some(slot) => slot,
    };

    let disk = vm.swap_disk();
    swap::read_slot(&disk, slot, kva)?;

    let mut inner = vm.lock_inner();
    inner.swap.release(slot);
    if let PageBacking::Anon(anon) = &mut page.backing {
        anon.slot = None;
    }

    Ok(())
}

/// Evict the page: reserve a slot, write the frame out, then atomically
/// drop the mapping and the frame binding. Fails without side effects
/// when the swap device is full or the write fails.
pub(crate) fn swap_out(page: &mut Page, vm: &Vm, pml4: Pml4, kva: usize) -> Result<(), VmError> {
    if !matches!(page.backing, PageBacking::Anon(_)) {
        return Err(VmError::BadAddress);
    }

    let slot = {
        let mut inner = vm.lock_inner();
        match inner.swap.allocate() {
            Some(slot) => slot,
            None => return Err(VmError::OutOfMemory),
        }
    };

    let disk = vm.swap_disk();
    if let Err(err) = swap::write_slot(&disk, slot, kva) {
        vm.lock_inner().swap.release(slot);
        return Err(err);
    }

    let mut inner = vm.lock_inner();
    pml4.clear(page.va);
    page.frame = None;
    if let PageBacking::Anon(anon) = &mut page.backing {
        anon.slot = Some(slot);
    }
    drop(inner);

    log_debug!(LOG_ORIGIN, "evicted va=0x{:X} to slot {}", page.va, slot);
    Ok(())
}

/// Release whatever the page still holds: the frame and mapping if
/// resident, or the swap slot if evicted.
pub(crate) fn destroy(page: &mut Page, vm: &Vm, pml4: Pml4) {
    loop {
        let mut inner = vm.lock_inner();

        match page.frame {
            Some(frame) if inner.frames.is_pinned(frame) => {
                // An eviction is in flight on this frame; wait for it to
                // settle before tearing the page down.
                drop(inner);
                core::hint::spin_loop();
            }
            Some(frame) => {
                pml4.clear(page.va);
                let kva = inner.frames.remove(frame);
                page.frame = None;
                vm.user_pool().free_page(kva);
                return;
            }
            None => {
                if let PageBacking::Anon(anon) = &mut page.backing {
                    if let Some(slot) = anon.slot.take() {
                        inner.swap.release(slot);
                    }
                }
                return;
            }
        }
    }
}
