// File-Backed Pages and mmap
//
// Pages whose contents come from (and, when dirtied, return to) a region
// of a file. Each mapped page owns an independent reopened handle, its
// file offset, and its read/zero split, so pages of one mapping never
// alias each other's handles and teardown order cannot double-close.
//
// Write-back policy:
// - Eviction and destruction write the page back only when the dirty bit
//   is set, and only `read_bytes` worth (the zero tail never belonged to
//   the file)
// - Write-back always precedes the unmap of a dying page, so a mapping
//   never disappears with modified bytes still only in memory
// - Teardown write-back is best-effort: a short write is logged and
//   dropped, because there is nobody left to retry for
//
// mmap layout:
// - `read_bytes` across the whole mapping is bounded by what the file can
//   provide from `offset`; the remainder of the region is zero pages
// - Every descriptor records `total_pages`, so `munmap` of the base
//   address can walk the whole region from any surviving descriptor

use crate::fs::file::File;
use crate::log_warn;
use crate::mm::mmu::Pml4;
use crate::mm::pmm::{self, PAGE_SIZE};
use crate::vm::page::{Page, PageBacking, PageKind, PageMarker};
use crate::vm::{Vm, VmError};
use crate::thread::Thread;

use alloc::vec::Vec;

const LOG_ORIGIN: &str = "vm:file";

/// Lazy-load parameters for one page of a mapping. Owned by the `Uninit`
/// promise until first touch, then absorbed into the `FilePage`.
pub struct FileAux {
    pub(crate) file: File,
    pub(crate) offset: usize,
    pub(crate) read_bytes: usize,
    pub(crate) zero_bytes: usize,
    pub(crate) total_pages: usize,
}

impl FileAux {
    /// Deep copy for fork: the child gets its own handle on the inode, so
    /// destroying either side never touches the sibling's backing state.
    pub(crate) fn duplicate(&self) -> FileAux {
        FileAux {
            file: self.file.reopen(),
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
            total_pages: self.total_pages,
        }
    }
}

pub(crate) struct FilePage {
    pub(crate) file: File,
    pub(crate) offset: usize,
    pub(crate) read_bytes: usize,
    pub(crate) zero_bytes: usize,
    pub(crate) total_pages: usize,
}

impl FilePage {
    pub(crate) fn from_aux(aux: FileAux) -> FilePage {
        FilePage {
            file: aux.file,
            offset: aux.offset,
            read_bytes: aux.read_bytes,
            zero_bytes: aux.zero_bytes,
            total_pages: aux.total_pages,
        }
    }
}

/// Standard first-touch routine for file pages: read the configured range
/// into the frame and zero the tail.
pub(crate) fn lazy_load(kva: usize, aux: Option<&FileAux>) -> Result<(), VmError> {
    let aux = aux.ok_or(VmError::BadAddress)?;
    load_range(&aux.file, aux.offset, aux.read_bytes, kva)
}

fn load_range(file: &File, offset: usize, read_bytes: usize, kva: usize) -> Result<(), VmError> {
    let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };

    if file.read_at(offset, &mut buf[..read_bytes]) != read_bytes {
        return Err(VmError::FileTooShort);
    }

    buf[read_bytes..].fill(0);
    Ok(())
}

pub(crate) fn swap_in(page: &mut Page, kva: usize) -> Result<(), VmError> {
    let PageBacking::File(fp) = &page.backing else {
        return Err(VmError::BadAddress);
    };

    load_range(&fp.file, fp.offset, fp.read_bytes, kva)
}

/// Evict the page. Dirty contents are written back before the mapping is
/// dropped; the handle stays open for the next fault.
pub(crate) fn swap_out(page: &mut Page, vm: &Vm, pml4: Pml4, kva: usize) -> Result<(), VmError> {
    let va = page.va;
    {
        let PageBacking::File(fp) = &page.backing else {
            return Err(VmError::BadAddress);
        };

        if pml4.is_dirty(va) {
            let buf = unsafe { core::slice::from_raw_parts(kva as *const u8, fp.read_bytes) };
            if fp.file.write_at(fp.offset, buf) != fp.read_bytes {
                return Err(VmError::DiskError);
            }
            pml4.set_dirty(va, false);
        }
    }

    let mut inner = vm.lock_inner();
    pml4.clear(va);
    page.frame = None;
    drop(inner);

    Ok(())
}

/// Tear the page down: write back if dirty, drop the mapping, release the
/// frame. The file handle closes when the descriptor is freed.
pub(crate) fn destroy(page: &mut Page, vm: &Vm, pml4: Pml4) {
    let frame = loop {
        let mut inner = vm.lock_inner();
        match page.frame {
            Some(frame) if inner.frames.is_pinned(frame) => {
                // Let the in-flight eviction settle first.
                drop(inner);
                core::hint::spin_loop();
            }
            Some(frame) => {
                inner.frames.pin(frame);
                break frame;
            }
            None => return,
        }
    };

    let kva = {
        let inner = vm.lock_inner();
        inner.frames.kva(frame)
    };

    // Ordering: write-back strictly precedes the unmap.
    if pml4.is_dirty(page.va) {
        if let PageBacking::File(fp) = &page.backing {
            let buf = unsafe { core::slice::from_raw_parts(kva as *const u8, fp.read_bytes) };
            if fp.file.write_at(fp.offset, buf) != fp.read_bytes {
                log_warn!(
                    LOG_ORIGIN,
                    "write-back of dying mapping va=0x{:X} fell short",
                    page.va
                );
            }
            pml4.set_dirty(page.va, false);
        }
    }

    let mut inner = vm.lock_inner();
    pml4.clear(page.va);
    inner.frames.remove(frame);
    page.frame = None;
    vm.user_pool().free_page(kva);
}

/// Map `length` bytes of `file` starting at `offset` into consecutive
/// pages at `addr` (rounded down). Returns the aligned base address.
pub(crate) fn mmap(
    vm: &Vm,
    thread: &Thread,
    addr: usize,
    length: usize,
    writable: bool,
    file: &File,
    offset: usize,
) -> Result<usize, VmError> {
    if length == 0 {
        return Err(VmError::BadAddress);
    }

    let base = pmm::align_down(addr);
    let total_pages = (length + PAGE_SIZE - 1) / PAGE_SIZE;

    let end = match base.checked_add(total_pages * PAGE_SIZE) {
        Some(end) => end,
        None => return Err(VmError::BadAddress),
    };
    if crate::mm::is_kernel_vaddr(base) || crate::mm::is_kernel_vaddr(end - 1) {
        return Err(VmError::BadAddress);
    }

    // How much the file can actually provide from this offset; the rest
    // of the region is zero-filled pages.
    let mut remaining = file.length().saturating_sub(offset).min(length);
    let mut file_offset = offset;

    let mut spt = thread.spt().lock();
    let mut created: Vec<usize> = Vec::new();

    for index in 0..total_pages {
        let va = base + index * PAGE_SIZE;

        let page_read_bytes = remaining.min(PAGE_SIZE);
        let page_zero_bytes = PAGE_SIZE - page_read_bytes;

        let aux = FileAux {
            file: file.reopen(),
            offset: file_offset,
            read_bytes: page_read_bytes,
            zero_bytes: page_zero_bytes,
            total_pages,
        };

        if let Err(err) = vm.alloc_locked(
            &mut spt,
            PageKind::File,
            va,
            writable,
            PageMarker::NONE,
            Some(lazy_load),
            Some(aux),
        ) {
            for undo in created {
                vm.dealloc_locked(&mut spt, thread.pml4(), undo);
            }
            return Err(err);
        }

        created.push(va);
        remaining -= page_read_bytes;
        file_offset += page_read_bytes;
    }

    Ok(base)
}

/// Unmap the whole region whose base page sits at `addr`: write back
/// dirty pages, close per-page handles, and drop every descriptor.
pub(crate) fn munmap(vm: &Vm, thread: &Thread, addr: usize) -> Result<(), VmError> {
    let base = pmm::align_down(addr);
    let mut spt = thread.spt().lock();

    let total_pages = match spt.find(base) {
        Some(page) => match &page.backing {
            PageBacking::File(fp) => fp.total_pages,
            PageBacking::Uninit(promise) => match &promise.aux {
                Some(aux) if promise.target == PageKind::File => aux.total_pages,
                _ => return Err(VmError::BadAddress),
            },
            PageBacking::Anon(_) => return Err(VmError::BadAddress),
        },
        None => return Err(VmError::BadAddress),
    };

    for index in 0..total_pages {
        let va = base + index * PAGE_SIZE;
        if !vm.dealloc_locked(&mut spt, thread.pml4(), va) {
            log_warn!(LOG_ORIGIN, "munmap: no descriptor at 0x{:X}", va);
        }
    }

    Ok(())
}
