// Virtual Memory Coordinator
//
// Ties the page pools, the MMU adaptor, the frame table, and the swap
// device into the per-thread paging policy: pages are promised lazily,
// materialized on first fault, evicted under pressure with a
// second-chance clock, and copied wholesale on fork.
//
// Key responsibilities:
// - Allocate page descriptors lazily (`alloc_page_with_initializer`)
// - Claim pages: bind a frame, install the mapping, replay contents
// - Handle page faults, including the stack-growth heuristic
// - Drive eviction when the user pool runs dry
// - Copy a whole supplemental page table on fork; tear one down on exit
// - Implement mmap/munmap over the file-backed page variant
//
// Locking model:
// - One vm lock guards the frame table, the clock hand, the swap bitmap,
//   and page/frame binding transitions. It is never held across disk or
//   file I/O: eviction and claim pin the frame in question, drop the
//   lock for the transfer, and retake it for the metadata transition.
// - Each supplemental page table is locked by its owning thread only;
//   eviction reaches foreign descriptors through the frame table's
//   back-links, under the vm lock.
//
// Failure atomicity:
// - Failed allocation, claim, fault, fork copy, or mmap leaves the SPT,
//   the MMU, and the frame table as if the call had never been made

pub mod anon;
pub mod file;
pub mod frame;
pub mod page;
pub mod spt;
pub mod swap;
mod uninit;

#[cfg(test)]
mod tests;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard, Once};

use crate::dev::disk::BlockDevice;
use crate::mm::mmu::{AddressSpace, MmuError, Pml4};
use crate::mm::pmm::{self, PagePool, PAGE_SIZE};
use crate::mm::{MAX_STACK_BYTES, USER_STACK_TOP};
use crate::thread::Thread;
use crate::{log_debug, log_info, log_warn};

pub use self::file::FileAux;
pub use self::page::{Page, PageInit, PageKind, PageMarker};
pub use self::spt::SupplementalPageTable;

use self::frame::{FrameId, FrameOwner, FrameTable};
use self::page::PageBacking;
use self::swap::SwapTable;

const LOG_ORIGIN: &str = "vm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Frame pool and swap device are both exhausted.
    OutOfMemory,
    /// The SPT already holds a descriptor at this address.
    AddressInUse,
    /// Kernel address from user mode, write to a read-only page, or a
    /// fault with no descriptor: the process must die with exit(-1).
    BadAddress,
    /// Swap device read or write failed.
    DiskError,
    /// A file initializer read fewer bytes than the mapping promised.
    FileTooShort,
}

/// Everything the vm lock protects. Exposed within the crate so the page
/// variants can run their metadata transitions under the same lock.
pub(crate) struct VmInner {
    pub frames: FrameTable,
    pub swap: SwapTable,
}

/// Decoded page-fault report handed in by the exception entry path.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub va: usize,
    /// RSP captured in the fault frame; meaningful when `from_user`.
    pub rsp: usize,
    pub from_user: bool,
    pub write: bool,
    pub not_present: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub frames: usize,
    pub swap_used: usize,
    pub faults: u64,
    pub evictions: u64,
    pub stack_growths: u64,
}

pub struct Vm {
    user_pool: Arc<PagePool>,
    inner: Mutex<VmInner>,
    faults: AtomicU64,
    evictions: AtomicU64,
    stack_growths: AtomicU64,
}

impl Vm {
    pub fn new(user_pool: Arc<PagePool>, swap_disk: Arc<dyn BlockDevice>) -> Vm {
        Vm {
            user_pool,
            inner: Mutex::new(VmInner {
                frames: FrameTable::new(),
                swap: SwapTable::new(swap_disk),
            }),
            faults: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            stack_growths: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, VmInner> {
        self.inner.lock()
    }

    pub(crate) fn user_pool(&self) -> &PagePool {
        &self.user_pool
    }

    pub(crate) fn swap_disk(&self) -> Arc<dyn BlockDevice> {
        self.inner.lock().swap.disk()
    }

    pub fn stats(&self) -> VmStats {
        let inner = self.inner.lock();
        VmStats {
            frames: inner.frames.occupied(),
            swap_used: inner.swap.used(),
            faults: self.faults.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stack_growths: self.stack_growths.load(Ordering::Relaxed),
        }
    }

    // ---- allocation ------------------------------------------------------

    /// Record the promise of a page at `va` without materializing it.
    /// `kind` names the terminal variant; `init` and `aux` configure the
    /// first touch. Fails with `AddressInUse` on an occupied slot.
    pub fn alloc_page_with_initializer(
        &self,
        thread: &Thread,
        kind: PageKind,
        va: usize,
        writable: bool,
        init: Option<PageInit>,
        aux: Option<FileAux>,
    ) -> Result<(), VmError> {
        let mut spt = thread.spt().lock();
        self.alloc_locked(&mut spt, kind, va, writable, PageMarker::NONE, init, aux)
    }

    /// Plain lazy allocation with the default first touch.
    pub fn alloc_page(
        &self,
        thread: &Thread,
        kind: PageKind,
        va: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        self.alloc_page_with_initializer(thread, kind, va, writable, None, None)
    }

    pub(crate) fn alloc_locked(
        &self,
        spt: &mut SupplementalPageTable,
        kind: PageKind,
        va: usize,
        writable: bool,
        marker: PageMarker,
        init: Option<PageInit>,
        aux: Option<FileAux>,
    ) -> Result<(), VmError> {
        if crate::mm::is_kernel_vaddr(va) {
            return Err(VmError::BadAddress);
        }

        let va = pmm::align_down(va);
        spt.insert(Page::new_uninit(va, writable, marker, kind, init, aux))
    }

    /// Destroy and drop the descriptor at `va`. Returns whether one
    /// existed.
    pub(crate) fn dealloc_locked(
        &self,
        spt: &mut SupplementalPageTable,
        pml4: Pml4,
        va: usize,
    ) -> bool {
        match spt.take(va) {
            Some(mut page) => {
                page.destroy(self, pml4);
                true
            }
            None => false,
        }
    }

    /// Remove one page from the thread's SPT, releasing everything it
    /// holds. `BadAddress` when nothing is mapped there.
    pub fn dealloc_page(&self, thread: &Thread, va: usize) -> Result<(), VmError> {
        let mut spt = thread.spt().lock();
        if self.dealloc_locked(&mut spt, thread.pml4(), pmm::align_down(va)) {
            Ok(())
        } else {
            Err(VmError::BadAddress)
        }
    }

    // ---- claiming --------------------------------------------------------

    /// Make the page at `va` resident. No-op when it already is.
    pub fn claim_page(&self, thread: &Thread, va: usize) -> Result<(), VmError> {
        let mut spt = thread.spt().lock();
        let page = spt.find_mut(va).ok_or(VmError::BadAddress)?;
        self.claim_locked(thread.space(), page)
    }

    pub(crate) fn claim_locked(
        &self,
        space: &AddressSpace,
        page: &mut Page,
    ) -> Result<(), VmError> {
        if page.frame.is_some() {
            return Ok(());
        }

        let (fid, kva) = self.acquire_frame()?;

        {
            let mut inner = self.inner.lock();
            inner.frames.set_owner(
                fid,
                FrameOwner {
                    page: NonNull::from(&mut *page),
                    pml4: space.pml4(),
                },
            );
            page.frame = Some(fid);

            if let Err(err) = space.install(page.va, kva, page.writable) {
                page.frame = None;
                inner.frames.remove(fid);
                self.user_pool.free_page(kva);
                log_warn!(LOG_ORIGIN, "install failed at 0x{:X}: {:?}", page.va, err);
                return Err(match err {
                    MmuError::OutOfTables => VmError::OutOfMemory,
                    MmuError::AlreadyMapped => VmError::BadAddress,
                });
            }
        }

        // Contents are replayed with the frame pinned, so the clock can
        // never evict a page that is still filling.
        match page.swap_in(self, kva) {
            Ok(()) => {
                self.inner.lock().frames.unpin(fid);
                Ok(())
            }
            Err(err) => {
                let mut inner = self.inner.lock();
                space.clear(page.va);
                page.frame = None;
                inner.frames.remove(fid);
                self.user_pool.free_page(kva);
                Err(err)
            }
        }
    }

    // ---- frames and eviction --------------------------------------------

    /// Produce an empty, pinned frame: from the user pool when it still
    /// has pages, otherwise by evicting a clock victim. The returned
    /// frame is registered ownerless; the caller binds and unpins it.
    fn acquire_frame(&self) -> Result<(FrameId, usize), VmError> {
        let mut failures = 0usize;

        loop {
            let mut inner = self.inner.lock();

            if let Some(kva) = self.user_pool.alloc_page() {
                let fid = inner.frames.insert_pinned(kva);
                return Ok((fid, kva));
            }

            let candidates = inner.frames.occupied();
            if candidates == 0 || failures >= candidates {
                return Err(VmError::OutOfMemory);
            }

            let victim = match self.select_victim(&mut inner) {
                Some(victim) => victim,
                None => return Err(VmError::OutOfMemory),
            };

            inner.frames.pin(victim);
            let kva = inner.frames.kva(victim);
            let owner = match inner.frames.owner(victim) {
                Some(owner) => owner,
                None => {
                    inner.frames.unpin(victim);
                    return Err(VmError::OutOfMemory);
                }
            };
            drop(inner);

            // The owner back-link stays valid while the frame is pinned:
            // destroy paths wait for the pin to drain before freeing the
            // descriptor.
            let result = unsafe {
                let page = &mut *owner.page.as_ptr();
                page.swap_out(self, owner.pml4, kva)
            };

            let mut inner = self.inner.lock();
            match result {
                Ok(()) => {
                    inner.frames.remove(victim);
                    let fid = inner.frames.insert_pinned(kva);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    return Ok((fid, kva));
                }
                Err(err) => {
                    // This victim cannot leave memory right now (swap
                    // full, transfer error); put it back and scan on.
                    inner.frames.unpin(victim);
                    failures += 1;
                    log_debug!(
                        LOG_ORIGIN,
                        "eviction candidate refused ({:?}), rescanning",
                        err
                    );
                    if failures >= candidates {
                        return Err(match err {
                            VmError::DiskError => VmError::DiskError,
                            _ => VmError::OutOfMemory,
                        });
                    }
                }
            }
        }
    }

    /// Second-chance scan from the clock hand: pick the first frame whose
    /// owner has not been accessed since the last sweep, clearing
    /// accessed bits on the way. One full cleared wrap makes the next
    /// candidate the deterministic choice.
    fn select_victim(&self, inner: &mut VmInner) -> Option<FrameId> {
        let limit = 2 * inner.frames.slot_span() + 1;

        for _ in 0..limit {
            let fid = inner.frames.clock_next()?;
            let owner = inner.frames.owner(fid)?;
            let va = unsafe { owner.page.as_ref().va() };

            if !owner.pml4.is_accessed(va) {
                return Some(fid);
            }
            owner.pml4.set_accessed(va, false);
        }

        None
    }

    // ---- fault handling --------------------------------------------------

    /// Resolve a user page fault. `Err(BadAddress)` means the process
    /// must be terminated with exit code -1 by the caller.
    pub fn try_handle_fault(&self, thread: &Thread, fault: &PageFault) -> Result<(), VmError> {
        self.faults.fetch_add(1, Ordering::Relaxed);

        if fault.from_user && crate::mm::is_kernel_vaddr(fault.va) {
            return Err(VmError::BadAddress);
        }

        let rsp = if fault.from_user {
            fault.rsp
        } else {
            thread.user_rsp()
        };

        // Stack growth window: a push may touch at most 8 bytes below
        // RSP, and the stack never exceeds MAX_STACK_BYTES below its top.
        let probe = rsp.wrapping_sub(8);
        if USER_STACK_TOP - MAX_STACK_BYTES <= probe
            && probe <= fault.va
            && fault.va < USER_STACK_TOP
        {
            return self.grow_stack(thread, fault.va);
        }

        let va = pmm::align_down(fault.va);
        let mut spt = thread.spt().lock();
        let page = match spt.find_mut(va) {
            Some(page) => page,
            None => return Err(VmError::BadAddress),
        };

        if fault.write && !page.writable() {
            return Err(VmError::BadAddress);
        }

        if fault.not_present {
            return self.claim_locked(thread.space(), page);
        }

        // Present page, permission-compatible access, and still a fault:
        // nothing we can legally fix.
        Err(VmError::BadAddress)
    }

    /// Extend the stack with anonymous, writable, STACK-marked pages from
    /// the faulting address up to the stack top. Pages created here are
    /// claimed eagerly; partial failure rolls the new ones back.
    fn grow_stack(&self, thread: &Thread, addr: usize) -> Result<(), VmError> {
        let base = pmm::align_down(addr);
        let mut spt = thread.spt().lock();
        let mut created: Vec<usize> = Vec::new();

        let mut failure = None;
        let mut va = base;
        while va < USER_STACK_TOP {
            if spt.find(va).is_none() {
                let result = self
                    .alloc_locked(
                        &mut spt,
                        PageKind::Anon,
                        va,
                        true,
                        PageMarker::STACK,
                        None,
                        None,
                    )
                    .and_then(|_| match spt.find_mut(va) {
                        Some(page) => self.claim_locked(thread.space(), page),
                        None => Err(VmError::BadAddress),
                    });

                match result {
                    Ok(()) => created.push(va),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            va += PAGE_SIZE;
        }

        // The faulting page may have existed already without being
        // resident; the fault is only fixed once it is claimed.
        if failure.is_none() {
            if let Some(page) = spt.find_mut(base) {
                if let Err(err) = self.claim_locked(thread.space(), page) {
                    failure = Some(err);
                }
            }
        }

        if let Some(err) = failure {
            for undo in created {
                self.dealloc_locked(&mut spt, thread.pml4(), undo);
            }
            return Err(err);
        }

        self.stack_growths.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ---- fork and teardown ----------------------------------------------

    /// Duplicate `src`'s supplemental page table into `dst` for fork.
    /// Unmaterialized promises are copied as promises (with deep-copied
    /// aux); everything else is claimed in the child and copied
    /// byte-for-byte. On failure `dst` is restored to its prior state.
    pub fn spt_copy(&self, dst: &Thread, src: &Thread) -> Result<(), VmError> {
        let mut dst_spt = dst.spt().lock();
        let mut src_spt = src.spt().lock();

        let mut copied: Vec<usize> = Vec::new();
        let mut failure = None;

        for va in src_spt.sorted_vas() {
            match self.copy_one(&mut dst_spt, dst.space(), &mut src_spt, src.space(), va) {
                Ok(()) => copied.push(va),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for undo in copied {
                self.dealloc_locked(&mut dst_spt, dst.pml4(), undo);
            }
            return Err(err);
        }

        Ok(())
    }

    fn copy_one(
        &self,
        dst_spt: &mut SupplementalPageTable,
        dst_space: &AddressSpace,
        src_spt: &mut SupplementalPageTable,
        src_space: &AddressSpace,
        va: usize,
    ) -> Result<(), VmError> {
        let src_page = src_spt.find_mut(va).ok_or(VmError::BadAddress)?;
        let writable = src_page.writable();
        let marker = src_page.marker();

        if src_page.is_uninit() {
            let PageBacking::Uninit(promise) = &src_page.backing else {
                return Err(VmError::BadAddress);
            };
            let aux = match &promise.aux {
                Some(aux) => Some(aux.duplicate()),
                None => None,
            };
            return self.alloc_locked(
                dst_spt,
                promise.target,
                va,
                writable,
                marker,
                promise.init,
                aux,
            );
        }

        // Materialized source: fault it back in if it was evicted, then
        // snapshot its live bytes. The snapshot is taken with the source
        // frame pinned, so claiming the child's frame below can never
        // evict the very bytes being copied.
        self.claim_locked(src_space, src_page)?;
        let src_fid = src_page.frame.ok_or(VmError::BadAddress)?;

        let src_kva = {
            let mut inner = self.inner.lock();
            inner.frames.pin(src_fid);
            inner.frames.kva(src_fid)
        };

        let mut contents = alloc::vec![0u8; PAGE_SIZE];
        unsafe {
            core::ptr::copy_nonoverlapping(src_kva as *const u8, contents.as_mut_ptr(), PAGE_SIZE);
        }
        let src_dirty = src_space.pml4().is_dirty(va);
        self.inner.lock().frames.unpin(src_fid);

        let (kind, init, aux): (PageKind, Option<PageInit>, Option<FileAux>) =
            match &src_page.backing {
                PageBacking::File(fp) => (
                    PageKind::File,
                    Some(file::lazy_load),
                    Some(FileAux {
                        file: fp.file.reopen(),
                        offset: fp.offset,
                        read_bytes: fp.read_bytes,
                        zero_bytes: fp.zero_bytes,
                        total_pages: fp.total_pages,
                    }),
                ),
                _ => (PageKind::Anon, None, None),
            };

        self.alloc_locked(dst_spt, kind, va, writable, marker, init, aux)?;

        let dst_page = match dst_spt.find_mut(va) {
            Some(page) => page,
            None => return Err(VmError::BadAddress),
        };
        if let Err(err) = self.claim_locked(dst_space, dst_page) {
            self.dealloc_locked(dst_spt, dst_space.pml4(), va);
            return Err(err);
        }

        let dst_fid = dst_page.frame.ok_or(VmError::BadAddress)?;
        let dst_kva = {
            let mut inner = self.inner.lock();
            inner.frames.pin(dst_fid);
            inner.frames.kva(dst_fid)
        };

        unsafe {
            core::ptr::copy_nonoverlapping(contents.as_ptr(), dst_kva as *mut u8, PAGE_SIZE);
        }

        // The child starts with the parent's unsynced modifications.
        if src_dirty {
            dst_space.pml4().set_dirty(va, true);
        }
        self.inner.lock().frames.unpin(dst_fid);

        Ok(())
    }

    /// Tear down every page the thread ever requested: write dirty file
    /// pages back, release frames and swap slots, drop descriptors. The
    /// table itself is kept for reuse across exec.
    pub fn spt_kill(&self, thread: &Thread) {
        let mut spt = thread.spt().lock();
        let pml4 = thread.pml4();

        for va in spt.sorted_vas() {
            if let Some(mut page) = spt.take(va) {
                page.destroy(self, pml4);
            }
        }

        spt.clear();
    }

    // ---- mmap ------------------------------------------------------------

    /// Map `length` bytes of `file` at `addr` (rounded down). Returns the
    /// aligned base of the mapping.
    pub fn mmap(
        &self,
        thread: &Thread,
        addr: usize,
        length: usize,
        writable: bool,
        file: &crate::fs::file::File,
        offset: usize,
    ) -> Result<usize, VmError> {
        self::file::mmap(self, thread, addr, length, writable, file, offset)
    }

    /// Unmap the mapping whose base page is at `addr`, writing dirty
    /// pages back to the file.
    pub fn munmap(&self, thread: &Thread, addr: usize) -> Result<(), VmError> {
        self::file::munmap(self, thread, addr)
    }
}

// ---- global instance ------------------------------------------------------

static VM: Once<Vm> = Once::new();

/// Wire the virtual memory core to the boot-selected user pool and swap
/// device. Called once during kernel initialization, after `mm::init`.
pub fn init(user_pool: Arc<PagePool>, swap_disk: Arc<dyn BlockDevice>) {
    let vm = VM.call_once(|| Vm::new(user_pool, swap_disk));

    let inner = vm.inner.lock();
    log_info!(
        LOG_ORIGIN,
        "virtual memory online: {} swap slots, user pool {} pages",
        inner.swap.slot_count(),
        vm.user_pool.page_count()
    );
}

pub fn instance() -> Option<&'static Vm> {
    VM.get()
}
