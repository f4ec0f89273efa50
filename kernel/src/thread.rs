// Thread Context
//
// Minimal thread abstraction carrying exactly the state the virtual
// memory subsystem needs: the address space, the supplemental page table,
// and the user stack pointer saved on syscall entry. Scheduling, CPU
// context switching, and lifecycle management belong to the surrounding
// kernel and are intentionally absent here.
//
// Key responsibilities:
// - Tie one address space and one supplemental page table to a thread
// - Record the user-mode RSP on kernel entry so page faults taken in
//   kernel mode can still run the stack-growth heuristic
//
// Ownership model:
// - The supplemental page table is owned by its thread; the spinlock
//   encodes that only the owning thread (and its kernel activations)
//   walks the table structure
// - Page/frame binding fields inside individual descriptors are
//   additionally serialized by the vm lock, because eviction reaches into
//   foreign tables

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::mm::mmu::{AddressSpace, Pml4};
use crate::mm::pmm::PagePool;
use crate::vm::spt::SupplementalPageTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[allow(dead_code)]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "T:{}", self.0)
    }
}

pub struct Thread {
    id: ThreadId,
    space: AddressSpace,
    spt: Mutex<SupplementalPageTable>,
    user_rsp: AtomicUsize,
}

impl Thread {
    /// Create a thread with a fresh address space whose page tables come
    /// from `tables`. Returns `None` when the pool cannot back the root.
    pub fn new(tables: Arc<PagePool>) -> Option<Thread> {
        let space = AddressSpace::new(tables)?;

        Some(Thread {
            id: ThreadId::new(),
            space,
            spt: Mutex::new(SupplementalPageTable::new()),
            user_rsp: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn pml4(&self) -> Pml4 {
        self.space.pml4()
    }

    pub fn spt(&self) -> &Mutex<SupplementalPageTable> {
        &self.spt
    }

    /// Saved by the syscall entry path before any kernel code runs.
    pub fn set_user_rsp(&self, rsp: usize) {
        self.user_rsp.store(rsp, Ordering::Relaxed);
    }

    pub fn user_rsp(&self) -> usize {
        self.user_rsp.load(Ordering::Relaxed)
    }
}
