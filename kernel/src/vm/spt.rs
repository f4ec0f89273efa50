// Supplemental Page Table
//
// Per-thread, hash-indexed record of every page the thread has ever
// requested, keyed by page-aligned virtual address. This is the
// authoritative answer to "what should be resident at this address":
// the hardware table only caches the subset that currently is.
//
// Key responsibilities:
// - Uniquely map each aligned va to one boxed page descriptor
// - Surface lookup, insertion (duplicate-rejecting), and removal
// - Provide a deterministic (ascending-va) ordering for fork copies and
//   teardown, independent of hash iteration order
//
// Ownership model:
// - The table owns its descriptors as `Box<Page>`; boxing gives each
//   descriptor a stable address, which the frame table's back-links rely
//   on. Descriptors are only deallocated through `take`, after `destroy`
//   has released their frame, slot, and file resources.
// - Buckets are cleared, not deallocated, on teardown: the same table is
//   reused when the thread execs a fresh image.

use alloc::boxed::Box;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::mm::pmm;
use crate::vm::page::Page;
use crate::vm::VmError;

pub struct SupplementalPageTable {
    pages: HashMap<usize, Box<Page>>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        SupplementalPageTable {
            pages: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Look up the descriptor covering `va` (rounded down internally).
    pub fn find(&self, va: usize) -> Option<&Page> {
        self.pages.get(&pmm::align_down(va)).map(|p| p.as_ref())
    }

    pub fn find_mut(&mut self, va: usize) -> Option<&mut Page> {
        self.pages.get_mut(&pmm::align_down(va)).map(|p| p.as_mut())
    }

    /// Insert a fresh descriptor. Fails when the slot is taken.
    pub fn insert(&mut self, page: Page) -> Result<(), VmError> {
        debug_assert!(pmm::is_page_aligned(page.va));

        match self.pages.entry(page.va) {
            hashbrown::hash_map::Entry::Occupied(_) => Err(VmError::AddressInUse),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(Box::new(page));
                Ok(())
            }
        }
    }

    /// Detach the descriptor at `va` from the table. The caller has
    /// already run `destroy` (or is about to, for rollback paths).
    pub fn take(&mut self, va: usize) -> Option<Box<Page>> {
        self.pages.remove(&pmm::align_down(va))
    }

    /// Snapshot of all descriptor addresses in ascending order.
    pub fn sorted_vas(&self) -> Vec<usize> {
        let mut vas: Vec<usize> = self.pages.keys().copied().collect();
        vas.sort_unstable();
        vas
    }

    /// Drop the bucket contents but keep the allocation for reuse.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::page::{PageKind, PageMarker};

    fn page(va: usize) -> Page {
        Page::new_uninit(va, true, PageMarker::NONE, PageKind::Anon, None, None)
    }

    #[test]
    fn test_insert_and_find_rounds_down() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x5000)).unwrap();

        assert!(spt.find(0x5000).is_some());
        assert!(spt.find(0x5FFF).is_some());
        assert!(spt.find(0x6000).is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x5000)).unwrap();

        assert!(matches!(
            spt.insert(page(0x5000)),
            Err(VmError::AddressInUse)
        ));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn test_sorted_vas_is_ascending() {
        let mut spt = SupplementalPageTable::new();
        for va in [0x9000usize, 0x2000, 0x5000, 0x1000] {
            spt.insert(page(va)).unwrap();
        }

        assert_eq!(spt.sorted_vas(), alloc::vec![0x1000, 0x2000, 0x5000, 0x9000]);
    }

    #[test]
    fn test_take_removes() {
        let mut spt = SupplementalPageTable::new();
        spt.insert(page(0x5000)).unwrap();

        assert!(spt.take(0x5000).is_some());
        assert!(spt.take(0x5000).is_none());
        assert!(spt.is_empty());
    }
}
