// Page Descriptors
//
// One descriptor per virtual page a thread has ever requested. The
// descriptor carries the address, the write permission, optional markers,
// the back-link to a frame while resident, and a tagged backing variant:
// a promised-but-unmaterialized `Uninit`, a swap-backed `Anon`, or a
// file-backed `File`.
//
// Variant model:
// - `Uninit` records the terminal kind, the first-touch initializer, and
//   its owned aux payload. First touch materializes the page and promotes
//   the descriptor by total replacement of the variant, never by
//   overwriting overlapping fields.
// - The lifecycle operations (`swap_in`, `swap_out`, `destroy`) dispatch
//   on the variant tag; the variant bodies live in `uninit`, `anon`, and
//   `file` next to the state they manage.
//
// Concurrency notes:
// - The `frame` back-link and the residency transitions are mutated only
//   under the vm lock (eviction reaches descriptors of foreign threads)
// - Everything else is owned by the thread holding the SPT lock

use crate::mm::mmu::Pml4;
use crate::vm::file::FileAux;
use crate::vm::frame::FrameId;
use crate::vm::{anon, file, uninit, Vm, VmError};

/// Terminal page kinds. Callers always request the final kind; the
/// transitional `Uninit` state is internal to the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Anon,
    File,
}

/// Auxiliary per-page flags, orthogonal to the backing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMarker(u32);

impl PageMarker {
    pub const NONE: Self = Self(0);
    pub const STACK: Self = Self(1 << 0);

    pub const fn contains(self, other: PageMarker) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl core::ops::BitOr for PageMarker {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// First-touch routine run by `Uninit::initialize` with the frame bound
/// and mapped. For file pages this is `file::lazy_load`.
pub type PageInit = fn(usize, Option<&FileAux>) -> Result<(), VmError>;

pub(crate) struct UninitPage {
    pub target: PageKind,
    pub init: Option<PageInit>,
    pub aux: Option<FileAux>,
}

pub(crate) enum PageBacking {
    Uninit(UninitPage),
    Anon(anon::AnonPage),
    File(file::FilePage),
}

pub struct Page {
    pub(crate) va: usize,
    pub(crate) writable: bool,
    pub(crate) marker: PageMarker,
    pub(crate) frame: Option<FrameId>,
    pub(crate) backing: PageBacking,
}

impl Page {
    pub(crate) fn new_uninit(
        va: usize,
        writable: bool,
        marker: PageMarker,
        target: PageKind,
        init: Option<PageInit>,
        aux: Option<FileAux>,
    ) -> Page {
        Page {
            va,
            writable,
            marker,
            frame: None,
            backing: PageBacking::Uninit(UninitPage { target, init, aux }),
        }
    }

    pub fn va(&self) -> usize {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn marker(&self) -> PageMarker {
        self.marker
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The terminal kind of this page, looking through `Uninit`.
    pub fn kind(&self) -> PageKind {
        match &self.backing {
            PageBacking::Uninit(u) => u.target,
            PageBacking::Anon(_) => PageKind::Anon,
            PageBacking::File(_) => PageKind::File,
        }
    }

    /// True while the backing is still a promise.
    pub fn is_uninit(&self) -> bool {
        matches!(self.backing, PageBacking::Uninit(_))
    }

    /// Bring the page's contents into the frame at `kva`. For `Uninit`
    /// this is the materializing first touch; afterwards it replays swap
    /// or file contents. The frame is already bound and mapped.
    pub(crate) fn swap_in(&mut self, vm: &Vm, kva: usize) -> Result<(), VmError> {
        match self.backing {
            PageBacking::Uninit(_) => uninit::initialize(self, kva),
            PageBacking::Anon(_) => anon::swap_in(self, vm, kva),
            PageBacking::File(_) => file::swap_in(self, kva),
        }
    }

    /// Push the page's contents out of its frame so the frame can be
    /// reused. Runs without the vm lock; takes it internally for the
    /// metadata transition. On success the page is no longer resident.
    pub(crate) fn swap_out(&mut self, vm: &Vm, pml4: Pml4, kva: usize) -> Result<(), VmError> {
        match self.backing {
            // Uninit pages never own a frame, so they are never victims.
            PageBacking::Uninit(_) => Err(VmError::BadAddress),
            PageBacking::Anon(_) => anon::swap_out(self, vm, pml4, kva),
            PageBacking::File(_) => file::swap_out(self, vm, pml4, kva),
        }
    }

    /// Release every resource the page holds: frame and mapping if
    /// resident, swap slot if swapped, dirty write-back and file handle
    /// for file pages. The descriptor itself is freed by the SPT.
    pub(crate) fn destroy(&mut self, vm: &Vm, pml4: Pml4) {
        match self.backing {
            // Never materialized: the aux payload is dropped with the
            // descriptor; there is no frame, slot, or mapping to undo.
            PageBacking::Uninit(_) => {}
            PageBacking::Anon(_) => anon::destroy(self, vm, pml4),
            PageBacking::File(_) => file::destroy(self, vm, pml4),
        }
    }
}
