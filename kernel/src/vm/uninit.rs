// Uninitialized Pages
//
// Handles the materializing first touch of a lazily allocated page. An
// `Uninit` descriptor is a promise recorded by `alloc_page_with_initializer`;
// the promise is kept here, on the first fault, after the coordinator has
// bound a frame and installed the mapping.
//
// Sequence:
// 1. Run the variant-specific first-touch routine: the recorded
//    initializer if one was supplied, otherwise zero-fill for anonymous
//    pages and the standard lazy file load for file pages.
// 2. Promote the descriptor in place: the `Uninit` payload is replaced
//    wholesale by the terminal variant built from its aux data.
//
// Failure leaves the descriptor untouched (still `Uninit`, aux still
// owned) and propagates to the fault handler, which unwinds the frame.

use crate::mm::pmm::PAGE_SIZE;
use crate::vm::anon::AnonPage;
use crate::vm::file::{self, FilePage};
use crate::vm::page::{Page, PageBacking, PageKind};
use crate::vm::VmError;

pub(crate) fn initialize(page: &mut Page, kva: usize) -> Result<(), VmError> {
    let PageBacking::Uninit(promise) = &mut page.backing else {
        return Err(VmError::BadAddress);
    };

    match promise.target {
        PageKind::Anon => match promise.init {
            Some(init) => init(kva, promise.aux.as_ref())?,
            None => zero_fill(kva),
        },
        PageKind::File => {
            let aux = promise.aux.as_ref().ok_or(VmError::BadAddress)?;
            match promise.init {
                Some(init) => init(kva, Some(aux))?,
                None => file::lazy_load(kva, Some(aux))?,
            }
        }
    }

    // First touch succeeded: replace the promise with the terminal
    // variant. The aux payload moves into the file variant; anonymous
    // pages start with no swap slot.
    let target = promise.target;
    let aux = promise.aux.take();

    page.backing = match target {
        PageKind::Anon => PageBacking::Anon(AnonPage::new()),
        PageKind::File => match aux {
            Some(aux) => PageBacking::File(FilePage::from_aux(aux)),
            None => return Err(VmError::BadAddress),
        },
    };

    Ok(())
}

pub(crate) fn zero_fill(kva: usize) {
    unsafe {
        core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE);
    }
}
