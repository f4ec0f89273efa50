// Virtual memory end-to-end tests
//
// Drives the whole paging stack on the host: pools over leaked arenas, a
// RAM-backed swap device, and user memory accesses simulated through the
// MMU adaptor (translate + explicit accessed/dirty bits, exactly what the
// hardware walker would do).

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::dev::disk::RamDisk;
use crate::fs::file::File;
use crate::mm::pmm::{self, PagePool, PAGE_SIZE};
use crate::mm::USER_STACK_TOP;
use crate::thread::Thread;
use crate::vm::page::PageKind;
use crate::vm::{PageFault, Vm, VmError};

fn leak_arena(pages: usize) -> usize {
    let buf: Vec<u8> = alloc::vec![0u8; (pages + 1) * PAGE_SIZE];
    pmm::align_up(Vec::leak(buf).as_mut_ptr() as usize)
}

struct Harness {
    vm: Vm,
    tables: Arc<PagePool>,
}

impl Harness {
    /// Fresh paging stack: `user_pages` of frame pool, `swap_sectors` of
    /// RAM-backed swap, and a generous table pool on the side.
    fn new(user_pages: usize, swap_sectors: usize) -> Harness {
        let tables = Arc::new(unsafe { PagePool::new("tables", leak_arena(256), 256) });
        let user = Arc::new(unsafe {
            PagePool::new("user", leak_arena(user_pages), user_pages)
        });

        Harness {
            vm: Vm::new(user, Arc::new(RamDisk::new(swap_sectors))),
            tables,
        }
    }

    fn spawn(&self) -> Thread {
        Thread::new(self.tables.clone()).expect("thread")
    }
}

fn fault(va: usize, rsp: usize, write: bool) -> PageFault {
    PageFault {
        va,
        rsp,
        from_user: true,
        write,
        not_present: true,
    }
}

/// Simulate a user-mode write: fault the page in if needed, then move the
/// bytes through the kernel alias and set the A/D bits the hardware
/// walker would set.
fn user_write(vm: &Vm, thread: &Thread, va: usize, bytes: &[u8]) {
    let mut off = 0;
    while off < bytes.len() {
        let cur = va + off;
        let in_page = (PAGE_SIZE - (cur % PAGE_SIZE)).min(bytes.len() - off);

        if thread.space().translate(cur).is_none() {
            vm.try_handle_fault(thread, &fault(cur, USER_STACK_TOP, true))
                .expect("write fault");
        }

        let kva = thread.space().translate(cur).expect("mapped after fault");
        unsafe {
            core::ptr::copy_nonoverlapping(bytes[off..].as_ptr(), kva as *mut u8, in_page);
        }
        thread.pml4().set_accessed(cur, true);
        thread.pml4().set_dirty(cur, true);

        off += in_page;
    }
}

/// Simulate a user-mode read into a buffer.
fn user_read(vm: &Vm, thread: &Thread, va: usize, len: usize) -> Vec<u8> {
    let mut out = alloc::vec![0u8; len];
    let mut off = 0;
    while off < len {
        let cur = va + off;
        let in_page = (PAGE_SIZE - (cur % PAGE_SIZE)).min(len - off);

        if thread.space().translate(cur).is_none() {
            vm.try_handle_fault(thread, &fault(cur, USER_STACK_TOP, false))
                .expect("read fault");
        }

        let kva = thread.space().translate(cur).expect("mapped after fault");
        unsafe {
            core::ptr::copy_nonoverlapping(kva as *const u8, out[off..].as_mut_ptr(), in_page);
        }
        thread.pml4().set_accessed(cur, true);

        off += in_page;
    }
    out
}

// ---- lazy anonymous pages -------------------------------------------------

#[test]
fn test_lazy_anon_touch_allocates_one_frame() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    h.vm.alloc_page(&t, PageKind::Anon, 0x100000, true).unwrap();

    // Nothing resident until the first touch.
    assert_eq!(h.vm.stats().frames, 0);
    assert!(t.space().translate(0x100000).is_none());

    user_write(&h.vm, &t, 0x100000, &[0x42]);
    assert_eq!(h.vm.stats().frames, 1);

    // Second touch reuses the same frame.
    assert_eq!(user_read(&h.vm, &t, 0x100000, 1), alloc::vec![0x42]);
    assert_eq!(h.vm.stats().frames, 1);

    // The rest of the page was zero-filled.
    assert_eq!(user_read(&h.vm, &t, 0x100001, 16), alloc::vec![0u8; 16]);
}

#[test]
fn test_two_faults_on_same_va_allocate_once() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    h.vm.alloc_page(&t, PageKind::Anon, 0x200000, true).unwrap();

    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                h.vm.try_handle_fault(&t, &fault(0x200000, USER_STACK_TOP, false))
                    .expect("fault");
            });
        }
    });

    assert_eq!(h.vm.stats().frames, 1);
}

#[test]
fn test_claim_is_idempotent() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    h.vm.alloc_page(&t, PageKind::Anon, 0x300000, true).unwrap();
    h.vm.claim_page(&t, 0x300000).unwrap();
    h.vm.claim_page(&t, 0x300000).unwrap();

    assert_eq!(h.vm.stats().frames, 1);
}

#[test]
fn test_alloc_collision_leaves_spt_and_mmu_unchanged() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    h.vm.alloc_page(&t, PageKind::Anon, 0x400000, true).unwrap();
    assert_eq!(
        h.vm.alloc_page(&t, PageKind::File, 0x400000, false),
        Err(VmError::AddressInUse)
    );

    assert_eq!(t.spt().lock().len(), 1);
    assert!(t.space().translate(0x400000).is_none());
    let spt = t.spt().lock();
    let page = spt.find(0x400000).unwrap();
    assert_eq!(page.kind(), PageKind::Anon);
    assert!(page.writable());
}

// ---- fault handling edge cases --------------------------------------------

#[test]
fn test_fault_without_descriptor_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    assert_eq!(
        h.vm.try_handle_fault(&t, &fault(0x500000, USER_STACK_TOP, false)),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_kernel_address_from_user_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    assert_eq!(
        h.vm.try_handle_fault(&t, &fault(crate::mm::KERNEL_BASE + 0x1000, USER_STACK_TOP, false)),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_write_fault_on_readonly_page_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    h.vm.alloc_page(&t, PageKind::Anon, 0x600000, false).unwrap();
    h.vm.claim_page(&t, 0x600000).unwrap();

    assert_eq!(
        h.vm.try_handle_fault(&t, &fault(0x600000, USER_STACK_TOP, true)),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_protection_fault_on_present_page_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    h.vm.alloc_page(&t, PageKind::Anon, 0x610000, true).unwrap();
    h.vm.claim_page(&t, 0x610000).unwrap();

    let present_fault = PageFault {
        va: 0x610000,
        rsp: USER_STACK_TOP,
        from_user: true,
        write: false,
        not_present: false,
    };
    assert_eq!(
        h.vm.try_handle_fault(&t, &present_fault),
        Err(VmError::BadAddress)
    );
}

// ---- stack growth ---------------------------------------------------------

#[test]
fn test_stack_grows_by_exactly_one_page() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    // Initial stack: one page right below the top, rsp at its base.
    let rsp = USER_STACK_TOP - PAGE_SIZE;
    t.set_user_rsp(rsp);
    h.vm.try_handle_fault(&t, &fault(USER_STACK_TOP - 8, rsp, true))
        .unwrap();
    let before = h.vm.stats().frames;

    // Push below the mapped page.
    let target = rsp - 2048;
    h.vm.try_handle_fault(&t, &fault(target, rsp, true)).unwrap();

    assert_eq!(h.vm.stats().frames, before + 1);
    user_write(&h.vm, &t, target, &[7]);
    assert_eq!(user_read(&h.vm, &t, target, 1), alloc::vec![7]);

    let spt = t.spt().lock();
    let page = spt.find(target).unwrap();
    assert!(page.marker().contains(crate::vm::page::PageMarker::STACK));
}

#[test]
fn test_fault_just_below_probe_window_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let rsp = USER_STACK_TOP - PAGE_SIZE;
    t.set_user_rsp(rsp);

    // rsp - 8 grows; rsp - 9 does not.
    assert_eq!(
        h.vm.try_handle_fault(&t, &fault(rsp - 9, rsp, true)),
        Err(VmError::BadAddress)
    );
    h.vm.try_handle_fault(&t, &fault(rsp - 8, rsp, true)).unwrap();
}

#[test]
fn test_fault_at_stack_top_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let rsp = USER_STACK_TOP - PAGE_SIZE;
    t.set_user_rsp(rsp);

    assert_eq!(
        h.vm.try_handle_fault(&t, &fault(USER_STACK_TOP, rsp, true)),
        Err(VmError::BadAddress)
    );
}

#[test]
fn test_fault_below_stack_limit_is_fatal() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let rsp = USER_STACK_TOP - crate::mm::MAX_STACK_BYTES - PAGE_SIZE;
    t.set_user_rsp(rsp);

    assert_eq!(
        h.vm.try_handle_fault(&t, &fault(rsp - 8, rsp, true)),
        Err(VmError::BadAddress)
    );
}

// ---- swap -----------------------------------------------------------------

#[test]
fn test_swap_roundtrip_preserves_contents() {
    // Four user frames, plenty of swap.
    let h = Harness::new(4, 512);
    let t = h.spawn();

    let base = 0x700000;
    for i in 0..5usize {
        let va = base + i * PAGE_SIZE;
        h.vm.alloc_page(&t, PageKind::Anon, va, true).unwrap();
        user_write(&h.vm, &t, va, &[i as u8 + 1]);
    }

    // The fifth touch overflowed the pool: one page went to swap.
    let stats = h.vm.stats();
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.swap_used, 1);

    let evicted: Vec<usize> = (0..5)
        .map(|i| base + i * PAGE_SIZE)
        .filter(|va| t.space().translate(*va).is_none())
        .collect();
    assert_eq!(evicted.len(), 1);

    // Touch the evicted page: its contents come back intact. Faulting it
    // in pushes some other page out, so exactly one slot stays in use.
    let va = evicted[0];
    let expected = ((va - base) / PAGE_SIZE) as u8 + 1;
    assert_eq!(user_read(&h.vm, &t, va, 1), alloc::vec![expected]);
    assert!(t.space().translate(va).is_some());
    assert_eq!(h.vm.stats().swap_used, 1);
    assert_eq!(h.vm.stats().frames, 4);

    // Teardown drains both the frame table and the swap bitmap.
    h.vm.spt_kill(&t);
    assert_eq!(h.vm.stats().frames, 0);
    assert_eq!(h.vm.stats().swap_used, 0);
}

#[test]
fn test_pool_and_swap_exhaustion_fails_cleanly() {
    // Two frames, one swap slot.
    let h = Harness::new(2, 8);
    let t = h.spawn();

    let base = 0x800000;
    for i in 0..4usize {
        h.vm.alloc_page(&t, PageKind::Anon, base + i * PAGE_SIZE, true)
            .unwrap();
    }

    h.vm.claim_page(&t, base).unwrap();
    h.vm.claim_page(&t, base + PAGE_SIZE).unwrap();

    // Third claim evicts into the single slot; the fourth finds both the
    // pool and the swap device exhausted.
    h.vm.claim_page(&t, base + 2 * PAGE_SIZE).unwrap();
    assert_eq!(
        h.vm.claim_page(&t, base + 3 * PAGE_SIZE),
        Err(VmError::OutOfMemory)
    );

    // The failed claim left no half-bound state behind.
    assert!(t.space().translate(base + 3 * PAGE_SIZE).is_none());
    assert_eq!(h.vm.stats().frames, 2);
}

#[test]
fn test_residency_accounting_balances() {
    let h = Harness::new(2, 512);
    let t = h.spawn();

    let base = 0x900000;
    for i in 0..4usize {
        h.vm.alloc_page(&t, PageKind::Anon, base + i * PAGE_SIZE, true)
            .unwrap();
    }
    // Materialize three pages through two frames; leave one uninit.
    for i in 0..3usize {
        user_write(&h.vm, &t, base + i * PAGE_SIZE, &[1]);
    }

    let spt = t.spt().lock();
    let mut resident = 0;
    let mut uninit = 0;
    for i in 0..4usize {
        let page = spt.find(base + i * PAGE_SIZE).unwrap();
        if page.is_uninit() {
            uninit += 1;
        } else if page.is_resident() {
            resident += 1;
        }
    }
    drop(spt);

    let stats = h.vm.stats();
    assert_eq!(uninit, 1);
    assert_eq!(resident, 2);
    assert_eq!(stats.swap_used, 1);
    assert_eq!(resident + stats.swap_used, 4 - uninit);
}

// ---- mmap -----------------------------------------------------------------

#[test]
fn test_mmap_writeback_on_munmap() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let file = File::create(100);
    let base = h.vm.mmap(&t, 0xA00000, 100, true, &file, 0).unwrap();
    assert_eq!(base, 0xA00000);

    user_write(&h.vm, &t, base + 50, b"A");
    h.vm.munmap(&t, base).unwrap();

    let mut buf = alloc::vec![0u8; 100];
    assert_eq!(file.read_at(0, &mut buf), 100);
    assert_eq!(buf[50], b'A');
    assert!(buf[..50].iter().all(|&b| b == 0));
    assert!(buf[51..].iter().all(|&b| b == 0));

    // Invariant: no descriptor of the region survives the unmap.
    assert!(t.spt().lock().is_empty());
    assert_eq!(h.vm.stats().frames, 0);
}

#[test]
fn test_mmap_short_file_reads_then_zeros() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let file = File::create(794);
    for i in 0..794usize {
        file.write_at(i, &[(i % 251) as u8 + 1]);
    }

    let base = h.vm.mmap(&t, 0xB00000, 4096, true, &file, 0).unwrap();
    let bytes = user_read(&h.vm, &t, base, 4096);

    for i in 0..794usize {
        assert_eq!(bytes[i], (i % 251) as u8 + 1);
    }
    assert!(bytes[794..].iter().all(|&b| b == 0));

    // Dirtying the zero tail must not grow the file on write-back.
    user_write(&h.vm, &t, base + 800, &[0xEE]);
    h.vm.munmap(&t, base).unwrap();
    assert_eq!(file.length(), 794);
}

#[test]
fn test_mmap_roundtrip_observes_previous_writes() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let file = File::create(2 * PAGE_SIZE);

    let base = h.vm.mmap(&t, 0xC00000, 2 * PAGE_SIZE, true, &file, 0).unwrap();
    user_write(&h.vm, &t, base + 17, b"persisted");
    user_write(&h.vm, &t, base + PAGE_SIZE + 9, b"tail");
    h.vm.munmap(&t, base).unwrap();

    let again = h.vm.mmap(&t, 0xC00000, 2 * PAGE_SIZE, true, &file, 0).unwrap();
    assert_eq!(user_read(&h.vm, &t, again + 17, 9), b"persisted".to_vec());
    assert_eq!(user_read(&h.vm, &t, again + PAGE_SIZE + 9, 4), b"tail".to_vec());
    h.vm.munmap(&t, again).unwrap();
}

#[test]
fn test_mmap_collision_rolls_back_whole_region() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    // Occupy the middle of the would-be region.
    h.vm.alloc_page(&t, PageKind::Anon, 0xD00000 + PAGE_SIZE, true)
        .unwrap();

    let file = File::create(3 * PAGE_SIZE);
    assert_eq!(
        h.vm.mmap(&t, 0xD00000, 3 * PAGE_SIZE, true, &file, 0),
        Err(VmError::AddressInUse)
    );

    // Only the pre-existing descriptor remains.
    assert_eq!(t.spt().lock().len(), 1);
    assert!(t.spt().lock().find(0xD00000).is_none());
}

#[test]
fn test_munmap_of_untouched_mapping() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let file = File::create(3 * PAGE_SIZE);
    let base = h.vm.mmap(&t, 0xE00000, 3 * PAGE_SIZE, false, &file, 0).unwrap();

    // Never faulted in: teardown must still drop all three promises.
    h.vm.munmap(&t, base).unwrap();
    assert!(t.spt().lock().is_empty());
    assert_eq!(h.vm.stats().frames, 0);
}

#[test]
fn test_mmap_at_nonzero_offset() {
    let h = Harness::new(16, 256);
    let t = h.spawn();

    let file = File::create(2 * PAGE_SIZE);
    file.write_at(PAGE_SIZE, b"second page");

    let base = h.vm.mmap(&t, 0xF00000, PAGE_SIZE, true, &file, PAGE_SIZE).unwrap();
    assert_eq!(user_read(&h.vm, &t, base, 11), b"second page".to_vec());
    h.vm.munmap(&t, base).unwrap();
}

// ---- teardown -------------------------------------------------------------

#[test]
fn test_spt_kill_releases_frames_slots_and_writes_back() {
    let h = Harness::new(2, 512);
    let t = h.spawn();

    // Anonymous pages spilling into swap.
    let base = 0x1000000;
    for i in 0..3usize {
        h.vm.alloc_page(&t, PageKind::Anon, base + i * PAGE_SIZE, true)
            .unwrap();
        user_write(&h.vm, &t, base + i * PAGE_SIZE, &[9]);
    }
    assert_eq!(h.vm.stats().swap_used, 1);

    // A dirty file mapping.
    let file = File::create(PAGE_SIZE);
    let mbase = h.vm.mmap(&t, 0x2000000, PAGE_SIZE, true, &file, 0).unwrap();
    user_write(&h.vm, &t, mbase + 3, b"dirty");

    h.vm.spt_kill(&t);

    let stats = h.vm.stats();
    assert_eq!(stats.frames, 0);
    assert_eq!(stats.swap_used, 0);
    assert!(t.spt().lock().is_empty());

    let mut buf = alloc::vec![0u8; 8];
    file.read_at(0, &mut buf);
    assert_eq!(&buf[3..8], b"dirty");
}

// ---- fork -----------------------------------------------------------------

#[test]
fn test_fork_copies_and_isolates() {
    let h = Harness::new(16, 256);
    let parent = h.spawn();
    let child = h.spawn();

    let va = 0x1100000;
    h.vm.alloc_page(&parent, PageKind::Anon, va, true).unwrap();
    user_write(&h.vm, &parent, va, b"X");

    h.vm.spt_copy(&child, &parent).unwrap();

    // Same address, same permission, same bytes.
    {
        let child_spt = child.spt().lock();
        let page = child_spt.find(va).unwrap();
        assert!(page.writable());
        assert!(page.is_resident());
    }
    assert_eq!(user_read(&h.vm, &child, va, 1), b"X".to_vec());

    // Writes diverge after the copy.
    user_write(&h.vm, &child, va, b"Y");
    assert_eq!(user_read(&h.vm, &parent, va, 1), b"X".to_vec());
    assert_eq!(user_read(&h.vm, &child, va, 1), b"Y".to_vec());
}

#[test]
fn test_fork_copies_uninit_promises_deeply() {
    let h = Harness::new(16, 256);
    let parent = h.spawn();
    let child = h.spawn();

    let file = File::create(PAGE_SIZE);
    file.write_at(0, b"lazy contents");
    let base = h.vm.mmap(&parent, 0x1200000, PAGE_SIZE, true, &file, 0).unwrap();

    // Copy before anyone touches the mapping: the promise is cloned, not
    // materialized.
    h.vm.spt_copy(&child, &parent).unwrap();
    assert!(child.spt().lock().find(base).unwrap().is_uninit());

    // Destroying the parent's region must not break the child's copy.
    h.vm.munmap(&parent, base).unwrap();
    assert_eq!(user_read(&h.vm, &child, base, 13), b"lazy contents".to_vec());
    h.vm.munmap(&child, base).unwrap();
}

#[test]
fn test_fork_pulls_swapped_pages_back() {
    let h = Harness::new(2, 512);
    let parent = h.spawn();
    let child = h.spawn();

    let base = 0x1300000;
    for i in 0..3usize {
        h.vm.alloc_page(&parent, PageKind::Anon, base + i * PAGE_SIZE, true)
            .unwrap();
        user_write(&h.vm, &parent, base + i * PAGE_SIZE, &[i as u8 + 1]);
    }
    assert_eq!(h.vm.stats().swap_used, 1);

    h.vm.spt_copy(&child, &parent).unwrap();

    for i in 0..3usize {
        assert_eq!(
            user_read(&h.vm, &child, base + i * PAGE_SIZE, 1),
            alloc::vec![i as u8 + 1]
        );
    }
}

// ---- parallel sort-merge scenario -----------------------------------------

const CHUNK_SIZE: usize = 128 * 1024;
const CHUNK_CNT: usize = 8;
const DATA_SIZE: usize = CHUNK_CNT * CHUNK_SIZE;

/// Deterministic arc4 keystream, matching the byte stream the original
/// user-space test generates from the same key.
struct Arc4 {
    i: u8,
    j: u8,
    s: [u8; 256],
}

impl Arc4 {
    fn new(key: &[u8]) -> Arc4 {
        let mut s = [0u8; 256];
        for (i, b) in s.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Arc4 { i: 0, j: 0, s }
    }

    fn crypt(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[(self.s[self.i as usize]
                .wrapping_add(self.s[self.j as usize])) as usize];
            *b ^= k;
        }
    }
}

#[test]
fn test_parallel_merge_preserves_histogram() {
    let h = Harness::new(48, 4096);

    // 1 MiB of deterministic input and its histogram.
    let mut data = alloc::vec![0u8; DATA_SIZE];
    Arc4::new(b"foobar").crypt(&mut data);
    let mut histogram = [0usize; 256];
    for &b in data.iter() {
        histogram[b as usize] += 1;
    }

    // Each subprocess maps its chunk file, sorts it through the mapping,
    // and unmaps; the write-back carries the sorted bytes to the file.
    let mut chunk_files: Vec<File> = Vec::new();
    for c in 0..CHUNK_CNT {
        let file = File::create(CHUNK_SIZE);
        file.write_at(0, &data[c * CHUNK_SIZE..(c + 1) * CHUNK_SIZE]);

        let worker = h.spawn();
        let base = h.vm.mmap(&worker, 0x2000000, CHUNK_SIZE, true, &file, 0).unwrap();

        let mut chunk = user_read(&h.vm, &worker, base, CHUNK_SIZE);
        chunk.sort_unstable();
        user_write(&h.vm, &worker, base, &chunk);

        h.vm.munmap(&worker, base).unwrap();
        h.vm.spt_kill(&worker);
        chunk_files.push(file);
    }

    // Merge the sorted chunks the way the original does: repeatedly take
    // the smallest head among the remaining chunk cursors.
    let mut chunks: Vec<Vec<u8>> = chunk_files
        .iter()
        .map(|f| {
            let mut buf = alloc::vec![0u8; CHUNK_SIZE];
            assert_eq!(f.read_at(0, &mut buf), CHUNK_SIZE);
            buf
        })
        .collect();

    let mut cursors = alloc::vec![0usize; CHUNK_CNT];
    let mut live: Vec<usize> = (0..CHUNK_CNT).collect();
    let mut merged = Vec::with_capacity(DATA_SIZE);

    while !live.is_empty() {
        let mut min_at = 0;
        for i in 1..live.len() {
            let (a, b) = (live[i], live[min_at]);
            if chunks[a][cursors[a]] < chunks[b][cursors[b]] {
                min_at = i;
            }
        }

        let chunk = live[min_at];
        merged.push(chunks[chunk][cursors[chunk]]);
        cursors[chunk] += 1;
        if cursors[chunk] == CHUNK_SIZE {
            live.swap_remove(min_at);
        }
    }

    assert_eq!(merged.len(), DATA_SIZE);
    assert!(merged.windows(2).all(|w| w[0] <= w[1]));

    let mut merged_histogram = [0usize; 256];
    for &b in merged.iter() {
        merged_histogram[b as usize] += 1;
    }
    assert_eq!(merged_histogram, histogram);
}
