// File Handles
//
// Implements the file surface consumed by memory-mapped regions and lazy
// segment loading: independent handles over a shared inode with
// positionless, offset-addressed reads and writes.
//
// Key responsibilities:
// - `File::reopen` hands out an independent handle on the same inode, so
//   every mapped page can own (and later close) its handle without
//   affecting the user's descriptor
// - `read_at` / `write_at` transfer bytes at explicit offsets; writes
//   never grow the file
// - `length` reports the fixed inode size for mapping-extent math
//
// Implementation details:
// - Inodes are memory-backed byte buffers behind a spinlock; the real
//   filesystem of the surrounding kernel plugs in underneath this surface
// - Short transfers at end-of-file return the byte count actually moved,
//   matching what a disk-backed inode would do
//
// Correctness and safety notes:
// - Handles sharing an inode observe each other's writes immediately;
//   write-back through one mapping is visible to every reopened handle
// - Closing a handle is per-handle and idempotent; the inode lives until
//   the last handle drops

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

struct Inode {
    data: Mutex<Vec<u8>>,
}

pub struct File {
    inode: Arc<Inode>,
}

impl File {
    /// Create a zero-filled file of `len` bytes.
    pub fn create(len: usize) -> File {
        File {
            inode: Arc::new(Inode {
                data: Mutex::new(alloc::vec![0u8; len]),
            }),
        }
    }

    /// Independent handle on the same inode.
    pub fn reopen(&self) -> File {
        File {
            inode: self.inode.clone(),
        }
    }

    pub fn length(&self) -> usize {
        self.inode.data.lock().len()
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; short counts happen only at end-of-file.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.inode.data.lock();
        if offset >= data.len() {
            return 0;
        }

        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        n
    }

    /// Write up to `buf.len()` bytes starting at `offset`. Never grows the
    /// file; returns the number of bytes written.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> usize {
        let mut data = self.inode.data.lock();
        if offset >= data.len() {
            return 0;
        }

        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    /// Release this handle. Other handles on the inode stay valid.
    pub fn close(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_at_offsets() {
        let f = File::create(100);
        assert_eq!(f.length(), 100);

        assert_eq!(f.write_at(50, b"A"), 1);

        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(48, &mut buf), 4);
        assert_eq!(&buf, &[0, 0, b'A', 0]);
    }

    #[test]
    fn test_short_read_and_write_at_eof() {
        let f = File::create(10);

        let mut buf = [0xFFu8; 8];
        assert_eq!(f.read_at(6, &mut buf), 4);
        assert_eq!(f.read_at(10, &mut buf), 0);

        assert_eq!(f.write_at(8, &[1, 2, 3, 4]), 2);
        assert_eq!(f.length(), 10);
    }

    #[test]
    fn test_reopen_shares_contents() {
        let f = File::create(16);
        let g = f.reopen();

        f.write_at(0, b"shared");

        let mut buf = [0u8; 6];
        g.read_at(0, &mut buf);
        assert_eq!(&buf, b"shared");

        g.close();
        assert_eq!(f.length(), 16);
    }
}
