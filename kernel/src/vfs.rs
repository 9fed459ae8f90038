//! Filesystem interface consumed by the VM subsystem.
//!
//! Memory maps and lazily-loaded segments only need positional reads and
//! writes plus handle duplication, so [`File`] is that slice of the real
//! VFS. Every call into a file must be made under the global
//! [`FilesysLock`]; the filesystem itself is not internally synchronized.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard, RwLock};

/// Positional file operations.
///
/// Handles are reference counted; dropping the last `Arc` closes the file.
/// `read_at`/`write_at` return the number of bytes actually transferred;
/// short counts at end-of-file are not errors.
pub trait File: Send + Sync {
    fn length(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;
    fn write_at(&self, offset: u64, buf: &[u8]) -> usize;
    /// Open an independent handle onto the same underlying file.
    fn duplicate(&self) -> Arc<dyn File>;
}

/// The coarse filesystem lock.
///
/// One per system, shared through the VM context. Held around each file
/// call, never across page or frame locks' I/O-free sections.
pub struct FilesysLock {
    inner: Mutex<()>,
}

impl FilesysLock {
    pub const fn new() -> Self {
        FilesysLock {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner.lock()
    }
}

impl Default for FilesysLock {
    fn default() -> Self {
        Self::new()
    }
}

struct MemFileInner {
    data: RwLock<Vec<u8>>,
    writes: AtomicU64,
}

/// Fixed-length in-memory file.
///
/// All handles produced by [`File::duplicate`] (or by cloning) share the
/// same storage, mirroring how inode-backed handles behave: a handle opened
/// before a write observes the write. Writes never grow the file.
#[derive(Clone)]
pub struct MemFile {
    inner: Arc<MemFileInner>,
}

impl MemFile {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        MemFile {
            inner: Arc::new(MemFileInner {
                data: RwLock::new(data),
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// A file of `len` bytes, every byte set to `fill`.
    pub fn filled(len: usize, fill: u8) -> Self {
        Self::from_bytes(alloc::vec![fill; len])
    }

    /// Number of `write_at` calls issued against this file.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.data.read().clone()
    }
}

impl File for MemFile {
    fn length(&self) -> u64 {
        self.inner.data.read().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.inner.data.read();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = core::cmp::min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.inner.data.write();
        if offset >= data.len() as u64 {
            return 0;
        }
        let start = offset as usize;
        let n = core::cmp::min(buf.len(), data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        n
    }

    fn duplicate(&self) -> Arc<dyn File> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_clamps_at_eof() {
        let f = MemFile::filled(10, 0xAB);
        let mut buf = [0u8; 16];
        assert_eq!(f.read_at(0, &mut buf), 10);
        assert_eq!(&buf[..10], &[0xAB; 10]);
        assert_eq!(f.read_at(8, &mut buf), 2);
        assert_eq!(f.read_at(10, &mut buf), 0);
    }

    #[test]
    fn test_write_never_grows() {
        let f = MemFile::filled(10, 0);
        assert_eq!(f.write_at(6, &[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(f.length(), 10);
        assert_eq!(f.snapshot()[6..], [1, 2, 3, 4]);
        assert_eq!(f.write_count(), 1);
    }

    #[test]
    fn test_duplicate_shares_storage() {
        let f = MemFile::filled(4, 0);
        let dup = f.duplicate();
        f.write_at(0, &[9]);
        let mut b = [0u8; 1];
        assert_eq!(dup.read_at(0, &mut b), 1);
        assert_eq!(b[0], 9);
    }
}
