//! Physical page allocator (user pool).
//!
//! A fixed set of 4 KB page buffers carved out at boot. Pages are handed
//! out zeroed and addressed by their kernel-virtual alias. The pool size
//! bounds how many user frames can be resident at once; when it runs dry
//! the frame table starts evicting.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::vm::PAGE_SIZE;

struct PoolInner {
    /// Backing buffers. Never resized after construction, so every page's
    /// address is stable for the pool's lifetime.
    pages: Vec<Box<[u8; PAGE_SIZE]>>,
    free: Vec<usize>,
    by_kva: BTreeMap<u64, usize>,
}

/// Pool of physical user pages.
pub struct UserPool {
    inner: Mutex<PoolInner>,
    handed_out: AtomicU64,
}

impl UserPool {
    /// Carve out `page_count` pages.
    pub fn new(page_count: usize) -> Self {
        let mut pages = Vec::with_capacity(page_count);
        let mut by_kva = BTreeMap::new();
        for i in 0..page_count {
            let mut page: Box<[u8; PAGE_SIZE]> = Box::new([0u8; PAGE_SIZE]);
            by_kva.insert(page.as_mut_ptr() as u64, i);
            pages.push(page);
        }
        let free = (0..page_count).rev().collect();
        UserPool {
            inner: Mutex::new(PoolInner {
                pages,
                free,
                by_kva,
            }),
            handed_out: AtomicU64::new(0),
        }
    }

    /// Allocate one zeroed page. Returns its kernel-virtual address, or
    /// `None` when the pool is exhausted.
    pub fn get_page(&self) -> Option<u64> {
        let mut inner = self.inner.lock();
        let idx = inner.free.pop()?;
        inner.pages[idx].fill(0);
        let kva = inner.pages[idx].as_mut_ptr() as u64;
        self.handed_out.fetch_add(1, Ordering::Relaxed);
        Some(kva)
    }

    /// Return a page previously obtained from [`get_page`](Self::get_page).
    pub fn free_page(&self, kva: u64) {
        let mut inner = self.inner.lock();
        let idx = *inner
            .by_kva
            .get(&kva)
            .expect("freeing a page the pool does not own");
        debug_assert!(!inner.free.contains(&idx), "double free of user page");
        inner.free.push(idx);
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().pages.len()
    }

    pub fn free_pages(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Total pages handed out over the pool's lifetime.
    pub fn total_allocs(&self) -> u64 {
        self.handed_out.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_come_back_zeroed() {
        let pool = UserPool::new(2);
        let kva = pool.get_page().unwrap();
        unsafe { core::ptr::write_bytes(kva as *mut u8, 0xFF, PAGE_SIZE) };
        pool.free_page(kva);

        // Drain the pool; every page we get must be zero regardless of
        // what its previous owner left behind.
        while let Some(kva) = pool.get_page() {
            let page = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE) };
            assert!(page.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = UserPool::new(3);
        let a = pool.get_page().unwrap();
        let b = pool.get_page().unwrap();
        let c = pool.get_page().unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(pool.get_page().is_none());
        assert_eq!(pool.free_pages(), 0);

        pool.free_page(b);
        assert_eq!(pool.get_page(), Some(b));
        assert_eq!(pool.capacity(), 3);
    }
}
