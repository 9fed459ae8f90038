//! Supplemental page table.
//!
//! The per-process index of every reserved virtual page, keyed by
//! page-aligned address. Only the owning thread mutates the index; the
//! pages themselves sit behind `Arc<Mutex<…>>` cells so the eviction path
//! can reach them from the frame table's back-references.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use log::debug;
use spin::Mutex;

use super::page::{self, Page, PageInit};
use super::{pg_aligned, PageType, VmContext, VmError, VmResult, USER_STACK_TOP};
use crate::paging::AddressSpace;

/// Supplemental page table of one process.
pub struct Spt {
    pages: HashMap<u64, Arc<Mutex<Page>>>,
    /// Head addresses of live mmap regions, oldest first.
    mmap_list: Vec<u64>,
    /// Lowest stack page allocated so far.
    pub(crate) stack_bottom: u64,
    /// Shared views: frame table, user pool, swap pool, filesystem lock.
    pub ctx: VmContext,
    /// This process's page-table handle.
    pub pml4: Arc<dyn AddressSpace>,
}

impl Spt {
    pub fn new(ctx: VmContext, pml4: Arc<dyn AddressSpace>) -> Self {
        Spt {
            pages: HashMap::new(),
            mmap_list: Vec::new(),
            stack_bottom: USER_STACK_TOP,
            ctx,
            pml4,
        }
    }

    /// Look up the page registered at page-aligned `va`.
    pub fn find(&self, va: u64) -> Option<Arc<Mutex<Page>>> {
        self.pages.get(&va).cloned()
    }

    /// Register a page. Fails if its address is already taken.
    pub fn insert(&mut self, page: Page) -> VmResult<Arc<Mutex<Page>>> {
        match self.pages.entry(page.va) {
            Entry::Occupied(_) => Err(VmError::AlreadyMapped),
            Entry::Vacant(slot) => {
                let cell = Arc::new(Mutex::new(page));
                slot.insert(cell.clone());
                Ok(cell)
            }
        }
    }

    /// Destroy the page at `va` and drop it from the index.
    pub fn remove(&mut self, va: u64) {
        if let Some(cell) = self.pages.remove(&va) {
            cell.lock().destroy(&self.ctx, &*self.pml4);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Reserve a lazy page at `va`. `ty` selects the post-init variant
    /// (ANON or FILE) and may carry the STACK marker, in which case the
    /// page is claimed on the spot, stacks are never lazy.
    pub fn alloc_page_with_initializer(
        &mut self,
        ty: PageType,
        va: u64,
        writable: bool,
        init: PageInit,
    ) -> VmResult<()> {
        if !pg_aligned(va) {
            return Err(VmError::InvalidArgument);
        }
        let cell = self.insert(Page::new_uninit(va, ty, writable, init))?;
        if ty.contains(PageType::STACK) {
            if let Err(e) = page::claim(&cell, &self.ctx, &self.pml4) {
                self.pages.remove(&va);
                return Err(e);
            }
            if va < self.stack_bottom {
                self.stack_bottom = va;
            }
        }
        Ok(())
    }

    /// Reserve a bare page with no init payload.
    pub fn alloc_page(&mut self, ty: PageType, va: u64, writable: bool) -> VmResult<()> {
        self.alloc_page_with_initializer(ty, va, writable, PageInit::Zero)
    }

    /// Materialize the page at `va` right now.
    pub fn claim_page(&self, va: u64) -> VmResult<()> {
        let cell = self.find(va).ok_or(VmError::NotFound)?;
        page::claim(&cell, &self.ctx, &self.pml4)
    }

    /// Tear the table down: unmap every mmap region front to back (which
    /// performs dirty write-back), then destroy all remaining pages.
    /// Idempotent; also invoked from drop as a safety net.
    pub fn kill(&mut self) {
        let heads: Vec<u64> = self.mmap_list.clone();
        for head in heads {
            self.munmap(head);
        }
        self.mmap_list.clear();

        let vas: Vec<u64> = self.pages.keys().copied().collect();
        for va in vas {
            self.remove(va);
        }
        debug!("spt: killed");
    }

    pub(crate) fn push_mmap_head(&mut self, addr: u64) {
        self.mmap_list.push(addr);
    }

    pub(crate) fn drop_mmap_head(&mut self, addr: u64) {
        self.mmap_list.retain(|&h| h != addr);
    }

    pub(crate) fn mmap_heads(&self) -> &[u64] {
        &self.mmap_list
    }

    pub(crate) fn set_mmap_heads(&mut self, heads: Vec<u64>) {
        self.mmap_list = heads;
    }

    pub(crate) fn iter_pages(&self) -> impl Iterator<Item = (u64, &Arc<Mutex<Page>>)> {
        self.pages.iter().map(|(&va, cell)| (va, cell))
    }
}

impl Drop for Spt {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;
    use crate::paging::SoftPml4;
    use crate::palloc::UserPool;

    fn spt() -> Spt {
        let ctx = VmContext::new(UserPool::new(4), Arc::new(RamDisk::new(64)));
        Spt::new(ctx, Arc::new(SoftPml4::new()))
    }

    #[test]
    fn test_duplicate_va_rejected() {
        let mut spt = spt();
        assert!(spt.alloc_page(PageType::ANON, 0x1000, true).is_ok());
        assert_eq!(
            spt.alloc_page(PageType::ANON, 0x1000, true),
            Err(VmError::AlreadyMapped)
        );
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn test_unaligned_va_rejected() {
        let mut spt = spt();
        assert_eq!(
            spt.alloc_page(PageType::ANON, 0x1234, true),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn test_lazy_alloc_claims_nothing() {
        let mut spt = spt();
        spt.alloc_page(PageType::ANON, 0x1000, true).unwrap();
        assert_eq!(spt.ctx.frames.len(), 0);
        assert_eq!(spt.ctx.pool.free_pages(), spt.ctx.pool.capacity());

        spt.claim_page(0x1000).unwrap();
        assert_eq!(spt.ctx.frames.len(), 1);
    }

    #[test]
    fn test_stack_alloc_claims_eagerly() {
        let mut spt = spt();
        let va = USER_STACK_TOP - super::super::PAGE_SIZE as u64;
        spt.alloc_page(PageType::ANON | PageType::STACK, va, true)
            .unwrap();
        assert_eq!(spt.ctx.frames.len(), 1);
        assert_eq!(spt.stack_bottom, va);
        assert!(spt.pml4.translate(va).is_some());
    }

    #[test]
    fn test_kill_returns_everything() {
        let mut spt = spt();
        spt.alloc_page(PageType::ANON, 0x1000, true).unwrap();
        spt.alloc_page(PageType::ANON, 0x2000, true).unwrap();
        spt.claim_page(0x1000).unwrap();
        spt.claim_page(0x2000).unwrap();
        assert_eq!(spt.ctx.frames.len(), 2);

        spt.kill();
        assert!(spt.is_empty());
        assert_eq!(spt.ctx.frames.len(), 0);
        assert_eq!(spt.ctx.pool.free_pages(), spt.ctx.pool.capacity());
    }
}
