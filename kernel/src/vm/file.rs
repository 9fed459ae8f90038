//! File-backed pages and memory maps.
//!
//! A file page's backing store is the file region recorded in its aux;
//! it never touches swap. Eviction writes dirty contents home and clean
//! pages cost no I/O at all. `mmap` carves a span of lazy file pages, one
//! duplicated handle each; `munmap` writes back, unmaps and tears the span
//! down.

use alloc::sync::Arc;
use log::debug;

use super::page::{FileAux, PageInit, PageState};
use super::spt::Spt;
use super::{pg_aligned, PageType, VmContext, VmError, VmResult, PAGE_SIZE};
use crate::paging::AddressSpace;
use crate::vfs::File;

/// State of a materialized file-backed page.
pub struct FilePage {
    pub aux: FileAux,
}

impl FilePage {
    pub(crate) fn new(aux: FileAux) -> Self {
        FilePage { aux }
    }

    /// Load the page from its file region. The MMU dirty bit is captured
    /// before the load and restored after: installing the mapping must
    /// not make a swapped-in page look freshly written, nor lose a bit
    /// that was pending.
    pub(crate) fn swap_in(
        &self,
        ctx: &VmContext,
        pml4: &dyn AddressSpace,
        va: u64,
        kva: u64,
    ) -> VmResult<()> {
        let dirty = pml4.is_dirty(va);
        self.aux.load(ctx, kva)?;
        pml4.set_dirty(va, dirty);
        Ok(())
    }

    /// Dirty pages are written back to the file and the bit cleared;
    /// clean pages need no I/O.
    pub(crate) fn swap_out(&self, ctx: &VmContext, pml4: &dyn AddressSpace, va: u64, kva: u64) {
        if !pml4.is_dirty(va) {
            return;
        }
        self.write_back(ctx, kva);
        pml4.set_dirty(va, false);
        debug!("file: wrote back va {:#x}", va);
    }

    /// Push `read_bytes` from the frame at `kva` to `(file, offset)`.
    pub(crate) fn write_back(&self, ctx: &VmContext, kva: u64) {
        let page = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE) };
        let _fs = ctx.fs.lock();
        self.aux
            .file
            .write_at(self.aux.offset, &page[..self.aux.read_bytes]);
    }
}

impl Spt {
    /// Map `length` bytes of `file` starting at `offset` to `addr`.
    ///
    /// The span is rounded up to whole pages; bytes past
    /// `min(length, file length − offset)` read as zero. Fails without
    /// allocating anything if any page of the span is already taken.
    /// Returns `addr` on success.
    pub fn mmap(
        &mut self,
        addr: u64,
        length: u64,
        writable: bool,
        file: &Arc<dyn File>,
        offset: u64,
    ) -> VmResult<u64> {
        if addr == 0 || !pg_aligned(addr) || length == 0 {
            return Err(VmError::InvalidArgument);
        }
        let file_len = {
            let _fs = self.ctx.fs.lock();
            file.length()
        };
        if file_len == 0 || offset >= file_len {
            return Err(VmError::InvalidArgument);
        }

        let read_total = core::cmp::min(length, file_len - offset) as usize;
        let pages = (length as usize + PAGE_SIZE - 1) / PAGE_SIZE;

        for i in 0..pages {
            if self.find(addr + (i * PAGE_SIZE) as u64).is_some() {
                return Err(VmError::AlreadyMapped);
            }
        }

        let mut read_left = read_total;
        for i in 0..pages {
            let va = addr + (i * PAGE_SIZE) as u64;
            let read_bytes = core::cmp::min(read_left, PAGE_SIZE);
            read_left -= read_bytes;
            let dup = {
                let _fs = self.ctx.fs.lock();
                file.duplicate()
            };
            let aux = FileAux {
                file: dup,
                offset: offset + (i * PAGE_SIZE) as u64,
                read_bytes,
                zero_bytes: PAGE_SIZE - read_bytes,
            };
            self.alloc_page_with_initializer(PageType::FILE, va, writable, PageInit::File(aux))?;
        }

        if let Some(head) = self.find(addr) {
            head.lock().page_count = Some(pages);
        }
        self.push_mmap_head(addr);
        debug!("mmap: {:#x} ({} pages)", addr, pages);
        Ok(addr)
    }

    /// Undo a previous [`mmap`](Self::mmap). `addr` must be the head the
    /// map returned; any other address is ignored. Dirty resident pages
    /// are written back before their mappings are cleared, then every page
    /// of the span is destroyed and dropped from the table.
    pub fn munmap(&mut self, addr: u64) {
        let Some(head) = self.find(addr) else {
            debug!("munmap: nothing mapped at {:#x}", addr);
            return;
        };
        let Some(pages) = head.lock().page_count else {
            debug!("munmap: {:#x} is not a region head", addr);
            return;
        };

        for i in 0..pages {
            let va = addr + (i * PAGE_SIZE) as u64;
            let Some(cell) = self.find(va) else {
                continue;
            };
            {
                let page = cell.lock();
                if let (Some(id), PageState::File(file)) = (page.frame, &page.state) {
                    if self.pml4.is_dirty(va) {
                        file.write_back(&self.ctx, self.ctx.frames.kva(id));
                        self.pml4.set_dirty(va, false);
                    }
                    self.pml4.unmap(va);
                }
            }
            self.remove(va);
        }
        self.drop_mmap_head(addr);
        debug!("munmap: {:#x} ({} pages)", addr, pages);
    }
}

/// Convenience constructor used by loaders: aux for one page of a
/// segment, `read_bytes` from the file and the rest zero.
pub fn segment_aux(file: Arc<dyn File>, offset: u64, read_bytes: usize) -> FileAux {
    debug_assert!(read_bytes <= PAGE_SIZE);
    FileAux {
        file,
        offset,
        read_bytes,
        zero_bytes: PAGE_SIZE - read_bytes,
    }
}
