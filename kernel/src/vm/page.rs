//! Page lifecycle and variant dispatch.
//!
//! A page is Uninit until its first fault, then exactly one of Anon or
//! File for the rest of its life. The three operations every variant
//! answers (`swap_in`, `swap_out`, `destroy`) are dispatched by match on
//! the tag; the Uninit→Anon/File transition is an explicit value
//! replacement performed inside `swap_in`.

use alloc::sync::Arc;
use core::mem;
use spin::Mutex;

use super::anon::AnonPage;
use super::file::FilePage;
use super::frame::{FrameId, FrameOwner};
use super::{PageType, VmContext, VmError, VmResult, PAGE_SIZE};
use crate::paging::AddressSpace;
use crate::vfs::{File, FilesysLock};

/// Descriptor a file-initialized page carries through its Uninit phase:
/// read `read_bytes` from `(file, offset)`, zero the remaining
/// `zero_bytes`. The file handle is owned per-page.
pub struct FileAux {
    pub file: Arc<dyn File>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FileAux {
    /// Per-page handle duplication, for fork and mmap.
    pub fn duplicate(&self, fs: &FilesysLock) -> FileAux {
        let file = {
            let _fs = fs.lock();
            self.file.duplicate()
        };
        FileAux {
            file,
            offset: self.offset,
            read_bytes: self.read_bytes,
            zero_bytes: self.zero_bytes,
        }
    }

    /// Fill the frame at `kva`: file bytes first, zero tail after.
    pub(crate) fn load(&self, ctx: &VmContext, kva: u64) -> VmResult<()> {
        let page = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };
        let n = {
            let _fs = ctx.fs.lock();
            self.file.read_at(self.offset, &mut page[..self.read_bytes])
        };
        if n < self.read_bytes {
            return Err(VmError::ShortRead);
        }
        page[self.read_bytes..].fill(0);
        Ok(())
    }
}

/// How an Uninit page materializes on first touch.
pub enum PageInit {
    /// Zero-filled (bare anonymous pages, stack pages).
    Zero,
    /// Seeded from a file region.
    File(FileAux),
}

/// Current variant of a page.
pub enum PageState {
    Uninit { target: PageType, init: PageInit },
    Anon(AnonPage),
    File(FilePage),
}

/// One reserved user virtual page.
pub struct Page {
    pub va: u64,
    /// Type requested at allocation, including the STACK marker.
    pub ty: PageType,
    pub writable: bool,
    /// Backing frame while resident.
    pub frame: Option<FrameId>,
    /// Set on the first page of an mmap region: pages in the region.
    pub page_count: Option<usize>,
    pub state: PageState,
}

impl Page {
    pub fn new_uninit(va: u64, ty: PageType, writable: bool, init: PageInit) -> Page {
        debug_assert!(super::pg_aligned(va));
        Page {
            va,
            ty,
            writable,
            frame: None,
            page_count: None,
            state: PageState::Uninit {
                target: ty & (PageType::ANON | PageType::FILE),
                init,
            },
        }
    }

    /// Current variant tag; the empty set means still Uninit.
    pub fn kind(&self) -> PageType {
        match self.state {
            PageState::Uninit { .. } => PageType::empty(),
            PageState::Anon(_) => PageType::ANON,
            PageState::File(_) => PageType::FILE,
        }
    }

    pub fn is_stack(&self) -> bool {
        self.ty.contains(PageType::STACK)
    }

    /// Populate the freshly mapped frame at `kva`. On the first call this
    /// consumes the Init payload and upgrades the page to its target
    /// variant; afterwards it dispatches straight to that variant.
    pub(crate) fn swap_in(
        &mut self,
        ctx: &VmContext,
        pml4: &dyn AddressSpace,
        kva: u64,
    ) -> VmResult<()> {
        if matches!(self.state, PageState::Uninit { .. }) {
            let placeholder = PageState::Anon(AnonPage::default());
            let PageState::Uninit { target, init } = mem::replace(&mut self.state, placeholder)
            else {
                unreachable!();
            };
            if target.contains(PageType::FILE) {
                let PageInit::File(aux) = init else {
                    return Err(VmError::InvalidArgument);
                };
                let file_page = FilePage::new(aux);
                let loaded = file_page.swap_in(ctx, pml4, self.va, kva);
                self.state = PageState::File(file_page);
                return loaded;
            }
            // Anonymous target: the frame arrives zeroed; a file payload
            // seeds the contents once and its handle is dropped here.
            if let PageInit::File(aux) = init {
                aux.load(ctx, kva)?;
            }
            return Ok(());
        }

        match &mut self.state {
            PageState::Anon(anon) => {
                anon.swap_in(ctx, kva);
                Ok(())
            }
            PageState::File(file) => file.swap_in(ctx, pml4, self.va, kva),
            PageState::Uninit { .. } => unreachable!(),
        }
    }

    /// Eviction half of the variant dispatch. Only resident pages are
    /// eligible, so an Uninit page can never get here.
    pub(crate) fn swap_out(&mut self, ctx: &VmContext, pml4: &dyn AddressSpace, kva: u64) {
        match &mut self.state {
            PageState::Anon(anon) => anon.swap_out(ctx, kva),
            PageState::File(file) => file.swap_out(ctx, pml4, self.va, kva),
            PageState::Uninit { .. } => unreachable!("uninit page evicted"),
        }
    }

    /// Give back everything the page holds: its swap slot, its frame (and
    /// mapping), and, when the page drops, its file handle.
    pub(crate) fn destroy(&mut self, ctx: &VmContext, pml4: &dyn AddressSpace) {
        if let PageState::Anon(anon) = &mut self.state {
            if let Some(slot) = anon.slot.take() {
                ctx.swap.free(slot);
            }
        }
        if let Some(id) = self.frame.take() {
            pml4.unmap(self.va);
            ctx.frames.release(id, &ctx.pool);
        }
    }
}

/// Bind `page` to a frame: acquire one, link both directions, install the
/// mapping with the page's write permission, then run the variant's
/// `swap_in`. On failure the mapping, the link, and the frame are all
/// rolled back.
pub(crate) fn claim(
    cell: &Arc<Mutex<Page>>,
    ctx: &VmContext,
    pml4: &Arc<dyn AddressSpace>,
) -> VmResult<()> {
    let mut page = cell.lock();
    if page.frame.is_some() {
        return Ok(());
    }

    let id = ctx.frames.acquire(ctx);
    let kva = ctx.frames.kva(id);
    ctx.frames.set_owner(
        id,
        Some(FrameOwner {
            page: Arc::downgrade(cell),
            pml4: pml4.clone(),
        }),
    );
    page.frame = Some(id);

    if !pml4.map(page.va, kva, page.writable) {
        page.frame = None;
        ctx.frames.release(id, &ctx.pool);
        return Err(VmError::MapFailed);
    }

    if let Err(e) = page.swap_in(ctx, &**pml4, kva) {
        pml4.unmap(page.va);
        page.frame = None;
        ctx.frames.release(id, &ctx.pool);
        return Err(e);
    }
    Ok(())
}
