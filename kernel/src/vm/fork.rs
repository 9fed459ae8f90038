//! Address-space duplication for fork.
//!
//! Runs in the child's context against the parent's SPT. Stack pages are
//! copied eagerly (a fork immediately returns into the child on its own
//! stack); swapped anonymous pages get a byte-identical slot of their own;
//! resident pages are claimed in the child and copied; everything still
//! lazy stays lazy.

use alloc::sync::Arc;
use log::debug;
use spin::Mutex;

use super::anon::AnonPage;
use super::page::{self, Page, PageInit, PageState};
use super::spt::Spt;
use super::swap::SwapSlot;
use super::{VmContext, VmResult, PAGE_SIZE};

/// What to build on the child side for one parent page, decided under the
/// parent page's lock and executed after it is dropped (the child claim
/// below may evict the very page being copied, so the lock cannot be held
/// across it).
enum Plan {
    /// Eager anonymous stack page: allocate + claim, then copy contents.
    Stack,
    /// Parent is swapped out: duplicate its slot, leave the child lazy.
    SwapCopy(SwapSlot),
    /// Parent is resident: claim the child and copy the parent's bytes.
    Claim(PageInit),
    /// Parent never materialized: mirror its init payload.
    Lazy(PageInit),
}

impl Spt {
    /// Mirror `src` into this (freshly initialized) SPT. Returns false on
    /// any failure; the half-built child is reclaimed by its own normal
    /// teardown.
    pub fn copy_from(&mut self, src: &Spt) -> bool {
        match self.duplicate_from(src) {
            Ok(()) => true,
            Err(e) => {
                debug!("fork: duplication failed: {:?}", e);
                false
            }
        }
    }

    fn duplicate_from(&mut self, src: &Spt) -> VmResult<()> {
        for (va, parent) in src.iter_pages() {
            let (ty, writable, page_count, plan) = {
                let p = parent.lock();
                let plan = if p.is_stack() {
                    Plan::Stack
                } else {
                    match &p.state {
                        PageState::Uninit { init, .. } => Plan::Lazy(clone_init(init, &self.ctx)),
                        PageState::Anon(anon) => match anon.slot {
                            Some(slot) => Plan::SwapCopy(slot),
                            None => Plan::Claim(PageInit::Zero),
                        },
                        PageState::File(file) => {
                            let init = PageInit::File(file.aux.duplicate(&self.ctx.fs));
                            if p.frame.is_some() {
                                Plan::Claim(init)
                            } else {
                                Plan::Lazy(init)
                            }
                        }
                    }
                };
                (p.ty, p.writable, p.page_count, plan)
            };

            match plan {
                Plan::Stack => {
                    self.alloc_page(ty, va, writable)?;
                    let child = self.find(va).expect("stack page just allocated");
                    let dst_kva = {
                        let c = child.lock();
                        self.ctx.frames.kva(c.frame.expect("stack page is resident"))
                    };
                    copy_parent_contents(parent, dst_kva, &self.ctx);
                }
                Plan::SwapCopy(slot) => {
                    let mut child = Page::new_uninit(va, ty, writable, PageInit::Zero);
                    child.state = PageState::Anon(AnonPage {
                        slot: Some(self.ctx.swap.copy(slot)),
                    });
                    child.page_count = page_count;
                    self.insert(child)?;
                }
                Plan::Claim(init) => {
                    let mut child = Page::new_uninit(va, ty, writable, init);
                    child.page_count = page_count;
                    let cell = self.insert(child)?;
                    page::claim(&cell, &self.ctx, &self.pml4)?;
                    let dst_kva = {
                        let c = cell.lock();
                        self.ctx.frames.kva(c.frame.expect("child page just claimed"))
                    };
                    copy_parent_contents(parent, dst_kva, &self.ctx);
                }
                Plan::Lazy(init) => {
                    let mut child = Page::new_uninit(va, ty, writable, init);
                    child.page_count = page_count;
                    self.insert(child)?;
                }
            }
        }

        self.set_mmap_heads(src.mmap_heads().to_vec());
        self.stack_bottom = src.stack_bottom;
        debug!("fork: duplicated {} pages", self.len());
        Ok(())
    }
}

/// Duplicate an init payload for the child; file handles are reopened
/// per-page.
fn clone_init(init: &PageInit, ctx: &VmContext) -> PageInit {
    match init {
        PageInit::Zero => PageInit::Zero,
        PageInit::File(aux) => PageInit::File(aux.duplicate(&ctx.fs)),
    }
}

/// Copy the parent page's current bytes into the child frame at
/// `dst_kva`. The parent is re-examined here because the child's claim may
/// have evicted it since the plan was made: a resident parent is copied
/// frame-to-frame, a swapped one is read straight off the swap disk (its
/// slot stays put), and an evicted file page re-reads its region (any
/// dirty data was written back during eviction).
fn copy_parent_contents(parent: &Arc<Mutex<Page>>, dst_kva: u64, ctx: &VmContext) {
    let p = parent.lock();
    if let Some(id) = p.frame {
        let src_kva = ctx.frames.kva(id);
        unsafe {
            core::ptr::copy_nonoverlapping(src_kva as *const u8, dst_kva as *mut u8, PAGE_SIZE);
        }
        return;
    }
    match &p.state {
        PageState::Anon(anon) => {
            if let Some(slot) = anon.slot {
                let buf =
                    unsafe { core::slice::from_raw_parts_mut(dst_kva as *mut u8, PAGE_SIZE) };
                ctx.swap.read(slot, buf);
            }
        }
        PageState::File(file) => {
            let _ = file.aux.load(ctx, dst_kva);
        }
        PageState::Uninit { .. } => {}
    }
}
