//! Frame table.
//!
//! Tracks every physical frame lent to the fork family that shares this
//! table. Frames live in a slab and are addressed by stable [`FrameId`]s;
//! a FIFO queue orders them for victim selection. `frame_lock` guards the
//! slab and queue only, never across swap or file I/O.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use log::debug;
use spin::Mutex;

use super::page::Page;
use super::{VmContext, PAGE_SIZE};
use crate::paging::AddressSpace;
use crate::palloc::UserPool;

/// Stable identifier of a frame within its table.
pub type FrameId = usize;

/// What eviction needs to know about a frame's occupant.
pub struct FrameOwner {
    pub page: Weak<Mutex<Page>>,
    pub pml4: Arc<dyn AddressSpace>,
}

struct Frame {
    kva: u64,
    /// Back-reference to the occupying page. `None` while a claim is in
    /// flight; such frames are skipped by victim selection.
    owner: Option<FrameOwner>,
}

struct FrameTableInner {
    slots: Vec<Option<Frame>>,
    free_ids: Vec<FrameId>,
    /// Live frames, oldest first.
    queue: VecDeque<FrameId>,
}

/// Table of resident user frames with FIFO eviction.
pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
}

impl FrameTable {
    pub fn new() -> Self {
        FrameTable {
            inner: Mutex::new(FrameTableInner {
                slots: Vec::new(),
                free_ids: Vec::new(),
                queue: VecDeque::new(),
            }),
        }
    }

    /// Get a usable, zeroed frame. Takes a fresh page from the pool when
    /// one is available, otherwise evicts the oldest linked frame and
    /// recycles it. Never returns empty-handed: if eviction needs a swap
    /// slot and none is left, the swap pool panics ("memory and swap
    /// full").
    pub fn acquire(&self, ctx: &VmContext) -> FrameId {
        if let Some(kva) = ctx.pool.get_page() {
            return self.install(kva);
        }
        self.evict_one(ctx)
    }

    /// Drop a frame: out of the queue, slab slot recycled, page returned
    /// to the pool. Callers hold the occupying page's lock, which is what
    /// keeps release and eviction from racing on the same frame.
    pub fn release(&self, id: FrameId, pool: &UserPool) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.slots[id].take() {
            inner.queue.retain(|&q| q != id);
            inner.free_ids.push(id);
            pool.free_page(frame.kva);
        }
    }

    /// Kernel-virtual address of the frame's backing page.
    pub fn kva(&self, id: FrameId) -> u64 {
        self.inner.lock().slots[id]
            .as_ref()
            .expect("kva of a dead frame")
            .kva
    }

    /// Link or unlink the occupying page.
    pub fn set_owner(&self, id: FrameId, owner: Option<FrameOwner>) {
        let mut inner = self.inner.lock();
        inner.slots[id]
            .as_mut()
            .expect("owner of a dead frame")
            .owner = owner;
    }

    /// Number of live frames.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn install(&self, kva: u64) -> FrameId {
        let mut inner = self.inner.lock();
        let id = match inner.free_ids.pop() {
            Some(id) => {
                inner.slots[id] = Some(Frame { kva, owner: None });
                id
            }
            None => {
                inner.slots.push(Some(Frame { kva, owner: None }));
                inner.slots.len() - 1
            }
        };
        inner.queue.push_back(id);
        id
    }

    /// Eviction: pop the oldest linked frame, write its page out, clear
    /// the mapping, break both links, recycle the frame. The frame sits
    /// outside the queue for the duration, so a concurrent acquire cannot
    /// pick it twice.
    fn evict_one(&self, ctx: &VmContext) -> FrameId {
        loop {
            let (id, owner, kva) = {
                let mut inner = self.inner.lock();
                let mut picked = None;
                for _ in 0..inner.queue.len() {
                    let id = match inner.queue.pop_front() {
                        Some(id) => id,
                        None => break,
                    };
                    let frame = inner.slots[id].as_mut().expect("queued frame is dead");
                    let kva = frame.kva;
                    let owner = frame.owner.take();
                    match owner {
                        Some(owner) => {
                            picked = Some((id, owner, kva));
                            break;
                        }
                        // Mid-claim, not linked yet: rotate and keep looking.
                        None => inner.queue.push_back(id),
                    }
                }
                match picked {
                    Some(p) => p,
                    None => panic!("user pool exhausted with no evictable frame"),
                }
            };

            let Some(cell) = owner.page.upgrade() else {
                // The page cell is gone. If its teardown already released
                // this frame the id is dead and we try again; otherwise
                // the frame is orphaned and can be recycled directly.
                let mut inner = self.inner.lock();
                if inner.slots[id].is_some() {
                    inner.queue.push_back(id);
                    drop(inner);
                    unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
                    return id;
                }
                continue;
            };

            let mut page = cell.lock();
            if page.frame != Some(id) {
                // Destroyed (and released) between the pop and the lock.
                continue;
            }

            debug!("evict: va {:#x} from frame {}", page.va, id);
            page.swap_out(ctx, &*owner.pml4, kva);
            owner.pml4.unmap(page.va);
            page.frame = None;
            drop(page);

            self.inner.lock().queue.push_back(id);
            unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
            return id;
        }
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::RamDisk;

    fn ctx(frames: usize) -> VmContext {
        VmContext::new(UserPool::new(frames), Arc::new(RamDisk::new(64)))
    }

    #[test]
    fn test_acquire_from_pool() {
        let ctx = ctx(2);
        let table = &ctx.frames;
        let a = table.acquire(&ctx);
        let b = table.acquire(&ctx);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_ne!(table.kva(a), table.kva(b));
        assert_eq!(ctx.pool.free_pages(), 0);
    }

    #[test]
    fn test_release_returns_page_to_pool() {
        let ctx = ctx(1);
        let table = &ctx.frames;
        let id = table.acquire(&ctx);
        assert_eq!(ctx.pool.free_pages(), 0);
        table.release(id, &ctx.pool);
        assert_eq!(table.len(), 0);
        assert_eq!(ctx.pool.free_pages(), 1);
        // The slab slot is recycled
        let again = table.acquire(&ctx);
        assert_eq!(again, id);
    }
}
