//! Swap slot pool.
//!
//! The swap disk is divided into page-sized slots of eight 512-byte
//! sectors, identified by their starting sector. Slots move between a free
//! list and a used list under `swap_lock`; the sector transfers themselves
//! happen with the lock dropped. The pool is sized once, from the disk's
//! capacity, at init.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::debug;
use spin::Mutex;

use super::{PAGE_SIZE, SECTORS_PER_PAGE};
use crate::disk::{BlockDevice, SECTOR_SIZE};

/// Starting sector of an eight-sector swap slot.
pub type SwapSlot = u64;

struct SlotLists {
    free: Vec<SwapSlot>,
    used: BTreeSet<SwapSlot>,
}

/// Swap slot allocator plus the disk it fronts.
pub struct SwapPool {
    disk: Arc<dyn BlockDevice>,
    lists: Mutex<SlotLists>,
    total: usize,
    swapped_out: AtomicU64,
    swapped_in: AtomicU64,
}

/// Snapshot of the pool state.
#[derive(Clone, Copy, Debug)]
pub struct SwapStats {
    pub free: usize,
    pub used: usize,
    pub total: usize,
    pub swapped_out: u64,
    pub swapped_in: u64,
}

impl SwapPool {
    /// Seed the pool by walking the disk in slot-sized strides.
    pub fn new(disk: Arc<dyn BlockDevice>) -> Self {
        let slots = disk.sector_count() / SECTORS_PER_PAGE as u64;
        let mut free: Vec<SwapSlot> = (0..slots).map(|i| i * SECTORS_PER_PAGE as u64).collect();
        // Vec is used as a stack; reverse so sector 0 is the first handed out.
        free.reverse();
        debug!("swap: {} slots ({} KB)", slots, slots as usize * PAGE_SIZE / 1024);
        SwapPool {
            disk,
            lists: Mutex::new(SlotLists {
                free,
                used: BTreeSet::new(),
            }),
            total: slots as usize,
            swapped_out: AtomicU64::new(0),
            swapped_in: AtomicU64::new(0),
        }
    }

    /// Take a slot off the free list.
    ///
    /// Panics when the free list is empty: at that point physical memory
    /// and swap are both exhausted and there is no recovery path.
    pub fn alloc(&self) -> SwapSlot {
        let mut lists = self.lists.lock();
        let slot = lists.free.pop().expect("memory and swap full");
        lists.used.insert(slot);
        slot
    }

    /// Move `slot` back to the free list. Freeing a slot that is not in
    /// use is a no-op.
    pub fn free(&self, slot: SwapSlot) {
        let mut lists = self.lists.lock();
        if lists.used.remove(&slot) {
            lists.free.push(slot);
        }
    }

    /// Read one page out of `slot` into `buf`.
    pub fn read(&self, slot: SwapSlot, buf: &mut [u8]) {
        for i in 0..SECTORS_PER_PAGE {
            self.disk
                .read_sector(slot + i as u64, &mut buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
        self.swapped_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Write one page from `buf` into `slot`.
    pub fn write(&self, slot: SwapSlot, buf: &[u8]) {
        for i in 0..SECTORS_PER_PAGE {
            self.disk
                .write_sector(slot + i as u64, &buf[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
        }
        self.swapped_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Duplicate `src` into a freshly allocated slot, sector by sector.
    /// Only fork uses this.
    pub fn copy(&self, src: SwapSlot) -> SwapSlot {
        let dst = self.alloc();
        let mut buf = [0u8; PAGE_SIZE];
        self.read(src, &mut buf);
        self.write(dst, &buf);
        debug!("swap: copied slot {} -> {}", src, dst);
        dst
    }

    pub fn stats(&self) -> SwapStats {
        let lists = self.lists.lock();
        SwapStats {
            free: lists.free.len(),
            used: lists.used.len(),
            total: self.total,
            swapped_out: self.swapped_out.load(Ordering::Relaxed),
            swapped_in: self.swapped_in.load(Ordering::Relaxed),
        }
    }
}
