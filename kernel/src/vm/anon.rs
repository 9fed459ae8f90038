//! Anonymous pages.
//!
//! Backed by the swap device once evicted. A resident anonymous page has
//! no on-disk presence at all; `swap_out` buys it a slot and `swap_in`
//! gives the slot back.

use log::debug;

use super::swap::SwapSlot;
use super::{VmContext, PAGE_SIZE};

/// State of a materialized anonymous page.
#[derive(Default)]
pub struct AnonPage {
    /// Slot holding the page's contents while it is swapped out.
    /// Mutually exclusive with a resident frame.
    pub slot: Option<SwapSlot>,
}

impl AnonPage {
    /// Bring the page's contents back into the frame at `kva`. A page that
    /// was never swapped keeps the zeroed frame it was handed.
    pub(crate) fn swap_in(&mut self, ctx: &VmContext, kva: u64) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        ctx.swap.free(slot);
        let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };
        ctx.swap.read(slot, buf);
        debug!("anon: swapped in from slot {}", slot);
    }

    /// Move the page's contents out to a fresh swap slot. The frame's
    /// kernel mapping is still valid at this point.
    pub(crate) fn swap_out(&mut self, ctx: &VmContext, kva: u64) {
        let slot = ctx.swap.alloc();
        self.slot = Some(slot);
        let buf = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE) };
        ctx.swap.write(slot, buf);
        debug!("anon: swapped out to slot {}", slot);
    }
}
