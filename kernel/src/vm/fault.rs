//! Page-fault handling and stack growth.
//!
//! The trap handler packages what it knows into a [`FaultInfo`] and asks
//! the faulting process's SPT to resolve it. `true` means the access may
//! be retried; `false` means a genuine violation and the caller terminates
//! the process with exit code −1.

use log::debug;

use super::page;
use super::spt::Spt;
use super::{pg_round_down, PageType, PAGE_SIZE, STACK_FLOOR, USER_STACK_TOP};

/// Everything the trap frame tells us about a fault.
pub struct FaultInfo {
    /// Faulting address (not necessarily page-aligned).
    pub addr: u64,
    /// User stack pointer at the time of the fault.
    pub rsp: u64,
    /// Fault raised in user mode.
    pub user: bool,
    /// The access was a write.
    pub write: bool,
    /// No translation was present (false means a protection violation).
    pub not_present: bool,
}

impl Spt {
    /// Resolve a fault: claim a lazy or evicted page, grow the stack, or
    /// reject the access.
    pub fn try_handle_fault(&mut self, fault: &FaultInfo) -> bool {
        if !fault.not_present {
            // Present page, so the hardware refused the access itself
            // (write to a read-only mapping).
            return false;
        }

        if is_stack_growth(fault) && in_stack_extent(fault.addr) {
            return self.grow_stack(fault.addr);
        }

        let va = pg_round_down(fault.addr);
        let Some(cell) = self.find(va) else {
            debug!(
                "fault: no page at {:#x} (user={} write={})",
                fault.addr, fault.user, fault.write
            );
            return false;
        };
        if fault.write && !cell.lock().writable {
            return false;
        }
        page::claim(&cell, &self.ctx, &self.pml4).is_ok()
    }

    /// Extend the stack down to cover `addr`. A page that already exists
    /// there (a previously evicted stack page) is simply claimed;
    /// otherwise fresh anonymous stack pages fill the gap up to the
    /// current stack bottom, one page at a time.
    fn grow_stack(&mut self, addr: u64) -> bool {
        let va = pg_round_down(addr);
        if let Some(cell) = self.find(va) {
            return page::claim(&cell, &self.ctx, &self.pml4).is_ok();
        }

        let old_bottom = self.stack_bottom;
        let mut page_va = va;
        while page_va < old_bottom {
            if self
                .alloc_page(PageType::ANON | PageType::STACK, page_va, true)
                .is_err()
            {
                return false;
            }
            page_va += PAGE_SIZE as u64;
        }
        debug!("stack: grown to {:#x}", va);
        true
    }
}

/// Push-instruction heuristic: an access one word below `rsp` is a stack
/// extension, as is any access at or above `rsp` within the stack region.
fn is_stack_growth(fault: &FaultInfo) -> bool {
    fault.rsp.wrapping_sub(8) == fault.addr
        || (STACK_FLOOR <= fault.addr && fault.addr < USER_STACK_TOP && fault.rsp <= fault.addr)
}

/// The legal growth window. A qualifying access outside it is handled as
/// an ordinary fault instead.
fn in_stack_extent(addr: u64) -> bool {
    (STACK_FLOOR..USER_STACK_TOP).contains(&addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault(addr: u64, rsp: u64) -> FaultInfo {
        FaultInfo {
            addr,
            rsp,
            user: true,
            write: true,
            not_present: true,
        }
    }

    #[test]
    fn test_push_heuristic() {
        let rsp = USER_STACK_TOP - 0x2000;
        assert!(is_stack_growth(&fault(rsp - 8, rsp)));
        assert!(!is_stack_growth(&fault(rsp - 16, rsp)));
    }

    #[test]
    fn test_access_above_rsp_in_region() {
        let rsp = USER_STACK_TOP - 0x8000;
        assert!(is_stack_growth(&fault(rsp + 0x100, rsp)));
        assert!(is_stack_growth(&fault(rsp, rsp)));
        // Below rsp (and not the push slot): not growth
        assert!(!is_stack_growth(&fault(rsp - 0x1000, rsp)));
    }

    #[test]
    fn test_floor_bounds_growth() {
        assert!(in_stack_extent(STACK_FLOOR));
        assert!(!in_stack_extent(STACK_FLOOR - 1));
        assert!(!in_stack_extent(USER_STACK_TOP));
        // 2 MiB below the top lies outside the 1 MiB extent
        assert!(!in_stack_extent(USER_STACK_TOP - 0x20_0000));
    }
}
