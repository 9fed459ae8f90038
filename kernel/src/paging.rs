//! Page-table handle.
//!
//! The VM core manipulates a process's hardware page table only through
//! [`AddressSpace`]: install or clear a translation, query it, and read or
//! set the dirty bit. On x86_64 this is a thin wrapper over the pml4 walk;
//! [`SoftPml4`] is the software implementation backing the hosted build and
//! the test suite.

use alloc::collections::BTreeMap;
use spin::Mutex;

/// Per-process page-table operations.
///
/// `va` is always page-aligned; `kva` is the kernel-virtual alias of the
/// backing frame.
pub trait AddressSpace: Send + Sync {
    /// Install `va → kva`. Returns false if the mapping cannot be created
    /// (e.g. an intermediate table allocation failed).
    fn map(&self, va: u64, kva: u64, writable: bool) -> bool;
    /// Remove the translation for `va` so the next access faults.
    fn unmap(&self, va: u64);
    /// Current translation for `va`, if present.
    fn translate(&self, va: u64) -> Option<u64>;
    fn is_dirty(&self, va: u64) -> bool;
    fn set_dirty(&self, va: u64, dirty: bool);
}

/// One soft-TLB entry.
#[derive(Clone, Copy, Debug)]
pub struct SoftEntry {
    pub kva: u64,
    pub writable: bool,
    pub dirty: bool,
}

/// Software page table: a map of page-aligned `va` to [`SoftEntry`].
///
/// The dirty bit is maintained by whoever performs the store (the test
/// harness plays the role of the CPU here), exactly like the hardware bit
/// the real walk would set.
pub struct SoftPml4 {
    entries: Mutex<BTreeMap<u64, SoftEntry>>,
}

impl SoftPml4 {
    pub fn new() -> Self {
        SoftPml4 {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Full entry for `va` (page-aligned), if mapped.
    pub fn entry(&self, va: u64) -> Option<SoftEntry> {
        self.entries.lock().get(&va).copied()
    }

    /// Number of live translations.
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SoftPml4 {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SoftPml4 {
    fn map(&self, va: u64, kva: u64, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        entries.insert(
            va,
            SoftEntry {
                kva,
                writable,
                dirty: false,
            },
        );
        true
    }

    fn unmap(&self, va: u64) {
        self.entries.lock().remove(&va);
    }

    fn translate(&self, va: u64) -> Option<u64> {
        self.entries.lock().get(&va).map(|e| e.kva)
    }

    fn is_dirty(&self, va: u64) -> bool {
        self.entries.lock().get(&va).map_or(false, |e| e.dirty)
    }

    fn set_dirty(&self, va: u64, dirty: bool) {
        if let Some(e) = self.entries.lock().get_mut(&va) {
            e.dirty = dirty;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_translate_unmap() {
        let pml4 = SoftPml4::new();
        assert!(pml4.translate(0x1000).is_none());
        assert!(pml4.map(0x1000, 0xdead_0000, true));
        assert_eq!(pml4.translate(0x1000), Some(0xdead_0000));
        pml4.unmap(0x1000);
        assert!(pml4.translate(0x1000).is_none());
    }

    #[test]
    fn test_dirty_tracking() {
        let pml4 = SoftPml4::new();
        pml4.map(0x2000, 0xbeef_0000, true);
        assert!(!pml4.is_dirty(0x2000));
        pml4.set_dirty(0x2000, true);
        assert!(pml4.is_dirty(0x2000));
        // Remapping resets the bit
        pml4.map(0x2000, 0xbeef_0000, true);
        assert!(!pml4.is_dirty(0x2000));
        // Unmapped pages are never dirty
        assert!(!pml4.is_dirty(0x9000));
        pml4.set_dirty(0x9000, true);
        assert!(!pml4.is_dirty(0x9000));
    }
}
