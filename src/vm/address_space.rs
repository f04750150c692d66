//! Simulated per-process page table.
//!
//! Stands in for the CPU page directory (spec §4.I invariant: the present
//! bit for a user page is set iff the supplemental page table's entry is
//! `IN_FRAME`). A real page directory is manipulated through assembly and
//! TLB invalidation that this crate treats as an external collaborator
//! (spec §1); `AddressSpace` exposes exactly the operations the fault
//! resolver and frame table need from it.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Copy)]
struct Mapping {
    frame: u32,
    writable: bool,
    dirty: bool,
}

/// One process's view of its mapped user pages, keyed by page-aligned
/// virtual address.
pub trait AddressSpace: Send + Sync {
    fn map(&self, user_page: u64, frame: u32, writable: bool);
    fn unmap(&self, user_page: u64);
    fn is_present(&self, user_page: u64) -> bool;
    fn is_writable(&self, user_page: u64) -> bool;
    fn frame_of(&self, user_page: u64) -> Option<u32>;
    /// `true` if the page has been written to since the last `clear_dirty`.
    fn is_dirty(&self, user_page: u64) -> bool;
    fn clear_dirty(&self, user_page: u64);
    /// Simulates a user-mode write through this mapping, setting the dirty
    /// bit. Used by tests and by mmap write-back exercises.
    fn mark_written(&self, user_page: u64);
}

#[derive(Default)]
pub struct SimulatedAddressSpace {
    table: Mutex<HashMap<u64, Mapping>>,
}

impl SimulatedAddressSpace {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressSpace for SimulatedAddressSpace {
    fn map(&self, user_page: u64, frame: u32, writable: bool) {
        self.table.lock().unwrap().insert(
            user_page,
            Mapping {
                frame,
                writable,
                dirty: false,
            },
        );
    }

    fn unmap(&self, user_page: u64) {
        self.table.lock().unwrap().remove(&user_page);
    }

    fn is_present(&self, user_page: u64) -> bool {
        self.table.lock().unwrap().contains_key(&user_page)
    }

    fn is_writable(&self, user_page: u64) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&user_page)
            .map(|m| m.writable)
            .unwrap_or(false)
    }

    fn frame_of(&self, user_page: u64) -> Option<u32> {
        self.table.lock().unwrap().get(&user_page).map(|m| m.frame)
    }

    fn is_dirty(&self, user_page: u64) -> bool {
        self.table
            .lock()
            .unwrap()
            .get(&user_page)
            .map(|m| m.dirty)
            .unwrap_or(false)
    }

    fn clear_dirty(&self, user_page: u64) {
        if let Some(m) = self.table.lock().unwrap().get_mut(&user_page) {
            m.dirty = false;
        }
    }

    fn mark_written(&self, user_page: u64) {
        if let Some(m) = self.table.lock().unwrap().get_mut(&user_page) {
            m.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_query() {
        let a = SimulatedAddressSpace::new();
        assert!(!a.is_present(0));
        a.map(0, 7, true);
        assert!(a.is_present(0));
        assert_eq!(a.frame_of(0), Some(7));
        assert!(a.is_writable(0));
        assert!(!a.is_dirty(0));
        a.mark_written(0);
        assert!(a.is_dirty(0));
        a.clear_dirty(0);
        assert!(!a.is_dirty(0));
        a.unmap(0);
        assert!(!a.is_present(0));
    }
}
