//! 4.H Frame table and eviction.
//!
//! A system-wide table of user-pool frames. Physical memory itself is out
//! of scope (spec §1 treats the allocator for raw pages as part of the
//! external kernel_builder-style collaborator in the teacher's design); here
//! each table slot owns its page's bytes directly, since this crate has no
//! separate physical allocator to borrow pages from.

use std::sync::Arc;

use log::{debug, trace};

use crate::sync::Lock;
use crate::vm::swap::SwapArea;
use crate::vm::{zero_page, Page};

/// Callback surface a frame's owner must provide so eviction can rewrite
/// that owner's supplemental page table and address space (spec §4.H:
/// "every supplemental-page entry that references that frame is rewritten
/// to IN_SWAP... the page-table entry mapping is cleared").
pub trait VmOwner: Send + Sync {
    fn on_evicted(&self, user_page: u64, slot: u32);
    fn is_dirty(&self, user_page: u64) -> bool;
    fn clear_dirty(&self, user_page: u64);
}

struct FrameEntry {
    owner: Arc<dyn VmOwner>,
    user_page: u64,
    pin_count: u32,
    settling: bool,
    data: Box<Page>,
}

struct FrameTableState {
    frames: Vec<Option<FrameEntry>>,
    lcg_next: u32,
}

impl FrameTableState {
    /// `next = next*1103515245 + 12345`, matching the reference
    /// implementation's eviction candidate generator exactly.
    fn next_candidate(&mut self) -> usize {
        self.lcg_next = self
            .lcg_next
            .wrapping_mul(1103515245)
            .wrapping_add(12345);
        (self.lcg_next as usize) % self.frames.len()
    }
}

/// A system-wide set of allocated user frames (spec §4.H), guarded by one
/// lock covering both the free/in-use bookkeeping and the eviction scan.
pub struct FrameTable {
    swap: Arc<SwapArea>,
    lock: Lock,
    state: std::cell::UnsafeCell<FrameTableState>,
}

// SAFETY: every access to `state` happens with `lock` held.
unsafe impl Sync for FrameTable {}

impl FrameTable {
    pub fn new(swap: Arc<SwapArea>, capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        frames.resize_with(capacity, || None);
        Self {
            swap,
            lock: Lock::new(),
            state: std::cell::UnsafeCell::new(FrameTableState { frames, lcg_next: 1 }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut FrameTableState {
        // SAFETY: callers hold `self.lock`.
        unsafe { &mut *self.state.get() }
    }

    pub fn capacity(&self) -> usize {
        // SAFETY: length never changes after construction; reading this
        // without the lock is fine since it's never written to.
        unsafe { (*self.state.get()).frames.len() }
    }

    /// Allocates a frame for `owner`'s `user_page`, evicting one if the
    /// table is full. Returns the frame index with `pin_count == 0` and
    /// `settling == true`; the caller must call `finish_settling` once the
    /// content is valid and the owner's mapping installed.
    pub fn alloc(&self, owner: Arc<dyn VmOwner>, user_page: u64) -> u32 {
        self.lock.acquire();
        let index = {
            let state = self.state_mut();
            let free = state.frames.iter().position(|f| f.is_none());
            match free {
                Some(i) => i,
                None => self.evict_locked(),
            }
        };
        self.state_mut().frames[index] = Some(FrameEntry {
            owner,
            user_page,
            pin_count: 0,
            settling: true,
            data: Box::new(zero_page()),
        });
        self.lock.release();
        trace!("frame {index} allocated");
        index as u32
    }

    /// Caller must already hold `self.lock`. Picks a random non-pinned,
    /// non-settling frame, writes it to swap, notifies its owner, and
    /// returns the now-empty slot index.
    fn evict_locked(&self) -> usize {
        let state = self.state_mut();
        let capacity = state.frames.len();
        let mut victim = None;
        for _ in 0..capacity.max(1) * 64 {
            let candidate = state.next_candidate();
            if let Some(entry) = &state.frames[candidate] {
                if entry.pin_count == 0 && !entry.settling {
                    victim = Some(candidate);
                    break;
                }
            }
        }
        let victim = victim.expect("no evictable frame: every frame is pinned or settling");

        let entry = state.frames[victim].take().expect("victim slot must be occupied");
        let dirty = entry.owner.is_dirty(entry.user_page);
        let _ = dirty; // the dirty bit only matters for IN_FILE mmap pages, handled by the SPT on mark_swapped.
        let slot = self.swap.swap_out(&entry.data).expect("swap device exhausted");
        entry.owner.clear_dirty(entry.user_page);
        entry.owner.on_evicted(entry.user_page, slot);
        debug!("evicted frame {victim} (user page {:#x}) to swap slot {slot}", entry.user_page);
        victim
    }

    pub fn finish_settling(&self, frame: u32) {
        self.lock.acquire();
        self.state_mut().frames[frame as usize]
            .as_mut()
            .expect("finish_settling on empty frame")
            .settling = false;
        self.lock.release();
    }

    pub fn pin(&self, frame: u32) {
        self.lock.acquire();
        self.state_mut().frames[frame as usize]
            .as_mut()
            .expect("pin of empty frame")
            .pin_count += 1;
        self.lock.release();
    }

    pub fn unpin(&self, frame: u32) {
        self.lock.acquire();
        let entry = self.state_mut().frames[frame as usize]
            .as_mut()
            .expect("unpin of empty frame");
        assert!(entry.pin_count > 0, "unbalanced unpin");
        entry.pin_count -= 1;
        self.lock.release();
    }

    pub fn read(&self, frame: u32) -> Page {
        self.lock.acquire();
        let data = *self.state_mut().frames[frame as usize]
            .as_ref()
            .expect("read of empty frame")
            .data;
        self.lock.release();
        data
    }

    pub fn write(&self, frame: u32, bytes: &Page) {
        self.lock.acquire();
        *self.state_mut().frames[frame as usize]
            .as_mut()
            .expect("write to empty frame")
            .data = *bytes;
        self.lock.release();
    }

    /// Releases a frame outright (process teardown of an `IN_FRAME` page,
    /// spec §4.I `destroy`).
    pub fn free(&self, frame: u32) {
        self.lock.acquire();
        self.state_mut().frames[frame as usize] = None;
        self.lock.release();
    }

    /// `true` iff `frame`'s pin count is zero and it is not settling —
    /// i.e. it is a candidate for eviction (spec §3 frame invariant).
    pub fn is_evictable(&self, frame: u32) -> bool {
        self.lock.acquire();
        let result = self.state_mut().frames[frame as usize]
            .as_ref()
            .map(|e| e.pin_count == 0 && !e.settling)
            .unwrap_or(false);
        self.lock.release();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;
    use std::sync::Mutex;

    struct RecordingOwner {
        events: Mutex<Vec<(u64, u32)>>,
    }

    impl VmOwner for RecordingOwner {
        fn on_evicted(&self, user_page: u64, slot: u32) {
            self.events.lock().unwrap().push((user_page, slot));
        }
        fn is_dirty(&self, _user_page: u64) -> bool {
            false
        }
        fn clear_dirty(&self, _user_page: u64) {}
    }

    fn table(capacity: usize) -> FrameTable {
        let swap = Arc::new(SwapArea::new(Arc::new(MemoryBlockDevice::new(
            (capacity as u32 + 4) * crate::vm::PAGE_SECTORS,
        ))));
        FrameTable::new(swap, capacity)
    }

    #[test]
    fn alloc_finish_pin_unpin_round_trip() {
        let ft = table(4);
        let owner: Arc<dyn VmOwner> = Arc::new(RecordingOwner { events: Mutex::new(vec![]) });
        let f = ft.alloc(owner, 0x1000);
        assert!(!ft.is_evictable(f));
        ft.finish_settling(f);
        assert!(ft.is_evictable(f));
        ft.pin(f);
        assert!(!ft.is_evictable(f));
        ft.unpin(f);
        assert!(ft.is_evictable(f));
    }

    #[test]
    fn eviction_frees_a_slot_and_notifies_owner() {
        let ft = table(2);
        let owner = Arc::new(RecordingOwner { events: Mutex::new(vec![]) });
        let dyn_owner: Arc<dyn VmOwner> = owner.clone();
        let f0 = ft.alloc(dyn_owner.clone(), 0);
        ft.finish_settling(f0);
        let f1 = ft.alloc(dyn_owner.clone(), 0x1000);
        ft.finish_settling(f1);
        // Table is full; a third alloc must evict one of the two.
        let f2 = ft.alloc(dyn_owner, 0x2000);
        ft.finish_settling(f2);
        assert_eq!(owner.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn pinned_frames_are_never_chosen_for_eviction() {
        let ft = table(2);
        let owner = Arc::new(RecordingOwner { events: Mutex::new(vec![]) });
        let dyn_owner: Arc<dyn VmOwner> = owner.clone();
        let pinned = ft.alloc(dyn_owner.clone(), 0);
        ft.finish_settling(pinned);
        ft.pin(pinned);
        let other = ft.alloc(dyn_owner.clone(), 0x1000);
        ft.finish_settling(other);
        let _third = ft.alloc(dyn_owner, 0x2000);
        let evicted_pages: Vec<u64> = owner.events.lock().unwrap().iter().map(|(p, _)| *p).collect();
        assert!(!evicted_pages.contains(&0), "pinned frame must not be evicted");
    }
}
