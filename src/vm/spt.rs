//! 4.I Supplemental page table: per-process map from user page to a
//! resident/swapped/file-backed descriptor.

use std::collections::HashMap;

use crate::fs::inode::InodeHandle;
use crate::sync::Lock;
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapArea;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageState {
    InFrame,
    InSwap,
    InFile,
}

struct Entry {
    state: PageState,
    writable: bool,
    kernel_page: Option<u32>,
    swap_slot: Option<u32>,
    file: Option<InodeHandle>,
    file_offset: Option<u64>,
    read_bytes: Option<u32>,
    zero_bytes: Option<u32>,
    /// `true` for a real mmap mapping (write back on teardown); `false` for
    /// a lazily loaded executable segment (discarded on teardown, since the
    /// executable file itself is the source of truth).
    is_mmap: bool,
}

/// A read-only snapshot of one entry, returned by `lookup` (spec §4.I).
pub struct SptLookup {
    pub state: PageState,
    pub writable: bool,
    pub kernel_page: Option<u32>,
    pub swap_slot: Option<u32>,
    pub file: Option<InodeHandle>,
    pub file_offset: Option<u64>,
    pub read_bytes: Option<u32>,
    pub zero_bytes: Option<u32>,
}

pub struct Spt {
    lock: Lock,
    entries: std::cell::UnsafeCell<HashMap<u64, Entry>>,
}

// SAFETY: every access to `entries` happens with `lock` held.
unsafe impl Sync for Spt {}

impl Default for Spt {
    fn default() -> Self {
        Self::new()
    }
}

impl Spt {
    pub fn new() -> Self {
        Self {
            lock: Lock::new(),
            entries: std::cell::UnsafeCell::new(HashMap::new()),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn map_mut(&self) -> &mut HashMap<u64, Entry> {
        // SAFETY: callers hold `self.lock`.
        unsafe { &mut *self.entries.get() }
    }

    /// Inserts a fresh `IN_FRAME` entry.
    pub fn install_in_frame(&self, user_page: u64, kernel_page: u32, writable: bool) {
        self.lock.acquire();
        self.map_mut().insert(
            user_page,
            Entry {
                state: PageState::InFrame,
                writable,
                kernel_page: Some(kernel_page),
                swap_slot: None,
                file: None,
                file_offset: None,
                read_bytes: None,
                zero_bytes: None,
                is_mmap: false,
            },
        );
        self.lock.release();
    }

    /// Updates an existing entry to `IN_FRAME` (after a swap-in or file
    /// load resolves a fault). For an mmap page, `file`/`file_offset`/
    /// `read_bytes` are carried over rather than cleared: `destroy` and
    /// `munmap` need them to write a dirty resident page back to its file,
    /// and for an mmap mapping they stay meaningful (which file/offset this
    /// frame's content belongs to) even once the page is resident, unlike a
    /// plain IN_FRAME page's now-stale backing location.
    pub fn set_in_frame(&self, user_page: u64, kernel_page: u32, writable: bool) {
        self.lock.acquire();
        let map = self.map_mut();
        let previous = map.get(&user_page);
        let is_mmap = previous.map(|e| e.is_mmap).unwrap_or(false);
        let (file, file_offset, read_bytes) = if is_mmap {
            previous
                .map(|e| (e.file.clone(), e.file_offset, e.read_bytes))
                .unwrap_or((None, None, None))
        } else {
            (None, None, None)
        };
        map.insert(
            user_page,
            Entry {
                state: PageState::InFrame,
                writable,
                kernel_page: Some(kernel_page),
                swap_slot: None,
                file,
                file_offset,
                read_bytes,
                zero_bytes: None,
                is_mmap,
            },
        );
        self.lock.release();
    }

    #[allow(clippy::too_many_arguments)]
    pub fn install_in_file(
        &self,
        user_page: u64,
        file: InodeHandle,
        offset: u64,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
        is_mmap: bool,
    ) {
        self.lock.acquire();
        self.map_mut().insert(
            user_page,
            Entry {
                state: PageState::InFile,
                writable,
                kernel_page: None,
                swap_slot: None,
                file: Some(file),
                file_offset: Some(offset),
                read_bytes: Some(read_bytes),
                zero_bytes: Some(zero_bytes),
                is_mmap,
            },
        );
        self.lock.release();
    }

    /// Called after the frame table evicts this page: rewrites the entry
    /// to `IN_SWAP` with the slot it was written to.
    pub fn mark_swapped(&self, user_page: u64, slot: u32) {
        self.lock.acquire();
        if let Some(e) = self.map_mut().get_mut(&user_page) {
            e.state = PageState::InSwap;
            e.kernel_page = None;
            e.swap_slot = Some(slot);
        }
        self.lock.release();
    }

    pub fn lookup(&self, user_page: u64) -> Option<SptLookup> {
        self.lock.acquire();
        let result = self.map_mut().get(&user_page).map(|e| SptLookup {
            state: e.state,
            writable: e.writable,
            kernel_page: e.kernel_page,
            swap_slot: e.swap_slot,
            file: e.file.clone(),
            file_offset: e.file_offset,
            read_bytes: e.read_bytes,
            zero_bytes: e.zero_bytes,
        });
        self.lock.release();
        result
    }

    pub fn is_mmap(&self, user_page: u64) -> bool {
        self.lock.acquire();
        let result = self.map_mut().get(&user_page).map(|e| e.is_mmap).unwrap_or(false);
        self.lock.release();
        result
    }

    pub fn remove(&self, user_page: u64) {
        self.lock.acquire();
        self.map_mut().remove(&user_page);
        self.lock.release();
    }

    /// Tears down every entry at process exit: frees frames, frees swap
    /// slots, and writes back dirty mmap pages (spec §4.I `destroy`).
    /// `writeback` is called once per dirty `IN_FILE` mmap page still
    /// resident, with its kernel page and target file/offset.
    pub fn destroy(
        &self,
        frame_table: &FrameTable,
        swap: &SwapArea,
        mut writeback: impl FnMut(u32, &InodeHandle, u64, u32),
    ) {
        self.lock.acquire();
        let entries = std::mem::take(self.map_mut());
        self.lock.release();
        for (_, e) in entries {
            match e.state {
                PageState::InFrame => {
                    if e.is_mmap {
                        if let (Some(kp), Some(file), Some(offset), Some(read_bytes)) =
                            (e.kernel_page, e.file.as_ref(), e.file_offset, e.read_bytes)
                        {
                            writeback(kp, file, offset, read_bytes);
                        }
                    }
                    if let Some(kp) = e.kernel_page {
                        frame_table.free(kp);
                    }
                }
                PageState::InSwap => {
                    if let Some(slot) = e.swap_slot {
                        swap.swap_free(slot);
                    }
                }
                PageState::InFile => {
                    // Never faulted in; nothing resident to release.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_lookup_in_frame() {
        let spt = Spt::new();
        spt.install_in_frame(0x1000, 3, true);
        let e = spt.lookup(0x1000).unwrap();
        assert_eq!(e.state, PageState::InFrame);
        assert_eq!(e.kernel_page, Some(3));
        assert!(e.writable);
    }

    #[test]
    fn mark_swapped_transitions_state() {
        let spt = Spt::new();
        spt.install_in_frame(0x2000, 5, true);
        spt.mark_swapped(0x2000, 9);
        let e = spt.lookup(0x2000).unwrap();
        assert_eq!(e.state, PageState::InSwap);
        assert_eq!(e.swap_slot, Some(9));
        assert_eq!(e.kernel_page, None);
    }

    #[test]
    fn missing_entry_looks_up_as_none() {
        let spt = Spt::new();
        assert!(spt.lookup(0xdead).is_none());
    }
}
