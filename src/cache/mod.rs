//! 4.B Buffer cache.
//!
//! A fixed 64-slot cache of disk sectors with clock replacement and
//! write-back, guarded by a single global lock held for the entire duration
//! of every public operation (spec §4.B). At most one cache entry exists per
//! sector at any time.

use std::sync::Arc;

use log::{debug, trace};

use crate::block::{zero_sector, BlockDevice, SectorBuf, SECTOR_SIZE};
use crate::sync::Lock;

pub const CACHE_SLOTS: usize = 64;

struct CacheSlot {
    sector: u32,
    buf: SectorBuf,
    valid: bool,
    dirty: bool,
    referenced: bool,
}

impl CacheSlot {
    const fn empty() -> Self {
        Self {
            sector: 0,
            buf: zero_sector(),
            valid: false,
            dirty: false,
            referenced: false,
        }
    }
}

struct CacheState {
    slots: Vec<CacheSlot>,
    hand: usize,
}

/// 64-slot write-back cache of sectors from one `BlockDevice`.
pub struct BufferCache {
    device: Arc<dyn BlockDevice>,
    lock: Lock,
    state: std::cell::UnsafeCell<CacheState>,
}

// SAFETY: every access to `state` happens while `lock` is held (enforced by
// `BufferCache::locked`), so the interior mutability is properly
// synchronized despite `UnsafeCell` not being `Sync` on its own.
unsafe impl Sync for BufferCache {}

impl BufferCache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        slots.resize_with(CACHE_SLOTS, CacheSlot::empty);
        Self {
            device,
            lock: Lock::new(),
            state: std::cell::UnsafeCell::new(CacheState { slots, hand: 0 }),
        }
    }

    fn locked<T>(&self, body: impl FnOnce(&mut CacheState) -> T) -> T {
        self.lock.acquire();
        // SAFETY: `lock` is held for the duration of `body`.
        let state = unsafe { &mut *self.state.get() };
        let result = body(state);
        self.lock.release();
        result
    }

    /// Finds the slot holding `sector`, loading it from the device if
    /// necessary. Evicts via clock replacement (spec §4.B step 2) when every
    /// slot is occupied.
    fn slot_for(state: &mut CacheState, device: &dyn BlockDevice, sector: u32) -> usize {
        if let Some(i) = state.slots.iter().position(|s| s.valid && s.sector == sector) {
            return i;
        }
        if let Some(i) = state.slots.iter().position(|s| !s.valid) {
            Self::fill(state, device, i, sector);
            return i;
        }
        let victim = Self::clock_evict(state, device);
        Self::fill(state, device, victim, sector);
        victim
    }

    fn clock_evict(state: &mut CacheState, device: &dyn BlockDevice) -> usize {
        loop {
            let i = state.hand;
            state.hand = (state.hand + 1) % state.slots.len();
            if state.slots[i].referenced {
                state.slots[i].referenced = false;
                continue;
            }
            if state.slots[i].dirty {
                device.write(state.slots[i].sector, &state.slots[i].buf);
                trace!("cache: wrote back dirty sector {} on eviction", state.slots[i].sector);
            }
            return i;
        }
    }

    fn fill(state: &mut CacheState, device: &dyn BlockDevice, slot: usize, sector: u32) {
        let mut buf = zero_sector();
        device.read(sector, &mut buf);
        state.slots[slot] = CacheSlot {
            sector,
            buf,
            valid: true,
            dirty: false,
            referenced: false,
        };
    }

    /// Copies `nbytes` starting at `offset` within `sector` into `dst`.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize, nbytes: usize) {
        assert!(offset + nbytes <= SECTOR_SIZE);
        let device = Arc::clone(&self.device);
        self.locked(|state| {
            let i = Self::slot_for(state, device.as_ref(), sector);
            dst[..nbytes].copy_from_slice(&state.slots[i].buf[offset..offset + nbytes]);
            state.slots[i].referenced = true;
        });
    }

    /// Writes `nbytes` from `src` into `sector` at `offset`, marking the
    /// slot dirty.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize, nbytes: usize) {
        assert!(offset + nbytes <= SECTOR_SIZE);
        let device = Arc::clone(&self.device);
        self.locked(|state| {
            let i = Self::slot_for(state, device.as_ref(), sector);
            state.slots[i].buf[offset..offset + nbytes].copy_from_slice(&src[..nbytes]);
            state.slots[i].referenced = true;
            state.slots[i].dirty = true;
        });
    }

    /// Reads a full 512-byte sector.
    pub fn read_full(&self, sector: u32, dst: &mut SectorBuf) {
        self.read(sector, dst, 0, SECTOR_SIZE);
    }

    /// Writes a full 512-byte sector.
    pub fn write_full(&self, sector: u32, src: &SectorBuf) {
        self.write(sector, src, 0, SECTOR_SIZE);
    }

    /// Writes back every dirty valid slot. Called at shutdown; crash
    /// consistency beyond this best-effort flush is explicitly not
    /// guaranteed (spec Non-goals).
    pub fn flush(&self) {
        let device = Arc::clone(&self.device);
        self.locked(|state| {
            for slot in state.slots.iter_mut() {
                if slot.valid && slot.dirty {
                    device.write(slot.sector, &slot.buf);
                    slot.dirty = false;
                }
            }
        });
        debug!("buffer cache flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;

    fn cache(sectors: u32) -> BufferCache {
        BufferCache::new(Arc::new(MemoryBlockDevice::new(sectors)))
    }

    #[test]
    fn read_after_write_same_sector() {
        let cache = cache(4);
        let data = [7u8; 512];
        cache.write_full(1, &data);
        let mut out = zero_sector();
        cache.read_full(1, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn at_most_one_entry_per_sector_under_eviction_pressure() {
        let cache = cache((CACHE_SLOTS as u32) + 10);
        for s in 0..(CACHE_SLOTS as u32 + 10) {
            let mut data = zero_sector();
            data[0] = (s % 256) as u8;
            cache.write_full(s, &data);
        }
        for s in 0..(CACHE_SLOTS as u32 + 10) {
            let mut out = zero_sector();
            cache.read_full(s, &mut out);
            assert_eq!(out[0], (s % 256) as u8, "sector {s} lost its data");
        }
    }

    #[test]
    fn flush_persists_dirty_slots_to_device() {
        let device = Arc::new(MemoryBlockDevice::new(2));
        let cache = BufferCache::new(device.clone());
        let mut data = zero_sector();
        data[0] = 0xAB;
        cache.write_full(0, &data);
        cache.flush();
        let mut out = zero_sector();
        device.read(0, &mut out);
        assert_eq!(out[0], 0xAB);
    }
}
