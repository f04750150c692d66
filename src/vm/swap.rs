//! 4.G Swap area: page-sized slots over a raw block device.
//!
//! Mirrors the free-sector bitmap's allocate/release shape
//! ([`crate::fs::freemap`]) at page rather than sector granularity: one bit
//! per slot, `PAGE_SECTORS` sectors per slot.

use std::sync::{Arc, Mutex};

use crate::block::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::sync::Lock;
use crate::vm::{Page, PAGE_SECTORS, PAGE_SIZE};

struct SlotBitmap {
    bits: Vec<u8>,
    slot_count: u32,
}

impl SlotBitmap {
    fn new(slot_count: u32) -> Self {
        Self {
            bits: vec![0u8; ((slot_count + 7) / 8) as usize],
            slot_count,
        }
    }

    fn get(&self, i: u32) -> bool {
        (self.bits[(i / 8) as usize] >> (i % 8)) & 1 != 0
    }

    fn set(&mut self, i: u32, value: bool) {
        let byte = &mut self.bits[(i / 8) as usize];
        let mask = 1u8 << (i % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }

    fn first_zero(&self) -> Option<u32> {
        (0..self.slot_count).find(|&i| !self.get(i))
    }
}

/// Free-slot bitmap plus the swap partition itself, guarded by one lock
/// (spec §4.G: "protected by an internal lock").
pub struct SwapArea {
    device: Arc<dyn BlockDevice>,
    lock: Lock,
    bits: Mutex<SlotBitmap>,
}

impl SwapArea {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slot_count = device.sector_count() / PAGE_SECTORS;
        Self {
            device,
            lock: Lock::new(),
            bits: Mutex::new(SlotBitmap::new(slot_count)),
        }
    }

    /// Finds a free slot, writes `frame`'s eight sectors into it, and
    /// returns the slot index.
    pub fn swap_out(&self, frame: &Page) -> KResult<u32> {
        self.lock.acquire();
        let slot = {
            let mut bits = self.bits.lock().unwrap();
            let slot = bits.first_zero().ok_or(KernelError::SwapFull);
            if let Ok(s) = slot {
                bits.set(s, true);
            }
            slot
        };
        let slot = match slot {
            Ok(s) => s,
            Err(e) => {
                self.lock.release();
                return Err(e);
            }
        };
        let base = slot * PAGE_SECTORS;
        for i in 0..PAGE_SECTORS {
            let mut sector = [0u8; 512];
            let offset = (i as usize) * 512;
            sector.copy_from_slice(&frame[offset..offset + 512]);
            self.device.write(base + i, &sector);
        }
        self.lock.release();
        Ok(slot)
    }

    /// Reads slot `slot`'s eight sectors into `frame` and frees the slot.
    pub fn swap_in(&self, slot: u32, frame: &mut Page) {
        self.lock.acquire();
        let base = slot * PAGE_SECTORS;
        for i in 0..PAGE_SECTORS {
            let mut sector = [0u8; 512];
            self.device.read(base + i, &mut sector);
            let offset = (i as usize) * 512;
            frame[offset..offset + 512].copy_from_slice(&sector);
        }
        self.bits.lock().unwrap().set(slot, false);
        self.lock.release();
    }

    /// Clears a slot's bit without reading it back (process teardown of an
    /// `IN_SWAP` page that is never faulted back in).
    pub fn swap_free(&self, slot: u32) {
        self.lock.acquire();
        self.bits.lock().unwrap().set(slot, false);
        self.lock.release();
    }
}

const _: () = assert!(PAGE_SIZE % 512 == 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;

    fn area(slots: u32) -> SwapArea {
        SwapArea::new(Arc::new(MemoryBlockDevice::new(slots * PAGE_SECTORS)))
    }

    #[test]
    fn out_then_in_round_trips() {
        let swap = area(4);
        let mut frame = [0xABu8; PAGE_SIZE];
        let slot = swap.swap_out(&frame).unwrap();
        frame = [0u8; PAGE_SIZE];
        swap.swap_in(slot, &mut frame);
        assert!(frame.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn slots_are_reused_after_free() {
        let swap = area(1);
        let frame = [1u8; PAGE_SIZE];
        let slot = swap.swap_out(&frame).unwrap();
        assert_eq!(swap.swap_out(&frame).unwrap_err(), KernelError::SwapFull);
        swap.swap_free(slot);
        assert_eq!(swap.swap_out(&frame).unwrap(), slot);
    }
}
