//! 4.C Free-sector bitmap.
//!
//! One bit per sector of the file-system partition, persisted as a file
//! whose own inode lives at the well-known sector 0. Bit 0 covers sector 0;
//! the root-directory sector and the free map's own sectors are marked
//! allocated at format time (spec §3 invariant).

use std::sync::{Arc, Mutex};

use log::debug;

use crate::cache::BufferCache;
use crate::error::{KResult, KernelError};
use crate::fs::inode::{self, InodeHandle, InodeTable};

pub const FREE_MAP_SECTOR: u32 = 0;
pub const ROOT_DIR_SECTOR: u32 = 1;

struct BitSet {
    bits: Vec<u8>,
    len: u32,
}

impl BitSet {
    fn new(len: u32) -> Self {
        Self {
            bits: vec![0u8; ((len + 7) / 8) as usize],
            len,
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

    fn all(&self, start: u32, count: u32) -> bool {
        (start..start + count).all(|i| self.get(i))
    }

    fn set_range(&mut self, start: u32, count: u32, value: bool) {
        for i in start..start + count {
            self.set(i, value);
        }
    }

    /// Scans for `count` consecutive zero bits; returns the start index.
    fn scan_zeros(&self, count: u32) -> Option<u32> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut run = 0u32;
        let mut run_start = 0u32;
        for i in 0..self.len {
            if self.get(i) {
                run = 0;
            } else {
                if run == 0 {
                    run_start = i;
                }
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    fn byte_len(&self) -> u32 {
        self.bits.len() as u32
    }
}

pub struct FreeMap {
    cache: Arc<BufferCache>,
    bits: Mutex<BitSet>,
    backing: Mutex<Option<InodeHandle>>,
    backing_table: InodeTable,
}

impl FreeMap {
    /// Formats a fresh free map for a device with `sector_count` sectors:
    /// marks the free-map and root-directory sectors used, allocates and
    /// persists the bitmap's own backing file, then leaves the free map
    /// ready for normal `allocate`/`release` traffic.
    pub fn format(cache: Arc<BufferCache>, sector_count: u32) -> KResult<Self> {
        let mut bits = BitSet::new(sector_count);
        bits.set(FREE_MAP_SECTOR, true);
        bits.set(ROOT_DIR_SECTOR, true);
        let byte_len = bits.byte_len();

        let freemap = Self {
            cache: cache.clone(),
            bits: Mutex::new(bits),
            backing: Mutex::new(None),
            backing_table: InodeTable::new(),
        };

        // `inode::create_inode` calls back into `freemap.allocate`, which is
        // harmless here because `persist` no-ops while `backing` is `None`.
        inode::create_inode(&cache, &freemap, FREE_MAP_SECTOR, byte_len as u64, false)?;

        let handle = freemap.backing_table.open(&cache, FREE_MAP_SECTOR);
        let bytes = freemap.bits.lock().unwrap().bits.clone();
        handle.write_at(&cache, &freemap, &bytes, 0)?;
        *freemap.backing.lock().unwrap() = Some(handle);
        debug!("free map formatted: {sector_count} sectors tracked");
        Ok(freemap)
    }

    /// Loads an existing free map from sector 0 of an already-formatted
    /// device.
    pub fn mount(cache: Arc<BufferCache>) -> Self {
        let backing_table = InodeTable::new();
        let handle = backing_table.open(&cache, FREE_MAP_SECTOR);
        let byte_len = handle.length();
        let mut bytes = vec![0u8; byte_len as usize];
        handle.read_at(&cache, &mut bytes, 0);
        let bits = BitSet {
            len: byte_len * 8,
            bits: bytes,
        };
        Self {
            cache,
            bits: Mutex::new(bits),
            backing: Mutex::new(Some(handle)),
            backing_table,
        }
    }

    fn persist(&self) -> KResult<()> {
        let guard = self.backing.lock().unwrap();
        if let Some(inode) = guard.as_ref() {
            let bytes = self.bits.lock().unwrap().bits.clone();
            inode.write_at(&self.cache, self, &bytes, 0)?;
        }
        Ok(())
    }

    /// Atomically scans for `count` consecutive free sectors, flips them to
    /// allocated, and persists. Rolls the flip back if persistence fails.
    pub fn allocate(&self, count: u32) -> KResult<u32> {
        let start = {
            let mut bits = self.bits.lock().unwrap();
            let start = bits.scan_zeros(count).ok_or(KernelError::DeviceFull)?;
            bits.set_range(start, count, true);
            start
        };
        if let Err(e) = self.persist() {
            self.bits.lock().unwrap().set_range(start, count, false);
            return Err(e);
        }
        Ok(start)
    }

    /// Releases `count` sectors starting at `start`. All must currently be
    /// allocated.
    pub fn release(&self, start: u32, count: u32) {
        {
            let mut bits = self.bits.lock().unwrap();
            assert!(bits.all(start, count), "releasing sectors that were not allocated");
            bits.set_range(start, count, false);
        }
        // Best-effort persistence, matching the buffer cache's write-back
        // model: failures here do not roll the release back (the sectors
        // are genuinely free; a crash before the next flush can at worst
        // redo the bitmap write at next mount, which is explicitly outside
        // this design's crash-consistency guarantees).
        let _ = self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;

    #[test]
    fn allocate_then_release_round_trips() {
        let cache = Arc::new(BufferCache::new(Arc::new(MemoryBlockDevice::new(256))));
        let freemap = FreeMap::format(cache, 256).unwrap();
        let s = freemap.allocate(3).unwrap();
        assert!(s >= ROOT_DIR_SECTOR + 1);
        freemap.release(s, 3);
        let s2 = freemap.allocate(3).unwrap();
        assert_eq!(s, s2, "freed sectors should be reused");
    }

    #[test]
    fn reserved_sectors_are_never_allocated() {
        let cache = Arc::new(BufferCache::new(Arc::new(MemoryBlockDevice::new(64))));
        let freemap = FreeMap::format(cache, 64).unwrap();
        for _ in 0..60 {
            let s = freemap.allocate(1).unwrap();
            assert_ne!(s, FREE_MAP_SECTOR);
            assert_ne!(s, ROOT_DIR_SECTOR);
        }
    }

    #[test]
    fn device_full_when_exhausted() {
        let cache = Arc::new(BufferCache::new(Arc::new(MemoryBlockDevice::new(16))));
        let freemap = FreeMap::format(cache, 16).unwrap();
        let mut allocated = vec![];
        loop {
            match freemap.allocate(1) {
                Ok(s) => allocated.push(s),
                Err(KernelError::DeviceFull) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        assert!(!allocated.is_empty());
    }
}
