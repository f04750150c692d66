//! 4.D Inode layer.
//!
//! On-disk indexed inode (direct + indirect + doubly-indirect), file growth,
//! and the in-memory inode with reader/writer synchronization.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use zerocopy::{AsBytes, FromBytes};

use crate::block::SECTOR_SIZE;
use crate::cache::BufferCache;
use crate::error::{KResult, KernelError};
use crate::fs::freemap::FreeMap;
use crate::sync::{Lock, RwGate};

pub const DIRECT_COUNT: usize = 123;
pub const PTRS_PER_BLOCK: usize = 128;
pub const MAX_FILE_SECTORS: usize = DIRECT_COUNT + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK;
pub const MAX_FILE_LENGTH: u64 = (MAX_FILE_SECTORS as u64) * (SECTOR_SIZE as u64);
pub const INODE_MAGIC: u32 = 0x494e_4f44;

static_assertions::const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

/// The fixed 512-byte on-disk inode record (spec §3/§6).
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
pub struct DiskInode {
    pub direct: [u32; DIRECT_COUNT],
    pub indirect: u32,
    pub doubly_indirect: u32,
    pub length: u32,
    pub magic: u32,
    pub is_dir: u32,
}

impl DiskInode {
    pub fn empty(is_dir: bool) -> Self {
        Self {
            direct: [0; DIRECT_COUNT],
            indirect: 0,
            doubly_indirect: 0,
            length: 0,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn length(&self) -> u64 {
        self.length as u64
    }

    fn sector_count_for(length: u64) -> usize {
        ((length + SECTOR_SIZE as u64 - 1) / SECTOR_SIZE as u64) as usize
    }

    fn read_ptr(cache: &BufferCache, block_sector: u32, slot: usize) -> u32 {
        let mut raw = [0u8; 4];
        cache.read(block_sector, &mut raw, slot * 4, 4);
        u32::from_le_bytes(raw)
    }

    fn write_ptr(cache: &BufferCache, block_sector: u32, slot: usize, value: u32) {
        cache.write(block_sector, &value.to_le_bytes(), slot * 4, 4);
    }

    /// Position-to-sector mapping for byte offset `pos` (spec §4.D). Returns
    /// `None` if `pos` is beyond the inode's current length or the sector
    /// was never allocated.
    pub fn byte_to_sector(&self, cache: &BufferCache, pos: u64) -> Option<u32> {
        if pos >= self.length() {
            return None;
        }
        self.sector_at(cache, (pos / SECTOR_SIZE as u64) as usize)
    }

    fn sector_at(&self, cache: &BufferCache, s: usize) -> Option<u32> {
        if s < DIRECT_COUNT {
            return non_zero(self.direct[s]);
        }
        if s < DIRECT_COUNT + PTRS_PER_BLOCK {
            if self.indirect == 0 {
                return None;
            }
            return non_zero(Self::read_ptr(cache, self.indirect, s - DIRECT_COUNT));
        }
        let s2 = s - DIRECT_COUNT - PTRS_PER_BLOCK;
        let first = s2 / PTRS_PER_BLOCK;
        let second = s2 % PTRS_PER_BLOCK;
        if self.doubly_indirect == 0 {
            return None;
        }
        let l1 = non_zero(Self::read_ptr(cache, self.doubly_indirect, first))?;
        non_zero(Self::read_ptr(cache, l1, second))
    }

    fn alloc_zeroed_sector(cache: &BufferCache, freemap: &FreeMap) -> KResult<u32> {
        let sector = freemap.allocate(1)?;
        cache.write_full(sector, &crate::block::zero_sector());
        Ok(sector)
    }

    /// Ensures the data sector backing file-relative sector index `s`
    /// exists, allocating it (and any pointer blocks on the path to it) on
    /// demand. Sectors and pointer blocks are zero-filled through the
    /// buffer cache when first allocated (spec §4.D "Growth").
    fn ensure_sector(&mut self, cache: &BufferCache, freemap: &FreeMap, s: usize) -> KResult<()> {
        if s < DIRECT_COUNT {
            if self.direct[s] == 0 {
                self.direct[s] = Self::alloc_zeroed_sector(cache, freemap)?;
            }
            return Ok(());
        }
        if s < DIRECT_COUNT + PTRS_PER_BLOCK {
            if self.indirect == 0 {
                self.indirect = Self::alloc_zeroed_sector(cache, freemap)?;
            }
            let slot = s - DIRECT_COUNT;
            if Self::read_ptr(cache, self.indirect, slot) == 0 {
                let data = Self::alloc_zeroed_sector(cache, freemap)?;
                Self::write_ptr(cache, self.indirect, slot, data);
            }
            return Ok(());
        }
        let s2 = s - DIRECT_COUNT - PTRS_PER_BLOCK;
        let first = s2 / PTRS_PER_BLOCK;
        let second = s2 % PTRS_PER_BLOCK;
        if self.doubly_indirect == 0 {
            self.doubly_indirect = Self::alloc_zeroed_sector(cache, freemap)?;
        }
        let mut l1 = Self::read_ptr(cache, self.doubly_indirect, first);
        if l1 == 0 {
            l1 = Self::alloc_zeroed_sector(cache, freemap)?;
            Self::write_ptr(cache, self.doubly_indirect, first, l1);
        }
        if Self::read_ptr(cache, l1, second) == 0 {
            let data = Self::alloc_zeroed_sector(cache, freemap)?;
            Self::write_ptr(cache, l1, second, data);
        }
        Ok(())
    }

    /// Grows the file to `new_length` bytes, allocating every missing
    /// sector along the way. Length can only increase (spec invariant).
    pub fn set_file_length(
        &mut self,
        cache: &BufferCache,
        freemap: &FreeMap,
        new_length: u64,
    ) -> KResult<()> {
        if new_length > MAX_FILE_LENGTH {
            return Err(KernelError::FileTooLarge);
        }
        assert!(new_length >= self.length(), "inode length can only grow");
        let old_sectors = Self::sector_count_for(self.length());
        let new_sectors = Self::sector_count_for(new_length);
        for s in old_sectors..new_sectors {
            // Partial failures here leak the sectors allocated so far: a
            // known hazard, not rolled back (spec §9 open question).
            self.ensure_sector(cache, freemap, s)?;
        }
        self.length = new_length as u32;
        Ok(())
    }

    /// Walks every allocated data sector and pointer block, releasing them
    /// all back to the free map. Used when an inode is deleted.
    pub fn release_all_blocks(&self, cache: &BufferCache, freemap: &FreeMap) {
        let sectors = Self::sector_count_for(self.length());
        for s in 0..sectors.min(DIRECT_COUNT) {
            if let Some(p) = non_zero(self.direct[s]) {
                freemap.release(p, 1);
            }
        }
        if self.indirect != 0 {
            let count = sectors.saturating_sub(DIRECT_COUNT).min(PTRS_PER_BLOCK);
            for slot in 0..count {
                if let Some(p) = non_zero(Self::read_ptr(cache, self.indirect, slot)) {
                    freemap.release(p, 1);
                }
            }
            freemap.release(self.indirect, 1);
        }
        if self.doubly_indirect != 0 {
            let remaining = sectors.saturating_sub(DIRECT_COUNT + PTRS_PER_BLOCK);
            let l1_count = (remaining + PTRS_PER_BLOCK - 1) / PTRS_PER_BLOCK;
            for first in 0..l1_count.min(PTRS_PER_BLOCK) {
                if let Some(l1) = non_zero(Self::read_ptr(cache, self.doubly_indirect, first)) {
                    let this_block_count = if first + 1 == l1_count {
                        remaining - first * PTRS_PER_BLOCK
                    } else {
                        PTRS_PER_BLOCK
                    };
                    for second in 0..this_block_count.min(PTRS_PER_BLOCK) {
                        if let Some(p) = non_zero(Self::read_ptr(cache, l1, second)) {
                            freemap.release(p, 1);
                        }
                    }
                    freemap.release(l1, 1);
                }
            }
            freemap.release(self.doubly_indirect, 1);
        }
    }
}

fn non_zero(v: u32) -> Option<u32> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

/// The canonical in-memory record for an open inode: at most one exists per
/// sector at any time (spec invariant, §8).
pub struct InMemoryInode {
    pub sector: u32,
    open_count: Mutex<u32>,
    pub removed: AtomicBool,
    deny_write_count: Mutex<u32>,
    gate: RwGate<DiskInode>,
}

impl InMemoryInode {
    pub fn disk_snapshot(&self) -> DiskInode {
        *self.gate.read()
    }

    pub fn is_dir(&self) -> bool {
        self.gate.read().is_dir()
    }

    pub fn length(&self) -> u64 {
        self.gate.read().length()
    }

    pub fn open_count(&self) -> u32 {
        *self.open_count.lock().unwrap()
    }

    /// Reads `buf.len()` bytes (or fewer, at EOF) starting at `offset`.
    /// Takes the reader role (spec §4.D).
    pub fn read_at(&self, cache: &BufferCache, buf: &mut [u8], offset: u64) -> usize {
        let disk = self.gate.read();
        let mut done = 0usize;
        let mut pos = offset;
        while done < buf.len() {
            let Some(sector) = disk.byte_to_sector(cache, pos) else {
                break;
            };
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let avail_in_sector = SECTOR_SIZE - sector_ofs;
            let avail_in_file = (disk.length() - pos) as usize;
            let chunk = (buf.len() - done).min(avail_in_sector).min(avail_in_file);
            if chunk == 0 {
                break;
            }
            cache.read(sector, &mut buf[done..done + chunk], sector_ofs, chunk);
            done += chunk;
            pos += chunk as u64;
        }
        done
    }

    /// Writes `buf` at `offset`, growing the file first if the write would
    /// extend past the current length. Returns 0 while deny-write is in
    /// effect (spec §4.D). Takes the writer role.
    pub fn write_at(
        &self,
        cache: &BufferCache,
        freemap: &FreeMap,
        buf: &[u8],
        offset: u64,
    ) -> KResult<usize> {
        if *self.deny_write_count.lock().unwrap() > 0 {
            return Ok(0);
        }
        let mut disk = self.gate.write();
        let end = offset + buf.len() as u64;
        if end > disk.length() {
            disk.set_file_length(cache, freemap, end)?;
            write_raw(cache, self.sector, &disk);
        }
        let mut done = 0usize;
        let mut pos = offset;
        while done < buf.len() {
            let sector = disk
                .byte_to_sector(cache, pos)
                .expect("sector must exist after growth");
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let avail_in_sector = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - done).min(avail_in_sector);
            cache.write(sector, &buf[done..done + chunk], sector_ofs, chunk);
            done += chunk;
            pos += chunk as u64;
        }
        Ok(done)
    }

    /// Grows (or, at create time, sets) the inode's length directly, then
    /// persists the updated header: without this, the next `InodeTable::open`
    /// of this sector (after this handle's `open_count` drops to zero) would
    /// read back the pre-growth bytes straight off disk.
    pub fn set_length(&self, cache: &BufferCache, freemap: &FreeMap, new_length: u64) -> KResult<()> {
        let mut disk = self.gate.write();
        disk.set_file_length(cache, freemap, new_length)?;
        write_raw(cache, self.sector, &disk);
        Ok(())
    }

    pub fn deny_write(&self) {
        let mut count = self.deny_write_count.lock().unwrap();
        *count += 1;
    }

    pub fn allow_write(&self) {
        let mut count = self.deny_write_count.lock().unwrap();
        assert!(*count > 0, "allow_write without matching deny_write");
        *count -= 1;
    }
}

/// The process-wide table of open inodes: an arena keyed by sector rather
/// than raw pointers (spec §9 "cyclic references"), so directory and file
/// handles hold a sector number plus a reopen count instead of chasing
/// pointers.
pub struct InodeTable {
    // Reader/writer resource per spec: lookups read-lock, insertions and
    // removals write-lock.
    open: RwGate<HashMap<u32, Arc<InMemoryInode>>>,
    // Per-sector instantiation lock: a leaf taken while holding `open`, so
    // two threads never race to build two records for the same sector.
    instantiate_locks: Mutex<HashMap<u32, Arc<Lock>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            open: RwGate::new(HashMap::new()),
            instantiate_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for_sector(&self, sector: u32) -> Arc<Lock> {
        let mut locks = self.instantiate_locks.lock().unwrap();
        locks
            .entry(sector)
            .or_insert_with(|| Arc::new(Lock::new()))
            .clone()
    }

    /// Returns the canonical in-memory inode for `sector`, instantiating it
    /// on first reference and bumping `open_count` on every call.
    pub fn open(&self, cache: &BufferCache, sector: u32) -> Arc<InMemoryInode> {
        let per_sector = self.lock_for_sector(sector);
        per_sector.acquire();
        let result = {
            let existing = self.open.read();
            existing.get(&sector).cloned()
        };
        let inode = if let Some(inode) = result {
            *inode.open_count.lock().unwrap() += 1;
            inode
        } else {
            let mut buf = crate::block::zero_sector();
            cache.read_full(sector, &mut buf);
            let disk = DiskInode::read_from(&buf[..]).expect("sector-sized buffer");
            assert_eq!(disk.magic, INODE_MAGIC, "bad inode magic at sector {sector}");
            let inode = Arc::new(InMemoryInode {
                sector,
                open_count: Mutex::new(1),
                removed: AtomicBool::new(false),
                deny_write_count: Mutex::new(0),
                gate: RwGate::new(disk),
            });
            self.open.write().insert(sector, inode.clone());
            inode
        };
        per_sector.release();
        inode
    }

    /// Decrements `open_count`; when it reaches zero, removes the inode
    /// from the table, and if it was also `removed`, frees its blocks.
    pub fn close(&self, cache: &BufferCache, freemap: &FreeMap, inode: &Arc<InMemoryInode>) {
        let per_sector = self.lock_for_sector(inode.sector);
        per_sector.acquire();
        let mut count = inode.open_count.lock().unwrap();
        *count -= 1;
        let should_destroy = *count == 0;
        drop(count);
        if should_destroy {
            self.open.write().remove(&inode.sector);
            if inode.removed.load(Ordering::SeqCst) {
                let disk = inode.disk_snapshot();
                disk.release_all_blocks(cache, freemap);
                freemap.release(inode.sector, 1);
            }
        }
        per_sector.release();
    }

    pub fn mark_removed(&self, inode: &InMemoryInode) {
        inode.removed.store(true, Ordering::SeqCst);
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates a fresh inode at `sector` with the given initial `length` and
/// `is_dir` flag (spec §4.D "Create").
pub fn create_inode(
    cache: &BufferCache,
    freemap: &FreeMap,
    sector: u32,
    length: u64,
    is_dir: bool,
) -> KResult<()> {
    let mut disk = DiskInode::empty(is_dir);
    disk.set_file_length(cache, freemap, length)?;
    let mut buf = crate::block::zero_sector();
    buf.copy_from_slice(disk.as_bytes());
    cache.write_full(sector, &buf);
    Ok(())
}

pub fn write_raw(cache: &BufferCache, sector: u32, disk: &DiskInode) {
    let mut buf = crate::block::zero_sector();
    buf.copy_from_slice(disk.as_bytes());
    cache.write_full(sector, &buf);
}

pub type InodeHandle = Arc<InMemoryInode>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;
    use std::sync::Arc as StdArc;

    fn setup(sectors: u32) -> (StdArc<BufferCache>, FreeMap) {
        let cache = StdArc::new(BufferCache::new(StdArc::new(MemoryBlockDevice::new(sectors))));
        let freemap = FreeMap::format(cache.clone(), sectors).unwrap();
        (cache, freemap)
    }

    #[test]
    fn grow_and_read_back_pattern() {
        let (cache, freemap) = setup(4096);
        let sector = freemap.allocate(1).unwrap();
        create_inode(&cache, &freemap, sector, 0, false).unwrap();
        let table = InodeTable::new();
        let inode = table.open(&cache, sector);
        let pattern = vec![0xAB; 10_000];
        let written = inode.write_at(&cache, &freemap, &pattern, 0).unwrap();
        assert_eq!(written, pattern.len());
        let mut out = vec![0u8; pattern.len()];
        let read = inode.read_at(&cache, &mut out, 0);
        assert_eq!(read, pattern.len());
        assert_eq!(out, pattern);
    }

    #[test]
    fn deny_write_blocks_writes() {
        let (cache, freemap) = setup(4096);
        let sector = freemap.allocate(1).unwrap();
        create_inode(&cache, &freemap, sector, 0, false).unwrap();
        let table = InodeTable::new();
        let inode = table.open(&cache, sector);
        inode.deny_write();
        let n = inode.write_at(&cache, &freemap, b"hello", 0).unwrap();
        assert_eq!(n, 0);
        inode.allow_write();
        let n = inode.write_at(&cache, &freemap, b"hello", 0).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn opening_same_sector_twice_shares_one_record() {
        let (cache, freemap) = setup(4096);
        let sector = freemap.allocate(1).unwrap();
        create_inode(&cache, &freemap, sector, 0, false).unwrap();
        let table = InodeTable::new();
        let a = table.open(&cache, sector);
        let b = table.open(&cache, sector);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);
    }

    #[test]
    fn file_grows_past_direct_blocks_into_indirect_and_doubly_indirect() {
        let (cache, freemap) = setup(20_000);
        let sector = freemap.allocate(1).unwrap();
        create_inode(&cache, &freemap, sector, 0, false).unwrap();
        let table = InodeTable::new();
        let inode = table.open(&cache, sector);
        // past DIRECT_COUNT(123) + PTRS_PER_BLOCK(128) sectors => into doubly indirect
        let big_len = (DIRECT_COUNT + PTRS_PER_BLOCK + 5) * SECTOR_SIZE;
        let data = vec![0x42u8; big_len];
        let written = inode.write_at(&cache, &freemap, &data, 0).unwrap();
        assert_eq!(written, big_len);
        let mut out = vec![0u8; big_len];
        inode.read_at(&cache, &mut out, 0);
        assert_eq!(out, data);
    }
}
