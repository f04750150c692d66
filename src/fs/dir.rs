//! 4.E Directory layer.
//!
//! A directory is a file whose content is an array of fixed-size directory
//! entries, with entry index 0 reserved for the parent back-pointer.

use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufferCache;
use crate::error::{KResult, KernelError};
use crate::fs::freemap::FreeMap;
use crate::fs::inode::{self, InodeHandle, InodeTable};

pub const NAME_MAX: usize = 14;
const ENTRY_SIZE: usize = 4 + (NAME_MAX + 1) + 1;
static_assertions::const_assert_eq!(ENTRY_SIZE, 20);

/// `{inode_sector, name[≤14+NUL], in_use}` packed to 20 bytes (spec §6).
#[repr(C)]
#[derive(Clone, Copy, FromBytes, AsBytes)]
struct RawEntry {
    inode_sector: u32,
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

impl RawEntry {
    fn empty() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name.as_bytes());
    }
}

fn validate_name(name: &str) -> KResult<()> {
    if name.is_empty() {
        return Err(KernelError::NameEmpty);
    }
    if name.len() > NAME_MAX {
        return Err(KernelError::NameTooLong);
    }
    Ok(())
}

/// Handle to an open directory: its backing inode plus the shared tables
/// needed to look up and mutate entries.
pub struct Directory {
    pub inode: InodeHandle,
}

impl Directory {
    pub fn new(inode: InodeHandle) -> Self {
        Self { inode }
    }

    fn entry_count(&self) -> usize {
        (self.inode.length() as usize) / ENTRY_SIZE
    }

    fn read_entry(&self, cache: &BufferCache, index: usize) -> RawEntry {
        let mut buf = [0u8; ENTRY_SIZE];
        self.inode.read_at(cache, &mut buf, (index * ENTRY_SIZE) as u64);
        RawEntry::read_from(&buf[..]).expect("entry-sized buffer")
    }

    fn write_entry(&self, cache: &BufferCache, freemap: &FreeMap, index: usize, entry: &RawEntry) -> KResult<()> {
        self.inode
            .write_at(cache, freemap, entry.as_bytes(), (index * ENTRY_SIZE) as u64)?;
        Ok(())
    }

    /// Entry 0 holds the parent directory's inode sector.
    pub fn parent_sector(&self, cache: &BufferCache) -> u32 {
        self.read_entry(cache, 0).inode_sector
    }

    fn set_parent_sector(&self, cache: &BufferCache, freemap: &FreeMap, parent: u32) -> KResult<()> {
        let mut e = self.read_entry(cache, 0);
        e.inode_sector = parent;
        e.in_use = 1;
        self.write_entry(cache, freemap, 0, &e)
    }

    /// `.` returns this directory's own sector; `..` returns the parent
    /// back-pointer; anything else is a linear scan for an in-use entry
    /// with a matching name. Held under the reader role.
    pub fn lookup(&self, cache: &BufferCache, name: &str) -> Option<u32> {
        if name == "." {
            return Some(self.inode.sector);
        }
        if name == ".." {
            return Some(self.parent_sector(cache));
        }
        for i in 1..self.entry_count() {
            let e = self.read_entry(cache, i);
            if e.in_use != 0 && e.name_str() == name {
                return Some(e.inode_sector);
            }
        }
        None
    }

    /// Adds a directory entry `name -> inode_sector`. If the new entry is
    /// itself a directory, its entry-0 parent back-pointer is rewritten to
    /// point at this directory. Held under the writer role.
    pub fn add(
        &self,
        cache: &BufferCache,
        freemap: &FreeMap,
        table: &InodeTable,
        name: &str,
        inode_sector: u32,
        child_is_dir: bool,
    ) -> KResult<()> {
        validate_name(name)?;
        if self.lookup(cache, name).is_some() {
            return Err(KernelError::NameInUse);
        }
        if child_is_dir {
            let child = table.open(cache, inode_sector);
            let child_dir = Directory::new(child.clone());
            child_dir.set_parent_sector(cache, freemap, self.inode.sector)?;
            table.close(cache, freemap, &child);
        }
        let count = self.entry_count().max(1);
        let mut slot = None;
        for i in 1..count {
            if self.read_entry(cache, i).in_use == 0 {
                slot = Some(i);
                break;
            }
        }
        let slot = slot.unwrap_or(count);
        let mut e = RawEntry::empty();
        e.inode_sector = inode_sector;
        e.set_name(name);
        e.in_use = 1;
        self.write_entry(cache, freemap, slot, &e)
    }

    /// Returns `true` if every entry past index 0 is unused.
    pub fn is_empty(&self, cache: &BufferCache) -> bool {
        (1..self.entry_count()).all(|i| self.read_entry(cache, i).in_use == 0)
    }

    /// Locates `name`; if it is a directory, refuses removal unless empty.
    /// Marks the entry unused and defers the inode's actual deletion to its
    /// final close. Held under the writer role.
    pub fn remove(&self, cache: &BufferCache, freemap: &FreeMap, table: &InodeTable, name: &str) -> KResult<()> {
        validate_name(name)?;
        for i in 1..self.entry_count() {
            let e = self.read_entry(cache, i);
            if e.in_use != 0 && e.name_str() == name {
                let target = table.open(cache, e.inode_sector);
                if target.is_dir() {
                    let target_dir = Directory::new(target.clone());
                    if !target_dir.is_empty(cache) {
                        table.close(cache, freemap, &target);
                        return Err(KernelError::DirectoryNotEmpty);
                    }
                }
                let mut cleared = e;
                cleared.in_use = 0;
                self.write_entry(cache, freemap, i, &cleared)?;
                table.mark_removed(&target);
                table.close(cache, freemap, &target);
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }

    /// Lists in-use entry names, for the `readdir` syscall.
    pub fn list(&self, cache: &BufferCache) -> Vec<String> {
        (1..self.entry_count())
            .map(|i| self.read_entry(cache, i))
            .filter(|e| e.in_use != 0)
            .map(|e| e.name_str().to_string())
            .collect()
    }
}

/// Initializes the root directory's entry 0 to self-reference (spec §3:
/// "self-referencing at creation"). Called once at format time, through the
/// file system's own inode table rather than a disposable one, so the root
/// inode is instantiated exactly once (spec invariant, §8).
pub fn format_root(cache: &BufferCache, freemap: &FreeMap, table: &InodeTable, root_sector: u32) -> KResult<()> {
    let mut buf = [0u8; ENTRY_SIZE];
    let mut e = RawEntry::empty();
    e.inode_sector = root_sector;
    e.in_use = 1;
    buf.copy_from_slice(e.as_bytes());
    let root = table.open(cache, root_sector);
    root.write_at(cache, freemap, &buf, 0)?;
    table.close(cache, freemap, &root);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;
    use std::sync::Arc;

    fn setup() -> (Arc<BufferCache>, FreeMap, InodeTable) {
        let cache = Arc::new(BufferCache::new(Arc::new(MemoryBlockDevice::new(4096))));
        let freemap = FreeMap::format(cache.clone(), 4096).unwrap();
        (cache, freemap, InodeTable::new())
    }

    fn make_dir(cache: &BufferCache, freemap: &FreeMap, table: &InodeTable) -> (u32, InodeHandle) {
        let sector = freemap.allocate(1).unwrap();
        inode::create_inode(cache, freemap, sector, 0, true).unwrap();
        let handle = table.open(cache, sector);
        (sector, handle)
    }

    #[test]
    fn dot_and_dotdot() {
        let (cache, freemap, table) = setup();
        let (root_sector, root) = make_dir(&cache, &freemap, &table);
        format_root(&cache, &freemap, &table, root_sector).unwrap();
        let root_dir = Directory::new(root);
        assert_eq!(root_dir.lookup(&cache, "."), Some(root_sector));
        assert_eq!(root_dir.lookup(&cache, ".."), Some(root_sector));
    }

    #[test]
    fn add_lookup_remove_round_trip() {
        let (cache, freemap, table) = setup();
        let (root_sector, root) = make_dir(&cache, &freemap, &table);
        format_root(&cache, &freemap, &table, root_sector).unwrap();
        let root_dir = Directory::new(root);

        let file_sector = freemap.allocate(1).unwrap();
        inode::create_inode(&cache, &freemap, file_sector, 0, false).unwrap();
        root_dir.add(&cache, &freemap, &table, "hello.txt", file_sector, false).unwrap();
        assert_eq!(root_dir.lookup(&cache, "hello.txt"), Some(file_sector));

        assert_eq!(
            root_dir.add(&cache, &freemap, &table, "hello.txt", file_sector, false),
            Err(KernelError::NameInUse)
        );

        root_dir.remove(&cache, &freemap, &table, "hello.txt").unwrap();
        assert_eq!(root_dir.lookup(&cache, "hello.txt"), None);
    }

    #[test]
    fn nonempty_directory_refuses_removal() {
        let (cache, freemap, table) = setup();
        let (root_sector, root) = make_dir(&cache, &freemap, &table);
        format_root(&cache, &freemap, &table, root_sector).unwrap();
        let root_dir = Directory::new(root);

        let (child_sector, child) = make_dir(&cache, &freemap, &table);
        root_dir.add(&cache, &freemap, &table, "sub", child_sector, true).unwrap();
        let child_dir = Directory::new(child.clone());
        assert_eq!(child_dir.parent_sector(&cache), root_sector);

        let grandchild = freemap.allocate(1).unwrap();
        inode::create_inode(&cache, &freemap, grandchild, 0, false).unwrap();
        child_dir.add(&cache, &freemap, &table, "f", grandchild, false).unwrap();

        assert_eq!(
            root_dir.remove(&cache, &freemap, &table, "sub"),
            Err(KernelError::DirectoryNotEmpty)
        );
    }

    #[test]
    fn name_validation() {
        let (cache, freemap, table) = setup();
        let (root_sector, root) = make_dir(&cache, &freemap, &table);
        format_root(&cache, &freemap, &table, root_sector).unwrap();
        let root_dir = Directory::new(root);
        assert_eq!(
            root_dir.add(&cache, &freemap, &table, "", 2, false),
            Err(KernelError::NameEmpty)
        );
        assert_eq!(
            root_dir.add(&cache, &freemap, &table, "this-name-is-too-long", 2, false),
            Err(KernelError::NameTooLong)
        );
    }

    #[test]
    fn create_100_then_remove_all_leaves_directory_empty() {
        let (cache, freemap, table) = setup();
        let (root_sector, root) = make_dir(&cache, &freemap, &table);
        format_root(&cache, &freemap, &table, root_sector).unwrap();
        let root_dir = Directory::new(root);
        for i in 0..100 {
            let sector = freemap.allocate(1).unwrap();
            inode::create_inode(&cache, &freemap, sector, 0, false).unwrap();
            root_dir
                .add(&cache, &freemap, &table, &format!("f{i}"), sector, false)
                .unwrap();
        }
        assert_eq!(root_dir.list(&cache).len(), 100);
        for i in 0..100 {
            root_dir.remove(&cache, &freemap, &table, &format!("f{i}")).unwrap();
        }
        assert!(root_dir.list(&cache).is_empty());
    }
}
