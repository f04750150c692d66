//! 4.F File-system façade over the buffer cache, free map, inode and
//! directory layers (components A–E).

pub mod dir;
pub mod freemap;
pub mod inode;

use std::sync::Arc;

use log::info;

use crate::block::BlockDevice;
use crate::cache::BufferCache;
use crate::error::{KResult, KernelError};
use dir::Directory;
use freemap::{FreeMap, ROOT_DIR_SECTOR};
use inode::{InodeHandle, InodeTable};

pub struct FileSystem {
    pub cache: Arc<BufferCache>,
    pub freemap: FreeMap,
    pub table: InodeTable,
    pub root_sector: u32,
}

impl FileSystem {
    /// Formats a fresh file system on `device`: sector 0 holds the free
    /// map's inode, sector 1 the root directory's (spec §6).
    pub fn format(device: Arc<dyn BlockDevice>, sector_count: u32) -> KResult<Self> {
        let cache = Arc::new(BufferCache::new(device));
        let freemap = FreeMap::format(cache.clone(), sector_count)?;
        let table = InodeTable::new();
        inode::create_inode(&cache, &freemap, ROOT_DIR_SECTOR, 0, true)?;
        dir::format_root(&cache, &freemap, &table, ROOT_DIR_SECTOR)?;
        info!("file system formatted: {sector_count} sectors");
        Ok(Self {
            cache,
            freemap,
            table,
            root_sector: ROOT_DIR_SECTOR,
        })
    }

    /// Mounts an already-formatted file system.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Self {
        let cache = Arc::new(BufferCache::new(device));
        let freemap = FreeMap::mount(cache.clone());
        Self {
            cache,
            freemap,
            table: InodeTable::new(),
            root_sector: ROOT_DIR_SECTOR,
        }
    }

    fn open_dir_at(&self, sector: u32) -> Directory {
        Directory::new(self.table.open(&self.cache, sector))
    }

    pub fn close(&self, inode: &InodeHandle) {
        self.table.close(&self.cache, &self.freemap, inode);
    }

    /// Resolves `path` to the directory of its final component, returning
    /// that directory plus the final path element's name. `cwd` is the
    /// calling thread's current directory sector, or `None` for root (spec
    /// §4.E `open_path`).
    fn split_path(&self, path: &str, cwd: Option<u32>) -> KResult<(Directory, String)> {
        let (start, rest) = if let Some(rest) = path.strip_prefix('/') {
            (self.root_sector, rest)
        } else {
            (cwd.unwrap_or(self.root_sector), path)
        };
        let mut components: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
        let filename = components.pop().unwrap_or("").to_string();

        let mut current = start;
        for comp in components {
            let dir = self.open_dir_at(current);
            let next_sector = dir.lookup(&self.cache, comp).ok_or(KernelError::NotFound)?;
            self.close(&dir.inode);
            let next_inode = self.table.open(&self.cache, next_sector);
            let ok = next_inode.is_dir() && !next_inode.removed.load(std::sync::atomic::Ordering::SeqCst);
            self.close(&next_inode);
            if !ok {
                return Err(KernelError::NotADirectory);
            }
            current = next_sector;
        }
        Ok((self.open_dir_at(current), filename))
    }

    /// Allocates an inode at a fresh sector, initializes it, and links it
    /// into its parent directory. Releases the sector on any failure.
    pub fn create(&self, path: &str, cwd: Option<u32>, size: u64, is_dir: bool) -> KResult<()> {
        let (parent, name) = self.split_path(path, cwd)?;
        let result = (|| {
            let sector = self.freemap.allocate(1)?;
            let outcome = inode::create_inode(&self.cache, &self.freemap, sector, size, is_dir)
                .and_then(|()| parent.add(&self.cache, &self.freemap, &self.table, &name, sector, is_dir));
            if outcome.is_err() {
                self.freemap.release(sector, 1);
            }
            outcome
        })();
        self.close(&parent.inode);
        result
    }

    pub fn mkdir(&self, path: &str, cwd: Option<u32>) -> KResult<()> {
        self.create(path, cwd, 0, true)
    }

    /// Opens `path`. An empty final component (`path` names a directory
    /// directly, e.g. `/a/b/`) opens the resolved directory itself, through
    /// a fresh `table.open` rather than cloning `parent.inode` directly:
    /// the clone would share `parent.inode`'s single `open_count` between
    /// two handles that each close independently, under-counting it.
    pub fn open(&self, path: &str, cwd: Option<u32>) -> KResult<InodeHandle> {
        let (parent, name) = self.split_path(path, cwd)?;
        let result = if name.is_empty() {
            Ok(self.table.open(&self.cache, parent.inode.sector))
        } else {
            match parent.lookup(&self.cache, &name) {
                Some(sector) => Ok(self.table.open(&self.cache, sector)),
                None => Err(KernelError::NotFound),
            }
        };
        self.close(&parent.inode);
        result
    }

    pub fn remove(&self, path: &str, cwd: Option<u32>) -> KResult<()> {
        let (parent, name) = self.split_path(path, cwd)?;
        let result = parent.remove(&self.cache, &self.freemap, &self.table, &name);
        self.close(&parent.inode);
        result
    }

    /// Resolves `path` and returns the sector of the directory it names,
    /// for `chdir`.
    pub fn resolve_dir(&self, path: &str, cwd: Option<u32>) -> KResult<u32> {
        let (parent, name) = self.split_path(path, cwd)?;
        let target = if name.is_empty() {
            Ok(parent.inode.sector)
        } else {
            match parent.lookup(&self.cache, &name) {
                Some(sector) => {
                    let inode = self.table.open(&self.cache, sector);
                    let ok = inode.is_dir();
                    self.close(&inode);
                    if ok {
                        Ok(sector)
                    } else {
                        Err(KernelError::NotADirectory)
                    }
                }
                None => Err(KernelError::NotFound),
            }
        };
        self.close(&parent.inode);
        target
    }

    pub fn readdir(&self, dir_inode: &InodeHandle) -> KResult<Vec<String>> {
        if !dir_inode.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        Ok(Directory::new(dir_inode.clone()).list(&self.cache))
    }

    pub fn shutdown(&self) {
        self.cache.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;

    fn fs() -> FileSystem {
        FileSystem::format(Arc::new(MemoryBlockDevice::new(4096)), 4096).unwrap()
    }

    #[test]
    fn create_then_open_succeeds() {
        let fs = fs();
        fs.create("/hello.txt", None, 0, false).unwrap();
        let inode = fs.open("/hello.txt", None).unwrap();
        assert!(!inode.is_dir());
        fs.close(&inode);
    }

    #[test]
    fn remove_then_open_fails_but_existing_handle_still_works() {
        let fs = fs();
        fs.create("/hello.txt", None, 0, false).unwrap();
        let handle = fs.open("/hello.txt", None).unwrap();
        fs.remove("/hello.txt", None).unwrap();
        assert_eq!(fs.open("/hello.txt", None).unwrap_err(), KernelError::NotFound);
        // The handle obtained before removal still works until closed.
        handle.write_at(&fs.cache, &fs.freemap, b"still alive", 0).unwrap();
        let mut buf = [0u8; 11];
        handle.read_at(&fs.cache, &mut buf, 0);
        assert_eq!(&buf, b"still alive");
        fs.close(&handle);
    }

    #[test]
    fn directory_depth_scenario() {
        // spec §8 scenario 3, read against the hierarchical resolution
        // algorithm in §4.E (see DESIGN.md for the discrepancy this
        // resolves): nested mkdir through an existing directory succeeds,
        // re-creating an existing name fails, and a relative mkdir under a
        // non-root cwd is visible from an absolute path.
        let fs = fs();
        fs.mkdir("/a", None).unwrap();
        fs.mkdir("/a/b", None).unwrap();
        let a = fs.resolve_dir("/a", None).unwrap();

        assert_eq!(fs.mkdir("b", Some(a)), Err(KernelError::NameInUse));
        assert_eq!(fs.open("/a/b/c", None).unwrap_err(), KernelError::NotFound);

        fs.mkdir("c", Some(a)).unwrap();
        let c = fs.open("c", Some(a)).unwrap();
        assert!(c.is_dir());
        fs.close(&c);

        let c_abs = fs.open("/a/c", None).unwrap();
        assert!(c_abs.is_dir());
        fs.close(&c_abs);
    }

    #[test]
    fn file_level_read_after_write() {
        let fs = fs();
        fs.create("/f", None, 0, false).unwrap();
        let h = fs.open("/f", None).unwrap();
        let n = h.write_at(&fs.cache, &fs.freemap, b"0123456789", 3).unwrap();
        assert_eq!(n, 10);
        let mut buf = [0u8; 10];
        let r = h.read_at(&fs.cache, &mut buf, 3);
        assert_eq!(r, 10);
        assert_eq!(&buf, b"0123456789");
        fs.close(&h);
    }

    #[test]
    fn concurrent_writers_at_disjoint_offsets() {
        use std::thread;
        let fs = Arc::new(fs());
        fs.create("/f", None, 0, false).unwrap();
        let h1 = fs.open("/f", None).unwrap();
        let h2 = h1.clone();
        let fs1 = fs.clone();
        let fs2 = fs.clone();
        let t1 = thread::spawn(move || {
            h1.write_at(&fs1.cache, &fs1.freemap, &[0x01u8; 4096], 0).unwrap();
        });
        let t2 = thread::spawn(move || {
            h2.write_at(&fs2.cache, &fs2.freemap, &[0x02u8; 4096], 4096).unwrap();
        });
        t1.join().unwrap();
        t2.join().unwrap();
        let h = fs.open("/f", None).unwrap();
        assert_eq!(h.length(), 8192);
        let mut buf = vec![0u8; 8192];
        h.read_at(&fs.cache, &mut buf, 0);
        assert!(buf[0..4096].iter().all(|&b| b == 0x01));
        assert!(buf[4096..8192].iter().all(|&b| b == 0x02));
        fs.close(&h);
    }
}
