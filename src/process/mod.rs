//! 4.M Process lifecycle.
//!
//! `execute`/`wait`/`exit` implement the parent/child protocol spec §4.M
//! and §9 describe: two semaphores (`wait_sema`, `exit_sema`) plus an
//! `exit_status` field, with parent and child referring to each other only
//! through [`crate::thread::Tid`] looked up in a shared table — never a raw
//! pointer (spec §9 "cyclic references"). Unlike [`crate::thread::Scheduler`],
//! which models scheduling *decisions* deterministically under explicit
//! `tick`/`yield_now` calls, a process's wait/exit handshake is genuine
//! producer/consumer concurrency (a parent blocks while a child runs), so
//! this layer runs each process body on a real OS thread and coordinates
//! with [`crate::sync::Semaphore`], per SPEC_FULL.md §0.

pub mod syscall;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::fs::inode::InodeHandle;
use crate::fs::FileSystem;
use crate::sync::Semaphore;
use crate::thread::Tid;
use crate::vm::address_space::{AddressSpace, SimulatedAddressSpace};
use crate::vm::frame::{FrameTable, VmOwner};
use crate::vm::spt::Spt;

/// Per-process descriptor table spans `[FD_LO, FD_HI)` (spec §3: "a small
/// integer (≥3, <128)"); 0/1/2 are reserved for console stdio and never
/// occupy a table slot.
pub const FD_LO: usize = 3;
pub const FD_HI: usize = 128;
pub const MMAP_LO: usize = 1;
pub const MMAP_HI: usize = 128;

pub(crate) struct OpenFile {
    pub inode: InodeHandle,
    pub position: Mutex<u64>,
}

pub(crate) enum Descriptor {
    File(OpenFile),
    /// A directory handle plus the underlying file handle on the same
    /// inode, per spec §3 "Open file handle".
    Dir(OpenFile),
}

pub(crate) struct MmapEntry {
    pub file: InodeHandle,
    pub base_page: u64,
    pub page_count: u32,
}

/// ELF loading, segment parsing and jumping to user mode are external
/// collaborators (spec §1: "only its requirement that the VM can map
/// file-backed pages is relevant"). `ProgramLoader` is the seam
/// `start_process` would otherwise call `load()` through directly.
pub trait ProgramLoader: Send + Sync {
    /// Attempts to load and fully run `command_line`'s program image
    /// against `process`'s address space, returning whether the load
    /// succeeded. A real implementation would map segments via
    /// `install_in_file`/`install_in_frame` and then jump to user mode; this
    /// crate's demo and test loaders instead run the simulated program body
    /// synchronously and return once it has finished.
    fn load(&self, command_line: &str, process: &Process) -> bool;
}

/// A loader that always succeeds without mapping any pages in, for tests
/// and teaching syscalls that never touch user memory.
pub struct NullLoader;

impl ProgramLoader for NullLoader {
    fn load(&self, _command_line: &str, _process: &Process) -> bool {
        true
    }
}

/// A loader that always fails, for exercising the `exec` failure path.
pub struct FailingLoader;

impl ProgramLoader for FailingLoader {
    fn load(&self, _command_line: &str, _process: &Process) -> bool {
        false
    }
}

pub struct Process {
    pub tid: Tid,
    pub name: String,
    parent: Mutex<Option<Tid>>,
    children: Mutex<Vec<Tid>>,
    waited: Mutex<HashSet<Tid>>,
    pub wait_sema: Semaphore,
    pub exit_sema: Semaphore,
    exit_status: AtomicI32,
    load_success: Mutex<Option<bool>>,
    fds: Mutex<Vec<Option<Descriptor>>>,
    mmaps: Mutex<Vec<Option<MmapEntry>>>,
    next_mmap_id: AtomicU32,
    cwd: Mutex<Option<u32>>,
    executable: Mutex<Option<InodeHandle>>,
    pub spt: Spt,
    pub address_space: SimulatedAddressSpace,
}

impl Process {
    fn new(tid: Tid, name: String) -> Self {
        let mut fds = Vec::with_capacity(FD_HI);
        fds.resize_with(FD_HI, || None);
        let mut mmaps = Vec::with_capacity(MMAP_HI);
        mmaps.resize_with(MMAP_HI, || None);
        Self {
            tid,
            name,
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            waited: Mutex::new(HashSet::new()),
            wait_sema: Semaphore::new(0),
            exit_sema: Semaphore::new(0),
            exit_status: AtomicI32::new(0),
            load_success: Mutex::new(None),
            fds: Mutex::new(fds),
            mmaps: Mutex::new(mmaps),
            next_mmap_id: AtomicU32::new(MMAP_LO as u32),
            cwd: Mutex::new(None),
            executable: Mutex::new(None),
            spt: Spt::new(),
            address_space: SimulatedAddressSpace::new(),
        }
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    pub fn cwd(&self) -> Option<u32> {
        *self.cwd.lock().unwrap()
    }

    pub fn set_cwd(&self, sector: u32) {
        *self.cwd.lock().unwrap() = Some(sector);
    }

    /// Opens the binary being executed and denies writes to it for the
    /// lifetime of the process (spec §4.F: "Deny-write on the executing
    /// binary is applied by opening the binary in process_execute").
    pub fn set_executable(&self, inode: InodeHandle) {
        inode.deny_write();
        *self.executable.lock().unwrap() = Some(inode);
    }

    fn alloc_fd(&self, descriptor: Descriptor) -> Option<i32> {
        let mut fds = self.fds.lock().unwrap();
        let slot = fds[FD_LO..FD_HI].iter().position(Option::is_none)? + FD_LO;
        fds[slot] = Some(descriptor);
        Some(slot as i32)
    }

    fn alloc_mmap(&self, entry: MmapEntry) -> i32 {
        let id = self.next_mmap_id.fetch_add(1, Ordering::SeqCst);
        let mut mmaps = self.mmaps.lock().unwrap();
        if (id as usize) >= mmaps.len() {
            mmaps.resize_with(id as usize + 1, || None);
        }
        mmaps[id as usize] = Some(entry);
        id as i32
    }
}

impl VmOwner for Process {
    fn on_evicted(&self, user_page: u64, slot: u32) {
        self.address_space.unmap(user_page);
        self.spt.mark_swapped(user_page, slot);
    }

    fn is_dirty(&self, user_page: u64) -> bool {
        self.address_space.is_dirty(user_page)
    }

    fn clear_dirty(&self, user_page: u64) {
        self.address_space.clear_dirty(user_page)
    }
}

/// Process-wide table of live processes, keyed by tid: the arena
/// [`crate::fs::inode::InodeTable`] already models cyclic references with
/// (spec §9), applied here to parent/child bookkeeping.
#[derive(Default)]
pub struct ProcessTable {
    processes: Mutex<std::collections::HashMap<Tid, Arc<Process>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tid: Tid) -> Option<Arc<Process>> {
        self.processes.lock().unwrap().get(&tid).cloned()
    }

    fn insert(&self, process: Arc<Process>) {
        self.processes.lock().unwrap().insert(process.tid, process);
    }

    fn remove(&self, tid: Tid) {
        self.processes.lock().unwrap().remove(&tid);
    }
}

use crate::error::{KResult, KernelError};
use crate::kernel::Kernel;

impl Kernel {
    /// Registers the first process (spec's analogue of Pintos' `init`):
    /// a `Process` record with no parent, ready to `execute` children and
    /// `wait` on them. Every other process comes into being through
    /// `execute` instead; this is the one bootstrap seam a caller outside
    /// this module needs, since `Process::new` itself is private to keep
    /// callers from constructing one outside the table that owns it.
    pub fn spawn_root(&self, name: &str) -> Tid {
        let tid = self.scheduler.lock().unwrap().create(name, crate::thread::PRI_DEFAULT);
        self.processes.insert(Arc::new(Process::new(tid, name.to_string())));
        tid
    }

    /// `process_execute`: creates a child thread, runs its loader, and
    /// blocks the caller on the child's `wait_sema` until the load result is
    /// known (spec §4.M).
    pub fn execute(self: &Arc<Self>, caller_tid: Tid, command_line: &str) -> KResult<Tid> {
        let name = command_line.split(' ').next().unwrap_or("").to_string();
        let tid = self.scheduler.lock().unwrap().create(&name, crate::thread::PRI_DEFAULT);
        let process = Arc::new(Process::new(tid, name.clone()));

        if let Some(parent) = self.processes.get(caller_tid) {
            parent.children.lock().unwrap().push(tid);
            *process.parent.lock().unwrap() = Some(caller_tid);
        }
        self.processes.insert(process.clone());

        let kernel = self.clone();
        let cmd = command_line.to_string();
        let child = process.clone();
        std::thread::spawn(move || {
            let ok = kernel.loader.load(&cmd, &child);
            *child.load_success.lock().unwrap() = Some(ok);
            child.wait_sema.up();
            kernel.exit(tid, if ok { 0 } else { -1 });
        });

        // The child thread signals `wait_sema` twice: once after `load`
        // resolves (consumed here) and once after it calls `exit` (left for
        // `wait` to consume) — the semaphore's count, not ordering, is what
        // makes this race-free regardless of which runs first.
        process.wait_sema.down();
        let load_ok = process.load_success.lock().unwrap().unwrap_or(false);
        if !load_ok {
            // The caller never learns this tid, so it can never `wait` on it
            // and the orphan-release pass in `exit` only fires when the
            // *parent* exits. Detach it here so the child's own `exit` (en
            // route via its spawned thread right now) doesn't block forever
            // on `exit_sema`.
            if let Some(parent) = self.processes.get(caller_tid) {
                parent.children.lock().unwrap().retain(|&t| t != tid);
            }
            process.exit_sema.up();
            return Err(KernelError::LoadFailed);
        }
        Ok(tid)
    }

    /// `process_wait`: blocks until `child_tid` exits, then reaps its
    /// `exit_status`. Each child may be waited for at most once (spec
    /// §4.M, §8 scenario 6).
    pub fn wait(&self, caller_tid: Tid, child_tid: Tid) -> KResult<i32> {
        let caller = self.processes.get(caller_tid).ok_or(KernelError::NoSuchProcess)?;
        {
            let waited = caller.waited.lock().unwrap();
            if waited.contains(&child_tid) {
                return Err(KernelError::AlreadyWaited);
            }
        }
        let is_child = {
            let mut children = caller.children.lock().unwrap();
            match children.iter().position(|&t| t == child_tid) {
                Some(pos) => {
                    children.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !is_child {
            return Err(KernelError::NoSuchProcess);
        }
        caller.waited.lock().unwrap().insert(child_tid);

        let child = self.processes.get(child_tid).ok_or(KernelError::NoSuchProcess)?;
        child.wait_sema.down();
        let status = child.exit_status();
        child.exit_sema.up();
        Ok(status)
    }

    /// `process_exit`: closes every descriptor, mmap and the cwd handle,
    /// tears down the supplemental page table (writing back dirty mmap
    /// pages), releases orphaned children, and blocks until the parent
    /// reaps this process via `wait` (spec §4.M).
    pub fn exit(&self, tid: Tid, status: i32) {
        let Some(process) = self.processes.get(tid) else {
            return;
        };
        log::info!("{}: exit({status})", process.name);

        {
            let mut fds = process.fds.lock().unwrap();
            for slot in fds.iter_mut() {
                if let Some(descriptor) = slot.take() {
                    let inode = match descriptor {
                        Descriptor::File(f) => f.inode,
                        Descriptor::Dir(f) => f.inode,
                    };
                    self.fs.close(&inode);
                }
            }
        }
        {
            let mmap_ids: Vec<i32> = process
                .mmaps
                .lock()
                .unwrap()
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.as_ref().map(|_| i as i32))
                .collect();
            for id in mmap_ids {
                let _ = self.munmap(&process, id);
            }
        }
        if let Some(exe) = process.executable.lock().unwrap().take() {
            exe.allow_write();
            self.fs.close(&exe);
        }

        let frame_table = &self.frame_table;
        let swap = &self.swap;
        let cache = &self.fs.cache;
        let freemap = &self.fs.freemap;
        process.spt.destroy(frame_table, swap, |kernel_page, file, offset, read_bytes| {
            let page = frame_table.read(kernel_page);
            let _ = file.write_at(cache, freemap, &page[..read_bytes as usize], offset);
        });

        process.exit_status.store(status, Ordering::SeqCst);

        for child_tid in process.children.lock().unwrap().drain(..) {
            if let Some(child) = self.processes.get(child_tid) {
                child.exit_sema.up();
            }
        }

        process.wait_sema.up();
        process.exit_sema.down();
        self.processes.remove(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemoryBlockDevice;
    use crate::kernel::Kernel;
    use std::sync::Arc;

    fn kernel(loader: Arc<dyn ProgramLoader>) -> Arc<Kernel> {
        Kernel::boot(
            Arc::new(MemoryBlockDevice::new(4096)),
            Arc::new(MemoryBlockDevice::new(1024)),
            8,
            loader,
        )
    }

    #[test]
    fn exec_then_wait_reaps_exit_status() {
        let k = kernel(Arc::new(NullLoader));
        let root = 0; // idle thread's tid stands in for the "shell" here.
        k.processes.insert(Arc::new(Process::new(root, "shell".into())));
        let child = k.execute(root, "worker").unwrap();
        k.exit(child, 42);
        let status = k.wait(root, child).unwrap();
        assert_eq!(status, 42);
        assert_eq!(k.wait(root, child).unwrap_err(), KernelError::AlreadyWaited);
    }

    #[test]
    fn failing_load_returns_load_failed() {
        let k = kernel(Arc::new(FailingLoader));
        let root = 0;
        k.processes.insert(Arc::new(Process::new(root, "shell".into())));
        assert_eq!(k.execute(root, "bogus").unwrap_err(), KernelError::LoadFailed);
    }

    #[test]
    fn waiting_for_a_non_child_fails() {
        let k = kernel(Arc::new(NullLoader));
        let root = 0;
        k.processes.insert(Arc::new(Process::new(root, "shell".into())));
        assert_eq!(k.wait(root, 999).unwrap_err(), KernelError::NoSuchProcess);
    }
}
