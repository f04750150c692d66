//! 4.N Syscall interface: user-pointer validation, pinning, and dispatch.
//!
//! A real trap brings the dispatcher a raw interrupt frame and extracts
//! `esp`/arguments from it; that trap and the x86 argument-slot layout are
//! external collaborators here (spec §1), so [`Syscall`] takes already
//! -extracted, typed arguments — exactly what the dispatcher would have in
//! hand right before step 2 of spec §4.N. What this module *does* own is
//! steps 2–5: validating every pointer argument against the calling
//! process's supplemental page table, pinning every page touched, and
//! unpinning on every exit path via [`PinGuard`]'s `Drop`.

use std::sync::Arc;

use crate::error::{KResult, KernelError};
use crate::fs::inode::InodeHandle;
use crate::kernel::Kernel;
use crate::process::{Descriptor, MmapEntry, OpenFile, Process};
use crate::thread::Tid;
use crate::vm::fault::{self, FaultOutcome};
use crate::vm::{page_floor, PAGE_SIZE};

/// Top of the simulated user address space: addresses at or above this are
/// never valid user pointers (spec §4.J step 1's "is not a user address").
pub const USER_ADDR_LIMIT: u64 = 0xC000_0000;
const MAX_STRING_LEN: usize = 4096;

fn is_user_address(addr: u64) -> bool {
    addr < USER_ADDR_LIMIT
}

/// Every page pinned while validating one syscall's arguments, released on
/// drop regardless of how the syscall handler returns (spec §4.N step 5:
/// "Unpin on every exit path").
pub struct PinGuard<'a> {
    kernel: &'a Kernel,
    frames: Vec<u32>,
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        for &frame in &self.frames {
            self.kernel.frame_table.unpin(frame);
        }
    }
}

impl<'a> PinGuard<'a> {
    fn empty(kernel: &'a Kernel) -> Self {
        Self { kernel, frames: Vec::new() }
    }
}

/// Pins the page backing `user_page`, resolving a page fault first if the
/// page is not yet present — spec §4.H Pinning: "faults it in if
/// necessary". Fails if the page cannot be made to exist, or (for a write)
/// is not writable.
fn pin_page(kernel: &Kernel, process: &Arc<Process>, user_page: u64, esp: u64, write_access: bool) -> KResult<u32> {
    if !is_user_address(user_page) {
        return Err(KernelError::BadPointer);
    }
    if !process.address_space.is_present(user_page) {
        let owner: Arc<dyn crate::vm::frame::VmOwner> = process.clone();
        let outcome = fault::resolve(
            user_page,
            esp,
            true,
            write_access,
            is_user_address,
            &process.spt,
            &kernel.frame_table,
            &kernel.swap,
            &kernel.fs.cache,
            &process.address_space,
            owner,
        );
        if outcome != FaultOutcome::Resolved {
            return Err(KernelError::BadPointer);
        }
    }
    if write_access && !process.address_space.is_writable(user_page) {
        return Err(KernelError::BadPointer);
    }
    let frame = process.address_space.frame_of(user_page).ok_or(KernelError::BadPointer)?;
    kernel.frame_table.pin(frame);
    Ok(frame)
}

/// Validates and pins every page touched by `[addr, addr+len)`.
fn pin_range<'a>(
    kernel: &'a Kernel,
    process: &Arc<Process>,
    addr: u64,
    len: usize,
    esp: u64,
    write_access: bool,
) -> KResult<PinGuard<'a>> {
    if len == 0 {
        return Ok(PinGuard::empty(kernel));
    }
    let mut guard = PinGuard::empty(kernel);
    let first = page_floor(addr);
    let last = page_floor(addr + len as u64 - 1);
    let mut page = first;
    loop {
        match pin_page(kernel, process, page, esp, write_access) {
            Ok(frame) => guard.frames.push(frame),
            Err(e) => return Err(e),
        }
        if page == last {
            break;
        }
        page += PAGE_SIZE as u64;
    }
    Ok(guard)
}

fn byte_at(kernel: &Kernel, process: &Arc<Process>, addr: u64) -> u8 {
    let page = page_floor(addr);
    let frame = process.address_space.frame_of(page).expect("page must be pinned and present");
    let offset = (addr - page) as usize;
    kernel.frame_table.read(frame)[offset]
}

fn set_byte_at(kernel: &Kernel, process: &Arc<Process>, addr: u64, value: u8) {
    let page = page_floor(addr);
    let frame = process.address_space.frame_of(page).expect("page must be pinned and present");
    let mut data = kernel.frame_table.read(frame);
    let offset = (addr - page) as usize;
    data[offset] = value;
    kernel.frame_table.write(frame, &data);
    process.address_space.mark_written(page);
}

/// Reads a NUL-terminated string starting at `addr`, pinning every page it
/// spans (spec §4.N step 2: "validate every byte of the referenced region
/// up to the end (NUL for strings)"). The demo dispatcher in `main.rs` uses
/// this to turn a raw user pointer argument into a path or command line
/// before building a [`Syscall`].
pub fn read_c_string<'a>(kernel: &'a Kernel, process: &Arc<Process>, addr: u64, esp: u64) -> KResult<(String, PinGuard<'a>)> {
    let mut guard = PinGuard::empty(kernel);
    let mut bytes = Vec::new();
    let mut cursor = addr;
    loop {
        let page = page_floor(cursor);
        if !guard.frames.iter().any(|&f| process.address_space.frame_of(page) == Some(f)) {
            let frame = pin_page(kernel, process, page, esp, false)?;
            guard.frames.push(frame);
        }
        let b = byte_at(kernel, process, cursor);
        if b == 0 {
            break;
        }
        bytes.push(b);
        cursor += 1;
        if bytes.len() > MAX_STRING_LEN {
            return Err(KernelError::BadPointer);
        }
    }
    let s = String::from_utf8(bytes).map_err(|_| KernelError::BadPointer)?;
    Ok((s, guard))
}

fn copy_out(kernel: &Kernel, process: &Arc<Process>, addr: u64, buf: &mut [u8], esp: u64) -> KResult<PinGuard<'_>> {
    let guard = pin_range(kernel, process, addr, buf.len(), esp, false)?;
    for (i, slot) in buf.iter_mut().enumerate() {
        *slot = byte_at(kernel, process, addr + i as u64);
    }
    Ok(guard)
}

fn copy_in(kernel: &Kernel, process: &Arc<Process>, addr: u64, data: &[u8], esp: u64) -> KResult<PinGuard<'_>> {
    let guard = pin_range(kernel, process, addr, data.len(), esp, true)?;
    for (i, &byte) in data.iter().enumerate() {
        set_byte_at(kernel, process, addr + i as u64, byte);
    }
    Ok(guard)
}

/// Already-extracted syscall arguments (spec §6's dispatch list, minus
/// `HALT`, which the demo binary handles directly by shutting down).
pub enum Syscall {
    Exit { status: i32 },
    Exec { command_line: String },
    Wait { pid: Tid },
    Create { path: String, initial_size: u64 },
    Remove { path: String },
    Open { path: String },
    Filesize { fd: i32 },
    Read { fd: i32, buf_addr: u64, size: u32, esp: u64 },
    Write { fd: i32, buf_addr: u64, size: u32, esp: u64 },
    Seek { fd: i32, position: u64 },
    Tell { fd: i32 },
    Close { fd: i32 },
    Mmap { fd: i32, addr: u64 },
    Munmap { mapping: i32 },
    Chdir { path: String },
    Mkdir { path: String },
    Readdir { fd: i32 },
    Isdir { fd: i32 },
    Inumber { fd: i32 },
    Fibonacci { n: i64 },
    MaxOfFour { a: i32, b: i32, c: i32, d: i32 },
}

/// A user-visible syscall return value, or an instruction to terminate the
/// calling process (spec §4.N step "any validation failure terminates the
/// process with exit -1", and §7 "user program fault").
pub enum SyscallOutcome {
    Value(i64),
    Terminate(i32),
}

fn with_descriptor<T>(process: &Process, fd: i32, f: impl FnOnce(&Descriptor) -> KResult<T>) -> KResult<T> {
    let fds = process.fds.lock().unwrap();
    let slot = fds.get(fd as usize).and_then(|s| s.as_ref()).ok_or(KernelError::BadDescriptor)?;
    f(slot)
}

/// Fibonacci teaching syscall (spec §8 scenario 1): `fib(0)` returns the
/// sentinel `-1`; otherwise the `n`-th Fibonacci number with `fib(1) == 1`.
pub fn fibonacci(n: i64) -> i64 {
    if n <= 0 {
        return -1;
    }
    let (mut a, mut b) = (0i64, 1i64);
    for _ in 0..n - 1 {
        let next = a + b;
        a = b;
        b = next;
    }
    b
}

/// Max-of-four teaching syscall (spec §8 scenario 2).
pub fn max_of_four(a: i32, b: i32, c: i32, d: i32) -> i32 {
    a.max(b).max(c).max(d)
}

impl Kernel {
    /// Dispatches one syscall for `tid`, following spec §4.N steps 2–5:
    /// validates and pins any pointer arguments for the duration of the
    /// call, then unpins them on return via `PinGuard`'s drop. Any
    /// validation failure or filesystem error that the syscall's contract
    /// does not otherwise surface terminates the process.
    pub fn handle_syscall(self: &Arc<Self>, tid: Tid, call: Syscall) -> SyscallOutcome {
        let Some(process) = self.processes.get(tid) else {
            return SyscallOutcome::Terminate(-1);
        };
        match self.dispatch(tid, &process, call) {
            Ok(value) => SyscallOutcome::Value(value),
            Err(KernelError::BadPointer) => SyscallOutcome::Terminate(-1),
            Err(_) => SyscallOutcome::Value(-1),
        }
    }

    fn dispatch(self: &Arc<Self>, tid: Tid, process: &Arc<Process>, call: Syscall) -> KResult<i64> {
        match call {
            Syscall::Fibonacci { n } => Ok(fibonacci(n)),
            Syscall::MaxOfFour { a, b, c, d } => Ok(max_of_four(a, b, c, d) as i64),

            Syscall::Exit { status } => {
                self.exit(tid, status);
                Ok(status as i64)
            }
            Syscall::Exec { command_line } => match self.execute(tid, &command_line) {
                Ok(child) => Ok(child as i64),
                Err(_) => Ok(-1),
            },
            Syscall::Wait { pid } => match self.wait(tid, pid) {
                Ok(status) => Ok(status as i64),
                Err(_) => Ok(-1),
            },

            Syscall::Create { path, initial_size } => {
                self.fs.create(&path, process.cwd(), initial_size, false)?;
                Ok(1)
            }
            Syscall::Remove { path } => {
                self.fs.remove(&path, process.cwd())?;
                Ok(1)
            }
            Syscall::Open { path } => {
                let inode = self.fs.open(&path, process.cwd())?;
                let is_dir = inode.is_dir();
                let descriptor = if is_dir {
                    Descriptor::Dir(OpenFile { inode, position: std::sync::Mutex::new(0) })
                } else {
                    Descriptor::File(OpenFile { inode, position: std::sync::Mutex::new(0) })
                };
                process.alloc_fd(descriptor).map(|fd| fd as i64).ok_or(KernelError::TooManyOpenFiles)
            }
            Syscall::Filesize { fd } => with_descriptor(process, fd, |d| Ok(length_of(d) as i64)),
            Syscall::Close { fd } => {
                let mut fds = process.fds.lock().unwrap();
                let slot = fds.get_mut(fd as usize).ok_or(KernelError::BadDescriptor)?;
                let descriptor = slot.take().ok_or(KernelError::BadDescriptor)?;
                drop(fds);
                self.fs.close(inode_of(&descriptor));
                Ok(1)
            }
            Syscall::Seek { fd, position } => with_descriptor(process, fd, |d| {
                *open_file_of(d).position.lock().unwrap() = position;
                Ok(1)
            }),
            Syscall::Tell { fd } => with_descriptor(process, fd, |d| Ok(*open_file_of(d).position.lock().unwrap() as i64)),
            Syscall::Isdir { fd } => with_descriptor(process, fd, |d| Ok(matches!(d, Descriptor::Dir(_)) as i64)),
            Syscall::Inumber { fd } => with_descriptor(process, fd, |d| Ok(inode_of(d).sector as i64)),
            Syscall::Readdir { fd } => with_descriptor(process, fd, |d| {
                let Descriptor::Dir(open_file) = d else {
                    return Err(KernelError::NotADirectory);
                };
                let names = self.fs.readdir(&open_file.inode)?;
                let mut pos = open_file.position.lock().unwrap();
                let next = names.get(*pos as usize).cloned();
                *pos += 1;
                Ok(next.is_some() as i64)
            }),

            Syscall::Read { fd, buf_addr, size, esp } => {
                if fd == 0 {
                    let zeros = vec![0u8; size as usize];
                    let _guard = copy_in(self, process, buf_addr, &zeros, esp)?;
                    return Ok(size as i64);
                }
                if fd == 1 || fd == 2 {
                    return Ok(-1);
                }
                with_descriptor(process, fd, |d| {
                    let open_file = open_file_of(d);
                    if matches!(d, Descriptor::Dir(_)) {
                        return Ok(-1);
                    }
                    let mut buf = vec![0u8; size as usize];
                    let position = *open_file.position.lock().unwrap();
                    let n = open_file.inode.read_at(&self.fs.cache, &mut buf, position);
                    let _guard = copy_in(self, process, buf_addr, &buf[..n], esp)?;
                    *open_file.position.lock().unwrap() = position + n as u64;
                    Ok(n as i64)
                })
            }
            Syscall::Write { fd, buf_addr, size, esp } => {
                let mut buf = vec![0u8; size as usize];
                let _guard = copy_out(self, process, buf_addr, &mut buf, esp)?;
                if fd == 1 || fd == 2 {
                    log::info!("{}", String::from_utf8_lossy(&buf));
                    return Ok(size as i64);
                }
                if fd == 0 {
                    return Ok(-1);
                }
                with_descriptor(process, fd, |d| {
                    let open_file = open_file_of(d);
                    if matches!(d, Descriptor::Dir(_)) {
                        return Ok(-1);
                    }
                    let position = *open_file.position.lock().unwrap();
                    let n = open_file.inode.write_at(&self.fs.cache, &self.fs.freemap, &buf, position)?;
                    *open_file.position.lock().unwrap() = position + n as u64;
                    Ok(n as i64)
                })
            }

            Syscall::Chdir { path } => {
                let sector = self.fs.resolve_dir(&path, process.cwd())?;
                process.set_cwd(sector);
                Ok(1)
            }
            Syscall::Mkdir { path } => {
                self.fs.mkdir(&path, process.cwd())?;
                Ok(1)
            }

            Syscall::Mmap { fd, addr } => self.mmap(process, fd, addr).map(|id| id as i64),
            Syscall::Munmap { mapping } => {
                self.munmap(process, mapping)?;
                Ok(1)
            }
        }
    }

    /// Maps every page of `fd`'s file into `process`'s address space
    /// starting at `addr` as lazily loaded, dirty-tracked `IN_FILE` pages
    /// (spec §4.I `install_in_file` with `is_mmap = true`).
    fn mmap(&self, process: &Arc<Process>, fd: i32, addr: u64) -> KResult<i32> {
        if addr == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::BadPointer);
        }
        let inode = with_descriptor(process, fd, |d| {
            if matches!(d, Descriptor::Dir(_)) {
                return Err(KernelError::IsADirectory);
            }
            Ok(inode_of(d).clone())
        })?;
        let length = inode.length();
        if length == 0 {
            return Err(KernelError::BadPointer);
        }
        let page_count = length.div_ceil(PAGE_SIZE as u64) as u32;
        for i in 0..page_count {
            let page = addr + (i as u64) * PAGE_SIZE as u64;
            if process.spt.lookup(page).is_some() {
                return Err(KernelError::BadPointer);
            }
        }
        for i in 0..page_count {
            let page = addr + (i as u64) * PAGE_SIZE as u64;
            let offset = (i as u64) * PAGE_SIZE as u64;
            let read_bytes = (length - offset).min(PAGE_SIZE as u64) as u32;
            let zero_bytes = PAGE_SIZE as u32 - read_bytes;
            process.spt.install_in_file(page, inode.clone(), offset, read_bytes, zero_bytes, true, true);
        }
        Ok(process.alloc_mmap(MmapEntry { file: inode, base_page: addr, page_count }))
    }

    /// Writes back every dirty resident page of the mapping and removes its
    /// supplemental page table entries (spec §4.I: "write back dirty pages
    /// to the underlying file before release").
    fn munmap(&self, process: &Arc<Process>, mapping: i32) -> KResult<()> {
        let entry = {
            let mut mmaps = process.mmaps.lock().unwrap();
            let slot = mmaps.get_mut(mapping as usize).ok_or(KernelError::BadDescriptor)?;
            slot.take().ok_or(KernelError::BadDescriptor)?
        };
        for i in 0..entry.page_count {
            let page = entry.base_page + (i as u64) * PAGE_SIZE as u64;
            if let Some(lookup) = process.spt.lookup(page) {
                if lookup.state == crate::vm::spt::PageState::InFrame {
                    if let Some(kp) = lookup.kernel_page {
                        if process.address_space.is_dirty(page) {
                            let data = self.frame_table.read(kp);
                            let read_bytes = lookup.read_bytes.unwrap_or(0);
                            let offset = lookup.file_offset.unwrap_or(0);
                            let _ = entry.file.write_at(&self.fs.cache, &self.fs.freemap, &data[..read_bytes as usize], offset);
                        }
                        self.frame_table.free(kp);
                        process.address_space.unmap(page);
                    }
                }
            }
            process.spt.remove(page);
        }
        self.fs.close(&entry.file);
        Ok(())
    }
}

fn inode_of(d: &Descriptor) -> &InodeHandle {
    match d {
        Descriptor::File(f) => &f.inode,
        Descriptor::Dir(f) => &f.inode,
    }
}

fn open_file_of(d: &Descriptor) -> &OpenFile {
    match d {
        Descriptor::File(f) => f,
        Descriptor::Dir(f) => f,
    }
}

fn length_of(d: &Descriptor) -> u64 {
    inode_of(d).length()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fibonacci_matches_scenario_1() {
        assert_eq!(fibonacci(0), -1);
        assert_eq!(fibonacci(1), 1);
        assert_eq!(fibonacci(10), 55);
    }

    #[test]
    fn max_of_four_matches_scenario_2() {
        assert_eq!(max_of_four(7, 2, 9, 4), 9);
        assert_eq!(max_of_four(-1, -2, -3, -4), -1);
    }

    // Scenario 4 from spec §8: mmap a file, modify a byte through the
    // mapping, munmap, reopen, and see the modification land in the file.
    #[test]
    fn mmap_modify_munmap_reopen_sees_modified_byte() {
        use crate::block::MemoryBlockDevice;
        use crate::kernel::Kernel;
        use crate::process::NullLoader;

        let fs_device = Arc::new(MemoryBlockDevice::new(4096u32));
        let swap_device = Arc::new(MemoryBlockDevice::new(256u32));
        let kernel = Kernel::boot(fs_device, swap_device, 8, Arc::new(NullLoader));
        let root = kernel.spawn_root("init");

        kernel.fs.create("/data", None, 0, false).unwrap();
        let seed = kernel.fs.open("/data", None).unwrap();
        seed.write_at(&kernel.fs.cache, &kernel.fs.freemap, b"hello world", 0).unwrap();
        kernel.fs.close(&seed);

        let fd = match kernel.handle_syscall(root, Syscall::Open { path: "/data".to_string() }) {
            SyscallOutcome::Value(fd) => fd as i32,
            SyscallOutcome::Terminate(_) => panic!("open terminated the process"),
        };

        const ADDR: u64 = 0x1000;
        let mapping = match kernel.handle_syscall(root, Syscall::Mmap { fd, addr: ADDR }) {
            SyscallOutcome::Value(mapping) => mapping as i32,
            SyscallOutcome::Terminate(_) => panic!("mmap terminated the process"),
        };

        // Reading through fd 0 (stdin) into the mapped address faults the
        // page in, then zeroes the one byte it "reads" — a real modification
        // made through the mapping rather than through the file API.
        let esp = 0xBFFF_FFFC;
        let read = kernel.handle_syscall(root, Syscall::Read { fd: 0, buf_addr: ADDR, size: 1, esp });
        assert!(matches!(read, SyscallOutcome::Value(1)));

        let unmap = kernel.handle_syscall(root, Syscall::Munmap { mapping });
        assert!(matches!(unmap, SyscallOutcome::Value(_)));

        let reopened = kernel.fs.open("/data", None).unwrap();
        let mut buf = [0u8; 11];
        reopened.read_at(&kernel.fs.cache, &mut buf, 0);
        kernel.fs.close(&reopened);
        assert_eq!(&buf, b"\0ello world");
    }
}
