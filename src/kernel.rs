//! The root `Kernel` value (spec §9 "global mutable state"): every
//! subsystem — buffer cache, free map, frame table, swap, scheduler,
//! process table — is owned here instead of living behind file-scope
//! statics, and every other module receives a handle into it rather than
//! reaching for global state.

use std::sync::{Arc, Mutex};

use crate::block::BlockDevice;
use crate::fs::FileSystem;
use crate::process::{ProcessTable, ProgramLoader};
use crate::thread::Scheduler;
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapArea;

pub struct Kernel {
    pub fs: FileSystem,
    pub frame_table: FrameTable,
    pub swap: Arc<SwapArea>,
    pub scheduler: Mutex<Scheduler>,
    pub processes: ProcessTable,
    pub loader: Arc<dyn ProgramLoader>,
}

impl Kernel {
    /// Formats a fresh file system on `fs_device` and boots the kernel with
    /// `frame_count` user-pool frames backed by `swap_device`.
    pub fn boot(
        fs_device: Arc<dyn BlockDevice>,
        swap_device: Arc<dyn BlockDevice>,
        frame_count: usize,
        loader: Arc<dyn ProgramLoader>,
    ) -> Arc<Self> {
        let sector_count = fs_device.sector_count();
        let fs = FileSystem::format(fs_device, sector_count).expect("format failed");
        Self::assemble(fs, swap_device, frame_count, loader)
    }

    /// Mounts an already-formatted file system instead of reformatting it
    /// (spec §6: the kernel command line's format flag).
    pub fn mount(
        fs_device: Arc<dyn BlockDevice>,
        swap_device: Arc<dyn BlockDevice>,
        frame_count: usize,
        loader: Arc<dyn ProgramLoader>,
    ) -> Arc<Self> {
        let fs = FileSystem::mount(fs_device);
        Self::assemble(fs, swap_device, frame_count, loader)
    }

    fn assemble(
        fs: FileSystem,
        swap_device: Arc<dyn BlockDevice>,
        frame_count: usize,
        loader: Arc<dyn ProgramLoader>,
    ) -> Arc<Self> {
        let swap = Arc::new(SwapArea::new(swap_device));
        Arc::new(Self {
            fs,
            frame_table: FrameTable::new(swap.clone(), frame_count),
            swap,
            scheduler: Mutex::new(Scheduler::new(false)),
            processes: ProcessTable::new(),
            loader,
        })
    }

    /// Best-effort flush of every dirty buffer-cache slot (spec §4.B, §7:
    /// crash consistency beyond this is explicitly not guaranteed).
    pub fn shutdown(&self) {
        self.fs.shutdown();
    }
}
