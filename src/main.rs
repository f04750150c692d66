//! `vellumd`: boots the kernel, mounts or formats its simulated disks, runs
//! one demo program through the process lifecycle and syscall dispatcher,
//! then shuts down. There is no real ELF loader or trap frame here (spec
//! §1's external collaborators); the demo program is a
//! [`vellum::process::ProgramLoader`] whose `load` drives the syscall
//! dispatcher directly and runs to completion before returning, the way the
//! trait doc promises: "run the simulated program body synchronously and
//! return once it has finished".

use std::sync::{Arc, OnceLock, Weak};

use clap::Parser;
use log::LevelFilter;

use vellum::block::MemoryBlockDevice;
use vellum::config::KernelConfig;
use vellum::klog;
use vellum::kernel::Kernel;
use vellum::process::syscall::{fibonacci, max_of_four, Syscall, SyscallOutcome};
use vellum::process::{Process, ProgramLoader};

const USER_POOL_FRAMES: usize = 64;

/// A tiny demo "program": exercises the teaching syscalls plus a
/// create/open/close round trip against its own process, then exits.
/// Holds the kernel weakly, set once after `Kernel::boot`/`mount` returns,
/// to avoid an `Arc` cycle between the kernel and the loader it owns.
struct DemoProgram {
    kernel: OnceLock<Weak<Kernel>>,
}

impl DemoProgram {
    fn new() -> Self {
        Self { kernel: OnceLock::new() }
    }
}

impl ProgramLoader for DemoProgram {
    fn load(&self, command_line: &str, process: &Process) -> bool {
        log::info!("loading demo program: {command_line}");
        let Some(kernel) = self.kernel.get().and_then(Weak::upgrade) else {
            return false;
        };
        run_demo_syscalls(&kernel, process.tid);
        true
    }
}

fn run_demo_syscalls(kernel: &Arc<Kernel>, tid: u32) {
    let fib = kernel.handle_syscall(tid, Syscall::Fibonacci { n: 10 });
    log_outcome("fibonacci(10)", &fib);
    debug_assert_eq!(fibonacci(10), 55);

    let max = kernel.handle_syscall(tid, Syscall::MaxOfFour { a: 7, b: 2, c: 9, d: 4 });
    log_outcome("max_of_four(7, 2, 9, 4)", &max);
    debug_assert_eq!(max_of_four(7, 2, 9, 4), 9);

    let created = kernel.handle_syscall(
        tid,
        Syscall::Create { path: "/greeting.txt".to_string(), initial_size: 0 },
    );
    log_outcome("create(/greeting.txt)", &created);

    let opened = kernel.handle_syscall(tid, Syscall::Open { path: "/greeting.txt".to_string() });
    if let SyscallOutcome::Value(fd) = opened {
        log::info!("opened /greeting.txt as fd {fd}");
        let _ = kernel.handle_syscall(tid, Syscall::Close { fd: fd as i32 });
    }
}

fn log_outcome(label: &str, outcome: &SyscallOutcome) {
    match outcome {
        SyscallOutcome::Value(v) => log::info!("{label} = {v}"),
        SyscallOutcome::Terminate(status) => log::warn!("{label} terminated the process with status {status}"),
    }
}

fn main() {
    let config = KernelConfig::parse();
    klog::init(LevelFilter::Info);

    let fs_device = Arc::new(MemoryBlockDevice::new(config.fs_sectors));
    let swap_device = Arc::new(MemoryBlockDevice::new(config.swap_sectors));
    let demo = Arc::new(DemoProgram::new());
    let loader: Arc<dyn ProgramLoader> = demo.clone();

    let kernel = if config.format {
        Kernel::boot(fs_device, swap_device, USER_POOL_FRAMES, loader)
    } else {
        Kernel::mount(fs_device, swap_device, USER_POOL_FRAMES, loader)
    };
    demo.kernel.set(Arc::downgrade(&kernel)).ok();

    let root = kernel.spawn_root("init");
    match kernel.execute(root, "demo arg1 arg2") {
        Ok(child) => {
            let status = kernel.wait(root, child).expect("init always waits successfully on its only child");
            log::info!("demo process exited with status {status}");
        }
        Err(err) => log::error!("failed to start demo process: {err}"),
    }

    kernel.exit(root, 0);
    kernel.shutdown();
}
