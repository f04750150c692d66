//! `vellum`: a small educational operating-system kernel, built as a hosted
//! simulation (SPEC_FULL.md §0) rather than bare metal. Every subsystem a
//! real kernel would own behind file-scope statics is instead owned by one
//! [`Kernel`] value and reached through a handle into it (spec §9).
//!
//! - [`block`] / [`cache`] — the raw block device and its buffer cache (A, B).
//! - [`fs`] — free map, inode and directory layers, and the file-system
//!   façade that ties them together (C, D, E, F).
//! - [`vm`] — swap area, frame table, supplemental page table, and the
//!   page-fault resolver (G, H, I, J).
//! - [`thread`] — the scheduler simulation and MLFQS fixed-point math (K).
//! - [`sync`] — semaphore, lock, condition variable, reader/writer gate (L).
//! - [`process`] — process lifecycle, open-file/mmap tables, and the
//!   syscall dispatcher (M, N).
//! - [`kernel`] — the root value wiring all of the above together.
//! - [`config`] — the kernel command line (clap).
//! - [`klog`] — the `log` facade's console sink.
//! - [`error`] — the shared `KernelError`/`KResult` types.

pub mod block;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod klog;
pub mod process;
pub mod sync;
pub mod thread;
pub mod vm;

pub use error::{KResult, KernelError};
pub use kernel::Kernel;
