//! Kernel console logger.
//!
//! The teacher's `Console`/`Printer` pair writes kernel diagnostics directly
//! to a UART; this hosted build has no UART, so diagnostics are routed
//! through the `log` facade instead and printed to stderr, prefixed with the
//! logical tick count so interleavings in tests are easy to read back.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

static TICK: AtomicU64 = AtomicU64::new(0);

pub fn bump_tick(now: u64) {
    TICK.store(now, Ordering::Relaxed);
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!(
            "[{:>6}] {:<5} {}: {}",
            TICK.load(Ordering::Relaxed),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the kernel logger. Idempotent: safe to call from every test and
/// from `main`.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(level));
}
