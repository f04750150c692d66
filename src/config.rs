//! Kernel command line (spec §6): selects the MLFQS scheduler and whether
//! the file-system partition is reformatted on boot.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "vellumd", about = "A small educational kernel")]
pub struct KernelConfig {
    /// Use the multilevel-feedback-queue scheduler instead of strict priority
    /// scheduling. Mutually exclusive with manual `set_priority` calls.
    #[arg(short = 'o', long = "mlfqs", default_value_t = false)]
    pub mlfqs: bool,

    /// Reformat the file-system partition before mounting it.
    #[arg(short = 'f', long = "format", default_value_t = false)]
    pub format: bool,

    /// Number of sectors on the simulated file-system partition.
    #[arg(long = "fs-sectors", default_value_t = 8192)]
    pub fs_sectors: u32,

    /// Number of sectors on the simulated swap partition.
    #[arg(long = "swap-sectors", default_value_t = 4096)]
    pub swap_sectors: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mlfqs: false,
            format: true,
            fs_sectors: 8192,
            swap_sectors: 4096,
        }
    }
}
