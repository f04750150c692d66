//! Kernel-wide error type.
//!
//! Fatal invariant violations (duplicate open inode, bad magic, unreachable
//! scheduler state, resource exhaustion) are not represented here: those
//! `panic!` at the point of discovery, per the spec's error-handling design
//! (fatal kernel bugs vs. expected, recoverable failures). `KernelError` only
//! covers the latter: conditions a caller is expected to handle.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("no such file or directory")]
    NotFound,
    #[error("name already in use")]
    NameInUse,
    #[error("file name exceeds 14 bytes")]
    NameTooLong,
    #[error("name is empty")]
    NameEmpty,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("file length would exceed the maximum supported length")]
    FileTooLarge,
    #[error("no free sector available on device")]
    DeviceFull,
    #[error("no free swap slot available")]
    SwapFull,
    #[error("descriptor table is full")]
    TooManyOpenFiles,
    #[error("invalid file descriptor")]
    BadDescriptor,
    #[error("write denied: file is currently executing")]
    WriteDenied,
    #[error("invalid user pointer")]
    BadPointer,
    #[error("executable could not be loaded")]
    LoadFailed,
    #[error("child process has already been waited for")]
    AlreadyWaited,
    #[error("no such process")]
    NoSuchProcess,
}

pub type KResult<T> = Result<T, KernelError>;
