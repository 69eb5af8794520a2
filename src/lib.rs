//! # minos: an instructional kernel core
//!
//! `minos` implements the hard, interlocking subsystems of a small
//! instructional operating system as a hosted Rust library:
//!
//! - **Synchronization primitives**: a counting [`Semaphore`] with a
//!   priority-ordered wait set, a sleeping [`Mutex`] with nested priority
//!   donation, a Mesa-style [`ConditionVariable`], and a fair [`RwLock`]
//!   whose admission policy bounds both reader and writer streaks.
//! - **A buffer cache** over a 512-byte-sector block device, with a
//!   two-class clock eviction policy, an asynchronous read-ahead worker,
//!   and a periodic write-back flusher.
//! - **A multi-level indexed inode layer** (direct, indirect, and doubly
//!   indirect blocks) providing sparse, growable files on top of the cache,
//!   together with the free-map that backs sector allocation.
//! - **A demand-paging core**: per-process supplemental page tables, a swap
//!   area, and a frame table driven by a two-handed clock with per-frame
//!   pinning.
//!
//! The surrounding kernel (boot, interrupt delivery, the MMU, ELF loading,
//! the directory layer, and the disk driver proper) is treated as an
//! external collaborator. Threads are backed by OS threads behind the
//! kernel-style thread interface in [`thread`]; the block device is the
//! [`fs::BlockDevice`] trait; "interrupts disabled" is a single global
//! scheduler-state lock, which serializes priority and donation transitions
//! exactly as disabling interrupts does on a single CPU.
//!
//! Global state is deliberately scarce: the scheduler mode and the thread
//! registry are process-wide, while the cache, file system, swap area, and
//! frame table are ordinary values so that every test can build a fresh
//! instance.
//!
//! [`Semaphore`]: sync::Semaphore
//! [`Mutex`]: sync::Mutex
//! [`ConditionVariable`]: sync::ConditionVariable
//! [`RwLock`]: sync::RwLock

#[macro_use]
extern crate static_assertions;

pub mod channel;
pub mod fs;
pub mod mm;
pub mod sync;
pub mod thread;

use thread::scheduler::{self, SchedulerMode};

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by a kernel operation.
/// Each variant corresponds to a specific type of error that might occur
/// during the handling of a kernel operation. These errors can be returned
/// to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File system is corrupted. (EFSCORRUPTED)
    FilesystemCorrupted(&'static str),
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] into the corresponding negated errno
    /// value, cast to `usize` for use as a raw system-call return value.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::FilesystemCorrupted(_) => -117,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] provides an interface for configuring
/// system-wide settings before any thread synchronization takes place. It is
/// consumed once at boot by the embedding kernel; tests construct one per
/// scenario instead.
pub struct SystemConfigurationBuilder {
    _p: (),
}

impl SystemConfigurationBuilder {
    /// Creates a new configuration builder.
    pub fn new() -> Self {
        Self { _p: () }
    }

    /// Sets the system-wide scheduler mode.
    ///
    /// Priority donation is active under [`SchedulerMode::RoundRobin`] and
    /// disabled under [`SchedulerMode::Mlfqs`], whose scheduler recomputes
    /// priorities on its own schedule and treats donation as incompatible.
    pub fn set_scheduler_mode(self, mode: SchedulerMode) -> Self {
        scheduler::set_mode(mode);
        self
    }
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
