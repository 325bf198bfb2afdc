//! A paged, demand-loaded virtual memory emulator core.
//!
//! Each process gets its own two-level page table backed by a fixed pool of
//! physical frames and a swap partition. Pages are loaded on demand, evicted
//! by a clock (second-chance) algorithm shared across every process, and may
//! be mapped privately or through a named, reference-counted shared segment.
//! Address spaces clone copy-on-write-free: private pages get an immediate
//! fresh copy, shared pages stay shared.
//!
//! Start with [`System::new`] to build an instance over a [`Partition`], then
//! [`System::create_process`] to get a [`Process`] handle.

mod addr;
mod clone;
mod cluster;
mod config;
mod engine;
mod error;
mod frame;
mod pagetable;
mod partition;
mod process;
mod ring;
mod segment;
mod shared;
mod system;

pub use addr::{PhysicalLocation, ProcessId, VirtualAddress};
pub use config::{ConfigError, PartitionConfig};
pub use error::VmError;
pub use partition::{FileBackedPartition, MemoryPartition, Partition};
pub use process::Process;
pub use system::System;

/// Outcome of a memory-access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The access is permitted and the page is resident.
    Ok,
    /// The page exists but isn't resident; call [`Process::page_fault`].
    PageFault,
    /// The operation could not complete: bad address, exhausted resource,
    /// unknown process/segment, and so on. Collapsed from a [`VmError`];
    /// see logs for the specific cause.
    Trap,
    /// Reserved for a rights violation distinct from a generic trap.
    /// Currently folded into `Trap` like every other failure, kept as its
    /// own variant for API compatibility with callers that match on it.
    AccessViolation,
}

/// The kind of access being attempted against a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    ReadWrite,
    Execute,
}
