//! C8: process manager and the root [`System`] object.
//!
//! Lock order, enforced by construction rather than convention: whenever a
//! process's own mutex and the system mutex are both needed, the system
//! mutex is taken first. No code path acquires a process mutex before the
//! system mutex, and no code path holds two process mutexes at once: a
//! process's own entry and a same-process victim entry are always accessed
//! as two short, sequential critical sections rather than one held across
//! both. Allocator mutexes ([`crate::cluster::ClusterAllocator`],
//! [`crate::frame::FrameAllocator`]) are leaves, taken without the system
//! mutex held. [`crate::engine`]'s `try_access`/`try_page_fault` go further:
//! the system mutex is dropped entirely around frame allocation and swap
//! I/O, re-taken only for the short bookkeeping steps either side of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::addr::{FrameNo, ProcessId, L0_ENTRIES, NO_PID, PAGE_SIZE};
use crate::cluster::ClusterAllocator;
use crate::error::VmError;
use crate::frame::FrameAllocator;
use crate::pagetable::L1TableSlot;
use crate::partition::Partition;
use crate::ring::ReplacementRing;
use crate::segment::SegmentDescr;
use crate::shared::SharedRegistry;
use crate::AccessType;

pub(crate) struct PidPool {
    next_unused: ProcessId,
    freed: Vec<ProcessId>,
}

impl PidPool {
    fn new() -> Self {
        Self {
            next_unused: 0,
            freed: Vec::new(),
        }
    }

    fn take(&mut self) -> Result<ProcessId, VmError> {
        if let Some(p) = self.freed.pop() {
            return Ok(p);
        }
        if self.next_unused == NO_PID {
            return Err(VmError::PidExhausted);
        }
        let p = self.next_unused;
        self.next_unused += 1;
        Ok(p)
    }

    fn free(&mut self, pid: ProcessId) {
        self.freed.push(pid);
    }
}

/// Per-process state guarded by its own mutex: the two-level page table and
/// the list of private segments. Never locked except while the system mutex
/// is already held by the calling operation.
pub(crate) struct ProcessData {
    pub l0_pmt_frame: FrameNo,
    pub l0: Vec<Option<L1TableSlot>>,
    pub segments: Vec<SegmentDescr>,
}

impl ProcessData {
    fn new(l0_pmt_frame: FrameNo) -> Self {
        Self {
            l0_pmt_frame,
            l0: (0..L0_ENTRIES).map(|_| None).collect(),
            segments: Vec::new(),
        }
    }
}

/// Everything guarded by [`System::state`]: the pid pool, the process
/// registry, the shared-segment registry, and the replacement ring. Put
/// together because every page fault may need all four.
pub(crate) struct SystemState {
    pub pids: PidPool,
    pub processes: HashMap<ProcessId, Arc<Mutex<ProcessData>>>,
    pub shared: SharedRegistry,
    pub ring: ReplacementRing,
}

/// A virtual memory emulator instance: one swap partition, one user-frame
/// pool, one pmt-space frame pool, and the process registry backing it.
pub struct System {
    pub(crate) state: Mutex<SystemState>,
    pub(crate) user_frames: FrameAllocator,
    pub(crate) user_memory: Mutex<Vec<u8>>,
    pub(crate) pmt_frames: FrameAllocator,
    pub(crate) disk: ClusterAllocator,
    pub(crate) partition: Arc<dyn Partition>,
}

impl System {
    /// `user_frame_count` frames of process memory and `pmt_frame_count`
    /// frames of page-table space are carved out up front; `partition`
    /// backs eviction.
    #[must_use]
    pub fn new(user_frame_count: u32, pmt_frame_count: u32, partition: Arc<dyn Partition>) -> Self {
        Self {
            state: Mutex::new(SystemState {
                pids: PidPool::new(),
                processes: HashMap::new(),
                shared: SharedRegistry::new(),
                ring: ReplacementRing::new(),
            }),
            user_frames: FrameAllocator::new(user_frame_count),
            user_memory: Mutex::new(vec![0u8; user_frame_count as usize * PAGE_SIZE as usize]),
            pmt_frames: FrameAllocator::new(pmt_frame_count),
            disk: ClusterAllocator::new(partition.num_clusters()),
            partition,
        }
    }

    pub(crate) fn read_frame(&self, frame: FrameNo, buf: &mut [u8; PAGE_SIZE as usize]) {
        let mem = self.user_memory.lock().unwrap();
        let off = frame as usize * PAGE_SIZE as usize;
        buf.copy_from_slice(&mem[off..off + PAGE_SIZE as usize]);
    }

    pub(crate) fn write_frame(&self, frame: FrameNo, buf: &[u8; PAGE_SIZE as usize]) {
        let mut mem = self.user_memory.lock().unwrap();
        let off = frame as usize * PAGE_SIZE as usize;
        mem[off..off + PAGE_SIZE as usize].copy_from_slice(buf);
    }

    /// Reads `buf.len()` bytes starting at `loc` out of process memory. The
    /// Rust-safe stand-in for a client dereferencing the physical address it
    /// got back from [`crate::Process::get_physical_address`].
    pub fn read_physical(&self, loc: crate::addr::PhysicalLocation, buf: &mut [u8]) {
        let mem = self.user_memory.lock().unwrap();
        let off = loc.frame as usize * PAGE_SIZE as usize + loc.offset as usize;
        buf.copy_from_slice(&mem[off..off + buf.len()]);
    }

    pub fn write_physical(&self, loc: crate::addr::PhysicalLocation, data: &[u8]) {
        let mut mem = self.user_memory.lock().unwrap();
        let off = loc.frame as usize * PAGE_SIZE as usize + loc.offset as usize;
        mem[off..off + data.len()].copy_from_slice(data);
    }

    /// Creates a new, empty process.
    ///
    /// # Errors
    /// Returns `Err(Status::Trap)` if the pid space or pmt space is exhausted.
    pub fn create_process(self: &Arc<Self>) -> Result<crate::process::Process, crate::Status> {
        let pid = self.try_create_process()?;
        Ok(crate::process::Process::new(Arc::clone(self), pid))
    }

    /// Tears down `process` and releases every resource it held. The handle
    /// is still usable afterwards but every operation on it will report
    /// `Status::Trap` (unknown process).
    pub fn destroy_process(&self, process: &crate::process::Process) -> crate::Status {
        self.destroy_process_by_id(process.pid())
            .map_or_else(Into::into, |()| crate::Status::Ok)
    }

    /// Clones the address space of the process identified by `pid` into a
    /// brand new process, by pid rather than through an owned [`Process`]
    /// handle. Equivalent to [`crate::Process::clone_address_space`] on a
    /// handle for that pid.
    ///
    /// # Errors
    /// `Status::Trap` if `pid` is unknown or a resource needed to build the
    /// clone (pid, pmt space, swap clusters) is exhausted.
    pub fn clone_process(self: &Arc<Self>, pid: ProcessId) -> Result<crate::process::Process, crate::Status> {
        crate::process::Process::new(Arc::clone(self), pid).clone_address_space()
    }

    /// Entry point for the external hardware driver: resolves a single
    /// memory access for `pid` at `vaddr`, reporting a page fault rather
    /// than servicing it. Equivalent to [`crate::Process::access`] on a
    /// handle for that pid.
    #[must_use]
    pub fn access(&self, pid: ProcessId, vaddr: crate::addr::VirtualAddress, access: AccessType) -> crate::Status {
        crate::engine::try_access(self, pid, vaddr, access).unwrap_or_else(Into::into)
    }

    /// Periodic housekeeping hook for the external façade. This core has no
    /// time-driven maintenance (no fairness ageing, no background
    /// writeback); matches the source, which also always returns 0.
    #[must_use]
    pub fn periodic_job(&self) -> u32 {
        0
    }

    /// Registers a new, empty process and returns its pid.
    pub(crate) fn try_create_process(&self) -> Result<ProcessId, VmError> {
        let mut state = self.state.lock().unwrap();
        let pid = state.pids.take()?;
        let Some(l0_frame) = self.pmt_frames.alloc() else {
            state.pids.free(pid);
            return Err(VmError::PmtSpaceExhausted);
        };
        state
            .processes
            .insert(pid, Arc::new(Mutex::new(ProcessData::new(l0_frame))));
        log::debug!("created process {pid}");
        Ok(pid)
    }

    /// Tears down a process: releases its mapped frames, swapped clusters,
    /// pmt-space frames, and disconnects it from any shared segments it was
    /// still attached to.
    ///
    /// `pid` is removed from the registry before its per-process mutex is
    /// taken, so no later lookup can hand out a fresh clone of its `Arc`;
    /// but another in-flight operation on this same pid (segment create,
    /// load, clone, ...) may already hold one from before the removal. This
    /// locks through that shared `Arc<Mutex<_>>` rather than requiring
    /// `Arc::try_unwrap`'s unique ownership, blocking on the other
    /// operation's own critical section rather than panicking on it — safe
    /// under the crate's lock order (system mutex, held here, is always
    /// acquired before a process mutex, never the reverse), so no such
    /// operation can be the one blocking on the system mutex in turn.
    pub(crate) fn destroy_process_by_id(&self, pid: ProcessId) -> Result<(), VmError> {
        log::debug!("destroying process {pid}");
        let mut state = self.state.lock().unwrap();
        let Some(arc) = state.processes.remove(&pid) else {
            return Err(VmError::UnknownProcess);
        };
        let data = arc.lock().unwrap();

        for l0 in 0..L0_ENTRIES {
            let Some(slot) = data.l0[l0].as_ref() else { continue };
            for l1 in 0..crate::addr::L1_ENTRIES {
                let entry = slot.entries[l1];
                if !entry.is_set(crate::pagetable::VALID) {
                    continue;
                }
                let shared_id = entry.shared_segment_id();
                if shared_id != 0 {
                    if let Ok(Some(descr)) = state.shared.disconnect(shared_id, pid) {
                        for (idx, pg) in descr.pages.iter().enumerate() {
                            if pg.flags & crate::pagetable::MAPPED != 0 {
                                self.user_frames.dealloc(pg.location);
                                state.ring.unlink(crate::ring::EntryKey::Shared {
                                    segment_id: shared_id,
                                    page_idx: idx as u32,
                                });
                            } else if pg.flags & crate::pagetable::SWAPPED != 0 {
                                self.disk.free(pg.location);
                            }
                        }
                    }
                } else {
                    if entry.is_set(crate::pagetable::MAPPED) {
                        self.user_frames.dealloc(entry.location);
                        state.ring.unlink(crate::ring::EntryKey::Private { pid, l0, l1 });
                    } else if entry.is_set(crate::pagetable::SWAPPED) {
                        self.disk.free(entry.location);
                    }
                }
            }
            self.pmt_frames.dealloc(slot.pmt_frame);
        }
        self.pmt_frames.dealloc(data.l0_pmt_frame);
        state.pids.free(pid);
        Ok(())
    }
}
