//! Public, cheaply-cloneable handle to one process's address space. All
//! state lives behind [`System`]; a `Process` is just `(Arc<System>, pid)`.

use std::sync::Arc;

use crate::addr::{PhysicalLocation, ProcessId, VirtualAddress};
use crate::engine;
use crate::system::System;
use crate::{AccessType, Status};

#[derive(Clone)]
pub struct Process {
    system: Arc<System>,
    pid: ProcessId,
}

impl Process {
    pub(crate) fn new(system: Arc<System>, pid: ProcessId) -> Self {
        Self { system, pid }
    }

    #[must_use]
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    #[must_use]
    pub fn system(&self) -> &Arc<System> {
        &self.system
    }

    /// Checks `vaddr` is backed, permitted for `access`, and resident.
    /// Returns [`Status::PageFault`] rather than faulting the page in;
    /// callers drive the fault themselves via [`Process::page_fault`].
    #[must_use]
    pub fn access(&self, vaddr: VirtualAddress, access: AccessType) -> Status {
        engine::try_access(&self.system, self.pid, vaddr, access).unwrap_or_else(Into::into)
    }

    /// Services a page fault for `vaddr`: allocates or evicts a frame,
    /// brings the page's content in from swap if needed, and maps it.
    #[must_use]
    pub fn page_fault(&self, vaddr: VirtualAddress) -> Status {
        engine::try_page_fault(&self.system, self.pid, vaddr).unwrap_or_else(Into::into)
    }

    /// The physical location backing `vaddr`, if currently mapped.
    /// Precondition: a prior `access` returned `Status::Ok`.
    #[must_use]
    pub fn get_physical_address(&self, vaddr: VirtualAddress) -> Option<PhysicalLocation> {
        engine::try_get_physical_address(&self.system, self.pid, vaddr)
    }

    pub fn create_segment(&self, start: VirtualAddress, size_pages: u32, rights: AccessType) -> Status {
        engine::try_create_segment(&self.system, self.pid, start, size_pages, rights)
            .map_or_else(Into::into, |()| Status::Ok)
    }

    /// Creates a private segment pre-populated with `content` on swap.
    pub fn load_segment(&self, start: VirtualAddress, size_pages: u32, rights: AccessType, content: &[u8]) -> Status {
        engine::try_load_segment(&self.system, self.pid, start, size_pages, rights, content)
            .map_or_else(Into::into, |()| Status::Ok)
    }

    pub fn delete_segment(&self, start: VirtualAddress) -> Status {
        engine::try_delete_segment(&self.system, self.pid, start).map_or_else(Into::into, |()| Status::Ok)
    }

    /// Creates the named shared segment, or connects to it if some other
    /// process already created it (geometry must match).
    pub fn create_shared_segment(&self, start: VirtualAddress, size_pages: u32, name: &str, rights: AccessType) -> Status {
        engine::try_create_shared_segment(&self.system, self.pid, start, size_pages, name, rights)
            .map_or_else(Into::into, |()| Status::Ok)
    }

    /// Disconnects from a shared segment. The segment itself, and its
    /// resident/swapped pages, are torn down once the last process
    /// disconnects.
    pub fn disconnect_shared_segment(&self, name: &str) -> Status {
        engine::try_disconnect_shared_segment(&self.system, self.pid, name).map_or_else(Into::into, |()| Status::Ok)
    }

    /// Same as [`Process::disconnect_shared_segment`]: there is no
    /// force-delete distinct from every connected process leaving.
    pub fn delete_shared_segment(&self, name: &str) -> Status {
        self.disconnect_shared_segment(name)
    }

    /// Clones this process's entire address space into a brand new
    /// process. Private pages get fresh, swap-resident copies; shared
    /// pages stay shared (the clone just joins the connection list).
    pub fn clone_address_space(&self) -> Result<Process, Status> {
        crate::clone::clone_process(self).map_err(Into::into)
    }
}
