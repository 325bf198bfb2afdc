//! C5: global shared-segment registry.
//!
//! Authoritative per-page state (`MAPPED`/`DIRTY`/`REFERENCE`/`SWAPPED` and
//! the current frame/cluster) for a shared segment lives here, once, rather
//! than being fanned out across every connected process's L1 entry. Each
//! connected process's own L1 entry only carries its rights, `VALID`, and
//! the `(shared_segment_id, shared_page_id)` pair pointing back at this
//! descriptor. This collapses the "keep N processes' copies of the same
//! flags in sync" bookkeeping the source `SharedSegmentDescr`/fan-out does
//! in `getVictim`/`pageFault`/`disconnectSharedSegment` into a single
//! source of truth, and makes "pick the ring representative" unnecessary:
//! the ring entry for a shared page is keyed by `(segment_id, page_idx)`,
//! independent of which process happens to be connected.

use std::collections::HashMap;

use crate::addr::{ClusterNo, FrameNo, ProcessId, VirtualAddress, SHARED_SEGMENT_ID_LIMIT};
use crate::error::VmError;
use crate::AccessType;

/// Authoritative state of one page within a shared segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedPageState {
    pub flags: u32,
    pub location: u32,
}

pub struct SharedSegmentDescr {
    pub id: u32,
    pub name: String,
    pub start: VirtualAddress,
    pub size_pages: u32,
    pub rights: AccessType,
    pub connected: Vec<ProcessId>,
    pub pages: Vec<SharedPageState>,
}

impl SharedSegmentDescr {
    #[must_use]
    pub fn end_inclusive(&self) -> VirtualAddress {
        self.start + self.size_pages * crate::addr::PAGE_SIZE - 1
    }
}

pub struct SharedRegistry {
    by_name: HashMap<String, u32>,
    by_id: HashMap<u32, SharedSegmentDescr>,
    next_id: u32,
    freed_ids: Vec<u32>,
}

impl SharedRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            freed_ids: Vec::new(),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Option<&SharedSegmentDescr> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn by_id(&self, id: u32) -> Option<&SharedSegmentDescr> {
        self.by_id.get(&id)
    }

    pub fn by_id_mut(&mut self, id: u32) -> Option<&mut SharedSegmentDescr> {
        self.by_id.get_mut(&id)
    }

    /// `id` must lie in `[1, 1024)`; `0` means "not shared" in a page-table entry.
    fn alloc_id(&mut self) -> Result<u32, VmError> {
        if let Some(id) = self.freed_ids.pop() {
            return Ok(id);
        }
        if self.next_id >= SHARED_SEGMENT_ID_LIMIT {
            return Err(VmError::SharedIdExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    pub fn overlaps_any(&self, start: VirtualAddress, size_pages: u32) -> bool {
        let end = start + size_pages * crate::addr::PAGE_SIZE - 1;
        self.by_id
            .values()
            .any(|s| crate::segment::overlaps(start, end, s.start, s.end_inclusive()))
    }

    /// Registers a brand new shared segment and connects `pid` to it.
    ///
    /// # Errors
    /// `Overlap` if `[start, start + size_pages)` overlaps any other shared
    /// segment already registered (global shared-vs-shared check; private
    /// segment overlap is enforced separately, per process).
    pub fn create(
        &mut self,
        name: String,
        start: VirtualAddress,
        size_pages: u32,
        rights: AccessType,
        pid: ProcessId,
    ) -> Result<u32, VmError> {
        if self.overlaps_any(start, size_pages) {
            return Err(VmError::Overlap);
        }
        let id = self.alloc_id()?;
        let descr = SharedSegmentDescr {
            id,
            name: name.clone(),
            start,
            size_pages,
            rights,
            connected: vec![pid],
            pages: vec![SharedPageState::default(); size_pages as usize],
        };
        self.by_name.insert(name, id);
        self.by_id.insert(id, descr);
        Ok(id)
    }

    /// Connects `pid` to an existing shared segment, returning its id and
    /// geometry for the caller to map into the process's own page table.
    pub fn connect(&mut self, name: &str, pid: ProcessId) -> Result<(u32, VirtualAddress, u32, AccessType), VmError> {
        let id = *self.by_name.get(name).ok_or(VmError::UnknownSharedSegment)?;
        let descr = self.by_id.get_mut(&id).expect("by_name/by_id consistency");
        if !descr.connected.contains(&pid) {
            descr.connected.push(pid);
        }
        Ok((descr.id, descr.start, descr.size_pages, descr.rights))
    }

    /// Removes `pid` from the segment's connected-process list. Returns the
    /// descriptor if `pid` was the last connection, so the caller can
    /// release its frames/clusters and drop the registry entry.
    pub fn disconnect(&mut self, id: u32, pid: ProcessId) -> Result<Option<SharedSegmentDescr>, VmError> {
        let descr = self.by_id.get_mut(&id).ok_or(VmError::UnknownSharedSegment)?;
        let before = descr.connected.len();
        descr.connected.retain(|&p| p != pid);
        if descr.connected.len() == before {
            return Err(VmError::NotConnected);
        }
        if descr.connected.is_empty() {
            let descr = self.by_id.remove(&id).expect("present");
            self.by_name.remove(&descr.name);
            self.freed_ids.push(id);
            return Ok(Some(descr));
        }
        Ok(None)
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_connect_shares_one_descriptor() {
        let mut reg = SharedRegistry::new();
        let id = reg.create("shm".into(), 0, 2, AccessType::ReadWrite, 1).unwrap();
        let (id2, start, size, rights) = reg.connect("shm", 2).unwrap();
        assert_eq!(id, id2);
        assert_eq!(start, 0);
        assert_eq!(size, 2);
        assert_eq!(rights, AccessType::ReadWrite);
        assert_eq!(reg.by_id(id).unwrap().connected, vec![1, 2]);
    }

    #[test]
    fn disconnect_only_tears_down_on_last_process() {
        let mut reg = SharedRegistry::new();
        let id = reg.create("shm".into(), 0, 1, AccessType::Read, 1).unwrap();
        reg.connect("shm", 2).unwrap();
        assert!(reg.disconnect(id, 1).unwrap().is_none());
        assert!(reg.by_id(id).is_some());
        assert!(reg.disconnect(id, 2).unwrap().is_some());
        assert!(reg.by_id(id).is_none());
        assert!(reg.get_by_name("shm").is_none());
    }

    #[test]
    fn create_rejects_overlap_with_another_shared_segment() {
        let mut reg = SharedRegistry::new();
        reg.create("a".into(), 0, 4, AccessType::Read, 1).unwrap();
        let err = reg.create("b".into(), 2, 4, AccessType::Read, 2).unwrap_err();
        assert_eq!(err, VmError::Overlap);
        // the rejected attempt must not have consumed an id
        let id_b = reg.create("b".into(), 4, 1, AccessType::Read, 2).unwrap();
        assert_eq!(id_b, 2);
    }

    #[test]
    fn ids_are_reused_after_teardown() {
        let mut reg = SharedRegistry::new();
        let id = reg.create("a".into(), 0, 1, AccessType::Read, 1).unwrap();
        reg.disconnect(id, 1).unwrap();
        let id2 = reg.create("b".into(), 0, 1, AccessType::Read, 1).unwrap();
        assert_eq!(id, id2);
    }
}
