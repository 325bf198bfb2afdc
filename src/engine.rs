//! C7: the paging engine: `access`, `page_fault`, `get_physical_address`,
//! segment create/load/delete, and the shared-segment API. Implemented as
//! free functions over [`System`] rather than methods directly on
//! [`crate::Process`], since several of them (page fault, in particular)
//! need the system mutex for one process's own entry and a possibly-different
//! victim entry, taken as short, separate critical sections.
//!
//! `try_access` and `try_page_fault` only hold the system mutex to resolve
//! the faulting entry's key, to run clock-algorithm victim selection, and to
//! commit the final flag/location update plus ring link. The frame
//! allocator's own `alloc` (the fast path, no eviction needed) and every
//! partition read/write (swap I/O) run with the system mutex released, so
//! concurrent faults on different processes are serialized only by the
//! frame allocator's mutex, not by one global lock.

use crate::addr::{is_vaddr_valid, l0_entry, l1_entry, FrameNo, ProcessId, VirtualAddress, PAGE_SIZE};
use crate::error::VmError;
use crate::pagetable::{L1Entry, L1TableSlot, DIRTY, MAPPED, REFERENCE, SWAPPED, VALID};
use crate::ring::EntryKey;
use crate::segment::{overlaps, validate_range, SegmentDescr};
use crate::system::{ProcessData, System, SystemState};
use crate::{AccessType, Status};

/// Reads one process's L1 entry. Locks and releases that process's data
/// mutex for the span of the read only.
fn read_entry(state: &SystemState, pid: ProcessId, l0: usize, l1: usize) -> Option<L1Entry> {
    let arc = state.processes.get(&pid)?.clone();
    let data = arc.lock().unwrap();
    Some(data.l0[l0].as_ref()?.entries[l1])
}

fn mutate_entry<R>(state: &SystemState, pid: ProcessId, l0: usize, l1: usize, f: impl FnOnce(&mut L1Entry) -> R) -> Option<R> {
    let arc = state.processes.get(&pid)?.clone();
    let mut data = arc.lock().unwrap();
    let entry = &mut data.l0[l0].as_mut()?.entries[l1];
    Some(f(entry))
}

fn key_flags(state: &SystemState, key: EntryKey) -> u32 {
    match key {
        EntryKey::Private { pid, l0, l1 } => read_entry(state, pid, l0, l1).map_or(0, |e| e.flags),
        EntryKey::Shared { segment_id, page_idx } => state
            .shared
            .by_id(segment_id)
            .map_or(0, |s| s.pages[page_idx as usize].flags),
    }
}

fn key_location(state: &SystemState, key: EntryKey) -> u32 {
    match key {
        EntryKey::Private { pid, l0, l1 } => read_entry(state, pid, l0, l1).map_or(0, |e| e.location),
        EntryKey::Shared { segment_id, page_idx } => state
            .shared
            .by_id(segment_id)
            .map_or(0, |s| s.pages[page_idx as usize].location),
    }
}

fn key_clear_reference(state: &mut SystemState, key: EntryKey) {
    match key {
        EntryKey::Private { pid, l0, l1 } => {
            mutate_entry(state, pid, l0, l1, |e| e.clear(REFERENCE));
        }
        EntryKey::Shared { segment_id, page_idx } => {
            if let Some(s) = state.shared.by_id_mut(segment_id) {
                s.pages[page_idx as usize].flags &= !REFERENCE;
            }
        }
    }
}

fn key_set_mapped_off(state: &mut SystemState, key: EntryKey) {
    match key {
        EntryKey::Private { pid, l0, l1 } => {
            mutate_entry(state, pid, l0, l1, |e| e.clear(MAPPED));
        }
        EntryKey::Shared { segment_id, page_idx } => {
            if let Some(s) = state.shared.by_id_mut(segment_id) {
                s.pages[page_idx as usize].flags &= !MAPPED;
            }
        }
    }
}

fn key_swap_out(state: &mut SystemState, key: EntryKey, cluster: u32) {
    match key {
        EntryKey::Private { pid, l0, l1 } => {
            mutate_entry(state, pid, l0, l1, |e| {
                e.location = cluster;
                e.clear(DIRTY);
                e.set(SWAPPED);
            });
        }
        EntryKey::Shared { segment_id, page_idx } => {
            if let Some(s) = state.shared.by_id_mut(segment_id) {
                let pg = &mut s.pages[page_idx as usize];
                pg.location = cluster;
                pg.flags &= !DIRTY;
                pg.flags |= SWAPPED;
            }
        }
    }
}

fn key_set_flag(state: &mut SystemState, key: EntryKey, bit: u32) {
    match key {
        EntryKey::Private { pid, l0, l1 } => {
            mutate_entry(state, pid, l0, l1, |e| e.set(bit));
        }
        EntryKey::Shared { segment_id, page_idx } => {
            if let Some(s) = state.shared.by_id_mut(segment_id) {
                s.pages[page_idx as usize].flags |= bit;
            }
        }
    }
}

/// Commits a successfully serviced fault: maps `frame`, sets `REFERENCE`,
/// clears `DIRTY`. `SWAPPED` is deliberately left untouched — spec.md's
/// `pageFault` algorithm (§4.7.2 step 4) only sets `MAPPED`/`REFERENCE` and
/// clears `DIRTY`; the entry's `location` field is reused in place for the
/// frame number, but the bit that says "this page has swap content behind
/// it" survives so a later eviction still knows to preserve that content
/// (see the eviction branch in `try_page_fault`, which treats `SWAPPED` and
/// `DIRTY` identically for the write-back decision).
fn key_finish_fault(state: &mut SystemState, key: EntryKey, frame: FrameNo) {
    match key {
        EntryKey::Private { pid, l0, l1 } => {
            mutate_entry(state, pid, l0, l1, |e| {
                e.location = frame;
                e.set(MAPPED);
                e.set(REFERENCE);
                e.clear(DIRTY);
            });
        }
        EntryKey::Shared { segment_id, page_idx } => {
            if let Some(s) = state.shared.by_id_mut(segment_id) {
                let pg = &mut s.pages[page_idx as usize];
                pg.location = frame;
                pg.flags |= MAPPED | REFERENCE;
                pg.flags &= !DIRTY;
            }
        }
    }
}

/// Clock-algorithm victim selection: advances the hand past every
/// currently-referenced entry, clearing `REFERENCE` as it goes, then claims
/// and unlinks the first unreferenced entry it finds. Runs in at most one
/// revolution of the ring, since every visited entry loses its reference
/// bit and a second visit to the same entry in the same call is therefore
/// guaranteed to stop.
fn get_victim(state: &mut SystemState) -> Option<EntryKey> {
    let mut hand = state.ring.hand()?;
    loop {
        if key_flags(state, hand) & REFERENCE == 0 {
            break;
        }
        key_clear_reference(state, hand);
        hand = state.ring.next_of(hand);
        state.ring.set_hand(Some(hand));
    }
    let next = state.ring.next_of(hand);
    state.ring.set_hand(if next == hand { None } else { Some(next) });
    state.ring.unlink(hand);
    Some(hand)
}

fn resolve_key(state: &SystemState, pid: ProcessId, entry: L1Entry, l0: usize, l1: usize) -> Result<EntryKey, VmError> {
    let shared_id = entry.shared_segment_id();
    if shared_id == 0 {
        return Ok(EntryKey::Private { pid, l0, l1 });
    }
    let seg = state.shared.by_id(shared_id).ok_or(VmError::UnknownSharedSegment)?;
    let page_idx = entry.shared_page_id().wrapping_sub(seg.start >> crate::addr::BITS_OFFSET);
    Ok(EntryKey::Shared { segment_id: shared_id, page_idx })
}

/// Loads one page's content into `frame` from swap, if `flags` (a snapshot
/// taken while the relevant mutex was held) says the page is `SWAPPED`.
/// Takes no lock of its own: callers snapshot flags/location first and call
/// this after releasing it, so partition I/O never runs under the system
/// mutex or an allocator mutex.
fn bring_in(sys: &System, flags: u32, location: u32, frame: FrameNo) {
    if flags & SWAPPED != 0 {
        let mut buf = [0u8; PAGE_SIZE as usize];
        let _ = sys.partition.read_cluster(location, &mut buf);
        sys.write_frame(frame, &buf);
    }
}

pub(crate) fn try_access(sys: &System, pid: ProcessId, vaddr: VirtualAddress, access: AccessType) -> Result<Status, VmError> {
    if !is_vaddr_valid(vaddr) {
        return Err(VmError::InvalidAddress);
    }
    let state = sys.state.lock().unwrap();
    if !state.processes.contains_key(&pid) {
        return Err(VmError::UnknownProcess);
    }
    let l0 = l0_entry(vaddr);
    let l1 = l1_entry(vaddr);
    let entry = read_entry(&state, pid, l0, l1).ok_or(VmError::InvalidAddress)?;
    if !entry.is_set(VALID) {
        return Err(VmError::InvalidAddress);
    }
    let needed = L1Entry::rights_bits(access);
    if entry.flags & needed != needed {
        return Err(VmError::RightsViolation);
    }
    let key = resolve_key(&state, pid, entry, l0, l1)?;
    let mapped = key_flags(&state, key) & MAPPED != 0;
    drop(state);

    if !mapped {
        return Ok(Status::PageFault);
    }
    if matches!(access, AccessType::Write | AccessType::ReadWrite) {
        let mut state = sys.state.lock().unwrap();
        key_set_flag(&mut state, key, DIRTY);
    }
    Ok(Status::Ok)
}

pub(crate) fn try_page_fault(sys: &System, pid: ProcessId, vaddr: VirtualAddress) -> Result<Status, VmError> {
    if !is_vaddr_valid(vaddr) {
        return Err(VmError::InvalidAddress);
    }
    let state = sys.state.lock().unwrap();
    if !state.processes.contains_key(&pid) {
        return Err(VmError::UnknownProcess);
    }
    let l0 = l0_entry(vaddr);
    let l1 = l1_entry(vaddr);
    let entry = read_entry(&state, pid, l0, l1).ok_or(VmError::InvalidAddress)?;
    if !entry.is_set(VALID) {
        return Err(VmError::InvalidAddress);
    }
    let key = resolve_key(&state, pid, entry, l0, l1)?;
    drop(state);

    let frame = if let Some(f) = sys.user_frames.alloc() {
        // Fast path: a frame was immediately free. No eviction, so nothing
        // beyond this entry's own flags/location is needed, and those are
        // read under a lock held only for the snapshot, not across the I/O.
        let state = sys.state.lock().unwrap();
        let flags = key_flags(&state, key);
        let location = key_location(&state, key);
        drop(state);
        bring_in(sys, flags, location, f);
        f
    } else {
        let Some(cluster) = sys.disk.take() else {
            return Err(VmError::NoClusters);
        };
        // Eviction path: victim selection is clock order over the global
        // ring, so it and the flag mutations it implies are serialized by
        // the system mutex; only the disk I/O itself runs without it held.
        let mut state = sys.state.lock().unwrap();
        let Some(victim) = get_victim(&mut state) else {
            drop(state);
            sys.disk.free(cluster);
            return Err(VmError::NoFrames);
        };
        let vflags = key_flags(&state, victim);
        let vframe = key_location(&state, victim);
        log::trace!("evicting {victim:?} (frame {vframe}) to cluster {cluster} for process {pid}");
        key_set_mapped_off(&mut state, victim);
        drop(state);

        if vflags & (DIRTY | SWAPPED) != 0 {
            let mut buf = [0u8; PAGE_SIZE as usize];
            sys.read_frame(vframe, &mut buf);
            let _ = sys.partition.write_cluster(cluster, &buf);
            let mut state = sys.state.lock().unwrap();
            key_swap_out(&mut state, victim, cluster);
        } else {
            sys.disk.free(cluster);
        }

        let state = sys.state.lock().unwrap();
        let flags = key_flags(&state, key);
        let location = key_location(&state, key);
        drop(state);
        bring_in(sys, flags, location, vframe);
        vframe
    };

    let mut state = sys.state.lock().unwrap();
    key_finish_fault(&mut state, key, frame);
    state.ring.link(key);
    Ok(Status::Ok)
}

pub(crate) fn try_get_physical_address(sys: &System, pid: ProcessId, vaddr: VirtualAddress) -> Option<crate::addr::PhysicalLocation> {
    if !is_vaddr_valid(vaddr) {
        return None;
    }
    let mut state = sys.state.lock().unwrap();
    let l0 = l0_entry(vaddr);
    let l1 = l1_entry(vaddr);
    let entry = read_entry(&state, pid, l0, l1)?;
    if !entry.is_set(VALID) {
        return None;
    }
    let key = resolve_key(&state, pid, entry, l0, l1).ok()?;
    if key_flags(&state, key) & MAPPED == 0 {
        return None;
    }
    key_set_flag(&mut state, key, REFERENCE);
    let frame = key_location(&state, key);
    Some(crate::addr::PhysicalLocation {
        frame,
        offset: crate::addr::offset(vaddr),
    })
}

/// Scans `data`'s page table for any `VALID` entry inside `[start, end]`.
/// There is no separate range index to keep in sync with the table itself;
/// 256 L0 slots is cheap enough to walk on every segment create/connect.
fn process_overlaps(data: &ProcessData, start: VirtualAddress, end: VirtualAddress) -> bool {
    for (l0, slot) in data.l0.iter().enumerate() {
        let Some(slot) = slot else { continue };
        for (l1, entry) in slot.entries.iter().enumerate() {
            if !entry.is_set(VALID) {
                continue;
            }
            let v = crate::addr::vaddr_of(l0, l1);
            if v >= start && v <= end {
                return true;
            }
        }
    }
    false
}

/// Lazily allocates an L1 table for every L0 slot spanned by `[l0_start,
/// l0_end]` that doesn't already have one. Rolls every allocation in this
/// call back if pmt space runs out partway through.
fn ensure_l1_tables(sys: &System, data: &mut ProcessData, l0_start: usize, l0_end: usize) -> Result<(), VmError> {
    let mut allocated = Vec::new();
    for l0 in l0_start..=l0_end {
        if data.l0[l0].is_some() {
            continue;
        }
        let Some(frame) = sys.pmt_frames.alloc() else {
            for l0 in allocated {
                let slot: L1TableSlot = data.l0[l0].take().unwrap();
                sys.pmt_frames.dealloc(slot.pmt_frame);
            }
            return Err(VmError::PmtSpaceExhausted);
        };
        data.l0[l0] = Some(L1TableSlot::new(frame));
        allocated.push(l0);
    }
    Ok(())
}

/// Releases any L1 table in `[l0_start, l0_end]` that has gone completely
/// unused (no `VALID` entry left in it).
fn release_empty_l1_tables(sys: &System, data: &mut ProcessData, l0_start: usize, l0_end: usize) {
    for l0 in l0_start..=l0_end {
        let still_used = data.l0[l0]
            .as_ref()
            .is_some_and(|s| s.entries.iter().any(|e| e.is_set(VALID)));
        if !still_used {
            if let Some(slot) = data.l0[l0].take() {
                sys.pmt_frames.dealloc(slot.pmt_frame);
            }
        }
    }
}

pub(crate) fn try_create_segment(
    sys: &System,
    pid: ProcessId,
    start: VirtualAddress,
    size_pages: u32,
    rights: AccessType,
) -> Result<(), VmError> {
    let end = validate_range(start, size_pages)?;
    let state = sys.state.lock().unwrap();
    let arc = state.processes.get(&pid).ok_or(VmError::UnknownProcess)?.clone();
    drop(state);
    let mut data = arc.lock().unwrap();
    if data.segments.iter().any(|s| overlaps(start, end, s.start, s.end_inclusive())) {
        return Err(VmError::Overlap);
    }
    if process_overlaps(&data, start, end) {
        return Err(VmError::Overlap);
    }
    let l0_start = l0_entry(start);
    let l0_end = l0_entry(end);
    ensure_l1_tables(sys, &mut data, l0_start, l0_end)?;
    for v in (start..=end).step_by(PAGE_SIZE as usize) {
        let l0 = l0_entry(v);
        let l1 = l1_entry(v);
        let entry = &mut data.l0[l0].as_mut().unwrap().entries[l1];
        *entry = L1Entry::default();
        entry.set(VALID);
        entry.flags |= L1Entry::rights_bits(rights);
    }
    data.segments.push(SegmentDescr { start, size_pages, rights });
    Ok(())
}

/// Creates a private segment whose pages start out `SWAPPED`, pre-loaded
/// with `content` (zero-padded if shorter than the segment). Matches the
/// source `loadSegment`: content lands on the swap partition immediately,
/// nothing is mapped until the first page fault.
pub(crate) fn try_load_segment(
    sys: &System,
    pid: ProcessId,
    start: VirtualAddress,
    size_pages: u32,
    rights: AccessType,
    content: &[u8],
) -> Result<(), VmError> {
    if content.len() > size_pages as usize * PAGE_SIZE as usize {
        return Err(VmError::ContentSizeMismatch);
    }
    try_create_segment(sys, pid, start, size_pages, rights)?;

    let mut clusters_taken = Vec::new();
    let mut result = Ok(());
    for page in 0..size_pages {
        let Some(cluster) = sys.disk.take() else {
            result = Err(VmError::NoClusters);
            break;
        };
        clusters_taken.push(cluster);
        let mut buf = [0u8; PAGE_SIZE as usize];
        let page_off = page as usize * PAGE_SIZE as usize;
        if page_off < content.len() {
            let n = (content.len() - page_off).min(PAGE_SIZE as usize);
            buf[..n].copy_from_slice(&content[page_off..page_off + n]);
        }
        let _ = sys.partition.write_cluster(cluster, &buf);
    }

    if result.is_err() {
        for c in clusters_taken {
            sys.disk.free(c);
        }
        let _ = try_delete_segment(sys, pid, start);
        return result;
    }

    let state = sys.state.lock().unwrap();
    let arc = state.processes.get(&pid).ok_or(VmError::UnknownProcess)?.clone();
    drop(state);
    let mut data = arc.lock().unwrap();
    for (page, cluster) in clusters_taken.into_iter().enumerate() {
        let v = start + page as u32 * PAGE_SIZE;
        let entry = &mut data.l0[l0_entry(v)].as_mut().unwrap().entries[l1_entry(v)];
        entry.set(SWAPPED);
        entry.location = cluster;
    }
    Ok(())
}

pub(crate) fn try_delete_segment(sys: &System, pid: ProcessId, start: VirtualAddress) -> Result<(), VmError> {
    let state = sys.state.lock().unwrap();
    let arc = state.processes.get(&pid).ok_or(VmError::UnknownProcess)?.clone();
    let mut state = state;
    let mut data = arc.lock().unwrap();
    let idx = data
        .segments
        .iter()
        .position(|s| s.start == start)
        .ok_or(VmError::NoSuchSegment)?;
    let seg = data.segments.remove(idx);
    let end = seg.end_inclusive();
    let l0_start = l0_entry(start);
    let l0_end = l0_entry(end);

    for v in (start..=end).step_by(PAGE_SIZE as usize) {
        let l0 = l0_entry(v);
        let l1 = l1_entry(v);
        let entry = data.l0[l0].as_ref().unwrap().entries[l1];
        if entry.is_set(MAPPED) {
            sys.user_frames.dealloc(entry.location);
            state.ring.unlink(EntryKey::Private { pid, l0, l1 });
        } else if entry.is_set(SWAPPED) {
            sys.disk.free(entry.location);
        }
        data.l0[l0].as_mut().unwrap().entries[l1] = L1Entry::default();
    }
    release_empty_l1_tables(sys, &mut data, l0_start, l0_end);
    Ok(())
}

/// Creates a named shared segment if it doesn't exist yet, or connects to
/// the existing one if it does, mirroring `KernelProcess::createSharedSegment`,
/// which serves both roles through one call.
pub(crate) fn try_create_shared_segment(
    sys: &System,
    pid: ProcessId,
    start: VirtualAddress,
    size_pages: u32,
    name: &str,
    rights: AccessType,
) -> Result<(), VmError> {
    let end = validate_range(start, size_pages)?;
    let mut state = sys.state.lock().unwrap();
    let arc = state.processes.get(&pid).ok_or(VmError::UnknownProcess)?.clone();

    let shared_id = if let Some(existing) = state.shared.get_by_name(name) {
        if existing.start != start || existing.size_pages != size_pages || existing.rights != rights {
            return Err(VmError::SharedSegmentMismatch);
        }
        state.shared.connect(name, pid)?.0
    } else {
        state.shared.create(name.to_string(), start, size_pages, rights, pid)?
    };

    let mut data = arc.lock().unwrap();
    if data.segments.iter().any(|s| overlaps(start, end, s.start, s.end_inclusive()))
        || process_overlaps(&data, start, end)
    {
        // roll back the registry-side connect/create
        if let Ok(Some(_)) = state.shared.disconnect(shared_id, pid) {}
        return Err(VmError::Overlap);
    }
    let l0_start = l0_entry(start);
    let l0_end = l0_entry(end);
    if let Err(e) = ensure_l1_tables(sys, &mut data, l0_start, l0_end) {
        let _ = state.shared.disconnect(shared_id, pid);
        return Err(e);
    }
    for v in (start..=end).step_by(PAGE_SIZE as usize) {
        let l0 = l0_entry(v);
        let l1 = l1_entry(v);
        let entry = &mut data.l0[l0].as_mut().unwrap().entries[l1];
        *entry = L1Entry::default();
        entry.set(VALID);
        entry.flags |= L1Entry::rights_bits(rights);
        entry.set_shared_segment_id(shared_id);
        entry.set_shared_page_id(v >> crate::addr::BITS_OFFSET);
    }
    log::debug!("process {pid} connected to shared segment {name:?} (id {shared_id})");
    Ok(())
}

pub(crate) fn try_disconnect_shared_segment(sys: &System, pid: ProcessId, name: &str) -> Result<(), VmError> {
    let mut state = sys.state.lock().unwrap();
    let shared_id = state.shared.get_by_name(name).ok_or(VmError::UnknownSharedSegment)?.id;
    let seg_start = state.shared.by_id(shared_id).unwrap().start;
    let seg_end = state.shared.by_id(shared_id).unwrap().end_inclusive();
    let arc = state.processes.get(&pid).ok_or(VmError::UnknownProcess)?.clone();

    let teardown = state.shared.disconnect(shared_id, pid)?;
    log::debug!(
        "process {pid} disconnected from shared segment {name:?} (id {shared_id}, torn down: {})",
        teardown.is_some()
    );

    let mut data = arc.lock().unwrap();
    let l0_start = l0_entry(seg_start);
    let l0_end = l0_entry(seg_end);
    for v in (seg_start..=seg_end).step_by(PAGE_SIZE as usize) {
        let l0 = l0_entry(v);
        let l1 = l1_entry(v);
        if let Some(slot) = data.l0[l0].as_mut() {
            slot.entries[l1] = L1Entry::default();
        }
    }
    release_empty_l1_tables(sys, &mut data, l0_start, l0_end);

    if let Some(descr) = teardown {
        for (idx, pg) in descr.pages.iter().enumerate() {
            if pg.flags & MAPPED != 0 {
                sys.user_frames.dealloc(pg.location);
                state.ring.unlink(EntryKey::Shared { segment_id: shared_id, page_idx: idx as u32 });
            } else if pg.flags & SWAPPED != 0 {
                sys.disk.free(pg.location);
            }
        }
    }
    Ok(())
}
