//! C9: copy-on-clone of an entire address space.
//!
//! A single pass over the source page table, all under the system mutex so
//! nothing else can observe a half-built destination: every L1 table the
//! destination needs is allocated first, then each valid entry is copied.
//! A private page's clone is always a fresh, swap-resident, unmapped, clean
//! copy in a newly reserved cluster, even if the original was resident; a
//! shared page's clone just joins the same `SharedSegmentDescr`'s
//! connection list, with no new storage at all. Any failure partway through
//! (no pmt space, no clusters left) is handled by tearing the half-built
//! destination process down through the same path process destruction
//! always uses, since that path already knows how to free whatever mapped
//! frames, swapped clusters, pmt frames and shared-segment connections a
//! process happens to hold, half-built or not, so cloning doesn't need its
//! own separate rollback bookkeeping.

use std::sync::Arc;

use crate::addr::{L0_ENTRIES, L1_ENTRIES, PAGE_SIZE};
use crate::error::VmError;
use crate::pagetable::{L1Entry, L1TableSlot, DIRTY, MAPPED, REFERENCE, SWAPPED, VALID};
use crate::process::Process;
use crate::system::System;

pub(crate) fn clone_process(source: &Process) -> Result<Process, VmError> {
    let sys = Arc::clone(source.system());
    let new_pid = sys.try_create_process()?;

    let result = (|| -> Result<(), VmError> {
        let mut state = sys.state.lock().unwrap();
        let src_arc = state
            .processes
            .get(&source.pid())
            .ok_or(VmError::UnknownProcess)?
            .clone();
        let dst_arc = state.processes.get(&new_pid).expect("just created").clone();

        let src = src_arc.lock().unwrap();
        let mut dst = dst_arc.lock().unwrap();

        for l0 in 0..L0_ENTRIES {
            let Some(slot) = src.l0[l0].as_ref() else { continue };
            if dst.l0[l0].is_none() && slot.entries.iter().any(|e| e.is_set(VALID)) {
                let frame = sys.pmt_frames.alloc().ok_or(VmError::PmtSpaceExhausted)?;
                dst.l0[l0] = Some(L1TableSlot::new(frame));
            }
        }

        for l0 in 0..L0_ENTRIES {
            let Some(slot) = src.l0[l0].as_ref() else { continue };
            for l1 in 0..L1_ENTRIES {
                let entry = slot.entries[l1];
                if !entry.is_set(VALID) {
                    continue;
                }
                if entry.shared_segment_id() != 0 {
                    let shared_id = entry.shared_segment_id();
                    if let Some(descr) = state.shared.by_id_mut(shared_id) {
                        if !descr.connected.contains(&new_pid) {
                            descr.connected.push(new_pid);
                        }
                    }
                    dst.l0[l0].as_mut().unwrap().entries[l1] = entry;
                } else {
                    let cluster = sys.disk.take().ok_or(VmError::NoClusters)?;

                    let mut buf = [0u8; PAGE_SIZE as usize];
                    if entry.is_set(MAPPED) {
                        sys.read_frame(entry.location, &mut buf);
                    } else if entry.is_set(SWAPPED) {
                        let _ = sys.partition.read_cluster(entry.location, &mut buf);
                    }
                    let _ = sys.partition.write_cluster(cluster, &buf);

                    let mut copy = L1Entry {
                        flags: entry.flags & !MAPPED,
                        location: cluster,
                    };
                    copy.set(SWAPPED);
                    copy.clear(DIRTY);
                    copy.clear(REFERENCE);
                    dst.l0[l0].as_mut().unwrap().entries[l1] = copy;
                }
            }
        }

        dst.segments = src.segments.clone();
        Ok(())
    })();

    match result {
        Ok(()) => Ok(Process::new(sys, new_pid)),
        Err(e) => {
            let _ = sys.destroy_process_by_id(new_pid);
            Err(e)
        }
    }
}
