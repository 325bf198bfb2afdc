//! End-to-end scenarios exercising the public API together: paging,
//! eviction, shared segments, and address-space cloning.

use std::sync::Arc;

use vmcore::{AccessType, MemoryPartition, Status, System};

fn system(user_frames: u32, pmt_frames: u32, clusters: u64) -> Arc<System> {
    let _ = env_logger::try_init();
    Arc::new(System::new(user_frames, pmt_frames, Arc::new(MemoryPartition::new(clusters))))
}

#[test]
fn fault_then_write_then_read_round_trips_through_physical_memory() {
    let sys = system(4, 16, 16);
    let proc = sys.create_process().unwrap();
    proc.create_segment(0, 1, AccessType::ReadWrite);

    assert_eq!(proc.access(0, AccessType::Write), Status::PageFault);
    assert_eq!(proc.page_fault(0), Status::Ok);
    assert_eq!(proc.access(0, AccessType::Write), Status::Ok);

    let loc = proc.get_physical_address(0).unwrap();
    sys.write_physical(loc, b"A");
    let mut buf = [0u8; 1];
    sys.read_physical(loc, &mut buf);
    assert_eq!(&buf, b"A");
}

#[test]
fn eviction_under_single_frame_pressure_preserves_both_pages() {
    // One frame for two processes' pages forces the second fault to evict
    // the first; the first page's content must survive on swap and come
    // back correctly on its own next fault.
    let sys = system(1, 16, 16);
    let proc = sys.create_process().unwrap();
    proc.create_segment(0, 2, AccessType::ReadWrite);

    assert_eq!(proc.page_fault(0), Status::Ok);
    // a write access marks the page dirty so eviction persists it to swap
    assert_eq!(proc.access(0, AccessType::Write), Status::Ok);
    let loc0 = proc.get_physical_address(0).unwrap();
    sys.write_physical(loc0, b"A");

    // second page faults in, evicting the first (no free frames left)
    assert_eq!(proc.page_fault(1024), Status::Ok);
    let loc1 = proc.get_physical_address(1024).unwrap();
    sys.write_physical(loc1, b"B");

    // first page is no longer resident
    assert_eq!(proc.access(0, AccessType::Read), Status::PageFault);
    assert_eq!(proc.page_fault(0), Status::Ok);
    let loc0_again = proc.get_physical_address(0).unwrap();
    let mut buf = [0u8; 1];
    sys.read_physical(loc0_again, &mut buf);
    assert_eq!(&buf, b"A");
}

#[test]
fn load_segment_prepopulates_content_without_mapping() {
    let sys = system(4, 16, 16);
    let proc = sys.create_process().unwrap();
    let content = b"hello world";
    proc.load_segment(0, 1, AccessType::Read, content);

    // resident check still trips a fault; content arrives from swap
    assert_eq!(proc.access(0, AccessType::Read), Status::PageFault);
    assert_eq!(proc.page_fault(0), Status::Ok);
    let loc = proc.get_physical_address(0).unwrap();
    let mut buf = [0u8; 11];
    sys.read_physical(loc, &mut buf);
    assert_eq!(&buf, content);
}

#[test]
fn evicting_a_never_written_loaded_page_keeps_its_content_on_swap() {
    // a page that arrived via load_segment and is only ever read is never
    // DIRTY, but it is still SWAPPED — its content must still be written
    // back (really, kept on its cluster) across an eviction, not discarded
    // as if it had never held anything.
    let sys = system(1, 16, 16);
    let proc = sys.create_process().unwrap();
    proc.load_segment(0, 2, AccessType::Read, b"hello world");

    assert_eq!(proc.page_fault(0), Status::Ok);
    assert_eq!(proc.access(0, AccessType::Read), Status::Ok);

    // only one frame exists; faulting in the second page evicts the first
    assert_eq!(proc.page_fault(1024), Status::Ok);

    assert_eq!(proc.access(0, AccessType::Read), Status::PageFault);
    assert_eq!(proc.page_fault(0), Status::Ok);
    let loc = proc.get_physical_address(0).unwrap();
    let mut buf = [0u8; 5];
    sys.read_physical(loc, &mut buf);
    assert_eq!(&buf, b"hello");
}

#[test]
fn two_processes_share_one_page_through_a_named_segment() {
    let sys = system(4, 16, 16);
    let p1 = sys.create_process().unwrap();
    let p2 = sys.create_process().unwrap();

    assert_eq!(p1.create_shared_segment(0, 1, "shm", AccessType::ReadWrite), Status::Ok);
    assert_eq!(p2.create_shared_segment(0, 1, "shm", AccessType::ReadWrite), Status::Ok);

    assert_eq!(p1.page_fault(0), Status::Ok);
    let loc = p1.get_physical_address(0).unwrap();
    sys.write_physical(loc, b"X");

    // p2 sees the same frame without faulting again
    assert_eq!(p2.access(0, AccessType::Read), Status::Ok);
    let loc2 = p2.get_physical_address(0).unwrap();
    assert_eq!(loc2, loc);
}

#[test]
fn disconnect_does_not_tear_down_while_another_process_is_connected() {
    let sys = system(4, 16, 16);
    let p1 = sys.create_process().unwrap();
    let p2 = sys.create_process().unwrap();
    p1.create_shared_segment(0, 1, "shm", AccessType::Read);
    p2.create_shared_segment(0, 1, "shm", AccessType::Read);
    assert_eq!(p1.page_fault(0), Status::Ok);

    assert_eq!(p1.disconnect_shared_segment("shm"), Status::Ok);
    // p2 still connected, page still resident
    assert_eq!(p2.access(0, AccessType::Read), Status::Ok);
}

#[test]
fn clone_gives_private_pages_independent_copies() {
    let sys = system(4, 16, 16);
    let parent = sys.create_process().unwrap();
    parent.create_segment(0, 1, AccessType::ReadWrite);
    parent.page_fault(0);
    let loc = parent.get_physical_address(0).unwrap();
    sys.write_physical(loc, b"P");

    let child = parent.clone_address_space().unwrap();
    assert_eq!(child.access(0, AccessType::Read), Status::PageFault);
    assert_eq!(child.page_fault(0), Status::Ok);
    let child_loc = child.get_physical_address(0).unwrap();
    assert_ne!(child_loc.frame, loc.frame);

    let mut buf = [0u8; 1];
    sys.read_physical(child_loc, &mut buf);
    assert_eq!(&buf, b"P");

    sys.write_physical(child_loc, b"C");
    let mut parent_buf = [0u8; 1];
    sys.read_physical(loc, &mut parent_buf);
    assert_eq!(&parent_buf, b"P"); // parent's copy is untouched
}

#[test]
fn clone_keeps_shared_pages_shared() {
    let sys = system(4, 16, 16);
    let parent = sys.create_process().unwrap();
    parent.create_shared_segment(0, 1, "shm", AccessType::ReadWrite);
    parent.page_fault(0);
    let loc = parent.get_physical_address(0).unwrap();
    sys.write_physical(loc, b"S");

    let child = parent.clone_address_space().unwrap();
    assert_eq!(child.access(0, AccessType::Read), Status::Ok);
    let child_loc = child.get_physical_address(0).unwrap();
    assert_eq!(child_loc.frame, loc.frame);
}

#[test]
fn create_shared_segment_rejects_mismatched_geometry() {
    let sys = system(4, 16, 16);
    let p1 = sys.create_process().unwrap();
    let p2 = sys.create_process().unwrap();
    assert_eq!(p1.create_shared_segment(0, 2, "shm", AccessType::ReadWrite), Status::Ok);

    // same name, different start: must trap rather than silently reconnect
    assert_eq!(p2.create_shared_segment(1024, 2, "shm", AccessType::ReadWrite), Status::Trap);
    // same name, different size: must also trap
    assert_eq!(p2.create_shared_segment(0, 1, "shm", AccessType::ReadWrite), Status::Trap);
    // matching geometry succeeds
    assert_eq!(p2.create_shared_segment(0, 2, "shm", AccessType::ReadWrite), Status::Ok);
}

#[test]
fn rights_violation_traps_instead_of_faulting() {
    let sys = system(4, 16, 16);
    let proc = sys.create_process().unwrap();
    proc.create_segment(0, 1, AccessType::Read);
    assert_eq!(proc.access(0, AccessType::Write), Status::Trap);
}

#[test]
fn read_write_access_requires_both_bits_not_either() {
    let sys = system(4, 16, 16);
    let read_only = sys.create_process().unwrap();
    read_only.create_segment(0, 1, AccessType::Read);
    assert_eq!(read_only.access(0, AccessType::ReadWrite), Status::Trap);

    let write_only = sys.create_process().unwrap();
    write_only.create_segment(0, 1, AccessType::Write);
    assert_eq!(write_only.access(0, AccessType::ReadWrite), Status::Trap);
}

#[test]
fn out_of_frames_and_clusters_traps_cleanly() {
    // one frame, zero swap clusters: the first page fault succeeds (frame
    // available), the second has nowhere to evict the first page to.
    let sys = system(1, 16, 0);
    let proc = sys.create_process().unwrap();
    proc.create_segment(0, 2, AccessType::ReadWrite);
    assert_eq!(proc.page_fault(0), Status::Ok);
    assert_eq!(proc.page_fault(1024), Status::Trap);
}

#[test]
fn system_level_pid_api_matches_the_process_handle_api() {
    let sys = system(4, 16, 16);
    let proc = sys.create_process().unwrap();
    let pid = proc.pid();
    proc.create_segment(0, 1, AccessType::ReadWrite);

    assert_eq!(sys.access(pid, 0, AccessType::Write), Status::PageFault);
    assert_eq!(proc.page_fault(0), Status::Ok);
    assert_eq!(sys.access(pid, 0, AccessType::Write), Status::Ok);
    assert_eq!(sys.periodic_job(), 0);

    let clone = sys.clone_process(pid).unwrap();
    assert_ne!(clone.pid(), pid);
    assert_eq!(clone.access(0, AccessType::Read), Status::PageFault);
}

#[test]
fn delete_segment_releases_its_resources_for_reuse() {
    let sys = system(1, 16, 16);
    let proc = sys.create_process().unwrap();
    proc.create_segment(0, 1, AccessType::ReadWrite);
    proc.page_fault(0);
    assert_eq!(proc.delete_segment(0), Status::Ok);

    proc.create_segment(1024, 1, AccessType::ReadWrite);
    assert_eq!(proc.page_fault(1024), Status::Ok);
}
