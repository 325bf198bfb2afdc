//! Internal error taxonomy, collapsed to [`Status`] at the public API boundary.

use thiserror::Error;

use crate::Status;

/// Internal failure modes. Every public operation returns a [`Status`]; this
/// enum exists so call sites can match on a specific cause before it gets
/// collapsed, and so log lines carry a real reason.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    #[error("virtual address out of range or not backed by a segment")]
    InvalidAddress,
    #[error("unknown process id")]
    UnknownProcess,
    #[error("segment range overlaps an existing segment")]
    Overlap,
    #[error("access rights violation")]
    RightsViolation,
    #[error("no free frames and no eviction victim available")]
    NoFrames,
    #[error("swap partition has no free clusters")]
    NoClusters,
    #[error("pmt space exhausted")]
    PmtSpaceExhausted,
    #[error("unknown shared segment name")]
    UnknownSharedSegment,
    #[error("shared segment id space exhausted")]
    SharedIdExhausted,
    #[error("shared segment already exists with a different size or rights")]
    SharedSegmentMismatch,
    #[error("no segment found at the given start address")]
    NoSuchSegment,
    #[error("process is not connected to that shared segment")]
    NotConnected,
    #[error("process id space exhausted")]
    PidExhausted,
    #[error("content length does not match the segment size")]
    ContentSizeMismatch,
}

impl From<VmError> for Status {
    fn from(e: VmError) -> Self {
        log::warn!("operation trapped: {e}");
        Status::Trap
    }
}
