//! C2: frame allocator. A free list of address-sorted segments with
//! coalescing, same shape as the source `FrameAllocator`, but keyed by frame
//! number in a side table instead of headers written in-place inside free
//! frames (this crate has no raw frame memory to plant a header in — see
//! the shared [`crate::System::user_memory`] buffer, which is only ever
//! touched through [`crate::System::read_physical`]/`write_physical`).

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::addr::FrameNo;

struct Inner {
    /// Maps a free segment's first frame to its length in frames.
    free: BTreeMap<FrameNo, u32>,
    free_count: u64,
}

pub struct FrameAllocator {
    inner: Mutex<Inner>,
    size: FrameNo,
}

impl FrameAllocator {
    #[must_use]
    pub fn new(size: FrameNo) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self {
            inner: Mutex::new(Inner {
                free,
                free_count: u64::from(size),
            }),
            size,
        }
    }

    #[must_use]
    pub fn size(&self) -> FrameNo {
        self.size
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.inner.lock().unwrap().free_count
    }

    /// Takes the last frame of the lowest-addressed free segment, matching
    /// the source allocator's head-segment policy.
    pub fn alloc(&self) -> Option<FrameNo> {
        let mut inner = self.inner.lock().unwrap();
        let (&base, &len) = inner.free.iter().next()?;
        let frame = base + len - 1;
        if len == 1 {
            inner.free.remove(&base);
        } else {
            inner.free.insert(base, len - 1);
        }
        inner.free_count -= 1;
        Some(frame)
    }

    /// Returns `frame` to the free list, coalescing with adjacent segments.
    /// No-op (rather than corrupting the free list) if `frame` is already
    /// free: the source's `dealloc` has no such guard and will double-link
    /// a frame freed twice.
    pub fn dealloc(&self, frame: FrameNo) {
        let mut inner = self.inner.lock().unwrap();
        let pred = inner
            .free
            .range(..=frame)
            .next_back()
            .map(|(&b, &l)| (b, l));
        if let Some((pb, pl)) = pred {
            if frame < pb + pl {
                return; // already free, inside the predecessor segment
            }
        }
        let succ = inner.free.range(frame + 1..).next().map(|(&b, _)| b);
        if succ == Some(frame) {
            return; // already free as a lone successor entry (unreachable in practice)
        }

        let mut new_base = frame;
        let mut new_len = 1u32;
        if let Some((pb, pl)) = pred {
            if pb + pl == frame {
                inner.free.remove(&pb);
                new_base = pb;
                new_len += pl;
            }
        }
        if let Some((sb, sl)) = inner.free.range(new_base + new_len..).next().map(|(&b, &l)| (b, l))
        {
            if new_base + new_len == sb {
                inner.free.remove(&sb);
                new_len += sl;
            }
        }
        inner.free.insert(new_base, new_len);
        inner.free_count += 1;
    }

    /// Reports whether `frame` currently sits in the free list. Walks the
    /// (address-ordered) free segments to the one that could contain it; the
    /// source implementation's equivalent check never advances its cursor
    /// and spins forever once the list is non-empty; fixed here.
    #[must_use]
    pub fn is_free(&self, frame: FrameNo) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .free
            .range(..=frame)
            .next_back()
            .is_some_and(|(&b, &l)| frame < b + l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_exhausts_and_dealloc_refills() {
        let a = FrameAllocator::new(2);
        let f0 = a.alloc().unwrap();
        let f1 = a.alloc().unwrap();
        assert_ne!(f0, f1);
        assert!(a.alloc().is_none());
        a.dealloc(f0);
        assert!(a.is_free(f0));
        assert_eq!(a.alloc(), Some(f0));
    }

    #[test]
    fn coalesces_adjacent_frees() {
        let a = FrameAllocator::new(4);
        let frames: Vec<_> = (0..4).map(|_| a.alloc().unwrap()).collect();
        for f in &frames {
            a.dealloc(*f);
        }
        // fully coalesced back into one segment covering the whole range
        assert_eq!(a.alloc(), Some(3));
        assert_eq!(a.free_count(), 3);
    }

    #[test]
    fn double_dealloc_is_a_no_op() {
        let a = FrameAllocator::new(2);
        let f0 = a.alloc().unwrap();
        a.dealloc(f0);
        let before = a.free_count();
        a.dealloc(f0);
        assert_eq!(a.free_count(), before);
    }

    #[test]
    fn is_free_terminates_on_nonempty_list() {
        let a = FrameAllocator::new(1024);
        assert!(a.is_free(500));
        let f = a.alloc().unwrap();
        assert!(!a.is_free(f));
    }
}
