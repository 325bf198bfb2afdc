//! C6: global clock-algorithm replacement ring spanning every process's
//! mapped pages plus one entry per mapped shared page.
//!
//! The source ring is a raw doubly-linked list of pointers planted in each
//! page-table entry's own storage. A safe Rust translation can't embed
//! pointers in entries stored behind per-process mutexes, so the ring here
//! is an arena keyed by [`EntryKey`] (an L1 entry's `(pid, l0, l1)`, or a
//! shared page's `(segment_id, page_idx)`) with an index of links beside it.

use std::collections::HashMap;

use crate::addr::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Private { pid: ProcessId, l0: usize, l1: usize },
    Shared { segment_id: u32, page_idx: u32 },
}

#[derive(Debug, Clone, Copy)]
struct RingLink {
    prev: EntryKey,
    next: EntryKey,
}

#[derive(Default)]
pub struct ReplacementRing {
    links: HashMap<EntryKey, RingLink>,
    hand: Option<EntryKey>,
}

impl ReplacementRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn hand(&self) -> Option<EntryKey> {
        self.hand
    }

    pub fn set_hand(&mut self, key: Option<EntryKey>) {
        self.hand = key;
    }

    #[must_use]
    pub fn next_of(&self, key: EntryKey) -> EntryKey {
        self.links[&key].next
    }

    #[must_use]
    pub fn contains(&self, key: EntryKey) -> bool {
        self.links.contains_key(&key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hand.is_none()
    }

    /// Links `key` in immediately before the current hand (or as the sole
    /// entry, if the ring is empty). A freshly mapped page is never the
    /// next victim on the same pass.
    pub fn link(&mut self, key: EntryKey) {
        debug_assert!(!self.links.contains_key(&key), "entry already in the ring");
        match self.hand {
            None => {
                self.links.insert(key, RingLink { prev: key, next: key });
                self.hand = Some(key);
            }
            Some(hand) => {
                let hand_prev = self.links[&hand].prev;
                self.links.insert(
                    key,
                    RingLink {
                        prev: hand_prev,
                        next: hand,
                    },
                );
                self.links.get_mut(&hand_prev).unwrap().next = key;
                self.links.get_mut(&hand).unwrap().prev = key;
            }
        }
    }

    pub fn unlink(&mut self, key: EntryKey) {
        let Some(link) = self.links.remove(&key) else {
            return;
        };
        if link.next == key {
            self.hand = None;
            return;
        }
        self.links.get_mut(&link.prev).unwrap().next = link.next;
        self.links.get_mut(&link.next).unwrap().prev = link.prev;
        if self.hand == Some(key) {
            self.hand = Some(link.next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: usize) -> EntryKey {
        EntryKey::Private { pid: 0, l0: 0, l1: n }
    }

    #[test]
    fn single_entry_ring_links_to_itself() {
        let mut r = ReplacementRing::new();
        r.link(key(1));
        assert_eq!(r.next_of(key(1)), key(1));
        r.unlink(key(1));
        assert!(r.is_empty());
    }

    #[test]
    fn unlink_from_the_middle_preserves_cycle() {
        let mut r = ReplacementRing::new();
        r.link(key(1));
        r.link(key(2));
        r.link(key(3));
        r.unlink(key(2));
        assert!(r.contains(key(1)));
        assert!(!r.contains(key(2)));
        // remaining two still form a cycle of length 2
        let a = r.hand().unwrap();
        let b = r.next_of(a);
        assert_eq!(r.next_of(b), a);
    }

    #[test]
    fn unlinking_the_hand_advances_it() {
        let mut r = ReplacementRing::new();
        r.link(key(1));
        r.link(key(2));
        let hand = r.hand().unwrap();
        r.unlink(hand);
        assert_ne!(r.hand(), Some(hand));
    }
}
