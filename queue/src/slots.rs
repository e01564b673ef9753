//! Slot bookkeeping for the buffer pool.
//!
//! Slots are nodes `0..capacity` of a circular doubly-linked ring stored as
//! index links. Two extra nodes act as sentinels:
//!
//! ```text
//!   write cursor -> [writable slots] -> read cursor -> [readable slots] -> (back to write cursor)
//! ```
//!
//! The oldest writable slot sits right after the write cursor and the oldest
//! readable slot right after the read cursor. A checked-out slot is unlinked
//! from the ring entirely and only its state entry remembers it.

use std::fmt;

/// Stable index of a slot within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    Writable,
    Readable,
    Writing,
    Reading,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
}

#[derive(Debug)]
pub(crate) struct SlotRing {
    links: Vec<Link>,
    states: Vec<SlotState>,
    writable: usize,
    readable: usize,
    writing: usize,
    reading: usize,
}

impl SlotRing {
    pub(crate) fn new(capacity: usize) -> Self {
        let write_cursor = capacity;
        let read_cursor = capacity + 1;

        let order: Vec<usize> = std::iter::once(write_cursor)
            .chain(0..capacity)
            .chain(std::iter::once(read_cursor))
            .collect();
        let len = order.len();

        let mut links = vec![Link { prev: 0, next: 0 }; len];
        for (pos, &node) in order.iter().enumerate() {
            links[node] = Link {
                prev: order[(pos + len - 1) % len],
                next: order[(pos + 1) % len],
            };
        }

        Self {
            links,
            states: vec![SlotState::Writable; capacity],
            writable: capacity,
            readable: 0,
            writing: 0,
            reading: 0,
        }
    }

    fn write_cursor(&self) -> usize {
        self.states.len()
    }

    fn read_cursor(&self) -> usize {
        self.states.len() + 1
    }

    fn unlink(&mut self, node: usize) {
        let Link { prev, next } = self.links[node];
        self.links[prev].next = next;
        self.links[next].prev = prev;
    }

    fn insert_before(&mut self, node: usize, anchor: usize) {
        let prev = self.links[anchor].prev;
        self.links[node] = Link { prev, next: anchor };
        self.links[prev].next = node;
        self.links[anchor].prev = node;
    }

    /// Detach the oldest writable slot for filling.
    pub(crate) fn take_writable(&mut self) -> Option<SlotId> {
        let head = self.links[self.write_cursor()].next;
        if head == self.read_cursor() {
            return None;
        }
        self.unlink(head);
        self.states[head] = SlotState::Writing;
        self.writable -= 1;
        self.writing += 1;
        Some(SlotId(head))
    }

    /// Detach the oldest readable slot.
    pub(crate) fn take_readable(&mut self) -> Option<SlotId> {
        let head = self.links[self.read_cursor()].next;
        if head == self.write_cursor() {
            return None;
        }
        self.unlink(head);
        self.states[head] = SlotState::Reading;
        self.readable -= 1;
        self.reading += 1;
        Some(SlotId(head))
    }

    /// Append a filled slot to the readable partition.
    pub(crate) fn publish(&mut self, id: SlotId) -> bool {
        if self.state(id) != Some(SlotState::Writing) {
            return false;
        }
        self.insert_before(id.0, self.write_cursor());
        self.states[id.0] = SlotState::Readable;
        self.writing -= 1;
        self.readable += 1;
        true
    }

    /// Return a slot checked out for writing without publishing it.
    pub(crate) fn restore(&mut self, id: SlotId) -> bool {
        if self.state(id) != Some(SlotState::Writing) {
            return false;
        }
        self.insert_before(id.0, self.read_cursor());
        self.states[id.0] = SlotState::Writable;
        self.writing -= 1;
        self.writable += 1;
        true
    }

    /// Return a slot checked out for reading to the writable partition.
    pub(crate) fn release(&mut self, id: SlotId) -> bool {
        if self.state(id) != Some(SlotState::Reading) {
            return false;
        }
        self.insert_before(id.0, self.read_cursor());
        self.states[id.0] = SlotState::Writable;
        self.reading -= 1;
        self.writable += 1;
        true
    }

    /// Move the oldest unread slot straight back to the writable partition.
    pub(crate) fn evict_oldest(&mut self) -> Option<SlotId> {
        let head = self.links[self.read_cursor()].next;
        if head == self.write_cursor() {
            return None;
        }
        self.unlink(head);
        self.insert_before(head, self.read_cursor());
        self.states[head] = SlotState::Writable;
        self.readable -= 1;
        self.writable += 1;
        Some(SlotId(head))
    }

    pub(crate) fn state(&self, id: SlotId) -> Option<SlotState> {
        self.states.get(id.0).copied()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.states.len()
    }

    pub(crate) fn writable(&self) -> usize {
        self.writable
    }

    pub(crate) fn readable(&self) -> usize {
        self.readable
    }

    pub(crate) fn writing(&self) -> usize {
        self.writing
    }

    pub(crate) fn reading(&self) -> usize {
        self.reading
    }
}
