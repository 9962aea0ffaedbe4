// packages/kernel/src/scheduler/heap.rs
//! Indexed binary min-heap of timer entries
//!
//! `std::collections::BinaryHeap` cannot remove arbitrary elements, which
//! unschedule and reschedule both need. This heap keeps an id → slot index
//! next to the array so any entry can be removed or moved in O(log n).
//!
//! Entries are ordered by `(fire_at, seq)`; `seq` is an insertion counter
//! that keeps equal deadlines in FIFO order.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use ulid::Ulid;

/// A waiting timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapEntry {
    pub id: Ulid,
    pub fire_at: DateTime<Utc>,
    seq: u64,
}

impl HeapEntry {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.fire_at, self.seq)
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap keyed by entity id
#[derive(Debug, Default, Clone)]
pub struct TimerHeap {
    entries: Vec<HeapEntry>,
    positions: HashMap<Ulid, usize>,
    next_seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.positions.contains_key(id)
    }

    /// Earliest entry
    pub fn peek(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    /// Insert `id`, or move it if already present.
    /// Returns `true` when the entry ends up at the top.
    pub fn push(&mut self, id: Ulid, fire_at: DateTime<Utc>) -> bool {
        self.remove(&id);

        let entry = HeapEntry {
            id,
            fire_at,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let slot = self.entries.len();
        self.entries.push(entry);
        self.positions.insert(id, slot);
        self.sift_up(slot) == 0
    }

    /// Remove and return the earliest entry
    pub fn pop(&mut self) -> Option<HeapEntry> {
        let id = self.entries.first()?.id;
        self.remove(&id)
    }

    /// Remove `id` wherever it sits
    pub fn remove(&mut self, id: &Ulid) -> Option<HeapEntry> {
        let slot = self.positions.remove(id)?;
        let last = self.entries.len() - 1;

        if slot != last {
            self.entries.swap(slot, last);
            self.positions.insert(self.entries[slot].id, slot);
        }
        let removed = self.entries.pop();

        if slot < self.entries.len() {
            // The moved entry may belong above or below its new slot
            let slot = self.sift_up(slot);
            self.sift_down(slot);
        }
        removed
    }

    pub fn fire_at(&self, id: &Ulid) -> Option<DateTime<Utc>> {
        self.positions.get(id).map(|&slot| self.entries[slot].fire_at)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    fn sift_up(&mut self, mut slot: usize) -> usize {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.entries[slot] >= self.entries[parent] {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
        slot
    }

    fn sift_down(&mut self, mut slot: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * slot + 1;
            let right = left + 1;
            let mut smallest = slot;

            if left < len && self.entries[left] < self.entries[smallest] {
                smallest = left;
            }
            if right < len && self.entries[right] < self.entries[smallest] {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap(slot, smallest);
            slot = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].id, a);
        self.positions.insert(self.entries[b].id, b);
    }

    /// Check the heap and index invariants
    #[cfg(test)]
    pub(crate) fn is_valid(&self) -> bool {
        let ordered = (1..self.entries.len()).all(|i| self.entries[(i - 1) / 2] <= self.entries[i]);
        let indexed = self.positions.len() == self.entries.len()
            && self
                .entries
                .iter()
                .enumerate()
                .all(|(slot, e)| self.positions.get(&e.id) == Some(&slot));
        ordered && indexed
    }
}
