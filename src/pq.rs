//! Heap-backed execution queue with lazy deletion
//!
//! Uses std::collections::BinaryHeap with a HashMap as the source of truth.
//! The order key is resolved once at insertion and kept with the heap entry;
//! removal only touches the map, stale heap entries are discarded on peek/pop.

use crate::callback::CallbackId;
use crate::error::SchedulerError;
use crate::queue::{resolve_key, ExecutionQueue, KeySource, OrderKey, QueueEntry};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Clone, Debug, PartialEq, Eq)]
struct HeapKey(OrderKey);

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// BinaryHeap is a max-heap, so we reverse the ordering for min-heap behavior.
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0).reverse()
    }
}

/// A min-heap execution queue.
#[derive(Debug, Default)]
pub struct HeapQueue {
    heap: BinaryHeap<HeapKey>,
    live: HashMap<u64, (OrderKey, QueueEntry)>, // id -> (key, entry)
}

impl HeapQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove stale entries from the top of the heap.
    fn clean_top(&mut self) {
        while let Some(k) = self.heap.peek() {
            let ok = match self.live.get(&k.0.id) {
                Some((key, _)) => *key == k.0,
                None => false,
            };
            if ok {
                break;
            }
            self.heap.pop();
        }
    }

    /// Number of heap slots including stale ones.
    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }
}

impl ExecutionQueue for HeapQueue {
    fn insert(&mut self, entry: QueueEntry, keys: &dyn KeySource) -> Result<(), SchedulerError> {
        let key = resolve_key(keys, &entry, "inserted entry")?;
        self.live.insert(key.id, (key, entry));
        self.heap.push(HeapKey(key));
        Ok(())
    }

    fn remove(&mut self, id: CallbackId) -> Option<QueueEntry> {
        self.live.remove(&id.0).map(|(_, e)| e)
    }

    fn peek(&mut self) -> Option<QueueEntry> {
        self.clean_top();
        let k = self.heap.peek()?;
        self.live.get(&k.0.id).map(|(_, e)| e.clone())
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        loop {
            let k = self.heap.pop()?;
            match self.live.get(&k.0.id) {
                Some((key, _)) if *key == k.0 => {}
                _ => continue, // stale entry
            }
            return self.live.remove(&k.0.id).map(|(_, e)| e);
        }
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    fn snapshot(&self) -> Vec<QueueEntry> {
        let mut items: Vec<_> = self.live.values().collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.into_iter().map(|(_, e)| e.clone()).collect()
    }
}
