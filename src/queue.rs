//! Execution queue
//!
//! A globally ordered view of pending `(domain, id)` references. Order keys are
//! resolved by indirection into the registry:
//! 1. due time ascending
//! 2. different domains: smaller origin first (creation order on equal origins)
//! 3. same domain: defined priority before undefined, smaller priority first,
//!    then ascending id
//!
//! `ExecutionQueue` is the seam for swapping in another structure; see
//! [`crate::pq::HeapQueue`].

use crate::callback::CallbackId;
use crate::domain::DomainLabel;
use crate::error::SchedulerError;
use std::cmp::Ordering;

/// A queue reference to a registry record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub label: DomainLabel,
    pub id: CallbackId,
}

impl QueueEntry {
    pub fn new(label: DomainLabel, id: CallbackId) -> Self {
        Self { label, id }
    }
}

/// Sort key of a queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderKey {
    pub due: u64,
    pub origin: u64,
    pub domain_serial: u64,
    pub priority: Option<i32>,
    pub id: u64,
}

impl Ord for OrderKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then(self.origin.cmp(&other.origin))
            .then(self.domain_serial.cmp(&other.domain_serial))
            // Same domain from here on.
            .then_with(|| match (self.priority, other.priority) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for OrderKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Resolves the order key of an entry. `None` means the registry has no
/// record for it, which is a consistency violation.
pub trait KeySource {
    fn order_key(&self, entry: &QueueEntry) -> Option<OrderKey>;
}

pub(crate) fn resolve_key(
    keys: &dyn KeySource,
    entry: &QueueEntry,
    context: &'static str,
) -> Result<OrderKey, SchedulerError> {
    keys.order_key(entry)
        .ok_or_else(|| SchedulerError::Inconsistent {
            label: entry.label.clone(),
            id: entry.id.0,
            context,
        })
}

/// Operations the scheduler driver needs from its queue.
pub trait ExecutionQueue: Default {
    /// Insert at the position the comparator dictates. Existing entries keep
    /// their relative order.
    fn insert(&mut self, entry: QueueEntry, keys: &dyn KeySource) -> Result<(), SchedulerError>;

    /// Remove the entry for `id`, wherever it is.
    fn remove(&mut self, id: CallbackId) -> Option<QueueEntry>;

    fn peek(&mut self) -> Option<QueueEntry>;

    fn pop(&mut self) -> Option<QueueEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);

    /// All entries in execution order.
    fn snapshot(&self) -> Vec<QueueEntry>;
}

/// Sorted vector with a linear insertion scan.
#[derive(Debug, Default)]
pub struct SortedQueue {
    entries: Vec<QueueEntry>,
}

impl SortedQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionQueue for SortedQueue {
    fn insert(&mut self, entry: QueueEntry, keys: &dyn KeySource) -> Result<(), SchedulerError> {
        let key = resolve_key(keys, &entry, "inserted entry")?;

        let mut index = self.entries.len();
        for (i, existing) in self.entries.iter().enumerate() {
            let existing_key = resolve_key(keys, existing, "scan during insertion")?;
            if key < existing_key {
                index = i;
                break;
            }
        }
        self.entries.insert(index, entry);
        Ok(())
    }

    fn remove(&mut self, id: CallbackId) -> Option<QueueEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    fn peek(&mut self) -> Option<QueueEntry> {
        self.entries.first().cloned()
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.clone()
    }
}

/// Check that `entries` is strictly increasing under the comparator.
pub fn verify_sorted(entries: &[QueueEntry], keys: &dyn KeySource) -> Result<(), SchedulerError> {
    let mut prev: Option<OrderKey> = None;
    for (position, entry) in entries.iter().enumerate() {
        let key = resolve_key(keys, entry, "order check")?;
        if let Some(p) = prev {
            if p >= key {
                return Err(SchedulerError::Unsorted { position });
            }
        }
        prev = Some(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Key table standing in for the registry.
    #[derive(Default)]
    struct Keys(HashMap<u64, OrderKey>);

    impl Keys {
        fn add(&mut self, id: u64, due: u64, origin: u64, serial: u64, priority: Option<i32>) -> QueueEntry {
            self.0.insert(
                id,
                OrderKey {
                    due,
                    origin,
                    domain_serial: serial,
                    priority,
                    id,
                },
            );
            QueueEntry::new(DomainLabel::Anonymous(serial), CallbackId(id))
        }
    }

    impl KeySource for Keys {
        fn order_key(&self, entry: &QueueEntry) -> Option<OrderKey> {
            self.0.get(&entry.id.0).copied()
        }
    }

    fn ids(q: &SortedQueue) -> Vec<u64> {
        q.snapshot().iter().map(|e| e.id.0).collect()
    }

    #[test]
    fn test_due_time_first() {
        let mut keys = Keys::default();
        let mut q = SortedQueue::new();
        let a = keys.add(1, 300, 0, 0, None);
        let b = keys.add(2, 100, 0, 0, None);
        let c = keys.add(3, 200, 0, 0, None);
        for e in [a, b, c] {
            q.insert(e, &keys).unwrap();
        }
        assert_eq!(ids(&q), vec![2, 3, 1]);
    }

    #[test]
    fn test_origin_breaks_cross_domain_ties() {
        let mut keys = Keys::default();
        let mut q = SortedQueue::new();
        // Later origin registered first, and with a better priority.
        let late = keys.add(1, 100, 50, 1, Some(0));
        let early = keys.add(2, 100, 10, 0, None);
        q.insert(late, &keys).unwrap();
        q.insert(early, &keys).unwrap();
        assert_eq!(ids(&q), vec![2, 1]);
    }

    #[test]
    fn test_priority_then_id_within_domain() {
        let mut keys = Keys::default();
        let mut q = SortedQueue::new();
        let entries = [
            keys.add(1, 100, 0, 0, None),
            keys.add(2, 100, 0, 0, Some(5)),
            keys.add(3, 100, 0, 0, None),
            keys.add(4, 100, 0, 0, Some(1)),
            keys.add(5, 100, 0, 0, Some(5)),
        ];
        for e in entries {
            q.insert(e, &keys).unwrap();
        }
        assert_eq!(ids(&q), vec![4, 2, 5, 1, 3]);
        verify_sorted(&q.snapshot(), &keys).unwrap();
    }

    #[test]
    fn test_missing_record_is_inconsistent() {
        let mut keys = Keys::default();
        let mut q = SortedQueue::new();
        let a = keys.add(1, 100, 0, 0, None);
        q.insert(a, &keys).unwrap();
        keys.0.remove(&1);

        let b = keys.add(2, 200, 0, 0, None);
        let err = q.insert(b, &keys).unwrap_err();
        assert!(matches!(err, SchedulerError::Inconsistent { id: 1, .. }));
    }

    #[test]
    fn test_remove_and_pop() {
        let mut keys = Keys::default();
        let mut q = SortedQueue::new();
        for (id, due) in [(1, 10), (2, 20), (3, 30)] {
            let e = keys.add(id, due, 0, 0, None);
            q.insert(e, &keys).unwrap();
        }
        assert_eq!(q.remove(CallbackId(2)).map(|e| e.id), Some(CallbackId(2)));
        assert!(q.remove(CallbackId(2)).is_none());
        assert_eq!(q.pop().map(|e| e.id.0), Some(1));
        assert_eq!(q.peek().map(|e| e.id.0), Some(3));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_verify_detects_disorder() {
        let mut keys = Keys::default();
        let a = keys.add(1, 20, 0, 0, None);
        let b = keys.add(2, 10, 0, 0, None);
        assert_eq!(
            verify_sorted(&[a, b], &keys),
            Err(SchedulerError::Unsorted { position: 1 })
        );
    }
}
