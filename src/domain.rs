//! Logical clock domains and the callback registry
//!
//! Each domain keeps its own logical time line. It is created lazily on the
//! first registration under its label and destroyed when its last record goes.

use crate::callback::{CallbackId, DelayedCallback};
use crate::queue::{KeySource, OrderKey, QueueEntry};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Identity of a logical clock domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DomainLabel {
    /// Shared domain for unlabeled zero-timeout registrations. Origin 0.
    ZeroDelay,
    /// Fresh domain for an unlabeled registration with a positive timeout.
    Anonymous(u64),
    Named(String),
}

impl DomainLabel {
    pub fn named(label: impl Into<String>) -> Self {
        DomainLabel::Named(label.into())
    }
}

impl fmt::Display for DomainLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainLabel::ZeroDelay => write!(f, "<zero-delay>"),
            DomainLabel::Anonymous(n) => write!(f, "<anon:{}>", n),
            DomainLabel::Named(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for DomainLabel {
    fn from(s: &str) -> Self {
        DomainLabel::Named(s.to_string())
    }
}

/// A labeled logical clock domain and the records registered under it.
#[derive(Debug)]
pub struct ClockDomain {
    current_logical_time: u64,
    origin: u64,
    /// Creation order; breaks ties between domains with equal origins.
    serial: u64,
    callbacks: BTreeMap<u64, DelayedCallback>,
}

impl ClockDomain {
    fn new(origin: u64, serial: u64) -> Self {
        Self {
            current_logical_time: origin,
            origin,
            serial,
            callbacks: BTreeMap::new(),
        }
    }

    pub fn current_logical_time(&self) -> u64 {
        self.current_logical_time
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn get(&self, id: CallbackId) -> Option<&DelayedCallback> {
        self.callbacks.get(&id.0)
    }

    /// Advance logical time to the due time of the entry about to run.
    /// Returns false if that would move time backwards (left untouched).
    pub(crate) fn advance_to(&mut self, t: u64) -> bool {
        if t < self.current_logical_time {
            return false;
        }
        self.current_logical_time = t;
        true
    }
}

/// Domain table plus the per-domain callback registry.
#[derive(Debug, Default)]
pub struct DomainTable {
    domains: HashMap<DomainLabel, ClockDomain>,
    /// id -> owning domain, so cancellation needs no scan.
    owners: HashMap<u64, DomainLabel>,
    next_serial: u64,
}

impl DomainTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `label`, creating the domain with the given origin if absent.
    pub(crate) fn resolve(&mut self, label: &DomainLabel, origin: u64) -> &mut ClockDomain {
        let next_serial = &mut self.next_serial;
        self.domains.entry(label.clone()).or_insert_with(|| {
            let serial = *next_serial;
            *next_serial += 1;
            tracing::debug!(domain = %label, origin, serial, "clock domain created");
            ClockDomain::new(origin, serial)
        })
    }

    pub fn get(&self, label: &DomainLabel) -> Option<&ClockDomain> {
        self.domains.get(label)
    }

    pub(crate) fn get_mut(&mut self, label: &DomainLabel) -> Option<&mut ClockDomain> {
        self.domains.get_mut(label)
    }

    pub fn owner(&self, id: CallbackId) -> Option<&DomainLabel> {
        self.owners.get(&id.0)
    }

    pub fn record(&self, id: CallbackId) -> Option<&DelayedCallback> {
        let label = self.owners.get(&id.0)?;
        self.domains.get(label)?.get(id)
    }

    pub(crate) fn record_mut(&mut self, id: CallbackId) -> Option<&mut DelayedCallback> {
        let label = self.owners.get(&id.0)?;
        self.domains.get_mut(label)?.callbacks.get_mut(&id.0)
    }

    /// Insert a record into an existing domain. False if the domain is missing.
    pub(crate) fn insert(&mut self, label: &DomainLabel, id: CallbackId, rec: DelayedCallback) -> bool {
        let Some(domain) = self.domains.get_mut(label) else {
            return false;
        };
        domain.callbacks.insert(id.0, rec);
        self.owners.insert(id.0, label.clone());
        true
    }

    /// Remove a record; the domain goes with its last record.
    /// Returns the record and whether its domain was removed.
    pub(crate) fn remove(&mut self, id: CallbackId) -> Option<(DomainLabel, DelayedCallback, bool)> {
        let label = self.owners.remove(&id.0)?;
        let domain = self.domains.get_mut(&label)?;
        let rec = domain.callbacks.remove(&id.0)?;
        let emptied = domain.callbacks.is_empty();
        if emptied {
            self.domains.remove(&label);
            tracing::debug!(domain = %label, "clock domain removed");
        }
        Some((label, rec, emptied))
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn record_count(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &DomainLabel> {
        self.domains.keys()
    }

    /// Drop every domain and record and restart domain serials.
    pub(crate) fn clear(&mut self) {
        self.domains.clear();
        self.owners.clear();
        self.next_serial = 0;
    }
}

impl KeySource for DomainTable {
    fn order_key(&self, entry: &QueueEntry) -> Option<OrderKey> {
        let domain = self.domains.get(&entry.label)?;
        let rec = domain.get(entry.id)?;
        Some(OrderKey {
            due: rec.next_execution_time,
            origin: domain.origin,
            domain_serial: domain.serial,
            priority: rec.priority,
            id: entry.id.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackKind, CallbackOptions};

    fn rec(due: u64) -> DelayedCallback {
        DelayedCallback::new(
            Box::new(|| Ok(())),
            0,
            CallbackKind::Once,
            due,
            CallbackOptions::new(),
        )
    }

    #[test]
    fn test_resolve_is_lazy_and_sticky() {
        let mut table = DomainTable::new();
        let x = DomainLabel::named("x");
        assert_eq!(table.resolve(&x, 40).origin(), 40);
        // Origin is fixed at first use.
        assert_eq!(table.resolve(&x, 90).origin(), 40);
        assert_eq!(table.resolve(&x, 90).current_logical_time(), 40);
        assert_eq!(table.domain_count(), 1);
    }

    #[test]
    fn test_domain_removed_with_last_record() {
        let mut table = DomainTable::new();
        let x = DomainLabel::named("x");
        table.resolve(&x, 0);
        assert!(table.insert(&x, CallbackId(1), rec(10)));
        assert!(table.insert(&x, CallbackId(2), rec(20)));

        let (_, _, emptied) = table.remove(CallbackId(1)).unwrap();
        assert!(!emptied);
        let (label, r, emptied) = table.remove(CallbackId(2)).unwrap();
        assert!(emptied);
        assert_eq!(label, x);
        assert_eq!(r.next_execution_time(), 20);
        assert!(table.is_empty());
        assert!(table.remove(CallbackId(2)).is_none());
    }

    #[test]
    fn test_logical_time_never_goes_back() {
        let mut table = DomainTable::new();
        let d = table.resolve(&DomainLabel::ZeroDelay, 0);
        assert!(d.advance_to(5));
        assert!(!d.advance_to(3));
        assert_eq!(d.current_logical_time(), 5);
    }

    #[test]
    fn test_order_key_indirection() {
        let mut table = DomainTable::new();
        let a = DomainLabel::named("a");
        let b = DomainLabel::Anonymous(1);
        table.resolve(&a, 7);
        table.resolve(&b, 9);
        assert!(table.insert(&b, CallbackId(3), rec(100)));
        assert!(!table.insert(&DomainLabel::named("c"), CallbackId(4), rec(1)));

        let key = table
            .order_key(&QueueEntry::new(b.clone(), CallbackId(3)))
            .unwrap();
        assert_eq!(key.due, 100);
        assert_eq!(key.origin, 9);
        assert_eq!(key.domain_serial, 1);
        assert!(table
            .order_key(&QueueEntry::new(a, CallbackId(3)))
            .is_none());
    }
}
