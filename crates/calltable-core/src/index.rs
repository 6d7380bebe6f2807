//! Signaling identifier indexes
//!
//! Each index is a sharded map from an identifier (call-id bytes by default,
//! Skinny party ids and address pairs otherwise) to the owning session.
//! Lookups hand out a [`CallHandle`] taken while the shard lock is held, so a
//! sweep that removes the entry right after cannot free the session under
//! the caller.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::call::{Call, CallHandle};

#[derive(Debug)]
pub struct IdentifierIndex<K = Bytes>
where
    K: Eq + Hash,
{
    name: &'static str,
    map: DashMap<K, Arc<Call>>,
}

impl<K: Eq + Hash> IdentifierIndex<K> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            map: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains<Q>(&self, id: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(id)
    }

    /// Live, non-finalizing session for `id`
    pub fn find<Q>(&self, id: &Q) -> Option<CallHandle>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.map.get(id)?;
        (!entry.is_finalizing()).then(|| CallHandle::new(entry.value()))
    }

    /// Whether `call` is the entry currently stored under `id`
    pub fn points_to<Q>(&self, id: &Q, call: &Call) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map
            .get(id)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry.value()), call))
    }

    /// Atomic find-or-create. A finalizing entry is replaced by a fresh
    /// session; the sweep removing the old one only removes its own entry.
    pub fn find_or_insert_with(&self, id: K, create: impl FnOnce() -> Call) -> (CallHandle, bool) {
        match self.map.entry(id) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_finalizing() {
                    return (CallHandle::new(occupied.get()), false);
                }
                let call = Arc::new(create());
                let handle = CallHandle::new(&call);
                occupied.insert(call);
                (handle, true)
            }
            Entry::Vacant(vacant) => {
                let call = Arc::new(create());
                let handle = CallHandle::new(&call);
                vacant.insert(call);
                (handle, true)
            }
        }
    }

    /// Point `id` at `call` unless a live session already owns it.
    /// Returns whether the alias now points at `call`.
    pub fn insert_alias(&self, id: K, call: &Arc<Call>) -> bool {
        match self.map.entry(id) {
            Entry::Occupied(mut occupied) => {
                if Arc::ptr_eq(occupied.get(), call) {
                    return true;
                }
                if occupied.get().is_finalizing() {
                    occupied.insert(Arc::clone(call));
                    return true;
                }
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(call));
                true
            }
        }
    }

    /// Point `id` at `call`, replacing whatever session held it before.
    /// Returns true if `id` was previously held by another session.
    pub fn insert(&self, id: K, call: &Arc<Call>) -> bool {
        self.map
            .insert(id, Arc::clone(call))
            .is_some_and(|previous| !Arc::ptr_eq(&previous, call))
    }

    /// Remove `id` only if it still points at `call`
    pub fn remove_if_same<Q>(&self, id: &Q, call: &Call) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map
            .remove_if(id, |_, stored| std::ptr::eq(Arc::as_ptr(stored), call))
            .is_some()
    }

    /// Whether any identifier still points at `call`. Scans every shard.
    pub fn references(&self, call: &Call) -> bool {
        self.map
            .iter()
            .any(|entry| std::ptr::eq(Arc::as_ptr(entry.value()), call))
    }

    /// Sessions matching `predicate`, collected without holding any shard
    /// lock past the return
    pub fn collect_where(&self, mut predicate: impl FnMut(&Arc<Call>) -> bool) -> Vec<Arc<Call>> {
        self.map
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn calls(&self) -> Vec<Arc<Call>> {
        self.collect_where(|_| true)
    }
}
