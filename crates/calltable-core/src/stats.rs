//! Registry counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonic counters updated on the packet and sweep paths
#[derive(Debug, Default)]
pub struct Counters {
    pub calls_created: AtomicU64,
    pub registrations_created: AtomicU64,
    pub circuits_created: AtomicU64,
    pub circuits_finalized: AtomicU64,
    pub swept: AtomicU64,
    pub destroyed: AtomicU64,
    pub degraded: AtomicU64,
    pub media_unmatched: AtomicU64,
    pub bindings_dropped: AtomicU64,
    pub streams_dropped: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalltableStats {
    pub active_calls: usize,
    pub active_registrations: usize,
    pub active_circuits: usize,
    pub merge_aliases: usize,
    /// Party-id plus address-pair entries of Skinny sessions
    pub skinny_entries: usize,
    pub endpoint_entries: usize,
    pub calls_created: u64,
    pub registrations_created: u64,
    pub circuits_created: u64,
    pub circuits_finalized: u64,
    pub swept: u64,
    pub destroyed: u64,
    pub degraded: u64,
    pub media_unmatched: u64,
    pub bindings_dropped: u64,
    pub streams_dropped: u64,
    pub pending_persist: usize,
    pub pending_audio: usize,
    pub pending_delete: usize,
    pub pending_registration_persist: usize,
    pub pending_registration_delete: usize,
    pub pending_circuits: usize,
    pub pending_files: usize,
    pub endpoint_contention: u64,
}

impl CalltableStats {
    /// Sessions retired but not yet destroyed
    pub fn pending_destroy(&self) -> usize {
        self.pending_delete + self.pending_registration_delete
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
