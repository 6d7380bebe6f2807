//! Legs folded into one call by an external correlation header

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Serialize;

use crate::time::PacketTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeLeg {
    pub teardown_at: Option<PacketTime>,
}

#[derive(Debug, Clone, Default)]
pub struct MergeLegs {
    legs: BTreeMap<Bytes, MergeLeg>,
}

impl MergeLegs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, call_id: Bytes) {
        self.legs.entry(call_id).or_default();
    }

    pub fn contains(&self, call_id: &[u8]) -> bool {
        self.legs.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    pub fn leg_ids(&self) -> impl Iterator<Item = &Bytes> {
        self.legs.keys()
    }

    /// Record a teardown on `call_id`; the first occurrence wins.
    /// Unknown legs are registered on the fly.
    pub fn mark_teardown(&mut self, call_id: &Bytes, time: PacketTime) {
        let leg = self.legs.entry(call_id.clone()).or_default();
        if leg.teardown_at.is_none() {
            leg.teardown_at = Some(time);
        }
    }

    /// Latest teardown across legs, only once every leg has torn down
    pub fn teardown_complete_at(&self) -> Option<PacketTime> {
        if self.legs.is_empty() {
            return None;
        }
        let mut latest = PacketTime::ZERO;
        for leg in self.legs.values() {
            latest = latest.max(leg.teardown_at?);
        }
        Some(latest)
    }
}
