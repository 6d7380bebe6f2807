//! Capture timestamps
//!
//! All lifecycle decisions are made against packet capture time, never the
//! wall clock, so offline replays of a capture file age sessions out exactly
//! as a live capture would.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Capture timestamp (seconds + microseconds since the UNIX epoch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketTime {
    pub secs: u64,
    pub usecs: u32,
}

impl PacketTime {
    pub const ZERO: PacketTime = PacketTime { secs: 0, usecs: 0 };

    pub fn new(secs: u64, usecs: u32) -> Self {
        Self {
            secs: secs.saturating_add(u64::from(usecs / 1_000_000)),
            usecs: usecs % 1_000_000,
        }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self { secs, usecs: 0 }
    }

    pub fn from_micros(micros: u64) -> Self {
        Self {
            secs: micros / 1_000_000,
            usecs: (micros % 1_000_000) as u32,
        }
    }

    pub fn as_micros(&self) -> u64 {
        self.secs * 1_000_000 + u64::from(self.usecs)
    }

    pub fn as_millis(&self) -> u64 {
        self.as_micros() / 1_000
    }

    pub fn is_zero(&self) -> bool {
        self.secs == 0 && self.usecs == 0
    }

    /// Wall-clock rendering used in persisted rows
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.secs as i64, self.usecs * 1_000)
    }
}

impl fmt::Display for PacketTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.usecs)
    }
}
