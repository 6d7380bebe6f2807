//! Engine configuration
//!
//! Registration timeout, RTCP tracking, merge-leg tracking and audio saving
//! are carried here and handed to the [`Calltable`](crate::Calltable) at
//! construction; nothing is read from process-wide state.
//!
//! ```toml
//! hash_buckets = 150000
//! callid_merge = true
//!
//! [windows]
//! teardown_seen = 60
//!
//! [timeouts]
//! rtp = 300
//!
//! [logging]
//! level = "info"
//! json = true
//!
//! [selection]
//! rules = ["match_signaling_address", "both_directions", "temporal_precedence"]
//! concurrency_tolerance_ms = 500
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::call::selection::SelectionRule;
use crate::error::{CalltableError, Result};
use crate::logging::LoggingConfig;

/// Deadline extension windows, in seconds, keyed by protocol state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineWindows {
    /// Registration sessions, applied on every event
    pub registration: u64,
    /// Teardown request answered with 2xx
    pub teardown_confirmed: u64,
    /// Teardown request seen, no final answer yet
    pub teardown_seen: u64,
    /// Last final response was 487 Request Terminated
    pub request_terminated: u64,
    /// Everything else
    pub default: u64,
}

impl Default for DeadlineWindows {
    fn default() -> Self {
        Self {
            registration: 5,
            teardown_confirmed: 5,
            teardown_seen: 60,
            request_terminated: 15,
            default: 5,
        }
    }
}

/// Independent expiry policies evaluated by the sweep, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// No packet of any kind for this long retires the session
    pub rtp: u64,
    /// Hard cap on session lifetime
    pub absolute: u64,
    /// Circuit sessions with no ISUP message for this long are retired
    pub ss7: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            rtp: 300,
            absolute: 4 * 3600,
            ss7: 3600,
        }
    }
}

/// Media stream selection tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Rules applied in order; each narrows the candidate set when it can
    pub rules: Vec<SelectionRule>,
    /// Streams on the same role overlapping longer than this are concurrent
    pub concurrency_tolerance_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                SelectionRule::MatchSignalingAddress,
                SelectionRule::BothDirections,
                SelectionRule::TemporalPrecedence,
            ],
            concurrency_tolerance_ms: 500,
        }
    }
}

/// Background worker cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub sweep_interval_ms: u64,
    pub drain_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1000,
            drain_interval_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Top-level configuration for the session registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalltableConfig {
    /// Bucket count of the endpoint hash table
    pub hash_buckets: usize,
    /// Media endpoint bindings tracked per session
    pub max_bindings_per_call: usize,
    /// Media streams (distinct SSRCs) tracked per session
    pub max_streams_per_call: usize,
    /// Signaling addresses remembered per side
    pub max_sip_addresses: usize,
    /// Bind port+1 for RTCP when the SDP does not negotiate rtcp-mux
    pub rtcp: bool,
    /// Track merge legs folded into one call by an external correlation key
    pub callid_merge: bool,
    /// Hand retired sessions to the persistence sink
    pub persist: bool,
    /// Hand retired sessions to the audio pipeline
    pub save_audio: bool,
    pub windows: DeadlineWindows,
    pub timeouts: Timeouts,
    pub selection: SelectionConfig,
    pub workers: WorkerConfig,
    pub logging: LoggingConfig,
}

impl Default for CalltableConfig {
    fn default() -> Self {
        Self {
            hash_buckets: 150_000,
            max_bindings_per_call: 40,
            max_streams_per_call: 40,
            max_sip_addresses: 4,
            rtcp: true,
            callid_merge: false,
            persist: true,
            save_audio: false,
            windows: DeadlineWindows::default(),
            timeouts: Timeouts::default(),
            selection: SelectionConfig::default(),
            workers: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CalltableConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: CalltableConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn with_callid_merge(mut self) -> Self {
        self.callid_merge = true;
        self
    }

    pub fn with_save_audio(mut self) -> Self {
        self.save_audio = true;
        self
    }

    pub fn with_hash_buckets(mut self, buckets: usize) -> Self {
        self.hash_buckets = buckets;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.hash_buckets == 0 {
            return Err(CalltableError::Config("hash_buckets must be non-zero".into()));
        }
        if self.max_bindings_per_call == 0 || self.max_streams_per_call == 0 {
            return Err(CalltableError::Config(
                "per-call binding and stream capacity must be non-zero".into(),
            ));
        }
        if self.max_sip_addresses == 0 {
            return Err(CalltableError::Config("max_sip_addresses must be non-zero".into()));
        }
        if self.windows.teardown_seen < self.windows.teardown_confirmed {
            return Err(CalltableError::Config(
                "teardown_seen window must not be shorter than teardown_confirmed".into(),
            ));
        }
        if self.workers.sweep_interval_ms == 0 || self.workers.drain_interval_ms == 0 {
            return Err(CalltableError::Config("worker intervals must be non-zero".into()));
        }
        self.logging.parsed_level()?;
        Ok(())
    }
}
