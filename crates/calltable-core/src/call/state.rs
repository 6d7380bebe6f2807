//! Protocol milestones and the destroy deadline
//!
//! Setup and teardown are independent axes, so they are kept as
//! first-occurrence timestamps rather than a single state enum; the phase
//! views ([`SetupPhase`], [`TeardownPhase`]) are derived from them.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::DeadlineWindows;
use crate::packet::CallKind;
use crate::time::PacketTime;

pub const REQUEST_TERMINATED: u16 = 487;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupPhase {
    NoSetup,
    SetupSeen,
    SetupConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPhase {
    None = 0,
    Seen = 1,
    Confirmed = 2,
}

impl TeardownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => TeardownPhase::Confirmed,
            1 => TeardownPhase::Seen,
            _ => TeardownPhase::None,
        }
    }
}

/// Signaling milestones, each with the time it was first observed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolState {
    pub invite_at: Option<PacketTime>,
    pub trying_at: Option<PacketTime>,
    pub provisional_at: Option<PacketTime>,
    pub first_final_response_at: Option<PacketTime>,
    /// Connect time (2xx to the initial request)
    pub final_success_at: Option<PacketTime>,
    pub cancel_at: Option<PacketTime>,
    pub teardown_at: Option<PacketTime>,
    pub teardown_confirmed_at: Option<PacketTime>,
    /// Teardown drew a non-2xx answer, or was never answered before retirement
    pub unconfirmed_teardown: bool,
    /// Most recent final (or 18x) response code, 0 if none
    pub last_response_code: u16,
}

impl ProtocolState {
    pub fn setup_phase(&self) -> SetupPhase {
        if self.final_success_at.is_some() {
            SetupPhase::SetupConfirmed
        } else if self.invite_at.is_some() {
            SetupPhase::SetupSeen
        } else {
            SetupPhase::NoSetup
        }
    }

    pub fn teardown_phase(&self) -> TeardownPhase {
        if self.teardown_confirmed_at.is_some() {
            TeardownPhase::Confirmed
        } else if self.teardown_at.is_some() {
            TeardownPhase::Seen
        } else {
            TeardownPhase::None
        }
    }

    pub fn is_unconfirmed_teardown(&self) -> bool {
        self.unconfirmed_teardown
    }
}

/// Extension window for the current protocol state.
///
/// `current_code` is the response code of the packet being processed, if
/// any; a 487 on either the current packet or the last recorded response
/// selects the request-terminated window.
pub fn deadline_window(
    kind: CallKind,
    protocol: &ProtocolState,
    current_code: Option<u16>,
    windows: &DeadlineWindows,
) -> u64 {
    if kind.is_registration() {
        return windows.registration;
    }
    match protocol.teardown_phase() {
        TeardownPhase::Confirmed => windows.teardown_confirmed,
        TeardownPhase::Seen => windows.teardown_seen,
        TeardownPhase::None => {
            if current_code == Some(REQUEST_TERMINATED) || protocol.last_response_code == REQUEST_TERMINATED {
                windows.request_terminated
            } else {
                windows.default
            }
        }
    }
}

/// Absolute destroy deadline in capture seconds.
///
/// Zero means unarmed. Within one teardown phase the value only moves
/// forward; entering a later phase restarts it from that packet's window.
/// Writers are serialized by the owning session's state lock, readers (the
/// sweep) load it without locking.
#[derive(Debug, Default)]
pub struct Deadline {
    at: AtomicU64,
    phase: AtomicU8,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(at: u64) -> Self {
        Self {
            at: AtomicU64::new(at),
            phase: AtomicU8::new(TeardownPhase::None as u8),
        }
    }

    pub fn get(&self) -> Option<u64> {
        match self.at.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn phase(&self) -> TeardownPhase {
        TeardownPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_armed(&self) -> bool {
        self.get().is_some()
    }

    pub fn has_elapsed(&self, now_secs: u64) -> bool {
        matches!(self.get(), Some(at) if at <= now_secs)
    }

    /// Arm if needed, then move forward to `candidate`
    pub fn arm_or_extend(&self, candidate: u64) {
        self.at.fetch_max(candidate, Ordering::AcqRel);
    }

    /// Move forward to `candidate` only if already armed
    pub fn extend_if_armed(&self, candidate: u64) {
        let _ = self
            .at
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != 0 && candidate > current).then_some(candidate)
            });
    }

    /// Advance to `phase` (restarting the deadline at `candidate`) or, if
    /// already there, extend within it. Earlier phases are ignored.
    pub fn enter_phase(&self, phase: TeardownPhase, candidate: u64) {
        let current = self.phase();
        if phase > current {
            self.phase.store(phase as u8, Ordering::Release);
            self.at.store(candidate, Ordering::Release);
        } else if phase == current {
            self.arm_or_extend(candidate);
        }
    }
}
