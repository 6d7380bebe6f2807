//! Choosing which media streams represent a call's audio
//!
//! A role can accumulate several SSRCs (re-INVITEs, codec switches, media
//! relays, early media from forked legs). Rules run in configured order:
//! filter rules narrow the candidate set when at least one candidate
//! passes, ordering rules decide how the non-overlapping chain is built.
//! Candidates that overlap an already chained stream by more than the
//! tolerance are reported as concurrent instead of being chained.

use std::cmp::Reverse;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use super::binding::Bindings;
use super::stream::MediaStream;
use crate::config::SelectionConfig;
use crate::packet::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionRule {
    /// Keep streams sent from the side's signaling address
    MatchSignalingAddress,
    /// Keep streams whose binding carried media in both directions
    BothDirections,
    /// Chain by start time
    TemporalPrecedence,
    /// Chain by packet count, most first
    LongestDuration,
}

impl SelectionRule {
    fn is_ordering(&self) -> bool {
        matches!(self, SelectionRule::TemporalPrecedence | SelectionRule::LongestDuration)
    }
}

/// Indexes into the session's stream list
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSelection {
    pub selected: Vec<usize>,
    pub concurrent: Vec<usize>,
}

impl StreamSelection {
    pub fn is_selected(&self, index: usize) -> bool {
        self.selected.contains(&index)
    }

    pub fn has_concurrent(&self) -> bool {
        !self.concurrent.is_empty()
    }
}

/// Run the configured rules over both roles.
///
/// `signaling` holds the signaling addresses seen for each role, indexed by
/// [`Role::index`].
pub fn select_streams(
    streams: &[MediaStream],
    bindings: &Bindings,
    signaling: [&[IpAddr]; 2],
    config: &SelectionConfig,
) -> StreamSelection {
    let mut selection = StreamSelection::default();
    for role in [Role::Caller, Role::Callee] {
        select_role(streams, bindings, signaling[role.index()], role, config, &mut selection);
    }
    selection.selected.sort_unstable();
    selection.concurrent.sort_unstable();
    selection
}

fn select_role(
    streams: &[MediaStream],
    bindings: &Bindings,
    signaling: &[IpAddr],
    role: Role,
    config: &SelectionConfig,
    out: &mut StreamSelection,
) {
    let mut candidates: Vec<usize> = streams
        .iter()
        .enumerate()
        .filter(|(_, s)| s.role == role && s.packets > 0)
        .map(|(i, _)| i)
        .collect();
    if candidates.is_empty() {
        return;
    }

    for rule in &config.rules {
        let narrowed: Vec<usize> = match rule {
            SelectionRule::MatchSignalingAddress => candidates
                .iter()
                .copied()
                .filter(|&i| signaling.contains(&streams[i].src.ip()))
                .collect(),
            SelectionRule::BothDirections => candidates
                .iter()
                .copied()
                .filter(|&i| {
                    streams[i]
                        .binding
                        .and_then(|b| bindings.get(b))
                        .is_some_and(|b| b.is_bidirectional())
                })
                .collect(),
            _ => continue,
        };
        if !narrowed.is_empty() {
            candidates = narrowed;
        }
    }

    let ordering = config
        .rules
        .iter()
        .copied()
        .find(SelectionRule::is_ordering)
        .unwrap_or(SelectionRule::TemporalPrecedence);
    match ordering {
        SelectionRule::LongestDuration => {
            candidates.sort_by_key(|&i| (Reverse(streams[i].packets), streams[i].first_seen, i))
        }
        _ => candidates.sort_by_key(|&i| (streams[i].first_seen, i)),
    }

    let mut chain: Vec<usize> = Vec::new();
    for index in candidates {
        let overlapping = chain
            .iter()
            .any(|&c| streams[c].overlap_ms(&streams[index]) > config.concurrency_tolerance_ms);
        if overlapping {
            out.concurrent.push(index);
        } else {
            chain.push(index);
        }
    }
    out.selected.extend(chain);
}
