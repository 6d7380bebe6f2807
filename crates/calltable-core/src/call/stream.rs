//! Per-SSRC media stream state

use std::net::SocketAddr;

use serde::Serialize;

use crate::packet::{MediaPacket, Role};
use crate::time::PacketTime;

/// Decode state for one media source observed on a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaStream {
    pub ssrc: u32,
    pub role: Role,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// Binding the first packet matched
    pub binding: Option<usize>,
    pub payload_type: u8,
    pub first_seen: PacketTime,
    pub last_seen: PacketTime,
    pub packets: u64,
    pub bytes: u64,
    pub rtcp_packets: u64,
    /// Sequence discontinuities (not counting wrap-around)
    pub seq_gaps: u64,
    #[serde(skip)]
    last_seq: u16,
    /// Graph/raw writer attached to this stream
    pub writer_open: bool,
}

impl MediaStream {
    pub fn new(packet: &MediaPacket, role: Role, binding: Option<usize>) -> Self {
        Self {
            ssrc: packet.ssrc,
            role,
            src: packet.src,
            dst: packet.dst,
            binding,
            payload_type: packet.payload_type,
            first_seen: packet.time,
            last_seen: packet.time,
            packets: 1,
            bytes: u64::from(packet.payload_len),
            rtcp_packets: 0,
            seq_gaps: 0,
            last_seq: packet.seq,
            writer_open: false,
        }
    }

    pub fn matches(&self, packet: &MediaPacket) -> bool {
        self.ssrc == packet.ssrc && self.src == packet.src && self.dst == packet.dst
    }

    pub(crate) fn record(&mut self, packet: &MediaPacket) {
        if packet.time > self.last_seen {
            self.last_seen = packet.time;
        }
        if packet.seq != self.last_seq.wrapping_add(1) && packet.seq != self.last_seq {
            self.seq_gaps += 1;
        }
        self.last_seq = packet.seq;
        self.payload_type = packet.payload_type;
        self.packets += 1;
        self.bytes += u64::from(packet.payload_len);
    }

    pub fn duration_ms(&self) -> u64 {
        self.last_seen.as_millis().saturating_sub(self.first_seen.as_millis())
    }

    /// Time overlap with another stream in milliseconds
    pub fn overlap_ms(&self, other: &MediaStream) -> u64 {
        let start = self.first_seen.max(other.first_seen).as_millis();
        let end = self.last_seen.min(other.last_seen).as_millis();
        end.saturating_sub(start)
    }
}

/// Result of feeding a media packet to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Existing { index: usize },
    Created { index: usize },
    /// RTCP accounted to the binding only
    Control,
    /// Stream capacity exhausted or session finalizing
    Dropped,
}

impl StreamOutcome {
    pub fn index(&self) -> Option<usize> {
        match self {
            StreamOutcome::Existing { index } | StreamOutcome::Created { index } => Some(*index),
            StreamOutcome::Control | StreamOutcome::Dropped => None,
        }
    }
}
