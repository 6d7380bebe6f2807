//! Media endpoints negotiated for a session
//!
//! Bindings are appended in negotiation order and never reordered; media
//! streams refer to them by index.

use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use tracing::{debug, warn};

use crate::packet::{Role, SdpFlags};
use crate::time::PacketTime;

/// Observed media flow on one direction of a binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    pub src: Option<SocketAddr>,
    pub dst: Option<SocketAddr>,
    pub first_seen: Option<PacketTime>,
    pub last_seen: Option<PacketTime>,
    pub packets: u64,
}

impl FlowRecord {
    pub fn is_observed(&self) -> bool {
        self.packets > 0
    }

    fn observe(&mut self, src: SocketAddr, dst: SocketAddr, time: PacketTime) {
        if self.src.is_none() {
            self.src = Some(src);
            self.dst = Some(dst);
            self.first_seen = Some(time);
        }
        self.last_seen = Some(time);
        self.packets += 1;
    }
}

/// Direction of a media packet relative to the binding that matched it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    /// Matched on destination: the endpoint is receiving
    Inbound = 0,
    /// Matched on source: the endpoint is sending
    Outbound = 1,
}

/// One negotiated media endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpPortBinding {
    /// Source address of the signaling message that announced the endpoint
    pub reported_by: IpAddr,
    pub addr: IpAddr,
    pub port: u16,
    pub role: Role,
    pub session_id: String,
    pub leg: String,
    /// Position of the media line within its session description
    pub line: usize,
    pub codecs: Vec<u8>,
    pub flags: SdpFlags,
    pub bound_at: PacketTime,
    pub refreshed_at: PacketTime,
    pub flows: [FlowRecord; 2],
}

impl IpPortBinding {
    pub fn endpoint(&self) -> (IpAddr, u16) {
        (self.addr, self.port)
    }

    /// RTCP port paired with this binding, if it is tracked separately
    pub fn rtcp_port(&self, rtcp_enabled: bool) -> Option<u16> {
        (rtcp_enabled && !self.flags.rtcp_mux)
            .then(|| self.port.checked_add(1))
            .flatten()
    }

    /// Both directions carried media
    pub fn is_bidirectional(&self) -> bool {
        self.flows.iter().all(FlowRecord::is_observed)
    }

    pub fn flow(&self, direction: FlowDirection) -> &FlowRecord {
        &self.flows[direction as usize]
    }

    pub(crate) fn observe(&mut self, direction: FlowDirection, src: SocketAddr, dst: SocketAddr, time: PacketTime) {
        self.flows[direction as usize].observe(src, dst, time);
    }
}

/// Announced endpoint as handed to [`Bindings::add`]
#[derive(Debug, Clone)]
pub struct BindingRequest {
    pub reported_by: IpAddr,
    pub addr: IpAddr,
    pub port: u16,
    pub role: Role,
    pub session_id: String,
    pub leg: String,
    pub line: usize,
    pub codecs: Vec<u8>,
    pub flags: SdpFlags,
    pub time: PacketTime,
}

/// Result of announcing an endpoint to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Added { index: usize },
    /// Same endpoint and role already bound; metadata refreshed
    Refreshed { index: usize },
    /// The session description moved this media line; `previous` must be
    /// unbound from the endpoint table
    Renegotiated { index: usize, previous: (IpAddr, u16), previous_rtcp: Option<u16> },
    /// Capacity exhausted or session finalizing; nothing bound
    Dropped,
}

impl BindOutcome {
    pub fn index(&self) -> Option<usize> {
        match self {
            BindOutcome::Added { index }
            | BindOutcome::Refreshed { index }
            | BindOutcome::Renegotiated { index, .. } => Some(*index),
            BindOutcome::Dropped => None,
        }
    }
}

/// Bounded, append-only binding list of one session
#[derive(Debug, Clone)]
pub struct Bindings {
    entries: Vec<IpPortBinding>,
    capacity: usize,
    dropped: u32,
}

impl Bindings {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&IpPortBinding> {
        self.entries.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut IpPortBinding> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpPortBinding> {
        self.entries.iter()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn position(&self, addr: IpAddr, port: u16) -> Option<usize> {
        self.entries.iter().position(|b| b.addr == addr && b.port == port)
    }

    fn position_by_session(&self, request: &BindingRequest) -> Option<usize> {
        if request.session_id.is_empty() {
            return None;
        }
        self.entries.iter().position(|b| {
            b.session_id == request.session_id
                && b.leg == request.leg
                && b.line == request.line
                && b.reported_by == request.reported_by
        })
    }

    /// Add, refresh or renegotiate an endpoint.
    ///
    /// A description with the same session id, leg, reporter and media line
    /// as an existing binding replaces that binding's endpoint in place, so
    /// indexes held by media streams stay valid.
    pub fn add(&mut self, request: BindingRequest, rtcp_enabled: bool) -> BindOutcome {
        if let Some(index) = self.position_by_session(&request) {
            let binding = &mut self.entries[index];
            if binding.addr == request.addr && binding.port == request.port && binding.role == request.role {
                refresh(binding, &request);
                return BindOutcome::Refreshed { index };
            }
            let previous = binding.endpoint();
            let previous_rtcp = binding.rtcp_port(rtcp_enabled);
            debug!(
                old = %format_args!("{}:{}", previous.0, previous.1),
                new = %format_args!("{}:{}", request.addr, request.port),
                "Media endpoint renegotiated"
            );
            binding.addr = request.addr;
            binding.port = request.port;
            binding.role = request.role;
            binding.flows = [FlowRecord::default(); 2];
            refresh(binding, &request);
            return BindOutcome::Renegotiated {
                index,
                previous,
                previous_rtcp,
            };
        }

        if let Some(index) = self
            .entries
            .iter()
            .position(|b| b.addr == request.addr && b.port == request.port && b.role == request.role)
        {
            refresh(&mut self.entries[index], &request);
            return BindOutcome::Refreshed { index };
        }

        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            warn!(
                addr = %request.addr,
                port = request.port,
                capacity = self.capacity,
                "Binding capacity exhausted, endpoint dropped"
            );
            return BindOutcome::Dropped;
        }

        let index = self.entries.len();
        self.entries.push(IpPortBinding {
            reported_by: request.reported_by,
            addr: request.addr,
            port: request.port,
            role: request.role,
            session_id: request.session_id,
            leg: request.leg,
            line: request.line,
            codecs: request.codecs,
            flags: request.flags,
            bound_at: request.time,
            refreshed_at: request.time,
            flows: [FlowRecord::default(); 2],
        });
        BindOutcome::Added { index }
    }

    /// Every (address, port) this session occupies in the endpoint table
    pub fn table_endpoints(&self, rtcp_enabled: bool) -> Vec<(IpAddr, u16)> {
        let mut endpoints = Vec::with_capacity(self.entries.len() * 2);
        for binding in &self.entries {
            endpoints.push(binding.endpoint());
            if let Some(rtcp) = binding.rtcp_port(rtcp_enabled) {
                endpoints.push((binding.addr, rtcp));
            }
        }
        endpoints
    }
}

fn refresh(binding: &mut IpPortBinding, request: &BindingRequest) {
    if !request.codecs.is_empty() {
        binding.codecs = request.codecs.clone();
    }
    binding.flags = request.flags;
    binding.refreshed_at = request.time;
}
