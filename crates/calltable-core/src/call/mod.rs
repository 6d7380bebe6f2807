//! The session entity
//!
//! A [`Call`] is shared as `Arc<Call>` between the registry indexes, the
//! hand-off queues and whoever is processing its packets. Mutable state sits
//! behind one per-session mutex ([`CallData`]); the fields the sweep reads on
//! every pass (deadline, last activity, finalizing flag, outstanding work,
//! sink flags) are atomics so a sweep never contends with packet processing.
//!
//! Destruction consumes the `Call` by value ([`Call::destroy`]), which is only
//! reachable after the registry has unwrapped the last strong reference, and
//! only attempted once [`Call::is_destroyable`] holds. Every reference handed
//! out by a lookup is a [`CallHandle`], which holds a unit of outstanding work
//! for as long as it lives.

pub mod binding;
pub mod merge;
pub mod selection;
pub mod state;
pub mod stream;

use std::fmt;
use std::net::IpAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{CalltableConfig, DeadlineWindows, Timeouts};
use crate::packet::{
    CallKind, MediaPacket, ReasonHeader, ReasonProtocol, Role, SignalingPacket, SipMessage, SipMethod, SkinnyIpTuple,
};
use crate::time::PacketTime;

pub use binding::{BindOutcome, BindingRequest, Bindings, FlowDirection, FlowRecord, IpPortBinding};
pub use merge::{MergeLeg, MergeLegs};
pub use selection::{SelectionRule, StreamSelection};
pub use state::{Deadline, ProtocolState, SetupPhase, TeardownPhase};
pub use stream::{MediaStream, StreamOutcome};

/// File sinks whose open state gates destruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Combined capture file
    Pcap = 0,
    /// Signaling-only capture file
    SipPcap = 1,
    /// Media-only capture file
    RtpPcap = 2,
}

impl SinkKind {
    pub const ALL: [SinkKind; 3] = [SinkKind::Pcap, SinkKind::SipPcap, SinkKind::RtpPcap];
}

/// Append-only spool position lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpoolKind {
    Sip,
    Rtp,
    Graph,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpoolPositions {
    pub sip: Vec<u64>,
    pub rtp: Vec<u64>,
    pub graph: Vec<u64>,
}

impl SpoolPositions {
    fn push(&mut self, kind: SpoolKind, position: u64) {
        match kind {
            SpoolKind::Sip => self.sip.push(position),
            SpoolKind::Rtp => self.rtp.push(position),
            SpoolKind::Graph => self.graph.push(position),
        }
    }
}

/// Why the sweep retired a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Protocol-driven destroy deadline elapsed
    Deadline,
    /// No packet within the RTP inactivity window
    RtpInactivity,
    /// Absolute lifetime cap reached
    Absolute,
    /// Capture ended
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SipResponse {
    pub code: u16,
    pub text: Option<String>,
    pub time: PacketTime,
}

/// Per-session bounds, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallLimits {
    pub max_bindings: usize,
    pub max_streams: usize,
    pub max_sip_addresses: usize,
    pub rtcp: bool,
    pub track_merge_legs: bool,
}

impl From<&CalltableConfig> for CallLimits {
    fn from(config: &CalltableConfig) -> Self {
        Self {
            max_bindings: config.max_bindings_per_call,
            max_streams: config.max_streams_per_call,
            max_sip_addresses: config.max_sip_addresses,
            rtcp: config.rtcp,
            track_merge_legs: config.callid_merge,
        }
    }
}

impl Default for CallLimits {
    fn default() -> Self {
        Self::from(&CalltableConfig::default())
    }
}

/// Mutable session state, guarded by the session lock
#[derive(Debug)]
pub struct CallData {
    pub protocol: ProtocolState,
    pub bindings: Bindings,
    pub streams: Vec<MediaStream>,
    pub dropped_streams: u32,
    pub merge: MergeLegs,
    /// Signaling addresses per role, indexed by [`Role::index`]
    pub sip_addrs: [Vec<IpAddr>; 2],
    pub sip_ports: [Option<u16>; 2],
    pub caller: Option<String>,
    pub called: Option<String>,
    pub user_agents: [Option<String>; 2],
    pub responses: Vec<SipResponse>,
    pub who_hung_up: Option<Role>,
    pub reason_sip: Option<ReasonHeader>,
    pub reason_q850: Option<ReasonHeader>,
    pub first_packet: PacketTime,
    pub last_packet: PacketTime,
    pub first_rtp: [Option<PacketTime>; 2],
    pub last_rtp: [Option<PacketTime>; 2],
    pub degraded: bool,
    pub recording_stopped: bool,
    pub spool: SpoolPositions,
    pub retired: Option<RetireReason>,
    /// Skinny conference/party id the session is indexed under
    pub skinny_party_id: Option<u32>,
    pub skinny_ip_tuple: Option<SkinnyIpTuple>,
}

impl CallData {
    fn new(time: PacketTime, limits: &CallLimits) -> Self {
        Self {
            protocol: ProtocolState::default(),
            bindings: Bindings::with_capacity(limits.max_bindings),
            streams: Vec::new(),
            dropped_streams: 0,
            merge: MergeLegs::new(),
            sip_addrs: [Vec::new(), Vec::new()],
            sip_ports: [None, None],
            caller: None,
            called: None,
            user_agents: [None, None],
            responses: Vec::new(),
            who_hung_up: None,
            reason_sip: None,
            reason_q850: None,
            first_packet: time,
            last_packet: time,
            first_rtp: [None, None],
            last_rtp: [None, None],
            degraded: false,
            recording_stopped: false,
            spool: SpoolPositions::default(),
            retired: None,
            skinny_party_id: None,
            skinny_ip_tuple: None,
        }
    }

    fn touch(&mut self, time: PacketTime) {
        if time > self.last_packet {
            self.last_packet = time;
        }
    }

    pub fn last_response(&self) -> Option<&SipResponse> {
        self.responses.last()
    }

    pub fn has_writer_open(&self) -> bool {
        self.streams.iter().any(|s| s.writer_open)
    }
}

fn push_bounded(list: &mut Vec<IpAddr>, addr: IpAddr, max: usize) {
    if !list.contains(&addr) && list.len() < max {
        list.push(addr);
    }
}

pub struct Call {
    serial: u64,
    call_id: Bytes,
    kind: CallKind,
    created_at: PacketTime,
    limits: CallLimits,
    deadline: Deadline,
    last_activity: AtomicU64,
    outstanding: AtomicU32,
    finalizing: AtomicBool,
    unbound: AtomicBool,
    sinks: [AtomicBool; 3],
    data: Mutex<CallData>,
    proxies: Mutex<Vec<IpAddr>>,
}

impl Call {
    pub fn new(
        serial: u64,
        kind: CallKind,
        call_id: impl Into<Bytes>,
        time: PacketTime,
        limits: CallLimits,
        windows: &DeadlineWindows,
    ) -> Self {
        let call_id = call_id.into();
        let deadline = if kind.is_registration() {
            Deadline::armed(time.secs.saturating_add(windows.registration))
        } else {
            Deadline::new()
        };
        let mut data = CallData::new(time, &limits);
        if limits.track_merge_legs {
            data.merge.register(call_id.clone());
        }
        Self {
            serial,
            call_id,
            kind,
            created_at: time,
            limits,
            deadline,
            last_activity: AtomicU64::new(time.secs),
            outstanding: AtomicU32::new(0),
            finalizing: AtomicBool::new(false),
            unbound: AtomicBool::new(false),
            sinks: Default::default(),
            data: Mutex::new(data),
            proxies: Mutex::new(Vec::new()),
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn call_id(&self) -> &Bytes {
        &self.call_id
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    pub fn created_at(&self) -> PacketTime {
        self.created_at
    }

    pub fn limits(&self) -> &CallLimits {
        &self.limits
    }

    /// Destroy deadline in capture seconds, `None` while unarmed
    pub fn deadline(&self) -> Option<u64> {
        self.deadline.get()
    }

    pub fn deadline_phase(&self) -> TeardownPhase {
        self.deadline.phase()
    }

    pub fn last_activity_secs(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }

    /// Session state; held only for the duration of one update
    pub fn lock(&self) -> MutexGuard<'_, CallData> {
        self.data.lock()
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_finalizing(&self) -> bool {
        self.finalizing.load(Ordering::Acquire)
    }

    /// Claim finalization; only the first caller gets `true`
    pub(crate) fn begin_finalize(&self) -> bool {
        self.finalizing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim endpoint-table cleanup; only the first caller gets `true`
    pub(crate) fn claim_unbind(&self) -> bool {
        !self.unbound.swap(true, Ordering::AcqRel)
    }

    pub fn open_sink(&self, sink: SinkKind) {
        self.sinks[sink as usize].store(true, Ordering::Release);
    }

    pub fn close_sink(&self, sink: SinkKind) {
        self.sinks[sink as usize].store(false, Ordering::Release);
    }

    pub fn is_sink_open(&self, sink: SinkKind) -> bool {
        self.sinks[sink as usize].load(Ordering::Acquire)
    }

    pub fn all_sinks_closed(&self) -> bool {
        SinkKind::ALL.iter().all(|&sink| !self.is_sink_open(sink))
    }

    /// Attach a writer to a media stream; false if the stream does not exist
    pub fn open_stream_writer(&self, index: usize) -> bool {
        match self.data.lock().streams.get_mut(index) {
            Some(stream) => {
                stream.writer_open = true;
                true
            }
            None => false,
        }
    }

    pub fn close_stream_writer(&self, index: usize) {
        if let Some(stream) = self.data.lock().streams.get_mut(index) {
            stream.writer_open = false;
        }
    }

    /// No sink open, no stream writer open, no outstanding work
    pub fn is_destroyable(&self) -> bool {
        self.outstanding() == 0 && self.all_sinks_closed() && !self.data.lock().has_writer_open()
    }

    fn touch_activity(&self, time: PacketTime) {
        self.last_activity.fetch_max(time.secs, Ordering::AcqRel);
    }

    /// Which side sent this message, learning signaling addresses and
    /// proxies on the way
    fn classify(&self, data: &mut CallData, pkt: &SignalingPacket) -> Role {
        let src = pkt.src.ip();
        let dst = pkt.dst.ip();
        let max = self.limits.max_sip_addresses;
        let request = match pkt.message {
            SipMessage::Request(method) => Some(method),
            SipMessage::Response { .. } => None,
        };

        if data.sip_addrs[0].is_empty() && data.sip_addrs[1].is_empty() {
            let (caller, callee) = match request {
                Some(_) => (pkt.src, pkt.dst),
                None => (pkt.dst, pkt.src),
            };
            data.sip_addrs[0].push(caller.ip());
            data.sip_addrs[1].push(callee.ip());
            data.sip_ports = [Some(caller.port()), Some(callee.port())];
            return if request.is_some() { Role::Caller } else { Role::Callee };
        }

        let from_caller = data.sip_addrs[0].contains(&src);
        let to_caller = data.sip_addrs[0].contains(&dst);
        let from_callee = data.sip_addrs[1].contains(&src);

        match request {
            Some(method) => {
                if from_caller && !to_caller {
                    if method == SipMethod::Invite {
                        push_bounded(&mut data.sip_addrs[1], dst, max);
                    }
                    Role::Caller
                } else if to_caller {
                    Role::Callee
                } else if from_callee && method == SipMethod::Invite {
                    // the request is being forwarded further downstream
                    self.proxy_add(src);
                    push_bounded(&mut data.sip_addrs[1], dst, max);
                    Role::Caller
                } else if from_callee {
                    Role::Callee
                } else {
                    if method == SipMethod::Invite {
                        push_bounded(&mut data.sip_addrs[0], src, max);
                    }
                    Role::Caller
                }
            }
            None => {
                if to_caller || !from_caller {
                    Role::Callee
                } else {
                    Role::Caller
                }
            }
        }
    }

    /// Apply one signaling message: milestones, parties, reason headers and
    /// the destroy deadline. Returns the sending side.
    pub fn process_signaling(&self, pkt: &SignalingPacket, windows: &DeadlineWindows) -> Role {
        let mut data = self.data.lock();
        let role = self.classify(&mut data, pkt);
        let t = pkt.time;
        data.touch(t);
        self.touch_activity(t);

        let mut arming = false;
        let mut entered = None;
        match pkt.message {
            SipMessage::Request(method) => {
                match method {
                    SipMethod::Invite | SipMethod::Register | SipMethod::Message => {
                        data.protocol.invite_at.get_or_insert(t);
                        if data.caller.is_none() {
                            data.caller = pkt.caller.clone();
                            data.called = pkt.called.clone();
                        }
                    }
                    SipMethod::Bye => {
                        if data.protocol.teardown_at.is_none() {
                            data.protocol.teardown_at = Some(t);
                            data.who_hung_up = Some(role);
                            debug!(call_id = ?self.call_id, %role, "Teardown seen");
                        }
                        if self.limits.track_merge_legs {
                            data.merge.mark_teardown(&pkt.call_id, t);
                        }
                        entered = Some(TeardownPhase::Seen);
                    }
                    SipMethod::Cancel => {
                        data.protocol.cancel_at.get_or_insert(t);
                        if data.who_hung_up.is_none() {
                            data.who_hung_up = Some(role);
                        }
                    }
                    _ => {}
                }
                if let Some(ua) = &pkt.user_agent {
                    data.user_agents[role.index()] = Some(ua.clone());
                }
            }
            SipMessage::Response { code, cseq_method } => {
                match cseq_method {
                    SipMethod::Bye if (200..300).contains(&code) => {
                        data.protocol.teardown_confirmed_at.get_or_insert(t);
                        entered = Some(TeardownPhase::Confirmed);
                    }
                    SipMethod::Bye if code >= 300 => {
                        data.protocol.unconfirmed_teardown = true;
                        arming = true;
                    }
                    SipMethod::Invite | SipMethod::Register | SipMethod::Message => {
                        if code == 100 {
                            data.protocol.trying_at.get_or_insert(t);
                        } else if code < 200 {
                            data.protocol.provisional_at.get_or_insert(t);
                        } else {
                            data.protocol.first_final_response_at.get_or_insert(t);
                            if code < 300 {
                                data.protocol.final_success_at.get_or_insert(t);
                            }
                            arming = true;
                        }
                        if code >= 180 {
                            data.protocol.last_response_code = code;
                        }
                        if code != 100 {
                            data.responses.push(SipResponse {
                                code,
                                text: pkt.response_text.clone(),
                                time: t,
                            });
                        }
                    }
                    _ => {}
                }
                if let Some(ua) = &pkt.user_agent {
                    data.user_agents[role.index()] = Some(ua.clone());
                }
            }
        }

        if let Some(reason) = &pkt.reason {
            match reason.protocol {
                ReasonProtocol::Sip => data.reason_sip = Some(reason.clone()),
                ReasonProtocol::Q850 => data.reason_q850 = Some(reason.clone()),
            }
        }

        let window = state::deadline_window(self.kind, &data.protocol, pkt.message.response_code(), windows);
        let candidate = t.secs.saturating_add(window);
        if self.kind.is_registration() {
            self.deadline.arm_or_extend(candidate);
        } else if let Some(phase) = entered {
            self.deadline.enter_phase(phase, candidate);
        } else if arming {
            self.deadline.arm_or_extend(candidate);
        } else {
            self.deadline.extend_if_armed(candidate);
        }
        role
    }

    /// Record an announced media endpoint. Does not touch the endpoint
    /// table; the registry binds or unbinds according to the outcome.
    pub fn add_endpoint(&self, request: BindingRequest) -> BindOutcome {
        if self.is_finalizing() {
            return BindOutcome::Dropped;
        }
        let mut data = self.data.lock();
        let outcome = data.bindings.add(request, self.limits.rtcp);
        if outcome == BindOutcome::Dropped && !data.degraded {
            data.degraded = true;
            warn!(call_id = ?self.call_id, "Session degraded: binding capacity exhausted");
        }
        outcome
    }

    /// Endpoints this session occupies in the endpoint table
    pub fn table_endpoints(&self) -> Vec<(IpAddr, u16)> {
        self.data.lock().bindings.table_endpoints(self.limits.rtcp)
    }

    /// Account one media packet matched through the endpoint table.
    ///
    /// `direction` says whether the match was on the destination (the bound
    /// endpoint receives) or the source. An armed deadline is pushed out by
    /// `rtp_window` while no teardown has been seen.
    pub fn process_media(&self, pkt: &MediaPacket, role: Role, direction: FlowDirection, rtp_window: u64) -> StreamOutcome {
        if self.is_finalizing() {
            return StreamOutcome::Dropped;
        }
        let mut data = self.data.lock();
        let t = pkt.time;
        data.touch(t);
        self.touch_activity(t);

        let endpoint = match direction {
            FlowDirection::Inbound => pkt.dst,
            FlowDirection::Outbound => pkt.src,
        };
        let binding = data.bindings.position(endpoint.ip(), endpoint.port()).or_else(|| {
            pkt.is_rtcp
                .then(|| endpoint.port().checked_sub(1))
                .flatten()
                .and_then(|port| data.bindings.position(endpoint.ip(), port))
        });
        if let Some(b) = binding.and_then(|i| data.bindings.get_mut(i)) {
            b.observe(direction, pkt.src, pkt.dst, t);
        }

        if data.protocol.teardown_phase() == TeardownPhase::None {
            self.deadline.extend_if_armed(t.secs.saturating_add(rtp_window));
        }

        if pkt.is_rtcp {
            if let Some(stream) = data.streams.iter_mut().find(|s| s.ssrc == pkt.ssrc) {
                stream.rtcp_packets += 1;
            }
            return StreamOutcome::Control;
        }

        let slot = role.index();
        data.first_rtp[slot].get_or_insert(t);
        data.last_rtp[slot] = Some(data.last_rtp[slot].map_or(t, |last| last.max(t)));

        if let Some(index) = data.streams.iter().position(|s| s.matches(pkt)) {
            data.streams[index].record(pkt);
            return StreamOutcome::Existing { index };
        }
        if data.streams.len() >= self.limits.max_streams {
            data.dropped_streams += 1;
            if !data.degraded {
                data.degraded = true;
                warn!(call_id = ?self.call_id, ssrc = pkt.ssrc, "Session degraded: stream capacity exhausted");
            }
            return StreamOutcome::Dropped;
        }
        let index = data.streams.len();
        data.streams.push(MediaStream::new(pkt, role, binding));
        debug!(call_id = ?self.call_id, ssrc = pkt.ssrc, %role, "Media stream created");
        StreamOutcome::Created { index }
    }

    pub fn proxy_add(&self, addr: IpAddr) {
        let mut proxies = self.proxies.lock();
        if !proxies.contains(&addr) {
            proxies.push(addr);
        }
    }

    pub fn proxies(&self) -> Vec<IpAddr> {
        self.proxies.lock().clone()
    }

    /// Teardown reported outside SIP (Skinny on-hook). There is no
    /// confirmation message, so the session goes straight to the confirmed
    /// phase.
    pub fn record_hangup(&self, by: Role, time: PacketTime, windows: &DeadlineWindows) {
        if self.is_finalizing() {
            return;
        }
        let mut data = self.data.lock();
        data.touch(time);
        self.touch_activity(time);
        if data.protocol.teardown_at.is_none() {
            data.protocol.teardown_at = Some(time);
            data.who_hung_up = Some(by);
        }
        data.protocol.teardown_confirmed_at.get_or_insert(time);
        if self.limits.track_merge_legs {
            data.merge.mark_teardown(&self.call_id, time);
        }
        self.deadline
            .enter_phase(TeardownPhase::Confirmed, time.secs.saturating_add(windows.teardown_confirmed));
        debug!(call_id = ?self.call_id, %by, "Hang-up recorded");
    }

    pub fn register_merge_leg(&self, call_id: Bytes) {
        self.data.lock().merge.register(call_id);
    }

    /// Teardown time of the logical call.
    ///
    /// With merge-leg tracking this is the latest leg teardown, and `None`
    /// until every leg has torn down.
    pub fn teardown_complete_at(&self) -> Option<PacketTime> {
        let data = self.data.lock();
        if self.limits.track_merge_legs {
            data.merge.teardown_complete_at()
        } else {
            data.protocol.teardown_at
        }
    }

    /// Seconds from first to last packet
    pub fn duration(&self) -> u64 {
        let data = self.data.lock();
        data.last_packet.secs.saturating_sub(data.first_packet.secs)
    }

    /// Seconds from connect to last packet, 0 if never connected
    pub fn connect_duration(&self) -> u64 {
        let data = self.data.lock();
        data.protocol
            .final_success_at
            .map_or(0, |connect| data.last_packet.secs.saturating_sub(connect.secs))
    }

    pub fn stop_recording(&self) {
        self.data.lock().recording_stopped = true;
    }

    pub fn is_recording_stopped(&self) -> bool {
        self.data.lock().recording_stopped
    }

    pub fn add_spool_position(&self, kind: SpoolKind, position: u64) {
        self.data.lock().spool.push(kind, position);
    }

    pub fn is_degraded(&self) -> bool {
        self.data.lock().degraded
    }

    /// Expiry policy hit at `now`, checked without taking the session lock
    pub fn expiry(&self, now: u64, timeouts: &Timeouts) -> Option<RetireReason> {
        if self.deadline.has_elapsed(now) {
            Some(RetireReason::Deadline)
        } else if self.last_activity_secs().saturating_add(timeouts.rtp) <= now {
            Some(RetireReason::RtpInactivity)
        } else if self.created_at.secs.saturating_add(timeouts.absolute) <= now {
            Some(RetireReason::Absolute)
        } else {
            None
        }
    }

    /// Record why the session is being retired
    pub(crate) fn mark_retired(&self, reason: RetireReason) {
        let mut data = self.data.lock();
        data.retired.get_or_insert(reason);
        if data.protocol.teardown_phase() == TeardownPhase::Seen {
            data.protocol.unconfirmed_teardown = true;
        }
    }

    /// Release the session. Only reachable with sole ownership.
    pub(crate) fn destroy(self) {
        debug_assert!(self.is_destroyable(), "session destroyed while still in use");
        debug!(call_id = ?self.call_id, serial = self.serial, "Session destroyed");
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("serial", &self.serial)
            .field("call_id", &self.call_id)
            .field("kind", &self.kind)
            .field("deadline", &self.deadline())
            .field("outstanding", &self.outstanding())
            .field("finalizing", &self.is_finalizing())
            .finish_non_exhaustive()
    }
}

/// A reference to a live session holding one unit of outstanding work.
///
/// The counter is incremented on creation and decremented exactly once when
/// the handle is dropped, so the session cannot be destroyed while any
/// handle exists.
pub struct CallHandle {
    call: Arc<Call>,
}

impl CallHandle {
    pub(crate) fn new(call: &Arc<Call>) -> Self {
        call.outstanding.fetch_add(1, Ordering::AcqRel);
        Self { call: Arc::clone(call) }
    }

    pub fn is(&self, other: &Call) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.call), other)
    }

    pub(crate) fn shared(&self) -> &Arc<Call> {
        &self.call
    }
}

impl Deref for CallHandle {
    type Target = Call;

    fn deref(&self) -> &Call {
        &self.call
    }
}

impl Clone for CallHandle {
    fn clone(&self) -> Self {
        Self::new(&self.call)
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.call.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallHandle").field(&self.call).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{SdpFlags, SipMethod};
    use std::net::SocketAddr;

    const CALLER: &str = "10.0.0.1:5060";
    const CALLEE: &str = "10.0.0.2:5060";

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn invite_call() -> Call {
        Call::new(
            1,
            CallKind::Invite,
            "abc123",
            PacketTime::from_secs(0),
            CallLimits::default(),
            &DeadlineWindows::default(),
        )
    }

    fn request(method: SipMethod, from: &str, to: &str, secs: u64) -> SignalingPacket {
        SignalingPacket::request(method, "abc123", addr(from), addr(to), PacketTime::from_secs(secs))
    }

    fn response(code: u16, method: SipMethod, from: &str, to: &str, secs: u64) -> SignalingPacket {
        SignalingPacket::response(code, method, "abc123", addr(from), addr(to), PacketTime::from_secs(secs))
    }

    #[test]
    fn test_deadline_follows_teardown_handshake() {
        let call = invite_call();
        let windows = DeadlineWindows::default();

        assert_eq!(call.process_signaling(&request(SipMethod::Invite, CALLER, CALLEE, 0), &windows), Role::Caller);
        assert_eq!(call.deadline(), None);

        assert_eq!(call.process_signaling(&response(200, SipMethod::Invite, CALLEE, CALLER, 2), &windows), Role::Callee);
        assert_eq!(call.deadline(), Some(7));

        call.process_signaling(&request(SipMethod::Bye, CALLER, CALLEE, 3), &windows);
        assert_eq!(call.deadline(), Some(63));

        call.process_signaling(&response(200, SipMethod::Bye, CALLEE, CALLER, 4), &windows);
        assert_eq!(call.deadline(), Some(9));

        let data = call.lock();
        assert_eq!(data.protocol.setup_phase(), SetupPhase::SetupConfirmed);
        assert_eq!(data.protocol.teardown_phase(), TeardownPhase::Confirmed);
        assert_eq!(data.who_hung_up, Some(Role::Caller));
    }

    #[test]
    fn test_request_terminated_window() {
        let call = invite_call();
        let windows = DeadlineWindows::default();
        call.process_signaling(&request(SipMethod::Invite, CALLER, CALLEE, 0), &windows);
        call.process_signaling(&request(SipMethod::Cancel, CALLER, CALLEE, 1), &windows);
        call.process_signaling(&response(487, SipMethod::Invite, CALLEE, CALLER, 2), &windows);
        assert_eq!(call.deadline(), Some(17));
        assert_eq!(call.lock().protocol.last_response_code, 487);
    }

    #[test]
    fn test_failed_bye_is_unconfirmed_teardown() {
        let call = invite_call();
        let windows = DeadlineWindows::default();
        call.process_signaling(&request(SipMethod::Invite, CALLER, CALLEE, 0), &windows);
        call.process_signaling(&request(SipMethod::Bye, CALLEE, CALLER, 5), &windows);
        call.process_signaling(&response(481, SipMethod::Bye, CALLER, CALLEE, 6), &windows);

        let data = call.lock();
        assert!(data.protocol.is_unconfirmed_teardown());
        assert_eq!(data.who_hung_up, Some(Role::Callee));
    }

    #[test]
    fn test_forwarded_invite_records_proxy() {
        let call = invite_call();
        let windows = DeadlineWindows::default();
        call.process_signaling(&request(SipMethod::Invite, CALLER, "10.0.0.5:5060", 0), &windows);
        let role = call.process_signaling(&request(SipMethod::Invite, "10.0.0.5:5060", CALLEE, 0), &windows);

        assert_eq!(role, Role::Caller);
        assert_eq!(call.proxies(), vec!["10.0.0.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(call.lock().sip_addrs[1].len(), 2);
    }

    #[test]
    fn test_media_creates_streams_until_capacity() {
        let limits = CallLimits {
            max_streams: 1,
            ..CallLimits::default()
        };
        let call = Call::new(1, CallKind::Invite, "x", PacketTime::ZERO, limits, &DeadlineWindows::default());
        let first = MediaPacket::rtp(addr("10.0.0.1:30000"), addr("10.0.0.2:40000"), 1, 1, 0, PacketTime::from_secs(1));
        let second = MediaPacket::rtp(addr("10.0.0.1:30000"), addr("10.0.0.2:40000"), 2, 1, 0, PacketTime::from_secs(1));

        assert_eq!(call.process_media(&first, Role::Caller, FlowDirection::Outbound, 300), StreamOutcome::Created { index: 0 });
        assert_eq!(call.process_media(&first, Role::Caller, FlowDirection::Outbound, 300), StreamOutcome::Existing { index: 0 });
        assert_eq!(call.process_media(&second, Role::Caller, FlowDirection::Outbound, 300), StreamOutcome::Dropped);
        assert!(call.is_degraded());
        assert_eq!(call.lock().dropped_streams, 1);
    }

    #[test]
    fn test_media_extends_armed_deadline_only() {
        let call = invite_call();
        let windows = DeadlineWindows::default();
        let rtp = MediaPacket::rtp(addr("10.0.0.1:30000"), addr("10.0.0.2:40000"), 1, 1, 0, PacketTime::from_secs(3));

        call.process_media(&rtp, Role::Caller, FlowDirection::Outbound, 300);
        assert_eq!(call.deadline(), None);

        call.process_signaling(&response(200, SipMethod::Invite, CALLEE, CALLER, 2), &windows);
        call.process_media(&rtp, Role::Caller, FlowDirection::Outbound, 300);
        assert_eq!(call.deadline(), Some(303));
    }

    #[test]
    fn test_handles_gate_destruction() {
        let call = Arc::new(invite_call());
        assert!(call.is_destroyable());

        let handle = CallHandle::new(&call);
        let second = handle.clone();
        assert_eq!(call.outstanding(), 2);
        assert!(!call.is_destroyable());
        drop(handle);
        drop(second);
        assert_eq!(call.outstanding(), 0);

        call.open_sink(SinkKind::SipPcap);
        assert!(!call.is_destroyable());
        call.close_sink(SinkKind::SipPcap);
        assert!(call.is_destroyable());
    }

    #[test]
    fn test_stream_writer_blocks_destruction() {
        let call = invite_call();
        let rtp = MediaPacket::rtp(addr("10.0.0.1:30000"), addr("10.0.0.2:40000"), 1, 1, 0, PacketTime::from_secs(1));
        call.process_media(&rtp, Role::Caller, FlowDirection::Outbound, 300);

        assert!(call.open_stream_writer(0));
        assert!(!call.open_stream_writer(5));
        assert!(!call.is_destroyable());
        call.close_stream_writer(0);
        assert!(call.is_destroyable());
    }

    #[test]
    fn test_renegotiation_drops_on_finalizing() {
        let call = invite_call();
        assert!(call.begin_finalize());
        assert!(!call.begin_finalize());
        let outcome = call.add_endpoint(BindingRequest {
            reported_by: "10.0.0.1".parse().unwrap(),
            addr: "10.0.0.1".parse().unwrap(),
            port: 30000,
            role: Role::Caller,
            session_id: String::new(),
            leg: String::new(),
            line: 0,
            codecs: Vec::new(),
            flags: SdpFlags::default(),
            time: PacketTime::from_secs(1),
        });
        assert_eq!(outcome, BindOutcome::Dropped);
    }

    #[test]
    fn test_unbounded_timeouts_never_expire() {
        let call = invite_call();
        let windows = DeadlineWindows {
            default: u64::MAX,
            ..DeadlineWindows::default()
        };
        call.process_signaling(&request(SipMethod::Invite, CALLER, CALLEE, 10), &windows);
        call.process_signaling(&response(200, SipMethod::Invite, CALLEE, CALLER, 12), &windows);
        assert_eq!(call.deadline(), Some(u64::MAX));

        let rtp = MediaPacket::rtp(addr("10.0.0.1:30000"), addr("10.0.0.2:40000"), 1, 1, 0, PacketTime::from_secs(13));
        call.process_media(&rtp, Role::Caller, FlowDirection::Outbound, u64::MAX);
        assert_eq!(call.deadline(), Some(u64::MAX));

        let timeouts = Timeouts {
            rtp: u64::MAX,
            absolute: u64::MAX,
            ss7: u64::MAX,
        };
        assert_eq!(call.expiry(u64::MAX - 1, &timeouts), None);
    }

    #[test]
    fn test_hangup_confirms_teardown_directly() {
        let call = invite_call();
        let windows = DeadlineWindows::default();
        call.process_signaling(&request(SipMethod::Invite, CALLER, CALLEE, 0), &windows);

        call.record_hangup(Role::Callee, PacketTime::from_secs(40), &windows);
        assert_eq!(call.deadline_phase(), TeardownPhase::Confirmed);
        assert_eq!(call.deadline(), Some(40 + windows.teardown_confirmed));
        assert_eq!(call.teardown_complete_at(), Some(PacketTime::from_secs(40)));

        // a second on-hook keeps the first hang-up side
        call.record_hangup(Role::Caller, PacketTime::from_secs(41), &windows);
        let data = call.lock();
        assert_eq!(data.who_hung_up, Some(Role::Callee));
        assert!(!data.protocol.is_unconfirmed_teardown());
    }
}
