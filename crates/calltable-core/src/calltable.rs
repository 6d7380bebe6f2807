//! The session registry
//!
//! [`Calltable`] owns every session and circuit, every index into them, and
//! the hand-off queues to the asynchronous consumers.
//!
//! Locking rules:
//! - at most one index lock (identifier shard, endpoint table, circuit
//!   shard) is held at a time; cross-index work takes and releases them in
//!   sequence;
//! - queue locks are only taken with no index lock held;
//! - a session's own lock may be taken while no index lock is held, or
//!   inside an identifier shard lock only to construct the session.
//!
//! Sessions leave the indexes only through [`Calltable::sweep`] (and its
//! registration and shutdown variants), and are destroyed only by the delete
//! drain once nothing references them.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::call::{
    BindOutcome, BindingRequest, Call, CallHandle, CallLimits, FlowDirection, RetireReason, StreamOutcome,
};
use crate::config::CalltableConfig;
use crate::endpoint::{EndpointMatch, EndpointTable};
use crate::index::IdentifierIndex;
use crate::logging::session_span;
use crate::packet::{CallKind, MediaPacket, Role, SignalingPacket, SipMessage, SkinnyIpTuple};
use crate::persist::{AudioJob, FileJob, stream_selection};
use crate::queue::HandoffQueue;
use crate::ss7::{IsupMessage, IsupMessageType, Ss7, Ss7Id, Ss7Status};
use crate::stats::{CalltableStats, Counters};
use crate::time::PacketTime;

const DESTROY_BACKOFF: Duration = Duration::from_millis(1);
const DESTROY_BACKOFF_MAX: Duration = Duration::from_millis(100);

pub struct Calltable {
    config: CalltableConfig,
    limits: CallLimits,
    calls: IdentifierIndex,
    merge_aliases: IdentifierIndex,
    registrations: IdentifierIndex,
    skinny_party_ids: IdentifierIndex<u32>,
    skinny_ip_tuples: IdentifierIndex<SkinnyIpTuple>,
    endpoints: EndpointTable,
    circuits: DashMap<Ss7Id, Ss7>,
    persist_queue: HandoffQueue<CallHandle>,
    audio_queue: HandoffQueue<AudioJob>,
    delete_queue: HandoffQueue<Arc<Call>>,
    registration_persist_queue: HandoffQueue<CallHandle>,
    registration_delete_queue: HandoffQueue<Arc<Call>>,
    circuit_queue: HandoffQueue<Ss7>,
    file_queue: HandoffQueue<FileJob>,
    serial: AtomicU64,
    capture_clock: AtomicU64,
    counters: Counters,
}

impl Calltable {
    pub fn new(config: CalltableConfig) -> Self {
        let limits = CallLimits::from(&config);
        Self {
            endpoints: EndpointTable::new(config.hash_buckets),
            limits,
            config,
            calls: IdentifierIndex::new("calls"),
            merge_aliases: IdentifierIndex::new("merge_aliases"),
            registrations: IdentifierIndex::new("registrations"),
            skinny_party_ids: IdentifierIndex::new("skinny_party_ids"),
            skinny_ip_tuples: IdentifierIndex::new("skinny_ip_tuples"),
            circuits: DashMap::new(),
            persist_queue: HandoffQueue::new("persist"),
            audio_queue: HandoffQueue::new("audio"),
            delete_queue: HandoffQueue::new("delete"),
            registration_persist_queue: HandoffQueue::new("registration_persist"),
            registration_delete_queue: HandoffQueue::new("registration_delete"),
            circuit_queue: HandoffQueue::new("circuits"),
            file_queue: HandoffQueue::new("files"),
            serial: AtomicU64::new(1),
            capture_clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CalltableConfig {
        &self.config
    }

    /// Latest capture time seen on any packet, in seconds. Sweeps driven by
    /// the workers use this instead of the wall clock.
    pub fn capture_now(&self) -> u64 {
        self.capture_clock.load(Ordering::Acquire)
    }

    fn observe_time(&self, time: PacketTime) {
        self.capture_clock.fetch_max(time.secs, Ordering::AcqRel);
    }

    fn index_for(&self, kind: CallKind) -> &IdentifierIndex {
        if kind.is_registration() {
            &self.registrations
        } else {
            &self.calls
        }
    }

    // ---- lookups -------------------------------------------------------

    /// Find the session for `call_id`, creating it on a miss. Concurrent
    /// callers for the same identifier all get the same session.
    pub fn find_or_create(&self, kind: CallKind, call_id: Bytes, time: PacketTime) -> CallHandle {
        let (handle, created) = self.index_for(kind).find_or_insert_with(call_id.clone(), || {
            Call::new(
                self.serial.fetch_add(1, Ordering::Relaxed),
                kind,
                call_id.clone(),
                time,
                self.limits,
                &self.config.windows,
            )
        });
        if created {
            if kind.is_registration() {
                Counters::incr(&self.counters.registrations_created);
            } else {
                Counters::incr(&self.counters.calls_created);
            }
            info!(call_id = ?handle.call_id(), ?kind, serial = handle.serial(), "Session created");
        }
        handle
    }

    pub fn find_by_identifier(&self, call_id: &[u8]) -> Option<CallHandle> {
        self.calls.find(call_id)
    }

    pub fn find_registration(&self, call_id: &[u8]) -> Option<CallHandle> {
        self.registrations.find(call_id)
    }

    pub fn find_by_merge_identifier(&self, call_id: &[u8]) -> Option<CallHandle> {
        self.merge_aliases.find(call_id)
    }

    pub fn find_by_skinny_party_id(&self, party_id: u32) -> Option<CallHandle> {
        self.skinny_party_ids.find(&party_id)
    }

    /// Skinny session between two addresses, in either direction
    pub fn find_by_skinny_ip_tuple(&self, a: IpAddr, b: IpAddr) -> Option<CallHandle> {
        self.skinny_ip_tuples.find(&SkinnyIpTuple::new(a, b))
    }

    /// First live session bound to an endpoint, with the role it was
    /// announced for
    pub fn find_by_endpoint(&self, addr: IpAddr, port: u16) -> Option<(CallHandle, Role)> {
        self.endpoints
            .lookup(addr, port)
            .into_iter()
            .next()
            .map(|m| (m.call, m.role))
    }

    /// Every live session bound to an endpoint
    pub fn find_all_by_endpoint(&self, addr: IpAddr, port: u16) -> Vec<EndpointMatch> {
        self.endpoints.lookup(addr, port)
    }

    // ---- packet processing ---------------------------------------------

    /// Route a signaling packet to its session, creating one for INVITE,
    /// REGISTER and MESSAGE requests. Returns `None` for strays.
    pub fn process_signaling(&self, pkt: &SignalingPacket) -> Option<CallHandle> {
        self.observe_time(pkt.time);
        let call = self.resolve_signaling(pkt)?;
        let role = call.process_signaling(pkt, &self.config.windows);

        if let Some(sdp) = &pkt.sdp {
            for (line, media) in sdp.media.iter().enumerate() {
                if media.port == 0 {
                    continue;
                }
                self.add_endpoint_binding(
                    &call,
                    BindingRequest {
                        reported_by: pkt.src.ip(),
                        addr: media.addr,
                        port: media.port,
                        role,
                        session_id: sdp.session_id.clone(),
                        leg: sdp.leg.clone(),
                        line,
                        codecs: media.codecs.clone(),
                        flags: media.flags,
                        time: pkt.time,
                    },
                );
            }
        }
        Some(call)
    }

    fn resolve_signaling(&self, pkt: &SignalingPacket) -> Option<CallHandle> {
        let kind = match pkt.message {
            SipMessage::Request(method) => method.creates(),
            SipMessage::Response { .. } => None,
        };
        let registration = match pkt.message {
            SipMessage::Request(method) | SipMessage::Response { cseq_method: method, .. } => {
                method.creates().is_some_and(|k| k.is_registration())
            }
        };
        if registration {
            return match kind {
                Some(kind) => Some(self.find_or_create(kind, pkt.call_id.clone(), pkt.time)),
                None => self.registrations.find(&pkt.call_id),
            };
        }

        if let Some(call) = self.calls.find(&pkt.call_id) {
            return Some(call);
        }
        if self.config.callid_merge {
            if let Some(call) = self.merge_aliases.find(&pkt.call_id) {
                return Some(call);
            }
            for primary in &pkt.merge_ids {
                if let Some(call) = self.calls.find(primary) {
                    self.add_merge_alias(&call, pkt.call_id.clone());
                    return Some(call);
                }
            }
        }
        let kind = kind?;
        Some(self.find_or_create(kind, pkt.call_id.clone(), pkt.time))
    }

    /// Fold another signaling identifier into `call`. Refused while
    /// call-id merging is disabled.
    pub fn add_merge_alias(&self, call: &CallHandle, alias: Bytes) -> bool {
        if !self.config.callid_merge || call.is_finalizing() {
            return false;
        }
        call.register_merge_leg(alias.clone());
        let linked = self.merge_aliases.insert_alias(alias.clone(), call.shared());
        if linked && call.is_finalizing() {
            // retire may have swept the legs before this alias landed
            self.merge_aliases.remove_if_same(&alias, call.shared());
            return false;
        }
        if linked {
            debug!(call_id = ?call.call_id(), legs = call.lock().merge.len(), "Merge leg linked");
        }
        linked
    }

    /// Find or create the Skinny session for `call_id` and index it under
    /// its party id and station/manager address pair. A later session
    /// announcing the same party id or pair takes the entry over.
    pub fn find_or_create_skinny(
        &self,
        call_id: Bytes,
        party_id: u32,
        station: IpAddr,
        manager: IpAddr,
        time: PacketTime,
    ) -> CallHandle {
        self.observe_time(time);
        let call = self.find_or_create(CallKind::Skinny, call_id, time);
        let tuple = SkinnyIpTuple::new(station, manager);
        {
            let mut data = call.lock();
            data.skinny_party_id = Some(party_id);
            data.skinny_ip_tuple = Some(tuple);
        }
        let replaced = self.skinny_party_ids.insert(party_id, call.shared());
        self.skinny_ip_tuples.insert(tuple, call.shared());
        if replaced {
            debug!(call_id = ?call.call_id(), party_id, "Skinny party id taken over");
        }
        if call.is_finalizing() {
            self.remove_skinny_entries(&call);
        }
        call
    }

    /// On-hook of a Skinny station. Returns the session that was hung up.
    pub fn skinny_hangup(&self, party_id: u32, by: Role, time: PacketTime) -> Option<CallHandle> {
        self.observe_time(time);
        let call = self.skinny_party_ids.find(&party_id)?;
        call.record_hangup(by, time, &self.config.windows);
        Some(call)
    }

    fn remove_skinny_entries(&self, call: &Call) {
        let (party_id, tuple) = {
            let data = call.lock();
            (data.skinny_party_id, data.skinny_ip_tuple)
        };
        if let Some(party_id) = party_id {
            self.skinny_party_ids.remove_if_same(&party_id, call);
        }
        if let Some(tuple) = tuple {
            self.skinny_ip_tuples.remove_if_same(&tuple, call);
        }
    }

    /// Record an announced media endpoint on `call` and mirror the outcome
    /// into the endpoint table
    pub fn add_endpoint_binding(&self, call: &CallHandle, request: BindingRequest) -> BindOutcome {
        let was_degraded = call.is_degraded();
        let (addr, port, role, flags) = (request.addr, request.port, request.role, request.flags);
        let outcome = call.add_endpoint(request);

        match outcome {
            BindOutcome::Dropped => {
                Counters::incr(&self.counters.bindings_dropped);
                if !was_degraded && call.is_degraded() {
                    Counters::incr(&self.counters.degraded);
                }
                return outcome;
            }
            BindOutcome::Renegotiated {
                previous, previous_rtcp, ..
            } => {
                // another binding of this session may still cover the old endpoint
                let kept = call.table_endpoints();
                if !kept.contains(&previous) {
                    self.endpoints.unbind(call, previous.0, previous.1);
                }
                if let Some(rtcp) = previous_rtcp {
                    if !kept.contains(&(previous.0, rtcp)) {
                        self.endpoints.unbind(call, previous.0, rtcp);
                    }
                }
            }
            BindOutcome::Added { .. } | BindOutcome::Refreshed { .. } => {}
        }

        self.endpoints.bind(addr, port, call.shared(), role, false, flags);
        if self.config.rtcp && !flags.rtcp_mux {
            if let Some(rtcp) = port.checked_add(1) {
                self.endpoints.bind(addr, rtcp, call.shared(), role, true, flags);
            }
        }
        trace!(call_id = ?call.call_id(), %addr, port, ?outcome, "Endpoint binding");
        outcome
    }

    /// Account a media packet to every session bound to its destination, or
    /// failing that its source.
    ///
    /// Stream roles are the sending side: a packet matched on the endpoint
    /// the caller announced is sent by the callee.
    pub fn process_media(&self, pkt: &MediaPacket) -> Vec<StreamOutcome> {
        self.observe_time(pkt.time);
        let mut direction = FlowDirection::Inbound;
        let mut matches = self.endpoints.lookup(pkt.dst.ip(), pkt.dst.port());
        if matches.is_empty() {
            direction = FlowDirection::Outbound;
            matches = self.endpoints.lookup(pkt.src.ip(), pkt.src.port());
        }
        if matches.is_empty() {
            Counters::incr(&self.counters.media_unmatched);
            return Vec::new();
        }

        matches
            .into_iter()
            .map(|m| {
                let sender = match direction {
                    FlowDirection::Inbound => m.role.opposite(),
                    FlowDirection::Outbound => m.role,
                };
                let was_degraded = m.call.is_degraded();
                let outcome = m.call.process_media(pkt, sender, direction, self.config.timeouts.rtp);
                if outcome == StreamOutcome::Dropped {
                    Counters::incr(&self.counters.streams_dropped);
                    if !was_degraded && m.call.is_degraded() {
                        Counters::incr(&self.counters.degraded);
                    }
                }
                outcome
            })
            .collect()
    }

    /// Create or update the circuit session of an ISUP message. A fresh IAM
    /// on a released circuit retires the old session first; a circuit is
    /// retired once both release and release-complete were seen.
    pub fn process_isup(&self, msg: &IsupMessage) -> Option<Ss7Status> {
        self.observe_time(msg.time);
        let id = msg.circuit_id()?;
        let mut retired = Vec::new();
        let status = {
            let mut entry = self.circuits.entry(id).or_insert_with(|| {
                Counters::incr(&self.counters.circuits_created);
                Ss7::new(id, self.serial.fetch_add(1, Ordering::Relaxed), msg.time)
            });
            if msg.message_type == IsupMessageType::Iam && entry.is_finished() {
                let fresh = Ss7::new(id, self.serial.fetch_add(1, Ordering::Relaxed), msg.time);
                Counters::incr(&self.counters.circuits_created);
                retired.push(std::mem::replace(&mut *entry, fresh));
            }
            entry.process_message(msg)
        };

        if msg.message_type == IsupMessageType::Rlc {
            if let Some((_, circuit)) = self
                .circuits
                .remove_if(&id, |_, c| c.timestamps.rel.is_some() && c.timestamps.rlc.is_some())
            {
                retired.push(circuit);
            }
        }
        for circuit in retired {
            self.retire_circuit(circuit);
        }
        Some(status)
    }

    fn retire_circuit(&self, circuit: Ss7) {
        Counters::incr(&self.counters.circuits_finalized);
        info!(circuit = %circuit.id, status = circuit.status().as_str(), "Circuit finalized");
        if self.config.persist {
            self.circuit_queue.push(circuit);
        }
    }

    // ---- hand-off queues -----------------------------------------------

    pub fn enqueue_for_persist(&self, call: CallHandle) {
        if call.kind().is_registration() {
            self.registration_persist_queue.push(call);
        } else {
            self.persist_queue.push(call);
        }
    }

    /// Stop recording and hand the session's media to the audio pipeline
    pub fn enqueue_for_audio(&self, call: CallHandle) {
        call.stop_recording();
        let selection = stream_selection(&call, &self.config.selection);
        if selection.has_concurrent() {
            warn!(call_id = ?call.call_id(), concurrent = ?selection.concurrent, "Concurrent media streams on one role");
        }
        self.audio_queue.push(AudioJob { call, selection });
    }

    pub(crate) fn enqueue_for_delete(&self, call: Arc<Call>) {
        if call.kind().is_registration() {
            self.registration_delete_queue.push(call);
        } else {
            self.delete_queue.push(call);
        }
    }

    pub fn enqueue_file(&self, job: FileJob) {
        self.file_queue.push(job);
    }

    pub fn persist_queue(&self) -> &HandoffQueue<CallHandle> {
        &self.persist_queue
    }

    pub fn registration_persist_queue(&self) -> &HandoffQueue<CallHandle> {
        &self.registration_persist_queue
    }

    pub fn audio_queue(&self) -> &HandoffQueue<AudioJob> {
        &self.audio_queue
    }

    pub fn circuit_queue(&self) -> &HandoffQueue<Ss7> {
        &self.circuit_queue
    }

    pub fn file_queue(&self) -> &HandoffQueue<FileJob> {
        &self.file_queue
    }

    // ---- lifecycle -----------------------------------------------------

    /// Remove `call` from every index and queue it for finalization.
    /// Returns false if another path already claimed it.
    fn retire(&self, index: &IdentifierIndex, call: Arc<Call>, reason: RetireReason) -> bool {
        if !call.begin_finalize() {
            return false;
        }
        let _span = session_span(&call).entered();
        call.mark_retired(reason);

        index.remove_if_same(call.call_id(), &call);
        let legs: Vec<Bytes> = call.lock().merge.leg_ids().cloned().collect();
        for leg in legs {
            self.merge_aliases.remove_if_same(&leg, &call);
        }
        if call.kind() == CallKind::Skinny {
            self.remove_skinny_entries(&call);
        }
        let unbound = self.endpoints.unbind_all(&call);
        Counters::incr(&self.counters.swept);
        info!(?reason, unbound, "Session retired");

        if self.config.persist {
            self.enqueue_for_persist(CallHandle::new(&call));
        }
        if self.config.save_audio && matches!(call.kind(), CallKind::Invite | CallKind::Skinny) {
            self.enqueue_for_audio(CallHandle::new(&call));
        }
        self.enqueue_for_delete(call);
        true
    }

    fn sweep_index(&self, index: &IdentifierIndex, now: u64) -> usize {
        let timeouts = &self.config.timeouts;
        let expired = index.collect_where(|c| !c.is_finalizing() && c.expiry(now, timeouts).is_some());
        let mut retired = 0;
        for call in expired {
            if let Some(reason) = call.expiry(now, timeouts) {
                if self.retire(index, call, reason) {
                    retired += 1;
                }
            }
        }
        retired
    }

    /// Retire every call whose deadline or timeout has elapsed at `now`
    /// (capture seconds). Returns the number retired.
    pub fn sweep(&self, now: u64) -> usize {
        let retired = self.sweep_index(&self.calls, now);
        if retired > 0 {
            debug!(now, retired, remaining = self.calls.len(), "Call sweep");
        }
        retired
    }

    pub fn sweep_registrations(&self, now: u64) -> usize {
        let retired = self.sweep_index(&self.registrations, now);
        if retired > 0 {
            debug!(now, retired, remaining = self.registrations.len(), "Registration sweep");
        }
        retired
    }

    /// Retire circuits idle for longer than the circuit timeout
    pub fn sweep_circuits(&self, now: u64) -> usize {
        let timeout = self.config.timeouts.ss7;
        let idle: Vec<Ss7Id> = self
            .circuits
            .iter()
            .filter(|entry| entry.is_idle(now, timeout))
            .map(|entry| *entry.key())
            .collect();
        let mut retired = 0;
        for id in idle {
            if let Some((_, circuit)) = self.circuits.remove_if(&id, |_, c| c.is_idle(now, timeout)) {
                self.retire_circuit(circuit);
                retired += 1;
            }
        }
        retired
    }

    /// Retire everything still live, e.g. at end of capture
    pub fn shutdown_all(&self) -> usize {
        let mut retired = 0;
        for index in [&self.calls, &self.registrations] {
            for call in index.calls() {
                if self.retire(index, call, RetireReason::Shutdown) {
                    retired += 1;
                }
            }
        }
        let ids: Vec<Ss7Id> = self.circuits.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, circuit)) = self.circuits.remove(&id) {
                self.retire_circuit(circuit);
            }
        }
        info!(retired, "All sessions retired");
        retired
    }

    fn try_destroy(&self, call: Arc<Call>) -> Result<(), Arc<Call>> {
        if !call.is_destroyable() {
            return Err(call);
        }
        let owned = Arc::try_unwrap(call)?;
        owned.destroy();
        Counters::incr(&self.counters.destroyed);
        Ok(())
    }

    /// Destroy everything queued for deletion, waiting for each session's
    /// outstanding work to drain. Blocks; run it on a dedicated thread.
    pub fn drain_deletes(&self) -> usize {
        let mut destroyed = 0;
        for queue in [&self.delete_queue, &self.registration_delete_queue] {
            while let Some(mut call) = queue.pop() {
                let mut backoff = DESTROY_BACKOFF;
                loop {
                    match self.try_destroy(call) {
                        Ok(()) => break,
                        Err(pending) => {
                            call = pending;
                            std::thread::sleep(backoff);
                            backoff = (backoff * 2).min(DESTROY_BACKOFF_MAX);
                        }
                    }
                }
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Destroy queued sessions that are already destroyable; the rest stay
    /// queued
    pub fn destroy_ready(&self) -> usize {
        let mut destroyed = 0;
        for queue in [&self.delete_queue, &self.registration_delete_queue] {
            for call in queue.drain() {
                match self.try_destroy(call) {
                    Ok(()) => destroyed += 1,
                    Err(pending) => queue.push(pending),
                }
            }
        }
        destroyed
    }

    /// Whether any index or endpoint entry still references `call`
    pub fn is_referenced(&self, call: &Call) -> bool {
        self.index_for(call.kind()).points_to(call.call_id(), call)
            || self.merge_aliases.references(call)
            || self.skinny_party_ids.references(call)
            || self.skinny_ip_tuples.references(call)
            || self.endpoints.references(call) > 0
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn active_registrations(&self) -> usize {
        self.registrations.len()
    }

    pub fn active_circuits(&self) -> usize {
        self.circuits.len()
    }

    pub fn circuit_status(&self, id: &Ss7Id) -> Option<Ss7Status> {
        self.circuits.get(id).map(|c| c.status())
    }

    pub fn stats(&self) -> CalltableStats {
        let c = &self.counters;
        CalltableStats {
            active_calls: self.calls.len(),
            active_registrations: self.registrations.len(),
            active_circuits: self.circuits.len(),
            merge_aliases: self.merge_aliases.len(),
            skinny_entries: self.skinny_party_ids.len() + self.skinny_ip_tuples.len(),
            endpoint_entries: self.endpoints.len(),
            calls_created: Counters::get(&c.calls_created),
            registrations_created: Counters::get(&c.registrations_created),
            circuits_created: Counters::get(&c.circuits_created),
            circuits_finalized: Counters::get(&c.circuits_finalized),
            swept: Counters::get(&c.swept),
            destroyed: Counters::get(&c.destroyed),
            degraded: Counters::get(&c.degraded),
            media_unmatched: Counters::get(&c.media_unmatched),
            bindings_dropped: Counters::get(&c.bindings_dropped),
            streams_dropped: Counters::get(&c.streams_dropped),
            pending_persist: self.persist_queue.len(),
            pending_audio: self.audio_queue.len(),
            pending_delete: self.delete_queue.len(),
            pending_registration_persist: self.registration_persist_queue.len(),
            pending_registration_delete: self.registration_delete_queue.len(),
            pending_circuits: self.circuit_queue.len(),
            pending_files: self.file_queue.len(),
            endpoint_contention: self.endpoints.contention(),
        }
    }
}

impl Default for Calltable {
    fn default() -> Self {
        Self::new(CalltableConfig::default())
    }
}

impl std::fmt::Debug for Calltable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calltable")
            .field("calls", &self.calls.len())
            .field("registrations", &self.registrations.len())
            .field("circuits", &self.circuits.len())
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{SdpInfo, SdpMedia, SipMethod};
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn invite_with_sdp(call_id: &str, secs: u64, port: u16) -> SignalingPacket {
        SignalingPacket::request(
            SipMethod::Invite,
            call_id.to_string(),
            addr("10.0.0.1:5060"),
            addr("10.0.0.2:5060"),
            PacketTime::from_secs(secs),
        )
        .with_sdp(SdpInfo {
            session_id: "100".into(),
            leg: String::new(),
            media: vec![SdpMedia::new("10.0.0.1".parse().unwrap(), port)],
        })
    }

    #[test]
    fn test_invite_creates_and_binds() {
        let table = Calltable::default();
        let call = table.process_signaling(&invite_with_sdp("c1", 0, 30000)).unwrap();
        assert_eq!(table.active_calls(), 1);
        // RTP and RTCP
        assert_eq!(table.stats().endpoint_entries, 2);

        let (found, role) = table.find_by_endpoint("10.0.0.1".parse().unwrap(), 30000).unwrap();
        assert!(found.is(&call));
        assert_eq!(role, Role::Caller);
    }

    #[test]
    fn test_stray_response_is_ignored() {
        let table = Calltable::default();
        let bye_ok = SignalingPacket::response(
            200,
            SipMethod::Bye,
            "unknown",
            addr("10.0.0.2:5060"),
            addr("10.0.0.1:5060"),
            PacketTime::from_secs(1),
        );
        assert!(table.process_signaling(&bye_ok).is_none());
        assert_eq!(table.active_calls(), 0);
    }

    #[test]
    fn test_reinvite_moves_endpoint() {
        let table = Calltable::default();
        let call = table.process_signaling(&invite_with_sdp("c1", 0, 30000)).unwrap();
        table.process_signaling(&invite_with_sdp("c1", 5, 31000));

        assert!(table.find_by_endpoint("10.0.0.1".parse().unwrap(), 30000).is_none());
        assert!(table.find_by_endpoint("10.0.0.1".parse().unwrap(), 30001).is_none());
        assert!(table.find_by_endpoint("10.0.0.1".parse().unwrap(), 31000).is_some());
        assert_eq!(call.lock().bindings.len(), 1);
    }

    #[test]
    fn test_media_from_callee_is_callee_stream() {
        let table = Calltable::default();
        let call = table.process_signaling(&invite_with_sdp("c1", 0, 30000)).unwrap();
        let rtp = MediaPacket::rtp(addr("10.0.0.2:40000"), addr("10.0.0.1:30000"), 5, 1, 0, PacketTime::from_secs(1));
        assert_eq!(table.process_media(&rtp), vec![StreamOutcome::Created { index: 0 }]);
        assert_eq!(call.lock().streams[0].role, Role::Callee);

        let stray = MediaPacket::rtp(addr("10.9.0.1:1000"), addr("10.9.0.2:2000"), 6, 1, 0, PacketTime::from_secs(1));
        assert!(table.process_media(&stray).is_empty());
        assert_eq!(table.stats().media_unmatched, 1);
    }

    #[test]
    fn test_destroy_ready_waits_for_handles() {
        let table = Calltable::new(CalltableConfig {
            persist: false,
            ..CalltableConfig::default()
        });
        let call = table.process_signaling(&invite_with_sdp("c1", 0, 30000)).unwrap();
        assert_eq!(table.shutdown_all(), 1);
        assert!(table.find_by_identifier(b"c1").is_none());

        assert_eq!(table.destroy_ready(), 0);
        assert_eq!(table.stats().pending_delete, 1);
        drop(call);
        assert_eq!(table.destroy_ready(), 1);
        assert_eq!(table.stats().destroyed, 1);
    }

    #[test]
    fn test_circuit_lifecycle() {
        let table = Calltable::default();
        let iam = IsupMessage::new(IsupMessageType::Iam, 12, 100, 200, PacketTime::from_secs(0));
        assert_eq!(table.process_isup(&iam), Some(Ss7Status::CallSetup));
        let anm = IsupMessage::new(IsupMessageType::Anm, 12, 200, 100, PacketTime::from_secs(3));
        assert_eq!(table.process_isup(&anm), Some(Ss7Status::InCall));
        let rel = IsupMessage::new(IsupMessageType::Rel, 12, 100, 200, PacketTime::from_secs(60)).with_cause(16);
        assert_eq!(table.process_isup(&rel), Some(Ss7Status::Completed));
        assert_eq!(table.active_circuits(), 1);

        let rlc = IsupMessage::new(IsupMessageType::Rlc, 12, 200, 100, PacketTime::from_secs(61));
        table.process_isup(&rlc);
        assert_eq!(table.active_circuits(), 0);
        assert_eq!(table.circuit_queue().len(), 1);
    }
}
