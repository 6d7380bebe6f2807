// Session lifecycle through the registry
//
// Creation, endpoint binding, the teardown deadline handshake, sweeping and
// destruction, driven only through the public Calltable API.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::*;
use pretty_assertions::assert_eq;
use voipcorr_calltable_core::call::{
    BindOutcome, BindingRequest, Call, CallLimits, RetireReason, SinkKind, TeardownPhase,
};
use voipcorr_calltable_core::config::DeadlineWindows;
use voipcorr_calltable_core::endpoint::EndpointTable;
use voipcorr_calltable_core::packet::{SdpFlags, SipMethod};
use voipcorr_calltable_core::persist::{PersistRecord, serialize_for_persist};
use voipcorr_calltable_core::{CallKind, Calltable, CalltableConfig, Role};

fn bind_request(addr: &str, port: u16, secs: u64) -> BindingRequest {
    announce("4711", Role::Caller, addr, port, secs)
}

fn announce(session_id: &str, role: Role, addr: &str, port: u16, secs: u64) -> BindingRequest {
    BindingRequest {
        reported_by: ip("10.0.0.1"),
        addr: ip(addr),
        port,
        role,
        session_id: session_id.into(),
        leg: String::new(),
        line: 0,
        codecs: vec![0],
        flags: SdpFlags::default(),
        time: at(secs),
    }
}

#[test]
fn test_teardown_handshake_expires_on_confirmed_window() {
    let table = Calltable::default();

    let call = table.find_or_create(CallKind::Invite, Bytes::from_static(b"abc123"), at(0));
    assert_eq!(call.deadline(), None);

    table.add_endpoint_binding(&call, bind_request("10.0.0.1", 30000, 1));
    let (bound, role) = table.find_by_endpoint(ip("10.0.0.1"), 30000).unwrap();
    assert!(bound.is(&call));
    assert_eq!(role, Role::Caller);
    drop(bound);

    table.process_signaling(&response(200, SipMethod::Invite, "abc123", 2));
    assert_eq!(call.deadline(), Some(7));

    table.process_signaling(&request(SipMethod::Bye, "abc123", 3));
    assert_eq!(call.deadline(), Some(63));
    assert_eq!(call.deadline_phase(), TeardownPhase::Seen);

    table.process_signaling(&response(200, SipMethod::Bye, "abc123", 4));
    assert_eq!(call.deadline(), Some(9));
    assert_eq!(call.deadline_phase(), TeardownPhase::Confirmed);

    assert_eq!(table.sweep(8), 0);
    assert!(table.find_by_identifier(b"abc123").is_some());

    assert_eq!(table.sweep(10), 1);
    assert!(table.find_by_identifier(b"abc123").is_none());
    assert!(table.find_by_endpoint(ip("10.0.0.1"), 30000).is_none());

    let stats = table.stats();
    assert_eq!(stats.pending_delete, 1);
    assert_eq!(stats.pending_persist, 1);
    assert_eq!(call.lock().retired, Some(RetireReason::Deadline));
    assert!(!call.lock().protocol.is_unconfirmed_teardown());
}

#[test]
fn test_swept_session_is_unreachable_everywhere() {
    let table = Calltable::new(CalltableConfig::default().with_callid_merge());
    let call = table.process_signaling(&invite_with_sdp("primary", 0, "10.0.0.1", 30000)).unwrap();
    assert!(table.add_merge_alias(&call, Bytes::from_static(b"leg-b")));
    table.process_signaling(&response(486, SipMethod::Invite, "primary", 1));

    assert!(table.is_referenced(&call));
    assert_eq!(table.stats().merge_aliases, 1);

    assert_eq!(table.sweep(100), 1);
    assert!(!table.is_referenced(&call));
    assert!(table.find_by_merge_identifier(b"leg-b").is_none());
    assert_eq!(table.stats().endpoint_entries, 0);
    assert_eq!(table.stats().merge_aliases, 0);

    // late media for a swept session is unmatched
    assert!(table.process_media(&rtp("10.0.0.2:40000", "10.0.0.1:30000", 1, 1, 101)).is_empty());
}

#[test]
fn test_same_call_id_after_sweep_is_a_new_session() {
    let table = Calltable::new(CalltableConfig {
        persist: false,
        ..CalltableConfig::default()
    });
    let first = table.process_signaling(&request(SipMethod::Invite, "reused", 0)).unwrap();
    table.process_signaling(&response(603, SipMethod::Invite, "reused", 1));
    table.sweep(10);

    let second = table.process_signaling(&request(SipMethod::Invite, "reused", 20)).unwrap();
    assert!(!second.is(&first));
    assert_ne!(second.serial(), first.serial());
    assert_eq!(table.active_calls(), 1);
}

#[test]
fn test_endpoint_binding_is_idempotent() {
    let table = Calltable::default();
    let call = table.process_signaling(&invite_with_sdp("c1", 0, "10.0.0.1", 30000)).unwrap();
    let entries = table.stats().endpoint_entries;

    // retransmitted INVITE with the same offer
    table.process_signaling(&invite_with_sdp("c1", 1, "10.0.0.1", 30000));
    assert_eq!(table.stats().endpoint_entries, entries);
    assert_eq!(table.find_all_by_endpoint(ip("10.0.0.1"), 30000).len(), 1);
    assert_eq!(call.lock().bindings.len(), 1);

    let endpoints = EndpointTable::new(1024);
    let other = Arc::new(Call::new(
        9,
        CallKind::Invite,
        "direct",
        at(0),
        CallLimits::default(),
        &DeadlineWindows::default(),
    ));
    assert!(endpoints.bind(ip("10.1.1.1"), 4000, &other, Role::Callee, false, SdpFlags::default()));
    assert!(!endpoints.bind(ip("10.1.1.1"), 4000, &other, Role::Callee, false, SdpFlags::default()));
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints.references(&other), 1);
}

#[test]
fn test_request_terminated_gets_longer_window() {
    let table = Calltable::default();
    let call = table.process_signaling(&request(SipMethod::Invite, "cancelled", 0)).unwrap();
    table.process_signaling(&request(SipMethod::Cancel, "cancelled", 2));
    table.process_signaling(&response(200, SipMethod::Cancel, "cancelled", 2));
    table.process_signaling(&response(487, SipMethod::Invite, "cancelled", 2));

    assert_eq!(call.deadline(), Some(17));
    assert_eq!(call.lock().who_hung_up, Some(Role::Caller));
    assert_eq!(table.sweep(10), 0);
    assert_eq!(table.sweep(17), 1);
}

#[test]
fn test_unanswered_bye_is_flagged_unconfirmed() {
    let table = Calltable::default();
    let call = table.process_signaling(&request(SipMethod::Invite, "half", 0)).unwrap();
    table.process_signaling(&response(200, SipMethod::Invite, "half", 1));
    table.process_signaling(&request(SipMethod::Bye, "half", 30));

    assert_eq!(table.sweep(89), 0);
    assert_eq!(table.sweep(90), 1);
    assert!(call.lock().protocol.is_unconfirmed_teardown());

    let PersistRecord::Call { cdr, .. } = serialize_for_persist(&call, &table.config().selection) else {
        panic!("expected a call record");
    };
    assert!(cdr.unconfirmed_teardown);
    assert_eq!(cdr.teardown_phase, TeardownPhase::Seen);
}

#[test]
fn test_media_keeps_answered_call_alive() {
    let table = Calltable::default();
    let call = table.process_signaling(&invite_with_sdp("talk", 0, "10.0.0.1", 30000)).unwrap();
    table.process_signaling(&response(200, SipMethod::Invite, "talk", 1));
    assert_eq!(call.deadline(), Some(6));

    for secs in 2..5 {
        table.process_media(&rtp("10.0.0.2:40000", "10.0.0.1:30000", 7, secs as u16, secs));
    }
    assert!(call.deadline().unwrap() > 300);
    assert_eq!(table.sweep(60), 0);
    assert_eq!(call.lock().streams[0].packets, 3);
}

#[test]
fn test_rtp_inactivity_retires_unanswered_call() {
    let table = Calltable::default();
    let call = table.process_signaling(&request(SipMethod::Invite, "ringing", 0)).unwrap();
    table.process_signaling(&response(180, SipMethod::Invite, "ringing", 1));
    assert_eq!(call.deadline(), None);

    assert_eq!(table.sweep(300), 0);
    assert_eq!(table.sweep(301), 1);
    assert_eq!(call.lock().retired, Some(RetireReason::RtpInactivity));
}

#[test]
fn test_destroy_waits_for_handles_and_sinks() {
    let table = Calltable::new(CalltableConfig {
        persist: false,
        ..CalltableConfig::default()
    });
    let call = table.process_signaling(&request(SipMethod::Invite, "held", 0)).unwrap();
    call.open_sink(SinkKind::Pcap);
    table.process_signaling(&invite_with_sdp("held", 1, "10.0.0.1", 30000));
    table.process_media(&rtp("10.0.0.2:40000", "10.0.0.1:30000", 1, 1, 2));
    let writer_index = 0;
    assert!(call.open_stream_writer(writer_index));

    assert_eq!(table.shutdown_all(), 1);
    let extra = call.clone();
    drop(call);
    assert_eq!(table.destroy_ready(), 0);

    extra.close_sink(SinkKind::Pcap);
    assert_eq!(table.destroy_ready(), 0);
    extra.close_stream_writer(writer_index);
    assert_eq!(table.destroy_ready(), 0);

    drop(extra);
    assert_eq!(table.destroy_ready(), 1);
    assert_eq!(table.stats().pending_destroy(), 0);
}

#[test]
fn test_registration_lifecycle() {
    let table = Calltable::default();
    let reg = table.process_signaling(&request(SipMethod::Register, "reg-1", 0)).unwrap();
    assert_eq!(reg.kind(), CallKind::Register);
    assert_eq!(table.active_registrations(), 1);
    assert_eq!(table.active_calls(), 0);
    assert_eq!(reg.deadline(), Some(5));

    table.process_signaling(&response(200, SipMethod::Register, "reg-1", 1));
    assert_eq!(reg.deadline(), Some(6));
    assert!(table.find_registration(b"reg-1").is_some());
    assert!(table.find_by_identifier(b"reg-1").is_none());

    assert_eq!(table.sweep(100), 0);
    assert_eq!(table.sweep_registrations(6), 1);
    assert_eq!(table.stats().pending_registration_persist, 1);
    assert_eq!(table.stats().pending_registration_delete, 1);
}

#[test]
fn test_renegotiation_keeps_endpoint_still_announced_by_another_binding() {
    let table = Calltable::default();
    let call = table.find_or_create(CallKind::Invite, Bytes::from_static(b"shared"), at(0));
    table.add_endpoint_binding(&call, announce("A", Role::Caller, "10.0.0.1", 30000, 0));
    table.add_endpoint_binding(&call, announce("B", Role::Callee, "10.0.0.1", 30000, 1));
    assert_eq!(call.lock().bindings.len(), 2);
    assert_eq!(table.stats().endpoint_entries, 2);

    // A moves away, B still announces 30000
    let outcome = table.add_endpoint_binding(&call, announce("A", Role::Caller, "10.0.0.1", 32000, 2));
    assert!(matches!(outcome, BindOutcome::Renegotiated { .. }));
    assert_eq!(table.stats().endpoint_entries, 4);
    for port in [30000, 30001, 32000, 32001] {
        let (found, _) = table.find_by_endpoint(ip("10.0.0.1"), port).unwrap();
        assert!(found.is(&call), "port {port} lost its binding");
    }
    assert_eq!(table.process_media(&rtp("10.0.0.2:40000", "10.0.0.1:30000", 9, 1, 3)).len(), 1);
}

#[test]
fn test_absolute_timeout_caps_a_session_kept_busy_by_signaling() {
    let table = Calltable::default();
    let call = table.process_signaling(&request(SipMethod::Invite, "marathon", 0)).unwrap();
    table.process_signaling(&response(180, SipMethod::Invite, "marathon", 1));

    for secs in (200..14_400).step_by(200) {
        table.process_signaling(&request(SipMethod::Options, "marathon", secs));
        assert_eq!(table.sweep(secs), 0, "retired early at {secs}");
    }
    assert_eq!(call.deadline(), None);
    assert_eq!(table.sweep(14_399), 0);
    assert_eq!(table.sweep(14_400), 1);
    assert_eq!(call.lock().retired, Some(RetireReason::Absolute));
}
