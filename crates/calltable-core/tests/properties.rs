// Property tests for the destroy deadline and the destroy invariant

mod common;

use common::*;
use proptest::prelude::*;
use voipcorr_calltable_core::packet::{SignalingPacket, SipMethod};
use voipcorr_calltable_core::{CallHandle, Calltable, CalltableConfig, SinkKind};

#[derive(Debug, Clone)]
enum Event {
    Request(SipMethod),
    Response(u16, SipMethod),
    Media,
}

fn event() -> impl Strategy<Value = Event> {
    let method = prop_oneof![
        Just(SipMethod::Invite),
        Just(SipMethod::Ack),
        Just(SipMethod::Bye),
        Just(SipMethod::Cancel),
        Just(SipMethod::Options),
        Just(SipMethod::Info),
    ];
    let code = prop_oneof![Just(100u16), Just(180), Just(183), Just(200), Just(404), Just(486), Just(487), Just(500)];
    prop_oneof![
        method.clone().prop_map(Event::Request),
        (code, method).prop_map(|(code, method)| Event::Response(code, method)),
        Just(Event::Media),
    ]
}

#[derive(Debug, Clone)]
enum Op {
    Clone(usize),
    Drop(usize),
    Open(usize),
    Close(usize),
    DestroyReady,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..4).prop_map(Op::Clone),
        (0usize..4).prop_map(Op::Drop),
        (0usize..3).prop_map(Op::Open),
        (0usize..3).prop_map(Op::Close),
        Just(Op::DestroyReady),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_deadline_never_moves_back_within_a_phase(
        events in prop::collection::vec((event(), 0u64..20), 1..40),
    ) {
        let table = Calltable::default();
        let call = table.process_signaling(&invite_with_sdp("prop", 0, "10.0.0.1", 30000)).unwrap();
        let mut now = 0;
        let mut last = (call.deadline_phase(), call.deadline());

        for (event, step) in events {
            now += step;
            match event {
                Event::Request(method) => {
                    table.process_signaling(&request(method, "prop", now));
                }
                Event::Response(code, method) => {
                    table.process_signaling(&response(code, method, "prop", now));
                }
                Event::Media => {
                    table.process_media(&rtp("10.0.0.2:40000", "10.0.0.1:30000", 1, now as u16, now));
                }
            }

            let current = (call.deadline_phase(), call.deadline());
            prop_assert!(current.0 >= last.0, "phase went back: {:?} -> {:?}", last, current);
            if current.0 == last.0 {
                prop_assert!(current.1 >= last.1, "deadline went back: {:?} -> {:?}", last, current);
            }
            last = current;
        }
    }

    #[test]
    fn prop_never_destroyed_while_in_use(ops in prop::collection::vec(op(), 1..60)) {
        let table = Calltable::new(CalltableConfig {
            persist: false,
            ..CalltableConfig::default()
        });
        let first = table.process_signaling(&SignalingPacket::request(
            SipMethod::Invite,
            "held",
            sock(CALLER_SIP),
            sock(CALLEE_SIP),
            at(0),
        )).unwrap();
        prop_assert_eq!(table.shutdown_all(), 1);

        let mut handles: Vec<CallHandle> = vec![first];
        let mut open = [false; 3];
        let mut destroyed = false;

        for op in ops {
            match op {
                Op::Clone(i) => {
                    if let Some(h) = handles.get(i % handles.len().max(1)).cloned() {
                        handles.push(h);
                    }
                }
                Op::Drop(i) => {
                    if !handles.is_empty() {
                        handles.remove(i % handles.len());
                    }
                }
                Op::Open(k) => {
                    if let Some(h) = handles.first() {
                        h.open_sink(SinkKind::ALL[k]);
                        open[k] = true;
                    }
                }
                Op::Close(k) => {
                    if let Some(h) = handles.first() {
                        h.close_sink(SinkKind::ALL[k]);
                        open[k] = false;
                    }
                }
                Op::DestroyReady => {
                    let in_use = !handles.is_empty() || open.iter().any(|&o| o);
                    let n = table.destroy_ready();
                    if in_use {
                        prop_assert_eq!(n, 0);
                    }
                    if n == 1 {
                        destroyed = true;
                    }
                }
            }
            if let Some(h) = handles.first() {
                prop_assert_eq!(h.outstanding() as usize, handles.len());
            }
        }

        let stats = table.stats();
        prop_assert_eq!(stats.destroyed == 1, destroyed);
        prop_assert_eq!(stats.pending_destroy() == 0, destroyed);
    }
}
