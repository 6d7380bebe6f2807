// Outstanding-work accounting under concurrent lookups, media and sweeps

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use common::*;
use voipcorr_calltable_core::packet::SipMethod;
use voipcorr_calltable_core::{Calltable, CalltableConfig};

const THREADS: usize = 8;
const ROUNDS: usize = 2_000;

#[test]
fn test_outstanding_work_returns_to_zero() {
    let table = Arc::new(Calltable::default());
    let call = table.process_signaling(&invite_with_sdp("busy", 0, "10.0.0.1", 30000)).unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|n| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..ROUNDS {
                    let by_id = table.find_by_identifier(b"busy").unwrap();
                    let by_endpoint = table.find_by_endpoint(ip("10.0.0.1"), 30000).unwrap();
                    assert!(by_endpoint.0.is(&by_id));
                    let extra = by_id.clone();
                    drop(by_id);
                    drop(extra);
                    let src = format!("10.0.0.2:{}", 40000 + n);
                    table.process_media(&rtp(&src, "10.0.0.1:30000", n as u32, i as u16, 1));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    // only the test's own handle remains
    assert_eq!(call.outstanding(), 1);
    assert_eq!(call.lock().streams.len(), THREADS);
    let packets: u64 = call.lock().streams.iter().map(|s| s.packets).sum();
    assert_eq!(packets, (THREADS * ROUNDS) as u64);
}

#[test]
fn test_sweep_racing_lookups_never_destroys_a_held_session() {
    let table = Arc::new(Calltable::new(CalltableConfig {
        persist: false,
        ..CalltableConfig::default()
    }));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut seen = 0u64;
                while !stop.load(Ordering::Acquire) {
                    for n in 0..50 {
                        if let Some(call) = table.find_by_identifier(format!("c{n}").as_bytes()) {
                            // the session stays intact while the handle is held
                            assert!(call.outstanding() >= 1);
                            assert_eq!(call.call_id().as_ref(), format!("c{n}").as_bytes());
                            seen += 1;
                        }
                    }
                }
                seen
            })
        })
        .collect();

    for round in 0..20u64 {
        let base = round * 100;
        for n in 0..50 {
            let id = format!("c{n}");
            table.process_signaling(&request(SipMethod::Invite, &id, base));
            table.process_signaling(&response(486, SipMethod::Invite, &id, base + 1));
        }
        table.sweep(base + 50);
        table.destroy_ready();
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(table.active_calls(), 0);
    let pending = table.stats().pending_destroy();
    assert_eq!(table.drain_deletes(), pending);
    let stats = table.stats();
    assert_eq!(stats.swept, 20 * 50);
    assert_eq!(stats.destroyed, 20 * 50);
}

#[test]
fn test_concurrent_creates_converge_on_one_session() {
    let table = Arc::new(Calltable::default());
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || table.process_signaling(&request(SipMethod::Invite, "race", 0)).unwrap().serial())
        })
        .collect();
    let serials: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(serials.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(table.active_calls(), 1);
    assert_eq!(table.stats().calls_created, 1);
}
