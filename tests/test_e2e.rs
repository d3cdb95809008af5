// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// End-to-end scenarios across the full stack: corrupted frames on the
// wire, and a two-phase shutdown conversation driven entirely through the
// service dispatcher.

mod common;

use std::sync::{Arc, Mutex};

use common::{connect, picc_pair, DATA_CHAN, SERVER_ID};
use intercore::error::site;
use intercore::picc::service::MethodType;
use intercore::picc::protocol::ReturnCode;

// ===========================================================================
// Corruption on the wire
// ===========================================================================

#[test]
fn corrupted_frame_is_dropped_and_the_next_one_flows() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    let hits: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let hits2 = Arc::clone(&hits);
    h.server
        .picc
        .register_event_handler(
            0x01,
            Box::new(move |_, _, payload| {
                hits2.lock().unwrap().push(payload.to_vec());
            }),
        )
        .expect("register");

    // A valid event frame leaves the client...
    h.client
        .picc
        .send_event(0x01, 0x01, 0x06, &[0x11], false, DATA_CHAN)
        .expect("send");
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");

    // ...and an adversary flips the low counter byte in flight.
    let frames = h.server.drain_raw();
    assert_eq!(frames.len(), 1);
    let mut corrupted = frames[0].clone();
    let idx = corrupted.len() - 3;
    corrupted[idx] ^= 0xFF;

    let errors_before = site::count();
    assert!(h
        .server
        .picc
        .process_rx_data(0, DATA_CHAN, &corrupted)
        .is_err());
    assert!(site::count() > errors_before);
    assert!(hits.lock().unwrap().is_empty(), "no handler may fire");

    // A subsequent uncorrupted frame is processed normally.
    h.client
        .picc
        .send_event(0x01, 0x01, 0x06, &[0x22], false, DATA_CHAN)
        .expect("send");
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");
    h.server.deliver();
    assert_eq!(hits.lock().unwrap().as_slice(), &[vec![0x22]]);
}

// ===========================================================================
// Two-phase shutdown conversation
// ===========================================================================

/// Application-visible shutdown sequencing on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownPhase {
    Idle,
    WaitStateAck,
    WaitPhase1Done,
    WaitCtrlAck,
    ShutdownComplete,
}

const EVT_STATE: u8 = 0x10;
const EVT_CTRL: u8 = 0x11;
const MTD_STATE_ACK: u8 = 0x01;
const MTD_PHASE1_DONE: u8 = 0x02;
const MTD_CTRL_ACK: u8 = 0x03;

const STATE_STANDBY: u8 = 0x02;
const CTRL_HW_SHUTDOWN: u8 = 0x01;

#[test]
fn two_phase_shutdown_walks_every_state() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    // Server: the shutdown state machine advances on method arrival.
    let phase = Arc::new(Mutex::new(ShutdownPhase::Idle));
    let phase_log = Arc::new(Mutex::new(vec![ShutdownPhase::Idle]));
    {
        let phase = Arc::clone(&phase);
        let phase_log = Arc::clone(&phase_log);
        h.server
            .picc
            .register_method_handler(
                SERVER_ID,
                Box::new(move |_, method, _, _| {
                    let mut p = phase.lock().unwrap();
                    let next = match (*p, method) {
                        (ShutdownPhase::WaitStateAck, MTD_STATE_ACK) => {
                            ShutdownPhase::WaitPhase1Done
                        }
                        (ShutdownPhase::WaitPhase1Done, MTD_PHASE1_DONE) => {
                            ShutdownPhase::WaitCtrlAck
                        }
                        (ShutdownPhase::WaitCtrlAck, MTD_CTRL_ACK) => {
                            ShutdownPhase::ShutdownComplete
                        }
                        (current, _) => current,
                    };
                    if next != *p {
                        *p = next;
                        phase_log.lock().unwrap().push(next);
                    }
                    ReturnCode::Ok
                }),
            )
            .expect("register");
    }

    // Client: reacts to the server's events by queueing method calls.
    let actions: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let actions = Arc::clone(&actions);
        h.client
            .picc
            .register_event_handler(
                SERVER_ID,
                Box::new(move |_, event, payload| {
                    match (event, payload.first()) {
                        (EVT_STATE, Some(&STATE_STANDBY)) => {
                            actions.lock().unwrap().push(MTD_STATE_ACK);
                            actions.lock().unwrap().push(MTD_PHASE1_DONE);
                        }
                        (EVT_CTRL, Some(&CTRL_HW_SHUTDOWN)) => {
                            actions.lock().unwrap().push(MTD_CTRL_ACK);
                        }
                        _ => {}
                    }
                }),
            )
            .expect("register");
    }

    // Phase 1: the server announces Standby.
    h.server
        .picc
        .send_event(SERVER_ID, EVT_STATE, 0x06, &[STATE_STANDBY], false, DATA_CHAN)
        .expect("standby event");
    *phase.lock().unwrap() = ShutdownPhase::WaitStateAck;
    phase_log.lock().unwrap().push(ShutdownPhase::WaitStateAck);
    h.server.picc.flush_channel(DATA_CHAN).expect("flush");

    // Drive the conversation to quiescence.
    for _ in 0..20 {
        h.client.deliver();
        let pending: Vec<u8> = std::mem::take(&mut *actions.lock().unwrap());
        for method in pending {
            let session = h.client.picc.method_request(
                SERVER_ID,
                method,
                &[],
                MethodType::NoReturnWithoutAck,
                DATA_CHAN,
            );
            assert!(session >= 1);
        }
        h.client.picc.flush_channel(DATA_CHAN).expect("flush");
        h.server.deliver();

        // Phase 2: once phase 1 is done, the server orders the hardware off.
        if *phase.lock().unwrap() == ShutdownPhase::WaitCtrlAck
            && !phase_log.lock().unwrap().contains(&ShutdownPhase::ShutdownComplete)
        {
            h.server
                .picc
                .send_event(
                    SERVER_ID,
                    EVT_CTRL,
                    0x06,
                    &[CTRL_HW_SHUTDOWN],
                    false,
                    DATA_CHAN,
                )
                .expect("ctrl event");
            h.server.picc.flush_channel(DATA_CHAN).expect("flush");
        }
        if *phase.lock().unwrap() == ShutdownPhase::ShutdownComplete {
            break;
        }
    }

    assert_eq!(
        phase_log.lock().unwrap().as_slice(),
        &[
            ShutdownPhase::Idle,
            ShutdownPhase::WaitStateAck,
            ShutdownPhase::WaitPhase1Done,
            ShutdownPhase::WaitCtrlAck,
            ShutdownPhase::ShutdownComplete,
        ]
    );
}
