// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Tests for the service dispatcher: event fan-out, auto-ACK, method
// request/response routing, session-id discipline.

mod common;

use std::sync::{Arc, Mutex};

use common::{connect, picc_pair, DATA_CHAN, SERVER_ID};
use intercore::picc::protocol::{MsgType, ReturnCode};
use intercore::picc::service::MethodType;
use intercore::picc::stack::MessageIter;

// ===========================================================================
// Events
// ===========================================================================

#[test]
fn event_with_ack_reaches_the_handler_and_acks_back() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    let seen: Arc<Mutex<Vec<(u8, u8, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    h.server
        .picc
        .register_event_handler(
            0x01,
            Box::new(move |provider, event, payload| {
                seen2.lock().unwrap().push((provider, event, payload.to_vec()));
            }),
        )
        .expect("register");

    // provider=1, event=1, consumer=6, payload [0x04], with ACK.
    h.client
        .picc
        .send_event(0x01, 0x01, 0x06, &[0x04], true, DATA_CHAN)
        .expect("send event");
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");

    h.server.deliver();
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        &[(0x01, 0x01, vec![0x04])]
    );

    // The EVENT_ACK comes back with the mirrored header and the session id
    // the client allocated (first allocation: 1).
    h.server.picc.flush_channel(DATA_CHAN).expect("flush ack");
    let frames = h.client.drain_raw();
    let mut acks = Vec::new();
    for frame in &frames {
        for (header, payload) in MessageIter::new(&frame[1..frame.len() - 4]) {
            if header.msg_type == MsgType::EventAck as u8 {
                acks.push((header, payload.len()));
            }
        }
    }
    assert_eq!(acks.len(), 1);
    let (ack, payload_len) = acks[0];
    assert_eq!(ack.provider_id, 0x01);
    assert_eq!(ack.method_id, 0x01);
    assert_eq!(ack.consumer_id, 0x06);
    assert_eq!(ack.session_id, 0x01);
    assert_eq!(ack.return_code, ReturnCode::Ok as u8);
    assert_eq!(payload_len, 0);
}

#[test]
fn event_without_ack_stays_silent() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    let hits: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
    let hits2 = Arc::clone(&hits);
    h.server
        .picc
        .register_event_handler(
            0x02,
            Box::new(move |_, _, _| {
                *hits2.lock().unwrap() += 1;
            }),
        )
        .expect("register");

    h.client
        .picc
        .send_event(0x02, 0x07, 0x06, b"quiet", false, DATA_CHAN)
        .expect("send");
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");
    h.server.deliver();
    assert_eq!(*hits.lock().unwrap(), 1);

    // Nothing flows back: no ACK was requested.
    h.server.picc.flush_channel(DATA_CHAN).expect("flush");
    let frames = h.client.drain_raw();
    assert!(frames.is_empty());
}

#[test]
fn events_fan_out_to_every_matching_handler() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    let hits: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    for tag in [1u8, 2u8] {
        let hits2 = Arc::clone(&hits);
        h.server
            .picc
            .register_event_handler(
                0x05,
                Box::new(move |_, _, _| {
                    hits2.lock().unwrap().push(tag);
                }),
            )
            .expect("register");
    }
    // A handler for a different provider stays quiet.
    let hits3 = Arc::clone(&hits);
    h.server
        .picc
        .register_event_handler(
            0x06,
            Box::new(move |_, _, _| {
                hits3.lock().unwrap().push(99);
            }),
        )
        .expect("register");

    h.client
        .picc
        .send_event(0x05, 0x01, 0x06, &[], false, DATA_CHAN)
        .expect("send");
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");
    h.server.deliver();

    assert_eq!(hits.lock().unwrap().as_slice(), &[1, 2]);
}

// ===========================================================================
// Methods
// ===========================================================================

#[test]
fn method_request_round_trip_with_response() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    h.server
        .picc
        .register_method_handler(
            SERVER_ID,
            Box::new(|_consumer, method, payload, rsp| {
                assert_eq!(method, 0x03);
                assert_eq!(payload, b"ping");
                rsp.extend_from_slice(b"pong");
                ReturnCode::Ok
            }),
        )
        .expect("register");

    let responses: Arc<Mutex<Vec<(u8, u8, u8, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let responses2 = Arc::clone(&responses);
    h.client
        .picc
        .register_response_handler(Box::new(move |_, method, session, rc, payload| {
            responses2
                .lock()
                .unwrap()
                .push((method, session, rc, payload.to_vec()));
        }));

    let session = h.client.picc.method_request(
        SERVER_ID,
        0x03,
        b"ping",
        MethodType::WithResponse,
        DATA_CHAN,
    );
    assert!(session >= 1);
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");

    h.server.deliver();
    h.server.picc.flush_channel(DATA_CHAN).expect("flush rsp");
    h.client.deliver();

    let got = responses.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, 0x03);
    assert_eq!(got[0].1, session);
    assert_eq!(got[0].2, ReturnCode::Ok as u8);
    assert_eq!(got[0].3, b"pong");
}

#[test]
fn method_request_requires_a_connected_link() {
    let mut h = picc_pair();
    // Not connected yet: the request is refused with session 0.
    let session = h.client.picc.method_request(
        SERVER_ID,
        0x03,
        &[],
        MethodType::NoReturnWithoutAck,
        DATA_CHAN,
    );
    assert_eq!(session, 0);
}

#[test]
fn request_without_a_handler_still_answers_ok() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    let responses: Arc<Mutex<Vec<(u8, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let responses2 = Arc::clone(&responses);
    h.client
        .picc
        .register_response_handler(Box::new(move |_, _, _, rc, payload| {
            responses2.lock().unwrap().push((rc, payload.to_vec()));
        }));

    let session = h
        .client
        .picc
        .method_request(SERVER_ID, 0x09, &[], MethodType::WithResponse, DATA_CHAN);
    assert!(session >= 1);
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");
    h.server.deliver();
    h.server.picc.flush_channel(DATA_CHAN).expect("flush");
    h.client.deliver();

    assert_eq!(responses.lock().unwrap().as_slice(), &[(0, Vec::new())]);
}

#[test]
fn no_return_with_ack_emits_an_ack_and_no_response() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    h.server
        .picc
        .register_method_handler(
            SERVER_ID,
            Box::new(|_, _, _, _| ReturnCode::Ok),
        )
        .expect("register");

    let session = h.client.picc.method_request(
        SERVER_ID,
        0x04,
        &[],
        MethodType::NoReturnWithAck,
        DATA_CHAN,
    );
    assert!(session >= 1);
    h.client.picc.flush_channel(DATA_CHAN).expect("flush");
    h.server.deliver();
    h.server.picc.flush_channel(DATA_CHAN).expect("flush");

    let frames = h.client.drain_raw();
    let mut types = Vec::new();
    for frame in &frames {
        for (header, _) in MessageIter::new(&frame[1..frame.len() - 4]) {
            types.push(header.msg_type);
        }
    }
    assert_eq!(types, vec![MsgType::Ack as u8]);
}

// ===========================================================================
// Session ids
// ===========================================================================

#[test]
fn session_ids_cycle_and_skip_zero() {
    let mut h = picc_pair();
    connect(&mut h.client, &mut h.server);

    let mut sessions = Vec::new();
    for _ in 0..300 {
        let session = h.client.picc.method_request(
            SERVER_ID,
            0x01,
            &[],
            MethodType::NoReturnWithoutAck,
            DATA_CHAN,
        );
        sessions.push(session);
        // Keep the staging buffer drained.
        h.client.picc.flush_channel(DATA_CHAN).expect("flush");
        let _ = h.server.drain_raw();
    }

    assert!(sessions.iter().all(|&s| s >= 1));
    // The counter wraps 255 -> 1.
    assert_eq!(sessions[254], 255);
    assert_eq!(sessions[255], 1);
    assert_eq!(sessions[0], sessions[255]);
}
