// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Full-stack demo: two PICC peers (CLIENT and SERVER) over the in-process
// transport, polling mode. Runs the connect handshake from the periodic
// tick, then the client pushes an event with ACK and a method request.
//
//   RUST_LOG=info cargo run --bin demo_link

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use intercore::picc::link::{LinkState, Role};
use intercore::picc::protocol::ReturnCode;
use intercore::picc::service::MethodType;
use intercore::{
    ChannelConfig, InstanceConfig, NullHw, Picc, PiccConfig, PoolConfig, RxMode, ShmManager,
    ShmRegion,
};

const SHM_SIZE: u32 = 32 * 1024;
const DATA_CHAN: u8 = 0;
const SERVER_ID: u8 = 0xCE;
const CLIENT_ID: u8 = 0xCD;

struct Peer {
    mgr: Arc<ShmManager>,
    picc: Picc,
    rx: mpsc::Receiver<(u8, Vec<u8>, usize)>,
}

fn make_peer(local: &ShmRegion, remote: &ShmRegion, role: Role) -> Peer {
    let (tx, rx) = mpsc::channel();
    let mgr = ShmManager::new();
    mgr.init_instance(
        0,
        InstanceConfig {
            local_shm_addr: local.base(),
            remote_shm_addr: remote.base(),
            shm_size: SHM_SIZE,
            rx_mode: RxMode::Polling,
            local_core: Default::default(),
            remote_core: Default::default(),
            channels: vec![ChannelConfig::Managed {
                pools: vec![PoolConfig {
                    num_bufs: 16,
                    buf_size: 4100,
                }],
                rx_cb: Box::new(move |buf| {
                    let _ =
                        tx.send((buf.channel, buf.as_slice().to_vec(), buf.as_ptr() as usize));
                }),
            }],
            hw: Box::new(NullHw),
        },
    )
    .expect("instance init");

    let mut picc = Picc::new(
        mgr.clone() as Arc<dyn intercore::ShmTransport>,
        PiccConfig {
            link_local_id: if role == Role::Client { CLIENT_ID } else { SERVER_ID },
            link_remote_id: if role == Role::Client { SERVER_ID } else { CLIENT_ID },
            link_role: role,
            instance: 0,
            channel: DATA_CHAN,
            crc_enabled: true,
        },
    );
    picc.init_channel(0, DATA_CHAN).expect("picc channel");
    picc.link_register().expect("link register");

    Peer { mgr, picc, rx }
}

fn pump(peer: &mut Peer) {
    let _ = peer.mgr.poll_channels(0);
    while let Ok((chan, data, ptr)) = peer.rx.try_recv() {
        let _ = peer.picc.process_rx_data(0, chan, &data);
        let _ = peer.mgr.release_buf(0, chan, ptr as *const u8);
    }
    peer.picc.tick();
}

fn main() {
    env_logger::init();

    let region_client = ShmRegion::anonymous(SHM_SIZE as usize);
    let region_server = ShmRegion::anonymous(SHM_SIZE as usize);

    let mut client = make_peer(&region_client, &region_server, Role::Client);
    let mut server = make_peer(&region_server, &region_client, Role::Server);

    server
        .picc
        .register_event_handler(
            CLIENT_ID,
            Box::new(|provider, event, payload| {
                println!("server: event {event:#04x} from {provider:#04x}: {payload:?}");
            }),
        )
        .unwrap();
    server
        .picc
        .register_method_handler(
            SERVER_ID,
            Box::new(|consumer, method, payload, rsp| {
                println!("server: method {method:#04x} from {consumer:#04x}: {payload:?}");
                rsp.extend_from_slice(b"pong");
                ReturnCode::Ok
            }),
        )
        .unwrap();
    client.picc.register_response_handler(Box::new(
        |provider, method, session, rc, payload| {
            println!(
                "client: response from {provider:#04x} method {method:#04x} \
                 session {session} rc {rc}: {payload:?}"
            );
        },
    ));

    // Drive both peers until the handshake completes.
    for _ in 0..50 {
        pump(&mut client);
        pump(&mut server);
        if client.picc.link_state(DATA_CHAN) == LinkState::Connected {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    println!(
        "client link: {:?}, server link: {:?}",
        client.picc.link_state(DATA_CHAN),
        server.picc.link_state(DATA_CHAN)
    );

    // Event with ACK and a method request.
    client
        .picc
        .send_event(CLIENT_ID, 0x01, SERVER_ID, &[0x04], true, DATA_CHAN)
        .expect("send event");
    let session = client
        .picc
        .method_request(SERVER_ID, 0x03, b"ping", MethodType::WithResponse, DATA_CHAN);
    println!("client: method request session {session}");

    for _ in 0..10 {
        pump(&mut client);
        pump(&mut server);
        std::thread::sleep(Duration::from_millis(10));
    }

    client.mgr.free_all();
    server.mgr.free_all();
    println!("done");
}
