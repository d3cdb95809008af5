// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Shared harness: two transport peers over mirrored anonymous regions in
// one process, with collecting Rx callbacks.

#![allow(dead_code)]

use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;

use intercore::picc::link::Role;
use intercore::{
    ChannelConfig, InstanceConfig, NullHw, Picc, PiccConfig, PoolConfig, RxMode, ShmManager,
    ShmRegion, ShmTransport,
};

pub const SHM_SIZE: u32 = 32 * 1024;

/// One message delivered to a peer's Rx callback.
#[derive(Debug, Clone)]
pub struct RxRecord {
    pub channel: u8,
    pub data: Vec<u8>,
    /// Buffer address, for the deferred release call (0 for unmanaged).
    pub ptr: usize,
}

pub struct Peer {
    pub mgr: Arc<ShmManager>,
    pub rx: Receiver<RxRecord>,
}

impl Peer {
    /// Drain pending Rx, releasing every managed buffer.
    pub fn drain(&self) -> Vec<RxRecord> {
        let mut out = Vec::new();
        while let Ok(rec) = self.rx.try_recv() {
            if rec.ptr != 0 {
                self.mgr
                    .release_buf(0, rec.channel, rec.ptr as *const u8)
                    .expect("release");
            }
            out.push(rec);
        }
        out
    }

    /// Drain pending Rx without releasing the buffers.
    pub fn drain_no_release(&self) -> Vec<RxRecord> {
        let mut out = Vec::new();
        while let Ok(rec) = self.rx.try_recv() {
            out.push(rec);
        }
        out
    }
}

pub struct TestPeers {
    // Regions must outlive the managers that point into them.
    pub region_a: ShmRegion,
    pub region_b: ShmRegion,
    pub a: Peer,
    pub b: Peer,
}

fn collecting_channels(
    pools: &[PoolConfig],
    tx: std::sync::mpsc::Sender<RxRecord>,
) -> Vec<ChannelConfig> {
    vec![ChannelConfig::Managed {
        pools: pools.to_vec(),
        rx_cb: Box::new(move |buf| {
            let _ = tx.send(RxRecord {
                channel: buf.channel,
                data: buf.as_slice().to_vec(),
                ptr: buf.as_ptr() as usize,
            });
        }),
    }]
}

/// Two polling-mode peers with one managed channel each.
pub fn managed_pair(pools: &[PoolConfig]) -> TestPeers {
    let region_a = ShmRegion::anonymous(SHM_SIZE as usize);
    let region_b = ShmRegion::anonymous(SHM_SIZE as usize);

    let (tx_a, rx_a) = channel();
    let (tx_b, rx_b) = channel();

    let mgr_a = ShmManager::new();
    mgr_a
        .init_instance(
            0,
            InstanceConfig {
                local_shm_addr: region_a.base(),
                remote_shm_addr: region_b.base(),
                shm_size: SHM_SIZE,
                rx_mode: RxMode::Polling,
                local_core: Default::default(),
                remote_core: Default::default(),
                channels: collecting_channels(pools, tx_a),
                hw: Box::new(NullHw),
            },
        )
        .expect("peer A init");

    let mgr_b = ShmManager::new();
    mgr_b
        .init_instance(
            0,
            InstanceConfig {
                local_shm_addr: region_b.base(),
                remote_shm_addr: region_a.base(),
                shm_size: SHM_SIZE,
                rx_mode: RxMode::Polling,
                local_core: Default::default(),
                remote_core: Default::default(),
                channels: collecting_channels(pools, tx_b),
                hw: Box::new(NullHw),
            },
        )
        .expect("peer B init");

    TestPeers {
        region_a,
        region_b,
        a: Peer {
            mgr: mgr_a,
            rx: rx_a,
        },
        b: Peer {
            mgr: mgr_b,
            rx: rx_b,
        },
    }
}

/// Default single-pool layout used by most transport tests.
pub fn default_pools() -> Vec<PoolConfig> {
    vec![PoolConfig {
        num_bufs: 8,
        buf_size: 4100,
    }]
}

/// Send `data` from `from` on `channel` and return the buffer address used.
pub fn send_bytes(from: &Peer, channel: u8, data: &[u8]) -> usize {
    let mut buf = from
        .mgr
        .acquire_buf(0, channel, data.len() as u32)
        .expect("acquire");
    buf.as_mut_slice()[..data.len()].copy_from_slice(data);
    let addr = buf.as_ptr() as usize;
    from.mgr.tx(0, channel, &buf, data.len() as u32).expect("tx");
    addr
}

// ---------------------------------------------------------------------------
// Full-stack (PICC) peers
// ---------------------------------------------------------------------------

/// Ids used by the middleware tests.
pub const CLIENT_ID: u8 = 0xCD;
pub const SERVER_ID: u8 = 0xCE;
/// The primary data channel of the middleware harness.
pub const DATA_CHAN: u8 = 0;

pub struct PiccPeer {
    pub mgr: Arc<ShmManager>,
    pub rx: Receiver<RxRecord>,
    pub picc: Picc,
}

impl PiccPeer {
    /// Deliver pending inbound frames into the middleware (no tick).
    pub fn deliver(&mut self) {
        let _ = self.mgr.poll_channels(0);
        while let Ok(rec) = self.rx.try_recv() {
            let _ = self.picc.process_rx_data(0, rec.channel, &rec.data);
            let _ = self
                .mgr
                .release_buf(0, rec.channel, rec.ptr as *const u8);
        }
    }

    /// One scheduling round: deliver inbound, then run the periodic tick.
    pub fn pump(&mut self) {
        self.deliver();
        self.picc.tick();
    }

    /// Drain raw transport frames without feeding them to the middleware.
    pub fn drain_raw(&mut self) -> Vec<Vec<u8>> {
        let _ = self.mgr.poll_channels(0);
        let mut out = Vec::new();
        while let Ok(rec) = self.rx.try_recv() {
            let _ = self
                .mgr
                .release_buf(0, rec.channel, rec.ptr as *const u8);
            out.push(rec.data);
        }
        out
    }
}

/// Two full-stack peers with their backing regions kept alive.
pub struct PiccHarness {
    pub client: PiccPeer,
    pub server: PiccPeer,
    _region_a: ShmRegion,
    _region_b: ShmRegion,
}

/// Build a client/server PICC pair with the primary channel initialised
/// and the link registered on both sides.
pub fn picc_pair() -> PiccHarness {
    let peers = managed_pair(&default_pools());

    let make = |mgr: &Arc<ShmManager>, role: Role| {
        let (local_id, remote_id) = match role {
            Role::Client => (CLIENT_ID, SERVER_ID),
            Role::Server => (SERVER_ID, CLIENT_ID),
        };
        let mut picc = Picc::new(
            Arc::clone(mgr) as Arc<dyn ShmTransport>,
            PiccConfig {
                link_local_id: local_id,
                link_remote_id: remote_id,
                link_role: role,
                instance: 0,
                channel: DATA_CHAN,
                crc_enabled: true,
            },
        );
        picc.init_channel(0, DATA_CHAN).expect("picc channel");
        picc.link_register().expect("link register");
        picc
    };

    let client_picc = make(&peers.a.mgr, Role::Client);
    let server_picc = make(&peers.b.mgr, Role::Server);

    PiccHarness {
        client: PiccPeer {
            mgr: peers.a.mgr,
            rx: peers.a.rx,
            picc: client_picc,
        },
        server: PiccPeer {
            mgr: peers.b.mgr,
            rx: peers.b.rx,
            picc: server_picc,
        },
        _region_a: peers.region_a,
        _region_b: peers.region_b,
    }
}

/// Drive both peers until the connect handshake completes, then settle
/// the residual in-flight link traffic so the wire is quiet afterwards.
pub fn connect(client: &mut PiccPeer, server: &mut PiccPeer) {
    use intercore::picc::link::LinkState;
    let mut connected = false;
    for _ in 0..50 {
        client.pump();
        server.pump();
        client.deliver();
        if client.picc.link_state(DATA_CHAN) == LinkState::Connected
            && server.picc.link_state(DATA_CHAN) == LinkState::Connected
        {
            connected = true;
            break;
        }
    }
    assert!(connected, "handshake did not complete");

    for _ in 0..4 {
        client.pump();
        server.pump();
    }
    client.deliver();
    server.deliver();
}
