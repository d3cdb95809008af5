// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Raw transport demo: two peers in one process over mirrored anonymous
// regions, polling mode. Peer A sends a few messages on a managed channel
// and pokes an unmanaged channel; peer B prints what it receives.
//
//   cargo run --bin demo_poll

use std::sync::mpsc;

use intercore::{
    ChannelConfig, InstanceConfig, NullHw, PoolConfig, RxMode, ShmManager, ShmRegion,
};

const SHM_SIZE: u32 = 16 * 1024;

fn peer_config(
    local: &ShmRegion,
    remote: &ShmRegion,
    tx: mpsc::Sender<(u8, Vec<u8>, usize)>,
) -> InstanceConfig {
    let umem_tx = tx.clone();
    InstanceConfig {
        local_shm_addr: local.base(),
        remote_shm_addr: remote.base(),
        shm_size: SHM_SIZE,
        rx_mode: RxMode::Polling,
        local_core: Default::default(),
        remote_core: Default::default(),
        channels: vec![
            ChannelConfig::Unmanaged {
                size: 64,
                rx_cb: Box::new(move |buf| {
                    let _ = umem_tx.send((buf.channel, buf.as_slice().to_vec(), 0));
                }),
            },
            ChannelConfig::Managed {
                pools: vec![
                    PoolConfig {
                        num_bufs: 8,
                        buf_size: 64,
                    },
                    PoolConfig {
                        num_bufs: 4,
                        buf_size: 512,
                    },
                ],
                rx_cb: Box::new(move |buf| {
                    let _ = tx.send((buf.channel, buf.as_slice().to_vec(), buf.as_ptr() as usize));
                }),
            },
        ],
        hw: Box::new(NullHw),
    }
}

fn main() {
    env_logger::init();

    let region_a = ShmRegion::anonymous(SHM_SIZE as usize);
    let region_b = ShmRegion::anonymous(SHM_SIZE as usize);

    let (tx_a, rx_a) = mpsc::channel();
    let (tx_b, rx_b) = mpsc::channel();

    let peer_a = ShmManager::new();
    let peer_b = ShmManager::new();
    peer_a
        .init_instance(0, peer_config(&region_a, &region_b, tx_a))
        .expect("peer A init");
    peer_b
        .init_instance(0, peer_config(&region_b, &region_a, tx_b))
        .expect("peer B init");

    // Managed channel: A -> B.
    for i in 0..4u8 {
        let msg = format!("message {i} from peer A");
        let mut buf = peer_a.acquire_buf(0, 1, msg.len() as u32).expect("tx buf");
        buf.as_mut_slice()[..msg.len()].copy_from_slice(msg.as_bytes());
        peer_a.tx(0, 1, &buf, msg.len() as u32).expect("tx");
    }

    // Unmanaged channel: A writes the region, then signals.
    let region = peer_a.unmanaged_acquire(0, 0).expect("umem region");
    unsafe {
        let slice = region.as_mut_slice();
        slice[..5].copy_from_slice(b"knock");
    }
    peer_a.unmanaged_tx(0, 0).expect("umem tx");

    // B polls and prints.
    peer_b.poll_channels(0).expect("poll");
    while let Ok((chan, data, ptr)) = rx_b.try_recv() {
        if ptr != 0 {
            println!("B chan {chan}: {:?}", String::from_utf8_lossy(&data));
            peer_b.release_buf(0, chan, ptr as *const u8).expect("release");
        } else {
            println!("B chan {chan} (unmanaged): {:?}", &data[..8]);
        }
    }

    // Nothing pending in the other direction.
    peer_a.poll_channels(0).expect("poll");
    assert!(rx_a.try_recv().is_err());

    peer_a.free_all();
    peer_b.free_all();
    println!("done");
}
