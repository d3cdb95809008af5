// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Criterion benchmarks for the dual-ring queue hot path.
//
//   cargo bench --bench queue

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use intercore::ring::{Queue, QueueConfig, QueueKind};
use intercore::ShmRegion;

const ELEM_SIZE: u32 = 8;
const ELEM_NUM: u16 = 255;

/// Two mirrored queues over anonymous regions, both marked ready.
fn queue_pair(region_a: &ShmRegion, region_b: &ShmRegion) -> (Queue, Queue) {
    let qa = Queue::init(QueueConfig {
        elem_size: ELEM_SIZE,
        elem_num: ELEM_NUM,
        kind: QueueKind::Channel,
        push_addr: region_a.base(),
        pop_addr: region_b.base(),
    })
    .unwrap();
    qa.mark_ready();
    let qb = Queue::init(QueueConfig {
        elem_size: ELEM_SIZE,
        elem_num: ELEM_NUM,
        kind: QueueKind::Channel,
        push_addr: region_b.base(),
        pop_addr: region_a.base(),
    })
    .unwrap();
    qb.mark_ready();
    (qa, qb)
}

fn bench_push_pop(c: &mut Criterion) {
    let region_a = ShmRegion::anonymous(4096);
    let region_b = ShmRegion::anonymous(4096);
    let (qa, qb) = queue_pair(&region_a, &region_b);

    let elem = [0x5Au8; 8];
    let mut out = [0u8; 8];

    c.bench_function("queue_push_pop", |b| {
        b.iter(|| {
            qa.push(black_box(&elem)).unwrap();
            qb.pop(black_box(&mut out)).unwrap();
        })
    });

    c.bench_function("queue_push_pop_batch64", |b| {
        b.iter(|| {
            for _ in 0..64 {
                qa.push(black_box(&elem)).unwrap();
            }
            for _ in 0..64 {
                qb.pop(black_box(&mut out)).unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
