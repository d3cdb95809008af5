// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Inter-processor communication substrate for heterogeneous multi-core
// systems: a lock-free shared-memory transport (dual-ring SPSC queues,
// buffer-descriptor pools, doorbell notifications) with the PICC
// request/response and publish/subscribe middleware on top.

pub mod error;
pub use error::{Error, Result};

pub mod ring;

pub mod pool;
pub use pool::{Bd, PoolConfig};

pub mod channel;
pub use channel::{ChannelConfig, RxBuf, RxCallback, TxBuf};

pub mod hw;
pub use hw::{Doorbell, HwOps, LoopbackHw, NullHw};

mod os;
pub use os::SOFTIRQ_BUDGET;

pub mod instance;
pub use instance::{CoreConfig, InstanceConfig, RxMode, ShmManager, UmemRegion};

mod platform;

pub mod shm;
pub use shm::{ShmOpenMode, ShmRegion};

pub mod picc;
pub use picc::{Picc, PiccConfig, ShmTransport};
