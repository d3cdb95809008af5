// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Fixed-size buffer pools and the buffer-descriptor (BD) exchange.
//
// A pool's BD queue trades ownership tokens for buffers. Only one peer may
// ever write a BD ring, so the peer that pushes free-buffer BDs into its
// release ring at the end of an Rx operation must also be the one that
// initializes that ring. That is why the local peer populates its BD queue
// with descriptors of the *remote* peer's free buffers: the shared-memory
// layout is symmetric, so the remote BD info can be computed locally.
//
//     local acquire ring == remote release ring
//     local release ring == remote acquire ring

use crate::error::{site, Error, Result};
use crate::ring::{Queue, QueueConfig, QueueKind};

/// Buffer descriptor: names one buffer by pool, index and payload length.
/// This is the 8-byte element exchanged through every BD ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bd {
    pub pool_id: u16,
    pub buf_id: u16,
    pub data_size: u32,
}

pub(crate) const BD_SIZE: u32 = std::mem::size_of::<Bd>() as u32;

const _: () = assert!(std::mem::size_of::<Bd>() == 8);

impl Bd {
    pub(crate) fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0..2].copy_from_slice(&self.pool_id.to_ne_bytes());
        out[2..4].copy_from_slice(&self.buf_id.to_ne_bytes());
        out[4..8].copy_from_slice(&self.data_size.to_ne_bytes());
        out
    }

    pub(crate) fn from_bytes(bytes: &[u8; 8]) -> Bd {
        Bd {
            pool_id: u16::from_ne_bytes([bytes[0], bytes[1]]),
            buf_id: u16::from_ne_bytes([bytes[2], bytes[3]]),
            data_size: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Buffer pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub num_bufs: u16,
    pub buf_size: u32,
}

/// Maximum buffers in a single pool.
pub const MAX_BUFS_PER_POOL: u16 = 4096;

/// Instance shared-memory window, used for address range checks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Window {
    pub local: usize,
    pub remote: usize,
    pub size: u32,
}

impl Window {
    pub fn local_end(&self) -> usize {
        self.local + self.size as usize
    }

    pub fn remote_end(&self) -> usize {
        self.remote + self.size as usize
    }
}

/// One fixed-size buffer pool of a managed channel.
pub(crate) struct BufferPool {
    num_bufs: u16,
    buf_size: u32,
    /// Shared memory mapped by this pool: BD queue + buffer array.
    shm_size: u32,
    local_pool_addr: usize,
    remote_pool_addr: usize,
    bd_queue: Queue,
}

impl BufferPool {
    /// Lay out and initialize one pool at `local_shm` / `remote_shm`.
    ///
    /// Places the BD ring at the start of the pool's slice and the buffer
    /// array after it, mirrors the remote layout by symmetry, populates the
    /// BD queue with the remote peer's free buffers, then flips the local
    /// BD-ring sentinel to INIT_DONE.
    pub fn init(
        pool_id: u16,
        cfg: &PoolConfig,
        local_shm: usize,
        remote_shm: usize,
        win: &Window,
    ) -> Result<BufferPool> {
        if cfg.num_bufs == 0 || cfg.num_bufs > MAX_BUFS_PER_POOL || cfg.buf_size == 0 {
            return Err(site::fail(Error::Inval));
        }

        let bd_queue = Queue::init(QueueConfig {
            elem_size: BD_SIZE,
            elem_num: cfg.num_bufs,
            kind: QueueKind::Pool,
            push_addr: local_shm,
            pop_addr: remote_shm,
        })?;

        let queue_mem_size = bd_queue.mem_size();
        let pool = BufferPool {
            num_bufs: cfg.num_bufs,
            buf_size: cfg.buf_size,
            shm_size: queue_mem_size + cfg.buf_size * cfg.num_bufs as u32,
            local_pool_addr: local_shm + queue_mem_size as usize,
            remote_pool_addr: remote_shm + queue_mem_size as usize,
            bd_queue,
        };

        // The whole pool footprint must fit in the instance window.
        if local_shm + pool.shm_size as usize > win.local_end() {
            pool.bd_queue.free();
            return Err(site::fail(Error::NoMem));
        }

        // Populate the queue with free BDs describing the remote pool. The
        // local sentinel still reads INIT_IN_PROGRESS here, so this goes
        // through the unvalidated push.
        for buf_id in 0..pool.num_bufs {
            let bd = Bd {
                pool_id,
                buf_id,
                data_size: 0,
            };
            if let Err(err) = pool.bd_queue.push_raw(&bd.to_bytes()) {
                pool.bd_queue.free();
                return Err(err);
            }
        }

        pool.bd_queue.mark_ready();
        Ok(pool)
    }

    /// Pop one free BD (a remote-release token for a local buffer).
    pub fn pop_free(&self) -> Result<Bd> {
        let mut bytes = [0u8; 8];
        self.bd_queue.pop(&mut bytes)?;
        Ok(Bd::from_bytes(&bytes))
    }

    /// Push one free BD into the release ring.
    pub fn push_free(&self, bd: Bd) -> Result<()> {
        self.bd_queue.push(&bd.to_bytes())
    }

    pub fn check_integrity(&self) -> Result<()> {
        self.bd_queue.check_integrity()
    }

    pub fn free(&self) {
        self.bd_queue.free()
    }

    pub fn num_bufs(&self) -> u16 {
        self.num_bufs
    }

    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    pub fn shm_size(&self) -> u32 {
        self.shm_size
    }

    pub fn local_pool_addr(&self) -> usize {
        self.local_pool_addr
    }

    pub fn remote_pool_addr(&self) -> usize {
        self.remote_pool_addr
    }

    /// Whether `addr` falls inside the local buffer array.
    pub fn owns_local(&self, addr: usize) -> bool {
        let size = self.num_bufs as usize * self.buf_size as usize;
        addr >= self.local_pool_addr && addr < self.local_pool_addr + size
    }

    /// Whether `addr` falls inside the remote buffer array.
    pub fn owns_remote(&self, addr: usize) -> bool {
        let size = self.num_bufs as usize * self.buf_size as usize;
        addr >= self.remote_pool_addr && addr < self.remote_pool_addr + size
    }
}
