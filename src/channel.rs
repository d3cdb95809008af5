// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Managed and unmanaged channels.
//
// A managed channel owns its buffers: a BD queue carries in-flight message
// descriptors and up to MAX_POOLS buffer pools (sorted by ascending buffer
// size) back them. An unmanaged channel is a single application-owned
// region; the middleware only signals "the peer bumped its Tx counter".

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{site, Error, Result};
use crate::pool::{Bd, BufferPool, PoolConfig, Window, BD_SIZE};
use crate::ring::{Queue, QueueConfig, QueueKind, RING_INIT_DONE, RING_INIT_IN_PROGRESS};

/// Maximum pools per managed channel.
pub const MAX_POOLS: usize = 4;
/// Maximum buffers summed over all pools of a channel.
pub const MAX_BUFS_PER_CHANNEL: u32 = 65534;
/// Maximum unmanaged channel payload size.
pub const MAX_UNMANAGED_SIZE: u32 = 65535;

/// Unmanaged channel sentinel: initialization in progress.
pub const UCHAN_INIT_IN_PROGRESS: u32 = 0x54494E49;
/// Unmanaged channel sentinel: initialization done.
pub const UCHAN_INIT_DONE: u32 = 0x55435049;

/// Borrowed view of a received buffer.
///
/// For a managed channel the underlying memory belongs to the owning pool
/// in the *remote* window and stays valid until the application releases it
/// with `release_buf`. For an unmanaged channel it is the peer's whole
/// payload region.
pub struct RxBuf {
    pub instance: u8,
    pub channel: u8,
    ptr: *const u8,
    len: u32,
}

unsafe impl Send for RxBuf {}

impl RxBuf {
    pub(crate) fn new(instance: u8, channel: u8, ptr: *const u8, len: u32) -> Self {
        Self {
            instance,
            channel,
            ptr,
            len,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }
}

/// Writable transport buffer handed out by `acquire_buf`.
pub struct TxBuf {
    ptr: *mut u8,
    cap: u32,
}

unsafe impl Send for TxBuf {}

impl TxBuf {
    /// Wrap a raw buffer.
    ///
    /// # Safety
    /// `ptr` must stay valid and writable for the lifetime of the handle,
    /// with at least `cap` bytes behind it.
    pub unsafe fn from_raw(ptr: *mut u8, cap: u32) -> Self {
        Self { ptr, cap }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn capacity(&self) -> u32 {
        self.cap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.cap as usize) }
    }
}

/// Receive callback, invoked from the deferred Rx path (never from the
/// doorbell ISR). The callback owns the buffer until it is released.
pub type RxCallback = Box<dyn Fn(&RxBuf) + Send + Sync>;

/// Channel configuration, tagged managed/unmanaged.
pub enum ChannelConfig {
    Managed {
        /// Pools in ascending buffer-size order.
        pools: Vec<PoolConfig>,
        rx_cb: RxCallback,
    },
    Unmanaged {
        size: u32,
        rx_cb: RxCallback,
    },
}

// ---------------------------------------------------------------------------
// Managed channel
// ---------------------------------------------------------------------------

pub(crate) struct ManagedChannel {
    bd_queue: Queue,
    pools: Vec<BufferPool>,
    rx_cb: RxCallback,
}

impl ManagedChannel {
    fn init(
        pools_cfg: &[PoolConfig],
        rx_cb: RxCallback,
        local_shm: usize,
        remote_shm: usize,
        win: &Window,
    ) -> Result<ManagedChannel> {
        let total_bufs = Self::total_bufs(pools_cfg)?;

        let bd_queue = Queue::init(QueueConfig {
            elem_size: BD_SIZE,
            elem_num: total_bufs as u16,
            kind: QueueKind::Channel,
            push_addr: local_shm,
            pop_addr: remote_shm,
        })?;
        bd_queue.mark_ready();

        let mut local_pool_shm = local_shm + bd_queue.mem_size() as usize;
        let mut remote_pool_shm = remote_shm + bd_queue.mem_size() as usize;
        if local_pool_shm > win.local_end() {
            bd_queue.free();
            return Err(site::fail(Error::NoMem));
        }

        let mut pools = Vec::with_capacity(pools_cfg.len());
        for (pool_id, cfg) in pools_cfg.iter().enumerate() {
            match BufferPool::init(pool_id as u16, cfg, local_pool_shm, remote_pool_shm, win) {
                Ok(pool) => {
                    local_pool_shm += pool.shm_size() as usize;
                    remote_pool_shm += pool.shm_size() as usize;
                    pools.push(pool);
                }
                Err(err) => {
                    // Leave no stale sentinel behind for the peer to see.
                    for pool in &pools {
                        pool.free();
                    }
                    bd_queue.free();
                    return Err(err);
                }
            }
        }

        Ok(ManagedChannel {
            bd_queue,
            pools,
            rx_cb,
        })
    }

    /// Validate pool ordering and count the channel's total buffers.
    fn total_bufs(pools_cfg: &[PoolConfig]) -> Result<u32> {
        if pools_cfg.is_empty() || pools_cfg.len() > MAX_POOLS {
            return Err(site::fail(Error::Inval));
        }
        let mut prev_buf_size = 0u32;
        let mut total = 0u32;
        for cfg in pools_cfg {
            // Pools must be sorted ascending so acquire can pick the
            // smallest fitting buffer.
            if cfg.buf_size < prev_buf_size {
                return Err(site::fail(Error::Inval));
            }
            prev_buf_size = cfg.buf_size;
            total += cfg.num_bufs as u32;
            if total > MAX_BUFS_PER_CHANNEL {
                return Err(site::fail(Error::Inval));
            }
        }
        Ok(total)
    }

    pub fn check_integrity(&self) -> Result<()> {
        self.bd_queue.check_integrity()?;
        for pool in &self.pools {
            pool.check_integrity()?;
        }
        Ok(())
    }

    /// Find the smallest non-empty pool fitting `size` and pop one BD.
    /// Returns the writable local buffer address.
    pub fn acquire(&self, size: u32, win: &Window) -> Option<usize> {
        for pool in &self.pools {
            if size > pool.buf_size() {
                continue;
            }
            if let Ok(bd) = pool.pop_free() {
                let addr = pool.local_pool_addr() + (bd.buf_id as usize * pool.buf_size() as usize);
                // The popped BD must name a buffer inside the local window.
                if addr < win.local || addr + pool.buf_size() as usize > win.local_end() {
                    return None;
                }
                return Some(addr);
            }
        }
        None
    }

    /// Describe `addr` and push the BD into the channel queue.
    pub fn tx(&self, addr: usize, size: u32) -> Result<()> {
        self.check_integrity()?;
        let (pool_id, pool) = self
            .pools
            .iter()
            .enumerate()
            .find(|(_, p)| p.owns_local(addr))
            .ok_or_else(|| site::fail(Error::Inval))?;
        let bd = Bd {
            pool_id: pool_id as u16,
            buf_id: ((addr - pool.local_pool_addr()) / pool.buf_size() as usize) as u16,
            data_size: size,
        };
        self.bd_queue.push(&bd.to_bytes())
    }

    /// Return a processed buffer to its owning pool's release ring.
    ///
    /// Rx buffers resolve against the remote window, Tx buffers (released
    /// after a failed send) against the local one.
    pub fn release(&self, addr: usize) -> Result<()> {
        self.check_integrity()?;
        if let Some((pool_id, pool)) = self
            .pools
            .iter()
            .enumerate()
            .find(|(_, p)| p.owns_remote(addr))
        {
            let bd = Bd {
                pool_id: pool_id as u16,
                buf_id: ((addr - pool.remote_pool_addr()) / pool.buf_size() as usize) as u16,
                data_size: 0,
            };
            return pool.push_free(bd);
        }
        if let Some((pool_id, pool)) = self
            .pools
            .iter()
            .enumerate()
            .find(|(_, p)| p.owns_local(addr))
        {
            let bd = Bd {
                pool_id: pool_id as u16,
                buf_id: ((addr - pool.local_pool_addr()) / pool.buf_size() as usize) as u16,
                data_size: 0,
            };
            return pool.push_free(bd);
        }
        Err(site::fail(Error::Inval))
    }

    /// Process up to `budget` incoming BDs, dispatching each buffer to the
    /// Rx callback. Returns the work done.
    fn rx(&self, instance: u8, channel: u8, budget: u32, win: &Window) -> u32 {
        let mut work = 0;
        let mut bytes = [0u8; 8];
        while work < budget {
            if self.bd_queue.pop(&mut bytes).is_err() {
                break;
            }
            let bd = Bd::from_bytes(&bytes);
            let Some(pool) = self.pools.get(bd.pool_id as usize) else {
                // Descriptor from shared memory names a pool we don't have.
                site::record(Error::Integrity.code());
                continue;
            };
            let addr = pool.remote_pool_addr() + bd.buf_id as usize * pool.buf_size() as usize;
            if addr >= win.remote && addr + pool.buf_size() as usize <= win.remote_end() {
                let buf = RxBuf::new(instance, channel, addr as *const u8, bd.data_size);
                (self.rx_cb)(&buf);
            }
            work += 1;
        }
        work
    }

    fn memmap_size(&self) -> u32 {
        let mut size = self.bd_queue.mem_size();
        for pool in &self.pools {
            size += pool.shm_size();
        }
        size
    }

    fn free(&self) {
        let s = self.bd_queue.push_sentinel();
        if s == RING_INIT_DONE || s == RING_INIT_IN_PROGRESS {
            self.bd_queue.free();
            for pool in &self.pools {
                pool.free();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unmanaged channel
// ---------------------------------------------------------------------------

/// Unmanaged channel control structure at the start of the channel's
/// shared-memory slice, followed by the payload region.
#[repr(C)]
struct UmemHdr {
    sentinel: AtomicU32,
    tx_count: AtomicU32,
    remote_tx_count: AtomicU32,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<UmemHdr>() == 16);

pub(crate) struct UnmanagedChannel {
    size: u32,
    local_mem: *mut u8,
    remote_mem: *mut u8,
    rx_cb: RxCallback,
}

impl UnmanagedChannel {
    fn init(
        size: u32,
        rx_cb: RxCallback,
        local_shm: usize,
        remote_shm: usize,
    ) -> Result<UnmanagedChannel> {
        if size == 0 || size > MAX_UNMANAGED_SIZE {
            return Err(site::fail(Error::Inval));
        }
        let chan = UnmanagedChannel {
            size,
            local_mem: local_shm as *mut u8,
            remote_mem: remote_shm as *mut u8,
            rx_cb,
        };

        if chan.remote_hdr().sentinel.load(Ordering::Acquire) == UCHAN_INIT_IN_PROGRESS {
            return Err(Error::RemoteInitInProgress);
        }
        let local = chan.local_hdr();
        local
            .sentinel
            .store(UCHAN_INIT_IN_PROGRESS, Ordering::Release);

        let remote = chan.remote_hdr();
        if remote.sentinel.load(Ordering::Acquire) == UCHAN_INIT_DONE {
            // Adopt the remote's view of the counters to resume in place.
            local.tx_count.store(
                remote.remote_tx_count.load(Ordering::Acquire),
                Ordering::Release,
            );
            local
                .remote_tx_count
                .store(remote.tx_count.load(Ordering::Acquire), Ordering::Release);
        } else {
            local.tx_count.store(0, Ordering::Release);
            local.remote_tx_count.store(0, Ordering::Release);
        }
        local.sentinel.store(UCHAN_INIT_DONE, Ordering::Release);
        Ok(chan)
    }

    fn local_hdr(&self) -> &UmemHdr {
        unsafe { &*(self.local_mem as *const UmemHdr) }
    }

    fn remote_hdr(&self) -> &UmemHdr {
        unsafe { &*(self.remote_mem as *const UmemHdr) }
    }

    pub fn check_integrity(&self) -> Result<()> {
        if self.local_hdr().sentinel.load(Ordering::Acquire) == UCHAN_INIT_DONE
            && self.remote_hdr().sentinel.load(Ordering::Acquire) == UCHAN_INIT_DONE
        {
            Ok(())
        } else {
            Err(Error::Integrity)
        }
    }

    pub fn check_local_integrity(&self) -> Result<()> {
        if self.local_hdr().sentinel.load(Ordering::Acquire) == UCHAN_INIT_DONE {
            Ok(())
        } else {
            Err(Error::Integrity)
        }
    }

    /// Pointer and size of the local payload region.
    pub fn local_payload(&self) -> (*mut u8, u32) {
        let ptr = unsafe { self.local_mem.add(std::mem::size_of::<UmemHdr>()) };
        (ptr, self.size)
    }

    /// Bump the local Tx counter; the peer's Rx path observes the change.
    pub fn bump_tx(&self) {
        let hdr = self.local_hdr();
        let next = hdr.tx_count.load(Ordering::Acquire).wrapping_add(1);
        hdr.tx_count.store(next, Ordering::Release);
    }

    /// Fire the Rx callback if the peer's Tx counter moved since the last
    /// observation, then mirror the counter to suppress re-firing.
    fn rx(&self, instance: u8, channel: u8, budget: u32) -> u32 {
        if self.check_integrity().is_err() {
            return 0;
        }
        let remote_tx = self.remote_hdr().tx_count.load(Ordering::Acquire);
        if remote_tx == self.local_hdr().remote_tx_count.load(Ordering::Acquire) {
            return 0;
        }
        self.local_hdr()
            .remote_tx_count
            .store(remote_tx, Ordering::Release);

        let payload = unsafe { self.remote_mem.add(std::mem::size_of::<UmemHdr>()) };
        let buf = RxBuf::new(instance, channel, payload as *const u8, self.size);
        (self.rx_cb)(&buf);
        budget
    }

    fn memmap_size(&self) -> u32 {
        std::mem::size_of::<UmemHdr>() as u32 + self.size
    }

    fn free(&self) {
        let hdr = self.local_hdr();
        hdr.sentinel.store(0, Ordering::Release);
        hdr.tx_count.store(0, Ordering::Release);
        hdr.remote_tx_count.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Channel: tagged union of the two kinds
// ---------------------------------------------------------------------------

pub(crate) enum ChannelKind {
    Managed(ManagedChannel),
    Unmanaged(UnmanagedChannel),
}

pub(crate) struct Channel {
    id: u8,
    kind: ChannelKind,
}

// Raw pointers into the shared windows; access discipline is the channel
// SPSC contract plus the atomics in the mapped headers.
unsafe impl Send for Channel {}
unsafe impl Sync for Channel {}

impl Channel {
    pub fn init(
        id: u8,
        cfg: ChannelConfig,
        local_shm: usize,
        remote_shm: usize,
        win: &Window,
    ) -> Result<Channel> {
        let kind = match cfg {
            ChannelConfig::Managed { pools, rx_cb } => ChannelKind::Managed(
                ManagedChannel::init(&pools, rx_cb, local_shm, remote_shm, win)?,
            ),
            ChannelConfig::Unmanaged { size, rx_cb } => {
                ChannelKind::Unmanaged(UnmanagedChannel::init(size, rx_cb, local_shm, remote_shm)?)
            }
        };
        Ok(Channel { id, kind })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn managed(&self) -> Option<&ManagedChannel> {
        match &self.kind {
            ChannelKind::Managed(m) => Some(m),
            ChannelKind::Unmanaged(_) => None,
        }
    }

    pub fn unmanaged(&self) -> Option<&UnmanagedChannel> {
        match &self.kind {
            ChannelKind::Managed(_) => None,
            ChannelKind::Unmanaged(u) => Some(u),
        }
    }

    /// Local mapped-memory footprint of this channel.
    pub fn memmap_size(&self) -> u32 {
        match &self.kind {
            ChannelKind::Managed(m) => m.memmap_size(),
            ChannelKind::Unmanaged(u) => u.memmap_size(),
        }
    }

    /// Handle Rx for this channel within `budget`. Returns work done.
    pub fn rx(&self, instance: u8, budget: u32, win: &Window) -> u32 {
        match &self.kind {
            ChannelKind::Managed(m) => m.rx(instance, self.id, budget, win),
            ChannelKind::Unmanaged(u) => u.rx(instance, self.id, budget),
        }
    }

    /// Clear this channel's local control words.
    pub fn free(&self) {
        match &self.kind {
            ChannelKind::Managed(m) => m.free(),
            ChannelKind::Unmanaged(u) => u.free(),
        }
    }
}
