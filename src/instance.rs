// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Instance manager: shared-memory layout, init/teardown, Tx entry points
// and the fair Rx dispatch.
//
// Per-instance layout of local shared memory, bit-exact with the peer:
//   offset 0: 8-byte global word (READY magic / CLEAR)
//   offset 8: first channel; each next channel starts after the previous
//             channel's mapped footprint.
// Every channel's remote base is the mirror of its local base.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::channel::{Channel, ChannelConfig, TxBuf};
use crate::error::{site, Error, Result};
use crate::hw::{Doorbell, HwOps};
use crate::os::{RxWorker, SOFTIRQ_BUDGET};
use crate::pool::Window;

/// Maximum independent IPC instances per manager.
pub const MAX_INSTANCES: usize = 4;
/// Maximum channels per instance.
pub const MAX_CHANNELS: usize = 8;

/// Magic word published in the global slot once the local side is up.
pub const SHM_STATE_READY: u64 = 0x3252455646435049;
/// Cleared global slot.
pub const SHM_STATE_CLEAR: u64 = 0;

/// Global data shared with the remote peer, at offset 0 of each side's
/// shared memory. Sized to preserve the 8-byte alignment of what follows.
#[repr(C)]
struct GlobalHdr {
    state: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<GlobalHdr>() == 8);

/// How the instance learns about inbound traffic.
pub enum RxMode {
    /// Inbound doorbell wakes the deferred Rx worker.
    Irq(Doorbell),
    /// No inbound interrupt; the application drives `poll_channels`.
    Polling,
}

/// Identifies one core of the pair. Carried for diagnostics; interrupt and
/// register routing live in the platform's [`HwOps`] implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreConfig {
    pub core_type: u8,
    pub index: u8,
    pub trusted_mask: u32,
}

/// Instance configuration.
pub struct InstanceConfig {
    pub local_shm_addr: usize,
    pub remote_shm_addr: usize,
    pub shm_size: u32,
    pub rx_mode: RxMode,
    pub local_core: CoreConfig,
    pub remote_core: CoreConfig,
    pub channels: Vec<ChannelConfig>,
    pub hw: Box<dyn HwOps>,
}

/// Application-owned region of an unmanaged channel.
pub struct UmemRegion {
    ptr: *mut u8,
    len: u32,
}

unsafe impl Send for UmemRegion {}

impl UmemRegion {
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The caller must not overlap writes with a concurrent local writer of
    /// the same region; the middleware itself never writes it.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len as usize)
    }
}

struct Instance {
    shm_size: u32,
    local_shm: usize,
    remote_shm: usize,
    channels: Vec<Channel>,
    hw: Box<dyn HwOps>,
    irq_mode: bool,
}

// Raw shared-memory addresses; channel-level contracts govern access.
unsafe impl Send for Instance {}
unsafe impl Sync for Instance {}

impl Instance {
    fn window(&self) -> Window {
        Window {
            local: self.local_shm,
            remote: self.remote_shm,
            size: self.shm_size,
        }
    }

    fn global(&self) -> &GlobalHdr {
        unsafe { &*(self.local_shm as *const GlobalHdr) }
    }

    fn remote_global(&self) -> &GlobalHdr {
        unsafe { &*(self.remote_shm as *const GlobalHdr) }
    }
}

/// Manager of up to [`MAX_INSTANCES`] independent shared-memory bindings.
pub struct ShmManager {
    instances: [RwLock<Option<Instance>>; MAX_INSTANCES],
    worker: Mutex<Option<RxWorker>>,
}

impl ShmManager {
    pub fn new() -> Arc<ShmManager> {
        Arc::new(ShmManager {
            instances: Default::default(),
            worker: Mutex::new(None),
        })
    }

    /// Initialize every instance of `configs`, ids assigned in order.
    pub fn init(self: &Arc<Self>, configs: Vec<InstanceConfig>) -> Result<()> {
        if configs.is_empty() || configs.len() > MAX_INSTANCES {
            return Err(site::fail(Error::Inval));
        }
        for (id, cfg) in configs.into_iter().enumerate() {
            self.init_instance(id as u8, cfg)?;
        }
        Ok(())
    }

    /// Initialize one instance: platform bridge, Rx scheduling, then the
    /// channel layout. On failure everything already built is torn down.
    /// On success the doorbell is cleared and enabled, the global word
    /// flips to READY and the local cache is flushed.
    pub fn init_instance(self: &Arc<Self>, instance: u8, cfg: InstanceConfig) -> Result<()> {
        let slot = self
            .instances
            .get(instance as usize)
            .ok_or_else(|| site::fail(Error::Inval))?;
        let mut guard = slot.write().unwrap();
        if guard.is_some() {
            return Err(site::fail(Error::Inval));
        }
        if cfg.local_shm_addr == 0
            || cfg.remote_shm_addr == 0
            || cfg.shm_size == 0
            || cfg.channels.is_empty()
            || cfg.channels.len() > MAX_CHANNELS
        {
            return Err(site::fail(Error::Inval));
        }

        // Rx scheduling: hook the inbound doorbell into the shared worker.
        let irq_mode = match &cfg.rx_mode {
            RxMode::Irq(bell) => {
                let shared = {
                    let mut worker = self.worker.lock().unwrap();
                    if worker.is_none() {
                        *worker = Some(RxWorker::spawn(Arc::downgrade(self)));
                    }
                    worker.as_ref().unwrap().shared()
                };
                let id = instance as usize;
                bell.set_isr(Arc::new(move || shared.mark_pending(id)));
                true
            }
            RxMode::Polling => false,
        };

        log::info!(
            "instance {instance}: init local={:#x} remote={:#x} size={} channels={} core {}->{} ({})",
            cfg.local_shm_addr,
            cfg.remote_shm_addr,
            cfg.shm_size,
            cfg.channels.len(),
            cfg.local_core.index,
            cfg.remote_core.index,
            if irq_mode { "irq" } else { "polling" },
        );

        let inst = Instance {
            shm_size: cfg.shm_size,
            local_shm: cfg.local_shm_addr,
            remote_shm: cfg.remote_shm_addr,
            channels: Vec::with_capacity(cfg.channels.len()),
            hw: cfg.hw,
            irq_mode,
        };
        let win = inst.window();

        // Global data at the beginning of local shared memory.
        inst.global().state.store(SHM_STATE_CLEAR, Ordering::Release);

        let mut inst = inst;
        let mut local_chan_shm = cfg.local_shm_addr + std::mem::size_of::<GlobalHdr>();
        let mut remote_chan_shm = cfg.remote_shm_addr + std::mem::size_of::<GlobalHdr>();
        for (chan_id, chan_cfg) in cfg.channels.into_iter().enumerate() {
            // The channel's control header must fit before anything is
            // written at its offset.
            if local_chan_shm + 16 > win.local_end() {
                for chan in &inst.channels {
                    chan.free();
                }
                return Err(site::fail(Error::NoMem));
            }
            match Channel::init(chan_id as u8, chan_cfg, local_chan_shm, remote_chan_shm, &win) {
                Ok(chan) => {
                    let size = chan.memmap_size() as usize;
                    local_chan_shm += size;
                    remote_chan_shm += size;
                    inst.channels.push(chan);
                }
                Err(err) => {
                    for chan in &inst.channels {
                        chan.free();
                    }
                    return Err(err);
                }
            }
        }

        inst.hw.irq_clear();
        inst.hw.irq_enable();
        inst.global().state.store(SHM_STATE_READY, Ordering::Release);
        inst.hw.flush_cache_local();

        *guard = Some(inst);
        Ok(())
    }

    /// Tear one instance down: clear the global word, free every channel's
    /// local control data, flush, mask the doorbell.
    pub fn free_instance(&self, instance: u8) {
        let Some(slot) = self.instances.get(instance as usize) else {
            return;
        };
        let mut guard = slot.write().unwrap();
        if let Some(inst) = guard.take() {
            inst.global().state.store(SHM_STATE_CLEAR, Ordering::Release);
            for chan in &inst.channels {
                chan.free();
            }
            inst.hw.flush_cache_local();
            inst.hw.irq_disable();
            log::info!("instance {instance}: freed");
        }
    }

    /// Tear down every instance.
    pub fn free_all(&self) {
        for id in 0..MAX_INSTANCES {
            self.free_instance(id as u8);
        }
    }

    fn with_instance<T>(&self, instance: u8, f: impl FnOnce(&Instance) -> T) -> Option<T> {
        let slot = self.instances.get(instance as usize)?;
        let guard = slot.read().unwrap();
        guard.as_ref().map(f)
    }

    /// OK iff the peer's global word reads READY.
    pub fn is_remote_ready(&self, instance: u8) -> Result<()> {
        self.with_instance(instance, |inst| {
            inst.hw.flush_cache_remote();
            if inst.remote_global().state.load(Ordering::Acquire) == SHM_STATE_READY {
                Ok(())
            } else {
                Err(Error::NotReady)
            }
        })
        .unwrap_or(Err(Error::Inval))
    }

    /// Acquire a Tx buffer of at least `size` bytes from the smallest
    /// fitting pool of a managed channel. Only valid once the remote is
    /// READY. Returns `None` when every fitting pool is exhausted.
    pub fn acquire_buf(&self, instance: u8, channel: u8, size: u32) -> Option<TxBuf> {
        if self.is_remote_ready(instance).is_err() {
            return None;
        }
        self.with_instance(instance, |inst| {
            let chan = inst.channels.get(channel as usize)?.managed()?;
            if size == 0 || chan.check_integrity().is_err() {
                return None;
            }
            let addr = chan.acquire(size, &inst.window())?;
            Some(unsafe { TxBuf::from_raw(addr as *mut u8, size) })
        })
        .flatten()
    }

    /// Submit a filled Tx buffer: push its BD into the channel queue,
    /// flush the local cache, ring the peer's doorbell.
    pub fn tx(&self, instance: u8, channel: u8, buf: &TxBuf, size: u32) -> Result<()> {
        self.is_remote_ready(instance)?;
        self.with_instance(instance, |inst| {
            let chan = inst
                .channels
                .get(channel as usize)
                .and_then(|c| c.managed())
                .ok_or_else(|| site::fail(Error::Inval))?;
            if size == 0 {
                return Err(site::fail(Error::Inval));
            }
            chan.tx(buf.as_ptr() as usize, size)?;
            inst.hw.flush_cache_local();
            inst.hw.notify();
            Ok(())
        })
        .unwrap_or(Err(Error::Inval))
    }

    /// Release a buffer back to its owning pool. Rx buffers resolve against
    /// the remote window; Tx buffers released after a failed send resolve
    /// against the local one.
    pub fn release_buf(&self, instance: u8, channel: u8, addr: *const u8) -> Result<()> {
        self.is_remote_ready(instance)?;
        self.with_instance(instance, |inst| {
            let chan = inst
                .channels
                .get(channel as usize)
                .and_then(|c| c.managed())
                .ok_or_else(|| site::fail(Error::Inval))?;
            chan.release(addr as usize)?;
            inst.hw.flush_cache_local();
            Ok(())
        })
        .unwrap_or(Err(Error::Inval))
    }

    /// Whole payload region of an unmanaged channel (local side).
    pub fn unmanaged_acquire(&self, instance: u8, channel: u8) -> Option<UmemRegion> {
        self.with_instance(instance, |inst| {
            let chan = inst.channels.get(channel as usize)?.unmanaged()?;
            chan.check_local_integrity().ok()?;
            let (ptr, len) = chan.local_payload();
            Some(UmemRegion { ptr, len })
        })
        .flatten()
    }

    /// Signal "new data" on an unmanaged channel.
    pub fn unmanaged_tx(&self, instance: u8, channel: u8) -> Result<()> {
        self.is_remote_ready(instance)?;
        self.with_instance(instance, |inst| {
            let chan = inst
                .channels
                .get(channel as usize)
                .and_then(|c| c.unmanaged())
                .ok_or_else(|| site::fail(Error::Inval))?;
            chan.check_integrity()?;
            chan.bump_tx();
            inst.hw.flush_cache_local();
            inst.hw.notify();
            Ok(())
        })
        .unwrap_or(Err(Error::Inval))
    }

    /// Service a polling-mode instance with the fair Rx algorithm.
    pub fn poll_channels(&self, instance: u8) -> Result<()> {
        let ready = self
            .with_instance(instance, |inst| {
                if inst.irq_mode {
                    return Err(site::fail(Error::Inval));
                }
                inst.hw.flush_cache_remote();
                if inst.remote_global().state.load(Ordering::Acquire) != SHM_STATE_READY {
                    return Err(Error::NotReady);
                }
                Ok(())
            })
            .unwrap_or(Err(Error::NotReady));
        ready?;
        self.rx(instance, SOFTIRQ_BUDGET);
        Ok(())
    }

    /// Fair Rx over all channels of one instance.
    ///
    /// Splits the remaining budget evenly (at least one message each),
    /// re-iterates while any channel used its whole share, flushing the
    /// remote cache window before every pass. Bounded starvation: a busy
    /// channel cannot block the others, and no channel exceeds its fair
    /// share within one pass.
    pub(crate) fn rx(&self, instance: u8, budget: u32) -> u32 {
        self.with_instance(instance, |inst| {
            let num_chans = inst.channels.len() as u32;
            if num_chans == 0 {
                return 0;
            }
            let win = inst.window();
            let mut work = 0u32;
            let mut more_work = true;
            while work < budget && more_work {
                let chan_budget = ((budget - work) / num_chans).max(1);
                more_work = false;
                inst.hw.flush_cache_remote();
                for chan in &inst.channels {
                    let chan_work = chan.rx(instance, chan_budget, &win);
                    work += chan_work;
                    if chan_work == chan_budget {
                        more_work = true;
                    }
                }
            }
            work
        })
        .unwrap_or(0)
    }

    /// Worker hook: unmask the inbound doorbell after a drain.
    pub(crate) fn reenable_rx_irq(&self, instance: u8) {
        let _ = self.with_instance(instance, |inst| inst.hw.irq_enable());
    }
}
