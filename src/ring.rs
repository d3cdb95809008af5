// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Lock-free single-producer single-consumer dual-ring FIFO over shared
// memory.
//
// A queue owns two rings: the push ring lives in this peer's shared memory
// and the pop ring lives in the remote peer's. The rings are complementary:
//     local push_ring == remote pop_ring
//     local pop_ring  == remote push_ring
//
// Freedom from interference between the two memory domains comes from
// executing every store in local memory only. The read indexes of the two
// rings are swapped for that reason: a pop consumes elements of the remote
// ring by advancing the *local* push ring's read index, so even the read
// path never writes remote memory.
//
// Thread safety is lock-free SPSC: one sentinel slot is reserved between
// write and read so "full" and "empty" are unambiguous without a count.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{site, Error, Result};

/// Ring sentinel: initialization has started but is not complete.
pub const RING_INIT_IN_PROGRESS: u64 = 0x54494E4946435049;
/// Ring sentinel: ring is fully initialized and safe to use.
pub const RING_INIT_DONE: u64 = 0x474E495246435049;
/// Ring sentinel: cleared / never initialized.
pub const RING_CLEAR: u64 = 0;

/// Memory-mapped ring control header. Shared with the peer, so the scalars
/// are atomics: the write index is stored by the producer and observed by
/// the consumer, the read index the other way around.
#[repr(C)]
pub struct RingHdr {
    sentinel: AtomicU64,
    write: AtomicU32,
    read: AtomicU32,
    // `elem_num * elem_size` data bytes follow.
}

const _: () = assert!(std::mem::size_of::<RingHdr>() == 16);

/// Raw view of one ring at a fixed shared-memory address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingView {
    base: *mut u8,
}

impl RingView {
    pub fn new(base: *mut u8) -> Self {
        Self { base }
    }

    fn hdr(&self) -> &RingHdr {
        unsafe { &*(self.base as *const RingHdr) }
    }

    pub fn sentinel(&self) -> u64 {
        self.hdr().sentinel.load(Ordering::Acquire)
    }

    pub fn set_sentinel(&self, value: u64) {
        self.hdr().sentinel.store(value, Ordering::Release);
    }

    pub fn write_idx(&self) -> u32 {
        self.hdr().write.load(Ordering::Acquire)
    }

    pub fn set_write_idx(&self, value: u32) {
        self.hdr().write.store(value, Ordering::Release);
    }

    pub fn read_idx(&self) -> u32 {
        self.hdr().read.load(Ordering::Acquire)
    }

    pub fn set_read_idx(&self, value: u32) {
        self.hdr().read.store(value, Ordering::Release);
    }

    /// Pointer to element `idx` in the ring's data area.
    fn slot_ptr(&self, idx: u32, elem_size: u32) -> *mut u8 {
        unsafe {
            self.base
                .add(std::mem::size_of::<RingHdr>() + (idx * elem_size) as usize)
        }
    }
}

/// Queue classification: the index-resume rule on re-init differs between
/// the channel BD queue (starts empty) and a pool BD queue (kept full by
/// the populate step).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Channel,
    Pool,
}

/// Parameters for [`Queue::init`].
pub struct QueueConfig {
    /// Element size in bytes; nonzero multiple of 8.
    pub elem_size: u32,
    /// Number of usable elements; one sentinel slot is added internally.
    pub elem_num: u16,
    pub kind: QueueKind,
    /// Push ring address in local shared memory.
    pub push_addr: usize,
    /// Pop ring address in remote shared memory.
    pub pop_addr: usize,
}

/// Dual-ring shared-memory lock-free FIFO queue.
#[derive(Debug)]
pub struct Queue {
    elem_num: u16, // includes the sentinel slot
    elem_size: u32,
    push_ring: RingView,
    pop_ring: RingView,
}

// The views are raw pointers into shared memory. The SPSC contract (one
// pusher, one popper, peer touches only its own rings) is what makes the
// queue safe to share; the scalars behind the pointers are atomics.
unsafe impl Send for Queue {}
unsafe impl Sync for Queue {}

impl Queue {
    /// Initialize a queue and map its push/pop rings in memory.
    ///
    /// Adds one sentinel element to the configured size. If the remote ring
    /// is already initialized, the local indexes are adopted from the
    /// remote's view so no state is lost across a re-init; otherwise they
    /// are zeroed. The caller flips the sentinel to [`RING_INIT_DONE`] via
    /// [`Queue::mark_ready`] once the surrounding structure is fully built.
    pub fn init(cfg: QueueConfig) -> Result<Queue> {
        if cfg.push_addr == 0
            || cfg.pop_addr == 0
            || cfg.elem_num == 0
            || cfg.elem_size == 0
            || cfg.elem_size % 8 != 0
        {
            return Err(site::fail(Error::Inval));
        }
        let elem_num = cfg.elem_num.checked_add(1).ok_or(Error::Inval)?;

        let queue = Queue {
            elem_num,
            elem_size: cfg.elem_size,
            push_ring: RingView::new(cfg.push_addr as *mut u8),
            pop_ring: RingView::new(cfg.pop_addr as *mut u8),
        };
        queue.sync_index(cfg.kind)?;
        Ok(queue)
    }

    /// Synchronize the local ring indexes with the remote ring.
    fn sync_index(&self, kind: QueueKind) -> Result<()> {
        if self.pop_ring.sentinel() == RING_INIT_IN_PROGRESS {
            return Err(Error::RemoteInitInProgress);
        }
        self.push_ring.set_sentinel(RING_INIT_IN_PROGRESS);

        let n = self.elem_num as u32;
        if self.pop_ring.sentinel() == RING_INIT_DONE {
            // Use values from remote if it is already initialized.
            self.push_ring.set_write_idx(self.pop_ring.read_idx());
            let read = match kind {
                QueueKind::Channel => self.pop_ring.write_idx() % n,
                QueueKind::Pool => (self.pop_ring.write_idx() + 1) % n,
            };
            self.push_ring.set_read_idx(read);
        } else {
            self.push_ring.set_write_idx(0);
            self.push_ring.set_read_idx(0);
        }
        Ok(())
    }

    /// Flip the local push-ring sentinel to INIT_DONE.
    pub fn mark_ready(&self) {
        self.push_ring.set_sentinel(RING_INIT_DONE);
    }

    /// Push one element into the local push ring.
    ///
    /// `buf` must hold at least `elem_size` bytes. Both sentinels must read
    /// INIT_DONE; a cleared or corrupted sentinel reports `Integrity`
    /// before the full/empty distinction is even looked at.
    pub fn push(&self, buf: &[u8]) -> Result<()> {
        self.check_integrity()?;
        self.push_raw(buf)
    }

    /// Push without the sentinel validation. Used while building a queue,
    /// when the local sentinel still reads INIT_IN_PROGRESS (pool
    /// population precedes the sentinel flip).
    pub(crate) fn push_raw(&self, buf: &[u8]) -> Result<()> {
        if buf.len() < self.elem_size as usize {
            return Err(site::fail(Error::Inval));
        }
        let n = self.elem_num as u32;
        // Cache the indexes: the peer may store concurrently.
        let write = self.push_ring.write_idx();
        // Read indexes of push/pop rings are swapped (interference freedom).
        let read = self.pop_ring.read_idx();

        if read >= n || write >= n {
            return Err(site::fail(Error::Inval));
        }
        // Full when write + 1 == read, because of the sentinel slot.
        if (write + 1) % n == read {
            return Err(Error::NoMem);
        }

        let dst = self.push_ring.slot_ptr(write, self.elem_size);
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, self.elem_size as usize);
        }
        self.push_ring.set_write_idx((write + 1) % n);
        Ok(())
    }

    /// Pop one element from the remote pop ring into `buf`.
    ///
    /// The read cursor that advances is the *local* push ring's.
    pub fn pop(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < self.elem_size as usize {
            return Err(site::fail(Error::Inval));
        }
        let n = self.elem_num as u32;
        let write = self.pop_ring.write_idx();
        // Read indexes of push/pop rings are swapped (interference freedom).
        let read = self.push_ring.read_idx();

        if read >= n || write >= n {
            return Err(site::fail(Error::Inval));
        }
        self.check_integrity()?;
        if read == write {
            return Err(Error::NoQueue);
        }

        let src = self.pop_ring.slot_ptr(read, self.elem_size);
        unsafe {
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), self.elem_size as usize);
        }
        self.push_ring.set_read_idx((read + 1) % n);
        Ok(())
    }

    /// Both sentinels must read INIT_DONE.
    pub fn check_integrity(&self) -> Result<()> {
        if self.pop_ring.sentinel() == RING_INIT_DONE
            && self.push_ring.sentinel() == RING_INIT_DONE
        {
            Ok(())
        } else {
            Err(Error::Integrity)
        }
    }

    /// Clear the local push ring's sentinel and indexes. The remote ring is
    /// left untouched; its owner clears it.
    pub fn free(&self) {
        let s = self.push_ring.sentinel();
        if s == RING_INIT_DONE || s == RING_INIT_IN_PROGRESS {
            self.push_ring.set_sentinel(RING_CLEAR);
            self.push_ring.set_write_idx(0);
            self.push_ring.set_read_idx(0);
        }
    }

    /// Local mapped-memory footprint: ring control header + data bytes.
    pub fn mem_size(&self) -> u32 {
        std::mem::size_of::<RingHdr>() as u32 + (self.elem_num as u32) * self.elem_size
    }

    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    /// Element count including the sentinel slot.
    pub fn elem_num(&self) -> u16 {
        self.elem_num
    }

    pub(crate) fn push_sentinel(&self) -> u64 {
        self.push_ring.sentinel()
    }
}
