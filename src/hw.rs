// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Doorbell and cache bridge.
//
// The transport needs five things from the platform: ring the peer's
// doorbell, control the inbound doorbell (clear / enable / disable), and
// clean-and-invalidate the cache over the local or remote shared-memory
// window. On a real SoC this maps onto the inter-core interrupt controller
// and the cache maintenance primitives; on a host the doorbell is a signal
// line between two peers in one process and the cache flushes reduce to
// memory fences.

use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

/// Platform operations required by the transport, instance-scoped.
pub trait HwOps: Send + Sync {
    /// Ring the peer's doorbell: data is available.
    fn notify(&self);
    /// Clear the inbound-doorbell pending state.
    fn irq_clear(&self);
    /// Unmask the inbound doorbell.
    fn irq_enable(&self);
    /// Mask the inbound doorbell.
    fn irq_disable(&self);
    /// Clean-and-invalidate the cache over the local window. Must be issued
    /// after every shared-memory write, before ringing the doorbell.
    fn flush_cache_local(&self);
    /// Clean-and-invalidate the cache over the remote window. Must be
    /// issued before any read that depends on the peer's writes.
    fn flush_cache_remote(&self);
}

// ---------------------------------------------------------------------------
// Doorbell: the inbound interrupt line of one peer
// ---------------------------------------------------------------------------

type IsrHook = Arc<dyn Fn() + Send + Sync>;

struct DoorbellState {
    enabled: bool,
    pending: bool,
    isr: Option<IsrHook>,
}

/// One inter-core doorbell line.
///
/// `ring` models the peer-side trigger; the ISR hook (installed by the
/// deferred-Rx machinery) fires when the line is unmasked. A ring while
/// masked stays pending and fires on the next `irq_enable`, matching
/// level-triggered mailbox hardware. Firing auto-masks the line the way
/// the driver's hard-IRQ handler disables and clears before deferring.
#[derive(Clone)]
pub struct Doorbell {
    inner: Arc<Mutex<DoorbellState>>,
}

impl Doorbell {
    /// New doorbell, masked until the owning instance finishes init.
    pub fn new() -> Doorbell {
        Doorbell {
            inner: Arc::new(Mutex::new(DoorbellState {
                enabled: false,
                pending: false,
                isr: None,
            })),
        }
    }

    /// Ring the line. If unmasked, auto-mask, clear pending and fire the
    /// ISR hook; otherwise latch pending.
    pub fn ring(&self) {
        let isr = {
            let mut st = self.inner.lock().unwrap();
            if st.enabled {
                st.enabled = false;
                st.pending = false;
                st.isr.clone()
            } else {
                st.pending = true;
                None
            }
        };
        // Fire outside the lock; the hook may take other locks.
        if let Some(isr) = isr {
            isr();
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().pending = false;
    }

    /// Unmask; a latched pending ring fires immediately.
    pub fn enable(&self) {
        let isr = {
            let mut st = self.inner.lock().unwrap();
            st.enabled = true;
            if st.pending {
                st.enabled = false;
                st.pending = false;
                st.isr.clone()
            } else {
                None
            }
        };
        if let Some(isr) = isr {
            isr();
        }
    }

    pub fn disable(&self) {
        self.inner.lock().unwrap().enabled = false;
    }

    pub(crate) fn set_isr(&self, hook: IsrHook) {
        self.inner.lock().unwrap().isr = Some(hook);
    }
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Host implementations
// ---------------------------------------------------------------------------

/// No-op bridge for polling-mode instances on a cache-coherent host.
/// Cache flushes reduce to full fences.
pub struct NullHw;

impl HwOps for NullHw {
    fn notify(&self) {}
    fn irq_clear(&self) {}
    fn irq_enable(&self) {}
    fn irq_disable(&self) {}
    fn flush_cache_local(&self) {
        fence(Ordering::SeqCst);
    }
    fn flush_cache_remote(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Doorbell bridge between two peers in one process: `notify` rings the
/// peer's inbound line, the irq controls drive our own.
pub struct LoopbackHw {
    peer: Doorbell,
    local: Doorbell,
}

impl LoopbackHw {
    pub fn new(peer: Doorbell, local: Doorbell) -> LoopbackHw {
        LoopbackHw { peer, local }
    }

    /// Build a wired pair of bridges plus each side's inbound doorbell.
    pub fn pair() -> ((LoopbackHw, Doorbell), (LoopbackHw, Doorbell)) {
        let bell_a = Doorbell::new();
        let bell_b = Doorbell::new();
        let hw_a = LoopbackHw::new(bell_b.clone(), bell_a.clone());
        let hw_b = LoopbackHw::new(bell_a.clone(), bell_b.clone());
        ((hw_a, bell_a), (hw_b, bell_b))
    }
}

impl HwOps for LoopbackHw {
    fn notify(&self) {
        fence(Ordering::SeqCst);
        self.peer.ring();
    }
    fn irq_clear(&self) {
        self.local.clear();
    }
    fn irq_enable(&self) {
        self.local.enable();
    }
    fn irq_disable(&self) {
        self.local.disable();
    }
    fn flush_cache_local(&self) {
        fence(Ordering::SeqCst);
    }
    fn flush_cache_remote(&self) {
        fence(Ordering::SeqCst);
    }
}
