// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Deferred Rx worker: the softirq-task analogue of the RTOS port.
//
// The doorbell ISR path does the minimum — mask, clear, latch a
// per-instance "message received" flag, wake the worker — and the worker
// drains every flagged instance with the fair channel algorithm in
// budget-sized batches, then re-enables the doorbells and goes back to
// sleep. One worker serves all instances of a manager.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::instance::{ShmManager, MAX_INSTANCES};

/// Work budget per Rx batch, shared by the worker and the polling path.
pub const SOFTIRQ_BUDGET: u32 = 128;

struct WorkerState {
    pending: [bool; MAX_INSTANCES],
    shutdown: bool,
}

pub(crate) struct WorkerShared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

impl WorkerShared {
    /// ISR side: latch the per-instance flag and wake the worker.
    pub fn mark_pending(&self, instance: usize) {
        let mut st = self.state.lock().unwrap();
        if instance < MAX_INSTANCES {
            st.pending[instance] = true;
        }
        self.cond.notify_one();
    }

    fn request_shutdown(&self) {
        self.state.lock().unwrap().shutdown = true;
        self.cond.notify_one();
    }

    /// Worker side: sleep until any instance is pending, then take the
    /// whole flag set. Returns `None` on shutdown.
    fn take_pending(&self) -> Option<[bool; MAX_INSTANCES]> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.shutdown {
                return None;
            }
            if st.pending.iter().any(|&p| p) {
                let taken = st.pending;
                st.pending = [false; MAX_INSTANCES];
                return Some(taken);
            }
            st = self.cond.wait(st).unwrap();
        }
    }
}

pub(crate) struct RxWorker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl RxWorker {
    /// Spawn the deferred Rx worker for `mgr`.
    ///
    /// The worker holds only a weak reference: when the manager goes away
    /// the worker exits on its next wakeup.
    pub fn spawn(mgr: Weak<ShmManager>) -> RxWorker {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                pending: [false; MAX_INSTANCES],
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let shared2 = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("ipc-rx".into())
            .spawn(move || loop {
                let Some(pending) = shared2.take_pending() else {
                    return;
                };
                let Some(mgr) = mgr.upgrade() else {
                    return;
                };
                for (instance, &flagged) in pending.iter().enumerate() {
                    if !flagged {
                        continue;
                    }
                    // Drain in budget batches; a full batch means more work
                    // may be waiting.
                    loop {
                        let work = mgr.rx(instance as u8, SOFTIRQ_BUDGET);
                        if work < SOFTIRQ_BUDGET {
                            break;
                        }
                        std::thread::yield_now();
                    }
                }
                for (instance, &flagged) in pending.iter().enumerate() {
                    if flagged {
                        mgr.reenable_rx_irq(instance as u8);
                    }
                }
            })
            .expect("failed to spawn ipc-rx worker");
        RxWorker {
            shared,
            handle: Some(handle),
        }
    }

    pub fn shared(&self) -> Arc<WorkerShared> {
        Arc::clone(&self.shared)
    }

    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.handle.take() {
            // The final manager Arc may be dropped by the worker itself;
            // never join from that thread.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RxWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
