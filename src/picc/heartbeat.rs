// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Channel-health heartbeat, independent of the link state machine.
//
// Every HEARTBEAT_PERIOD_MS a PING goes out on each monitored channel and
// that channel's miss counter is bumped; a PONG from the peer resets it.
// When the counter reaches HEARTBEAT_TIMEOUT_COUNT the timeout callback
// fires and the counter restarts. A received PING is answered with a PONG
// flushed immediately, not deferred to the next tick.
//
// PING and PONG are fixed 9-byte patterns that carry no protocol header;
// the leading FF 00 marker keeps them from ever looking like one.

use crate::picc::stack::StackSet;
use crate::picc::trace::TraceBuffer;
use crate::picc::ShmTransport;

/// Heartbeat period.
pub const HEARTBEAT_PERIOD_MS: u32 = 2000;
/// Misses tolerated before the timeout callback fires.
pub const HEARTBEAT_TIMEOUT_COUNT: u8 = 3;
/// Fixed heartbeat message length.
pub const HEARTBEAT_MSG_SIZE: usize = 9;
/// Monitored channel slots.
pub const HEARTBEAT_MAX_CHANNELS: usize = 2;

const TICK_PERIOD_MS: u32 = 10;

pub const PING: [u8; HEARTBEAT_MSG_SIZE] =
    [0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0x00, 0x01, 0x00];
pub const PONG: [u8; HEARTBEAT_MSG_SIZE] =
    [0xFF, 0x00, 0xFF, 0x00, 0xFF, 0x00, 0x00, 0x01, 0x01];

/// Whether `data` is exactly the PING pattern.
pub fn is_ping(data: &[u8]) -> bool {
    data == PING
}

/// Whether `data` is exactly the PONG pattern.
pub fn is_pong(data: &[u8]) -> bool {
    data == PONG
}

struct HbContext {
    instance: u8,
    channel: u8,
    miss_count: u8,
}

/// Heartbeat state over all monitored channels.
pub(crate) struct Heartbeat {
    contexts: Vec<HbContext>,
    timer_counter: u32,
}

impl Heartbeat {
    pub fn new() -> Heartbeat {
        Heartbeat {
            contexts: Vec::new(),
            timer_counter: 0,
        }
    }

    /// Add a channel to monitoring. Idempotent.
    pub fn add_channel(&mut self, instance: u8, channel: u8) -> bool {
        if self.context_mut(instance, channel).is_some() {
            return true;
        }
        if self.contexts.len() >= HEARTBEAT_MAX_CHANNELS {
            return false;
        }
        self.contexts.push(HbContext {
            instance,
            channel,
            miss_count: 0,
        });
        true
    }

    fn context_mut(&mut self, instance: u8, channel: u8) -> Option<&mut HbContext> {
        self.contexts
            .iter_mut()
            .find(|c| c.instance == instance && c.channel == channel)
    }

    /// 10 ms tick. Every HEARTBEAT_PERIOD_MS: ping each channel, bump its
    /// miss counter, fire `timeout_cb` at the threshold and restart the
    /// counter.
    ///
    /// The counter bumps on the same tick the PING is sent, before the
    /// threshold check, so the effective tolerance is one round trip less
    /// than the count. The PONG reset makes this invisible in steady state.
    pub fn process(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        timeout_cb: &mut dyn FnMut(u8, u8),
    ) {
        self.timer_counter += 1;
        if self.timer_counter < HEARTBEAT_PERIOD_MS / TICK_PERIOD_MS {
            return;
        }
        self.timer_counter = 0;

        for ctx in &mut self.contexts {
            // Ping failures are normal while the peer is down.
            let _ = stacks.add_message(t, trace, ctx.instance, ctx.channel, &PING);

            ctx.miss_count += 1;
            if ctx.miss_count >= HEARTBEAT_TIMEOUT_COUNT {
                log::warn!(
                    "heartbeat timeout on instance {} channel {}",
                    ctx.instance,
                    ctx.channel
                );
                timeout_cb(ctx.instance, ctx.channel);
                ctx.miss_count = 0;
            }
        }
    }

    /// Reply to a received PING: stage a PONG and flush it out immediately.
    ///
    /// When the staging buffer is full and could not be drained, the stale
    /// content is dropped in favor of the PONG; heartbeat liveness outranks
    /// buffered traffic.
    pub fn handle_ping(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        instance: u8,
        channel: u8,
    ) {
        if stacks
            .add_message(t, trace, instance, channel, &PONG)
            .is_err()
        {
            stacks.clear(instance, channel);
            if stacks
                .add_message(t, trace, instance, channel, &PONG)
                .is_err()
            {
                return;
            }
        }
        let _ = stacks.flush(t, trace, instance, channel);
    }

    /// PONG received: the channel is alive.
    pub fn reset(&mut self, instance: u8, channel: u8) {
        if let Some(ctx) = self.context_mut(instance, channel) {
            ctx.miss_count = 0;
        }
    }

    pub fn miss_count(&self, instance: u8, channel: u8) -> u8 {
        self.contexts
            .iter()
            .find(|c| c.instance == instance && c.channel == channel)
            .map(|c| c.miss_count)
            .unwrap_or(0)
    }
}
