// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Message stacking layer (framer).
//
// Outbound messages accumulate in a per-channel staging buffer and go out
// as one transport frame either on the 10 ms tick or when the buffer runs
// out of room. Frame format on the wire:
//
//   [CRC-enable 1B][ message_1 ][ message_2 ]...[ counter 2B BE ][ CRC16 2B BE ]
//
// The CRC covers everything up to and including the counter. The counter
// is 16-bit, starts at 1 and wraps around zero.

use crate::error::{site, Error, Result};
use crate::picc::heartbeat;
use crate::picc::protocol::{self, MsgHeader};
use crate::picc::trace::TraceBuffer;
use crate::picc::ShmTransport;

/// Stack flush period driven by the periodic tick.
pub const STACK_SEND_PERIOD_MS: u32 = 10;

/// CRC-enable flag values (byte 0 of every frame).
pub const STACK_CRC_ENABLED: u8 = 0x00;
pub const STACK_CRC_DISABLED: u8 = 0x01;

/// Maximum transport frame produced by the framer.
pub const STACK_MAX_FRAME: usize = 4100;
/// Frame overhead: CRC-enable flag + counter + CRC16.
pub const STACK_OVERHEAD: usize = 5;
/// Staging capacity: everything between the flag and the counter.
pub const STACK_PAYLOAD_MAX: usize = STACK_MAX_FRAME - STACK_OVERHEAD;

const COUNTER_SIZE: usize = 2;
const CRC_SIZE: usize = 2;

/// Configuration of one framer channel.
#[derive(Debug, Clone, Copy)]
pub struct StackConfig {
    pub instance: u8,
    pub channel: u8,
    pub crc_enabled: bool,
}

/// Classified inbound frame.
pub enum Frame<'a> {
    /// The fixed heartbeat request pattern.
    Ping,
    /// The fixed heartbeat reply pattern.
    Pong,
    /// Stacked protocol messages; iterate with [`MessageIter`].
    Messages(&'a [u8]),
}

/// Iterator over the stacked messages of a frame's inner region. Stops at
/// the first malformed header.
pub struct MessageIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> MessageIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = (MsgHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        if rest.is_empty() {
            return None;
        }
        let (header, payload) = protocol::unpack_message(rest).ok()?;
        self.offset += protocol::HEADER_SIZE + payload.len();
        Some((header, payload))
    }
}

// ---------------------------------------------------------------------------
// One framer channel
// ---------------------------------------------------------------------------

/// Per-channel framer state: the staging buffer and both counters.
pub struct StackChannel {
    config: StackConfig,
    staging: Vec<u8>,
    tx_counter: u16,
    /// Mirrored peer counter, diagnostics only.
    rx_counter: u16,
}

impl StackChannel {
    pub fn new(config: StackConfig) -> StackChannel {
        StackChannel {
            config,
            staging: Vec::with_capacity(STACK_PAYLOAD_MAX),
            tx_counter: 1,
            rx_counter: 0,
        }
    }

    pub fn config(&self) -> StackConfig {
        self.config
    }

    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    pub fn tx_counter(&self) -> u16 {
        self.tx_counter
    }

    pub fn rx_counter(&self) -> u16 {
        self.rx_counter
    }

    /// Append a message to the staging buffer, flushing first when it would
    /// not fit. A message that still cannot fit after a successful flush,
    /// or whose flush failed, is rejected and nothing is staged.
    pub fn add_message(
        &mut self,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        data: &[u8],
    ) -> Result<()> {
        if data.is_empty() || data.len() > STACK_PAYLOAD_MAX {
            return Err(site::fail(Error::Inval));
        }
        if self.staging.len() + data.len() > STACK_PAYLOAD_MAX {
            // Out of room: push the staged frame out first.
            self.do_send(t, trace).map_err(|_| Error::NoMem)?;
            if self.staging.len() + data.len() > STACK_PAYLOAD_MAX {
                // Flush was a silent no-op (peer not ready); the staged
                // bytes are preserved and this message has nowhere to go.
                return Err(Error::NoMem);
            }
        }
        self.staging.extend_from_slice(data);
        Ok(())
    }

    /// Send the staged bytes immediately instead of waiting for the tick.
    pub fn flush(&mut self, t: &dyn ShmTransport, trace: &mut TraceBuffer) -> Result<()> {
        self.do_send(t, trace)
    }

    /// Discard the staged bytes. Priority-message escape hatch.
    pub fn clear(&mut self) {
        self.staging.clear();
    }

    /// Build and transmit one frame from the staged bytes.
    ///
    /// A peer that is not READY yet is a silent success with the staged
    /// bytes preserved (normal during startup or peer restart). A missing
    /// transport buffer keeps the bytes for the next tick and reports
    /// `NoMem`.
    fn do_send(&mut self, t: &dyn ShmTransport, trace: &mut TraceBuffer) -> Result<()> {
        if t.is_remote_ready(self.config.instance).is_err() {
            return Ok(());
        }
        if self.staging.is_empty() {
            return Ok(());
        }

        let used = self.staging.len();
        let total = 1 + used + COUNTER_SIZE + CRC_SIZE;
        let Some(mut shm) = t.acquire_buf(self.config.instance, self.config.channel, total as u32)
        else {
            // All transport buffers in flight; retry next period.
            return Err(Error::NoMem);
        };

        {
            let frame = &mut shm.as_mut_slice()[..total];
            frame[0] = if self.config.crc_enabled {
                STACK_CRC_ENABLED
            } else {
                STACK_CRC_DISABLED
            };
            frame[1..1 + used].copy_from_slice(&self.staging);

            let counter_offset = 1 + used;
            frame[counter_offset..counter_offset + COUNTER_SIZE]
                .copy_from_slice(&self.tx_counter.to_be_bytes());

            let crc = protocol::crc16(&frame[..counter_offset + COUNTER_SIZE]);
            frame[counter_offset + COUNTER_SIZE..total].copy_from_slice(&crc.to_be_bytes());
        }

        trace.record_tx(self.config.channel, unsafe {
            std::slice::from_raw_parts(shm.as_ptr(), total)
        });

        if let Err(err) = t.tx(self.config.instance, self.config.channel, &shm, total as u32) {
            let _ = t.release_buf(self.config.instance, self.config.channel, shm.as_ptr());
            return Err(site::fail(err));
        }

        self.tx_counter = self.tx_counter.wrapping_add(1);
        if self.tx_counter == 0 {
            self.tx_counter = 1;
        }
        self.staging.clear();
        Ok(())
    }

    /// Validate and classify one received frame.
    ///
    /// Checks the minimum length and, when the CRC-enable flag says so, the
    /// frame CRC; stores the peer counter; short-circuits the two fixed
    /// heartbeat patterns so they never hit the header parser.
    pub fn parse_frame<'a>(
        &mut self,
        trace: &mut TraceBuffer,
        data: &'a [u8],
    ) -> Result<Frame<'a>> {
        if data.len() < STACK_OVERHEAD {
            return Err(site::fail(Error::Inval));
        }
        trace.record_rx(self.config.channel, data);

        let crc_flag = data[0];
        let counter_offset = data.len() - CRC_SIZE - COUNTER_SIZE;
        let rx_counter = u16::from_be_bytes([data[counter_offset], data[counter_offset + 1]]);
        let crc_received = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);

        if crc_flag == STACK_CRC_ENABLED {
            let crc_calculated = protocol::crc16(&data[..data.len() - CRC_SIZE]);
            if crc_received != crc_calculated {
                log::debug!(
                    "chan {}: frame dropped, crc {:#06x} != {:#06x}",
                    self.config.channel,
                    crc_received,
                    crc_calculated
                );
                return Err(site::fail(Error::Integrity));
            }
        }
        self.rx_counter = rx_counter;

        let inner = &data[1..counter_offset];
        if inner.len() == heartbeat::HEARTBEAT_MSG_SIZE {
            if heartbeat::is_ping(inner) {
                return Ok(Frame::Ping);
            }
            if heartbeat::is_pong(inner) {
                return Ok(Frame::Pong);
            }
        }
        Ok(Frame::Messages(inner))
    }
}

// ---------------------------------------------------------------------------
// The set of framer channels owned by one middleware context
// ---------------------------------------------------------------------------

/// All framer channels of a middleware context, keyed by (instance,
/// channel).
pub struct StackSet {
    channels: Vec<StackChannel>,
}

impl StackSet {
    pub fn new() -> StackSet {
        StackSet {
            channels: Vec::new(),
        }
    }

    pub fn init_channel(&mut self, config: StackConfig) -> Result<()> {
        if self.get_mut(config.instance, config.channel).is_some() {
            return Ok(());
        }
        self.channels.push(StackChannel::new(config));
        Ok(())
    }

    pub fn deinit_channel(&mut self, instance: u8, channel: u8) {
        self.channels
            .retain(|c| !(c.config.instance == instance && c.config.channel == channel));
    }

    pub fn get_mut(&mut self, instance: u8, channel: u8) -> Option<&mut StackChannel> {
        self.channels
            .iter_mut()
            .find(|c| c.config.instance == instance && c.config.channel == channel)
    }

    pub fn add_message(
        &mut self,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        instance: u8,
        channel: u8,
        data: &[u8],
    ) -> Result<()> {
        self.get_mut(instance, channel)
            .ok_or_else(|| site::fail(Error::Inval))?
            .add_message(t, trace, data)
    }

    pub fn flush(
        &mut self,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        self.get_mut(instance, channel)
            .ok_or_else(|| site::fail(Error::Inval))?
            .flush(t, trace)
    }

    pub fn clear(&mut self, instance: u8, channel: u8) {
        if let Some(chan) = self.get_mut(instance, channel) {
            chan.clear();
        }
    }

    /// Periodic pass: push every channel's staged bytes out.
    pub fn process(&mut self, t: &dyn ShmTransport, trace: &mut TraceBuffer) {
        for chan in &mut self.channels {
            let _ = chan.do_send(t, trace);
        }
    }
}

impl Default for StackSet {
    fn default() -> Self {
        Self::new()
    }
}
