// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// PICC facade: composes the framer, link state machine, heartbeat and
// service dispatcher behind one context.
//
// The application wires two entry points into its scheduling: the Rx path
// feeds every received transport buffer into `process_rx_data`, and a
// 10 ms periodic task calls `tick`, which runs the framer flush pass, the
// heartbeat period and the link connect retries in that order.

use std::sync::Arc;

use crate::error::{site, Error, Result};
use crate::picc::heartbeat::Heartbeat;
use crate::picc::link::{LinkConfig, LinkManager, LinkState, LinkStateCallback, Role};
use crate::picc::protocol::{MsgType, ReturnCode};
use crate::picc::service::{
    EventCallback, MethodCallback, MethodType, ResponseCallback, ServiceLayer,
};
use crate::picc::stack::{Frame, MessageIter, StackConfig, StackSet};
use crate::picc::trace::{TraceBuffer, TraceRecord};
use crate::picc::ShmTransport;

/// Heartbeat timeout notification: `(instance, channel)`.
pub type HeartbeatTimeoutCallback = Box<dyn FnMut(u8, u8) + Send>;

/// PICC context configuration: the primary link and framing options.
#[derive(Debug, Clone, Copy)]
pub struct PiccConfig {
    pub link_local_id: u8,
    pub link_remote_id: u8,
    pub link_role: Role,
    /// Transport instance the middleware runs on.
    pub instance: u8,
    /// Primary channel: the only one that originates link PDUs, and the
    /// only one whose heartbeat timeout moves the link state.
    pub channel: u8,
    pub crc_enabled: bool,
}

/// One PICC middleware context over a transport.
pub struct Picc {
    transport: Arc<dyn ShmTransport>,
    config: PiccConfig,
    stacks: StackSet,
    link: LinkManager,
    heartbeat: Heartbeat,
    service: ServiceLayer,
    trace: TraceBuffer,
    hb_timeout_cb: Option<HeartbeatTimeoutCallback>,
}

impl Picc {
    pub fn new(transport: Arc<dyn ShmTransport>, config: PiccConfig) -> Picc {
        Picc {
            transport,
            config,
            stacks: StackSet::new(),
            link: LinkManager::new(),
            heartbeat: Heartbeat::new(),
            service: ServiceLayer::new(),
            trace: TraceBuffer::new(),
            hb_timeout_cb: None,
        }
    }

    pub fn config(&self) -> PiccConfig {
        self.config
    }

    /// Channel-level init: framer staging plus heartbeat monitoring. The
    /// heartbeat runs from the first tick on, regardless of link state.
    pub fn init_channel(&mut self, instance: u8, channel: u8) -> Result<()> {
        self.stacks.init_channel(StackConfig {
            instance,
            channel,
            crc_enabled: self.config.crc_enabled,
        })?;
        if !self.heartbeat.add_channel(instance, channel) {
            return Err(site::fail(Error::NoMem));
        }
        Ok(())
    }

    /// Register the primary link from the stored config.
    pub fn link_register(&mut self) -> Result<()> {
        self.link.init(LinkConfig {
            local_id: self.config.link_local_id,
            remote_id: self.config.link_remote_id,
            role: self.config.link_role,
            instance: self.config.instance,
            channel: self.config.channel,
        })?;
        self.link
            .add_channel(self.config.instance, self.config.channel)
    }

    /// Attach an additional data channel to the primary link.
    pub fn link_add_channel(&mut self, instance: u8, channel: u8) -> Result<()> {
        self.link.add_channel(instance, channel)
    }

    /// Kick off the connect handshake (CLIENT role).
    pub fn start_connect(&mut self) -> Result<()> {
        let t = Arc::clone(&self.transport);
        self.link
            .send_request(&mut self.stacks, t.as_ref(), &mut self.trace)
    }

    /// Notify the peer of local teardown on every link channel.
    pub fn send_disconnect(&mut self) -> Result<()> {
        let t = Arc::clone(&self.transport);
        self.link
            .send_disconnect(&mut self.stacks, t.as_ref(), &mut self.trace)
    }

    pub fn register_link_state_callback(&mut self, cb: LinkStateCallback) {
        self.link.register_state_callback(cb);
    }

    pub fn register_heartbeat_timeout_callback(&mut self, cb: HeartbeatTimeoutCallback) {
        self.hb_timeout_cb = Some(cb);
    }

    pub fn register_event_handler(&mut self, provider_id: u8, cb: EventCallback) -> Result<()> {
        self.service.register_event_handler(provider_id, cb)
    }

    pub fn register_method_handler(
        &mut self,
        local_provider_id: u8,
        cb: MethodCallback,
    ) -> Result<()> {
        self.service.register_method_handler(local_provider_id, cb)
    }

    pub fn register_response_handler(&mut self, cb: ResponseCallback) {
        self.service.register_response_handler(cb);
    }

    /// Link state on `channel`.
    pub fn link_state(&self, channel: u8) -> LinkState {
        self.link.state(channel)
    }

    pub fn heartbeat_miss_count(&self, instance: u8, channel: u8) -> u8 {
        self.heartbeat.miss_count(instance, channel)
    }

    /// Send an Event notification on `channel` of the configured instance.
    pub fn send_event(
        &mut self,
        provider_id: u8,
        event_id: u8,
        consumer_id: u8,
        data: &[u8],
        with_ack: bool,
        channel: u8,
    ) -> Result<()> {
        let t = Arc::clone(&self.transport);
        self.service.send_event(
            &mut self.stacks,
            t.as_ref(),
            &mut self.trace,
            provider_id,
            event_id,
            consumer_id,
            data,
            with_ack,
            self.config.instance,
            channel,
        )
    }

    /// Send a Method request; only valid once the link is CONNECTED.
    /// Returns the session id used, or 0 on failure.
    pub fn method_request(
        &mut self,
        provider_id: u8,
        method_id: u8,
        data: &[u8],
        method_type: MethodType,
        channel: u8,
    ) -> u8 {
        if self.link.state(channel) != LinkState::Connected {
            return 0;
        }
        let t = Arc::clone(&self.transport);
        self.service.method_send(
            &mut self.stacks,
            t.as_ref(),
            &mut self.trace,
            provider_id,
            method_id,
            data,
            method_type,
            self.config.instance,
            channel,
        )
    }

    /// Send a Method response under an existing session.
    pub fn method_response(
        &mut self,
        consumer_id: u8,
        method_id: u8,
        session_id: u8,
        return_code: ReturnCode,
        data: &[u8],
        channel: u8,
    ) -> Result<()> {
        let t = Arc::clone(&self.transport);
        self.service.response_send(
            &mut self.stacks,
            t.as_ref(),
            &mut self.trace,
            consumer_id,
            method_id,
            session_id,
            return_code,
            data,
            self.config.instance,
            channel,
        )
    }

    /// Push one channel's staged bytes out immediately.
    pub fn flush_channel(&mut self, channel: u8) -> Result<()> {
        let t = Arc::clone(&self.transport);
        self.stacks
            .flush(t.as_ref(), &mut self.trace, self.config.instance, channel)
    }

    /// Feed one received transport buffer through the framer and dispatch
    /// its messages. Called from the application Rx path, never from the
    /// doorbell ISR.
    pub fn process_rx_data(&mut self, instance: u8, channel: u8, data: &[u8]) -> Result<()> {
        let t = Arc::clone(&self.transport);
        let t = t.as_ref();

        let frame = {
            let chan = self
                .stacks
                .get_mut(instance, channel)
                .ok_or_else(|| site::fail(Error::Inval))?;
            chan.parse_frame(&mut self.trace, data)?
        };

        match frame {
            Frame::Ping => {
                self.heartbeat
                    .handle_ping(&mut self.stacks, t, &mut self.trace, instance, channel);
            }
            Frame::Pong => {
                self.heartbeat.reset(instance, channel);
            }
            Frame::Messages(inner) => {
                for (header, payload) in MessageIter::new(inner) {
                    if header.msg_type == MsgType::LinkAvailable as u8 {
                        let _ = self.link.handle_message(
                            &mut self.stacks,
                            t,
                            &mut self.trace,
                            &header,
                            payload,
                            instance,
                            channel,
                        );
                    } else {
                        let _ = self.service.process_message(
                            &mut self.stacks,
                            t,
                            &mut self.trace,
                            &header,
                            payload,
                            instance,
                            channel,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// The single 10 ms periodic entry: framer flush pass, heartbeat
    /// period, link connect retries — in that order.
    pub fn tick(&mut self) {
        let t = Arc::clone(&self.transport);
        let t = t.as_ref();

        self.stacks.process(t, &mut self.trace);

        let primary_instance = self.config.instance;
        let primary_channel = self.config.channel;
        let link = &mut self.link;
        let hb_timeout_cb = &mut self.hb_timeout_cb;
        self.heartbeat.process(
            &mut self.stacks,
            t,
            &mut self.trace,
            &mut |instance, channel| {
                // Only the primary channel's timeout moves the link state;
                // secondary channels just report.
                if instance == primary_instance && channel == primary_channel {
                    link.trigger_reconnect(instance, channel);
                }
                if let Some(cb) = hb_timeout_cb.as_mut() {
                    cb(instance, channel);
                }
            },
        );

        self.link.process(&mut self.stacks, t, &mut self.trace);
    }

    /// Snapshot of the trace ring, oldest record first.
    pub fn trace_snapshot(&self) -> Vec<TraceRecord> {
        self.trace.snapshot()
    }

    pub fn clear_trace(&mut self) {
        self.trace.clear();
    }
}
