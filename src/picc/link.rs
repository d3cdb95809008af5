// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Link state machine: the application-level connection over a channel.
//
// A CLIENT starts CONNECTING and issues CONNECT requests from the periodic
// tick until the SERVER answers; the SERVER starts DISCONNECTED and only
// ever answers. DISCONNECT and RECONNECT notifications force the state
// back down; a CLIENT re-enters CONNECTING so the tick resumes retries.
// Send failures back off exponentially, capped.
//
// Only the primary channel of a link originates link PDUs; additional
// channels share the primary's state and carry data only.

use crate::error::{site, Error, Result};
use crate::picc::protocol::{
    LinkSubType, MediaType, MsgHeader, MsgType, ReturnCode, HEADER_SIZE, LINK_METHOD_ID,
};
use crate::picc::stack::StackSet;
use crate::picc::trace::TraceBuffer;
use crate::picc::ShmTransport;

/// Link channel slots.
pub const MAX_LINK_CHANNELS: usize = 4;

/// Backoff cap: 100 ticks (1000 ms).
pub const SEND_BACKOFF_MAX: u8 = 100;
/// First-failure backoff: 10 ticks (100 ms).
pub const SEND_BACKOFF_INCREMENT: u8 = 10;

/// Connection state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Which side of the link this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Link registration parameters.
#[derive(Debug, Clone, Copy)]
pub struct LinkConfig {
    pub local_id: u8,
    pub remote_id: u8,
    pub role: Role,
    pub instance: u8,
    pub channel: u8,
}

/// State-change notification: `(remote_id, new_state)`.
pub type LinkStateCallback = Box<dyn FnMut(u8, LinkState) + Send>;

/// Pure backoff policy: success clears, the first failure starts at the
/// base increment, every further failure doubles up to the cap.
pub fn next_backoff(prev: u8, ok: bool) -> u8 {
    if ok {
        0
    } else if prev == 0 {
        SEND_BACKOFF_INCREMENT
    } else {
        prev.saturating_mul(2).min(SEND_BACKOFF_MAX)
    }
}

struct LinkContext {
    config: LinkConfig,
    state: LinkState,
}

/// All link contexts of one middleware context.
pub(crate) struct LinkManager {
    contexts: Vec<LinkContext>,
    state_cb: Option<LinkStateCallback>,
    /// Connect-request flow control, shared by the (single) primary link.
    backoff: u8,
}

impl LinkManager {
    pub fn new() -> LinkManager {
        LinkManager {
            contexts: Vec::new(),
            state_cb: None,
            backoff: 0,
        }
    }

    /// Register the primary link. A CLIENT auto-starts CONNECTING so the
    /// tick begins issuing requests; a SERVER listens from DISCONNECTED.
    pub fn init(&mut self, config: LinkConfig) -> Result<()> {
        self.contexts.clear();
        let state = match config.role {
            Role::Client => LinkState::Connecting,
            Role::Server => LinkState::Disconnected,
        };
        self.contexts.push(LinkContext { config, state });
        self.backoff = 0;
        Ok(())
    }

    /// Attach an additional channel to the primary link. The channel shares
    /// the primary's ids and role but stays DISCONNECTED and never
    /// originates link PDUs.
    pub fn add_channel(&mut self, instance: u8, channel: u8) -> Result<()> {
        if self.context(instance, channel).is_some() {
            return Ok(());
        }
        let primary = self.contexts.first().ok_or_else(|| site::fail(Error::Inval))?;
        if self.contexts.len() >= MAX_LINK_CHANNELS {
            return Err(site::fail(Error::NoMem));
        }
        let mut config = primary.config;
        config.instance = instance;
        config.channel = channel;
        self.contexts.push(LinkContext {
            config,
            state: LinkState::Disconnected,
        });
        Ok(())
    }

    pub fn register_state_callback(&mut self, cb: LinkStateCallback) {
        self.state_cb = Some(cb);
    }

    fn context(&self, instance: u8, channel: u8) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.config.instance == instance && c.config.channel == channel)
    }

    /// State of the link on `channel`.
    pub fn state(&self, channel: u8) -> LinkState {
        self.contexts
            .iter()
            .find(|c| c.config.channel == channel)
            .map(|c| c.state)
            .unwrap_or(LinkState::Disconnected)
    }

    fn set_state(&mut self, idx: usize, new_state: LinkState) {
        let ctx = &mut self.contexts[idx];
        if ctx.state == new_state {
            return;
        }
        log::info!(
            "link {}->{} chan {}: {:?} -> {:?}",
            ctx.config.local_id,
            ctx.config.remote_id,
            ctx.config.channel,
            ctx.state,
            new_state
        );
        ctx.state = new_state;
        let remote_id = ctx.config.remote_id;
        if let Some(cb) = self.state_cb.as_mut() {
            cb(remote_id, new_state);
        }
    }

    /// Build and stage one link PDU.
    ///
    /// While the peer is not READY, connect *requests* are skipped — there
    /// is nobody to answer them — but responses and disconnects are still
    /// attempted so teardown state syncs.
    fn send_message(
        &self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        provider_id: u8,
        consumer_id: u8,
        sub_type: LinkSubType,
        return_code: ReturnCode,
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        if t.is_remote_ready(instance).is_err()
            && return_code != ReturnCode::Ok
            && sub_type == LinkSubType::Connect
        {
            return Err(Error::NotReady);
        }

        let header = MsgHeader {
            provider_id,
            method_id: LINK_METHOD_ID,
            consumer_id,
            session_id: 0,
            msg_type: MsgType::LinkAvailable as u8,
            return_code: return_code as u8,
            length: 0,
        };
        let payload = [
            sub_type as u8,
            consumer_id,
            MediaType::Ipcf as u8,
            provider_id,
        ];
        let mut buf = [0u8; HEADER_SIZE + 4];
        let packed = crate::picc::protocol::pack_message(&mut buf, &header, &payload)?;
        stacks.add_message(t, trace, instance, channel, &buf[..packed])
    }

    /// Periodic tick: re-issue CONNECT for every CLIENT link stuck in
    /// CONNECTING, under the backoff flow control.
    pub fn process(&mut self, stacks: &mut StackSet, t: &dyn ShmTransport, trace: &mut TraceBuffer) {
        for idx in 0..self.contexts.len() {
            let ctx = &self.contexts[idx];
            if ctx.config.role != Role::Client || ctx.state != LinkState::Connecting {
                continue;
            }
            if self.backoff > 0 {
                self.backoff -= 1;
                continue;
            }
            let result = self.send_message(
                stacks,
                t,
                trace,
                ctx.config.remote_id,
                ctx.config.local_id,
                LinkSubType::Connect,
                ReturnCode::NotOk,
                ctx.config.instance,
                ctx.config.channel,
            );
            self.backoff = next_backoff(self.backoff, result.is_ok());
        }
    }

    /// Explicit connect kick (CLIENT): force CONNECTING on every client
    /// link and issue a request right away.
    pub fn send_request(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
    ) -> Result<()> {
        let mut result = Ok(());
        for idx in 0..self.contexts.len() {
            if self.contexts[idx].config.role != Role::Client {
                continue;
            }
            self.set_state(idx, LinkState::Connecting);
            let cfg = self.contexts[idx].config;
            if self
                .send_message(
                    stacks,
                    t,
                    trace,
                    cfg.remote_id,
                    cfg.local_id,
                    LinkSubType::Connect,
                    ReturnCode::NotOk,
                    cfg.instance,
                    cfg.channel,
                )
                .is_err()
            {
                result = Err(Error::NotReady);
            }
        }
        result
    }

    /// Notify the peer of a local teardown on every link.
    pub fn send_disconnect(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
    ) -> Result<()> {
        let mut result = Ok(());
        for idx in 0..self.contexts.len() {
            let cfg = self.contexts[idx].config;
            let (provider, consumer) = match cfg.role {
                Role::Client => (cfg.remote_id, cfg.local_id),
                Role::Server => (cfg.local_id, cfg.remote_id),
            };
            if self
                .send_message(
                    stacks,
                    t,
                    trace,
                    provider,
                    consumer,
                    LinkSubType::Disconnect,
                    ReturnCode::NotOk,
                    cfg.instance,
                    cfg.channel,
                )
                .is_ok()
            {
                self.set_state(idx, LinkState::Disconnected);
            } else {
                site::record(Error::NotReady.code());
                result = Err(Error::NotReady);
            }
        }
        result
    }

    /// Heartbeat-timeout hook: a CLIENT re-enters CONNECTING to reconnect,
    /// a SERVER drops to DISCONNECTED and waits for the client.
    pub fn trigger_reconnect(&mut self, instance: u8, channel: u8) {
        if let Some(idx) = self.context(instance, channel) {
            let state = match self.contexts[idx].config.role {
                Role::Client => LinkState::Connecting,
                Role::Server => LinkState::Disconnected,
            };
            self.set_state(idx, state);
        }
    }

    /// Dispatch one received LINK_AVAILABLE message.
    pub fn handle_message(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        payload: &[u8],
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(site::fail(Error::Inval));
        }
        let Some(idx) = self.context(instance, channel) else {
            // No link registered on this channel; ignore.
            return Ok(());
        };
        let Some(sub_type) = LinkSubType::from_u8(payload[0]) else {
            return Ok(());
        };

        match sub_type {
            LinkSubType::Connect => match self.contexts[idx].config.role {
                Role::Server => self.handle_request(stacks, t, trace, header, idx),
                Role::Client => self.handle_response(header, payload, idx),
            },
            LinkSubType::Disconnect => {
                self.handle_disconnect(stacks, t, trace, header, idx);
                Ok(())
            }
            LinkSubType::Reconnect => {
                self.set_state(idx, LinkState::Disconnected);
                if self.contexts[idx].config.role == Role::Client {
                    self.set_state(idx, LinkState::Connecting);
                }
                Ok(())
            }
        }
    }

    /// SERVER side of the handshake: agree and go CONNECTED.
    fn handle_request(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        idx: usize,
    ) -> Result<()> {
        let cfg = self.contexts[idx].config;
        if cfg.local_id != header.provider_id || cfg.remote_id != header.consumer_id {
            return Ok(());
        }
        let sent = self.send_message(
            stacks,
            t,
            trace,
            cfg.local_id,
            header.consumer_id,
            LinkSubType::Connect,
            ReturnCode::Ok,
            cfg.instance,
            cfg.channel,
        );
        match sent {
            Ok(()) => {
                self.set_state(idx, LinkState::Connected);
                Ok(())
            }
            Err(err) => Err(site::fail(err)),
        }
    }

    /// CLIENT side of the handshake: the server's verdict arrives in the
    /// response's return code.
    fn handle_response(&mut self, header: &MsgHeader, payload: &[u8], idx: usize) -> Result<()> {
        let cfg = self.contexts[idx].config;
        if cfg.remote_id != header.provider_id || cfg.local_id != header.consumer_id {
            return Ok(());
        }
        if payload[0] == LinkSubType::Connect as u8 {
            if header.return_code == ReturnCode::Ok as u8 {
                self.set_state(idx, LinkState::Connected);
            } else {
                self.set_state(idx, LinkState::Disconnected);
            }
        }
        Ok(())
    }

    /// Either role: acknowledge the disconnect, then a CLIENT immediately
    /// re-enters CONNECTING. The two transitions both fire the state
    /// callback, signalling a discrete "dropped" event before the retry
    /// phase begins.
    fn handle_disconnect(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        idx: usize,
    ) {
        self.set_state(idx, LinkState::Disconnected);

        // The reply keeps the incoming provider/consumer ids: they identify
        // the pairing, not the packet direction.
        let cfg = self.contexts[idx].config;
        let _ = self.send_message(
            stacks,
            t,
            trace,
            header.provider_id,
            header.consumer_id,
            LinkSubType::Disconnect,
            ReturnCode::Ok,
            cfg.instance,
            cfg.channel,
        );

        if cfg.role == Role::Client {
            self.set_state(idx, LinkState::Connecting);
        }
    }
}
