// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 intercore contributors
//
// Service dispatcher: Events, Methods, Responses and automatic ACKs.
//
// Inbound frames whose type is not LINK_AVAILABLE land here. Events fan
// out to every handler registered for the provider id; a Method request
// goes to the single handler owning the local provider id and, for the
// with-response flavor, its return code and bytes travel back under the
// same session id. ACKs are generated by the middleware before the
// handlers run and inbound ACKs are swallowed here.

use crate::error::{site, Error, Result};
use crate::picc::protocol::{
    pack_message, MsgHeader, MsgType, ReturnCode, HEADER_SIZE, MAX_PAYLOAD, SESSION_ID_MIN,
};
use crate::picc::stack::StackSet;
use crate::picc::trace::TraceBuffer;
use crate::picc::ShmTransport;

/// Event handler slots.
pub const MAX_EVENT_HANDLERS: usize = 8;
/// Method handler slots.
pub const MAX_METHOD_HANDLERS: usize = 8;

/// Flavor of an outbound method request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodType {
    WithResponse,
    NoReturnWithAck,
    NoReturnWithoutAck,
}

/// Event notification handler: `(provider_id, event_id, payload)`.
pub type EventCallback = Box<dyn FnMut(u8, u8, &[u8]) + Send>;

/// Method request handler: `(consumer_id, method_id, payload, response_out)`
/// returning the code forwarded to the peer.
pub type MethodCallback = Box<dyn FnMut(u8, u8, &[u8], &mut Vec<u8>) -> ReturnCode + Send>;

/// Method response handler:
/// `(provider_id, method_id, session_id, return_code, payload)`.
pub type ResponseCallback = Box<dyn FnMut(u8, u8, u8, u8, &[u8]) + Send>;

struct EventHandler {
    provider_id: u8,
    callback: EventCallback,
}

struct MethodHandler {
    local_provider_id: u8,
    callback: MethodCallback,
}

/// Handler registries plus the rolling session-id counter.
pub(crate) struct ServiceLayer {
    event_handlers: Vec<EventHandler>,
    method_handlers: Vec<MethodHandler>,
    response_cb: Option<ResponseCallback>,
    session_counter: u8,
    response_buf: Vec<u8>,
}

impl ServiceLayer {
    pub fn new() -> ServiceLayer {
        ServiceLayer {
            event_handlers: Vec::new(),
            method_handlers: Vec::new(),
            response_cb: None,
            session_counter: SESSION_ID_MIN,
            response_buf: Vec::new(),
        }
    }

    /// Next session id; cycles 0x01..=0xFF, skipping 0.
    fn next_session_id(&mut self) -> u8 {
        let id = self.session_counter;
        self.session_counter = self.session_counter.wrapping_add(1);
        if self.session_counter == 0 {
            self.session_counter = SESSION_ID_MIN;
        }
        id
    }

    pub fn register_event_handler(&mut self, provider_id: u8, callback: EventCallback) -> Result<()> {
        if self.event_handlers.len() >= MAX_EVENT_HANDLERS {
            return Err(site::fail(Error::NoMem));
        }
        self.event_handlers.push(EventHandler {
            provider_id,
            callback,
        });
        Ok(())
    }

    pub fn register_method_handler(
        &mut self,
        local_provider_id: u8,
        callback: MethodCallback,
    ) -> Result<()> {
        if self.method_handlers.len() >= MAX_METHOD_HANDLERS {
            return Err(site::fail(Error::NoMem));
        }
        self.method_handlers.push(MethodHandler {
            local_provider_id,
            callback,
        });
        Ok(())
    }

    pub fn register_response_handler(&mut self, callback: ResponseCallback) {
        self.response_cb = Some(callback);
    }

    /// Pack and stage one message.
    fn send_message(
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        payload: &[u8],
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
        let packed = pack_message(&mut buf, header, payload)?;
        stacks.add_message(t, trace, instance, channel, &buf[..packed])
    }

    /// Emit an ACK / EVENT_ACK mirroring the triggering header.
    fn send_ack(
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        msg_type: MsgType,
        request: &MsgHeader,
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        let header = MsgHeader {
            provider_id: request.provider_id,
            method_id: request.method_id,
            consumer_id: request.consumer_id,
            session_id: request.session_id,
            msg_type: msg_type as u8,
            return_code: ReturnCode::Ok as u8,
            length: 0,
        };
        Self::send_message(stacks, t, trace, &header, &[], instance, channel)
    }

    /// Send an Event notification. A session id is allocated only for the
    /// with-ACK flavor.
    #[allow(clippy::too_many_arguments)]
    pub fn send_event(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        provider_id: u8,
        event_id: u8,
        consumer_id: u8,
        data: &[u8],
        with_ack: bool,
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        let header = MsgHeader {
            provider_id,
            method_id: event_id,
            consumer_id,
            session_id: if with_ack { self.next_session_id() } else { 0 },
            msg_type: if with_ack {
                MsgType::NotificationWithAck as u8
            } else {
                MsgType::NotificationWithoutAck as u8
            },
            return_code: ReturnCode::Ok as u8,
            length: 0,
        };
        Self::send_message(stacks, t, trace, &header, data, instance, channel)
    }

    /// Send a Method request. Returns the session id used, or 0 when the
    /// message could not be staged.
    #[allow(clippy::too_many_arguments)]
    pub fn method_send(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        provider_id: u8,
        method_id: u8,
        data: &[u8],
        method_type: MethodType,
        instance: u8,
        channel: u8,
    ) -> u8 {
        let session_id = self.next_session_id();
        let header = MsgHeader {
            provider_id,
            method_id,
            consumer_id: 0,
            session_id,
            msg_type: match method_type {
                MethodType::WithResponse => MsgType::Request as u8,
                MethodType::NoReturnWithAck => MsgType::RequestNoReturnWithAck as u8,
                MethodType::NoReturnWithoutAck => MsgType::RequestNoReturnWithoutAck as u8,
            },
            return_code: ReturnCode::Ok as u8,
            length: 0,
        };
        match Self::send_message(stacks, t, trace, &header, data, instance, channel) {
            Ok(()) => session_id,
            Err(_) => 0,
        }
    }

    /// Send a Method response under an existing session id.
    #[allow(clippy::too_many_arguments)]
    pub fn response_send(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        consumer_id: u8,
        method_id: u8,
        session_id: u8,
        return_code: ReturnCode,
        data: &[u8],
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        let header = MsgHeader {
            provider_id: 0,
            method_id,
            consumer_id,
            session_id,
            msg_type: MsgType::Response as u8,
            return_code: return_code as u8,
            length: 0,
        };
        Self::send_message(stacks, t, trace, &header, data, instance, channel)
    }

    /// Route one received non-link message.
    #[allow(clippy::too_many_arguments)]
    pub fn process_message(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        payload: &[u8],
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        match MsgType::from_u8(header.msg_type) {
            Some(MsgType::NotificationWithAck) | Some(MsgType::NotificationWithoutAck) => {
                self.handle_event(stacks, t, trace, header, payload, instance, channel)
            }
            Some(MsgType::Request)
            | Some(MsgType::RequestNoReturnWithAck)
            | Some(MsgType::RequestNoReturnWithoutAck) => {
                self.handle_request(stacks, t, trace, header, payload, instance, channel)
            }
            Some(MsgType::Response) => {
                if let Some(cb) = self.response_cb.as_mut() {
                    cb(
                        header.provider_id,
                        header.method_id,
                        header.session_id,
                        header.return_code,
                        payload,
                    );
                }
                Ok(())
            }
            // ACKs terminate at the middleware.
            Some(MsgType::Ack) | Some(MsgType::EventAck) => Ok(()),
            _ => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_event(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        payload: &[u8],
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        if header.msg_type == MsgType::NotificationWithAck as u8 {
            let _ = Self::send_ack(stacks, t, trace, MsgType::EventAck, header, instance, channel);
        }
        for handler in &mut self.event_handlers {
            if handler.provider_id == header.provider_id {
                (handler.callback)(header.provider_id, header.method_id, payload);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_request(
        &mut self,
        stacks: &mut StackSet,
        t: &dyn ShmTransport,
        trace: &mut TraceBuffer,
        header: &MsgHeader,
        payload: &[u8],
        instance: u8,
        channel: u8,
    ) -> Result<()> {
        if header.msg_type == MsgType::RequestNoReturnWithAck as u8 {
            let _ = Self::send_ack(stacks, t, trace, MsgType::Ack, header, instance, channel);
        }

        let mut return_code = ReturnCode::Ok;
        self.response_buf.clear();
        for handler in &mut self.method_handlers {
            if handler.local_provider_id == header.provider_id {
                return_code = (handler.callback)(
                    header.consumer_id,
                    header.method_id,
                    payload,
                    &mut self.response_buf,
                );
                // Only one handler owns a provider id.
                break;
            }
        }
        self.response_buf.truncate(MAX_PAYLOAD);

        if header.msg_type == MsgType::Request as u8 {
            let rsp_header = MsgHeader {
                provider_id: header.provider_id,
                method_id: header.method_id,
                consumer_id: header.consumer_id,
                session_id: header.session_id,
                msg_type: MsgType::Response as u8,
                return_code: return_code as u8,
                length: 0,
            };
            Self::send_message(
                stacks,
                t,
                trace,
                &rsp_header,
                &self.response_buf,
                instance,
                channel,
            )?;
        }
        Ok(())
    }
}
