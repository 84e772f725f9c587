// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

//! Scripted in-memory network for unit tests.
//!
//! Every send is recorded and answered synchronously by a responder, so a
//! reply is already queued by the time the strategy reads. Tests can hold
//! replies and inject frames by hand, fail sends, or hang up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::codec::{decode_message, encode_message};
use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::locks::{lock, wait, wait_timeout};
use crate::message::{
    Attribute, BindResponse, ExtendedResponse, LdapMessage, LdapResult, MessageId,
    NOTICE_OF_DISCONNECTION_OID, OperationKind, ProtocolOp, ResultCode, SearchEntry,
};
use crate::strategy::StrategySettings;
use crate::transport::{Connector, Endpoint, ReadOutcome, Transport};

type Responder = Box<dyn FnMut(&Endpoint, &LdapMessage) -> Vec<LdapMessage> + Send>;

#[derive(Default)]
struct NetworkState {
    responder: Option<Responder>,
    held: bool,
    failing_sends: usize,
    sent: Vec<Vec<u8>>,
    hosts: Vec<String>,
    transports: Vec<Arc<MockTransport>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: Arc::clone(&self.state),
        })
    }

    pub fn settings(&self) -> StrategySettings {
        self.settings_for(&ConnectionConfig::for_host("mock"))
    }

    pub fn settings_for(&self, config: &ConnectionConfig) -> StrategySettings {
        StrategySettings::with_connector(config, self.connector())
    }

    pub fn respond<F>(&self, mut responder: F)
    where
        F: FnMut(&LdapMessage) -> Vec<LdapMessage> + Send + 'static,
    {
        self.respond_per_host(move |_, message| responder(message));
    }

    pub fn respond_per_host<F>(&self, responder: F)
    where
        F: FnMut(&Endpoint, &LdapMessage) -> Vec<LdapMessage> + Send + 'static,
    {
        lock(&self.state).responder = Some(Box::new(responder));
    }

    /// What a cooperative server answers when no responder is set.
    pub fn default_reply(message: &LdapMessage) -> Vec<LdapMessage> {
        let id = message.message_id;
        let op = match &message.op {
            ProtocolOp::BindRequest(_) => bind_ok(),
            ProtocolOp::SearchRequest(_) => done(ResultCode::SUCCESS),
            ProtocolOp::ExtendedRequest(request) => ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::success(),
                name: Some(request.name.clone()),
                value: None,
            }),
            ProtocolOp::CompareRequest(_) => result_op(OperationKind::Compare, ResultCode::COMPARE_TRUE),
            op => match op.request_kind() {
                Some(kind) if kind.expects_response() => result_op(kind, ResultCode::SUCCESS),
                _ => return Vec::new(),
            },
        };
        vec![LdapMessage::new(id, op)]
    }

    /// Record sends but answer nothing until `auto_reply`.
    pub fn hold_replies(&self) {
        lock(&self.state).held = true;
    }

    pub fn auto_reply(&self) {
        lock(&self.state).held = false;
    }

    /// The next `count` sends fail with a send error and reach nobody.
    pub fn fail_sends(&self, count: usize) {
        lock(&self.state).failing_sends = count;
    }

    /// Deliver one message on the newest connection.
    pub fn inject(&self, id: u32, op: ProtocolOp) {
        if let Some(transport) = self.last_transport() {
            transport.deliver(Delivery::Data(frame(id, op)));
        }
    }

    /// The server closes the newest connection.
    pub fn hang_up(&self) {
        if let Some(transport) = self.last_transport() {
            transport.deliver(Delivery::Eof);
        }
    }

    pub fn connects(&self) -> usize {
        lock(&self.state).hosts.len()
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        lock(&self.state).hosts.clone()
    }

    /// Every successful send, across connections, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        lock(&self.state).sent.clone()
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        lock(&self.state).transports.clone()
    }

    pub fn last_transport(&self) -> Option<Arc<MockTransport>> {
        lock(&self.state).transports.last().cloned()
    }
}

#[derive(Debug)]
struct MockConnector {
    state: Arc<Mutex<NetworkState>>,
}

impl std::fmt::Debug for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkState")
            .field("held", &self.held)
            .field("sent", &self.sent.len())
            .field("hosts", &self.hosts)
            .finish()
    }
}

impl Connector for MockConnector {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = Arc::new(MockTransport {
            endpoint: endpoint.clone(),
            network: Arc::downgrade(&self.state),
            inbox: Mutex::new(Inbox::default()),
            arrived: Condvar::new(),
            tls: AtomicBool::new(endpoint.use_tls),
        });
        let mut state = lock(&self.state);
        state.hosts.push(endpoint.host.clone());
        state.transports.push(Arc::clone(&transport));
        Ok(transport)
    }
}

enum Delivery {
    Data(Vec<u8>),
    Eof,
}

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Delivery>,
    eof: bool,
    closed: bool,
}

pub(crate) struct MockTransport {
    endpoint: Endpoint,
    network: Weak<Mutex<NetworkState>>,
    inbox: Mutex<Inbox>,
    arrived: Condvar,
    tls: AtomicBool,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MockTransport {
    pub fn is_closed(&self) -> bool {
        lock(&self.inbox).closed
    }

    fn deliver(&self, delivery: Delivery) {
        lock(&self.inbox).queue.push_back(delivery);
        self.arrived.notify_all();
    }

    /// Record `data` and work out the replies, or fail the send.
    fn exchange(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let Some(network) = self.network.upgrade() else {
            return Err(TransportError::Closed);
        };
        let mut state = lock(&network);
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(TransportError::Send(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "injected send failure",
            )));
        }
        state.sent.push(data.to_vec());
        if state.held {
            return Ok(Vec::new());
        }

        let Ok(message) = decode_message(data) else {
            return Ok(Vec::new());
        };
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&self.endpoint, &message),
            None => MockNetwork::default_reply(&message),
        };
        Ok(replies.iter().flat_map(encode_message).collect())
    }
}

impl Transport for MockTransport {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let replies = self.exchange(data)?;
        if !replies.is_empty() {
            self.deliver(Delivery::Data(replies));
        }
        Ok(())
    }

    fn receive(
        &self,
        max_bytes: usize,
        max_wait: Option<Duration>,
    ) -> Result<ReadOutcome, TransportError> {
        let deadline = max_wait.map(|max_wait| Instant::now() + max_wait);
        let mut inbox = lock(&self.inbox);
        loop {
            if inbox.closed {
                return Err(TransportError::Closed);
            }
            if inbox.eof {
                return Ok(ReadOutcome::Eof);
            }
            match inbox.queue.pop_front() {
                Some(Delivery::Data(mut data)) => {
                    let max_bytes = max_bytes.max(1);
                    if data.len() > max_bytes {
                        let rest = data.split_off(max_bytes);
                        inbox.queue.push_front(Delivery::Data(rest));
                    }
                    return Ok(ReadOutcome::Data(data));
                }
                Some(Delivery::Eof) => {
                    inbox.eof = true;
                    return Ok(ReadOutcome::Eof);
                }
                None => {}
            }
            inbox = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(ReadOutcome::Idle);
                    }
                    wait_timeout(&self.arrived, inbox, deadline - now)
                }
                None => wait(&self.arrived, inbox),
            };
        }
    }

    fn start_tls(&self) -> Result<(), TransportError> {
        if self.tls.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Tls {
                host: self.endpoint.host.clone(),
                message: "TLS is already active".to_string(),
            });
        }
        Ok(())
    }

    fn close(&self) {
        lock(&self.inbox).closed = true;
        self.arrived.notify_all();
    }

    fn is_tls(&self) -> bool {
        self.tls.load(Ordering::SeqCst)
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// One encoded message.
pub(crate) fn frame(id: u32, op: ProtocolOp) -> Vec<u8> {
    encode_message(&LdapMessage::new(MessageId::new(id), op))
}

pub(crate) fn bind_ok() -> ProtocolOp {
    ProtocolOp::BindResponse(BindResponse {
        result: LdapResult::success(),
        server_sasl_creds: None,
    })
}

pub(crate) fn sasl_in_progress() -> ProtocolOp {
    ProtocolOp::BindResponse(BindResponse {
        result: LdapResult::with_code(ResultCode::SASL_BIND_IN_PROGRESS, ""),
        server_sasl_creds: Some(b"challenge".to_vec()),
    })
}

pub(crate) fn done(code: ResultCode) -> ProtocolOp {
    ProtocolOp::SearchResultDone(LdapResult::with_code(code, ""))
}

pub(crate) fn entry(dn: &str, attributes: &[(&str, &[&str])]) -> ProtocolOp {
    ProtocolOp::SearchResultEntry(SearchEntry {
        dn: dn.to_string(),
        attributes: attributes
            .iter()
            .map(|(name, values)| Attribute::new(*name, values.iter().map(|v| v.as_bytes())))
            .collect(),
    })
}

pub(crate) fn reference(urls: &[&str]) -> ProtocolOp {
    ProtocolOp::SearchResultReference(urls.iter().map(|u| u.to_string()).collect())
}

pub(crate) fn extended_response(name: Option<&str>) -> ProtocolOp {
    ProtocolOp::ExtendedResponse(ExtendedResponse {
        result: LdapResult::success(),
        name: name.map(str::to_string),
        value: None,
    })
}

pub(crate) fn notice_of_disconnection() -> ProtocolOp {
    ProtocolOp::ExtendedResponse(ExtendedResponse {
        result: LdapResult::with_code(ResultCode::UNAVAILABLE, "server shutting down"),
        name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
        value: None,
    })
}

/// The response op answering `kind` with `code`.
pub(crate) fn result_op(kind: OperationKind, code: ResultCode) -> ProtocolOp {
    let result = LdapResult::with_code(code, "");
    match kind {
        OperationKind::Bind => ProtocolOp::BindResponse(BindResponse {
            result,
            server_sasl_creds: None,
        }),
        OperationKind::Search => ProtocolOp::SearchResultDone(result),
        OperationKind::Compare => ProtocolOp::CompareResponse(result),
        OperationKind::Add => ProtocolOp::AddResponse(result),
        OperationKind::Delete => ProtocolOp::DelResponse(result),
        OperationKind::Modify => ProtocolOp::ModifyResponse(result),
        OperationKind::ModifyDn => ProtocolOp::ModifyDnResponse(result),
        OperationKind::Extended => ProtocolOp::ExtendedResponse(ExtendedResponse {
            result,
            name: None,
            value: None,
        }),
        OperationKind::Unbind | OperationKind::Abandon => {
            unreachable!("{kind:?} has no response")
        }
    }
}
