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

//! A receiver thread owns the read side of the socket.
//!
//! Callers register a request and send it themselves, then block on a
//! condition variable until the receiver has sealed their bundle. Every
//! connection gets a fresh generation number so a receiver left over from
//! a previous connection never touches the current state.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::bookkeeping::ConnectionCore;
use super::{finish, Completed, Exchange, Strategy, StrategySettings};
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result, TransportError};
use crate::locks::{lock, wait, wait_timeout};
use crate::message::{LdapMessage, MessageId, ProtocolOp, Request};
use crate::session::SessionState;
use crate::transport::{ReadOutcome, Transport};

/// Why the receiver gave up, replayed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionFailure {
    ByServer(String),
    Lost(String),
}

impl SessionFailure {
    fn from_error(err: &LdapError) -> Self {
        match err {
            LdapError::SessionTerminatedByServer { diagnostic } => Self::ByServer(diagnostic.clone()),
            other => Self::Lost(other.to_string()),
        }
    }

    fn to_error(&self) -> LdapError {
        match self {
            Self::ByServer(diagnostic) => LdapError::SessionTerminatedByServer {
                diagnostic: diagnostic.clone(),
            },
            Self::Lost(reason) => LdapError::SessionTerminated(reason.clone()),
        }
    }
}

#[derive(Debug)]
struct State {
    core: ConnectionCore,
    transport: Option<Arc<dyn Transport>>,
    generation: u64,
    failure: Option<SessionFailure>,
}

impl State {
    fn fail(&mut self, failure: SessionFailure) {
        warn!(reason = ?failure, "background connection failed");
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        let lost = self.core.mark_closed();
        if !lost.is_empty() {
            debug!(count = lost.len(), "failing outstanding requests");
        }
        self.failure = Some(failure);
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    arrived: Condvar,
}

pub struct BackgroundStrategy {
    settings: StrategySettings,
    shared: Arc<Shared>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundStrategy {
    pub fn new(settings: StrategySettings) -> Self {
        let core = ConnectionCore::new(settings.max_message_size);
        Self {
            settings,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    core,
                    transport: None,
                    generation: 0,
                    failure: None,
                }),
                arrived: Condvar::new(),
            }),
            receiver: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared.state)
    }

    fn join_receiver(&self) {
        if let Some(handle) = lock(&self.receiver).take() {
            if handle.join().is_err() {
                error!("receiver thread panicked");
            }
        }
    }

    fn spawn_receiver(&self, transport: Arc<dyn Transport>, generation: u64) -> Result<JoinHandle<()>> {
        let shared = Arc::clone(&self.shared);
        let buffer_size = self.settings.receive_buffer_size;
        std::thread::Builder::new()
            .name(format!("ldap-receiver-{}", self.settings.endpoint.host))
            .spawn(move || receive_loop(&shared, transport.as_ref(), generation, buffer_size))
            .map_err(|err| TransportError::Runtime(err).into())
    }

    fn wait_sealed(&self, id: MessageId, timeout: Option<Duration>) -> Result<Completed> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state();
        loop {
            if let Some(completed) = state.core.take_sealed(id) {
                return Ok(completed);
            }
            if !state.core.is_pending(id) {
                if !state.core.was_lost(id) {
                    return Err(LdapError::NoSuchOperation(id));
                }
                return Err(match &state.failure {
                    Some(failure) => failure.to_error(),
                    None => LdapError::NotConnected,
                });
            }
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LdapError::ResponseTimeout {
                            message_id: id,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    wait_timeout(&self.shared.arrived, state, deadline - now)
                }
                None => wait(&self.shared.arrived, state),
            };
        }
    }
}

fn receive_loop(shared: &Shared, transport: &dyn Transport, generation: u64, buffer_size: usize) {
    debug!(generation, "receiver started");
    loop {
        let outcome = transport.receive(buffer_size, None);

        let mut state = lock(&shared.state);
        if state.generation != generation {
            debug!(generation, "receiver retired");
            return;
        }
        match outcome {
            Ok(ReadOutcome::Data(data)) => {
                if let Err(err) = state.core.absorb(&data) {
                    state.fail(SessionFailure::from_error(&err));
                    shared.arrived.notify_all();
                    return;
                }
                // Senders stay blocked on the state lock until the handshake is done
                if state.core.take_tls_upgrade() {
                    match transport.start_tls() {
                        Ok(()) => state.core.mark_tls_active(),
                        Err(err) => {
                            state.fail(SessionFailure::Lost(err.to_string()));
                            shared.arrived.notify_all();
                            return;
                        }
                    }
                }
                shared.arrived.notify_all();
            }
            Ok(ReadOutcome::Idle) => {}
            Ok(ReadOutcome::Eof) => {
                state.fail(SessionFailure::Lost("connection closed by server".to_string()));
                shared.arrived.notify_all();
                return;
            }
            Err(err) => {
                state.fail(SessionFailure::Lost(err.to_string()));
                shared.arrived.notify_all();
                return;
            }
        }
    }
}

impl Exchange for BackgroundStrategy {
    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn last_bind(&self) -> Option<Request> {
        self.state().core.last_bind()
    }

    fn send_raw(&self, request: Request) -> Result<MessageId> {
        let (entry, transport, generation) = {
            let mut state = self.state();
            let transport = state.transport.clone().ok_or(LdapError::NotConnected)?;
            let entry = state.core.stage(request)?;
            state.core.track(&entry)?;
            if matches!(entry.request.op, ProtocolOp::AbandonRequest(_)) {
                // Whoever waits on the abandoned id must see it is gone
                self.shared.arrived.notify_all();
            }
            (entry, transport, state.generation)
        };

        if let Err(err) = transport.send(&entry.encoded) {
            let mut state = self.state();
            if state.generation == generation {
                state.core.untrack(entry.message_id);
                state.fail(SessionFailure::Lost(err.to_string()));
                self.shared.arrived.notify_all();
            }
            return Err(err.into());
        }
        debug!(message_id = %entry.message_id, op = entry.request.op.name(), "sent");

        if matches!(entry.request.op, ProtocolOp::UnbindRequest) {
            self.close()?;
        }
        Ok(entry.message_id)
    }

    fn wait_raw(&self, id: MessageId, timeout: Option<Duration>) -> Result<Completed> {
        self.wait_sealed(id, timeout)
    }
}

impl Strategy for BackgroundStrategy {
    fn open(&self) -> Result<()> {
        if self.state().transport.is_some() {
            return Ok(());
        }
        // A receiver from an earlier, failed connection has already exited
        self.join_receiver();

        let transport = self.settings.connector.connect(&self.settings.endpoint)?;
        let mut state = self.state();
        state.generation += 1;
        state.core.mark_opened(transport.is_tls());
        state.failure = None;
        state.transport = Some(Arc::clone(&transport));

        match self.spawn_receiver(transport, state.generation) {
            Ok(handle) => {
                *lock(&self.receiver) = Some(handle);
                info!(endpoint = %self.settings.endpoint, "connected");
                Ok(())
            }
            Err(err) => {
                state.fail(SessionFailure::Lost(err.to_string()));
                Err(err)
            }
        }
    }

    fn close(&self) -> Result<()> {
        {
            let mut state = self.state();
            state.generation += 1;
            state.failure = None;
            if let Some(transport) = state.transport.take() {
                transport.close();
                state.core.mark_closed();
                info!(endpoint = %self.settings.endpoint, "connection closed");
            }
            self.shared.arrived.notify_all();
        }
        self.join_receiver();
        Ok(())
    }

    fn session(&self) -> SessionState {
        self.state().core.session()
    }

    fn send(&self, request: Request) -> Result<MessageId> {
        self.send_raw(request)
    }

    fn await_response(&self, id: MessageId, timeout: Option<Duration>) -> Result<ResponseBundle> {
        let completed = self.wait_sealed(id, timeout)?;
        finish(self, completed, timeout, 0)
    }

    fn drain_unsolicited(&self) -> Vec<LdapMessage> {
        self.state().core.drain_unsolicited()
    }
}

impl Drop for BackgroundStrategy {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
