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

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::bookkeeping::ConnectionCore;
use super::{finish, Completed, Exchange, Strategy, StrategySettings};
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::locks::lock;
use crate::message::{LdapMessage, MessageId, ProtocolOp, Request};
use crate::outstanding::OutstandingRequest;
use crate::session::SessionState;
use crate::transport::{ReadOutcome, Transport};

/// Reads the socket on the caller's thread, only while someone waits.
///
/// Responses for other ids that arrive during a wait are sealed and kept
/// for their own `await_response` call.
pub struct SyncStrategy {
    settings: StrategySettings,
    inner: Mutex<Inner>,
    hops: u32,
}

#[derive(Debug)]
struct Inner {
    core: ConnectionCore,
    transport: Option<Arc<dyn Transport>>,
}

impl Inner {
    fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        let lost = self.core.mark_closed();
        if !lost.is_empty() {
            debug!(count = lost.len(), "discarding outstanding requests");
        }
    }
}

impl SyncStrategy {
    pub fn new(settings: StrategySettings) -> Self {
        Self::chasing(settings, 0)
    }

    /// A strategy opened while following a referral `hops` deep.
    pub(crate) fn chasing(settings: StrategySettings, hops: u32) -> Self {
        let core = ConnectionCore::new(settings.max_message_size);
        Self {
            settings,
            inner: Mutex::new(Inner {
                core,
                transport: None,
            }),
            hops,
        }
    }

    pub fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    /// Assign an id and encode `request` without sending it.
    pub(crate) fn stage(&self, request: Request) -> Result<OutstandingRequest> {
        lock(&self.inner).core.stage(request)
    }

    /// Send a staged request. Re-transmitting the same entry after a
    /// reconnect puts identical bytes on the wire.
    pub(crate) fn transmit(&self, entry: &OutstandingRequest) -> Result<()> {
        let mut inner = lock(&self.inner);
        let transport = inner.transport.clone().ok_or(LdapError::NotConnected)?;
        inner.core.track(entry)?;

        if let Err(err) = transport.send(&entry.encoded) {
            warn!(message_id = %entry.message_id, error = %err, "send failed");
            inner.core.untrack(entry.message_id);
            inner.teardown();
            return Err(err.into());
        }
        debug!(
            message_id = %entry.message_id,
            op = entry.request.op.name(),
            bytes = entry.encoded.len(),
            "sent"
        );

        if matches!(entry.request.op, ProtocolOp::UnbindRequest) {
            inner.teardown();
            info!(endpoint = %self.settings.endpoint, "unbound");
        }
        Ok(())
    }

    /// Whether the response to `id` is already here, waiting for a caller.
    pub(crate) fn is_sealed(&self, id: MessageId) -> bool {
        lock(&self.inner).core.is_sealed(id)
    }

    fn read_until_sealed(&self, id: MessageId, timeout: Option<Duration>) -> Result<Completed> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = lock(&self.inner);

        loop {
            if let Some(completed) = inner.core.take_sealed(id) {
                return Ok(completed);
            }
            if !inner.core.is_pending(id) {
                return Err(if inner.core.was_lost(id) {
                    LdapError::NotConnected
                } else {
                    LdapError::NoSuchOperation(id)
                });
            }
            let transport = inner.transport.clone().ok_or(LdapError::NotConnected)?;

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LdapError::ResponseTimeout {
                            message_id: id,
                            timeout: timeout.unwrap_or_default(),
                        });
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            match transport.receive(self.settings.receive_buffer_size, wait) {
                Ok(ReadOutcome::Data(data)) => {
                    if let Err(err) = inner.core.absorb(&data) {
                        warn!(error = %err, "connection failed while reading responses");
                        inner.teardown();
                        // Responses sealed before the failure are still delivered
                        return inner.core.take_sealed(id).ok_or(err);
                    }
                    if inner.core.take_tls_upgrade() {
                        if let Err(err) = transport.start_tls() {
                            inner.teardown();
                            return Err(err.into());
                        }
                        inner.core.mark_tls_active();
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    info!(endpoint = %self.settings.endpoint, "server closed the connection");
                    inner.teardown();
                    return Err(LdapError::SessionTerminated(
                        "connection closed by server".to_string(),
                    ));
                }
                Ok(ReadOutcome::Idle) => {}
                Err(err) => {
                    inner.teardown();
                    return Err(err.into());
                }
            }
        }
    }
}

impl Exchange for SyncStrategy {
    fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    fn last_bind(&self) -> Option<Request> {
        lock(&self.inner).core.last_bind()
    }

    fn send_raw(&self, request: Request) -> Result<MessageId> {
        let entry = self.stage(request)?;
        self.transmit(&entry)?;
        Ok(entry.message_id)
    }

    fn wait_raw(&self, id: MessageId, timeout: Option<Duration>) -> Result<Completed> {
        self.read_until_sealed(id, timeout)
    }
}

impl Strategy for SyncStrategy {
    fn open(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.transport.is_some() {
            return Ok(());
        }
        let transport = self.settings.connector.connect(&self.settings.endpoint)?;
        inner.core.mark_opened(transport.is_tls());
        inner.transport = Some(transport);
        info!(endpoint = %self.settings.endpoint, "connected");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.transport.is_some() {
            inner.teardown();
            info!(endpoint = %self.settings.endpoint, "connection closed");
        }
        Ok(())
    }

    fn session(&self) -> SessionState {
        lock(&self.inner).core.session()
    }

    fn send(&self, request: Request) -> Result<MessageId> {
        self.send_raw(request)
    }

    fn await_response(&self, id: MessageId, timeout: Option<Duration>) -> Result<ResponseBundle> {
        let completed = self.read_until_sealed(id, timeout)?;
        finish(self, completed, timeout, self.hops)
    }

    fn drain_unsolicited(&self) -> Vec<LdapMessage> {
        lock(&self.inner).core.drain_unsolicited()
    }
}

impl Drop for SyncStrategy {
    fn drop(&mut self) {
        lock(&self.inner).teardown();
    }
}
