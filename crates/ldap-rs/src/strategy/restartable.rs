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

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::sync::SyncStrategy;
use super::{finish, Completed, Exchange, Strategy, StrategySettings};
use crate::config::RestartConfig;
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::locks::lock;
use crate::message::{LdapMessage, MessageId, OperationKind, ProtocolOp, Request};
use crate::outstanding::OutstandingRequest;
use crate::session::SessionState;

const REBIND_TIMEOUT: Duration = Duration::from_secs(30);

/// A synchronous connection that survives transport failures.
///
/// When sending or waiting fails with a restartable error the connection
/// is reopened, the last bind is replayed, and every request still
/// awaiting a response is transmitted again with its original message id
/// and bytes.
pub struct RestartableStrategy {
    inner: SyncStrategy,
    restart: RestartConfig,
    inflight: Mutex<HashMap<MessageId, OutstandingRequest>>,
    reconnects: AtomicUsize,
}

impl RestartableStrategy {
    pub fn new(settings: StrategySettings, restart: RestartConfig) -> Self {
        Self {
            inner: SyncStrategy::new(settings),
            restart,
            inflight: Mutex::new(HashMap::new()),
            reconnects: AtomicUsize::new(0),
        }
    }

    /// Reconnects performed over the lifetime of this strategy.
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    fn is_inflight(&self, id: MessageId) -> bool {
        lock(&self.inflight).contains_key(&id)
    }

    fn forget(&self, id: MessageId) {
        lock(&self.inflight).remove(&id);
    }

    /// Reconnect until the session is back or the retry budget runs out.
    fn recover(&self, used: &mut u32, cause: LdapError, skip_rebind: bool) -> Result<()> {
        let mut cause = cause;
        loop {
            if !self.restart.retries.allows(*used) {
                warn!(attempts = *used, error = %cause, "giving up on reconnecting");
                return Err(cause);
            }
            *used += 1;
            let attempt = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(
                endpoint = %self.inner.settings().endpoint,
                attempt,
                error = %cause,
                "connection lost, reconnecting"
            );
            std::thread::sleep(self.restart.interval());

            self.inner.close()?;
            match self.reestablish(skip_rebind) {
                Ok(()) => {
                    info!(endpoint = %self.inner.settings().endpoint, "connection restored");
                    return Ok(());
                }
                Err(err) if err.is_restartable() => cause = err,
                Err(err) => return Err(err),
            }
        }
    }

    fn reestablish(&self, skip_rebind: bool) -> Result<()> {
        self.inner.open()?;

        if !skip_rebind {
            if let Some(bind) = self.inner.last_bind() {
                let id = self.inner.send_raw(bind)?;
                let completed = self.inner.wait_raw(id, Some(REBIND_TIMEOUT))?;
                if let Some(code) = completed.bundle.result_code() {
                    if !code.is_success() {
                        return Err(LdapError::operation_failed(format!("rebind after reconnect failed: {code}")));
                    }
                }
                debug!("rebound after reconnect");
            }
        }

        // Requests answered before the connection dropped must not run twice
        let mut pending: Vec<OutstandingRequest> = lock(&self.inflight)
            .values()
            .filter(|entry| !self.inner.is_sealed(entry.message_id))
            .cloned()
            .collect();
        pending.sort_by_key(|entry| entry.message_id);
        for entry in &pending {
            debug!(message_id = %entry.message_id, op = entry.request.op.name(), "re-sending");
            self.inner.transmit(entry)?;
        }
        Ok(())
    }
}

impl Exchange for RestartableStrategy {
    fn settings(&self) -> &StrategySettings {
        self.inner.settings()
    }

    fn last_bind(&self) -> Option<Request> {
        self.inner.last_bind()
    }

    fn send_raw(&self, request: Request) -> Result<MessageId> {
        let entry = self.inner.stage(request)?;
        match &entry.request.op {
            ProtocolOp::AbandonRequest(target) => self.forget(*target),
            ProtocolOp::UnbindRequest => lock(&self.inflight).clear(),
            _ if entry.kind.expects_response() => {
                lock(&self.inflight).insert(entry.message_id, entry.clone());
            }
            _ => {}
        }

        let mut used = 0;
        let mut attempt = self.inner.transmit(&entry);
        loop {
            match attempt {
                Ok(()) => return Ok(entry.message_id),
                Err(err) if err.is_restartable() => {
                    if let Err(err) = self.recover(&mut used, err, entry.kind == OperationKind::Bind) {
                        self.forget(entry.message_id);
                        return Err(err);
                    }
                    if self.is_inflight(entry.message_id) {
                        // Re-sent with everything else during recovery
                        return Ok(entry.message_id);
                    }
                    attempt = self.inner.transmit(&entry);
                }
                Err(err) => {
                    self.forget(entry.message_id);
                    return Err(err);
                }
            }
        }
    }

    fn wait_raw(&self, id: MessageId, timeout: Option<Duration>) -> Result<Completed> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut used = 0;
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.inner.wait_raw(id, remaining) {
                Ok(completed) => {
                    self.forget(id);
                    return Ok(completed);
                }
                Err(LdapError::ResponseTimeout { .. }) => {
                    return Err(LdapError::ResponseTimeout {
                        message_id: id,
                        timeout: timeout.unwrap_or_default(),
                    });
                }
                Err(err)
                    if (err.is_restartable() || matches!(err, LdapError::NotConnected))
                        && self.is_inflight(id) =>
                {
                    let skip_rebind = lock(&self.inflight)
                        .get(&id)
                        .is_some_and(|entry| entry.kind == OperationKind::Bind);
                    if let Err(err) = self.recover(&mut used, err, skip_rebind) {
                        self.forget(id);
                        return Err(err);
                    }
                }
                Err(err) => {
                    self.forget(id);
                    return Err(err);
                }
            }
        }
    }
}

impl Strategy for RestartableStrategy {
    fn open(&self) -> Result<()> {
        self.inner.open()
    }

    fn close(&self) -> Result<()> {
        lock(&self.inflight).clear();
        self.inner.close()
    }

    fn session(&self) -> SessionState {
        self.inner.session()
    }

    fn send(&self, request: Request) -> Result<MessageId> {
        self.send_raw(request)
    }

    fn await_response(&self, id: MessageId, timeout: Option<Duration>) -> Result<ResponseBundle> {
        let completed = self.wait_raw(id, timeout)?;
        finish(self, completed, timeout, 0)
    }

    fn drain_unsolicited(&self) -> Vec<LdapMessage> {
        self.inner.drain_unsolicited()
    }
}
