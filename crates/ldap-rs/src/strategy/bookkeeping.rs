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

//! Per-connection bookkeeping shared by the single-connection strategies.
//!
//! Owns the outstanding table, correlator and sealed responses, and
//! applies the session side effects of bind, StartTLS and unbind. It never
//! touches a socket; strategies move the bytes.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use super::Completed;
use crate::codec::encode_message;
use crate::correlator::{Correlator, CorrelatorEvent};
use crate::error::{LdapError, Result};
use crate::message::{LdapMessage, MessageId, OperationKind, ProtocolOp, Request, ResultCode};
use crate::outstanding::{MessageIdAllocator, OutstandingRequest, OutstandingTable};
use crate::session::SessionState;

#[derive(Debug)]
pub(crate) struct ConnectionCore {
    table: OutstandingTable,
    correlator: Correlator,
    ids: MessageIdAllocator,
    sealed: HashMap<MessageId, Completed>,
    /// Ids that were outstanding when the connection last went down
    lost: HashSet<MessageId>,
    session: SessionState,
    last_bind: Option<Request>,
    sasl_in_progress: bool,
    unsolicited: Vec<LdapMessage>,
    tls_upgrade_due: bool,
}

impl ConnectionCore {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            table: OutstandingTable::new(),
            correlator: Correlator::new(max_message_size),
            ids: MessageIdAllocator::new(),
            sealed: HashMap::new(),
            lost: HashSet::new(),
            session: SessionState::closed(),
            last_bind: None,
            sasl_in_progress: false,
            unsolicited: Vec::new(),
            tls_upgrade_due: false,
        }
    }

    pub fn session(&self) -> SessionState {
        self.session
    }

    pub fn last_bind(&self) -> Option<Request> {
        self.last_bind.clone()
    }

    pub fn mark_opened(&mut self, tls_active: bool) {
        self.session = SessionState::opened(tls_active);
        self.correlator.reset();
        self.lost.clear();
        self.sasl_in_progress = false;
        self.tls_upgrade_due = false;
    }

    /// Forget the connection. Returns the requests that were still waiting
    /// for a response; responses already sealed remain collectable.
    pub fn mark_closed(&mut self) -> Vec<OutstandingRequest> {
        self.session = SessionState::closed();
        self.correlator.reset();
        self.sasl_in_progress = false;
        self.tls_upgrade_due = false;
        let lost = self.table.clear();
        self.lost.extend(lost.iter().map(|entry| entry.message_id));
        lost
    }

    pub fn mark_tls_active(&mut self) {
        self.session.tls_active = true;
    }

    /// Number and encode `request`, checking it may be sent now.
    pub fn stage(&mut self, request: Request) -> Result<OutstandingRequest> {
        if !self.session.open {
            return Err(LdapError::NotConnected);
        }
        let kind = request
            .kind()
            .ok_or_else(|| LdapError::UnsupportedOperation(format!("{} is not a request", request.op.name())))?;
        if self.sasl_in_progress && kind != OperationKind::Bind {
            return Err(LdapError::SaslInProgress);
        }

        let message_id = self.ids.allocate(&self.table)?;
        let message = LdapMessage {
            message_id,
            op: request.op.clone(),
            controls: request.controls.clone(),
        };
        Ok(OutstandingRequest {
            message_id,
            kind,
            encoded: encode_message(&message),
            request,
        })
    }

    /// Record `entry` as transmitted. Unbind and abandon get no response
    /// and are never registered.
    pub fn track(&mut self, entry: &OutstandingRequest) -> Result<()> {
        match &entry.request.op {
            ProtocolOp::AbandonRequest(target) => {
                self.table.abandon(*target);
                self.correlator.forget(*target);
                self.sealed.remove(target);
                debug!(message_id = %target, "abandoned");
                return Ok(());
            }
            ProtocolOp::UnbindRequest => return Ok(()),
            ProtocolOp::BindRequest(bind) => {
                self.sasl_in_progress = bind.is_sasl();
                self.session.bound = false;
                self.last_bind = Some(entry.request.clone());
            }
            _ => {}
        }
        self.lost.remove(&entry.message_id);
        self.table.register(entry.clone())
    }

    /// Undo [`track`](Self::track) after a failed transmit.
    pub fn untrack(&mut self, id: MessageId) {
        self.table.remove(id);
    }

    /// Whether `id` may still produce a response.
    pub fn is_pending(&self, id: MessageId) -> bool {
        self.table.contains(id) || self.sealed.contains_key(&id)
    }

    /// Whether `id` was discarded because the connection went down.
    pub fn was_lost(&self, id: MessageId) -> bool {
        self.lost.contains(&id)
    }

    /// Whether the response to `id` has arrived and is waiting to be taken.
    pub fn is_sealed(&self, id: MessageId) -> bool {
        self.sealed.contains_key(&id)
    }

    pub fn has_outstanding(&self) -> bool {
        !self.table.is_empty()
    }

    pub fn take_sealed(&mut self, id: MessageId) -> Option<Completed> {
        self.sealed.remove(&id)
    }

    /// Feed received bytes through the correlator.
    ///
    /// Bundles sealed before a fatal error are kept; the error is returned
    /// and the caller must tear the connection down.
    pub fn absorb(&mut self, data: &[u8]) -> Result<()> {
        let mut terminated = None;
        for event in self.correlator.feed(data, &mut self.table) {
            match event {
                CorrelatorEvent::Sealed { request, bundle } => {
                    self.apply_side_effects(&request, bundle.result_code());
                    self.sealed
                        .insert(request.message_id, Completed { request, bundle });
                }
                CorrelatorEvent::Unsolicited(message) => self.unsolicited.push(message),
                CorrelatorEvent::Disconnected(notice) => {
                    let diagnostic = notice
                        .op
                        .result()
                        .map(|r| r.diagnostic_message.clone())
                        .unwrap_or_default();
                    self.unsolicited.push(notice);
                    // Responses behind the notice in this chunk are still kept
                    terminated.get_or_insert(LdapError::SessionTerminatedByServer { diagnostic });
                }
                CorrelatorEvent::Dropped(_) => {}
                CorrelatorEvent::Failed(err) => return Err(terminated.unwrap_or(err)),
            }
        }
        terminated.map_or(Ok(()), Err)
    }

    fn apply_side_effects(&mut self, request: &OutstandingRequest, code: Option<ResultCode>) {
        match request.kind {
            OperationKind::Bind => {
                self.sasl_in_progress = code == Some(ResultCode::SASL_BIND_IN_PROGRESS);
                self.session.bound = code == Some(ResultCode::SUCCESS);
                debug!(message_id = %request.message_id, bound = self.session.bound, "bind completed");
            }
            OperationKind::Extended if request.request.is_start_tls() => {
                if code == Some(ResultCode::SUCCESS) {
                    self.tls_upgrade_due = true;
                } else {
                    warn!(result = ?code, "server refused StartTLS");
                }
            }
            _ => {}
        }
    }

    /// Whether a StartTLS response just succeeded and the transport must
    /// be upgraded before anything else is read.
    pub fn take_tls_upgrade(&mut self) -> bool {
        std::mem::take(&mut self.tls_upgrade_due)
    }

    pub fn drain_unsolicited(&mut self) -> Vec<LdapMessage> {
        if !self.unsolicited.is_empty() {
            info!(count = self.unsolicited.len(), "handing over unsolicited notifications");
        }
        std::mem::take(&mut self.unsolicited)
    }
}
