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

//! Delivery strategies.
//!
//! Every strategy offers the same contract: [`Strategy::send`] hands back
//! a message id, [`Strategy::await_response`] blocks until the sealed
//! bundle for that id is available. They differ only in who reads the
//! socket and when.
//!
//! | strategy | reads on | notes |
//! |---|---|---|
//! | [`SyncStrategy`] | the caller's thread | one logical operation at a time |
//! | [`BackgroundStrategy`] | a receiver thread | callers block on a condition variable |
//! | [`RestartableStrategy`] | the caller's thread | reconnects and re-sends on failure |
//! | [`PooledStrategy`] | one thread per pooled connection | results keyed by a pool-wide sequence |

mod background;
mod bookkeeping;
mod pooled;
mod restartable;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

pub use background::BackgroundStrategy;
pub use pooled::PooledStrategy;
pub use restartable::RestartableStrategy;
pub use sync::SyncStrategy;

use crate::config::{ConnectionConfig, ReferralConfig};
use crate::correlator::ResponseBundle;
use crate::error::Result;
use crate::message::{LdapMessage, MessageId, OperationKind, Request};
use crate::outstanding::OutstandingRequest;
use crate::session::SessionState;
use crate::transport::{Connector, Endpoint, TcpConnector};
use crate::{ops, range, referral};

/// The contract shared by every delivery strategy.
pub trait Strategy: Send + Sync {
    fn open(&self) -> Result<()>;

    /// Close the connection. Outstanding requests are abandoned locally.
    fn close(&self) -> Result<()>;

    fn session(&self) -> SessionState;

    /// Transmit `request` and return the id its response will carry.
    ///
    /// Fails with `NotConnected` when closed and `SaslInProgress` when a
    /// SASL bind is underway and `request` is not a bind.
    fn send(&self, request: Request) -> Result<MessageId>;

    /// Block until the response to `id` is complete, `timeout` elapses, or
    /// the session ends. A timeout leaves `id` outstanding.
    fn await_response(&self, id: MessageId, timeout: Option<Duration>) -> Result<ResponseBundle>;

    /// Ask the server to abandon `id` and forget it locally. Late
    /// responses are dropped.
    fn abandon(&self, id: MessageId) -> Result<()> {
        self.send(ops::abandon(id)).map(|_| ())
    }

    /// Take the unsolicited notifications received so far.
    fn drain_unsolicited(&self) -> Vec<LdapMessage>;

    fn execute(&self, request: Request, timeout: Option<Duration>) -> Result<ResponseBundle> {
        let id = self.send(request)?;
        self.await_response(id, timeout)
    }
}

/// A sealed response together with the request it answers.
#[derive(Debug, Clone)]
pub struct Completed {
    pub request: OutstandingRequest,
    pub bundle: ResponseBundle,
}

/// Everything a strategy needs to reach the server.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub endpoint: Endpoint,
    pub connector: Arc<dyn Connector>,
    pub receive_buffer_size: usize,
    pub max_message_size: usize,
    pub referrals: ReferralConfig,
    pub auto_range: bool,
}

impl StrategySettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        let connector = TcpConnector::new(config.transport.clone(), config.tls.clone());
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: &ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint: config.server.endpoint(),
            connector,
            receive_buffer_size: config.transport.receive_buffer_size,
            max_message_size: config.transport.max_message_size,
            referrals: config.referrals.clone(),
            auto_range: config.search.auto_range,
        }
    }

    /// The same settings aimed at another server.
    pub(crate) fn for_endpoint(&self, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..self.clone()
        }
    }
}

/// Raw request/response exchange, before referral and range handling.
pub(crate) trait Exchange {
    fn settings(&self) -> &StrategySettings;

    /// The most recent bind request, replayed when rebinding elsewhere
    fn last_bind(&self) -> Option<Request>;

    fn send_raw(&self, request: Request) -> Result<MessageId>;

    fn wait_raw(&self, id: MessageId, timeout: Option<Duration>) -> Result<Completed>;
}

/// Apply referral chasing and range retrieval to a sealed response.
pub(crate) fn finish<E: Exchange + ?Sized>(
    exchange: &E,
    completed: Completed,
    timeout: Option<Duration>,
    hops: u32,
) -> Result<ResponseBundle> {
    let settings = exchange.settings();
    let Completed { request, bundle } = completed;
    let mut bundle = bundle;

    if settings.referrals.follow {
        let bind = exchange.last_bind();
        if bundle.is_referral() {
            bundle = referral::follow(settings, bind.as_ref(), &request.request, bundle, hops, timeout)?;
        } else if request.kind == OperationKind::Search && bundle.references().next().is_some() {
            bundle = referral::follow_continuations(
                settings,
                bind.as_ref(),
                &request.request,
                bundle,
                hops,
                timeout,
            )?;
        }
    }

    if settings.auto_range && request.kind == OperationKind::Search {
        bundle = range::resolve_ranges(bundle, |follow_up| {
            debug!(message_id = %request.message_id, "fetching next attribute range");
            let id = exchange.send_raw(follow_up)?;
            Ok(exchange.wait_raw(id, timeout)?.bundle)
        })?;
    }

    Ok(bundle)
}
