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

//! LDAP client connection and operations

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ConnectionConfig, StrategyKind};
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::message::{
    Attribute, Filter, LdapMessage, MessageId, Modification, Request, SearchRequest, SearchScope,
};
use crate::ops;
use crate::paged::PagedSearch;
use crate::session::SessionState;
use crate::strategy::{
    BackgroundStrategy, PooledStrategy, RestartableStrategy, Strategy, StrategySettings,
    SyncStrategy,
};
use crate::transport::Connector;

/// Main LDAP client.
///
/// Every operation method transmits its request and returns the message id
/// handle; [`LdapConnection::get_response`] collects the result. Which
/// thread reads the socket depends on the configured [`StrategyKind`].
pub struct LdapConnection {
    config: ConnectionConfig,
    strategy: Box<dyn Strategy>,
}

impl std::fmt::Debug for LdapConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConnection")
            .field("endpoint", &self.config.server.endpoint())
            .field("strategy", &self.config.strategy)
            .field("session", &self.strategy.session())
            .finish()
    }
}

impl LdapConnection {
    /// Build an unopened connection over TCP, or TLS for LDAPS.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let settings = StrategySettings::from_config(&config);
        Ok(Self::build(config, settings))
    }

    /// Build an unopened connection that reaches servers through `connector`.
    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let settings = StrategySettings::with_connector(&config, connector);
        Ok(Self::build(config, settings))
    }

    fn build(config: ConnectionConfig, settings: StrategySettings) -> Self {
        let strategy: Box<dyn Strategy> = match config.strategy {
            StrategyKind::Sync => Box::new(SyncStrategy::new(settings)),
            StrategyKind::Background => Box::new(BackgroundStrategy::new(settings)),
            StrategyKind::Restartable => {
                Box::new(RestartableStrategy::new(settings, config.restart.clone()))
            }
            StrategyKind::Pooled => Box::new(PooledStrategy::new(settings, config.pool.clone())),
        };
        Self { config, strategy }
    }

    /// Connect, then negotiate StartTLS when `server.start_tls` is set.
    pub fn open(&self) -> Result<()> {
        self.strategy.open()?;
        if !self.config.server.start_tls || self.strategy.session().tls_active {
            return Ok(());
        }

        let bundle = self
            .strategy
            .execute(ops::start_tls(), Some(self.config.search.response_timeout()))?;
        match bundle.result_code() {
            Some(code) if !code.is_success() => {
                warn!(code = %code, "server refused StartTLS");
                self.strategy.close()?;
                Err(LdapError::protocol(format!("StartTLS refused: {code}")))
            }
            _ => Ok(()),
        }
    }

    pub fn close(&self) -> Result<()> {
        self.strategy.close()
    }

    pub fn send(&self, request: Request) -> Result<MessageId> {
        let id = self.strategy.send(request)?;
        debug!(message_id = %id, "request queued");
        Ok(id)
    }

    pub fn bind(&self, dn: impl Into<String>, password: impl Into<String>) -> Result<MessageId> {
        self.send(ops::bind_simple(dn, password))
    }

    /// One step of a SASL exchange. Repeat with the server's challenge
    /// until the bind no longer answers `saslBindInProgress`.
    pub fn sasl_bind(
        &self,
        dn: impl Into<String>,
        mechanism: impl Into<String>,
        credentials: Option<Vec<u8>>,
    ) -> Result<MessageId> {
        self.send(ops::bind_sasl(dn, mechanism, credentials))
    }

    pub fn start_tls(&self) -> Result<MessageId> {
        self.send(ops::start_tls())
    }

    pub fn search<I, S>(
        &self,
        base: impl Into<String>,
        scope: SearchScope,
        filter: Filter,
        attributes: I,
    ) -> Result<MessageId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.send(ops::search(base, scope, filter, attributes))
    }

    /// Search with every field of the request under the caller's control
    pub fn search_with(&self, request: SearchRequest) -> Result<MessageId> {
        self.send(ops::search_with(request))
    }

    pub fn add(&self, dn: impl Into<String>, attributes: Vec<Attribute>) -> Result<MessageId> {
        self.send(ops::add(dn, attributes))
    }

    pub fn delete(&self, dn: impl Into<String>) -> Result<MessageId> {
        self.send(ops::delete(dn))
    }

    pub fn modify(&self, dn: impl Into<String>, changes: Vec<Modification>) -> Result<MessageId> {
        self.send(ops::modify(dn, changes))
    }

    pub fn modify_dn(
        &self,
        dn: impl Into<String>,
        new_rdn: impl Into<String>,
        delete_old_rdn: bool,
        new_superior: Option<String>,
    ) -> Result<MessageId> {
        self.send(ops::modify_dn(dn, new_rdn, delete_old_rdn, new_superior))
    }

    pub fn compare(
        &self,
        dn: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Result<MessageId> {
        self.send(ops::compare(dn, attribute, value))
    }

    pub fn extended(&self, name: impl Into<String>, value: Option<Vec<u8>>) -> Result<MessageId> {
        self.send(ops::extended(name, value))
    }

    /// Send an unbind. The connection closes right after; the returned
    /// handle never has a response.
    pub fn unbind(&self) -> Result<MessageId> {
        self.send(ops::unbind())
    }

    /// Abandon the operation behind `id`. Its late responses are dropped,
    /// and the returned handle, like an unbind's, has no response.
    pub fn abandon(&self, id: MessageId) -> Result<MessageId> {
        self.send(ops::abandon(id))
    }

    /// Wait for the complete response to `id`.
    ///
    /// Without a `timeout`, waits for `search.response_timeout_ms`.
    pub fn get_response(&self, id: MessageId, timeout: Option<Duration>) -> Result<ResponseBundle> {
        let timeout = timeout.unwrap_or_else(|| self.config.search.response_timeout());
        self.strategy.await_response(id, Some(timeout))
    }

    /// Send `request` and wait for its response.
    pub fn execute(&self, request: Request) -> Result<ResponseBundle> {
        let id = self.send(request)?;
        self.get_response(id, None)
    }

    /// Iterate `search` in pages of `page_size` entries.
    pub fn paged_search(&self, search: SearchRequest, page_size: u32) -> PagedSearch<'_> {
        PagedSearch::new(self.strategy.as_ref(), search, page_size)
            .with_timeout(Some(self.config.search.response_timeout()))
    }

    pub fn session(&self) -> SessionState {
        self.strategy.session()
    }

    /// Take the unsolicited notifications received so far.
    pub fn unsolicited(&self) -> Vec<LdapMessage> {
        self.strategy.drain_unsolicited()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn strategy(&self) -> &dyn Strategy {
        self.strategy.as_ref()
    }
}
