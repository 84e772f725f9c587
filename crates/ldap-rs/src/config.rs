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

//! Connection configuration.
//!
//! Every knob lives in [`ConnectionConfig`], which is handed to the
//! constructors. All sections default sensibly, so a host application can
//! deserialize a partial document from any serde format.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LdapError, Result};
use crate::transport::Endpoint;

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// Which delivery strategy a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Send and receive on the caller's thread
    #[default]
    Sync,
    /// A receiver thread correlates responses while callers wait
    Background,
    /// Synchronous, reconnecting and re-issuing on transport failures
    Restartable,
    /// A fixed set of background connections fed from one queue
    Pooled,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub tls: TlsConfig,
    pub restart: RestartConfig,
    pub pool: PoolConfig,
    pub referrals: ReferralConfig,
    pub search: SearchConfig,
    pub strategy: StrategyKind,
}

impl ConnectionConfig {
    /// Configuration for a plain LDAP server on its default port.
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            server: ServerConfig {
                host: host.into(),
                ..ServerConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(LdapError::Configuration("server.host is empty".into()));
        }
        if self.server.use_tls && self.server.start_tls {
            return Err(LdapError::Configuration(
                "server.use_tls and server.start_tls are mutually exclusive".into(),
            ));
        }
        if self.transport.receive_buffer_size == 0 {
            return Err(LdapError::Configuration(
                "transport.receive_buffer_size must be positive".into(),
            ));
        }
        if self.pool.size == 0 {
            return Err(LdapError::Configuration("pool.size must be positive".into()));
        }
        if self.referrals.follow && self.referrals.max_hops == 0 {
            return Err(LdapError::Configuration(
                "referrals.max_hops must be positive when following referrals".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Defaults to 389, or 636 with `use_tls`
    pub port: Option<u16>,
    /// LDAPS: TLS from the first byte
    pub use_tls: bool,
    /// Issue StartTLS right after opening
    pub start_tls: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            use_tls: false,
            start_tls: false,
        }
    }
}

impl ServerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_tls {
            DEFAULT_LDAPS_PORT
        } else {
            DEFAULT_LDAP_PORT
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port(), self.use_tls)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Largest chunk requested from the socket per receive
    pub receive_buffer_size: usize,
    /// Largest BER value length accepted from the server
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            receive_buffer_size: 4096,
            max_message_size: 64 * 1024 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Extra PEM bundle trusted in addition to the system roots
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate. Lab setups only.
    pub skip_verify: bool,
    /// SNI and verification name when it differs from the host
    pub server_name: Option<String>,
}

/// How many times a failed operation is re-issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retries {
    Finite(u32),
    Forever,
}

impl Default for Retries {
    fn default() -> Self {
        Retries::Finite(30)
    }
}

impl Retries {
    /// Whether another attempt is allowed after `used` retries.
    pub fn allows(self, used: u32) -> bool {
        match self {
            Retries::Finite(limit) => used < limit,
            Retries::Forever => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub retries: Retries,
    /// Pause between reconnect attempts
    pub interval_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            retries: Retries::default(),
            interval_ms: 2_000,
        }
    }
}

impl RestartConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size: usize,
    /// How long a worker waits for one operation's response
    pub operation_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            operation_timeout_ms: 120_000,
        }
    }
}

impl PoolConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// A host referrals may be followed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralHost {
    /// Host name, or `*` for any host
    pub host: String,
    /// Send the current bind credentials; otherwise bind anonymously
    #[serde(default = "default_true")]
    pub allow_auth: bool,
}

impl ReferralHost {
    pub fn new(host: impl Into<String>, allow_auth: bool) -> Self {
        Self {
            host: host.into(),
            allow_auth,
        }
    }

    pub fn matches(&self, host: &str) -> bool {
        self.host == "*" || self.host.eq_ignore_ascii_case(host)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    pub follow: bool,
    pub hosts: Vec<ReferralHost>,
    /// Longest chain of referrals followed for one operation
    pub max_hops: u32,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            follow: true,
            hosts: vec![ReferralHost::new("*", true)],
            max_hops: 5,
        }
    }
}

impl ReferralConfig {
    /// The first allow-list entry matching `host`
    pub fn lookup(&self, host: &str) -> Option<&ReferralHost> {
        self.hosts.iter().find(|h| h.matches(host))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Fetch the remaining fragments of ranged attributes
    pub auto_range: bool,
    /// Default wait for a response when the caller gives none
    pub response_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            auto_range: true,
            response_timeout_ms: 30_000,
        }
    }
}

impl SearchConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
