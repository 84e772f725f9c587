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

//! # LDAP Client
//!
//! An LDAP v3 client that splits the byte stream into BER messages,
//! correlates them with outstanding requests by message id, and hands
//! complete responses back through one of four delivery strategies.
//!
//! ## Example
//!
//! ```no_run
//! use ldap_rs::{ConnectionConfig, Filter, LdapConnection, SearchScope, StrategyKind};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ConnectionConfig::for_host("ldap.example.com")
//!         .with_strategy(StrategyKind::Background);
//!     let connection = LdapConnection::new(config)?;
//!     connection.open()?;
//!
//!     let bind = connection.bind("cn=admin,dc=example,dc=com", "secret")?;
//!     connection.get_response(bind, None)?;
//!
//!     let search = connection.search(
//!         "dc=example,dc=com",
//!         SearchScope::WholeSubtree,
//!         Filter::present("cn"),
//!         ["cn", "mail"],
//!     )?;
//!     for entry in connection.get_response(search, None)?.entries() {
//!         println!("{}", entry.dn);
//!     }
//!     connection.unbind()?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
mod connection;
pub mod correlator;
mod error;
pub mod framer;
mod locks;
pub mod message;
pub mod ops;
pub mod outstanding;
pub mod paged;
pub mod range;
pub mod referral;
mod session;
pub mod strategy;
mod tls;
pub mod transport;

#[cfg(test)]
mod mock;

pub use config::{ConnectionConfig, StrategyKind};
pub use connection::LdapConnection;
pub use correlator::ResponseBundle;
pub use error::{FramingError, LdapError, Result, TransportError};
pub use message::{
    Attribute, Control, Filter, LdapMessage, LdapResult, MessageId, Modification,
    ModifyOperation, ProtocolOp, Request, ResultCode, SearchEntry, SearchRequest, SearchScope,
};
pub use paged::PagedSearch;
pub use session::SessionState;
pub use strategy::Strategy;
