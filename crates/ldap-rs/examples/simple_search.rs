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

//! Bind and run one subtree search.
//!
//! ```text
//! RUST_LOG=ldap_rs=debug cargo run -p ldap-rs --example simple_search -- \
//!     ldap://localhost:3389 dc=example,dc=org cn=admin,dc=example,dc=org adminpassword
//! ```
//!
//! Set `LDAP_STRATEGY` to `background`, `restartable` or `pooled` to try
//! the other delivery strategies.

use std::env;

use ldap_rs::referral::LdapUrl;
use ldap_rs::{ConnectionConfig, Filter, LdapConnection, SearchScope, StrategyKind};
use tracing_subscriber::EnvFilter;

fn strategy_from_env() -> StrategyKind {
    match env::var("LDAP_STRATEGY").as_deref() {
        Ok("background") => StrategyKind::Background,
        Ok("restartable") => StrategyKind::Restartable,
        Ok("pooled") => StrategyKind::Pooled,
        _ => StrategyKind::Sync,
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let url = LdapUrl::parse(args.first().map(String::as_str).unwrap_or("ldap://localhost"))?;
    let base = args.get(1).cloned().unwrap_or_default();

    let mut config = ConnectionConfig::for_host(url.host.clone()).with_strategy(strategy_from_env());
    config.server.port = Some(url.port);
    config.server.use_tls = url.use_tls;

    let connection = LdapConnection::new(config)?;
    connection.open()?;

    if let (Some(dn), Some(password)) = (args.get(2), args.get(3)) {
        let bind = connection.bind(dn.as_str(), password.as_str())?;
        let result = connection.get_response(bind, None)?;
        println!("bind: {}", result.result_code().map(|c| c.to_string()).unwrap_or_default());
    }

    let search = connection.search(base, SearchScope::WholeSubtree, Filter::present("objectClass"), ["cn", "mail"])?;
    let bundle = connection.get_response(search, None)?;
    for entry in bundle.entries() {
        println!("dn: {}", entry.dn);
        for attribute in &entry.attributes {
            for value in attribute.text_values() {
                println!("{}: {}", attribute.name, value);
            }
        }
        println!();
    }
    for reference in bundle.references() {
        println!("ref: {reference}");
    }
    if let Some(result) = bundle.result() {
        println!("result: {} {}", result.code, result.diagnostic_message);
    }

    connection.unbind()?;
    Ok(())
}
