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

//! Referral chasing.
//!
//! A referral result, or a continuation reference inside a search, is
//! followed on a short-lived synchronous connection to a host from the
//! allow-list. The secondary connection is closed on every exit path.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ReferralConfig, DEFAULT_LDAPS_PORT, DEFAULT_LDAP_PORT};
use crate::correlator::ResponseBundle;
use crate::error::{LdapError, Result};
use crate::message::{OperationKind, ProtocolOp, Request, SearchScope};
use crate::ops;
use crate::strategy::{Strategy, StrategySettings, SyncStrategy};
use crate::transport::Endpoint;

/// The parts of an RFC 4516 LDAP URL used to redirect an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub use_tls: bool,
    pub host: String,
    pub port: u16,
    pub dn: Option<String>,
    pub attributes: Vec<String>,
    pub scope: Option<SearchScope>,
    /// Filter in its string form, percent-decoded but not parsed
    pub filter: Option<String>,
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| LdapError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (use_tls, rest) = match url.split_once("://") {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("ldap") => (false, rest),
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("ldaps") => (true, rest),
            Some(_) => return Err(invalid("unsupported scheme")),
            None => return Err(invalid("missing scheme")),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, Some(path)),
            None => (rest, None),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after {
                "" => None,
                other => Some(other.strip_prefix(':').ok_or_else(|| invalid("junk after IPv6 address"))?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None if use_tls => DEFAULT_LDAPS_PORT,
            None => DEFAULT_LDAP_PORT,
        };

        let mut parsed = LdapUrl {
            use_tls,
            host: host.to_string(),
            port,
            dn: None,
            attributes: Vec::new(),
            scope: None,
            filter: None,
        };
        let Some(path) = path else {
            return Ok(parsed);
        };

        // dn ? attributes ? scope ? filter ? extensions
        let mut parts = path.splitn(5, '?');
        if let Some(dn) = parts.next().filter(|dn| !dn.is_empty()) {
            parsed.dn = Some(percent_decode(dn).ok_or_else(|| invalid("bad percent escape in dn"))?);
        }
        if let Some(attributes) = parts.next().filter(|a| !a.is_empty()) {
            parsed.attributes = attributes
                .split(',')
                .filter(|a| !a.is_empty())
                .map(|a| percent_decode(a).ok_or_else(|| invalid("bad percent escape in attributes")))
                .collect::<Result<_>>()?;
        }
        parsed.scope = match parts.next().map(str::to_ascii_lowercase).as_deref() {
            None | Some("") => None,
            Some("base") => Some(SearchScope::BaseObject),
            Some("one") => Some(SearchScope::SingleLevel),
            Some("sub") => Some(SearchScope::WholeSubtree),
            Some(_) => return Err(invalid("unknown scope")),
        };
        if let Some(filter) = parts.next().filter(|f| !f.is_empty()) {
            parsed.filter = Some(percent_decode(filter).ok_or_else(|| invalid("bad percent escape in filter"))?);
        }
        Ok(parsed)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port, self.use_tls)
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint(), self.dn.as_deref().unwrap_or(""))
    }
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Choose the URL to follow.
///
/// Only hosts on the allow-list qualify. Among those, URLs whose TLS mode
/// matches `prefer_tls` win; ties are broken at random.
pub fn select<'a>(
    candidates: &'a [LdapUrl],
    config: &ReferralConfig,
    prefer_tls: bool,
    rng: &mut fastrand::Rng,
) -> Option<&'a LdapUrl> {
    let allowed: Vec<&LdapUrl> = candidates
        .iter()
        .filter(|url| config.lookup(&url.host).is_some())
        .collect();
    let preferred: Vec<&LdapUrl> = allowed
        .iter()
        .copied()
        .filter(|url| url.use_tls == prefer_tls)
        .collect();
    let pool = if preferred.is_empty() { allowed } else { preferred };
    if pool.is_empty() {
        return None;
    }
    Some(pool[rng.usize(..pool.len())])
}

fn parse_all(urls: &[String]) -> Vec<LdapUrl> {
    urls.iter()
        .filter_map(|url| match LdapUrl::parse(url) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                warn!(error = %err, "ignoring unusable referral");
                None
            }
        })
        .collect()
}

/// Point `request` at the target named by `url`.
fn redirect(request: &Request, url: &LdapUrl) -> Request {
    let mut redirected = request.clone();
    let target = match &mut redirected.op {
        ProtocolOp::SearchRequest(search) => {
            if let Some(scope) = url.scope {
                search.scope = scope;
            }
            Some(&mut search.base)
        }
        ProtocolOp::AddRequest(add) => Some(&mut add.dn),
        ProtocolOp::DelRequest(dn) => Some(dn),
        ProtocolOp::ModifyRequest(modify) => Some(&mut modify.dn),
        ProtocolOp::ModifyDnRequest(rename) => Some(&mut rename.dn),
        ProtocolOp::CompareRequest(compare) => Some(&mut compare.dn),
        _ => None,
    };
    if let (Some(target), Some(dn)) = (target, &url.dn) {
        target.clone_from(dn);
    }
    redirected
}

/// Run `request` against the server named by `url` on a fresh connection.
fn chase(
    settings: &StrategySettings,
    bind: Option<&Request>,
    request: Request,
    url: &LdapUrl,
    hops: u32,
    timeout: Option<Duration>,
) -> Result<ResponseBundle> {
    let allow_auth = settings
        .referrals
        .lookup(&url.host)
        .is_some_and(|host| host.allow_auth);
    info!(url = %url, hop = hops + 1, "following referral");

    // Dropping `connection` closes it, whichever way this returns
    let connection = SyncStrategy::chasing(settings.for_endpoint(url.endpoint()), hops + 1);
    connection.open()?;

    let credentials = match bind {
        Some(bind) if allow_auth => Some(bind.clone()),
        Some(_) => Some(ops::anonymous_bind()),
        None => None,
    };
    if let Some(credentials) = credentials {
        let response = connection.execute(credentials, timeout)?;
        if let Some(code) = response.result_code().filter(|code| !code.is_success()) {
            return Err(LdapError::operation_failed(format!("bind on referred server failed: {code}")));
        }
    }

    let result = connection.execute(request, timeout);
    connection.close()?;
    result
}

/// Replace a referral result with the outcome of following it.
///
/// When the referral cannot be followed the error carries the original
/// bundle.
pub(crate) fn follow(
    settings: &StrategySettings,
    bind: Option<&Request>,
    request: &Request,
    bundle: ResponseBundle,
    hops: u32,
    timeout: Option<Duration>,
) -> Result<ResponseBundle> {
    let refuse = |reason: String, bundle: ResponseBundle| LdapError::Referral {
        reason,
        original: Box::new(bundle),
    };

    if hops >= settings.referrals.max_hops {
        return Err(refuse(
            format!("referral hop limit of {} reached", settings.referrals.max_hops),
            bundle,
        ));
    }
    match request.kind() {
        Some(OperationKind::Bind | OperationKind::Unbind | OperationKind::Abandon) | None => {
            return Err(refuse(
                format!("{} requests are not followed", request.op.name()),
                bundle,
            ));
        }
        Some(_) => {}
    }

    let urls = bundle
        .result()
        .map(|result| parse_all(&result.referrals))
        .unwrap_or_default();
    let mut rng = fastrand::Rng::new();
    let Some(url) = select(&urls, &settings.referrals, settings.endpoint.use_tls, &mut rng) else {
        return Err(refuse("no referral points to an allowed host".to_string(), bundle));
    };

    match chase(settings, bind, redirect(request, url), url, hops, timeout) {
        Ok(chased) => Ok(chased.relabel(bundle.message_id())),
        Err(err) => {
            warn!(url = %url, error = %err, "referral failed");
            Err(refuse(err.to_string(), bundle))
        }
    }
}

/// Replace each continuation reference of a search with the entries found
/// by following it. References that cannot be followed are kept.
pub(crate) fn follow_continuations(
    settings: &StrategySettings,
    bind: Option<&Request>,
    request: &Request,
    bundle: ResponseBundle,
    hops: u32,
    timeout: Option<Duration>,
) -> Result<ResponseBundle> {
    if hops >= settings.referrals.max_hops {
        debug!(hops, "not following continuation references any deeper");
        return Ok(bundle);
    }

    let message_id = bundle.message_id();
    let (interim, terminal) = bundle.into_parts();
    let mut rng = fastrand::Rng::new();
    let mut spliced = Vec::with_capacity(interim.len());

    for message in interim {
        let ProtocolOp::SearchResultReference(urls) = &message.op else {
            spliced.push(message);
            continue;
        };
        let candidates = parse_all(urls);
        let Some(url) = select(&candidates, &settings.referrals, settings.endpoint.use_tls, &mut rng)
        else {
            spliced.push(message);
            continue;
        };
        match chase(settings, bind, redirect(request, url), url, hops, timeout) {
            Ok(chased) => {
                let (entries, _) = chased.relabel(message_id).into_parts();
                debug!(url = %url, messages = entries.len(), "continuation reference resolved");
                spliced.extend(entries);
            }
            Err(err) => {
                warn!(url = %url, error = %err, "continuation reference kept unresolved");
                spliced.push(message);
            }
        }
    }

    ResponseBundle::from_parts(message_id, spliced, terminal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ReferralHost};
    use crate::message::{LdapMessage, LdapResult, ResultCode};
    use crate::mock::{done, entry, reference, MockNetwork};
    use rstest::rstest;

    #[rstest]
    #[case("ldap://ldap.example.com", false, "ldap.example.com", 389)]
    #[case("ldaps://ldap.example.com", true, "ldap.example.com", 636)]
    #[case("LDAP://ldap.example.com:1389/", false, "ldap.example.com", 1389)]
    #[case("ldap://[::1]:3389/dc=example", false, "::1", 3389)]
    fn parses_scheme_host_and_port(
        #[case] url: &str,
        #[case] use_tls: bool,
        #[case] host: &str,
        #[case] port: u16,
    ) {
        let parsed = LdapUrl::parse(url).unwrap();
        assert_eq!(parsed.use_tls, use_tls);
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.port, port);
    }

    #[test]
    fn parses_dn_attributes_scope_and_filter() {
        let url = LdapUrl::parse(
            "ldap://b.example.com/ou=People,dc=example%20corp?cn,mail?one?(uid=j%2Adoe)?x-ext",
        )
        .unwrap();
        assert_eq!(url.dn.as_deref(), Some("ou=People,dc=example corp"));
        assert_eq!(url.attributes, vec!["cn", "mail"]);
        assert_eq!(url.scope, Some(SearchScope::SingleLevel));
        assert_eq!(url.filter.as_deref(), Some("(uid=j*doe)"));
    }

    #[rstest]
    #[case("http://example.com")]
    #[case("example.com/dc=x")]
    #[case("ldap:///dc=x")]
    #[case("ldap://host:notaport")]
    #[case("ldap://host/dc=x??deep")]
    #[case("ldap://[::1/dc=x")]
    #[case("ldap://host/dc=%zz")]
    fn rejects_malformed_urls(#[case] url: &str) {
        assert!(matches!(LdapUrl::parse(url), Err(LdapError::InvalidUrl { .. })));
    }

    fn allow_only(hosts: &[&str]) -> ReferralConfig {
        ReferralConfig {
            hosts: hosts.iter().map(|h| ReferralHost::new(*h, true)).collect(),
            ..ReferralConfig::default()
        }
    }

    #[test]
    fn selection_never_picks_a_disallowed_host() {
        let candidates = vec![
            LdapUrl::parse("ldap://denied.example.com/dc=x").unwrap(),
            LdapUrl::parse("ldap://allowed.example.com/dc=x").unwrap(),
        ];
        let config = allow_only(&["allowed.example.com"]);
        for seed in 0..200 {
            let mut rng = fastrand::Rng::with_seed(seed);
            let chosen = select(&candidates, &config, false, &mut rng).unwrap();
            assert_eq!(chosen.host, "allowed.example.com");
        }
    }

    #[test]
    fn selection_prefers_matching_tls_mode() {
        let candidates = vec![
            LdapUrl::parse("ldap://a.example.com").unwrap(),
            LdapUrl::parse("ldaps://b.example.com").unwrap(),
        ];
        let config = ReferralConfig::default();
        for seed in 0..50 {
            let mut rng = fastrand::Rng::with_seed(seed);
            assert_eq!(select(&candidates, &config, true, &mut rng).unwrap().host, "b.example.com");
            assert_eq!(select(&candidates, &config, false, &mut rng).unwrap().host, "a.example.com");
        }
        assert!(select(&candidates, &allow_only(&["c.example.com"]), false, &mut fastrand::Rng::new()).is_none());
    }

    fn referral_to(urls: &[&str]) -> ProtocolOp {
        ProtocolOp::SearchResultDone(LdapResult {
            referrals: urls.iter().map(|u| u.to_string()).collect(),
            ..LdapResult::with_code(ResultCode::REFERRAL, "go elsewhere")
        })
    }

    fn network_with_referral() -> MockNetwork {
        let network = MockNetwork::new();
        network.respond_per_host(|endpoint, message| {
            let id = message.message_id;
            match (&message.op, endpoint.host.as_str()) {
                (ProtocolOp::SearchRequest(_), "primary") => vec![LdapMessage::new(
                    id,
                    referral_to(&["ldap://denied/dc=x", "ldap://secondary/ou=moved,dc=x??sub"]),
                )],
                (ProtocolOp::SearchRequest(search), _) => vec![
                    LdapMessage::new(id, entry(&format!("cn=found,{}", search.base), &[])),
                    LdapMessage::new(id, done(ResultCode::SUCCESS)),
                ],
                _ => MockNetwork::default_reply(message),
            }
        });
        network
    }

    fn primary(network: &MockNetwork, hosts: &[&str]) -> SyncStrategy {
        let mut config = ConnectionConfig::for_host("primary");
        config.referrals = allow_only(hosts);
        SyncStrategy::new(network.settings_for(&config))
    }

    #[test]
    fn referral_is_followed_to_the_allowed_host() {
        let network = network_with_referral();
        let strategy = primary(&network, &["secondary"]);
        strategy.open().unwrap();
        strategy.execute(ops::bind_simple("cn=admin", "secret"), None).unwrap();

        let id = strategy
            .send(ops::search("dc=x", SearchScope::SingleLevel, crate::message::Filter::present("cn"), ["cn"]))
            .unwrap();
        let bundle = strategy.await_response(id, None).unwrap();

        assert_eq!(bundle.message_id(), id);
        assert_eq!(bundle.entries().next().unwrap().dn, "cn=found,ou=moved,dc=x");
        assert_eq!(network.connected_hosts(), vec!["primary", "secondary"]);
        assert!(network.transports()[1].is_closed());
        // The referred server saw the same credentials
        let binds = network
            .sent()
            .iter()
            .filter(|bytes| {
                matches!(
                    crate::codec::decode_message(bytes).unwrap().op,
                    ProtocolOp::BindRequest(_)
                )
            })
            .count();
        assert_eq!(binds, 2);
    }

    #[test]
    fn unfollowable_referral_returns_the_original() {
        let network = network_with_referral();
        let strategy = primary(&network, &["elsewhere"]);
        strategy.open().unwrap();

        let err = strategy.execute(ops::read_entry("dc=x", ["cn"]), None).unwrap_err();
        let LdapError::Referral { original, .. } = err else {
            panic!("expected a referral error, got {err:?}");
        };
        assert!(original.is_referral());
        assert_eq!(network.connected_hosts(), vec!["primary"]);
    }

    #[test]
    fn continuation_references_are_spliced_in_place() {
        let network = MockNetwork::new();
        network.respond_per_host(|endpoint, message| {
            let id = message.message_id;
            match (&message.op, endpoint.host.as_str()) {
                (ProtocolOp::SearchRequest(_), "primary") => vec![
                    LdapMessage::new(id, entry("cn=local,dc=x", &[])),
                    LdapMessage::new(id, reference(&["ldap://secondary/ou=remote,dc=x"])),
                    LdapMessage::new(id, reference(&["ldap://unknown/ou=lost,dc=x"])),
                    LdapMessage::new(id, done(ResultCode::SUCCESS)),
                ],
                (ProtocolOp::SearchRequest(_), _) => vec![
                    LdapMessage::new(id, entry("cn=remote,dc=x", &[])),
                    LdapMessage::new(id, done(ResultCode::SUCCESS)),
                ],
                _ => MockNetwork::default_reply(message),
            }
        });
        let strategy = primary(&network, &["primary", "secondary"]);
        strategy.open().unwrap();

        let bundle = strategy
            .execute(ops::search("dc=x", SearchScope::WholeSubtree, crate::message::Filter::present("cn"), ["cn"]), None)
            .unwrap();
        let dns: Vec<_> = bundle.entries().map(|e| e.dn.as_str()).collect();
        assert_eq!(dns, vec!["cn=local,dc=x", "cn=remote,dc=x"]);
        assert_eq!(bundle.references().count(), 1);
    }

    #[test]
    fn hop_limit_stops_referral_loops() {
        let network = MockNetwork::new();
        network.respond_per_host(|_, message| match &message.op {
            ProtocolOp::DelRequest(_) => vec![LdapMessage::new(
                message.message_id,
                ProtocolOp::DelResponse(LdapResult {
                    referrals: vec!["ldap://loop/dc=x".to_string()],
                    ..LdapResult::with_code(ResultCode::REFERRAL, "")
                }),
            )],
            _ => MockNetwork::default_reply(message),
        });
        let mut config = ConnectionConfig::for_host("loop");
        config.referrals.max_hops = 2;
        let strategy = SyncStrategy::new(network.settings_for(&config));
        strategy.open().unwrap();

        let err = strategy.execute(ops::delete("cn=a,dc=x"), None).unwrap_err();
        assert!(matches!(err, LdapError::Referral { .. }));
        assert_eq!(network.connects(), 3);
    }
}
