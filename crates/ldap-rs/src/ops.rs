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

//! LDAP operation builders
use crate::message::{
    AddRequest, Attribute, BindAuthentication, BindRequest, CompareRequest, DerefAliases,
    ExtendedRequest, Filter, MessageId, Modification, ModifyDnRequest, ModifyRequest,
    ProtocolOp, Request, SearchRequest, SearchScope, START_TLS_OID, WHO_AM_I_OID,
};

pub fn bind_simple(dn: impl Into<String>, password: impl Into<String>) -> Request {
    Request::new(ProtocolOp::BindRequest(BindRequest {
        version: 3,
        name: dn.into(),
        authentication: BindAuthentication::Simple(password.into()),
    }))
}

pub fn anonymous_bind() -> Request {
    bind_simple("", "")
}

pub fn bind_sasl(
    dn: impl Into<String>,
    mechanism: impl Into<String>,
    credentials: Option<Vec<u8>>,
) -> Request {
    Request::new(ProtocolOp::BindRequest(BindRequest {
        version: 3,
        name: dn.into(),
        authentication: BindAuthentication::Sasl {
            mechanism: mechanism.into(),
            credentials,
        },
    }))
}

pub fn unbind() -> Request {
    Request::new(ProtocolOp::UnbindRequest)
}

pub fn search<I, S>(base: impl Into<String>, scope: SearchScope, filter: Filter, attributes: I) -> Request
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    search_with(SearchRequest {
        base: base.into(),
        scope,
        deref_aliases: DerefAliases::Never,
        size_limit: 0,
        time_limit: 0,
        types_only: false,
        filter,
        attributes: attributes.into_iter().map(Into::into).collect(),
    })
}

pub fn search_with(request: SearchRequest) -> Request {
    Request::new(ProtocolOp::SearchRequest(request))
}

/// Read one entry: a base-scoped search matching any object.
pub fn read_entry<I, S>(dn: impl Into<String>, attributes: I) -> Request
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    search(
        dn,
        SearchScope::BaseObject,
        Filter::present("objectClass"),
        attributes,
    )
}

pub fn add(dn: impl Into<String>, attributes: Vec<Attribute>) -> Request {
    Request::new(ProtocolOp::AddRequest(AddRequest {
        dn: dn.into(),
        attributes,
    }))
}

pub fn delete(dn: impl Into<String>) -> Request {
    Request::new(ProtocolOp::DelRequest(dn.into()))
}

pub fn modify(dn: impl Into<String>, changes: Vec<Modification>) -> Request {
    Request::new(ProtocolOp::ModifyRequest(ModifyRequest {
        dn: dn.into(),
        changes,
    }))
}

pub fn modify_dn(
    dn: impl Into<String>,
    new_rdn: impl Into<String>,
    delete_old_rdn: bool,
    new_superior: Option<String>,
) -> Request {
    Request::new(ProtocolOp::ModifyDnRequest(ModifyDnRequest {
        dn: dn.into(),
        new_rdn: new_rdn.into(),
        delete_old_rdn,
        new_superior,
    }))
}

pub fn compare(
    dn: impl Into<String>,
    attribute: impl Into<String>,
    value: impl Into<Vec<u8>>,
) -> Request {
    Request::new(ProtocolOp::CompareRequest(CompareRequest {
        dn: dn.into(),
        attribute: attribute.into(),
        value: value.into(),
    }))
}

pub fn extended(name: impl Into<String>, value: Option<Vec<u8>>) -> Request {
    Request::new(ProtocolOp::ExtendedRequest(ExtendedRequest {
        name: name.into(),
        value,
    }))
}

pub fn start_tls() -> Request {
    extended(START_TLS_OID, None)
}

pub fn who_am_i() -> Request {
    extended(WHO_AM_I_OID, None)
}

pub fn abandon(message_id: MessageId) -> Request {
    Request::new(ProtocolOp::AbandonRequest(message_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OperationKind;

    #[test]
    fn builders_produce_the_matching_kind() {
        let cases = [
            (anonymous_bind(), OperationKind::Bind),
            (unbind(), OperationKind::Unbind),
            (read_entry("cn=a", ["cn"]), OperationKind::Search),
            (delete("cn=a"), OperationKind::Delete),
            (compare("cn=a", "cn", "a"), OperationKind::Compare),
            (modify_dn("cn=a", "cn=b", true, None), OperationKind::ModifyDn),
            (who_am_i(), OperationKind::Extended),
            (abandon(MessageId::new(3)), OperationKind::Abandon),
        ];
        for (request, kind) in cases {
            assert_eq!(request.kind(), Some(kind));
        }
    }

    #[test]
    fn start_tls_and_sasl_are_recognised() {
        assert!(start_tls().is_start_tls());
        assert!(!who_am_i().is_start_tls());
        assert!(bind_sasl("", "EXTERNAL", None).is_sasl_bind());
        assert!(!bind_simple("cn=a", "pw").is_sasl_bind());
    }
}
