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

//! Tests against a scripted LDAP server on a loopback socket.
//!
//! The server decodes each request with the crate's own codec and answers
//! from a per-connection handler, so every byte crosses a real TCP stream.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ldap_rs::codec::{decode_message, encode_message};
use ldap_rs::framer::extract_messages;
use ldap_rs::message::{BindResponse, ExtendedResponse, NOTICE_OF_DISCONNECTION_OID};
use ldap_rs::{
    Attribute, ConnectionConfig, Filter, LdapConnection, LdapError, LdapMessage, LdapResult,
    MessageId, ProtocolOp, ResultCode, SearchEntry, SearchScope, StrategyKind,
};

enum Action {
    Reply(Vec<LdapMessage>),
    /// Drop the connection without answering
    Close,
}

type Handler = Box<dyn FnMut(&LdapMessage) -> Action + Send>;

/// Accept one connection per handler, serving each on its own thread.
/// Joining yields the messages every connection received.
fn serve(handlers: Vec<Handler>) -> (u16, JoinHandle<Vec<Vec<LdapMessage>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let sessions: Vec<_> = handlers
            .into_iter()
            .map(|handler| {
                let (socket, _) = listener.accept().unwrap();
                thread::spawn(move || session(socket, handler))
            })
            .collect();
        sessions.into_iter().map(|s| s.join().unwrap()).collect()
    });
    (port, handle)
}

fn session(mut socket: TcpStream, mut handler: Handler) -> Vec<LdapMessage> {
    let mut received = Vec::new();
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = match socket.read(&mut chunk) {
            Ok(0) | Err(_) => return received,
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);

        let (frames, rest) = extract_messages(&buffer).unwrap();
        let frames: Vec<Vec<u8>> = frames.iter().map(|frame| frame.to_vec()).collect();
        let consumed = buffer.len() - rest.len();
        buffer.drain(..consumed);

        for frame in frames {
            let message = decode_message(&frame).unwrap();
            let action = handler(&message);
            let unbind = matches!(message.op, ProtocolOp::UnbindRequest);
            received.push(message);
            match action {
                Action::Reply(replies) => {
                    let bytes: Vec<u8> = replies.iter().flat_map(encode_message).collect();
                    let _ = socket.write_all(&bytes);
                }
                Action::Close => return received,
            }
            if unbind {
                return received;
            }
        }
    }
}

fn bind_ok(id: MessageId) -> LdapMessage {
    LdapMessage::new(
        id,
        ProtocolOp::BindResponse(BindResponse {
            result: LdapResult::success(),
            server_sasl_creds: None,
        }),
    )
}

fn entry(id: MessageId, dn: &str) -> LdapMessage {
    LdapMessage::new(
        id,
        ProtocolOp::SearchResultEntry(SearchEntry {
            dn: dn.to_string(),
            attributes: vec![Attribute::new("cn", [dn.split(',').next().unwrap_or(dn)])],
        }),
    )
}

fn search_done(id: MessageId) -> LdapMessage {
    LdapMessage::new(id, ProtocolOp::SearchResultDone(LdapResult::success()))
}

/// Answers binds, searches (two entries) and deletes.
fn directory() -> Handler {
    Box::new(|message| {
        let id = message.message_id;
        Action::Reply(match &message.op {
            ProtocolOp::BindRequest(_) => vec![bind_ok(id)],
            ProtocolOp::SearchRequest(search) => vec![
                entry(id, &format!("cn=alice,{}", search.base)),
                entry(id, &format!("cn=bob,{}", search.base)),
                search_done(id),
            ],
            ProtocolOp::DelRequest(_) => {
                vec![LdapMessage::new(id, ProtocolOp::DelResponse(LdapResult::success()))]
            }
            _ => Vec::new(),
        })
    })
}

fn connection(port: u16, kind: StrategyKind) -> LdapConnection {
    let mut config = ConnectionConfig::for_host("127.0.0.1").with_strategy(kind);
    config.server.port = Some(port);
    config.search.response_timeout_ms = 5_000;
    config.restart.interval_ms = 10;
    config.pool.size = 2;
    config.pool.operation_timeout_ms = 5_000;
    LdapConnection::new(config).unwrap()
}

#[test]
fn sync_bind_search_unbind() {
    let (port, server) = serve(vec![directory()]);
    let connection = connection(port, StrategyKind::Sync);
    connection.open().unwrap();

    let bind = connection.bind("cn=admin,dc=example", "secret").unwrap();
    assert!(connection.get_response(bind, None).unwrap().result_code().unwrap().is_success());

    let search = connection
        .search("ou=people,dc=example", SearchScope::SingleLevel, Filter::present("cn"), ["cn"])
        .unwrap();
    let bundle = connection.get_response(search, None).unwrap();
    let dns: Vec<_> = bundle.entries().map(|e| e.dn.as_str()).collect();
    assert_eq!(dns, vec!["cn=alice,ou=people,dc=example", "cn=bob,ou=people,dc=example"]);
    assert_eq!(bundle.len(), 3);

    connection.unbind().unwrap();
    assert!(!connection.session().open);

    let received = server.join().unwrap();
    let ops: Vec<_> = received[0].iter().map(|m| m.op.name()).collect();
    assert_eq!(ops, vec!["bindRequest", "searchRequest", "unbindRequest"]);
}

#[test]
fn background_correlates_out_of_order_responses() {
    let mut first: Option<MessageId> = None;
    let handler: Handler = Box::new(move |message| {
        let id = message.message_id;
        match &message.op {
            ProtocolOp::SearchRequest(_) => match first.take() {
                None => {
                    first = Some(id);
                    Action::Reply(Vec::new())
                }
                Some(earlier) => Action::Reply(vec![
                    entry(id, "cn=second"),
                    entry(earlier, "cn=first"),
                    search_done(id),
                    search_done(earlier),
                ]),
            },
            _ => Action::Reply(Vec::new()),
        }
    });
    let (port, server) = serve(vec![handler]);
    let connection = connection(port, StrategyKind::Background);
    connection.open().unwrap();

    let a = connection
        .search("dc=example", SearchScope::WholeSubtree, Filter::present("cn"), ["cn"])
        .unwrap();
    let b = connection
        .search("dc=example", SearchScope::WholeSubtree, Filter::present("cn"), ["cn"])
        .unwrap();

    let first = connection.get_response(a, None).unwrap();
    let second = connection.get_response(b, None).unwrap();
    assert_eq!(first.entries().next().unwrap().dn, "cn=first");
    assert_eq!(second.entries().next().unwrap().dn, "cn=second");

    connection.close().unwrap();
    server.join().unwrap();
}

#[test]
fn restartable_resends_after_the_server_drops_the_connection() {
    let flaky: Handler = Box::new(|message| match &message.op {
        ProtocolOp::BindRequest(_) => Action::Reply(vec![bind_ok(message.message_id)]),
        _ => Action::Close,
    });
    let (port, server) = serve(vec![flaky, directory()]);
    let connection = connection(port, StrategyKind::Restartable);
    connection.open().unwrap();

    let bind = connection.bind("cn=admin,dc=example", "secret").unwrap();
    connection.get_response(bind, None).unwrap();

    let delete = connection.delete("cn=old,dc=example").unwrap();
    let bundle = connection.get_response(delete, None).unwrap();
    assert_eq!(bundle.message_id(), delete);
    assert_eq!(bundle.result_code(), Some(ResultCode::SUCCESS));
    assert!(connection.session().bound);

    drop(connection);
    let received = server.join().unwrap();
    let lost = &received[0][1];
    let replayed = &received[1];
    assert!(matches!(replayed[0].op, ProtocolOp::BindRequest(_)));
    assert_eq!(&replayed[1], lost);
}

#[test]
fn notice_of_disconnection_ends_the_session() {
    let handler: Handler = Box::new(|message| match &message.op {
        ProtocolOp::DelRequest(_) => Action::Reply(vec![LdapMessage::new(
            MessageId::UNSOLICITED,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::with_code(ResultCode::UNAVAILABLE, "shutting down"),
                name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                value: None,
            }),
        )]),
        _ => Action::Reply(Vec::new()),
    });
    let (port, server) = serve(vec![handler]);
    let connection = connection(port, StrategyKind::Sync);
    connection.open().unwrap();

    let id = connection.delete("cn=a,dc=example").unwrap();
    match connection.get_response(id, Some(Duration::from_secs(5))) {
        Err(LdapError::SessionTerminatedByServer { diagnostic }) => {
            assert_eq!(diagnostic, "shutting down");
        }
        other => panic!("Expected SessionTerminatedByServer, got: {:?}", other),
    }
    assert!(!connection.session().open);
    assert_eq!(connection.unsolicited().len(), 1);

    drop(connection);
    server.join().unwrap();
}

#[test]
fn pool_spreads_operations_over_connections() {
    // The second connection only appears if both workers pick up work
    let (port, _server) = serve(vec![directory(), directory()]);
    let connection = connection(port, StrategyKind::Pooled);
    connection.open().unwrap();

    let bind = connection.bind("cn=admin,dc=example", "secret").unwrap();
    connection.get_response(bind, None).unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| connection.delete(format!("cn={i},dc=example")).unwrap())
        .collect();
    for handle in handles {
        let bundle = connection.get_response(handle, None).unwrap();
        assert_eq!(bundle.message_id(), handle);
        assert_eq!(bundle.result_code(), Some(ResultCode::SUCCESS));
    }
    connection.close().unwrap();
}
