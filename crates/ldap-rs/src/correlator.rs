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

//! Response correlation.
//!
//! Raw bytes go in, complete response bundles come out. Each message id
//! moves from *empty* to *accumulating* when its first interim message
//! (search entry, search reference, intermediate response) arrives, and is
//! sealed by the first final message. Sealing removes the request from the
//! [`OutstandingTable`], so any later message with that id is rejected.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::codec::decode_message;
use crate::error::{LdapError, Result};
use crate::framer::extract_messages_with_limit;
use crate::message::{Control, LdapMessage, LdapResult, MessageId, ProtocolOp, ResultCode, SearchEntry};
use crate::outstanding::{OutstandingRequest, OutstandingTable};

/// Every message received for one request, in arrival order, ending with
/// exactly one final message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBundle {
    message_id: MessageId,
    interim: Vec<LdapMessage>,
    terminal: LdapMessage,
}

impl ResponseBundle {
    /// Assemble a bundle. `terminal` must be final and every message must
    /// carry `message_id`.
    pub fn from_parts(
        message_id: MessageId,
        interim: Vec<LdapMessage>,
        terminal: LdapMessage,
    ) -> Result<Self> {
        if !terminal.is_final() || interim.iter().any(LdapMessage::is_final) {
            return Err(LdapError::protocol(
                "a bundle needs interim messages followed by one final message",
            ));
        }
        if terminal.message_id != message_id || interim.iter().any(|m| m.message_id != message_id)
        {
            return Err(LdapError::protocol("bundle messages carry different ids"));
        }
        Ok(Self {
            message_id,
            interim,
            terminal,
        })
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// All messages, the terminal one last.
    pub fn iter(&self) -> impl Iterator<Item = &LdapMessage> {
        self.interim.iter().chain(std::iter::once(&self.terminal))
    }

    pub fn len(&self) -> usize {
        self.interim.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn interim(&self) -> &[LdapMessage] {
        &self.interim
    }

    pub fn terminal(&self) -> &LdapMessage {
        &self.terminal
    }

    pub fn result(&self) -> Option<&LdapResult> {
        self.terminal.op.result()
    }

    pub fn result_code(&self) -> Option<ResultCode> {
        self.result().map(|r| r.code)
    }

    pub fn is_referral(&self) -> bool {
        self.result_code() == Some(ResultCode::REFERRAL)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SearchEntry> {
        self.interim.iter().filter_map(|m| match &m.op {
            ProtocolOp::SearchResultEntry(entry) => Some(entry),
            _ => None,
        })
    }

    /// Continuation reference URLs, flattened in arrival order.
    pub fn references(&self) -> impl Iterator<Item = &String> {
        self.interim
            .iter()
            .filter_map(|m| match &m.op {
                ProtocolOp::SearchResultReference(urls) => Some(urls),
                _ => None,
            })
            .flatten()
    }

    /// Controls attached to the terminal message.
    pub fn controls(&self) -> &[Control] {
        &self.terminal.controls
    }

    pub fn into_parts(self) -> (Vec<LdapMessage>, LdapMessage) {
        (self.interim, self.terminal)
    }

    /// The same messages under another id, for responses obtained on a
    /// different connection than the one the caller used.
    pub(crate) fn relabel(self, message_id: MessageId) -> Self {
        let Self {
            mut interim,
            mut terminal,
            ..
        } = self;
        for message in interim.iter_mut() {
            message.message_id = message_id;
        }
        terminal.message_id = message_id;
        Self {
            message_id,
            interim,
            terminal,
        }
    }

    /// Replace the interim messages, keeping the terminal one.
    pub(crate) fn with_interim(self, interim: Vec<LdapMessage>) -> Self {
        Self { interim, ..self }
    }
}

/// What one decoded message did to the correlation state.
#[derive(Debug)]
pub enum CorrelatorEvent {
    /// A request received its final message.
    Sealed {
        request: OutstandingRequest,
        bundle: ResponseBundle,
    },
    /// Message id 0, other than a notice of disconnection
    Unsolicited(LdapMessage),
    /// The server announced it is closing the connection.
    Disconnected(LdapMessage),
    /// A late response for an abandoned request was discarded.
    Dropped(MessageId),
    /// The stream can no longer be trusted. Nothing after this event was
    /// processed; the connection must be closed.
    Failed(LdapError),
}

#[derive(Debug)]
pub struct Correlator {
    buffer: Vec<u8>,
    accumulating: HashMap<MessageId, Vec<LdapMessage>>,
    max_message_size: usize,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl Correlator {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            accumulating: HashMap::new(),
            max_message_size,
        }
    }

    /// Consume one chunk from the transport.
    ///
    /// Messages are handled in arrival order, so one chunk may seal several
    /// bundles. Processing stops at the first fatal error, which is
    /// reported as the last event; bundles sealed before it are kept.
    pub fn feed(&mut self, data: &[u8], table: &mut OutstandingTable) -> Vec<CorrelatorEvent> {
        self.buffer.extend_from_slice(data);

        let mut decoded = Vec::new();
        match extract_messages_with_limit(&self.buffer, self.max_message_size) {
            Ok((frames, rest)) => {
                for frame in frames {
                    let message = decode_message(frame);
                    let failed = message.is_err();
                    decoded.push(message);
                    if failed {
                        break;
                    }
                }
                let consumed = self.buffer.len() - rest.len();
                self.buffer.drain(..consumed);
            }
            Err(err) => {
                error!(error = %err, "unframeable data on the wire");
                self.buffer.clear();
                return vec![CorrelatorEvent::Failed(err.into())];
            }
        }

        let mut events = Vec::with_capacity(decoded.len());
        for message in decoded {
            match message.and_then(|m| self.accept(m, table)) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "response stream is no longer trustworthy");
                    self.buffer.clear();
                    events.push(CorrelatorEvent::Failed(err));
                    break;
                }
            }
        }
        events
    }

    /// Route one decoded message.
    pub fn accept(
        &mut self,
        message: LdapMessage,
        table: &mut OutstandingTable,
    ) -> Result<Option<CorrelatorEvent>> {
        let id = message.message_id;

        if id.is_unsolicited() {
            if message.is_notice_of_disconnection() {
                warn!(
                    diagnostic = message.op.result().map(|r| r.diagnostic_message.as_str()).unwrap_or(""),
                    "server sent a notice of disconnection"
                );
                return Ok(Some(CorrelatorEvent::Disconnected(message)));
            }
            info!(op = message.op.name(), "unsolicited notification");
            return Ok(Some(CorrelatorEvent::Unsolicited(message)));
        }

        let Some(outstanding) = table.lookup(id) else {
            if table.was_abandoned(id) {
                warn!(message_id = %id, op = message.op.name(), "dropping response to abandoned request");
                return Ok(Some(CorrelatorEvent::Dropped(id)));
            }
            return Err(LdapError::UnexpectedMessageId(id));
        };

        if message.op.is_request() {
            return Err(LdapError::protocol(format!(
                "server sent a {} for message id {}",
                message.op.name(),
                id
            )));
        }
        if let Some(kind) = message.op.response_kind() {
            if kind != outstanding.kind {
                return Err(LdapError::protocol(format!(
                    "{} does not answer the {:?} request with message id {}",
                    message.op.name(),
                    outstanding.kind,
                    id
                )));
            }
        }

        if !message.is_final() {
            debug!(message_id = %id, op = message.op.name(), "interim response");
            self.accumulating.entry(id).or_default().push(message);
            return Ok(None);
        }

        let interim = self.accumulating.remove(&id).unwrap_or_default();
        let request = table
            .remove(id)
            .ok_or(LdapError::UnexpectedMessageId(id))?;
        debug!(message_id = %id, messages = interim.len() + 1, "response sealed");
        Ok(Some(CorrelatorEvent::Sealed {
            request,
            bundle: ResponseBundle {
                message_id: id,
                interim,
                terminal: message,
            },
        }))
    }

    pub fn is_accumulating(&self, id: MessageId) -> bool {
        self.accumulating.contains_key(&id)
    }

    /// Discard partial results for `id`, e.g. after it was abandoned.
    pub fn forget(&mut self, id: MessageId) {
        self.accumulating.remove(&id);
    }

    /// Bytes received but not yet forming a complete message
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop all state, for use after the transport was replaced.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.accumulating.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{OperationKind, Request};
    use crate::mock::{bind_ok, done, entry, frame, notice_of_disconnection, reference};
    use crate::ops;

    fn register(table: &mut OutstandingTable, id: u32, request: Request) {
        let kind = request.kind().unwrap();
        table
            .register(OutstandingRequest {
                message_id: MessageId::new(id),
                kind,
                request,
                encoded: Vec::new(),
            })
            .unwrap();
    }

    fn sealed(events: Vec<CorrelatorEvent>) -> Vec<ResponseBundle> {
        events
            .into_iter()
            .map(|event| match event {
                CorrelatorEvent::Sealed { bundle, .. } => bundle,
                other => panic!("expected a sealed bundle, got {:?}", other),
            })
            .collect()
    }

    #[test]
    fn interim_then_final_yields_one_bundle_in_order() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 2, ops::read_entry("cn=a", ["cn"]));

        let events = correlator.feed(&frame(2, entry("cn=a", &[("cn", &["a"])])), &mut table);
        assert!(events.is_empty());
        assert!(correlator.is_accumulating(MessageId::new(2)));

        let bundles = sealed(correlator.feed(&frame(2, done(ResultCode::SUCCESS)), &mut table));
        assert_eq!(bundles.len(), 1);
        let bundle = &bundles[0];
        assert_eq!(bundle.len(), 2);
        let names: Vec<_> = bundle.iter().map(|m| m.op.name()).collect();
        assert_eq!(names, ["searchResEntry", "searchResDone"]);
        assert!(!correlator.is_accumulating(MessageId::new(2)));
        assert!(table.is_empty());
    }

    #[test]
    fn one_chunk_with_four_messages_seals_one_bundle() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 2, ops::read_entry("dc=example", ["cn"]));

        let mut chunk = Vec::new();
        for dn in ["cn=a", "cn=b", "cn=c"] {
            chunk.extend(frame(2, entry(dn, &[])));
        }
        chunk.extend(frame(2, done(ResultCode::SUCCESS)));

        let bundles = sealed(correlator.feed(&chunk, &mut table));
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].len(), 4);
        assert_eq!(bundles[0].message_id(), MessageId::new(2));
        let dns: Vec<_> = bundles[0].entries().map(|e| e.dn.as_str()).collect();
        assert_eq!(dns, ["cn=a", "cn=b", "cn=c"]);
    }

    #[test]
    fn unknown_message_id_is_fatal_and_never_bundled() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 1, ops::delete("cn=a"));

        let mut chunk = frame(9, done(ResultCode::SUCCESS));
        chunk.extend(frame(1, crate::mock::result_op(OperationKind::Delete, ResultCode::SUCCESS)));
        let events = correlator.feed(&chunk, &mut table);

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            CorrelatorEvent::Failed(LdapError::UnexpectedMessageId(id)) if id == MessageId::new(9)
        ));
        // Processing stopped before the valid response
        assert!(table.contains(MessageId::new(1)));
    }

    #[test]
    fn bundles_sealed_before_a_decode_error_survive() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 1, ops::anonymous_bind());

        let mut chunk = frame(1, bind_ok());
        chunk.extend_from_slice(&[0x30, 0x03, 0x04, 0x01, 0x00]);
        let mut events = correlator.feed(&chunk, &mut table);

        assert_eq!(events.len(), 2);
        assert!(matches!(events.pop(), Some(CorrelatorEvent::Failed(LdapError::Codec { .. }))));
        assert_eq!(sealed(events)[0].message_id(), MessageId::new(1));
    }

    #[test]
    fn several_ids_complete_from_one_chunk() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 3, ops::read_entry("cn=a", ["cn"]));
        register(&mut table, 4, ops::anonymous_bind());

        let mut chunk = frame(3, entry("cn=a", &[]));
        chunk.extend(frame(4, bind_ok()));
        chunk.extend(frame(3, done(ResultCode::SUCCESS)));

        let ids: Vec<_> = sealed(correlator.feed(&chunk, &mut table))
            .iter()
            .map(|b| b.message_id().value())
            .collect();
        assert_eq!(ids, [4, 3]);
    }

    #[test]
    fn split_frames_are_reassembled() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 1, ops::anonymous_bind());

        let bytes = frame(1, bind_ok());
        let (head, tail) = bytes.split_at(5);
        assert!(correlator.feed(head, &mut table).is_empty());
        assert_eq!(correlator.buffered(), 5);
        assert_eq!(sealed(correlator.feed(tail, &mut table)).len(), 1);
        assert_eq!(correlator.buffered(), 0);
    }

    #[test]
    fn abandoned_responses_are_dropped() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 7, ops::read_entry("cn=a", ["cn"]));
        table.abandon(MessageId::new(7));

        let mut chunk = frame(7, entry("cn=a", &[]));
        chunk.extend(frame(7, done(ResultCode::SUCCESS)));
        let events = correlator.feed(&chunk, &mut table);

        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, CorrelatorEvent::Dropped(id) if *id == MessageId::new(7))));
    }

    #[test]
    fn unsolicited_notifications_are_classified() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();

        let mut chunk = frame(0, crate::mock::extended_response(Some("1.2.3.4")));
        chunk.extend(frame(0, notice_of_disconnection()));
        let events = correlator.feed(&chunk, &mut table);

        assert!(matches!(events[0], CorrelatorEvent::Unsolicited(_)));
        assert!(matches!(events[1], CorrelatorEvent::Disconnected(_)));
    }

    #[test]
    fn mismatched_response_kind_is_a_protocol_error() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 1, ops::delete("cn=a"));

        let events = correlator.feed(&frame(1, bind_ok()), &mut table);
        assert!(matches!(events[0], CorrelatorEvent::Failed(LdapError::Protocol(_))));
    }

    #[test]
    fn references_are_collected() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        register(&mut table, 5, ops::read_entry("dc=example", ["cn"]));

        let mut chunk = frame(5, reference(&["ldap://a/dc=x", "ldap://b/dc=x"]));
        chunk.extend(frame(5, done(ResultCode::SUCCESS)));
        let bundles = sealed(correlator.feed(&chunk, &mut table));
        let refs: Vec<_> = bundles[0].references().map(String::as_str).collect();
        assert_eq!(refs, ["ldap://a/dc=x", "ldap://b/dc=x"]);
    }

    #[test]
    fn framing_errors_fail_the_stream() {
        let mut table = OutstandingTable::new();
        let mut correlator = Correlator::default();
        let events = correlator.feed(&[0x30, 0x80, 0x00, 0x00], &mut table);
        assert!(matches!(events[0], CorrelatorEvent::Failed(LdapError::Framing(_))));
        assert_eq!(correlator.buffered(), 0);
    }
}
