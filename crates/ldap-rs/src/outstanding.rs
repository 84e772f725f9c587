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

//! Requests awaiting their terminal response, keyed by message id.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{LdapError, Result};
use crate::message::{MessageId, OperationKind, Request};

/// How many abandoned ids are remembered so that late responses can be
/// recognised and dropped.
const MAX_ABANDONED_IDS: usize = 1000;

/// A request that has been transmitted and not yet answered.
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub message_id: MessageId,
    pub kind: OperationKind,
    pub request: Request,
    /// The exact bytes that went on the wire, for bit-identical re-sends
    pub encoded: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct OutstandingTable {
    requests: HashMap<MessageId, OutstandingRequest>,
    abandoned: VecDeque<MessageId>,
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transmitted request.
    ///
    /// Registering an id that is already outstanding means ids are being
    /// reused and is always an error.
    pub fn register(&mut self, entry: OutstandingRequest) -> Result<()> {
        let id = entry.message_id;
        if self.requests.contains_key(&id) {
            return Err(LdapError::DuplicateMessageId(id));
        }
        // A recycled id no longer refers to the abandoned operation
        self.abandoned.retain(|abandoned| *abandoned != id);
        self.requests.insert(id, entry);
        Ok(())
    }

    pub fn lookup(&self, id: MessageId) -> Option<&OutstandingRequest> {
        self.requests.get(&id)
    }

    pub fn remove(&mut self, id: MessageId) -> Option<OutstandingRequest> {
        self.requests.remove(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn all_ids(&self) -> HashSet<MessageId> {
        self.requests.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Remove `id` and remember it as abandoned.
    pub fn abandon(&mut self, id: MessageId) -> Option<OutstandingRequest> {
        let removed = self.requests.remove(&id);
        if removed.is_some() {
            if self.abandoned.len() >= MAX_ABANDONED_IDS {
                self.abandoned.pop_front();
            }
            self.abandoned.push_back(id);
        }
        removed
    }

    pub fn was_abandoned(&self, id: MessageId) -> bool {
        self.abandoned.contains(&id)
    }

    /// Forget every outstanding request, returning them in id order.
    pub fn clear(&mut self) -> Vec<OutstandingRequest> {
        let mut drained: Vec<_> = self.requests.drain().map(|(_, entry)| entry).collect();
        drained.sort_by_key(|entry| entry.message_id);
        self.abandoned.clear();
        drained
    }
}

/// Hands out message ids for one connection.
///
/// Ids start at 1, wrap from `MessageId::MAX` back to 1 and never collide
/// with an id that is still outstanding.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    next: u32,
}

impl Default for MessageIdAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn starting_at(next: u32) -> Self {
        Self { next }
    }

    fn advance(&mut self) -> MessageId {
        let id = MessageId::new(self.next);
        self.next = if self.next >= MessageId::MAX {
            1
        } else {
            self.next + 1
        };
        id
    }

    pub fn allocate(&mut self, table: &OutstandingTable) -> Result<MessageId> {
        for _ in 0..MessageId::MAX {
            let id = self.advance();
            if !table.contains(id) {
                return Ok(id);
            }
        }
        Err(LdapError::operation_failed("every message id is outstanding"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;

    fn entry(id: u32) -> OutstandingRequest {
        OutstandingRequest {
            message_id: MessageId::new(id),
            kind: OperationKind::Delete,
            request: ops::delete("cn=x,dc=example"),
            encoded: Vec::new(),
        }
    }

    #[test]
    fn register_remove_lookup() {
        let mut table = OutstandingTable::new();
        table.register(entry(1)).unwrap();
        assert!(table.lookup(MessageId::new(1)).is_some());
        assert!(table.remove(MessageId::new(1)).is_some());
        assert!(table.lookup(MessageId::new(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn double_register_fails() {
        let mut table = OutstandingTable::new();
        table.register(entry(5)).unwrap();
        match table.register(entry(5)) {
            Err(LdapError::DuplicateMessageId(id)) => assert_eq!(id, MessageId::new(5)),
            other => panic!("expected DuplicateMessageId, got {:?}", other),
        }
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn all_ids_reports_every_entry() {
        let mut table = OutstandingTable::new();
        for id in [3, 1, 2] {
            table.register(entry(id)).unwrap();
        }
        let expected: HashSet<_> = [1, 2, 3].into_iter().map(MessageId::new).collect();
        assert_eq!(table.all_ids(), expected);
    }

    #[test]
    fn abandoned_ids_are_remembered_until_reused() {
        let mut table = OutstandingTable::new();
        table.register(entry(4)).unwrap();
        assert!(table.abandon(MessageId::new(4)).is_some());
        assert!(!table.contains(MessageId::new(4)));
        assert!(table.was_abandoned(MessageId::new(4)));

        table.register(entry(4)).unwrap();
        assert!(!table.was_abandoned(MessageId::new(4)));
    }

    #[test]
    fn abandoned_ring_is_bounded() {
        let mut table = OutstandingTable::new();
        for id in 1..=(MAX_ABANDONED_IDS as u32 + 1) {
            table.register(entry(id)).unwrap();
            table.abandon(MessageId::new(id));
        }
        assert!(!table.was_abandoned(MessageId::new(1)));
        assert!(table.was_abandoned(MessageId::new(2)));
        assert!(table.was_abandoned(MessageId::new(MAX_ABANDONED_IDS as u32 + 1)));
    }

    #[test]
    fn allocator_starts_at_one_and_wraps() {
        let table = OutstandingTable::new();
        let mut ids = MessageIdAllocator::new();
        assert_eq!(ids.allocate(&table).unwrap(), MessageId::new(1));
        assert_eq!(ids.allocate(&table).unwrap(), MessageId::new(2));

        let mut ids = MessageIdAllocator::starting_at(MessageId::MAX);
        assert_eq!(ids.allocate(&table).unwrap(), MessageId::new(MessageId::MAX));
        assert_eq!(ids.allocate(&table).unwrap(), MessageId::new(1));
    }

    #[test]
    fn allocator_skips_outstanding_ids() {
        let mut table = OutstandingTable::new();
        table.register(entry(1)).unwrap();
        table.register(entry(2)).unwrap();
        let mut ids = MessageIdAllocator::starting_at(MessageId::MAX);
        assert_eq!(ids.allocate(&table).unwrap(), MessageId::new(MessageId::MAX));
        assert_eq!(ids.allocate(&table).unwrap(), MessageId::new(3));
    }
}
