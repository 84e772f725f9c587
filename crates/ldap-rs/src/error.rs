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

use std::time::Duration;

use thiserror::Error;

use crate::correlator::ResponseBundle;
use crate::message::MessageId;

pub type Result<T> = std::result::Result<T, LdapError>;

/// Failures of the byte stream underneath a connection.
///
/// Every variant is fatal to the transport that produced it.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} connecting to {address}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),

    #[error("TLS negotiation with {host} failed: {message}")]
    Tls { host: String, message: String },

    #[error("transport is closed")]
    Closed,

    #[error("failed to start I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

/// Malformed BER length headers seen while splitting the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("indefinite BER length at byte {position} is not allowed in LDAP")]
    IndefiniteLength { position: usize },

    #[error("BER length field uses {octets} octets, more than this platform can address")]
    LengthOverflow { octets: usize },

    #[error("message of {length} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { length: usize, limit: usize },
}

#[derive(Debug, Error)]
pub enum LdapError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("codec error at byte {position}: {message}{}", .buffer_preview.as_deref().unwrap_or(""))]
    Codec {
        message: String,
        position: usize,
        buffer_preview: Option<String>,
    },

    #[error("{remaining} bytes left undecoded after the end of a message")]
    UnprocessedSubstrate { remaining: usize },

    #[error("received a response for message id {0}, which this connection never sent")]
    UnexpectedMessageId(MessageId),

    #[error("message id {0} is already outstanding")]
    DuplicateMessageId(MessageId),

    #[error("server terminated the session: {diagnostic}")]
    SessionTerminatedByServer { diagnostic: String },

    #[error("session terminated: {0}")]
    SessionTerminated(String),

    #[error("no response for message id {message_id} after {timeout:?}")]
    ResponseTimeout {
        message_id: MessageId,
        timeout: Duration,
    },

    #[error("not connected")]
    NotConnected,

    #[error("a SASL bind is in progress; only bind requests may be sent")]
    SaslInProgress,

    #[error("no outstanding operation with message id {0}")]
    NoSuchOperation(MessageId),

    #[error("referral could not be followed: {reason}")]
    Referral {
        reason: String,
        original: Box<ResponseBundle>,
    },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid LDAP URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    /// The server broke the protocol and the connection was closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered, but not in a way the operation can use. The
    /// connection stays open.
    #[error("operation failed: {0}")]
    OperationFailed(String),
}

impl LdapError {
    /// Create a codec error with context
    pub fn codec(message: impl Into<String>, position: usize) -> Self {
        Self::Codec {
            message: message.into(),
            position,
            buffer_preview: None,
        }
    }

    /// Create a codec error with a hex preview of the offending frame
    pub fn codec_with_preview(message: impl Into<String>, position: usize, buffer: &[u8]) -> Self {
        let preview_len = buffer.len().min(64);
        let hex_preview = buffer[..preview_len]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");

        Self::Codec {
            message: message.into(),
            position,
            buffer_preview: Some(format!(" (frame preview: {})", hex_preview)),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::OperationFailed(message.into())
    }

    /// Whether the connection that raised this error has been torn down.
    ///
    /// Non-fatal errors (timeouts, gating, usage mistakes) leave the
    /// connection usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Framing(_)
                | Self::Codec { .. }
                | Self::UnprocessedSubstrate { .. }
                | Self::UnexpectedMessageId(_)
                | Self::Protocol(_)
                | Self::SessionTerminatedByServer { .. }
                | Self::SessionTerminated(_)
        )
    }

    /// Whether reopening the connection and re-issuing the operation can help.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::SessionTerminated(_) | Self::SessionTerminatedByServer { .. }
        )
    }
}
