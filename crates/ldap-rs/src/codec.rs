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

//! BER codec for LDAP messages
//!
//! Every value is a TLV triple:
//! - Tag: one octet (LDAP never needs high tag numbers)
//! - Length: short form (`< 0x80`) or long form (`0x80 | n` followed by `n` octets)
//! - Value: primitive bytes, or a run of nested TLVs for constructed types
//!
//! Only definite lengths are produced or accepted.

use crate::error::{LdapError, Result};
use crate::message::{
    AddRequest, Attribute, BindAuthentication, BindRequest, BindResponse, CompareRequest,
    Control, DerefAliases, ExtendedRequest, ExtendedResponse, Filter, IntermediateResponse,
    LdapMessage, LdapResult, MessageId, Modification, ModifyDnRequest, ModifyOperation,
    ModifyRequest, ProtocolOp, ResultCode, SearchEntry, SearchRequest, SearchScope,
};

pub(crate) mod tag {
    pub const BOOLEAN: u8 = 0x01;
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const ENUMERATED: u8 = 0x0A;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;

    pub const BIND_REQUEST: u8 = 0x60;
    pub const BIND_RESPONSE: u8 = 0x61;
    pub const UNBIND_REQUEST: u8 = 0x42;
    pub const SEARCH_REQUEST: u8 = 0x63;
    pub const SEARCH_RESULT_ENTRY: u8 = 0x64;
    pub const SEARCH_RESULT_DONE: u8 = 0x65;
    pub const SEARCH_RESULT_REFERENCE: u8 = 0x73;
    pub const MODIFY_REQUEST: u8 = 0x66;
    pub const MODIFY_RESPONSE: u8 = 0x67;
    pub const ADD_REQUEST: u8 = 0x68;
    pub const ADD_RESPONSE: u8 = 0x69;
    pub const DEL_REQUEST: u8 = 0x4A;
    pub const DEL_RESPONSE: u8 = 0x6B;
    pub const MODIFY_DN_REQUEST: u8 = 0x6C;
    pub const MODIFY_DN_RESPONSE: u8 = 0x6D;
    pub const COMPARE_REQUEST: u8 = 0x6E;
    pub const COMPARE_RESPONSE: u8 = 0x6F;
    pub const ABANDON_REQUEST: u8 = 0x50;
    pub const EXTENDED_REQUEST: u8 = 0x77;
    pub const EXTENDED_RESPONSE: u8 = 0x78;
    pub const INTERMEDIATE_RESPONSE: u8 = 0x79;

    pub const CONTROLS: u8 = 0xA0;
    pub const REFERRAL: u8 = 0xA3;
    pub const AUTH_SIMPLE: u8 = 0x80;
    pub const AUTH_SASL: u8 = 0xA3;
    pub const SERVER_SASL_CREDS: u8 = 0x87;
    pub const NEW_SUPERIOR: u8 = 0x80;
    pub const EXTENDED_REQUEST_NAME: u8 = 0x80;
    pub const EXTENDED_REQUEST_VALUE: u8 = 0x81;
    pub const EXTENDED_RESPONSE_NAME: u8 = 0x8A;
    pub const EXTENDED_RESPONSE_VALUE: u8 = 0x8B;
    pub const INTERMEDIATE_NAME: u8 = 0x80;
    pub const INTERMEDIATE_VALUE: u8 = 0x81;

    pub const FILTER_AND: u8 = 0xA0;
    pub const FILTER_OR: u8 = 0xA1;
    pub const FILTER_NOT: u8 = 0xA2;
    pub const FILTER_EQUALITY: u8 = 0xA3;
    pub const FILTER_SUBSTRINGS: u8 = 0xA4;
    pub const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
    pub const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
    pub const FILTER_PRESENT: u8 = 0x87;
    pub const FILTER_APPROX: u8 = 0xA8;
    pub const SUBSTRING_INITIAL: u8 = 0x80;
    pub const SUBSTRING_ANY: u8 = 0x81;
    pub const SUBSTRING_FINAL: u8 = 0x82;
}

/// Append-only BER writer.
#[derive(Debug, Default)]
pub(crate) struct BerWriter {
    buf: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn write_length(&mut self, len: usize) {
        if len < 0x80 {
            self.buf.push(len as u8);
            return;
        }
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let significant = &bytes[skip..];
        self.buf.push(0x80 | significant.len() as u8);
        self.buf.extend_from_slice(significant);
    }

    pub fn write_tlv(&mut self, tag: u8, value: &[u8]) {
        self.buf.push(tag);
        self.write_length(value.len());
        self.buf.extend_from_slice(value);
    }

    pub fn write_octets(&mut self, tag: u8, value: &[u8]) {
        self.write_tlv(tag, value);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_tlv(tag::OCTET_STRING, value.as_bytes());
    }

    pub fn write_bool(&mut self, tag: u8, value: bool) {
        self.write_tlv(tag, &[if value { 0xFF } else { 0x00 }]);
    }

    /// Minimal two's complement encoding.
    pub fn write_integer(&mut self, tag: u8, value: i64) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < bytes.len() - 1 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_tlv(tag, &bytes[start..]);
    }

    pub fn write_constructed(&mut self, tag: u8, body: impl FnOnce(&mut BerWriter)) {
        let mut inner = BerWriter::new();
        body(&mut inner);
        self.write_tlv(tag, &inner.buf);
    }
}

/// One decoded TLV and the absolute offset of its value within the frame.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tlv<'a> {
    pub tag: u8,
    pub value: &'a [u8],
    pub offset: usize,
}

impl<'a> Tlv<'a> {
    pub fn reader(&self) -> BerReader<'a> {
        BerReader {
            data: self.value,
            pos: 0,
            base: self.offset,
        }
    }

    fn string(&self) -> Result<String> {
        String::from_utf8(self.value.to_vec())
            .map_err(|_| LdapError::codec("string is not valid UTF-8", self.offset))
    }

    fn integer(&self) -> Result<i64> {
        if self.value.is_empty() || self.value.len() > 8 {
            return Err(LdapError::codec(
                format!("integer of {} octets is not supported", self.value.len()),
                self.offset,
            ));
        }
        let negative = self.value[0] & 0x80 != 0;
        let mut acc: i64 = if negative { -1 } else { 0 };
        for b in self.value {
            acc = (acc << 8) | i64::from(*b);
        }
        Ok(acc)
    }

    fn unsigned(&self) -> Result<u32> {
        let value = self.integer()?;
        u32::try_from(value)
            .map_err(|_| LdapError::codec(format!("value {} is out of range", value), self.offset))
    }
}

/// Cursor over a run of BER TLVs.
#[derive(Debug, Clone)]
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            base: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn position(&self) -> usize {
        self.base + self.pos
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn read_tlv(&mut self) -> Result<Tlv<'a>> {
        let start = self.position();
        let tag = self
            .peek_tag()
            .ok_or_else(|| LdapError::codec("unexpected end of data", start))?;
        if tag & 0x1F == 0x1F {
            return Err(LdapError::codec("multi-byte tags are not used by LDAP", start));
        }

        let mut cursor = self.pos + 1;
        let first = *self
            .data
            .get(cursor)
            .ok_or_else(|| LdapError::codec("missing length octet", self.base + cursor))?;
        cursor += 1;

        let length = if first < 0x80 {
            first as usize
        } else if first == 0x80 {
            return Err(LdapError::codec(
                "indefinite length is not allowed",
                self.base + cursor - 1,
            ));
        } else {
            let count = (first & 0x7F) as usize;
            if count > std::mem::size_of::<usize>() {
                return Err(LdapError::codec(
                    format!("length field of {} octets is too long", count),
                    self.base + cursor - 1,
                ));
            }
            let octets = self
                .data
                .get(cursor..cursor + count)
                .ok_or_else(|| LdapError::codec("truncated length field", self.base + cursor))?;
            cursor += count;
            octets.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };

        let end = cursor
            .checked_add(length)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                LdapError::codec(
                    format!(
                        "value of {} bytes overruns the {} available",
                        length,
                        self.data.len() - cursor
                    ),
                    self.base + cursor,
                )
            })?;

        let tlv = Tlv {
            tag,
            value: &self.data[cursor..end],
            offset: self.base + cursor,
        };
        self.pos = end;
        Ok(tlv)
    }

    pub fn expect(&mut self, expected: u8, what: &str) -> Result<Tlv<'a>> {
        let position = self.position();
        let tlv = self.read_tlv()?;
        if tlv.tag != expected {
            return Err(LdapError::codec(
                format!(
                    "expected {} (tag 0x{:02x}), found tag 0x{:02x}",
                    what, expected, tlv.tag
                ),
                position,
            ));
        }
        Ok(tlv)
    }

    pub fn optional(&mut self, expected: u8) -> Result<Option<Tlv<'a>>> {
        if self.peek_tag() == Some(expected) {
            self.read_tlv().map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read_integer(&mut self, what: &str) -> Result<i64> {
        self.expect(tag::INTEGER, what)?.integer()
    }

    pub fn read_unsigned(&mut self, what: &str) -> Result<u32> {
        self.expect(tag::INTEGER, what)?.unsigned()
    }

    pub fn read_enumerated(&mut self, what: &str) -> Result<u32> {
        self.expect(tag::ENUMERATED, what)?.unsigned()
    }

    pub fn read_bool(&mut self, what: &str) -> Result<bool> {
        let tlv = self.expect(tag::BOOLEAN, what)?;
        match tlv.value {
            [b] => Ok(*b != 0),
            _ => Err(LdapError::codec("boolean must be one octet", tlv.offset)),
        }
    }

    pub fn read_octets(&mut self, what: &str) -> Result<&'a [u8]> {
        Ok(self.expect(tag::OCTET_STRING, what)?.value)
    }

    pub fn read_string(&mut self, what: &str) -> Result<String> {
        self.expect(tag::OCTET_STRING, what)?.string()
    }

    /// Require that every byte of this reader was consumed.
    pub fn finish(&self, what: &str) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(LdapError::codec(
                format!("{} trailing bytes after {}", self.remaining(), what),
                self.position(),
            ))
        }
    }
}

/// Encode one LDAPMessage.
pub fn encode_message(message: &LdapMessage) -> Vec<u8> {
    let mut w = BerWriter::new();
    w.write_constructed(tag::SEQUENCE, |w| {
        w.write_integer(tag::INTEGER, i64::from(message.message_id.value()));
        encode_op(w, &message.op);
        if !message.controls.is_empty() {
            w.write_constructed(tag::CONTROLS, |w| {
                for control in &message.controls {
                    encode_control(w, control);
                }
            });
        }
    });
    w.into_bytes()
}

fn encode_control(w: &mut BerWriter, control: &Control) {
    w.write_constructed(tag::SEQUENCE, |w| {
        w.write_string(&control.oid);
        if control.criticality {
            w.write_bool(tag::BOOLEAN, true);
        }
        if let Some(value) = &control.value {
            w.write_octets(tag::OCTET_STRING, value);
        }
    });
}

fn encode_result_fields(w: &mut BerWriter, result: &LdapResult) {
    w.write_integer(tag::ENUMERATED, i64::from(result.code.0));
    w.write_string(&result.matched_dn);
    w.write_string(&result.diagnostic_message);
    if !result.referrals.is_empty() {
        w.write_constructed(tag::REFERRAL, |w| {
            for url in &result.referrals {
                w.write_string(url);
            }
        });
    }
}

fn encode_attribute(w: &mut BerWriter, attribute: &Attribute) {
    w.write_constructed(tag::SEQUENCE, |w| {
        w.write_string(&attribute.name);
        w.write_constructed(tag::SET, |w| {
            for value in &attribute.values {
                w.write_octets(tag::OCTET_STRING, value);
            }
        });
    });
}

fn encode_assertion(w: &mut BerWriter, filter_tag: u8, attribute: &str, value: &[u8]) {
    w.write_constructed(filter_tag, |w| {
        w.write_string(attribute);
        w.write_octets(tag::OCTET_STRING, value);
    });
}

pub(crate) fn encode_filter(w: &mut BerWriter, filter: &Filter) {
    match filter {
        Filter::And(children) => w.write_constructed(tag::FILTER_AND, |w| {
            children.iter().for_each(|c| encode_filter(w, c))
        }),
        Filter::Or(children) => w.write_constructed(tag::FILTER_OR, |w| {
            children.iter().for_each(|c| encode_filter(w, c))
        }),
        Filter::Not(inner) => w.write_constructed(tag::FILTER_NOT, |w| encode_filter(w, inner)),
        Filter::Equality(attr, value) => encode_assertion(w, tag::FILTER_EQUALITY, attr, value),
        Filter::GreaterOrEqual(attr, value) => {
            encode_assertion(w, tag::FILTER_GREATER_OR_EQUAL, attr, value)
        }
        Filter::LessOrEqual(attr, value) => {
            encode_assertion(w, tag::FILTER_LESS_OR_EQUAL, attr, value)
        }
        Filter::Approx(attr, value) => encode_assertion(w, tag::FILTER_APPROX, attr, value),
        Filter::Present(attr) => w.write_tlv(tag::FILTER_PRESENT, attr.as_bytes()),
        Filter::Substrings {
            attribute,
            initial,
            any,
            last,
        } => w.write_constructed(tag::FILTER_SUBSTRINGS, |w| {
            w.write_string(attribute);
            w.write_constructed(tag::SEQUENCE, |w| {
                if let Some(initial) = initial {
                    w.write_tlv(tag::SUBSTRING_INITIAL, initial);
                }
                for part in any {
                    w.write_tlv(tag::SUBSTRING_ANY, part);
                }
                if let Some(last) = last {
                    w.write_tlv(tag::SUBSTRING_FINAL, last);
                }
            });
        }),
    }
}

fn encode_op(w: &mut BerWriter, op: &ProtocolOp) {
    match op {
        ProtocolOp::BindRequest(bind) => w.write_constructed(tag::BIND_REQUEST, |w| {
            w.write_integer(tag::INTEGER, i64::from(bind.version));
            w.write_string(&bind.name);
            match &bind.authentication {
                BindAuthentication::Simple(password) => {
                    w.write_tlv(tag::AUTH_SIMPLE, password.as_bytes())
                }
                BindAuthentication::Sasl {
                    mechanism,
                    credentials,
                } => w.write_constructed(tag::AUTH_SASL, |w| {
                    w.write_string(mechanism);
                    if let Some(credentials) = credentials {
                        w.write_octets(tag::OCTET_STRING, credentials);
                    }
                }),
            }
        }),
        ProtocolOp::BindResponse(response) => w.write_constructed(tag::BIND_RESPONSE, |w| {
            encode_result_fields(w, &response.result);
            if let Some(creds) = &response.server_sasl_creds {
                w.write_tlv(tag::SERVER_SASL_CREDS, creds);
            }
        }),
        ProtocolOp::UnbindRequest => w.write_tlv(tag::UNBIND_REQUEST, &[]),
        ProtocolOp::SearchRequest(search) => w.write_constructed(tag::SEARCH_REQUEST, |w| {
            w.write_string(&search.base);
            w.write_integer(tag::ENUMERATED, search.scope as i64);
            w.write_integer(tag::ENUMERATED, search.deref_aliases as i64);
            w.write_integer(tag::INTEGER, i64::from(search.size_limit));
            w.write_integer(tag::INTEGER, i64::from(search.time_limit));
            w.write_bool(tag::BOOLEAN, search.types_only);
            encode_filter(w, &search.filter);
            w.write_constructed(tag::SEQUENCE, |w| {
                for attr in &search.attributes {
                    w.write_string(attr);
                }
            });
        }),
        ProtocolOp::SearchResultEntry(entry) => {
            w.write_constructed(tag::SEARCH_RESULT_ENTRY, |w| {
                w.write_string(&entry.dn);
                w.write_constructed(tag::SEQUENCE, |w| {
                    for attribute in &entry.attributes {
                        encode_attribute(w, attribute);
                    }
                });
            })
        }
        ProtocolOp::SearchResultDone(result) => {
            w.write_constructed(tag::SEARCH_RESULT_DONE, |w| encode_result_fields(w, result))
        }
        ProtocolOp::SearchResultReference(urls) => {
            w.write_constructed(tag::SEARCH_RESULT_REFERENCE, |w| {
                for url in urls {
                    w.write_string(url);
                }
            })
        }
        ProtocolOp::ModifyRequest(modify) => w.write_constructed(tag::MODIFY_REQUEST, |w| {
            w.write_string(&modify.dn);
            w.write_constructed(tag::SEQUENCE, |w| {
                for change in &modify.changes {
                    w.write_constructed(tag::SEQUENCE, |w| {
                        w.write_integer(tag::ENUMERATED, change.operation as i64);
                        encode_attribute(w, &change.attribute);
                    });
                }
            });
        }),
        ProtocolOp::ModifyResponse(result) => {
            w.write_constructed(tag::MODIFY_RESPONSE, |w| encode_result_fields(w, result))
        }
        ProtocolOp::AddRequest(add) => w.write_constructed(tag::ADD_REQUEST, |w| {
            w.write_string(&add.dn);
            w.write_constructed(tag::SEQUENCE, |w| {
                for attribute in &add.attributes {
                    encode_attribute(w, attribute);
                }
            });
        }),
        ProtocolOp::AddResponse(result) => {
            w.write_constructed(tag::ADD_RESPONSE, |w| encode_result_fields(w, result))
        }
        ProtocolOp::DelRequest(dn) => w.write_tlv(tag::DEL_REQUEST, dn.as_bytes()),
        ProtocolOp::DelResponse(result) => {
            w.write_constructed(tag::DEL_RESPONSE, |w| encode_result_fields(w, result))
        }
        ProtocolOp::ModifyDnRequest(moddn) => {
            w.write_constructed(tag::MODIFY_DN_REQUEST, |w| {
                w.write_string(&moddn.dn);
                w.write_string(&moddn.new_rdn);
                w.write_bool(tag::BOOLEAN, moddn.delete_old_rdn);
                if let Some(superior) = &moddn.new_superior {
                    w.write_tlv(tag::NEW_SUPERIOR, superior.as_bytes());
                }
            })
        }
        ProtocolOp::ModifyDnResponse(result) => {
            w.write_constructed(tag::MODIFY_DN_RESPONSE, |w| encode_result_fields(w, result))
        }
        ProtocolOp::CompareRequest(compare) => {
            w.write_constructed(tag::COMPARE_REQUEST, |w| {
                w.write_string(&compare.dn);
                w.write_constructed(tag::SEQUENCE, |w| {
                    w.write_string(&compare.attribute);
                    w.write_octets(tag::OCTET_STRING, &compare.value);
                });
            })
        }
        ProtocolOp::CompareResponse(result) => {
            w.write_constructed(tag::COMPARE_RESPONSE, |w| encode_result_fields(w, result))
        }
        ProtocolOp::AbandonRequest(id) => {
            w.write_integer(tag::ABANDON_REQUEST, i64::from(id.value()))
        }
        ProtocolOp::ExtendedRequest(ext) => w.write_constructed(tag::EXTENDED_REQUEST, |w| {
            w.write_tlv(tag::EXTENDED_REQUEST_NAME, ext.name.as_bytes());
            if let Some(value) = &ext.value {
                w.write_tlv(tag::EXTENDED_REQUEST_VALUE, value);
            }
        }),
        ProtocolOp::ExtendedResponse(ext) => {
            w.write_constructed(tag::EXTENDED_RESPONSE, |w| {
                encode_result_fields(w, &ext.result);
                if let Some(name) = &ext.name {
                    w.write_tlv(tag::EXTENDED_RESPONSE_NAME, name.as_bytes());
                }
                if let Some(value) = &ext.value {
                    w.write_tlv(tag::EXTENDED_RESPONSE_VALUE, value);
                }
            })
        }
        ProtocolOp::IntermediateResponse(intermediate) => {
            w.write_constructed(tag::INTERMEDIATE_RESPONSE, |w| {
                if let Some(name) = &intermediate.name {
                    w.write_tlv(tag::INTERMEDIATE_NAME, name.as_bytes());
                }
                if let Some(value) = &intermediate.value {
                    w.write_tlv(tag::INTERMEDIATE_VALUE, value);
                }
            })
        }
    }
}

/// Decode exactly one framed LDAPMessage.
///
/// Bytes left over after the message envelope yield
/// [`LdapError::UnprocessedSubstrate`].
pub fn decode_message(frame: &[u8]) -> Result<LdapMessage> {
    decode_envelope(frame).map_err(|err| match err {
        LdapError::Codec {
            message,
            position,
            buffer_preview: None,
        } => LdapError::codec_with_preview(message, position, frame),
        other => other,
    })
}

fn decode_envelope(frame: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(frame);
    let envelope = outer.expect(tag::SEQUENCE, "LDAPMessage")?;
    if !outer.is_empty() {
        return Err(LdapError::UnprocessedSubstrate {
            remaining: outer.remaining(),
        });
    }

    let mut r = envelope.reader();
    let id = r.read_unsigned("messageID")?;
    if id > MessageId::MAX {
        return Err(LdapError::codec(
            format!("message id {} exceeds maxInt", id),
            envelope.offset,
        ));
    }
    let op = decode_op(r.read_tlv()?)?;

    let mut controls = Vec::new();
    if let Some(tlv) = r.optional(tag::CONTROLS)? {
        let mut cr = tlv.reader();
        while !cr.is_empty() {
            controls.push(decode_control(cr.expect(tag::SEQUENCE, "Control")?)?);
        }
    }
    if !r.is_empty() {
        return Err(LdapError::UnprocessedSubstrate {
            remaining: r.remaining(),
        });
    }

    Ok(LdapMessage {
        message_id: MessageId::new(id),
        op,
        controls,
    })
}

fn decode_control(tlv: Tlv<'_>) -> Result<Control> {
    let mut r = tlv.reader();
    let oid = r.read_string("controlType")?;
    let criticality = match r.peek_tag() {
        Some(tag::BOOLEAN) => r.read_bool("criticality")?,
        _ => false,
    };
    let value = r.optional(tag::OCTET_STRING)?.map(|v| v.value.to_vec());
    r.finish("Control")?;
    Ok(Control {
        oid,
        criticality,
        value,
    })
}

fn decode_result_fields(r: &mut BerReader<'_>) -> Result<LdapResult> {
    let code = ResultCode(r.read_enumerated("resultCode")?);
    let matched_dn = r.read_string("matchedDN")?;
    let diagnostic_message = r.read_string("diagnosticMessage")?;
    let mut referrals = Vec::new();
    if let Some(tlv) = r.optional(tag::REFERRAL)? {
        let mut rr = tlv.reader();
        while !rr.is_empty() {
            referrals.push(rr.read_string("referral URI")?);
        }
    }
    Ok(LdapResult {
        code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn decode_result(tlv: Tlv<'_>, what: &str) -> Result<LdapResult> {
    let mut r = tlv.reader();
    let result = decode_result_fields(&mut r)?;
    r.finish(what)?;
    Ok(result)
}

fn decode_attribute(tlv: Tlv<'_>) -> Result<Attribute> {
    let mut r = tlv.reader();
    let name = r.read_string("attribute description")?;
    let set = r.expect(tag::SET, "attribute values")?;
    let mut vr = set.reader();
    let mut values = Vec::new();
    while !vr.is_empty() {
        values.push(vr.read_octets("attribute value")?.to_vec());
    }
    r.finish("attribute")?;
    Ok(Attribute { name, values })
}

fn decode_attributes(r: &mut BerReader<'_>) -> Result<Vec<Attribute>> {
    let list = r.expect(tag::SEQUENCE, "attribute list")?;
    let mut lr = list.reader();
    let mut attributes = Vec::new();
    while !lr.is_empty() {
        attributes.push(decode_attribute(lr.expect(tag::SEQUENCE, "attribute")?)?);
    }
    Ok(attributes)
}

fn decode_assertion(tlv: Tlv<'_>) -> Result<(String, Vec<u8>)> {
    let mut r = tlv.reader();
    let attribute = r.read_string("attributeDesc")?;
    let value = r.read_octets("assertionValue")?.to_vec();
    r.finish("attribute value assertion")?;
    Ok((attribute, value))
}

fn decode_filter_set(tlv: Tlv<'_>) -> Result<Vec<Filter>> {
    let mut r = tlv.reader();
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(decode_filter(r.read_tlv()?)?);
    }
    Ok(out)
}

pub(crate) fn decode_filter(tlv: Tlv<'_>) -> Result<Filter> {
    match tlv.tag {
        tag::FILTER_AND => Ok(Filter::And(decode_filter_set(tlv)?)),
        tag::FILTER_OR => Ok(Filter::Or(decode_filter_set(tlv)?)),
        tag::FILTER_NOT => {
            let mut r = tlv.reader();
            let inner = decode_filter(r.read_tlv()?)?;
            r.finish("not filter")?;
            Ok(Filter::Not(Box::new(inner)))
        }
        tag::FILTER_EQUALITY => {
            let (attr, value) = decode_assertion(tlv)?;
            Ok(Filter::Equality(attr, value))
        }
        tag::FILTER_GREATER_OR_EQUAL => {
            let (attr, value) = decode_assertion(tlv)?;
            Ok(Filter::GreaterOrEqual(attr, value))
        }
        tag::FILTER_LESS_OR_EQUAL => {
            let (attr, value) = decode_assertion(tlv)?;
            Ok(Filter::LessOrEqual(attr, value))
        }
        tag::FILTER_APPROX => {
            let (attr, value) = decode_assertion(tlv)?;
            Ok(Filter::Approx(attr, value))
        }
        tag::FILTER_PRESENT => Ok(Filter::Present(tlv.string()?)),
        tag::FILTER_SUBSTRINGS => {
            let mut r = tlv.reader();
            let attribute = r.read_string("substring attribute")?;
            let parts = r.expect(tag::SEQUENCE, "substrings")?;
            r.finish("substring filter")?;
            let mut pr = parts.reader();
            let (mut initial, mut any, mut last) = (None, Vec::new(), None);
            while !pr.is_empty() {
                let part = pr.read_tlv()?;
                match part.tag {
                    tag::SUBSTRING_INITIAL => initial = Some(part.value.to_vec()),
                    tag::SUBSTRING_ANY => any.push(part.value.to_vec()),
                    tag::SUBSTRING_FINAL => last = Some(part.value.to_vec()),
                    other => {
                        return Err(LdapError::codec(
                            format!("unknown substring choice 0x{:02x}", other),
                            part.offset,
                        ));
                    }
                }
            }
            Ok(Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            })
        }
        other => Err(LdapError::codec(
            format!("unsupported filter choice 0x{:02x}", other),
            tlv.offset,
        )),
    }
}

fn optional_string(tlv: Option<Tlv<'_>>) -> Result<Option<String>> {
    tlv.map(|t| t.string()).transpose()
}

fn decode_op(tlv: Tlv<'_>) -> Result<ProtocolOp> {
    let op = match tlv.tag {
        tag::BIND_REQUEST => {
            let mut r = tlv.reader();
            let version = r.read_unsigned("version")?;
            let name = r.read_string("bind name")?;
            let auth = r.read_tlv()?;
            let authentication = match auth.tag {
                tag::AUTH_SIMPLE => BindAuthentication::Simple(auth.string()?),
                tag::AUTH_SASL => {
                    let mut ar = auth.reader();
                    let mechanism = ar.read_string("SASL mechanism")?;
                    let credentials = ar.optional(tag::OCTET_STRING)?.map(|c| c.value.to_vec());
                    ar.finish("SASL credentials")?;
                    BindAuthentication::Sasl {
                        mechanism,
                        credentials,
                    }
                }
                other => {
                    return Err(LdapError::codec(
                        format!("unknown authentication choice 0x{:02x}", other),
                        auth.offset,
                    ));
                }
            };
            r.finish("bind request")?;
            ProtocolOp::BindRequest(BindRequest {
                version: u8::try_from(version)
                    .map_err(|_| LdapError::codec("bind version out of range", tlv.offset))?,
                name,
                authentication,
            })
        }
        tag::BIND_RESPONSE => {
            let mut r = tlv.reader();
            let result = decode_result_fields(&mut r)?;
            let server_sasl_creds = r
                .optional(tag::SERVER_SASL_CREDS)?
                .map(|c| c.value.to_vec());
            r.finish("bind response")?;
            ProtocolOp::BindResponse(BindResponse {
                result,
                server_sasl_creds,
            })
        }
        tag::UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        tag::SEARCH_REQUEST => {
            let mut r = tlv.reader();
            let base = r.read_string("baseObject")?;
            let scope_offset = tlv.offset;
            let scope = SearchScope::from_wire(r.read_enumerated("scope")?)
                .ok_or_else(|| LdapError::codec("unknown search scope", scope_offset))?;
            let deref_aliases = DerefAliases::from_wire(r.read_enumerated("derefAliases")?)
                .ok_or_else(|| LdapError::codec("unknown derefAliases value", scope_offset))?;
            let size_limit = r.read_unsigned("sizeLimit")?;
            let time_limit = r.read_unsigned("timeLimit")?;
            let types_only = r.read_bool("typesOnly")?;
            let filter = decode_filter(r.read_tlv()?)?;
            let list = r.expect(tag::SEQUENCE, "attribute selection")?;
            let mut lr = list.reader();
            let mut attributes = Vec::new();
            while !lr.is_empty() {
                attributes.push(lr.read_string("attribute selector")?);
            }
            r.finish("search request")?;
            ProtocolOp::SearchRequest(SearchRequest {
                base,
                scope,
                deref_aliases,
                size_limit,
                time_limit,
                types_only,
                filter,
                attributes,
            })
        }
        tag::SEARCH_RESULT_ENTRY => {
            let mut r = tlv.reader();
            let dn = r.read_string("objectName")?;
            let attributes = decode_attributes(&mut r)?;
            r.finish("search entry")?;
            ProtocolOp::SearchResultEntry(SearchEntry { dn, attributes })
        }
        tag::SEARCH_RESULT_DONE => {
            ProtocolOp::SearchResultDone(decode_result(tlv, "search done")?)
        }
        tag::SEARCH_RESULT_REFERENCE => {
            let mut r = tlv.reader();
            let mut urls = Vec::new();
            while !r.is_empty() {
                urls.push(r.read_string("continuation reference")?);
            }
            ProtocolOp::SearchResultReference(urls)
        }
        tag::MODIFY_REQUEST => {
            let mut r = tlv.reader();
            let dn = r.read_string("object")?;
            let list = r.expect(tag::SEQUENCE, "changes")?;
            r.finish("modify request")?;
            let mut lr = list.reader();
            let mut changes = Vec::new();
            while !lr.is_empty() {
                let change = lr.expect(tag::SEQUENCE, "change")?;
                let mut cr = change.reader();
                let operation = ModifyOperation::from_wire(cr.read_enumerated("operation")?)
                    .ok_or_else(|| LdapError::codec("unknown modify operation", change.offset))?;
                let attribute = decode_attribute(cr.expect(tag::SEQUENCE, "modification")?)?;
                cr.finish("change")?;
                changes.push(Modification {
                    operation,
                    attribute,
                });
            }
            ProtocolOp::ModifyRequest(ModifyRequest { dn, changes })
        }
        tag::MODIFY_RESPONSE => ProtocolOp::ModifyResponse(decode_result(tlv, "modify response")?),
        tag::ADD_REQUEST => {
            let mut r = tlv.reader();
            let dn = r.read_string("entry")?;
            let attributes = decode_attributes(&mut r)?;
            r.finish("add request")?;
            ProtocolOp::AddRequest(AddRequest { dn, attributes })
        }
        tag::ADD_RESPONSE => ProtocolOp::AddResponse(decode_result(tlv, "add response")?),
        tag::DEL_REQUEST => ProtocolOp::DelRequest(tlv.string()?),
        tag::DEL_RESPONSE => ProtocolOp::DelResponse(decode_result(tlv, "delete response")?),
        tag::MODIFY_DN_REQUEST => {
            let mut r = tlv.reader();
            let dn = r.read_string("entry")?;
            let new_rdn = r.read_string("newrdn")?;
            let delete_old_rdn = r.read_bool("deleteoldrdn")?;
            let new_superior = optional_string(r.optional(tag::NEW_SUPERIOR)?)?;
            r.finish("modify DN request")?;
            ProtocolOp::ModifyDnRequest(ModifyDnRequest {
                dn,
                new_rdn,
                delete_old_rdn,
                new_superior,
            })
        }
        tag::MODIFY_DN_RESPONSE => {
            ProtocolOp::ModifyDnResponse(decode_result(tlv, "modify DN response")?)
        }
        tag::COMPARE_REQUEST => {
            let mut r = tlv.reader();
            let dn = r.read_string("entry")?;
            let (attribute, value) = decode_assertion(r.expect(tag::SEQUENCE, "ava")?)?;
            r.finish("compare request")?;
            ProtocolOp::CompareRequest(CompareRequest {
                dn,
                attribute,
                value,
            })
        }
        tag::COMPARE_RESPONSE => {
            ProtocolOp::CompareResponse(decode_result(tlv, "compare response")?)
        }
        tag::ABANDON_REQUEST => ProtocolOp::AbandonRequest(MessageId::new(tlv.unsigned()?)),
        tag::EXTENDED_REQUEST => {
            let mut r = tlv.reader();
            let name = r.expect(tag::EXTENDED_REQUEST_NAME, "requestName")?.string()?;
            let value = r
                .optional(tag::EXTENDED_REQUEST_VALUE)?
                .map(|v| v.value.to_vec());
            r.finish("extended request")?;
            ProtocolOp::ExtendedRequest(ExtendedRequest { name, value })
        }
        tag::EXTENDED_RESPONSE => {
            let mut r = tlv.reader();
            let result = decode_result_fields(&mut r)?;
            let name = optional_string(r.optional(tag::EXTENDED_RESPONSE_NAME)?)?;
            let value = r
                .optional(tag::EXTENDED_RESPONSE_VALUE)?
                .map(|v| v.value.to_vec());
            r.finish("extended response")?;
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result,
                name,
                value,
            })
        }
        tag::INTERMEDIATE_RESPONSE => {
            let mut r = tlv.reader();
            let name = optional_string(r.optional(tag::INTERMEDIATE_NAME)?)?;
            let value = r.optional(tag::INTERMEDIATE_VALUE)?.map(|v| v.value.to_vec());
            r.finish("intermediate response")?;
            ProtocolOp::IntermediateResponse(IntermediateResponse { name, value })
        }
        other => {
            return Err(LdapError::codec(
                format!("unknown protocolOp tag 0x{:02x}", other),
                tlv.offset.saturating_sub(2),
            ));
        }
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NOTICE_OF_DISCONNECTION_OID, OperationKind};

    fn message(id: u32, op: ProtocolOp) -> LdapMessage {
        LdapMessage::new(MessageId::new(id), op)
    }

    #[test]
    fn test_encode_simple_bind() {
        let msg = message(
            1,
            ProtocolOp::BindRequest(BindRequest {
                version: 3,
                name: "cn=admin".to_string(),
                authentication: BindAuthentication::Simple("pw".to_string()),
            }),
        );
        let expected = [
            0x30, 0x16, 0x02, 0x01, 0x01, 0x60, 0x11, 0x02, 0x01, 0x03, 0x04, 0x08, b'c', b'n',
            b'=', b'a', b'd', b'm', b'i', b'n', 0x80, 0x02, b'p', b'w',
        ];
        assert_eq!(encode_message(&msg), expected);
    }

    #[test]
    fn test_decode_bind_response() {
        // {id 1, bindResponse success}
        let frame = [
            0x30, 0x0c, 0x02, 0x01, 0x01, 0x61, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
        ];
        let msg = decode_message(&frame).unwrap();
        assert_eq!(msg.message_id, MessageId::new(1));
        assert_eq!(msg.op.response_kind(), Some(OperationKind::Bind));
        assert_eq!(msg.op.result().map(|r| r.code), Some(ResultCode::SUCCESS));
        assert!(msg.is_final());
    }

    #[test]
    fn test_integer_encoding_is_minimal() {
        let cases: [(i64, &[u8]); 6] = [
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x00, 0x80]),
            (256, &[0x01, 0x00]),
            (-1, &[0xff]),
            (i64::from(MessageId::MAX), &[0x7f, 0xff, 0xff, 0xff]),
        ];
        for (value, expected) in cases {
            let mut w = BerWriter::new();
            w.write_integer(tag::INTEGER, value);
            let bytes = w.into_bytes();
            assert_eq!(&bytes[2..], expected, "encoding of {}", value);
            let tlv = BerReader::new(&bytes).read_tlv().unwrap();
            assert_eq!(tlv.integer().unwrap(), value);
        }
    }

    #[test]
    fn test_long_form_length() {
        let entry = ProtocolOp::SearchResultEntry(SearchEntry {
            dn: "cn=big".to_string(),
            attributes: vec![Attribute::new("description", [vec![b'x'; 300]])],
        });
        let bytes = encode_message(&message(7, entry.clone()));
        assert_eq!(bytes[1], 0x82);
        let decoded = decode_message(&bytes).unwrap();
        assert_eq!(decoded.op, entry);
    }

    #[test]
    fn test_trailing_bytes_are_unprocessed_substrate() {
        let mut bytes = encode_message(&message(2, ProtocolOp::DelResponse(LdapResult::success())));
        bytes.extend_from_slice(&[0x00, 0x00]);
        match decode_message(&bytes) {
            Err(LdapError::UnprocessedSubstrate { remaining }) => assert_eq!(remaining, 2),
            other => panic!("expected UnprocessedSubstrate, got {:?}", other),
        }
    }

    #[test]
    fn test_junk_inside_envelope_is_unprocessed_substrate() {
        // Valid delResponse followed by a stray NULL inside the envelope
        let frame = [
            0x30, 0x0e, 0x02, 0x01, 0x02, 0x6b, 0x07, 0x0a, 0x01, 0x00, 0x04, 0x00, 0x04, 0x00,
            0x05, 0x00,
        ];
        assert!(matches!(
            decode_message(&frame),
            Err(LdapError::UnprocessedSubstrate { remaining: 2 })
        ));
    }

    #[test]
    fn test_unknown_op_carries_preview() {
        let frame = [0x30, 0x05, 0x02, 0x01, 0x01, 0x5f, 0x00];
        let err = decode_message(&frame).unwrap_err();
        assert!(err.to_string().contains("frame preview: 30 05 02 01 01"));
    }

    #[test]
    fn test_truncated_value_is_codec_error() {
        let frame = [0x30, 0x05, 0x02, 0x04, 0x01];
        assert!(matches!(
            decode_message(&frame),
            Err(LdapError::Codec { .. })
        ));
    }

    #[test]
    fn test_filter_and_controls_survive_decoding() {
        let search = ProtocolOp::SearchRequest(SearchRequest {
            base: "dc=example,dc=com".to_string(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 30,
            types_only: false,
            filter: Filter::And(vec![
                Filter::equality("objectClass", "person"),
                Filter::Not(Box::new(Filter::present("disabled"))),
                Filter::Substrings {
                    attribute: "cn".to_string(),
                    initial: Some(b"Jo".to_vec()),
                    any: vec![b"h".to_vec()],
                    last: None,
                },
            ]),
            attributes: vec!["cn".to_string(), "mail".to_string()],
        });
        let mut msg = message(9, search);
        msg.controls
            .push(Control::new("1.2.840.113556.1.4.319", true, Some(vec![0x30, 0x00])));

        let decoded = decode_message(&encode_message(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_notice_of_disconnection_decodes() {
        let notice = message(
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::with_code(ResultCode::UNAVAILABLE, "going down"),
                name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                value: None,
            }),
        );
        let decoded = decode_message(&encode_message(&notice)).unwrap();
        assert!(decoded.is_notice_of_disconnection());
    }
}
