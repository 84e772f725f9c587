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

//! Typed LDAP v3 messages (RFC 4511).

use std::fmt;

/// OID of the Notice of Disconnection unsolicited notification
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";
/// OID of the StartTLS extended operation
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";
/// OID of the "Who am I?" extended operation (RFC 4532)
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Message identifier of one request/response exchange on a connection.
///
/// Zero is reserved for unsolicited notifications sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u32);

impl MessageId {
    /// Identifier carried by unsolicited notifications
    pub const UNSOLICITED: MessageId = MessageId(0);
    /// Largest identifier allowed on the wire (maxInt)
    pub const MAX: u32 = i32::MAX as u32;

    pub fn new(id: u32) -> Self {
        MessageId(id)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_unsolicited(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result code of an `LDAPResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);
    pub const OPERATIONS_ERROR: ResultCode = ResultCode(1);
    pub const PROTOCOL_ERROR: ResultCode = ResultCode(2);
    pub const TIME_LIMIT_EXCEEDED: ResultCode = ResultCode(3);
    pub const SIZE_LIMIT_EXCEEDED: ResultCode = ResultCode(4);
    pub const COMPARE_FALSE: ResultCode = ResultCode(5);
    pub const COMPARE_TRUE: ResultCode = ResultCode(6);
    pub const REFERRAL: ResultCode = ResultCode(10);
    pub const ADMIN_LIMIT_EXCEEDED: ResultCode = ResultCode(11);
    pub const SASL_BIND_IN_PROGRESS: ResultCode = ResultCode(14);
    pub const NO_SUCH_OBJECT: ResultCode = ResultCode(32);
    pub const INVALID_CREDENTIALS: ResultCode = ResultCode(49);
    pub const BUSY: ResultCode = ResultCode(51);
    pub const UNAVAILABLE: ResultCode = ResultCode(52);
    pub const UNWILLING_TO_PERFORM: ResultCode = ResultCode(53);
    pub const OTHER: ResultCode = ResultCode(80);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "success",
            1 => "operationsError",
            2 => "protocolError",
            3 => "timeLimitExceeded",
            4 => "sizeLimitExceeded",
            5 => "compareFalse",
            6 => "compareTrue",
            10 => "referral",
            11 => "adminLimitExceeded",
            14 => "saslBindInProgress",
            32 => "noSuchObject",
            49 => "invalidCredentials",
            51 => "busy",
            52 => "unavailable",
            53 => "unwillingToPerform",
            80 => "other",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// The operation an outstanding request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Bind,
    Unbind,
    Search,
    Compare,
    Add,
    Delete,
    Modify,
    ModifyDn,
    Extended,
    Abandon,
}

impl OperationKind {
    /// Unbind and abandon never receive a response.
    pub fn expects_response(self) -> bool {
        !matches!(self, OperationKind::Unbind | OperationKind::Abandon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(oid: impl Into<String>, criticality: bool, value: Option<Vec<u8>>) -> Self {
        Self {
            oid: oid.into(),
            criticality,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Values rendered as UTF-8, replacing invalid sequences
    pub fn text_values(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub authentication: BindAuthentication,
}

impl BindRequest {
    pub fn is_sasl(&self) -> bool {
        matches!(self.authentication, BindAuthentication::Sasl { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl SearchScope {
    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(SearchScope::BaseObject),
            1 => Some(SearchScope::SingleLevel),
            2 => Some(SearchScope::WholeSubtree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObject = 2,
    Always = 3,
}

impl DerefAliases {
    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(DerefAliases::Never),
            1 => Some(DerefAliases::InSearching),
            2 => Some(DerefAliases::FindingBaseObject),
            3 => Some(DerefAliases::Always),
            _ => None,
        }
    }
}

/// Search filter in its structured form.
///
/// Parsing the RFC 4515 string representation is left to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, Vec<u8>),
    Substrings {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
    GreaterOrEqual(String, Vec<u8>),
    LessOrEqual(String, Vec<u8>),
    Present(String),
    Approx(String, Vec<u8>),
}

impl Filter {
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present(attribute.into())
    }

    pub fn equality(attribute: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Filter::Equality(attribute.into(), value.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl ModifyOperation {
    pub(crate) fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(ModifyOperation::Add),
            1 => Some(ModifyOperation::Delete),
            2 => Some(ModifyOperation::Replace),
            3 => Some(ModifyOperation::Increment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub operation: ModifyOperation,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub dn: String,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub dn: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub dn: String,
    pub attribute: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::with_code(ResultCode::SUCCESS, "")
    }

    pub fn with_code(code: ResultCode, diagnostic_message: impl Into<String>) -> Self {
        Self {
            code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.into(),
            referrals: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Vec<Attribute>,
}

impl SearchEntry {
    /// Look up an attribute by name, ignoring ASCII case
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub name: Option<String>,
    pub value: Option<Vec<u8>>,
}

/// Every protocol operation of RFC 4511, requests and responses alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchEntry),
    SearchResultDone(LdapResult),
    SearchResultReference(Vec<String>),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(String),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(MessageId),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    /// The operation a request starts, or `None` for responses.
    pub fn request_kind(&self) -> Option<OperationKind> {
        match self {
            ProtocolOp::BindRequest(_) => Some(OperationKind::Bind),
            ProtocolOp::UnbindRequest => Some(OperationKind::Unbind),
            ProtocolOp::SearchRequest(_) => Some(OperationKind::Search),
            ProtocolOp::ModifyRequest(_) => Some(OperationKind::Modify),
            ProtocolOp::AddRequest(_) => Some(OperationKind::Add),
            ProtocolOp::DelRequest(_) => Some(OperationKind::Delete),
            ProtocolOp::ModifyDnRequest(_) => Some(OperationKind::ModifyDn),
            ProtocolOp::CompareRequest(_) => Some(OperationKind::Compare),
            ProtocolOp::AbandonRequest(_) => Some(OperationKind::Abandon),
            ProtocolOp::ExtendedRequest(_) => Some(OperationKind::Extended),
            ProtocolOp::BindResponse(_)
            | ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultDone(_)
            | ProtocolOp::SearchResultReference(_)
            | ProtocolOp::ModifyResponse(_)
            | ProtocolOp::AddResponse(_)
            | ProtocolOp::DelResponse(_)
            | ProtocolOp::ModifyDnResponse(_)
            | ProtocolOp::CompareResponse(_)
            | ProtocolOp::ExtendedResponse(_)
            | ProtocolOp::IntermediateResponse(_) => None,
        }
    }

    /// The operation a response answers.
    ///
    /// Intermediate responses may answer any operation and yield `None`,
    /// as do requests.
    pub fn response_kind(&self) -> Option<OperationKind> {
        match self {
            ProtocolOp::BindResponse(_) => Some(OperationKind::Bind),
            ProtocolOp::SearchResultEntry(_)
            | ProtocolOp::SearchResultDone(_)
            | ProtocolOp::SearchResultReference(_) => Some(OperationKind::Search),
            ProtocolOp::ModifyResponse(_) => Some(OperationKind::Modify),
            ProtocolOp::AddResponse(_) => Some(OperationKind::Add),
            ProtocolOp::DelResponse(_) => Some(OperationKind::Delete),
            ProtocolOp::ModifyDnResponse(_) => Some(OperationKind::ModifyDn),
            ProtocolOp::CompareResponse(_) => Some(OperationKind::Compare),
            ProtocolOp::ExtendedResponse(_) => Some(OperationKind::Extended),
            _ => None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.request_kind().is_some()
    }

    /// False only for the interim messages of a multi-message exchange.
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            ProtocolOp::SearchResultEntry(_)
                | ProtocolOp::SearchResultReference(_)
                | ProtocolOp::IntermediateResponse(_)
        )
    }

    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDnResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "bindRequest",
            ProtocolOp::BindResponse(_) => "bindResponse",
            ProtocolOp::UnbindRequest => "unbindRequest",
            ProtocolOp::SearchRequest(_) => "searchRequest",
            ProtocolOp::SearchResultEntry(_) => "searchResEntry",
            ProtocolOp::SearchResultDone(_) => "searchResDone",
            ProtocolOp::SearchResultReference(_) => "searchResRef",
            ProtocolOp::ModifyRequest(_) => "modifyRequest",
            ProtocolOp::ModifyResponse(_) => "modifyResponse",
            ProtocolOp::AddRequest(_) => "addRequest",
            ProtocolOp::AddResponse(_) => "addResponse",
            ProtocolOp::DelRequest(_) => "delRequest",
            ProtocolOp::DelResponse(_) => "delResponse",
            ProtocolOp::ModifyDnRequest(_) => "modDNRequest",
            ProtocolOp::ModifyDnResponse(_) => "modDNResponse",
            ProtocolOp::CompareRequest(_) => "compareRequest",
            ProtocolOp::CompareResponse(_) => "compareResponse",
            ProtocolOp::AbandonRequest(_) => "abandonRequest",
            ProtocolOp::ExtendedRequest(_) => "extendedReq",
            ProtocolOp::ExtendedResponse(_) => "extendedResp",
            ProtocolOp::IntermediateResponse(_) => "intermediateResponse",
        }
    }
}

/// One `LDAPMessage` envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapMessage {
    pub message_id: MessageId,
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: MessageId, op: ProtocolOp) -> Self {
        Self {
            message_id,
            op,
            controls: Vec::new(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.op.is_final()
    }

    /// An unsolicited extended response announcing that the server is
    /// about to drop the connection.
    pub fn is_notice_of_disconnection(&self) -> bool {
        self.message_id.is_unsolicited()
            && matches!(
                &self.op,
                ProtocolOp::ExtendedResponse(ExtendedResponse { name: Some(name), .. })
                    if name == NOTICE_OF_DISCONNECTION_OID
            )
    }
}

/// A request that has not been numbered yet.
///
/// Strategies assign the message id when the request is transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl Request {
    pub fn new(op: ProtocolOp) -> Self {
        Self {
            op,
            controls: Vec::new(),
        }
    }

    pub fn with_control(mut self, control: Control) -> Self {
        self.controls.push(control);
        self
    }

    pub fn kind(&self) -> Option<OperationKind> {
        self.op.request_kind()
    }

    pub(crate) fn is_start_tls(&self) -> bool {
        matches!(&self.op, ProtocolOp::ExtendedRequest(ext) if ext.name == START_TLS_OID)
    }

    pub(crate) fn is_sasl_bind(&self) -> bool {
        matches!(&self.op, ProtocolOp::BindRequest(bind) if bind.is_sasl())
    }
}
