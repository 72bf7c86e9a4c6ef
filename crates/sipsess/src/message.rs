//! Structured SIP message model
//!
//! The session layer never sees message bytes: the transport hands it
//! already-parsed requests and responses in this shape, and serialises the
//! ones it produces. Only the headers the session layer reasons about are
//! broken out into fields; everything else travels in `headers` verbatim.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::errors::SessionError;

/// Message body (offer/answer content is opaque to this crate)
pub type Body = Bytes;

/// SIP request methods understood by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Prack,
    Update,
    Info,
    Refer,
    Notify,
    Options,
}

impl Method {
    /// Canonical upper-case method name
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INVITE" => Ok(Method::Invite),
            "ACK" => Ok(Method::Ack),
            "BYE" => Ok(Method::Bye),
            "CANCEL" => Ok(Method::Cancel),
            "PRACK" => Ok(Method::Prack),
            "UPDATE" => Ok(Method::Update),
            "INFO" => Ok(Method::Info),
            "REFER" => Ok(Method::Refer),
            "NOTIFY" => Ok(Method::Notify),
            "OPTIONS" => Ok(Method::Options),
            other => Err(SessionError::invalid_argument(format!("unknown method {}", other))),
        }
    }
}

/// CSeq header value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// From/To header value: an address plus optional dialog tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub uri: String,
    pub tag: Option<String>,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into(), tag: None }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// A header carried verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// RAck header value (RFC 3262 §7.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RAck {
    pub rseq: u32,
    pub cseq: u32,
    pub method: Method,
}

impl FromStr for RAck {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let malformed = || SessionError::invalid_argument(format!("malformed RAck: {}", s));

        let rseq = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let cseq = parts.next().and_then(|p| p.parse().ok()).ok_or_else(malformed)?;
        let method = parts.next().ok_or_else(malformed)?.parse()?;
        if parts.next().is_some() {
            return Err(malformed());
        }

        Ok(RAck { rseq, cseq, method })
    }
}

impl fmt::Display for RAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.rseq, self.cseq, self.method)
    }
}

fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn headers_named<'a>(headers: &'a [Header], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

fn contains_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers_named(headers, name)
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: Method,
    pub uri: String,
    pub via: Vec<String>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub contact: Option<String>,
    pub record_route: Vec<String>,
    pub route: Vec<String>,
    pub headers: Vec<Header>,
    pub content_type: Option<String>,
    pub body: Body,
}

impl SipRequest {
    /// Create a request with the mandatory dialog fields set
    pub fn new(
        method: Method,
        uri: impl Into<String>,
        call_id: impl Into<String>,
        cseq: u32,
        from: NameAddr,
        to: NameAddr,
    ) -> Self {
        Self {
            method,
            uri: uri.into(),
            via: Vec::new(),
            from,
            to,
            call_id: call_id.into(),
            cseq: CSeq::new(cseq, method),
            contact: None,
            record_route: Vec::new(),
            route: Vec::new(),
            headers: Vec::new(),
            content_type: None,
            body: Body::new(),
        }
    }

    pub fn with_via(mut self, via: impl Into<String>) -> Self {
        self.via.push(via.into());
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Body>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    /// First value of the named header
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether a comma-separated header (Supported, Require, ...) lists `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        contains_token(&self.headers, name, token)
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// Parsed RAck header, if present and well-formed
    pub fn rack(&self) -> Option<RAck> {
        self.header("RAck").and_then(|v| v.parse().ok())
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub via: Vec<String>,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: String,
    pub cseq: CSeq,
    pub contact: Option<String>,
    pub record_route: Vec<String>,
    pub headers: Vec<Header>,
    pub content_type: Option<String>,
    pub body: Body,
}

impl SipResponse {
    /// Build a response copying the transaction and dialog fields of `request`
    pub fn for_request(request: &SipRequest, status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            via: request.via.clone(),
            from: request.from.clone(),
            to: request.to.clone(),
            call_id: request.call_id.clone(),
            cseq: request.cseq,
            contact: None,
            record_route: request.record_route.clone(),
            headers: Vec::new(),
            content_type: None,
            body: Body::new(),
        }
    }

    pub fn with_to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to.tag = Some(tag.into());
        self
    }

    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: impl Into<Body>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// All values of the named header, in order
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        headers_named(&self.headers, name)
    }

    pub fn has_token(&self, name: &str, token: &str) -> bool {
        contains_token(&self.headers, name, token)
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    /// RSeq header value, if present and numeric
    pub fn rseq(&self) -> Option<u32> {
        self.header("RSeq").and_then(|v| v.trim().parse().ok())
    }

    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Either kind of message, as handed to session handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn call_id(&self) -> &str {
        match self {
            SipMessage::Request(r) => &r.call_id,
            SipMessage::Response(r) => &r.call_id,
        }
    }

    pub fn cseq(&self) -> CSeq {
        match self {
            SipMessage::Request(r) => r.cseq,
            SipMessage::Response(r) => r.cseq,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            SipMessage::Request(r) => r.content_type.as_deref(),
            SipMessage::Response(r) => r.content_type.as_deref(),
        }
    }

    pub fn body(&self) -> &Body {
        match self {
            SipMessage::Request(r) => &r.body,
            SipMessage::Response(r) => &r.body,
        }
    }

    pub fn has_body(&self) -> bool {
        !self.body().is_empty()
    }
}

impl From<SipRequest> for SipMessage {
    fn from(request: SipRequest) -> Self {
        SipMessage::Request(request)
    }
}

impl From<SipResponse> for SipMessage {
    fn from(response: SipResponse) -> Self {
        SipMessage::Response(response)
    }
}

/// Default reason phrase for status codes the session layer emits itself
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        504 => "Server Time-out",
        _ => "",
    }
}
