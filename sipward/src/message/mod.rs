//! SIP Message types
//!
//! The module provides the [`SipMsg`] enum that can be a [`SipMsg::Request`]
//! or [`SipMsg::Response`] and represents a SIP message. Messages are owned
//! and cheaply cloneable; the proxy mutates them by cloning with edits.

use bytes::Bytes;

use crate::headers::{Header, Headers};

pub mod auth;

mod code;
mod method;
mod transport;
mod uri;

pub use code::*;
pub use method::*;
pub use transport::*;
pub use uri::*;

/// The SIP protocol version emitted on every start line.
pub const SIPV2: &str = "SIP/2.0";

/// An SIP message, either Request or Response.
#[derive(Debug, Clone)]
pub enum SipMsg {
    /// An SIP Request.
    Request(Request),
    /// An SIP Response.
    Response(Response),
}

impl SipMsg {
    /// Returns `true` if this message is a [`Request`].
    pub const fn is_request(&self) -> bool {
        matches!(self, SipMsg::Request(_))
    }

    /// Returns `true` if this message is a [`Response`].
    pub const fn is_response(&self) -> bool {
        matches!(self, SipMsg::Response(_))
    }

    /// Returns a reference to the headers of the message.
    pub fn headers(&self) -> &Headers {
        match self {
            SipMsg::Request(req) => &req.headers,
            SipMsg::Response(res) => &res.headers,
        }
    }

    /// Returns a mutable reference to the headers of the message.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMsg::Request(req) => &mut req.headers,
            SipMsg::Response(res) => &mut res.headers,
        }
    }

    /// Returns a reference to the message body.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMsg::Request(req) => req.body.as_ref(),
            SipMsg::Response(res) => res.body.as_ref(),
        }
    }
}

impl From<Request> for SipMsg {
    fn from(request: Request) -> Self {
        SipMsg::Request(request)
    }
}

impl From<Response> for SipMsg {
    fn from(response: Response) -> Self {
        SipMsg::Response(response)
    }
}

/// The first line of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: SipMethod,
    pub uri: SipUri,
}

impl std::fmt::Display for RequestLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.method, self.uri, SIPV2)
    }
}

/// An SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub req_line: RequestLine,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Request {
    /// Creates a request with empty headers and no body.
    pub fn new(method: SipMethod, uri: SipUri) -> Self {
        Self {
            req_line: RequestLine { method, uri },
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns the request method.
    pub fn method(&self) -> SipMethod {
        self.req_line.method
    }

    /// Returns the request URI.
    pub fn uri(&self) -> &SipUri {
        &self.req_line.uri
    }
}

/// The first line of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: String,
}

impl StatusLine {
    pub fn new(code: StatusCode, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for StatusLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", SIPV2, self.code, self.reason)
    }
}

/// An SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_line: StatusLine,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates a response with the default reason phrase for `code`.
    pub fn new(code: StatusCode) -> Self {
        Self {
            status_line: StatusLine::new(code, code.reason()),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    /// Removes the topmost `Via` header and returns it.
    pub fn pop_via(&mut self) -> Option<Header> {
        self.headers.pop_via()
    }
}
