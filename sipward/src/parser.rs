//! SIP message parsing.
//!
//! [`Parser::parse`] turns raw bytes into the typed [`SipMsg`] the rest of
//! the server consumes. Serialization is the reverse path, implemented by
//! `Display` on every header and the outgoing-message wrappers.

use bytes::Bytes;

use crate::error::{Error, Result, SipParseError};
use crate::headers::{Header, Headers};
use crate::macros::parse_error;
use crate::message::{Request, RequestLine, Response, SIPV2, SipMethod, SipMsg, SipUri, StatusCode, StatusLine};

/// The SIP message parser.
pub struct Parser;

/// A parse failure, carrying whatever was recovered ahead of it.
///
/// A message that identified itself as a request before going wrong keeps
/// its request line and every header parsed so far, so the caller can
/// still answer 400 instead of dropping the packet.
#[derive(Debug)]
pub struct ParseFailure {
    pub error: Error,
    /// The malformed request as recovered, body discarded. `None` for
    /// responses and for bytes too broken to identify.
    pub request: Option<Request>,
}

impl ParseFailure {
    fn bare(error: Error) -> Self {
        Self { error, request: None }
    }
}

/// The start line, parsed ahead of the headers so a later failure can
/// still name the message it belongs to.
enum StartLine {
    Request(RequestLine),
    Response(StatusLine),
}

impl StartLine {
    fn into_failure(self, error: Error, headers: Headers) -> ParseFailure {
        match self {
            StartLine::Request(req_line) => ParseFailure {
                error,
                request: Some(Request {
                    req_line,
                    headers,
                    body: None,
                }),
            },
            StartLine::Response(_) => ParseFailure::bare(error),
        }
    }
}

impl Parser {
    /// Parses a complete SIP message from raw bytes.
    ///
    /// Header names are case-insensitive and compact forms are accepted.
    /// Lines end with CRLF; a bare LF is tolerated. The body is bounded by
    /// `Content-Length` when present, otherwise the remainder of the
    /// buffer is taken.
    pub fn parse(buf: &[u8]) -> Result<SipMsg> {
        Self::parse_detailed(buf).map_err(|failure| failure.error)
    }

    /// Like [`Parser::parse`], but a failure carries the header state
    /// recovered before it.
    pub fn parse_detailed(buf: &[u8]) -> std::result::Result<SipMsg, ParseFailure> {
        let (head, body) = split_head(buf).map_err(ParseFailure::bare)?;
        let text = std::str::from_utf8(head)
            .map_err(|_| ParseFailure::bare(SipParseError::new("message head is not valid UTF-8").into()))?;

        let mut lines = lines_unfolded(text);
        let Some(start_line) = lines.next() else {
            return Err(ParseFailure::bare(SipParseError::new("empty message").into()));
        };

        let start = if let Some(status) = start_line.strip_prefix(SIPV2) {
            let status = status.trim_start();
            let (code, reason) = match status.split_once(' ') {
                Some((code, reason)) => (code, reason.trim()),
                None => (status, ""),
            };
            let Ok(code) = code.parse::<u16>() else {
                return Err(ParseFailure::bare(
                    SipParseError::new(format!("malformed status line: {start_line}")).into(),
                ));
            };
            StartLine::Response(StatusLine::new(StatusCode::from(code), reason))
        } else {
            let mut parts = start_line.split_whitespace();
            let (Some(method), Some(uri), Some(SIPV2)) = (parts.next(), parts.next(), parts.next()) else {
                return Err(ParseFailure::bare(
                    SipParseError::new(format!("malformed request line: {start_line}")).into(),
                ));
            };
            let method = SipMethod::from(method);
            let uri = SipUri::parse(uri).map_err(|err| ParseFailure::bare(err.into()))?;

            StartLine::Request(RequestLine { method, uri })
        };

        // A bad header does not end the scan: the rest of the header
        // section is still recovered for the 400 answer.
        let mut headers = Headers::with_capacity(8);
        let mut header_error: Option<Error> = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                header_error
                    .get_or_insert_with(|| SipParseError::new(format!("malformed header line: {line}")).into());
                continue;
            };
            match Header::parse(name.trim(), value.trim()) {
                Ok(header) => headers.push(header),
                Err(err) => {
                    header_error.get_or_insert(err);
                }
            }
        }
        if let Some(error) = header_error {
            return Err(start.into_failure(error, headers));
        }

        let content_length = headers.iter().find_map(|h| match h {
            Header::ContentLength(cl) => Some(cl.value() as usize),
            _ => None,
        });
        let body = match content_length {
            Some(len) if len > body.len() => {
                let error =
                    SipParseError::new(format!("Content-Length {len} exceeds available body of {}", body.len()));
                return Err(start.into_failure(error.into(), headers));
            }
            Some(len) => &body[..len],
            None => body,
        };
        let body = (!body.is_empty()).then(|| Bytes::copy_from_slice(body));

        match start {
            StartLine::Request(req_line) => Ok(SipMsg::Request(Request {
                req_line,
                headers,
                body,
            })),
            StartLine::Response(status_line) => Ok(SipMsg::Response(Response {
                status_line,
                headers,
                body,
            })),
        }
    }
}

/// Splits the buffer at the blank line terminating the header section.
fn split_head(buf: &[u8]) -> Result<(&[u8], &[u8])> {
    if let Some(pos) = find_subslice(buf, b"\r\n\r\n") {
        Ok((&buf[..pos], &buf[pos + 4..]))
    } else if let Some(pos) = find_subslice(buf, b"\n\n") {
        Ok((&buf[..pos], &buf[pos + 2..]))
    } else {
        parse_error!("message has no header terminator")
    }
}

fn find_subslice(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}

/// Iterates header-section lines with RFC3261 folding undone: a line
/// starting with whitespace continues the previous one.
fn lines_unfolded(text: &str) -> impl Iterator<Item = String> {
    let mut merged: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if line.starts_with([' ', '\t'])
            && let Some(last) = merged.last_mut()
        {
            last.push(' ');
            last.push_str(line.trim_start());
            continue;
        }
        merged.push(line.to_string());
    }
    merged.into_iter()
}
