use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::macros::parse_error;

/// The `Content-Length` SIP header.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct ContentLength(u32);

impl ContentLength {
    pub fn new(length: u32) -> Self {
        Self(length)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Case-insensitive match against the full or compact header name,
    /// used by the TCP framing decoder on raw header lines.
    pub fn matches_name(name: &[u8]) -> bool {
        name.eq_ignore_ascii_case(Self::NAME.as_bytes()) || name.eq_ignore_ascii_case(b"l")
    }
}

impl SipHeaderParse for ContentLength {
    const NAME: &'static str = "Content-Length";
    const SHORT_NAME: Option<&'static str> = Some("l");

    fn parse(value: &str) -> Result<Self> {
        match value.trim().parse() {
            Ok(value) => Ok(ContentLength(value)),
            Err(_) => parse_error!("Content-Length has an invalid value: {value}"),
        }
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentLength::NAME, self.0)
    }
}
