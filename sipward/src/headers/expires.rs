use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::macros::parse_error;

/// The `Expires` SIP header.
///
/// Gives the relative time after which the message, or the registrations
/// it creates, expire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Expires(u32);

impl Expires {
    pub fn new(seconds: u32) -> Self {
        Self(seconds)
    }

    pub fn seconds(&self) -> u32 {
        self.0
    }
}

impl SipHeaderParse for Expires {
    const NAME: &'static str = "Expires";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        match value.trim().parse() {
            Ok(value) => Ok(Expires(value)),
            Err(_) => parse_error!("Expires has an invalid value: {value}"),
        }
    }
}

impl fmt::Display for Expires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Expires::NAME, self.0)
    }
}
