use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::macros::parse_error;

/// The `Max-Forwards` SIP header.
///
/// Limits the number of hops a request can make on the way to its
/// destination.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MaxForwards(i32);

impl MaxForwards {
    pub fn new(value: i32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    /// Returns a copy with the hop count decremented by one.
    pub fn decremented(&self) -> Self {
        Self(self.0 - 1)
    }

    /// Returns `true` when the hop budget is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.0 <= 0
    }
}

impl SipHeaderParse for MaxForwards {
    const NAME: &'static str = "Max-Forwards";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        match value.trim().parse() {
            Ok(value) => Ok(MaxForwards(value)),
            Err(_) => parse_error!("Max-Forwards has an invalid value: {value}"),
        }
    }
}

impl fmt::Display for MaxForwards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", MaxForwards::NAME, self.0)
    }
}
