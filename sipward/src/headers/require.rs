use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;

/// The `Require` SIP header.
///
/// Lists option tags the recipient must support to process the message.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Require(String);

impl Require {
    pub fn new(tags: &str) -> Self {
        Self(tags.to_string())
    }

    /// Returns `true` when the given option tag is listed.
    pub fn contains(&self, tag: &str) -> bool {
        self.0.split(',').any(|t| t.trim().eq_ignore_ascii_case(tag))
    }
}

impl SipHeaderParse for Require {
    const NAME: &'static str = "Require";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        Ok(Require(value.trim().to_string()))
    }
}

impl fmt::Display for Require {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Require::NAME, self.0)
    }
}
