use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;

/// The `Call-ID` SIP header.
///
/// Groups every message belonging to the same call.
#[derive(Debug, PartialEq, Eq, Clone, Hash, Default)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SipHeaderParse for CallId {
    const NAME: &'static str = "Call-ID";
    const SHORT_NAME: Option<&'static str> = Some("i");

    fn parse(value: &str) -> Result<Self> {
        Ok(CallId(value.trim().to_string()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", CallId::NAME, self.0)
    }
}
