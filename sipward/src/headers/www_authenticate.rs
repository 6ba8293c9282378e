use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::message::auth::{Challenge, DigestChallenge};

/// The `WWW-Authenticate` SIP header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct WwwAuthenticate(Challenge);

impl WwwAuthenticate {
    pub fn new(challenge: DigestChallenge) -> Self {
        Self(Challenge::Digest(challenge))
    }

    pub fn challenge(&self) -> &Challenge {
        &self.0
    }
}

impl SipHeaderParse for WwwAuthenticate {
    const NAME: &'static str = "WWW-Authenticate";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        Ok(WwwAuthenticate(Challenge::parse(value)?))
    }
}

impl fmt::Display for WwwAuthenticate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", WwwAuthenticate::NAME, self.0)
    }
}
