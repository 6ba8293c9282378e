use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::message::auth::{Credential, DigestCredential};

/// The `Authorization` SIP header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Authorization(Credential);

impl Authorization {
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }

    pub fn credential(&self) -> &Credential {
        &self.0
    }

    /// Returns the digest credential when the scheme is `Digest`.
    pub fn digest(&self) -> Option<&DigestCredential> {
        self.0.digest()
    }
}

impl SipHeaderParse for Authorization {
    const NAME: &'static str = "Authorization";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        Ok(Authorization(Credential::parse(value)?))
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Authorization::NAME, self.0)
    }
}
