use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;

/// The `Server` SIP header.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Server(String);

impl Server {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl SipHeaderParse for Server {
    const NAME: &'static str = "Server";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        Ok(Server(value.trim().to_string()))
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Server::NAME, self.0)
    }
}
