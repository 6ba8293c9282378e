use std::fmt;

use itertools::Itertools;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::message::SipMethod;

/// The `Allow` SIP header.
///
/// Lists the methods the sender is willing to handle.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Allow(Vec<SipMethod>);

impl Allow {
    pub fn new(methods: &[SipMethod]) -> Self {
        Self(methods.to_vec())
    }

    /// The methods this server supports.
    pub fn supported() -> Self {
        Self(SipMethod::allowed().to_vec())
    }

    pub fn methods(&self) -> &[SipMethod] {
        &self.0
    }
}

impl SipHeaderParse for Allow {
    const NAME: &'static str = "Allow";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        let methods = value.split(',').map(|m| SipMethod::from(m.trim())).collect();
        Ok(Allow(methods))
    }
}

impl fmt::Display for Allow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", Allow::NAME, self.0.iter().join(", "))
    }
}
