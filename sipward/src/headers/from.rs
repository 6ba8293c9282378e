use std::fmt;

use crate::error::Result;
use crate::headers::{SipHeaderParse, TAG_PARAM};
use crate::message::{NameAddr, Params};

/// The `From` SIP header.
///
/// Indicates the initiator of the request.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct From {
    addr: NameAddr,
    tag: Option<String>,
    params: Params,
}

impl From {
    pub fn new(addr: NameAddr, tag: Option<&str>) -> Self {
        Self {
            addr,
            tag: tag.map(str::to_string),
            params: Params::new(),
        }
    }

    /// Returns the tag parameter.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns the name-addr.
    pub fn addr(&self) -> &NameAddr {
        &self.addr
    }

    /// Returns the URI inside the name-addr.
    pub fn uri(&self) -> &crate::message::SipUri {
        &self.addr.uri
    }
}

impl SipHeaderParse for From {
    const NAME: &'static str = "From";
    const SHORT_NAME: Option<&'static str> = Some("f");

    fn parse(value: &str) -> Result<Self> {
        let (addr, rest) = NameAddr::parse(value)?;
        let mut params = Params::parse(rest);
        let tag = params.get(TAG_PARAM).map(str::to_string);
        params.remove(TAG_PARAM);

        Ok(From { addr, tag, params })
    }
}

impl fmt::Display for From {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", From::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let from = From::parse("\"Alice\" <sip:alice@atlanta.com>;tag=1928301774").unwrap();

        assert_eq!(from.tag(), Some("1928301774"));
        assert_eq!(from.uri().aor(), "alice@atlanta.com");
        assert_eq!(from.addr().display.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_parse_addr_spec_form() {
        let from = From::parse("sip:bob@biloxi.com;tag=456248").unwrap();

        assert_eq!(from.tag(), Some("456248"));
        assert_eq!(from.uri().aor(), "bob@biloxi.com");
    }
}
