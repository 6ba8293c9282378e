use std::fmt;

use crate::error::Result;
use crate::headers::{SipHeaderParse, TAG_PARAM};
use crate::message::{NameAddr, Params};

/// The `To` SIP header.
///
/// Specifies the logical recipient of the request.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct To {
    addr: NameAddr,
    tag: Option<String>,
    params: Params,
}

impl To {
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

    /// Set the tag parameter.
    pub fn set_tag(&mut self, tag: &str) {
        self.tag = Some(tag.to_string());
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

impl SipHeaderParse for To {
    const NAME: &'static str = "To";
    const SHORT_NAME: Option<&'static str> = Some("t");

    fn parse(value: &str) -> Result<Self> {
        let (addr, rest) = NameAddr::parse(value)?;
        let mut params = Params::parse(rest);
        let tag = params.get(TAG_PARAM).map(str::to_string);
        params.remove(TAG_PARAM);

        Ok(To { addr, tag, params })
    }
}

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", To::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={tag}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}
