use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::macros::parse_error;
use crate::message::SipMethod;

/// The `CSeq` SIP header.
///
/// Orders requests within a Call-ID and names the method the sequence
/// number applies to.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CSeq {
    pub cseq: u32,
    pub method: SipMethod,
}

impl CSeq {
    pub fn new(cseq: u32, method: SipMethod) -> Self {
        Self { cseq, method }
    }

    /// Returns the sequence method.
    pub fn method(&self) -> SipMethod {
        self.method
    }
}

impl SipHeaderParse for CSeq {
    const NAME: &'static str = "CSeq";
    const SHORT_NAME: Option<&'static str> = None;

    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let Some((cseq, method)) = value.split_once(char::is_whitespace) else {
            return parse_error!("CSeq is missing its method: {value}");
        };
        let Ok(cseq) = cseq.trim().parse() else {
            return parse_error!("CSeq has an invalid sequence number: {value}");
        };

        Ok(CSeq {
            cseq,
            method: SipMethod::from(method.trim()),
        })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", CSeq::NAME, self.cseq, self.method)
    }
}
