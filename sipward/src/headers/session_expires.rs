use std::fmt;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::macros::parse_error;
use crate::message::Params;

/// The `Session-Expires` SIP header (RFC4028).
///
/// Carries the session interval; the refresher parameter is kept verbatim.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SessionExpires {
    interval: u32,
    params: Params,
}

impl SessionExpires {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            params: Params::new(),
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }
}

impl SipHeaderParse for SessionExpires {
    const NAME: &'static str = "Session-Expires";
    const SHORT_NAME: Option<&'static str> = Some("x");

    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (interval, params) = match value.split_once(';') {
            Some((interval, params)) => (interval, Params::parse(params)),
            None => (value, Params::new()),
        };
        let Ok(interval) = interval.trim().parse() else {
            return parse_error!("Session-Expires has an invalid interval: {value}");
        };

        Ok(SessionExpires { interval, params })
    }
}

impl fmt::Display for SessionExpires {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", SessionExpires::NAME, self.interval)?;
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        Ok(())
    }
}
