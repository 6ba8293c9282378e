use std::fmt;

use crate::error::Result;
use crate::headers::{EXPIRES_PARAM, Q_PARAM, SipHeaderParse};
use crate::message::{NameAddr, Params, SipUri};

/// The `Contact` SIP header.
///
/// Carries a URI at which the sender can be reached directly, or the
/// wildcard `*` in a REGISTER removing every binding.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Contact {
    /// The wildcard `*` form.
    Star,
    /// A concrete contact address.
    Addr {
        addr: NameAddr,
        /// The `expires` parameter, in seconds.
        expires: Option<u32>,
        /// The `q` preference parameter, kept verbatim.
        q: Option<String>,
        params: Params,
    },
}

impl Contact {
    pub fn new(uri: SipUri) -> Self {
        Contact::Addr {
            addr: NameAddr::new(uri),
            expires: None,
            q: None,
            params: Params::new(),
        }
    }

    /// Creates a contact with an `expires` parameter.
    pub fn with_expires(uri: SipUri, expires: u32) -> Self {
        Contact::Addr {
            addr: NameAddr::new(uri),
            expires: Some(expires),
            q: None,
            params: Params::new(),
        }
    }

    /// Returns the contact URI, or `None` for the wildcard form.
    pub fn uri(&self) -> Option<&SipUri> {
        match self {
            Contact::Star => None,
            Contact::Addr { addr, .. } => Some(&addr.uri),
        }
    }

    /// Returns the `expires` parameter.
    pub fn expires(&self) -> Option<u32> {
        match self {
            Contact::Star => None,
            Contact::Addr { expires, .. } => *expires,
        }
    }

    /// Returns `true` for the wildcard form.
    pub fn is_star(&self) -> bool {
        matches!(self, Contact::Star)
    }
}

impl SipHeaderParse for Contact {
    const NAME: &'static str = "Contact";
    const SHORT_NAME: Option<&'static str> = Some("m");

    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "*" {
            return Ok(Contact::Star);
        }

        let (addr, rest) = NameAddr::parse(value)?;
        let mut params = Params::parse(rest);
        let expires = params.get(EXPIRES_PARAM).and_then(|e| e.parse().ok());
        let q = params.get(Q_PARAM).map(str::to_string);
        params.remove(EXPIRES_PARAM);
        params.remove(Q_PARAM);

        Ok(Contact::Addr {
            addr,
            expires,
            q,
            params,
        })
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contact::Star => write!(f, "{}: *", Contact::NAME),
            Contact::Addr {
                addr,
                expires,
                q,
                params,
            } => {
                write!(f, "{}: {}", Contact::NAME, addr)?;
                if let Some(q) = q {
                    write!(f, ";q={q}")?;
                }
                if let Some(expires) = expires {
                    write!(f, ";expires={expires}")?;
                }
                if !params.is_empty() {
                    write!(f, ";{params}")?;
                }
                Ok(())
            }
        }
    }
}
