use std::fmt;

use crate::error::Result;
use crate::headers::{
    Allow, Authorization, CSeq, CallId, Contact, ContentLength, Expires, From, MaxForwards, Require, Server,
    SessionExpires, SipHeaderParse, To, Via, WwwAuthenticate,
};

/// Any header the server understands, plus a verbatim variant for the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Via(Via),
    From(From),
    To(To),
    Contact(Contact),
    CallId(CallId),
    CSeq(CSeq),
    MaxForwards(MaxForwards),
    Expires(Expires),
    ContentLength(ContentLength),
    Allow(Allow),
    Server(Server),
    Require(Require),
    SessionExpires(SessionExpires),
    WwwAuthenticate(WwwAuthenticate),
    Authorization(Authorization),
    /// A header the server does not interpret, forwarded verbatim.
    Other {
        name: String,
        value: String,
    },
}

fn name_matches<H: SipHeaderParse>(name: &str) -> bool {
    name.eq_ignore_ascii_case(H::NAME) || H::SHORT_NAME.is_some_and(|short| name.eq_ignore_ascii_case(short))
}

impl Header {
    /// Parses one header line from its name and raw value. Unknown names
    /// are kept verbatim.
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        let header = if name_matches::<Via>(name) {
            Header::Via(Via::parse(value)?)
        } else if name_matches::<From>(name) {
            Header::From(From::parse(value)?)
        } else if name_matches::<To>(name) {
            Header::To(To::parse(value)?)
        } else if name_matches::<Contact>(name) {
            Header::Contact(Contact::parse(value)?)
        } else if name_matches::<CallId>(name) {
            Header::CallId(CallId::parse(value)?)
        } else if name_matches::<CSeq>(name) {
            Header::CSeq(CSeq::parse(value)?)
        } else if name_matches::<MaxForwards>(name) {
            Header::MaxForwards(MaxForwards::parse(value)?)
        } else if name_matches::<Expires>(name) {
            Header::Expires(Expires::parse(value)?)
        } else if name_matches::<ContentLength>(name) {
            Header::ContentLength(ContentLength::parse(value)?)
        } else if name_matches::<Allow>(name) {
            Header::Allow(Allow::parse(value)?)
        } else if name_matches::<Server>(name) {
            Header::Server(Server::parse(value)?)
        } else if name_matches::<Require>(name) {
            Header::Require(Require::parse(value)?)
        } else if name_matches::<SessionExpires>(name) {
            Header::SessionExpires(SessionExpires::parse(value)?)
        } else if name_matches::<WwwAuthenticate>(name) {
            Header::WwwAuthenticate(WwwAuthenticate::parse(value)?)
        } else if name_matches::<Authorization>(name) {
            Header::Authorization(Authorization::parse(value)?)
        } else {
            Header::Other {
                name: name.to_string(),
                value: value.to_string(),
            }
        };

        Ok(header)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(h) => write!(f, "{h}"),
            Header::From(h) => write!(f, "{h}"),
            Header::To(h) => write!(f, "{h}"),
            Header::Contact(h) => write!(f, "{h}"),
            Header::CallId(h) => write!(f, "{h}"),
            Header::CSeq(h) => write!(f, "{h}"),
            Header::MaxForwards(h) => write!(f, "{h}"),
            Header::Expires(h) => write!(f, "{h}"),
            Header::ContentLength(h) => write!(f, "{h}"),
            Header::Allow(h) => write!(f, "{h}"),
            Header::Server(h) => write!(f, "{h}"),
            Header::Require(h) => write!(f, "{h}"),
            Header::SessionExpires(h) => write!(f, "{h}"),
            Header::WwwAuthenticate(h) => write!(f, "{h}"),
            Header::Authorization(h) => write!(f, "{h}"),
            Header::Other { name, value } => write!(f, "{name}: {value}"),
        }
    }
}
