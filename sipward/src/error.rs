use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error on parsing an SIP message or header.
#[derive(Debug, PartialEq, Eq, Error)]
pub struct SipParseError {
    /// Message in error.
    pub message: String,
}

impl fmt::Display for SipParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl SipParseError {
    pub fn new<T>(s: T) -> Self
    where
        T: AsRef<str>,
    {
        Self {
            message: s.as_ref().to_string(),
        }
    }
}

impl From<&str> for SipParseError {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SipParseError {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] SipParseError),

    #[error("Missing required '{0}' header")]
    MissingRequiredHeader(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("No transport available for {0}")]
    TransportNotFound(String),

    #[error("Fmt Error")]
    Fmt(#[from] std::fmt::Error),
}
