//! # sipward
//!
//! A stateful SIP forwarding proxy and registrar: RFC3261 transactions
//! with parallel forking, RFC2617 digest authentication, and contact
//! registration, over UDP and TCP.

pub mod auth;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod headers;
pub mod message;
pub mod parser;
pub mod proxy;
pub mod registrar;
pub mod service;
pub mod transaction;
pub mod transport;
pub mod users;

pub(crate) mod macros;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ServerConfig;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use service::SipService;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
