use std::fmt;
use std::net::IpAddr;

use crate::error::Result;
use crate::headers::SipHeaderParse;
use crate::macros::parse_error;
use crate::message::{HostPort, Params, SIPV2, TransportKind};

const BRANCH_PARAM: &str = "branch";
const RPORT_PARAM: &str = "rport";
const RECEIVED_PARAM: &str = "received";

/// The mandatory prefix of every RFC3261 branch value.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// The `Via` SIP header.
///
/// Indicates the path taken by the request so far and the path that should
/// be followed in routing responses.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Via {
    transport: TransportKind,
    sent_by: HostPort,
    branch: Option<String>,
    rport: Option<u16>,
    /// The sender included `rport`, asking for the observed source port.
    rport_requested: bool,
    received: Option<IpAddr>,
    params: Params,
}

impl Via {
    /// Creates a new `Via` header.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: Option<&str>) -> Self {
        Self {
            transport,
            sent_by,
            branch: branch.map(str::to_string),
            rport: None,
            rport_requested: false,
            received: None,
            params: Params::new(),
        }
    }

    /// Returns the branch parameter.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Returns `true` when the branch carries the RFC3261 magic cookie.
    pub fn has_rfc3261_branch(&self) -> bool {
        self.branch
            .as_deref()
            .is_some_and(|b| b.starts_with(BRANCH_MAGIC_COOKIE))
    }

    /// Returns the sent-by field.
    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }

    /// Returns the transport.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Returns the `received` parameter.
    pub fn received(&self) -> Option<IpAddr> {
        self.received
    }

    /// Returns the `rport` parameter.
    pub fn rport(&self) -> Option<u16> {
        self.rport
    }

    /// Returns `true` when the sender asked for the source port with a
    /// bare `rport` parameter.
    pub fn rport_requested(&self) -> bool {
        self.rport_requested
    }

    /// Set the `received` parameter.
    pub fn set_received(&mut self, received: IpAddr) {
        self.received = Some(received);
    }

    /// Set the `rport` parameter to the observed source port.
    pub fn set_rport(&mut self, rport: u16) {
        self.rport = Some(rport);
    }
}

impl SipHeaderParse for Via {
    const NAME: &'static str = "Via";
    const SHORT_NAME: Option<&'static str> = Some("v");

    /*
     * Via               =  ( "Via" / "v" ) HCOLON via-parm *(COMMA via-parm)
     * via-parm          =  sent-protocol LWS sent-by *( SEMI via-params )
     * sent-protocol     =  protocol-name SLASH protocol-version
     *                      SLASH transport
     */
    fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let Some((protocol, rest)) = value.split_once(char::is_whitespace) else {
            return parse_error!("Via is missing its sent-by");
        };

        let mut proto_parts = protocol.split('/');
        let (name, version, transport) = (proto_parts.next(), proto_parts.next(), proto_parts.next());
        match (name, version) {
            (Some("SIP"), Some("2.0")) => {}
            _ => return parse_error!("Via has an unsupported protocol: {protocol}"),
        }
        let Some(transport) = transport else {
            return parse_error!("Via is missing its transport");
        };
        let transport = TransportKind::from(transport);

        let rest = rest.trim();
        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by, Params::parse(params)),
            None => (rest, Params::new()),
        };
        let sent_by: HostPort = sent_by.trim().parse()?;

        let mut via = Via {
            transport,
            sent_by,
            branch: params.get(BRANCH_PARAM).map(str::to_string),
            rport: params.get(RPORT_PARAM).and_then(|p| p.parse().ok()),
            rport_requested: params.contains(RPORT_PARAM),
            received: params.get(RECEIVED_PARAM).and_then(|p| p.parse().ok()),
            params,
        };
        via.params.remove(BRANCH_PARAM);
        via.params.remove(RPORT_PARAM);
        via.params.remove(RECEIVED_PARAM);

        Ok(via)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} {}", Via::NAME, SIPV2, self.transport, self.sent_by)?;

        if let Some(rport) = self.rport {
            write!(f, ";rport={rport}")?;
        } else if self.rport_requested {
            write!(f, ";rport")?;
        }
        if let Some(received) = &self.received {
            write!(f, ";received={received}")?;
        }
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={branch}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Host;

    #[test]
    fn test_parse() {
        let via = Via::parse("SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8").unwrap();

        assert_eq!(via.transport(), TransportKind::Udp);
        assert_eq!(via.sent_by().host, Host::Domain("server10.biloxi.com".into()));
        assert_eq!(via.branch(), Some("z9hG4bKnashds8"));
        assert!(via.has_rfc3261_branch());
    }

    #[test]
    fn test_parse_with_received_and_rport() {
        let via = Via::parse("SIP/2.0/TCP 10.0.0.1:5070;rport=5071;received=10.0.0.9;branch=z9hG4bK77ef").unwrap();

        assert_eq!(via.transport(), TransportKind::Tcp);
        assert_eq!(via.sent_by().port, Some(5070));
        assert_eq!(via.rport(), Some(5071));
        assert_eq!(via.received(), Some("10.0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_bare_rport_requests_the_source_port() {
        let mut via = Via::parse("SIP/2.0/UDP client.biloxi.com;rport;branch=z9hG4bK77ef").unwrap();

        assert!(via.rport_requested());
        assert_eq!(via.rport(), None);
        // The bare form survives serialization until a port is stamped.
        assert_eq!(via.to_string(), "Via: SIP/2.0/UDP client.biloxi.com;rport;branch=z9hG4bK77ef");

        via.set_received("192.0.2.4".parse().unwrap());
        via.set_rport(40312);
        assert_eq!(
            via.to_string(),
            "Via: SIP/2.0/UDP client.biloxi.com;rport=40312;received=192.0.2.4;branch=z9hG4bK77ef"
        );
    }

    #[test]
    fn test_display_round_trip() {
        let input = "Via: SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8";
        let via = Via::parse("SIP/2.0/UDP server10.biloxi.com;branch=z9hG4bKnashds8").unwrap();

        assert_eq!(via.to_string(), input);
    }

    #[test]
    fn test_rejects_bad_protocol() {
        assert!(Via::parse("SIP/1.0/UDP host").is_err());
        assert!(Via::parse("SIP/2.0/UDP").is_err());
    }
}
