use std::fmt;

/// The transport protocol named in `Via` headers and URI parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// UDP transport.
    #[default]
    Udp,
    /// TCP transport.
    Tcp,
    /// TLS transport. Accepted on parse as a transport selector only.
    Tls,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// The default port for this transport.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Tls => 5061,
            _ => 5060,
        }
    }

    /// Returns `true` if the transport is connection oriented.
    pub fn reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl From<&str> for TransportKind {
    fn from(value: &str) -> Self {
        if value.eq_ignore_ascii_case("tcp") {
            TransportKind::Tcp
        } else if value.eq_ignore_ascii_case("tls") {
            TransportKind::Tls
        } else {
            TransportKind::Udp
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
