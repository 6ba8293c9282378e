use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::error::SipParseError;

/// URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// `sip:` scheme.
    #[default]
    Sip,
    /// `sips:` scheme, treated as a transport selector only.
    Sips,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Sip => write!(f, "sip"),
            Scheme::Sips => write!(f, "sips"),
        }
    }
}

/// The host part of a URI or `Via` sent-by: a domain name or IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    /// A domain name.
    Domain(String),
    /// An IP address.
    IpAddr(IpAddr),
}

impl Default for Host {
    fn default() -> Self {
        Host::Domain(String::new())
    }
}

impl From<&str> for Host {
    fn from(value: &str) -> Self {
        let trimmed = value.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Host::IpAddr(ip),
            Err(_) => Host::Domain(value.to_string()),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Domain(domain) => write!(f, "{domain}"),
            Host::IpAddr(IpAddr::V6(ip)) => write!(f, "[{ip}]"),
            Host::IpAddr(ip) => write!(f, "{ip}"),
        }
    }
}

/// Host plus optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HostPort {
    pub host: Host,
    pub port: Option<u16>,
}

impl HostPort {
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// Returns the port, or the default SIP port when absent.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(5060)
    }
}

impl FromStr for HostPort {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(SipParseError::new("empty host"));
        }
        // IPv6 literal keeps its colons inside brackets.
        if let Some(rest) = s.strip_prefix('[') {
            let Some(end) = rest.find(']') else {
                return Err(SipParseError::new("unterminated IPv6 literal"));
            };
            let host = Host::from(&rest[..end]);
            let port = match rest[end + 1..].strip_prefix(':') {
                Some(p) => Some(p.parse().map_err(|_| SipParseError::new("invalid port"))?),
                None => None,
            };
            return Ok(HostPort { host, port });
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| SipParseError::new("invalid port"))?;
                Ok(HostPort {
                    host: Host::from(host),
                    port: Some(port),
                })
            }
            None => Ok(HostPort {
                host: Host::from(s),
                port: None,
            }),
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => write!(f, "{}", self.host),
        }
    }
}

/// Generic `;name=value` parameter list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    pub fn set(&mut self, name: &str, value: Option<&str>) {
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            entry.1 = value.map(str::to_string);
        } else {
            self.0.push((name.to_string(), value.map(str::to_string)));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Parses a `;a=b;c` tail. The input must not include the leading `;`.
    pub fn parse(s: &str) -> Self {
        let mut params = Params::new();
        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => params.0.push((name.trim().to_string(), Some(value.trim().to_string()))),
                None => params.0.push((part.to_string(), None)),
            }
        }
        params
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                write!(f, ";")?;
            }
            first = false;
            match value {
                Some(value) => write!(f, "{name}={value}")?,
                None => write!(f, "{name}")?,
            }
        }
        Ok(())
    }
}

/// An owned SIP URI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SipUri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host_port: HostPort,
    pub params: Params,
    /// The `?hname=hvalue` tail, kept verbatim.
    pub headers: Option<String>,
}

impl SipUri {
    pub fn new(user: Option<&str>, host_port: HostPort) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: user.map(str::to_string),
            host_port,
            params: Params::new(),
            headers: None,
        }
    }

    /// The address of record this URI names: `user@host`, with scheme,
    /// URI parameters and headers stripped.
    pub fn aor(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host_port.host),
            None => self.host_port.host.to_string(),
        }
    }

    /// Parses from `sip:user@host:port;params?headers`, tolerating the
    /// angle-bracketed form.
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        let s = s.trim();
        let s = s.strip_prefix('<').unwrap_or(s);
        let s = s.strip_suffix('>').unwrap_or(s);

        let (scheme, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (Scheme::Sips, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (Scheme::Sip, rest)
        } else {
            return Err(SipParseError::new(format!("unsupported URI scheme: {s}")));
        };

        let (rest, headers) = match rest.split_once('?') {
            Some((rest, headers)) => (rest, Some(headers.to_string())),
            None => (rest, None),
        };
        let (rest, params) = match rest.split_once(';') {
            Some((rest, params)) => (rest, Params::parse(params)),
            None => (rest, Params::new()),
        };
        let (user, host) = match rest.split_once('@') {
            // Password in userinfo is accepted and dropped.
            Some((user, host)) => (Some(user.split(':').next().unwrap_or(user).to_string()), host),
            None => (None, rest),
        };

        let host_port = host.parse()?;

        Ok(SipUri {
            scheme,
            user,
            host_port,
            params,
            headers,
        })
    }
}

impl FromStr for SipUri {
    type Err = SipParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SipUri::parse(s)
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host_port)?;
        if !self.params.is_empty() {
            write!(f, ";{}", self.params)?;
        }
        if let Some(headers) = &self.headers {
            write!(f, "?{headers}")?;
        }
        Ok(())
    }
}

/// A display name plus URI, as carried by `From`, `To` and `Contact`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: SipUri,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self { display: None, uri }
    }

    /// Parses `"Name" <sip:uri>` or a bare URI up to the first `;` that is
    /// outside angle brackets. Returns the remaining parameter tail.
    pub fn parse(s: &str) -> Result<(Self, &str), SipParseError> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let display = s[..open].trim().trim_matches('"');
            let Some(close) = s[open..].find('>') else {
                return Err(SipParseError::new("unterminated name-addr"));
            };
            let uri = SipUri::parse(&s[open + 1..open + close])?;
            let rest = s[open + close + 1..].trim_start();
            let rest = rest.strip_prefix(';').unwrap_or(rest);
            let display = (!display.is_empty()).then(|| display.to_string());
            Ok((NameAddr { display, uri }, rest))
        } else {
            // addr-spec form: parameters after ';' belong to the header.
            let (uri_part, rest) = match s.split_once(';') {
                Some((uri, rest)) => (uri, rest),
                None => (s, ""),
            };
            let uri = SipUri::parse(uri_part)?;
            Ok((NameAddr { display: None, uri }, rest))
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{display}\" ")?;
        }
        write!(f, "<{}>", self.uri)
    }
}
