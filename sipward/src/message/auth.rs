//! SIP Auth types
//!
use std::fmt;

use crate::error::SipParseError;

/// A Digest challenge, as carried by the `WWW-Authenticate` header.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct DigestChallenge {
    /// The realm of the digest authentication.
    pub realm: Option<String>,

    /// The nonce of the digest authentication.
    pub nonce: Option<String>,

    /// The opaque value of the digest authentication.
    pub opaque: Option<String>,

    /// Indicates whether the previous request used a stale nonce.
    pub stale: Option<String>,

    /// The algorithm used in the digest authentication.
    pub algorithm: Option<String>,

    /// The quality of protection (qop) value.
    pub qop: Option<String>,
}

impl DigestChallenge {
    /// Parses the value of a `WWW-Authenticate` header. Only the `Digest`
    /// scheme is accepted.
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        let params = parse_auth_params(s)?;
        let mut challenge = DigestChallenge::default();

        for (name, value) in params {
            let slot = match name.to_ascii_lowercase().as_str() {
                "realm" => &mut challenge.realm,
                "nonce" => &mut challenge.nonce,
                "opaque" => &mut challenge.opaque,
                "stale" => &mut challenge.stale,
                "algorithm" => &mut challenge.algorithm,
                "qop" => &mut challenge.qop,
                _ => continue,
            };
            *slot = Some(value);
        }

        Ok(challenge)
    }
}

impl fmt::Display for DigestChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest ")?;
        let mut sep = "";
        if let Some(realm) = &self.realm {
            write!(f, "realm=\"{realm}\"")?;
            sep = ", ";
        }
        if let Some(nonce) = &self.nonce {
            write!(f, "{sep}nonce=\"{nonce}\"")?;
            sep = ", ";
        }
        if let Some(opaque) = &self.opaque {
            write!(f, "{sep}opaque=\"{opaque}\"")?;
            sep = ", ";
        }
        if let Some(stale) = &self.stale {
            write!(f, "{sep}stale={stale}")?;
            sep = ", ";
        }
        if let Some(algorithm) = &self.algorithm {
            write!(f, "{sep}algorithm={algorithm}")?;
            sep = ", ";
        }
        if let Some(qop) = &self.qop {
            write!(f, "{sep}qop=\"{qop}\"")?;
        }
        Ok(())
    }
}

/// Digest credentials, as carried by the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestCredential {
    /// The realm value that defines the protection space.
    pub realm: Option<String>,

    /// The username associated with the credential.
    pub username: Option<String>,

    /// The nonce value provided by the server.
    pub nonce: Option<String>,

    /// The URI of the requested resource.
    pub uri: Option<String>,

    /// The response hash calculated from the credential data.
    pub response: Option<String>,

    /// The algorithm used to hash the credentials (e.g., "MD5").
    pub algorithm: Option<String>,

    /// The client nonce value used with qop.
    pub cnonce: Option<String>,

    /// The opaque value provided by the server, returned unchanged.
    pub opaque: Option<String>,

    /// The quality of protection (qop) applied to the message.
    pub qop: Option<String>,

    /// The nonce count, the number of requests made with the same nonce.
    pub nc: Option<String>,
}

impl DigestCredential {
    /// Parses the value of an `Authorization` header. Only the `Digest`
    /// scheme is accepted.
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        let params = parse_auth_params(s)?;
        let mut credential = DigestCredential::default();

        for (name, value) in params {
            let slot = match name.to_ascii_lowercase().as_str() {
                "realm" => &mut credential.realm,
                "username" => &mut credential.username,
                "nonce" => &mut credential.nonce,
                "uri" => &mut credential.uri,
                "response" => &mut credential.response,
                "algorithm" => &mut credential.algorithm,
                "cnonce" => &mut credential.cnonce,
                "opaque" => &mut credential.opaque,
                "qop" => &mut credential.qop,
                "nc" => &mut credential.nc,
                _ => continue,
            };
            *slot = Some(value);
        }

        Ok(credential)
    }

    /// Returns `true` when every parameter verification needs is present.
    pub fn is_complete(&self) -> bool {
        self.username.is_some()
            && self.realm.is_some()
            && self.nonce.is_some()
            && self.uri.is_some()
            && self.response.is_some()
    }
}

impl fmt::Display for DigestCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest ")?;
        let mut sep = "";
        let quoted = [
            ("username", &self.username),
            ("realm", &self.realm),
            ("nonce", &self.nonce),
            ("uri", &self.uri),
            ("response", &self.response),
            ("cnonce", &self.cnonce),
            ("opaque", &self.opaque),
        ];
        for (name, value) in quoted {
            if let Some(value) = value {
                write!(f, "{sep}{name}=\"{value}\"")?;
                sep = ", ";
            }
        }
        if let Some(algorithm) = &self.algorithm {
            write!(f, "{sep}algorithm={algorithm}")?;
            sep = ", ";
        }
        if let Some(qop) = &self.qop {
            write!(f, "{sep}qop={qop}")?;
            sep = ", ";
        }
        if let Some(nc) = &self.nc {
            write!(f, "{sep}nc={nc}")?;
        }
        Ok(())
    }
}

/// An authentication challenge, as carried by `WWW-Authenticate`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Challenge {
    /// A `Digest` authentication scheme.
    Digest(DigestChallenge),
    /// Any other authentication scheme, kept verbatim.
    Other {
        /// The name of the authentication scheme.
        scheme: String,
        /// The unparsed parameter tail.
        value: String,
    },
}

impl Challenge {
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        match DigestChallenge::parse(s) {
            Ok(digest) => Ok(Challenge::Digest(digest)),
            Err(_) => parse_other_scheme(s).map(|(scheme, value)| Challenge::Other { scheme, value }),
        }
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Challenge::Digest(digest) => write!(f, "{digest}"),
            Challenge::Other { scheme, value } => write!(f, "{scheme} {value}"),
        }
    }
}

/// The credential carried by an `Authorization` header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Credential {
    /// A `Digest` authentication scheme.
    Digest(DigestCredential),
    /// Any other authentication scheme, kept verbatim.
    Other {
        /// The name of the authentication scheme.
        scheme: String,
        /// The unparsed parameter tail.
        value: String,
    },
}

impl Credential {
    pub fn parse(s: &str) -> Result<Self, SipParseError> {
        match DigestCredential::parse(s) {
            Ok(digest) => Ok(Credential::Digest(digest)),
            Err(_) => parse_other_scheme(s).map(|(scheme, value)| Credential::Other { scheme, value }),
        }
    }

    /// Returns the digest credential, if this is one.
    pub fn digest(&self) -> Option<&DigestCredential> {
        match self {
            Credential::Digest(digest) => Some(digest),
            Credential::Other { .. } => None,
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Digest(digest) => write!(f, "{digest}"),
            Credential::Other { scheme, value } => write!(f, "{scheme} {value}"),
        }
    }
}

fn parse_other_scheme(s: &str) -> Result<(String, String), SipParseError> {
    match s.trim().split_once(char::is_whitespace) {
        Some((scheme, value)) => Ok((scheme.to_string(), value.trim().to_string())),
        None => Err(SipParseError::new("malformed authentication header")),
    }
}

/// Splits a `Digest name="value", name=token` header value into pairs,
/// accepting both the quoted-string and bare token forms.
fn parse_auth_params(s: &str) -> Result<Vec<(String, String)>, SipParseError> {
    let s = s.trim();
    let rest = match s.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
        _ => return Err(SipParseError::new("unsupported authentication scheme")),
    };

    let mut params = Vec::new();
    let mut chars = rest.char_indices().peekable();
    let mut start = 0;
    let mut in_quotes = false;
    let mut parts: Vec<&str> = Vec::new();

    // Split on commas that are outside quoted strings.
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => in_quotes = !in_quotes,
            '\\' if in_quotes => {
                chars.next();
            }
            ',' if !in_quotes => {
                parts.push(&rest[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);

    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, value)) = part.split_once('=') else {
            return Err(SipParseError::new(format!("malformed auth parameter: {part}")));
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        params.push((name.trim().to_string(), value.to_string()));
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credential() {
        let value = "Digest username=\"alice\", realm=\"example.com\", \
                     nonce=\"84a4cc6f3082121f32b42a2187831a9e\", \
                     uri=\"sip:example.com\", qop=auth, nc=00000001, \
                     cnonce=\"0a4f113b\", response=\"7587245234b3434cc3412213e5f113a5\"";
        let cred = DigestCredential::parse(value).unwrap();

        assert_eq!(cred.username.as_deref(), Some("alice"));
        assert_eq!(cred.realm.as_deref(), Some("example.com"));
        assert_eq!(cred.qop.as_deref(), Some("auth"));
        assert_eq!(cred.nc.as_deref(), Some("00000001"));
        assert!(cred.is_complete());
    }

    #[test]
    fn test_incomplete_credential() {
        let cred = DigestCredential::parse("Digest username=\"alice\", realm=\"example.com\"").unwrap();
        assert!(!cred.is_complete());
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(DigestCredential::parse("Basic YWxhZGRpbjpvcGVuc2VzYW1l").is_err());
    }

    #[test]
    fn test_challenge_round_trip() {
        let challenge = DigestChallenge {
            realm: Some("example.com".into()),
            nonce: Some("abcdef0123456789abcdef0123456789".into()),
            opaque: Some("00aa11bb22cc33dd".into()),
            algorithm: Some("MD5".into()),
            qop: Some("auth".into()),
            stale: None,
        };
        let emitted = challenge.to_string();
        assert_eq!(
            emitted,
            "Digest realm=\"example.com\", nonce=\"abcdef0123456789abcdef0123456789\", \
             opaque=\"00aa11bb22cc33dd\", algorithm=MD5, qop=\"auth\""
        );
        assert_eq!(DigestChallenge::parse(&emitted).unwrap(), challenge);
    }
}
