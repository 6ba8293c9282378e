use uuid::Uuid;

use crate::headers::BRANCH_MAGIC_COOKIE;
use crate::message::SipMethod;
use crate::transport::RequestHeaders;

/// The identifier a transaction is indexed by.
///
/// With an RFC3261 branch the identifier is `(branch, method, call-id)`,
/// where the method is INVITE for an ACK or CANCEL that should match an
/// INVITE transaction. Without the magic cookie the RFC2543 fallback key
/// `(call-id, from-tag, cseq, method)` applies.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum TransactionKey {
    Rfc3261(Rfc3261),
    Rfc2543(Rfc2543),
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct Rfc3261 {
    pub branch: String,
    pub method: SipMethod,
    pub call_id: String,
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct Rfc2543 {
    pub call_id: String,
    pub from_tag: Option<String>,
    pub cseq: u32,
    pub method: SipMethod,
}

impl TransactionKey {
    /// Builds a key from the mandatory header set, keeping the method as
    /// given.
    pub fn from_headers(headers: &RequestHeaders, method: SipMethod) -> Self {
        match headers.via.branch() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => TransactionKey::Rfc3261(Rfc3261 {
                branch: branch.to_string(),
                method,
                call_id: headers.call_id.as_str().to_string(),
            }),
            _ => TransactionKey::Rfc2543(Rfc2543 {
                call_id: headers.call_id.as_str().to_string(),
                from_tag: headers.from.tag().map(str::to_string),
                cseq: headers.cseq.cseq,
                method,
            }),
        }
    }

    /// Builds the key a request creates a transaction under: its own
    /// method, unnormalized.
    pub fn exact(headers: &RequestHeaders) -> Self {
        Self::from_headers(headers, headers.cseq.method())
    }

    /// Builds the key an ACK or CANCEL uses to find the INVITE
    /// transaction it belongs to.
    pub fn normalized(headers: &RequestHeaders) -> Self {
        let method = match headers.cseq.method() {
            SipMethod::Ack | SipMethod::Cancel => SipMethod::Invite,
            method => method,
        };
        Self::from_headers(headers, method)
    }

    /// Builds a client key from a branch value and sequence method.
    pub fn client(branch: &str, method: SipMethod, call_id: &str) -> Self {
        TransactionKey::Rfc3261(Rfc3261 {
            branch: branch.to_string(),
            method,
            call_id: call_id.to_string(),
        })
    }

    /// Returns the branch value, when the key carries one.
    pub fn branch(&self) -> Option<&str> {
        match self {
            TransactionKey::Rfc3261(key) => Some(&key.branch),
            TransactionKey::Rfc2543(_) => None,
        }
    }

    /// Returns the method component of the key.
    pub fn method(&self) -> SipMethod {
        match self {
            TransactionKey::Rfc3261(key) => key.method,
            TransactionKey::Rfc2543(key) => key.method,
        }
    }
}

/// Generates a fresh branch value under the RFC3261 magic cookie, unique
/// for the process lifetime.
pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC_COOKIE, Uuid::new_v4().simple())
}
