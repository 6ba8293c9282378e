//! Digest authentication (RFC2617) and the policy middleware applying it.

use std::sync::Arc;

use rand::Rng;
use thiserror::Error;

use crate::auth::nonce::NonceStore;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::headers::{Header, WwwAuthenticate};
use crate::message::auth::{Credential, DigestChallenge, DigestCredential};
use crate::message::{SipMethod, StatusCode};
use crate::service::SipService;
use crate::transport::IncomingRequest;
use crate::users::UserStore;

pub mod nonce;

/// Why a credential was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed or incomplete credentials")]
    BadHeader,

    #[error("Unsupported authentication scheme")]
    BadScheme,

    #[error("Unsupported qop value: {0}")]
    UnsupportedQop(String),

    #[error("Unknown user")]
    UnknownUser,

    #[error("Wrong realm")]
    WrongRealm,

    #[error("Stale nonce")]
    StaleNonce,

    #[error("Digest mismatch")]
    BadDigest,

    #[error("User is disabled")]
    Disabled,
}

/// Issues challenges and verifies digest responses against the user
/// store and the live nonce set.
pub struct DigestAuthenticator {
    realm: String,
    nonces: Arc<NonceStore>,
    users: Arc<dyn UserStore>,
}

impl DigestAuthenticator {
    pub fn new(realm: &str, nonces: Arc<NonceStore>, users: Arc<dyn UserStore>) -> Self {
        Self {
            realm: realm.to_string(),
            nonces,
            users,
        }
    }

    /// The realm this authenticator challenges for.
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Builds a fresh challenge and records its nonce.
    ///
    /// The nonce is 32 hex characters derived from 16 random bytes mixed
    /// with the current time; the opaque value is 16 hex characters of
    /// randomness the server does not remember.
    pub fn challenge(&self) -> DigestChallenge {
        let mut rng = rand::rng();
        let salt: [u8; 16] = rng.random();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        let mut seed = Vec::with_capacity(32);
        seed.extend_from_slice(&salt);
        seed.extend_from_slice(&now.as_nanos().to_be_bytes());
        let nonce = format!("{:x}", md5::compute(&seed));

        let opaque: [u8; 8] = rng.random();
        let opaque = hex::encode(opaque);

        self.nonces.store(&nonce);

        DigestChallenge {
            realm: Some(self.realm.clone()),
            nonce: Some(nonce),
            opaque: Some(opaque),
            stale: None,
            algorithm: Some("MD5".to_string()),
            qop: Some("auth".to_string()),
        }
    }

    /// Verifies a parsed credential against the request method.
    ///
    /// Returns the authenticated username on success.
    pub fn verify(&self, credential: &Credential, method: SipMethod) -> std::result::Result<String, AuthError> {
        let digest = credential.digest().ok_or(AuthError::BadScheme)?;
        if !digest.is_complete() {
            return Err(AuthError::BadHeader);
        }

        let username = digest.username.as_deref().unwrap_or_default();
        let realm = digest.realm.as_deref().unwrap_or_default();
        let nonce = digest.nonce.as_deref().unwrap_or_default();
        let uri = digest.uri.as_deref().unwrap_or_default();
        let response = digest.response.as_deref().unwrap_or_default();

        if realm != self.realm {
            return Err(AuthError::WrongRealm);
        }

        // Nonce must be a live member of the store; absence, including
        // after expiry, fails the same way.
        if !self.nonces.valid(nonce) {
            return Err(AuthError::StaleNonce);
        }

        let user = self.users.lookup(username, realm).ok_or(AuthError::UnknownUser)?;

        let expected = expected_response(digest, &user.ha1, method, nonce, uri)?;

        if !constant_time_eq(expected.as_bytes(), response.to_ascii_lowercase().as_bytes()) {
            return Err(AuthError::BadDigest);
        }

        if !user.enabled {
            return Err(AuthError::Disabled);
        }

        Ok(user.username)
    }
}

/// Computes the response the client must have produced.
///
/// HA1 comes precomputed from the user record; HA2 covers the request
/// method and digest URI. `auth-int` is rejected rather than computed
/// with an entity-body hash the server never checks.
fn expected_response(
    digest: &DigestCredential,
    ha1: &str,
    method: SipMethod,
    nonce: &str,
    uri: &str,
) -> std::result::Result<String, AuthError> {
    let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));

    let expected = match digest.qop.as_deref() {
        None => format!("{:x}", md5::compute(format!("{ha1}:{nonce}:{ha2}"))),
        Some(qop) if qop.eq_ignore_ascii_case("auth") => {
            let (Some(nc), Some(cnonce)) = (digest.nc.as_deref(), digest.cnonce.as_deref()) else {
                return Err(AuthError::BadHeader);
            };
            format!(
                "{:x}",
                md5::compute(format!("{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"))
            )
        }
        Some(qop) => return Err(AuthError::UnsupportedQop(qop.to_string())),
    };

    Ok(expected)
}

/// Constant-time equality over the hex digests.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

/// The middleware enforcing which methods must authenticate.
///
/// REGISTER and INVITE require credentials; a missing Authorization gets
/// a 401 with a fresh challenge, an invalid one gets 403 Forbidden.
pub struct AuthService {
    authenticator: Arc<DigestAuthenticator>,
}

impl AuthService {
    pub fn new(authenticator: Arc<DigestAuthenticator>) -> Self {
        Self { authenticator }
    }

    fn requires_auth(method: SipMethod) -> bool {
        matches!(method, SipMethod::Register | SipMethod::Invite)
    }
}

#[async_trait::async_trait]
impl SipService for AuthService {
    fn name(&self) -> &str {
        "authenticator"
    }

    async fn on_request(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<bool> {
        if !Self::requires_auth(request.method()) {
            return Ok(false);
        }

        let Some(authorization) = request.request.headers.authorization().cloned() else {
            let challenge = self.authenticator.challenge();

            let mut response = endpoint.new_response(request, StatusCode::Unauthorized);
            response
                .headers_mut()
                .push(Header::WwwAuthenticate(WwwAuthenticate::new(challenge)));

            endpoint.send_response(&mut response).await?;
            return Ok(true);
        };

        match self.authenticator.verify(authorization.credential(), request.method()) {
            Ok(username) => {
                tracing::debug!("Authenticated {} for {}", username, request.method());
                request.auth_username = Some(username);
                Ok(false)
            }
            Err(err) => {
                tracing::info!("Rejecting {} from /{}: {}", request.method(), request.addr(), err);

                let mut response = endpoint.new_response(request, StatusCode::Forbidden);
                endpoint.send_response(&mut response).await?;
                Ok(true)
            }
        }
    }
}
