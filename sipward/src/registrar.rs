//! Contact bindings and the service consuming REGISTER requests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::headers::{Contact, Header};
use crate::message::{SipMethod, SipUri, StatusCode};
use crate::service::SipService;
use crate::transaction::ServerTransaction;
use crate::transport::IncomingRequest;

/// Binding lifetime applied when a REGISTER names none.
const DEFAULT_REGISTRATION_EXPIRES: u32 = 3600;

/// One registered contact for an address of record.
#[derive(Debug, Clone)]
pub struct ContactBinding {
    pub uri: SipUri,
    pub expires_at: Instant,
}

impl ContactBinding {
    /// Seconds until this binding expires, zero when already expired.
    pub fn expires_in(&self) -> u32 {
        self.expires_at.saturating_duration_since(Instant::now()).as_secs() as u32
    }
}

/// Read and write access to the registered contact set.
pub trait Registrar: Send + Sync + 'static {
    /// Returns the live contacts bound to the AOR.
    fn find_contacts(&self, aor: &str) -> Vec<ContactBinding>;

    /// Binds (or refreshes) a contact for the AOR.
    fn bind(&self, aor: &str, uri: &SipUri, expires: Duration);

    /// Removes one contact binding.
    fn remove(&self, aor: &str, uri: &SipUri);

    /// Removes every binding for the AOR.
    fn clear(&self, aor: &str);
}

/// An in-memory [`Registrar`].
///
/// Expired bindings are pruned on lookup; there is no background sweep.
#[derive(Default)]
pub struct MemoryRegistrar {
    bindings: RwLock<HashMap<String, Vec<ContactBinding>>>,
}

impl MemoryRegistrar {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Registrar for MemoryRegistrar {
    fn find_contacts(&self, aor: &str) -> Vec<ContactBinding> {
        let now = Instant::now();
        let mut bindings = self.bindings.write().expect("Lock failed");

        let Some(entry) = bindings.get_mut(aor) else {
            return Vec::new();
        };
        entry.retain(|binding| now < binding.expires_at);
        if entry.is_empty() {
            bindings.remove(aor);
            return Vec::new();
        }

        entry.clone()
    }

    fn bind(&self, aor: &str, uri: &SipUri, expires: Duration) {
        let expires_at = Instant::now() + expires;
        let mut bindings = self.bindings.write().expect("Lock failed");
        let entry = bindings.entry(aor.to_string()).or_default();

        // A re-registration of the same URI refreshes it.
        entry.retain(|binding| binding.uri != *uri);
        entry.push(ContactBinding {
            uri: uri.clone(),
            expires_at,
        });
    }

    fn remove(&self, aor: &str, uri: &SipUri) {
        let mut bindings = self.bindings.write().expect("Lock failed");
        if let Some(entry) = bindings.get_mut(aor) {
            entry.retain(|binding| binding.uri != *uri);
            if entry.is_empty() {
                bindings.remove(aor);
            }
        }
    }

    fn clear(&self, aor: &str) {
        let mut bindings = self.bindings.write().expect("Lock failed");
        bindings.remove(aor);
    }
}

/// The service consuming REGISTER requests.
///
/// Runs after the authentication middleware; binds the Contact set of
/// the To AOR and answers 200 with the current bindings.
pub struct RegistrarService {
    registrar: Arc<dyn Registrar>,
}

impl RegistrarService {
    pub fn new(registrar: Arc<dyn Registrar>) -> Self {
        Self { registrar }
    }
}

#[async_trait::async_trait]
impl SipService for RegistrarService {
    fn name(&self) -> &str {
        "registrar"
    }

    async fn on_request(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<bool> {
        if request.method() != SipMethod::Register {
            return Ok(false);
        }

        let aor = request.request_headers.to.uri().aor();
        let header_expires = request
            .request
            .headers
            .expires()
            .map(|e| e.seconds())
            .unwrap_or(DEFAULT_REGISTRATION_EXPIRES);

        let contacts: Vec<Contact> = request.request.headers.contacts().cloned().collect();
        let star = contacts.iter().any(|c| c.is_star());

        if star {
            // A wildcard removal applies to the whole binding set.
            self.registrar.clear(&aor);
            tracing::info!("Cleared all bindings for {}", aor);
        } else {
            for contact in &contacts {
                let Some(uri) = contact.uri() else { continue };
                let expires = contact.expires().unwrap_or(header_expires);

                if expires == 0 {
                    self.registrar.remove(&aor, uri);
                    tracing::info!("Unbound {} from {}", uri, aor);
                } else {
                    self.registrar.bind(&aor, uri, Duration::from_secs(expires as u64));
                    tracing::info!("Bound {} to {} for {}s", uri, aor, expires);
                }
            }
        }

        let tsx = ServerTransaction::new(endpoint.transaction_layer(), request);

        let mut response = endpoint.new_response(request, StatusCode::Ok);
        for binding in self.registrar.find_contacts(&aor) {
            let contact = Contact::with_expires(binding.uri.clone(), binding.expires_in());
            response.headers_mut().push(Header::Contact(contact));
        }

        tsx.respond(&mut response).await?;
        Ok(true)
    }
}
