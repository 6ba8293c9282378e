use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::{IncomingRequest, IncomingResponse};

/// A trait which provides a way to extend the SIP endpoint
/// functionalities.
///
/// Services see messages the transaction layer did not consume, in
/// registration order, until one reports the message handled.
#[async_trait::async_trait]
#[allow(unused_variables)]
pub trait SipService: Sync + Send + 'static {
    /// Returns the service name.
    fn name(&self) -> &str;

    /// Called when an inbound SIP request is received.
    ///
    /// Returns `true` when the request was consumed.
    async fn on_request(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<bool> {
        Ok(false)
    }

    /// Called when an inbound SIP response is received.
    ///
    /// Returns `true` when the response was consumed.
    async fn on_response(&self, endpoint: &Endpoint, response: &mut IncomingResponse) -> Result<bool> {
        Ok(false)
    }
}
