//! SIP Transport Layer.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::headers::{
    CSeq, CallId, ContentLength, From as FromHdr, Header, Headers, SipHeaderParse, To, Via,
};
use crate::message::{Request, Response, SipMethod, StatusCode, TransportKind};
use crate::transaction::{ClientTsx, ServerTsx};

mod decoder;
pub mod tcp;
pub mod udp;

pub(crate) use decoder::StreamingDecoder;

/// This trait represents an abstraction over a SIP transport implementation.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + 'static {
    /// Sends a buffer to the specified remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (e.g., UDP, TCP).
    fn protocol(&self) -> TransportKind;

    /// Returns the local socket address bound to this transport.
    fn addr(&self) -> SocketAddr;

    /// Returns the remote peer, for connection oriented transports.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Returns `true` if the transport is reliable (e.g., TCP).
    fn reliable(&self) -> bool;

    /// Returns the key that uniquely identifies this transport.
    fn key(&self) -> TransportKey {
        TransportKey::new(self.addr(), self.protocol())
    }
}

/// This type represents a key used to identify a transport.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransportKey {
    addr: SocketAddr,
    kind: TransportKind,
}

impl TransportKey {
    /// Creates a new `TransportKey`.
    pub fn new(addr: SocketAddr, kind: TransportKind) -> Self {
        TransportKey { addr, kind }
    }
}

/// This trait represents a factory for creating SIP transports.
///
/// Used by connection oriented transports like TCP for outbound
/// connections.
#[async_trait::async_trait]
pub trait Factory: Sync + Send {
    /// Creates a new transport connected to `addr`, wiring its read side
    /// into the given event sender.
    async fn create(&self, addr: SocketAddr, sender: TransportTx) -> Result<Arc<dyn Transport>>;

    /// Returns the transport protocol this factory creates.
    fn protocol(&self) -> TransportKind;
}

/// A transport that can deliver packets into the endpoint event loop.
#[async_trait::async_trait]
pub trait TransportStartup: Sync + Send {
    /// Binds the transport and starts its receive task.
    async fn start(&self, sender: TransportTx) -> Result<()>;
}

/// Represents the raw binary content of a message.
#[derive(Debug, Clone)]
pub struct Payload(Bytes);

impl Payload {
    /// Creates a new `Payload`.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Payload(bytes)
    }

    /// Returns the raw byte buffer of this payload.
    pub fn buf(&self) -> &[u8] {
        &self.0
    }
}

/// This type represents a received SIP packet.
#[derive(Clone)]
pub struct Packet {
    /// The packet payload.
    pub payload: Payload,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Events flowing from transports into the endpoint.
pub enum TransportEvent {
    /// A new transport is ready for use.
    Created(Arc<dyn Transport>),
    /// A factory for outbound connections is ready.
    FactoryCreated(Box<dyn Factory>),
    /// A packet arrived.
    Packet {
        transport: Arc<dyn Transport>,
        packet: Packet,
    },
    /// A connection oriented transport closed.
    Closed(TransportKey),
}

/// The sending half of the transport event channel.
pub type TransportTx = mpsc::Sender<TransportEvent>;
/// The receiving half of the transport event channel.
pub type TransportRx = mpsc::Receiver<TransportEvent>;

const EVENT_CHANNEL_SIZE: usize = 128;

/// Represents the address of an outbound message.
pub enum OutgoingAddr {
    /// Route by host and port, resolving a transport by protocol.
    HostPort {
        host: crate::message::HostPort,
        protocol: TransportKind,
    },
    /// An already resolved socket address and transport.
    Addr {
        addr: SocketAddr,
        transport: Arc<dyn Transport>,
    },
}

/// This trait is used to convert a type into a byte buffer.
pub trait ToBytes: Sized {
    /// Converts the type into a byte buffer.
    fn to_bytes(&self) -> Result<Bytes>;
}

/// This type represents an outbound SIP request.
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The address to send the request to.
    pub addr: SocketAddr,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
    /// The serialized message, filled on first send.
    pub buf: Option<Bytes>,
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        serialize(&self.msg.req_line.to_string(), &self.msg.headers, self.msg.body.as_ref())
    }
}

/// This type represents an outbound SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The serialized message, filled on first send.
    pub buf: Option<Bytes>,
}

impl OutgoingResponse {
    /// Returns the message status code.
    pub fn status_code(&self) -> StatusCode {
        self.response.status_line.code
    }

    /// Returns the message reason text.
    pub fn reason(&self) -> &str {
        &self.response.status_line.reason
    }

    /// Returns `true` if this is a provisional response.
    pub fn is_provisional(&self) -> bool {
        self.response.status_line.code.is_provisional()
    }

    /// Append headers to the message.
    pub fn append_headers<I: IntoIterator<Item = Header>>(&mut self, headers: I) {
        self.response.headers.extend(headers);
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.response.headers
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        serialize(
            &self.response.status_line.to_string(),
            &self.response.headers,
            self.response.body.as_ref(),
        )
    }
}

/// Serializes a message with a recomputed `Content-Length` as the final
/// header, so body edits can never leave a stale length behind.
fn serialize(start_line: &str, headers: &Headers, body: Option<&Bytes>) -> Result<Bytes> {
    let estimated_message_size = if body.is_none() { 800 } else { 1500 };
    let mut buf = BytesMut::with_capacity(estimated_message_size);

    write!(buf, "{start_line}\r\n")?;
    for header in headers.iter() {
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf, "{header}\r\n")?;
    }
    let body_len = body.map_or(0, |b| b.len());
    write!(buf, "{}: {}\r\n\r\n", ContentLength::NAME, body_len)?;
    if let Some(body) = body {
        buf.put_slice(body);
    }

    Ok(buf.freeze())
}

/// Serializes a bare request, outside any transaction.
pub(crate) fn serialize_request(request: &Request) -> Result<Bytes> {
    serialize(&request.req_line.to_string(), &request.headers, request.body.as_ref())
}

/// Serializes a bare response, outside any transaction.
pub(crate) fn serialize_response(response: &Response) -> Result<Bytes> {
    serialize(
        &response.status_line.to_string(),
        &response.headers,
        response.body.as_ref(),
    )
}

/// The mandatory headers every request must carry, extracted once at
/// ingress so the rest of the server never re-scans for them.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    pub via: Via,
    pub from: FromHdr,
    pub to: To,
    pub call_id: CallId,
    pub cseq: CSeq,
}

impl RequestHeaders {
    /// Extracts the mandatory header set, failing on the first one
    /// missing.
    pub fn extract(headers: &Headers) -> Result<Self> {
        let via = headers.via().ok_or(Error::MissingRequiredHeader("Via"))?.clone();
        let from = headers.from_hdr().ok_or(Error::MissingRequiredHeader("From"))?.clone();
        let to = headers.to_hdr().ok_or(Error::MissingRequiredHeader("To"))?.clone();
        let call_id = headers.call_id().ok_or(Error::MissingRequiredHeader("Call-ID"))?.clone();
        let cseq = *headers.cseq().ok_or(Error::MissingRequiredHeader("CSeq"))?;

        Ok(RequestHeaders {
            via,
            from,
            to,
            call_id,
            cseq,
        })
    }
}

/// This type represents an inbound SIP request.
pub struct IncomingRequest {
    /// The SIP request message.
    pub request: Request,
    /// The mandatory header set.
    pub request_headers: RequestHeaders,
    /// The transport the request arrived on.
    pub transport: Arc<dyn Transport>,
    /// The packet carrying the request.
    pub packet: Packet,
    /// The server transaction bound to this request, when one exists.
    pub transaction: Option<ServerTsx>,
    /// The authenticated username, stamped by the auth middleware.
    pub auth_username: Option<String>,
}

impl IncomingRequest {
    /// Returns the request method.
    pub fn method(&self) -> SipMethod {
        self.request.method()
    }

    /// Returns the source address of the request.
    pub fn addr(&self) -> SocketAddr {
        self.packet.addr
    }
}

/// This type represents an inbound SIP response.
pub struct IncomingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The mandatory header set.
    pub request_headers: RequestHeaders,
    /// The transport the response arrived on.
    pub transport: Arc<dyn Transport>,
    /// The packet carrying the response.
    pub packet: Packet,
    /// The client transaction this response matched, when one exists.
    pub transaction: Option<ClientTsx>,
}

impl IncomingResponse {
    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.response.code()
    }
}

struct LayerInner {
    listeners: Mutex<HashMap<TransportKey, Arc<dyn Transport>>>,
    factories: Mutex<Vec<Arc<dyn Factory>>>,
    tx: TransportTx,
    rx: Mutex<Option<TransportRx>>,
}

/// The transport layer: a registry of live transports and outbound
/// factories, plus the event channel feeding the endpoint.
#[derive(Clone)]
pub struct TransportLayer(Arc<LayerInner>);

impl TransportLayer {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        Self(Arc::new(LayerInner {
            listeners: Mutex::new(HashMap::new()),
            factories: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }))
    }

    /// Returns a sender for feeding events into the layer.
    pub fn sender(&self) -> TransportTx {
        self.0.tx.clone()
    }

    /// Takes the receiving half of the event channel. The endpoint run
    /// loop calls this exactly once.
    pub(crate) fn take_receiver(&self) -> Option<TransportRx> {
        self.0.rx.lock().expect("Lock failed").take()
    }

    /// Registers a live transport.
    pub fn register(&self, transport: Arc<dyn Transport>) {
        let key = transport.key();
        self.0.listeners.lock().expect("Lock failed").insert(key, transport);
    }

    /// Removes a transport from the registry.
    pub fn unregister(&self, key: &TransportKey) {
        self.0.listeners.lock().expect("Lock failed").remove(key);
    }

    /// Registers a factory for outbound connections.
    pub fn register_factory(&self, factory: Box<dyn Factory>) {
        self.0.factories.lock().expect("Lock failed").push(Arc::from(factory));
    }

    fn find_by_protocol(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        let listeners = self.0.listeners.lock().expect("Lock failed");
        listeners.values().find(|t| t.protocol() == kind).cloned()
    }

    fn find_connected(&self, kind: TransportKind, remote: &SocketAddr) -> Option<Arc<dyn Transport>> {
        let listeners = self.0.listeners.lock().expect("Lock failed");
        listeners
            .values()
            .find(|t| t.protocol() == kind && t.remote_addr() == Some(*remote))
            .cloned()
    }

    fn has_protocol(&self, kind: TransportKind) -> bool {
        let has_listener = {
            let listeners = self.0.listeners.lock().expect("Lock failed");
            listeners.values().any(|t| t.protocol() == kind)
        };
        has_listener || {
            let factories = self.0.factories.lock().expect("Lock failed");
            factories.iter().any(|f| f.protocol() == kind)
        }
    }

    /// Finds or creates the transport an outbound message should use.
    ///
    /// UDP is the default; a message larger than `switchover_bytes` is
    /// promoted to TCP when a TCP path exists.
    pub async fn obtain(
        &self,
        kind: TransportKind,
        remote: SocketAddr,
        msg_len: usize,
        switchover_bytes: usize,
    ) -> Result<Arc<dyn Transport>> {
        let kind = if kind == TransportKind::Udp && msg_len > switchover_bytes && self.has_protocol(TransportKind::Tcp)
        {
            tracing::debug!(%remote, msg_len, "Message exceeds datagram budget, switching to TCP");
            TransportKind::Tcp
        } else {
            kind
        };

        if kind.reliable() {
            // Reuse an established connection to the same peer.
            if let Some(transport) = self.find_connected(kind, &remote) {
                return Ok(transport);
            }
            let factory = {
                let factories = self.0.factories.lock().expect("Lock failed");
                factories.iter().find(|f| f.protocol() == kind).cloned()
            };
            if let Some(factory) = factory {
                let transport = factory.create(remote, self.0.tx.clone()).await?;
                self.register(transport.clone());
                return Ok(transport);
            }
        }

        self.find_by_protocol(kind)
            .ok_or_else(|| Error::TransportNotFound(format!("{kind} to {remote}")))
    }
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;
    use crate::test_utils::{self, MockTransport};

    #[tokio::test]
    async fn test_small_messages_stay_on_udp() {
        let layer = TransportLayer::new();
        layer.register(Arc::new(MockTransport::new_udp()));
        layer.register(Arc::new(MockTransport::new_tcp()));

        let remote: SocketAddr = "127.0.0.1:5062".parse().unwrap();
        let transport = layer.obtain(TransportKind::Udp, remote, 500, 1300).await.unwrap();

        assert_eq!(transport.protocol(), TransportKind::Udp);
    }

    #[tokio::test]
    async fn test_large_messages_switch_to_tcp() {
        let layer = TransportLayer::new();
        layer.register(Arc::new(MockTransport::new_udp()));
        layer.register(Arc::new(MockTransport::new_tcp()));

        let remote: SocketAddr = "127.0.0.1:5062".parse().unwrap();
        let transport = layer.obtain(TransportKind::Udp, remote, 1400, 1300).await.unwrap();

        assert_eq!(transport.protocol(), TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_large_messages_stay_on_udp_without_a_tcp_path() {
        let layer = TransportLayer::new();
        layer.register(Arc::new(MockTransport::new_udp()));

        let remote: SocketAddr = "127.0.0.1:5062".parse().unwrap();
        let transport = layer.obtain(TransportKind::Udp, remote, 1400, 1300).await.unwrap();

        assert_eq!(transport.protocol(), TransportKind::Udp);
    }

    #[tokio::test]
    async fn test_obtain_without_any_transport_fails() {
        let layer = TransportLayer::new();
        let remote: SocketAddr = "127.0.0.1:5062".parse().unwrap();

        assert!(layer.obtain(TransportKind::Udp, remote, 100, 1300).await.is_err());
    }

    #[test]
    fn test_serialization_recomputes_content_length() {
        let mut request = test_utils::outgoing_request(SipMethod::Info).msg;
        request.headers.push(Header::ContentLength(ContentLength::new(999)));
        request.body = Some(Bytes::from_static(b"hello"));

        let bytes = serialize_request(&request).unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(!text.contains("Content-Length: 999"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_mandatory_header_extraction_reports_the_missing_one() {
        let mut headers = test_utils::outgoing_request(SipMethod::Options).msg.headers;
        headers.retain(|h| !matches!(h, Header::CSeq(_)));

        let err = RequestHeaders::extract(&headers).unwrap_err();
        assert_matches!(err, Error::MissingRequiredHeader("CSeq"));
    }
}
