//! SIP Endpoint
//!
//! The endpoint owns the transport and transaction layers and drives the
//! service chain over every message the transaction layer leaves to it.

pub mod builder;

pub use builder::Builder;

use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::headers::{Header, Server};
use crate::message::{Host, Request, Response, SipMsg, StatusCode};
use crate::parser::Parser;
use crate::service::SipService;
use crate::transaction::TransactionLayer;
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingResponse, Packet, RequestHeaders, ToBytes, Transport,
    TransportEvent, TransportLayer, serialize_response,
};

struct Inner {
    /// The transport layer for the endpoint.
    transport: TransportLayer,
    /// The transaction layer for the endpoint.
    transaction: TransactionLayer,
    /// Server configuration.
    config: ServerConfig,
    /// The list of services registered.
    services: Box<[Box<dyn SipService>]>,
}

/// The SIP endpoint.
///
/// An endpoint is a logical entity that can send and receive SIP
/// messages, manage transactions, and interact with the registered
/// services.
#[derive(Clone)]
pub struct Endpoint(Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(
        transport: TransportLayer,
        transaction: TransactionLayer,
        config: ServerConfig,
        services: Vec<Box<dyn SipService>>,
    ) -> Self {
        Endpoint(Arc::new(Inner {
            transport,
            transaction,
            config,
            services: services.into_boxed_slice(),
        }))
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.0.config
    }

    /// The identifier stamped into originated responses.
    pub fn server_name(&self) -> &str {
        &self.0.config.server_name
    }

    /// The transaction layer.
    pub fn transaction_layer(&self) -> &TransactionLayer {
        &self.0.transaction
    }

    /// The transport layer.
    pub fn transport_layer(&self) -> &TransportLayer {
        &self.0.transport
    }

    /// Runs the endpoint, processing messages from the transport layer
    /// until every transport is gone.
    pub async fn run(self) -> Result<()> {
        let mut rx = self.0.transport.take_receiver().ok_or(Error::ChannelClosed)?;

        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Created(transport) => {
                    self.0.transport.register(transport);
                }
                TransportEvent::FactoryCreated(factory) => {
                    self.0.transport.register_factory(factory);
                }
                TransportEvent::Closed(key) => {
                    self.0.transport.unregister(&key);
                }
                TransportEvent::Packet { transport, packet } => {
                    if let Err(err) = self.process_packet(transport, packet).await {
                        tracing::warn!("Failed to process packet: {}", err);
                    }
                }
            }
        }

        Ok(())
    }

    async fn process_packet(&self, transport: Arc<dyn Transport>, packet: Packet) -> Result<()> {
        let msg = match Parser::parse_detailed(packet.payload.buf()) {
            Ok(msg) => msg,
            Err(failure) => {
                tracing::debug!("Malformed packet from /{}: {}", packet.addr, failure.error);
                // A request that still identifies itself is answered 400;
                // only unframeable bytes are dropped.
                if let Some(mut request) = failure.request {
                    stamp_source_route(&mut request, &packet);
                    return self.reject_malformed(&request, &transport, &packet).await;
                }
                return Ok(());
            }
        };

        match msg {
            SipMsg::Request(mut request) => {
                stamp_source_route(&mut request, &packet);

                let request_headers = match RequestHeaders::extract(&request.headers) {
                    Ok(headers) => headers,
                    Err(err) => {
                        tracing::debug!("Malformed request from /{}: {}", packet.addr, err);
                        return self.reject_malformed(&request, &transport, &packet).await;
                    }
                };

                let mut incoming = IncomingRequest {
                    request,
                    request_headers,
                    transport,
                    packet,
                    transaction: None,
                    auth_username: None,
                };
                self.process_request(&mut incoming).await
            }
            SipMsg::Response(response) => {
                let Ok(request_headers) = RequestHeaders::extract(&response.headers) else {
                    tracing::debug!("Dropping response without mandatory headers from /{}", packet.addr);
                    return Ok(());
                };

                let mut incoming = IncomingResponse {
                    response,
                    request_headers,
                    transport,
                    packet,
                    transaction: None,
                };
                self.process_response(&mut incoming).await
            }
        }
    }

    /// Answers 400 when the message is complete enough to route a
    /// response at all; otherwise the packet is dropped.
    async fn reject_malformed(&self, request: &Request, transport: &Arc<dyn Transport>, packet: &Packet) -> Result<()> {
        if request.headers.via().is_none() {
            return Ok(());
        }

        let response = response_from_request(request, StatusCode::BadRequest, self.server_name());
        let buf = serialize_response(&response)?;
        transport.send(&buf, &packet.addr).await?;

        Ok(())
    }

    pub(crate) async fn process_request(&self, request: &mut IncomingRequest) -> Result<()> {
        tracing::debug!("<= Request {} from /{}", request.method(), request.addr());

        if self.0.transaction.handle_request(request).await? {
            return Ok(());
        }

        for service in self.0.services.iter() {
            if service.on_request(self, request).await? {
                return Ok(());
            }
        }

        tracing::debug!(
            "Request {} from /{} was unhandled by any service",
            request.method(),
            request.addr()
        );

        Ok(())
    }

    pub(crate) async fn process_response(&self, response: &mut IncomingResponse) -> Result<()> {
        tracing::debug!(
            "<= Response ({} {})",
            response.response.status_line.code,
            response.response.status_line.reason
        );

        if self.0.transaction.handle_response(response).await? {
            return Ok(());
        }

        for service in self.0.services.iter() {
            if service.on_response(self, response).await? {
                return Ok(());
            }
        }

        tracing::debug!(
            "Response ({} {}) from /{} was unhandled by any service",
            response.response.status_line.code,
            response.response.status_line.reason,
            response.packet.addr
        );

        Ok(())
    }

    /// Creates a new SIP response based on an incoming request.
    ///
    /// Copies `Via` (all of them), `From`, `To`, `Call-ID` and `CSeq`
    /// from the request, adds a To-tag on non-provisional responses that
    /// lack one, and stamps the server identifier.
    pub fn new_response(&self, request: &IncomingRequest, code: StatusCode) -> OutgoingResponse {
        let response = response_from_request(&request.request, code, self.server_name());
        let addr = self.outbound_addr(request);

        OutgoingResponse {
            response,
            addr,
            buf: None,
        }
    }

    /// Respond statelessly to a request.
    pub async fn respond(&self, request: &IncomingRequest, code: StatusCode) -> Result<()> {
        let mut response = self.new_response(request, code);
        self.send_response(&mut response).await
    }

    /// Sends a SIP response to its recorded destination.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        tracing::debug!("=> Response {} {}", response.status_code(), response.reason());
        let buf = match response.buf.take() {
            Some(buf) => buf,
            None => response.to_bytes()?,
        };

        match &response.addr {
            OutgoingAddr::HostPort { host, protocol } => {
                let addr = crate::proxy::resolve_host_port(host).await?;
                let transport = self
                    .0
                    .transport
                    .obtain(*protocol, addr, buf.len(), self.0.config.udp_tcp_switchover_bytes)
                    .await?;
                transport.send(&buf, &addr).await?;
            }
            OutgoingAddr::Addr { addr, transport } => {
                transport.send(&buf, addr).await?;
            }
        }

        Ok(())
    }

    // 18.2.2: responses to a request go back where the request came
    // from, honoring the received/rport Via parameters on UDP.
    fn outbound_addr(&self, request: &IncomingRequest) -> OutgoingAddr {
        let via = &request.request_headers.via;

        if request.transport.reliable() {
            return OutgoingAddr::Addr {
                addr: request.packet.addr,
                transport: request.transport.clone(),
            };
        }

        if let Some(ip) = via.received() {
            let port = via.rport().or(via.sent_by().port).unwrap_or(5060);
            return OutgoingAddr::Addr {
                addr: SocketAddr::new(ip, port),
                transport: request.transport.clone(),
            };
        }

        OutgoingAddr::Addr {
            addr: request.packet.addr,
            transport: request.transport.clone(),
        }
    }
}

/// 18.2.1: the receiving server stamps the observed source onto the
/// topmost Via — `received` when it differs from the sent-by host, and
/// the source port when the sender asked for `rport`. Response routing
/// downstream of this proxy depends on these being present.
fn stamp_source_route(request: &mut Request, packet: &Packet) {
    let Some(via) = request.headers.via_mut() else {
        return;
    };

    let source = packet.addr;
    let matches_sent_by = matches!(&via.sent_by().host, Host::IpAddr(ip) if *ip == source.ip());
    if !matches_sent_by {
        via.set_received(source.ip());
    }
    if via.rport_requested() && via.rport().is_none() {
        via.set_rport(source.port());
    }
}

/// Builds a response from a request, copying the header set a proxy or
/// UAS answer must carry.
pub(crate) fn response_from_request(request: &Request, code: StatusCode, server_name: &str) -> Response {
    let mut response = Response::new(code);
    let mut headers = crate::headers::Headers::with_capacity(7);

    // Every Via, in wire order.
    for via in request.headers.vias() {
        headers.push(Header::Via(via.clone()));
    }

    if let Some(from) = request.headers.from_hdr() {
        headers.push(Header::From(from.clone()));
    }

    if let Some(to) = request.headers.to_hdr() {
        let mut to = to.clone();
        // 8.2.6.2: the UAS adds a To-tag on everything past 100 Trying.
        if to.tag().is_none() && code != StatusCode::Trying {
            to.set_tag(&generate_tag());
        }
        headers.push(Header::To(to));
    }

    if let Some(call_id) = request.headers.call_id() {
        headers.push(Header::CallId(call_id.clone()));
    }

    if let Some(cseq) = request.headers.cseq() {
        headers.push(Header::CSeq(*cseq));
    }

    headers.push(Header::Server(Server::new(server_name)));

    response.headers = headers;
    response
}

fn generate_tag() -> String {
    let value: u32 = rand::rng().random();
    format!("{value:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::SipHeaderParse as _;
    use crate::message::SipMethod;
    use crate::test_utils;

    #[tokio::test]
    async fn test_new_response_copies_mandatory_headers() {
        let endpoint = Endpoint::builder().build().await.unwrap();
        let request = test_utils::request(SipMethod::Register);

        let response = endpoint.new_response(&request, StatusCode::Ok);
        let headers = &response.response.headers;

        assert_eq!(headers.via().unwrap(), &request.request_headers.via);
        assert_eq!(headers.call_id().unwrap(), &request.request_headers.call_id);
        assert_eq!(headers.cseq().unwrap().cseq, request.request_headers.cseq.cseq);
        assert_eq!(headers.from_hdr().unwrap().tag(), request.request_headers.from.tag());
        // A To-tag was assigned.
        assert!(headers.to_hdr().unwrap().tag().is_some());
    }

    #[tokio::test]
    async fn test_trying_gets_no_to_tag() {
        let endpoint = Endpoint::builder().build().await.unwrap();
        let request = test_utils::request(SipMethod::Invite);

        let response = endpoint.new_response(&request, StatusCode::Trying);

        assert!(response.response.headers.to_hdr().unwrap().tag().is_none());
    }

    #[tokio::test]
    async fn test_missing_mandatory_header_gets_400() {
        let endpoint = Endpoint::builder().build().await.unwrap();
        let transport = test_utils::MockTransport::new_udp();
        let addr = transport.addr();

        // A REGISTER with no CSeq.
        let raw = b"REGISTER sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKbad1\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: broken-1\r\n\
            Content-Length: 0\r\n\r\n";
        let packet = crate::transport::Packet {
            payload: crate::transport::Payload::new(bytes::Bytes::from_static(raw)),
            addr,
            time: std::time::SystemTime::now(),
        };

        endpoint
            .process_packet(Arc::new(transport.clone()), packet)
            .await
            .unwrap();

        let response = transport.last_response().unwrap();
        assert_eq!(response.code(), StatusCode::BadRequest);

        let via = response.headers.via().unwrap();
        assert_eq!(via.branch(), Some("z9hG4bKbad1"));
        // The source was stamped before the answer was built.
        assert_eq!(via.received(), Some(addr.ip()));
    }

    #[tokio::test]
    async fn test_negative_content_length_gets_400() {
        let endpoint = Endpoint::builder().build().await.unwrap();
        let transport = test_utils::MockTransport::new_udp();
        let addr = transport.addr();

        // Well-formed but for the Content-Length.
        let raw = b"REGISTER sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKbad2\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: broken-2\r\n\
            CSeq: 1 REGISTER\r\n\
            Content-Length: -1\r\n\r\n";
        let packet = crate::transport::Packet {
            payload: crate::transport::Payload::new(bytes::Bytes::from_static(raw)),
            addr,
            time: std::time::SystemTime::now(),
        };

        endpoint
            .process_packet(Arc::new(transport.clone()), packet)
            .await
            .unwrap();

        let response = transport.last_response().unwrap();
        assert_eq!(response.code(), StatusCode::BadRequest);
        assert_eq!(response.headers.via().unwrap().branch(), Some("z9hG4bKbad2"));
    }

    #[tokio::test]
    async fn test_source_is_stamped_on_the_top_via() {
        let raw = b"REGISTER sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP client.example.com;rport;branch=z9hG4bKstamp1\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: stamp-1\r\n\
            CSeq: 1 REGISTER\r\n\
            Content-Length: 0\r\n\r\n";
        let SipMsg::Request(mut request) = Parser::parse(raw).unwrap() else {
            panic!("expected a request");
        };

        let addr: SocketAddr = "192.0.2.99:40312".parse().unwrap();
        let packet = crate::transport::Packet {
            payload: crate::transport::Payload::new(bytes::Bytes::new()),
            addr,
            time: std::time::SystemTime::now(),
        };
        stamp_source_route(&mut request, &packet);

        let via = request.headers.via().unwrap();
        assert_eq!(via.received(), Some(addr.ip()));
        assert_eq!(via.rport(), Some(40312));
    }

    #[tokio::test]
    async fn test_matching_ip_literal_is_not_stamped() {
        let raw = b"OPTIONS sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP 192.0.2.99:5060;branch=z9hG4bKstamp2\r\n\
            From: <sip:alice@example.com>;tag=1\r\n\
            To: <sip:example.com>\r\n\
            Call-ID: stamp-2\r\n\
            CSeq: 1 OPTIONS\r\n\
            Content-Length: 0\r\n\r\n";
        let SipMsg::Request(mut request) = Parser::parse(raw).unwrap() else {
            panic!("expected a request");
        };

        let addr: SocketAddr = "192.0.2.99:5060".parse().unwrap();
        let packet = crate::transport::Packet {
            payload: crate::transport::Payload::new(bytes::Bytes::new()),
            addr,
            time: std::time::SystemTime::now(),
        };
        stamp_source_route(&mut request, &packet);

        let via = request.headers.via().unwrap();
        assert_eq!(via.received(), None);
        // No bare rport was asked for either.
        assert_eq!(via.rport(), None);
    }

    #[tokio::test]
    async fn test_unparseable_packet_is_dropped() {
        let endpoint = Endpoint::builder().build().await.unwrap();
        let transport = test_utils::MockTransport::new_udp();
        let addr = transport.addr();

        let packet = crate::transport::Packet {
            payload: crate::transport::Payload::new(bytes::Bytes::from_static(b"\x01\x02garbage")),
            addr,
            time: std::time::SystemTime::now(),
        };

        endpoint
            .process_packet(Arc::new(transport.clone()), packet)
            .await
            .unwrap();

        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_serialized_response_carries_content_length() {
        let endpoint = Endpoint::builder().build().await.unwrap();
        let request = test_utils::request(SipMethod::Register);

        let response = endpoint.new_response(&request, StatusCode::Ok);
        let bytes = response.to_bytes().unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert!(text.contains(&format!("{}: {}\r\n", Server::NAME, endpoint.server_name())));
    }
}
