//! Builders and mocks shared by the unit tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers::{CSeq, CallId, Contact, From, Header, Headers, MaxForwards, SipHeaderParse, To, Via};
use crate::message::{
    Request, RequestLine, Response, SipMethod, SipMsg, SipUri, StatusCode, StatusLine, TransportKind,
};
use crate::parser::Parser;
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse, Packet, Payload,
    RequestHeaders, Transport,
};

pub(crate) const TEST_BRANCH: &str = "z9hG4bK3060200";
pub(crate) const TEST_CALL_ID: &str = "bs9ki9iqbee8k5kal8mpqb";

/// A mock transport recording every send, with an optional injected
/// failure at the Nth send.
#[derive(Clone)]
pub(crate) struct MockTransport {
    sent: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
    addr: SocketAddr,
    kind: TransportKind,
    fail_at: Option<usize>,
}

impl MockTransport {
    pub fn with_kind(kind: TransportKind) -> Self {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let port = kind.default_port();

        Self {
            sent: Default::default(),
            addr: SocketAddr::new(ip, port),
            kind,
            fail_at: None,
        }
    }

    pub fn new_udp() -> Self {
        Self::with_kind(TransportKind::Udp)
    }

    pub fn new_tcp() -> Self {
        Self::with_kind(TransportKind::Tcp)
    }

    /// Fails the Nth send (1-based). Zero fails every send.
    pub fn fail_at(mut self, n: usize) -> Self {
        self.fail_at = Some(n);
        self
    }

    /// Fails every send.
    pub fn always_failing(self) -> Self {
        self.fail_at(0)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last_buffer(&self) -> Option<Vec<u8>> {
        let guard = self.sent.lock().unwrap();
        guard.last().map(|(buf, _)| buf).cloned()
    }

    /// Every sent buffer, verbatim, in send order.
    pub fn sent_buffers(&self) -> Vec<Vec<u8>> {
        let guard = self.sent.lock().unwrap();
        guard.iter().map(|(buf, _)| buf.clone()).collect()
    }

    /// The destination of the most recent send.
    pub fn last_addr(&self) -> Option<SocketAddr> {
        let guard = self.sent.lock().unwrap();
        guard.last().map(|(_, addr)| *addr)
    }

    pub fn last_msg(&self) -> Option<SipMsg> {
        self.last_buffer().map(|b| Parser::parse(&b).unwrap())
    }

    pub fn last_request(&self) -> Option<Request> {
        match self.last_msg()? {
            SipMsg::Request(request) => Some(request),
            SipMsg::Response(_) => None,
        }
    }

    pub fn last_response(&self) -> Option<Response> {
        match self.last_msg()? {
            SipMsg::Request(_) => None,
            SipMsg::Response(response) => Some(response),
        }
    }

    /// Every sent message, parsed, in send order.
    pub fn sent_msgs(&self) -> Vec<SipMsg> {
        let guard = self.sent.lock().unwrap();
        guard.iter().map(|(buf, _)| Parser::parse(buf).unwrap()).collect()
    }

    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent_msgs()
            .into_iter()
            .filter_map(|msg| match msg {
                SipMsg::Request(request) => Some(request),
                SipMsg::Response(_) => None,
            })
            .collect()
    }

    pub fn sent_responses(&self) -> Vec<Response> {
        self.sent_msgs()
            .into_iter()
            .filter_map(|msg| match msg {
                SipMsg::Request(_) => None,
                SipMsg::Response(response) => Some(response),
            })
            .collect()
    }

    fn push_msg(&self, entry: (Vec<u8>, SocketAddr)) -> usize {
        let mut guard = self.sent.lock().unwrap();
        guard.push(entry);
        guard.len()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        let current_count = self.push_msg((buf.to_vec(), *addr));

        match self.fail_at {
            Some(0) => {
                return Err(Error::Io(std::io::Error::other("Simulated failure")));
            }
            Some(fail_at) if fail_at == current_count => {
                return Err(Error::Io(std::io::Error::other("Simulated failure")));
            }
            _ => {}
        }

        Ok(buf.len())
    }

    fn protocol(&self) -> TransportKind {
        self.kind
    }

    fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn reliable(&self) -> bool {
        self.kind.reliable()
    }
}

fn base_headers(method: SipMethod, branch: &str, call_id: &str) -> Headers {
    let via = Via::parse(&format!("SIP/2.0/UDP 127.0.0.1:5060;branch={branch}")).unwrap();
    let from = From::parse("<sip:alice@example.com>;tag=88sja8x").unwrap();
    let to = To::parse("<sip:bob@example.com>").unwrap();

    let mut headers = Headers::with_capacity(6);
    headers.push(Header::Via(via));
    headers.push(Header::From(from));
    headers.push(Header::To(to));
    headers.push(Header::CallId(CallId::new(call_id)));
    headers.push(Header::CSeq(CSeq::new(1, method)));
    headers.push(Header::MaxForwards(MaxForwards::new(70)));

    headers
}

fn packet(addr: SocketAddr) -> Packet {
    Packet {
        payload: Payload::new(Bytes::new()),
        addr,
        time: SystemTime::now(),
    }
}

/// An incoming request with the default branch and Call-ID.
pub(crate) fn request(method: SipMethod) -> IncomingRequest {
    request_with(method, TEST_BRANCH, TEST_CALL_ID)
}

/// An incoming request with full control over its transaction identity.
pub(crate) fn request_with(method: SipMethod, branch: &str, call_id: &str) -> IncomingRequest {
    request_on(method, branch, call_id, MockTransport::new_udp())
}

/// An incoming request arriving on the given transport.
pub(crate) fn request_on(method: SipMethod, branch: &str, call_id: &str, transport: MockTransport) -> IncomingRequest {
    let uri = SipUri::parse("sip:bob@example.com").unwrap();
    let headers = base_headers(method, branch, call_id);
    let request_headers = RequestHeaders::extract(&headers).unwrap();
    let addr = transport.addr();

    IncomingRequest {
        request: Request {
            req_line: RequestLine { method, uri },
            headers,
            body: None,
        },
        request_headers,
        transport: Arc::new(transport),
        packet: packet(addr),
        transaction: None,
        auth_username: None,
    }
}

/// An outbound request bound to a fresh mock transport.
pub(crate) fn outgoing_request(method: SipMethod) -> OutgoingRequest {
    outgoing_request_on(method, MockTransport::new_udp())
}

/// An outbound request bound to the given mock transport.
pub(crate) fn outgoing_request_on(method: SipMethod, transport: MockTransport) -> OutgoingRequest {
    let uri = SipUri::parse("sip:bob@example.com").unwrap();
    let headers = base_headers(method, TEST_BRANCH, TEST_CALL_ID);
    let addr = transport.addr();

    OutgoingRequest {
        msg: Request {
            req_line: RequestLine { method, uri },
            headers,
            body: None,
        },
        addr,
        buf: None,
        transport: Arc::new(transport),
    }
}

/// An incoming response with the default branch and Call-ID.
pub(crate) fn incoming_response(code: StatusCode, cseq_method: SipMethod) -> IncomingResponse {
    incoming_response_with(code, cseq_method, TEST_BRANCH, TEST_CALL_ID)
}

/// An incoming response with full control over its transaction identity.
pub(crate) fn incoming_response_with(
    code: StatusCode,
    cseq_method: SipMethod,
    branch: &str,
    call_id: &str,
) -> IncomingResponse {
    let via = Via::parse(&format!("SIP/2.0/UDP 127.0.0.1:5060;branch={branch}")).unwrap();
    let from = From::parse("<sip:alice@example.com>;tag=88sja8x").unwrap();
    let to = To::parse("<sip:bob@example.com>;tag=314159").unwrap();

    let mut headers = Headers::with_capacity(5);
    headers.push(Header::Via(via));
    headers.push(Header::From(from));
    headers.push(Header::To(to));
    headers.push(Header::CallId(CallId::new(call_id)));
    headers.push(Header::CSeq(CSeq::new(1, cseq_method)));

    let request_headers = RequestHeaders::extract(&headers).unwrap();
    let transport = MockTransport::new_udp();
    let addr = transport.addr();

    IncomingResponse {
        response: Response {
            status_line: StatusLine::new(code, code.reason()),
            headers,
            body: None,
        },
        request_headers,
        transport: Arc::new(transport),
        packet: packet(addr),
        transaction: None,
    }
}

/// An outbound response addressed at a fresh mock transport.
pub(crate) fn outgoing_response(code: StatusCode) -> OutgoingResponse {
    let headers = base_headers(SipMethod::Options, TEST_BRANCH, TEST_CALL_ID);
    let transport = MockTransport::new_udp();
    let addr = transport.addr();

    OutgoingResponse {
        response: Response {
            status_line: StatusLine::new(code, code.reason()),
            headers,
            body: None,
        },
        addr: OutgoingAddr::Addr {
            addr,
            transport: Arc::new(transport),
        },
        buf: None,
    }
}

/// A contact header value pointing at the given host and port.
pub(crate) fn contact(user: &str, host: &str, port: u16) -> Contact {
    Contact::new(SipUri::parse(&format!("sip:{user}@{host}:{port}")).unwrap())
}
