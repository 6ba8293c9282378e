//! The stateful proxy engine.
//!
//! Dispatches proxyable requests, forks INVITEs across every registered
//! contact, aggregates per-branch responses into a single upstream
//! answer, propagates CANCEL, and routes stray responses by Via.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::endpoint::{Endpoint, response_from_request};
use crate::error::{Error, Result};
use crate::headers::{Allow, CSeq, Header, Headers, MaxForwards, Require, Via};
use crate::message::{Host, HostPort, Request, RequestLine, Response, Scheme, SipMethod, SipUri, StatusCode, TransportKind};
use crate::registrar::Registrar;
use crate::service::SipService;
use crate::transaction::{
    ClientTransaction, InvClientTransaction, InvServerTransaction, ServerTransaction, TransactionKey,
    TransactionLayer, generate_branch,
};
use crate::transport::{
    IncomingRequest, IncomingResponse, OutgoingAddr, OutgoingRequest, OutgoingResponse, serialize_request,
    serialize_response,
};

mod context;

pub use context::{BranchState, ClientBranch, ProxyContext, ProxyContextKey};
use context::CancelTarget;

/// Everything the proxy needs to know about its environment.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Authority inserted into Via on forwarding.
    pub host: String,
    pub port: u16,
    /// Injected when a request arrives without Max-Forwards.
    pub max_forwards_default: i32,
    /// Idle lifetime of a proxy context.
    pub context_ttl: Duration,
    /// Cadence of the context sweep.
    pub sweep_interval: Duration,
    /// Datagram size above which UDP is promoted to TCP.
    pub switchover_bytes: usize,
    /// Answer 421 to INVITEs without Session-Expires.
    pub require_session_timer: bool,
    /// Server identifier stamped into originated responses.
    pub server_name: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5060,
            max_forwards_default: 70,
            context_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            switchover_bytes: 1300,
            require_session_timer: false,
            server_name: "sipward".to_string(),
        }
    }
}

/// Who a branch value belongs to.
#[derive(Clone)]
enum BranchOwner {
    /// A fork of an INVITE aggregated in a proxy context.
    Forked(ProxyContextKey),
    /// A single-target forward whose response answers this server
    /// transaction.
    Straight(ServerTransaction),
}

struct ProxyInner {
    settings: ProxySettings,
    registrar: Arc<dyn Registrar>,
    contexts: RwLock<HashMap<ProxyContextKey, Arc<ProxyContext>>>,
    branch_index: RwLock<HashMap<String, BranchOwner>>,
    termination_tx: mpsc::UnboundedSender<TransactionKey>,
}

/// The proxy service. Registered after authentication and registrar.
#[derive(Clone)]
pub struct ProxyService(Arc<ProxyInner>);

impl ProxyService {
    /// Creates the service and spawns its termination listener and
    /// context sweeper.
    pub fn new(registrar: Arc<dyn Registrar>, settings: ProxySettings) -> Self {
        let (termination_tx, termination_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ProxyInner {
            settings,
            registrar,
            contexts: RwLock::new(HashMap::new()),
            branch_index: RwLock::new(HashMap::new()),
            termination_tx,
        });

        tokio::spawn(termination_task(inner.clone(), termination_rx));
        tokio::spawn(sweep_task(inner.clone()));

        ProxyService(inner)
    }
}

impl ProxyInner {
    fn context_key(request: &IncomingRequest) -> ProxyContextKey {
        ProxyContextKey {
            call_id: request.request_headers.call_id.as_str().to_string(),
            cseq: request.request_headers.cseq.cseq,
        }
    }

    fn find_context(&self, key: &ProxyContextKey) -> Option<Arc<ProxyContext>> {
        self.contexts.read().expect("Lock failed").get(key).cloned()
    }

    fn find_owner(&self, branch: &str) -> Option<BranchOwner> {
        self.branch_index.read().expect("Lock failed").get(branch).cloned()
    }

    /// `true` when the request URI names this server itself rather than
    /// a user it serves.
    fn is_local_uri(&self, uri: &SipUri) -> bool {
        uri.user.is_none() && uri.host_port.host.to_string() == self.settings.host
    }

    /// The Via this proxy stamps onto forwarded requests.
    fn own_via(&self, kind: TransportKind, branch: &str) -> Via {
        let sent_by = HostPort::new(Host::from(self.settings.host.as_str()), Some(self.settings.port));
        Via::new(kind, sent_by, Some(branch))
    }

    /// Checks Max-Forwards, answering 483 when the hop budget is gone.
    /// Returns the decremented value to forward with.
    async fn check_max_forwards(
        &self,
        endpoint: &Endpoint,
        request: &mut IncomingRequest,
    ) -> Result<Option<MaxForwards>> {
        let mf = request
            .request
            .headers
            .max_forwards()
            .copied()
            .unwrap_or(MaxForwards::new(self.settings.max_forwards_default));

        if mf.is_exhausted() {
            self.reject(endpoint, request, StatusCode::TooManyHops).await?;
            return Ok(None);
        }

        Ok(Some(mf.decremented()))
    }

    /// Answers a request with a final response through a server
    /// transaction of the matching kind.
    async fn reject(&self, endpoint: &Endpoint, request: &mut IncomingRequest, code: StatusCode) -> Result<()> {
        let mut response = endpoint.new_response(request, code);

        if request.method().is_invite() {
            let tsx = InvServerTransaction::new(endpoint.transaction_layer(), request);
            tsx.respond(&mut response).await
        } else {
            let tsx = ServerTransaction::new(endpoint.transaction_layer(), request);
            tsx.respond(&mut response).await
        }
    }

    async fn on_invite(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<()> {
        if self.settings.require_session_timer && request.request.headers.session_expires().is_none() {
            let mut response = endpoint.new_response(request, StatusCode::ExtensionRequired);
            response.headers_mut().push(Header::Require(Require::new("timer")));

            let tsx = InvServerTransaction::new(endpoint.transaction_layer(), request);
            return tsx.respond(&mut response).await;
        }

        let Some(forward_mf) = self.check_max_forwards(endpoint, request).await? else {
            return Ok(());
        };

        let server_tsx = InvServerTransaction::new(endpoint.transaction_layer(), request);
        let mut trying = endpoint.new_response(request, StatusCode::Trying);
        server_tsx.respond(&mut trying).await?;

        let aor = request.request.uri().aor();
        let contacts = self.registrar.find_contacts(&aor);
        if contacts.is_empty() {
            tracing::info!("No contacts registered for {}", aor);
            let mut response = endpoint.new_response(request, StatusCode::NotFound);
            return server_tsx.respond(&mut response).await;
        }

        let key = Self::context_key(request);
        let context = Arc::new(ProxyContext::new(key.clone(), request.request.clone(), server_tsx.clone()));

        let mut forwarded = request.request.clone();
        forwarded.headers.set_max_forwards(forward_mf);

        let mut launched = 0usize;
        for binding in &contacts {
            match self.fork_branch(endpoint, &context, &forwarded, &binding.uri).await {
                Ok(branch) => {
                    let mut index = self.branch_index.write().expect("Lock failed");
                    index.insert(branch, BranchOwner::Forked(key.clone()));
                    launched += 1;
                }
                Err(err) => {
                    tracing::warn!("Failed to fork {} towards {}: {}", aor, binding.uri, err);
                }
            }
        }

        if launched == 0 {
            context.latch_final();
            let mut response = endpoint.new_response(request, StatusCode::ServerInternalError);
            return server_tsx.respond(&mut response).await;
        }

        tracing::debug!("Forked INVITE for {} across {} contact(s)", aor, launched);
        self.contexts.write().expect("Lock failed").insert(key, context);

        Ok(())
    }

    /// Clones the request towards one contact: fresh Via and branch,
    /// rewritten Request-URI, then a new client transaction.
    async fn fork_branch(
        &self,
        endpoint: &Endpoint,
        context: &Arc<ProxyContext>,
        forwarded: &Request,
        target: &SipUri,
    ) -> Result<String> {
        let (addr, kind_hint) = resolve_target(target).await?;
        let branch = generate_branch();

        let mut msg = forwarded.clone();
        msg.req_line.uri = target.clone();
        msg.headers.prepend_via(self.own_via(kind_hint, &branch));

        let buf = serialize_request(&msg)?;
        let transport = endpoint
            .transport_layer()
            .obtain(kind_hint, addr, buf.len(), self.settings.switchover_bytes)
            .await?;

        // The switchover may have picked another protocol; the Via must
        // name the one actually used.
        let buf = if transport.protocol() == kind_hint {
            buf
        } else {
            msg.headers.pop_via();
            msg.headers.prepend_via(self.own_via(transport.protocol(), &branch));
            serialize_request(&msg)?
        };

        let outgoing = OutgoingRequest {
            msg: msg.clone(),
            addr,
            transport,
            buf: Some(buf),
        };

        let tsx = InvClientTransaction::send(outgoing, endpoint.transaction_layer()).await?;
        tsx.set_termination_listener(self.termination_tx.clone());

        context.add_branch(ClientBranch {
            branch: branch.clone(),
            target: target.clone(),
            request: msg,
            tsx,
            state: BranchState::Trying,
            last_response: None,
            cancelled: false,
        });

        Ok(branch)
    }

    async fn on_cancel(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<()> {
        let key = Self::context_key(request);
        let context = self.find_context(&key);

        // The CANCEL gets its own server transaction for its 200.
        let tsx = ServerTransaction::new(endpoint.transaction_layer(), request);

        match context {
            Some(context) => {
                let mut ok = endpoint.new_response(request, StatusCode::Ok);
                tsx.respond(&mut ok).await?;

                context.touch();
                self.cancel_branches(&context, endpoint.transaction_layer()).await;
            }
            None => {
                tracing::info!("CANCEL without a matching INVITE context, call-id {}", key.call_id);
                let mut response = endpoint.new_response(request, StatusCode::CallOrTransactionDoesNotExist);
                tsx.respond(&mut response).await?;
            }
        }

        Ok(())
    }

    /// Sends CANCEL to every branch still in Trying or Proceeding.
    /// Best-effort: a branch whose CANCEL cannot be sent advances anyway.
    async fn cancel_branches(&self, context: &Arc<ProxyContext>, layer: &TransactionLayer) {
        for target in context.branches_to_cancel() {
            if let Err(err) = self.send_cancel(&target, layer).await {
                tracing::info!("Failed to CANCEL branch {}: {}", target.branch, err);
            }
        }
    }

    async fn send_cancel(&self, target: &CancelTarget, layer: &TransactionLayer) -> Result<()> {
        let cancel = cancel_for(&target.request)?;
        let outgoing = OutgoingRequest {
            msg: cancel,
            addr: target.tsx.addr(),
            transport: target.tsx.transport().clone(),
            buf: None,
        };

        ClientTransaction::send(outgoing, layer).await?;
        Ok(())
    }

    async fn on_ack(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<()> {
        let key = Self::context_key(request);
        let Some(context) = self.find_context(&key) else {
            // ACK for a dialog this proxy holds no state for.
            tracing::trace!("Dropping ACK without a matching context");
            return Ok(());
        };
        context.touch();

        if let Some((target, _)) = context.two_hundred_target() {
            // ACK to a 2xx travels end-to-end; forward it to the branch
            // that answered.
            let forward_mf = request
                .request
                .headers
                .max_forwards()
                .copied()
                .unwrap_or(MaxForwards::new(self.settings.max_forwards_default))
                .decremented();

            let (addr, kind_hint) = resolve_target(&target).await?;
            let branch = generate_branch();

            let mut msg = request.request.clone();
            msg.req_line.uri = target.clone();
            msg.headers.set_max_forwards(forward_mf);
            msg.headers.prepend_via(self.own_via(kind_hint, &branch));

            let buf = serialize_request(&msg)?;
            let transport = endpoint
                .transport_layer()
                .obtain(kind_hint, addr, buf.len(), self.settings.switchover_bytes)
                .await?;
            transport.send(&buf, &addr).await?;
        } else if context.has_failed_branch() {
            // The client transaction already ACKed the failure downstream.
            tracing::trace!("ACK absorbed for a failed fork");
        }

        Ok(())
    }

    /// Single-target forward for in-dialog requests (BYE, INFO) and
    /// OPTIONS not addressed to this server.
    async fn forward_straight(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<()> {
        let Some(forward_mf) = self.check_max_forwards(endpoint, request).await? else {
            return Ok(());
        };

        let server_tsx = ServerTransaction::new(endpoint.transaction_layer(), request);

        let aor = request.request.uri().aor();
        let contacts = self.registrar.find_contacts(&aor);
        let Some(binding) = contacts.first() else {
            tracing::info!("No route for {} {}", request.method(), aor);
            let mut response = endpoint.new_response(request, StatusCode::NotFound);
            return server_tsx.respond(&mut response).await;
        };

        let branch = generate_branch();
        let send_result = async {
            let (addr, kind_hint) = resolve_target(&binding.uri).await?;

            let mut msg = request.request.clone();
            msg.req_line.uri = binding.uri.clone();
            msg.headers.set_max_forwards(forward_mf);
            msg.headers.prepend_via(self.own_via(kind_hint, &branch));

            let buf = serialize_request(&msg)?;
            let transport = endpoint
                .transport_layer()
                .obtain(kind_hint, addr, buf.len(), self.settings.switchover_bytes)
                .await?;

            let outgoing = OutgoingRequest {
                msg,
                addr,
                transport,
                buf: Some(buf),
            };
            ClientTransaction::send(outgoing, endpoint.transaction_layer()).await
        }
        .await;

        match send_result {
            Ok(tsx) => {
                tsx.set_termination_listener(self.termination_tx.clone());
                let mut index = self.branch_index.write().expect("Lock failed");
                index.insert(branch, BranchOwner::Straight(server_tsx));
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Failed to forward {} for {}: {}", request.method(), aor, err);
                let mut response = endpoint.new_response(request, StatusCode::ServerInternalError);
                server_tsx.respond(&mut response).await
            }
        }
    }

    /// Locally answers an OPTIONS addressed to the server itself.
    async fn answer_options(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<()> {
        let tsx = ServerTransaction::new(endpoint.transaction_layer(), request);

        let mut response = endpoint.new_response(request, StatusCode::Ok);
        response.headers_mut().push(Header::Allow(Allow::supported()));

        tsx.respond(&mut response).await
    }

    /// Answers 405 with the supported method set.
    async fn method_not_allowed(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<()> {
        let tsx = ServerTransaction::new(endpoint.transaction_layer(), request);

        let mut response = endpoint.new_response(request, StatusCode::MethodNotAllowed);
        response.headers_mut().push(Header::Allow(Allow::supported()));

        tsx.respond(&mut response).await
    }

    /// A response arrived on a branch this proxy forked.
    async fn handle_forked_response(
        &self,
        endpoint: &Endpoint,
        context: &Arc<ProxyContext>,
        branch: &str,
        response: &IncomingResponse,
    ) -> Result<()> {
        context.touch();

        let code = response.code();
        let mut upstream = response.response.clone();
        upstream.pop_via();

        match code.class() {
            1 => {
                context.mark_branch(branch, BranchState::Proceeding, Some(&response.response));
                if !context.final_sent() {
                    self.forward_upstream(context, upstream).await?;
                }
            }
            2 => {
                context.mark_branch(branch, BranchState::Completed, Some(&response.response));
                if context.latch_final() {
                    self.forward_upstream(context, upstream).await?;
                    self.cancel_branches(context, endpoint.transaction_layer()).await;
                } else {
                    tracing::debug!("Dropping {} on branch {}: final already sent", code, branch);
                }
            }
            _ => {
                context.mark_branch(branch, BranchState::Completed, Some(&response.response));
                context.offer_best(&upstream);
                self.try_complete(context).await?;
            }
        }

        Ok(())
    }

    /// Emits the final aggregate once every branch has concluded.
    async fn try_complete(&self, context: &Arc<ProxyContext>) -> Result<()> {
        if !context.all_branches_done() {
            return Ok(());
        }
        if !context.latch_final() {
            return Ok(());
        }

        let response = context
            .best_response()
            .unwrap_or_else(|| self.synthesized_final(context));
        self.forward_upstream(context, response).await
    }

    /// Builds the 600 emitted when no branch ever produced a final
    /// response to select from.
    fn synthesized_final(&self, context: &Arc<ProxyContext>) -> Response {
        response_from_request(context.original(), StatusCode::BusyEverywhere, &self.settings.server_name)
    }

    async fn forward_upstream(&self, context: &Arc<ProxyContext>, response: Response) -> Result<()> {
        let server_tsx = context.server_tsx();
        let mut outgoing = OutgoingResponse {
            response,
            addr: OutgoingAddr::Addr {
                addr: server_tsx.addr(),
                transport: server_tsx.transport().clone(),
            },
            buf: None,
        };

        server_tsx.respond(&mut outgoing).await
    }

    /// A response arrived for a single-target forward.
    async fn handle_straight_response(
        &self,
        server_tsx: &ServerTransaction,
        branch: &str,
        response: &IncomingResponse,
    ) -> Result<()> {
        let mut upstream = response.response.clone();
        upstream.pop_via();

        let is_final = response.code().is_final();

        let mut outgoing = OutgoingResponse {
            response: upstream,
            addr: OutgoingAddr::Addr {
                addr: server_tsx.addr(),
                transport: server_tsx.transport().clone(),
            },
            buf: None,
        };
        server_tsx.respond(&mut outgoing).await?;

        if is_final {
            self.branch_index.write().expect("Lock failed").remove(branch);
        }

        Ok(())
    }

    /// Routes a response this proxy holds no state for: pop our Via,
    /// then follow the next one.
    async fn route_by_via(&self, endpoint: &Endpoint, response: &IncomingResponse) -> Result<bool> {
        let mut forwarded = response.response.clone();
        forwarded.pop_via();

        let Some(next) = forwarded.headers.via().cloned() else {
            return Ok(false);
        };

        let kind = next.transport();
        let addr = match (next.received(), next.rport()) {
            (Some(ip), Some(port)) => SocketAddr::new(ip, port),
            (Some(ip), None) => SocketAddr::new(ip, next.sent_by().port_or_default()),
            _ => resolve_host_port(next.sent_by()).await?,
        };

        let buf = serialize_response(&forwarded)?;
        let transport = endpoint
            .transport_layer()
            .obtain(kind, addr, buf.len(), self.settings.switchover_bytes)
            .await?;
        transport.send(&buf, &addr).await?;

        Ok(true)
    }
}

/// Consumes branch termination notifications: a fork that dies without a
/// final response still concludes its context.
async fn termination_task(inner: Arc<ProxyInner>, mut rx: mpsc::UnboundedReceiver<TransactionKey>) {
    while let Some(key) = rx.recv().await {
        let Some(branch) = key.branch() else { continue };
        let Some(owner) = inner.find_owner(branch) else { continue };

        match owner {
            BranchOwner::Forked(context_key) => {
                let Some(context) = inner.find_context(&context_key) else {
                    continue;
                };
                context.mark_branch(branch, BranchState::Terminated, None);
                if let Err(err) = inner.try_complete(&context).await {
                    tracing::warn!("Failed to conclude context after branch loss: {}", err);
                }
            }
            BranchOwner::Straight(server_tsx) => {
                // The forward timed out with no response at all; give the
                // server transaction up rather than leak it.
                if server_tsx.last_status_code().is_none() {
                    server_tsx.on_terminated();
                }
                inner.branch_index.write().expect("Lock failed").remove(branch);
            }
        }
    }
}

/// Expires idle proxy contexts.
async fn sweep_task(inner: Arc<ProxyInner>) {
    loop {
        tokio::time::sleep(inner.settings.sweep_interval).await;

        let expired: Vec<Arc<ProxyContext>> = {
            let mut contexts = inner.contexts.write().expect("Lock failed");
            let keys: Vec<ProxyContextKey> = contexts
                .iter()
                .filter(|(_, c)| c.idle_for() > inner.settings.context_ttl)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| contexts.remove(k)).collect()
        };

        for context in expired {
            tracing::debug!("Expiring idle proxy context {:?}", context.key());
            {
                let mut index = inner.branch_index.write().expect("Lock failed");
                for branch in context.branch_values() {
                    index.remove(&branch);
                }
            }

            // Expiry answers the upstream transaction only when nothing
            // else did.
            if !context.final_sent() && context.latch_final() {
                let response = context
                    .best_response()
                    .unwrap_or_else(|| inner.synthesized_final(&context));
                if let Err(err) = inner.forward_upstream(&context, response).await {
                    tracing::warn!("Failed to answer expired context: {}", err);
                }
            }
        }
    }
}

/// Builds the CANCEL for one forked request, per RFC3261 9.1: same URI,
/// Via and sequence number, method CANCEL.
fn cancel_for(forked: &Request) -> Result<Request> {
    let headers = crate::transport::RequestHeaders::extract(&forked.headers)?;

    let mut cancel_headers = Headers::with_capacity(6);
    cancel_headers.push(Header::Via(headers.via));
    cancel_headers.push(Header::From(headers.from));
    cancel_headers.push(Header::To(headers.to));
    cancel_headers.push(Header::CallId(headers.call_id));
    cancel_headers.push(Header::CSeq(CSeq::new(headers.cseq.cseq, SipMethod::Cancel)));
    cancel_headers.push(Header::MaxForwards(MaxForwards::new(70)));

    Ok(Request {
        req_line: RequestLine {
            method: SipMethod::Cancel,
            uri: forked.req_line.uri.clone(),
        },
        headers: cancel_headers,
        body: None,
    })
}

/// Resolves a contact URI to a socket address and transport hint.
async fn resolve_target(uri: &SipUri) -> Result<(SocketAddr, TransportKind)> {
    let kind = match uri.params.get("transport") {
        Some(transport) => TransportKind::from(transport),
        // A sips target selects the reliable transport.
        None if uri.scheme == Scheme::Sips => TransportKind::Tcp,
        None => TransportKind::Udp,
    };

    let addr = resolve_host_port(&uri.host_port).await?;
    Ok((addr, kind))
}

pub(crate) async fn resolve_host_port(host_port: &HostPort) -> Result<SocketAddr> {
    let port = host_port.port_or_default();
    match &host_port.host {
        Host::IpAddr(ip) => Ok(SocketAddr::new(*ip, port)),
        Host::Domain(domain) => {
            let mut addrs = tokio::net::lookup_host((domain.as_str(), port)).await?;
            addrs
                .next()
                .ok_or_else(|| Error::TransportNotFound(format!("no address for {domain}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{CallId, From as FromHdr, SipHeaderParse, To};
    use crate::registrar::MemoryRegistrar;
    use crate::test_utils::{self, MockTransport};
    use crate::transport::{Packet, Payload, RequestHeaders, Transport};
    use std::time::SystemTime;
    use tokio::time::{self, Duration};

    struct Fixture {
        endpoint: Endpoint,
        registrar: Arc<MemoryRegistrar>,
        /// Transport every forked request leaves on.
        downstream: MockTransport,
        /// Transport the caller's requests arrive on and responses
        /// return through.
        upstream: MockTransport,
    }

    async fn fixture() -> Fixture {
        fixture_with(MockTransport::new_udp()).await
    }

    async fn fixture_with(downstream: MockTransport) -> Fixture {
        let registrar = Arc::new(MemoryRegistrar::new());
        let settings = ProxySettings {
            host: "proxy.example.com".to_string(),
            port: 5060,
            ..Default::default()
        };
        let proxy = ProxyService::new(registrar.clone(), settings);

        let endpoint = Endpoint::builder().with_service(proxy).build().await.unwrap();
        endpoint.transport_layer().register(Arc::new(downstream.clone()));

        Fixture {
            endpoint,
            registrar,
            downstream,
            upstream: MockTransport::new_udp(),
        }
    }

    fn register_bob(fixture: &Fixture, ports: &[u16]) -> Vec<SipUri> {
        let uris: Vec<SipUri> = ports
            .iter()
            .map(|port| SipUri::parse(&format!("sip:bob@127.0.0.1:{port}")).unwrap())
            .collect();
        for uri in &uris {
            fixture.registrar.bind("bob@example.com", uri, Duration::from_secs(3600));
        }
        uris
    }

    /// The final response a forked-to UAS would send back: the fork's
    /// whole Via stack with a To-tag added.
    fn branch_response(fork: &Request, code: StatusCode) -> IncomingResponse {
        let mut headers = crate::headers::Headers::with_capacity(6);
        for via in fork.headers.vias() {
            headers.push(Header::Via(via.clone()));
        }
        headers.push(Header::From(fork.headers.from_hdr().unwrap().clone()));

        let mut to = fork.headers.to_hdr().unwrap().clone();
        if to.tag().is_none() && code != StatusCode::Trying {
            to.set_tag("uas-tag-1");
        }
        headers.push(Header::To(to));
        headers.push(Header::CallId(fork.headers.call_id().unwrap().clone()));
        headers.push(Header::CSeq(*fork.headers.cseq().unwrap()));

        let request_headers = RequestHeaders::extract(&headers).unwrap();
        let transport = MockTransport::new_udp();
        let addr = transport.addr();

        IncomingResponse {
            response: Response {
                status_line: crate::message::StatusLine::new(code, code.reason()),
                headers,
                body: None,
            },
            request_headers,
            transport: Arc::new(transport),
            packet: Packet {
                payload: Payload::new(bytes::Bytes::new()),
                addr,
                time: SystemTime::now(),
            },
            transaction: None,
        }
    }

    fn final_codes(transport: &MockTransport) -> Vec<u16> {
        transport
            .sent_responses()
            .iter()
            .map(|r| r.code().code())
            .filter(|code| *code >= 200)
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn test_invite_forks_across_every_contact() {
        let fixture = fixture().await;
        let contacts = register_bob(&fixture, &[5062, 5064]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "s3-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();

        // 100 Trying went upstream at once.
        assert_eq!(fixture.upstream.sent_responses()[0].code(), StatusCode::Trying);

        let forks = fixture.downstream.sent_requests();
        assert_eq!(forks.len(), 2);

        let branches: Vec<&str> = forks.iter().map(|f| f.headers.via().unwrap().branch().unwrap()).collect();
        assert_ne!(branches[0], branches[1]);
        for (fork, branch) in forks.iter().zip(&branches) {
            assert!(branch.starts_with(crate::headers::BRANCH_MAGIC_COOKIE));
            // Our Via is on top, the caller's is below it.
            assert_eq!(fork.headers.vias().count(), 2);
            assert_eq!(fork.headers.via().unwrap().sent_by().host.to_string(), "proxy.example.com");
            // Max-Forwards went down by exactly one.
            assert_eq!(fork.headers.max_forwards().unwrap().value(), 69);
        }
        let targets: Vec<&SipUri> = forks.iter().map(|f| f.uri()).collect();
        assert!(contacts.iter().all(|c| targets.contains(&c)));
    }

    #[test_log::test(tokio::test)]
    async fn test_same_class_lower_code_wins() {
        let fixture = fixture().await;
        register_bob(&fixture, &[5062, 5064]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "s3-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();
        let forks = fixture.downstream.sent_requests();

        let mut busy = branch_response(&forks[0], StatusCode::BusyHere);
        fixture.endpoint.process_response(&mut busy).await.unwrap();

        // One branch still pending: nothing final upstream yet.
        assert_eq!(final_codes(&fixture.upstream), Vec::<u16>::new());

        let mut not_found = branch_response(&forks[1], StatusCode::NotFound);
        fixture.endpoint.process_response(&mut not_found).await.unwrap();

        // Exactly one final response, and 404 beat 486.
        assert_eq!(final_codes(&fixture.upstream), vec![404]);

        // The forwarded response no longer carries this proxy's Via.
        let final_response = fixture.upstream.sent_responses().pop().unwrap();
        assert_eq!(final_response.headers.vias().count(), 1);
        assert_eq!(
            final_response.headers.via().unwrap().branch(),
            Some("z9hG4bKcaller1")
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_2xx_latches_and_cancels_the_sibling() {
        let fixture = fixture().await;
        let contacts = register_bob(&fixture, &[5062, 5064]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "s4-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();
        let forks = fixture.downstream.sent_requests();

        let answered = forks[0].clone();
        let mut ok = branch_response(&answered, StatusCode::Ok);
        fixture.endpoint.process_response(&mut ok).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![200]);

        // The sibling branch got a CANCEL reusing its INVITE branch.
        let cancels: Vec<Request> = fixture
            .downstream
            .sent_requests()
            .into_iter()
            .filter(|r| r.method() == SipMethod::Cancel)
            .collect();
        assert_eq!(cancels.len(), 1);
        assert_eq!(
            cancels[0].headers.via().unwrap().branch(),
            forks[1].headers.via().unwrap().branch()
        );
        assert_eq!(cancels[0].headers.cseq().unwrap().method(), SipMethod::Cancel);
        assert!(contacts.contains(cancels[0].uri()));

        // A late 486 on the cancelled branch is dropped.
        let mut late = branch_response(&forks[1], StatusCode::BusyHere);
        fixture.endpoint.process_response(&mut late).await.unwrap();
        assert_eq!(final_codes(&fixture.upstream), vec![200]);
    }

    #[test_log::test(tokio::test)]
    async fn test_upstream_cancel_reaches_open_branches() {
        let fixture = fixture().await;
        register_bob(&fixture, &[5062, 5064]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "cancel-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();
        let forks = fixture.downstream.sent_requests();
        assert_eq!(forks.len(), 2);

        let mut cancel =
            test_utils::request_on(SipMethod::Cancel, "z9hG4bKcaller1", "cancel-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut cancel).await.unwrap();

        // The CANCEL itself was answered 200.
        assert_eq!(final_codes(&fixture.upstream), vec![200]);

        let cancels: Vec<Request> = fixture
            .downstream
            .sent_requests()
            .into_iter()
            .filter(|r| r.method() == SipMethod::Cancel)
            .collect();
        assert_eq!(cancels.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_without_invite_gets_481() {
        let fixture = fixture().await;

        let mut cancel =
            test_utils::request_on(SipMethod::Cancel, "z9hG4bKlost", "unknown-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut cancel).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![481]);
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausted_max_forwards_gets_483() {
        let fixture = fixture().await;
        register_bob(&fixture, &[5062]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "hops-call", fixture.upstream.clone());
        invite.request.headers.set_max_forwards(MaxForwards::new(0));

        fixture.endpoint.process_request(&mut invite).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![483]);
        // No outbound request was emitted.
        assert_eq!(fixture.downstream.sent_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_max_forwards_is_injected_and_decremented() {
        let fixture = fixture().await;
        register_bob(&fixture, &[5062]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "mf-call", fixture.upstream.clone());
        invite
            .request
            .headers
            .retain(|h| !matches!(h, Header::MaxForwards(_)));

        fixture.endpoint.process_request(&mut invite).await.unwrap();

        let fork = fixture.downstream.last_request().unwrap();
        assert_eq!(fork.headers.max_forwards().unwrap().value(), 69);
    }

    #[test_log::test(tokio::test)]
    async fn test_unregistered_aor_gets_404() {
        let fixture = fixture().await;

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "no-aor", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![404]);
        assert_eq!(fixture.downstream.sent_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_all_forks_failing_gets_500() {
        let fixture = fixture_with(MockTransport::new_udp().always_failing()).await;
        register_bob(&fixture, &[5062, 5064]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "dead-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![500]);
    }

    #[test_log::test(tokio::test)]
    async fn test_ack_to_2xx_is_forwarded_to_the_answering_branch() {
        let fixture = fixture().await;
        let contacts = register_bob(&fixture, &[5062]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "ack-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();
        let fork = fixture.downstream.last_request().unwrap();

        let mut ok = branch_response(&fork, StatusCode::Ok);
        fixture.endpoint.process_response(&mut ok).await.unwrap();

        let mut ack = test_utils::request_on(SipMethod::Ack, "z9hG4bKcaller2", "ack-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut ack).await.unwrap();

        let forwarded = fixture.downstream.last_request().unwrap();
        assert_eq!(forwarded.method(), SipMethod::Ack);
        assert_eq!(forwarded.uri(), &contacts[0]);
        assert_eq!(forwarded.headers.max_forwards().unwrap().value(), 69);
    }

    #[test_log::test(tokio::test)]
    async fn test_ack_without_context_is_dropped() {
        let fixture = fixture().await;

        let mut ack = test_utils::request_on(SipMethod::Ack, "z9hG4bKstray", "stray-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut ack).await.unwrap();

        assert_eq!(fixture.upstream.sent_count(), 0);
        assert_eq!(fixture.downstream.sent_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_bye_is_forwarded_single_target() {
        let fixture = fixture().await;
        let contacts = register_bob(&fixture, &[5062, 5064]);

        let mut bye = test_utils::request_on(SipMethod::Bye, "z9hG4bKbye1", "bye-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut bye).await.unwrap();

        // Exactly one forward, no forking.
        let forwards = fixture.downstream.sent_requests();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].method(), SipMethod::Bye);
        assert!(contacts.contains(forwards[0].uri()));

        let mut ok = branch_response(&forwards[0], StatusCode::Ok);
        fixture.endpoint.process_response(&mut ok).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![200]);
    }

    #[test_log::test(tokio::test)]
    async fn test_options_for_the_server_is_answered_locally() {
        let fixture = fixture().await;

        let mut options =
            test_utils::request_on(SipMethod::Options, "z9hG4bKopt1", "opt-call", fixture.upstream.clone());
        options.request.req_line.uri = SipUri::parse("sip:proxy.example.com").unwrap();

        fixture.endpoint.process_request(&mut options).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![200]);
        let response = fixture.upstream.last_response().unwrap();
        let allow = response.headers.iter().any(|h| matches!(h, Header::Allow(_)));
        assert!(allow);
        assert_eq!(fixture.downstream.sent_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_unsupported_method_gets_405_with_allow() {
        let fixture = fixture().await;

        let mut subscribe =
            test_utils::request_on(SipMethod::Unknown, "z9hG4bKsub1", "sub-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut subscribe).await.unwrap();

        assert_eq!(final_codes(&fixture.upstream), vec![405]);
        let response = fixture.upstream.last_response().unwrap();
        assert!(response.headers.iter().any(|h| matches!(h, Header::Allow(_))));
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn test_branch_timeout_concludes_the_context() {
        let fixture = fixture().await;
        register_bob(&fixture, &[5062, 5064]);

        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKcaller1", "slow-call", fixture.upstream.clone());
        fixture.endpoint.process_request(&mut invite).await.unwrap();
        let forks = fixture.downstream.sent_requests();

        let mut busy = branch_response(&forks[0], StatusCode::BusyHere);
        fixture.endpoint.process_response(&mut busy).await.unwrap();
        assert_eq!(final_codes(&fixture.upstream), Vec::<u16>::new());

        // The second branch never answers; Timer B gives it up.
        time::sleep(Duration::from_secs(33)).await;
        time::sleep(Duration::from_millis(10)).await;

        assert_eq!(final_codes(&fixture.upstream), vec![486]);
    }

    #[test_log::test(tokio::test)]
    async fn test_stray_response_is_routed_by_via() {
        let fixture = fixture().await;

        // A response whose top Via is ours but matches no transaction:
        // the next Via decides where it goes.
        let mut headers = crate::headers::Headers::with_capacity(5);
        headers.push(Header::Via(
            Via::parse("SIP/2.0/UDP proxy.example.com:5060;branch=z9hG4bKgone").unwrap(),
        ));
        headers.push(Header::Via(
            Via::parse("SIP/2.0/UDP 127.0.0.1:5080;branch=z9hG4bKorigin").unwrap(),
        ));
        headers.push(Header::From(FromHdr::parse("<sip:alice@example.com>;tag=1").unwrap()));
        headers.push(Header::To(To::parse("<sip:bob@example.com>;tag=2").unwrap()));
        headers.push(Header::CallId(CallId::new("stray-response")));
        headers.push(Header::CSeq(CSeq::new(9, SipMethod::Invite)));

        let request_headers = RequestHeaders::extract(&headers).unwrap();
        let transport = MockTransport::new_udp();
        let addr = transport.addr();
        let mut response = IncomingResponse {
            response: Response {
                status_line: crate::message::StatusLine::new(StatusCode::Ringing, "Ringing"),
                headers,
                body: None,
            },
            request_headers,
            transport: Arc::new(transport),
            packet: Packet {
                payload: Payload::new(bytes::Bytes::new()),
                addr,
                time: SystemTime::now(),
            },
            transaction: None,
        };

        fixture.endpoint.process_response(&mut response).await.unwrap();

        // Sent onward through the registered transport, minus our Via.
        let routed = fixture.downstream.last_response().unwrap();
        assert_eq!(routed.headers.vias().count(), 1);
        assert_eq!(routed.headers.via().unwrap().branch(), Some("z9hG4bKorigin"));
    }

    #[test_log::test(tokio::test)]
    async fn test_stray_response_follows_received_and_rport() {
        let fixture = fixture().await;

        // The next Via carries the source this server stamped on the
        // way in; routing must prefer it over the sent-by authority.
        let mut headers = crate::headers::Headers::with_capacity(6);
        headers.push(Header::Via(
            Via::parse("SIP/2.0/UDP proxy.example.com:5060;branch=z9hG4bKgone2").unwrap(),
        ));
        headers.push(Header::Via(
            Via::parse("SIP/2.0/UDP client.example.com;rport=40312;received=192.0.2.50;branch=z9hG4bKorigin2")
                .unwrap(),
        ));
        headers.push(Header::From(FromHdr::parse("<sip:alice@example.com>;tag=1").unwrap()));
        headers.push(Header::To(To::parse("<sip:bob@example.com>;tag=2").unwrap()));
        headers.push(Header::CallId(CallId::new("stray-response-2")));
        headers.push(Header::CSeq(CSeq::new(9, SipMethod::Invite)));

        let request_headers = RequestHeaders::extract(&headers).unwrap();
        let transport = MockTransport::new_udp();
        let addr = transport.addr();
        let mut response = IncomingResponse {
            response: Response {
                status_line: crate::message::StatusLine::new(StatusCode::Ok, "OK"),
                headers,
                body: None,
            },
            request_headers,
            transport: Arc::new(transport),
            packet: Packet {
                payload: Payload::new(bytes::Bytes::new()),
                addr,
                time: SystemTime::now(),
            },
            transaction: None,
        };

        fixture.endpoint.process_response(&mut response).await.unwrap();

        assert_eq!(fixture.downstream.last_addr(), Some("192.0.2.50:40312".parse().unwrap()));
    }

    #[test_log::test(tokio::test)]
    async fn test_session_timer_policy_rejects_plain_invites() {
        let registrar = Arc::new(MemoryRegistrar::new());
        let settings = ProxySettings {
            host: "proxy.example.com".to_string(),
            require_session_timer: true,
            ..Default::default()
        };
        let proxy = ProxyService::new(registrar.clone(), settings);
        let endpoint = Endpoint::builder().with_service(proxy).build().await.unwrap();

        let upstream = MockTransport::new_udp();
        let mut invite = test_utils::request_on(SipMethod::Invite, "z9hG4bKtimer1", "timer-call", upstream.clone());
        endpoint.process_request(&mut invite).await.unwrap();

        assert_eq!(final_codes(&upstream), vec![421]);
        let response = upstream.last_response().unwrap();
        let requires_timer = response
            .headers
            .iter()
            .any(|h| matches!(h, Header::Require(require) if require.contains("timer")));
        assert!(requires_timer);
    }
}

#[async_trait::async_trait]
impl SipService for ProxyService {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn on_request(&self, endpoint: &Endpoint, request: &mut IncomingRequest) -> Result<bool> {
        match request.method() {
            SipMethod::Invite => self.0.on_invite(endpoint, request).await?,
            SipMethod::Cancel => self.0.on_cancel(endpoint, request).await?,
            SipMethod::Ack => self.0.on_ack(endpoint, request).await?,
            SipMethod::Bye | SipMethod::Info => self.0.forward_straight(endpoint, request).await?,
            SipMethod::Options => {
                if self.0.is_local_uri(request.request.uri()) {
                    self.0.answer_options(endpoint, request).await?;
                } else {
                    self.0.forward_straight(endpoint, request).await?;
                }
            }
            // REGISTER belongs to the registrar service; everything else
            // is not supported.
            SipMethod::Register | SipMethod::Unknown => {
                self.0.method_not_allowed(endpoint, request).await?;
            }
        }

        Ok(true)
    }

    async fn on_response(&self, endpoint: &Endpoint, response: &mut IncomingResponse) -> Result<bool> {
        let Some(branch) = response.request_headers.via.branch().map(str::to_string) else {
            return Ok(false);
        };

        match self.0.find_owner(&branch) {
            Some(BranchOwner::Forked(key)) => {
                if response.request_headers.cseq.method() == SipMethod::Cancel {
                    // The 200 to a CANCEL ends at this proxy.
                    return Ok(true);
                }
                if let Some(context) = self.0.find_context(&key) {
                    self.0
                        .handle_forked_response(endpoint, &context, &branch, response)
                        .await?;
                }
                Ok(true)
            }
            Some(BranchOwner::Straight(server_tsx)) => {
                self.0.handle_straight_response(&server_tsx, &branch, response).await?;
                Ok(true)
            }
            None => self.0.route_by_via(endpoint, response).await,
        }
    }
}
