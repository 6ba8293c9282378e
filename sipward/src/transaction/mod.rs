//! SIP Transaction Layer.
//!
//! Implements the four RFC3261 transaction state machines, their timers
//! and the index incoming messages are matched against.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::StatusCode;
use crate::transport::{IncomingRequest, IncomingResponse, OutgoingRequest, OutgoingResponse, ToBytes, Transport};

pub(crate) mod client;
pub(crate) mod inv_client;
pub(crate) mod inv_server;
pub(crate) mod key;
pub(crate) mod server;

pub use client::ClientTransaction;
pub use inv_client::InvClientTransaction;
pub use inv_server::InvServerTransaction;
pub use key::{TransactionKey, generate_branch};
pub use server::ServerTransaction;

type LastMsg = tokio::sync::RwLock<Option<Bytes>>;
type LastStatusCode = RwLock<Option<StatusCode>>;

/// Notifies an owner that a transaction reached Terminated.
pub type TerminationTx = mpsc::UnboundedSender<TransactionKey>;

/// The RFC3261 base timer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    /// Estimated round-trip time, the retransmission baseline.
    pub t1: Duration,
    /// Maximum retransmission interval.
    pub t2: Duration,
    /// Maximum time a message may stay in the network.
    pub t4: Duration,
}

impl TimerSettings {
    pub const T1: Duration = Duration::from_millis(500);
    pub const T2: Duration = Duration::from_secs(4);
    pub const T4: Duration = Duration::from_secs(5);

    /// The transaction timeout used by Timers B, F and H.
    pub fn timeout(&self) -> Duration {
        self.t1 * 64
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            t1: Self::T1,
            t2: Self::T2,
            t4: Self::T4,
        }
    }
}

/// A trait for managing the behavior of a SIP transaction.
#[async_trait::async_trait]
pub trait Transaction: Sync + Send + 'static {
    /// Estimated round-trip time (RTT) for message exchanges.
    const T1: Duration = TimerSettings::T1;

    /// Maximum retransmission interval for non-INVITE requests and INVITE
    /// responses.
    const T2: Duration = TimerSettings::T2;

    /// Maximum duration that a message may remain in the network before
    /// being discarded.
    const T4: Duration = TimerSettings::T4;

    /// Terminate the SIP Transaction.
    fn terminate(&self);
}

/// The possible roles of a SIP Transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The entity that initiates the request.
    Uac,
    /// The entity that responds to the request.
    Uas,
}

/// Defines the possible states of a SIP Transaction.
///
/// Transitions are monotonic toward [`State::Terminated`]; no transition
/// ever leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    /// Initial state.
    #[default]
    Initial,
    /// Calling state.
    Calling,
    /// Trying state.
    Trying,
    /// Proceeding state.
    Proceeding,
    /// Completed state.
    Completed,
    /// Confirmed state.
    Confirmed,
    /// Terminated state.
    Terminated,
}

struct Inner {
    /// The role of the transaction (UAC or UAS).
    role: Role,
    /// The key used to identify the transaction.
    key: TransactionKey,
    /// The layer that indexes this transaction.
    layer: TransactionLayer,
    /// The transport used for communication.
    transport: Arc<dyn Transport>,
    /// The address of the remote endpoint.
    addr: SocketAddr,
    /// The current state of the transaction.
    state: Mutex<State>,
    /// The last status code sent or received in the transaction.
    status_code: LastStatusCode,
    /// The retransmission count for the transaction.
    retransmit_count: AtomicUsize,
    /// The last message sent in the transaction.
    last_msg: LastMsg,
    /// Notified when the transaction terminates.
    termination_tx: Mutex<Option<TerminationTx>>,
}

/// The state shared by every SIP transaction kind.
#[derive(Clone)]
pub struct TransactionInner(Arc<Inner>);

impl TransactionInner {
    pub(crate) fn new_tsx(
        role: Role,
        key: TransactionKey,
        layer: &TransactionLayer,
        transport: Arc<dyn Transport>,
        addr: SocketAddr,
        state: State,
    ) -> Self {
        let tsx = TransactionInner(Arc::new(Inner {
            role,
            key,
            layer: layer.clone(),
            transport,
            addr,
            state: Mutex::new(state),
            status_code: Default::default(),
            retransmit_count: Default::default(),
            last_msg: Default::default(),
            termination_tx: Default::default(),
        }));

        tracing::trace!("Transaction Created [{:?}] ({:p})", tsx.0.role, tsx.0);

        tsx
    }

    pub(crate) fn key(&self) -> &TransactionKey {
        &self.0.key
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.0.transport
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.0.addr
    }

    pub(crate) fn timers(&self) -> TimerSettings {
        self.0.layer.timers()
    }

    /// Checks if the transport is reliable.
    #[inline]
    pub fn reliable(&self) -> bool {
        self.0.transport.reliable()
    }

    /// Retrieves the current state of the Transaction.
    #[inline]
    pub fn get_state(&self) -> State {
        *self.0.state.lock().expect("Lock failed")
    }

    /// Gets the count of retransmissions.
    #[inline]
    pub fn retrans_count(&self) -> u32 {
        self.0.retransmit_count.load(Ordering::SeqCst) as u32
    }

    #[inline]
    pub(crate) fn add_retrans_count(&self) -> u32 {
        self.0.retransmit_count.fetch_add(1, Ordering::SeqCst) as u32 + 1
    }

    /// Retrieves the last status code sent or received.
    #[inline]
    pub fn last_status_code(&self) -> Option<StatusCode> {
        *self.0.status_code.read().expect("Lock failed")
    }

    /// Registers a channel notified with this transaction's key when it
    /// terminates.
    pub fn set_termination_listener(&self, tx: TerminationTx) {
        let mut guard = self.0.termination_tx.lock().expect("Lock failed");
        *guard = Some(tx);
    }

    pub(crate) fn is_calling(&self) -> bool {
        self.get_state() == State::Calling
    }

    pub(crate) fn change_state_to(&self, state: State) {
        let old = {
            let mut guard = self.0.state.lock().expect("Lock failed");
            // Terminated is final.
            if *guard == State::Terminated {
                return;
            }
            mem::replace(&mut *guard, state)
        };
        tracing::trace!("State Changed [{old:?} -> {state:?}] ({:p})", self.0);
    }

    pub(crate) fn on_terminated(&self) {
        self.change_state_to(State::Terminated);

        match self.0.role {
            Role::Uac => {
                self.0.layer.remove_client_tsx(&self.0.key);
            }
            Role::Uas => {
                self.0.layer.remove_server_tsx(&self.0.key);
            }
        };

        let listener = self.0.termination_tx.lock().expect("Lock failed").take();
        if let Some(listener) = listener {
            let _ = listener.send(self.0.key.clone());
        }
    }

    pub(crate) fn schedule_termination(&self, time: Duration) {
        let tsx = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(time).await;
            tsx.on_terminated();
        });
    }

    #[inline]
    fn set_last_status_code(&self, code: StatusCode) {
        let mut guard = self.0.status_code.write().expect("Lock failed");
        *guard = Some(code);
    }

    pub(crate) async fn set_last_msg(&self, msg: Bytes) {
        let mut guard = self.0.last_msg.write().await;
        *guard = Some(msg);
    }

    pub(crate) async fn retransmit(&self) -> Result<u32> {
        let retransmitted = {
            let lock = self.0.last_msg.read().await;
            if let Some(msg) = lock.as_ref() {
                self.0.transport.send(msg, &self.0.addr).await?;
                true
            } else {
                false
            }
        };

        if retransmitted {
            Ok(self.add_retrans_count())
        } else {
            Err(crate::error::Error::Io(io::Error::other("No message to retransmit")))
        }
    }

    pub(crate) async fn tsx_send_request(&self, msg: &mut OutgoingRequest) -> Result<()> {
        tracing::debug!("<= Request {} to /{}", msg.msg.req_line.method, msg.addr);
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };
        self.0.transport.send(&buf, &self.0.addr).await?;
        self.set_last_msg(buf).await;
        Ok(())
    }

    pub(crate) async fn tsx_send_response(&self, msg: &mut OutgoingResponse) -> Result<()> {
        let code = msg.status_code();
        tracing::debug!("=> Response {} {}", code, msg.reason());
        let buf = match msg.buf.take() {
            Some(buf) => buf,
            None => msg.to_bytes()?,
        };

        self.0.transport.send(&buf, &self.0.addr).await?;
        self.set_last_status_code(code);
        self.set_last_msg(buf).await;
        Ok(())
    }
}

/// A Server Transaction, either Invite or NonInvite.
#[derive(Clone, Debug)]
pub enum ServerTsx {
    /// A NonInvite Server Transaction.
    NonInvite(ServerTransaction),
    /// An Invite Server Transaction.
    Invite(InvServerTransaction),
}

impl ServerTsx {
    /// Retrieves the last status code sent by the transaction.
    pub fn last_status_code(&self) -> Option<StatusCode> {
        match self {
            ServerTsx::NonInvite(uas) => uas.last_status_code(),
            ServerTsx::Invite(uas_inv) => uas_inv.last_status_code(),
        }
    }

    pub(crate) fn key(&self) -> &TransactionKey {
        match self {
            ServerTsx::NonInvite(uas) => uas.key(),
            ServerTsx::Invite(uas_inv) => uas_inv.key(),
        }
    }

    /// Handles a retransmission of the bound request, or the ACK closing
    /// an INVITE transaction.
    pub(crate) async fn receive_request(&self, request: &IncomingRequest) -> Result<()> {
        match self {
            ServerTsx::NonInvite(uas) => {
                if matches!(uas.get_state(), State::Proceeding | State::Completed) {
                    uas.retransmit().await?;
                }
                Ok(())
            }
            ServerTsx::Invite(uas_inv) => {
                match uas_inv.get_state() {
                    State::Completed if request.method().is_ack() => {
                        uas_inv.on_ack();
                    }
                    State::Proceeding | State::Completed if request.method().is_invite() => {
                        uas_inv.retransmit().await?;
                    }
                    _ => (),
                }
                Ok(())
            }
        }
    }
}

impl From<ServerTransaction> for ServerTsx {
    fn from(tsx: ServerTransaction) -> Self {
        ServerTsx::NonInvite(tsx)
    }
}

impl From<InvServerTransaction> for ServerTsx {
    fn from(tsx: InvServerTransaction) -> Self {
        ServerTsx::Invite(tsx)
    }
}

/// A Client Transaction, either Invite or NonInvite.
#[derive(Clone)]
pub enum ClientTsx {
    /// A NonInvite Client Transaction.
    NonInvite(ClientTransaction),
    /// An Invite Client Transaction.
    Invite(InvClientTransaction),
}

impl ClientTsx {
    pub(crate) fn key(&self) -> &TransactionKey {
        match self {
            ClientTsx::NonInvite(uac) => uac.key(),
            ClientTsx::Invite(uac_inv) => uac_inv.key(),
        }
    }

    /// Registers a termination listener on the underlying transaction.
    pub fn set_termination_listener(&self, tx: TerminationTx) {
        match self {
            ClientTsx::NonInvite(uac) => uac.set_termination_listener(tx),
            ClientTsx::Invite(uac_inv) => uac_inv.set_termination_listener(tx),
        }
    }
}

struct LayerInner {
    client_transactions: RwLock<HashMap<TransactionKey, ClientTsx>>,
    server_transactions: RwLock<HashMap<TransactionKey, ServerTsx>>,
    timers: TimerSettings,
}

/// Represents the transaction layer of the SIP protocol.
///
/// This type holds all server and client transactions and matches
/// incoming messages against them.
#[derive(Clone)]
pub struct TransactionLayer(Arc<LayerInner>);

impl TransactionLayer {
    pub fn new(timers: TimerSettings) -> Self {
        Self(Arc::new(LayerInner {
            client_transactions: RwLock::new(HashMap::new()),
            server_transactions: RwLock::new(HashMap::new()),
            timers,
        }))
    }

    pub(crate) fn timers(&self) -> TimerSettings {
        self.0.timers
    }

    /// Remove a server transaction from the collection.
    #[inline]
    pub fn remove_server_tsx(&self, key: &TransactionKey) -> Option<ServerTsx> {
        let mut map = self.0.server_transactions.write().expect("Lock failed");
        map.remove(key)
    }

    /// Remove a client transaction from the collection.
    #[inline]
    pub fn remove_client_tsx(&self, key: &TransactionKey) -> Option<ClientTsx> {
        let mut map = self.0.client_transactions.write().expect("Lock failed");
        map.remove(key)
    }

    #[inline]
    pub(crate) fn add_server_tsx(&self, tsx: ServerTsx) {
        let key = tsx.key().clone();
        let mut map = self.0.server_transactions.write().expect("Lock failed");

        map.insert(key, tsx);
    }

    #[inline]
    pub(crate) fn add_client_tsx(&self, tsx: ClientTsx) {
        let key = tsx.key().clone();
        let mut map = self.0.client_transactions.write().expect("Lock failed");

        map.insert(key, tsx);
    }

    pub(crate) fn find_server_tsx(&self, key: &TransactionKey) -> Option<ServerTsx> {
        self.0
            .server_transactions
            .read()
            .expect("Lock failed")
            .get(key)
            .cloned()
    }

    pub(crate) fn find_client_tsx(&self, key: &TransactionKey) -> Option<ClientTsx> {
        self.0
            .client_transactions
            .read()
            .expect("Lock failed")
            .get(key)
            .cloned()
    }

    /// Matches a response against the client transaction index.
    ///
    /// Returns `true` when the transaction consumed the response
    /// entirely. Otherwise the matched transaction, if any, is attached
    /// to the response for the upper layers.
    pub(crate) async fn handle_response(&self, response: &mut IncomingResponse) -> Result<bool> {
        let Some(branch) = response.request_headers.via.branch() else {
            return Ok(false);
        };
        let key = TransactionKey::client(
            branch,
            response.request_headers.cseq.method(),
            response.request_headers.call_id.as_str(),
        );

        let Some(client_tsx) = self.find_client_tsx(&key) else {
            return Ok(false);
        };

        let consumed = match &client_tsx {
            ClientTsx::NonInvite(tsx) => tsx.receive(response).await?,
            ClientTsx::Invite(tsx_inv) => tsx_inv.receive(response).await?,
        };

        if consumed {
            return Ok(true);
        }

        response.transaction = Some(client_tsx);
        Ok(false)
    }

    /// Matches a request against the server transaction index, absorbing
    /// retransmissions and the ACK for a non-2xx final response.
    ///
    /// Returns `true` when the request was consumed.
    pub(crate) async fn handle_request(&self, request: &mut IncomingRequest) -> Result<bool> {
        let exact = TransactionKey::exact(&request.request_headers);
        if let Some(server_tsx) = self.find_server_tsx(&exact) {
            server_tsx.receive_request(request).await?;
            return Ok(true);
        }

        // An ACK matches the INVITE transaction it closes; CANCEL must
        // reach the upper layers even when its INVITE is known.
        if request.method().is_ack() {
            let normalized = TransactionKey::normalized(&request.request_headers);
            if let Some(server_tsx) = self.find_server_tsx(&normalized) {
                server_tsx.receive_request(request).await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    #[cfg(test)]
    pub(crate) fn client_tsx_count(&self) -> usize {
        self.0.client_transactions.read().expect("Lock failed").len()
    }

    #[cfg(test)]
    pub(crate) fn server_tsx_count(&self) -> usize {
        self.0.server_transactions.read().expect("Lock failed").len()
    }
}

impl Default for TransactionLayer {
    fn default() -> Self {
        Self::new(TimerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SipMethod;
    use crate::test_utils;

    #[tokio::test]
    async fn test_non_invite_server_tsx_is_indexed_and_removed() {
        let layer = TransactionLayer::default();
        let mut request = test_utils::request(SipMethod::Register);

        let tsx = ServerTransaction::new(&layer, &mut request);
        assert_eq!(layer.server_tsx_count(), 1);

        let key = tsx.key().clone();
        assert!(layer.find_server_tsx(&key).is_some());

        tsx.on_terminated();
        assert!(layer.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_invite_server_tsx_is_indexed_and_removed() {
        let layer = TransactionLayer::default();
        let mut request = test_utils::request(SipMethod::Invite);

        let tsx = InvServerTransaction::new(&layer, &mut request);
        let key = tsx.key().clone();

        assert_matches!(layer.find_server_tsx(&key), Some(ServerTsx::Invite(_)));

        tsx.on_terminated();
        assert!(layer.find_server_tsx(&key).is_none());
    }

    #[tokio::test]
    async fn test_request_retransmission_is_consumed() {
        let layer = TransactionLayer::default();
        let transport = test_utils::MockTransport::new_udp();
        let mut request =
            test_utils::request_on(SipMethod::Register, test_utils::TEST_BRANCH, test_utils::TEST_CALL_ID, transport.clone());
        let tsx = ServerTransaction::new(&layer, &mut request);

        let response = &mut test_utils::outgoing_response(StatusCode::Ok);
        tsx.respond(response).await.unwrap();

        let mut retransmission = test_utils::request(SipMethod::Register);
        let consumed = layer.handle_request(&mut retransmission).await.unwrap();

        assert!(consumed);
        assert_eq!(tsx.retrans_count(), 1);

        // The retransmitted response is byte-identical to the original.
        let sent: Vec<_> = transport.sent_msgs();
        assert_eq!(sent.len(), 2);
        let mut buffers = transport.sent_buffers();
        let last = buffers.pop().unwrap();
        let first = buffers.pop().unwrap();
        assert_eq!(first, last);
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_consumed() {
        let layer = TransactionLayer::default();
        let mut request = test_utils::request(SipMethod::Invite);

        assert!(!layer.handle_request(&mut request).await.unwrap());
    }
}
