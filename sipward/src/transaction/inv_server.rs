use std::cmp;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::sync::oneshot;
use tokio::time;

use crate::error::Result;
use crate::message::SipMethod;
use crate::transaction::key::TransactionKey;
use crate::transaction::{Role, ServerTsx, State, Transaction, TransactionInner, TransactionLayer};
use crate::transport::{IncomingRequest, OutgoingResponse};

type TxConfirmed = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type RxConfirmed = oneshot::Receiver<()>;

/// Represents a Server INVITE transaction.
#[derive(Clone)]
pub struct InvServerTransaction {
    transaction: TransactionInner,
    tx_confirmed: TxConfirmed,
}

impl fmt::Debug for InvServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvServerTransaction")
            .field("key", self.transaction.key())
            .field("state", &self.transaction.get_state())
            .finish()
    }
}

impl InvServerTransaction {
    /// Creates the transaction in the Proceeding state and indexes it.
    pub fn new(layer: &TransactionLayer, request: &mut IncomingRequest) -> Self {
        let method = request.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Expected SipMethod::Invite for server INVITE transaction, but got: {}",
            method
        );

        let key = TransactionKey::exact(&request.request_headers);
        let transaction = TransactionInner::new_tsx(
            Role::Uas,
            key,
            layer,
            request.transport.clone(),
            request.packet.addr,
            State::Proceeding,
        );
        let tx_confirmed = Default::default();

        let uas_inv = InvServerTransaction {
            transaction,
            tx_confirmed,
        };

        layer.add_server_tsx(ServerTsx::Invite(uas_inv.clone()));
        request.transaction = Some(ServerTsx::Invite(uas_inv.clone()));

        uas_inv
    }

    /// Sends a response through the transaction.
    ///
    /// A 2xx ends the transaction at once; a 3xx-6xx completes it and
    /// starts the Timer G retransmission loop bounded by Timer H.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        self.tsx_send_response(response).await?;

        let code = response.status_code().code();

        match code {
            100..=199 => {}
            200..=299 => {
                self.on_terminated();
            }
            300..=699 => {
                self.change_state_to(State::Completed);

                let (tx, rx) = oneshot::channel();

                self.tx_confirmed.lock().expect("Lock failed").replace(tx);
                self.initiate_retransmission(rx);
            }
            _ => (),
        };

        Ok(())
    }

    /// Handles the ACK closing a Completed transaction: Confirmed, then
    /// Timer I termination.
    pub(crate) fn on_ack(&self) {
        self.change_state_to(State::Confirmed);
        let mut lock = self.tx_confirmed.lock().expect("Lock failed");
        if let Some(sender) = lock.take() {
            let _ = sender.send(());
        }
        drop(lock);
        self.terminate();
    }

    fn initiate_retransmission(&self, mut rx_confirmed: RxConfirmed) {
        let unreliable = !self.reliable();
        let uas = self.clone();
        let timers = self.timers();

        tokio::spawn(async move {
            let timer_h = time::sleep(timers.timeout());
            let timer_g = if unreliable {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };

            pin!(timer_h);
            pin!(timer_g);

            'retrans: loop {
                tokio::select! {
                    _ = &mut timer_g => {
                        match uas.retransmit().await {
                            Ok(retrans) => {
                                let retrans = timers.t1 * (1 << retrans);
                                let interval = cmp::min(retrans, timers.t2);
                                let sleep = time::sleep(interval);
                                timer_g.set(Either::Left(sleep));
                            },
                            Err(err) => {
                                tracing::info!("Failed to retransmit: {}", err);
                            },
                        }
                    },
                    _ = &mut timer_h => {
                        // Timer H expired without an ACK.
                        tracing::debug!("INVITE server transaction timed out waiting for ACK");
                        uas.on_terminated();
                        break 'retrans;
                    }
                    _ = &mut rx_confirmed => {
                        // Got the Confirmed state.
                        break 'retrans;
                    }
                }
            }
        });
    }
}

#[async_trait::async_trait]
impl Transaction for InvServerTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer I
            self.schedule_termination(self.timers().t4);
        }
    }
}

impl Deref for InvServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
