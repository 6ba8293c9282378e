use std::cmp;
use std::ops::Deref;

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::time;

use crate::error::Result;
use crate::message::SipMethod;
use crate::transaction::key::TransactionKey;
use crate::transaction::{ClientTsx, Role, State, Transaction, TransactionInner, TransactionLayer};
use crate::transport::{IncomingResponse, OutgoingRequest};

/// Represents a Client non-INVITE transaction.
#[derive(Clone)]
pub struct ClientTransaction {
    transaction: TransactionInner,
}

impl ClientTransaction {
    /// Sends the request and enters the Trying state.
    ///
    /// Timer E drives request retransmission on unreliable transports;
    /// Timer F terminates the transaction on timeout.
    pub async fn send(mut request: OutgoingRequest, layer: &TransactionLayer) -> Result<ClientTransaction> {
        let method = request.msg.method();

        assert!(
            !matches!(method, SipMethod::Invite | SipMethod::Ack),
            "Invalid method for client non-INVITE transaction: got {}",
            method
        );

        let key = client_key(&request)?;
        let transaction = TransactionInner::new_tsx(
            Role::Uac,
            key,
            layer,
            request.transport.clone(),
            request.addr,
            State::Trying,
        );
        transaction.tsx_send_request(&mut request).await?;

        let uac = ClientTransaction { transaction };

        layer.add_client_tsx(ClientTsx::NonInvite(uac.clone()));

        tokio::spawn(uac.clone().tsx_retrans_task());

        Ok(uac)
    }

    async fn tsx_retrans_task(self) -> Result<()> {
        let timers = self.timers();

        pin! {
            let timer_f = time::sleep(timers.timeout());
            let timer_e = if !self.reliable() {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            let active = matches!(self.get_state(), State::Trying | State::Proceeding);
            tokio::select! {
                _ = &mut timer_e, if active => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            let retrans = timers.t1 * (1 << retrans);
                            let interval = cmp::min(retrans, timers.t2);
                            let sleep = time::sleep(interval);
                            timer_e.set(Either::Left(sleep));
                        },
                        Err(err) => {
                            tracing::info!("Failed to retransmit: {}", err);
                        },
                    }
                }
                _ = &mut timer_f, if active => {
                    // Timeout
                    self.on_terminated();
                    break 'retrans Ok(());
                }
                else => {
                    break 'retrans Ok(());
                }
            }
        }
    }

    /// Processes a response matched to this transaction.
    ///
    /// Returns `true` when the response was consumed by the state machine
    /// and must not reach the upper layers.
    pub(crate) async fn receive(&self, response: &IncomingResponse) -> Result<bool> {
        let code = response.code();

        match self.get_state() {
            State::Trying if code.is_provisional() => {
                self.transaction.set_last_status_code(code);
                self.change_state_to(State::Proceeding);
            }
            State::Trying | State::Proceeding if code.is_final() => {
                self.transaction.set_last_status_code(code);
                self.change_state_to(State::Completed);
                self.terminate();
            }
            State::Proceeding if code.is_provisional() => {}
            _ => {
                // Late or repeated responses stay inside the transaction.
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub(crate) fn set_termination_listener(&self, tx: crate::transaction::TerminationTx) {
        self.transaction.set_termination_listener(tx);
    }
}

fn client_key(request: &OutgoingRequest) -> Result<TransactionKey> {
    let headers = crate::transport::RequestHeaders::extract(&request.msg.headers)?;
    Ok(TransactionKey::exact(&headers))
}

#[async_trait::async_trait]
impl Transaction for ClientTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer K
            self.schedule_termination(self.timers().t4);
        }
    }
}

impl Deref for ClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
