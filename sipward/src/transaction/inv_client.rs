use std::cmp;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, Either};
use tokio::pin;
use tokio::time;

use crate::error::Result;
use crate::headers::{CSeq, Header, Headers};
use crate::message::{Request, RequestLine, SipMethod};
use crate::transaction::key::TransactionKey;
use crate::transaction::{ClientTsx, Role, State, Transaction, TransactionInner, TransactionLayer};
use crate::transport::{IncomingResponse, OutgoingRequest, RequestHeaders};

const TIMER_D: Duration = Duration::from_secs(32);

/// Represents a Client INVITE transaction.
#[derive(Clone)]
pub struct InvClientTransaction {
    transaction: TransactionInner,
    /// The request as sent, kept for ACK generation.
    request: Arc<Request>,
}

impl InvClientTransaction {
    /// Sends the INVITE and enters the Calling state.
    ///
    /// Timer A drives request retransmission on unreliable transports;
    /// Timer B terminates the transaction on timeout.
    pub async fn send(mut request: OutgoingRequest, layer: &TransactionLayer) -> Result<InvClientTransaction> {
        let method = request.msg.method();

        assert!(
            matches!(method, SipMethod::Invite),
            "Invalid method for client INVITE transaction: expected INVITE, got: {}",
            method
        );

        let headers = RequestHeaders::extract(&request.msg.headers)?;
        let key = TransactionKey::exact(&headers);

        let transaction = TransactionInner::new_tsx(
            Role::Uac,
            key,
            layer,
            request.transport.clone(),
            request.addr,
            State::Calling,
        );
        transaction.tsx_send_request(&mut request).await?;

        let uac_inv = InvClientTransaction {
            transaction,
            request: Arc::new(request.msg),
        };

        layer.add_client_tsx(ClientTsx::Invite(uac_inv.clone()));

        tokio::spawn(uac_inv.clone().tsx_retrans_task());

        Ok(uac_inv)
    }

    async fn tsx_retrans_task(self) -> Result<()> {
        let timers = self.timers();

        pin! {
            let timer_b = time::sleep(timers.timeout());
            let timer_a = if !self.reliable() {
                Either::Left(time::sleep(timers.t1))
            } else {
                Either::Right(future::pending::<()>())
            };
        }

        'retrans: loop {
            tokio::select! {
                _ = &mut timer_a, if self.is_calling() => {
                    match self.retransmit().await {
                        Ok(retrans) => {
                            let retrans = timers.t1 * (1 << retrans);
                            let interval = cmp::min(retrans, timers.t2);
                            let sleep = time::sleep(interval);
                            timer_a.set(Either::Left(sleep));
                        },
                        Err(err) => {
                            tracing::info!("Failed to retransmit: {}", err);
                        },
                    }
                }
                _ = &mut timer_b, if self.is_calling() => {
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
            State::Calling if code.is_provisional() => {
                self.transaction.set_last_status_code(code);
                self.change_state_to(State::Proceeding);
            }
            State::Calling | State::Proceeding if matches!(code.code(), 300..=699) => {
                self.transaction.set_last_status_code(code);
                self.change_state_to(State::Completed);
                let mut ack = self.create_ack(response);

                self.tsx_send_request(&mut ack).await?;
                self.terminate();
            }
            State::Calling | State::Proceeding if code.is_final() => {
                // 2xx: the transaction ends at once, the response travels
                // up to the owner.
                self.transaction.set_last_status_code(code);
                self.on_terminated();
            }
            State::Proceeding if code.is_provisional() => {}
            State::Completed => {
                // 17.1.1.2 INVITE Client Transaction
                // Any retransmissions of the final response that are received while in
                // the "Completed" state MUST cause the ACK to be re-passed to the
                // transport layer for retransmission, but the newly received response
                // MUST NOT be passed up to the TU.
                self.retransmit().await?;

                return Ok(true);
            }
            _ => return Ok(true),
        }
        Ok(false)
    }

    /// Builds the ACK for a non-2xx final response, per 17.1.1.3: the To
    /// header comes from the response, everything else from the original
    /// request.
    fn create_ack(&self, response: &IncomingResponse) -> OutgoingRequest {
        let to = response.request_headers.to.clone();
        let request_headers = RequestHeaders::extract(&self.request.headers).expect("Original request was validated");
        let cseq = CSeq {
            method: SipMethod::Ack,
            ..request_headers.cseq
        };

        let mut ack_hdrs = Headers::with_capacity(5);

        ack_hdrs.push(Header::Via(request_headers.via));
        ack_hdrs.push(Header::From(request_headers.from));
        ack_hdrs.push(Header::To(to));
        ack_hdrs.push(Header::CallId(request_headers.call_id));
        ack_hdrs.push(Header::CSeq(cseq));

        OutgoingRequest {
            msg: Request {
                req_line: RequestLine {
                    method: SipMethod::Ack,
                    uri: self.request.req_line.uri.clone(),
                },
                headers: ack_hdrs,
                body: None,
            },
            addr: self.addr(),
            buf: None,
            transport: self.transport().clone(),
        }
    }

    pub(crate) fn set_termination_listener(&self, tx: crate::transaction::TerminationTx) {
        self.transaction.set_termination_listener(tx);
    }
}

#[async_trait::async_trait]
impl Transaction for InvClientTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Start timer D
            self.schedule_termination(TIMER_D);
        }
    }
}

impl Deref for InvClientTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
