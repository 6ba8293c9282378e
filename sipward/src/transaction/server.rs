use std::fmt;
use std::ops::Deref;

use crate::message::SipMethod;
use crate::transaction::key::TransactionKey;
use crate::transaction::{Role, ServerTsx, State, Transaction, TransactionInner, TransactionLayer};
use crate::transport::{IncomingRequest, OutgoingResponse};
use crate::error::Result;

/// Represents a Server non-INVITE transaction.
#[derive(Clone)]
pub struct ServerTransaction {
    transaction: TransactionInner,
}

impl fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("key", self.transaction.key())
            .field("state", &self.transaction.get_state())
            .finish()
    }
}

impl ServerTransaction {
    /// Creates the transaction in the Trying state and indexes it.
    pub fn new(layer: &TransactionLayer, request: &mut IncomingRequest) -> Self {
        assert!(
            !matches!(
                request.method(),
                SipMethod::Ack | SipMethod::Invite
            ),
            "Request method cannot be Ack or Invite",
        );

        let key = TransactionKey::exact(&request.request_headers);
        let transaction = TransactionInner::new_tsx(
            Role::Uas,
            key,
            layer,
            request.transport.clone(),
            request.packet.addr,
            State::Trying,
        );

        let uas = ServerTransaction { transaction };

        layer.add_server_tsx(ServerTsx::NonInvite(uas.clone()));
        request.transaction = Some(ServerTsx::NonInvite(uas.clone()));

        uas
    }

    /// Sends a response through the transaction.
    ///
    /// A provisional response moves Trying to Proceeding; a final
    /// response completes the transaction and arms Timer J.
    pub async fn respond(&self, response: &mut OutgoingResponse) -> Result<()> {
        self.tsx_send_response(response).await?;

        match self.get_state() {
            State::Trying if response.is_provisional() => {
                self.change_state_to(State::Proceeding);
            }
            State::Trying | State::Proceeding => {
                self.change_state_to(State::Completed);
                self.terminate();
            }
            _ => (),
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl Transaction for ServerTransaction {
    fn terminate(&self) {
        if self.reliable() {
            self.on_terminated();
        } else {
            // Timer J
            self.schedule_termination(self.timers().t4);
        }
    }
}

impl Deref for ServerTransaction {
    type Target = TransactionInner;

    fn deref(&self) -> &Self::Target {
        &self.transaction
    }
}
