use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{Request, Response, SipUri};
use crate::transaction::{InvClientTransaction, InvServerTransaction};

/// Identifies one forking INVITE: `(call-id, cseq-number)`, the method
/// being INVITE by construction.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ProxyContextKey {
    pub call_id: String,
    pub cseq: u32,
}

/// The lifecycle of one forked branch, as seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// One forked client transaction and its progress.
pub struct ClientBranch {
    /// The Via branch value this fork was sent under.
    pub branch: String,
    /// The contact URI the fork targets.
    pub target: SipUri,
    /// The request as forked, kept for CANCEL construction.
    pub request: Request,
    /// The client transaction carrying the fork.
    pub tsx: InvClientTransaction,
    pub state: BranchState,
    pub last_response: Option<Response>,
    /// A CANCEL was already issued for this branch.
    pub cancelled: bool,
}

/// What a CANCEL for one branch is built from.
pub struct CancelTarget {
    pub branch: String,
    /// The forked request, its Via on top.
    pub request: Request,
    /// The INVITE client transaction, for the destination address.
    pub tsx: InvClientTransaction,
}

struct BestResponse {
    /// Status code of the best response so far; 600 until one arrives.
    code: u16,
    response: Option<Response>,
}

/// Aggregation state for one forking INVITE.
pub struct ProxyContext {
    key: ProxyContextKey,
    /// The incoming request as received, before per-branch edits.
    original: Request,
    /// The upstream server transaction the final response goes to.
    server_tsx: InvServerTransaction,
    branches: Mutex<HashMap<String, ClientBranch>>,
    best: Mutex<BestResponse>,
    final_sent: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl ProxyContext {
    pub fn new(key: ProxyContextKey, original: Request, server_tsx: InvServerTransaction) -> Self {
        Self {
            key,
            original,
            server_tsx,
            branches: Mutex::new(HashMap::new()),
            best: Mutex::new(BestResponse {
                code: 600,
                response: None,
            }),
            final_sent: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn key(&self) -> &ProxyContextKey {
        &self.key
    }

    pub fn original(&self) -> &Request {
        &self.original
    }

    pub fn server_tsx(&self) -> &InvServerTransaction {
        &self.server_tsx
    }

    pub fn add_branch(&self, branch: ClientBranch) {
        let mut branches = self.branches.lock().expect("Lock failed");
        branches.insert(branch.branch.clone(), branch);
    }

    /// Records activity, postponing context expiry.
    pub fn touch(&self) {
        let mut last = self.last_activity.lock().expect("Lock failed");
        *last = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.lock().expect("Lock failed");
        last.elapsed()
    }

    /// Latches the final-response flag. Returns `true` for the caller
    /// that won the latch; every later caller gets `false`.
    pub fn latch_final(&self) -> bool {
        !self.final_sent.swap(true, Ordering::SeqCst)
    }

    pub fn final_sent(&self) -> bool {
        self.final_sent.load(Ordering::SeqCst)
    }

    /// Applies a branch state transition, returning the previous state.
    /// Unknown branches return `None`.
    pub fn mark_branch(&self, branch: &str, state: BranchState, response: Option<&Response>) -> Option<BranchState> {
        let mut branches = self.branches.lock().expect("Lock failed");
        let entry = branches.get_mut(branch)?;

        let previous = entry.state;
        // A terminated notification must not regress a completed branch.
        if !(previous == BranchState::Completed && state == BranchState::Terminated) {
            entry.state = state;
        }
        if let Some(response) = response {
            entry.last_response = Some(response.clone());
        }

        Some(previous)
    }

    /// Returns `true` once every branch is Completed or Terminated.
    pub fn all_branches_done(&self) -> bool {
        let branches = self.branches.lock().expect("Lock failed");
        branches
            .values()
            .all(|b| matches!(b.state, BranchState::Completed | BranchState::Terminated))
    }

    /// Offers a 3xx-6xx response to the best-response lattice.
    pub fn offer_best(&self, response: &Response) {
        let code = response.code().code();
        let mut best = self.best.lock().expect("Lock failed");

        if best.response.is_none() || better(code, best.code) {
            best.code = code;
            best.response = Some(response.clone());
        }
    }

    /// Takes the best response accumulated so far, or a 600 synthesized
    /// from nothing when no branch ever produced a final response.
    pub fn best_response(&self) -> Option<Response> {
        let best = self.best.lock().expect("Lock failed");
        best.response.clone()
    }

    /// The target URI of the branch that answered 2xx, for ACK routing.
    pub fn two_hundred_target(&self) -> Option<(SipUri, String)> {
        let branches = self.branches.lock().expect("Lock failed");
        branches
            .values()
            .find(|b| {
                b.last_response
                    .as_ref()
                    .is_some_and(|r| r.code().class() == 2)
            })
            .map(|b| (b.target.clone(), b.branch.clone()))
    }

    /// Returns `true` when some branch saw a non-2xx final response, so
    /// an upstream ACK is already handled by the client transaction.
    pub fn has_failed_branch(&self) -> bool {
        let branches = self.branches.lock().expect("Lock failed");
        branches.values().any(|b| {
            b.last_response
                .as_ref()
                .is_some_and(|r| matches!(r.code().code(), 300..=699))
        })
    }

    /// Marks every branch still early as cancelled and returns what a
    /// CANCEL for each must be built from.
    pub fn branches_to_cancel(&self) -> Vec<CancelTarget> {
        let mut branches = self.branches.lock().expect("Lock failed");
        branches
            .values_mut()
            .filter(|b| matches!(b.state, BranchState::Trying | BranchState::Proceeding) && !b.cancelled)
            .map(|b| {
                b.cancelled = true;
                CancelTarget {
                    branch: b.branch.clone(),
                    request: b.request.clone(),
                    tsx: b.tsx.clone(),
                }
            })
            .collect()
    }

    /// Every branch value this context owns; used for index cleanup.
    pub fn branch_values(&self) -> Vec<String> {
        let branches = self.branches.lock().expect("Lock failed");
        branches.keys().cloned().collect()
    }
}

fn class_rank(class: u16) -> u8 {
    // Preference order among final classes: 2xx best, then 3xx, 4xx,
    // 5xx, 6xx.
    match class {
        2 => 0,
        3 => 1,
        4 => 2,
        5 => 3,
        6 => 4,
        _ => 5,
    }
}

/// Returns `true` when `new` displaces `current` under the class/code
/// ordering: a strictly better class, or the same class with a strictly
/// lower code.
pub(crate) fn better(new: u16, current: u16) -> bool {
    let new_rank = class_rank(new / 100);
    let current_rank = class_rank(current / 100);

    new_rank < current_rank || (new_rank == current_rank && new < current)
}
