//! Correlation of outbound requests with inbound responses.
//!
//! Every pending request lives in one table. Removing the entry is the only
//! way to complete it, so whichever of response, timeout, cancellation or
//! connection loss removes it first wins and the others find nothing.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use jid::{BareJid, Jid};
use tokio::{task::AbortHandle, time::Instant};
use tracing::{debug, warn};

use crate::{
    conditions::classify_stanza_error,
    error::{ConnectionError, RequestError},
    stanza::{IqType, Stanza},
};

pub type Completion = Box<dyn FnOnce(Result<Stanza, RequestError>) + Send>;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct PendingRequest {
    completion: Completion,
    /// Where the request was sent; only that address may answer it.
    to: Option<Jid>,
    timeout: Duration,
    deadline: Instant,
    timer: Option<AbortHandle>,
}

/// What happened to an inbound stanza handed to the router.
#[derive(Debug)]
pub enum Inbound {
    /// A response completed the request with this id.
    Completed(String),
    /// A response whose request is gone (completed, timed out or unknown),
    /// or that came from someone the request was not sent to.
    Dropped(String),
    /// Not a response; belongs to the subscriber.
    Unsolicited(Stanza),
}

pub struct Router {
    /// The account the connection authenticates as.
    account: BareJid,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl Router {
    pub fn new(account: BareJid) -> Arc<Self> {
        Arc::new(Self {
            account,
            pending: Mutex::default(),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a pending request and arms its deadline timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn insert(
        self: &Arc<Self>,
        id: String,
        to: Option<Jid>,
        timeout: Duration,
        completion: Completion,
    ) {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        self.table().insert(
            id.clone(),
            PendingRequest {
                completion,
                to,
                timeout,
                deadline,
                timer: None,
            },
        );

        let router: Weak<Router> = Arc::downgrade(self);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(router) = router.upgrade() {
                router.expire(&timer_id);
            }
        })
        .abort_handle();

        let mut table = self.table();
        match table.get_mut(&id) {
            Some(entry) => entry.timer = Some(timer),
            // Completed before the timer could be attached.
            None => timer.abort(),
        }
    }

    /// Removes the entry and runs its completion. Returns `false` if the
    /// request was already completed.
    pub fn complete(&self, id: &str, outcome: Result<Stanza, RequestError>) -> bool {
        let Some(entry) = self.table().remove(id) else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        (entry.completion)(outcome);
        true
    }

    /// Removes an entry without running its completion.
    pub(crate) fn discard(&self, id: &str) {
        if let Some(entry) = self.table().remove(id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    fn expire(&self, id: &str) {
        let timeout = {
            let table = self.table();
            match table.get(id) {
                Some(entry) if entry.deadline <= Instant::now() => entry.timeout,
                _ => return,
            }
        };
        if self.complete(id, Err(RequestError::Timeout(timeout))) {
            debug!(id, ?timeout, "request timed out");
        }
    }

    /// Routes an inbound stanza received while online.
    pub fn handle_inbound(&self, stanza: Stanza) -> Inbound {
        let iq_type = stanza.iq_type();
        if !matches!(iq_type, Some(IqType::Result | IqType::Error)) {
            return Inbound::Unsolicited(stanza);
        }

        let id = stanza.id().unwrap_or_default().to_string();
        let expected = self
            .table()
            .get(&id)
            .map(|entry| self.is_expected_responder(entry.to.as_ref(), stanza.from()));
        if expected == Some(false) {
            warn!(id = %id, from = ?stanza.from(), "ignoring response from unexpected sender");
            return Inbound::Dropped(id);
        }

        let outcome = if iq_type == Some(IqType::Error) {
            Err(RequestError::Protocol(classify_stanza_error(
                &stanza.to_element(),
            )))
        } else {
            Ok(stanza)
        };

        if self.complete(&id, outcome) {
            debug!(id = %id, "request completed");
            Inbound::Completed(id)
        } else {
            warn!(id = %id, "dropping response with no pending request");
            Inbound::Dropped(id)
        }
    }

    /// Whether `from` may answer a request sent to `to`. A missing address
    /// stands for the account itself or its server (RFC 6120), so
    /// those are interchangeable with each other and with no address.
    fn is_expected_responder(&self, to: Option<&Jid>, from: Option<&Jid>) -> bool {
        match (to, from) {
            (Some(to), Some(from)) if to == from => true,
            _ => self.is_implicit(to) && self.is_implicit(from),
        }
    }

    fn is_implicit(&self, address: Option<&Jid>) -> bool {
        let Some(address) = address else {
            return true;
        };
        address.resource().is_none()
            && address.domain() == self.account.domain()
            && (address.node().is_none() || address.node() == self.account.node())
    }

    /// Fails every pending request with the connection's fatal cause.
    pub fn fail_all(&self, cause: &Arc<ConnectionError>) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.table().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
            debug!(id = %id, "failing request on connection loss");
            (entry.completion)(Err(RequestError::ConnectionLost(Arc::clone(cause))));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }
}
