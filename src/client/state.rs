//! State variants of the association lifecycle.
//!
//! Exactly one [`ClientState`] is live at any time, owned by the driver.
//! Each variant owns its local resources: the deadline of its timer, if it
//! arms one, and the active association with its outstanding-response
//! table once negotiation has succeeded. Replacing the state value releases
//! those resources before the next state is entered.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use crate::association::{AbortReason, AbortSource, Association, Rejection};
use crate::request::{RequestError, Response};

/// How long an abort waits for any form of acknowledgement
/// before tearing the connection down regardless.
///
/// Not configurable: an abort must make progress
/// even if the peer never answers and the send never flushes.
pub const ABORT_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// The lifecycle phase that a timeout belongs to.
///
/// The abort acknowledgement window is not represented here: its expiry
/// completes the abort without changing what caused it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    AssociationRequest,
    AssociationRelease,
    Linger,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::AssociationRequest => "association request",
            TimeoutKind::AssociationRelease => "association release",
            TimeoutKind::Linger => "linger",
        };
        f.write_str(name)
    }
}

/// The terminal classification of an association's lifetime.
#[derive(Debug)]
pub enum Outcome {
    /// the peer answered the release request; all requests were settled
    ReleasedCleanly,
    /// the peer rejected the association request
    RejectedByPeer { rejection: Rejection },
    /// the peer aborted the association
    AbortedByPeer {
        source: AbortSource,
        reason: AbortReason,
    },
    /// the association was aborted from this side
    AbortedLocally,
    /// the transport failed or was closed under the association
    ConnectionLost { cause: Option<std::io::Error> },
    /// a lifecycle phase timed out and the association was aborted
    TimedOut { kind: TimeoutKind },
}

/// What drove the machine into the Abort state.
///
/// The cause decides the terminal outcome: a local abort stays a local
/// abort even if the peer happens to answer with its own abort during the
/// acknowledgement window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AbortCause {
    /// the cancellation token given to `send` fired
    Cancelled,
    /// `abort` was called on the client
    UserRequested,
    /// a lifecycle timer expired
    Timeout(TimeoutKind),
}

impl AbortCause {
    pub fn outcome(self) -> Outcome {
        match self {
            AbortCause::Cancelled | AbortCause::UserRequested => Outcome::AbortedLocally,
            AbortCause::Timeout(kind) => Outcome::TimedOut { kind },
        }
    }
}

/// A negotiated association plus the table of dispatched requests
/// still waiting for their final response.
#[derive(Debug)]
pub(crate) struct ActiveAssociation {
    pub association: Association,
    outstanding: HashMap<u16, mpsc::UnboundedSender<Result<Response, RequestError>>>,
}

impl ActiveAssociation {
    pub fn new(association: Association) -> Self {
        ActiveAssociation {
            association,
            outstanding: HashMap::new(),
        }
    }

    /// Record a dispatched request as awaiting responses.
    pub fn register(
        &mut self,
        message_id: u16,
        responder: mpsc::UnboundedSender<Result<Response, RequestError>>,
    ) {
        if self
            .outstanding
            .insert(message_id, responder)
            .is_some()
        {
            warn!(message_id, "duplicate message ID among outstanding requests");
        }
    }

    /// Forward a response to its request's callback.
    ///
    /// A final status settles the request and removes it from the table.
    pub fn deliver(&mut self, message_id: u16, response: Response) {
        let is_final = response.status.is_final();
        match self.outstanding.get(&message_id) {
            Some(responder) => {
                // the receiving side may have been dropped; that only means
                // nobody is listening for this request anymore
                let _ = responder.send(Ok(response));
            }
            None => {
                warn!(message_id, "response for unknown or settled request");
                return;
            }
        }
        if is_final {
            self.outstanding.remove(&message_id);
        }
    }

    /// Number of dispatched requests without a final response.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Fail every request still awaiting its final response.
    pub fn fail_all(&mut self, error: RequestError) {
        for (_, responder) in self.outstanding.drain() {
            let _ = responder.send(Err(error));
        }
    }
}

/// Identifies a state without its payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateKind {
    Idle,
    RequestAssociation,
    Sending,
    Linger,
    ReleaseAssociation,
    Abort,
    Completed,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// The live state of the association machine.
#[derive(Debug)]
pub(crate) enum ClientState {
    /// no association; requests may pile up in the queue
    Idle,
    /// transport being established and A-ASSOCIATE-RQ sent
    RequestAssociation { deadline: Option<Instant> },
    /// association live; queued requests are dispatched from here
    Sending {
        live: ActiveAssociation,
        /// whether the transport reported its send pipeline empty
        /// since the last dispatch
        send_queue_drained: bool,
    },
    /// drained; waiting briefly for late requests before releasing
    Linger {
        live: ActiveAssociation,
        deadline: Option<Instant>,
    },
    /// A-RELEASE-RQ sent; waiting for the peer's response
    ReleaseAssociation {
        live: ActiveAssociation,
        deadline: Option<Instant>,
    },
    /// tearing the association down without ceremony
    Abort {
        cause: AbortCause,
        live: Option<ActiveAssociation>,
    },
    /// terminal; the connection is closed and `send` resolves
    Completed {
        outcome: Outcome,
        live: Option<ActiveAssociation>,
    },
}

impl ClientState {
    pub fn kind(&self) -> StateKind {
        match self {
            ClientState::Idle => StateKind::Idle,
            ClientState::RequestAssociation { .. } => StateKind::RequestAssociation,
            ClientState::Sending { .. } => StateKind::Sending,
            ClientState::Linger { .. } => StateKind::Linger,
            ClientState::ReleaseAssociation { .. } => StateKind::ReleaseAssociation,
            ClientState::Abort { .. } => StateKind::Abort,
            ClientState::Completed { .. } => StateKind::Completed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ClientState::Completed { .. })
    }

    /// The armed timer of this state, if any.
    pub fn deadline(&self) -> Option<(TimeoutKind, Instant)> {
        match self {
            ClientState::RequestAssociation { deadline: Some(at) } => {
                Some((TimeoutKind::AssociationRequest, *at))
            }
            ClientState::Linger {
                deadline: Some(at), ..
            } => Some((TimeoutKind::Linger, *at)),
            ClientState::ReleaseAssociation {
                deadline: Some(at), ..
            } => Some((TimeoutKind::AssociationRelease, *at)),
            _ => None,
        }
    }

}
