//! The state machine driver.
//!
//! The driver owns the state value, the connection, and the inbound event
//! stream, and runs as a single event loop inside the `send` future. All
//! event sources (inbound connection events, queue readiness, the current
//! state's timer, the caller's cancellation token and the client's abort
//! request) are multiplexed here and applied one at a time, so transitions
//! are serialized by construction: an event that arrives while a transition
//! chain is running is dispatched to whatever state is current once it is
//! dequeued.

use std::mem;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::association::{AbortReason, AbortSource, AssociationParams, TimeoutOptions};
use crate::connection::{Connection, ConnectionEvent};
use crate::request::RequestError;

use super::queue::{QueuedRequest, RequestQueue};
use super::state::{
    AbortCause, ActiveAssociation, ClientState, Outcome, StateKind, TimeoutKind,
    ABORT_ACK_TIMEOUT,
};
use super::ClientEvent;

/// One unit of input applied to the current state.
#[derive(Debug)]
enum Event {
    /// an inbound event from the connection
    Connection(ConnectionEvent),
    /// the request queue became non-empty
    QueueReady,
    /// the current state's timer expired
    Timeout(TimeoutKind),
    /// the cancellation token passed to `send` fired
    Cancel,
    /// `abort` was called on the client
    AbortRequested,
}

/// A handler's verdict on the state it consumed.
enum Step {
    Stay(ClientState),
    Transition(ClientState),
}

/// Drives a single association from Idle to Completed.
pub(crate) struct Driver<'a, C> {
    connection: C,
    events: mpsc::Receiver<ConnectionEvent>,
    queue: &'a RequestQueue,
    params: &'a AssociationParams,
    timeouts: TimeoutOptions,
    state: ClientState,
    cancel: CancellationToken,
    abort_requested: CancellationToken,
    notifications: &'a broadcast::Sender<ClientEvent>,
    state_watch: &'a watch::Sender<StateKind>,
}

impl<'a, C> Driver<'a, C>
where
    C: Connection,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: C,
        events: mpsc::Receiver<ConnectionEvent>,
        queue: &'a RequestQueue,
        params: &'a AssociationParams,
        timeouts: TimeoutOptions,
        cancel: CancellationToken,
        abort_requested: CancellationToken,
        notifications: &'a broadcast::Sender<ClientEvent>,
        state_watch: &'a watch::Sender<StateKind>,
    ) -> Self {
        Driver {
            connection,
            events,
            queue,
            params,
            timeouts,
            state: ClientState::Idle,
            cancel,
            abort_requested,
            notifications,
            state_watch,
        }
    }

    /// Run one full association lifecycle and return its terminal outcome.
    pub async fn run(mut self) -> Outcome {
        let first = if self.queue.is_empty() {
            debug!("send with no queued requests, completing immediately");
            ClientState::Completed {
                outcome: Outcome::ReleasedCleanly,
                live: None,
            }
        } else {
            ClientState::RequestAssociation { deadline: None }
        };
        self.transition(StateKind::Idle, first).await;

        while !self.state.is_completed() {
            let event = self.next_event().await;
            self.dispatch(event).await;
        }

        match mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Completed { outcome, .. } => outcome,
            _ => unreachable!("association loop left a non-terminal state"),
        }
    }

    /// Wait for the next event from any source.
    async fn next_event(&mut self) -> Event {
        let deadline = self.state.deadline();
        let timer_at = deadline.map(|(_, at)| at).unwrap_or_else(Instant::now);
        let wants_queue = matches!(
            self.state.kind(),
            StateKind::Sending | StateKind::Linger
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Event::Cancel,
            _ = self.abort_requested.cancelled() => Event::AbortRequested,
            _ = sleep_until(timer_at), if deadline.is_some() => {
                let (kind, _) = deadline.expect("deadline checked by select guard");
                Event::Timeout(kind)
            }
            event = self.events.recv() => Event::Connection(
                event.unwrap_or(ConnectionEvent::Closed { error: None }),
            ),
            _ = self.queue.ready(), if wants_queue => Event::QueueReady,
        }
    }

    /// Apply one event to the current state.
    async fn dispatch(&mut self, event: Event) {
        let state = mem::replace(&mut self.state, ClientState::Idle);
        let old_kind = state.kind();
        match self.handle(state, event).await {
            Step::Stay(state) => self.state = state,
            Step::Transition(next) => self.transition(old_kind, next).await,
        }
    }

    /// Swap in a new state and run its entry action, looping while entry
    /// actions request further transitions.
    ///
    /// The previous state value was consumed by whatever produced `next`,
    /// releasing its timer and waiters; the swap, the subscriber
    /// notification and the entry action follow in that order.
    async fn transition(&mut self, mut old_kind: StateKind, mut next: ClientState) {
        loop {
            let new_kind = next.kind();
            info!(old = %old_kind, new = %new_kind, "association state changing");
            self.state = next;
            let _ = self.state_watch.send(new_kind);
            let _ = self.notifications.send(ClientEvent::StateChanged {
                old: old_kind,
                new: new_kind,
            });
            match self.enter().await {
                None => break,
                Some(further) => {
                    old_kind = new_kind;
                    next = further;
                }
            }
        }
    }

    /// Entry action of the state just assigned. May request a follow-up
    /// transition.
    async fn enter(&mut self) -> Option<ClientState> {
        match self.state.kind() {
            StateKind::Idle => None,
            StateKind::Completed => {
                self.enter_completed().await;
                None
            }
            StateKind::RequestAssociation => self.enter_request_association().await,
            StateKind::Sending => self.enter_sending().await,
            StateKind::Linger => {
                if let ClientState::Linger { live, deadline } = &mut self.state {
                    debug!(
                        peer = %live.association.peer_ae_title,
                        "association drained, lingering",
                    );
                    *deadline =
                        Some(Instant::now() + self.timeouts.association_linger_timeout);
                }
                None
            }
            StateKind::ReleaseAssociation => self.enter_release().await,
            StateKind::Abort => Some(self.enter_abort().await),
        }
    }

    async fn enter_request_association(&mut self) -> Option<ClientState> {
        if let Err(e) = self.connection.connect().await {
            return Some(ClientState::Completed {
                outcome: Outcome::ConnectionLost { cause: Some(e) },
                live: None,
            });
        }
        if let Err(e) = self.connection.send_association_request(self.params).await {
            return Some(ClientState::Completed {
                outcome: Outcome::ConnectionLost { cause: Some(e) },
                live: None,
            });
        }
        if let ClientState::RequestAssociation { deadline } = &mut self.state {
            *deadline = Some(Instant::now() + self.timeouts.association_request_timeout);
        }
        None
    }

    async fn enter_sending(&mut self) -> Option<ClientState> {
        let (mut live, drained) = match mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Sending {
                live,
                send_queue_drained,
            } => (live, send_queue_drained),
            _ => unreachable!("entry action ran for a different state"),
        };
        match self.drain_queue(&mut live).await {
            Ok(dispatched) => {
                self.state = ClientState::Sending {
                    live,
                    send_queue_drained: drained && !dispatched,
                };
                None
            }
            Err(e) => Some(ClientState::Completed {
                outcome: Outcome::ConnectionLost { cause: Some(e) },
                live: Some(live),
            }),
        }
    }

    async fn enter_release(&mut self) -> Option<ClientState> {
        if let Err(e) = self.connection.send_association_release().await {
            let live = match mem::replace(&mut self.state, ClientState::Idle) {
                ClientState::ReleaseAssociation { live, .. } => Some(live),
                _ => None,
            };
            return Some(ClientState::Completed {
                outcome: Outcome::ConnectionLost { cause: Some(e) },
                live,
            });
        }
        if let ClientState::ReleaseAssociation { deadline, .. } = &mut self.state {
            *deadline = Some(Instant::now() + self.timeouts.association_release_timeout);
        }
        None
    }

    /// Abort entry: race the abort write, the peer's answer, connection
    /// loss and a fixed timer; the first to fire wins and the association
    /// completes with the cause that led here. The losing futures are
    /// dropped on the way out.
    async fn enter_abort(&mut self) -> ClientState {
        let (cause, live) = match mem::replace(&mut self.state, ClientState::Idle) {
            ClientState::Abort { cause, live } => (cause, live),
            _ => unreachable!("entry action ran for a different state"),
        };

        let send_abort = self
            .connection
            .send_abort(AbortSource::ServiceUser, AbortReason::NotSpecified);
        tokio::pin!(send_abort);
        let expiry = tokio::time::sleep(ABORT_ACK_TIMEOUT);
        tokio::pin!(expiry);
        loop {
            tokio::select! {
                outcome = &mut send_abort => {
                    debug!(ok = outcome.is_ok(), "abort write dispatched");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(ConnectionEvent::Abort { .. })
                    | Some(ConnectionEvent::Closed { .. })
                    | None => {
                        debug!("peer confirmed or dropped the aborted association");
                        break;
                    }
                    Some(other) => {
                        debug!(event = ?other, "event ignored while aborting");
                    }
                },
                _ = &mut expiry => {
                    debug!("abort acknowledgement timer expired");
                    break;
                }
            }
        }

        ClientState::Completed {
            outcome: cause.outcome(),
            live,
        }
    }

    /// Completed entry: close the transport and settle whatever the
    /// association left behind.
    async fn enter_completed(&mut self) {
        self.connection.disconnect().await;
        if let ClientState::Completed { outcome, live } = &mut self.state {
            if let Some(mut live) = live.take() {
                if live.outstanding() > 0 {
                    let error = match outcome {
                        Outcome::ConnectionLost { .. } => RequestError::ConnectionLost,
                        _ => RequestError::Aborted,
                    };
                    warn!(
                        count = live.outstanding(),
                        "failing requests left outstanding at completion"
                    );
                    live.fail_all(error);
                }
            }
        }
    }

    /// Dispatch every currently queued request onto the live association.
    ///
    /// Returns whether anything was dispatched; a transport failure hands
    /// the popped request's callback a connection-lost error and bubbles
    /// up.
    async fn drain_queue(
        &mut self,
        live: &mut ActiveAssociation,
    ) -> Result<bool, std::io::Error> {
        let mut dispatched = false;
        while let Some(QueuedRequest { request, responder }) = self.queue.try_pop() {
            let message_id = request.message_id;
            debug!(message_id, "dispatching request");
            match self.connection.send_request(request).await {
                Ok(()) => {
                    live.register(message_id, responder);
                    dispatched = true;
                }
                Err(e) => {
                    let _ = responder.send(Err(RequestError::ConnectionLost));
                    return Err(e);
                }
            }
        }
        Ok(dispatched)
    }

    /// Event handlers, organized by the state that consumes the event.
    async fn handle(&mut self, state: ClientState, event: Event) -> Step {
        use ConnectionEvent as In;

        match (state, event) {
            // --- RequestAssociation ---
            (
                ClientState::RequestAssociation { .. },
                Event::Connection(In::AssociationAccepted { association }),
            ) => {
                info!(
                    peer = %association.peer_ae_title,
                    contexts = association.presentation_contexts.len(),
                    "association accepted",
                );
                let _ = self.notifications.send(ClientEvent::AssociationAccepted {
                    association: association.clone(),
                });
                Step::Transition(ClientState::Sending {
                    live: ActiveAssociation::new(association),
                    send_queue_drained: false,
                })
            }
            (
                ClientState::RequestAssociation { .. },
                Event::Connection(In::AssociationRejected { rejection }),
            ) => {
                let _ = self
                    .notifications
                    .send(ClientEvent::AssociationRejected { rejection });
                Step::Transition(ClientState::Completed {
                    outcome: Outcome::RejectedByPeer { rejection },
                    live: None,
                })
            }
            (
                ClientState::RequestAssociation { .. },
                Event::Connection(In::Abort { source, reason }),
            ) => Step::Transition(ClientState::Completed {
                outcome: Outcome::AbortedByPeer { source, reason },
                live: None,
            }),
            (
                ClientState::RequestAssociation { .. },
                Event::Connection(In::Closed { error }),
            ) => Step::Transition(ClientState::Completed {
                outcome: Outcome::ConnectionLost { cause: error },
                live: None,
            }),
            (ClientState::RequestAssociation { .. }, Event::Timeout(kind)) => {
                warn!(%kind, "peer did not answer the association request");
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::Timeout(kind),
                    live: None,
                })
            }
            (ClientState::RequestAssociation { .. }, Event::Cancel) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::Cancelled,
                    live: None,
                })
            }
            (ClientState::RequestAssociation { .. }, Event::AbortRequested) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::UserRequested,
                    live: None,
                })
            }

            // --- Sending ---
            (
                ClientState::Sending {
                    mut live,
                    send_queue_drained,
                },
                Event::Connection(In::RequestCompleted {
                    message_id,
                    response,
                }),
            ) => {
                live.deliver(message_id, response);
                if send_queue_drained && live.outstanding() == 0 && self.queue.is_empty() {
                    Step::Transition(ClientState::Linger {
                        live,
                        deadline: None,
                    })
                } else {
                    Step::Stay(ClientState::Sending {
                        live,
                        send_queue_drained,
                    })
                }
            }
            (ClientState::Sending { live, .. }, Event::Connection(In::SendQueueEmpty)) => {
                if live.outstanding() == 0 && self.queue.is_empty() {
                    Step::Transition(ClientState::Linger {
                        live,
                        deadline: None,
                    })
                } else {
                    Step::Stay(ClientState::Sending {
                        live,
                        send_queue_drained: true,
                    })
                }
            }
            (
                ClientState::Sending {
                    mut live,
                    send_queue_drained,
                },
                Event::QueueReady,
            ) => match self.drain_queue(&mut live).await {
                Ok(dispatched) => Step::Stay(ClientState::Sending {
                    live,
                    send_queue_drained: send_queue_drained && !dispatched,
                }),
                Err(e) => Step::Transition(ClientState::Completed {
                    outcome: Outcome::ConnectionLost { cause: Some(e) },
                    live: Some(live),
                }),
            },
            (
                ClientState::Sending { live, .. },
                Event::Connection(In::Abort { source, reason }),
            ) => Step::Transition(ClientState::Completed {
                outcome: Outcome::AbortedByPeer { source, reason },
                live: Some(live),
            }),
            (ClientState::Sending { live, .. }, Event::Connection(In::Closed { error })) => {
                Step::Transition(ClientState::Completed {
                    outcome: Outcome::ConnectionLost { cause: error },
                    live: Some(live),
                })
            }
            (ClientState::Sending { live, .. }, Event::Cancel) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::Cancelled,
                    live: Some(live),
                })
            }
            (ClientState::Sending { live, .. }, Event::AbortRequested) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::UserRequested,
                    live: Some(live),
                })
            }

            // --- Linger ---
            (ClientState::Linger { live, .. }, Event::QueueReady) => {
                // back to Sending; the entry action dispatches the queue
                Step::Transition(ClientState::Sending {
                    live,
                    send_queue_drained: false,
                })
            }
            (ClientState::Linger { live, .. }, Event::Timeout(TimeoutKind::Linger)) => {
                Step::Transition(ClientState::ReleaseAssociation {
                    live,
                    deadline: None,
                })
            }
            (
                ClientState::Linger { live, .. },
                Event::Connection(In::Abort { source, reason }),
            ) => Step::Transition(ClientState::Completed {
                outcome: Outcome::AbortedByPeer { source, reason },
                live: Some(live),
            }),
            (ClientState::Linger { live, .. }, Event::Connection(In::Closed { error })) => {
                Step::Transition(ClientState::Completed {
                    outcome: Outcome::ConnectionLost { cause: error },
                    live: Some(live),
                })
            }
            (ClientState::Linger { live, .. }, Event::Cancel) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::Cancelled,
                    live: Some(live),
                })
            }
            (ClientState::Linger { live, .. }, Event::AbortRequested) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::UserRequested,
                    live: Some(live),
                })
            }

            // --- ReleaseAssociation ---
            (
                ClientState::ReleaseAssociation { live, .. },
                Event::Connection(In::ReleaseResponse),
            ) => {
                let _ = self.notifications.send(ClientEvent::AssociationReleased);
                Step::Transition(ClientState::Completed {
                    outcome: Outcome::ReleasedCleanly,
                    live: Some(live),
                })
            }
            (
                ClientState::ReleaseAssociation { live, .. },
                Event::Connection(In::Abort { source, reason }),
            ) => Step::Transition(ClientState::Completed {
                outcome: Outcome::AbortedByPeer { source, reason },
                live: Some(live),
            }),
            (
                ClientState::ReleaseAssociation { live, .. },
                Event::Connection(In::Closed { error }),
            ) => Step::Transition(ClientState::Completed {
                outcome: Outcome::ConnectionLost { cause: error },
                live: Some(live),
            }),
            (
                ClientState::ReleaseAssociation { live, .. },
                Event::Timeout(TimeoutKind::AssociationRelease),
            ) => {
                warn!("peer did not answer the release request");
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::Timeout(TimeoutKind::AssociationRelease),
                    live: Some(live),
                })
            }
            (ClientState::ReleaseAssociation { live, .. }, Event::Cancel) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::Cancelled,
                    live: Some(live),
                })
            }
            (ClientState::ReleaseAssociation { live, .. }, Event::AbortRequested) => {
                Step::Transition(ClientState::Abort {
                    cause: AbortCause::UserRequested,
                    live: Some(live),
                })
            }

            // anything else carries no meaning in the current state
            (state, event) => {
                debug!(state = %state.kind(), event = ?event, "event ignored in current state");
                Step::Stay(state)
            }
        }
    }
}
