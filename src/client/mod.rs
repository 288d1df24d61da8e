//! The DICOM client facade.
//!
//! A [`Client`] owns a request queue and drives one association at a time
//! through its full lifecycle:
//! Idle → RequestAssociation → Sending ⇄ Linger → ReleaseAssociation →
//! Completed, with Abort reachable from every non-terminal state. Requests
//! may be queued at any time; [`Client::send`] negotiates an association,
//! dispatches everything queued (plus whatever arrives while the
//! association is live), lingers briefly for stragglers, and releases.
//!
//! ## Basic usage
//!
//! ```no_run
//! use dicom_client::connection::Connector;
//! use dicom_client::{ClientOptions, Request};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn store(connector: impl Connector) -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClientOptions::new()
//!         .calling_ae_title("STORE-SCU")
//!         .called_ae_title("MAIN-STORAGE")
//!         .host("10.0.0.5")
//!         .port(104)
//!         .with_abstract_syntax("1.2.840.10008.5.1.4.1.1.7")
//!         .build(connector);
//!
//!     let mut responses = client.add_request(Request::new(
//!         1,
//!         "1.2.840.10008.5.1.4.1.1.7",
//!         &b"\x00\x01"[..],
//!     ));
//!     client.send(CancellationToken::new()).await?;
//!     while let Some(response) = responses.recv().await {
//!         println!("{:?}", response?.status);
//!     }
//!     Ok(())
//! }
//! ```

mod driver;
mod queue;
mod state;


pub use state::{Outcome, StateKind, TimeoutKind, ABORT_ACK_TIMEOUT};

use std::borrow::Cow;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::association::{
    Association, AssociationParams, ProposedContext, Rejection, TimeoutOptions,
    DEFAULT_FALLBACK_TEXT_ENCODING, DEFAULT_MAX_PDU,
};
use crate::connection::Connector;
use crate::error::{
    AbortedSnafu, ConnectionLostSnafu, PeerAbortedSnafu, RejectedSnafu, Result, TimeoutSnafu,
};
use crate::request::{Request, ResponseStream};

use driver::Driver;
use queue::{QueuedRequest, RequestQueue};

/// Capacity of the notification channel handed to subscribers.
const NOTIFICATION_BUFFER: usize = 64;

/// A notification about the progress of an association.
///
/// Delivered through the channel returned by [`Client::subscribe`].
/// Subscribers observe transitions in the order they occurred; a slow
/// subscriber may miss notifications (the channel is bounded), but never
/// sees them reordered.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// the peer accepted the association request
    AssociationAccepted { association: Association },
    /// the peer rejected the association request
    AssociationRejected { rejection: Rejection },
    /// the peer answered the release request
    AssociationReleased,
    /// the machine moved from one state to another
    StateChanged { old: StateKind, new: StateKind },
}

/// A builder for a [`Client`].
///
/// All options have defaults except the presentation contexts:
/// at least one must be proposed, or the peer has nothing to accept.
///
/// The timeout options follow the association lifecycle: how long to wait
/// for the peer to answer the association request, how long a drained
/// association lingers for late requests, and how long to wait for the
/// release response.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    calling_ae_title: Cow<'static, str>,
    called_ae_title: Cow<'static, str>,
    host: Cow<'static, str>,
    port: u16,
    use_tls: bool,
    presentation_contexts: Vec<ProposedContext>,
    fallback_text_encoding: Cow<'static, str>,
    async_ops_invoked: u16,
    async_ops_performed: u16,
    max_pdu_length: u32,
    timeouts: TimeoutOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: "ANY-SCP".into(),
            host: "127.0.0.1".into(),
            port: 104,
            use_tls: false,
            presentation_contexts: Vec::new(),
            fallback_text_encoding: DEFAULT_FALLBACK_TEXT_ENCODING.into(),
            async_ops_invoked: 1,
            async_ops_performed: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            timeouts: TimeoutOptions::default(),
        }
    }
}

impl ClientOptions {
    /// Create a new set of options with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.called_ae_title = called_ae_title.into();
        self
    }

    /// Define the host name or address of the target node.
    pub fn host<T>(mut self, host: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.host = host.into();
        self
    }

    /// Define the TCP port of the target node.
    ///
    /// The default is 104.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Whether to ask the connection for a TLS-wrapped transport.
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<String>,
    {
        self.presentation_contexts.push(ProposedContext {
            abstract_syntax: abstract_syntax_uid.into(),
            transfer_syntaxes: transfer_syntax_uids.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<String>,
    {
        self.with_presentation_context(
            abstract_syntax_uid.into(),
            vec![
                // Explicit VR Little Endian
                "1.2.840.10008.1.2.1".to_string(),
                // Implicit VR Little Endian
                "1.2.840.10008.1.2".to_string(),
            ],
        )
    }

    /// Override the character set assumed for incoming data sets
    /// which do not declare one.
    pub fn fallback_text_encoding<T>(mut self, encoding: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.fallback_text_encoding = encoding.into();
        self
    }

    /// Override the asynchronous operations window
    /// proposed during negotiation.
    ///
    /// The defaults are 1 invoked and 1 performed.
    pub fn async_ops(mut self, invoked: u16, performed: u16) -> Self {
        self.async_ops_invoked = invoked;
        self.async_ops_performed = performed;
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override how long to wait for the peer
    /// to answer the association request.
    ///
    /// The default is 5 seconds.
    pub fn association_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.association_request_timeout = timeout;
        self
    }

    /// Override how long to wait for the peer
    /// to answer the release request.
    ///
    /// The default is 10 seconds.
    pub fn association_release_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.association_release_timeout = timeout;
        self
    }

    /// Override how long a drained association stays open
    /// waiting for late requests before it is released.
    ///
    /// The default is 50 milliseconds.
    pub fn association_linger_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.association_linger_timeout = timeout;
        self
    }

    /// Build the client, attaching the connection factory
    /// that will provide a transport for each association attempt.
    pub fn build<C>(self, connector: C) -> Client<C>
    where
        C: Connector,
    {
        let params = AssociationParams {
            calling_ae_title: self.calling_ae_title,
            called_ae_title: self.called_ae_title,
            host: self.host,
            port: self.port,
            use_tls: self.use_tls,
            presentation_contexts: self.presentation_contexts,
            fallback_text_encoding: self.fallback_text_encoding,
            async_ops_invoked: self.async_ops_invoked,
            async_ops_performed: self.async_ops_performed,
            max_pdu_length: self.max_pdu_length,
        };
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let (state_tx, state_rx) = watch::channel(StateKind::Idle);
        Client {
            connector,
            params,
            timeouts: self.timeouts,
            queue: RequestQueue::new(),
            notifications,
            state_tx,
            state_rx,
            current_abort: Mutex::new(None),
            send_gate: tokio::sync::Mutex::new(()),
        }
    }
}

/// A client node which drives DICOM associations as a service class user.
///
/// The client is reusable: once an association completes, the next call to
/// [`send`](Self::send) starts a fresh cycle from Idle. At most one
/// association is in flight at a time; concurrent `send` calls are
/// serialized.
#[derive(Debug)]
pub struct Client<C>
where
    C: Connector,
{
    connector: C,
    params: AssociationParams,
    timeouts: TimeoutOptions,
    queue: RequestQueue,
    notifications: broadcast::Sender<ClientEvent>,
    state_tx: watch::Sender<StateKind>,
    state_rx: watch::Receiver<StateKind>,
    /// abort token of the association currently in flight
    current_abort: Mutex<Option<CancellationToken>>,
    /// serializes whole associations, not individual operations
    send_gate: tokio::sync::Mutex<()>,
}

impl<C> Client<C>
where
    C: Connector,
{
    /// Queue a request for dispatch.
    ///
    /// Never blocks and never fails. If an association is live, the request
    /// is dispatched right away; otherwise it waits for the next
    /// [`send`](Self::send). Responses, including intermediate ones, arrive
    /// on the returned stream; a request that was dispatched but not
    /// settled when the association ends receives a terminal error there.
    pub fn add_request(&self, request: Request) -> ResponseStream {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(message_id = request.message_id, "request queued");
        self.queue.enqueue(QueuedRequest {
            request,
            responder: tx,
        });
        ResponseStream::new(rx)
    }

    /// Drive one full association lifecycle.
    ///
    /// Negotiates an association, dispatches every queued request, waits
    /// for their responses, and releases. Completes once the machine
    /// reaches its terminal state: `Ok` on a clean release (including the
    /// degenerate case of an empty queue, which does not open a connection
    /// at all), and an error describing the terminal outcome otherwise.
    ///
    /// Cancelling `cancel` aborts the association; the call then finishes
    /// within the abort acknowledgement window.
    pub async fn send(&self, cancel: CancellationToken) -> Result<Outcome> {
        let _gate = self.send_gate.lock().await;
        // a finished client re-enters Idle at the start of the next cycle
        let _ = self.state_tx.send(StateKind::Idle);
        let abort_requested = CancellationToken::new();
        *self
            .current_abort
            .lock()
            .expect("abort token lock poisoned") = Some(abort_requested.clone());

        let (connection, events) = self.connector.open(&self.params);
        let driver = Driver::new(
            connection,
            events,
            &self.queue,
            &self.params,
            self.timeouts,
            cancel,
            abort_requested,
            &self.notifications,
            &self.state_tx,
        );
        let outcome = driver.run().await;

        self.current_abort
            .lock()
            .expect("abort token lock poisoned")
            .take();
        into_result(outcome)
    }

    /// Abort the association currently in flight.
    ///
    /// Completes once the machine reaches its terminal state. Does nothing
    /// if no association is in flight. Concurrent calls coalesce onto the
    /// same abort.
    pub async fn abort(&self) {
        let token = self
            .current_abort
            .lock()
            .expect("abort token lock poisoned")
            .clone();
        let Some(token) = token else {
            return;
        };
        token.cancel();
        let mut state = self.state_rx.clone();
        // Idle can only be observed here if another send already finished
        // the aborted cycle and started the next one
        let _ = state
            .wait_for(|s| matches!(s, StateKind::Completed | StateKind::Idle))
            .await;
    }

    /// Subscribe to association progress notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.notifications.subscribe()
    }

    /// The machine's current state.
    pub fn state(&self) -> StateKind {
        *self.state_rx.borrow()
    }

    /// Number of requests queued and not yet dispatched.
    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// The association parameters this client proposes.
    pub fn params(&self) -> &AssociationParams {
        &self.params
    }
}

/// Map a terminal outcome onto the result of `send`.
fn into_result(outcome: Outcome) -> Result<Outcome> {
    match outcome {
        Outcome::ReleasedCleanly => Ok(Outcome::ReleasedCleanly),
        Outcome::RejectedByPeer { rejection } => RejectedSnafu { rejection }.fail(),
        Outcome::AbortedByPeer { source, reason } => {
            PeerAbortedSnafu { source, reason }.fail()
        }
        Outcome::AbortedLocally => AbortedSnafu.fail(),
        Outcome::ConnectionLost { cause } => ConnectionLostSnafu { cause }.fail(),
        Outcome::TimedOut { kind } => TimeoutSnafu { kind }.fail(),
    }
}
