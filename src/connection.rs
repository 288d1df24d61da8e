//! The connection port.
//!
//! The state machine does not touch sockets or PDU framing. It drives an
//! implementation of [`Connection`], which accepts outbound intents
//! (connect, association request, requests, release, abort, disconnect)
//! and delivers inbound association-level events through a single-consumer
//! channel obtained from [`Connector::open`].
//!
//! Implementations must deliver events in the order received from the
//! wire, and a [`ConnectionEvent::Closed`] must be the last event of an
//! association. Closing the event channel is treated as a `Closed` with no
//! cause.

use std::future::Future;

use tokio::sync::mpsc;

use crate::association::{
    AbortReason, AbortSource, Association, AssociationParams, Rejection,
};
use crate::request::{Request, Response};

/// An inbound association-level event, as decoded by the connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// the peer accepted the association request
    AssociationAccepted { association: Association },
    /// the peer rejected the association request
    AssociationRejected { rejection: Rejection },
    /// the peer answered a release request
    ReleaseResponse,
    /// the peer aborted the association
    Abort {
        source: AbortSource,
        reason: AbortReason,
    },
    /// a response to a previously dispatched request arrived
    RequestCompleted { message_id: u16, response: Response },
    /// the transport's outbound pipeline has been fully written out
    SendQueueEmpty,
    /// the transport is gone; always the last event of an association
    Closed { error: Option<std::io::Error> },
}

/// Outbound capabilities the state machine requires from a connection.
///
/// All operations may suspend. The `send_*` operations complete when the
/// intent has been handed to the transport's send pipeline, not when the
/// peer acknowledges anything. Failures are transport failures and end the
/// association.
pub trait Connection: Send {
    /// Establish the transport to the node named in the association
    /// parameters.
    fn connect(&mut self) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Build and send the A-ASSOCIATE-RQ for the given parameters.
    fn send_association_request(
        &mut self,
        params: &AssociationParams,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Enqueue a request on the transport's send pipeline.
    fn send_request(
        &mut self,
        request: Request,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Send an A-RELEASE-RQ.
    fn send_association_release(
        &mut self,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Send an A-ABORT. Best-effort; completion only means the write was
    /// dispatched.
    fn send_abort(
        &mut self,
        source: AbortSource,
        reason: AbortReason,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Close the transport. Idempotent; never fails.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Factory for connections, invoked once per association attempt.
///
/// `open` only creates the handles; the transport is established later by
/// [`Connection::connect`].
pub trait Connector: Send + Sync {
    type Connection: Connection;

    fn open(
        &self,
        params: &AssociationParams,
    ) -> (Self::Connection, mpsc::Receiver<ConnectionEvent>);
}
