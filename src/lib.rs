//! This crate contains the client-side state machine
//! for driving DICOM associations over the upper layer protocol.
//!
//! It coordinates the lifecycle of a single association
//! (negotiation, request dispatch, lingering, release, and abort)
//! on top of an abstract connection which handles
//! PDU framing and the transport.
//! This makes it a base for concrete service class users (SCUs)
//! which need full control over when requests are queued
//! and how the association ends.
//!
//! - The [`client`] module
//!   provides the [`Client`] facade and its [`ClientOptions`] builder,
//!   which drive associations and expose progress notifications.
//! - The [`connection`] module
//!   defines the [`Connection`] port that a transport implementation
//!   must provide, and the events it delivers.
//! - The [`association`] module
//!   holds the association-level vocabulary:
//!   proposed and negotiated parameters,
//!   and the reject and abort classifications of PS3.8.
//! - The [`request`] module
//!   defines the request descriptors queued on the client
//!   and the responses delivered back to it.
//!
//! The state machine itself runs inside the future returned by
//! [`Client::send`]: one cooperative event loop per association,
//! consuming connection events, queued requests, timers,
//! and cancellation one at a time.

pub mod association;
pub mod client;
pub mod connection;
pub mod error;
pub mod request;

// re-exports

pub use association::{
    AbortReason, AbortSource, Association, AssociationParams, NegotiatedContext,
    ProposedContext, RejectReason, RejectResult, RejectSource, Rejection, TimeoutOptions,
};
pub use client::{
    Client, ClientEvent, ClientOptions, Outcome, StateKind, TimeoutKind, ABORT_ACK_TIMEOUT,
};
pub use connection::{Connection, ConnectionEvent, Connector};
pub use error::Error;
pub use request::{Request, RequestError, Response, ResponseStream, Status};
