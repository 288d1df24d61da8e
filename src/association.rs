//! Association-level vocabulary.
//!
//! The types in this module describe an upper layer association from the
//! requesting side: the immutable parameters proposed to the peer, the
//! negotiated outcome, and the reject/abort classifications defined by
//! PS3.8. None of them carry wire encodings; translating them from and to
//! PDUs is the connection's concern.

use std::borrow::Cow;
use std::time::Duration;

/// Default maximum PDU length proposed to the peer.
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// Default fallback character set for incoming data sets
/// which do not declare a specific character set.
pub const DEFAULT_FALLBACK_TEXT_ENCODING: &str = "ISO_IR 6";

/// A presentation context to be proposed during association negotiation:
/// one abstract syntax plus the transfer syntaxes
/// this node is willing to use for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedContext {
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context accepted by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedContext {
    /// the identifier assigned during negotiation
    pub id: u8,
    pub abstract_syntax: String,
    /// the single transfer syntax selected by the peer
    pub transfer_syntax: String,
}

/// The immutable parameters of an association request.
///
/// A value of this type is assembled by
/// [`ClientOptions`](crate::client::ClientOptions)
/// and handed to the connection,
/// which turns it into an A-ASSOCIATE-RQ.
#[derive(Debug, Clone)]
pub struct AssociationParams {
    /// the calling AE title (this node)
    pub calling_ae_title: Cow<'static, str>,
    /// the called AE title (the target node)
    pub called_ae_title: Cow<'static, str>,
    /// host name or address of the target node
    pub host: Cow<'static, str>,
    /// TCP port of the target node
    pub port: u16,
    /// whether the transport should be wrapped in TLS
    pub use_tls: bool,
    /// the presentation contexts to propose
    pub presentation_contexts: Vec<ProposedContext>,
    /// character set assumed for data sets without a declared one
    pub fallback_text_encoding: Cow<'static, str>,
    /// maximum number of operations this node invokes without waiting
    pub async_ops_invoked: u16,
    /// maximum number of operations this node performs without waiting
    pub async_ops_performed: u16,
    /// the maximum PDU length this node admits
    pub max_pdu_length: u32,
}

/// Timeouts governing the association lifecycle.
///
/// These cover the lifecycle phases driven by this crate;
/// per-read and per-write socket timeouts belong to the connection.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutOptions {
    /// how long to wait for the peer to answer an association request
    pub association_request_timeout: Duration,
    /// how long to wait for the peer to answer a release request
    pub association_release_timeout: Duration,
    /// how long to keep a drained association open for late requests
    pub association_linger_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        TimeoutOptions {
            association_request_timeout: Duration::from_secs(5),
            association_release_timeout: Duration::from_secs(10),
            association_linger_timeout: Duration::from_millis(50),
        }
    }
}

/// A negotiated association, as reported by the peer's acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    /// the AE title the peer identified itself with
    pub peer_ae_title: String,
    /// the presentation contexts accepted by the peer,
    /// without the rejected ones
    pub presentation_contexts: Vec<NegotiatedContext>,
    /// the maximum PDU length that the peer accepts
    pub peer_max_pdu_length: u32,
}

/// The result classification of an association rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectResult {
    Permanent,
    Transient,
}

/// The party responsible for an association rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectSource {
    ServiceUser,
    ServiceProviderAcse,
    ServiceProviderPresentation,
}

/// The reason given for an association rejection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    ProtocolVersionNotSupported,
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A complete association rejection as received from the peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub result: RejectResult,
    pub source: RejectSource,
    pub reason: RejectReason,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} rejection by {:?} ({:?})",
            self.result, self.source, self.reason
        )
    }
}

/// The party which initiated an association abort.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortSource {
    ServiceUser,
    ServiceProvider,
    Reserved,
}

/// The reason given for an association abort.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortReason {
    NotSpecified,
    UnrecognizedPdu,
    UnexpectedPdu,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}
