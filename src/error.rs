//! Error types for the association lifecycle.

use std::backtrace::Backtrace;

use snafu::Snafu;

use crate::association::{AbortReason, AbortSource, Rejection};
use crate::client::TimeoutKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The ways an association lifecycle can end other than a clean release.
///
/// Returned by [`Client::send`](crate::client::Client::send);
/// each variant corresponds to one terminal
/// [`Outcome`](crate::client::Outcome).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// association rejected by the peer
    #[snafu(display("association rejected: {}", rejection))]
    Rejected {
        rejection: Rejection,
        backtrace: Backtrace,
    },

    /// association aborted by the peer
    #[snafu(display("association aborted by peer ({:?}, {:?})", source, reason))]
    PeerAborted {
        #[snafu(source(false))]
        source: AbortSource,
        reason: AbortReason,
        backtrace: Backtrace,
    },

    /// association aborted locally
    Aborted { backtrace: Backtrace },

    /// the connection failed or was lost
    #[snafu(display(
        "connection lost{}",
        cause.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    ))]
    ConnectionLost {
        cause: Option<std::io::Error>,
        backtrace: Backtrace,
    },

    /// a lifecycle phase timed out
    #[snafu(display("{} timed out", kind))]
    Timeout {
        kind: TimeoutKind,
        backtrace: Backtrace,
    },
}
