//! DIMSE request descriptors and their responses.
//!
//! A [`Request`] is the unit queued on the client and dispatched over an
//! active association. The command and data set payloads are carried as
//! opaque bytes, already encoded for the proposed presentation context;
//! building and parsing them is the caller's concern.

use bytes::Bytes;
use snafu::Snafu;
use tokio::sync::mpsc;

/// The terminal failure delivered to a request's response callback
/// when the association ends before the request's final response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum RequestError {
    /// the connection was lost before a final response arrived
    ConnectionLost,
    /// the association was aborted before a final response arrived
    Aborted,
}

/// A DIMSE request to be dispatched over an association.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// the message ID, unique within the association
    pub message_id: u16,
    /// the SOP class UID, used to select a presentation context
    pub affected_sop_class_uid: String,
    /// the encoded command set
    pub command: Bytes,
    /// the encoded data set, if the operation carries one
    pub data: Option<Bytes>,
}

impl Request {
    /// Create a new request descriptor with no data set.
    pub fn new(
        message_id: u16,
        affected_sop_class_uid: impl Into<String>,
        command: impl Into<Bytes>,
    ) -> Self {
        Request {
            message_id,
            affected_sop_class_uid: affected_sop_class_uid.into(),
            command: command.into(),
            data: None,
        }
    }

    /// Attach an encoded data set to the request.
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }
}

/// A response to a dispatched request.
///
/// An operation may produce several of these:
/// any number with a non-final [`Status`],
/// then exactly one where [`Status::is_final`] holds.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: Status,
    /// the encoded data set attached to the response, if any
    pub data: Option<Bytes>,
}

/// DIMSE response status classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Success,
    /// the operation is still in progress; more responses follow
    Pending,
    Warning {
        /// whether the peer will continue with more responses
        continuation: bool,
    },
    Failure {
        /// the raw DIMSE status code
        code: u16,
    },
    Cancel,
}

impl Status {
    /// Whether this status terminates the request it responds to.
    ///
    /// `Pending` and continuing warnings leave the request outstanding;
    /// everything else is final.
    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            Status::Pending | Status::Warning { continuation: true }
        )
    }
}

/// The receiving end of a request's response callback.
///
/// Yields every response the peer produces for the request, in order.
/// If the association ends before the final response arrives,
/// the last item is an `Err` carrying the cause,
/// after which the stream is exhausted.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::UnboundedReceiver<Result<Response, RequestError>>,
}

impl ResponseStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<Response, RequestError>>) -> Self {
        ResponseStream { rx }
    }

    /// Receive the next response, or `None` once the request is settled.
    pub async fn recv(&mut self) -> Option<Result<Response, RequestError>> {
        self.rx.recv().await
    }

    /// Drain the stream and return the final response.
    pub async fn finished(mut self) -> Result<Response, RequestError> {
        let mut last = None;
        while let Some(item) = self.rx.recv().await {
            last = Some(item?);
        }
        last.ok_or(RequestError::Aborted)
    }
}
