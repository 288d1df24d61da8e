//! The request queue shared between the client facade and the driver.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::request::{Request, RequestError, Response};

/// A queued request together with its response callback.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub request: Request,
    pub responder: mpsc::UnboundedSender<Result<Response, RequestError>>,
}

/// FIFO of requests awaiting dispatch.
///
/// Appends may happen from any thread and in any machine state; pops only
/// happen on the driver while the machine is in Sending. The queue outlives
/// any individual association: requests enqueued before `send` or during
/// Linger are dispatched by the next pass through Sending.
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    inner: Mutex<VecDeque<QueuedRequest>>,
    ready: Notify,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request at the tail and wake any dispatch waiter.
    pub fn enqueue(&self, entry: QueuedRequest) {
        self.inner
            .lock()
            .expect("request queue lock poisoned")
            .push_back(entry);
        self.ready.notify_one();
    }

    /// Pop the request at the head, if any.
    pub fn try_pop(&self) -> Option<QueuedRequest> {
        self.inner
            .lock()
            .expect("request queue lock poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("request queue lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once the queue is non-empty.
    ///
    /// May resolve spuriously after a concurrent pop; callers must treat a
    /// wake-up as a hint and re-check with [`try_pop`](Self::try_pop).
    pub async fn ready(&self) {
        loop {
            if !self.is_empty() {
                return;
            }
            self.ready.notified().await;
        }
    }
}
