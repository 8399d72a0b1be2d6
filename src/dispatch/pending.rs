//! Pending requests — queued invocations awaiting a free worker

use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::delegate::RequestMetadata;
use super::worker::InvokeResponse;
use crate::error::{Error, Result};

/// Current time as epoch milliseconds
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One queued invocation: payload, deadline timer, and completion channel.
///
/// Exactly one of resolve or reject fires per request; the deadline timer
/// is cancelled on any terminal transition.
pub struct PendingRequest {
    /// Queue-local sequence number used to address the entry from its timer
    pub id: u64,
    /// Wire-level request id
    pub request_id: String,
    /// Input payload
    pub input: Bytes,
    /// Request metadata
    pub metadata: RequestMetadata,
    /// Arrival instant, used to measure queue wait
    pub start: Instant,
    /// Arrival time as epoch milliseconds
    pub start_epoch_ms: u64,
    /// Cleared when the deadline fires or the queue is fast-failed
    pub available: bool,
    responder: oneshot::Sender<Result<InvokeResponse>>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    /// Create a pending request and the receiver its caller awaits
    pub fn new(
        id: u64,
        request_id: String,
        input: Bytes,
        metadata: RequestMetadata,
    ) -> (Self, oneshot::Receiver<Result<InvokeResponse>>) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            id,
            request_id,
            input,
            metadata,
            start: Instant::now(),
            start_epoch_ms: epoch_ms(),
            available: true,
            responder: tx,
            timer: None,
        };
        (pending, rx)
    }

    /// Attach the deadline timer's abort handle
    pub fn set_timer(&mut self, timer: AbortHandle) {
        self.timer = Some(timer);
    }

    /// Abort the deadline timer, if armed
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Milliseconds spent in the queue so far
    pub fn wait_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Consume the entry for dispatch: cancels the timer and hands back the
    /// payload plus the completion channel.
    pub fn into_dispatch(
        mut self,
    ) -> (
        Bytes,
        RequestMetadata,
        Instant,
        oneshot::Sender<Result<InvokeResponse>>,
    ) {
        self.cancel_timer();
        (self.input, self.metadata, self.start, self.responder)
    }

    /// Reject the entry, cancelling its timer. Returns the wait duration.
    pub fn reject(mut self, error: Error) -> u64 {
        self.cancel_timer();
        let waited = self.wait_ms();
        // The caller may have dropped its receiver already; nothing to do.
        let _ = self.responder.send(Err(error));
        waited
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("request_id", &self.request_id)
            .field("available", &self.available)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pending(id: u64) -> (PendingRequest, oneshot::Receiver<Result<InvokeResponse>>) {
        PendingRequest::new(
            id,
            format!("req-{}", id),
            Bytes::from_static(b"payload"),
            RequestMetadata::default(),
        )
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let (pending, rx) = make_pending(1);
        pending.reject(Error::DeadlineExceeded {
            function_name: "echo".into(),
            waited_ms: 500,
        });

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_reject_with_dropped_receiver_is_silent() {
        let (pending, rx) = make_pending(1);
        drop(rx);
        let waited = pending.reject(Error::FastFail("boom".into()));
        assert!(waited < 1000);
    }

    #[tokio::test]
    async fn test_into_dispatch_returns_payload() {
        let (pending, mut rx) = make_pending(7);
        let (input, _metadata, _start, responder) = pending.into_dispatch();
        assert_eq!(input, Bytes::from_static(b"payload"));

        // Channel is still open until the responder fires
        assert!(rx.try_recv().is_err());
        drop(responder);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_timer_aborts_task() {
        let (mut pending, _rx) = make_pending(1);
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        pending.set_timer(task.abort_handle());
        pending.cancel_timer();
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_ms_grows() {
        tokio::time::pause();
        let (pending, _rx) = make_pending(1);
        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        assert!(pending.wait_ms() >= 250);
    }

    #[test]
    fn test_debug_omits_payload() {
        let (pending, _rx) = make_pending(42);
        let debug = format!("{:?}", pending);
        assert!(debug.contains("req-42"));
        assert!(!debug.contains("payload"));
    }
}
