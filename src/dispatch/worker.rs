//! Worker — a handle onto one running worker process
//!
//! Tracks in-flight load, gates traffic during drain, and forwards
//! requests to the process through the delegate. The in-flight counter is
//! released only once the response body has been fully consumed, not when
//! the invoke call returns.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use super::broker::WorkerBroker;
use super::delegate::{Delegate, RequestMetadata};
use super::pending::epoch_ms;
use crate::error::{Error, Result};
use crate::events::{ContainerEvent, ContainerStatusReport, EventBus, WorkerSnapshot};

/// A function invocation response, annotated with the serving worker and
/// the time the request spent queueing.
///
/// The worker's in-flight slot is held until this response is finished or
/// dropped.
pub struct InvokeResponse {
    /// Response body
    pub data: Bytes,
    /// Milliseconds the request waited in the broker queue; 0 for
    /// pass-through dispatch
    pub queueing_ms: u64,
    /// Name of the worker that served the request
    pub worker_name: String,
    finish: Option<oneshot::Sender<()>>,
}

impl InvokeResponse {
    pub(crate) fn new(
        data: Bytes,
        queueing_ms: u64,
        worker_name: String,
        finish: oneshot::Sender<()>,
    ) -> Self {
        Self {
            data,
            queueing_ms,
            worker_name,
            finish: Some(finish),
        }
    }

    /// Signal that the body has been fully consumed
    pub fn finish(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.finish.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for InvokeResponse {
    fn drop(&mut self) {
        self.signal();
    }
}

impl std::fmt::Debug for InvokeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeResponse")
            .field("queueing_ms", &self.queueing_ms)
            .field("worker_name", &self.worker_name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A bound worker process
pub struct Worker {
    name: String,
    credential: String,
    function_name: String,
    inspector: bool,
    disposable: bool,
    max_activate_requests: usize,
    register_time_ms: u64,
    /// In-flight request count; never negative
    active: AtomicUsize,
    /// Set when the worker is draining; no new traffic is admitted
    traffic_off: AtomicBool,
    drain_reported: AtomicBool,
    down_to_zero: Notify,
    delegate: Arc<dyn Delegate>,
    /// Non-owning handle back to the broker; the broker owns workers
    broker: Weak<WorkerBroker>,
    events: EventBus,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: impl Into<String>,
        credential: impl Into<String>,
        function_name: impl Into<String>,
        inspector: bool,
        disposable: bool,
        max_activate_requests: usize,
        delegate: Arc<dyn Delegate>,
        broker: Weak<WorkerBroker>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            credential: credential.into(),
            function_name: function_name.into(),
            inspector,
            disposable,
            max_activate_requests,
            register_time_ms: epoch_ms(),
            active: AtomicUsize::new(0),
            traffic_off: AtomicBool::new(false),
            drain_reported: AtomicBool::new(false),
            down_to_zero: Notify::new(),
            delegate,
            broker,
            events,
        })
    }

    /// Stable worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Credential addressing the worker process
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// In-flight request count
    pub fn active_request_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the worker is draining
    pub fn traffic_off(&self) -> bool {
        self.traffic_off.load(Ordering::SeqCst)
    }

    /// Epoch milliseconds when the worker was bound
    pub fn register_time_ms(&self) -> u64 {
        self.register_time_ms
    }

    /// Whether the worker can take another request
    pub fn is_free(&self) -> bool {
        !self.traffic_off() && self.active_request_count() < self.max_activate_requests
    }

    /// Stats reported to the control plane
    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            name: self.name.clone(),
            credential: self.credential.clone(),
            active_request_count: self.active_request_count(),
            max_activate_requests: self.max_activate_requests,
            traffic_off: self.traffic_off(),
            register_time_ms: self.register_time_ms,
        }
    }

    /// Forward one request to the worker process.
    ///
    /// `queued_since` is the enqueue instant for requests served from the
    /// pending queue; pass-through requests report a zero queueing time.
    /// Success and error are both annotated with the worker name and the
    /// measured wait.
    pub async fn pipe(
        self: &Arc<Self>,
        input: Bytes,
        metadata: &RequestMetadata,
        queued_since: Option<Instant>,
    ) -> Result<InvokeResponse> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let queueing_ms = queued_since
            .map(|start| start.elapsed().as_millis() as u64)
            .unwrap_or(0);

        if self.disposable && metadata.debugger_tag.is_some() {
            if let Err(e) = self.delegate.inspector_start(&self.credential).await {
                self.request_settled();
                return Err(self.annotate(queueing_ms, e));
            }
        }

        match self.delegate.trigger(&self.credential, input, metadata).await {
            Ok(response) => {
                let (tx, rx) = oneshot::channel();
                let worker = Arc::clone(self);
                tokio::spawn(async move {
                    // Resolves on finish() or on response drop; either way
                    // the body is no longer being consumed.
                    let _ = rx.await;
                    worker.request_settled();
                });
                Ok(InvokeResponse::new(
                    response.data,
                    queueing_ms,
                    self.name.clone(),
                    tx,
                ))
            }
            Err(e) => {
                self.request_settled();
                Err(self.annotate(queueing_ms, e))
            }
        }
    }

    /// Stop admitting traffic and wait for in-flight requests to settle
    pub async fn close_traffic(self: &Arc<Self>) {
        self.traffic_off.store(true, Ordering::SeqCst);
        loop {
            let notified = self.down_to_zero.notified();
            if self.active_request_count() == 0 {
                break;
            }
            notified.await;
        }

        if !self.drain_reported.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                function = self.function_name,
                worker = self.name,
                "Worker drained"
            );
            self.events.broadcast_container_status(ContainerStatusReport {
                function_name: self.function_name.clone(),
                inspector: self.inspector,
                worker_name: self.name.clone(),
                event: ContainerEvent::RequestDrained,
            });
        }
    }

    fn annotate(&self, queueing_ms: u64, error: Error) -> Error {
        Error::Pipe {
            worker_name: self.name.clone(),
            queueing_ms,
            message: error.to_string(),
        }
    }

    /// Release one in-flight slot and re-drive the broker queue if the
    /// worker became free.
    fn request_settled(self: &Arc<Self>) {
        let updated = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_sub(1)
            });
        if updated.is_err() {
            tracing::warn!(worker = self.name, "Request settled on an idle worker");
            return;
        }

        if self.active_request_count() == 0 {
            self.down_to_zero.notify_waiters();
        }

        if self.is_free() {
            if let Some(broker) = self.broker.upgrade() {
                let worker = Arc::clone(self);
                tokio::spawn(async move {
                    broker.try_consume_queue(&worker).await;
                });
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("credential", &self.credential)
            .field("active", &self.active_request_count())
            .field("traffic_off", &self.traffic_off())
            .finish()
    }
}
