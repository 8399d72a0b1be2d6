//! Worker broker — per-function request dispatcher
//!
//! Owns the worker set for one function, admits requests through an
//! optional token bucket, routes to the least-loaded worker, and parks
//! overflow in a FIFO pending queue with per-request deadlines. Worker
//! lifecycle runs register → bind → serve → drain.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use super::delegate::{Delegate, RequestMetadata};
use super::pending::{epoch_ms, PendingRequest};
use super::token_bucket::TokenBucket;
use super::worker::{InvokeResponse, Worker};
use crate::config::FunctionProfile;
use crate::error::{Error, Result};
use crate::events::{
    BrokerSnapshot, ContainerEvent, ContainerStatusReport, EventBus, LaunchFailure,
    RequestQueueingEvent,
};
use crate::observability::DispatchMetrics;

/// Queue mode of a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Requests dispatch directly to a free worker
    PassThrough,
    /// Requests park in the pending queue until a worker frees up
    Queueing,
}

/// Registration state of a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialStatus {
    /// Credential registered, worker process not yet initialized
    Pending,
    /// Initialization succeeded, worker is eligible for traffic
    Bound,
}

struct WorkerItem {
    status: CredentialStatus,
    name: String,
    worker: Option<Arc<Worker>>,
}

/// Per-worker stats exposed to monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub name: String,
    pub active_request_count: usize,
}

/// Broker stats exposed to monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub function_name: String,
    pub inspector: bool,
    pub workers: Vec<WorkerStats>,
}

struct BrokerInner {
    queue: VecDeque<PendingRequest>,
    queue_status: QueueStatus,
    workers: HashMap<String, WorkerItem>,
}

enum Admission {
    Dispatch(Arc<Worker>, Bytes, RequestMetadata),
    Wait(oneshot::Receiver<Result<InvokeResponse>>),
}

/// Per-function dispatcher owning a pool of workers and a pending queue
pub struct WorkerBroker {
    name: String,
    inspector: bool,
    profile: FunctionProfile,
    delegate: Arc<dyn Delegate>,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    token_bucket: Option<TokenBucket>,
    ready: watch::Sender<bool>,
    next_pending_id: AtomicU64,
    inner: Mutex<BrokerInner>,
}

impl WorkerBroker {
    /// Create a broker for one function. Call [`start`](Self::start) before
    /// invoking.
    pub fn new(
        profile: FunctionProfile,
        inspector: bool,
        delegate: Arc<dyn Delegate>,
        events: EventBus,
        metrics: Arc<DispatchMetrics>,
    ) -> Arc<Self> {
        let token_bucket = profile.rate_limit.as_ref().map(TokenBucket::new);
        let (ready, _) = watch::channel(false);
        Arc::new(Self {
            name: profile.name.clone(),
            inspector,
            profile,
            delegate,
            events,
            metrics,
            token_bucket,
            ready,
            next_pending_id: AtomicU64::new(0),
            inner: Mutex::new(BrokerInner {
                queue: VecDeque::new(),
                queue_status: QueueStatus::PassThrough,
                workers: HashMap::new(),
            }),
        })
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this broker serves debugger sessions
    pub fn inspector(&self) -> bool {
        self.inspector
    }

    /// The dispatch profile
    pub fn profile(&self) -> &FunctionProfile {
        &self.profile
    }

    /// Effective per-worker concurrency cap; disposable brokers cap at 1
    pub fn max_activate_requests(&self) -> usize {
        self.profile.worker_capacity()
    }

    /// Start the broker: begins token refill and unblocks waiting invokes
    pub fn start(&self) {
        if let Some(bucket) = &self.token_bucket {
            bucket.start();
        }
        self.ready.send_replace(true);
        tracing::info!(function = self.name, "Broker started");
    }

    /// Stop the token bucket refill task
    pub fn close(&self) {
        if let Some(bucket) = &self.token_bucket {
            bucket.close();
        }
    }

    /// Whether `start` has been called
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Requests currently parked in the pending queue
    pub fn queue_length(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Current queue mode
    pub fn queue_status(&self) -> QueueStatus {
        self.inner.lock().unwrap().queue_status
    }

    /// Number of bound workers
    pub fn worker_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .workers
            .values()
            .filter(|item| item.status == CredentialStatus::Bound)
            .count()
    }

    // -----------------------------------------------------------------------
    // Invocation path
    // -----------------------------------------------------------------------

    /// Dispatch one invocation.
    ///
    /// Waits for broker readiness, applies rate limiting, then either pipes
    /// straight to a free worker or parks in the pending queue until one
    /// frees up or the deadline passes.
    pub async fn invoke(
        self: &Arc<Self>,
        input: Bytes,
        metadata: RequestMetadata,
    ) -> Result<InvokeResponse> {
        self.wait_ready().await?;

        if let Some(bucket) = &self.token_bucket {
            if !bucket.acquire() {
                return Err(Error::ResourceExhausted(self.name.clone()));
            }
        }

        let admission = {
            let mut inner = self.inner.lock().unwrap();
            match inner.queue_status {
                QueueStatus::Queueing => Admission::Wait(self.enqueue(&mut inner, input, metadata)?),
                QueueStatus::PassThrough => match self.select_worker(&inner) {
                    Some(worker) => Admission::Dispatch(worker, input, metadata),
                    None => Admission::Wait(self.enqueue(&mut inner, input, metadata)?),
                },
            }
        };

        match admission {
            Admission::Dispatch(worker, input, metadata) => {
                let result = worker.pipe(input, &metadata, None).await;
                if self.profile.disposable {
                    let w = Arc::clone(&worker);
                    tokio::spawn(async move { w.close_traffic().await });
                }
                result
            }
            Admission::Wait(rx) => rx
                .await
                .map_err(|_| Error::Other("pending request dropped by broker".into()))?,
        }
    }

    /// Park a request in the pending queue and arm its deadline timer.
    /// Broadcasts `RequestQueueing` in both the parked and the
    /// queueing-disabled case.
    fn enqueue(
        self: &Arc<Self>,
        inner: &mut BrokerInner,
        input: Bytes,
        metadata: RequestMetadata,
    ) -> Result<oneshot::Receiver<Result<InvokeResponse>>> {
        let request_id = metadata
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if self.profile.disable_request_queue {
            self.events
                .broadcast_request_queueing(self.queueing_event(inner, request_id));
            return Err(Error::NoAvailableWorker(self.name.clone()));
        }

        inner.queue_status = QueueStatus::Queueing;

        let id = self.next_pending_id.fetch_add(1, Ordering::SeqCst);
        let deadline_ms = metadata
            .deadline_ms
            .unwrap_or_else(|| epoch_ms() + self.profile.default_request_timeout_ms);
        let (mut pending, rx) = PendingRequest::new(id, request_id.clone(), input, metadata);

        let delay = Duration::from_millis(deadline_ms.saturating_sub(epoch_ms()));
        let broker = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(broker) = broker.upgrade() {
                broker.expire_pending(id);
            }
        });
        pending.set_timer(timer.abort_handle());

        tracing::debug!(
            function = self.name,
            request = request_id,
            queue_length = inner.queue.len() + 1,
            "Request queued"
        );
        inner.queue.push_back(pending);
        self.metrics.record_queued(&self.name);
        self.events
            .broadcast_request_queueing(self.queueing_event(inner, request_id));

        Ok(rx)
    }

    /// Deadline timer fired for one pending entry
    fn expire_pending(&self, id: u64) {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            let entry = inner
                .queue
                .iter()
                .position(|p| p.id == id && p.available)
                .and_then(|position| inner.queue.remove(position))
                .map(|mut entry| {
                    entry.available = false;
                    entry
                });
            if entry.is_some() && inner.queue.is_empty() {
                inner.queue_status = QueueStatus::PassThrough;
            }
            entry
        };

        if let Some(entry) = entry {
            tracing::debug!(
                function = self.name,
                request = entry.request_id,
                "Queued request deadline exceeded"
            );
            let waited = entry.wait_ms();
            let waited = entry.reject(Error::DeadlineExceeded {
                function_name: self.name.clone(),
                waited_ms: waited,
            });
            self.metrics.record_queue_wait(&self.name, waited);
        }
    }

    /// Drain the pending queue onto a worker that just became free.
    ///
    /// Disposable brokers consume at most one entry, then drain the worker.
    pub async fn try_consume_queue(&self, worker: &Arc<Worker>) {
        loop {
            let entry = {
                let mut inner = self.inner.lock().unwrap();
                if inner.queue.is_empty() {
                    inner.queue_status = QueueStatus::PassThrough;
                    return;
                }
                if !worker.is_free() {
                    return;
                }
                let entry = match inner.queue.pop_front() {
                    Some(entry) => entry,
                    None => return,
                };
                if inner.queue.is_empty() {
                    inner.queue_status = QueueStatus::PassThrough;
                }
                entry
            };

            // Entries evicted by timeout or fast-fail never reach here, but
            // the claim check keeps the dispatch-vs-timeout race harmless.
            if !entry.available {
                continue;
            }

            let (input, metadata, queued_at, responder) = entry.into_dispatch();
            let result = worker.pipe(input, &metadata, Some(queued_at)).await;
            self.metrics
                .record_queue_wait(&self.name, queued_at.elapsed().as_millis() as u64);
            if responder.send(result).is_err() {
                tracing::debug!(
                    function = self.name,
                    "Queued caller went away before dispatch completed"
                );
            }

            if self.profile.disposable {
                let w = Arc::clone(worker);
                tokio::spawn(async move { w.close_traffic().await });
                return;
            }
        }
    }

    /// Least-loaded selection among bound workers that accept traffic.
    /// Ties break on worker name.
    fn select_worker(&self, inner: &BrokerInner) -> Option<Arc<Worker>> {
        let candidate = inner
            .workers
            .values()
            .filter_map(|item| item.worker.as_ref())
            .filter(|worker| !worker.traffic_off())
            .min_by(|a, b| {
                (a.active_request_count(), a.name()).cmp(&(b.active_request_count(), b.name()))
            })?;

        if candidate.active_request_count() >= self.max_activate_requests() {
            return None;
        }
        Some(Arc::clone(candidate))
    }

    // -----------------------------------------------------------------------
    // Credential lifecycle
    // -----------------------------------------------------------------------

    /// Register a launched worker's credential ahead of initialization
    pub fn register_credential(&self, worker_name: &str, credential: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.workers.contains_key(credential) {
            return Err(Error::DuplicateCredential {
                function_name: self.name.clone(),
                credential: credential.to_string(),
            });
        }
        inner.workers.insert(
            credential.to_string(),
            WorkerItem {
                status: CredentialStatus::Pending,
                name: worker_name.to_string(),
                worker: None,
            },
        );
        tracing::debug!(
            function = self.name,
            worker = worker_name,
            credential,
            "Credential registered"
        );
        Ok(())
    }

    /// Initialize a pending worker and open it for traffic.
    ///
    /// On init failure the peer is reset and the credential stays pending;
    /// the caller is expected to follow up with `remove_worker`.
    pub async fn bind_worker(self: &Arc<Self>, credential: &str) -> Result<Arc<Worker>> {
        {
            let inner = self.inner.lock().unwrap();
            match inner.workers.get(credential) {
                None => {
                    return Err(Error::WorkerNotFound {
                        function_name: self.name.clone(),
                        credential: credential.to_string(),
                    })
                }
                Some(item) if item.status == CredentialStatus::Bound => {
                    return Err(Error::CredentialNotPending {
                        function_name: self.name.clone(),
                        credential: credential.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.profile.initialization_timeout_ms);
        if let Err(e) = self.delegate.init(credential, deadline).await {
            tracing::warn!(
                function = self.name,
                credential,
                error = %e,
                "Worker init failed; resetting peer"
            );
            if let Err(reset_err) = self.delegate.reset_peer(credential).await {
                tracing::warn!(credential, error = %reset_err, "Peer reset failed");
            }
            return Err(e);
        }

        let worker = {
            let mut inner = self.inner.lock().unwrap();
            let max_activate_requests = self.max_activate_requests();
            let item = inner.workers.get_mut(credential).ok_or_else(|| {
                Error::WorkerNotFound {
                    function_name: self.name.clone(),
                    credential: credential.to_string(),
                }
            })?;
            if item.status == CredentialStatus::Bound {
                return Err(Error::CredentialNotPending {
                    function_name: self.name.clone(),
                    credential: credential.to_string(),
                });
            }
            let worker = Worker::new(
                item.name.clone(),
                credential,
                self.name.clone(),
                self.inspector,
                self.profile.disposable,
                max_activate_requests,
                Arc::clone(&self.delegate),
                Arc::downgrade(self),
                self.events.clone(),
            );
            item.status = CredentialStatus::Bound;
            item.worker = Some(Arc::clone(&worker));
            worker
        };

        tracing::info!(function = self.name, worker = worker.name(), "Worker bound");
        self.events.broadcast_container_status(ContainerStatusReport {
            function_name: self.name.clone(),
            inspector: self.inspector,
            worker_name: worker.name().to_string(),
            event: ContainerEvent::ContainerInstalled,
        });

        self.try_consume_queue(&worker).await;
        Ok(worker)
    }

    /// Drop a credential and its worker. Does not await in-flight requests;
    /// watchers holding the worker settle their counters independently.
    pub fn remove_worker(&self, credential: &str) -> Result<()> {
        let removed = self.inner.lock().unwrap().workers.remove(credential);
        match removed {
            Some(item) => {
                tracing::debug!(
                    function = self.name,
                    worker = item.name,
                    credential,
                    "Worker removed"
                );
                Ok(())
            }
            None => Err(Error::WorkerNotFound {
                function_name: self.name.clone(),
                credential: credential.to_string(),
            }),
        }
    }

    /// Fail every queued request after a worker start error.
    ///
    /// No-op unless the failure is fatal or the profile opts in.
    pub fn fast_fail_all_pendings_due_to_start_error(&self, failure: &LaunchFailure) {
        if !(failure.fatal || self.profile.fast_fail_requests_on_starting) {
            return;
        }

        let drained: VecDeque<PendingRequest> = {
            let mut inner = self.inner.lock().unwrap();
            inner.queue_status = QueueStatus::PassThrough;
            std::mem::take(&mut inner.queue)
        };
        if drained.is_empty() {
            return;
        }

        tracing::warn!(
            function = self.name,
            count = drained.len(),
            "Fast-failing queued requests after worker start error"
        );
        for entry in drained {
            let waited = entry.reject(Error::FastFail(failure.message.clone()));
            self.metrics.record_queue_wait(&self.name, waited);
        }
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    /// Data-plane stats for the control plane
    pub fn snapshot(&self) -> BrokerSnapshot {
        let inner = self.inner.lock().unwrap();
        self.snapshot_inner(&inner)
    }

    /// Monitoring stats (`{functionName, inspector, workers}`)
    pub fn stats(&self) -> BrokerStats {
        let inner = self.inner.lock().unwrap();
        BrokerStats {
            function_name: self.name.clone(),
            inspector: self.inspector,
            workers: inner
                .workers
                .values()
                .filter_map(|item| item.worker.as_ref())
                .map(|worker| WorkerStats {
                    name: worker.name().to_string(),
                    active_request_count: worker.active_request_count(),
                })
                .collect(),
        }
    }

    fn snapshot_inner(&self, inner: &BrokerInner) -> BrokerSnapshot {
        BrokerSnapshot {
            function_name: self.name.clone(),
            inspector: self.inspector,
            disposable: self.profile.disposable,
            queued_requests: inner.queue.len(),
            workers: inner
                .workers
                .values()
                .filter_map(|item| item.worker.as_ref())
                .map(|worker| worker.snapshot())
                .collect(),
        }
    }

    fn queueing_event(&self, inner: &BrokerInner, request_id: String) -> RequestQueueingEvent {
        RequestQueueingEvent {
            function_name: self.name.clone(),
            inspector: self.inspector,
            request_id,
            stats: vec![self.snapshot_inner(inner)],
        }
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| Error::Other("broker closed before becoming ready".into()))?;
        Ok(())
    }
}

impl Drop for WorkerBroker {
    fn drop(&mut self) {
        self.close();
    }
}
