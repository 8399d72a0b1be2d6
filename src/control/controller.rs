//! Default controller — reacts to queue pressure and traffic stats
//!
//! Subscribes to `RequestQueueing` and `WorkerTrafficStats` events. Queue
//! pressure launches one worker (budget permitting); each stats cycle runs
//! an autoscale pass that expands and shrinks pools through the launcher
//! and the data-plane client.

use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::capacity::{CapacityManager, ScaleDelta};
use super::client::{CapacityReduction, DataPlaneClient, WorkerHandle};
use super::launcher::{LaunchReason, WorkerLauncher, WorkerMetadata};
use super::reservation::ReservationController;
use super::shrink::{resolve_strategy, shrink_draw};
use super::state::{BrokerView, StateManager};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::events::{
    ControlEvent, LaunchFailure, RequestQueueingEvent, WorkerTrafficStatsEvent,
};

/// Event-driven autoscaler for all function pools
pub struct DefaultController {
    state: Arc<StateManager>,
    capacity: Arc<dyn CapacityManager>,
    launcher: Arc<dyn WorkerLauncher>,
    data_plane: Arc<dyn DataPlaneClient>,
    reservation: ReservationController,
    config: ControllerConfig,
    /// Single-flight guard; concurrent shrink entries are dropped
    shrinking: AtomicBool,
}

impl DefaultController {
    pub fn new(
        state: Arc<StateManager>,
        capacity: Arc<dyn CapacityManager>,
        launcher: Arc<dyn WorkerLauncher>,
        data_plane: Arc<dyn DataPlaneClient>,
        config: ControllerConfig,
    ) -> Self {
        let reservation = ReservationController::new(Arc::clone(&launcher), Arc::clone(&state));
        Self {
            state,
            capacity,
            launcher,
            data_plane,
            reservation,
            config,
            shrinking: AtomicBool::new(false),
        }
    }

    /// Consume control events until the channel closes
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ControlEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ControlEvent::RequestQueueing(event) => {
                    if let Err(e) = self.on_request_queueing(event).await {
                        tracing::warn!(error = %e, "Request queueing handler failed");
                    }
                }
                ControlEvent::WorkerTrafficStats(event) => {
                    if let Err(e) = self.on_worker_traffic_stats(event).await {
                        tracing::warn!(error = %e, "Autoscale pass failed");
                    }
                }
                ControlEvent::ContainerStatusReport(report) => {
                    tracing::debug!(
                        function = report.function_name,
                        worker = report.worker_name,
                        event = %report.event,
                        "Container status report"
                    );
                }
            }
        }
        tracing::info!("Control event channel closed; controller stopping");
    }

    /// Queue pressure: launch one worker for the pressured function
    pub async fn on_request_queueing(&self, event: RequestQueueingEvent) -> Result<()> {
        if !self.capacity.allow_expanding_on_request_queueing(&event) {
            return Ok(());
        }

        let profile = self
            .state
            .get_profile(&event.function_name)
            .ok_or_else(|| Error::NoFunction(event.function_name.clone()))?;

        let metadata = WorkerMetadata {
            function_name: event.function_name.clone(),
            inspect: false,
            disposable: profile.disposable,
            to_reserve: false,
        };
        if let Err(e) = self
            .launcher
            .try_launch(LaunchReason::RequestQueueExpand, &metadata)
            .await
        {
            tracing::warn!(
                function = event.function_name,
                error = %e,
                "Worker launch failed on queueing pressure"
            );
            let failure = LaunchFailure {
                function_name: event.function_name.clone(),
                fatal: e.is_fatal_launch(),
                message: e.to_string(),
            };
            if let Err(notify_err) = self.data_plane.start_worker_fast_fail(&failure).await {
                tracing::debug!(error = %notify_err, "Fast-fail notification failed");
            }
        }

        // Best-effort reconciliation from the stats piggybacked on the event
        self.state.sync_worker_data(&event.stats);
        Ok(())
    }

    /// Stats cycle: reconcile state, then autoscale
    pub async fn on_worker_traffic_stats(&self, event: WorkerTrafficStatsEvent) -> Result<()> {
        self.state.sync_worker_data(&event.brokers);
        self.auto_scale().await
    }

    /// One autoscale pass: evaluate deltas, then shrink and expand.
    ///
    /// Shrink runs under the single-flight guard; regular and reservation
    /// expansion run concurrently with it. The first phase error is
    /// re-thrown after every phase has completed.
    pub async fn auto_scale(&self) -> Result<()> {
        let views = self.state.views();
        let deltas = self.capacity.evaluate_scale_deltas(&views);

        let mut regular = Vec::new();
        let mut reservation = Vec::new();
        for delta in deltas.expand {
            let below_floor = find_view(&views, &delta)
                .map(|view| view.worker_count() < view.reservation_count)
                .unwrap_or(false);
            if below_floor {
                reservation.push(delta);
            } else {
                regular.push(delta);
            }
        }

        let (shrink_result, expand_result, reservation_result) = tokio::join!(
            self.shrink(deltas.shrink, &views),
            self.expand(regular),
            self.reservation.expand(reservation),
        );
        shrink_result?;
        expand_result?;
        reservation_result?;
        Ok(())
    }

    /// Launch workers for every positive delta. The first launch error is
    /// reported after all deltas were attempted.
    async fn expand(&self, deltas: Vec<ScaleDelta>) -> Result<()> {
        let mut first_error = None;
        for delta in deltas {
            if delta.count <= 0 {
                continue;
            }
            let Some(profile) = self.state.get_profile(&delta.function_name) else {
                tracing::warn!(
                    function = delta.function_name,
                    "Expand delta for unknown function; skipping"
                );
                continue;
            };
            let metadata = WorkerMetadata {
                function_name: delta.function_name.clone(),
                inspect: delta.inspector,
                disposable: profile.disposable,
                to_reserve: false,
            };
            tracing::info!(
                function = delta.function_name,
                count = delta.count,
                "Expanding worker pool"
            );
            for _ in 0..delta.count {
                if let Err(e) = self
                    .launcher
                    .try_launch(LaunchReason::AutoScale, &metadata)
                    .await
                {
                    tracing::warn!(
                        function = delta.function_name,
                        error = %e,
                        "Worker launch failed during expansion"
                    );
                    first_error.get_or_insert(e);
                    break;
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain and stop shrink victims.
    ///
    /// Guarded by a test-and-set: a concurrent entry is dropped, not queued;
    /// the next stats cycle retries. Inspector and disposable brokers are
    /// never shrunk here.
    async fn shrink(&self, deltas: Vec<ScaleDelta>, views: &[BrokerView]) -> Result<()> {
        if self
            .shrinking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Shrink already in flight; dropping this cycle");
            return Ok(());
        }
        let result = self.shrink_inner(deltas, views).await;
        self.shrinking.store(false, Ordering::SeqCst);
        result
    }

    async fn shrink_inner(&self, deltas: Vec<ScaleDelta>, views: &[BrokerView]) -> Result<()> {
        let mut batch = Vec::new();
        for delta in &deltas {
            if delta.count >= 0 {
                continue;
            }
            let Some(view) = find_view(views, delta) else {
                continue;
            };
            if view.inspector || view.disposable {
                continue;
            }
            let strategy =
                resolve_strategy(view.shrink_strategy.as_deref(), self.config.default_shrink_strategy);
            let victims = shrink_draw(view, (-delta.count) as usize, strategy);
            if victims.is_empty() {
                continue;
            }
            tracing::info!(
                function = view.function_name,
                count = victims.len(),
                strategy = %strategy,
                "Shrinking worker pool"
            );
            batch.push(CapacityReduction {
                function_name: view.function_name.clone(),
                inspector: view.inspector,
                workers: victims
                    .into_iter()
                    .map(|record| WorkerHandle {
                        name: record.name,
                        credential: record.credential,
                    })
                    .collect(),
            });
        }
        if batch.is_empty() {
            return Ok(());
        }

        // One batched drain request; the data plane answers with the subset
        // it actually drained.
        let drained = self.data_plane.reduce_capacity(batch).await?;

        let mut stops = Vec::new();
        for reduction in drained {
            let CapacityReduction {
                function_name,
                inspector,
                workers,
            } = reduction;
            for worker in workers {
                let WorkerHandle { name, credential } = worker;
                if self
                    .state
                    .mark_worker_shrink(&function_name, inspector, &name, &credential)
                {
                    let launcher = Arc::clone(&self.launcher);
                    let function_name = function_name.clone();
                    stops.push(async move { launcher.stop_worker(&function_name, &name).await });
                } else {
                    tracing::warn!(
                        function = function_name,
                        worker = name,
                        "Credential changed since shrink draw; skipping stop"
                    );
                }
            }
        }

        let results = join_all(stops).await;
        results
            .into_iter()
            .find(|result| result.is_err())
            .unwrap_or(Ok(()))
    }
}

fn find_view<'a>(views: &'a [BrokerView], delta: &ScaleDelta) -> Option<&'a BrokerView> {
    views
        .iter()
        .find(|view| view.function_name == delta.function_name && view.inspector == delta.inspector)
}
