//! Reservation controller — holds per-function capacity floors
//!
//! Only the expansion interface lives here; the floor policy itself is
//! the capacity manager's concern.

use std::sync::Arc;

use super::capacity::ScaleDelta;
use super::launcher::{LaunchReason, WorkerLauncher, WorkerMetadata};
use super::state::StateManager;
use crate::error::Result;

/// Launches workers for brokers below their reservation floor
pub struct ReservationController {
    launcher: Arc<dyn WorkerLauncher>,
    state: Arc<StateManager>,
}

impl ReservationController {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, state: Arc<StateManager>) -> Self {
        Self { launcher, state }
    }

    /// Launch `count` reserved workers per delta. The first launch error is
    /// reported after all deltas were attempted.
    pub async fn expand(&self, deltas: Vec<ScaleDelta>) -> Result<()> {
        let mut first_error = None;
        for delta in deltas {
            if delta.count <= 0 {
                continue;
            }
            let disposable = self
                .state
                .get_profile(&delta.function_name)
                .map(|profile| profile.disposable)
                .unwrap_or(false);
            let metadata = WorkerMetadata {
                function_name: delta.function_name.clone(),
                inspect: delta.inspector,
                disposable,
                to_reserve: true,
            };
            tracing::info!(
                function = delta.function_name,
                count = delta.count,
                "Expanding reserved workers"
            );
            for _ in 0..delta.count {
                if let Err(e) = self
                    .launcher
                    .try_launch(LaunchReason::Reservation, &metadata)
                    .await
                {
                    tracing::warn!(
                        function = delta.function_name,
                        error = %e,
                        "Reserved worker launch failed"
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
}
