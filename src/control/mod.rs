//! Control module — autoscaling control plane
//!
//! Mirrors data-plane stats into per-broker views, computes expand/shrink
//! deltas under a global memory budget, and executes them through the
//! worker launcher and the data-plane client.

pub mod capacity;
pub mod client;
pub mod controller;
pub mod launcher;
pub mod reservation;
pub mod shrink;
pub mod state;

pub use capacity::{
    CapacityManager, DefaultCapacityManager, MockCapacityManager, ScaleDelta, ScaleDeltas,
};
pub use client::{CapacityReduction, DataPlaneClient, MockDataPlaneClient, WorkerHandle};
pub use controller::DefaultController;
pub use launcher::{LaunchReason, MockLauncher, WorkerLauncher, WorkerMetadata};
pub use reservation::ReservationController;
pub use shrink::{resolve_strategy, shrink_draw};
pub use state::{BrokerKey, BrokerView, StateManager, WorkerRecord, WorkerRecordStatus};
