//! Configuration — function profiles and control-plane tuning

mod controller;
mod profile;

pub use controller::{validate_capacity, CapacityConfig, ControllerConfig};
pub use profile::{
    validate_profile, FunctionProfile, RateLimitConfig, ShrinkStrategy,
};
