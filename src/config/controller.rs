//! Control-plane configuration — capacity budget and scaling cadence

use serde::{Deserialize, Serialize};

use super::ShrinkStrategy;
use crate::error::{Error, Result};

/// Global capacity budget and scaling formula tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Total virtual memory pool shared by all worker pools, in MB (default: 8192)
    #[serde(default = "default_virtual_memory_pool_size_mb")]
    pub virtual_memory_pool_size_mb: u64,

    /// Memory charged per worker when a profile does not say, in MB (default: 512)
    #[serde(default = "default_worker_memory_limit_mb")]
    pub default_worker_memory_limit_mb: u64,

    /// Fraction of per-worker capacity targeted before expanding (default: 0.7)
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,

    /// Consecutive idle stats cycles before a pool becomes shrink-eligible (default: 6)
    #[serde(default = "default_redundant_times_threshold")]
    pub redundant_times_threshold: u32,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            virtual_memory_pool_size_mb: default_virtual_memory_pool_size_mb(),
            default_worker_memory_limit_mb: default_worker_memory_limit_mb(),
            scale_factor: default_scale_factor(),
            redundant_times_threshold: default_redundant_times_threshold(),
        }
    }
}

/// Default controller behavior
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerConfig {
    /// Shrink strategy used when a profile names none
    #[serde(default)]
    pub default_shrink_strategy: ShrinkStrategy,
}

fn default_virtual_memory_pool_size_mb() -> u64 {
    8 * 1024
}

fn default_worker_memory_limit_mb() -> u64 {
    512
}

fn default_scale_factor() -> f64 {
    0.7
}

fn default_redundant_times_threshold() -> u32 {
    6
}

/// Validate capacity configuration
pub fn validate_capacity(config: &CapacityConfig) -> Result<()> {
    if config.scale_factor <= 0.0 || config.scale_factor > 1.0 {
        return Err(Error::Config(format!(
            "scale_factor ({}) must be in (0.0, 1.0]",
            config.scale_factor
        )));
    }
    if config.default_worker_memory_limit_mb == 0 {
        return Err(Error::Config(
            "default_worker_memory_limit_mb must be >= 1".into(),
        ));
    }
    Ok(())
}
