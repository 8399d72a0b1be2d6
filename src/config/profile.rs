//! Function profiles — per-function dispatch and scaling knobs

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Victim-selection strategy used when shrinking a worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShrinkStrategy {
    /// Oldest worker first (by register time)
    Fifo,
    /// Newest worker first (by register time)
    Filo,
    /// Least-concurrent worker first (by active request count)
    #[default]
    Lcc,
}

impl std::fmt::Display for ShrinkStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => write!(f, "FIFO"),
            Self::Filo => write!(f, "FILO"),
            Self::Lcc => write!(f, "LCC"),
        }
    }
}

impl ShrinkStrategy {
    /// Parse a strategy name from a profile value. Returns `None` for
    /// unrecognized names; the caller decides the fallback.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "FIFO" => Some(Self::Fifo),
            "FILO" => Some(Self::Filo),
            "LCC" => Some(Self::Lcc),
            _ => None,
        }
    }
}

/// Token bucket parameters for per-function admission control
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added on each refill tick
    #[serde(default = "default_tokens_per_fill")]
    pub tokens_per_fill: u64,

    /// Milliseconds between refill ticks
    #[serde(default = "default_fill_interval_ms")]
    pub fill_interval_ms: u64,

    /// Bucket capacity
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_fill: default_tokens_per_fill(),
            fill_interval_ms: default_fill_interval_ms(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Per-function dispatch profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionProfile {
    /// Function name
    pub name: String,

    /// Maximum concurrent requests per worker (default: 10).
    /// Disposable functions are always capped at 1 regardless of this value.
    #[serde(default = "default_max_activate_requests")]
    pub max_activate_requests: usize,

    /// Whether workers serve at most one request before draining
    #[serde(default)]
    pub disposable: bool,

    /// Optional token bucket admission control
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// When true, requests fail immediately instead of queueing
    #[serde(default)]
    pub disable_request_queue: bool,

    /// Deadline for worker runtime initialization (default: 10s)
    #[serde(default = "default_initialization_timeout_ms")]
    pub initialization_timeout_ms: u64,

    /// Default queue deadline applied when a request carries none (default: 60s)
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,

    /// Fail all queued requests when a worker launch fails, even non-fatally
    #[serde(default)]
    pub fast_fail_requests_on_starting: bool,

    /// Shrink strategy name; unknown values fall back to LCC with a warning
    #[serde(default)]
    pub shrink_strategy: Option<String>,

    /// Minimum worker count kept regardless of load
    #[serde(default)]
    pub reservation_count: usize,

    /// Memory charged against the global pool per worker, in MB (default: 512)
    #[serde(default = "default_worker_memory_limit_mb")]
    pub worker_memory_limit_mb: u64,
}

impl FunctionProfile {
    /// A profile with defaults for everything but the name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_activate_requests: default_max_activate_requests(),
            disposable: false,
            rate_limit: None,
            disable_request_queue: false,
            initialization_timeout_ms: default_initialization_timeout_ms(),
            default_request_timeout_ms: default_request_timeout_ms(),
            fast_fail_requests_on_starting: false,
            shrink_strategy: None,
            reservation_count: 0,
            worker_memory_limit_mb: default_worker_memory_limit_mb(),
        }
    }

    /// Effective per-worker concurrency cap
    pub fn worker_capacity(&self) -> usize {
        if self.disposable {
            1
        } else {
            self.max_activate_requests
        }
    }
}

fn default_max_activate_requests() -> usize {
    10
}

fn default_initialization_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_worker_memory_limit_mb() -> u64 {
    512
}

fn default_tokens_per_fill() -> u64 {
    1
}

fn default_fill_interval_ms() -> u64 {
    1_000
}

fn default_max_tokens() -> u64 {
    10
}

/// Validate a function profile
pub fn validate_profile(profile: &FunctionProfile) -> Result<()> {
    if profile.name.is_empty() {
        return Err(Error::Config("function profile requires a name".into()));
    }
    if profile.max_activate_requests == 0 {
        return Err(Error::Config(format!(
            "Function '{}': max_activate_requests must be >= 1",
            profile.name
        )));
    }
    if let Some(rl) = &profile.rate_limit {
        if rl.max_tokens == 0 {
            return Err(Error::Config(format!(
                "Function '{}': rate limit max_tokens must be >= 1",
                profile.name
            )));
        }
        if rl.fill_interval_ms == 0 {
            return Err(Error::Config(format!(
                "Function '{}': rate limit fill_interval_ms must be >= 1",
                profile.name
            )));
        }
    }
    if let Some(strategy) = &profile.shrink_strategy {
        if ShrinkStrategy::parse(strategy).is_none() {
            // Tolerated at runtime (falls back to LCC), but flagged here so
            // misconfigurations surface before deploy.
            tracing::warn!(
                function = profile.name,
                strategy,
                "Unknown shrink strategy in profile; LCC will be used"
            );
        }
    }
    Ok(())
}
