//! Environment-driven configuration (spec §6's configuration table).
//!
//! Mirrors the teacher's `config.rs` shape (a single typed struct with
//! `#[serde(default = "...")]` fields) but sources values from the process
//! environment instead of a TOML file, per spec §6.

use serde::{Deserialize, Serialize};
use std::env::VarError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identifier of the ASG to control.
    pub asg_name: String,
    /// Upper bound on `desiredCapacity`.
    #[serde(default = "default_max_instances")]
    pub max_instances: i32,
    /// Headroom added to `active_users`.
    #[serde(default = "default_warm_spare_target")]
    pub warm_spare_target: i32,
    /// Reaper threshold (ms) for marking a user idle.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: i64,
    /// Reaper tick period (ms).
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Lifecycle-launch readiness polling: attempt count.
    #[serde(default = "default_readiness_max_attempts")]
    pub readiness_max_attempts: u32,
    /// Lifecycle-launch readiness polling: spacing between attempts (ms).
    #[serde(default = "default_readiness_backoff_ms")]
    pub readiness_backoff_ms: u64,
    /// Allocation request deadline (ms).
    #[serde(default = "default_allocation_timeout_ms")]
    pub allocation_timeout_ms: u64,
    /// Redis connection URL for the State Store.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Address the HTTP surface binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Bounds how many idle users a single reaper tick processes.
    #[serde(default = "default_reaper_batch_size")]
    pub reaper_batch_size: usize,
}

fn default_max_instances() -> i32 {
    50
}
fn default_warm_spare_target() -> i32 {
    2
}
fn default_idle_timeout_ms() -> i64 {
    300_000
}
fn default_cleanup_interval_ms() -> u64 {
    60_000
}
fn default_readiness_max_attempts() -> u32 {
    3
}
fn default_readiness_backoff_ms() -> u64 {
    60_000
}
fn default_allocation_timeout_ms() -> u64 {
    30_000
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_reaper_batch_size() -> usize {
    100
}

impl Config {
    /// Load configuration from the process environment. `ASG_NAME` is the
    /// only required variable; everything else falls back to the spec's
    /// documented defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let asg_name = require_var("ASG_NAME")?;

        Ok(Self {
            asg_name,
            max_instances: parse_var("MAX_INSTANCES", default_max_instances())?,
            warm_spare_target: parse_var("WARM_SPARE_TARGET", default_warm_spare_target())?,
            idle_timeout_ms: parse_var("IDLE_TIMEOUT_MS", default_idle_timeout_ms())?,
            cleanup_interval_ms: parse_var("CLEANUP_INTERVAL_MS", default_cleanup_interval_ms())?,
            readiness_max_attempts: parse_var(
                "READINESS_MAX_ATTEMPTS",
                default_readiness_max_attempts(),
            )?,
            readiness_backoff_ms: parse_var("READINESS_BACKOFF_MS", default_readiness_backoff_ms())?,
            allocation_timeout_ms: parse_var(
                "ALLOCATION_TIMEOUT_MS",
                default_allocation_timeout_ms(),
            )?,
            redis_url: optional_var("REDIS_URL", default_redis_url()),
            bind_addr: optional_var("BIND_ADDR", default_bind_addr()),
            reaper_batch_size: parse_var("REAPER_BATCH_SIZE", default_reaper_batch_size())?,
        })
    }

    /// A config suitable for tests: fixed values, no environment access.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_test() -> Self {
        Self {
            asg_name: "test-asg".to_string(),
            max_instances: default_max_instances(),
            warm_spare_target: default_warm_spare_target(),
            idle_timeout_ms: default_idle_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            readiness_max_attempts: default_readiness_max_attempts(),
            readiness_backoff_ms: default_readiness_backoff_ms(),
            allocation_timeout_ms: default_allocation_timeout_ms(),
            redis_url: default_redis_url(),
            bind_addr: default_bind_addr(),
            reaper_batch_size: default_reaper_batch_size(),
        }
    }
}

fn require_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("missing required environment variable {name}"))
}

fn optional_var(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}")),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => {
            anyhow::bail!("environment variable {name} is not valid unicode")
        }
    }
}
