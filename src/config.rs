//! Engine configuration: required/optional environment variables (spec §6)
//! plus the fixed tunables named throughout spec.md (§4.7, §4.8, §4.9).

use std::time::Duration;

/// Env var holding the local memory budget in bytes. Required; its absence
/// disables the engine entirely (spec.md §6).
pub const ENV_LOCAL_MEMORY: &str = "LOCAL_MEMORY";

/// Env var holding the eviction watermark as a fraction in `(0, 1]`.
/// Optional, defaults to [`DEFAULT_EVICTION_THRESHOLD`].
pub const ENV_EVICTION_THRESHOLD: &str = "EVICTION_THRESHOLD";

pub const DEFAULT_EVICTION_THRESHOLD: f64 = 0.95;

/// `CHUNK_SIZE` / `CHUNK_SHIFT` — the page granularity the whole engine
/// operates on (spec.md §8: "CHUNK_SIZE = 4096").
pub const CHUNK_SIZE: usize = 4096;
pub const CHUNK_SHIFT: u32 = 12;
pub const CHUNK_MASK: usize = CHUNK_SIZE - 1;

/// `MAX_REGIONS` (spec.md §4.2 invariant).
pub const MAX_REGIONS: usize = 1;

/// Backend channel bound (spec.md §4.3), matching the original
/// implementation's `RMEM_MAX_CHANNELS`.
pub const MAX_CHANNELS: usize = 32;

/// Per-operation chunk bound (spec.md §4.3 / §4.7), matching the original
/// implementation's `RMEM_MAX_CHUNKS_PER_OP`.
pub const MAX_CHUNKS_PER_OP: usize = 64;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("{} is not set; remote-memory engine disabled", ENV_LOCAL_MEMORY)]
    Disabled,
    #[error("{0} could not be parsed: {1}")]
    InvalidValue(&'static str, String),
    #[error("{0} must be in (0, 1], got {1}")]
    OutOfRange(&'static str, f64),
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local memory budget, in bytes (`LOCAL_MEMORY`).
    pub local_memory: u64,
    /// Eviction watermark as a fraction of `local_memory` (`EVICTION_THRESHOLD`).
    pub eviction_threshold: f64,
    /// `BATCH_MAX` — maximum pages per eviction batch (spec.md §4.7).
    pub batch_max: usize,
    /// `COMPL_PER_OP` — completions drained per handler iteration (spec.md §4.7).
    pub compl_per_op: usize,
    /// `BUMPS_PER_OP` — bound on eviction batches driven per handler iteration
    /// before giving up for this loop turn (spec.md §4.7).
    pub bumps_per_op: usize,
    /// `TLB_FLUSH_MIN` — minimum batch size before a single range
    /// write-protect/zap is used instead of per-page operations (spec.md §4.8).
    pub tlb_flush_min: usize,
    /// `WAIT_BEFORE_STEAL` — how long a fault waits before completion
    /// stealing is attempted on its blocker (spec.md §4.6/§4.9).
    pub wait_before_steal: Duration,
}

impl Config {
    /// Reads [`ENV_LOCAL_MEMORY`] and [`ENV_EVICTION_THRESHOLD`], applying
    /// the other tunables' spec-given defaults (each independently
    /// overridable by its own `RMEM_*` variable, for test tuning).
    pub fn from_env() -> Result<Self, ConfigError> {
        let local_memory = match std::env::var(ENV_LOCAL_MEMORY) {
            Ok(v) => v
                .parse::<u64>()
                .map_err(|e| ConfigError::InvalidValue(ENV_LOCAL_MEMORY, e.to_string()))?,
            Err(_) => return Err(ConfigError::Disabled),
        };

        let eviction_threshold = match std::env::var(ENV_EVICTION_THRESHOLD) {
            Ok(v) => v
                .parse::<f64>()
                .map_err(|e| ConfigError::InvalidValue(ENV_EVICTION_THRESHOLD, e.to_string()))?,
            Err(_) => DEFAULT_EVICTION_THRESHOLD,
        };
        if !(eviction_threshold > 0.0 && eviction_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange(
                ENV_EVICTION_THRESHOLD,
                eviction_threshold,
            ));
        }

        Ok(Config {
            local_memory,
            eviction_threshold,
            batch_max: env_usize("RMEM_BATCH_MAX", 64),
            compl_per_op: env_usize("RMEM_COMPL_PER_OP", 16),
            bumps_per_op: env_usize("RMEM_BUMPS_PER_OP", 5 * 64),
            tlb_flush_min: env_usize("RMEM_TLB_FLUSH_MIN", 2),
            wait_before_steal: Duration::from_micros(env_u64("RMEM_WAIT_BEFORE_STEAL_US", 100)),
        })
    }

    /// Build a [`Config`] directly, bypassing the environment. Used by
    /// tests that want deterministic, small budgets (e.g. the eviction
    /// round-trip scenario in spec.md §8).
    pub fn for_test(local_memory: u64, eviction_threshold: f64) -> Self {
        Config {
            local_memory,
            eviction_threshold,
            batch_max: 64,
            compl_per_op: 16,
            bumps_per_op: 5 * 64,
            tlb_flush_min: 2,
            wait_before_steal: Duration::from_micros(100),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_parsed(key, default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_parsed(key, default)
}
