use serde::{Deserialize, Serialize};

/// Global knobs that tune engine behaviour.
///
/// All fields carry defaults so deployments can adopt individual settings
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    /// Worker pool sizing and liveness thresholds.
    pub workers: WorkerPoolConfig,
    /// Retention windows for finished workflows and stale tracked items.
    pub linger: LingerConfig,
    /// Periodic reconciliation cadence for cron-enabled flows.
    pub cron: CronConfig,
    /// Filesystem watch debounce and batching configuration.
    pub watch: WatchConfig,
}

/// Sizing for the bounded worker pool.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker slots; each executes at most one step at a time.
    pub pool_size: usize,
    /// A step working longer than this is reported as a liveness warning in
    /// the status object. It is never auto-killed.
    pub stuck_threshold_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            stuck_threshold_ms: 10 * 60 * 1_000,
        }
    }
}

/// Retention windows. Finished workflows and unrefreshed tracked items are
/// purged by the housekeeper once their linger elapses.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LingerConfig {
    /// How long a finished workflow document is retained before purging.
    pub workflow_linger_ms: u64,
    /// Default linger stamped onto new tracked items.
    pub tracked_linger_ms: i64,
    /// Housekeeping cadence.
    pub housekeeper_interval_ms: u64,
}

impl Default for LingerConfig {
    fn default() -> Self {
        Self {
            workflow_linger_ms: 24 * 60 * 60 * 1_000,
            tracked_linger_ms: 3 * 24 * 60 * 60 * 1_000,
            housekeeper_interval_ms: 60_000,
        }
    }
}

/// Cadence of the periodic reconciliation audit over cron-enabled flows.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CronConfig {
    pub interval_ms: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10 * 60 * 1_000,
        }
    }
}

/// Tuning controls for filesystem watch coalescing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Debounce window in milliseconds.
    pub debounce_window_ms: u64,
    /// Maximum number of events to flush in a single batch.
    pub max_batch_events: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: 250,
            max_batch_events: 1024,
        }
    }
}
