//! Control plane tunables.

use std::time::Duration;

/// Timing and concurrency knobs shared by the looper, runner and reconcilers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlConfig {
    /// Delay before re-running a pass after a provider error or a still-running operation.
    pub retry_wait: Duration,
    /// Delay before re-running a pass after a mutating call returned an operation.
    pub operation_wait: Duration,
    /// Upper bound for a single provider call.
    pub api_timeout: Duration,
    /// Looper worker count, also the size of the cluster queue.
    pub concurrency: usize,
    /// How often the looper re-emits the active cluster set.
    pub emit_interval: Duration,
    /// Bound for one cluster's runner invocation inside the looper.
    pub cluster_timeout: Duration,
    /// Worker pause after a failed connection build.
    pub connect_backoff: Duration,
    /// Bound for the per-cluster manager run. The looper lowers it so the run
    /// and its drain end before `cluster_timeout`.
    pub manager_timeout: Duration,
    /// Reconcile workers per controller.
    pub max_concurrent_reconciles: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            retry_wait: Duration::from_secs(3),
            operation_wait: Duration::from_secs(5),
            api_timeout: Duration::from_secs(8),
            concurrency: 1,
            emit_interval: Duration::from_secs(1),
            cluster_timeout: Duration::from_secs(30),
            connect_backoff: Duration::from_secs(5),
            manager_timeout: Duration::from_secs(60),
            max_concurrent_reconciles: 1,
        }
    }
}

/// Parse a duration like `500ms`, `3s`, `2m` or `1h`. A bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("Invalid duration: {}", s))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("Invalid duration unit '{}' (expected ms, s, m or h)", other)),
    }
}
