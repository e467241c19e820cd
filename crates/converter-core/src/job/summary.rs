//! Point-in-time execution summary of a job.

use crate::config::EffectiveJobConfig;
use crate::pipeline::{Progress, PROCESSED_MESSAGES};
use crate::runtime::{JobRuntime, JobState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use ulid::Ulid;

/// Snapshot of a job's state, position and counters.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub job_id: Ulid,
    pub job_name: String,
    pub state: JobState,
    pub configured_start_position: String,
    pub actual_start_position: String,
    /// Position token of the last durably written message
    pub position: Option<String>,
    pub last_ulid: Option<Ulid>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub execution_time_ms: u64,
    pub avg_messages_per_second: f64,
    pub avg_messages_per_hour: f64,
    pub pending_records: usize,
    pub counters: BTreeMap<String, u64>,
    pub target_storage_root: String,
    pub target_storage_path: String,
    pub target_storage_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ExecutionSummary {
    pub(crate) fn capture(
        job_id: Ulid,
        config: &EffectiveJobConfig,
        runtime: &JobRuntime,
        progress: &Progress,
        configured_start_position: &str,
        actual_start_position: &str,
    ) -> Self {
        let elapsed = runtime.elapsed();
        let processed = progress.counter(PROCESSED_MESSAGES);
        let checkpoint = progress.last_checkpoint.as_ref();

        Self {
            job_id,
            job_name: config.name.clone(),
            state: runtime.state(),
            configured_start_position: configured_start_position.to_string(),
            actual_start_position: actual_start_position.to_string(),
            position: checkpoint.map(|c| c.position.clone()),
            last_ulid: checkpoint.map(|c| c.ulid),
            started_at: runtime.started_at(),
            stopped_at: runtime.stopped_at(),
            execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            avg_messages_per_second: rate(processed, elapsed, 1.0),
            avg_messages_per_hour: rate(processed, elapsed, 3600.0),
            pending_records: progress.pending_records,
            counters: progress.counters.clone(),
            target_storage_root: config.target_storage.root.clone(),
            target_storage_path: config.target_storage.path.clone(),
            target_storage_version: config.target_storage.version.clone(),
            failure: progress.failure.clone(),
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Messages per `unit_secs` seconds of execution time.
fn rate(count: u64, elapsed: Duration, unit_secs: f64) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs * unit_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate() {
        assert_eq!(rate(10, Duration::ZERO, 1.0), 0.0);
        assert_eq!(rate(10, Duration::from_secs(5), 1.0), 2.0);
        assert_eq!(rate(10, Duration::from_secs(5), 3600.0), 7200.0);
    }
}
