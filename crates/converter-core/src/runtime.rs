//! Per-job lifecycle state machine.
//!
//! ```text
//! NEW ──start──▶ STARTED ◀──resume── PAUSED
//!                   │                  ▲
//!                   └──────pause───────┘
//! any non-STOPPED ──stop──▶ STOPPED (terminal)
//! ```
//!
//! State changes are published on a `watch` channel so the pipeline can
//! observe them at its next poll or window boundary.

use crate::error::JobError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use ulid::Ulid;

/// Lifecycle state of a converter job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    New,
    Started,
    Paused,
    Stopped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "NEW",
            JobState::Started => "STARTED",
            JobState::Paused => "PAUSED",
            JobState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Start/stop aware elapsed time accumulator.
#[derive(Debug, Default)]
struct Stopwatch {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: JobState,
    stopwatch: Stopwatch,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

/// Job state machine plus elapsed-time accounting.
///
/// All mutation goes through the methods below; the only other access is the
/// read-only `subscribe` channel.
pub struct JobRuntime {
    job_id: Ulid,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<JobState>,
}

impl JobRuntime {
    /// Create a runtime in the NEW state.
    pub fn new(job_id: Ulid) -> Self {
        let (state_tx, _) = watch::channel(JobState::New);
        Self {
            job_id,
            inner: Mutex::new(Inner {
                state: JobState::New,
                stopwatch: Stopwatch::default(),
                started_at: None,
                stopped_at: None,
            }),
            state_tx,
        }
    }

    /// NEW -> STARTED.
    pub fn start(&self) -> Result<(), JobError> {
        self.transition("start", |s| s == JobState::New, JobState::Started)
    }

    /// PAUSED -> STARTED.
    pub fn resume(&self) -> Result<(), JobError> {
        self.transition("resume", |s| s == JobState::Paused, JobState::Started)
    }

    /// STARTED -> PAUSED.
    pub fn pause(&self) -> Result<(), JobError> {
        self.transition("pause", |s| s == JobState::Started, JobState::Paused)
    }

    /// Any non-STOPPED state -> STOPPED.
    pub fn stop(&self) -> Result<(), JobError> {
        self.transition("stop", |s| s != JobState::Stopped, JobState::Stopped)
    }

    fn transition(
        &self,
        name: &'static str,
        allowed: impl Fn(JobState) -> bool,
        target: JobState,
    ) -> Result<(), JobError> {
        let mut inner = self.inner.lock();
        if !allowed(inner.state) {
            return Err(JobError::IllegalStateTransition {
                job_id: self.job_id,
                transition: name,
                state: inner.state,
            });
        }

        match target {
            JobState::Started => {
                inner.stopwatch.start();
                inner.started_at.get_or_insert_with(Utc::now);
            }
            JobState::Stopped => {
                inner.stopwatch.stop();
                inner.stopped_at = Some(Utc::now());
            }
            _ => inner.stopwatch.stop(),
        }
        inner.state = target;
        drop(inner);

        self.state_tx.send_replace(target);
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.inner.lock().state
    }

    /// Total time spent in STARTED.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().stopwatch.elapsed()
    }

    /// Wall-clock time of the first start.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started_at
    }

    /// Wall-clock time of the stop.
    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().stopped_at
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn is_startable(&self) -> bool {
        self.state() == JobState::New
    }

    pub fn is_resumable(&self) -> bool {
        self.state() == JobState::Paused
    }

    pub fn is_pauseable(&self) -> bool {
        self.state() == JobState::Started
    }

    pub fn is_stoppable(&self) -> bool {
        self.state() != JobState::Stopped
    }

    pub fn is_started(&self) -> bool {
        self.state() == JobState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == JobState::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_runtime_transitions() {
        let runtime = JobRuntime::new(Ulid::new());
        assert_eq!(runtime.state(), JobState::New);
        assert!(runtime.is_startable());

        let err = runtime.pause().unwrap_err();
        assert!(matches!(
            err,
            JobError::IllegalStateTransition {
                transition: "pause",
                state: JobState::New,
                ..
            }
        ));
        assert!(runtime.resume().is_err());

        runtime.stop().unwrap();
        assert_eq!(runtime.state(), JobState::Stopped);
    }

    #[test]
    fn test_stopped_is_terminal() {
        let runtime = JobRuntime::new(Ulid::new());
        runtime.start().unwrap();
        runtime.stop().unwrap();

        assert!(runtime.start().is_err());
        assert!(runtime.resume().is_err());
        assert!(runtime.pause().is_err());
        assert!(runtime.stop().is_err());
        assert!(runtime.stopped_at().is_some());
    }

    #[test]
    fn test_pause_resume_cycle() {
        let runtime = JobRuntime::new(Ulid::new());
        runtime.start().unwrap();
        assert!(runtime.is_pauseable());
        assert!(runtime.start().is_err());

        runtime.pause().unwrap();
        assert!(runtime.is_resumable());
        assert!(!runtime.is_pauseable());
        assert!(runtime.pause().is_err());

        runtime.resume().unwrap();
        assert!(runtime.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_freezes_when_paused() {
        let runtime = JobRuntime::new(Ulid::new());
        runtime.start().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        runtime.pause().unwrap();
        let frozen = runtime.elapsed();
        assert_eq!(frozen, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(runtime.elapsed(), frozen);

        runtime.resume().unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(runtime.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_state_changes_are_published() {
        let runtime = JobRuntime::new(Ulid::new());
        let mut rx = runtime.subscribe();
        runtime.start().unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), JobState::Started);
    }
}
