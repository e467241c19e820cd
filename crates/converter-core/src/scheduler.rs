//! Job admission and lifecycle routing.
//!
//! The scheduler owns the job registry. Admission counts non-stopped jobs
//! plus admissions still initializing against `max_concurrent_jobs`. The
//! capacity check, the duplicate id check and the reservation happen under
//! one lock, while the (slow) job initialization runs without it.

use crate::config::{Config, ConfigResolver, EffectiveJobConfig, JobConfigFragment, SchedulerConfig};
use crate::error::SchedulerError;
use crate::health::HealthCheck;
use crate::job::{ConverterJob, ExecutionSummary, JobContext};
use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Health component name of the scheduler.
pub const SCHEDULER_COMPONENT: &str = "scheduler";

/// Schedules converter jobs and routes lifecycle commands to them.
pub struct JobScheduler {
    jobs: DashMap<Ulid, Arc<ConverterJob>>,
    pending: Mutex<Admissions>,
    max_concurrent_jobs: usize,
    resolver: ConfigResolver,
    context: JobContext,
}

/// Admissions that passed the capacity check but are not registered yet.
#[derive(Debug, Default)]
struct Admissions {
    count: usize,
    /// Explicit job ids of those admissions
    ids: HashSet<Ulid>,
}

impl Admissions {
    fn release(&mut self, job_id: Option<Ulid>) {
        self.count = self.count.saturating_sub(1);
        if let Some(id) = job_id {
            self.ids.remove(&id);
        }
    }
}

/// A reserved admission slot, released on drop unless committed.
struct Reservation<'a> {
    pending: &'a Mutex<Admissions>,
    job_id: Option<Ulid>,
    held: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.pending.lock().release(self.job_id);
        }
    }
}

impl JobScheduler {
    pub fn new(config: &SchedulerConfig, resolver: ConfigResolver, context: JobContext) -> Self {
        context.health.mark_healthy(SCHEDULER_COMPONENT);
        Self {
            jobs: DashMap::new(),
            pending: Mutex::new(Admissions::default()),
            max_concurrent_jobs: config.max_concurrent_jobs,
            resolver,
            context,
        }
    }

    /// Build a scheduler with default collaborators for a service configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(
            &config.scheduler,
            config.resolver(),
            JobContext::from_config(config)?,
        ))
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn context(&self) -> &JobContext {
        &self.context
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Schedule a job from a possibly partial fragment.
    ///
    /// `converter_config` keys are overlaid onto the fragment's own converter
    /// config before resolution.
    pub async fn schedule(
        &self,
        fragment: JobConfigFragment,
        converter_config: Option<BTreeMap<String, Value>>,
    ) -> Result<Arc<ConverterJob>> {
        let mut fragment = fragment;
        if let Some(extra) = converter_config {
            fragment
                .converter_config
                .get_or_insert_with(BTreeMap::new)
                .extend(extra);
        }
        let config = self.resolver.resolve(&fragment)?;
        self.schedule_resolved(config).await
    }

    /// Schedule a job from an effective configuration.
    pub async fn schedule_resolved(&self, config: EffectiveJobConfig) -> Result<Arc<ConverterJob>> {
        let mut reservation = self.reserve(config.job_id)?;
        let job = ConverterJob::init(config, &self.context).await?;

        {
            let mut pending = self.pending.lock();
            pending.release(reservation.job_id);
            reservation.held = false;
            match self.jobs.entry(job.id()) {
                Entry::Occupied(entry) if !entry.get().runtime().is_stopped() => {
                    drop(entry);
                    drop(pending);
                    warn!(job_id = %job.id(), "Job id registered concurrently, stopping duplicate");
                    if let Err(e) = job.stop() {
                        debug!(error = %e, "Duplicate job already stopped");
                    }
                    return Err(SchedulerError::JobExists(job.id()).into());
                }
                Entry::Occupied(mut entry) => {
                    entry.insert(Arc::clone(&job));
                }
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&job));
                }
            }
        }
        drop(reservation);

        self.refresh_active_jobs();
        info!(
            job_id = %job.id(),
            job = %job.name(),
            state = %job.state(),
            "Scheduled converter job"
        );
        Ok(job)
    }

    /// Schedule every predefined (non-prototype) job.
    pub async fn schedule_predefined(&self) -> Result<Vec<Arc<ConverterJob>>> {
        let mut jobs = Vec::new();
        for config in self.resolver.predefined()? {
            jobs.push(self.schedule_resolved(config).await?);
        }
        Ok(jobs)
    }

    fn reserve(&self, job_id: Option<Ulid>) -> Result<Reservation<'_>> {
        let mut pending = self.pending.lock();
        if let Some(id) = job_id {
            let live = self.jobs.get(&id).map_or(false, |j| !j.runtime().is_stopped());
            if live || pending.ids.contains(&id) {
                return Err(SchedulerError::JobExists(id).into());
            }
        }

        let active = self.active_count();
        if active + pending.count >= self.max_concurrent_jobs {
            warn!(
                active,
                pending = pending.count,
                max = self.max_concurrent_jobs,
                "Rejecting job, capacity exceeded"
            );
            return Err(SchedulerError::CapacityExceeded {
                max: self.max_concurrent_jobs,
            }
            .into());
        }
        pending.count += 1;
        if let Some(id) = job_id {
            pending.ids.insert(id);
        }
        Ok(Reservation {
            pending: &self.pending,
            job_id,
            held: true,
        })
    }

    /// Number of jobs that are not stopped.
    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| !j.runtime().is_stopped())
            .count()
    }

    fn refresh_active_jobs(&self) {
        self.context.metrics.set_active_jobs(self.active_count());
    }

    pub fn get(&self, id: &Ulid) -> Result<Arc<ConverterJob>> {
        self.jobs
            .get(id)
            .map(|j| Arc::clone(j.value()))
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()).into())
    }

    /// All registered jobs, ordered by id.
    pub fn jobs(&self) -> Vec<Arc<ConverterJob>> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|j| Arc::clone(j.value())).collect();
        jobs.sort_by_key(|j| j.id());
        jobs
    }

    pub fn start(&self, id: &Ulid) -> Result<()> {
        self.get(id)?.start()
    }

    pub fn pause(&self, id: &Ulid) -> Result<()> {
        self.get(id)?.pause()
    }

    pub fn resume(&self, id: &Ulid) -> Result<()> {
        self.get(id)?.resume()
    }

    pub async fn resume_from_last(&self, id: &Ulid) -> Result<()> {
        self.get(id)?.resume_from_last().await
    }

    pub fn stop(&self, id: &Ulid) -> Result<()> {
        let result = self.get(id)?.stop();
        self.refresh_active_jobs();
        result
    }

    pub async fn publish_dataset_meta(&self, id: &Ulid) -> Result<()> {
        self.get(id)?.publish_dataset_meta().await
    }

    /// Pause every pauseable job. Returns the number of jobs paused.
    pub fn pause_all(&self) -> usize {
        self.broadcast("pause", |j| j.runtime().is_pauseable(), |j| j.pause())
    }

    /// Resume every paused job.
    pub fn resume_all(&self) -> usize {
        self.broadcast("resume", |j| j.runtime().is_resumable(), |j| j.resume())
    }

    /// Stop every job that is not stopped yet.
    pub fn stop_all(&self) -> usize {
        let stopped = self.broadcast("stop", |j| j.runtime().is_stoppable(), |j| j.stop());
        self.refresh_active_jobs();
        stopped
    }

    /// Apply an operation to the jobs it is legal for.
    ///
    /// A job can change state between the filter and the call; such races are
    /// logged and skipped.
    fn broadcast(
        &self,
        operation: &str,
        applicable: impl Fn(&ConverterJob) -> bool,
        apply: impl Fn(&ConverterJob) -> Result<()>,
    ) -> usize {
        let mut applied = 0;
        for job in self.jobs() {
            let job: &ConverterJob = &job;
            if !applicable(job) {
                continue;
            }
            match apply(job) {
                Ok(()) => applied += 1,
                Err(e) => debug!(job_id = %job.id(), operation, error = %e, "Skipping job"),
            }
        }
        info!(operation, jobs = applied, "Broadcast command applied");
        applied
    }

    pub fn summary(&self, id: &Ulid) -> Result<ExecutionSummary> {
        Ok(self.get(id)?.summary())
    }

    /// Summaries of every registered job, ordered by id.
    pub fn summaries(&self) -> Vec<ExecutionSummary> {
        self.refresh_active_jobs();
        self.jobs().iter().map(|j| j.summary()).collect()
    }

    pub fn config(&self, id: &Ulid) -> Result<EffectiveJobConfig> {
        Ok(self.get(id)?.config().clone())
    }

    /// Stop all jobs and wait for their pipelines to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        info!(timeout_secs = timeout.as_secs(), "Shutting down job scheduler");
        self.stop_all();

        let jobs = self.jobs();
        let join_all = async {
            for job in &jobs {
                job.join().await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!("Shutdown timeout exceeded, abandoning remaining pipelines");
        }
        self.context.health.mark_unhealthy(SCHEDULER_COMPONENT, "shut down");
        self.context.health.set_ready(false);
    }

    pub fn health(&self) -> &Arc<HealthCheck> {
        &self.context.health
    }
}
