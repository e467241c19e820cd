//! The streaming conversion pipeline.
//!
//! One pipeline task runs per job. It polls the source with a bounded
//! timeout, runs every message through decrypt, skip filter, convertibility
//! filter, optional raw capture, conversion and optional converted capture,
//! and accumulates records into count-or-time windows that are written one at
//! a time.
//!
//! Lifecycle commands are observed cooperatively: the job state is checked
//! before every poll and every window write, so a pause or stop takes effect
//! after at most one poll timeout plus one in-flight write.
//!
//! Any pipeline-fatal error pauses the job. The failing message can be
//! captured to the debug sink together with the error, the target schema and
//! the effective config.

mod window;

pub use window::WindowAccumulator;

use crate::config::{DatasetType, EffectiveJobConfig};
use crate::convert::{RawdataConverter, Record, ULID_COLUMN};
use crate::crypto::{self, Decrypted, Decryptor};
use crate::debug::{rawdata_files, DebugSink};
use crate::error::{Error, SourceError};
use crate::health::HealthCheck;
use crate::message::RawdataMessage;
use crate::metrics::{ConverterMetrics, MessageOutcome};
use crate::runtime::{JobRuntime, JobState};
use crate::source::MessageSource;
use crate::storage::DatasetWriter;
use arrow::datatypes::SchemaRef;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Number of recently consumed messages kept for resume and troubleshooting.
pub const RING_BUFFER_SIZE: usize = 10;

pub const PROCESSED_MESSAGES: &str = "processed_messages";
pub const SKIPPED_MESSAGES: &str = "skipped_messages";
pub const UNCONVERTIBLE_MESSAGES: &str = "unconvertible_messages";
pub const FAILED_MESSAGES: &str = "failed_messages";
pub const WINDOWS_FLUSHED: &str = "windows_flushed";
pub const RECORDS_WRITTEN: &str = "records_written";
pub const RAWDATA_FILES_WRITTEN: &str = "rawdata_files_written";
pub const DECRYPT_PASSTHROUGH: &str = "decrypt_passthrough";

/// Position of a message that made it into the target (or, in dryrun, was evaluated).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub ulid: Ulid,
    pub position: String,
    pub timestamp: DateTime<Utc>,
}

/// Progress snapshot shared with the owning job.
///
/// Only the pipeline writes it; readers clone it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    pub last_checkpoint: Option<Checkpoint>,
    pub counters: BTreeMap<String, u64>,
    /// Set while the job is paused by a pipeline-fatal error
    pub failure: Option<String>,
    /// Pending records not yet written
    pub pending_records: usize,
}

impl Progress {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    fn add(&mut self, name: &str, delta: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Messages accounted for by the max-records-total ceiling.
    fn total_accounted(&self) -> u64 {
        self.counter(PROCESSED_MESSAGES)
            + self.counter(SKIPPED_MESSAGES)
            + self.counter(UNCONVERTIBLE_MESSAGES)
    }
}

/// Commands handled by the pipeline task itself.
#[derive(Debug)]
pub enum PipelineCommand {
    /// Discard the pending window and rewind to the last written message.
    ResumeFromLast {
        reply: oneshot::Sender<crate::Result<()>>,
    },
}

/// Everything a pipeline needs, assembled by the job.
pub struct PipelineParts {
    pub job_id: Ulid,
    pub config: Arc<EffectiveJobConfig>,
    pub runtime: Arc<JobRuntime>,
    pub source: Box<dyn MessageSource>,
    pub decryptor: Arc<dyn Decryptor>,
    pub converter: Box<dyn RawdataConverter>,
    pub writer: Arc<dyn DatasetWriter>,
    pub debug_sink: Option<Arc<dyn DebugSink>>,
    pub metrics: Arc<ConverterMetrics>,
    pub health: Arc<HealthCheck>,
    pub progress: Arc<Mutex<Progress>>,
    pub commands: mpsc::Receiver<PipelineCommand>,
    pub poll_timeout: Duration,
    /// Cursor the job started after, used when rewinding with nothing written yet
    pub start_after: Option<Ulid>,
}

struct WindowEntry {
    record: Record,
    checkpoint: Checkpoint,
}

/// A fatal error plus the message it happened on.
struct Failure {
    error: Error,
    message: Option<RawdataMessage>,
}

impl Failure {
    fn new(error: impl Into<Error>, message: Option<RawdataMessage>) -> Self {
        Self {
            error: error.into(),
            message,
        }
    }
}

enum Flow {
    Continue,
    Finished(&'static str),
}

/// The per-job consume-convert-flush loop.
pub struct ConversionPipeline {
    job_id: Ulid,
    config: Arc<EffectiveJobConfig>,
    runtime: Arc<JobRuntime>,
    state_rx: watch::Receiver<JobState>,
    source: Box<dyn MessageSource>,
    decryptor: Arc<dyn Decryptor>,
    converter: Box<dyn RawdataConverter>,
    schema: SchemaRef,
    writer: Arc<dyn DatasetWriter>,
    debug_sink: Option<Arc<dyn DebugSink>>,
    metrics: Arc<ConverterMetrics>,
    health: Arc<HealthCheck>,
    progress: Arc<Mutex<Progress>>,
    commands: mpsc::Receiver<PipelineCommand>,
    poll_timeout: Duration,
    start_after: Option<Ulid>,
    window: WindowAccumulator<WindowEntry>,
    ring: VecDeque<RawdataMessage>,
    skipped: HashSet<Ulid>,
    /// Messages at or below this id have already been handled
    dedupe_through: Option<Ulid>,
    retry_pending: bool,
    /// Set while the window that ends the job is awaiting a successful write
    finish_after_flush: Option<&'static str>,
    last_message_at: Instant,
}

impl ConversionPipeline {
    pub fn new(parts: PipelineParts) -> Self {
        let settings = &parts.config.converter_settings;
        let window = WindowAccumulator::new(
            usize::try_from(settings.max_records_before_flush).unwrap_or(usize::MAX),
            Duration::from_secs(settings.max_seconds_before_flush),
        );
        let skipped = settings.skipped_messages.iter().copied().collect();
        let schema = parts.converter.target_schema();

        Self {
            job_id: parts.job_id,
            state_rx: parts.runtime.subscribe(),
            runtime: parts.runtime,
            config: parts.config,
            source: parts.source,
            decryptor: parts.decryptor,
            converter: parts.converter,
            schema,
            writer: parts.writer,
            debug_sink: parts.debug_sink,
            metrics: parts.metrics,
            health: parts.health,
            progress: parts.progress,
            commands: parts.commands,
            poll_timeout: parts.poll_timeout,
            start_after: parts.start_after,
            window,
            ring: VecDeque::with_capacity(RING_BUFFER_SIZE),
            skipped,
            dedupe_through: parts.start_after,
            retry_pending: false,
            finish_after_flush: None,
            last_message_at: Instant::now(),
        }
    }

    /// Run until the job is stopped.
    pub async fn run(mut self) {
        info!(
            topic = %self.config.rawdata_source.topic,
            target = %self.config.target_storage,
            "Conversion pipeline ready"
        );

        loop {
            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command).await;
            }

            let state = *self.state_rx.borrow_and_update();
            match state {
                JobState::Stopped => {
                    self.finish().await;
                    break;
                }
                JobState::New | JobState::Paused => {
                    if !self.wait_while_idle().await {
                        break;
                    }
                    continue;
                }
                JobState::Started => {}
            }

            match self.step().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Finished(reason)) => {
                    info!(reason, "Stopping job");
                    if let Err(e) = self.runtime.stop() {
                        debug!(error = %e, "Job already stopped");
                    }
                }
                Err(failure) => self.fail(failure).await,
            }
        }

        info!("Conversion pipeline finished");
    }

    /// Wait for a state change or a command. Returns false when the job is gone.
    async fn wait_while_idle(&mut self) -> bool {
        let alive = tokio::select! {
            changed = self.state_rx.changed() => changed.is_ok(),
            command = self.commands.recv() => match command {
                Some(command) => {
                    self.handle_command(command).await;
                    true
                }
                // Job handle dropped: only state changes can wake us now
                None => self.state_rx.changed().await.is_ok(),
            },
        };
        // Idle time does not count towards bounded source exhaustion
        self.last_message_at = Instant::now();
        alive
    }

    /// One iteration in STARTED: retry or flush a window, or poll once.
    async fn step(&mut self) -> Result<Flow, Failure> {
        if self.retry_pending {
            info!(records = self.window.len(), "Retrying write of retained window");
            self.retry_pending = false;
            self.clear_failure();
            self.flush_window().await?;
            return Ok(match self.finish_after_flush.take() {
                Some(reason) => Flow::Finished(reason),
                None => Flow::Continue,
            });
        }

        if self.window.should_flush() {
            self.flush_window().await?;
            return Ok(Flow::Continue);
        }

        let timeout = self.poll_timeout.min(self.window.remaining());
        match self.source.receive(timeout).await {
            Ok(Some(message)) => {
                self.last_message_at = Instant::now();
                self.process(message).await?;
                if self.max_total_reached() {
                    return self.final_flush("max records total reached").await;
                }
                Ok(Flow::Continue)
            }
            Ok(None) => {
                let idle = self.last_message_at.elapsed() >= self.poll_timeout;
                if idle && self.config.target_dataset.dataset_type == DatasetType::Bounded {
                    return self.final_flush("bounded source exhausted").await;
                }
                Ok(Flow::Continue)
            }
            Err(SourceError::Closed) => self.final_flush("rawdata source closed").await,
            Err(e) => Err(Failure::new(e, None)),
        }
    }

    /// Flush the last window before finishing. If the write fails, a retry
    /// after resume finishes the job instead of polling for more input.
    async fn final_flush(&mut self, reason: &'static str) -> Result<Flow, Failure> {
        self.finish_after_flush = Some(reason);
        self.flush_window().await?;
        self.finish_after_flush = None;
        Ok(Flow::Finished(reason))
    }

    fn max_total_reached(&self) -> bool {
        match self.config.converter_settings.max_records_total {
            Some(max) => self.progress.lock().total_accounted() >= max,
            None => false,
        }
    }

    async fn process(&mut self, message: RawdataMessage) -> Result<(), Failure> {
        if let Some(through) = self.dedupe_through {
            if message.ulid <= through {
                debug!(ulid = %message.ulid, "Dropping already handled message");
                return Ok(());
            }
        }

        let size = message.size_bytes();
        let message = match crypto::decrypt(self.decryptor.as_ref(), message.clone()) {
            Ok(Decrypted::Message(m)) => m,
            Ok(Decrypted::PassedThrough(m)) => {
                self.progress.lock().add(DECRYPT_PASSTHROUGH, 1);
                self.metrics.record_decrypt_passthrough();
                m
            }
            Err(e) => return Err(Failure::new(e, Some(message))),
        };

        if self.ring.len() == RING_BUFFER_SIZE {
            self.ring.pop_front();
        }
        self.ring.push_back(message.clone());

        let config = Arc::clone(&self.config);
        let debug = &config.debug;
        if self.skipped.contains(&message.ulid) {
            self.progress.lock().add(SKIPPED_MESSAGES, 1);
            self.metrics.record_message(MessageOutcome::Skip, size);
            self.capture_skipped(&message, "skip list").await;
            return Ok(());
        }

        if !self.converter.is_convertible(&message) {
            self.progress.lock().add(UNCONVERTIBLE_MESSAGES, 1);
            self.metrics.record_message(MessageOutcome::Unconvertible, size);
            self.capture_skipped(&message, "not convertible").await;
            return Ok(());
        }

        if debug.log_all_rawdata {
            info!(ulid = %message.ulid, content = %content_summary(&message), "Rawdata");
        }
        if debug.store_all_rawdata {
            self.store(&message, "rawdata", BTreeMap::new()).await;
        }

        let result = self
            .converter
            .convert(&message)
            .map_err(|e| Failure::new(e, Some(message.clone())))?;

        let mut record = result.record;
        record
            .entry(ULID_COLUMN.to_string())
            .or_insert_with(|| Value::String(message.ulid.to_string()));

        {
            let mut progress = self.progress.lock();
            progress.add(PROCESSED_MESSAGES, 1);
            for (name, delta) in &result.counters {
                progress.add(name, *delta);
            }
            if !result.failures.is_empty() {
                progress.add(FAILED_MESSAGES, result.failures.len() as u64);
            }
        }
        if result.failures.is_empty() {
            self.metrics.record_message(MessageOutcome::Success, size);
        } else {
            self.metrics.record_message(MessageOutcome::Fail, size);
            warn!(
                ulid = %message.ulid,
                failures = ?result.failures,
                "Message converted with failures"
            );
        }

        if debug.log_all_converted {
            let record_json = Value::Object(record.clone());
            info!(ulid = %message.ulid, record = %record_json, "Converted");
        }
        if debug.store_all_converted {
            if let Ok(json) = serde_json::to_vec_pretty(&record) {
                let mut files = BTreeMap::new();
                files.insert(format!("{}.json", message.ulid), Bytes::from(json));
                self.store_files("converted", &message.position, files).await;
            }
        }

        self.window.add(WindowEntry {
            record,
            checkpoint: Checkpoint {
                ulid: message.ulid,
                position: message.position.clone(),
                timestamp: message.timestamp,
            },
        });
        self.progress.lock().pending_records = self.window.len();
        Ok(())
    }

    /// Close the current window and hand it to the writer.
    ///
    /// On failure the window is put back so that a plain resume can retry it.
    async fn flush_window(&mut self) -> Result<(), Failure> {
        let entries = self.window.flush();
        let count = entries.len();

        if entries.is_empty() {
            debug!("Empty window");
            self.metrics.record_window(0, None);
            self.progress.lock().add(WINDOWS_FLUSHED, 1);
            return Ok(());
        }

        let last = entries.last().map(|e| e.checkpoint.clone());
        if self.config.debug.dryrun {
            info!(records = count, "Dryrun: window evaluated but not written");
            self.metrics.record_window(count, None);
            let mut progress = self.progress.lock();
            progress.add(WINDOWS_FLUSHED, 1);
            progress.last_checkpoint = last;
            progress.pending_records = self.window.len();
            return Ok(());
        }

        let records: Vec<Record> = entries.iter().map(|e| e.record.clone()).collect();
        let started = Instant::now();
        match self
            .writer
            .write_window(&self.config.target_storage, Arc::clone(&self.schema), &records)
            .await
        {
            Ok(stats) => {
                self.metrics.record_window(count, Some(started.elapsed()));
                let mut progress = self.progress.lock();
                progress.add(WINDOWS_FLUSHED, 1);
                progress.add(RECORDS_WRITTEN, stats.row_count as u64);
                progress.last_checkpoint = last;
                progress.pending_records = self.window.len();
                debug!(file = %stats.file_path, rows = stats.row_count, "Window committed");
                Ok(())
            }
            Err(e) => {
                self.window.restore(entries);
                self.retry_pending = true;
                let trigger = self.ring.back().cloned();
                Err(Failure::new(e, trigger))
            }
        }
    }

    async fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::ResumeFromLast { reply } => {
                let result = self.rewind().await;
                if reply.send(result).is_err() {
                    debug!("Resume-from-last caller went away");
                }
            }
        }
    }

    /// Drop the pending window and seek to the last written message.
    async fn rewind(&mut self) -> crate::Result<()> {
        let discarded = self.window.discard();
        self.retry_pending = false;
        self.finish_after_flush = None;
        self.clear_failure();

        let checkpoint = self.progress.lock().last_checkpoint.clone();
        let (timestamp, through) = match (&checkpoint, self.start_after) {
            (Some(c), _) => (c.timestamp, Some(c.ulid)),
            (None, Some(ulid)) => (DateTime::<Utc>::from(ulid.datetime()), Some(ulid)),
            (None, None) => (DateTime::<Utc>::UNIX_EPOCH, None),
        };

        if let Some(recent) = self.ring.back() {
            debug!(
                last_consumed = %recent.pos_and_id(),
                buffered = self.ring.len(),
                "Discarding consumed messages after last write"
            );
        }
        info!(
            discarded,
            seek_to = %timestamp,
            last_written = ?checkpoint.as_ref().map(|c| c.position.as_str()),
            "Rewinding to last written message"
        );

        self.source.seek(timestamp).await?;
        self.dedupe_through = through;
        self.ring.clear();
        Ok(())
    }

    /// Final flush when the job is stopped.
    async fn finish(&mut self) {
        if self.progress.lock().failure.is_some() {
            let discarded = self.window.discard();
            if discarded > 0 {
                warn!(discarded, "Job stopped after a failure, discarding retained window");
            }
            return;
        }

        if !self.window.is_empty() {
            if let Err(failure) = self.flush_window().await {
                error!(error = %failure.error, "Final window write failed");
                self.progress.lock().failure = Some(failure.error.to_string());
            }
        }
    }

    fn clear_failure(&self) {
        self.progress.lock().failure = None;
        self.health
            .mark_healthy(&HealthCheck::job_component(&self.job_id));
    }

    /// Pause the job after a fatal error and capture what is known about it.
    async fn fail(&mut self, failure: Failure) {
        let Failure { error, message } = failure;
        error!(
            error = %error,
            message = ?message.as_ref().map(RawdataMessage::pos_and_id),
            "Pipeline failure, pausing job"
        );

        self.progress.lock().failure = Some(error.to_string());
        self.metrics.record_fatal_pause();
        self.health.mark_degraded(
            &HealthCheck::job_component(&self.job_id),
            &format!("paused after failure: {}", error),
        );

        if let Some(message) = &message {
            let config = Arc::clone(&self.config);
            if config.debug.log_failed_rawdata {
                info!(
                    ulid = %message.ulid,
                    content = %content_summary(message),
                    "Failed rawdata"
                );
            }
            if config.debug.store_failed_rawdata {
                let files = self.failure_files(&error);
                self.store(message, "failed-rawdata", files).await;
            }
        }

        if let Err(e) = self.runtime.pause() {
            debug!(error = %e, "Job not pauseable after failure");
        }
    }

    fn failure_files(&self, error: &Error) -> BTreeMap<String, Bytes> {
        let mut files = BTreeMap::new();
        files.insert("error.txt".to_string(), Bytes::from(error_chain(error)));
        if let Ok(schema) = serde_json::to_vec_pretty(&schema_json(&self.schema)) {
            files.insert("target-schema.json".to_string(), Bytes::from(schema));
        }
        if let Ok(config) = serde_json::to_vec_pretty(self.config.as_ref()) {
            files.insert("job-config.json".to_string(), Bytes::from(config));
        }
        files
    }

    async fn capture_skipped(&mut self, message: &RawdataMessage, reason: &str) {
        if self.config.debug.log_skipped_rawdata {
            info!(
                ulid = %message.ulid,
                reason,
                content = %content_summary(message),
                "Skipped rawdata"
            );
        }
        if self.config.debug.store_skipped_rawdata {
            self.store(message, "skipped-rawdata", BTreeMap::new()).await;
        }
    }

    /// Store a message's entries plus extra files, grouped by position.
    async fn store(
        &mut self,
        message: &RawdataMessage,
        suffix: &str,
        extra: BTreeMap<String, Bytes>,
    ) {
        let mut files = rawdata_files(message, &self.config.debug.included_rawdata_entries);
        files.extend(extra);
        self.store_files(suffix, &message.position, files).await;
    }

    async fn store_files(&mut self, suffix: &str, group: &str, files: BTreeMap<String, Bytes>) {
        let Some(sink) = &self.debug_sink else {
            return;
        };
        match sink.store(suffix, group, files).await {
            Ok(written) => self.progress.lock().add(RAWDATA_FILES_WRITTEN, written as u64),
            Err(e) => warn!(error = %e, suffix, group, "Failed to store debug content"),
        }
    }
}

/// Readable content of a message for log lines.
fn content_summary(message: &RawdataMessage) -> String {
    message
        .entries
        .iter()
        .map(|(name, content)| format!("{}={}", name, String::from_utf8_lossy(content)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Error and all its sources, one per line.
fn error_chain(error: &Error) -> String {
    let mut out = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out.push('\n');
    out
}

fn schema_json(schema: &SchemaRef) -> Value {
    Value::Array(
        schema
            .fields()
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name(),
                    "type": f.data_type().to_string(),
                    "nullable": f.is_nullable(),
                })
            })
            .collect(),
    )
}
