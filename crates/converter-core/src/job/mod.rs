//! Converter jobs: initialization, lifecycle operations and summaries.
//!
//! A [`ConverterJob`] owns one [`ConversionPipeline`] task. Initialization
//! does everything that can fail for configuration reasons (debug storage,
//! storage credentials, decryptor, converter, start position) before the
//! pipeline is spawned, so a job that exists is always startable.

mod summary;

pub use summary::ExecutionSummary;

use crate::config::{Config, EffectiveJobConfig, InitialPosition};
use crate::convert::{ConverterFactory, DefaultConverterFactory};
use crate::crypto::{self, DecryptorFactory, DefaultDecryptorFactory, Decryptor};
use crate::debug::{DebugSink, LocalDebugSink};
use crate::error::{ConfigError, Error, JobError, SourceError};
use crate::health::HealthCheck;
use crate::message::RawdataMessage;
use crate::metadata::{BroadcastMetaPublisher, DatasetMetaPublisher, PublishDatasetMetaEvent};
use crate::metrics::ConverterMetrics;
use crate::pipeline::{ConversionPipeline, PipelineCommand, PipelineParts, Progress};
use crate::position::PositionResolver;
use crate::runtime::{JobRuntime, JobState};
use crate::source::{RawdataClient, SourceRegistry};
use crate::storage::{DatasetReader, DatasetWriter, ParquetDatasetStorage};
use crate::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use ulid::Ulid;

/// Shown as actual start position when a job starts from the beginning.
pub const START_OF_STREAM: &str = "N/A";

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared collaborators used to build jobs.
#[derive(Clone)]
pub struct JobContext {
    pub sources: SourceRegistry,
    pub decryptors: Arc<dyn DecryptorFactory>,
    pub converters: Arc<dyn ConverterFactory>,
    pub writer: Arc<dyn DatasetWriter>,
    pub reader: Arc<dyn DatasetReader>,
    pub publisher: Arc<dyn DatasetMetaPublisher>,
    /// Replaces the per-job local debug sink when set
    pub debug_sink: Option<Arc<dyn DebugSink>>,
    pub metrics: Arc<ConverterMetrics>,
    pub health: Arc<HealthCheck>,
    pub poll_timeout: Duration,
}

impl JobContext {
    /// Context with the default collaborators.
    pub fn new(sources: SourceRegistry) -> Result<Self> {
        let storage = Arc::new(ParquetDatasetStorage::new());
        Ok(Self {
            sources,
            decryptors: Arc::new(DefaultDecryptorFactory),
            converters: Arc::new(DefaultConverterFactory::default()),
            writer: storage.clone(),
            reader: storage,
            publisher: Arc::new(BroadcastMetaPublisher::default()),
            debug_sink: None,
            metrics: Arc::new(ConverterMetrics::new()?),
            health: Arc::new(HealthCheck::new()),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        })
    }

    /// Context for a service configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(SourceRegistry::from_config(&config.rawdata_sources)?)?
            .with_converters(Arc::new(DefaultConverterFactory::new(config.converter.clone())))
            .with_poll_timeout(Duration::from_millis(config.scheduler.poll_timeout_ms)))
    }

    /// Use one storage implementation for both writing and LAST lookups.
    pub fn with_storage<S>(self, storage: Arc<S>) -> Self
    where
        S: DatasetWriter + DatasetReader + 'static,
    {
        let writer: Arc<dyn DatasetWriter> = storage.clone();
        self.with_writer(writer).with_reader(storage)
    }

    pub fn with_writer(mut self, writer: Arc<dyn DatasetWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_reader(mut self, reader: Arc<dyn DatasetReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_decryptors(mut self, decryptors: Arc<dyn DecryptorFactory>) -> Self {
        self.decryptors = decryptors;
        self
    }

    pub fn with_converters(mut self, converters: Arc<dyn ConverterFactory>) -> Self {
        self.converters = converters;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn DatasetMetaPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug_sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ConverterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_health(mut self, health: Arc<HealthCheck>) -> Self {
        self.health = health;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

/// A scheduled converter job.
pub struct ConverterJob {
    job_id: Ulid,
    config: Arc<EffectiveJobConfig>,
    runtime: Arc<JobRuntime>,
    progress: Arc<Mutex<Progress>>,
    commands: mpsc::Sender<PipelineCommand>,
    publisher: Arc<dyn DatasetMetaPublisher>,
    configured_start_position: String,
    actual_start_position: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConverterJob {
    /// Initialize a job and spawn its pipeline.
    ///
    /// The job is started right away when `active_by_default` is set,
    /// otherwise it stays NEW until [`start`](Self::start) is called.
    pub async fn init(config: EffectiveJobConfig, ctx: &JobContext) -> Result<Arc<Self>> {
        let job_id = config.job_id.unwrap_or_else(Ulid::new);
        let span = info_span!("converter_job", job_id = %job_id, job = %config.name);
        Self::init_inner(job_id, config, ctx)
            .instrument(span)
            .await
    }

    async fn init_inner(
        job_id: Ulid,
        config: EffectiveJobConfig,
        ctx: &JobContext,
    ) -> Result<Arc<Self>> {
        let topic = config.rawdata_source.topic.clone();
        let configured_start_position = config.rawdata_source.initial_position.to_string();

        if config.debug.dryrun {
            warn!("Dryrun mode: no data will be written to {}", config.target_storage);
        }
        if config.debug.is_rawdata_logged() && !config.debug.development_mode {
            warn!("Rawdata content logging is enabled outside development mode, rawdata may end up in logs");
        }

        let debug_sink = Self::debug_sink(&config, ctx)?;
        ctx.writer.check_location(&config.target_storage).await?;

        let registered = ctx
            .sources
            .get(&config.rawdata_source.name)
            .ok_or_else(|| ConfigError::UnknownSourceReference(config.rawdata_source.name.clone()))?;
        let client = Arc::clone(&registered.client);
        let decryptor = ctx
            .decryptors
            .create(&config.rawdata_source.name, &registered.encryption)?;

        let mut converter = ctx.converters.create(&config)?;
        let samples = Self::collect_samples(
            client.as_ref(),
            &topic,
            config.converter_settings.rawdata_samples,
            decryptor.as_ref(),
            ctx.poll_timeout,
        )
        .await?;
        info!(samples = samples.len(), "Initializing converter");
        converter.init(&samples)?;

        let start_after = PositionResolver::new(Arc::clone(&ctx.reader))
            .resolve(
                &config.rawdata_source.initial_position,
                &topic,
                &config.target_storage,
            )
            .await?;
        let actual_start_position = start_after
            .map(|u| u.to_string())
            .unwrap_or_else(|| START_OF_STREAM.to_string());
        if config.rawdata_source.initial_position == InitialPosition::Last && start_after.is_none() {
            info!("No previously converted data found, starting from the beginning of the stream");
        }

        let source = client.consumer(&topic, start_after).await?;

        let config = Arc::new(config);
        let runtime = Arc::new(JobRuntime::new(job_id));
        let progress = Arc::new(Mutex::new(Progress::default()));
        let (commands, command_rx) = mpsc::channel(4);

        let job = Arc::new(Self {
            job_id,
            config: Arc::clone(&config),
            runtime: Arc::clone(&runtime),
            progress: Arc::clone(&progress),
            commands,
            publisher: Arc::clone(&ctx.publisher),
            configured_start_position,
            actual_start_position,
            task: Mutex::new(None),
        });
        job.publish_dataset_meta().await?;

        let component = HealthCheck::job_component(&job_id);
        ctx.health.mark_healthy(&component);

        let pipeline = ConversionPipeline::new(PipelineParts {
            job_id,
            config: Arc::clone(&config),
            runtime: Arc::clone(&runtime),
            source,
            decryptor,
            converter,
            writer: Arc::clone(&ctx.writer),
            debug_sink,
            metrics: Arc::clone(&ctx.metrics),
            health: Arc::clone(&ctx.health),
            progress,
            commands: command_rx,
            poll_timeout: ctx.poll_timeout,
            start_after,
        });
        let health = Arc::clone(&ctx.health);
        let span = info_span!("converter_job", job_id = %job_id, job = %config.name);
        let handle = tokio::spawn(
            async move {
                pipeline.run().await;
                health.remove_component(&component);
            }
            .instrument(span),
        );
        *job.task.lock() = Some(handle);

        info!(
            configured_start_position = %job.configured_start_position,
            actual_start_position = %job.actual_start_position,
            target = %config.target_storage,
            "Converter job initialized"
        );

        if config.active_by_default {
            job.start()?;
        }
        Ok(job)
    }

    fn debug_sink(
        config: &EffectiveJobConfig,
        ctx: &JobContext,
    ) -> Result<Option<Arc<dyn DebugSink>>> {
        let debug = &config.debug;
        if debug.uses_local_storage() && debug.local_storage_path.is_none() {
            return Err(ConfigError::InvalidValue {
                property: "debug.local_storage_path".into(),
                message: "required when storing rawdata or converted records locally".into(),
            }
            .into());
        }
        if let Some(sink) = &ctx.debug_sink {
            return Ok(Some(Arc::clone(sink)));
        }
        if !debug.uses_local_storage() && debug.local_storage_password.is_none() {
            return Ok(None);
        }
        let sink = LocalDebugSink::from_settings(debug, &config.rawdata_source.topic)?;
        info!(root = %sink.root().display(), "Local debug storage enabled");
        Ok(Some(Arc::new(sink)))
    }

    /// Pull up to `count` messages from the start of the topic.
    async fn collect_samples(
        client: &dyn RawdataClient,
        topic: &str,
        count: u32,
        decryptor: &dyn Decryptor,
        timeout: Duration,
    ) -> Result<Vec<RawdataMessage>> {
        let mut samples = Vec::new();
        if count == 0 {
            return Ok(samples);
        }

        let mut consumer = client.consumer(topic, None).await?;
        while samples.len() < count as usize {
            match consumer.receive(timeout).await {
                Ok(Some(message)) => {
                    samples.push(crypto::decrypt(decryptor, message)?.into_message())
                }
                Ok(None) | Err(SourceError::Closed) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(samples)
    }

    pub fn id(&self) -> Ulid {
        self.job_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &EffectiveJobConfig {
        &self.config
    }

    pub fn runtime(&self) -> &JobRuntime {
        &self.runtime
    }

    pub fn state(&self) -> JobState {
        self.runtime.state()
    }

    pub fn start(&self) -> Result<()> {
        self.runtime.start()?;
        info!(job_id = %self.job_id, job = %self.config.name, "Job started");
        Ok(())
    }

    /// Pause consumption. Takes effect at the pipeline's next poll boundary.
    pub fn pause(&self) -> Result<()> {
        self.runtime.pause()?;
        info!(job_id = %self.job_id, "Job paused");
        Ok(())
    }

    /// Resume a paused job. A window whose write failed is retried first.
    pub fn resume(&self) -> Result<()> {
        self.runtime.resume()?;
        info!(job_id = %self.job_id, "Job resumed");
        Ok(())
    }

    /// Resume a paused job from the last durably written message.
    pub async fn resume_from_last(&self) -> Result<()> {
        let state = self.runtime.state();
        if state != JobState::Paused {
            return Err(JobError::IllegalStateTransition {
                job_id: self.job_id,
                transition: "resume from last",
                state,
            }
            .into());
        }

        let not_running = || Error::from(JobError::PipelineNotRunning { job_id: self.job_id });
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PipelineCommand::ResumeFromLast { reply })
            .await
            .map_err(|_| not_running())?;
        rx.await.map_err(|_| not_running())??;

        self.resume()
    }

    /// Stop the job. The pending window is flushed unless the job was paused
    /// by a failure.
    pub fn stop(&self) -> Result<()> {
        self.runtime.stop()?;
        let summary = self.summary();
        info!(
            job_id = %self.job_id,
            summary = %serde_json::to_string(&summary).unwrap_or_default(),
            "Job stopped"
        );
        Ok(())
    }

    /// Wait until the job reaches `state`.
    pub async fn wait_for_state(&self, state: JobState) {
        let mut rx = self.runtime.subscribe();
        if rx.wait_for(|s| *s == state).await.is_err() {
            warn!(job_id = %self.job_id, "Job runtime dropped while waiting");
        }
    }

    /// Wait for the pipeline task to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(job_id = %self.job_id, error = %e, "Pipeline task failed");
            }
        }
    }

    /// Publish dataset metadata for the job's target.
    pub async fn publish_dataset_meta(&self) -> Result<()> {
        let event = PublishDatasetMetaEvent::from_config(&self.config);
        let payload = serde_json::to_string(&event)?;

        if !self.config.target_dataset.publish_metadata {
            warn!(payload = %payload, "Dataset metadata publishing is disabled");
            return Ok(());
        }
        if self.config.debug.dryrun {
            info!(payload = %payload, "Dryrun: dataset metadata not published");
            return Ok(());
        }

        self.publisher.publish(event).await?;
        info!(target = %self.config.target_storage, "Published dataset metadata");
        Ok(())
    }

    /// Snapshot of state, position and counters.
    pub fn summary(&self) -> ExecutionSummary {
        let progress = self.progress.lock().clone();
        ExecutionSummary::capture(
            self.job_id,
            &self.config,
            &self.runtime,
            &progress,
            &self.configured_start_position,
            &self.actual_start_position,
        )
    }
}

impl std::fmt::Debug for ConverterJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConverterJob")
            .field("job_id", &self.job_id)
            .field("name", &self.config.name)
            .field("state", &self.runtime.state())
            .finish()
    }
}
