//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use bytes::Bytes;
use converter_core::config::{
    ConfigResolver, JobConfigFragment, SchedulerConfig, TargetStorage,
};
use converter_core::convert::Record;
use converter_core::debug::DebugSink;
use converter_core::error::{DebugSinkError, StorageError};
use converter_core::job::JobContext;
use converter_core::source::{MemoryRawdataClient, SourceRegistry};
use converter_core::storage::{DatasetWriter, StorageResult, WriteStats};
use converter_core::{ConverterJob, JobScheduler, JobState, RawdataMessage};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

pub const SOURCE: &str = "memory";
pub const TOPIC: &str = "events";
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Deterministic, strictly increasing message ids.
pub fn ulid_at(i: u64) -> Ulid {
    Ulid::from_parts(1_700_000_000_000 + i * 1_000, u128::from(i) + 1)
}

/// Message `i` with position `pos-i` and a single `entry`.
pub fn message(i: u64, body: &str) -> RawdataMessage {
    RawdataMessage::new(ulid_at(i), format!("pos-{}", i)).with_entry("entry", body.to_string())
}

/// Messages `from..=to` carrying `{"n": i}`.
pub fn json_messages(from: u64, to: u64) -> Vec<RawdataMessage> {
    (from..=to)
        .map(|i| message(i, &format!("{{\"n\": {}}}", i)))
        .collect()
}

/// A complete job fragment reading [`TOPIC`] from FIRST.
pub fn fragment(name: &str, root: &str) -> JobConfigFragment {
    let mut fragment = JobConfigFragment::named(name);
    fragment.rawdata_source.name = Some(SOURCE.into());
    fragment.rawdata_source.topic = Some(TOPIC.into());
    fragment.rawdata_source.initial_position = Some("FIRST".into());
    fragment.target_storage.root = Some(root.into());
    fragment.target_storage.path = Some("/test/dataset".into());
    fragment.target_storage.version = Some("1".into());
    fragment.converter_config = Some(BTreeMap::from([(
        "fields".to_string(),
        json!({ "n": "long" }),
    )]));
    fragment
}

/// Writer that keeps written windows in memory and can fail on a given call.
#[derive(Default)]
pub struct RecordingWriter {
    windows: Mutex<Vec<Vec<Record>>>,
    calls: AtomicUsize,
    /// 1-based call number that fails
    fail_on_call: Option<usize>,
}

impl RecordingWriter {
    pub fn failing_on(call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Default::default()
        }
    }

    pub fn window_sizes(&self) -> Vec<usize> {
        self.windows.lock().iter().map(Vec::len).collect()
    }

    pub fn records(&self) -> Vec<Record> {
        self.windows.lock().iter().flatten().cloned().collect()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetWriter for RecordingWriter {
    async fn write_window(
        &self,
        _target: &TargetStorage,
        _schema: SchemaRef,
        records: &[Record],
    ) -> StorageResult<WriteStats> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(StorageError::ObjectStore("injected write failure".into()));
        }
        self.windows.lock().push(records.to_vec());
        Ok(WriteStats {
            row_count: records.len(),
            file_size_bytes: 0,
            checksum: String::new(),
            file_path: format!("memory/{}.parquet", call),
            encode_duration: Duration::ZERO,
            upload_duration: Duration::ZERO,
        })
    }
}

/// One stored debug bundle.
#[derive(Debug, Clone)]
pub struct StoredBundle {
    pub suffix: String,
    pub group: String,
    pub files: BTreeMap<String, Bytes>,
}

/// Debug sink that keeps bundles in memory.
#[derive(Default)]
pub struct RecordingSink {
    bundles: Mutex<Vec<StoredBundle>>,
}

impl RecordingSink {
    pub fn bundles(&self, suffix: &str) -> Vec<StoredBundle> {
        self.bundles
            .lock()
            .iter()
            .filter(|b| b.suffix == suffix)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DebugSink for RecordingSink {
    async fn store(
        &self,
        path_suffix: &str,
        group: &str,
        files: BTreeMap<String, Bytes>,
    ) -> Result<usize, DebugSinkError> {
        let count = files.len();
        self.bundles.lock().push(StoredBundle {
            suffix: path_suffix.to_string(),
            group: group.to_string(),
            files,
        });
        Ok(count)
    }
}

/// Scheduler over an in-memory source with recording collaborators.
pub struct Harness {
    pub client: MemoryRawdataClient,
    pub writer: Arc<RecordingWriter>,
    pub sink: Arc<RecordingSink>,
    pub scheduler: JobScheduler,
}

impl Harness {
    pub fn new(max_concurrent_jobs: usize, writer: RecordingWriter) -> Self {
        let client = MemoryRawdataClient::new();
        let mut sources = SourceRegistry::new();
        sources.register(SOURCE, Arc::new(client.clone()));
        Self::with_sources(max_concurrent_jobs, writer, client, sources)
    }

    pub fn with_sources(
        max_concurrent_jobs: usize,
        writer: RecordingWriter,
        client: MemoryRawdataClient,
        sources: SourceRegistry,
    ) -> Self {
        Self::build(max_concurrent_jobs, writer, client, sources, |context| context)
    }

    /// Harness whose job context is adjusted before the scheduler is built.
    pub fn with_context(
        writer: RecordingWriter,
        customize: impl FnOnce(JobContext) -> JobContext,
    ) -> Self {
        let client = MemoryRawdataClient::new();
        let mut sources = SourceRegistry::new();
        sources.register(SOURCE, Arc::new(client.clone()));
        Self::build(1, writer, client, sources, customize)
    }

    fn build(
        max_concurrent_jobs: usize,
        writer: RecordingWriter,
        client: MemoryRawdataClient,
        sources: SourceRegistry,
        customize: impl FnOnce(JobContext) -> JobContext,
    ) -> Self {
        let writer = Arc::new(writer);
        let sink = Arc::new(RecordingSink::default());
        let names: Vec<String> = sources.names().cloned().collect();
        let context = customize(
            JobContext::new(sources)
                .unwrap()
                .with_writer(writer.clone())
                .with_debug_sink(sink.clone())
                .with_poll_timeout(POLL_TIMEOUT),
        );
        let scheduler = JobScheduler::new(
            &SchedulerConfig {
                max_concurrent_jobs,
                poll_timeout_ms: POLL_TIMEOUT.as_millis() as u64,
                schedule_predefined_jobs: false,
            },
            ConfigResolver::new(Vec::new(), names),
            context,
        );
        Self {
            client,
            writer,
            sink,
            scheduler,
        }
    }
}

/// Wait for a job state, failing the test instead of hanging.
pub async fn wait_for_state(job: &ConverterJob, state: JobState) {
    tokio::time::timeout(Duration::from_secs(600), job.wait_for_state(state))
        .await
        .unwrap_or_else(|_| panic!("job never reached {}, still {}", state, job.state()));
}
