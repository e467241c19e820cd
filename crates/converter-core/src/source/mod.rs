//! Rawdata source contracts and client implementations.

mod jsonl;
mod memory;

pub use jsonl::JsonlRawdataClient;
pub use memory::{MemoryRawdataClient, MemorySource};

use crate::config::{EncryptionConfig, RawdataSourceConfig, SourceKind};
use crate::error::{ConfigError, SourceError};
use crate::message::RawdataMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use ulid::Ulid;

/// Result type for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A cursor over one topic.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` on timeout and `Err(SourceError::Closed)` once the
    /// source can never yield again.
    async fn receive(&mut self, timeout: Duration) -> SourceResult<Option<RawdataMessage>>;

    /// Reposition at the first message with a timestamp at or after `timestamp`.
    async fn seek(&mut self, timestamp: DateTime<Utc>) -> SourceResult<()>;
}

/// Opens cursors on topics of one rawdata source.
#[async_trait]
pub trait RawdataClient: Send + Sync {
    /// Open a cursor starting right after `after`, or at the start of the topic.
    async fn consumer(
        &self,
        topic: &str,
        after: Option<Ulid>,
    ) -> SourceResult<Box<dyn MessageSource>>;
}

/// A registered source: its client plus encryption settings.
#[derive(Clone)]
pub struct RegisteredSource {
    pub client: Arc<dyn RawdataClient>,
    pub encryption: EncryptionConfig,
}

/// Named rawdata sources known to the service.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<String, RegisteredSource>,
}

impl SourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build clients for every configured source.
    pub fn from_config(configs: &[RawdataSourceConfig]) -> crate::Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let client: Arc<dyn RawdataClient> = match config.kind {
                SourceKind::Memory => Arc::new(MemoryRawdataClient::new()),
                SourceKind::Jsonl => {
                    let dir = config.directory.clone().ok_or_else(|| {
                        ConfigError::InvalidValue {
                            property: "rawdata_sources.directory".into(),
                            message: format!("required for jsonl source '{}'", config.name),
                        }
                    })?;
                    Arc::new(JsonlRawdataClient::new(dir))
                }
            };
            registry.register_with_encryption(&config.name, client, config.encryption.clone());
        }
        Ok(registry)
    }

    /// Register an unencrypted source.
    pub fn register(&mut self, name: &str, client: Arc<dyn RawdataClient>) {
        self.register_with_encryption(name, client, EncryptionConfig::default());
    }

    /// Register a source with encryption settings.
    pub fn register_with_encryption(
        &mut self,
        name: &str,
        client: Arc<dyn RawdataClient>,
        encryption: EncryptionConfig,
    ) {
        self.sources
            .insert(name.to_string(), RegisteredSource { client, encryption });
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredSource> {
        self.sources.get(name)
    }

    /// Registered source names.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.sources.keys()
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.keys().collect::<Vec<_>>())
            .finish()
    }
}
