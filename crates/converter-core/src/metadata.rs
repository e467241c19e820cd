//! Dataset metadata publishing.

use crate::config::{DatasetType, EffectiveJobConfig, PseudoRule, Valuation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Event announcing a dataset version to the metadata registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishDatasetMetaEvent {
    pub storage_root: String,
    pub storage_path: String,
    pub storage_version: String,
    pub valuation: Valuation,
    #[serde(rename = "type")]
    pub dataset_type: DatasetType,
    pub pseudo_rules: Vec<PseudoRule>,
}

impl PublishDatasetMetaEvent {
    pub fn from_config(config: &EffectiveJobConfig) -> Self {
        Self {
            storage_root: config.target_storage.root.clone(),
            storage_path: config.target_storage.path.clone(),
            storage_version: config.target_storage.version.clone(),
            valuation: config.target_dataset.valuation,
            dataset_type: config.target_dataset.dataset_type,
            pseudo_rules: config.pseudo_rules.clone(),
        }
    }
}

/// Delivers metadata events.
#[async_trait]
pub trait DatasetMetaPublisher: Send + Sync {
    async fn publish(&self, event: PublishDatasetMetaEvent) -> crate::Result<()>;
}

/// Publisher that fans events out to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastMetaPublisher {
    sender: broadcast::Sender<PublishDatasetMetaEvent>,
}

impl BroadcastMetaPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishDatasetMetaEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastMetaPublisher {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl DatasetMetaPublisher for BroadcastMetaPublisher {
    async fn publish(&self, event: PublishDatasetMetaEvent) -> crate::Result<()> {
        // No subscribers is not an error.
        let receivers = self.sender.send(event).unwrap_or(0);
        debug!(receivers, "Published dataset metadata");
        Ok(())
    }
}
