//! In-process rawdata topics.

use super::{MessageSource, RawdataClient, SourceResult};
use crate::error::SourceError;
use crate::message::RawdataMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use ulid::Ulid;

#[derive(Default)]
struct Topic {
    messages: Vec<RawdataMessage>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    topics: RwLock<HashMap<String, Topic>>,
    notify: Notify,
}

/// Rawdata client over in-memory topics.
///
/// Cloning shares the underlying topics, so a test can keep a handle for
/// publishing while the engine consumes.
#[derive(Clone, Default)]
pub struct MemoryRawdataClient {
    shared: Arc<Shared>,
}

impl MemoryRawdataClient {
    /// Create a client without topics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a topic, creating it if needed.
    pub fn publish(&self, topic: &str, message: RawdataMessage) {
        self.shared
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(message);
        self.shared.notify.notify_waiters();
    }

    /// Append several messages to a topic.
    pub fn publish_all(&self, topic: &str, messages: impl IntoIterator<Item = RawdataMessage>) {
        {
            let mut topics = self.shared.topics.write();
            let entry = topics.entry(topic.to_string()).or_default();
            entry.messages.extend(messages);
        }
        self.shared.notify.notify_waiters();
    }

    /// Close a topic. Consumers get `SourceError::Closed` once drained.
    pub fn close(&self, topic: &str) {
        self.shared
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .closed = true;
        self.shared.notify.notify_waiters();
    }

    /// Number of messages published to a topic.
    pub fn len(&self, topic: &str) -> usize {
        self.shared
            .topics
            .read()
            .get(topic)
            .map_or(0, |t| t.messages.len())
    }

    /// Whether a topic has no messages.
    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }
}

#[async_trait]
impl RawdataClient for MemoryRawdataClient {
    async fn consumer(
        &self,
        topic: &str,
        after: Option<Ulid>,
    ) -> SourceResult<Box<dyn MessageSource>> {
        let index = match after {
            None => 0,
            Some(ulid) => self
                .shared
                .topics
                .read()
                .get(topic)
                .map_or(0, |t| t.messages.partition_point(|m| m.ulid <= ulid)),
        };
        Ok(Box::new(MemorySource {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            index,
        }))
    }
}

/// Cursor over one in-memory topic.
pub struct MemorySource {
    shared: Arc<Shared>,
    topic: String,
    index: usize,
}

impl MemorySource {
    fn next_available(&mut self) -> SourceResult<Option<RawdataMessage>> {
        let topics = self.shared.topics.read();
        let Some(topic) = topics.get(&self.topic) else {
            return Ok(None);
        };
        match topic.messages.get(self.index) {
            Some(message) => {
                self.index += 1;
                Ok(Some(message.clone()))
            }
            None if topic.closed => Err(SourceError::Closed),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn receive(&mut self, timeout: Duration) -> SourceResult<Option<RawdataMessage>> {
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.notify.notified();
            if let Some(message) = self.next_available()? {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn seek(&mut self, timestamp: DateTime<Utc>) -> SourceResult<()> {
        let topics = self.shared.topics.read();
        self.index = topics
            .get(&self.topic)
            .map_or(0, |t| t.messages.partition_point(|m| m.timestamp < timestamp));
        Ok(())
    }
}
