//! Rawdata topics backed by JSON lines files.
//!
//! Each topic is a file `<directory>/<topic>.jsonl` with one message per line:
//!
//! ```json
//! {"ulid": "01ARZ3NDEKTSV4RRFFQ69G5FAV", "position": "42", "entries": {"entry": "{\"a\":1}"}}
//! ```
//!
//! `timestamp`, `group` and `sequence` are optional. The file is re-read when
//! the cursor reaches its end, so lines appended by another process are
//! picked up.

use super::{MessageSource, RawdataClient, SourceResult};
use crate::error::SourceError;
use crate::message::RawdataMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use ulid::Ulid;

#[derive(Debug, Deserialize)]
struct JsonlLine {
    ulid: Ulid,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    position: Option<String>,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

impl From<JsonlLine> for RawdataMessage {
    fn from(line: JsonlLine) -> Self {
        let position = line.position.unwrap_or_else(|| line.ulid.to_string());
        let mut message = RawdataMessage::new(line.ulid, position);
        if let Some(ts) = line.timestamp {
            message.timestamp = ts;
        }
        message.group = line.group;
        message.sequence = line.sequence;
        message.entries = line
            .entries
            .into_iter()
            .map(|(k, v)| (k, v.into()))
            .collect();
        message
    }
}

/// Rawdata client reading topics from a directory.
#[derive(Debug, Clone)]
pub struct JsonlRawdataClient {
    directory: PathBuf,
}

impl JsonlRawdataClient {
    /// Create a client over a directory of `<topic>.jsonl` files.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn topic_path(&self, topic: &str) -> PathBuf {
        self.directory.join(format!("{}.jsonl", topic))
    }
}

#[async_trait]
impl RawdataClient for JsonlRawdataClient {
    async fn consumer(
        &self,
        topic: &str,
        after: Option<Ulid>,
    ) -> SourceResult<Box<dyn MessageSource>> {
        let path = self.topic_path(topic);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SourceError::UnknownTopic(topic.to_string()));
        }

        let mut source = JsonlSource {
            path,
            messages: Vec::new(),
            index: 0,
        };
        source.reload().await?;
        if let Some(after) = after {
            source.index = source.messages.partition_point(|m| m.ulid <= after);
        }
        Ok(Box::new(source))
    }
}

struct JsonlSource {
    path: PathBuf,
    messages: Vec<RawdataMessage>,
    index: usize,
}

impl JsonlSource {
    async fn reload(&mut self) -> SourceResult<()> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::Other(format!("{}: {}", self.path.display(), e)))?;
        self.messages = parse_lines(&self.path, &content)?;
        Ok(())
    }

    fn next_loaded(&mut self) -> Option<RawdataMessage> {
        let message = self.messages.get(self.index).cloned();
        if message.is_some() {
            self.index += 1;
        }
        message
    }
}

fn parse_lines(path: &Path, content: &str) -> SourceResult<Vec<RawdataMessage>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str::<JsonlLine>(line)
                .map(RawdataMessage::from)
                .map_err(|e| {
                    SourceError::MessageParse(format!("{}:{}: {}", path.display(), n + 1, e))
                })
        })
        .collect()
}

#[async_trait]
impl MessageSource for JsonlSource {
    async fn receive(&mut self, timeout: Duration) -> SourceResult<Option<RawdataMessage>> {
        if let Some(message) = self.next_loaded() {
            return Ok(Some(message));
        }

        self.reload().await?;
        if let Some(message) = self.next_loaded() {
            return Ok(Some(message));
        }

        tokio::time::sleep(timeout).await;
        self.reload().await?;
        let message = self.next_loaded();
        if message.is_none() {
            debug!(path = %self.path.display(), "No new rawdata lines");
        }
        Ok(message)
    }

    async fn seek(&mut self, timestamp: DateTime<Utc>) -> SourceResult<()> {
        self.reload().await?;
        self.index = self.messages.partition_point(|m| m.timestamp < timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line(ulid: Ulid, body: &str) -> String {
        serde_json::json!({
            "ulid": ulid.to_string(),
            "entries": { "entry": body }
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_reads_topic_file() {
        let dir = TempDir::new().unwrap();
        let a = Ulid::new();
        let b = Ulid::from_parts(a.timestamp_ms() + 1, 0);
        std::fs::write(
            dir.path().join("people.jsonl"),
            format!("{}\n\n{}\n", line(a, "{\"n\":1}"), line(b, "{\"n\":2}")),
        )
        .unwrap();

        let client = JsonlRawdataClient::new(dir.path());
        let mut source = client.consumer("people", None).await.unwrap();
        let first = source.receive(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(first.ulid, a);
        assert_eq!(first.position, a.to_string());
        assert_eq!(first.get("entry").unwrap().as_ref(), b"{\"n\":1}");

        let mut source = client.consumer("people", Some(a)).await.unwrap();
        let next = source.receive(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(next.ulid, b);
        assert!(source.receive(Duration::from_millis(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_picks_up_appended_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        let a = Ulid::new();
        std::fs::write(&path, format!("{}\n", line(a, "{}"))).unwrap();

        let client = JsonlRawdataClient::new(dir.path());
        let mut source = client.consumer("t", None).await.unwrap();
        assert!(source.receive(Duration::from_millis(1)).await.unwrap().is_some());

        let b = Ulid::from_parts(a.timestamp_ms() + 1, 0);
        std::fs::write(&path, format!("{}\n{}\n", line(a, "{}"), line(b, "{}"))).unwrap();
        let next = source.receive(Duration::from_millis(1)).await.unwrap().unwrap();
        assert_eq!(next.ulid, b);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_bad_line() {
        let dir = TempDir::new().unwrap();
        let client = JsonlRawdataClient::new(dir.path());
        assert!(matches!(
            client.consumer("missing", None).await,
            Err(SourceError::UnknownTopic(_))
        ));

        std::fs::write(dir.path().join("bad.jsonl"), "not json\n").unwrap();
        assert!(matches!(
            client.consumer("bad", None).await,
            Err(SourceError::MessageParse(_))
        ));
    }
}
