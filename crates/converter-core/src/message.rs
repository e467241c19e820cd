//! Rawdata message envelope.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

/// An immutable multi-part message read from a rawdata stream.
#[derive(Debug, Clone, PartialEq)]
pub struct RawdataMessage {
    /// Time-ordered, sortable identity
    pub ulid: Ulid,
    /// Producer timestamp
    pub timestamp: DateTime<Utc>,
    /// Ordering group key
    pub group: Option<String>,
    /// Monotonic sequence number within the group
    pub sequence: u64,
    /// Opaque broker cursor
    pub position: String,
    /// Named content entries
    pub entries: BTreeMap<String, Bytes>,
}

impl RawdataMessage {
    /// Create a message with the given identity and position, stamped from the ulid.
    pub fn new(ulid: Ulid, position: impl Into<String>) -> Self {
        Self {
            ulid,
            timestamp: DateTime::<Utc>::from(ulid.datetime()),
            group: None,
            sequence: 0,
            position: position.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style entry insertion.
    pub fn with_entry(mut self, name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.entries.insert(name.into(), content.into());
        self
    }

    /// Builder-style group assignment.
    pub fn with_group(mut self, group: impl Into<String>, sequence: u64) -> Self {
        self.group = Some(group.into());
        self.sequence = sequence;
        self
    }

    /// Entry names.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Content of a named entry.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries.get(name)
    }

    /// Total size of all entries in bytes.
    pub fn size_bytes(&self) -> usize {
        self.entries.values().map(Bytes::len).sum()
    }

    /// Short description used in log lines.
    pub fn pos_and_id(&self) -> String {
        format!("pos={}, ulid={}", self.position, self.ulid)
    }

    /// Envelope metadata without content.
    pub fn manifest(&self) -> MessageManifest {
        MessageManifest {
            ulid: self.ulid,
            position: self.position.clone(),
            timestamp: self.timestamp,
            group: self.group.clone(),
            sequence: self.sequence,
            entries: self.entries.keys().cloned().collect(),
        }
    }
}

/// Serializable description of a message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageManifest {
    pub ulid: Ulid,
    pub position: String,
    pub timestamp: DateTime<Utc>,
    pub group: Option<String>,
    pub sequence: u64,
    pub entries: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builder() {
        let ulid = Ulid::new();
        let msg = RawdataMessage::new(ulid, "pos-1")
            .with_entry("manifest.json", "{}")
            .with_entry("entry", Bytes::from_static(b"hello"))
            .with_group("g1", 7);

        assert_eq!(msg.keys().collect::<Vec<_>>(), vec!["entry", "manifest.json"]);
        assert_eq!(msg.size_bytes(), 7);
        assert_eq!(msg.group.as_deref(), Some("g1"));
        assert_eq!(msg.sequence, 7);
        assert_eq!(msg.pos_and_id(), format!("pos=pos-1, ulid={}", ulid));
        assert_eq!(msg.timestamp.timestamp_millis() as u64, ulid.timestamp_ms());
    }

    #[test]
    fn test_manifest_lists_entries() {
        let msg = RawdataMessage::new(Ulid::new(), "p").with_entry("a", "1");
        let manifest = msg.manifest();
        assert_eq!(manifest.entries, vec!["a".to_string()]);
        assert_eq!(manifest.ulid, msg.ulid);
    }
}
