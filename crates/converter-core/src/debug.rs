//! Local capture of raw and converted content for troubleshooting.
//!
//! Files land under
//! `<root>/<topic>/<path_suffix>/<MMDDHH>/<group>/<filename>`.

use crate::config::DebugSettings;
use crate::error::DebugSinkError;
use crate::message::RawdataMessage;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default capture root when no local storage path is configured.
pub const DEFAULT_DEBUG_ROOT: &str = "/tmp";

/// Sink for captured files.
#[async_trait]
pub trait DebugSink: Send + Sync {
    /// Store a group of files. Returns the number of files written.
    async fn store(
        &self,
        path_suffix: &str,
        group: &str,
        files: BTreeMap<String, Bytes>,
    ) -> Result<usize, DebugSinkError>;
}

/// Writes captured files to the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDebugSink {
    root: PathBuf,
    topic: String,
}

impl LocalDebugSink {
    /// Create a sink rooted at `root` for one topic.
    ///
    /// Password protected archives are not supported, so a configured
    /// password is rejected instead of silently writing clear text.
    pub fn new(
        root: impl Into<PathBuf>,
        topic: impl Into<String>,
        password: Option<&str>,
    ) -> Result<Self, DebugSinkError> {
        if password.map_or(false, |p| !p.is_empty()) {
            return Err(DebugSinkError::InvalidConfig(
                "local_storage_password is set but password protected archives are not supported"
                    .into(),
            ));
        }
        Ok(Self {
            root: root.into(),
            topic: topic.into(),
        })
    }

    /// Build a sink from a job's debug settings.
    pub fn from_settings(settings: &DebugSettings, topic: &str) -> Result<Self, DebugSinkError> {
        let root = settings
            .local_storage_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEBUG_ROOT));
        Self::new(root, topic, settings.local_storage_password.as_deref())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn group_dir(&self, path_suffix: &str, group: &str) -> PathBuf {
        let hour = Utc::now().format("%m%d%H").to_string();
        let mut dir = self.root.join(sanitize(&self.topic));
        for part in path_suffix.split('/').filter(|p| !p.is_empty()) {
            dir.push(sanitize(part));
        }
        dir.join(hour).join(sanitize(group))
    }
}

#[async_trait]
impl DebugSink for LocalDebugSink {
    async fn store(
        &self,
        path_suffix: &str,
        group: &str,
        files: BTreeMap<String, Bytes>,
    ) -> Result<usize, DebugSinkError> {
        let dir = self.group_dir(path_suffix, group);
        let write_failed = |path: &Path, e: std::io::Error| DebugSinkError::WriteFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| write_failed(&dir, e))?;

        let count = files.len();
        for (name, content) in files {
            let path = dir.join(sanitize(&name));
            tokio::fs::write(&path, &content)
                .await
                .map_err(|e| write_failed(&path, e))?;
        }
        debug!(dir = %dir.display(), files = count, "Stored debug files");
        Ok(count)
    }
}

/// Entries of a message selected for capture, plus a `message.json` manifest.
///
/// An empty whitelist selects every entry.
pub fn rawdata_files(message: &RawdataMessage, included: &[String]) -> BTreeMap<String, Bytes> {
    let mut files: BTreeMap<String, Bytes> = message
        .entries
        .iter()
        .filter(|(name, _)| included.is_empty() || included.iter().any(|i| i == *name))
        .map(|(name, content)| (name.clone(), content.clone()))
        .collect();
    if let Ok(manifest) = serde_json::to_vec_pretty(&message.manifest()) {
        files.insert("message.json".to_string(), Bytes::from(manifest));
    }
    files
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use ulid::Ulid;

    #[tokio::test]
    async fn test_store_layout() {
        let dir = TempDir::new().unwrap();
        let sink = LocalDebugSink::new(dir.path(), "freg", None).unwrap();

        let mut files = BTreeMap::new();
        files.insert("entry".to_string(), Bytes::from_static(b"{}"));
        files.insert("error.txt".to_string(), Bytes::from_static(b"boom"));
        let written = sink.store("failed-rawdata", "pos/42", files).await.unwrap();
        assert_eq!(written, 2);

        let hour = Utc::now().format("%m%d%H").to_string();
        let group = dir
            .path()
            .join("freg")
            .join("failed-rawdata")
            .join(&hour)
            .join("pos_42");
        // The hour may roll over between the write and this check.
        if group.exists() {
            assert_eq!(std::fs::read(group.join("error.txt")).unwrap(), b"boom");
        }
    }

    #[tokio::test]
    async fn test_nested_suffix() {
        let dir = TempDir::new().unwrap();
        let sink = LocalDebugSink::new(dir.path(), "t", None).unwrap();
        sink.store("converted/7", "g", BTreeMap::new()).await.unwrap();
        assert!(dir.path().join("t").join("converted").join("7").is_dir());
    }

    #[test]
    fn test_password_rejected() {
        assert!(matches!(
            LocalDebugSink::new("/tmp", "t", Some("secret")),
            Err(DebugSinkError::InvalidConfig(_))
        ));
        assert!(LocalDebugSink::new("/tmp", "t", Some("")).is_ok());
    }

    #[test]
    fn test_rawdata_files_whitelist() {
        let msg = RawdataMessage::new(Ulid::new(), "p")
            .with_entry("manifest", "m")
            .with_entry("entry", "e");

        let all = rawdata_files(&msg, &[]);
        assert_eq!(
            all.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["entry", "manifest", "message.json"]
        );

        let some = rawdata_files(&msg, &["entry".to_string()]);
        assert!(some.contains_key("entry"));
        assert!(!some.contains_key("manifest"));
        assert!(some.contains_key("message.json"));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a/b"), "a_b");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("ok.json"), "ok.json");
    }
}
