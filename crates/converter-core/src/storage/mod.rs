//! Target dataset storage contracts.
//!
//! The pipeline hands every closed window to a [`DatasetWriter`]; the
//! position resolver uses a [`DatasetReader`] to find where a previous run
//! left off.

mod parquet_storage;

pub use parquet_storage::ParquetDatasetStorage;

use crate::config::TargetStorage;
use crate::convert::Record;
use crate::error::StorageError;
use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Statistics from writing one window.
#[derive(Debug, Clone)]
pub struct WriteStats {
    /// Number of rows written
    pub row_count: usize,
    /// File size in bytes
    pub file_size_bytes: usize,
    /// CRC32 of the file content, hex encoded
    pub checksum: String,
    /// Path of the file relative to the storage root
    pub file_path: String,
    /// Time spent encoding
    pub encode_duration: Duration,
    /// Time spent uploading
    pub upload_duration: Duration,
}

/// A data file in a target dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetFile {
    /// Path relative to the storage root
    pub path: String,
    pub last_modified: DateTime<Utc>,
    pub size: usize,
}

/// Writes windows of converted records.
#[async_trait]
pub trait DatasetWriter: Send + Sync {
    /// Check that the location is usable before any data arrives.
    async fn check_location(&self, _target: &TargetStorage) -> StorageResult<()> {
        Ok(())
    }

    /// Durably write one window. Returns only after the write completed or failed.
    async fn write_window(
        &self,
        target: &TargetStorage,
        schema: SchemaRef,
        records: &[Record],
    ) -> StorageResult<WriteStats>;
}

/// Reads back what has been written to a dataset.
#[async_trait]
pub trait DatasetReader: Send + Sync {
    /// The most recently modified data file, if any.
    async fn last_modified_file(&self, target: &TargetStorage) -> StorageResult<Option<DatasetFile>>;

    /// Visit every non-null value of a string column in a file.
    async fn scan_column(
        &self,
        target: &TargetStorage,
        file: &DatasetFile,
        column: &str,
        visitor: &mut (dyn for<'v> FnMut(&'v str) + Send),
    ) -> StorageResult<()>;
}
