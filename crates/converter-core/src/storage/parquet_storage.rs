//! Parquet datasets on object storage.
//!
//! Every window becomes one Snappy-compressed Parquet file under
//! `<path>/<version>/<window-ulid>.parquet` relative to the storage root.
//! Roots are resolved to an [`ObjectStore`] once and cached:
//!
//! - `file:///some/dir` or a plain path: local filesystem
//! - `memory://name`: in-process store, shared by every user of the same root

use super::{DatasetFile, DatasetReader, DatasetWriter, StorageResult, WriteStats};
use crate::config::TargetStorage;
use crate::convert::Record;
use crate::error::StorageError;
use arrow::array::{Array, StringArray};
use arrow::datatypes::SchemaRef;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use crc32fast::Hasher;
use dashmap::DashMap;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use ulid::Generator;

const PARQUET_SUFFIX: &str = ".parquet";

/// Parquet dataset writer and reader.
pub struct ParquetDatasetStorage {
    stores: DashMap<String, Arc<dyn ObjectStore>>,
    file_names: Mutex<Generator>,
    write_count: AtomicU64,
}

impl Default for ParquetDatasetStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ParquetDatasetStorage {
    /// Create a storage with no roots resolved yet.
    pub fn new() -> Self {
        Self {
            stores: DashMap::new(),
            file_names: Mutex::new(Generator::new()),
            write_count: AtomicU64::new(0),
        }
    }

    /// Number of windows written.
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    /// Files under a dataset location, in no particular order.
    pub async fn list_files(&self, target: &TargetStorage) -> StorageResult<Vec<DatasetFile>> {
        let store = self.store_for(&target.root)?;
        let prefix = dataset_prefix(target);
        let objects: Vec<_> = store.list(Some(&prefix)).try_collect().await?;
        Ok(objects
            .into_iter()
            .filter(|meta| meta.location.as_ref().ends_with(PARQUET_SUFFIX))
            .map(|meta| DatasetFile {
                path: meta.location.to_string(),
                last_modified: meta.last_modified,
                size: meta.size,
            })
            .collect())
    }

    /// Read every record batch of a data file.
    pub async fn read_file(
        &self,
        target: &TargetStorage,
        file: &DatasetFile,
    ) -> StorageResult<Vec<RecordBatch>> {
        let data = self.fetch(target, file).await?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(data)
            .and_then(|b| b.build())
            .map_err(|e| StorageError::ParquetRead(format!("{}: {}", file.path, e)))?;
        reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::ParquetRead(format!("{}: {}", file.path, e)))
    }

    fn store_for(&self, root: &str) -> StorageResult<Arc<dyn ObjectStore>> {
        if let Some(store) = self.stores.get(root) {
            return Ok(Arc::clone(store.value()));
        }

        let store: Arc<dyn ObjectStore> = if root.starts_with("memory://") {
            Arc::new(InMemory::new())
        } else {
            let dir = local_dir(root)?;
            std::fs::create_dir_all(dir).map_err(|e| {
                StorageError::InvalidLocation(format!("Failed to create {}: {}", dir, e))
            })?;
            Arc::new(LocalFileSystem::new_with_prefix(dir)?)
        };

        // Two racing callers may both build a store; the first insert wins.
        let entry = self.stores.entry(root.to_string()).or_insert(store);
        Ok(Arc::clone(entry.value()))
    }

    async fn fetch(&self, target: &TargetStorage, file: &DatasetFile) -> StorageResult<Bytes> {
        let store = self.store_for(&target.root)?;
        let data = store
            .get(&ObjectPath::from(file.path.as_str()))
            .await?
            .bytes()
            .await?;
        Ok(data)
    }

    fn next_file_path(&self, target: &TargetStorage) -> StorageResult<ObjectPath> {
        let id = self
            .file_names
            .lock()
            .generate()
            .map_err(|e| StorageError::InvalidLocation(format!("file name overflow: {}", e)))?;
        Ok(dataset_prefix(target).child(format!("{}{}", id, PARQUET_SUFFIX)))
    }
}

fn local_dir(root: &str) -> StorageResult<&str> {
    if let Some(dir) = root.strip_prefix("file://") {
        return Ok(dir);
    }
    if root.contains("://") {
        return Err(StorageError::InvalidLocation(format!(
            "Unsupported storage root '{}'",
            root
        )));
    }
    Ok(root)
}

fn dataset_prefix(target: &TargetStorage) -> ObjectPath {
    let path = target.path.trim_matches('/');
    ObjectPath::from(format!("{}/{}", path, target.version))
}

/// Encode records as one record batch of the target schema.
fn to_record_batch(schema: SchemaRef, records: &[Record]) -> StorageResult<RecordBatch> {
    let mut decoder = ReaderBuilder::new(Arc::clone(&schema))
        .with_batch_size(records.len().max(1))
        .build_decoder()
        .map_err(|e| StorageError::RecordEncoding(e.to_string()))?;
    decoder
        .serialize(records)
        .map_err(|e| StorageError::RecordEncoding(e.to_string()))?;
    let batch = decoder
        .flush()
        .map_err(|e| StorageError::RecordEncoding(e.to_string()))?;
    Ok(batch.unwrap_or_else(|| RecordBatch::new_empty(schema)))
}

fn convert_to_parquet(batch: &RecordBatch) -> StorageResult<Bytes> {
    let mut buffer = Cursor::new(Vec::new());
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_max_row_group_size(128 * 1024)
        .build();

    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))
        .map_err(|e| StorageError::ParquetWrite(format!("Failed to create writer: {}", e)))?;
    writer
        .write(batch)
        .map_err(|e| StorageError::ParquetWrite(format!("Failed to write batch: {}", e)))?;
    writer
        .close()
        .map_err(|e| StorageError::ParquetWrite(format!("Failed to close writer: {}", e)))?;

    Ok(Bytes::from(buffer.into_inner()))
}

#[async_trait]
impl DatasetWriter for ParquetDatasetStorage {
    async fn check_location(&self, target: &TargetStorage) -> StorageResult<()> {
        if let Some(key_file) = &target.sa_key_file {
            if !tokio::fs::try_exists(key_file).await.unwrap_or(false) {
                return Err(StorageError::InvalidLocation(format!(
                    "Service account key file {} not found",
                    key_file.display()
                )));
            }
        }
        self.store_for(&target.root).map(|_| ())
    }

    async fn write_window(
        &self,
        target: &TargetStorage,
        schema: SchemaRef,
        records: &[Record],
    ) -> StorageResult<WriteStats> {
        if records.is_empty() {
            return Err(StorageError::ParquetWrite("Cannot write empty window".into()));
        }
        let store = self.store_for(&target.root)?;

        let encode_start = Instant::now();
        let batch = to_record_batch(schema, records)?;
        let data = convert_to_parquet(&batch)?;
        let encode_duration = encode_start.elapsed();
        let file_size_bytes = data.len();

        let mut hasher = Hasher::new();
        hasher.update(&data);
        let checksum = format!("{:08x}", hasher.finalize());

        let path = self.next_file_path(target)?;
        let upload_start = Instant::now();
        store
            .put(&path, PutPayload::from_bytes(data))
            .await
            .map_err(|e| StorageError::ObjectStore(format!("Failed to upload {}: {}", path, e)))?;
        let upload_duration = upload_start.elapsed();

        self.write_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            path = %path,
            checksum = %checksum,
            encode_ms = encode_duration.as_millis(),
            upload_ms = upload_duration.as_millis(),
            "Uploaded Parquet file"
        );
        info!(
            rows = batch.num_rows(),
            size_bytes = file_size_bytes,
            target = %target,
            "Window written"
        );

        Ok(WriteStats {
            row_count: batch.num_rows(),
            file_size_bytes,
            checksum,
            file_path: path.to_string(),
            encode_duration,
            upload_duration,
        })
    }
}

#[async_trait]
impl DatasetReader for ParquetDatasetStorage {
    async fn last_modified_file(&self, target: &TargetStorage) -> StorageResult<Option<DatasetFile>> {
        let files = self.list_files(target).await?;
        Ok(files.into_iter().max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.path.cmp(&b.path))
        }))
    }

    async fn scan_column(
        &self,
        target: &TargetStorage,
        file: &DatasetFile,
        column: &str,
        visitor: &mut (dyn for<'v> FnMut(&'v str) + Send),
    ) -> StorageResult<()> {
        let data = self.fetch(target, file).await?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(data)
            .map_err(|e| StorageError::ParquetRead(format!("{}: {}", file.path, e)))?;

        let index = builder.schema().index_of(column).map_err(|_| {
            StorageError::ParquetRead(format!("{}: no column '{}'", file.path, column))
        })?;
        let mask = ProjectionMask::roots(builder.parquet_schema(), [index]);
        let reader = builder
            .with_projection(mask)
            .build()
            .map_err(|e| StorageError::ParquetRead(format!("{}: {}", file.path, e)))?;

        for batch in reader {
            let batch = batch.map_err(|e| StorageError::ParquetRead(e.to_string()))?;
            let values = batch
                .column(0)
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    StorageError::ParquetRead(format!("column '{}' is not a string column", column))
                })?;
            for i in 0..values.len() {
                if values.is_valid(i) {
                    visitor(values.value(i));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use serde_json::json;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn target(root: &str) -> TargetStorage {
        TargetStorage {
            root: root.to_string(),
            path: "/kilde/test".into(),
            version: "1".into(),
            sa_key_file: None,
        }
    }

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("ulid", DataType::Utf8, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("age", DataType::Int64, true),
        ]))
    }

    fn record(ulid: Ulid, name: &str) -> Record {
        let value = json!({ "ulid": ulid.to_string(), "name": name, "age": 42 });
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_convert_to_parquet() {
        let batch = to_record_batch(schema(), &[record(Ulid::new(), "a")]).unwrap();
        let bytes = convert_to_parquet(&batch).unwrap();
        assert_eq!(&bytes[0..4], b"PAR1");
    }

    #[test]
    fn test_record_encoding_rejects_missing_required_column() {
        let mut rec = record(Ulid::new(), "a");
        rec.remove("ulid");
        assert!(matches!(
            to_record_batch(schema(), &[rec]),
            Err(StorageError::RecordEncoding(_))
        ));
    }

    #[test]
    fn test_unsupported_root() {
        assert!(local_dir("gs://bucket").is_err());
        assert_eq!(local_dir("file:///tmp/x").unwrap(), "/tmp/x");
        assert_eq!(local_dir("/tmp/y").unwrap(), "/tmp/y");
    }

    #[tokio::test]
    async fn test_write_and_read_back_local() {
        let dir = TempDir::new().unwrap();
        let root = format!("file://{}", dir.path().display());
        let storage = ParquetDatasetStorage::new();
        let target = target(&root);

        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        let records: Vec<_> = ids.iter().map(|id| record(*id, "x")).collect();
        let stats = storage.write_window(&target, schema(), &records).await.unwrap();

        assert_eq!(stats.row_count, 3);
        assert!(stats.file_path.starts_with("kilde/test/1/"));
        assert!(stats.file_path.ends_with(".parquet"));
        assert_eq!(stats.checksum.len(), 8);
        assert_eq!(storage.write_count(), 1);

        let file = storage.last_modified_file(&target).await.unwrap().unwrap();
        assert_eq!(file.path, stats.file_path);

        let mut seen = Vec::new();
        storage
            .scan_column(&target, &file, "ulid", &mut |v: &str| seen.push(v.to_string()))
            .await
            .unwrap();
        let expected: Vec<_> = ids.iter().map(Ulid::to_string).collect();
        assert_eq!(seen, expected);

        let batches = storage.read_file(&target, &file).await.unwrap();
        assert_eq!(batches.iter().map(RecordBatch::num_rows).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_memory_root_is_shared_and_empty_target_has_no_files() {
        let storage = ParquetDatasetStorage::new();
        let target = target("memory://datasets");
        assert!(storage.last_modified_file(&target).await.unwrap().is_none());

        storage
            .write_window(&target, schema(), &[record(Ulid::new(), "a")])
            .await
            .unwrap();
        storage
            .write_window(&target, schema(), &[record(Ulid::new(), "b")])
            .await
            .unwrap();
        assert_eq!(storage.list_files(&target).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_window_rejected() {
        let storage = ParquetDatasetStorage::new();
        let result = storage
            .write_window(&target("memory://x"), schema(), &[])
            .await;
        assert!(matches!(result, Err(StorageError::ParquetWrite(_))));
    }

    #[tokio::test]
    async fn test_check_location_missing_key_file() {
        let storage = ParquetDatasetStorage::new();
        let mut target = target("memory://x");
        target.sa_key_file = Some("/nonexistent/key.json".into());
        assert!(matches!(
            storage.check_location(&target).await,
            Err(StorageError::InvalidLocation(_))
        ));
    }
}
