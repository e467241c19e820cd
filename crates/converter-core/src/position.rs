//! Start position resolution.

use crate::config::{InitialPosition, TargetStorage};
use crate::convert::ULID_COLUMN;
use crate::error::PositionError;
use crate::storage::DatasetReader;
use std::sync::Arc;
use tracing::{debug, info};
use ulid::Ulid;

/// Turns a symbolic start position into a concrete cursor.
///
/// A `None` cursor means "start of the stream". Otherwise consumption starts
/// right after the returned message id.
#[derive(Clone)]
pub struct PositionResolver {
    reader: Arc<dyn DatasetReader>,
}

impl PositionResolver {
    pub fn new(reader: Arc<dyn DatasetReader>) -> Self {
        Self { reader }
    }

    /// Parse a position symbol and resolve it.
    pub async fn resolve_symbol(
        &self,
        symbol: &str,
        topic: &str,
        target: &TargetStorage,
    ) -> Result<Option<Ulid>, PositionError> {
        let position: InitialPosition = symbol.parse()?;
        self.resolve(&position, topic, target).await
    }

    /// Resolve a parsed position.
    pub async fn resolve(
        &self,
        position: &InitialPosition,
        topic: &str,
        target: &TargetStorage,
    ) -> Result<Option<Ulid>, PositionError> {
        match position {
            InitialPosition::First => Ok(None),
            InitialPosition::At(ulid) => Ok(Some(*ulid)),
            InitialPosition::Last => {
                let last = self.last_written(target).await?;
                info!(topic, target = %target, last = ?last, "Resolved LAST position");
                Ok(last)
            }
        }
    }

    /// Highest ulid in the most recently modified file of the dataset.
    async fn last_written(&self, target: &TargetStorage) -> Result<Option<Ulid>, PositionError> {
        let not_found = |message: String| PositionError::LastPositionNotFound {
            location: target.to_string(),
            message,
        };

        let Some(file) = self
            .reader
            .last_modified_file(target)
            .await
            .map_err(|e| not_found(e.to_string()))?
        else {
            debug!(target = %target, "No dataset files yet, starting from the beginning");
            return Ok(None);
        };

        let mut max: Option<Ulid> = None;
        let mut invalid: Option<String> = None;
        self.reader
            .scan_column(target, &file, ULID_COLUMN, &mut |value: &str| {
                match Ulid::from_string(value) {
                    Ok(ulid) => max = max.max(Some(ulid)),
                    Err(_) => {
                        invalid.get_or_insert_with(|| value.to_string());
                    }
                }
            })
            .await
            .map_err(|e| not_found(e.to_string()))?;

        if let Some(value) = invalid {
            return Err(not_found(format!(
                "invalid ulid '{}' in {}",
                value, file.path
            )));
        }
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::{DatasetFile, StorageResult};
    use async_trait::async_trait;
    use chrono::Utc;

    struct FakeReader {
        file: Option<DatasetFile>,
        values: Vec<String>,
        fail: bool,
    }

    #[async_trait]
    impl DatasetReader for FakeReader {
        async fn last_modified_file(&self, _: &TargetStorage) -> StorageResult<Option<DatasetFile>> {
            if self.fail {
                return Err(StorageError::ObjectStore("permission denied".into()));
            }
            Ok(self.file.clone())
        }

        async fn scan_column(
            &self,
            _: &TargetStorage,
            _: &DatasetFile,
            column: &str,
            visitor: &mut (dyn for<'v> FnMut(&'v str) + Send),
        ) -> StorageResult<()> {
            assert_eq!(column, ULID_COLUMN);
            self.values.iter().for_each(|v| visitor(v));
            Ok(())
        }
    }

    fn target() -> TargetStorage {
        TargetStorage {
            root: "memory://x".into(),
            path: "p".into(),
            version: "1".into(),
            sa_key_file: None,
        }
    }

    fn resolver(file: bool, values: Vec<String>, fail: bool) -> PositionResolver {
        let file = file.then(|| DatasetFile {
            path: "p/1/a.parquet".into(),
            last_modified: Utc::now(),
            size: 1,
        });
        PositionResolver::new(Arc::new(FakeReader { file, values, fail }))
    }

    #[tokio::test]
    async fn test_first_and_explicit() {
        let r = resolver(false, vec![], true);
        assert_eq!(r.resolve_symbol("FIRST", "t", &target()).await.unwrap(), None);

        let id = Ulid::new();
        assert_eq!(
            r.resolve_symbol(&id.to_string(), "t", &target()).await.unwrap(),
            Some(id)
        );

        assert!(matches!(
            r.resolve_symbol("01-not-a-ulid", "t", &target()).await,
            Err(PositionError::InvalidPosition { .. })
        ));
    }

    #[tokio::test]
    async fn test_last_on_empty_target() {
        let r = resolver(false, vec![], false);
        assert_eq!(r.resolve(&InitialPosition::Last, "t", &target()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_takes_max_ulid() {
        let a = Ulid::from_parts(1_000, 1);
        let b = Ulid::from_parts(3_000, 1);
        let c = Ulid::from_parts(2_000, 1);
        let r = resolver(true, vec![a.to_string(), b.to_string(), c.to_string()], false);
        assert_eq!(
            r.resolve(&InitialPosition::Last, "t", &target()).await.unwrap(),
            Some(b)
        );
    }

    #[tokio::test]
    async fn test_last_lookup_failure_is_distinct() {
        let r = resolver(true, vec![], true);
        assert!(matches!(
            r.resolve(&InitialPosition::Last, "t", &target()).await,
            Err(PositionError::LastPositionNotFound { .. })
        ));

        let r = resolver(true, vec!["garbage".into()], false);
        assert!(matches!(
            r.resolve(&InitialPosition::Last, "t", &target()).await,
            Err(PositionError::LastPositionNotFound { .. })
        ));
    }
}
