/// Atomic Multi-CF Database Writer
///
/// Collects keyed operations across the ledger column families and commits
/// them in one RocksDB WriteBatch: either every operation lands or none does.
///
/// Every operation carries an operation key that must be unique within the
/// batch. Conditional operations (insert-if-absent, update-if-unchanged) are
/// checked under the shared commit lock immediately before the write, so a
/// failed check rejects the whole batch with nothing written.

use std::collections::{HashMap, HashSet};
use rocksdb::WriteBatch;
use tracing::{debug, error, warn};

use crate::db_handles::DbHandles;
use crate::error::{LedgerError, Result};
use crate::metrics;

/// Atomic batch writer that commits writes across multiple column families atomically
pub struct AtomicBatchWriter {
    handles: DbHandles,
    operations: Vec<Operation>,
    preconditions: Vec<Precondition>,
    op_keys: HashSet<String>,
}

/// Represents a single database write
#[derive(Clone, Debug)]
struct Operation {
    cf_name: String,
    key: Vec<u8>,
    value: Vec<u8>,
}

/// What a failed precondition means for the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mismatch {
    /// Another commit moved the value; a fresh snapshot may succeed
    Stale,
    /// An append-only record is already there
    Exists,
}

/// Stored value that must be observed at commit time (None = key absent)
#[derive(Clone, Debug)]
struct Precondition {
    op_key: String,
    cf_name: String,
    key: Vec<u8>,
    expected: Option<Vec<u8>>,
    mismatch: Mismatch,
}

impl Precondition {
    fn conflict(&self) -> LedgerError {
        let key = self.op_key.clone();
        match self.mismatch {
            Mismatch::Stale => LedgerError::VersionConflict { key },
            Mismatch::Exists => LedgerError::RecordExists { key },
        }
    }
}

impl AtomicBatchWriter {
    pub fn new(handles: DbHandles) -> Self {
        Self {
            handles,
            operations: Vec::new(),
            preconditions: Vec::new(),
            op_keys: HashSet::new(),
        }
    }

    fn claim_op_key(&mut self, op_key: &str) -> Result<()> {
        if !self.op_keys.insert(op_key.to_string()) {
            return Err(LedgerError::DuplicateOperation(op_key.to_string()));
        }
        Ok(())
    }

    fn guarded(
        &mut self,
        op_key: &str,
        cf_name: &str,
        key: Vec<u8>,
        value: Vec<u8>,
        expected: Option<Vec<u8>>,
        mismatch: Mismatch,
    ) -> Result<()> {
        self.put(op_key, cf_name, key.clone(), value)?;
        self.preconditions.push(Precondition {
            op_key: op_key.to_string(),
            cf_name: cf_name.to_string(),
            key,
            expected,
            mismatch,
        });
        Ok(())
    }

    /// Unconditional write
    pub fn put(&mut self, op_key: &str, cf_name: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.claim_op_key(op_key)?;
        self.operations.push(Operation {
            cf_name: cf_name.to_string(),
            key,
            value,
        });
        Ok(())
    }

    /// Append-only write. An existing key fails the batch with `RecordExists`.
    pub fn insert(&mut self, op_key: &str, cf_name: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.guarded(op_key, cf_name, key, value, None, Mismatch::Exists)
    }

    /// Compare-and-swap write: fails the batch with `VersionConflict` unless
    /// the stored value still equals `expected` (`None` = key absent)
    pub fn update(
        &mut self,
        op_key: &str,
        cf_name: &str,
        key: Vec<u8>,
        value: Vec<u8>,
        expected: Option<Vec<u8>>,
    ) -> Result<()> {
        self.guarded(op_key, cf_name, key, value, expected, Mismatch::Stale)
    }

    /// Get number of pending operations
    pub fn pending_count(&self) -> usize {
        self.operations.len()
    }

    /// Flush all accumulated writes to database ATOMICALLY
    ///
    /// Preconditions are checked and the WriteBatch written while holding the
    /// commit lock. The pending operations are consumed whatever the outcome.
    pub async fn flush(&mut self) -> Result<()> {
        if self.operations.is_empty() {
            return Ok(());
        }

        let pending_ops = self.operations.len();
        let timer = metrics::Timer::new();

        debug!(pending_ops = pending_ops, "Batch flush start");

        let operations = std::mem::take(&mut self.operations);
        let preconditions = std::mem::take(&mut self.preconditions);
        self.op_keys.clear();
        let handles = self.handles.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<HashMap<String, usize>> {
            let _guard = handles
                .commit_lock()
                .lock()
                .map_err(|_| LedgerError::Storage("commit lock poisoned".to_string()))?;
            let db = handles.db();

            // Stale values first: a batch computed from a moved snapshot is
            // reported as a conflict even when it also collides with a record
            let ordered = preconditions
                .iter()
                .filter(|c| c.mismatch == Mismatch::Stale)
                .chain(preconditions.iter().filter(|c| c.mismatch == Mismatch::Exists));
            for check in ordered {
                let cf = db
                    .cf_handle(&check.cf_name)
                    .ok_or_else(|| LedgerError::Commit(format!("Column family not found: {}", check.cf_name)))?;
                let current = db.get_cf(&cf, &check.key).map_err(|e| {
                    metrics::increment_db_errors("get", &check.cf_name);
                    LedgerError::Commit(e.to_string())
                })?;
                if current.as_deref() != check.expected.as_deref() {
                    return Err(check.conflict());
                }
            }

            let mut batch = WriteBatch::default();
            let mut cf_batch_sizes: HashMap<String, usize> = HashMap::new();

            for op in &operations {
                let cf = db
                    .cf_handle(&op.cf_name)
                    .ok_or_else(|| LedgerError::Commit(format!("Column family not found: {}", op.cf_name)))?;
                *cf_batch_sizes.entry(op.cf_name.clone()).or_default() += 1;
                batch.put_cf(&cf, &op.key, &op.value);
            }

            // Single atomic commit for ALL column families
            db.write(batch).map_err(|e| LedgerError::Commit(e.to_string()))?;
            Ok(cf_batch_sizes)
        })
        .await?;

        let elapsed_secs = timer.elapsed_secs();

        match result {
            Ok(cf_batch_sizes) => {
                for (cf_name, batch_size) in &cf_batch_sizes {
                    metrics::record_db_flush_duration(cf_name, elapsed_secs);
                    metrics::BATCH_FLUSH_COUNT.with_label_values(&[cf_name]).inc();
                    metrics::DB_BATCH_SIZE_ENTRIES.with_label_values(&[cf_name]).set(*batch_size as i64);
                }

                if elapsed_secs > 10.0 {
                    warn!(
                        batch_size = pending_ops,
                        duration_secs = elapsed_secs,
                        "Slow database flush"
                    );
                } else {
                    debug!(
                        cf_count = cf_batch_sizes.len(),
                        batch_size = pending_ops,
                        duration_ms = format!("{:.2}", elapsed_secs * 1000.0),
                        "Flush complete"
                    );
                }
                Ok(())
            }
            Err(e) => {
                error!(batch_size = pending_ops, error = %e, "Flush error");
                metrics::increment_db_errors("flush", "batch");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{CF_ADDRESSES, CF_CLAIMS, CF_HISTORY};
    use tempfile::TempDir;

    fn create_test_db() -> (DbHandles, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let handles = DbHandles::open(temp_dir.path()).unwrap();
        (handles, temp_dir)
    }

    fn get(handles: &DbHandles, cf: &str, key: &[u8]) -> Option<Vec<u8>> {
        let cf = handles.cf(cf).unwrap();
        handles.db().get_cf(cf, key).unwrap()
    }

    #[tokio::test]
    async fn test_atomic_write_all_succeed() {
        let (handles, _temp) = create_test_db();
        let mut writer = AtomicBatchWriter::new(handles.clone());

        writer.put("1_address", CF_ADDRESSES, b"key1".to_vec(), b"value1".to_vec()).unwrap();
        writer.insert("1_history", CF_HISTORY, b"key2".to_vec(), b"value2".to_vec()).unwrap();
        writer.insert("1_claim", CF_CLAIMS, b"key3".to_vec(), b"value3".to_vec()).unwrap();

        writer.flush().await.unwrap();

        assert_eq!(get(&handles, CF_ADDRESSES, b"key1").unwrap(), b"value1");
        assert_eq!(get(&handles, CF_HISTORY, b"key2").unwrap(), b"value2");
        assert_eq!(get(&handles, CF_CLAIMS, b"key3").unwrap(), b"value3");
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_op_key_rejected() {
        let (handles, _temp) = create_test_db();
        let mut writer = AtomicBatchWriter::new(handles);

        writer.put("7_address", CF_ADDRESSES, b"a".to_vec(), b"1".to_vec()).unwrap();
        let err = writer
            .put("7_address", CF_ADDRESSES, b"b".to_vec(), b"2".to_vec())
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateOperation(k) if k == "7_address"));
        assert_eq!(writer.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_insert_conflict_writes_nothing() {
        let (handles, _temp) = create_test_db();

        let mut writer = AtomicBatchWriter::new(handles.clone());
        writer.put("seed", CF_HISTORY, b"taken".to_vec(), b"old".to_vec()).unwrap();
        writer.flush().await.unwrap();

        let mut writer = AtomicBatchWriter::new(handles.clone());
        writer.put("1_address", CF_ADDRESSES, b"addr".to_vec(), b"new".to_vec()).unwrap();
        writer.insert("1_history", CF_HISTORY, b"taken".to_vec(), b"new".to_vec()).unwrap();
        let err = writer.flush().await.unwrap_err();

        assert!(matches!(err, LedgerError::RecordExists { ref key } if key == "1_history"));
        assert!(!err.is_retryable());
        assert!(get(&handles, CF_ADDRESSES, b"addr").is_none());
        assert_eq!(get(&handles, CF_HISTORY, b"taken").unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_update_requires_expected_value() {
        let (handles, _temp) = create_test_db();

        let mut writer = AtomicBatchWriter::new(handles.clone());
        writer.put("seed", CF_ADDRESSES, b"k".to_vec(), b"v1".to_vec()).unwrap();
        writer.flush().await.unwrap();

        // Stale snapshot
        writer.update("1_address", CF_ADDRESSES, b"k".to_vec(), b"v3".to_vec(), Some(b"v0".to_vec())).unwrap();
        let err = writer.flush().await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { ref key } if key == "1_address"));
        assert!(err.is_retryable());
        assert_eq!(get(&handles, CF_ADDRESSES, b"k").unwrap(), b"v1");

        // Fresh snapshot
        writer.update("1_address", CF_ADDRESSES, b"k".to_vec(), b"v2".to_vec(), Some(b"v1".to_vec())).unwrap();
        writer.flush().await.unwrap();
        assert_eq!(get(&handles, CF_ADDRESSES, b"k").unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_missing_cf_fails_whole_batch() {
        let (handles, _temp) = create_test_db();
        let mut writer = AtomicBatchWriter::new(handles.clone());

        writer.put("1_address", CF_ADDRESSES, b"k".to_vec(), b"v".to_vec()).unwrap();
        writer.put("1_bogus", "no_such_cf", b"k".to_vec(), b"v".to_vec()).unwrap();

        assert!(matches!(writer.flush().await, Err(LedgerError::Commit(_))));
        assert!(get(&handles, CF_ADDRESSES, b"k").is_none());
    }

    #[tokio::test]
    async fn test_stale_value_reported_before_collision() {
        let (handles, _temp) = create_test_db();

        let mut writer = AtomicBatchWriter::new(handles.clone());
        writer.put("seed_h", CF_HISTORY, b"h".to_vec(), b"old".to_vec()).unwrap();
        writer.put("seed_c", CF_ADDRESSES, b"c".to_vec(), b"2".to_vec()).unwrap();
        writer.flush().await.unwrap();

        writer.insert("1_history", CF_HISTORY, b"h".to_vec(), b"new".to_vec()).unwrap();
        writer.update("cursor", CF_ADDRESSES, b"c".to_vec(), b"3".to_vec(), Some(b"1".to_vec())).unwrap();
        let err = writer.flush().await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { ref key } if key == "cursor"));
    }

    #[tokio::test]
    async fn test_update_from_absent_is_retryable_conflict() {
        let (handles, _temp) = create_test_db();

        let mut writer = AtomicBatchWriter::new(handles.clone());
        writer.update("A1_create", CF_ADDRESSES, b"idx".to_vec(), b"1".to_vec(), None).unwrap();
        writer.flush().await.unwrap();

        // A second creator racing for the same slot
        writer.update("A1_create", CF_ADDRESSES, b"idx".to_vec(), b"2".to_vec(), None).unwrap();
        let err = writer.flush().await.unwrap_err();
        assert!(matches!(err, LedgerError::VersionConflict { ref key } if key == "A1_create"));
        assert_eq!(get(&handles, CF_ADDRESSES, b"idx").unwrap(), b"1");
    }
}
