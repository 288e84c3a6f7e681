use std::path::Path;
use std::sync::{Arc, Mutex};
use rocksdb::{ColumnFamily, Options, DB};
use tracing::info;

use crate::constants::REQUIRED_CFS;
use crate::error::{LedgerError, Result};

/// Shared handle to the ledger database
///
/// Validates at construction that every ledger column family exists, so
/// later lookups only fail on programming errors. Clones share one commit
/// lock: conditional batches are checked and written while holding it.
#[derive(Clone)]
pub struct DbHandles {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

impl DbHandles {
    /// Open (or create) the ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path.as_ref(), REQUIRED_CFS)?;
        info!(path = %path.as_ref().display(), "Ledger database opened");
        Self::new(Arc::new(db))
    }

    /// Open an existing ledger database without write access.
    /// Fails instead of creating anything when `path` holds no ledger.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(false);

        let db = DB::open_cf_for_read_only(&opts, path.as_ref(), REQUIRED_CFS, false)?;
        info!(path = %path.as_ref().display(), "Ledger database opened read-only");
        Self::new(Arc::new(db))
    }

    /// Wrap an already opened database
    pub fn new(db: Arc<DB>) -> Result<Self> {
        for cf_name in REQUIRED_CFS {
            if db.cf_handle(cf_name).is_none() {
                return Err(LedgerError::Storage(format!(
                    "{} column family not found",
                    cf_name
                )));
            }
        }

        Ok(Self {
            db,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn db(&self) -> &Arc<DB> {
        &self.db
    }

    pub fn commit_lock(&self) -> &Arc<Mutex<()>> {
        &self.commit_lock
    }

    pub fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| LedgerError::Storage(format!("{} column family not found", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_all_cfs() {
        let temp_dir = TempDir::new().unwrap();
        let handles = DbHandles::open(temp_dir.path()).unwrap();
        for cf_name in REQUIRED_CFS {
            assert!(handles.cf(cf_name).is_ok());
        }
        assert!(handles.cf("blocks").is_err());
    }

    #[test]
    fn test_new_rejects_missing_cf() {
        let temp_dir = TempDir::new().unwrap();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, temp_dir.path(), ["addresses"]).unwrap();
        assert!(DbHandles::new(Arc::new(db)).is_err());
    }

    #[test]
    fn test_read_only_open_never_creates() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("no_ledger_here");
        assert!(DbHandles::open_read_only(&missing).is_err());
        assert!(!missing.exists());

        let path = temp_dir.path().join("ledger");
        {
            let handles = DbHandles::open(&path).unwrap();
            let cf = handles.cf(crate::constants::CF_CHAIN_METADATA).unwrap();
            handles.db().put_cf(cf, b"k", b"v").unwrap();
        }
        let handles = DbHandles::open_read_only(&path).unwrap();
        let cf = handles.cf(crate::constants::CF_CHAIN_METADATA).unwrap();
        assert_eq!(handles.db().get_cf(cf, b"k").unwrap().unwrap(), b"v");
    }
}
