use rust_decimal::Decimal;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Failures surfaced by the ledger engine and its store.
///
/// Every variant is fatal for the transaction being processed: nothing from
/// that transaction is written when one of these is returned.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("debit of {value} {asset} from {address} would leave balance at {balance}")]
    Underflow {
        address: String,
        asset: String,
        balance: Decimal,
        value: Decimal,
    },

    #[error("commit rejected: {0}")]
    Commit(String),

    #[error("{key} changed since it was read")]
    VersionConflict { key: String },

    #[error("{key} is already recorded")]
    RecordExists { key: String },

    #[error("operation key used twice in one batch: {0}")]
    DuplicateOperation(String),

    #[error("malformed claim: {0}")]
    MalformedClaim(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Short label used for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            LedgerError::Underflow { .. } => "underflow",
            LedgerError::Commit(_) => "commit",
            LedgerError::VersionConflict { .. } => "version_conflict",
            LedgerError::RecordExists { .. } => "record_exists",
            LedgerError::DuplicateOperation(_) => "duplicate_operation",
            LedgerError::MalformedClaim(_) => "malformed_claim",
            LedgerError::Payload(_) => "payload",
            LedgerError::Storage(_) => "storage",
            LedgerError::Codec(_) => "codec",
            LedgerError::Config(_) => "config",
        }
    }

    /// Conflicts are the only failures a caller may retry from a fresh snapshot.
    /// `RecordExists` means the transaction was applied before; retrying it
    /// can never succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::VersionConflict { .. })
    }
}

impl From<rocksdb::Error> for LedgerError {
    fn from(e: rocksdb::Error) -> Self {
        LedgerError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for LedgerError {
    fn from(e: bincode::Error) -> Self {
        LedgerError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Payload(e.to_string())
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(e: config::ConfigError) -> Self {
        LedgerError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for LedgerError {
    fn from(e: tokio::task::JoinError) -> Self {
        LedgerError::Storage(format!("blocking task failed: {}", e))
    }
}
