pub mod error;
pub mod constants;
pub mod types;
pub mod tx_keys;
pub mod db_handles;
pub mod metrics;
pub mod telemetry;
pub mod config;
pub mod atomic_writer;
pub mod address_store;
pub mod lookup;
pub mod vin_grouping;
pub mod balance;
pub mod claims;
pub mod commit;
pub mod engine;
pub mod ingest;


pub use address_store::{AddressStore, CommitBatch, LedgerOp, RocksAddressStore};
pub use balance::BalancePolicy;
pub use commit::CommitSummary;
pub use db_handles::DbHandles;
pub use engine::LedgerEngine;
pub use error::{LedgerError, Result};
pub use ingest::{BlockIngestor, BlockSummary, LedgerWriter};
pub use types::{Address, BlockPayload, Claim, HistoryEntry, TxCursor, TxKind, TxPayload};
