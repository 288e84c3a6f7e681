/// Address Store
///
/// Durable home of address records, history entries and claims.
///
/// The engine talks to it through the `AddressStore` trait:
/// - `find_by_identifiers`: one batch lookup for a transaction's address set
/// - `next_address_id`: id cursor used to stage new addresses
/// - `create`: standalone create (genesis seeding, tools)
/// - `submit`: keyed multi-operation commit, all-or-nothing
///
/// `RocksAddressStore` implements it on top of `AtomicBatchWriter`; read-side
/// queries for the CLI and tools live on the concrete type.

use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode};
use tracing::debug;

use crate::atomic_writer::AtomicBatchWriter;
use crate::constants::{
    CF_ADDRESSES, CF_ADDRESS_INDEX, CF_CHAIN_METADATA, CF_CLAIMS, CF_HISTORY,
    FIRST_ADDRESS_ID, META_INGEST_CURSOR, META_INGEST_HEIGHT, META_NEXT_ADDRESS_ID,
};
use crate::db_handles::DbHandles;
use crate::error::{LedgerError, Result};
use crate::tx_keys::{
    address_index_key, address_key, address_prefix, claim_key, decode_u64, history_key,
    prefix_upper_bound,
};
use crate::types::{Address, Claim, HistoryEntry, NewAddress, TxCursor};

/// One ledger mutation inside a commit batch
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOp {
    /// Create-if-absent: fails the batch if the address string is already indexed
    CreateAddress(Address),
    /// Overwrite guarded by the snapshot the change was computed from
    UpdateAddress { snapshot: Address, updated: Address },
    /// Append-only; an existing entry means the transaction was already applied
    InsertHistory(HistoryEntry),
    InsertClaim(Claim),
    /// Move the id cursor from `expected` to `next`
    AdvanceAddressIds { expected: u64, next: u64 },
    /// Record the last committed transaction; `expected` is None before the first one
    AdvanceIngestCursor { expected: Option<TxCursor>, next: TxCursor },
}

/// Keyed operations submitted as one atomic unit
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CommitBatch {
    ops: Vec<(String, LedgerOp)>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation; keys must be unique within the batch
    pub fn push(&mut self, op_key: impl Into<String>, op: LedgerOp) -> Result<()> {
        let op_key = op_key.into();
        if self.ops.iter().any(|(k, _)| *k == op_key) {
            return Err(LedgerError::DuplicateOperation(op_key));
        }
        self.ops.push((op_key, op));
        Ok(())
    }

    pub fn ops(&self) -> &[(String, LedgerOp)] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
pub trait AddressStore: Send + Sync {
    /// Existing records for the given address strings, in request order.
    /// Unknown addresses are simply absent from the result.
    async fn find_by_identifiers(&self, identifiers: &[String]) -> Result<Vec<Address>>;

    /// Id the next created address will receive
    async fn next_address_id(&self) -> Result<u64>;

    /// Create one zero-balance address in its own atomic batch
    async fn create(&self, attrs: NewAddress) -> Result<Address>;

    /// Apply every operation or none
    async fn submit(&self, batch: CommitBatch) -> Result<()>;

    /// Height of the last fully ingested block, if the store tracks one
    async fn ingest_height(&self) -> Result<Option<u64>> {
        Ok(None)
    }

    async fn record_ingest_height(&self, _height: u64) -> Result<()> {
        Ok(())
    }

    /// Last transaction committed through `AdvanceIngestCursor`
    async fn ingest_cursor(&self) -> Result<Option<TxCursor>> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct RocksAddressStore {
    handles: DbHandles,
}

impl RocksAddressStore {
    /// Wrap the database and seed the id cursor on first use
    pub fn new(handles: DbHandles) -> Result<Self> {
        let cf = handles.cf(CF_CHAIN_METADATA)?;
        if handles.db().get_cf(cf, META_NEXT_ADDRESS_ID)?.is_none() {
            handles
                .db()
                .put_cf(cf, META_NEXT_ADDRESS_ID, FIRST_ADDRESS_ID.to_be_bytes())?;
        }
        Ok(Self { handles })
    }

    fn read_next_id(handles: &DbHandles) -> Result<u64> {
        let cf = handles.cf(CF_CHAIN_METADATA)?;
        let bytes = handles
            .db()
            .get_cf(cf, META_NEXT_ADDRESS_ID)?
            .ok_or_else(|| LedgerError::Storage("address id cursor missing".to_string()))?;
        decode_u64(&bytes)
            .ok_or_else(|| LedgerError::Codec("address id cursor is not 8 bytes".to_string()))
    }

    /// Index lookups in one `multi_get_cf`, then the records in another.
    /// Keeps request order and skips unknown addresses.
    fn read_addresses(handles: &DbHandles, identifiers: &[String]) -> Result<Vec<Address>> {
        let db = handles.db();
        let cf_index = handles.cf(CF_ADDRESS_INDEX)?;
        let index_hits = db.multi_get_cf(
            identifiers.iter().map(|identifier| (cf_index, address_index_key(identifier))),
        );

        let mut indexed = Vec::new();
        for (identifier, hit) in identifiers.iter().zip(index_hits) {
            if let Some(bytes) = hit? {
                let id = decode_u64(&bytes).ok_or_else(|| {
                    LedgerError::Codec(format!("bad index entry for {}", identifier))
                })?;
                indexed.push((identifier, id));
            }
        }

        let cf_addresses = handles.cf(CF_ADDRESSES)?;
        let records = db.multi_get_cf(indexed.iter().map(|(_, id)| (cf_addresses, address_key(*id))));
        indexed
            .into_iter()
            .zip(records)
            .map(|((identifier, id), record)| -> Result<Address> {
                match record? {
                    Some(bytes) => Ok(bincode::deserialize(&bytes)?),
                    None => Err(LedgerError::Storage(format!(
                        "address {} indexed as {} but record missing",
                        identifier, id
                    ))),
                }
            })
            .collect()
    }

    /// Point lookup by address string
    pub async fn get_address(&self, address: &str) -> Result<Option<Address>> {
        let handles = self.handles.clone();
        let address = address.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Address>> {
            Ok(Self::read_addresses(&handles, &[address])?.pop())
        })
        .await?
    }

    /// History of one address, newest block first
    pub async fn history(&self, address: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(record) = self.get_address(address).await? else {
            return Ok(Vec::new());
        };
        let handles = self.handles.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<HistoryEntry>> {
            let cf = handles.cf(CF_HISTORY)?;
            let prefix = address_prefix(record.id);
            let upper = prefix_upper_bound(&prefix);
            // Keys are id ‖ height ‖ tx_index ‖ txid, so walking back from the
            // next id yields this address newest-first.
            let mode = match &upper {
                Some(upper) => IteratorMode::From(upper.as_slice(), Direction::Reverse),
                None => IteratorMode::End,
            };

            let mut entries = Vec::new();
            for item in handles.db().iterator_cf(cf, mode) {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                entries.push(bincode::deserialize(&value)?);
                if entries.len() >= limit {
                    break;
                }
            }
            Ok(entries)
        })
        .await?
    }

    /// Every claim recorded for one address, oldest first
    pub async fn claims(&self, address: &str) -> Result<Vec<Claim>> {
        let Some(record) = self.get_address(address).await? else {
            return Ok(Vec::new());
        };
        let handles = self.handles.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Claim>> {
            let cf = handles.cf(CF_CLAIMS)?;
            let prefix = address_prefix(record.id);
            let mut claims = Vec::new();
            let mode = IteratorMode::From(prefix.as_slice(), Direction::Forward);
            for item in handles.db().iterator_cf(cf, mode) {
                let (key, value) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                claims.push(bincode::deserialize(&value)?);
            }
            Ok(claims)
        })
        .await?
    }

    /// Number of addresses ever created
    pub async fn address_count(&self) -> Result<u64> {
        Ok(self.next_address_id().await? - FIRST_ADDRESS_ID)
    }

    fn read_ingest_height(handles: &DbHandles) -> Result<Option<u64>> {
        let cf = handles.cf(CF_CHAIN_METADATA)?;
        Ok(handles
            .db()
            .get_cf(cf, META_INGEST_HEIGHT)?
            .and_then(|bytes| decode_u64(&bytes)))
    }

    fn read_ingest_cursor(handles: &DbHandles) -> Result<Option<TxCursor>> {
        let cf = handles.cf(CF_CHAIN_METADATA)?;
        match handles.db().get_cf(cf, META_INGEST_CURSOR)? {
            Some(bytes) => TxCursor::from_bytes(&bytes)
                .map(Some)
                .ok_or_else(|| LedgerError::Codec("ingest cursor is not 12 bytes".to_string())),
            None => Ok(None),
        }
    }

    /// Translate ledger operations into keyed writer operations
    fn stage(&self, batch: &CommitBatch) -> Result<AtomicBatchWriter> {
        let mut writer = AtomicBatchWriter::new(self.handles.clone());
        for (op_key, op) in batch.ops() {
            match op {
                // A racing creator may have taken the address or the id;
                // both are conflicts a fresh snapshot resolves
                LedgerOp::CreateAddress(address) => {
                    writer.update(
                        op_key,
                        CF_ADDRESS_INDEX,
                        address_index_key(&address.address),
                        address_key(address.id),
                        None,
                    )?;
                    writer.update(
                        &format!("{}_record", op_key),
                        CF_ADDRESSES,
                        address_key(address.id),
                        bincode::serialize(address)?,
                        None,
                    )?;
                }
                LedgerOp::UpdateAddress { snapshot, updated } => {
                    writer.update(
                        op_key,
                        CF_ADDRESSES,
                        address_key(updated.id),
                        bincode::serialize(updated)?,
                        Some(bincode::serialize(snapshot)?),
                    )?;
                }
                LedgerOp::InsertHistory(entry) => {
                    writer.insert(
                        op_key,
                        CF_HISTORY,
                        history_key(entry.address_id, entry.block_height, entry.tx_index, &entry.txid),
                        bincode::serialize(entry)?,
                    )?;
                }
                LedgerOp::InsertClaim(claim) => {
                    writer.insert(
                        op_key,
                        CF_CLAIMS,
                        claim_key(claim.address_id, claim.block_index, &claim.claim_txid),
                        bincode::serialize(claim)?,
                    )?;
                }
                LedgerOp::AdvanceAddressIds { expected, next } => {
                    writer.update(
                        op_key,
                        CF_CHAIN_METADATA,
                        META_NEXT_ADDRESS_ID.to_vec(),
                        next.to_be_bytes().to_vec(),
                        Some(expected.to_be_bytes().to_vec()),
                    )?;
                }
                LedgerOp::AdvanceIngestCursor { expected, next } => {
                    writer.update(
                        op_key,
                        CF_CHAIN_METADATA,
                        META_INGEST_CURSOR.to_vec(),
                        next.to_bytes(),
                        expected.map(TxCursor::to_bytes),
                    )?;
                }
            }
        }
        Ok(writer)
    }
}

#[async_trait]
impl AddressStore for RocksAddressStore {
    async fn find_by_identifiers(&self, identifiers: &[String]) -> Result<Vec<Address>> {
        let handles = self.handles.clone();
        let identifiers = identifiers.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Vec<Address>> {
            let found = Self::read_addresses(&handles, &identifiers)?;
            debug!(requested = identifiers.len(), found = found.len(), "Address lookup");
            Ok(found)
        })
        .await?
    }

    async fn next_address_id(&self) -> Result<u64> {
        let handles = self.handles.clone();
        tokio::task::spawn_blocking(move || Self::read_next_id(&handles)).await?
    }

    async fn create(&self, attrs: NewAddress) -> Result<Address> {
        let id = self.next_address_id().await?;
        let address = Address {
            id,
            address: attrs.address,
            balance: Default::default(),
            time: attrs.time,
            version: 0,
        };

        let mut batch = CommitBatch::new();
        batch.push(format!("{}_create", id), LedgerOp::CreateAddress(address.clone()))?;
        batch.push(
            "address_ids",
            LedgerOp::AdvanceAddressIds { expected: id, next: id + 1 },
        )?;
        self.submit(batch).await?;
        Ok(address)
    }

    async fn submit(&self, batch: CommitBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut writer = self.stage(&batch)?;
        debug!(ops = batch.len(), writes = writer.pending_count(), "Submitting batch");
        writer.flush().await
    }

    async fn ingest_height(&self) -> Result<Option<u64>> {
        let handles = self.handles.clone();
        tokio::task::spawn_blocking(move || Self::read_ingest_height(&handles)).await?
    }

    async fn record_ingest_height(&self, height: u64) -> Result<()> {
        let handles = self.handles.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let cf = handles.cf(CF_CHAIN_METADATA)?;
            handles.db().put_cf(cf, META_INGEST_HEIGHT, height.to_be_bytes())?;
            Ok(())
        })
        .await?
    }

    async fn ingest_cursor(&self) -> Result<Option<TxCursor>> {
        let handles = self.handles.clone();
        tokio::task::spawn_blocking(move || Self::read_ingest_cursor(&handles)).await?
    }
}
