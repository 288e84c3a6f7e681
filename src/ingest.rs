/// Block ingestion
///
/// `BlockIngestor` feeds a block's transactions to the engine in order and
/// owns the retry/halt policy. `LedgerWriter` runs one ingestor on its own
/// task behind a bounded queue, which makes it the only writer of the ledger:
/// blocks are applied strictly in the order they were submitted.
///
/// Every committed transaction also moves the stored ingest cursor
/// (height, tx_index) in its own batch. A block that halted partway can be
/// submitted again: transactions at or below the cursor are skipped.

use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address_store::AddressStore;
use crate::engine::LedgerEngine;
use crate::error::{LedgerError, Result};
use crate::metrics;
use crate::telemetry::truncate_hex;
use crate::types::{BlockPayload, TxCursor};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    pub transactions: usize,
    pub committed: usize,
    /// Committed by an earlier attempt at this block
    pub skipped: usize,
    pub addresses_created: usize,
    pub claims: usize,
    pub retries: u32,
}

impl fmt::Display for BlockSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "block {}: {} transactions ({} committed, {} skipped), {} new addresses, {} claims",
            self.height,
            self.transactions,
            self.committed,
            self.skipped,
            self.addresses_created,
            self.claims
        )
    }
}

pub struct BlockIngestor<S: AddressStore + ?Sized> {
    engine: LedgerEngine<S>,
    commit_retries: u32,
    last_height: Option<u64>,
    cursor: Option<TxCursor>,
}

impl<S: AddressStore + ?Sized> BlockIngestor<S> {
    /// Ingestor for an empty store
    pub fn new(engine: LedgerEngine<S>, commit_retries: u32) -> Self {
        Self {
            engine,
            commit_retries,
            last_height: None,
            cursor: None,
        }
    }

    /// Pick up from the last height and transaction the store has recorded
    pub async fn resume(engine: LedgerEngine<S>, commit_retries: u32) -> Result<Self> {
        let last_height = engine.store().ingest_height().await?;
        let cursor = engine.store().ingest_cursor().await?;
        if last_height.is_some() || cursor.is_some() {
            info!(
                height = ?last_height,
                cursor = %cursor.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                "Resuming ingestion"
            );
        }
        Ok(Self {
            engine,
            commit_retries,
            last_height,
            cursor,
        })
    }

    /// Height of the last fully ingested block
    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    /// Last transaction this ingestor knows to be committed
    pub fn cursor(&self) -> Option<TxCursor> {
        self.cursor
    }

    fn already_applied(&self, position: TxCursor) -> bool {
        self.cursor.is_some_and(|c| position <= c)
    }

    fn check_block(&self, block: &BlockPayload) -> Result<()> {
        if let Some(last) = self.last_height {
            if block.height <= last {
                return Err(LedgerError::Payload(format!(
                    "block {} arrived after block {}",
                    block.height, last
                )));
            }
        }
        let mut previous: Option<u32> = None;
        for tx in &block.transactions {
            if tx.block_height != block.height {
                return Err(LedgerError::Payload(format!(
                    "transaction {} claims height {} inside block {}",
                    tx.txid, tx.block_height, block.height
                )));
            }
            if previous.is_some_and(|index| tx.tx_index <= index) {
                return Err(LedgerError::Payload(format!(
                    "transaction {} has index {} out of order in block {}",
                    tx.txid, tx.tx_index, block.height
                )));
            }
            previous = Some(tx.tx_index);
        }
        Ok(())
    }

    /// Apply every transaction of the block in order.
    ///
    /// A version conflict re-runs the transaction from a fresh snapshot up to
    /// `commit_retries` times. Any other failure halts the block: transactions
    /// before it stay committed, the failing one and those after it are not
    /// applied, and the ingest height is not advanced. Submitting the block
    /// again skips what the cursor shows as committed.
    pub async fn ingest_block(&mut self, block: &BlockPayload) -> Result<BlockSummary> {
        self.check_block(block)?;

        let mut summary = BlockSummary {
            height: block.height,
            transactions: block.transactions.len(),
            ..Default::default()
        };

        for tx in &block.transactions {
            let position = TxCursor::of(tx);
            let mut attempt = 0;
            let committed = loop {
                if self.already_applied(position) {
                    break None;
                }
                match self.engine.process_ordered(tx, self.cursor).await {
                    Ok(committed) => break Some(committed),
                    Err(e) if e.is_retryable() && attempt < self.commit_retries => {
                        attempt += 1;
                        summary.retries += 1;
                        warn!(
                            height = block.height,
                            txid = %truncate_hex(&tx.txid, 16),
                            attempt,
                            error = %e,
                            "Retrying transaction from fresh snapshot"
                        );
                        self.cursor = self.engine.store().ingest_cursor().await?;
                    }
                    Err(e) => {
                        error!(
                            height = block.height,
                            txid = %truncate_hex(&tx.txid, 16),
                            error = %e,
                            "Halting block"
                        );
                        return Err(e);
                    }
                }
            };

            let Some(committed) = committed else {
                debug!(height = block.height, txid = %truncate_hex(&tx.txid, 16), "Already committed");
                summary.skipped += 1;
                continue;
            };
            if committed.operations > 0 {
                summary.committed += 1;
                self.cursor = Some(position);
            }
            summary.addresses_created += committed.created;
            summary.claims += committed.claims;
        }

        self.engine.store().record_ingest_height(block.height).await?;
        self.last_height = Some(block.height);
        metrics::record_block_ingested(block.height);
        info!("{}", summary);
        Ok(summary)
    }
}

struct WriteRequest {
    block: BlockPayload,
    reply: oneshot::Sender<Result<BlockSummary>>,
}

/// Handle to the single ledger writer task
#[derive(Clone)]
pub struct LedgerWriter {
    tx: mpsc::Sender<WriteRequest>,
}

impl LedgerWriter {
    /// Move the ingestor onto its own task.
    ///
    /// The task stops after the first failed block, or once every handle has
    /// been dropped, and hands the ingestor back through the join handle.
    pub fn spawn<S>(mut ingestor: BlockIngestor<S>, queue_depth: usize) -> (Self, JoinHandle<BlockIngestor<S>>)
    where
        S: AddressStore + ?Sized + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(queue_depth.max(1));
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let result = ingestor.ingest_block(&request.block).await;
                let failed = result.is_err();
                if request.reply.send(result).is_err() {
                    warn!(height = request.block.height, "Block submitter went away before the reply");
                }
                if failed {
                    error!("Ledger writer halted");
                    break;
                }
            }
            ingestor
        });
        (Self { tx }, handle)
    }

    /// Queue a block and wait for it to be applied
    pub async fn submit(&self, block: BlockPayload) -> Result<BlockSummary> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(WriteRequest { block, reply })
            .await
            .map_err(|_| LedgerError::Commit("ledger writer is not running".to_string()))?;
        response
            .await
            .map_err(|_| LedgerError::Commit("ledger writer stopped before replying".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_store::{CommitBatch, RocksAddressStore};
    use crate::balance::BalancePolicy;
    use crate::db_handles::DbHandles;
    use crate::types::{Address, NewAddress, TxKind, TxPayload, Vout};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_test_store() -> (Arc<RocksAddressStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let handles = DbHandles::open(temp_dir.path()).unwrap();
        (Arc::new(RocksAddressStore::new(handles).unwrap()), temp_dir)
    }

    fn payout(txid: &str, height: u64, tx_index: u32, address: &str, value: i64) -> TxPayload {
        TxPayload {
            txid: txid.to_string(),
            tx_index,
            block_height: height,
            time: 1_000 + height as i64,
            kind: TxKind::Miner,
            vins: vec![],
            vouts: vec![Vout {
                address: address.to_string(),
                asset: "NEO".to_string(),
                value: Decimal::new(value, 0),
                symbol: None,
            }],
            claim: None,
        }
    }

    fn block(height: u64, transactions: Vec<TxPayload>) -> BlockPayload {
        BlockPayload {
            height,
            time: 1_000 + height as i64,
            transactions,
        }
    }

    /// Reports a conflict for the first `conflicts` submits and fails submit
    /// number `fail_submit` (1-based, 0 = never); everything else delegates
    struct FaultyStore {
        inner: Arc<RocksAddressStore>,
        conflicts: AtomicU32,
        fail_submit: usize,
        submits: AtomicUsize,
    }

    impl FaultyStore {
        fn conflicting(inner: Arc<RocksAddressStore>, conflicts: u32) -> Self {
            Self { inner, conflicts: AtomicU32::new(conflicts), fail_submit: 0, submits: AtomicUsize::new(0) }
        }

        fn failing_on(inner: Arc<RocksAddressStore>, submit: usize) -> Self {
            Self { inner, conflicts: AtomicU32::new(0), fail_submit: submit, submits: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl AddressStore for FaultyStore {
        async fn find_by_identifiers(&self, identifiers: &[String]) -> Result<Vec<Address>> {
            self.inner.find_by_identifiers(identifiers).await
        }

        async fn next_address_id(&self) -> Result<u64> {
            self.inner.next_address_id().await
        }

        async fn create(&self, attrs: NewAddress) -> Result<Address> {
            self.inner.create(attrs).await
        }

        async fn submit(&self, batch: CommitBatch) -> Result<()> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_submit {
                return Err(LedgerError::Commit("disk full".into()));
            }
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(LedgerError::VersionConflict { key: "address_ids".into() });
            }
            self.inner.submit(batch).await
        }

        async fn ingest_height(&self) -> Result<Option<u64>> {
            self.inner.ingest_height().await
        }

        async fn record_ingest_height(&self, height: u64) -> Result<()> {
            self.inner.record_ingest_height(height).await
        }

        async fn ingest_cursor(&self) -> Result<Option<TxCursor>> {
            self.inner.ingest_cursor().await
        }
    }

    #[tokio::test]
    async fn test_blocks_applied_in_order() {
        let (store, _temp) = create_test_store();
        let engine = LedgerEngine::new(store.clone(), BalancePolicy::Tolerate);
        let mut ingestor = BlockIngestor::new(engine, 0);

        let summary = ingestor
            .ingest_block(&block(1, vec![payout("0x01", 1, 0, "A", 10), payout("0x02", 1, 1, "A", 5)]))
            .await
            .unwrap();
        assert_eq!(summary.committed, 2);
        assert_eq!(summary.addresses_created, 1);
        assert_eq!(store.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(15, 0));
        assert_eq!(store.ingest_height().await.unwrap(), Some(1));

        // Replaying or going backwards is refused before anything is applied
        let err = ingestor.ingest_block(&block(1, vec![payout("0x03", 1, 0, "A", 1)])).await.unwrap_err();
        assert!(matches!(err, LedgerError::Payload(_)));
        assert_eq!(store.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(15, 0));
    }

    #[tokio::test]
    async fn test_mismatched_transaction_height_rejected() {
        let (store, _temp) = create_test_store();
        let mut ingestor = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 0);
        let err = ingestor
            .ingest_block(&block(4, vec![payout("0x01", 4, 0, "A", 1), payout("0x02", 5, 1, "B", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Payload(_)));
        assert!(store.get_address("A").await.unwrap().is_none());
        assert_eq!(ingestor.last_height(), None);

        let err = ingestor
            .ingest_block(&block(4, vec![payout("0x01", 4, 1, "A", 1), payout("0x02", 4, 1, "B", 1)]))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Payload(ref m) if m.contains("out of order")));
        assert!(store.get_address("A").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_block_resubmitted_after_failure() {
        let (inner, _temp) = create_test_store();
        let block1 = block(1, vec![payout("0x01", 1, 0, "A", 10), payout("0x02", 1, 1, "B", 5)]);

        let store = Arc::new(FaultyStore::failing_on(inner.clone(), 2));
        let mut ingestor = BlockIngestor::new(LedgerEngine::new(store, BalancePolicy::Tolerate), 3);
        let err = ingestor.ingest_block(&block1).await.unwrap_err();
        assert!(matches!(err, LedgerError::Commit(_)));
        assert_eq!(inner.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(10, 0));
        assert!(inner.get_address("B").await.unwrap().is_none());
        assert_eq!(inner.ingest_height().await.unwrap(), None);
        assert_eq!(inner.ingest_cursor().await.unwrap(), Some(TxCursor { height: 1, tx_index: 0 }));

        let mut ingestor = BlockIngestor::resume(LedgerEngine::new(inner.clone(), BalancePolicy::Tolerate), 0)
            .await
            .unwrap();
        let summary = ingestor.ingest_block(&block1).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.committed, 1);

        let a = inner.get_address("A").await.unwrap().unwrap();
        assert_eq!(a.amount("NEO"), Decimal::new(10, 0));
        assert_eq!(inner.history("A", 10).await.unwrap().len(), 1);
        assert_eq!(inner.get_address("B").await.unwrap().unwrap().amount("NEO"), Decimal::new(5, 0));
        assert_eq!(inner.ingest_height().await.unwrap(), Some(1));
        assert_eq!(inner.ingest_cursor().await.unwrap(), Some(TxCursor { height: 1, tx_index: 1 }));
    }

    #[tokio::test]
    async fn test_stale_cursor_reloaded_on_conflict() {
        let (store, _temp) = create_test_store();
        let block1 = block(1, vec![payout("0x01", 1, 0, "A", 10), payout("0x02", 1, 1, "B", 5)]);

        let mut first = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 0);
        first.ingest_block(&block(1, vec![payout("0x01", 1, 0, "A", 10)])).await.unwrap();

        // Knows nothing of the committed transaction; the guarded cursor
        // rejects its first attempt and the retry picks up the stored one
        let mut second = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 1);
        let summary = second.ingest_block(&block1).await.unwrap();
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.committed, 1);
        assert_eq!(store.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(10, 0));
        assert_eq!(store.get_address("B").await.unwrap().unwrap().amount("NEO"), Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn test_already_recorded_transaction_not_retried() {
        let (store, _temp) = create_test_store();
        let engine = LedgerEngine::new(store.clone(), BalancePolicy::Tolerate);
        engine.process_transaction(&payout("0x01", 1, 0, "A", 10)).await.unwrap();

        // Cursor never moved, so only the history collision can stop the replay
        let mut ingestor = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 5);
        let err = ingestor.ingest_block(&block(1, vec![payout("0x01", 1, 0, "A", 10)])).await.unwrap_err();
        assert!(matches!(err, LedgerError::RecordExists { .. }));
        assert!(!err.is_retryable());
        assert_eq!(store.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(10, 0));
    }

    #[tokio::test]
    async fn test_conflict_retried_up_to_limit() {
        let (inner, _temp) = create_test_store();
        let store = Arc::new(FaultyStore::conflicting(inner.clone(), 2));
        let mut ingestor = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 2);

        let summary = ingestor.ingest_block(&block(1, vec![payout("0x01", 1, 0, "A", 3)])).await.unwrap();
        assert_eq!(summary.retries, 2);
        assert_eq!(inner.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(3, 0));
    }

    #[tokio::test]
    async fn test_conflict_halts_without_retries() {
        let (inner, _temp) = create_test_store();
        let store = Arc::new(FaultyStore::conflicting(inner.clone(), 1));
        let mut ingestor = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 0);

        let err = ingestor.ingest_block(&block(1, vec![payout("0x01", 1, 0, "A", 3)])).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(inner.get_address("A").await.unwrap().is_none());
        assert_eq!(inner.ingest_height().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_resume_from_recorded_height() {
        let (store, _temp) = create_test_store();
        store.record_ingest_height(41).await.unwrap();
        let ingestor = BlockIngestor::resume(LedgerEngine::new(store, BalancePolicy::Tolerate), 0)
            .await
            .unwrap();
        assert_eq!(ingestor.last_height(), Some(41));
        assert_eq!(ingestor.cursor(), None);
    }

    #[tokio::test]
    async fn test_writer_serializes_blocks() {
        let (store, _temp) = create_test_store();
        let ingestor = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 0);
        let (writer, handle) = LedgerWriter::spawn(ingestor, 4);

        let submit = |height: u64| {
            let txid = format!("0x{:02}", height);
            writer.submit(block(height, vec![payout(&txid, height, 0, "A", 1)]))
        };
        // join! polls in argument order, so blocks are queued 1..=5
        let (r1, r2, r3, r4, r5) = tokio::join!(submit(1), submit(2), submit(3), submit(4), submit(5));
        for result in [r1, r2, r3, r4, r5] {
            result.unwrap();
        }

        drop(writer);
        let ingestor = handle.await.unwrap();
        assert_eq!(ingestor.last_height(), Some(5));

        let history = store.history("A", 10).await.unwrap();
        let heights: Vec<u64> = history.iter().map(|h| h.block_height).collect();
        assert_eq!(heights, vec![5, 4, 3, 2, 1]);
        assert_eq!(store.get_address("A").await.unwrap().unwrap().amount("NEO"), Decimal::new(5, 0));
    }

    #[tokio::test]
    async fn test_writer_halts_after_failure() {
        let (store, _temp) = create_test_store();
        let ingestor = BlockIngestor::new(LedgerEngine::new(store.clone(), BalancePolicy::Tolerate), 0);
        let (writer, handle) = LedgerWriter::spawn(ingestor, 1);

        writer.submit(block(2, vec![payout("0x01", 2, 0, "A", 1)])).await.unwrap();
        assert!(writer.submit(block(1, vec![payout("0x02", 1, 0, "A", 1)])).await.is_err());

        let ingestor = handle.await.unwrap();
        assert_eq!(ingestor.last_height(), Some(2));
        let err = writer.submit(block(3, vec![payout("0x03", 3, 0, "A", 1)])).await.unwrap_err();
        assert!(matches!(err, LedgerError::Commit(_)));
    }
}
