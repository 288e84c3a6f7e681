/// Address-balance update engine
///
/// `process_transaction` applies one transaction's address effects:
/// lookup, materialization, input folds, output folds, claim, then a single
/// atomic commit. Nothing reaches the store before the commit, so any error
/// raised along the way leaves the ledger untouched.
///
/// `process_ordered` does the same for a transaction read off the chain in
/// order, and moves the stored ingest cursor inside that same commit.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::address_store::{AddressStore, LedgerOp};
use crate::balance::{apply_credits, apply_debits, BalancePolicy};
use crate::claims::apply_claim;
use crate::commit::{build_commit_batch, commit, CommitSummary};
use crate::error::Result;
use crate::lookup::{lookup_identifiers, resolve_working_set};
use crate::metrics;
use crate::telemetry::truncate_hex;
use crate::types::{TxCursor, TxPayload};

pub struct LedgerEngine<S: AddressStore + ?Sized> {
    store: Arc<S>,
    policy: BalancePolicy,
}

impl<S: AddressStore + ?Sized> LedgerEngine<S> {
    pub fn new(store: Arc<S>, policy: BalancePolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn process_transaction(&self, tx: &TxPayload) -> Result<CommitSummary> {
        self.process(tx, None).await
    }

    /// Apply `tx` and advance the ingest cursor from `previous` to its
    /// position in the same atomic batch. Transactions without address
    /// effects write nothing, the cursor included.
    pub async fn process_ordered(&self, tx: &TxPayload, previous: Option<TxCursor>) -> Result<CommitSummary> {
        let advance = LedgerOp::AdvanceIngestCursor {
            expected: previous,
            next: TxCursor::of(tx),
        };
        self.process(tx, Some(advance)).await
    }

    async fn process(&self, tx: &TxPayload, advance: Option<LedgerOp>) -> Result<CommitSummary> {
        let result = self.apply(tx, advance).await;
        match &result {
            Ok(summary) if summary.operations == 0 => metrics::increment_transactions_processed("empty"),
            Ok(_) => metrics::increment_transactions_processed("committed"),
            Err(e) => {
                metrics::increment_transactions_processed("failed");
                warn!(txid = %truncate_hex(&tx.txid, 16), error = %e, "Transaction not applied");
            }
        }
        result
    }

    async fn apply(&self, tx: &TxPayload, advance: Option<LedgerOp>) -> Result<CommitSummary> {
        tx.validate()?;

        let identifiers = lookup_identifiers(&tx.vins, &tx.vouts, tx.claim.as_ref());
        if identifiers.is_empty() {
            debug!(txid = %truncate_hex(&tx.txid, 16), "No address effects");
            return Ok(CommitSummary {
                txid: tx.txid.clone(),
                ..Default::default()
            });
        }

        let mut working = resolve_working_set(self.store.as_ref(), &identifiers, tx.time).await?;
        debug!(
            txid = %truncate_hex(&tx.txid, 16),
            addresses = working.units.len(),
            created = working.created_count(),
            vins = tx.vins.len(),
            vouts = tx.vouts.len(),
            claim = tx.claim.is_some(),
            "Applying transaction"
        );

        let mut units = std::mem::take(&mut working.units);
        if !tx.vins.is_empty() {
            units = apply_debits(units, tx, self.policy)?;
        }
        if !tx.vouts.is_empty() {
            units = apply_credits(units, tx)?;
        }
        if let Some(claim) = &tx.claim {
            apply_claim(&mut units, claim, tx)?;
        }
        working.units = units;

        let (mut batch, mut summary) = build_commit_batch(&working, &tx.txid)?;
        if let Some(op) = advance {
            batch.push("ingest_cursor", op)?;
            summary.operations = batch.len();
        }
        commit(self.store.as_ref(), batch, summary).await
    }
}
