/// Atomic Commit Orchestrator
///
/// Turns the final working set of one transaction into a single keyed batch:
///
/// | op key           | operation                                  |
/// |------------------|--------------------------------------------|
/// | `{id}_create`    | create-if-absent, new addresses only       |
/// | `{id}_address`   | balance update guarded by the snapshot     |
/// | `{id}_history`   | history insert                             |
/// | `{id}_claim`     | claim insert, claiming address only        |
/// | `address_ids`    | id cursor advance, when anything was new   |
///
/// A new address is written once by its create op carrying the final
/// balance, so it has no `{id}_address` op. The batch is submitted as one
/// unit; a failure is returned to the caller untouched, never retried here.

use std::fmt;
use tracing::{error, info};

use crate::address_store::{AddressStore, CommitBatch, LedgerOp};
use crate::error::Result;
use crate::lookup::WorkingSet;
use crate::metrics;
use crate::telemetry::truncate_hex;

/// Confirmation returned for a committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommitSummary {
    pub txid: String,
    pub addresses: usize,
    pub created: usize,
    pub history: usize,
    pub claims: usize,
    pub operations: usize,
}

impl fmt::Display for CommitSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {} committed: {} addresses ({} new), {} history entries, {} claims in {} operations",
            self.txid, self.addresses, self.created, self.history, self.claims, self.operations
        )
    }
}

/// Build the keyed batch for one transaction's working set
pub fn build_commit_batch(working: &WorkingSet, txid: &str) -> Result<(CommitBatch, CommitSummary)> {
    let mut batch = CommitBatch::new();
    let mut summary = CommitSummary {
        txid: txid.to_string(),
        ..Default::default()
    };

    for unit in working.units.iter().filter(|u| u.is_dirty()) {
        let id = unit.address.id;
        summary.addresses += 1;

        let mut updated = unit.address.clone();
        updated.balance = unit.attrs.balance.clone();

        if unit.attrs.is_new {
            summary.created += 1;
            batch.push(format!("{}_create", id), LedgerOp::CreateAddress(updated))?;
        } else {
            updated.version = unit.address.version + 1;
            batch.push(
                format!("{}_address", id),
                LedgerOp::UpdateAddress {
                    snapshot: unit.address.clone(),
                    updated,
                },
            )?;
        }

        // One history entry per (address, transaction); a second one would
        // collide on the op key and reject the batch.
        for entry in &unit.attrs.history {
            summary.history += 1;
            batch.push(format!("{}_history", id), LedgerOp::InsertHistory(entry.clone()))?;
        }

        if let Some(claim) = &unit.attrs.claim {
            summary.claims += 1;
            batch.push(format!("{}_claim", id), LedgerOp::InsertClaim(claim.clone()))?;
        }
    }

    if !working.ids.is_empty() {
        batch.push(
            "address_ids",
            LedgerOp::AdvanceAddressIds {
                expected: working.ids.start,
                next: working.ids.end,
            },
        )?;
    }

    summary.operations = batch.len();
    Ok((batch, summary))
}

/// Submit the batch; success or nothing
pub async fn commit<S: AddressStore + ?Sized>(store: &S, batch: CommitBatch, summary: CommitSummary) -> Result<CommitSummary> {
    if batch.is_empty() {
        return Ok(summary);
    }

    match store.submit(batch).await {
        Ok(()) => {
            metrics::increment_addresses_created(summary.created as u64);
            metrics::increment_claims_recorded(summary.claims as u64);
            info!(
                txid = %truncate_hex(&summary.txid, 16),
                addresses = summary.addresses,
                created = summary.created,
                claims = summary.claims,
                "Transaction committed"
            );
            Ok(summary)
        }
        Err(e) => {
            metrics::increment_commit_failures(e.reason());
            error!(
                txid = %truncate_hex(&summary.txid, 16),
                operations = summary.operations,
                error = %e,
                "Transaction commit failed"
            );
            Err(e)
        }
    }
}
