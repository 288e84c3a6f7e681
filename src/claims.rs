/// Claim Processor
///
/// GAS claims never debit a balance. A claim-bearing transaction produces one
/// Claim record for the claiming address holding the claimed txid set; the
/// claimed GAS itself arrives through the transaction's outputs and is folded
/// by the balance mutator like any other credit.

use std::collections::HashSet;
use tracing::debug;

use crate::balance::record_history;
use crate::error::{LedgerError, Result};
use crate::telemetry::truncate_list;
use crate::types::{Claim, ClaimPayload, TxPayload, WorkingUnit};

/// Claimed txids with duplicates dropped, first occurrence kept
pub fn claimed_txids(claim: &ClaimPayload) -> Vec<String> {
    let mut seen: HashSet<&String> = HashSet::new();
    claim
        .txids
        .iter()
        .filter(|txid| seen.insert(*txid))
        .cloned()
        .collect()
}

/// Attach the claim changeset to the claiming address.
///
/// The claim address must already be in the working set; a miss means the
/// payload and the lookup disagree and the transaction is refused.
pub fn apply_claim(units: &mut [WorkingUnit], claim: &ClaimPayload, tx: &TxPayload) -> Result<()> {
    let unit = units
        .iter_mut()
        .find(|u| u.address.address == claim.address)
        .ok_or_else(|| {
            LedgerError::MalformedClaim(format!(
                "claim address {} is not part of transaction {}",
                claim.address, tx.txid
            ))
        })?;

    if unit.attrs.claim.is_some() {
        return Err(LedgerError::MalformedClaim(format!(
            "transaction {} claims twice for {}",
            tx.txid, claim.address
        )));
    }

    let txids = claimed_txids(claim);
    debug!(address = %claim.address, txids = %truncate_list(&txids, 4), "Claim staged");

    unit.attrs.claim = Some(Claim {
        address_id: unit.address.id,
        claim_txid: tx.txid.clone(),
        txids,
        block_index: tx.block_height,
    });
    record_history(unit, tx);
    Ok(())
}
