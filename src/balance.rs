/// Balance Mutator
///
/// Folds a transaction's inputs and outputs into the pending attributes of
/// the addresses it touches. Each input is one decrement and each output one
/// increment, applied in transaction order against a single accumulator per
/// address, so repeated inputs from one address never read a stale amount.
///
/// Debits run before credits. Different assets of one address never interact.

use std::collections::HashMap;
use std::str::FromStr;
use serde::Deserialize;
use tracing::warn;

use crate::constants::asset_symbol;
use crate::error::{LedgerError, Result};
use crate::metrics;
use crate::telemetry::truncate_hex;
use crate::types::{AddressAttrs, BalanceEntry, HistoryEntry, TxPayload, Vin, Vout, WorkingUnit};
use crate::vin_grouping::{group_vins, group_vouts, Group};

/// What to do when a debit drives an amount below zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalancePolicy {
    /// Trust upstream validation and keep the negative amount
    #[default]
    Tolerate,
    /// Fail the transaction before anything is written
    Reject,
}

impl BalancePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalancePolicy::Tolerate => "tolerate",
            BalancePolicy::Reject => "reject",
        }
    }
}

impl FromStr for BalancePolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tolerate" => Ok(BalancePolicy::Tolerate),
            "reject" | "strict" => Ok(BalancePolicy::Reject),
            other => Err(LedgerError::Config(format!("unknown balance policy: {}", other))),
        }
    }
}

/// One decrement step
pub fn debit(attrs: &mut AddressAttrs, address: &str, vin: &Vin, policy: BalancePolicy) -> Result<()> {
    let entry = attrs
        .balance
        .entry(vin.asset.clone())
        .or_insert_with(|| BalanceEntry::zero(asset_symbol(&vin.asset, None)));
    let before = entry.amount;
    let after = before - vin.value;

    if after.is_sign_negative() && !after.is_zero() {
        metrics::increment_negative_balances(policy.as_str());
        match policy {
            BalancePolicy::Reject => {
                return Err(LedgerError::Underflow {
                    address: address.to_string(),
                    asset: entry.symbol.clone(),
                    balance: before,
                    value: vin.value,
                });
            }
            BalancePolicy::Tolerate => {
                warn!(
                    address = address,
                    asset = %entry.symbol,
                    balance = %before,
                    value = %vin.value,
                    "Debit leaves negative balance"
                );
            }
        }
    }

    entry.amount = after;
    Ok(())
}

/// One increment step
pub fn credit(attrs: &mut AddressAttrs, vout: &Vout) {
    let entry = attrs
        .balance
        .entry(vout.asset.clone())
        .or_insert_with(|| BalanceEntry::zero(asset_symbol(&vout.asset, vout.symbol.as_deref())));
    entry.amount += vout.value;
}

/// Append this transaction to the address's pending history, once
pub fn record_history(unit: &mut WorkingUnit, tx: &TxPayload) {
    if unit.attrs.history.iter().any(|h| h.txid == tx.txid) {
        return;
    }
    unit.attrs.history.push(HistoryEntry {
        address_id: unit.address.id,
        txid: tx.txid.clone(),
        block_height: tx.block_height,
        tx_index: tx.tx_index,
        time: tx.time,
        kind: tx.kind,
    });
}

/// Fold one address's inputs, in order, then record the history entry
pub fn fold_debits(unit: &mut WorkingUnit, group: &Group<'_, Vin>, tx: &TxPayload, policy: BalancePolicy) -> Result<()> {
    let address = unit.address.address.clone();
    for vin in &group.items {
        debit(&mut unit.attrs, &address, vin, policy)?;
    }
    record_history(unit, tx);
    Ok(())
}

pub fn fold_credits(unit: &mut WorkingUnit, group: &Group<'_, Vout>, tx: &TxPayload) {
    for vout in &group.items {
        credit(&mut unit.attrs, vout);
    }
    record_history(unit, tx);
}

/// Replace updated units in place, pass the rest through untouched.
/// Order and length of `units` are preserved.
pub fn reconcile(units: Vec<WorkingUnit>, mut updates: HashMap<String, WorkingUnit>) -> Vec<WorkingUnit> {
    units
        .into_iter()
        .map(|unit| updates.remove(&unit.address.address).unwrap_or(unit))
        .collect()
}

fn find_unit<'u>(units: &'u [WorkingUnit], updates: &'u HashMap<String, WorkingUnit>, address: &str) -> Option<&'u WorkingUnit> {
    updates
        .get(address)
        .or_else(|| units.iter().find(|u| u.address.address == address))
}

/// Debit every input group against the working set
pub fn apply_debits(units: Vec<WorkingUnit>, tx: &TxPayload, policy: BalancePolicy) -> Result<Vec<WorkingUnit>> {
    let mut updates: HashMap<String, WorkingUnit> = HashMap::new();
    for group in group_vins(&tx.vins) {
        let mut unit = find_unit(&units, &updates, group.address)
            .cloned()
            .ok_or_else(|| {
                LedgerError::Payload(format!(
                    "input address {} missing from working set of {}",
                    group.address,
                    truncate_hex(&tx.txid, 16)
                ))
            })?;
        fold_debits(&mut unit, &group, tx, policy)?;
        updates.insert(group.address.to_string(), unit);
    }
    Ok(reconcile(units, updates))
}

/// Credit every output group against the working set
pub fn apply_credits(units: Vec<WorkingUnit>, tx: &TxPayload) -> Result<Vec<WorkingUnit>> {
    let mut updates: HashMap<String, WorkingUnit> = HashMap::new();
    for group in group_vouts(&tx.vouts) {
        let mut unit = find_unit(&units, &updates, group.address)
            .cloned()
            .ok_or_else(|| {
                LedgerError::Payload(format!(
                    "output address {} missing from working set of {}",
                    group.address,
                    truncate_hex(&tx.txid, 16)
                ))
            })?;
        fold_credits(&mut unit, &group, tx);
        updates.insert(group.address.to_string(), unit);
    }
    Ok(reconcile(units, updates))
}
