/// Lookup Resolver & Missing-Address Materializer
///
/// Resolves the distinct addresses a transaction touches, loads the ones the
/// store already knows in a single batch call, and stages zero-balance records
/// for the rest. Staged records are not written here: the commit orchestrator
/// creates them inside the transaction's atomic batch, together with the id
/// cursor advance.

use std::collections::HashSet;
use tracing::debug;

use crate::address_store::AddressStore;
use crate::error::Result;
use crate::types::{Address, ClaimPayload, Vin, Vout, WorkingUnit};

/// Addresses touched by one transaction, existing records first
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingSet {
    pub units: Vec<WorkingUnit>,
    /// Id cursor before staging (`start`) and after (`end`)
    pub ids: std::ops::Range<u64>,
}

impl WorkingSet {
    pub fn created_count(&self) -> usize {
        self.units.iter().filter(|u| u.attrs.is_new).count()
    }
}

/// Deduplicated address identifiers, in order of first appearance across
/// inputs, outputs, then the claim
pub fn lookup_identifiers(vins: &[Vin], vouts: &[Vout], claim: Option<&ClaimPayload>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut identifiers = Vec::new();

    let candidates = vins
        .iter()
        .map(|v| v.address_hash.as_str())
        .chain(vouts.iter().map(|v| v.address.as_str()))
        .chain(claim.map(|c| c.address.as_str()));

    for candidate in candidates {
        if seen.insert(candidate) {
            identifiers.push(candidate.to_string());
        }
    }
    identifiers
}

/// Stage a zero-balance address for every identifier the store did not return.
///
/// Ids are handed out from `next_id` in identifier order; returns the units
/// (found first, then new) and the cursor after allocation.
pub fn materialize_missing(
    identifiers: &[String],
    found: Vec<Address>,
    next_id: u64,
    time: i64,
) -> (Vec<WorkingUnit>, u64) {
    let known: HashSet<String> = found.iter().map(|a| a.address.clone()).collect();
    let mut units: Vec<WorkingUnit> = found.into_iter().map(WorkingUnit::existing).collect();

    let mut cursor = next_id;
    for identifier in identifiers {
        if known.contains(identifier) {
            continue;
        }
        units.push(WorkingUnit::materialized(Address {
            id: cursor,
            address: identifier.clone(),
            balance: Default::default(),
            time,
            version: 0,
        }));
        cursor += 1;
    }
    (units, cursor)
}

/// Load and materialize the working set for one transaction
pub async fn resolve_working_set<S: AddressStore + ?Sized>(
    store: &S,
    identifiers: &[String],
    time: i64,
) -> Result<WorkingSet> {
    let found = store.find_by_identifiers(identifiers).await?;
    if found.len() == identifiers.len() {
        return Ok(WorkingSet {
            units: found.into_iter().map(WorkingUnit::existing).collect(),
            ids: 0..0,
        });
    }

    let start = store.next_address_id().await?;
    let (units, end) = materialize_missing(identifiers, found, start, time);
    debug!(
        addresses = identifiers.len(),
        created = end - start,
        "Working set resolved"
    );
    Ok(WorkingSet { units, ids: start..end })
}
