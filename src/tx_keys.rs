/// Storage Key Helpers
///
/// Centralized helpers for the key layout of every ledger column family.
///
/// KEY FORMATS:
/// - addresses:     id (8 bytes BE)
/// - address_index: address string bytes
/// - history:       id (8 BE) + block_height (8 BE) + tx_index (4 BE) + txid bytes
/// - claims:        id (8 BE) + block_index (8 BE) + claim txid bytes
///
/// Big-endian integers keep a prefix scan over one address sorted by height,
/// so a reverse scan yields newest-first history.

use crate::types::AddressId;

pub fn address_key(id: AddressId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub fn address_index_key(address: &str) -> Vec<u8> {
    address.as_bytes().to_vec()
}

/// Prefix shared by every history/claim key of one address
pub fn address_prefix(id: AddressId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

pub fn history_key(id: AddressId, block_height: u64, tx_index: u32, txid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + txid.len());
    key.extend_from_slice(&id.to_be_bytes());
    key.extend_from_slice(&block_height.to_be_bytes());
    key.extend_from_slice(&tx_index.to_be_bytes());
    key.extend_from_slice(txid.as_bytes());
    key
}

pub fn claim_key(id: AddressId, block_index: u64, claim_txid: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + claim_txid.len());
    key.extend_from_slice(&id.to_be_bytes());
    key.extend_from_slice(&block_index.to_be_bytes());
    key.extend_from_slice(claim_txid.as_bytes());
    key
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// None when the prefix is all 0xff.
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < 0xff {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

pub fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}
