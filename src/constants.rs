/// Ledger Constants
///
/// Column family names, metadata keys and the known asset table.
/// All storage code should go through these instead of string literals.

/// Address records: id (u64 BE) -> bincode(Address)
pub const CF_ADDRESSES: &str = "addresses";

/// Unique address index: address string -> id (u64 BE)
pub const CF_ADDRESS_INDEX: &str = "address_index";

/// History entries: id ‖ height ‖ tx_index ‖ txid -> bincode(HistoryEntry)
pub const CF_HISTORY: &str = "history";

/// Claims: id ‖ block_index ‖ claim txid -> bincode(Claim)
pub const CF_CLAIMS: &str = "claims";

/// Counters and ingest progress
pub const CF_CHAIN_METADATA: &str = "chain_metadata";

/// Every column family the ledger needs at startup
pub const REQUIRED_CFS: [&str; 5] = [
    CF_ADDRESSES,
    CF_ADDRESS_INDEX,
    CF_HISTORY,
    CF_CLAIMS,
    CF_CHAIN_METADATA,
];

/// Next address id to hand out (u64 BE)
pub const META_NEXT_ADDRESS_ID: &[u8] = b"next_address_id";

/// Highest block fully ingested (u64 BE)
pub const META_INGEST_HEIGHT: &[u8] = b"ingest_height";

/// Last transaction committed by the ingestor: height (u64 BE) ‖ tx_index (u32 BE)
pub const META_INGEST_CURSOR: &[u8] = b"ingest_cursor";

/// First id handed out on an empty store
pub const FIRST_ADDRESS_ID: u64 = 1;

pub const NEO_ASSET_ID: &str =
    "0xc56f33fc6ecfcd0c225c4ab356fee59390af8560be0e930faebe74a6daff7c9b";
pub const GAS_ASSET_ID: &str =
    "0x602c79718b16e442de58778e148d0b1084e3b2dffd5de6b7b16cee7969282de7";

/// Resolve the display symbol for an asset.
///
/// Known system assets map to their ticker; anything else keeps the symbol
/// the payload supplied, or falls back to the asset id itself.
pub fn asset_symbol(asset: &str, hint: Option<&str>) -> String {
    match asset {
        NEO_ASSET_ID | "NEO" => "NEO".to_string(),
        GAS_ASSET_ID | "GAS" => "GAS".to_string(),
        _ => hint.map(str::to_string).unwrap_or_else(|| asset.to_string()),
    }
}
