use rocksdb::{Direction, IteratorMode};

use neoblox::config::{load_config, LedgerSettings, DEFAULT_CONFIG_FILE};
use neoblox::constants::{
    CF_ADDRESSES, CF_ADDRESS_INDEX, CF_CHAIN_METADATA, CF_CLAIMS, CF_HISTORY,
    META_INGEST_CURSOR, META_INGEST_HEIGHT, META_NEXT_ADDRESS_ID,
};
use neoblox::tx_keys::{address_index_key, address_key, address_prefix, decode_u64};
use neoblox::types::{Address, Claim, HistoryEntry, TxCursor};
use neoblox::DbHandles;

/// Dump every raw record the ledger holds for one address and check that
/// they agree with each other.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let address = std::env::args()
        .nth(1)
        .ok_or("usage: diagnose-address <address> [config.toml]")?;
    let config_file = std::env::args()
        .nth(2)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

    let settings = LedgerSettings::from_config(&load_config(&config_file)?)?;
    let handles = DbHandles::open_read_only(&settings.db_path)?;
    let db = handles.db();

    println!("🔍 Analyzing address: {}\n", address);

    let cf_meta = handles.cf(CF_CHAIN_METADATA)?;
    let next_id = db
        .get_cf(cf_meta, META_NEXT_ADDRESS_ID)?
        .and_then(|b| decode_u64(&b));
    let ingest_height = db
        .get_cf(cf_meta, META_INGEST_HEIGHT)?
        .and_then(|b| decode_u64(&b));
    let cursor = db
        .get_cf(cf_meta, META_INGEST_CURSOR)?
        .and_then(|b| TxCursor::from_bytes(&b));
    println!("📊 Ledger:");
    println!("   Next address id: {:?}", next_id);
    println!("   Ingest height:   {:?}", ingest_height);
    println!("   Ingest cursor:   {:?}", cursor);

    let index_key = address_index_key(&address);
    let Some(id_bytes) = db.get_cf(handles.cf(CF_ADDRESS_INDEX)?, &index_key)? else {
        println!("\n❌ No index entry (key {})", hex::encode(&index_key));
        return Ok(());
    };
    let id = decode_u64(&id_bytes).ok_or("index entry is not 8 bytes")?;
    println!("\n📇 Index:");
    println!("   Key:   {}", hex::encode(&index_key));
    println!("   Value: {} (id {})", hex::encode(&id_bytes), id);

    let mut problems = Vec::new();
    if let Some(next) = next_id {
        if id >= next {
            problems.push(format!("id {} is not below the id cursor {}", id, next));
        }
    }

    let record_key = address_key(id);
    match db.get_cf(handles.cf(CF_ADDRESSES)?, &record_key)? {
        Some(bytes) => {
            println!("\n📦 Record ({} bytes): {}", bytes.len(), hex::encode(&bytes));
            let record: Address = bincode::deserialize(&bytes)?;
            println!("   Id:      {}", record.id);
            println!("   Created: {}", record.time);
            println!("   Version: {}", record.version);
            for (asset, entry) in &record.balance {
                println!("   {:>8}  {}  ({})", entry.symbol, entry.amount, asset);
                if entry.amount.is_sign_negative() && !entry.amount.is_zero() {
                    problems.push(format!("negative {} balance {}", entry.symbol, entry.amount));
                }
            }
            if record.address != address {
                problems.push(format!("record belongs to {}", record.address));
            }
            if record.id != id {
                problems.push(format!("record id {} does not match index id {}", record.id, id));
            }
        }
        None => problems.push(format!("no record under key {}", hex::encode(&record_key))),
    }

    let prefix = address_prefix(id);
    let history_cf = handles.cf(CF_HISTORY)?;
    let mut history = Vec::new();
    for item in db.iterator_cf(history_cf, IteratorMode::From(prefix.as_slice(), Direction::Forward)) {
        let (key, value) = item?;
        if !key.starts_with(&prefix) {
            break;
        }
        let entry: HistoryEntry = bincode::deserialize(&value)?;
        if entry.address_id != id {
            problems.push(format!("history entry {} filed under id {}", entry.txid, id));
        }
        history.push(entry);
    }
    println!("\n📜 History: {} entries", history.len());
    for entry in history.iter().rev().take(10) {
        println!(
            "   {:>10}  #{:<4}  {:<16}  {}",
            entry.block_height,
            entry.tx_index,
            entry.kind.label(),
            entry.txid
        );
    }

    let claims_cf = handles.cf(CF_CLAIMS)?;
    let mut claims = 0usize;
    println!("\n⛽ Claims:");
    for item in db.iterator_cf(claims_cf, IteratorMode::From(prefix.as_slice(), Direction::Forward)) {
        let (key, value) = item?;
        if !key.starts_with(&prefix) {
            break;
        }
        let claim: Claim = bincode::deserialize(&value)?;
        claims += 1;
        println!(
            "   {} at block {} ({} txids)",
            claim.claim_txid,
            claim.block_index,
            claim.txids.len()
        );
        if !history.iter().any(|h| h.txid == claim.claim_txid) {
            problems.push(format!("claim {} has no history entry", claim.claim_txid));
        }
    }
    if claims == 0 {
        println!("   (none)");
    }

    if problems.is_empty() {
        println!("\n✅ Records are consistent");
    } else {
        println!("\n⚠️  {} problem(s):", problems.len());
        for problem in &problems {
            println!("   - {}", problem);
        }
    }

    Ok(())
}
