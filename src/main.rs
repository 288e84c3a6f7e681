use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use neoblox::config::{init_global_config, LedgerSettings, DEFAULT_CONFIG_FILE};
use neoblox::metrics::{gather_metrics, init_metrics};
use neoblox::telemetry::{init_tracing, ProgressCounter};
use neoblox::{
    AddressStore, BlockIngestor, BlockPayload, DbHandles, LedgerEngine, LedgerWriter,
    RocksAddressStore,
};

#[derive(Parser, Debug)]
#[clap(name = "neoblox")]
#[clap(about = "Address balance ledger for NEO blocks", long_about = None)]
struct Cli {
    /// Config file (defaults to ./config.toml, optional)
    #[clap(long, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    /// Override db.path from the config
    #[clap(long)]
    db: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply blocks from a JSON lines file, one block per line
    Ingest {
        file: PathBuf,
        /// Print this run's metrics in Prometheus text format when done
        #[clap(long)]
        metrics: bool,
    },
    /// Show one address and its balances
    Address {
        address: String,
    },
    /// Show the transaction history of an address, newest first
    History {
        address: String,
        #[clap(long, default_value_t = 25)]
        limit: usize,
    },
    /// Show the GAS claims recorded for an address
    Claims {
        address: String,
    },
    /// Show ingest progress and the number of addresses
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_global_config(&cli.config)?;
    let mut settings = LedgerSettings::global()?;
    if let Some(db) = &cli.db {
        settings.db_path = shellexpand::tilde(db).into_owned();
    }

    let _log_guard = init_tracing(settings.telemetry.clone())?;
    init_metrics()?;

    let handles = DbHandles::open(&settings.db_path)?;
    let store = Arc::new(RocksAddressStore::new(handles)?);

    match cli.command {
        Command::Ingest { file, metrics } => {
            ingest(store, &settings, file).await?;
            if metrics {
                print!("{}", gather_metrics());
            }
        }
        Command::Address { address } => show_address(&store, &address).await?,
        Command::History { address, limit } => show_history(&store, &address, limit).await?,
        Command::Claims { address } => show_claims(&store, &address).await?,
        Command::Status => show_status(&store).await?,
    }

    Ok(())
}

async fn ingest(
    store: Arc<RocksAddressStore>,
    settings: &LedgerSettings,
    file: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = LedgerEngine::new(store.clone(), settings.balance_policy);
    let ingestor = BlockIngestor::resume(engine, settings.commit_retries).await?;
    let resume_height = ingestor.last_height();
    let (writer, handle) = LedgerWriter::spawn(ingestor, settings.queue_depth);

    info!(
        file = %file.display(),
        policy = settings.balance_policy.as_str(),
        retries = settings.commit_retries,
        "Starting ingestion"
    );

    let reader = BufReader::new(tokio::fs::File::open(&file).await?);
    let mut lines = reader.lines();
    let progress = ProgressCounter::new(1_000);
    let mut line_no = 0usize;
    let mut applied = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let block: BlockPayload = serde_json::from_str(&line)
            .map_err(|e| format!("line {}: {}", line_no, e))?;

        // Fully ingested on a previous run; a partly applied block is
        // submitted again and the ingestor skips its committed transactions
        if resume_height.is_some_and(|h| block.height <= h) {
            continue;
        }

        let height = block.height;
        match writer.submit(block).await {
            Ok(summary) => {
                applied += 1;
                if progress.should_log() {
                    info!(height, blocks = applied, "{}", summary);
                }
            }
            Err(e) => {
                error!(height, line = line_no, error = %e, "Ingestion halted");
                return Err(e.into());
            }
        }
    }

    drop(writer);
    let ingestor = handle.await?;
    println!(
        "✅ Applied {} blocks, ledger at height {}",
        applied,
        ingestor
            .last_height()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(cursor) = ingestor.cursor() {
        println!("   Last tx:   {}", cursor);
    }
    println!("   Addresses: {}", store.address_count().await?);
    Ok(())
}

async fn show_status(store: &RocksAddressStore) -> Result<(), Box<dyn std::error::Error>> {
    let height = store.ingest_height().await?;
    let cursor = store.ingest_cursor().await?;
    println!("📊 Ledger status");
    println!(
        "   Ingest height:  {}",
        height.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "   Last tx:        {}",
        cursor.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string())
    );
    if let Some(cursor) = cursor.filter(|c| height.map_or(true, |h| c.height > h)) {
        println!("   ⚠️  Block {} is partly applied; ingest resumes after {}", cursor.height, cursor);
    }
    println!("   Addresses:      {}", store.address_count().await?);
    println!("   Next id:        {}", store.next_address_id().await?);
    Ok(())
}

async fn show_address(store: &RocksAddressStore, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Some(record) = store.get_address(address).await? else {
        println!("❌ Address not found: {}", address);
        return Ok(());
    };

    println!("🔍 {}", record.address);
    println!("   Id:       {}", record.id);
    println!("   Created:  {}", record.time);
    println!("   Version:  {}", record.version);
    if record.balance.is_empty() {
        println!("   Balance:  (none)");
    }
    for (asset, entry) in &record.balance {
        println!("   {:>8}  {}  ({})", entry.symbol, entry.amount, asset);
    }
    Ok(())
}

async fn show_history(store: &RocksAddressStore, address: &str, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    let history = store.history(address, limit).await?;
    if history.is_empty() {
        println!("No transactions for {}", address);
        return Ok(());
    }
    for entry in history {
        println!(
            "{:>10}  {:<16}  {}",
            entry.block_height,
            entry.kind.label(),
            entry.txid
        );
    }
    Ok(())
}

async fn show_claims(store: &RocksAddressStore, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let claims = store.claims(address).await?;
    if claims.is_empty() {
        println!("No claims for {}", address);
        return Ok(());
    }
    for claim in claims {
        println!("⛽ {} at block {}", claim.claim_txid, claim.block_index);
        for txid in &claim.txids {
            println!("     {}", txid);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_ingest_metrics_flag() {
        let cli = Cli::try_parse_from(["neoblox", "status"]).unwrap();
        assert!(matches!(cli.command, Command::Status));
        assert!(Cli::try_parse_from(["neoblox", "metrics"]).is_err());

        let cli = Cli::try_parse_from(["neoblox", "--db", "/tmp/l", "ingest", "blocks.jsonl", "--metrics"]).unwrap();
        match cli.command {
            Command::Ingest { file, metrics } => {
                assert_eq!(file, PathBuf::from("blocks.jsonl"));
                assert!(metrics);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.db.as_deref(), Some("/tmp/l"));
    }
}
