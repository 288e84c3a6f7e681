/// Metrics Module - Prometheus Instrumentation
///
/// Ledger-level counters and histograms:
/// - Ingest progress (blocks, transactions, ingest height)
/// - Address materialization, claims, negative balances
/// - Commit latency, batch size and failures by reason

use prometheus::{
    Registry, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, HistogramVec,
    HistogramOpts, Opts, Encoder, TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // 1. INGEST PROGRESS
    // ========================================================================

    /// Blocks fully applied
    pub static ref BLOCKS_PROCESSED: IntCounter = IntCounter::new(
        "neoblox_blocks_processed_total",
        "Total blocks applied to the ledger"
    ).unwrap();

    /// Transactions by outcome
    /// Labels: outcome (committed, failed)
    pub static ref TRANSACTIONS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("neoblox_transactions_processed_total", "Transactions processed by outcome"),
        &["outcome"]
    ).unwrap();

    /// Highest block fully ingested
    pub static ref INGEST_HEIGHT: IntGauge = IntGauge::new(
        "neoblox_ingest_height",
        "Highest block height fully ingested"
    ).unwrap();

    // ========================================================================
    // 2. LEDGER EFFECTS
    // ========================================================================

    /// Addresses created on first reference
    pub static ref ADDRESSES_CREATED: IntCounter = IntCounter::new(
        "neoblox_addresses_created_total",
        "Addresses materialized on first reference"
    ).unwrap();

    /// Claim records written
    pub static ref CLAIMS_RECORDED: IntCounter = IntCounter::new(
        "neoblox_claims_recorded_total",
        "GAS claim records written"
    ).unwrap();

    /// Debits that left a balance below zero
    /// Labels: policy (tolerate, reject)
    pub static ref NEGATIVE_BALANCES: IntCounterVec = IntCounterVec::new(
        Opts::new("neoblox_negative_balances_total", "Debits that drove a balance negative"),
        &["policy"]
    ).unwrap();

    // ========================================================================
    // 3. COMMITS
    // ========================================================================

    /// Atomic commit duration
    /// Labels: cf (column family name)
    pub static ref DB_BATCH_FLUSH_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("neoblox_db_batch_flush_duration_seconds", "Database batch flush latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["cf"]
    ).unwrap();

    /// Entries per committed batch
    /// Labels: cf (column family name)
    pub static ref DB_BATCH_SIZE_ENTRIES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("neoblox_db_batch_size_entries", "Entries in last committed batch by CF"),
        &["cf"]
    ).unwrap();

    /// Successful flushes
    /// Labels: cf (column family name)
    pub static ref BATCH_FLUSH_COUNT: IntCounterVec = IntCounterVec::new(
        Opts::new("neoblox_batch_flush_total", "Committed batches by CF"),
        &["cf"]
    ).unwrap();

    /// Failed commits
    /// Labels: reason (commit, version_conflict, duplicate_operation, ...)
    pub static ref COMMIT_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("neoblox_commit_failures_total", "Rejected ledger commits by reason"),
        &["reason"]
    ).unwrap();

    /// Database errors
    /// Labels: op (get, flush, iterator), cf (column family)
    pub static ref DB_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("neoblox_db_errors_total", "Database errors by operation and CF"),
        &["op", "cf"]
    ).unwrap();
}

/// Register every metric with the global registry.
/// Call this once at service startup.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(BLOCKS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(TRANSACTIONS_PROCESSED.clone()))?;
    REGISTRY.register(Box::new(INGEST_HEIGHT.clone()))?;

    REGISTRY.register(Box::new(ADDRESSES_CREATED.clone()))?;
    REGISTRY.register(Box::new(CLAIMS_RECORDED.clone()))?;
    REGISTRY.register(Box::new(NEGATIVE_BALANCES.clone()))?;

    REGISTRY.register(Box::new(DB_BATCH_FLUSH_DURATION.clone()))?;
    REGISTRY.register(Box::new(DB_BATCH_SIZE_ENTRIES.clone()))?;
    REGISTRY.register(Box::new(BATCH_FLUSH_COUNT.clone()))?;
    REGISTRY.register(Box::new(COMMIT_FAILURES.clone()))?;
    REGISTRY.register(Box::new(DB_ERRORS.clone()))?;

    Ok(())
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# metrics encoding failed: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Timer for measuring durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn increment_transactions_processed(outcome: &str) {
    TRANSACTIONS_PROCESSED.with_label_values(&[outcome]).inc();
}

pub fn increment_addresses_created(count: u64) {
    ADDRESSES_CREATED.inc_by(count);
}

pub fn increment_claims_recorded(count: u64) {
    CLAIMS_RECORDED.inc_by(count);
}

pub fn increment_negative_balances(policy: &str) {
    NEGATIVE_BALANCES.with_label_values(&[policy]).inc();
}

pub fn increment_commit_failures(reason: &str) {
    COMMIT_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_db_flush_duration(cf: &str, duration_secs: f64) {
    DB_BATCH_FLUSH_DURATION.with_label_values(&[cf]).observe(duration_secs);
}

pub fn increment_db_errors(op: &str, cf: &str) {
    DB_ERRORS.with_label_values(&[op, cf]).inc();
}

pub fn record_block_ingested(height: u64) {
    BLOCKS_PROCESSED.inc();
    INGEST_HEIGHT.set(height as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let before = ADDRESSES_CREATED.get();
        increment_addresses_created(3);
        assert!(ADDRESSES_CREATED.get() >= before + 3);
    }

    #[test]
    fn test_timer_elapsed() {
        let timer = Timer::new();
        assert!(timer.elapsed_secs() >= 0.0);
    }
}
