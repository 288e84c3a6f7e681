/// Telemetry Module - Structured Logging with Tracing
///
/// - RUST_LOG overrides the configured level
/// - JSON or pretty output
/// - Optional file output with rotation
/// - Truncation and sampling helpers for hot paths

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// "trace", "debug", "info", "warn", "error" or a full filter directive
    pub log_level: String,
    /// "json" or "pretty"
    pub log_format: String,
    /// None = console only
    pub log_file: Option<String>,
    /// "daily", "hourly", "never"
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("NEOBLOX_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("NEOBLOX_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer<W>(json: bool, writer: W) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    }
}

/// Install the global subscriber.
///
/// When logging to a file the returned guard must be held for the life of
/// the process, dropping it stops the background writer.
pub fn init_tracing(config: TelemetryConfig) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error>> {
    let json = config.log_format == "json";

    let (layer, guard) = match &config.log_file {
        Some(log_file_path) => {
            let path = std::path::Path::new(log_file_path);
            let directory = path
                .parent()
                .ok_or("Invalid log file path: no parent directory")?;
            let file_name = path
                .file_name()
                .ok_or("Invalid log file path: no filename")?;
            let prefix = path
                .file_stem()
                .ok_or("Invalid log file path: no filename")?;

            let appender = match config.rotation.as_str() {
                "hourly" => rolling::hourly(directory, prefix),
                "never" => rolling::never(directory, file_name),
                _ => rolling::daily(directory, prefix),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (format_layer(json, writer), Some(guard))
        }
        None => (format_layer(json, std::io::stdout), None),
    };

    // The boxed layer is typed against Registry, so it sits directly on it
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()?;

    Ok(guard)
}

/// Truncate hex string for logging
///
/// Example: "0a1b2c3d4e5f67890a1b2c3d4e5f6789" → "0a1b2c3d4e5f6789..."
pub fn truncate_hex(hex: &str, len: usize) -> String {
    match hex.get(..len) {
        Some(head) if hex.len() > len => format!("{}...", head),
        _ => hex.to_string(),
    }
}

/// First `max` items, with the total when there are more
///
/// Example: ["a", "b", "c", "d"] (max 2) → "[2 of 4]: [\"a\", \"b\"]"
pub fn truncate_list<T: std::fmt::Display + std::fmt::Debug>(items: &[T], max: usize) -> String {
    if items.len() <= max {
        format!("{:?}", items)
    } else {
        let preview: Vec<String> = items.iter().take(max).map(|i| i.to_string()).collect();
        format!("[{} of {}]: {:?}", max, items.len(), preview)
    }
}

/// True on the first call and then every `interval` calls
pub fn should_log_progress(counter: &AtomicU64, interval: u64) -> bool {
    let count = counter.fetch_add(1, Ordering::Relaxed);
    interval > 0 && count % interval == 0
}

pub struct ProgressCounter {
    counter: AtomicU64,
    interval: u64,
}

impl ProgressCounter {
    pub fn new(interval: u64) -> Self {
        Self {
            counter: AtomicU64::new(0),
            interval,
        }
    }

    pub fn should_log(&self) -> bool {
        should_log_progress(&self.counter, self.interval)
    }

    pub fn get(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}
