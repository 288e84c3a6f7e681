/// Configuration
///
/// Layers, lowest first: built-in defaults, `config.toml` (optional), then
/// `NEOBLOX__SECTION__KEY` environment variables. The merged `Config` is held
/// globally; `LedgerSettings` is the typed view the binaries work from.

pub use config::{Config, Environment, File as ConfigFile};
pub use once_cell::sync::OnceCell;

use crate::balance::BalancePolicy;
use crate::error::{LedgerError, Result};
use crate::telemetry::TelemetryConfig;

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const ENV_PREFIX: &str = "NEOBLOX";

/// Merge defaults, the optional file and the environment
pub fn load_config(file: &str) -> Result<Config> {
    let config = Config::builder()
        .set_default("db.path", "~/.neoblox/db")?
        .set_default("ledger.balance_policy", BalancePolicy::default().as_str())?
        .set_default("ledger.commit_retries", 0)?
        .set_default("ingest.queue_depth", 16)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "pretty")?
        .set_default("logging.rotation", "daily")?
        .add_source(ConfigFile::with_name(file).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;
    Ok(config)
}

pub fn init_global_config(file: &str) -> Result<()> {
    let config = load_config(file)?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| LedgerError::Config("config already set".to_string()))?;
    Ok(())
}

pub fn get_global_config() -> Result<&'static Config> {
    GLOBAL_CONFIG
        .get()
        .ok_or_else(|| LedgerError::Config("config not initialized".to_string()))
}

/// Typed settings for the ledger binaries
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Database directory, `~` expanded
    pub db_path: String,
    pub balance_policy: BalancePolicy,
    pub commit_retries: u32,
    pub queue_depth: usize,
    pub telemetry: TelemetryConfig,
}

impl LedgerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let db_path = config.get_string("db.path")?;
        let db_path = shellexpand::tilde(&db_path).into_owned();

        let balance_policy = config.get_string("ledger.balance_policy")?.parse()?;

        let commit_retries = config.get_int("ledger.commit_retries")?;
        let commit_retries = u32::try_from(commit_retries).map_err(|_| {
            LedgerError::Config(format!("ledger.commit_retries out of range: {}", commit_retries))
        })?;

        let queue_depth = config.get_int("ingest.queue_depth")?;
        let queue_depth = usize::try_from(queue_depth)
            .ok()
            .filter(|depth| *depth > 0)
            .ok_or_else(|| LedgerError::Config(format!("ingest.queue_depth must be positive: {}", queue_depth)))?;

        let telemetry = TelemetryConfig {
            log_level: config.get_string("logging.level")?,
            log_format: config.get_string("logging.format")?,
            log_file: config.get_string("logging.file").ok(),
            rotation: config.get_string("logging.rotation")?,
        };

        Ok(Self {
            db_path,
            balance_policy,
            commit_retries,
            queue_depth,
            telemetry,
        })
    }

    /// Settings from the global config
    pub fn global() -> Result<Self> {
        Self::from_config(get_global_config()?)
    }
}
