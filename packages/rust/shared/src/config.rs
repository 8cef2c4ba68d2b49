//! Application configuration for Courier.
//!
//! User config lives at `~/.courier/courier.toml`.
//! `--config <path>` on the CLI overrides the default location.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CourierError, Result};
use crate::types::{CircuitPolicy, RetryPolicy, StageDefinition};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "courier.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".courier";

/// Allowed shape for source, stage, and destination names.
static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static name regex is valid")
});

// ---------------------------------------------------------------------------
// Config structs (matching courier.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry policy for store writes.
    #[serde(default)]
    pub storage_retry: StorageRetryConfig,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    #[serde(default)]
    pub stages: Vec<StageConfig>,

    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file. A leading `~/` is expanded.
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Database path with `~/` expanded to the home directory.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| CourierError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.path)),
        }
    }
}

fn default_db_path() -> String {
    "~/.courier/courier.db".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Items processed concurrently across all stages.
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,

    /// Seconds between discovery/poll cycles in `run`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How long a claim stays valid without being renewed.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// Page size when scanning pending items.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Delivered items older than this are pruned.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            item_concurrency: default_item_concurrency(),
            poll_interval_secs: default_poll_interval(),
            lease_secs: default_lease_secs(),
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

fn default_item_concurrency() -> usize {
    8
}
fn default_poll_interval() -> u64 {
    60
}
fn default_lease_secs() -> u64 {
    300
}
fn default_batch_size() -> u32 {
    100
}
fn default_retention_days() -> u32 {
    30
}

/// `[storage_retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRetryConfig {
    #[serde(default = "default_storage_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_storage_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_storage_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for StorageRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_storage_attempts(),
            base_delay_ms: default_storage_base_delay(),
            max_delay_ms: default_storage_max_delay(),
        }
    }
}

impl StorageRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

fn default_storage_attempts() -> u32 {
    5
}
fn default_storage_base_delay() -> u64 {
    100
}
fn default_storage_max_delay() -> u64 {
    5_000
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// Adapter kind, e.g. `json_feed`.
    pub kind: String,
    pub url: String,
    /// Inactive sources are skipped by discovery.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Capability binding of a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Capability kind, e.g. `http`.
    pub kind: String,
    pub url: String,
}

/// `[[stages]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub ordinal: u32,
    pub capability: CapabilityConfig,

    #[serde(default = "default_stage_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_stage_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_stage_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_stage_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_stage_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_circuit_threshold")]
    pub circuit_threshold: u32,

    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_secs: u64,
}

impl StageConfig {
    /// Resolve into the runtime stage definition. The capability is bound
    /// under the stage's own name.
    pub fn definition(&self) -> StageDefinition {
        StageDefinition {
            name: self.name.clone(),
            ordinal: self.ordinal,
            capability: self.name.clone(),
            concurrency_limit: self.concurrency,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
            },
            timeout: Duration::from_millis(self.timeout_ms),
            circuit: CircuitPolicy {
                failure_threshold: self.circuit_threshold,
                cooldown: Duration::from_secs(self.circuit_cooldown_secs),
            },
        }
    }
}

fn default_stage_concurrency() -> usize {
    4
}
fn default_stage_timeout() -> u64 {
    30_000
}
fn default_stage_attempts() -> u32 {
    3
}
fn default_stage_base_delay() -> u64 {
    500
}
fn default_stage_max_delay() -> u64 {
    30_000
}
fn default_circuit_threshold() -> u32 {
    5
}
fn default_circuit_cooldown() -> u64 {
    60
}

/// `[[destinations]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    /// Adapter kind, e.g. `webhook`.
    pub kind: String,
    pub url: String,

    #[serde(default = "default_delivery_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_delivery_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delivery_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_delivery_max_delay")]
    pub max_delay_ms: u64,
}

impl DestinationConfig {
    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_delivery_timeout() -> u64 {
    10_000
}
fn default_delivery_attempts() -> u32 {
    5
}
fn default_delivery_base_delay() -> u64 {
    1_000
}
fn default_delivery_max_delay() -> u64 {
    300_000
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Check names, uniqueness, stage ordinals, and limits.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.item_concurrency == 0 {
            return Err(CourierError::config("pipeline.item_concurrency must be > 0"));
        }
        if self.pipeline.batch_size == 0 {
            return Err(CourierError::config("pipeline.batch_size must be > 0"));
        }
        if self.pipeline.lease_secs == 0 {
            return Err(CourierError::config("pipeline.lease_secs must be > 0"));
        }
        if self.storage_retry.max_attempts == 0 {
            return Err(CourierError::config("storage_retry.max_attempts must be > 0"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            check_name("source", &source.name)?;
            if !seen.insert(source.name.as_str()) {
                return Err(CourierError::config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            check_name("stage", &stage.name)?;
            if !seen.insert(stage.name.as_str()) {
                return Err(CourierError::config(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.concurrency == 0 || stage.max_attempts == 0 || stage.timeout_ms == 0 {
                return Err(CourierError::config(format!(
                    "stage '{}': concurrency, max_attempts and timeout_ms must be > 0",
                    stage.name
                )));
            }
            if stage.circuit_threshold == 0 {
                return Err(CourierError::config(format!(
                    "stage '{}': circuit_threshold must be > 0",
                    stage.name
                )));
            }
        }

        // The lease is renewed after every stage, so one stage run must fit in it.
        let lease = self.pipeline.lease();
        for stage in &self.stages {
            let worst = stage.definition().max_run_time();
            if worst >= lease {
                return Err(CourierError::config(format!(
                    "stage '{}': a run can take {worst:?} (max_attempts x timeout_ms plus backoff), \
                     which does not fit in pipeline.lease_secs ({}s)",
                    stage.name, self.pipeline.lease_secs
                )));
            }
        }

        let mut ordinals: Vec<u32> = self.stages.iter().map(|s| s.ordinal).collect();
        ordinals.sort_unstable();
        for (i, ordinal) in ordinals.iter().enumerate() {
            let expected = i as u32 + 1;
            if *ordinal != expected {
                return Err(CourierError::config(format!(
                    "stage ordinals must be exactly 1..={}, found {ordinal} where {expected} was expected",
                    ordinals.len()
                )));
            }
        }

        let mut seen = HashSet::new();
        for dest in &self.destinations {
            check_name("destination", &dest.id)?;
            if !seen.insert(dest.id.as_str()) {
                return Err(CourierError::config(format!(
                    "duplicate destination id '{}'",
                    dest.id
                )));
            }
            if dest.max_attempts == 0 || dest.timeout_ms == 0 {
                return Err(CourierError::config(format!(
                    "destination '{}': max_attempts and timeout_ms must be > 0",
                    dest.id
                )));
            }
        }

        // A delivery pass sends to every destination once under the same lease.
        let delivery_pass = self
            .destinations
            .iter()
            .map(DestinationConfig::timeout)
            .fold(Duration::ZERO, Duration::saturating_add);
        if !self.destinations.is_empty() && delivery_pass >= lease {
            return Err(CourierError::config(format!(
                "destination timeouts add up to {delivery_pass:?}, \
                 which does not fit in pipeline.lease_secs ({}s)",
                self.pipeline.lease_secs
            )));
        }

        Ok(())
    }

    /// Stage definitions in ascending ordinal order.
    pub fn stage_definitions(&self) -> Vec<StageDefinition> {
        let mut defs: Vec<StageDefinition> = self.stages.iter().map(|s| s.definition()).collect();
        defs.sort_by_key(|d| d.ordinal);
        defs
    }
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(CourierError::config(format!(
            "invalid {what} name '{name}': use lowercase letters, digits, '-' or '_'"
        )))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.courier/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| CourierError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.courier/courier.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CourierError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| CourierError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CourierError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CourierError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CourierError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[storage]
path = "/tmp/courier.db"

[pipeline]
item_concurrency = 4

[[sources]]
name = "twitter"
kind = "json_feed"
url = "https://feeds.example.com/twitter.json"

[[stages]]
name = "summarize"
ordinal = 2
capability = { kind = "http", url = "https://llm.example.com/summarize" }

[[stages]]
name = "translate"
ordinal = 1
capability = { kind = "http", url = "https://llm.example.com/translate" }
max_attempts = 4

[[destinations]]
id = "chat-a"
kind = "webhook"
url = "https://bot.example.com/send"
"#;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("item_concurrency"));
        assert!(toml_str.contains("courier.db"));
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn sample_config_parses() {
        let config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.pipeline.item_concurrency, 4);
        assert_eq!(config.pipeline.batch_size, 100);
        assert!(config.sources[0].active);

        let defs = config.stage_definitions();
        assert_eq!(defs[0].name, "translate");
        assert_eq!(defs[0].retry.max_attempts, 4);
        assert_eq!(defs[1].name, "summarize");
        assert_eq!(defs[1].timeout, Duration::from_secs(30));
    }

    #[test]
    fn gap_in_ordinals_is_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.stages[0].ordinal = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ordinals"));
    }

    #[test]
    fn duplicate_destination_is_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        let dup = config.destinations[0].clone();
        config.destinations.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_names_are_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.sources[0].name = "Twitter Feed".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn stage_that_outlives_the_lease_is_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.pipeline.lease_secs = 60;
        // translate: 4 attempts x 30s already exceeds a one minute lease.
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("translate"));
        assert!(err.to_string().contains("lease_secs"));

        config.stages.iter_mut().for_each(|s| s.timeout_ms = 5_000);
        config.validate().expect("shorter timeouts fit");
    }

    #[test]
    fn destination_timeouts_must_fit_the_lease() {
        let mut config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        config.destinations[0].timeout_ms = 400_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("destination timeouts"));
    }

    #[test]
    fn max_run_time_counts_attempts_and_backoff() {
        let config: AppConfig = toml::from_str(SAMPLE).expect("parse");
        let defs = config.stage_definitions();
        // 4 x 30s plus 0.5s + 1s + 2s of backoff.
        assert_eq!(defs[0].max_run_time(), Duration::from_millis(123_500));
    }

    #[test]
    fn tilde_path_expands() {
        let storage = StorageConfig::default();
        let resolved = storage.resolved_path().expect("resolve");
        assert!(resolved.ends_with(".courier/courier.db"));
        assert!(!resolved.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn load_from_file_validates() {
        let path = std::env::temp_dir().join(format!("courier_cfg_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, SAMPLE).expect("write");
        let config = load_config_from(&path).expect("load");
        assert_eq!(config.destinations[0].id, "chat-a");
        let _ = std::fs::remove_file(&path);
    }
}
