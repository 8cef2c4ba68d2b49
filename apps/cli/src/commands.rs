//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use courier_adapters::AdapterRegistry;
use courier_core::{Coordinator, PipelineObserver, PollReport, SilentObserver};
use courier_shared::{AppConfig, ItemKey, init_config, load_config, load_config_from};
use courier_storage::{CursorStore, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Courier: relay discovered content through enrichment stages to chat destinations.
#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Relay discovered content through enrichment stages to chat destinations.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.courier/courier.toml).
    #[arg(long, env = "COURIER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run discovery and processing until interrupted.
    Run,

    /// One discovery pass and one processing pass, then exit.
    Poll {
        /// Print the pass report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Item and delivery counts per state, and source cursors.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// List items stopped at a failed stage and deliveries a destination refused.
    Failed {
        /// Maximum number of items, and of deliveries, to show.
        #[arg(short, long, default_value = "50")]
        limit: u32,

        #[arg(long)]
        json: bool,
    },

    /// Send a failed item back to the stage it failed at, or retry the
    /// destinations that refused a delivered item.
    Replay {
        /// Item key, `<source>:<key>`.
        key: String,
    },

    /// Show one item with its stage outputs and delivery records.
    Inspect {
        /// Item key, `<source>:<key>`.
        key: String,

        #[arg(long)]
        json: bool,
    },

    /// Delete delivered items older than the retention window.
    Prune {
        /// Retention in days (defaults to `pipeline.retention_days`).
        #[arg(long)]
        days: Option<u32>,
    },

    /// Pause or resume a source.
    Source {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Source subcommands.
#[derive(Subcommand)]
pub(crate) enum SourceAction {
    /// Stop discovering from a source.
    Pause { name: String },
    /// Resume discovery from a paused source.
    Resume { name: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "courier=info",
        1 => "courier=debug",
        _ => "courier=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config {
        action: ConfigAction::Init,
    } = cli.command
    {
        return cmd_config_init();
    }

    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };

    match cli.command {
        Command::Run => cmd_run(&config).await,
        Command::Poll { json } => cmd_poll(&config, json).await,
        Command::Status { json } => cmd_status(&config, json).await,
        Command::Failed { limit, json } => cmd_failed(&config, limit, json).await,
        Command::Replay { key } => cmd_replay(&config, &key).await,
        Command::Inspect { key, json } => cmd_inspect(&config, &key, json).await,
        Command::Prune { days } => cmd_prune(&config, days).await,
        Command::Source { action } => match action {
            SourceAction::Pause { name } => cmd_source_active(&config, &name, false).await,
            SourceAction::Resume { name } => cmd_source_active(&config, &name, true).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

async fn open_storage(config: &AppConfig, readonly: bool) -> Result<Arc<Storage>> {
    let path = config.storage.resolved_path()?;
    let storage = if readonly {
        Storage::open_readonly(&path).await?
    } else {
        Storage::open(&path).await?
    };
    Ok(Arc::new(storage))
}

fn open_pipeline(
    config: &AppConfig,
    storage: Arc<Storage>,
    observer: Arc<dyn PipelineObserver>,
) -> Result<Coordinator> {
    let registry = AdapterRegistry::from_config(config)?;
    Ok(Coordinator::from_config(config, storage, &registry, observer)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig) -> Result<()> {
    let storage = open_storage(config, false).await?;
    let coordinator = open_pipeline(config, storage, Arc::new(SilentObserver))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight work");
            signal.cancel();
        }
    });

    coordinator.run(shutdown).await?;
    Ok(())
}

async fn cmd_poll(config: &AppConfig, json: bool) -> Result<()> {
    let storage = open_storage(config, false).await?;
    let observer = Arc::new(SpinnerObserver::new());
    let coordinator = open_pipeline(config, storage, observer.clone())?;
    let token = CancellationToken::new();

    observer.phase("Discovering");
    let discovery = coordinator.discover_once(&token).await?;
    observer.phase("Processing");
    let report = coordinator.poll_once(&token).await?;

    if json {
        let out = serde_json::json!({ "discovery": discovery, "poll": report });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Sources:   {}", discovery.sources_checked);
    println!(
        "  Admitted:  {} ({} already seen, {} source errors)",
        discovery.admitted, discovery.already_seen, discovery.errors
    );
    println!("  Processed: {}", report.processed);
    println!("  Delivered: {}", report.delivered);
    println!("  Ready:     {}", report.ready);
    println!("  Failed:    {}", report.failed);
    println!("  Deferred:  {}", report.deferred);
    println!();
    Ok(())
}

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let storage = open_storage(config, true).await?;
    let cursors = storage.list_cursors().await?;
    let coordinator = open_pipeline(config, storage, Arc::new(SilentObserver))?;
    let counts = coordinator.status_counts().await?;
    let deliveries = coordinator.delivery_counts().await?;

    if json {
        let states: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(kind, n)| (kind.as_str().to_string(), (*n).into()))
            .collect();
        let delivery_states: serde_json::Map<String, serde_json::Value> = deliveries
            .iter()
            .map(|(status, n)| (status.as_str().to_string(), (*n).into()))
            .collect();
        let out = serde_json::json!({
            "items": states,
            "deliveries": delivery_states,
            "sources": cursors,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  Items");
    for (kind, n) in &counts {
        println!("    {:<18} {n}", kind.as_str());
    }
    println!();
    println!("  Deliveries");
    for (status, n) in &deliveries {
        println!("    {:<18} {n}", status.as_str());
    }
    if !cursors.is_empty() {
        println!();
        println!("  Sources");
        for cursor in &cursors {
            let checked = cursor
                .last_checked
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".into());
            let state = if cursor.active { "active" } else { "paused" };
            println!(
                "    {:<16} {state:<7} admitted {:<6} last checked {checked}",
                cursor.source_name, cursor.admitted_total
            );
        }
    }
    println!();
    Ok(())
}

async fn cmd_failed(config: &AppConfig, limit: u32, json: bool) -> Result<()> {
    let storage = open_storage(config, true).await?;
    let coordinator = open_pipeline(config, storage, Arc::new(SilentObserver))?;
    let items = coordinator.failed_items(limit).await?;
    let deliveries = coordinator.failed_deliveries(limit).await?;

    if json {
        let out = serde_json::json!({ "items": items, "deliveries": deliveries });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if items.is_empty() && deliveries.is_empty() {
        println!("No failed items or deliveries.");
        return Ok(());
    }
    for item in &items {
        println!("{}  {}", item.key, item.status);
    }
    for record in &deliveries {
        println!(
            "{}  delivery to {} failed after {} attempt(s): {}",
            record.item_key,
            record.destination_id,
            record.attempts,
            record.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_replay(config: &AppConfig, key: &str) -> Result<()> {
    let storage = open_storage(config, false).await?;
    let coordinator = open_pipeline(config, storage, Arc::new(SilentObserver))?;
    let item = coordinator.replay(&ItemKey::from_raw(key)).await?;
    println!("{} is now {}", item.key, item.status);
    Ok(())
}

async fn cmd_inspect(config: &AppConfig, key: &str, json: bool) -> Result<()> {
    let storage = open_storage(config, true).await?;
    let coordinator = open_pipeline(config, storage, Arc::new(SilentObserver))?;
    let key = ItemKey::from_raw(key);
    let item = coordinator
        .item(&key)
        .await?
        .ok_or_else(|| eyre!("no item with key '{key}'"))?;
    let deliveries = coordinator.deliveries(&key).await?;

    if json {
        let out = serde_json::json!({ "item": item, "deliveries": deliveries });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("  {}  {}", item.key, item.status);
    println!(
        "  discovered {}",
        item.discovered_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(parent) = &item.parent_key {
        println!("  reply to   {parent}");
    }
    for entry in &item.payload {
        println!("  stage {} ({})  {}", entry.ordinal, entry.stage_name, entry.output);
    }
    if !deliveries.is_empty() {
        println!();
        for record in &deliveries {
            let detail = match (&record.external_ref, &record.last_error) {
                (Some(external), _) => external.clone(),
                (None, Some(error)) => error.clone(),
                (None, None) => String::new(),
            };
            println!(
                "  {:<16} {:<18} attempts {:<3} {detail}",
                record.destination_id,
                record.status.as_str(),
                record.attempts
            );
        }
    }
    println!();
    Ok(())
}

async fn cmd_prune(config: &AppConfig, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.pipeline.retention_days);
    if days == 0 {
        return Err(eyre!("retention of 0 days would prune nothing; pass --days"));
    }
    let storage = open_storage(config, false).await?;
    let coordinator = open_pipeline(config, storage, Arc::new(SilentObserver))?;
    let removed = coordinator
        .prune(Duration::from_secs(u64::from(days) * 24 * 3600))
        .await?;
    println!("Pruned {removed} delivered item(s) older than {days} day(s).");
    Ok(())
}

async fn cmd_source_active(config: &AppConfig, name: &str, active: bool) -> Result<()> {
    if !config.sources.iter().any(|s| s.name == name) {
        return Err(eyre!("no source named '{name}' in config"));
    }
    let storage = open_storage(config, false).await?;
    storage.set_source_active(name, active).await?;
    let state = if active { "resumed" } else { "paused" };
    println!("Source '{name}' {state}.");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Pipeline observer using an indicatif spinner.
struct SpinnerObserver {
    spinner: ProgressBar,
    admitted: AtomicUsize,
    stages: AtomicUsize,
}

impl SpinnerObserver {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self {
            spinner,
            admitted: AtomicUsize::new(0),
            stages: AtomicUsize::new(0),
        }
    }

    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }
}

impl PipelineObserver for SpinnerObserver {
    fn item_admitted(&self, key: &ItemKey) {
        let n = self.admitted.fetch_add(1, Ordering::Relaxed) + 1;
        self.spinner.set_message(format!("Admitted [{n}] {key}"));
    }

    fn stage_completed(&self, key: &ItemKey, stage: &str, ordinal: u32) {
        let n = self.stages.fetch_add(1, Ordering::Relaxed) + 1;
        self.spinner
            .set_message(format!("Stage {ordinal} ({stage}) [{n}] {key}"));
    }

    fn item_failed(&self, key: &ItemKey, stage: &str, reason: &str) {
        self.spinner
            .println(format!("  failed {key} at {stage}: {reason}"));
    }

    fn item_delivered(&self, key: &ItemKey) {
        self.spinner.set_message(format!("Delivered {key}"));
    }

    fn poll_finished(&self, _report: &PollReport) {
        self.spinner.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "courier",
            "failed",
            "--limit",
            "5",
            "-vv",
            "--config",
            "/tmp/courier.toml",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/courier.toml")));
        assert!(matches!(
            cli.command,
            Command::Failed {
                limit: 5,
                json: false
            }
        ));
    }

    #[test]
    fn inspect_takes_a_key() {
        let cli = Cli::try_parse_from(["courier", "inspect", "twitter:tweet-1", "--json"])
            .expect("parse");
        let Command::Inspect { key, json } = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(key, "twitter:tweet-1");
        assert!(json);
    }

    #[test]
    fn source_pause_takes_a_name() {
        let cli = Cli::try_parse_from(["courier", "source", "pause", "twitter"]).expect("parse");
        let Command::Source {
            action: SourceAction::Pause { name },
        } = cli.command
        else {
            panic!("expected source pause");
        };
        assert_eq!(name, "twitter");
    }
}
