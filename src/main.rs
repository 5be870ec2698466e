// ============================================================================
// SQLGRAPHITE COMMAND LINE
// ============================================================================
// Command-line interface and bootstrap:
// - Subcommands for running, validating and inspecting a configuration
// - Configuration file handling with environment overrides
// - Orderly shutdown on Ctrl-C or when the persistence batch ends
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result as AnyhowResult};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use sqlgraphite::config::{GraphiteConfig, PersistenceConfig};
use sqlgraphite::logging::init_logging;
use sqlgraphite::persist::{HttpRenderClient, MemoryHistoryStore, PgHistoryStore};
use sqlgraphite::query::PgQuerySource;
use sqlgraphite::target::TargetDirectory;
use sqlgraphite::types::canonical_target_name;
use sqlgraphite::{
    GraphiteRunner, HistoryStore, MetricCatalog, MetricInterval, MonitorConfig, PersistenceRunner,
    PersistenceSession, Target, TargetHandle, FULL_NAME, VERSION,
};

/// Timeout for one render API request
const RENDER_TIMEOUT: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// CLI Argument Parser
// ----------------------------------------------------------------------------

/// sqlgraphite CLI
#[derive(Parser, Debug)]
#[command(
    name = "sqlgraphite",
    version,
    about = "Streams database health metrics to Graphite",
    long_about = "Polls database health functions on per-metric schedules, sends every \
                  result to a Graphite collector over UDP and optionally persists derived \
                  series into a relational history store."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "sqlgraphite.toml", env = "SQLGRAPHITE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "SQLGRAPHITE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "SQLGRAPHITE_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start monitoring
    Run {
        /// Keep history in memory instead of the configured store
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Print a sample configuration
    GenerateConfig {
        /// Output file (stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the metric catalog
    Metrics {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Show version information
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

// ----------------------------------------------------------------------------
// Command Handlers
// ----------------------------------------------------------------------------

/// Every selected metric must exist in the catalog.
fn check_metric_names(config: &MonitorConfig, catalog: &MetricCatalog) -> AnyhowResult<()> {
    for target in &config.targets {
        for selection in &target.metrics {
            if catalog.get(&selection.name).is_none() {
                bail!(
                    "Target '{}' selects unknown metric '{}'",
                    target.instance,
                    selection.name
                );
            }
        }
    }
    Ok(())
}

fn load_config_or_default(path: &Path) -> AnyhowResult<MonitorConfig> {
    if path.exists() {
        MonitorConfig::load(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        Ok(MonitorConfig::default())
    }
}

fn handle_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let checked = MonitorConfig::load(config_path)
        .map_err(anyhow::Error::from)
        .and_then(|config| {
            let catalog = MetricCatalog::with_configured(&config.metric_definitions)?;
            check_metric_names(&config, &catalog)?;
            Ok(config)
        });

    let config = match checked {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {e:#}");
            return Err(e);
        }
    };

    println!("✅ Configuration is valid!");
    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{s}"),
            Err(e) => println!("Failed to serialize: {e}"),
        }
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Collector: {}:{}", config.graphite.host, config.graphite.port);
    println!("  • Render host: {}", config.graphite.effective_render_host());
    println!(
        "  • Send interval: {}",
        humantime::format_duration(config.graphite.send_interval)
    );
    println!("  • Targets: {}", config.targets.len());
    for target in &config.targets {
        println!("    - {} ({} metrics)", canonical_target_name(&target.instance), target.metrics.len());
    }
    match &config.persistence {
        Some(p) => println!(
            "  • Persistence: '{}' with {} formulas for {}",
            p.name,
            p.formulas.len(),
            humantime::format_duration(p.options().effective_duration())
        ),
        None => println!("  • Persistence: disabled"),
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = MonitorConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Sample configuration written to: {}", path.display());
        }
        None => println!("{config_str}"),
    }
    Ok(())
}

fn handle_metrics(config_path: &Path, format: OutputFormat) -> AnyhowResult<()> {
    let config = load_config_or_default(config_path)?;
    let catalog = MetricCatalog::with_configured(&config.metric_definitions)?;

    match format {
        OutputFormat::Json => {
            let entries: Vec<serde_json::Value> = catalog
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "name": d.name(),
                        "function": d.function_name(),
                        "path_descriptor": d.path_descriptor(),
                        "key_columns": d.key_columns(),
                        "interval": d.interval().raw(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            println!("{:<24} {:<9} {:<40} KEYS", "NAME", "INTERVAL", "FUNCTION");
            for d in catalog.iter() {
                println!(
                    "{:<24} {:<9} {:<40} {}",
                    d.name(),
                    d.interval().to_string(),
                    d.function_name(),
                    d.key_columns().join(",")
                );
            }
        }
    }
    Ok(())
}

fn handle_version() {
    println!("📈 {FULL_NAME} v{VERSION}");
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Features:");
    println!("  • Per-metric 5/15/60 second schedules");
    println!("  • Lock-free hand-off to a single UDP sender");
    println!("  • Idempotent history persistence from the render API");
}

// ----------------------------------------------------------------------------
// Bootstrap
// ----------------------------------------------------------------------------

async fn build_runner(config: &MonitorConfig, catalog: &MetricCatalog) -> AnyhowResult<GraphiteRunner> {
    let mut runner = GraphiteRunner::new(&config.graphite);

    for target_config in &config.targets {
        let name = canonical_target_name(&target_config.instance);
        let source = PgQuerySource::connect(&name, &target_config.connection)
            .await
            .with_context(|| format!("Failed to connect to target '{name}'"))?;

        let mut target = Target::new(
            &target_config.instance,
            target_config.graphite_root.clone(),
            Arc::new(source),
        );
        for selection in &target_config.metrics {
            let definition = catalog
                .get(&selection.name)
                .with_context(|| format!("Unknown metric '{}'", selection.name))?;
            let interval = selection.interval.map(MetricInterval::new).transpose()?;
            target.add_metric(definition, interval);
        }

        runner.add_target(TargetHandle::new(
            target,
            config.scheduler.tick,
            config.scheduler.start_delay,
        ));
    }
    Ok(runner)
}

async fn start_persistence(
    persistence: &PersistenceConfig,
    graphite: &GraphiteConfig,
    directory: Arc<TargetDirectory>,
    dry_run: bool,
) -> AnyhowResult<PersistenceSession> {
    let options = persistence.options();
    let store: Arc<dyn HistoryStore> = if dry_run {
        info!(target: "sqlgraphite::init", "Dry run, history is kept in memory");
        Arc::new(MemoryHistoryStore::new())
    } else {
        if persistence.connection.is_empty() {
            bail!("persistence.connection is required unless --dry-run is given");
        }
        Arc::new(
            PgHistoryStore::connect(&persistence.connection, options.tables())
                .await
                .context("Failed to connect to the history store")?,
        )
    };

    let mut runner = PersistenceRunner::new(
        &persistence.name,
        options,
        graphite.effective_render_host(),
        store,
        Arc::new(HttpRenderClient::new(RENDER_TIMEOUT)?),
        directory,
    )
    .await?;
    for formula in &persistence.formulas {
        runner.add_formula(formula.to_formula());
    }

    let mut session = PersistenceSession::new(runner);
    let batch_id = session.start().await?;
    info!(target: "sqlgraphite::init", session = %persistence.name, batch_id, "Persistence started");
    Ok(session)
}

async fn handle_run(config: MonitorConfig, dry_run: bool) -> AnyhowResult<()> {
    let catalog = MetricCatalog::with_configured(&config.metric_definitions)?;
    check_metric_names(&config, &catalog)?;
    if config.targets.is_empty() {
        warn!(target: "sqlgraphite::init", "No targets configured");
    }

    let mut runner = build_runner(&config, &catalog).await?;
    runner.start().await.context("Failed to start the sender")?;

    let mut session = match &config.persistence {
        Some(persistence) => {
            Some(start_persistence(persistence, &config.graphite, runner.directory(), dry_run).await?)
        }
        None => None,
    };

    match session.as_mut() {
        Some(session) => tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!(target: "sqlgraphite::init", "Interrupt received");
            }
            _ = session.wait() => {
                info!(target: "sqlgraphite::init", "Persistence session finished");
            }
        },
        None => {
            tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            info!(target: "sqlgraphite::init", "Interrupt received");
        }
    }

    if let Some(mut session) = session {
        session.quit().await;
    }
    let drained = runner.quit().await;
    let stats = runner.stats();
    info!(target: "sqlgraphite::init", drained, sent = stats.sent, failed = stats.failed,
        high_water_mark = stats.queue.high_water_mark, "Shutdown complete");
    Ok(())
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        Some(Commands::Validate { verbose }) => return handle_validate(&cli.config, *verbose),
        Some(Commands::Metrics { format }) => return handle_metrics(&cli.config, *format),
        _ => {}
    }

    let config = if cli.config.exists() {
        MonitorConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        MonitorConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!(target: "sqlgraphite::init", path = %cli.config.display(), "Config file not found, using defaults");
    }
    info!(target: "sqlgraphite::init", "{FULL_NAME} v{VERSION}");

    let dry_run = matches!(cli.command, Some(Commands::Run { dry_run: true }));
    handle_run(config, dry_run).await
}
