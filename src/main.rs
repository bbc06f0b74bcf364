use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use corpus_harvester::config;
use corpus_harvester::harvest::{HarvestError, RunMode, Scheduler};
use corpus_harvester::metrics;
use corpus_harvester::registry::{RegistryStore, SqliteRegistryStore, StatusCount};
use corpus_harvester::sources::{self, Source};
use corpus_harvester::storage::AssetStore;

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, global = true, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the registry database and the asset tree.
    /// Can also be specified in config file.
    #[clap(long, global = true, value_parser = parse_dir)]
    pub data_dir: Option<PathBuf>,

    /// Total storage budget, e.g. "500 GiB".
    #[clap(long, global = true)]
    pub cap: Option<String>,

    /// The port for the metrics server (Prometheus scraping). 0 disables it.
    #[clap(long, global = true, default_value_t = 0)]
    pub metrics_port: u16,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover seeds and fetch until the sources are drained or the cap is reached.
    Run {
        /// Keep polling for new work instead of exiting when drained.
        #[clap(long)]
        continuous: bool,
    },
    /// Print candidate and manifest counts per source and status.
    Status,
    /// Give permanently failed candidates another chance.
    RetryFailed {
        /// Only reset candidates of this source.
        #[clap(long)]
        source: Option<String>,
    },
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            data_dir: args.data_dir.clone(),
            cap: args.cap.clone(),
            metrics_port: args.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    info!(
        "corpus-harvester {}-{}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  data_dir: {:?}", app_config.data_dir);
    info!("  cap: {:#}", byte_unit::Byte::from(app_config.harvest.cap_bytes));
    info!("  sources: {}", app_config.sources.len());

    if !app_config.registry_db_path().exists() {
        info!(
            "Creating new registry database at {:?}",
            app_config.registry_db_path()
        );
    }
    let registry = Arc::new(SqliteRegistryStore::new(app_config.registry_db_path())?);

    match cli_args.command {
        Command::Run { continuous } => run(app_config, registry, continuous).await,
        Command::Status => print_status(registry.as_ref()),
        Command::RetryFailed { source } => {
            let reset = registry.reset_failed_permanent(source.as_deref())?;
            info!("Reset {} permanently failed candidates to pending", reset);
            Ok(())
        }
    }
}

async fn run(
    app_config: config::AppConfig,
    registry: Arc<SqliteRegistryStore>,
    continuous: bool,
) -> Result<()> {
    if app_config.sources.is_empty() {
        bail!("No sources configured, add [[sources]] entries to the config file");
    }

    let mut harvest_sources: Vec<Arc<dyn Source>> = Vec::new();
    for settings in &app_config.sources {
        let source = sources::build_source(settings, app_config.harvest.fetch_timeout())
            .with_context(|| format!("Failed to set up source {}", settings.name))?;
        info!(
            "Source {} ({}) seeded from {:?}",
            settings.name,
            settings.kind.as_str(),
            settings.seed_file
        );
        harvest_sources.push(source);
    }

    info!("Initializing metrics...");
    metrics::init_metrics();

    let shutdown_token = CancellationToken::new();
    if app_config.metrics_port > 0 {
        let port = app_config.metrics_port;
        let token = shutdown_token.child_token();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(port, token).await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    let signal_token = shutdown_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating graceful shutdown");
            signal_token.cancel();
        }
    });

    let scheduler = Scheduler::new(
        registry,
        harvest_sources,
        AssetStore::new(app_config.assets_dir()),
        app_config.harvest.clone(),
    );
    let mode = if continuous {
        RunMode::Continuous
    } else {
        RunMode::Drain
    };

    let result = scheduler.run(mode, shutdown_token.clone()).await;
    shutdown_token.cancel();
    match result {
        Ok(report) => {
            println!("{}", report);
            Ok(())
        }
        Err(HarvestError::Aborted { report }) => {
            println!("{}", report);
            bail!("Harvest aborted: {}", report.failures.join("; "))
        }
        Err(e) => Err(e).context("Harvest failed"),
    }
}

fn print_status(registry: &dyn RegistryStore) -> Result<()> {
    let committed = registry.committed_bytes()?;
    println!("Committed: {:#}", byte_unit::Byte::from(committed));
    println!();
    println!("Candidates:");
    print_counts(&registry.status_counts()?);
    println!();
    println!("Manifests:");
    print_counts(&registry.manifest_status_counts()?);
    Ok(())
}

fn print_counts(counts: &[StatusCount]) {
    if counts.is_empty() {
        println!("  (none)");
    }
    for count in counts {
        println!("  {:<20} {:<18} {}", count.source, count.status, count.count);
    }
}
