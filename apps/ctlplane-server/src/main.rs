use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use ctlplane::telemetry::{self, init as otel};
use ctlplane::{Database, FeatureFlags, Ipam, IpamClient, Logger, ServiceContext};
use ctlplane_bootstrap::{AppConfig, CliArgs, DatabaseConfig, IpamConfig};

use std::path::{Path, PathBuf};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// ctlplane server - control plane for a device overlay network
#[derive(Parser, Debug)]
#[command(name = "ctlplane-server")]
#[command(about = "ctlplane server - control plane for a device overlay network")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for server.port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Use an in-memory SQLite database
    #[arg(long)]
    mock: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

impl Cli {
    fn args(&self) -> CliArgs {
        CliArgs {
            config: self.config.as_ref().map(|p| p.to_string_lossy().to_string()),
            port: self.port,
            print_config: self.print_config,
            verbose: self.verbose,
            mock: self.mock,
        }
    }
}

/// defaults -> YAML (if provided) -> env (APP__*) -> CLI overrides.
fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&cli.args());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // The OpenTelemetry layer has to exist before the subscriber is installed.
    let otel_layer = match config.tracing.as_ref() {
        Some(tc) => otel::init_tracing(tc)?,
        None => None,
    };

    let logging_config = config
        .logging
        .clone()
        .unwrap_or_else(ctlplane_bootstrap::default_logging_config);
    ctlplane_bootstrap::init_logging(
        &logging_config,
        Path::new(&config.server.home_dir),
        otel_layer,
    );

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config).await,
    }
}

async fn run_server(mut config: AppConfig) -> Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "ctlplane server starting"
    );

    let db_cfg = database_config(&mut config);
    let dsn = config
        .database_dsn()?
        .context("database DSN could not be resolved")?;
    let db = Database::connect(&dsn, &db_cfg.pool)
        .await
        .context("failed to connect to the database")?;

    let ipam: Arc<dyn Ipam> = Arc::new(IpamClient::new(&ipam_config(&config))?);
    let fflags = Arc::new(FeatureFlags::from_config(&config.fflags));

    let startup = tracing::info_span!("startup", app = "ctlplane");
    let api = startup.in_scope(|| {
        ServiceContext::new(
            &telemetry::current_context(),
            Logger::new("api"),
            db.clone(),
            ipam,
            fflags,
        )
    })?;

    startup.in_scope(|| {
        let log = api.logger(&telemetry::current_context());
        ctlplane::log_info!(
            log,
            driver = api.db().driver().name(),
            default_zone = %api.default_zone_id(),
            "service context ready"
        );
        for (name, enabled) in api.fflags().list() {
            ctlplane::log_debug!(log, flag = name, enabled, "feature flag");
        }
    });

    ctlplane_bootstrap::wait_for_shutdown().await?;

    db.pool().close().await;
    otel::shutdown_tracing();
    Ok(())
}

async fn check_config(config: AppConfig) -> Result<()> {
    tracing::info!("Checking configuration…");

    if let Some(dsn) = config.database_dsn()? {
        let driver = ctlplane::Driver::from_dsn(&dsn)?;
        if let ctlplane::Driver::Other(name) = &driver {
            anyhow::bail!("unsupported database driver: {name}");
        }
    }
    IpamClient::new(&ipam_config(&config)).context("invalid ipam section")?;

    if let Some(tc) = config.tracing.as_ref().filter(|tc| tc.enabled) {
        if let Err(e) = otel::otel_connectivity_probe(tc).await {
            tracing::error!(error = %e, "OTLP connectivity probe failed");
        }
    }

    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}

fn database_config(config: &mut AppConfig) -> DatabaseConfig {
    config
        .database
        .get_or_insert_with(|| {
            tracing::warn!("no database section found; using the default SQLite file");
            DatabaseConfig::default()
        })
        .clone()
}

fn ipam_config(config: &AppConfig) -> IpamConfig {
    config.ipam.clone().unwrap_or_else(|| {
        tracing::warn!(url = IpamClient::DEFAULT_URL, "no ipam section found; using the local default");
        IpamConfig {
            url: IpamClient::DEFAULT_URL.to_string(),
            namespace: None,
            timeout_ms: 5_000,
        }
    })
}
