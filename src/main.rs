use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use duckdb_exporter::{
    api::{self, AppState},
    config::{self, ExporterConfig},
    db::DuckDbPool,
    logging,
    scrape::{Exporter, ScrapeMode},
    ExporterError, Result,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Prometheus exporter for DuckDB query results.
#[derive(Parser, Debug)]
#[command(name = "duckdb_exporter", version, about, long_about = None)]
struct Cli {
    /// Address to listen on for web interface and telemetry
    #[arg(long = "web.listen-address", env = "LISTEN_ADDRESS", default_value = "0.0.0.0:9161")]
    listen_address: String,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", env = "TELEMETRY_PATH", default_value = "/metrics")]
    telemetry_path: String,

    /// Database file, `:memory:` or empty for an in-memory database
    #[arg(long = "database.dsn", env = "DATA_SOURCE_NAME", default_value = "")]
    dsn: String,

    /// File whose trimmed content replaces the DSN
    #[arg(long = "database.dsn-file", env = "DATA_SOURCE_NAME_FILE")]
    dsn_file: Option<PathBuf>,

    /// File with the default metric definitions (replaces the built-in set)
    #[arg(long = "default.metrics", env = "DEFAULT_METRICS")]
    default_metrics: Option<PathBuf>,

    /// Comma separated list of custom metric definition files
    #[arg(long = "custom.metrics", env = "CUSTOM_METRICS", default_value = "")]
    custom_metrics: String,

    /// Query timeout in seconds
    #[arg(long = "query.timeout", env = "QUERY_TIMEOUT", default_value_t = 5)]
    query_timeout: u64,

    /// Minimum number of idle connections kept in the pool
    #[arg(long = "database.max-idle-conns", env = "DATABASE_MAXIDLECONNS", default_value_t = 0)]
    max_idle_conns: u32,

    /// Maximum number of open connections
    #[arg(long = "database.max-open-conns", env = "DATABASE_MAXOPENCONNS", default_value_t = 10)]
    max_open_conns: u32,

    /// Interval between scrapes; 0s scrapes on every request
    #[arg(
        long = "scrape.interval",
        env = "SCRAPE_INTERVAL",
        default_value = "0s",
        value_parser = config::parse_duration
    )]
    scrape_interval: Duration,

    /// Prefix of every exported metric name
    #[arg(long = "namespace", env = "METRICS_NAMESPACE", default_value = config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,
}

impl Cli {
    fn exporter_config(&self) -> Result<ExporterConfig> {
        let dsn = match &self.dsn_file {
            Some(path) => std::fs::read_to_string(path)
                .map(|content| content.trim().to_string())
                .map_err(|e| {
                    ExporterError::Config(format!(
                        "cannot read DSN file {}: {}",
                        path.display(),
                        e
                    ))
                })?,
            None => self.dsn.clone(),
        };

        let config = ExporterConfig {
            dsn,
            max_idle_conns: self.max_idle_conns,
            max_open_conns: self.max_open_conns,
            custom_metrics: config::parse_custom_metrics(&self.custom_metrics),
            default_metrics: self.default_metrics.clone(),
            query_timeout: Duration::from_secs(self.query_timeout),
            scrape_interval: self.scrape_interval,
            namespace: self.namespace.clone(),
        };
        config.validate()?;

        if !self.telemetry_path.starts_with('/') || self.telemetry_path == "/" {
            return Err(ExporterError::Config(format!(
                "telemetry path '{}' must start with '/' and differ from the landing page",
                self.telemetry_path
            )));
        }

        Ok(config)
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = cli.exporter_config()?;
    info!(dsn = %logging::mask_dsn(&config.dsn), "Starting duckdb_exporter");

    let db = DuckDbPool::connect(&config.dsn, config.max_open_conns, config.max_idle_conns)
        .map_err(ExporterError::Connectivity)?;
    let exporter = Arc::new(Exporter::new(&config, Arc::new(db))?);

    let (fatal_tx, fatal_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = watch::channel(false);

    let scheduler = match exporter.mode() {
        ScrapeMode::Scheduled(_) => {
            let exporter = Arc::clone(&exporter);
            let fatal_tx = fatal_tx.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = exporter.run_scheduled(stop_rx).await {
                    error!(error = %e, "Scheduled scrapes failed");
                    let _ = fatal_tx.try_send(e.to_string());
                }
            }))
        }
        ScrapeMode::OnDemand => None,
    };

    let state = AppState::new(
        Arc::clone(&exporter),
        &config.namespace,
        cli.telemetry_path.clone(),
        fatal_tx,
    )?;

    let listener = TcpListener::bind(&cli.listen_address).await.map_err(|e| {
        ExporterError::Internal(format!("Failed to bind to {}: {}", cli.listen_address, e))
    })?;

    // Distinguish a fatal stop from an operator-requested one.
    let (fatal_seen_tx, fatal_seen_rx) = tokio::sync::oneshot::channel();
    let shutdown = async move {
        let mut fatal_rx = fatal_rx;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown signal received");
                let _ = fatal_seen_tx.send(false);
            }
            Some(reason) = fatal_rx.recv() => {
                error!(%reason, "Stopping after fatal scrape error");
                let _ = fatal_seen_tx.send(true);
            }
        }
    };

    api::serve(listener, state, shutdown).await?;

    let _ = stop_tx.send(true);
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }

    Ok(fatal_seen_rx.await.unwrap_or(false))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logger(cli.log_level);

    match run(cli).await {
        Ok(false) => ExitCode::SUCCESS,
        Ok(true) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Exporter failed");
            ExitCode::FAILURE
        }
    }
}
