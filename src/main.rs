use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use nbu_exporter::collector::MetricsCollector;
use nbu_exporter::config::{self, ConfigHolder};
use nbu_exporter::http_client::NbuHttpClient;
use nbu_exporter::{reload, server, telemetry};
use nbu_exporter::version::VersionDetector;

const SAMPLE_CONFIG: &str = r#"# nbu_exporter configuration.
server:
  host: "0.0.0.0"         # bind address for the metrics server
  port: 9106               # bind port
  uri: "/metrics"           # metrics path
  scrapingInterval: "30s"   # jobs time-window and per-scrape deadline
  logLevel: "info"          # default tracing env-filter directive
  # logName: "/var/log/nbu_exporter.log"  # omit to log to stdout

nbuserver:
  scheme: "https"
  host: "nbu.example.com"
  port: 1556
  uri: "/netbackup"
  apiKey: "REPLACE_ME"
  # apiVersion: "13.0"      # omit to auto-detect the highest supported version
  insecureSkipVerify: false

opentelemetry:
  enabled: false
  # endpoint: "otel-collector:4317"
  # insecure: true
  # samplingRate: 0.1

# cacheTTL: "5m"
"#;

#[derive(Parser, Debug)]
#[command(name = "nbu_exporter", version, about = "Prometheus exporter for the Veritas NetBackup REST API")]
struct Cli {
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print an annotated sample configuration file and exit.
    GenerateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::GenerateConfig) = cli.command {
        println!("{SAMPLE_CONFIG}");
        return ExitCode::SUCCESS;
    }

    let initial = match config::load(&cli.config) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            eprintln!("fatal: could not load config {}: {error}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let log_level = cli.log_level.as_deref().unwrap_or_else(|| initial.log_level());
    let _telemetry_guard = match telemetry::init(log_level, initial.log_name(), initial.tracing()) {
        Ok(guard) => guard,
        Err(error) => {
            eprintln!("fatal: could not initialize logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        config_path = %cli.config.display(),
        nbu_host = initial.nbu_host(),
        api_key = %initial.masked_api_key(),
        "nbu_exporter starting"
    );

    let client = Arc::new(NbuHttpClient::new(initial.tls_skip_verify(), initial.nbu_scheme() == config::Scheme::Https));

    let snapshot = if initial.api_version().is_some() {
        initial
    } else {
        let base_url = initial.nbu_base_url();
        let detector = VersionDetector::new(&client, &base_url, initial.api_key());
        match detector.detect().await {
            Ok(version) => {
                info!(version, "negotiated NetBackup API version");
                initial.with_detected_api_version(&version)
            }
            Err(error) => {
                error!(%error, "fatal: could not negotiate a NetBackup API version");
                return ExitCode::FAILURE;
            }
        }
    };

    let (server_host, server_port) = snapshot.server_addr();
    let addr: SocketAddr = match format!("{server_host}:{server_port}").parse() {
        Ok(addr) => addr,
        Err(error) => {
            error!(%error, "fatal: invalid server bind address");
            return ExitCode::FAILURE;
        }
    };
    let metrics_path = snapshot.metrics_path().to_string();

    let holder = Arc::new(ConfigHolder::new(snapshot));
    let collector = Arc::new(MetricsCollector::new(holder.clone(), client.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (error_tx, mut error_rx) = mpsc::channel(1);

    let server_task = tokio::spawn(server::run(
        addr,
        metrics_path,
        holder.clone(),
        client.clone(),
        collector.clone(),
        shutdown_rx.clone(),
        error_tx,
    ));

    let reload_task = tokio::spawn(reload::run(cli.config.clone(), holder, collector, shutdown_rx));

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(error) => {
            error!(%error, "fatal: could not install SIGTERM handler");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down gracefully");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl-C, shutting down gracefully");
        }
        Some(error) = error_rx.recv() => {
            error!(%error, "server task reported a fatal error, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = server_task.await;
    let _ = reload_task.await;

    ExitCode::SUCCESS
}
