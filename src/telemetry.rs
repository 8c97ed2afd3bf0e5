//! Logging and tracing bootstrap. Initializes the subscriber before any
//! other component logs, as the very first step of `main`.

use std::fs::OpenOptions;
use std::sync::Mutex;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{trace::Config as TraceConfig, Resource};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::TracingConfig;

#[derive(thiserror::Error, Debug)]
#[error("could not open log file {path}: {source}")]
pub struct LogFileError {
    path: String,
    #[source]
    source: std::io::Error,
}

fn writer_for(log_name: Option<&str>) -> Result<BoxMakeWriter, LogFileError> {
    match log_name {
        None => Ok(BoxMakeWriter::new(std::io::stdout)),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogFileError {
                    path: path.to_string(),
                    source,
                })?;
            Ok(BoxMakeWriter::new(Mutex::new(file)))
        }
    }
}

/// Dropping this flushes any buffered OTLP spans before the process exits.
pub struct TelemetryGuard {
    otlp_enabled: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otlp_enabled {
            opentelemetry::global::shutdown_tracer_provider();
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("failed to install OTLP trace pipeline: {0}")]
    Otlp(#[from] opentelemetry::trace::TraceError),
    #[error("a global tracing subscriber was already installed for this process")]
    AlreadyInitialized,
    #[error(transparent)]
    LogFile(#[from] LogFileError),
}

/// `log_level` takes the `--log-level` CLI flag / `RUST_LOG` env var as a
/// base filter directive (falling back to the config file's `logLevel`,
/// itself defaulting to `info`); `tracing` config from the validated
/// snapshot controls whether a batched OTLP exporter layer is attached
/// underneath. `log_name` selects stdout (`None`) or an append-mode file.
pub fn init(
    log_level: &str,
    log_name: Option<&str>,
    tracing_cfg: &TracingConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_writer(writer_for(log_name)?);

    let otlp_enabled = tracing_cfg.enabled;

    if otlp_enabled {
        let endpoint = tracing_cfg
            .endpoint
            .clone()
            .expect("validated snapshot guarantees an endpoint when tracing is enabled");

        let mut exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(&endpoint);
        if !tracing_cfg.insecure {
            exporter = exporter.with_tls_config(Default::default());
        }

        let sampler = opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(tracing_cfg.sampling_rate);
        let trace_config = TraceConfig::default()
            .with_sampler(sampler)
            .with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                env!("CARGO_PKG_NAME"),
            )]));

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(trace_config)
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|_| TelemetryError::AlreadyInitialized)?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|_| TelemetryError::AlreadyInitialized)?;
    }

    Ok(TelemetryGuard { otlp_enabled })
}
