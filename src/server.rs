//! Minimal HTTP serving shell: binds `/metrics` and `/health`, wires up
//! signal-driven graceful shutdown, and funnels any fatal bind/serve error
//! back to the caller over a buffered error channel instead of aborting the
//! process outright.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::collector::MetricsCollector;
use crate::config::ConfigHolder;
use crate::http_client::{NbuHttpClient, RequestHeaders};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct ServerState {
    config: Arc<ConfigHolder>,
    client: Arc<NbuHttpClient>,
    collector: Arc<MetricsCollector>,
}

/// Runs until `shutdown` resolves, then drains the HTTP client and returns.
/// Fatal bind errors are sent on `error_tx` (capacity 1) rather than
/// propagated directly, so the caller can select over shutdown and startup
/// failure uniformly.
pub async fn run(
    addr: SocketAddr,
    metrics_path: String,
    config: Arc<ConfigHolder>,
    client: Arc<NbuHttpClient>,
    collector: Arc<MetricsCollector>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    error_tx: mpsc::Sender<ServerError>,
) {
    let state = Arc::new(ServerState {
        config,
        client: client.clone(),
        collector,
    });

    let make_service = make_service_fn(move |_conn| {
        let state = state.clone();
        let metrics_path = metrics_path.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                let metrics_path = metrics_path.clone();
                async move { Ok::<_, Infallible>(handle(req, &metrics_path, &state).await) }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_service),
        Err(error) => {
            let _ = error_tx
                .send(ServerError::Bind {
                    addr,
                    message: error.to_string(),
                })
                .await;
            return;
        }
    };

    info!(%addr, "metrics server listening");

    let graceful = server.with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    });

    if let Err(error) = graceful.await {
        let _ = error_tx
            .send(ServerError::Serve {
                message: error.to_string(),
            })
            .await;
    }

    if let Err(error) = client.close_with_timeout(CLIENT_DRAIN_TIMEOUT).await {
        error!(%error, "error draining HTTP client during shutdown");
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("failed to bind metrics server on {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },
    #[error("metrics server terminated unexpectedly: {message}")]
    Serve { message: String },
}

async fn handle(req: Request<Body>, metrics_path: &str, state: &ServerState) -> Response<Body> {
    match req.uri().path() {
        path if path == metrics_path => metrics_handler(state).await,
        "/health" => health_handler(state).await,
        _ => Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .expect("static response parts always build"),
    }
}

async fn metrics_handler(state: &ServerState) -> Response<Body> {
    state.collector.collect().await;
    match state.collector.encode() {
        Ok(body) => Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4")
            .body(Body::from(body))
            .expect("static response parts always build"),
        Err(error) => {
            error!(%error, "failed to encode metrics");
            Response::builder()
                .status(500)
                .body(Body::from("failed to encode metrics"))
                .expect("static response parts always build")
        }
    }
}

async fn health_handler(state: &ServerState) -> Response<Body> {
    let snapshot = state.config.current();
    let url = format!(
        "{}/admin/jobs?page[limit]=1",
        snapshot.nbu_base_url().trim_end_matches('/')
    );
    let headers = RequestHeaders {
        api_version: snapshot.api_version_or_default().to_string(),
        api_key: snapshot.api_key().to_string(),
    };

    let probe = tokio::time::timeout(
        HEALTH_PROBE_TIMEOUT,
        state.client.fetch_data::<serde_json::Value>(&url, &headers),
    )
    .await;

    match probe {
        Ok(Ok(_)) => Response::builder()
            .status(200)
            .body(Body::from("ok"))
            .expect("static response parts always build"),
        Ok(Err(error)) => {
            info!(%error, "health probe failed");
            unavailable()
        }
        Err(_) => {
            info!("health probe exceeded its 5s budget");
            unavailable()
        }
    }
}

fn unavailable() -> Response<Body> {
    Response::builder()
        .status(503)
        .body(Body::from("NetBackup connectivity probe failed"))
        .expect("static response parts always build")
}
