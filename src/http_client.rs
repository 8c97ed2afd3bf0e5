//! Pooled, TLS-aware HTTP client shared by version detection and the
//! NetBackup fetchers. Tracks in-flight requests so [`NbuHttpClient::close`]
//! can drain outstanding work instead of cutting it off.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{field, warn, Instrument};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("client is closing, request rejected")]
    ClientClosed,
    #[error("authentication failed for {url}")]
    Auth { url: String },
    #[error("server at {url} does not support API version {version}")]
    VersionIncompatible { url: String, version: String },
    #[error("transient upstream error for {url}: {source}")]
    Transient {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected content-type {content_type:?} from {url} (status {status}): {preview}")]
    UnexpectedContentType {
        url: String,
        status: u16,
        content_type: String,
        preview: String,
    },
    #[error("could not decode JSON response from {url} (status {status}): {source}")]
    Decode {
        url: String,
        status: u16,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out or was cancelled")]
    Cancelled { url: String },
}

/// A header set sent with one request. Built inline by each caller so the
/// detector can probe a candidate version without ever touching shared
/// client state.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    pub api_version: String,
    pub api_key: String,
}

struct InFlight {
    active: AtomicU64,
    closing: Mutex<bool>,
    drain_tx: Mutex<Option<oneshot::Sender<()>>>,
    drain_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

/// Single long-lived request executor. `fetch_data` is the one operation
/// every other component calls; `close`/`close_with_timeout` drain it down.
pub struct NbuHttpClient {
    inner: reqwest::Client,
    in_flight: InFlight,
}

impl NbuHttpClient {
    pub fn new(tls_skip_verify: bool, scheme_is_https: bool) -> Self {
        if scheme_is_https && tls_skip_verify {
            warn!("TLS certificate verification is disabled for an https NetBackup endpoint");
        }

        let inner = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(tls_skip_verify)
            .build()
            .expect("static TLS/client configuration should always build");

        let (tx, rx) = oneshot::channel();
        Self {
            inner,
            in_flight: InFlight {
                active: AtomicU64::new(0),
                closing: Mutex::new(false),
                drain_tx: Mutex::new(Some(tx)),
                drain_rx: Mutex::new(Some(rx)),
            },
        }
    }

    /// Issue a GET against `url`, expecting a JSON body, and decode it into
    /// `T`. `headers` is always supplied inline by the caller (the detector
    /// and the fetchers each build their own), so this never reads client
    /// state to decide what version header to send.
    pub async fn fetch_data<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<T, ClientError> {
        self.admit()?;
        let result = self.fetch_data_inner(url, headers).await;
        self.release();
        result
    }

    async fn fetch_data_inner<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<T, ClientError> {
        let span = tracing::info_span!(
            "http.request",
            "http.method" = "GET",
            "http.url" = url,
            "http.status_code" = field::Empty,
            "http.duration_ms" = field::Empty,
        );
        let start = std::time::Instant::now();

        let accept = format!("application/vnd.netbackup+json;version={}", headers.api_version);
        let response = self
            .inner
            .get(url)
            .header("Accept", accept)
            .header("Authorization", &headers.api_key)
            .send()
            .instrument(span.clone())
            .await
            .map_err(|source| classify_transport_error(url, source))?;

        let status = response.status();
        span.record("http.status_code", status.as_u16());
        span.record("http.duration_ms", start.elapsed().as_millis() as u64);

        if status.as_u16() == 401 {
            span.in_scope(|| tracing::error!("NetBackup rejected our API key"));
            return Err(ClientError::Auth {
                url: url.to_string(),
            });
        }
        if status.as_u16() == 406 {
            return Err(ClientError::VersionIncompatible {
                url: url.to_string(),
                version: headers.api_version.clone(),
            });
        }
        if status.is_server_error() {
            return Err(ClientError::Transient {
                url: url.to_string(),
                source: response.error_for_status().unwrap_err(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("json") {
            let status_code = status.as_u16();
            let preview: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(ClientError::UnexpectedContentType {
                url: url.to_string(),
                status: status_code,
                content_type,
                preview,
            });
        }

        let status_code = status.as_u16();
        response.json::<T>().await.map_err(|source| ClientError::Decode {
            url: url.to_string(),
            status: status_code,
            source,
        })
    }

    fn admit(&self) -> Result<(), ClientError> {
        let closing = self.in_flight.closing.lock().unwrap();
        if *closing {
            return Err(ClientError::ClientClosed);
        }
        self.in_flight.active.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Fires the drain signal if this was the last active request and
    /// `close`/`close_with_timeout` already flipped `closing`.
    fn release(&self) {
        let prev = self.in_flight.active.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            let closing = self.in_flight.closing.lock().unwrap();
            if *closing {
                if let Some(tx) = self.in_flight.drain_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        }
    }

    /// Idempotent: a second call (and any call after the first has returned)
    /// simply returns `Ok` again.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.close_with_timeout(DEFAULT_DRAIN_TIMEOUT).await
    }

    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        {
            let mut closing = self.in_flight.closing.lock().unwrap();
            if *closing {
                // Already closing or closed; the first caller already drained.
                return Ok(());
            }
            *closing = true;
        }

        // No requests were in flight when we flipped the flag: fire now,
        // since no `release()` call remains to do it for us.
        if self.in_flight.active.load(Ordering::SeqCst) == 0 {
            if let Some(tx) = self.in_flight.drain_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }

        let rx = self.in_flight.drain_rx.lock().unwrap().take();
        if let Some(rx) = rx {
            let _ = tokio::time::timeout(timeout, rx).await;
        }
        Ok(())
    }
}

fn classify_transport_error(url: &str, source: reqwest::Error) -> ClientError {
    if source.is_timeout() {
        return ClientError::Cancelled {
            url: url.to_string(),
        };
    }
    ClientError::Transient {
        url: url.to_string(),
        source,
    }
}
