//! Probes a NetBackup server to find the highest API version it accepts.
//! Detection never mutates configuration; the caller folds the winning
//! version into a snapshot once detection returns.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::http_client::{ClientError, NbuHttpClient, RequestHeaders};

/// Tried in order; the first that answers 2xx wins.
const CANDIDATE_VERSIONS: [&str; 3] = ["13.0", "12.0", "3.0"];

const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_FACTOR: u32 = 2;
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);
const RETRY_MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("NetBackup rejected the API key while probing {url}")]
    Auth { url: String },
    #[error("no candidate API version among {tried:?} was accepted by the server; last error: {last_cause}")]
    NoCandidateAccepted {
        tried: Vec<&'static str>,
        last_cause: String,
    },
}

/// Placeholder target type for the detection probe: a minimal parse of the
/// jobs envelope, enough to prove the response is well-formed JSON for this
/// version without depending on the full job record shape.
#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default)]
    #[allow(dead_code)]
    data: serde_json::Value,
}

/// Holds only what detection needs: the base URL and API key. Never touches
/// a `ConfigSnapshot` or any other shared state.
pub struct VersionDetector<'a> {
    client: &'a NbuHttpClient,
    base_url: &'a str,
    api_key: &'a str,
}

impl<'a> VersionDetector<'a> {
    pub fn new(client: &'a NbuHttpClient, base_url: &'a str, api_key: &'a str) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    pub async fn detect(&self) -> Result<String, DetectError> {
        let probe_url = format!("{}/admin/jobs?page[limit]=1", self.base_url.trim_end_matches('/'));
        let mut last_cause = String::new();

        for &version in CANDIDATE_VERSIONS.iter() {
            let headers = RequestHeaders {
                api_version: version.to_string(),
                api_key: self.api_key.to_string(),
            };

            match self.try_candidate(&probe_url, &headers).await {
                Ok(()) => {
                    info!(version, "detected NetBackup API version");
                    return Ok(version.to_string());
                }
                Err(CandidateOutcome::Unsupported(cause)) => {
                    last_cause = cause;
                    continue;
                }
                Err(CandidateOutcome::Auth) => {
                    return Err(DetectError::Auth {
                        url: probe_url.clone(),
                    });
                }
                Err(CandidateOutcome::Exhausted(cause)) => {
                    last_cause = cause;
                    continue;
                }
            }
        }

        Err(DetectError::NoCandidateAccepted {
            tried: CANDIDATE_VERSIONS.to_vec(),
            last_cause,
        })
    }

    /// Probe a single candidate version, retrying transient failures with
    /// exponential backoff before giving up on that candidate.
    async fn try_candidate(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<(), CandidateOutcome> {
        let mut backoff = RETRY_INITIAL_BACKOFF;

        for attempt in 1..=RETRY_MAX_ATTEMPTS {
            match self.client.fetch_data::<ProbeResponse>(url, headers).await {
                Ok(_) => return Ok(()),
                Err(ClientError::Auth { .. }) => return Err(CandidateOutcome::Auth),
                Err(ClientError::VersionIncompatible { .. }) => {
                    return Err(CandidateOutcome::Unsupported(format!(
                        "version {} not accepted (406)",
                        headers.api_version
                    )));
                }
                Err(err @ (ClientError::Transient { .. } | ClientError::Cancelled { .. })) => {
                    if attempt == RETRY_MAX_ATTEMPTS {
                        return Err(CandidateOutcome::Exhausted(err.to_string()));
                    }
                    warn!(
                        version = %headers.api_version,
                        attempt,
                        %err,
                        "transient error probing candidate API version, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * RETRY_BACKOFF_FACTOR).min(RETRY_MAX_BACKOFF);
                }
                Err(err) => return Err(CandidateOutcome::Exhausted(err.to_string())),
            }
        }

        unreachable!("loop always returns within RETRY_MAX_ATTEMPTS iterations")
    }
}

enum CandidateOutcome {
    Unsupported(String),
    Auth,
    Exhausted(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{respond_json, spawn_fake_server};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn detects_highest_accepted_version() {
        let uri = spawn_fake_server(|req| async move {
            let accept = req
                .headers()
                .get("accept")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if accept.contains("version=13.0") {
                respond_json(406, json!({}))
            } else if accept.contains("version=12.0") {
                respond_json(200, json!({"data": []}))
            } else {
                respond_json(200, json!({"data": []}))
            }
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let detector = VersionDetector::new(&client, uri.trim_end_matches('/'), "key");
        let version = detector.detect().await.unwrap();
        assert_eq!(version, "12.0");
    }

    #[tokio::test]
    async fn auth_failure_stops_immediately_without_trying_other_versions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let uri = spawn_fake_server(move |_req| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                respond_json(401, json!({}))
            }
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let detector = VersionDetector::new(&client, uri.trim_end_matches('/'), "key");
        let err = detector.detect().await.unwrap_err();
        assert!(matches!(err, DetectError::Auth { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failure_before_succeeding() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let uri = spawn_fake_server(move |_req| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    respond_json(503, json!({}))
                } else {
                    respond_json(200, json!({"data": []}))
                }
            }
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let detector = VersionDetector::new(&client, uri.trim_end_matches('/'), "key");

        // Paused time auto-advances past the retry backoff sleeps once the
        // only pending work left is those timers.
        let version = detector.detect().await.unwrap();

        assert_eq!(version, "13.0");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn all_candidates_rejected_reports_all_tried() {
        let uri = spawn_fake_server(|_req| async { respond_json(406, json!({})) }).await;
        let client = NbuHttpClient::new(false, false);
        let detector = VersionDetector::new(&client, uri.trim_end_matches('/'), "key");
        let err = detector.detect().await.unwrap_err();
        match err {
            DetectError::NoCandidateAccepted { tried, .. } => {
                assert_eq!(tried, CANDIDATE_VERSIONS.to_vec());
            }
            other => panic!("expected NoCandidateAccepted, got {other:?}"),
        }
    }
}
