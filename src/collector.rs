//! The metrics collector: owns the `prometheus::Registry`, runs one scrape
//! cycle per call, and updates gauges in place. Gathering and text encoding
//! happen downstream in the serving shell, not here.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use tracing::{field, Instrument};

use crate::cache::TtlCache;
use crate::config::ConfigHolder;
use crate::http_client::NbuHttpClient;
use crate::netbackup::{fetch_jobs, fetch_storage_units, JobAggregate, StorageMetric};

pub struct MetricsCollector {
    config: std::sync::Arc<ConfigHolder>,
    client: std::sync::Arc<NbuHttpClient>,
    storage_cache: TtlCache<Vec<StorageMetric>>,

    registry: Registry,
    nbu_disk_bytes: GaugeVec,
    nbu_jobs_bytes: GaugeVec,
    nbu_jobs_count: GaugeVec,
    nbu_status_count: GaugeVec,
    nbu_api_version: GaugeVec,
    nbu_up: Gauge,
    nbu_last_scrape_timestamp_seconds: GaugeVec,
}

impl MetricsCollector {
    pub fn new(config: std::sync::Arc<ConfigHolder>, client: std::sync::Arc<NbuHttpClient>) -> Self {
        let registry = Registry::new();
        let cache_ttl = config.current().cache_ttl();

        let nbu_disk_bytes = register_gauge_vec(
            &registry,
            "nbu_disk_bytes",
            "Per-storage-unit capacity in bytes, cached between refreshes",
            &["name", "type", "size"],
        );
        let nbu_jobs_bytes = register_gauge_vec(
            &registry,
            "nbu_jobs_bytes",
            "Bytes transferred by jobs within the scrape window",
            &["action", "policy_type", "status"],
        );
        let nbu_jobs_count = register_gauge_vec(
            &registry,
            "nbu_jobs_count",
            "Job count within the scrape window",
            &["action", "policy_type", "status"],
        );
        let nbu_status_count = register_gauge_vec(
            &registry,
            "nbu_status_count",
            "Job count per status code within the scrape window",
            &["action", "status"],
        );
        let nbu_api_version = register_gauge_vec(
            &registry,
            "nbu_api_version",
            "Constant 1, labeled with the NetBackup API version currently in use",
            &["version"],
        );
        let nbu_up = register_gauge(
            &registry,
            "nbu_up",
            "1 if at least one of the storage or jobs fetch succeeded this cycle, else 0",
        );
        let nbu_last_scrape_timestamp_seconds = register_gauge_vec(
            &registry,
            "nbu_last_scrape_timestamp_seconds",
            "Unix time of the last successful refresh per source",
            &["source"],
        );

        Self {
            config,
            client,
            storage_cache: TtlCache::new(cache_ttl),
            registry,
            nbu_disk_bytes,
            nbu_jobs_bytes,
            nbu_jobs_count,
            nbu_status_count,
            nbu_api_version,
            nbu_up,
            nbu_last_scrape_timestamp_seconds,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Drop the cached storage-unit result set. Called by the reload
    /// coordinator when the NBU host or port changes.
    pub async fn flush_storage_cache(&self) {
        self.storage_cache.flush().await;
    }

    /// Run one scrape cycle: fetch storage and jobs concurrently, aggregate,
    /// and update every gauge in place. Safe to call concurrently; the only
    /// shared state touched is the config snapshot, the cache, and the
    /// client's in-flight counter, all independently synchronized.
    pub async fn collect(&self) {
        let snapshot = self.config.current();
        let base_url = snapshot.nbu_base_url();
        let api_version = snapshot.api_version_or_default().to_string();
        let api_key = snapshot.api_key().to_string();
        let scrape_window = snapshot.scrape_window();

        let span = tracing::info_span!(
            "prometheus.scrape",
            "nbu.api_version" = %api_version,
            "scrape.up" = field::Empty,
            "scrape.duration_ms" = field::Empty,
            "scrape.storage_metrics_count" = field::Empty,
            "scrape.job_metrics_count" = field::Empty,
            "scrape.status" = field::Empty,
            "otel.status_code" = field::Empty,
        );
        let started_at = Instant::now();

        async {
            let deadline = scrape_window;
            let storage_fut = tokio::time::timeout(
                deadline,
                self.fetch_storage_cached(&base_url, &api_version, &api_key),
            );
            let jobs_fut = tokio::time::timeout(
                deadline,
                fetch_jobs(&self.client, &base_url, &api_version, &api_key, scrape_window),
            );

            let (storage_result, jobs_result) = tokio::join!(storage_fut, jobs_fut);

            let storage = match storage_result {
                Ok(Ok(units)) => Some(units),
                Ok(Err(error)) => {
                    tracing::warn!(%error, "storage fetch failed this cycle");
                    None
                }
                Err(_) => {
                    tracing::warn!("storage fetch exceeded the scrape deadline");
                    None
                }
            };

            let jobs = match jobs_result {
                Ok(Ok(agg)) => Some(agg),
                Ok(Err(error)) => {
                    tracing::warn!(%error, "jobs fetch failed this cycle");
                    None
                }
                Err(_) => {
                    tracing::warn!("jobs fetch exceeded the scrape deadline");
                    None
                }
            };

            let up = storage.is_some() || jobs.is_some();
            let current_span = tracing::Span::current();
            current_span.record("scrape.up", up);
            current_span.record("scrape.status", if storage.is_some() && jobs.is_some() {
                "success"
            } else {
                "partial_failure"
            });
            if !up {
                current_span.record("otel.status_code", "ERROR");
            }

            self.nbu_up.set(if up { 1.0 } else { 0.0 });

            self.nbu_api_version.reset();
            self.nbu_api_version.with_label_values(&[&api_version]).set(1.0);

            // Reset every source's gauges unconditionally before repopulating,
            // so a failing source's previous-cycle samples are never re-served
            // instead of simply being absent.
            self.nbu_disk_bytes.reset();
            self.nbu_jobs_bytes.reset();
            self.nbu_jobs_count.reset();
            self.nbu_status_count.reset();

            let mut storage_metrics_count = 0u64;
            let mut job_metrics_count = 0u64;

            if let Some(units) = storage {
                storage_metrics_count = units.len() as u64 * 3;
                self.emit_storage(&units);
                if let Some(ts) = self.storage_cache.last_refresh_unix_seconds() {
                    self.nbu_last_scrape_timestamp_seconds
                        .with_label_values(&["storage"])
                        .set(ts as f64);
                }
            }

            if let Some(agg) = jobs {
                job_metrics_count = (agg.bytes_by_action_policy_status.len()
                    + agg.count_by_action_policy_status.len()
                    + agg.count_by_action_status.len()) as u64;
                self.emit_jobs(&agg);
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                self.nbu_last_scrape_timestamp_seconds
                    .with_label_values(&["jobs"])
                    .set(now as f64);
            }

            current_span.record("scrape.storage_metrics_count", storage_metrics_count);
            current_span.record("scrape.job_metrics_count", job_metrics_count);
            current_span.record("scrape.duration_ms", started_at.elapsed().as_millis() as u64);
        }
        .instrument(span)
        .await
    }

    async fn fetch_storage_cached(
        &self,
        base_url: &str,
        api_version: &str,
        api_key: &str,
    ) -> Result<Vec<StorageMetric>, crate::netbackup::FetchError> {
        self.storage_cache
            .get(|| fetch_storage_units(&self.client, base_url, api_version, api_key))
            .await
    }

    fn emit_storage(&self, units: &[StorageMetric]) {
        for unit in units {
            self.nbu_disk_bytes
                .with_label_values(&[&unit.name, &unit.storage_type, "free"])
                .set(unit.free_bytes as f64);
            self.nbu_disk_bytes
                .with_label_values(&[&unit.name, &unit.storage_type, "used"])
                .set(unit.used_bytes as f64);
            self.nbu_disk_bytes
                .with_label_values(&[&unit.name, &unit.storage_type, "total"])
                .set(unit.total_bytes as f64);
        }
    }

    fn emit_jobs(&self, agg: &JobAggregate) {
        for ((action, policy_type, status), bytes) in &agg.bytes_by_action_policy_status {
            self.nbu_jobs_bytes
                .with_label_values(&[action, policy_type, status])
                .set(*bytes);
        }
        for ((action, policy_type, status), count) in &agg.count_by_action_policy_status {
            self.nbu_jobs_count
                .with_label_values(&[action, policy_type, status])
                .set(*count as f64);
        }
        for ((action, status), count) in &agg.count_by_action_status {
            self.nbu_status_count
                .with_label_values(&[action, status])
                .set(*count as f64);
        }
    }

    /// Gather and render the current registry state as Prometheus text
    /// exposition format. Used by the `/metrics` handler.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        Ok(buffer)
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let gauge = Gauge::with_opts(Opts::new(name, help)).expect("static gauge opts always valid");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric name collisions are a programming error caught in tests");
    gauge
}

fn register_gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let gauge = GaugeVec::new(Opts::new(name, help), labels).expect("static gauge opts always valid");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric name collisions are a programming error caught in tests");
    gauge
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHolder, ConfigSnapshot};
    use crate::config::raw::{RawConfig, RawNbuServer, RawServer, RawTracing};
    use crate::test_support::{respond_json, spawn_fake_server};
    use serde_json::json;
    use std::sync::Arc;

    fn snapshot(host: &str, port: u16) -> ConfigSnapshot {
        ConfigSnapshot::from_raw(RawConfig {
            server: RawServer {
                host: "0.0.0.0".to_string(),
                port: 9106,
                uri: "/metrics".to_string(),
                scraping_interval: "30s".to_string(),
                log_name: None,
                log_level: None,
            },
            nbuserver: RawNbuServer {
                scheme: "http".to_string(),
                host: host.to_string(),
                port,
                uri: "".to_string(),
                api_key: "abcd1234efgh5678".to_string(),
                api_version: Some("13.0".to_string()),
                insecure_skip_verify: false,
            },
            opentelemetry: RawTracing::default(),
            cache_ttl: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn full_success_marks_up_and_emits_gauges() {
        let uri = spawn_fake_server(|req| async move {
            if req.uri().path().starts_with("/storage") {
                respond_json(
                    200,
                    json!({"data": [{"attributes": {"storageUnitName": "a", "storageType": "BasicDisk", "totalCapacityBytes": 10, "usedCapacityBytes": 4, "availableCapacityBytes": 6}}]}),
                )
            } else {
                respond_json(
                    200,
                    json!({"data": [{"attributes": {"jobId": 1, "jobType": "BACKUP", "policyType": "Standard", "status": 0, "kilobytesTransferred": 1}}]}),
                )
            }
        })
        .await;

        let addr = uri.trim_start_matches("http://").trim_end_matches('/');
        let (host, port) = addr.split_once(':').unwrap();

        let config = Arc::new(ConfigHolder::new(snapshot(host, port.parse().unwrap())));
        let client = Arc::new(NbuHttpClient::new(false, false));
        let collector = MetricsCollector::new(config, client);

        collector.collect().await;

        let rendered = String::from_utf8(collector.encode().unwrap()).unwrap();
        assert!(rendered.contains("nbu_up 1"));
        assert!(rendered.contains("nbu_disk_bytes"));
        assert!(rendered.contains("nbu_jobs_count"));
    }

    #[tokio::test]
    async fn total_failure_marks_down_without_panicking() {
        let config = Arc::new(ConfigHolder::new(snapshot("127.0.0.1", 1)));
        let client = Arc::new(NbuHttpClient::new(false, false));
        let collector = MetricsCollector::new(config, client);

        collector.collect().await;

        let rendered = String::from_utf8(collector.encode().unwrap()).unwrap();
        assert!(rendered.contains("nbu_up 0"));
    }
}
