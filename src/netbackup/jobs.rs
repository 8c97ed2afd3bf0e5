//! `GET /admin/jobs` fetch: time-windowed, paginated, aggregated as pages
//! arrive since per-page aggregation is commutative.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use tracing::{field, Instrument};

use crate::http_client::{NbuHttpClient, RequestHeaders};

use super::model::{Envelope, Job};
use super::FetchError;

const PAGE_LIMIT: u64 = 100;
const MAX_PAGES: u64 = 1000;

/// `(action, policy_type, status)` keyed totals, plus `(action, status)`
/// status counts, accumulated across every page of one jobs fetch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JobAggregate {
    pub bytes_by_action_policy_status: HashMap<(String, String, String), f64>,
    pub count_by_action_policy_status: HashMap<(String, String, String), i64>,
    pub count_by_action_status: HashMap<(String, String), i64>,
    pub total_jobs: i64,
    pub total_pages: u64,
}

impl JobAggregate {
    fn absorb(&mut self, job: &Job) {
        let action = job.job_type.clone();
        let policy_type = job.policy_type.clone();
        let status = job.status.to_string();

        let bytes = job.kilobytes_transferred as f64 * 1024.0;
        *self
            .bytes_by_action_policy_status
            .entry((action.clone(), policy_type.clone(), status.clone()))
            .or_insert(0.0) += bytes;
        *self
            .count_by_action_policy_status
            .entry((action.clone(), policy_type, status.clone()))
            .or_insert(0) += 1;
        *self
            .count_by_action_status
            .entry((action, status))
            .or_insert(0) += 1;
        self.total_jobs += 1;
    }
}

pub async fn fetch_jobs(
    client: &NbuHttpClient,
    base_url: &str,
    api_version: &str,
    api_key: &str,
    scrape_window: Duration,
) -> Result<JobAggregate, FetchError> {
    let endpoint = format!("{}/admin/jobs", base_url.trim_end_matches('/'));
    let span = tracing::info_span!(
        "netbackup.fetch_jobs",
        "netbackup.endpoint" = %endpoint,
        "netbackup.time_window" = field::Empty,
        "netbackup.start_time" = field::Empty,
        "netbackup.total_jobs" = field::Empty,
        "netbackup.total_pages" = field::Empty,
    );
    async {
        let headers = RequestHeaders {
            api_version: api_version.to_string(),
            api_key: api_key.to_string(),
        };

        let since = SystemTime::now()
            .checked_sub(scrape_window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let since_rfc3339 = humantime::format_rfc3339_seconds(since).to_string();

        let current_span = tracing::Span::current();
        current_span.record("netbackup.time_window", humantime::format_duration(scrape_window).to_string());
        current_span.record("netbackup.start_time", since_rfc3339.as_str());

        let mut aggregate = JobAggregate::default();
        let mut offset = 0u64;

        for page_number in 0..MAX_PAGES {
            let url = format!(
                "{endpoint}?page[limit]={PAGE_LIMIT}&page[offset]={offset}&filter=endTime gt {since_rfc3339}",
            );

            let page_span = tracing::info_span!(
                "netbackup.fetch_job_page",
                "netbackup.page_offset" = offset,
                "netbackup.page_number" = page_number,
                "netbackup.jobs_in_page" = field::Empty,
            );

            let envelope: Envelope<Job> = client
                .fetch_data(&url, &headers)
                .instrument(page_span.clone())
                .await
                .map_err(|source| FetchError::Client {
                    phase: "jobs",
                    url: url.clone(),
                    source,
                })?;

            page_span.record("netbackup.jobs_in_page", envelope.data.len());
            aggregate.total_pages += 1;

            if envelope.data.is_empty() {
                break;
            }

            for resource in &envelope.data {
                aggregate.absorb(&resource.attributes);
            }

            let pagination = envelope.meta.as_ref().and_then(|m| m.pagination.as_ref());
            let has_next = envelope.links.as_ref().and_then(|l| l.next.as_ref()).is_some();
            let reached_last = pagination
                .and_then(|p| p.last)
                .map(|last| offset >= last)
                .unwrap_or(false);

            if reached_last || !has_next {
                break;
            }
            offset += PAGE_LIMIT;
        }

        current_span.record("netbackup.total_jobs", aggregate.total_jobs);
        current_span.record("netbackup.total_pages", aggregate.total_pages);

        Ok(aggregate)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{respond_json, spawn_fake_server};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn aggregates_single_page() {
        let uri = spawn_fake_server(|_req| async {
            respond_json(
                200,
                json!({
                    "data": [
                        {"attributes": {"jobId": 1, "jobType": "BACKUP", "policyType": "Standard", "status": 0, "kilobytesTransferred": 10}},
                        {"attributes": {"jobId": 2, "jobType": "BACKUP", "policyType": "Standard", "status": 0, "kilobytesTransferred": 5}},
                        {"attributes": {"jobId": 3, "jobType": "RESTORE", "policyType": "Standard", "status": 1, "kilobytesTransferred": 2}}
                    ],
                    "meta": {"pagination": {"offset": 0, "limit": 100, "last": 0}}
                }),
            )
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let agg = fetch_jobs(&client, uri.trim_end_matches('/'), "13.0", "key", Duration::from_secs(300))
            .await
            .unwrap();

        let key = ("BACKUP".to_string(), "Standard".to_string(), "0".to_string());
        assert_eq!(agg.count_by_action_policy_status[&key], 2);
        assert_eq!(agg.bytes_by_action_policy_status[&key], 15.0 * 1024.0);
        assert_eq!(agg.count_by_action_status[&("RESTORE".to_string(), "1".to_string())], 1);
    }

    #[tokio::test]
    async fn stops_when_page_is_empty() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let uri = spawn_fake_server(move |_req| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                respond_json(200, json!({"data": []}))
            }
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let agg = fetch_jobs(&client, uri.trim_end_matches('/'), "13.0", "key", Duration::from_secs(300))
            .await
            .unwrap();

        assert!(agg.count_by_action_status.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn paginates_until_last_offset_reached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let uri = spawn_fake_server(move |_req| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    respond_json(
                        200,
                        json!({
                            "data": [{"attributes": {"jobId": 1, "jobType": "BACKUP", "policyType": "Standard", "status": 0, "kilobytesTransferred": 1}}],
                            "meta": {"pagination": {"offset": 0, "limit": 100, "last": 100}},
                            "links": {"next": {"href": "ignored-next-link-reconstructed-by-offset"}}
                        }),
                    )
                } else {
                    respond_json(
                        200,
                        json!({
                            "data": [{"attributes": {"jobId": 2, "jobType": "BACKUP", "policyType": "Standard", "status": 0, "kilobytesTransferred": 1}}],
                            "meta": {"pagination": {"offset": 100, "limit": 100, "last": 100}}
                        }),
                    )
                }
            }
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let agg = fetch_jobs(&client, uri.trim_end_matches('/'), "13.0", "key", Duration::from_secs(300))
            .await
            .unwrap();

        let key = ("BACKUP".to_string(), "Standard".to_string(), "0".to_string());
        assert_eq!(agg.count_by_action_policy_status[&key], 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
