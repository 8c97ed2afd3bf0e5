//! `GET /storage/storage-units` fetch: accumulate records across whatever
//! pages the server hands back, then reduce to per-unit byte triples.

use tracing::{field, Instrument};

use crate::http_client::{ClientError, NbuHttpClient, RequestHeaders};

use super::model::{is_billable_storage, Envelope, StorageUnit};
use super::FetchError;

/// Capacity for one storage unit that made it through the tape/empty filter.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageMetric {
    pub name: String,
    pub storage_type: String,
    pub free_bytes: i64,
    pub used_bytes: i64,
    pub total_bytes: i64,
}

/// Pull every page of the storage-units collection and return the filtered,
/// flattened metric set. Result sets here are expected to be small, but the
/// pagination envelope is still honored defensively, the same as jobs.
pub async fn fetch_storage_units(
    client: &NbuHttpClient,
    base_url: &str,
    api_version: &str,
    api_key: &str,
) -> Result<Vec<StorageMetric>, FetchError> {
    let endpoint = format!("{}/storage/storage-units", base_url.trim_end_matches('/'));
    let span = tracing::info_span!(
        "netbackup.fetch_storage",
        "netbackup.endpoint" = %endpoint,
        "netbackup.storage_units" = field::Empty,
        "netbackup.api_version" = %api_version,
    );
    async {
        let headers = RequestHeaders {
            api_version: api_version.to_string(),
            api_key: api_key.to_string(),
        };

        let mut url = endpoint.clone();
        let mut units = Vec::new();

        loop {
            let envelope: Envelope<StorageUnit> = client
                .fetch_data(&url, &headers)
                .await
                .map_err(|source| classify(source, &url))?;

            let page_had_data = !envelope.data.is_empty();
            units.extend(envelope.data.into_iter().map(|r| r.attributes));

            match envelope.links.as_ref().and_then(|l| l.next.as_ref()) {
                Some(next) if page_had_data => url = next.href.clone(),
                _ => break,
            }
        }

        let metrics: Vec<StorageMetric> = units
            .into_iter()
            .filter(is_billable_storage)
            .map(|u| StorageMetric {
                name: u.name,
                storage_type: u.storage_type,
                free_bytes: u.free_bytes,
                used_bytes: u.used_bytes,
                total_bytes: u.total_bytes,
            })
            .collect();

        tracing::Span::current().record("netbackup.storage_units", metrics.len());

        Ok(metrics)
    }
    .instrument(span)
    .await
}

fn classify(source: ClientError, url: &str) -> FetchError {
    FetchError::Client {
        phase: "storage",
        url: url.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{respond_json, spawn_fake_server};
    use serde_json::json;

    #[tokio::test]
    async fn filters_tape_and_untyped_units() {
        let uri = spawn_fake_server(|_req| async {
            respond_json(
                200,
                json!({
                    "data": [
                        {"attributes": {"storageUnitName": "disk-a", "storageType": "BasicDisk", "totalCapacityBytes": 100, "usedCapacityBytes": 40, "availableCapacityBytes": 60}},
                        {"attributes": {"storageUnitName": "tape-a", "storageType": "TAPE", "totalCapacityBytes": 999, "usedCapacityBytes": 1, "availableCapacityBytes": 998}},
                        {"attributes": {"storageUnitName": "bad", "storageType": "", "totalCapacityBytes": 1, "usedCapacityBytes": 1, "availableCapacityBytes": 0}}
                    ],
                    "meta": {"pagination": {"offset": 0, "limit": 100, "last": 0}}
                }),
            )
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let metrics = fetch_storage_units(&client, uri.trim_end_matches('/'), "13.0", "key")
            .await
            .unwrap();

        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].name, "disk-a");
    }

    #[tokio::test]
    async fn follows_next_link_across_pages() {
        let uri = spawn_fake_server(move |req| async move {
            if req.uri().path_and_query().map(|p| p.as_str()) == Some("/storage/storage-units") {
                respond_json(
                    200,
                    json!({
                        "data": [{"attributes": {"storageUnitName": "a", "storageType": "BasicDisk", "totalCapacityBytes": 1, "usedCapacityBytes": 0, "availableCapacityBytes": 1}}],
                        "links": {"next": {"href": format!("http://{}/storage/storage-units?page=2", req.headers().get("host").and_then(|h| h.to_str().ok()).unwrap_or(""))}}
                    }),
                )
            } else {
                respond_json(
                    200,
                    json!({
                        "data": [{"attributes": {"storageUnitName": "b", "storageType": "BasicDisk", "totalCapacityBytes": 1, "usedCapacityBytes": 0, "availableCapacityBytes": 1}}]
                    }),
                )
            }
        })
        .await;

        let client = NbuHttpClient::new(false, false);
        let metrics = fetch_storage_units(&client, uri.trim_end_matches('/'), "13.0", "key")
            .await
            .unwrap();

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "a");
        assert_eq!(metrics[1].name, "b");
    }
}
