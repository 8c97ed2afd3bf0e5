//! Typed shapes for the NetBackup JSON:API-style response envelope and the
//! record types carried inside it. Newer API versions add fields; we accept
//! and ignore anything the core metrics don't need (`#[serde(default)]`
//! throughout, no `deny_unknown_fields`).

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub data: Vec<Resource<T>>,
    #[serde(default)]
    pub meta: Option<Meta>,
    #[serde(default)]
    pub links: Option<Links>,
}

#[derive(Debug, Deserialize)]
pub struct Resource<T> {
    pub attributes: T,
}

#[derive(Debug, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub limit: u64,
    #[serde(default)]
    pub last: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: Option<NextLink>,
}

#[derive(Debug, Deserialize)]
pub struct NextLink {
    pub href: String,
}

/// A single storage unit, as returned by `GET /storage/storage-units`.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageUnit {
    #[serde(rename = "storageUnitName", default)]
    pub name: String,
    #[serde(rename = "storageType", default)]
    pub storage_type: String,
    #[serde(rename = "storageSubType", default)]
    pub storage_subtype: Option<String>,
    #[serde(rename = "storageServerType", default)]
    pub storage_server_type: Option<String>,
    #[serde(rename = "totalCapacityBytes", default)]
    pub total_bytes: i64,
    #[serde(rename = "usedCapacityBytes", default)]
    pub used_bytes: i64,
    #[serde(rename = "availableCapacityBytes", default)]
    pub free_bytes: i64,
    #[serde(rename = "replicationCapable", default)]
    pub replication_capable: Option<bool>,
    #[serde(rename = "wormCapable", default)]
    pub worm_capable: Option<bool>,
}

/// A single job, as returned by `GET /admin/jobs`. Version-dependent fields
/// beyond these are accepted by `serde`'s default "ignore unknown fields"
/// behavior and simply never deserialized.
#[derive(Debug, Deserialize, Clone)]
pub struct Job {
    #[serde(rename = "jobId", default)]
    pub job_id: i64,
    #[serde(rename = "parentJobid", default)]
    pub parent_id: i64,
    #[serde(rename = "jobType", default)]
    pub job_type: String,
    #[serde(rename = "jobSubType", default)]
    pub job_subtype: Option<String>,
    #[serde(rename = "policyType", default)]
    pub policy_type: String,
    #[serde(rename = "policyName", default)]
    pub policy_name: Option<String>,
    #[serde(rename = "clientName", default)]
    pub client_name: Option<String>,
    #[serde(rename = "controlHost", default)]
    pub control_host: Option<String>,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(rename = "kilobytesTransferred", default)]
    pub kilobytes_transferred: i64,
    #[serde(rename = "startTime", default)]
    pub start_time: Option<String>,
    #[serde(rename = "endTime", default)]
    pub end_time: Option<String>,
    #[serde(rename = "lastUpdateTime", default)]
    pub last_update_time: Option<String>,
}

/// Only units with a non-empty, non-`"TAPE"` storage type contribute to
/// metrics.
pub fn is_billable_storage(unit: &StorageUnit) -> bool {
    !unit.storage_type.is_empty() && unit.storage_type != "TAPE"
}
