//! Typed NetBackup REST fetchers: storage-unit inventory and the paginated
//! jobs feed, plus the aggregation that turns a job list into label→value
//! maps.

mod jobs;
mod model;
mod storage;

use thiserror::Error;

pub use jobs::{fetch_jobs, JobAggregate};
pub use model::{Job, StorageUnit};
pub use storage::{fetch_storage_units, StorageMetric};

use crate::http_client::ClientError;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("{phase} fetch against {url} failed: {source}")]
    Client {
        phase: &'static str,
        url: String,
        #[source]
        source: ClientError,
    },
}
