//! Crate-wide error taxonomy.
//!
//! Each component keeps its own narrow error enum (`config::ConfigError`,
//! `http_client::ClientError`, `version::DetectError`, `netbackup::FetchError`)
//! so call sites can match exhaustively on the variants that are actually
//! reachable from that layer. `ExporterError` is the top-level union, used
//! only where a single error type is actually needed (the CLI exit path and
//! the `/health` probe).

use thiserror::Error;

use crate::config::ConfigError;
use crate::http_client::ClientError;
use crate::netbackup::FetchError;
use crate::version::DetectError;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Detect(#[from] DetectError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("server error: {0}")]
    Server(String),
}
