//! Runtime configuration: the YAML file shape ([`raw`]), the validated
//! immutable view every component actually reads ([`ConfigSnapshot`]), and
//! the thread-safe cell the reload coordinator swaps it through
//! ([`ConfigHolder`]).

mod holder;
pub(crate) mod raw;
mod snapshot;

use std::path::Path;

pub use holder::ConfigHolder;
pub use raw::RawConfig;
pub use snapshot::{ConfigError, ConfigSnapshot, Scheme, TracingConfig};

/// Read, parse, default, and validate the config file at `path`. Used both
/// at startup (where failure is fatal) and by the reload coordinator (where
/// failure is logged and the previous snapshot is retained).
pub fn load(path: &Path) -> Result<ConfigSnapshot, LoadError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| LoadError::Io(path.display().to_string(), source))?;
    let raw: RawConfig = serde_yaml::from_str(&contents)
        .map_err(|source| LoadError::Parse(path.display().to_string(), source))?;
    ConfigSnapshot::from_raw(raw).map_err(LoadError::Invalid)
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("could not read config file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("could not parse config file {0}: {1}")]
    Parse(String, #[source] serde_yaml::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}
