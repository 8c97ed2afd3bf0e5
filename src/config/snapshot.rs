use std::time::Duration;

use thiserror::Error;

use super::raw::RawConfig;

pub const SUPPORTED_API_VERSIONS: [&str; 3] = ["3.0", "12.0", "13.0"];
pub const DEFAULT_API_VERSION: &str = "13.0";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("{field} port {port} is outside the valid range 1-65535")]
    PortOutOfRange { field: &'static str, port: u32 },
    #[error("{field} duration {value:?} could not be parsed: {reason}")]
    BadDuration {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("nbuserver.scheme must be \"http\" or \"https\", got {0:?}")]
    BadScheme(String),
    #[error(
        "nbuserver.apiVersion {0:?} is not supported; supported versions are {:?}",
        SUPPORTED_API_VERSIONS
    )]
    UnsupportedApiVersion(String),
    #[error("opentelemetry.endpoint {0:?} is not a valid host:port pair")]
    BadOtlpEndpoint(String),
    #[error("opentelemetry.samplingRate {0} is outside the valid range [0, 1]")]
    SamplingRateOutOfRange(f64),
    #[error("nbuserver fields do not form a valid base URL ({scheme}://{host}:{port}{uri}): {reason}")]
    BadNbuUrl {
        scheme: &'static str,
        host: String,
        port: u16,
        uri: String,
        reason: String,
    },
}

/// NBU base URL scheme. Only `http` and `https` are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(ConfigError::BadScheme(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub insecure: bool,
    pub sampling_rate: f64,
}

/// An immutable, validated view of the exporter's runtime configuration.
///
/// `Validate()` (via [`ConfigSnapshot::from_raw`]) must succeed before a
/// snapshot can exist at all, so every other component can treat any
/// `ConfigSnapshot` it receives as already-sound.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    server_host: String,
    server_port: u16,
    metrics_path: String,
    scrape_window: Duration,
    log_name: Option<String>,
    log_level: String,

    nbu_scheme: Scheme,
    nbu_host: String,
    nbu_port: u16,
    nbu_uri: String,
    api_key: String,
    api_version: Option<String>,
    tls_skip_verify: bool,

    tracing: TracingConfig,
    cache_ttl: Duration,
}

impl ConfigSnapshot {
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.server.host.is_empty() {
            return Err(ConfigError::EmptyField { field: "server.host" });
        }
        if raw.nbuserver.host.is_empty() {
            return Err(ConfigError::EmptyField {
                field: "nbuserver.host",
            });
        }
        if raw.nbuserver.api_key.is_empty() {
            return Err(ConfigError::EmptyField {
                field: "nbuserver.apiKey",
            });
        }
        check_port("server.port", raw.server.port)?;
        check_port("nbuserver.port", raw.nbuserver.port)?;

        let scrape_window = parse_duration("server.scrapingInterval", &raw.server.scraping_interval)?;

        let nbu_scheme = Scheme::parse(&raw.nbuserver.scheme)?;

        let candidate_url = format!(
            "{}://{}:{}{}",
            nbu_scheme.as_str(),
            raw.nbuserver.host,
            raw.nbuserver.port,
            raw.nbuserver.uri
        );
        url::Url::parse(&candidate_url).map_err(|source| ConfigError::BadNbuUrl {
            scheme: nbu_scheme.as_str(),
            host: raw.nbuserver.host.clone(),
            port: raw.nbuserver.port,
            uri: raw.nbuserver.uri.clone(),
            reason: source.to_string(),
        })?;

        let api_version = match raw.nbuserver.api_version {
            Some(v) if v.is_empty() => None,
            Some(v) => {
                if !SUPPORTED_API_VERSIONS.contains(&v.as_str()) {
                    return Err(ConfigError::UnsupportedApiVersion(v));
                }
                Some(v)
            }
            None => None,
        };

        let tracing = validate_tracing(raw.opentelemetry)?;

        let cache_ttl = match raw.cache_ttl {
            Some(s) if !s.is_empty() => parse_duration("cacheTTL", &s)?,
            _ => DEFAULT_CACHE_TTL,
        };

        Ok(Self {
            server_host: raw.server.host,
            server_port: raw.server.port,
            metrics_path: raw.server.uri,
            scrape_window,
            log_name: raw.server.log_name,
            log_level: raw
                .server
                .log_level
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| "info".to_string()),
            nbu_scheme,
            nbu_host: raw.nbuserver.host,
            nbu_port: raw.nbuserver.port,
            nbu_uri: raw.nbuserver.uri,
            api_key: raw.nbuserver.api_key,
            api_version,
            tls_skip_verify: raw.nbuserver.insecure_skip_verify,
            tracing,
            cache_ttl,
        })
    }

    /// Build a new snapshot with `api_version` filled in from a completed
    /// version detection. Never mutates `self`; this is the only sanctioned
    /// way for a detected version to enter a snapshot.
    pub fn with_detected_api_version(&self, version: &str) -> Self {
        let mut next = self.clone();
        next.api_version = Some(version.to_string());
        next
    }

    pub fn server_addr(&self) -> (String, u16) {
        (self.server_host.clone(), self.server_port)
    }

    pub fn metrics_path(&self) -> &str {
        &self.metrics_path
    }

    pub fn scrape_window(&self) -> Duration {
        self.scrape_window
    }

    pub fn log_name(&self) -> Option<&str> {
        self.log_name.as_deref()
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn nbu_base_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.nbu_scheme.as_str(),
            self.nbu_host,
            self.nbu_port,
            self.nbu_uri
        )
    }

    pub fn nbu_scheme(&self) -> Scheme {
        self.nbu_scheme
    }

    pub fn nbu_host(&self) -> &str {
        &self.nbu_host
    }

    pub fn nbu_port(&self) -> u16 {
        self.nbu_port
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Masked for logs: first 4 + `****` + last 4; all `****` if too short.
    pub fn masked_api_key(&self) -> String {
        mask_key(&self.api_key)
    }

    pub fn api_version(&self) -> Option<&str> {
        self.api_version.as_deref()
    }

    pub fn api_version_or_default(&self) -> &str {
        self.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION)
    }

    pub fn tls_skip_verify(&self) -> bool {
        self.tls_skip_verify
    }

    pub fn tracing(&self) -> &TracingConfig {
        &self.tracing
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        "****".to_string()
    } else {
        let prefix: String = chars[..4].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{prefix}****{suffix}")
    }
}

fn check_port(field: &'static str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::PortOutOfRange {
            field,
            port: port as u32,
        });
    }
    Ok(())
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::BadDuration {
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn validate_tracing(raw: super::raw::RawTracing) -> Result<TracingConfig, ConfigError> {
    let sampling_rate = raw.sampling_rate.unwrap_or(0.0);
    if !(0.0..=1.0).contains(&sampling_rate) {
        return Err(ConfigError::SamplingRateOutOfRange(sampling_rate));
    }

    if raw.enabled {
        let endpoint = raw
            .endpoint
            .as_deref()
            .ok_or(ConfigError::BadOtlpEndpoint(String::new()))?;
        if endpoint.rsplit_once(':').map_or(true, |(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(ConfigError::BadOtlpEndpoint(endpoint.to_string()));
        }
    }

    Ok(TracingConfig {
        enabled: raw.enabled,
        endpoint: raw.endpoint,
        insecure: raw.insecure,
        sampling_rate,
    })
}
