//! The as-deserialized shape of the YAML config file, before any validation
//! or defaulting has run. Never handed directly to a component: everything
//! downstream reads a [`super::ConfigSnapshot`] instead.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub server: RawServer,
    pub nbuserver: RawNbuServer,
    #[serde(default)]
    pub opentelemetry: RawTracing,
    #[serde(rename = "cacheTTL")]
    pub cache_ttl: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawServer {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub uri: String,
    #[serde(rename = "scrapingInterval")]
    pub scraping_interval: String,
    #[serde(rename = "logName", default)]
    pub log_name: Option<String>,
    #[serde(rename = "logLevel", default)]
    pub log_level: Option<String>,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RawNbuServer {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub uri: String,
    #[serde(rename = "apiKey")]
    pub api_key: String,
    #[serde(rename = "apiVersion", default)]
    pub api_version: Option<String>,
    #[serde(rename = "insecureSkipVerify", default)]
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct RawTracing {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(rename = "samplingRate", default)]
    pub sampling_rate: Option<f64>,
}
