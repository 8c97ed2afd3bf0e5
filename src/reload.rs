//! Reload coordinator: SIGHUP and config-file-change events both run the
//! same reload routine — parse, validate, and only on success swap the
//! snapshot pointer. Never interrupts an in-flight scrape.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::collector::MetricsCollector;
use crate::config::{self, ConfigHolder};

/// Runs until `shutdown` resolves. Intended to be spawned as its own task
/// alongside the serving shell.
pub async fn run(
    config_path: PathBuf,
    holder: Arc<ConfigHolder>,
    collector: Arc<MetricsCollector>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(s) => s,
        Err(error) => {
            error!(%error, "failed to install SIGHUP handler; file-watch reload still active");
            // Degrade to a signal stream that never fires rather than aborting the task.
            never_fires_signal()
        }
    };

    let (file_tx, mut file_rx) = mpsc::channel(8);
    let _watcher = match spawn_file_watcher(&config_path, file_tx) {
        Ok(w) => Some(w),
        Err(error) => {
            warn!(%error, "failed to watch config file for changes; SIGHUP reload still active");
            None
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("reload triggered by SIGHUP");
                reload_once(&config_path, &holder, &collector).await;
            }
            Some(()) = file_rx.recv() => {
                info!("reload triggered by config file change");
                reload_once(&config_path, &holder, &collector).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn reload_once(config_path: &Path, holder: &ConfigHolder, collector: &MetricsCollector) {
    let old = holder.current();

    let new_snapshot = match config::load(config_path) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            error!(%error, path = %config_path.display(), "config reload failed validation, retaining previous snapshot");
            return;
        }
    };

    let host_changed = old.nbu_host() != new_snapshot.nbu_host();
    let port_changed = old.nbu_port() != new_snapshot.nbu_port();

    holder.swap(new_snapshot);
    info!("config reloaded successfully");

    if host_changed || port_changed {
        info!("NetBackup host/port changed, flushing storage cache");
        collector.flush_storage_cache().await;
    }
}

fn spawn_file_watcher(
    config_path: &Path,
    tx: mpsc::Sender<()>,
) -> notify::Result<RecommendedWatcher> {
    let watch_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = config_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let Ok(event) = res else { return };
        let is_relevant = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        ) && event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str()));

        if is_relevant {
            let _ = tx.try_send(());
        }
    })?;

    watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

fn never_fires_signal() -> tokio::signal::unix::Signal {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        .expect("SIGUSR1 handler install should not itself fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::raw::{RawConfig, RawNbuServer, RawServer, RawTracing};
    use crate::config::ConfigSnapshot;
    use crate::http_client::NbuHttpClient;

    fn write_config(path: &Path, host: &str) {
        std::fs::write(
            path,
            format!(
                r#"
server:
  host: "0.0.0.0"
  port: 9106
  scrapingInterval: "30s"
nbuserver:
  scheme: "https"
  host: "{host}"
  port: 1556
  uri: "/netbackup"
  apiKey: "abcd1234efgh5678"
opentelemetry:
  enabled: false
"#
            ),
        )
        .unwrap();
    }

    fn snapshot(host: &str) -> ConfigSnapshot {
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
                scheme: "https".to_string(),
                host: host.to_string(),
                port: 1556,
                uri: "/netbackup".to_string(),
                api_key: "abcd1234efgh5678".to_string(),
                api_version: None,
                insecure_skip_verify: false,
            },
            opentelemetry: RawTracing::default(),
            cache_ttl: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn reload_swaps_snapshot_on_valid_file_and_flushes_cache_on_host_change() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("nbu_exporter_reload_test_{}.yaml", std::process::id()));
        write_config(&path, "a.example.com");

        let holder = Arc::new(ConfigHolder::new(snapshot("a.example.com")));
        let client = Arc::new(NbuHttpClient::new(false, false));
        let collector = Arc::new(MetricsCollector::new(holder.clone(), client));

        write_config(&path, "b.example.com");
        reload_once(&path, &holder, &collector).await;

        assert_eq!(holder.current().nbu_host(), "b.example.com");

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn reload_retains_old_snapshot_on_invalid_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("nbu_exporter_reload_bad_{}.yaml", std::process::id()));
        write_config(&path, "a.example.com");

        let holder = Arc::new(ConfigHolder::new(snapshot("a.example.com")));
        let client = Arc::new(NbuHttpClient::new(false, false));
        let collector = Arc::new(MetricsCollector::new(holder.clone(), client));

        std::fs::write(&path, "not: [valid yaml for this schema").ok();
        reload_once(&path, &holder, &collector).await;

        assert_eq!(holder.current().nbu_host(), "a.example.com");

        std::fs::remove_file(&path).ok();
    }
}
