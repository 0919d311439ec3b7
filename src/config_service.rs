//! Config service (port 8082).
//!
//! Publishes the typed site configuration to shared state and keeps it
//! fresh: the YAML snapshot at one of the conventional paths is the
//! source of truth on site, and a 5-minute cloud poll of the site's
//! `updated_at` detects newer versions. Versioning is monotonic — a
//! stale snapshot never overrides a newer one already published.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudClient;
use crate::config::SiteConfig;
use crate::health::{self, HealthStatus, PORT_CONFIG};
use crate::state::{SharedState, KEY_CONFIG};

const FILE_POLL_INTERVAL: Duration = Duration::from_secs(10);
const CLOUD_POLL_INTERVAL: Duration = Duration::from_secs(300);

pub struct ConfigService;

impl ConfigService {
    /// Service entry point; returns on shutdown.
    pub async fn run(state: SharedState, mut shutdown: watch::Receiver<bool>) {
        let health = health::spawn_health_server("config", PORT_CONFIG, {
            let state = state.clone();
            std::sync::Arc::new(move || {
                json!({
                    "config_version": state.read(KEY_CONFIG).get("updated_at"),
                })
            })
        });

        let client = CloudClient::from_env();
        let mut published_version: Option<String> = None;
        let mut config_path: Option<PathBuf> = SiteConfig::find_path();
        let mut cloud_poll_elapsed = CLOUD_POLL_INTERVAL;

        if config_path.is_none() {
            warn!("no config file found at conventional paths");
        }

        // First successful load flips the service healthy; device,
        // control and logging block on the published document.
        loop {
            if *shutdown.borrow() {
                break;
            }

            if config_path.is_none() {
                config_path = SiteConfig::find_path();
            }

            if let Some(path) = &config_path {
                match SiteConfig::load(path) {
                    Ok(config) => {
                        let newer = match (&published_version, &config.updated_at) {
                            (None, _) => true,
                            // Unstamped snapshots republish only once.
                            (Some(current), candidate) => candidate > current,
                        };
                        if newer {
                            publish(&state, &config);
                            published_version = Some(config.updated_at.clone());
                            health.set(HealthStatus::Healthy);
                            state.set_service_health(
                                "config",
                                json!({"status": "running", "is_healthy": true}),
                            );
                            info!(
                                site = %config.id,
                                version = %config.updated_at,
                                devices = config.devices.len(),
                                "site configuration published"
                            );
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "config load failed");
                        if published_version.is_none() {
                            health.set(HealthStatus::Unhealthy);
                        }
                    }
                }
            }

            // Cloud version check: the external config mechanism
            // rewrites the file; we only detect staleness and log it.
            cloud_poll_elapsed += FILE_POLL_INTERVAL;
            if cloud_poll_elapsed >= CLOUD_POLL_INTERVAL {
                cloud_poll_elapsed = Duration::ZERO;
                if let (Some(client), Some(version)) = (&client, &published_version) {
                    check_cloud_version(client, &state, version).await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(FILE_POLL_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }

        health.set(HealthStatus::Stopped);
        health.stop_server();
        state.set_service_health("config", json!({"status": "stopped", "is_healthy": false}));
        info!("config service stopped");
    }
}

fn publish(state: &SharedState, config: &SiteConfig) {
    match serde_json::to_value(config) {
        Ok(doc) => {
            state.write(KEY_CONFIG, doc);
            state.notify_config_changed(&config.updated_at);
        }
        Err(e) => error!(error = %e, "config serialization failed"),
    }
}

async fn check_cloud_version(client: &CloudClient, state: &SharedState, published: &str) {
    let site_id = state
        .read(KEY_CONFIG)
        .get("id")
        .and_then(Value::as_str)
        .map(String::from);
    let Some(site_id) = site_id else { return };

    match client
        .get_rows(
            "sites",
            &[
                ("id", format!("eq.{site_id}")),
                ("select", "updated_at".to_string()),
            ],
        )
        .await
    {
        Ok(rows) => {
            let cloud_version = rows
                .first()
                .and_then(|r| r.get("updated_at"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if cloud_version > published {
                // The sync agent rewrites the YAML; until it lands we
                // keep serving the monotonic latest.
                info!(
                    cloud_version,
                    published, "newer site configuration available in cloud"
                );
            } else {
                debug!("site configuration up to date with cloud");
            }
        }
        Err(e) => debug!(error = %e, "cloud config version check failed"),
    }
}
