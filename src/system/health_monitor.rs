//! Fleet health monitor.
//!
//! Probes every service's `/health` endpoint over loopback every 10 s
//! with a 5 s timeout. Three failed observations in a row escalate:
//! critical services trip the supervisor's safe-mode path, non-critical
//! ones only raise an alert.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::state::{SharedState, KEY_PENDING_ALERTS, KEY_SAFE_MODE_TRIGGER};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct MonitoredService {
    pub name: &'static str,
    pub port: u16,
    pub critical: bool,
}

/// The monitored fleet. Logging is the one service whose loss must not
/// stop the site from controlling.
pub fn monitored_services() -> Vec<MonitoredService> {
    vec![
        MonitoredService { name: "config", port: crate::health::PORT_CONFIG, critical: true },
        MonitoredService { name: "device", port: crate::health::PORT_DEVICE, critical: true },
        MonitoredService { name: "control", port: crate::health::PORT_CONTROL, critical: true },
        MonitoredService { name: "logging", port: crate::health::PORT_LOGGING, critical: false },
    ]
}

pub struct HealthMonitor {
    state: SharedState,
    http: reqwest::Client,
    consecutive_failures: HashMap<&'static str, u32>,
}

impl HealthMonitor {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            http: reqwest::Client::new(),
            consecutive_failures: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let services = monitored_services();
        loop {
            if *shutdown.borrow() {
                break;
            }

            for service in &services {
                self.check(service).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn check(&mut self, service: &MonitoredService) {
        let healthy = self.probe(service.port).await;

        if healthy {
            self.consecutive_failures.insert(service.name, 0);
            return;
        }

        let failures = self
            .consecutive_failures
            .entry(service.name)
            .and_modify(|f| *f += 1)
            .or_insert(1);
        warn!(
            service = service.name,
            failures = *failures,
            "health probe failed"
        );

        if *failures < FAILURE_THRESHOLD {
            return;
        }

        if service.critical {
            // Supervisor-level escalation: solar must go conservative
            // while a critical service is down.
            self.state.write(
                KEY_SAFE_MODE_TRIGGER,
                json!({
                    "triggered": true,
                    "reason": format!("Critical service {} unhealthy", service.name),
                    "service": service.name,
                    "triggered_at": Utc::now().to_rfc3339(),
                }),
            );
        } else {
            self.push_alert(service.name, "service unhealthy");
        }
    }

    /// A probe succeeds only on HTTP 200 with `status: healthy`.
    async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        match self.http.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => {
                match response.json::<Value>().await {
                    Ok(body) => {
                        let status = body.get("status").and_then(Value::as_str);
                        debug!(port, status = status.unwrap_or("?"), "health probe");
                        status == Some("healthy")
                    }
                    Err(_) => false,
                }
            }
            _ => false,
        }
    }

    fn push_alert(&self, service: &str, message: &str) {
        let mut doc = self.state.read_fresh(KEY_PENDING_ALERTS);
        if !doc.is_object() {
            doc = json!({});
        }
        if let Some(map) = doc.as_object_mut() {
            let alerts = map.entry("alerts").or_insert_with(|| Value::Array(vec![]));
            if let Value::Array(list) = alerts {
                list.push(json!({
                    "type": "service_failure",
                    "service": service,
                    "message": message,
                    "timestamp": Utc::now().to_rfc3339(),
                }));
            }
        }
        self.state.write(KEY_PENDING_ALERTS, doc);
    }
}
