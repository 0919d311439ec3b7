//! Cloud heartbeat.
//!
//! Every 30 s, POST a document with controller identity, system metrics,
//! per-service statuses, live aggregated readings, and the active-alarm
//! count. Failures back off {1, 2, 4, 8, 16} s; five consecutive
//! failures log critically but never kill the service — the site must
//! keep controlling with or without the cloud.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::cloud::CloudClient;
use crate::config::ControllerIdentity;
use crate::state::{SharedState, KEY_ACTIVE_ALARMS, KEY_CONFIG, KEY_READINGS, KEY_SERVICE_HEALTH};
use crate::system::metrics::MetricsCollector;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

pub struct HeartbeatSender {
    identity: ControllerIdentity,
    client: Option<CloudClient>,
    state: SharedState,
    metrics: MetricsCollector,
    consecutive_failures: u32,
}

impl HeartbeatSender {
    pub fn new(identity: ControllerIdentity, client: Option<CloudClient>, state: SharedState) -> Self {
        Self {
            identity,
            client,
            state,
            metrics: MetricsCollector::new(),
            consecutive_failures: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.beat().await;

            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }

        // Final heartbeat on the way out, best effort.
        self.beat().await;
    }

    pub async fn beat(&mut self) {
        let payload = self.build_payload();

        // Metrics also feed local alarm evaluation (heartbeat sources).
        self.state
            .write("heartbeat_metrics", payload["metrics"].clone());

        let Some(client) = &self.client else {
            debug!("no cloud client, heartbeat kept local");
            return;
        };

        for (attempt, delay) in RETRY_BACKOFF
            .iter()
            .map(Some)
            .chain(std::iter::once(None))
            .enumerate()
        {
            match client.post_row("controller_heartbeats", &payload).await {
                Ok(()) => {
                    self.consecutive_failures = 0;
                    debug!("heartbeat sent");
                    return;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "heartbeat attempt failed");
                }
            }
            if let Some(delay) = delay {
                tokio::time::sleep(*delay).await;
            }
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                failures = self.consecutive_failures,
                "heartbeat failing persistently"
            );
        }
    }

    fn build_payload(&mut self) -> Value {
        let metrics = self.metrics.collect();
        let config = self.state.read(KEY_CONFIG);
        let readings = self.state.read(KEY_READINGS);
        let service_health = self.state.read(KEY_SERVICE_HEALTH);

        // Evaluated fleet alarm state published by the logging service —
        // not the supervisor's service-failure alert queue.
        let active_alarms = self
            .state
            .read(KEY_ACTIVE_ALARMS)
            .get("count")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        json!({
            "controller_id": self.identity.controller_id,
            "site_id": config.get("id"),
            "firmware_version": self.identity.firmware_version,
            "config_version": config.get("updated_at"),
            "timestamp": Utc::now().to_rfc3339(),
            "metrics": metrics.to_value(),
            "services": service_health,
            "readings": {
                "total_solar_kw": readings.get("total_solar_kw"),
                "total_load_kw": readings.get("total_load_kw"),
                "total_dg_kw": readings.get("total_dg_kw"),
            },
            "active_alarm_count": active_alarms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerIdentity;

    #[test]
    fn payload_carries_the_evaluated_alarm_count() {
        let state = SharedState::new();
        state.write(
            KEY_ACTIVE_ALARMS,
            json!({ "count": 3, "threshold_active": 2, "register_failures": 1 }),
        );
        state.write(KEY_READINGS, json!({ "total_solar_kw": 42.0 }));

        let identity = ControllerIdentity {
            controller_id: "ctl-test".into(),
            firmware_version: "0.0.0".into(),
            hardware_type: "test".into(),
        };
        let mut sender = HeartbeatSender::new(identity, None, state);

        let payload = sender.build_payload();
        assert_eq!(payload["active_alarm_count"], 3);
        assert_eq!(payload["readings"]["total_solar_kw"], 42.0);
        assert_eq!(payload["controller_id"], "ctl-test");
    }

    #[test]
    fn missing_alarm_document_reads_as_zero() {
        let state = SharedState::new();
        let identity = ControllerIdentity {
            controller_id: "ctl-test".into(),
            firmware_version: "0.0.0".into(),
            hardware_type: "test".into(),
        };
        let mut sender = HeartbeatSender::new(identity, None, state);
        assert_eq!(sender.build_payload()["active_alarm_count"], 0);
    }
}
