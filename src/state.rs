//! Shared state store.
//!
//! Process-wide mapping from string key to JSON document — the only
//! channel between services. By convention each key has exactly one
//! writer (device writes `readings`, control writes `control_state`, …);
//! readers tolerate staleness up to the read-cache TTL and can bypass the
//! cache when they need freshness.
//!
//! Earlier firmware generations kept these documents as files on disk
//! with flock; in a single process the same contract is served by an
//! in-memory map behind a lock, which also makes writes trivially atomic
//! with respect to readers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Read-side cache TTL.
const CACHE_TTL: Duration = Duration::from_millis(100);

// Well-known keys.
pub const KEY_CONFIG: &str = "config";
pub const KEY_CONFIG_STATUS: &str = "config_status";
pub const KEY_READINGS: &str = "readings";
pub const KEY_CONTROL_STATE: &str = "control_state";
pub const KEY_SERVICE_HEALTH: &str = "service_health";
pub const KEY_SAFE_MODE_STATE: &str = "safe_mode_state";
pub const KEY_SAFE_MODE_TRIGGER: &str = "safe_mode_trigger";
pub const KEY_SAFE_MODE_OVERRIDE: &str = "safe_mode_override";
pub const KEY_WRITE_COMMANDS: &str = "write_commands";
pub const KEY_OTA_STATUS: &str = "ota_status";
pub const KEY_PENDING_ALERTS: &str = "pending_alerts";
pub const KEY_ACTIVE_ALARMS: &str = "active_alarms";
pub const KEY_REBOOT_PENDING: &str = "reboot_pending";
pub const KEY_REGISTER_ERRORS: &str = "register_errors";
pub const KEY_DEVICE_OFFLINE_TIMES: &str = "device_offline_times";

#[derive(Debug, Clone)]
struct Document {
    value: Value,
    written_at: Instant,
    written_at_utc: DateTime<Utc>,
}

/// Cloneable handle onto the process-wide store. Every clone shares the
/// documents; the read cache is shared too (one cache per process is what
/// the TTL contract describes).
#[derive(Clone)]
pub struct SharedState {
    docs: Arc<RwLock<HashMap<String, Document>>>,
    cache: Arc<Mutex<HashMap<String, (Value, Instant)>>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            docs: Arc::new(RwLock::new(HashMap::new())),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Write a document. Atomic from the reader's perspective: a reader
    /// sees either the previous document or the new one, never a torn mix.
    pub fn write(&self, key: &str, value: Value) {
        let doc = Document {
            value: value.clone(),
            written_at: Instant::now(),
            written_at_utc: Utc::now(),
        };
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(key.to_string(), doc);
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), (value, Instant::now()));
        }
    }

    /// Read a document, serving from the short-TTL cache when fresh.
    /// Missing keys return an empty JSON object, matching how services
    /// treat an absent document.
    pub fn read(&self, key: &str) -> Value {
        if let Ok(cache) = self.cache.lock() {
            if let Some((value, at)) = cache.get(key) {
                if at.elapsed() < CACHE_TTL {
                    return value.clone();
                }
            }
        }
        self.read_fresh(key)
    }

    /// Read bypassing the cache.
    pub fn read_fresh(&self, key: &str) -> Value {
        let value = self
            .docs
            .read()
            .ok()
            .and_then(|docs| docs.get(key).map(|d| d.value.clone()))
            .unwrap_or_else(|| Value::Object(Default::default()));

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key.to_string(), (value.clone(), Instant::now()));
        }
        value
    }

    /// Read-merge-write: shallow-merges `patch` over the current document.
    pub fn update(&self, key: &str, patch: Value) -> Value {
        let mut current = self.read_fresh(key);
        if let (Value::Object(cur), Value::Object(upd)) = (&mut current, patch) {
            for (k, v) in upd {
                cur.insert(k, v);
            }
        }
        self.write(key, current.clone());
        current
    }

    pub fn delete(&self, key: &str) -> bool {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(key);
        }
        self.docs
            .write()
            .map(|mut docs| docs.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.docs
            .read()
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Seconds since the key was last written, or `None` if absent.
    pub fn age(&self, key: &str) -> Option<f64> {
        self.docs
            .read()
            .ok()
            .and_then(|docs| docs.get(key).map(|d| d.written_at.elapsed().as_secs_f64()))
    }

    /// Wall-clock timestamp of the last write, for documents whose age
    /// must survive serialization (heartbeats).
    pub fn written_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.docs
            .read()
            .ok()
            .and_then(|docs| docs.get(key).map(|d| d.written_at_utc))
    }

    // ─── Typed conveniences over the well-known keys ────────────────────────

    pub fn set_service_health(&self, service: &str, status: Value) {
        let mut health = self.read_fresh(KEY_SERVICE_HEALTH);
        if !health.is_object() {
            health = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut health {
            let mut status = status;
            if let Value::Object(s) = &mut status {
                s.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
            }
            map.insert(service.to_string(), status);
        }
        self.write(KEY_SERVICE_HEALTH, health);
    }

    /// Record that a device went offline (used by safe-mode timeouts).
    /// Only the first transition is stamped; recovery removes the entry.
    pub fn mark_device_offline(&self, device_id: &str) {
        let mut times = self.read_fresh(KEY_DEVICE_OFFLINE_TIMES);
        if !times.is_object() {
            times = Value::Object(Default::default());
        }
        if let Value::Object(map) = &mut times {
            map.entry(device_id.to_string())
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
        }
        self.write(KEY_DEVICE_OFFLINE_TIMES, times);
    }

    pub fn mark_device_online(&self, device_id: &str) {
        let mut times = self.read_fresh(KEY_DEVICE_OFFLINE_TIMES);
        if let Value::Object(map) = &mut times {
            if map.remove(device_id).is_some() {
                self.write(KEY_DEVICE_OFFLINE_TIMES, times);
            }
        }
    }

    /// How long a device has been offline, from the stamped transition.
    pub fn device_offline_seconds(&self, device_id: &str) -> Option<f64> {
        let times = self.read(KEY_DEVICE_OFFLINE_TIMES);
        let since = times.get(device_id)?.as_str()?;
        let since: DateTime<Utc> = since.parse().ok()?;
        Some((Utc::now() - since).num_milliseconds() as f64 / 1000.0)
    }

    /// Publish a new config version and reset acknowledgements.
    pub fn notify_config_changed(&self, version: &str) {
        self.write(
            KEY_CONFIG_STATUS,
            serde_json::json!({
                "config_changed": true,
                "version": version,
                "changed_at": Utc::now().to_rfc3339(),
                "acknowledged_by": [],
            }),
        );
    }

    pub fn is_config_changed(&self) -> bool {
        self.read_fresh(KEY_CONFIG_STATUS)
            .get("config_changed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Acknowledge a config change; clears the flag once device, control
    /// and logging have all acknowledged.
    pub fn acknowledge_config_change(&self, service: &str) {
        let mut status = self.read_fresh(KEY_CONFIG_STATUS);
        if !status.is_object() {
            return;
        }

        let mut acks: Vec<String> = status
            .get("acknowledged_by")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        if !acks.iter().any(|a| a == service) {
            acks.push(service.to_string());
        }

        let required = ["device", "control", "logging"];
        let all_acked = required.iter().all(|r| acks.iter().any(|a| a == r));

        if let Value::Object(map) = &mut status {
            if all_acked {
                map.insert("config_changed".into(), Value::Bool(false));
                map.insert("acknowledged_by".into(), Value::Array(vec![]));
                map.insert(
                    "acknowledged_at".into(),
                    Value::String(Utc::now().to_rfc3339()),
                );
            } else {
                map.insert(
                    "acknowledged_by".into(),
                    Value::Array(acks.into_iter().map(Value::String).collect()),
                );
            }
        }
        self.write(KEY_CONFIG_STATUS, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_of_missing_key_is_empty_object() {
        let state = SharedState::new();
        assert_eq!(state.read("nope"), json!({}));
        assert!(state.age("nope").is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let state = SharedState::new();
        state.write("control_state", json!({"solar_limit_pct": 50.0}));
        assert_eq!(
            state.read_fresh("control_state")["solar_limit_pct"],
            json!(50.0)
        );
        assert!(state.age("control_state").unwrap() < 1.0);
    }

    #[test]
    fn update_merges_shallowly() {
        let state = SharedState::new();
        state.write("doc", json!({"a": 1, "b": 2}));
        state.update("doc", json!({"b": 3, "c": 4}));
        let doc = state.read_fresh("doc");
        assert_eq!(doc, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn delete_removes_key() {
        let state = SharedState::new();
        state.write("tmp", json!({"x": 1}));
        assert!(state.delete("tmp"));
        assert!(!state.delete("tmp"));
        assert_eq!(state.read_fresh("tmp"), json!({}));
    }

    #[test]
    fn clones_share_documents() {
        let a = SharedState::new();
        let b = a.clone();
        a.write("shared", json!({"v": 7}));
        assert_eq!(b.read_fresh("shared")["v"], json!(7));
    }

    #[test]
    fn config_acknowledgement_clears_after_all_services() {
        let state = SharedState::new();
        state.notify_config_changed("2024-01-15T00:00:00Z");
        assert!(state.is_config_changed());

        state.acknowledge_config_change("device");
        state.acknowledge_config_change("control");
        assert!(state.is_config_changed());
        state.acknowledge_config_change("logging");
        assert!(!state.is_config_changed());
    }

    #[test]
    fn offline_stamp_is_not_overwritten() {
        let state = SharedState::new();
        state.mark_device_offline("dev-1");
        let first = state.read_fresh(KEY_DEVICE_OFFLINE_TIMES)["dev-1"].clone();
        state.mark_device_offline("dev-1");
        assert_eq!(state.read_fresh(KEY_DEVICE_OFFLINE_TIMES)["dev-1"], first);
        state.mark_device_online("dev-1");
        assert!(state.device_offline_seconds("dev-1").is_none());
    }
}
