//! Register reader.
//!
//! Polls each due register of a device per tick. Transport errors are
//! retried twice with a 500 ms gap and then cascade: the rest of the
//! device's registers are skipped for the cycle and a single summary is
//! logged instead of one error per register. Exception-code and
//! address-validation errors are register-specific — no retry, no
//! cascade. Registers failing 20 times in a row are reported upward for
//! alarm generation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, RegisterConfig, RegisterKind};
use crate::device::manager::DeviceManager;
use crate::errors::ControllerError;
use crate::modbus::codec;
use crate::modbus::pool::{ConnectionPool, SharedClient};
use crate::state::{SharedState, KEY_REGISTER_ERRORS};

const MAX_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Consecutive failures before a register is reported for alarming
/// (about 20 s for a 1 s register).
const FAILURE_ALARM_THRESHOLD: u32 = 20;

#[derive(Debug, Default, Clone)]
struct PollState {
    last_polled: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_error: String,
}

pub struct RegisterReader {
    pool: ConnectionPool,
    manager: DeviceManager,
    poll_states: Arc<Mutex<HashMap<String, PollState>>>,
}

impl RegisterReader {
    pub fn new(pool: ConnectionPool, manager: DeviceManager) -> Self {
        Self {
            pool,
            manager,
            poll_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reset poll bookkeeping for a (re)loaded device set. Old keys are
    /// dropped so renamed registers start clean.
    pub fn start_polling(&self, devices: &[DeviceConfig]) {
        let mut states = self.poll_states.lock().unwrap_or_else(|e| e.into_inner());
        states.clear();
        for device in devices {
            for register in &device.registers {
                states.insert(poll_key(&device.id, &register.name), PollState::default());
            }
        }
        info!(registers = states.len(), "initialized register polling");
    }

    /// Poll every due register of one device. Serial devices hold the
    /// port's bus mutex across each register transaction.
    pub async fn poll_device(&self, device: &DeviceConfig, state: &SharedState) {
        if !self.manager.should_poll(&device.id) {
            return;
        }

        let (client, bus) = self.pool.get(&device.transport).await;
        let now = Utc::now();

        let mut connection_failed = false;
        let mut failed_count: u32 = 0;

        for register in &device.registers {
            if register.kind == RegisterKind::Virtual {
                continue;
            }

            let key = poll_key(&device.id, &register.name);
            {
                let states = self.poll_states.lock().unwrap_or_else(|e| e.into_inner());
                let Some(poll) = states.get(&key) else { continue };
                if let Some(last) = poll.last_polled {
                    let elapsed_ms = (now - last).num_milliseconds();
                    if elapsed_ms >= 0 && (elapsed_ms as u64) < register.poll_interval_ms {
                        continue;
                    }
                }
            }

            // Once the device is unreachable this cycle, stop issuing I/O
            // against it — count the skips and move on.
            if connection_failed {
                let mut states = self.poll_states.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(poll) = states.get_mut(&key) {
                    poll.last_polled = Some(now);
                    poll.consecutive_failures += 1;
                    poll.last_error = "device not reachable (cascade)".into();
                }
                failed_count += 1;
                continue;
            }

            let outcome = if let Some(bus) = &bus {
                let _bus = bus.lock().await;
                self.read_with_retry(&client, device, register).await
            } else {
                self.read_with_retry(&client, device, register).await
            };

            let mut states = self.poll_states.lock().unwrap_or_else(|e| e.into_inner());
            let Some(poll) = states.get_mut(&key) else { continue };
            poll.last_polled = Some(now);

            match outcome {
                Ok(value) => {
                    poll.consecutive_failures = 0;
                    poll.last_error.clear();
                    drop(states);
                    self.manager
                        .update_reading(&device.id, &register.name, value, &register.unit);
                }
                Err((error, is_transport)) => {
                    poll.consecutive_failures += 1;
                    poll.last_error = error.clone();
                    failed_count += 1;
                    drop(states);
                    self.manager
                        .reading_failed(&device.id, &register.name, &error);
                    if is_transport {
                        connection_failed = true;
                    }
                }
            }
        }

        if connection_failed {
            if failed_count > 1 {
                warn!(
                    device = %device.name,
                    skipped = failed_count - 1,
                    "device not reachable, skipped remaining registers"
                );
            }
            // One status update for the whole device rather than
            // per-register backoff escalation.
            self.manager
                .update_status(&device.id, false, Some("device not reachable"));

            // Serial locks never self-heal; evict so the next poll dials
            // fresh.
            if let crate::config::Transport::RtuDirect { serial_port, .. } = &device.transport {
                self.pool.reconnect_serial(serial_port).await;
            }
        } else if failed_count > 0 {
            info!(
                device = %device.name,
                failed = failed_count,
                "register-specific errors, device still reachable"
            );
        }

        self.report_persistent_failures(device, state);
    }

    /// Read one register with the retry policy applied. Returns the
    /// decoded+scaled value, or `(message, is_transport)` on failure.
    async fn read_with_retry(
        &self,
        client: &SharedClient,
        device: &DeviceConfig,
        register: &RegisterConfig,
    ) -> std::result::Result<codec::DecodedValue, (String, bool)> {
        let count = register.datatype.word_count(register.size);
        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            let result = {
                let mut client = client.lock().await;
                client
                    .read_registers(register.kind, register.address, count, device.slave_id)
                    .await
            };

            match result {
                Ok(words) => {
                    let Some(value) = codec::decode_register(&words, register) else {
                        // NaN/Inf or short response: treated like a
                        // register-specific failure, no retry.
                        return Err(("no decodable value".into(), false));
                    };
                    if let Some(n) = value.as_number() {
                        if !register.in_valid_range(n) {
                            return Err((format!("value {n} outside valid range"), false));
                        }
                    }
                    return Ok(value);
                }
                Err(e @ ControllerError::Register { .. }) => {
                    // Device answered with an exception — the register is
                    // wrong, not the transport. Never retried.
                    warn!(
                        device = %device.name,
                        register = %register.name,
                        error = %e,
                        "register read rejected"
                    );
                    return Err((e.to_string(), false));
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < MAX_RETRIES {
                        debug!(
                            device = %device.name,
                            register = %register.name,
                            attempt = attempt + 1,
                            "read failed, retrying"
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        Err((last_error, true))
    }

    /// Push registers over the failure threshold into shared state for
    /// the logging service to alarm on; clear the entry once healthy.
    fn report_persistent_failures(&self, device: &DeviceConfig, state: &SharedState) {
        let states = self.poll_states.lock().unwrap_or_else(|e| e.into_inner());
        let persistent: Vec<serde_json::Value> = device
            .registers
            .iter()
            .filter_map(|register| {
                let poll = states.get(&poll_key(&device.id, &register.name))?;
                (poll.consecutive_failures >= FAILURE_ALARM_THRESHOLD).then(|| {
                    json!({
                        "name": register.name,
                        "failures": poll.consecutive_failures,
                        "last_error": poll.last_error,
                    })
                })
            })
            .collect();
        drop(states);

        let mut doc = state.read_fresh(KEY_REGISTER_ERRORS);
        if !doc.is_object() {
            doc = json!({});
        }
        if let serde_json::Value::Object(map) = &mut doc {
            if persistent.is_empty() {
                if map.remove(&device.id).is_none() {
                    return;
                }
            } else {
                map.insert(
                    device.id.clone(),
                    json!({
                        "device_name": device.name,
                        "registers": persistent,
                    }),
                );
            }
        }
        state.write(KEY_REGISTER_ERRORS, doc);
    }
}

fn poll_key(device_id: &str, register_name: &str) -> String {
    format!("{device_id}:{register_name}")
}
