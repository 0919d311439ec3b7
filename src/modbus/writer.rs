//! Register writer.
//!
//! Writes hold the serial bus mutex across the entire write + verify
//! sequence: settle, read back, compare within tolerance. A write the
//! device acknowledged but did not apply surfaces as `CommandNotTaken` —
//! the one error that means the site is not doing what the control loop
//! believes it is.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{DeviceConfig, RegisterKind};
use crate::errors::{ControllerError, Result};
use crate::modbus::pool::{ConnectionPool, SharedClient};

/// Settle time between write and read-back.
const VERIFY_DELAY: Duration = Duration::from_millis(200);
/// Pause between the enable and limit writes of the composite sequence.
const SEQUENCE_DELAY: Duration = Duration::from_millis(100);
const VERIFY_TOLERANCE_PCT: f64 = 1.0;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub success: bool,
    pub verified: bool,
    pub written_value: Option<u16>,
    pub read_back_value: Option<u16>,
    pub error: Option<String>,
}

pub struct RegisterWriter {
    pool: ConnectionPool,
}

impl RegisterWriter {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Write a register, optionally verifying by read-back. Serial
    /// devices hold the bus mutex for the whole sequence.
    pub async fn write_register(
        &self,
        device: &DeviceConfig,
        register_address: u16,
        value: u16,
        verify: bool,
    ) -> WriteResult {
        let (client, bus) = self.pool.get(&device.transport).await;

        if let Some(bus) = bus {
            let _bus = bus.lock().await;
            self.do_write(&client, device, register_address, value, verify)
                .await
        } else {
            self.do_write(&client, device, register_address, value, verify)
                .await
        }
    }

    async fn do_write(
        &self,
        client: &SharedClient,
        device: &DeviceConfig,
        register_address: u16,
        value: u16,
        verify: bool,
    ) -> WriteResult {
        for attempt in 0..MAX_RETRIES {
            let write = {
                let mut client = client.lock().await;
                client
                    .write_register(register_address, value, device.slave_id)
                    .await
            };

            match write {
                Ok(()) => {}
                Err(e) => {
                    if attempt < MAX_RETRIES - 1 {
                        debug!(
                            device = %device.name,
                            register = register_address,
                            attempt = attempt + 1,
                            error = %e,
                            "write failed, retrying"
                        );
                        tokio::time::sleep(RETRY_DELAY).await;
                        continue;
                    }
                    warn!(
                        device = %device.name,
                        register = register_address,
                        error = %e,
                        "write failed"
                    );
                    return WriteResult {
                        success: false,
                        error: Some(e.to_string()),
                        written_value: Some(value),
                        ..Default::default()
                    };
                }
            }

            if !verify {
                debug!(device = %device.name, register = register_address, value, "write ok");
                return WriteResult {
                    success: true,
                    verified: false,
                    written_value: Some(value),
                    ..Default::default()
                };
            }

            match self
                .read_back(client, device, register_address, value)
                .await
            {
                Ok(read_back) => {
                    return WriteResult {
                        success: true,
                        verified: true,
                        written_value: Some(value),
                        read_back_value: Some(read_back),
                        error: None,
                    }
                }
                Err(e @ ControllerError::CommandNotTaken { .. }) => {
                    warn!(
                        device = %device.name,
                        register = register_address,
                        error = %e,
                        "write verification failed"
                    );
                    let actual = match &e {
                        ControllerError::CommandNotTaken { actual, .. } => Some(*actual),
                        _ => None,
                    };
                    return WriteResult {
                        success: false,
                        verified: false,
                        written_value: Some(value),
                        read_back_value: actual,
                        error: Some(e.to_string()),
                    };
                }
                Err(e) => {
                    // Read-back transport failure: write may have landed
                    // but we cannot prove it.
                    return WriteResult {
                        success: true,
                        verified: false,
                        written_value: Some(value),
                        error: Some(e.to_string()),
                        ..Default::default()
                    };
                }
            }
        }

        WriteResult {
            success: false,
            error: Some(format!("failed after {MAX_RETRIES} attempts")),
            ..Default::default()
        }
    }

    async fn read_back(
        &self,
        client: &SharedClient,
        device: &DeviceConfig,
        register_address: u16,
        written: u16,
    ) -> Result<u16> {
        tokio::time::sleep(VERIFY_DELAY).await;

        let words = {
            let mut client = client.lock().await;
            client
                .read_registers(RegisterKind::Holding, register_address, 1, device.slave_id)
                .await?
        };
        let read_back = words
            .first()
            .copied()
            .ok_or_else(|| ControllerError::communication("empty read-back response"))?;

        if values_match(written, read_back) {
            Ok(read_back)
        } else {
            Err(ControllerError::CommandNotTaken {
                expected: written,
                actual: read_back,
            })
        }
    }

    /// Composite solar-limit sequence (Sungrow-style): write the enable
    /// register, write the limit register, verify the limit register.
    /// Atomic under the bus mutex for serial devices. The limit register
    /// carries 0.1 % resolution.
    pub async fn write_solar_limit(
        &self,
        device: &DeviceConfig,
        limit_pct: f64,
        enable_register: u16,
        limit_register: u16,
        enable_value: u16,
    ) -> WriteResult {
        let (client, bus) = self.pool.get(&device.transport).await;

        if let Some(bus) = bus {
            let _bus = bus.lock().await;
            self.do_write_solar_limit(
                &client,
                device,
                limit_pct,
                enable_register,
                limit_register,
                enable_value,
            )
            .await
        } else {
            self.do_write_solar_limit(
                &client,
                device,
                limit_pct,
                enable_register,
                limit_register,
                enable_value,
            )
            .await
        }
    }

    async fn do_write_solar_limit(
        &self,
        client: &SharedClient,
        device: &DeviceConfig,
        limit_pct: f64,
        enable_register: u16,
        limit_register: u16,
        enable_value: u16,
    ) -> WriteResult {
        let limit_pct = limit_pct.clamp(0.0, 100.0);
        let limit_value = (limit_pct * 10.0).round() as u16;

        let enable = {
            let mut client = client.lock().await;
            client
                .write_register(enable_register, enable_value, device.slave_id)
                .await
        };
        if let Err(e) = enable {
            return WriteResult {
                success: false,
                error: Some(format!("failed to enable power limiting: {e}")),
                ..Default::default()
            };
        }

        tokio::time::sleep(SEQUENCE_DELAY).await;

        let limit = {
            let mut client = client.lock().await;
            client
                .write_register(limit_register, limit_value, device.slave_id)
                .await
        };
        if let Err(e) = limit {
            return WriteResult {
                success: false,
                written_value: Some(limit_value),
                error: Some(format!("failed to write power limit: {e}")),
                ..Default::default()
            };
        }

        match self
            .read_back(client, device, limit_register, limit_value)
            .await
        {
            Ok(read_back) => {
                info!(
                    device = %device.name,
                    limit_pct,
                    "solar limit applied"
                );
                WriteResult {
                    success: true,
                    verified: true,
                    written_value: Some(limit_value),
                    read_back_value: Some(read_back),
                    error: None,
                }
            }
            Err(e @ ControllerError::CommandNotTaken { .. }) => {
                let actual = match &e {
                    ControllerError::CommandNotTaken { actual, .. } => Some(*actual),
                    _ => None,
                };
                WriteResult {
                    success: false,
                    verified: false,
                    written_value: Some(limit_value),
                    read_back_value: actual,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => WriteResult {
                success: true,
                verified: false,
                written_value: Some(limit_value),
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }
}

/// Tolerance: 1 % of the written value, minimum 1 LSB. Zero must read
/// back as zero.
pub fn values_match(expected: u16, actual: u16) -> bool {
    if expected == actual {
        return true;
    }
    if expected == 0 {
        return false;
    }
    let diff = f64::from(expected.abs_diff(actual));
    let tolerance = (f64::from(expected) * VERIFY_TOLERANCE_PCT / 100.0).max(1.0);
    diff <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_passes() {
        assert!(values_match(500, 500));
        assert!(values_match(0, 0));
    }

    #[test]
    fn one_percent_tolerance_with_one_lsb_floor() {
        // 1% of 500 = 5.
        assert!(values_match(500, 495));
        assert!(!values_match(500, 494));
        // Floor of 1 LSB for small values.
        assert!(values_match(10, 11));
        assert!(!values_match(10, 12));
    }

    #[test]
    fn zero_written_requires_zero_read_back() {
        assert!(!values_match(0, 1));
    }

    #[test]
    fn scenario_d_mismatch() {
        // Write 50.0% -> 500 raw; read-back 48.0% -> 480 raw is outside
        // the 1% band and must fail verification.
        assert!(!values_match(500, 480));
    }
}
