//! Cloud sync engine.
//!
//! Ships local rows to the cloud in batches with duplicate-tolerant
//! inserts, per-register downsampling, and a two-phase backfill after
//! offline recovery. Rows are marked synced only after the cloud has
//! durably accepted them — a 2xx insert or a 409 duplicate-ignore both
//! count; anything else leaves the rows for the next cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cloud::{CloudClient, InsertOutcome};
use crate::logging::local_db::{AlarmRow, DeviceReadingRow, LocalDatabase};

pub const BATCH_SIZE: usize = 100;
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
/// Pending-reading count that flips the engine into backfill mode.
pub const BACKFILL_THRESHOLD: i64 = 1000;
/// Cloud unreachable this long raises CLOUD_SYNC_OFFLINE.
const CLOUD_OFFLINE_THRESHOLD_S: i64 = 3600;

/// Alarm types the controller owns. Cloud-side resolutions of these are
/// never synced back: the controller observes the condition itself, and
/// replaying the resolution would re-create the alarm every evaluation
/// in a ping-pong loop.
const CONTROLLER_MANAGED_TYPES: &[&str] = &[
    "REGISTER_READ_FAILED",
    "CLOUD_SYNC_OFFLINE",
    "COMMAND_NOT_TAKEN",
];

fn controller_managed(alarm_type: &str) -> bool {
    alarm_type.starts_with("reg_") || CONTROLLER_MANAGED_TYPES.contains(&alarm_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillPhase {
    /// Below threshold, oldest-first.
    Normal,
    /// First backfill batch: newest rows so dashboards show current data.
    RecentFirst,
    /// Subsequent batches: oldest-first gap fill.
    FillingGaps,
}

impl BackfillPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::RecentFirst => "recent",
            Self::FillingGaps => "filling",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum CloudHealthAction {
    RaiseOfflineAlarm { offline_minutes: i64 },
    ResolveOfflineAlarm,
}

struct UploadResult {
    success: bool,
    is_duplicate: bool,
    error: Option<String>,
}

pub struct CloudSync {
    site_id: String,
    client: CloudClient,
    db: Arc<LocalDatabase>,

    // Stats.
    sync_count: u64,
    error_count: u64,
    empty_batch_count: u64,
    duplicate_count: u64,

    // Cloud-health tracking.
    last_successful_sync: DateTime<Utc>,
    consecutive_failures: u32,
    offline_alarm_raised: bool,

    // Backfill.
    phase: BackfillPhase,
    backfill_total: i64,
    backfill_synced: i64,
    recent_synced: bool,

    /// Last uploaded bucket per (device, register): pending rows that
    /// fall into an already-uploaded bucket are marked synced without
    /// being shipped again.
    uploaded_buckets: HashMap<(String, String), i64>,
}

impl CloudSync {
    pub fn new(site_id: String, client: CloudClient, db: Arc<LocalDatabase>) -> Self {
        Self {
            site_id,
            client,
            db,
            sync_count: 0,
            error_count: 0,
            empty_batch_count: 0,
            duplicate_count: 0,
            last_successful_sync: Utc::now(),
            consecutive_failures: 0,
            offline_alarm_raised: false,
            phase: BackfillPhase::Normal,
            backfill_total: 0,
            backfill_synced: 0,
            recent_synced: false,
            uploaded_buckets: HashMap::new(),
        }
    }

    // ─── Device readings ─────────────────────────────────────────────────────

    /// One readings sync tick: pick the batch per the backfill policy,
    /// downsample per register, upload, mark synced.
    pub async fn sync_readings(
        &mut self,
        frequencies: &HashMap<(String, String), u64>,
    ) -> crate::errors::Result<usize> {
        let pending = self.db.unsynced_readings_count()?;
        if pending == 0 {
            return Ok(0);
        }

        // Enter or continue backfill mode.
        if pending > BACKFILL_THRESHOLD {
            if self.phase == BackfillPhase::Normal {
                self.backfill_total = pending;
                self.backfill_synced = 0;
                self.phase = if self.recent_synced {
                    BackfillPhase::FillingGaps
                } else {
                    info!(pending, "backfill started, syncing newest first");
                    BackfillPhase::RecentFirst
                };
            }
        } else if self.phase != BackfillPhase::Normal {
            info!("backfill complete, back to normal sync");
            self.phase = BackfillPhase::Normal;
            self.recent_synced = false;
        }

        let batch = match self.phase {
            BackfillPhase::RecentFirst => self.db.unsynced_readings_newest(BATCH_SIZE)?,
            _ => self.db.unsynced_readings_oldest(BATCH_SIZE)?,
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let all_ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        let (selected, buckets) = downsample(&batch, frequencies, &self.uploaded_buckets);

        // Every pending row maps into a bucket that was already shipped:
        // nothing to upload, but the rows are accounted for.
        if selected.is_empty() {
            self.db.mark_readings_synced(&all_ids)?;
            self.empty_batch_count += 1;
            debug!(
                marked = all_ids.len(),
                "no new buckets, marked readings synced"
            );
            return Ok(0);
        }

        let records: Vec<Value> = selected.iter().map(|r| self.reading_payload(r)).collect();
        let result = self
            .upload_with_retry(
                "device_readings",
                &Value::Array(records),
                Some("device_id,register_name,timestamp"),
            )
            .await;

        if !result.success {
            self.record_sync_failure();
            warn!(
                error = result.error.as_deref().unwrap_or("unknown"),
                readings = selected.len(),
                "readings upload failed, will retry next cycle"
            );
            return Ok(0);
        }

        // Success: mark every processed row (selected or not) and only
        // now remember the shipped buckets.
        self.db.mark_readings_synced(&all_ids)?;
        self.record_sync_success();
        self.sync_count += selected.len() as u64;
        if result.is_duplicate {
            self.duplicate_count += 1;
        }
        for (key, bucket) in buckets {
            let entry = self.uploaded_buckets.entry(key).or_insert(bucket);
            *entry = (*entry).max(bucket);
        }

        if self.phase != BackfillPhase::Normal {
            self.backfill_synced += all_ids.len() as i64;
            if self.phase == BackfillPhase::RecentFirst {
                self.recent_synced = true;
                self.phase = BackfillPhase::FillingGaps;
                info!("backfill phase 1 done, newest batch synced");
            }
            // Progress every BACKFILL_THRESHOLD rows processed.
            if self.backfill_synced % BACKFILL_THRESHOLD < all_ids.len() as i64 {
                let pct =
                    self.backfill_synced as f64 / self.backfill_total.max(1) as f64 * 100.0;
                info!(
                    synced = self.backfill_synced,
                    total = self.backfill_total,
                    pct = format!("{pct:.1}"),
                    "backfill progress"
                );
            }
        }

        Ok(selected.len())
    }

    fn reading_payload(&self, reading: &DeviceReadingRow) -> Value {
        json!({
            "site_id": if reading.site_id.is_empty() { &self.site_id } else { &reading.site_id },
            "device_id": reading.device_id,
            "register_name": reading.register_name,
            "value": reading.value,
            "unit": reading.unit,
            "timestamp": reading.timestamp,
            "source": reading.source,
        })
    }

    // ─── Control logs & alarms ───────────────────────────────────────────────

    pub async fn sync_control_logs(&mut self) -> crate::errors::Result<usize> {
        let logs = self.db.unsynced_control_logs(BATCH_SIZE)?;
        if logs.is_empty() {
            return Ok(0);
        }

        // Dedup on the natural key within the batch; collided rows are
        // still marked synced (their data lives in the kept row).
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut records = Vec::new();
        for (_, log) in &logs {
            let key = (log.site_id.clone(), log.timestamp.clone());
            if !seen.insert(key) {
                continue;
            }
            records.push(json!({
                "site_id": if log.site_id.is_empty() { &self.site_id } else { &log.site_id },
                "timestamp": log.timestamp,
                "total_load_kw": log.total_load_kw,
                "solar_output_kw": log.solar_output_kw,
                "dg_power_kw": log.dg_power_kw,
                "solar_limit_pct": log.solar_limit_pct,
                "safe_mode_active": log.safe_mode_active,
                "config_mode": log.config_mode,
                "load_meters_online": log.load_meters_online,
                "inverters_online": log.inverters_online,
                "generators_online": log.generators_online,
            }));
        }

        let ids: Vec<i64> = logs.iter().map(|(id, _)| *id).collect();
        if records.is_empty() {
            self.db.mark_control_logs_synced(&ids)?;
            return Ok(0);
        }

        let result = self
            .upload_with_retry(
                "control_logs",
                &Value::Array(records),
                Some("site_id,timestamp"),
            )
            .await;

        if result.success {
            self.db.mark_control_logs_synced(&ids)?;
            self.record_sync_success();
            self.sync_count += ids.len() as u64;
            debug!(count = ids.len(), "synced control logs");
            Ok(ids.len())
        } else {
            self.record_sync_failure();
            warn!("control log upload failed, will retry next cycle");
            Ok(0)
        }
    }

    pub async fn sync_alarms(&mut self) -> crate::errors::Result<usize> {
        let alarms = self.db.unsynced_alarms(BATCH_SIZE)?;
        if alarms.is_empty() {
            return Ok(0);
        }

        let records: Vec<Value> = alarms.iter().map(|a| self.alarm_payload(a)).collect();
        let result = self
            .upload_with_retry("alarms", &Value::Array(records), None)
            .await;

        if result.success {
            let ids: Vec<i64> = alarms.iter().map(|a| a.id).collect();
            self.db.mark_alarms_synced(&ids)?;
            self.record_sync_success();
            self.sync_count += ids.len() as u64;
            debug!(count = ids.len(), "synced alarms");
            Ok(ids.len())
        } else {
            self.record_sync_failure();
            warn!("alarm upload failed, will retry next cycle");
            Ok(0)
        }
    }

    fn alarm_payload(&self, alarm: &AlarmRow) -> Value {
        json!({
            "site_id": if alarm.site_id.is_empty() { &self.site_id } else { &alarm.site_id },
            "alarm_type": alarm.alarm_type,
            "device_id": alarm.device_id,
            "device_name": alarm.device_name,
            "message": alarm.message,
            "condition": alarm.condition,
            "severity": alarm.severity,
            "created_at": alarm.timestamp,
            "acknowledged": false,
            "resolved": alarm.resolved,
        })
    }

    /// Push one critical/major alarm immediately, outside the batch
    /// cadence. Best effort: a failure just waits for the normal sync.
    pub async fn sync_alarm_immediately(&self, alarm: &AlarmRow) -> bool {
        match self.client.post_row("alarms", &self.alarm_payload(alarm)).await {
            Ok(()) => {
                info!(alarm_type = %alarm.alarm_type, severity = %alarm.severity, "alarm pushed immediately");
                true
            }
            Err(e) => {
                warn!(error = %e, "immediate alarm push failed");
                false
            }
        }
    }

    /// Mark a controller-resolved alarm resolved in the cloud.
    pub async fn resolve_alarm_in_cloud(&self, alarm_type: &str, device_id: Option<&str>) -> bool {
        let mut filters = vec![
            ("site_id", format!("eq.{}", self.site_id)),
            ("alarm_type", format!("eq.{alarm_type}")),
            ("resolved", "eq.false".to_string()),
        ];
        if let Some(device_id) = device_id {
            filters.push(("device_id", format!("eq.{device_id}")));
        }

        let body = json!({
            "resolved": true,
            "resolved_at": Utc::now().to_rfc3339(),
        });
        match self.client.patch_rows("alarms", &filters, &body).await {
            Ok(()) => {
                info!(alarm_type, "alarm resolved in cloud");
                true
            }
            Err(e) => {
                warn!(alarm_type, error = %e, "cloud alarm resolution failed");
                false
            }
        }
    }

    /// Best-effort cloud duplicate check gating critical/major alarm
    /// creation. On error, allow creation: a duplicate beats a miss.
    pub async fn has_unresolved_alarm_in_cloud(
        &self,
        alarm_type: &str,
        device_id: Option<&str>,
    ) -> bool {
        let mut filters = vec![
            ("select", "id".to_string()),
            ("site_id", format!("eq.{}", self.site_id)),
            ("alarm_type", format!("eq.{alarm_type}")),
            ("resolved", "eq.false".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(device_id) = device_id {
            filters.push(("device_id", format!("eq.{device_id}")));
        }
        match self.client.get_rows("alarms", &filters).await {
            Ok(rows) => !rows.is_empty(),
            Err(e) => {
                debug!(error = %e, "cloud alarm existence check failed");
                false
            }
        }
    }

    /// Reverse sync: apply cloud-side resolutions (UI actions) to local
    /// rows. Controller-owned alarm types are excluded to prevent the
    /// resolve/re-create oscillation.
    pub async fn sync_resolved_alarms(&self) -> crate::errors::Result<usize> {
        let since = (Utc::now() - ChronoDuration::hours(24)).to_rfc3339();
        let rows = self
            .client
            .get_rows(
                "alarms",
                &[
                    ("select", "alarm_type,device_id,resolved_at".to_string()),
                    ("site_id", format!("eq.{}", self.site_id)),
                    ("resolved", "eq.true".to_string()),
                    ("resolved_at", format!("gte.{since}")),
                ],
            )
            .await?;

        let mut updated = 0;
        for row in rows {
            let Some(alarm_type) = row.get("alarm_type").and_then(Value::as_str) else {
                continue;
            };
            if controller_managed(alarm_type) {
                continue;
            }
            let device_id = row.get("device_id").and_then(Value::as_str);
            let resolved_at = row
                .get("resolved_at")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| Utc::now().to_rfc3339());

            updated +=
                self.db
                    .sync_alarm_resolution(&self.site_id, alarm_type, device_id, &resolved_at)?;
        }

        if updated > 0 {
            info!(updated, "synced alarm resolutions from cloud");
        }
        Ok(updated)
    }

    // ─── Upload & health plumbing ────────────────────────────────────────────

    async fn upload_with_retry(
        &mut self,
        table: &str,
        records: &Value,
        on_conflict: Option<&str>,
    ) -> UploadResult {
        let mut last_error = None;

        for (attempt, delay) in RETRY_BACKOFF
            .iter()
            .map(Some)
            .chain(std::iter::once(None))
            .enumerate()
        {
            match self.client.insert_rows(table, records, on_conflict).await {
                Ok(outcome) => {
                    return UploadResult {
                        success: true,
                        is_duplicate: outcome == InsertOutcome::Duplicate,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(
                        table,
                        attempt = attempt + 1,
                        error = %e,
                        "cloud upload attempt failed"
                    );
                    last_error = Some(e.to_string());
                }
            }
            if let Some(delay) = delay {
                tokio::time::sleep(*delay).await;
            }
        }

        self.error_count += 1;
        UploadResult {
            success: false,
            is_duplicate: false,
            error: last_error,
        }
    }

    pub fn record_sync_success(&mut self) {
        self.last_successful_sync = Utc::now();
        self.consecutive_failures = 0;
    }

    pub fn record_sync_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Raise CLOUD_SYNC_OFFLINE after an hour without a successful sync;
    /// resolve it on the first success afterwards.
    pub fn check_cloud_health(&mut self) -> Option<CloudHealthAction> {
        let offline_s = (Utc::now() - self.last_successful_sync).num_seconds();

        if offline_s > CLOUD_OFFLINE_THRESHOLD_S && !self.offline_alarm_raised {
            self.offline_alarm_raised = true;
            return Some(CloudHealthAction::RaiseOfflineAlarm {
                offline_minutes: offline_s / 60,
            });
        }

        if self.offline_alarm_raised && self.consecutive_failures == 0 {
            self.offline_alarm_raised = false;
            return Some(CloudHealthAction::ResolveOfflineAlarm);
        }

        None
    }

    pub fn stats(&self) -> Value {
        json!({
            "total_synced": self.sync_count,
            "error_count": self.error_count,
            "empty_batch_count": self.empty_batch_count,
            "duplicate_count": self.duplicate_count,
            "backfill_phase": self.phase.as_str(),
            "backfill_total": self.backfill_total,
            "backfill_synced": self.backfill_synced,
            "last_successful_sync": self.last_successful_sync.to_rfc3339(),
            "consecutive_failures": self.consecutive_failures,
            "cloud_alarm_raised": self.offline_alarm_raised,
        })
    }

    pub fn backfill_phase(&self) -> BackfillPhase {
        self.phase
    }
}

/// Select one representative per (device, register, bucket). Returns the
/// selected rows and the newest bucket per register pair — the caller
/// records those only after a successful upload. Rows in buckets already
/// uploaded are deliberately not selected.
fn downsample<'a>(
    batch: &'a [DeviceReadingRow],
    frequencies: &HashMap<(String, String), u64>,
    uploaded: &HashMap<(String, String), i64>,
) -> (Vec<&'a DeviceReadingRow>, HashMap<(String, String), i64>) {
    let mut selected: Vec<&DeviceReadingRow> = Vec::new();
    let mut seen_buckets: HashSet<(String, String, i64)> = HashSet::new();
    let mut newest_buckets: HashMap<(String, String), i64> = HashMap::new();

    for reading in batch {
        let key = (reading.device_id.clone(), reading.register_name.clone());
        let frequency = frequencies.get(&key).copied().unwrap_or(60).max(1) as i64;

        let Ok(ts) = reading.timestamp.parse::<DateTime<Utc>>() else {
            continue;
        };
        let bucket = ts.timestamp().div_euclid(frequency) * frequency;

        if uploaded.get(&key).is_some_and(|&last| bucket <= last) {
            continue;
        }
        if !seen_buckets.insert((key.0.clone(), key.1.clone(), bucket)) {
            continue;
        }

        let entry = newest_buckets.entry(key).or_insert(bucket);
        *entry = (*entry).max(bucket);
        selected.push(reading);
    }

    (selected, newest_buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(device: &str, register: &str, ts: &str) -> DeviceReadingRow {
        DeviceReadingRow {
            id: 0,
            site_id: "site-1".into(),
            device_id: device.into(),
            register_name: register.into(),
            value: 1.0,
            unit: None,
            timestamp: ts.into(),
            source: "live".into(),
        }
    }

    fn freq(entries: &[(&str, &str, u64)]) -> HashMap<(String, String), u64> {
        entries
            .iter()
            .map(|(d, r, f)| ((d.to_string(), r.to_string()), *f))
            .collect()
    }

    #[test]
    fn one_representative_per_bucket() {
        let batch = vec![
            row("inv-1", "p", "2024-01-15T10:00:05+00:00"),
            row("inv-1", "p", "2024-01-15T10:00:25+00:00"),
            row("inv-1", "p", "2024-01-15T10:00:55+00:00"),
            row("inv-1", "p", "2024-01-15T10:01:05+00:00"),
        ];
        let frequencies = freq(&[("inv-1", "p", 60)]);
        let (selected, buckets) = downsample(&batch, &frequencies, &HashMap::new());

        // Two buckets: 10:00 and 10:01.
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].timestamp, "2024-01-15T10:00:05+00:00");
        assert_eq!(selected[1].timestamp, "2024-01-15T10:01:05+00:00");
        assert_eq!(buckets.len(), 1);
    }

    #[test]
    fn registers_downsample_independently() {
        let batch = vec![
            row("inv-1", "p", "2024-01-15T10:00:05+00:00"),
            row("inv-1", "q", "2024-01-15T10:00:06+00:00"),
            row("meter-1", "p", "2024-01-15T10:00:07+00:00"),
        ];
        let frequencies = freq(&[("inv-1", "p", 60), ("inv-1", "q", 60), ("meter-1", "p", 60)]);
        let (selected, _) = downsample(&batch, &frequencies, &HashMap::new());
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn already_uploaded_buckets_are_skipped() {
        let batch = vec![
            row("inv-1", "p", "2024-01-15T10:00:05+00:00"),
            row("inv-1", "p", "2024-01-15T10:00:45+00:00"),
        ];
        let frequencies = freq(&[("inv-1", "p", 60)]);
        // The 10:00 bucket (epoch-aligned) was already shipped.
        let ts: DateTime<Utc> = "2024-01-15T10:00:00+00:00".parse().unwrap();
        let uploaded: HashMap<(String, String), i64> =
            [(("inv-1".to_string(), "p".to_string()), ts.timestamp())].into();

        let (selected, _) = downsample(&batch, &frequencies, &uploaded);
        assert!(selected.is_empty());
    }

    #[test]
    fn unknown_register_defaults_to_sixty_seconds() {
        let batch = vec![
            row("x", "y", "2024-01-15T10:00:01+00:00"),
            row("x", "y", "2024-01-15T10:00:59+00:00"),
        ];
        let (selected, _) = downsample(&batch, &HashMap::new(), &HashMap::new());
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn controller_managed_types_cover_register_alarms() {
        assert!(controller_managed("reg_inv-1_active_power"));
        assert!(controller_managed("CLOUD_SYNC_OFFLINE"));
        assert!(!controller_managed("High Temperature"));
    }
}
