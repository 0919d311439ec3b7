//! Local SQLite store.
//!
//! Three row-typed tables (control logs, alarms, device readings) with
//! sync tracking. Pragmas are chosen for SD-class storage: WAL keeps
//! writes in a side log, `synchronous=NORMAL` halves fsyncs, temp tables
//! stay in memory. Connections follow an open-per-call pattern so file
//! handles release on every path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use tracing::{error, info, warn};

use crate::errors::Result;

/// Chunk size for batch inserts, bounding write-lock duration.
const BATCH_CHUNK_SIZE: usize = 1000;
/// Retry backoff for transient write errors.
const WRITE_RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];
/// SQLite parameter ceiling, respected when marking rows synced.
const SQLITE_MAX_PARAMS: usize = 999;
/// Pages per incremental vacuum pass.
const INCREMENTAL_VACUUM_PAGES: u32 = 5000;

#[derive(Debug, Clone, Default)]
pub struct ControlLogRow {
    pub timestamp: String,
    pub site_id: String,
    pub total_load_kw: f64,
    pub load_min: f64,
    pub load_max: f64,
    pub solar_output_kw: f64,
    pub solar_min: f64,
    pub solar_max: f64,
    pub dg_power_kw: f64,
    pub solar_limit_pct: f64,
    pub solar_limit_kw: f64,
    pub safe_mode_active: bool,
    pub config_mode: String,
    pub operation_mode: String,
    pub load_meters_online: i64,
    pub inverters_online: i64,
    pub generators_online: i64,
    pub execution_time_ms: f64,
    pub device_readings_json: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AlarmRow {
    pub id: i64,
    pub alarm_uuid: String,
    pub site_id: String,
    pub alarm_type: String,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub message: String,
    pub condition: Option<String>,
    pub severity: String,
    pub timestamp: String,
    pub resolved: bool,
    pub resolved_at: Option<String>,
    pub synced_at: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceReadingRow {
    pub id: i64,
    pub site_id: String,
    pub device_id: String,
    pub register_name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: String,
    pub source: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub total_logs: i64,
    pub unsynced_logs: i64,
    pub total_alarms: i64,
    pub unsynced_alarms: i64,
    pub total_device_readings: i64,
    pub unsynced_device_readings: i64,
}

pub struct LocalDatabase {
    db_path: PathBuf,
    vacuum_marker: PathBuf,
}

impl LocalDatabase {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let vacuum_marker = db_path
            .parent()
            .map(|p| p.join(".vacuum_done"))
            .unwrap_or_else(|| PathBuf::from(".vacuum_done"));

        let db = Self {
            db_path,
            vacuum_marker,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a fresh connection with the disk-wear pragmas applied.
    /// Fails fast on lock contention instead of blocking forever.
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "cache_size", -2000)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;

        // Incremental auto-vacuum only works on databases created with
        // it; setting the pragma on an existing file just rewrites the
        // header, so only new databases get it here. Existing ones are
        // converted by the one-time VACUUM during retention.
        let table_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
            [],
            |row| row.get(0),
        )?;
        if table_count == 0 {
            conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
        } else if !self.vacuum_marker.exists() {
            warn!("store needs one-time VACUUM, will run on next retention pass");
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS control_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                site_id TEXT,
                total_load_kw REAL,
                total_load_kw_min REAL,
                total_load_kw_max REAL,
                solar_output_kw REAL,
                solar_output_kw_min REAL,
                solar_output_kw_max REAL,
                dg_power_kw REAL,
                solar_limit_pct REAL,
                solar_limit_kw REAL,
                safe_mode_active INTEGER DEFAULT 0,
                config_mode TEXT,
                operation_mode TEXT,
                load_meters_online INTEGER DEFAULT 0,
                inverters_online INTEGER DEFAULT 0,
                generators_online INTEGER DEFAULT 0,
                execution_time_ms REAL,
                device_readings TEXT,
                synced_at TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                UNIQUE (site_id, timestamp)
            );

            CREATE TABLE IF NOT EXISTS alarms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alarm_uuid TEXT NOT NULL,
                site_id TEXT,
                alarm_type TEXT NOT NULL,
                device_id TEXT,
                device_name TEXT,
                message TEXT,
                condition TEXT,
                severity TEXT DEFAULT 'warning',
                timestamp TEXT NOT NULL,
                acknowledged INTEGER DEFAULT 0,
                acknowledged_by TEXT,
                acknowledged_at TEXT,
                resolved INTEGER DEFAULT 0,
                resolved_at TEXT,
                synced_at TEXT,
                created_at TEXT DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS device_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                register_name TEXT NOT NULL,
                value REAL NOT NULL,
                unit TEXT,
                timestamp TEXT NOT NULL,
                source TEXT DEFAULT 'live',
                synced_at TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                UNIQUE (device_id, register_name, timestamp)
            );

            CREATE INDEX IF NOT EXISTS idx_logs_timestamp
                ON control_logs(timestamp);
            CREATE INDEX IF NOT EXISTS idx_logs_unsynced
                ON control_logs(synced_at) WHERE synced_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_alarms_timestamp
                ON alarms(timestamp);
            CREATE INDEX IF NOT EXISTS idx_alarms_unsynced
                ON alarms(synced_at) WHERE synced_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_device_readings_timestamp
                ON device_readings(timestamp);
            CREATE INDEX IF NOT EXISTS idx_device_readings_unsynced
                ON device_readings(synced_at) WHERE synced_at IS NULL;
            "#,
        )?;

        info!(path = %self.db_path.display(), "local store initialized");
        Ok(())
    }

    // ─── Control logs ────────────────────────────────────────────────────────

    pub fn insert_control_log(&self, row: &ControlLogRow) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO control_logs (
                timestamp, site_id,
                total_load_kw, total_load_kw_min, total_load_kw_max,
                solar_output_kw, solar_output_kw_min, solar_output_kw_max,
                dg_power_kw, solar_limit_pct, solar_limit_kw,
                safe_mode_active, config_mode, operation_mode,
                load_meters_online, inverters_online, generators_online,
                execution_time_ms, device_readings
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            "#,
            params![
                row.timestamp,
                row.site_id,
                row.total_load_kw,
                row.load_min,
                row.load_max,
                row.solar_output_kw,
                row.solar_min,
                row.solar_max,
                row.dg_power_kw,
                row.solar_limit_pct,
                row.solar_limit_kw,
                row.safe_mode_active as i64,
                row.config_mode,
                row.operation_mode,
                row.load_meters_online,
                row.inverters_online,
                row.generators_online,
                row.execution_time_ms,
                row.device_readings_json,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn unsynced_control_logs(&self, limit: usize) -> Result<Vec<(i64, ControlLogRow)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, timestamp, site_id, total_load_kw, total_load_kw_min,
                   total_load_kw_max, solar_output_kw, solar_output_kw_min,
                   solar_output_kw_max, dg_power_kw, solar_limit_pct,
                   solar_limit_kw, safe_mode_active, config_mode,
                   operation_mode, load_meters_online, inverters_online,
                   generators_online, execution_time_ms
            FROM control_logs
            WHERE synced_at IS NULL
            ORDER BY timestamp ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    ControlLogRow {
                        timestamp: row.get(1)?,
                        site_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        total_load_kw: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
                        load_min: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
                        load_max: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
                        solar_output_kw: row.get::<_, Option<f64>>(6)?.unwrap_or_default(),
                        solar_min: row.get::<_, Option<f64>>(7)?.unwrap_or_default(),
                        solar_max: row.get::<_, Option<f64>>(8)?.unwrap_or_default(),
                        dg_power_kw: row.get::<_, Option<f64>>(9)?.unwrap_or_default(),
                        solar_limit_pct: row.get::<_, Option<f64>>(10)?.unwrap_or_default(),
                        solar_limit_kw: row.get::<_, Option<f64>>(11)?.unwrap_or_default(),
                        safe_mode_active: row.get::<_, i64>(12)? != 0,
                        config_mode: row.get::<_, Option<String>>(13)?.unwrap_or_default(),
                        operation_mode: row.get::<_, Option<String>>(14)?.unwrap_or_default(),
                        load_meters_online: row.get::<_, Option<i64>>(15)?.unwrap_or_default(),
                        inverters_online: row.get::<_, Option<i64>>(16)?.unwrap_or_default(),
                        generators_online: row.get::<_, Option<i64>>(17)?.unwrap_or_default(),
                        execution_time_ms: row.get::<_, Option<f64>>(18)?.unwrap_or_default(),
                        device_readings_json: None,
                    },
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_control_logs_synced(&self, ids: &[i64]) -> Result<()> {
        self.mark_synced("control_logs", ids)
    }

    // ─── Alarms ──────────────────────────────────────────────────────────────

    pub fn insert_alarm(&self, row: &AlarmRow) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO alarms (
                alarm_uuid, site_id, alarm_type, device_id, device_name,
                message, condition, severity, timestamp, resolved, resolved_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                row.alarm_uuid,
                row.site_id,
                row.alarm_type,
                row.device_id,
                row.device_name,
                row.message,
                row.condition,
                row.severity,
                row.timestamp,
                row.resolved as i64,
                row.resolved_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// At most one unresolved row may exist per (site, type, device) —
    /// this is the local half of alarm de-duplication.
    pub fn has_unresolved_alarm(
        &self,
        site_id: &str,
        alarm_type: &str,
        device_id: Option<&str>,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let exists = match device_id {
            Some(device_id) => conn
                .query_row(
                    "SELECT 1 FROM alarms
                     WHERE site_id = ?1 AND alarm_type = ?2 AND device_id = ?3 AND resolved = 0
                     LIMIT 1",
                    params![site_id, alarm_type, device_id],
                    |_| Ok(()),
                )
                .is_ok(),
            None => conn
                .query_row(
                    "SELECT 1 FROM alarms
                     WHERE site_id = ?1 AND alarm_type = ?2 AND resolved = 0
                     LIMIT 1",
                    params![site_id, alarm_type],
                    |_| Ok(()),
                )
                .is_ok(),
        };
        Ok(exists)
    }

    /// Resolve the controller's own alarms when their condition clears.
    /// `synced_at` is left untouched: re-syncing a resolution as a fresh
    /// row would create a duplicate in the cloud.
    pub fn resolve_alarms_by_type(&self, alarm_type: &str, device_id: Option<&str>) -> Result<usize> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        let count = match device_id {
            Some(device_id) => conn.execute(
                "UPDATE alarms SET resolved = 1, resolved_at = ?1
                 WHERE alarm_type = ?2 AND device_id = ?3 AND resolved = 0",
                params![now, alarm_type, device_id],
            )?,
            None => conn.execute(
                "UPDATE alarms SET resolved = 1, resolved_at = ?1
                 WHERE alarm_type = ?2 AND resolved = 0",
                params![now, alarm_type],
            )?,
        };
        Ok(count)
    }

    /// Apply a resolution observed in the cloud. Only rows created at or
    /// before the resolution timestamp are touched, so a fresh alarm for
    /// a recurring condition is never swallowed by an old resolution.
    pub fn sync_alarm_resolution(
        &self,
        site_id: &str,
        alarm_type: &str,
        device_id: Option<&str>,
        resolved_at: &str,
    ) -> Result<usize> {
        let conn = self.connect()?;
        let count = match device_id {
            Some(device_id) => conn.execute(
                "UPDATE alarms SET resolved = 1, resolved_at = ?1
                 WHERE site_id = ?2 AND alarm_type = ?3 AND device_id = ?4
                   AND resolved = 0 AND created_at <= ?1",
                params![resolved_at, site_id, alarm_type, device_id],
            )?,
            None => conn.execute(
                "UPDATE alarms SET resolved = 1, resolved_at = ?1
                 WHERE site_id = ?2 AND alarm_type = ?3
                   AND resolved = 0 AND created_at <= ?1",
                params![resolved_at, site_id, alarm_type],
            )?,
        };
        Ok(count)
    }

    pub fn unsynced_alarms(&self, limit: usize) -> Result<Vec<AlarmRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, alarm_uuid, site_id, alarm_type, device_id, device_name,
                   message, condition, severity, timestamp, resolved, resolved_at, synced_at
            FROM alarms
            WHERE synced_at IS NULL
            ORDER BY timestamp ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(AlarmRow {
                    id: row.get(0)?,
                    alarm_uuid: row.get(1)?,
                    site_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    alarm_type: row.get(3)?,
                    device_id: row.get(4)?,
                    device_name: row.get(5)?,
                    message: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                    condition: row.get(7)?,
                    severity: row.get::<_, Option<String>>(8)?.unwrap_or_else(|| "warning".into()),
                    timestamp: row.get(9)?,
                    resolved: row.get::<_, i64>(10)? != 0,
                    resolved_at: row.get(11)?,
                    synced_at: row.get(12)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_alarms_synced(&self, ids: &[i64]) -> Result<()> {
        self.mark_synced("alarms", ids)
    }

    // ─── Device readings ─────────────────────────────────────────────────────

    /// Chunked batch insert with retry. Each chunk is its own
    /// transaction; a chunk that exhausts its retries propagates so the
    /// caller re-attempts the batch next tick.
    pub fn insert_device_readings_batch(&self, readings: &[DeviceReadingRow]) -> Result<usize> {
        let mut inserted = 0;
        for chunk in readings.chunks(BATCH_CHUNK_SIZE) {
            inserted += self.insert_readings_chunk(chunk)?;
        }
        Ok(inserted)
    }

    fn insert_readings_chunk(&self, chunk: &[DeviceReadingRow]) -> Result<usize> {
        for (attempt, delay) in WRITE_RETRY_BACKOFF.iter().enumerate() {
            match self.try_insert_chunk(chunk) {
                Ok(count) => return Ok(count),
                Err(e) => {
                    error!(attempt = attempt + 1, error = %e, "local store write failed");
                    warn!(
                        delay_ms = delay.as_millis() as u64,
                        "retrying local store write"
                    );
                    std::thread::sleep(*delay);
                }
            }
        }
        // Final attempt; exhausted retries propagate to the caller.
        self.try_insert_chunk(chunk)
    }

    fn try_insert_chunk(&self, chunk: &[DeviceReadingRow]) -> Result<usize> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO device_readings
                 (site_id, device_id, register_name, value, unit, timestamp, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in chunk {
                count += stmt.execute(params![
                    row.site_id,
                    row.device_id,
                    row.register_name,
                    row.value,
                    row.unit,
                    row.timestamp,
                    row.source,
                ])?;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn unsynced_readings_oldest(&self, limit: usize) -> Result<Vec<DeviceReadingRow>> {
        self.unsynced_readings("ASC", limit)
    }

    /// Newest-first selection for backfill phase 1, so dashboards show
    /// current data before the gap fill starts.
    pub fn unsynced_readings_newest(&self, limit: usize) -> Result<Vec<DeviceReadingRow>> {
        self.unsynced_readings("DESC", limit)
    }

    fn unsynced_readings(&self, order: &str, limit: usize) -> Result<Vec<DeviceReadingRow>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, site_id, device_id, register_name, value, unit, timestamp, source
             FROM device_readings
             WHERE synced_at IS NULL
             ORDER BY timestamp {order}
             LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(DeviceReadingRow {
                    id: row.get(0)?,
                    site_id: row.get(1)?,
                    device_id: row.get(2)?,
                    register_name: row.get(3)?,
                    value: row.get(4)?,
                    unit: row.get(5)?,
                    timestamp: row.get(6)?,
                    source: row.get::<_, Option<String>>(7)?.unwrap_or_else(|| "live".into()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn unsynced_readings_count(&self) -> Result<i64> {
        let conn = self.connect()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM device_readings WHERE synced_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mark_readings_synced(&self, ids: &[i64]) -> Result<()> {
        self.mark_synced("device_readings", ids)
    }

    fn mark_synced(&self, table: &str, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();

        // Chunk to stay under the parameter ceiling.
        for chunk in ids.chunks(SQLITE_MAX_PARAMS - 1) {
            let placeholders = (2..=chunk.len() + 1)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(",");
            let sql =
                format!("UPDATE {table} SET synced_at = ?1 WHERE id IN ({placeholders})");
            let mut values: Vec<&dyn rusqlite::ToSql> = vec![&now];
            for id in chunk {
                values.push(id);
            }
            conn.execute(&sql, values.as_slice())?;
        }
        Ok(())
    }

    // ─── Retention ───────────────────────────────────────────────────────────

    /// Delete synced rows older than the retention window. The first
    /// pass that deletes anything performs the one-time full VACUUM
    /// (tracked by a marker file, because the auto_vacuum pragma alone
    /// does not convert an existing database); later passes reclaim
    /// pages incrementally.
    pub fn cleanup_old_data(&self, retention_days: u32) -> Result<usize> {
        let conn = self.connect()?;
        let cutoff = (Utc::now() - ChronoDuration::days(i64::from(retention_days)))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc().to_rfc3339())
            .unwrap_or_default();

        let logs = conn.execute(
            "DELETE FROM control_logs WHERE timestamp < ?1 AND synced_at IS NOT NULL",
            params![cutoff],
        )?;
        let alarms = conn.execute(
            "DELETE FROM alarms WHERE timestamp < ?1 AND synced_at IS NOT NULL",
            params![cutoff],
        )?;
        let readings = conn.execute(
            "DELETE FROM device_readings WHERE timestamp < ?1 AND synced_at IS NOT NULL",
            params![cutoff],
        )?;
        let total = logs + alarms + readings;

        if !self.vacuum_marker.exists() && total > 0 {
            info!("one-time VACUUM: converting store and reclaiming space");
            conn.pragma_update(None, "auto_vacuum", "INCREMENTAL")?;
            conn.execute_batch("VACUUM")?;
            std::fs::write(&self.vacuum_marker, b"")?;
            info!("one-time VACUUM complete");
        } else {
            conn.execute_batch(&format!(
                "PRAGMA incremental_vacuum({INCREMENTAL_VACUUM_PAGES})"
            ))?;
        }

        if total > 0 {
            info!(
                logs,
                alarms, readings, retention_days, "retention cleanup removed old rows"
            );
        }
        Ok(total)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.connect()?;
        let count = |sql: &str| -> Result<i64> {
            Ok(conn.query_row(sql, [], |row| row.get(0))?)
        };
        Ok(StoreStats {
            total_logs: count("SELECT COUNT(*) FROM control_logs")?,
            unsynced_logs: count("SELECT COUNT(*) FROM control_logs WHERE synced_at IS NULL")?,
            total_alarms: count("SELECT COUNT(*) FROM alarms")?,
            unsynced_alarms: count("SELECT COUNT(*) FROM alarms WHERE synced_at IS NULL")?,
            total_device_readings: count("SELECT COUNT(*) FROM device_readings")?,
            unsynced_device_readings: count(
                "SELECT COUNT(*) FROM device_readings WHERE synced_at IS NULL",
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, LocalDatabase) {
        let dir = TempDir::new().unwrap();
        let db = LocalDatabase::open(dir.path().join("controller.db")).unwrap();
        (dir, db)
    }

    fn reading(device: &str, register: &str, ts: &str, value: f64) -> DeviceReadingRow {
        DeviceReadingRow {
            site_id: "site-1".into(),
            device_id: device.into(),
            register_name: register.into(),
            value,
            unit: Some("kW".into()),
            timestamp: ts.into(),
            source: "live".into(),
            ..Default::default()
        }
    }

    #[test]
    fn batch_insert_and_unsynced_queries() {
        let (_dir, db) = open_temp();
        let rows: Vec<_> = (0..25)
            .map(|i| reading("inv-1", "p", &format!("2024-01-15T10:00:{i:02}+00:00"), i as f64))
            .collect();
        assert_eq!(db.insert_device_readings_batch(&rows).unwrap(), 25);
        assert_eq!(db.unsynced_readings_count().unwrap(), 25);

        let oldest = db.unsynced_readings_oldest(5).unwrap();
        assert_eq!(oldest[0].timestamp, "2024-01-15T10:00:00+00:00");
        let newest = db.unsynced_readings_newest(5).unwrap();
        assert_eq!(newest[0].timestamp, "2024-01-15T10:00:24+00:00");
    }

    #[test]
    fn duplicate_natural_keys_are_ignored() {
        let (_dir, db) = open_temp();
        let row = reading("inv-1", "p", "2024-01-15T10:00:00+00:00", 1.0);
        assert_eq!(db.insert_device_readings_batch(&[row.clone()]).unwrap(), 1);
        assert_eq!(db.insert_device_readings_batch(&[row]).unwrap(), 0);
        assert_eq!(db.unsynced_readings_count().unwrap(), 1);
    }

    #[test]
    fn mark_synced_excludes_rows_from_unsynced_scan() {
        let (_dir, db) = open_temp();
        let rows: Vec<_> = (0..10)
            .map(|i| reading("inv-1", "p", &format!("2024-01-15T10:00:{i:02}+00:00"), 0.0))
            .collect();
        db.insert_device_readings_batch(&rows).unwrap();

        let pending = db.unsynced_readings_oldest(100).unwrap();
        let ids: Vec<i64> = pending.iter().take(4).map(|r| r.id).collect();
        db.mark_readings_synced(&ids).unwrap();
        assert_eq!(db.unsynced_readings_count().unwrap(), 6);
    }

    #[test]
    fn mark_synced_chunks_large_id_lists() {
        let (_dir, db) = open_temp();
        let rows: Vec<_> = (0..2500)
            .map(|i| reading("inv-1", "p", &format!("2024-01-15T{:02}:{:02}:{:02}+00:00", i / 3600, (i / 60) % 60, i % 60), 0.0))
            .collect();
        db.insert_device_readings_batch(&rows).unwrap();

        let ids: Vec<i64> = db
            .unsynced_readings_oldest(3000)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids.len(), 2500);
        db.mark_readings_synced(&ids).unwrap();
        assert_eq!(db.unsynced_readings_count().unwrap(), 0);
    }

    #[test]
    fn alarm_dedup_and_resolution() {
        let (_dir, db) = open_temp();
        let alarm = AlarmRow {
            alarm_uuid: "u-1".into(),
            site_id: "site-1".into(),
            alarm_type: "HIGH_TEMP".into(),
            device_id: Some("inv-1".into()),
            message: "too hot".into(),
            severity: "major".into(),
            timestamp: Utc::now().to_rfc3339(),
            ..Default::default()
        };
        db.insert_alarm(&alarm).unwrap();

        assert!(db
            .has_unresolved_alarm("site-1", "HIGH_TEMP", Some("inv-1"))
            .unwrap());
        assert!(!db
            .has_unresolved_alarm("site-1", "HIGH_TEMP", Some("inv-2"))
            .unwrap());

        let resolved = db
            .resolve_alarms_by_type("HIGH_TEMP", Some("inv-1"))
            .unwrap();
        assert_eq!(resolved, 1);
        assert!(!db
            .has_unresolved_alarm("site-1", "HIGH_TEMP", Some("inv-1"))
            .unwrap());
    }

    #[test]
    fn cloud_resolution_does_not_touch_newer_alarms() {
        let (_dir, db) = open_temp();
        let alarm = AlarmRow {
            alarm_uuid: "u-2".into(),
            site_id: "site-1".into(),
            alarm_type: "UI_ALARM".into(),
            message: "m".into(),
            severity: "warning".into(),
            timestamp: Utc::now().to_rfc3339(),
            ..Default::default()
        };
        db.insert_alarm(&alarm).unwrap();

        // Resolution stamped before the row was created: no effect.
        let old = (Utc::now() - ChronoDuration::hours(2)).to_rfc3339();
        assert_eq!(
            db.sync_alarm_resolution("site-1", "UI_ALARM", None, &old)
                .unwrap(),
            0
        );

        let now = (Utc::now() + ChronoDuration::seconds(5)).to_rfc3339();
        assert_eq!(
            db.sync_alarm_resolution("site-1", "UI_ALARM", None, &now)
                .unwrap(),
            1
        );
    }

    #[test]
    fn retention_only_deletes_synced_rows() {
        let (_dir, db) = open_temp();
        let old_ts = (Utc::now() - ChronoDuration::days(30)).to_rfc3339();
        let rows = vec![
            reading("inv-1", "p", &old_ts, 1.0),
            reading("inv-2", "p", &old_ts, 2.0),
        ];
        db.insert_device_readings_batch(&rows).unwrap();

        // Nothing synced yet: retention must not remove the rows.
        assert_eq!(db.cleanup_old_data(7).unwrap(), 0);
        assert_eq!(db.unsynced_readings_count().unwrap(), 2);

        let ids: Vec<i64> = db
            .unsynced_readings_oldest(10)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        db.mark_readings_synced(&ids).unwrap();
        assert_eq!(db.cleanup_old_data(7).unwrap(), 2);
        assert_eq!(db.stats().unwrap().total_device_readings, 0);
    }

    #[test]
    fn control_log_round_trip() {
        let (_dir, db) = open_temp();
        let row = ControlLogRow {
            timestamp: "2024-01-15T10:00:00+00:00".into(),
            site_id: "site-1".into(),
            total_load_kw: 60.0,
            load_min: 55.0,
            load_max: 65.0,
            solar_output_kw: 20.0,
            solar_min: 18.0,
            solar_max: 22.0,
            dg_power_kw: 40.0,
            solar_limit_pct: 50.0,
            solar_limit_kw: 50.0,
            safe_mode_active: false,
            config_mode: "full_system".into(),
            operation_mode: "zero_generator_feed".into(),
            load_meters_online: 1,
            inverters_online: 1,
            generators_online: 1,
            execution_time_ms: 3.2,
            device_readings_json: None,
        };
        db.insert_control_log(&row).unwrap();

        let pending = db.unsynced_control_logs(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.solar_limit_pct, 50.0);

        db.mark_control_logs_synced(&[pending[0].0]).unwrap();
        assert!(db.unsynced_control_logs(10).unwrap().is_empty());
    }
}
