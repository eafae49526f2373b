//! Store traits and the SQLite implementation
//!
//! Tables (see `/sql/` directory):
//! - `readings` - INSERT (append-only accepted measurements)
//! - `alerts` - INSERT, UPDATE is_read, DELETE on clear
//! - `user_settings` / `meter_settings` - DELETE then INSERT, never patched
//!
//! Each call is atomic from the pipeline's point of view: the connection
//! mutex is held for the whole statement (or transaction) and never across
//! an `.await`.

use super::types::{Alert, AlertSeverity, CostBreakdown, Measurement, Phase};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub type StoreResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Schema compiled into the binary, same files as `/sql/`
const EMBEDDED_SCHEMA: [(&str, &str); 3] = [
    ("01_readings.sql", include_str!("../../sql/01_readings.sql")),
    ("02_alerts.sql", include_str!("../../sql/02_alerts.sql")),
    ("03_user_settings.sql", include_str!("../../sql/03_user_settings.sql")),
];

/// Append-only persistence of accepted measurements
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Insert a measurement, returning its row id
    async fn append_measurement(&self, measurement: &Measurement) -> StoreResult<i64>;

    /// Stored delta text of the `limit` newest measurements, most-recent-first
    ///
    /// Entries are returned unparsed; the duplicate filter decides what is
    /// malformed.
    async fn recent_deltas(&self, limit: usize) -> StoreResult<Vec<String>>;

    /// Full records of the `limit` newest measurements, most-recent-first
    async fn recent_measurements(&self, limit: usize) -> StoreResult<Vec<Measurement>>;

    /// Delete every measurement, returning how many were removed
    async fn clear_measurements(&self) -> StoreResult<usize>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn append_alert(
        &self,
        message: &str,
        severity: AlertSeverity,
        timestamp: &str,
    ) -> StoreResult<i64>;

    /// All alerts, newest first
    async fn list_alerts(&self) -> StoreResult<Vec<Alert>>;

    /// Returns false when no such alert exists
    async fn mark_alert_read(&self, id: i64) -> StoreResult<bool>;

    async fn clear_alerts(&self) -> StoreResult<usize>;
}

/// Daily limit and phase selector
///
/// Replacing a value is a delete-then-insert inside one transaction.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn daily_limit(&self) -> StoreResult<Option<f64>>;

    async fn replace_daily_limit(&self, limit: f64) -> StoreResult<()>;

    async fn clear_daily_limit(&self) -> StoreResult<()>;

    /// Active phase, `Phase::Single` when never set
    async fn phase(&self) -> StoreResult<Phase>;

    async fn replace_phase(&self, phase: Phase) -> StoreResult<()>;
}

/// Apply `.sql` files from `schema_dir`, in filename order
///
/// Files must be idempotent (`IF NOT EXISTS`). Switches the database to WAL
/// first. Returns how many files were applied.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> StoreResult<usize> {
    let dir = Path::new(schema_dir);
    if !dir.is_dir() {
        return Err(format!("Schema directory not found: {}", schema_dir).into());
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut paths: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        files.push((name, fs::read_to_string(path)?));
    }

    apply_schema(conn, schema_dir, files.iter().map(|(n, sql)| (n.as_str(), sql.as_str())))
}

/// Apply the schema compiled into the crate
pub fn apply_embedded_schema(conn: &Connection) -> StoreResult<usize> {
    apply_schema(conn, "embedded", EMBEDDED_SCHEMA.iter().copied())
}

fn apply_schema<'a>(
    conn: &Connection,
    source: &str,
    files: impl Iterator<Item = (&'a str, &'a str)>,
) -> StoreResult<usize> {
    log::info!("🔧 Applying schema from: {}", source);

    let mut applied = 0;
    for (name, sql) in files {
        conn.execute_batch(sql)
            .map_err(|e| format!("schema file {} failed: {}", name, e))?;
        log::info!("   ├─ ✅ {}", name);
        applied += 1;
    }

    log::info!("   └─ {} schema files applied", applied);
    Ok(applied)
}

/// SQLite implementation of every store trait
///
/// Settings and alerts are scoped to `user_id`; readings are global.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    user_id: String,
}

impl SqliteStore {
    /// Open an existing database
    ///
    /// Does NOT create the schema; run [`run_schema_migrations`] or
    /// [`apply_embedded_schema`] first.
    pub fn open(db_path: &str, user_id: &str) -> StoreResult<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self::from_connection(conn, user_id))
    }

    pub fn from_connection(conn: Connection, user_id: &str) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            user_id: user_id.to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| "sqlite connection mutex poisoned".into())
    }
}

fn measurement_from_row(row: &Row<'_>) -> rusqlite::Result<Measurement> {
    let total: f64 = row.get(10)?;
    Ok(Measurement {
        id: Some(row.get(0)?),
        detection_label: row.get(1)?,
        delta: row.get(2)?,
        timestamp: row.get(3)?,
        frame_ref: row.get(4)?,
        cost: total,
        cost_breakdown: CostBreakdown {
            fixed_charge: row.get(5)?,
            energy_charge: row.get(6)?,
            tod_charge: row.get(7)?,
            duty: row.get(8)?,
            subsidy: row.get(9)?,
            total,
        },
    })
}

#[async_trait]
impl MeasurementStore for SqliteStore {
    async fn append_measurement(&self, measurement: &Measurement) -> StoreResult<i64> {
        let conn = self.lock()?;
        let b = &measurement.cost_breakdown;

        conn.execute(
            r#"
            INSERT INTO readings (
                reading, delta, timestamp, frame_ref,
                fixed_charge, energy_charge, tod_charge, duty, subsidy, total_amount
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            rusqlite::params![
                measurement.detection_label,
                measurement.delta,
                measurement.timestamp,
                measurement.frame_ref,
                b.fixed_charge,
                b.energy_charge,
                b.tod_charge,
                b.duty,
                b.subsidy,
                measurement.cost,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    async fn recent_deltas(&self, limit: usize) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT reading FROM readings ORDER BY id DESC LIMIT ?")?;

        let rows = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn recent_measurements(&self, limit: usize) -> StoreResult<Vec<Measurement>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, reading, delta, timestamp, frame_ref,
                   fixed_charge, energy_charge, tod_charge, duty, subsidy, total_amount
            FROM readings
            ORDER BY id DESC
            LIMIT ?
            "#,
        )?;

        let rows = stmt
            .query_map([limit as i64], measurement_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn clear_measurements(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM readings", [])?;
        log::info!("✅ Cleared {} meter readings from database", removed);
        Ok(removed)
    }
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn append_alert(
        &self,
        message: &str,
        severity: AlertSeverity,
        timestamp: &str,
    ) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alerts (user_id, message, type, timestamp) VALUES (?, ?, ?, ?)",
            rusqlite::params![self.user_id, message, severity.as_str(), timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_alerts(&self) -> StoreResult<Vec<Alert>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, message, type, timestamp, is_read FROM alerts WHERE user_id = ? ORDER BY id DESC",
        )?;

        let rows = stmt
            .query_map([&self.user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut alerts = Vec::with_capacity(rows.len());
        for (id, message, kind, timestamp, is_read) in rows {
            let Some(severity) = AlertSeverity::parse(&kind) else {
                log::warn!("⚠️  Skipping alert {} with unknown type '{}'", id, kind);
                continue;
            };
            alerts.push(Alert {
                id,
                message,
                severity,
                timestamp,
                read: is_read != 0,
            });
        }
        Ok(alerts)
    }

    async fn mark_alert_read(&self, id: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE alerts SET is_read = 1 WHERE id = ? AND user_id = ?",
            rusqlite::params![id, self.user_id],
        )?;
        Ok(updated > 0)
    }

    async fn clear_alerts(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM alerts WHERE user_id = ?", [&self.user_id])?;
        Ok(removed)
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn daily_limit(&self) -> StoreResult<Option<f64>> {
        let conn = self.lock()?;
        let limit = conn
            .query_row(
                "SELECT daily_cost_limit FROM user_settings WHERE user_id = ? ORDER BY id DESC LIMIT 1",
                [&self.user_id],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(limit)
    }

    async fn replace_daily_limit(&self, limit: f64) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM user_settings WHERE user_id = ?", [&self.user_id])?;
        tx.execute(
            "INSERT INTO user_settings (user_id, daily_cost_limit) VALUES (?, ?)",
            rusqlite::params![self.user_id, limit],
        )?;

        let stored: f64 = tx.query_row(
            "SELECT daily_cost_limit FROM user_settings WHERE user_id = ?",
            [&self.user_id],
            |row| row.get(0),
        )?;
        if stored != limit {
            // Dropping `tx` rolls back
            return Err("Failed to verify cost limit was set correctly".into());
        }

        tx.commit()?;
        Ok(())
    }

    async fn clear_daily_limit(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM user_settings WHERE user_id = ?", [&self.user_id])?;
        Ok(())
    }

    async fn phase(&self) -> StoreResult<Phase> {
        let conn = self.lock()?;
        let stored = conn
            .query_row(
                "SELECT phase FROM meter_settings WHERE user_id = ? ORDER BY id DESC LIMIT 1",
                [&self.user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match stored {
            Some(raw) => Ok(raw.parse()?),
            None => Ok(Phase::default()),
        }
    }

    async fn replace_phase(&self, phase: Phase) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM meter_settings WHERE user_id = ?", [&self.user_id])?;
        tx.execute(
            "INSERT INTO meter_settings (user_id, phase) VALUES (?, ?)",
            rusqlite::params![self.user_id, phase.as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;

    /// Helper to create a test database with schema
    fn create_test_db() -> Result<(NamedTempFile, SqliteStore), Box<dyn std::error::Error + Send + Sync>> {
        let temp_file = NamedTempFile::new()?;
        let db_path = temp_file.path().to_str().ok_or("non-utf8 temp path")?;

        let conn = Connection::open(db_path)?;
        apply_embedded_schema(&conn)?;
        drop(conn); // Close connection before creating store

        let store = SqliteStore::open(db_path, "admin")?;
        Ok((temp_file, store))
    }

    fn make_measurement(delta: f64, cost: f64) -> Measurement {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
        Measurement::new(delta, cost, None, at).with_frame_ref(format!("frame@{:.1}s", delta))
    }

    #[tokio::test]
    async fn test_append_and_read_back_measurement() {
        let (_temp, store) = create_test_db().unwrap();

        let m = make_measurement(120.0, 512.4);
        let id = store.append_measurement(&m).await.unwrap();

        let rows = store.recent_measurements(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, Some(id));
        assert_eq!(rows[0].delta, 120.0);
        assert_eq!(rows[0].cost, 512.4);
        assert_eq!(rows[0].cost_breakdown.total, 512.4);
        assert_eq!(rows[0].cost_breakdown.fixed_charge, 0.0);
        assert_eq!(rows[0].detection_label, "120.00 KWh (Δ)");
        assert_eq!(rows[0].frame_ref.as_deref(), Some("frame@120.0s"));
    }

    #[tokio::test]
    async fn test_recent_deltas_newest_first_and_limited() {
        let (_temp, store) = create_test_db().unwrap();

        for delta in 1..=12 {
            store
                .append_measurement(&make_measurement(delta as f64, 0.0))
                .await
                .unwrap();
        }

        let recent = store.recent_deltas(10).await.unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0], "12.00 KWh (Δ)");
        assert_eq!(recent[9], "3.00 KWh (Δ)");
    }

    #[tokio::test]
    async fn test_clear_measurements_keeps_settings() {
        let (_temp, store) = create_test_db().unwrap();

        store.append_measurement(&make_measurement(5.0, 1.0)).await.unwrap();
        store.replace_daily_limit(100.0).await.unwrap();

        assert_eq!(store.clear_measurements().await.unwrap(), 1);
        assert!(store.recent_deltas(10).await.unwrap().is_empty());
        assert_eq!(store.daily_limit().await.unwrap(), Some(100.0));
    }

    #[tokio::test]
    async fn test_daily_limit_replaced_wholesale() {
        let (_temp, store) = create_test_db().unwrap();

        assert_eq!(store.daily_limit().await.unwrap(), None);

        store.replace_daily_limit(100.0).await.unwrap();
        store.replace_daily_limit(250.0).await.unwrap();

        assert_eq!(store.daily_limit().await.unwrap(), Some(250.0));

        let conn = store.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM user_settings WHERE user_id = ?",
                ["admin"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_clear_daily_limit() {
        let (_temp, store) = create_test_db().unwrap();
        store.replace_daily_limit(100.0).await.unwrap();
        store.clear_daily_limit().await.unwrap();
        assert_eq!(store.daily_limit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_phase_defaults_and_replaces() {
        let (_temp, store) = create_test_db().unwrap();

        assert_eq!(store.phase().await.unwrap(), Phase::Single);
        store.replace_phase(Phase::Three).await.unwrap();
        assert_eq!(store.phase().await.unwrap(), Phase::Three);
        store.replace_phase(Phase::Single).await.unwrap();
        assert_eq!(store.phase().await.unwrap(), Phase::Single);
    }

    #[tokio::test]
    async fn test_alert_lifecycle() {
        let (_temp, store) = create_test_db().unwrap();

        let first = store
            .append_alert("first", AlertSeverity::Warning, "2024-03-01T18:00:00Z")
            .await
            .unwrap();
        store
            .append_alert("second", AlertSeverity::Danger, "2024-03-01T18:00:00Z")
            .await
            .unwrap();

        let alerts = store.list_alerts().await.unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].message, "second");
        assert_eq!(alerts[0].severity, AlertSeverity::Danger);
        assert!(!alerts[1].read);

        assert!(store.mark_alert_read(first).await.unwrap());
        assert!(!store.mark_alert_read(9_999).await.unwrap());
        let alerts = store.list_alerts().await.unwrap();
        assert!(alerts[1].read);

        assert_eq!(store.clear_alerts().await.unwrap(), 2);
        assert!(store.list_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alerts_scoped_to_user() {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap();
        let conn = Connection::open(db_path).unwrap();
        apply_embedded_schema(&conn).unwrap();
        drop(conn);

        let admin = SqliteStore::open(db_path, "admin").unwrap();
        let other = SqliteStore::open(db_path, "other").unwrap();

        admin
            .append_alert("mine", AlertSeverity::Warning, "2024-03-01T18:00:00Z")
            .await
            .unwrap();

        assert!(other.list_alerts().await.unwrap().is_empty());
        assert_eq!(other.clear_alerts().await.unwrap(), 0);
        assert_eq!(admin.list_alerts().await.unwrap().len(), 1);
    }

    #[test]
    fn test_schema_migrations_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        for (name, sql) in EMBEDDED_SCHEMA {
            fs::write(dir.path().join(name), sql).unwrap();
        }
        fs::write(dir.path().join("README.txt"), "not sql").unwrap();

        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        assert_eq!(run_schema_migrations(&mut conn, dir.path().to_str().unwrap()).unwrap(), 3);
        // Idempotent
        assert_eq!(run_schema_migrations(&mut conn, dir.path().to_str().unwrap()).unwrap(), 3);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('readings', 'alerts', 'user_settings', 'meter_settings')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_missing_schema_dir_is_error() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(run_schema_migrations(&mut conn, "/definitely/not/here").is_err());
    }

    #[test]
    fn test_schema_dir_applied_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("02_index.sql"), "CREATE INDEX IF NOT EXISTS idx_sample_name ON sample(name);").unwrap();
        fs::write(dir.path().join("01_table.sql"), "CREATE TABLE IF NOT EXISTS sample (id INTEGER PRIMARY KEY, name TEXT);").unwrap();
        fs::write(dir.path().join("notes.txt"), "not sql").unwrap();

        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        let schema_dir = dir.path().to_str().unwrap();

        // Index file sorts after the table it needs
        assert_eq!(run_schema_migrations(&mut conn, schema_dir).unwrap(), 2);
        // Idempotent
        assert_eq!(run_schema_migrations(&mut conn, schema_dir).unwrap(), 2);

        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND tbl_name = 'sample'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 1);
    }
}
