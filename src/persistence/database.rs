//! SQLite record store for provisioned stones

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{StoreError, StoreResult};
use crate::core::{Plan, ProvisionedService};

/// Columns of `provisioned_services` with the definition used when an older
/// table is missing them
const SERVICE_COLUMNS: &[(&str, &str)] = &[
    ("memory", "INTEGER NOT NULL DEFAULT 0"),
    ("pid", "INTEGER"),
    ("plan", "TEXT NOT NULL DEFAULT 'free'"),
    ("maglev_home", "TEXT NOT NULL DEFAULT ''"),
    ("created_at", "TEXT NOT NULL DEFAULT ''"),
];

/// One entry of an instance's event history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEvent {
    pub event_type: String,
    pub event_time: String,
    pub details: Option<String>,
}

/// Durable table of provisioned stones, keyed by stone name
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open a store from a connection string.
    ///
    /// Accepts `sqlite:<path>`, `sqlite3:<path>` (with or without `//`),
    /// a bare path, or `:memory:`.
    pub fn open(connection_string: &str) -> StoreResult<Self> {
        match Self::parse_connection_string(connection_string)? {
            None => Self::open_in_memory(),
            Some(path) => Self::open_path(&path),
        }
    }

    /// Open (or create) a store backed by a file
    pub fn open_path(path: &Path) -> StoreResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|source| StoreError::Open {
            path: path.display().to_string(),
            source,
        })?;

        // WAL keeps the file consistent if the node dies mid-write
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Record store opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an ephemeral in-memory store
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: ":memory:".to_string(),
            source,
        })?;
        debug!("In-memory record store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `None` means in-memory
    fn parse_connection_string(s: &str) -> StoreResult<Option<PathBuf>> {
        let s = s.trim();
        let rest = ["sqlite3:", "sqlite:"]
            .iter()
            .find_map(|scheme| s.strip_prefix(scheme))
            .map(|rest| rest.strip_prefix("//").unwrap_or(rest))
            .unwrap_or(s);

        if rest.is_empty() {
            return Err(StoreError::ConnectionString(s.to_string()));
        }
        if rest == ":memory:" {
            return Ok(None);
        }
        if rest.contains("://") {
            return Err(StoreError::ConnectionString(s.to_string()));
        }
        Ok(Some(PathBuf::from(rest)))
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Create missing tables and add columns missing from older tables
    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS provisioned_services (
                name TEXT PRIMARY KEY,
                memory INTEGER NOT NULL,
                pid INTEGER,
                plan TEXT NOT NULL,
                maglev_home TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_instance_history_name
                ON instance_history (instance_name);
            "#,
        )?;

        let existing = Self::column_names(&conn, "provisioned_services")?;
        for (column, definition) in SERVICE_COLUMNS {
            if !existing.iter().any(|c| c == column) {
                conn.execute_batch(&format!(
                    "ALTER TABLE provisioned_services ADD COLUMN {} {};",
                    column, definition
                ))?;
                info!("Added missing column provisioned_services.{}", column);
            }
        }

        info!("Record store schema initialized");
        Ok(())
    }

    fn column_names(conn: &Connection, table: &str) -> StoreResult<Vec<String>> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // === Provisioned services ===

    /// Insert or update a record
    pub fn save(&self, record: &ProvisionedService) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO provisioned_services
            (name, memory, pid, plan, maglev_home, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.name,
                record.memory,
                record.pid.map(i64::from),
                record.plan.label(),
                record.maglev_home.to_string_lossy().to_string(),
                record.created_at.to_rfc3339(),
            ],
        )?;

        debug!("Record {} saved", record.name);
        Ok(())
    }

    /// Look a record up by stone name
    pub fn get(&self, name: &str) -> StoreResult<Option<ProvisionedService>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, memory, pid, plan, maglev_home, created_at FROM provisioned_services WHERE name = ?1",
        )?;
        let raw = stmt.query_row(params![name], RawRecord::from_row).optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// Load all records
    pub fn all(&self) -> StoreResult<Vec<ProvisionedService>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, memory, pid, plan, maglev_home, created_at FROM provisioned_services ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(RawRecord::into_record).collect()
    }

    /// Load every record that decodes. Rows that do not are returned by
    /// name with the reason instead of failing the whole load.
    pub fn all_lenient(&self) -> StoreResult<(Vec<ProvisionedService>, Vec<(String, StoreError)>)> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, memory, pid, plan, maglev_home, created_at FROM provisioned_services ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], RawRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        let mut invalid = Vec::new();
        for raw in rows {
            let name = raw.name.clone();
            match raw.into_record() {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("Skipping undecodable record {}: {}", name, e);
                    invalid.push((name, e));
                }
            }
        }
        Ok((records, invalid))
    }

    /// Delete a record. Returns true if it existed.
    pub fn destroy(&self, name: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let count = conn.execute(
            "DELETE FROM provisioned_services WHERE name = ?1",
            params![name],
        )?;
        debug!("Record {} deleted (existed: {})", name, count > 0);
        Ok(count > 0)
    }

    /// Number of stored records
    pub fn count(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM provisioned_services", [], |row| {
                row.get(0)
            })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    // === History ===

    /// Record an instance event
    pub fn record_event(
        &self,
        instance_name: &str,
        event_type: &str,
        details: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_name, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![instance_name, event_type, Utc::now().to_rfc3339(), details],
        )?;
        Ok(())
    }

    /// Get an instance's history, oldest first
    pub fn history(&self, instance_name: &str) -> StoreResult<Vec<HistoryEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM instance_history WHERE instance_name = ?1 ORDER BY id",
        )?;

        let history = stmt
            .query_map(params![instance_name], |row| {
                Ok(HistoryEvent {
                    event_type: row.get(0)?,
                    event_time: row.get(1)?,
                    details: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(history)
    }

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> StoreResult<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.lock()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(i64::from(retention_days))
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}

/// Row as stored, before validation
struct RawRecord {
    name: String,
    memory: i64,
    pid: Option<i64>,
    plan: String,
    maglev_home: String,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            memory: row.get(1)?,
            pid: row.get(2)?,
            plan: row.get(3)?,
            maglev_home: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_record(self) -> StoreResult<ProvisionedService> {
        let plan: Plan = self.plan.parse().map_err(|_| StoreError::InvalidRecord {
            name: self.name.clone(),
            reason: format!("unknown plan {:?}", self.plan),
        })?;

        let pid = match self.pid {
            Some(raw) => Some(u32::try_from(raw).map_err(|_| StoreError::InvalidRecord {
                name: self.name.clone(),
                reason: format!("pid {} out of range", raw),
            })?),
            None => None,
        };

        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(ProvisionedService {
            name: self.name,
            memory: self.memory,
            plan,
            pid,
            maglev_home: PathBuf::from(self.maglev_home),
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RecordStore {
        let store = RecordStore::open(":memory:").unwrap();
        store.initialize().unwrap();
        store
    }

    fn record(pid: Option<u32>) -> ProvisionedService {
        let mut record = ProvisionedService::new(Plan::Free, "/opt/maglev");
        record.pid = pid;
        record
    }

    #[test]
    fn saved_record_reads_back_identically() {
        let store = store();
        let record = record(Some(4242));
        store.save(&record).unwrap();

        let loaded = store.get(&record.name).unwrap().unwrap();
        assert_eq!(loaded.name, record.name);
        assert_eq!(loaded.memory, 256);
        assert_eq!(loaded.plan, Plan::Free);
        assert_eq!(loaded.pid, Some(4242));
        assert_eq!(loaded.maglev_home, PathBuf::from("/opt/maglev"));
    }

    #[test]
    fn missing_record_is_none() {
        assert!(store().get("maglev-nope").unwrap().is_none());
    }

    #[test]
    fn destroy_reports_existence() {
        let store = store();
        let record = record(None);
        store.save(&record).unwrap();

        assert!(store.destroy(&record.name).unwrap());
        assert!(!store.destroy(&record.name).unwrap());
        assert!(store.get(&record.name).unwrap().is_none());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn save_replaces_existing_row() {
        let store = store();
        let mut record = record(Some(1));
        store.save(&record).unwrap();
        record.pid = Some(2);
        store.save(&record).unwrap();

        let all = store.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pid, Some(2));
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let conn = format!("sqlite:{}", dir.path().join("node.db").display());
        let record = record(Some(77));

        {
            let store = RecordStore::open(&conn).unwrap();
            store.initialize().unwrap();
            store.save(&record).unwrap();
        }

        let store = RecordStore::open(&conn).unwrap();
        store.initialize().unwrap();
        let loaded = store.get(&record.name).unwrap().unwrap();
        assert_eq!(loaded.memory, record.memory);
        assert_eq!(loaded.plan, record.plan);
        assert_eq!(loaded.maglev_home, record.maglev_home);
    }

    #[test]
    fn initialize_upgrades_older_tables() {
        let store = RecordStore::open(":memory:").unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute_batch(
                r#"
                CREATE TABLE provisioned_services (
                    name TEXT PRIMARY KEY,
                    memory INTEGER,
                    pid INTEGER,
                    plan TEXT NOT NULL,
                    maglev_home TEXT NOT NULL
                );
                INSERT INTO provisioned_services (name, memory, pid, plan, maglev_home)
                VALUES ('maglev-old', 256, NULL, 'free', '/opt/maglev');
                "#,
            )
            .unwrap();
        }

        store.initialize().unwrap();
        let loaded = store.get("maglev-old").unwrap().unwrap();
        assert_eq!(loaded.memory, 256);
        assert_eq!(loaded.pid, None);

        // new rows use the upgraded column
        store.save(&record(None)).unwrap();
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn unknown_plan_in_row_is_an_error() {
        let store = store();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO provisioned_services VALUES ('maglev-x', 256, NULL, 'gold', '/h', '')",
                [],
            )
            .unwrap();
        }
        assert!(matches!(
            store.get("maglev-x"),
            Err(StoreError::InvalidRecord { .. })
        ));
    }

    #[test]
    fn lenient_load_skips_bad_rows() {
        let store = store();
        let good = record(Some(4242));
        store.save(&good).unwrap();
        {
            let conn = store.lock().unwrap();
            conn.execute(
                "INSERT INTO provisioned_services VALUES ('maglev-gold', 256, NULL, 'gold', '/h', '')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO provisioned_services VALUES ('maglev-neg', 256, -5, 'free', '/h', '')",
                [],
            )
            .unwrap();
        }

        assert!(store.all().is_err());

        let (records, invalid) = store.all_lenient().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, good.name);
        let mut names: Vec<_> = invalid.into_iter().map(|(name, _)| name).collect();
        names.sort();
        assert_eq!(names, vec!["maglev-gold", "maglev-neg"]);
    }

    #[test]
    fn connection_strings() {
        assert_eq!(
            RecordStore::parse_connection_string("sqlite:/tmp/a.db").unwrap(),
            Some(PathBuf::from("/tmp/a.db"))
        );
        assert_eq!(
            RecordStore::parse_connection_string("sqlite3:///tmp/a.db").unwrap(),
            Some(PathBuf::from("/tmp/a.db"))
        );
        assert_eq!(
            RecordStore::parse_connection_string("sqlite::memory:").unwrap(),
            None
        );
        assert!(RecordStore::parse_connection_string("sqlite:").is_err());
        assert!(RecordStore::parse_connection_string("postgres://db/x").is_err());
    }

    #[test]
    fn history_is_kept_in_order() {
        let store = store();
        store.record_event("maglev-a", "provisioned", None).unwrap();
        store
            .record_event("maglev-a", "unprovisioned", Some("by request"))
            .unwrap();
        store.record_event("maglev-b", "provisioned", None).unwrap();

        let history = store.history("maglev-a").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, "provisioned");
        assert_eq!(history[1].details.as_deref(), Some("by request"));

        assert_eq!(store.cleanup_history(0).unwrap(), 0);
        assert_eq!(store.cleanup_history(30).unwrap(), 0);
    }
}
