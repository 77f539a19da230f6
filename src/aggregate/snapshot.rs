//! Durable window snapshots and consumer checkpoints
//!
//! `aggregate_windows` holds one row per `(owner, kind, window_start)`, with
//! metrics, high-water marks and per-event contributions as JSON so a
//! restarted aggregator resumes exactly where it stopped.

use super::window::{AggregateWindow, WindowKey, WindowKind};
use crate::error::{RelayError, RelayResult};
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::types::{from_micros, to_micros};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const WINDOW_COLUMNS: &str = "owner_id, window_kind, window_start, window_end, utc_offset_secs, \
     metrics, last_applied, contributions, computed_at, archived";

pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

impl SqliteSnapshotStore {
    pub fn open(db_path: impl AsRef<Path>) -> RelayResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        Self::with_connection(conn)
    }

    pub fn with_connection(conn: Connection) -> RelayResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aggregate_windows (
                owner_id TEXT NOT NULL,
                window_kind TEXT NOT NULL,
                window_start TEXT NOT NULL,
                window_end TEXT NOT NULL,
                utc_offset_secs INTEGER NOT NULL,
                metrics TEXT NOT NULL,
                last_applied TEXT NOT NULL,
                contributions TEXT NOT NULL,
                computed_at INTEGER NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (owner_id, window_kind, window_start)
            );
            CREATE INDEX IF NOT EXISTS idx_aggregate_windows_end
                ON aggregate_windows (window_end);
            CREATE TABLE IF NOT EXISTS consumer_offsets (
                partition TEXT PRIMARY KEY,
                next_sequence INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS aggregate_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> RelayResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RelayError::TransientIo("snapshot store lock poisoned".to_string()))
    }

    /// Upsert windows in one transaction
    pub fn save(&self, windows: &[AggregateWindow]) -> RelayResult<usize> {
        if windows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR REPLACE INTO aggregate_windows ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                WINDOW_COLUMNS
            ))?;
            for window in windows {
                stmt.execute(params![
                    window.entity_owner_id,
                    window.window_kind.as_str(),
                    window.window_start.to_string(),
                    window.window_end.to_string(),
                    window.utc_offset_secs,
                    serde_json::to_string(&window.metrics)?,
                    serde_json::to_string(&window.last_applied)?,
                    serde_json::to_string(&window.contributions)?,
                    to_micros(window.computed_at),
                    window.archived as i64,
                ])?;
            }
        }
        tx.commit()?;
        log::debug!("💾 Saved {} window snapshots", windows.len());
        Ok(windows.len())
    }

    pub fn load(&self, key: &WindowKey) -> RelayResult<Option<AggregateWindow>> {
        let conn = self.lock()?;
        let window = conn
            .query_row(
                &format!(
                    "SELECT {} FROM aggregate_windows
                     WHERE owner_id = ?1 AND window_kind = ?2 AND window_start = ?3",
                    WINDOW_COLUMNS
                ),
                params![key.owner_id, key.kind.as_str(), key.window_start.to_string()],
                row_to_window,
            )
            .optional()?;
        Ok(window)
    }

    pub fn load_all(&self) -> RelayResult<Vec<AggregateWindow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM aggregate_windows ORDER BY owner_id, window_kind, window_start",
            WINDOW_COLUMNS
        ))?;
        let rows = stmt.query_map([], row_to_window)?;
        let mut windows = Vec::new();
        for row in rows {
            windows.push(row?);
        }
        Ok(windows)
    }

    /// Delete archived windows that started before `cutoff`
    pub fn delete_archived_before(&self, cutoff: NaiveDate) -> RelayResult<usize> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM aggregate_windows WHERE archived = 1 AND window_start < ?1",
            params![cutoff.to_string()],
        )?;
        Ok(deleted)
    }

    /// Windows starting before this date have been forgotten
    pub fn retention_horizon(&self) -> RelayResult<Option<NaiveDate>> {
        let conn = self.lock()?;
        let text: Option<String> = conn
            .query_row(
                "SELECT value FROM aggregate_meta WHERE key = 'retention_horizon'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            None => Ok(None),
            Some(text) => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(Some)
                .map_err(|e| RelayError::Database(format!("bad retention horizon {}: {}", text, e))),
        }
    }

    pub fn save_retention_horizon(&self, horizon: NaiveDate) -> RelayResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO aggregate_meta (key, value) VALUES ('retention_horizon', ?1)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
            params![horizon.to_string()],
        )?;
        Ok(())
    }

    pub fn clear(&self) -> RelayResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM aggregate_windows; DELETE FROM consumer_offsets;")?;
        Ok(())
    }

    /// Next sequence the consumer of `partition` should read
    pub fn consumer_offset(&self, partition: &str) -> RelayResult<u64> {
        let conn = self.lock()?;
        let offset: Option<i64> = conn
            .query_row(
                "SELECT next_sequence FROM consumer_offsets WHERE partition = ?1",
                params![partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.unwrap_or(0) as u64)
    }

    pub fn save_consumer_offset(&self, partition: &str, next_sequence: u64) -> RelayResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO consumer_offsets (partition, next_sequence) VALUES (?1, ?2)
             ON CONFLICT(partition) DO UPDATE SET next_sequence = excluded.next_sequence",
            params![partition, next_sequence as i64],
        )?;
        Ok(())
    }
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let text: String = row.get(index)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(index, e.to_string()))
}

fn date_column(row: &Row<'_>, index: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(index)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d").map_err(|e| conversion_error(index, e.to_string()))
}

fn row_to_window(row: &Row<'_>) -> rusqlite::Result<AggregateWindow> {
    let kind_text: String = row.get(1)?;
    let window_kind = WindowKind::from_str(&kind_text)
        .ok_or_else(|| conversion_error(1, format!("unknown window kind {}", kind_text)))?;
    let computed_at = from_micros(row.get(8)?)
        .ok_or_else(|| conversion_error(8, "computed_at out of range".to_string()))?;

    Ok(AggregateWindow {
        entity_owner_id: row.get(0)?,
        window_kind,
        window_start: date_column(row, 2)?,
        window_end: date_column(row, 3)?,
        utc_offset_secs: row.get(4)?,
        metrics: json_column(row, 5)?,
        last_applied: json_column(row, 6)?,
        contributions: json_column(row, 7)?,
        computed_at,
        archived: row.get::<_, i64>(9)? != 0,
    })
}
