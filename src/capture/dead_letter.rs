//! Dead-letter sinks for notifications that could not be normalized or published

use crate::error::{RelayError, RelayResult};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub raw_payload: String,
    pub error_reason: String,
    pub observed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(raw_payload: impl Into<String>, error_reason: impl Into<String>) -> Self {
        Self {
            raw_payload: raw_payload.into(),
            error_reason: error_reason.into(),
            observed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterBackend {
    Jsonl,
    Sqlite,
}

impl DeadLetterBackend {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Some(DeadLetterBackend::Jsonl),
            "sqlite" => Some(DeadLetterBackend::Sqlite),
            _ => None,
        }
    }
}

/// Append-only record of capture and publish failures
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> RelayResult<()>;

    async fn flush(&self) -> RelayResult<()>;

    fn backend_type(&self) -> &'static str;
}

/// Build the configured sink
pub fn open_dead_letter_sink(
    backend: DeadLetterBackend,
    path: impl AsRef<Path>,
) -> RelayResult<Arc<dyn DeadLetterSink>> {
    let sink: Arc<dyn DeadLetterSink> = match backend {
        DeadLetterBackend::Jsonl => Arc::new(JsonlDeadLetterSink::new(path, 100, 10)?),
        DeadLetterBackend::Sqlite => Arc::new(SqliteDeadLetterSink::new(path)?),
    };
    log::info!("🪦 Dead-letter backend: {}", sink.backend_type());
    Ok(sink)
}

struct JsonlState {
    file: BufWriter<File>,
    current_size: u64,
    rotation_count: u32,
}

/// JSONL sink with size-based rotation (`.jsonl.1` .. `.jsonl.N`)
pub struct JsonlDeadLetterSink {
    state: Mutex<JsonlState>,
    base_path: PathBuf,
    max_size: u64,
    max_rotations: u32,
}

impl JsonlDeadLetterSink {
    pub fn new(path: impl AsRef<Path>, max_size_mb: u64, max_rotations: u32) -> RelayResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            state: Mutex::new(JsonlState {
                file: BufWriter::new(file),
                current_size,
                rotation_count: 0,
            }),
            base_path: path.to_path_buf(),
            max_size: max_size_mb * 1024 * 1024,
            max_rotations,
        })
    }

    fn lock(&self) -> RelayResult<std::sync::MutexGuard<'_, JsonlState>> {
        self.state
            .lock()
            .map_err(|_| RelayError::TransientIo("dead-letter writer lock poisoned".to_string()))
    }

    fn rotate(&self, state: &mut JsonlState) -> RelayResult<()> {
        state.file.flush()?;

        for i in (1..self.max_rotations).rev() {
            let old_path = self.base_path.with_extension(format!("jsonl.{}", i));
            let new_path = self.base_path.with_extension(format!("jsonl.{}", i + 1));
            if old_path.exists() {
                std::fs::rename(&old_path, &new_path)?;
            }
        }

        let rotated_path = self.base_path.with_extension("jsonl.1");
        if self.base_path.exists() {
            std::fs::rename(&self.base_path, &rotated_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.base_path)?;

        state.file = BufWriter::new(file);
        state.current_size = 0;
        state.rotation_count += 1;

        log::info!("📄 Rotated dead-letter file (rotation #{})", state.rotation_count);
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> RelayResult<()> {
        let json = serde_json::to_string(&letter)?;
        let mut state = self.lock()?;
        writeln!(state.file, "{}", json)?;
        state.file.flush()?;
        state.current_size += (json.len() + 1) as u64;

        if state.current_size >= self.max_size {
            self.rotate(&mut state)?;
        }
        Ok(())
    }

    async fn flush(&self) -> RelayResult<()> {
        self.lock()?.file.flush()?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

/// `dead_letters` table sink
pub struct SqliteDeadLetterSink {
    conn: Mutex<Connection>,
}

impl SqliteDeadLetterSink {
    pub fn new(db_path: impl AsRef<Path>) -> RelayResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_payload TEXT NOT NULL,
                error_reason TEXT NOT NULL,
                observed_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Oldest first, for an operator replay tool
    pub fn list(&self, limit: usize) -> RelayResult<Vec<DeadLetter>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| RelayError::TransientIo("dead-letter db lock poisoned".to_string()))?;
        let mut stmt = conn.prepare(
            "SELECT raw_payload, error_reason, observed_at FROM dead_letters
             ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut letters = Vec::new();
        for row in rows {
            let (raw_payload, error_reason, observed_at) = row?;
            let observed_at = DateTime::parse_from_rfc3339(&observed_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| RelayError::Database(format!("bad observed_at: {}", e)))?;
            letters.push(DeadLetter {
                raw_payload,
                error_reason,
                observed_at,
            });
        }
        Ok(letters)
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> RelayResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| RelayError::TransientIo("dead-letter db lock poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO dead_letters (raw_payload, error_reason, observed_at) VALUES (?1, ?2, ?3)",
            params![
                letter.raw_payload,
                letter.error_reason,
                letter.observed_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    async fn flush(&self) -> RelayResult<()> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
