//! Shared SQLite connection tuning
//!
//! Every connection that touches the stream, snapshot or dead-letter tables
//! goes through here so readers and the single writer agree on WAL mode.

use rusqlite::Connection;

/// Apply WAL + relaxed sync PRAGMAs to a connection.
///
/// `journal_mode` returns a row, so it goes through `pragma_update_and_check`.
pub fn apply_optimized_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16_000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}
