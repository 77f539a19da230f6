//! Durable, partitioned, append-only event stream on SQLite
//!
//! Layout:
//! - `stream_entries`: one row per published event, keyed by `(partition, sequence)`
//! - `partition_heads`: next sequence per partition; survives retention purges
//!   so sequences are never reused
//!
//! Each partition has exactly one writer. The writer remembers the head it
//! expects to find and halts the partition if storage disagrees.

use crate::error::{RelayError, RelayResult};
use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::types::{from_micros, to_micros, ChangeEvent, Operation, Payload, StreamEntry};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};

pub const DEFAULT_PARTITION: &str = "events";
const PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionStrategy {
    /// Everything in one totally ordered partition
    Single,
    /// One partition per entity type.
    ///
    /// Assumes a row never changes entity type: an UPDATE that did would
    /// land in another partition than its INSERT, and the two could be
    /// folded out of order.
    EntityType,
}

impl PartitionStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Some(PartitionStrategy::Single),
            "entity_type" | "entity-type" => Some(PartitionStrategy::EntityType),
            _ => None,
        }
    }

    pub fn partition_for(&self, event: &ChangeEvent) -> String {
        match self {
            PartitionStrategy::Single => DEFAULT_PARTITION.to_string(),
            PartitionStrategy::EntityType => event.entity_type.clone(),
        }
    }
}

/// Where a published event ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Appended(u64),
    /// Same `(id, content_hash)` was already in the stream within the retry window
    AlreadyPublished(u64),
}

impl Published {
    pub fn sequence(&self) -> u64 {
        match self {
            Published::Appended(sequence) | Published::AlreadyPublished(sequence) => *sequence,
        }
    }
}

#[async_trait]
pub trait StreamPublisher: Send + Sync {
    /// Append `event`.
    ///
    /// Republishing the same `(id, content_hash)` within the retry window
    /// returns the original sequence instead of appending again.
    async fn publish(&self, event: &ChangeEvent) -> RelayResult<Published>;

    fn partition_for(&self, event: &ChangeEvent) -> String;
}

pub struct SqliteEventStream {
    conn: Arc<Mutex<Connection>>,
    strategy: PartitionStrategy,
    retry_window: Duration,
    /// Head each partition writer expects to find in storage
    expected_heads: Mutex<HashMap<String, u64>>,
    halted: Mutex<HashMap<String, String>>,
    published: Arc<Notify>,
}

impl SqliteEventStream {
    pub fn open(
        db_path: impl AsRef<Path>,
        strategy: PartitionStrategy,
        retry_window: Duration,
    ) -> RelayResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        log::info!("✅ Event stream opened: {}", db_path.display());
        Self::with_connection(conn, strategy, retry_window)
    }

    pub fn with_connection(
        conn: Connection,
        strategy: PartitionStrategy,
        retry_window: Duration,
    ) -> RelayResult<Self> {
        create_stream_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            strategy,
            retry_window,
            expected_heads: Mutex::new(HashMap::new()),
            halted: Mutex::new(HashMap::new()),
            published: Arc::new(Notify::new()),
        })
    }

    fn lock_conn(&self) -> RelayResult<MutexGuard<'_, Connection>> {
        lock_shared(&self.conn)
    }

    pub fn strategy(&self) -> &PartitionStrategy {
        &self.strategy
    }

    /// Next sequence `partition` will assign
    pub fn head(&self, partition: &str) -> RelayResult<u64> {
        let conn = self.lock_conn()?;
        stored_head(&conn, partition)
    }

    pub fn partitions(&self) -> RelayResult<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT partition FROM partition_heads ORDER BY partition")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut partitions = Vec::new();
        for row in rows {
            partitions.push(row?);
        }
        Ok(partitions)
    }

    /// Snapshot read of `[sequence, head)` for one partition
    pub fn read_from(&self, partition: &str, sequence: u64) -> RelayResult<StreamCursor> {
        let upper = self.head(partition)?;
        Ok(StreamCursor {
            conn: Arc::clone(&self.conn),
            partition: partition.to_string(),
            next: sequence,
            upper: Some(upper),
            page: VecDeque::new(),
            failed: false,
        })
    }

    /// Up to `limit` entries at or after `sequence`, no upper bound
    pub fn read_batch(&self, partition: &str, sequence: u64, limit: usize) -> RelayResult<Vec<StreamEntry>> {
        let conn = self.lock_conn()?;
        read_page(&conn, partition, sequence, None, limit)
    }

    /// Every retained entry of every partition, partition by partition
    pub fn replay_all(&self) -> RelayResult<Vec<StreamEntry>> {
        let mut entries = Vec::new();
        for partition in self.partitions()? {
            for entry in self.read_from(&partition, 0)? {
                entries.push(entry?);
            }
        }
        Ok(entries)
    }

    /// Live read: delivers entries from `sequence` onward and keeps following
    /// new publishes until `shutdown` is set and the partition is drained.
    pub fn tail(
        self: &Arc<Self>,
        partition: &str,
        sequence: u64,
        poll_interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> mpsc::Receiver<StreamEntry> {
        let (tx, rx) = mpsc::channel(PAGE_SIZE);
        let stream = Arc::clone(self);
        let partition = partition.to_string();
        let notify = Arc::clone(&self.published);

        tokio::spawn(async move {
            let mut next = sequence;
            loop {
                let wake = notify.notified();
                tokio::pin!(wake);
                wake.as_mut().enable();

                let batch = match stream.read_batch(&partition, next, PAGE_SIZE) {
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("⚠️  Tail read failed on {}: {}", partition, e);
                        Vec::new()
                    }
                };

                if !batch.is_empty() {
                    for entry in batch {
                        next = entry.sequence + 1;
                        if tx.send(entry).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }

                if *shutdown.borrow() {
                    log::debug!("Tail on {} drained at sequence {}", partition, next);
                    return;
                }

                tokio::select! {
                    _ = &mut wake => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }

    /// Delete entries published before `cutoff`. Heads are untouched.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> RelayResult<usize> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM stream_entries WHERE published_at < ?1",
            params![to_micros(cutoff)],
        )?;
        if deleted > 0 {
            log::info!("🧹 Purged {} stream entries older than {}", deleted, cutoff);
        }
        Ok(deleted)
    }

    /// Entries published at or after `since`, for warming the deduplicator
    pub fn recent_since(&self, since: DateTime<Utc>) -> RelayResult<Vec<StreamEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM stream_entries WHERE published_at >= ?1 ORDER BY published_at, partition, sequence",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![to_micros(since)], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn halt_partition(&self, partition: &str, reason: String) {
        log::error!("🛑 Partition {} halted: {}", partition, reason);
        if let Ok(mut halted) = self.halted.lock() {
            halted.insert(partition.to_string(), reason);
        }
    }

    pub fn is_halted(&self, partition: &str) -> bool {
        self.halted
            .lock()
            .map(|h| h.contains_key(partition))
            .unwrap_or(true)
    }

    pub fn halted_partitions(&self) -> Vec<(String, String)> {
        self.halted
            .lock()
            .map(|h| h.iter().map(|(p, r)| (p.clone(), r.clone())).collect())
            .unwrap_or_default()
    }

    /// Operator action after repairing storage: forget the halt and re-adopt
    /// the stored head
    pub fn resume_partition(&self, partition: &str) -> RelayResult<()> {
        let mut halted = self
            .halted
            .lock()
            .map_err(|_| RelayError::TransientIo("halt registry lock poisoned".to_string()))?;
        let mut heads = self
            .expected_heads
            .lock()
            .map_err(|_| RelayError::TransientIo("head registry lock poisoned".to_string()))?;
        halted.remove(partition);
        heads.remove(partition);
        log::info!("▶️  Partition {} resumed", partition);
        Ok(())
    }

    fn append(&self, partition: &str, event: &ChangeEvent) -> RelayResult<Published> {
        if self.is_halted(partition) {
            return Err(RelayError::PartitionHalted(partition.to_string()));
        }

        let now = Utc::now();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT sequence FROM stream_entries
                 WHERE partition = ?1 AND event_id = ?2 AND content_hash = ?3 AND published_at >= ?4
                 ORDER BY sequence DESC LIMIT 1",
                params![
                    partition,
                    event.id,
                    event.content_hash,
                    to_micros(now - self.retry_window)
                ],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(sequence) = existing {
            log::debug!(
                "↩️  {} {} already published at {}#{}",
                event.operation.as_str(),
                event.id,
                partition,
                sequence
            );
            return Ok(Published::AlreadyPublished(sequence as u64));
        }

        let head = stored_head(&tx, partition)?;
        let max_stored: Option<i64> = tx.query_row(
            "SELECT MAX(sequence) FROM stream_entries WHERE partition = ?1",
            params![partition],
            |row| row.get(0),
        )?;
        let expected = self
            .expected_heads
            .lock()
            .map_err(|_| RelayError::TransientIo("head registry lock poisoned".to_string()))?
            .get(partition)
            .copied();

        let found = match max_stored {
            Some(max) if (max as u64) >= head => max as u64 + 1,
            _ => head,
        };
        let expected = expected.unwrap_or(head);
        if found != expected || head != expected {
            drop(tx);
            drop(conn);
            let violation = RelayError::OrderingViolation {
                partition: partition.to_string(),
                expected,
                found,
            };
            self.halt_partition(partition, violation.to_string());
            return Err(violation);
        }

        tx.execute(
            "INSERT INTO stream_entries
                (partition, sequence, event_id, content_hash, source_table, operation,
                 entity_type, owner_id, payload, observed_at, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                partition,
                head as i64,
                event.id,
                event.content_hash,
                event.source_table,
                event.operation.as_str(),
                event.entity_type,
                event.entity_owner_id,
                serde_json::to_string(&event.payload)?,
                to_micros(event.observed_at),
                to_micros(now),
            ],
        )?;
        tx.execute(
            "INSERT INTO partition_heads (partition, next_sequence) VALUES (?1, ?2)
             ON CONFLICT(partition) DO UPDATE SET next_sequence = excluded.next_sequence",
            params![partition, (head + 1) as i64],
        )?;
        tx.commit()?;
        drop(conn);

        if let Ok(mut heads) = self.expected_heads.lock() {
            heads.insert(partition.to_string(), head + 1);
        }
        self.published.notify_waiters();
        Ok(Published::Appended(head))
    }
}

#[async_trait]
impl StreamPublisher for SqliteEventStream {
    async fn publish(&self, event: &ChangeEvent) -> RelayResult<Published> {
        let partition = self.strategy.partition_for(event);
        self.append(&partition, event)
    }

    fn partition_for(&self, event: &ChangeEvent) -> String {
        self.strategy.partition_for(event)
    }
}

/// Finite, lazily paged read over `[next, upper)`
pub struct StreamCursor {
    conn: Arc<Mutex<Connection>>,
    partition: String,
    next: u64,
    upper: Option<u64>,
    page: VecDeque<StreamEntry>,
    failed: bool,
}

impl Iterator for StreamCursor {
    type Item = RelayResult<StreamEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.page.is_empty() {
            if self.upper.is_some_and(|upper| self.next >= upper) {
                return None;
            }
            let page = lock_shared(&self.conn).and_then(|conn| {
                read_page(&conn, &self.partition, self.next, self.upper, PAGE_SIZE)
            });
            match page {
                Ok(page) => self.page.extend(page),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.page.pop_front()?;
        self.next = entry.sequence + 1;
        Some(Ok(entry))
    }
}

fn lock_shared(conn: &Arc<Mutex<Connection>>) -> RelayResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| RelayError::TransientIo("stream connection lock poisoned".to_string()))
}

pub fn create_stream_tables(conn: &Connection) -> RelayResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stream_entries (
            partition TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            event_id TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            source_table TEXT NOT NULL,
            operation TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            observed_at INTEGER NOT NULL,
            published_at INTEGER NOT NULL,
            PRIMARY KEY (partition, sequence)
        );
        CREATE INDEX IF NOT EXISTS idx_stream_entries_event
            ON stream_entries (partition, event_id, content_hash);
        CREATE INDEX IF NOT EXISTS idx_stream_entries_published
            ON stream_entries (published_at);
        CREATE TABLE IF NOT EXISTS partition_heads (
            partition TEXT PRIMARY KEY,
            next_sequence INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn stored_head(conn: &Connection, partition: &str) -> RelayResult<u64> {
    let head: Option<i64> = conn
        .query_row(
            "SELECT next_sequence FROM partition_heads WHERE partition = ?1",
            params![partition],
            |row| row.get(0),
        )
        .optional()?;
    Ok(head.unwrap_or(0) as u64)
}

const ENTRY_COLUMNS: &str = "partition, sequence, event_id, content_hash, source_table, operation, \
     entity_type, owner_id, payload, observed_at, published_at";

fn read_page(
    conn: &Connection,
    partition: &str,
    from: u64,
    upper: Option<u64>,
    limit: usize,
) -> RelayResult<Vec<StreamEntry>> {
    let upper = upper.map(|u| u as i64).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM stream_entries
         WHERE partition = ?1 AND sequence >= ?2 AND sequence < ?3
         ORDER BY sequence ASC
         LIMIT ?4",
        ENTRY_COLUMNS
    ))?;
    let rows = stmt.query_map(
        params![partition, from as i64, upper, limit as i64],
        row_to_entry,
    )?;

    let mut entries = Vec::with_capacity(limit.min(PAGE_SIZE));
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<StreamEntry> {
    let operation_text: String = row.get(5)?;
    let operation = Operation::from_str(&operation_text)
        .ok_or_else(|| conversion_error(5, format!("unknown operation {}", operation_text)))?;
    let payload_text: String = row.get(8)?;
    let payload: Payload = serde_json::from_str(&payload_text)
        .map_err(|e| conversion_error(8, format!("bad payload: {}", e)))?;
    let observed_at = from_micros(row.get(9)?)
        .ok_or_else(|| conversion_error(9, "observed_at out of range".to_string()))?;
    let published_at = from_micros(row.get(10)?)
        .ok_or_else(|| conversion_error(10, "published_at out of range".to_string()))?;

    Ok(StreamEntry {
        partition: row.get(0)?,
        sequence: row.get::<_, i64>(1)? as u64,
        published_at,
        event: ChangeEvent {
            id: row.get(2)?,
            content_hash: row.get(3)?,
            source_table: row.get(4)?,
            operation,
            entity_type: row.get(6)?,
            entity_owner_id: row.get(7)?,
            payload,
            observed_at,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;
    use tempfile::tempdir;

    fn event(id: &str, entity_type: &str, amount: i64) -> ChangeEvent {
        let mut payload = Payload::new();
        payload.insert("amount".to_string(), Scalar::Int(amount));
        // Whole seconds: storage keeps microseconds
        let observed_at = DateTime::from_timestamp(1_744_531_200, 0).unwrap();
        ChangeEvent::new(id, Operation::Insert, entity_type, "b1", payload, observed_at)
    }

    fn memory_stream(strategy: PartitionStrategy) -> SqliteEventStream {
        SqliteEventStream::with_connection(
            Connection::open_in_memory().unwrap(),
            strategy,
            Duration::seconds(600),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sequences_are_gap_free_per_partition() {
        let stream = memory_stream(PartitionStrategy::EntityType);
        for i in 0..5 {
            let seq = stream.publish(&event(&format!("f{}", i), "feeding", i)).await.unwrap().sequence();
            assert_eq!(seq, i as u64);
        }
        assert_eq!(stream.publish(&event("s0", "sleep", 1)).await.unwrap().sequence(), 0);

        let seqs: Vec<u64> = stream
            .read_from("feeding", 0)
            .unwrap()
            .map(|e| e.unwrap().sequence)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        assert_eq!(stream.partitions().unwrap(), vec!["feeding", "sleep"]);
    }

    #[tokio::test]
    async fn test_republish_returns_original_sequence() {
        let stream = memory_stream(PartitionStrategy::Single);
        let e = event("A", "feeding", 100);
        assert_eq!(stream.publish(&e).await.unwrap(), Published::Appended(0));
        assert_eq!(stream.publish(&event("B", "feeding", 50)).await.unwrap(), Published::Appended(1));
        assert_eq!(stream.publish(&e).await.unwrap(), Published::AlreadyPublished(0));
        assert_eq!(stream.head(DEFAULT_PARTITION).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_entries_round_trip_through_storage() {
        let stream = memory_stream(PartitionStrategy::Single);
        let e = event("A", "feeding", 100).with_source_table("public.baby_logs");
        stream.publish(&e).await.unwrap();

        let entry = stream.read_from(DEFAULT_PARTITION, 0).unwrap().next().unwrap().unwrap();
        assert_eq!(entry.event, e);
        assert_eq!(entry.partition, DEFAULT_PARTITION);
    }

    #[tokio::test]
    async fn test_read_from_is_a_snapshot() {
        let stream = memory_stream(PartitionStrategy::Single);
        stream.publish(&event("A", "feeding", 1)).await.unwrap();
        let cursor = stream.read_from(DEFAULT_PARTITION, 0).unwrap();
        stream.publish(&event("B", "feeding", 2)).await.unwrap();

        assert_eq!(cursor.count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_writer_halts_partition() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("stream.db");
        let stream =
            SqliteEventStream::open(&db_path, PartitionStrategy::Single, Duration::seconds(600))
                .unwrap();
        stream.publish(&event("A", "feeding", 1)).await.unwrap();

        // A second writer appends behind our back
        let rogue =
            SqliteEventStream::open(&db_path, PartitionStrategy::Single, Duration::seconds(600))
                .unwrap();
        rogue.publish(&event("B", "feeding", 2)).await.unwrap();

        match stream.publish(&event("C", "feeding", 3)).await {
            Err(RelayError::OrderingViolation {
                expected, found, ..
            }) => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected ordering violation, got {:?}", other),
        }
        assert!(matches!(
            stream.publish(&event("D", "feeding", 4)).await,
            Err(RelayError::PartitionHalted(_))
        ));

        stream.resume_partition(DEFAULT_PARTITION).unwrap();
        assert_eq!(stream.publish(&event("D", "feeding", 4)).await.unwrap().sequence(), 2);
    }

    #[tokio::test]
    async fn test_purge_keeps_heads() {
        let stream = memory_stream(PartitionStrategy::Single);
        stream.publish(&event("A", "feeding", 1)).await.unwrap();
        stream.publish(&event("B", "feeding", 2)).await.unwrap();

        let purged = stream
            .purge_older_than(Utc::now() + Duration::seconds(1))
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(stream.publish(&event("C", "feeding", 3)).await.unwrap().sequence(), 2);
        assert_eq!(stream.recent_since(Utc::now() - Duration::seconds(60)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_entity_type_routes_by_type_not_owner() {
        let stream = memory_stream(PartitionStrategy::EntityType);
        let insert = event("A", "feeding", 100);
        let mut retyped = event("A", "sleep", 100);
        retyped.operation = Operation::Update;

        // Same row, different type: separate partitions, no shared order
        assert_eq!(stream.partition_for(&insert), "feeding");
        assert_eq!(stream.partition_for(&retyped), "sleep");
        assert_eq!(stream.publish(&insert).await.unwrap(), Published::Appended(0));
        assert_eq!(stream.publish(&retyped).await.unwrap(), Published::Appended(0));
        assert_eq!(
            memory_stream(PartitionStrategy::Single).partition_for(&retyped),
            DEFAULT_PARTITION
        );
    }

    #[tokio::test]
    async fn test_tail_follows_new_publishes() {
        let stream = Arc::new(memory_stream(PartitionStrategy::Single));
        stream.publish(&event("A", "feeding", 1)).await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut rx = stream.tail(
            DEFAULT_PARTITION,
            0,
            std::time::Duration::from_millis(20),
            shutdown_rx,
        );
        assert_eq!(rx.recv().await.unwrap().event.id, "A");

        stream.publish(&event("B", "feeding", 2)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().event.id, "B");

        shutdown_tx.send(true).unwrap();
        assert!(rx.recv().await.is_none());
    }
}
