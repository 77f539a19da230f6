//! Upstream change feeds
//!
//! Two flavors:
//! - `SqliteChangeFeed`: outbox table with an id cursor, resumable by offset
//! - `ChannelChangeFeed`: in-process channel with no offsets, replays a bounded
//!   backlog after a reconnect and leaves repeats to the deduplicator

use crate::error::{RelayError, RelayResult};
use crate::sqlite_pragma::apply_optimized_pragmas;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

const OUTBOX_BATCH: i64 = 500;

/// One raw notification body plus its upstream position, when the feed has one
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub position: Option<u64>,
    pub body: String,
}

#[async_trait]
pub trait ChangeFeed: Send {
    /// Next notification. `Ok(None)` means the upstream closed for good.
    async fn next(&mut self) -> RelayResult<Option<FeedItem>>;

    /// Mark everything up to `position` as handed to the relay
    fn ack(&mut self, position: u64);

    /// Last acknowledged position (the resume token)
    fn acknowledged(&self) -> Option<u64>;

    fn supports_offsets(&self) -> bool;

    /// Re-establish the subscription after a transient failure
    async fn reconnect(&mut self) -> RelayResult<()>;

    fn name(&self) -> &'static str;
}

/// Create the outbox table a source trigger writes into
pub fn create_outbox_table(conn: &Connection) -> RelayResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_notifications (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        [],
    )?;
    Ok(())
}

/// Append a raw notification to the outbox, returning its position
pub fn append_notification(conn: &Connection, body: &str) -> RelayResult<u64> {
    conn.execute("INSERT INTO change_notifications (body) VALUES (?1)", params![body])?;
    Ok(conn.last_insert_rowid() as u64)
}

/// Outbox-table feed with an id cursor
pub struct SqliteChangeFeed {
    db_path: PathBuf,
    conn: Connection,
    read_cursor: u64,
    acked: Option<u64>,
    buffer: VecDeque<FeedItem>,
    poll_interval: Duration,
}

impl SqliteChangeFeed {
    /// Open the feed, resuming after `resume_from` when given
    pub fn open(db_path: impl AsRef<Path>, resume_from: Option<u64>) -> RelayResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let conn = Self::connect(&db_path)?;

        log::info!(
            "📥 Outbox feed opened: {} (resume after id={})",
            db_path.display(),
            resume_from.unwrap_or(0)
        );

        Ok(Self {
            db_path,
            conn,
            read_cursor: resume_from.unwrap_or(0),
            acked: resume_from,
            buffer: VecDeque::new(),
            poll_interval: Duration::from_millis(250),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn connect(db_path: &Path) -> RelayResult<Connection> {
        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn)?;
        create_outbox_table(&conn)?;
        Ok(conn)
    }

    fn fill_buffer(&mut self) -> RelayResult<usize> {
        let mut stmt = self.conn.prepare(
            "SELECT id, body FROM change_notifications
             WHERE id > ?1
             ORDER BY id ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![self.read_cursor as i64, OUTBOX_BATCH], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut count = 0;
        for row in rows {
            let (id, body) = row?;
            self.read_cursor = self.read_cursor.max(id as u64);
            self.buffer.push_back(FeedItem {
                position: Some(id as u64),
                body,
            });
            count += 1;
        }

        if count > 0 {
            log::debug!("📥 Read {} notifications, cursor at id={}", count, self.read_cursor);
        }
        Ok(count)
    }
}

#[async_trait]
impl ChangeFeed for SqliteChangeFeed {
    async fn next(&mut self) -> RelayResult<Option<FeedItem>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.fill_buffer()? == 0 {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    fn ack(&mut self, position: u64) {
        self.acked = Some(self.acked.map_or(position, |a| a.max(position)));
    }

    fn acknowledged(&self) -> Option<u64> {
        self.acked
    }

    fn supports_offsets(&self) -> bool {
        true
    }

    async fn reconnect(&mut self) -> RelayResult<()> {
        self.conn = Self::connect(&self.db_path)?;
        self.buffer.clear();
        self.read_cursor = self.acked.unwrap_or(0);
        log::info!("🔄 Outbox feed reconnected, resuming after id={}", self.read_cursor);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite-outbox"
    }
}

/// What an in-process producer can push into a `ChannelChangeFeed`
#[derive(Debug, Clone)]
pub enum FeedSignal {
    Notification(String),
    /// Upstream dropped the subscription
    Disconnected(String),
}

/// In-process feed without offsets
pub struct ChannelChangeFeed {
    rx: mpsc::Receiver<FeedSignal>,
    backlog: VecDeque<String>,
    backlog_size: usize,
    replay: VecDeque<String>,
}

impl ChannelChangeFeed {
    pub fn new(rx: mpsc::Receiver<FeedSignal>, backlog_size: usize) -> Self {
        Self {
            rx,
            backlog: VecDeque::with_capacity(backlog_size),
            backlog_size,
            replay: VecDeque::new(),
        }
    }

    fn remember(&mut self, body: &str) {
        if self.backlog_size == 0 {
            return;
        }
        if self.backlog.len() == self.backlog_size {
            self.backlog.pop_front();
        }
        self.backlog.push_back(body.to_string());
    }
}

#[async_trait]
impl ChangeFeed for ChannelChangeFeed {
    async fn next(&mut self) -> RelayResult<Option<FeedItem>> {
        if let Some(body) = self.replay.pop_front() {
            return Ok(Some(FeedItem {
                position: None,
                body,
            }));
        }

        match self.rx.recv().await {
            Some(FeedSignal::Notification(body)) => {
                self.remember(&body);
                Ok(Some(FeedItem {
                    position: None,
                    body,
                }))
            }
            Some(FeedSignal::Disconnected(reason)) => Err(RelayError::TransientIo(reason)),
            None => Ok(None),
        }
    }

    fn ack(&mut self, _position: u64) {}

    fn acknowledged(&self) -> Option<u64> {
        None
    }

    fn supports_offsets(&self) -> bool {
        false
    }

    async fn reconnect(&mut self) -> RelayResult<()> {
        self.replay = self.backlog.clone();
        log::info!(
            "🔄 Channel feed reconnected, replaying {} backlog notifications",
            self.replay.len()
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_outbox_feed_reads_in_order_and_resumes() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("source.db");
        let conn = Connection::open(&db_path).unwrap();
        create_outbox_table(&conn).unwrap();
        for i in 1..=3 {
            append_notification(&conn, &format!("body-{}", i)).unwrap();
        }

        let mut feed = SqliteChangeFeed::open(&db_path, None).unwrap();
        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.body, "body-1");
        assert_eq!(first.position, Some(1));
        feed.ack(1);

        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second.body, "body-2");

        // Not acked: a reconnect must deliver body-2 again
        feed.reconnect().await.unwrap();
        let again = feed.next().await.unwrap().unwrap();
        assert_eq!(again.body, "body-2");
        assert_eq!(feed.acknowledged(), Some(1));
    }

    #[tokio::test]
    async fn test_outbox_feed_resume_token() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("source.db");
        let conn = Connection::open(&db_path).unwrap();
        create_outbox_table(&conn).unwrap();
        for i in 1..=5 {
            append_notification(&conn, &format!("body-{}", i)).unwrap();
        }

        let mut feed = SqliteChangeFeed::open(&db_path, Some(3)).unwrap();
        let item = feed.next().await.unwrap().unwrap();
        assert_eq!(item.body, "body-4");
    }

    #[tokio::test]
    async fn test_channel_feed_replays_backlog_after_disconnect() {
        let (tx, rx) = mpsc::channel(16);
        let mut feed = ChannelChangeFeed::new(rx, 2);

        for body in ["a", "b", "c"] {
            tx.send(FeedSignal::Notification(body.to_string())).await.unwrap();
        }
        tx.send(FeedSignal::Disconnected("socket reset".into())).await.unwrap();

        for expected in ["a", "b", "c"] {
            assert_eq!(feed.next().await.unwrap().unwrap().body, expected);
        }
        assert!(matches!(feed.next().await, Err(RelayError::TransientIo(_))));

        feed.reconnect().await.unwrap();
        // Backlog holds the last two deliveries
        assert_eq!(feed.next().await.unwrap().unwrap().body, "b");
        assert_eq!(feed.next().await.unwrap().unwrap().body, "c");

        drop(tx);
        assert!(feed.next().await.unwrap().is_none());
    }
}
