use super::dedup::{Admission, Deduplicator};
use super::stream::{Published, StreamPublisher};
use crate::capture::dead_letter::{DeadLetter, DeadLetterSink};
use crate::capture::error_handler::ExponentialBackoff;
use crate::error::RelayError;
use crate::types::ChangeEvent;
use chrono::Utc;
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Publish retry bounds for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            max_ms: 10_000,
            max_retries: 5,
        }
    }
}

#[derive(Clone)]
pub struct RelayContext {
    pub dedup: Arc<Mutex<Deduplicator>>,
    pub publisher: Arc<dyn StreamPublisher>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub retry: RetryPolicy,
    /// Per-partition queue depth between the router and the partition writer
    pub partition_buffer: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub published: u64,
    /// Publishes the stream answered with an existing sequence
    pub already_published: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub retries: u64,
}

impl AddAssign for RelayStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.published += other.published;
        self.already_published += other.already_published;
        self.duplicates += other.duplicates;
        self.dead_lettered += other.dead_lettered;
        self.retries += other.retries;
    }
}

/// Route captured events to one ordered writer per partition.
///
/// Runs until the capture side drops its sender, then drains every partition
/// queue and returns the combined counters.
pub async fn start_relay_ingestion(mut rx: mpsc::Receiver<ChangeEvent>, ctx: RelayContext) -> RelayStats {
    let mut writers: HashMap<String, (mpsc::Sender<ChangeEvent>, JoinHandle<RelayStats>)> =
        HashMap::new();
    let mut routed = 0u64;
    let mut last_log = Instant::now();

    log::info!("🚀 Relay ingestion started");

    while let Some(event) = rx.recv().await {
        let partition = ctx.publisher.partition_for(&event);

        let writer_tx = match writers.get(&partition) {
            Some((tx, _)) => tx.clone(),
            None => {
                let (tx, worker_rx) = mpsc::channel(ctx.partition_buffer.max(1));
                let handle = tokio::spawn(partition_writer(partition.clone(), worker_rx, ctx.clone()));
                writers.insert(partition.clone(), (tx.clone(), handle));
                log::info!("🧵 Partition writer started: {}", partition);
                tx
            }
        };

        if writer_tx.send(event).await.is_err() {
            log::error!("❌ Partition writer {} stopped unexpectedly", partition);
            continue;
        }
        routed += 1;

        if last_log.elapsed() >= Duration::from_secs(10) {
            log::info!(
                "📊 Relay: {} events routed across {} partitions",
                routed,
                writers.len()
            );
            last_log = Instant::now();
        }
    }

    log::info!("🛑 Capture closed, draining {} partition writers", writers.len());

    let mut total = RelayStats::default();
    for (partition, (tx, handle)) in writers {
        drop(tx);
        match handle.await {
            Ok(stats) => total += stats,
            Err(e) => log::error!("❌ Partition writer {} panicked: {}", partition, e),
        }
    }

    if let Err(e) = ctx.dead_letters.flush().await {
        log::warn!("⚠️  Dead-letter flush failed: {}", e);
    }

    log::info!(
        "✅ Relay drained: {} received, {} published, {} already in stream, {} duplicates, {} dead-lettered, {} retries",
        total.received,
        total.published,
        total.already_published,
        total.duplicates,
        total.dead_lettered,
        total.retries
    );
    total
}

async fn partition_writer(
    partition: String,
    mut rx: mpsc::Receiver<ChangeEvent>,
    ctx: RelayContext,
) -> RelayStats {
    let mut stats = RelayStats::default();

    while let Some(event) = rx.recv().await {
        stats.received += 1;

        let admission = match ctx.dedup.lock() {
            Ok(mut dedup) => dedup.admit(&event, Utc::now()),
            Err(_) => {
                log::error!("❌ Deduplicator lock poisoned, admitting {}", event.id);
                Admission::Accepted
            }
        };
        if let Admission::Duplicate { .. } = admission {
            stats.duplicates += 1;
            continue;
        }

        let mut backoff = ExponentialBackoff::new(
            ctx.retry.initial_ms,
            ctx.retry.max_ms,
            ctx.retry.max_retries,
        );

        let failure = loop {
            match ctx.publisher.publish(&event).await {
                Ok(outcome) => {
                    let sequence = outcome.sequence();
                    if let Ok(mut dedup) = ctx.dedup.lock() {
                        dedup.record_published(&event.id, &event.content_hash, sequence);
                    }
                    match outcome {
                        Published::Appended(_) => stats.published += 1,
                        Published::AlreadyPublished(_) => stats.already_published += 1,
                    }
                    log::debug!(
                        "📤 {} {} -> {}#{}",
                        event.operation.as_str(),
                        event.id,
                        partition,
                        sequence
                    );
                    break None;
                }
                Err(e) if e.is_transient() => {
                    log::warn!("⚠️  Publish of {} to {} failed: {}", event.id, partition, e);
                    if let Err(exhausted) = backoff.sleep().await {
                        break Some(format!("publish failed after retries ({}): {}", exhausted, e));
                    }
                    stats.retries += 1;
                }
                Err(e) => break Some(dead_letter_reason(&e)),
            }
        };

        if let Some(reason) = failure {
            if let Ok(mut dedup) = ctx.dedup.lock() {
                dedup.forget(&event.id, &event.content_hash);
            }
            stats.dead_lettered += 1;
            let raw = serde_json::to_string(&event).unwrap_or_else(|_| event.id.clone());
            if let Err(e) = ctx.dead_letters.record(DeadLetter::new(raw, reason)).await {
                log::error!("❌ Failed to record dead letter for {}: {}", event.id, e);
            }
        }
    }

    log::info!(
        "🧵 Partition writer {} finished: {} published, {} duplicates, {} dead-lettered",
        partition,
        stats.published,
        stats.duplicates,
        stats.dead_lettered
    );
    stats
}

fn dead_letter_reason(err: &RelayError) -> String {
    match err {
        RelayError::PartitionHalted(partition) => format!("partition halted: {}", partition),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::dead_letter::SqliteDeadLetterSink;
    use crate::error::RelayResult;
    use crate::relay::stream::{PartitionStrategy, SqliteEventStream};
    use crate::types::{Operation, Payload, Scalar};
    use async_trait::async_trait;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn event(id: &str, entity_type: &str, amount: i64) -> ChangeEvent {
        let mut payload = Payload::new();
        payload.insert("amount".to_string(), Scalar::Int(amount));
        ChangeEvent::new(id, Operation::Insert, entity_type, "b1", payload, Utc::now())
    }

    fn context(
        publisher: Arc<dyn StreamPublisher>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> RelayContext {
        RelayContext {
            dedup: Arc::new(Mutex::new(Deduplicator::new(chrono::Duration::seconds(600), 16))),
            publisher,
            dead_letters,
            retry: RetryPolicy {
                initial_ms: 1,
                max_ms: 2,
                max_retries: 3,
            },
            partition_buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_relay_publishes_in_order_and_drops_duplicates() {
        let dir = tempdir().unwrap();
        let stream = Arc::new(
            SqliteEventStream::with_connection(
                Connection::open_in_memory().unwrap(),
                PartitionStrategy::EntityType,
                chrono::Duration::seconds(600),
            )
            .unwrap(),
        );
        let sink = Arc::new(SqliteDeadLetterSink::new(dir.path().join("dlq.db")).unwrap());
        let (tx, rx) = mpsc::channel(32);

        let a = event("A", "feeding", 100);
        tx.send(a.clone()).await.unwrap();
        tx.send(event("S", "sleep", 1)).await.unwrap();
        tx.send(a).await.unwrap();
        tx.send(event("B", "feeding", 50)).await.unwrap();
        drop(tx);

        let stats = start_relay_ingestion(rx, context(stream.clone(), sink)).await;
        assert_eq!(stats.received, 4);
        assert_eq!(stats.published, 3);
        assert_eq!(stats.duplicates, 1);

        let ids: Vec<String> = stream
            .read_from("feeding", 0)
            .unwrap()
            .map(|e| e.unwrap().event.id)
            .collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(stream.head("sleep").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_event_already_in_stream_is_not_counted_as_published() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(SqliteDeadLetterSink::new(dir.path().join("dlq.db")).unwrap());
        let stream = Arc::new(
            SqliteEventStream::with_connection(
                Connection::open_in_memory().unwrap(),
                PartitionStrategy::Single,
                chrono::Duration::seconds(600),
            )
            .unwrap(),
        );
        // Landed before a restart; the fresh deduplicator has not seen it
        let a = event("A", "feeding", 100);
        stream.publish(&a).await.unwrap();

        let ctx = context(stream.clone(), sink);
        let dedup = ctx.dedup.clone();
        let (tx, rx) = mpsc::channel(8);
        tx.send(a.clone()).await.unwrap();
        tx.send(event("B", "feeding", 50)).await.unwrap();
        drop(tx);

        let stats = start_relay_ingestion(rx, ctx).await;
        assert_eq!(stats.received, 2);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.already_published, 1);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stream.head(crate::relay::stream::DEFAULT_PARTITION).unwrap(), 2);
        assert_eq!(
            dedup.lock().unwrap().admit(&a, Utc::now()),
            Admission::Duplicate { sequence: Some(0) }
        );
    }

    /// Fails a fixed number of times before delegating
    struct FlakyPublisher {
        inner: SqliteEventStream,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl StreamPublisher for FlakyPublisher {
        async fn publish(&self, event: &ChangeEvent) -> RelayResult<Published> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RelayError::TransientIo("storage timeout".to_string()));
            }
            self.inner.publish(event).await
        }

        fn partition_for(&self, event: &ChangeEvent) -> String {
            self.inner.partition_for(event)
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyPublisher> {
        Arc::new(FlakyPublisher {
            inner: SqliteEventStream::with_connection(
                Connection::open_in_memory().unwrap(),
                PartitionStrategy::Single,
                chrono::Duration::seconds(600),
            )
            .unwrap(),
            failures_left: AtomicU32::new(failures),
        })
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(SqliteDeadLetterSink::new(dir.path().join("dlq.db")).unwrap());
        let publisher = flaky(2);
        let (tx, rx) = mpsc::channel(8);
        tx.send(event("A", "feeding", 100)).await.unwrap();
        drop(tx);

        let stats = start_relay_ingestion(rx, context(publisher.clone(), sink.clone())).await;
        assert_eq!(stats.published, 1);
        assert_eq!(stats.retries, 2);
        assert!(sink.list(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter_and_allow_redelivery() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(SqliteDeadLetterSink::new(dir.path().join("dlq.db")).unwrap());
        let publisher = flaky(4);
        let ctx = context(publisher.clone(), sink.clone());
        let (tx, rx) = mpsc::channel(8);
        let a = event("A", "feeding", 100);
        tx.send(a.clone()).await.unwrap();
        // Redelivery after the failure is not a duplicate
        tx.send(a).await.unwrap();
        drop(tx);

        let stats = start_relay_ingestion(rx, ctx).await;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(stats.duplicates, 0);

        let letters = sink.list(10).unwrap();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].error_reason.contains("publish failed after retries"));
    }

    #[tokio::test]
    async fn test_halted_partition_dead_letters() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(SqliteDeadLetterSink::new(dir.path().join("dlq.db")).unwrap());
        let stream = Arc::new(
            SqliteEventStream::with_connection(
                Connection::open_in_memory().unwrap(),
                PartitionStrategy::EntityType,
                chrono::Duration::seconds(600),
            )
            .unwrap(),
        );
        stream.halt_partition("feeding", "test".to_string());

        let (tx, rx) = mpsc::channel(8);
        tx.send(event("A", "feeding", 100)).await.unwrap();
        tx.send(event("S", "sleep", 1)).await.unwrap();
        drop(tx);

        let stats = start_relay_ingestion(rx, context(stream.clone(), sink.clone())).await;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.published, 1);
        assert_eq!(sink.list(10).unwrap()[0].error_reason, "partition halted: feeding");
    }
}
