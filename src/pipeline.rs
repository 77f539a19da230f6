//! Runtime wiring: capture -> relay -> stream -> window consumers -> cache
//!
//! Shutdown runs in two phases. First capture stops and the relay drains
//! everything already queued into the stream; only then are the window
//! consumers told to finish, so they fold every published entry.

use crate::aggregate::{
    maintenance_task, start_window_consumer, AggregationContext, ConsumerStats, MaintenanceSettings,
    MetricRegistry, SqliteSnapshotStore, SummaryCache, SummaryService, WindowAggregator,
};
use crate::capture::{
    open_dead_letter_sink, run_capture, CaptureStats, ChangeFeed, DeadLetterSink,
    ExponentialBackoff, Normalizer,
};
use crate::config::{CaptureConfig, RelayConfig};
use crate::error::RelayResult;
use crate::relay::{
    start_relay_ingestion, Deduplicator, RelayContext, RelayStats, RetryPolicy, SqliteEventStream,
};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct Pipeline {
    pub stream: Arc<SqliteEventStream>,
    pub aggregation: AggregationContext,
    pub dedup: Arc<Mutex<Deduplicator>>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    config: RelayConfig,
}

impl Pipeline {
    /// Open storage, restore window snapshots and warm the deduplicator
    pub fn open(config: RelayConfig, registry: MetricRegistry) -> RelayResult<Self> {
        let stream = Arc::new(SqliteEventStream::open(
            &config.db_path,
            config.partition_strategy.clone(),
            Duration::seconds(config.publish_retry_window_secs),
        )?);
        let snapshots = Arc::new(SqliteSnapshotStore::open(&config.db_path)?);
        let dead_letters = open_dead_letter_sink(config.dead_letter_backend, &config.dead_letter_path)?;

        let aggregator = WindowAggregator::new(
            registry,
            config.timezones.clone(),
            Duration::seconds(config.window_grace_secs),
        );
        let aggregation = AggregationContext {
            aggregator: Arc::new(Mutex::new(aggregator)),
            cache: Arc::new(SummaryCache::new()),
            snapshots,
            stream: Arc::clone(&stream),
            retry: RetryPolicy {
                max_retries: config.publish_max_retries,
                ..RetryPolicy::default()
            },
        };
        let restored = aggregation.restore_from_snapshots()?;

        let dedup_window = Duration::seconds(config.dedup_window_secs);
        let mut dedup = Deduplicator::new(dedup_window, config.dedup_max_per_id);
        let recent = stream.recent_since(Utc::now() - dedup_window)?;
        dedup.warm(&recent);

        log::info!(
            "✅ Pipeline storage ready: {} ({} windows restored, {} cached)",
            config.db_path,
            restored,
            aggregation.cache.len()
        );

        Ok(Self {
            stream,
            aggregation,
            dedup: Arc::new(Mutex::new(dedup)),
            dead_letters,
            config,
        })
    }

    pub fn summaries(&self) -> SummaryService {
        SummaryService::new(self.aggregation.clone())
    }

    /// Start every task. The feed is owned by the capture task from here on.
    pub fn spawn(&self, mut feed: Box<dyn ChangeFeed>, capture: &CaptureConfig) -> PipelineHandle {
        let (capture_shutdown_tx, capture_shutdown_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(self.config.channel_buffer);

        let normalizer = Normalizer::new(&capture.tables);
        let backoff = ExponentialBackoff::new(
            capture.reconnect_initial_ms,
            capture.reconnect_max_ms,
            capture.reconnect_max_retries,
        );
        let dead_letters = Arc::clone(&self.dead_letters);
        let capture_task = tokio::spawn(async move {
            run_capture(
                feed.as_mut(),
                &normalizer,
                event_tx,
                dead_letters,
                backoff,
                capture_shutdown_rx,
            )
            .await
        });

        let relay_ctx = RelayContext {
            dedup: Arc::clone(&self.dedup),
            publisher: self.stream.clone(),
            dead_letters: Arc::clone(&self.dead_letters),
            retry: RetryPolicy {
                max_retries: self.config.publish_max_retries,
                ..RetryPolicy::default()
            },
            partition_buffer: (self.config.channel_buffer / 4).max(1),
        };
        let relay_task = tokio::spawn(start_relay_ingestion(event_rx, relay_ctx));

        let poll = std::time::Duration::from_millis(self.config.consumer_poll_interval_ms);
        let supervisor_task = tokio::spawn(consumer_supervisor(
            self.aggregation.clone(),
            poll,
            drain_rx.clone(),
        ));

        let maintenance = tokio::spawn(maintenance_task(
            self.aggregation.clone(),
            Arc::clone(&self.dedup),
            MaintenanceSettings {
                interval: std::time::Duration::from_millis(self.config.maintenance_interval_ms),
                stream_retention: Duration::days(self.config.stream_retention_days),
            },
            drain_rx,
        ));

        PipelineHandle {
            capture_shutdown_tx,
            drain_tx,
            capture_task,
            relay_task,
            supervisor_task,
            maintenance,
        }
    }
}

/// Spawn one window consumer per partition as partitions appear, and
/// restart any that stop before drain from their persisted offset
async fn consumer_supervisor(
    ctx: AggregationContext,
    poll: std::time::Duration,
    mut drain: watch::Receiver<bool>,
) -> ConsumerStats {
    let mut consumers: HashMap<String, JoinHandle<ConsumerStats>> = HashMap::new();
    let mut totals = ConsumerStats::default();

    loop {
        // Partitions are re-checked once more after drain so late starters still fold
        let draining = *drain.borrow();

        if !draining {
            let stopped: Vec<String> = consumers
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(partition, _)| partition.clone())
                .collect();
            for partition in stopped {
                let Some(handle) = consumers.remove(&partition) else {
                    continue;
                };
                match handle.await {
                    Ok(stats) => totals += stats,
                    Err(e) => log::error!("❌ Window consumer for {} panicked: {}", partition, e),
                }
                totals.restarts += 1;
                log::warn!("🔄 Window consumer for {} stopped early, restarting", partition);
            }
        }

        match ctx.stream.partitions() {
            Ok(partitions) => {
                for partition in partitions {
                    if !consumers.contains_key(&partition) {
                        let handle = tokio::spawn(start_window_consumer(
                            ctx.clone(),
                            partition.clone(),
                            poll,
                            drain.clone(),
                        ));
                        consumers.insert(partition, handle);
                    }
                }
            }
            Err(e) => log::warn!("⚠️  Could not list partitions: {}", e),
        }

        if draining {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = drain.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    for (partition, handle) in consumers {
        match handle.await {
            Ok(stats) => totals += stats,
            Err(e) => log::error!("❌ Window consumer for {} panicked: {}", partition, e),
        }
    }
    if totals.restarts > 0 {
        log::warn!("🔄 Window consumers restarted {} times", totals.restarts);
    }
    totals
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub capture: Option<CaptureStats>,
    pub relay: RelayStats,
    pub consumers: ConsumerStats,
}

pub struct PipelineHandle {
    capture_shutdown_tx: watch::Sender<bool>,
    drain_tx: watch::Sender<bool>,
    capture_task: JoinHandle<RelayResult<CaptureStats>>,
    relay_task: JoinHandle<RelayStats>,
    supervisor_task: JoinHandle<ConsumerStats>,
    maintenance: JoinHandle<()>,
}

impl PipelineHandle {
    /// Stop capture, drain the relay into the stream, then let consumers finish
    pub async fn shutdown(self) -> PipelineReport {
        log::info!("🛑 Shutting down: stopping capture");
        let _ = self.capture_shutdown_tx.send(true);
        self.finish().await
    }

    /// Wait for the feed to close on its own, then drain like `shutdown`
    pub async fn wait(self) -> PipelineReport {
        self.finish().await
    }

    async fn finish(self) -> PipelineReport {
        let mut report = PipelineReport::default();

        match self.capture_task.await {
            Ok(Ok(stats)) => report.capture = Some(stats),
            Ok(Err(e)) => log::error!("❌ Capture failed: {}", e),
            Err(e) => log::error!("❌ Capture task panicked: {}", e),
        }

        match self.relay_task.await {
            Ok(stats) => report.relay = stats,
            Err(e) => log::error!("❌ Relay task panicked: {}", e),
        }

        log::info!("🛑 Relay drained, stopping window consumers");
        let _ = self.drain_tx.send(true);

        match self.supervisor_task.await {
            Ok(stats) => report.consumers = stats,
            Err(e) => log::error!("❌ Consumer supervisor panicked: {}", e),
        }
        if let Err(e) = self.maintenance.await {
            log::error!("❌ Maintenance task panicked: {}", e);
        }

        log::info!("✅ Pipeline stopped");
        report
    }
}
