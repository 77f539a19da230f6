//! End-to-end tests: notifications in, window summaries out
//!
//! Covered:
//! - gap-free sequences and duplicate suppression through the relay
//! - DELETE reversal in the served summary
//! - replaying the stream reproduces the live windows
//! - restart from snapshots reapplies only unseen sequences
//! - deduplication survives a restart
//! - local-midnight day boundaries per owner

#[cfg(test)]
mod relay_pipeline_tests {
    use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
    use cradleflow::aggregate::{
        MetricRegistry, OwnerTimezones, WindowAggregator, WindowKey, WindowKind,
    };
    use cradleflow::capture::{ChannelChangeFeed, DeadLetterBackend, FeedSignal};
    use cradleflow::config::{CaptureConfig, RelayConfig};
    use cradleflow::pipeline::Pipeline;
    use cradleflow::relay::{PartitionStrategy, StreamPublisher, DEFAULT_PARTITION};
    use cradleflow::types::{ChangeEvent, Operation, Payload, Scalar, StreamEntry};
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn relay_config(dir: &Path, timezones: OwnerTimezones) -> RelayConfig {
        RelayConfig {
            db_path: dir.join("cradleflow.db").to_string_lossy().into_owned(),
            channel_buffer: 64,
            dedup_window_secs: 600,
            dedup_max_per_id: 16,
            publish_retry_window_secs: 600,
            publish_max_retries: 3,
            partition_strategy: PartitionStrategy::Single,
            window_grace_secs: 2 * 24 * 3600,
            stream_retention_days: 30,
            timezones,
            metric_registry_path: None,
            dead_letter_backend: DeadLetterBackend::Sqlite,
            dead_letter_path: dir.join("dead_letters.db").to_string_lossy().into_owned(),
            consumer_poll_interval_ms: 10,
            maintenance_interval_ms: 60_000,
        }
    }

    fn capture_config() -> CaptureConfig {
        CaptureConfig {
            source_db_path: String::new(),
            tables: vec!["public.baby_logs".to_string()],
            resume_token: None,
            reconnect_initial_ms: 1,
            reconnect_max_ms: 5,
            reconnect_max_retries: 3,
        }
    }

    fn notification(op: &str, id: &str, amount: u32, logged_at: &str) -> String {
        let row = format!(
            r#"{{"id":"{}","baby_id":"b1","log_type":"feeding","log_data":{{"feedAmount":"{}"}},"logged_at":"{}"}}"#,
            id, amount, logged_at
        );
        if op == "DELETE" {
            format!(r#"{{"operation":"DELETE","table":"baby_logs","data":null,"old":{}}}"#, row)
        } else {
            format!(r#"{{"operation":"{}","table":"baby_logs","data":{}}}"#, op, row)
        }
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    /// Run one pipeline to completion over the given notification bodies
    async fn run_pipeline(config: RelayConfig, bodies: &[String]) -> Pipeline {
        let pipeline = Pipeline::open(config, MetricRegistry::nursery_defaults()).unwrap();
        let (feed_tx, feed_rx) = mpsc::channel(bodies.len() + 1);
        for body in bodies {
            feed_tx.send(FeedSignal::Notification(body.clone())).await.unwrap();
        }
        drop(feed_tx);

        let handle = pipeline.spawn(Box::new(ChannelChangeFeed::new(feed_rx, 100)), &capture_config());
        let report = handle.wait().await;
        assert!(report.capture.is_some());
        pipeline
    }

    #[tokio::test]
    async fn test_insert_insert_delete_serves_net_summary() {
        let dir = tempdir().unwrap();
        let bodies = vec![
            notification("INSERT", "A", 100, "2025-04-13T08:00:00Z"),
            notification("INSERT", "B", 50, "2025-04-13T09:00:00Z"),
            // Redelivery of A inside the dedup window
            notification("INSERT", "A", 100, "2025-04-13T08:00:00Z"),
            notification("DELETE", "A", 100, "2025-04-13T08:00:00Z"),
        ];
        let pipeline = run_pipeline(relay_config(dir.path(), OwnerTimezones::utc()), &bodies).await;

        // 1. Three distinct changes, sequences 0..2 with no gaps
        let sequences: Vec<u64> = pipeline
            .stream
            .read_from(DEFAULT_PARTITION, 0)
            .unwrap()
            .map(|e| e.unwrap().sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);

        // 2. Summary reflects only B
        let noon = ts("2025-04-13T12:00:00Z");
        let day = pipeline
            .summaries()
            .get_or_rebuild("b1", WindowKind::Day, noon)
            .unwrap()
            .expect("day summary");
        assert_eq!(day.metric("feed_total_ml"), 50.0);
        assert_eq!(day.metric("feed_count"), 1.0);
        assert_eq!(day.last_applied.get(DEFAULT_PARTITION), Some(&2));

        let week = pipeline
            .summaries()
            .get_or_rebuild("b1", WindowKind::Week, noon)
            .unwrap()
            .expect("week summary");
        assert_eq!(week.metric("feed_total_ml"), 50.0);
    }

    #[tokio::test]
    async fn test_stream_replay_matches_live_windows() {
        let dir = tempdir().unwrap();
        let bodies = vec![
            notification("INSERT", "A", 100, "2025-04-13T08:00:00Z"),
            notification("INSERT", "B", 50, "2025-04-14T09:00:00Z"),
            notification("UPDATE", "A", 120, "2025-04-14T08:00:00Z"),
            notification("INSERT", "C", 30, "2025-04-15T07:00:00Z"),
            notification("DELETE", "B", 50, "2025-04-14T09:00:00Z"),
        ];
        let pipeline = run_pipeline(relay_config(dir.path(), OwnerTimezones::utc()), &bodies).await;

        let live = pipeline.aggregation.snapshots.load_all().unwrap();
        assert!(!live.is_empty());

        // Replay in one pass and in uneven batches: same result either way
        let entries: Vec<StreamEntry> = pipeline
            .stream
            .read_from(DEFAULT_PARTITION, 0)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();
        for batch_size in [1usize, 2, 5] {
            let mut replay = WindowAggregator::new(
                MetricRegistry::nursery_defaults(),
                OwnerTimezones::utc(),
                Duration::days(2),
            );
            for batch in entries.chunks(batch_size) {
                for entry in batch {
                    replay.apply(entry);
                }
            }
            for window in &live {
                let replayed = replay.window(&window.key()).expect("replayed window");
                assert_eq!(replayed.metrics, window.metrics, "window {}", window.key());
                assert_eq!(replayed.last_applied, window.last_applied);
            }
        }

        let monday = WindowKey::new("b1", WindowKind::Day, NaiveDate::from_ymd_opt(2025, 4, 14).unwrap());
        let window = live.iter().find(|w| w.key() == monday).unwrap();
        assert_eq!(window.metric("feed_total_ml"), 120.0);
    }

    #[tokio::test]
    async fn test_restart_reapplies_only_unseen_sequences() {
        let dir = tempdir().unwrap();
        let config = relay_config(dir.path(), OwnerTimezones::utc());
        let stream = cradleflow::relay::SqliteEventStream::open(
            &config.db_path,
            PartitionStrategy::Single,
            Duration::seconds(600),
        )
        .unwrap();

        for i in 0..8 {
            let mut payload = Payload::new();
            payload.insert("amount".to_string(), Scalar::Int(10));
            let event = ChangeEvent::new(
                format!("F{}", i),
                Operation::Insert,
                "feeding",
                "b1",
                payload,
                ts("2025-04-13T08:00:00Z") + Duration::minutes(i),
            );
            assert_eq!(stream.publish(&event).await.unwrap().sequence(), i as u64);
        }
        let entries: Vec<StreamEntry> = stream
            .read_from(DEFAULT_PARTITION, 0)
            .unwrap()
            .map(|e| e.unwrap())
            .collect();

        // 1. First run folds 0..=5 and snapshots
        let mut first = WindowAggregator::new(
            MetricRegistry::nursery_defaults(),
            OwnerTimezones::utc(),
            Duration::days(2),
        );
        for entry in &entries[..6] {
            first.apply(entry);
        }
        let snapshot: Vec<_> = first.windows().cloned().collect();

        // 2. Restart replays everything from 0
        let mut restarted = WindowAggregator::new(
            MetricRegistry::nursery_defaults(),
            OwnerTimezones::utc(),
            Duration::days(2),
        );
        restarted.restore(snapshot);
        let applied: Vec<u64> = entries
            .iter()
            .filter(|entry| !restarted.apply(entry).is_noop())
            .map(|entry| entry.sequence)
            .collect();
        assert_eq!(applied, vec![6, 7]);

        let day = WindowKey::new("b1", WindowKind::Day, NaiveDate::from_ymd_opt(2025, 4, 13).unwrap());
        assert_eq!(restarted.window(&day).unwrap().metric("feed_total_ml"), 80.0);
        assert_eq!(restarted.window(&day).unwrap().metric("feed_count"), 8.0);
    }

    #[tokio::test]
    async fn test_dedup_and_windows_survive_restart() {
        let dir = tempdir().unwrap();
        let first_run = vec![
            notification("INSERT", "A", 100, "2025-04-13T08:00:00Z"),
            notification("INSERT", "B", 50, "2025-04-13T09:00:00Z"),
        ];
        let pipeline = run_pipeline(relay_config(dir.path(), OwnerTimezones::utc()), &first_run).await;
        drop(pipeline);

        // Upstream re-delivers A after a reconnect, plus a new row
        let second_run = vec![
            notification("INSERT", "A", 100, "2025-04-13T08:00:00Z"),
            notification("INSERT", "C", 25, "2025-04-13T10:00:00Z"),
        ];
        let pipeline = run_pipeline(relay_config(dir.path(), OwnerTimezones::utc()), &second_run).await;

        assert_eq!(pipeline.stream.head(DEFAULT_PARTITION).unwrap(), 3);
        let day = pipeline
            .summaries()
            .get_or_rebuild("b1", WindowKind::Day, ts("2025-04-13T12:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(day.metric("feed_total_ml"), 175.0);
        assert_eq!(day.metric("feed_count"), 3.0);
    }

    #[tokio::test]
    async fn test_day_boundary_follows_owner_offset() {
        let dir = tempdir().unwrap();
        let mut timezones = OwnerTimezones::utc();
        timezones.set("b1", FixedOffset::east_opt(8 * 3600).unwrap());

        // 23:59:59 and 00:00:00 local (UTC+8)
        let bodies = vec![
            notification("INSERT", "late", 70, "2025-04-13T15:59:59Z"),
            notification("INSERT", "early", 90, "2025-04-13T16:00:00Z"),
        ];
        let pipeline = run_pipeline(relay_config(dir.path(), timezones), &bodies).await;
        let summaries = pipeline.summaries();

        let sunday = summaries
            .get_or_rebuild("b1", WindowKind::Day, ts("2025-04-13T15:00:00Z"))
            .unwrap()
            .unwrap();
        let monday = summaries
            .get_or_rebuild("b1", WindowKind::Day, ts("2025-04-13T17:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(sunday.window_start, NaiveDate::from_ymd_opt(2025, 4, 13).unwrap());
        assert_eq!(sunday.metric("feed_total_ml"), 70.0);
        assert_eq!(monday.window_start, NaiveDate::from_ymd_opt(2025, 4, 14).unwrap());
        assert_eq!(monday.metric("feed_total_ml"), 90.0);

        // Sunday closes one week, Monday opens the next
        let week = summaries
            .get_or_rebuild("b1", WindowKind::Week, ts("2025-04-13T17:00:00Z"))
            .unwrap()
            .unwrap();
        assert_eq!(week.window_start, NaiveDate::from_ymd_opt(2025, 4, 14).unwrap());
        assert_eq!(week.metric("feed_total_ml"), 90.0);
    }
}
