//! Rebuild Windows
//!
//! Operator tool: replays every retained stream entry into a fresh
//! aggregator and rewrites the window snapshots. Windows that started before
//! the stream retention cutoff may count purged entries, so their snapshots
//! are kept as the base and only retained entries are folded on top.
//! Stop `relay_runtime` first. Consumer offsets are moved to the current
//! stream heads.
//!
//! Usage:
//!   cargo run --release --bin rebuild_windows [--dry-run]

use chrono::{Duration, Utc};
use cradleflow::aggregate::{
    AggregateWindow, MetricRegistry, SqliteSnapshotStore, WindowAggregator, WindowKey,
};
use cradleflow::config::RelayConfig;
use cradleflow::relay::SqliteEventStream;
use dotenv::dotenv;
use log::{info, warn};
use std::collections::HashMap;
use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::init();

    let dry_run = env::args().any(|a| a == "--dry-run");
    let config = RelayConfig::from_env()?;

    info!("🔁 Rebuilding windows from {}", config.db_path);

    let registry = match &config.metric_registry_path {
        Some(path) => MetricRegistry::from_json_file(path)?,
        None => MetricRegistry::nursery_defaults(),
    };

    let stream = SqliteEventStream::open(
        &config.db_path,
        config.partition_strategy.clone(),
        Duration::seconds(config.publish_retry_window_secs),
    )?;
    let snapshots = SqliteSnapshotStore::open(&config.db_path)?;
    let mut aggregator = WindowAggregator::new(
        registry,
        config.timezones.clone(),
        Duration::seconds(config.window_grace_secs),
    );

    let horizon = snapshots.retention_horizon()?;
    if let Some(horizon) = horizon {
        aggregator.set_retention_horizon(horizon);
    }
    let retention_cutoff = (Utc::now() - Duration::days(config.stream_retention_days)).date_naive();
    let cutoff = horizon.map_or(retention_cutoff, |h| h.max(retention_cutoff));

    let kept: Vec<AggregateWindow> = snapshots
        .load_all()?
        .into_iter()
        .filter(|w| w.window_start < cutoff)
        .collect();
    let mut archived_base: HashMap<WindowKey, AggregateWindow> = kept
        .iter()
        .filter(|w| w.archived)
        .map(|w| (w.key(), w.clone()))
        .collect();
    info!(
        "   ├─ Keeping {} snapshots that start before {}",
        kept.len(),
        cutoff
    );
    aggregator.restore(kept);

    let mut applied = 0usize;
    let mut expired = 0usize;
    for partition in stream.partitions()? {
        let head = stream.head(&partition)?;
        for entry in stream.read_from(&partition, 0)? {
            let entry = entry?;
            let outcome = aggregator.apply(&entry);
            for key in outcome.late {
                let Some(base) = archived_base.remove(&key) else {
                    warn!("⚠️  No snapshot for archived window {}", key);
                    continue;
                };
                let window = aggregator.fold_late(base, &entry);
                aggregator.install_rebuilt(window.clone());
                archived_base.insert(key, window);
            }
            if !outcome.expired.is_empty() {
                expired += 1;
            }
            applied += 1;
        }
        info!("   ├─ {}: replayed up to sequence {}", partition, head);
    }
    if expired > 0 {
        warn!("⚠️  {} entries only touched forgotten windows", expired);
    }

    let archived = aggregator.archive_expired(Utc::now());
    let mut windows: Vec<_> = aggregator.windows().cloned().collect();
    windows.extend(archived);
    windows.extend(archived_base.into_values());
    info!(
        "   └─ {} entries folded into {} windows",
        applied,
        windows.len()
    );

    if dry_run {
        for window in &windows {
            info!(
                "{} {} {}: {:?}",
                window.entity_owner_id,
                window.window_kind.as_str(),
                window.window_start,
                window.metrics
            );
        }
        info!("⚠️  Dry run, snapshots untouched");
        return Ok(());
    }

    snapshots.clear()?;
    snapshots.save(&windows)?;
    for partition in stream.partitions()? {
        snapshots.save_consumer_offset(&partition, stream.head(&partition)?)?;
    }

    info!("✅ Snapshots rewritten");
    Ok(())
}
