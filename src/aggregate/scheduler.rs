use super::consumer::AggregationContext;
use crate::error::RelayResult;
use crate::relay::dedup::Deduplicator;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    pub interval: std::time::Duration,
    /// Stream entries older than this are purged
    pub stream_retention: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub archived: usize,
    pub purged_entries: usize,
    pub dropped_snapshots: usize,
    pub dedup_evicted: usize,
    pub cache_repairs: usize,
    /// Archived windows still held in memory after the pass
    pub archived_held: usize,
}

/// One maintenance pass:
/// 1. archive windows past grace and snapshot them
/// 2. purge stream entries past retention, and archived windows that started
///    before the retention cutoff; the cutoff becomes the retention horizon
/// 3. prune the deduplicator
/// 4. repair cache entries that lag the live windows
pub fn run_maintenance_once(
    ctx: &AggregationContext,
    dedup: &Mutex<Deduplicator>,
    settings: &MaintenanceSettings,
    now: DateTime<Utc>,
) -> RelayResult<MaintenanceReport> {
    let mut report = MaintenanceReport::default();

    let archived = ctx.lock_aggregator()?.archive_expired(now);
    report.archived = archived.len();
    ctx.snapshots.save(&archived)?;

    let cutoff = now - settings.stream_retention;
    report.purged_entries = ctx.stream.purge_older_than(cutoff)?;
    let cutoff_date = cutoff.date_naive();
    report.dropped_snapshots = ctx.snapshots.delete_archived_before(cutoff_date)?;
    ctx.snapshots.save_retention_horizon(cutoff_date)?;
    {
        let mut aggregator = ctx.lock_aggregator()?;
        aggregator.forget_archived_before(cutoff_date);
        report.archived_held = aggregator.archived_count();
    }

    if let Ok(mut dedup) = dedup.lock() {
        report.dedup_evicted = dedup.prune(now);
    }

    {
        let aggregator = ctx.lock_aggregator()?;
        for window in aggregator.windows() {
            let stale = match ctx.cache.get(&window.entity_owner_id, window.window_kind) {
                None => true,
                Some(cached) => {
                    cached.window_start < window.window_start
                        || (cached.window_start == window.window_start
                            && cached.computed_at < window.computed_at)
                }
            };
            if stale && ctx.cache.put(window) {
                report.cache_repairs += 1;
            }
        }
    }
    if report.cache_repairs > 0 {
        log::warn!("🩹 Repaired {} stale cache entries", report.cache_repairs);
    }

    Ok(report)
}

/// Periodic maintenance until shutdown
pub async fn maintenance_task(
    ctx: AggregationContext,
    dedup: Arc<Mutex<Deduplicator>>,
    settings: MaintenanceSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    log::info!("⏰ Maintenance task started ({:?} interval)", settings.interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match run_maintenance_once(&ctx, &dedup, &settings, Utc::now()) {
            Ok(report) => log::info!(
                "🧹 Maintenance: {} archived ({} held), {} entries purged, {} snapshots dropped, {} dedup evicted",
                report.archived,
                report.archived_held,
                report.purged_entries,
                report.dropped_snapshots,
                report.dedup_evicted
            ),
            Err(e) => log::error!("❌ Maintenance pass failed: {}", e),
        }
    }

    log::info!("⏰ Maintenance task stopped");
}
