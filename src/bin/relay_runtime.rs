//! Relay Runtime
//!
//! Captures row changes from the `change_notifications` outbox, relays them
//! to the partitioned event stream and keeps DAY/WEEK summaries current.
//!
//! Usage:
//!   cargo run --release --bin relay_runtime
//!
//! Environment variables:
//!   CRADLEFLOW_DB_PATH - stream and snapshot database (default: /var/lib/cradleflow/cradleflow.db)
//!   CRADLEFLOW_SOURCE_DB_PATH - outbox database (default: CRADLEFLOW_DB_PATH)
//!   CAPTURE_RESUME_TOKEN - resume after this outbox id
//!   PARTITION_STRATEGY - single | entity_type (default: single)
//!   METRIC_REGISTRY_PATH - JSON metric rules (default: built-in nursery rules)
//!   RUST_LOG - log filter (default: info)

use cradleflow::aggregate::MetricRegistry;
use cradleflow::capture::SqliteChangeFeed;
use cradleflow::config::RuntimeConfig;
use cradleflow::pipeline::Pipeline;
use dotenv::dotenv;
use log::{error, info};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let config = RuntimeConfig::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.rust_log))
        .init();

    info!("🚀 Relay Runtime");

    info!("   ├─ Database: {}", config.relay.db_path);
    info!("   ├─ Source outbox: {}", config.capture.source_db_path);
    info!("   ├─ Tables: {}", config.capture.tables.join(", "));
    info!("   ├─ Partitioning: {:?}", config.relay.partition_strategy);
    info!("   ├─ Dedup window: {}s", config.relay.dedup_window_secs);
    info!("   └─ Window grace: {}s", config.relay.window_grace_secs);

    let registry = match &config.relay.metric_registry_path {
        Some(path) => MetricRegistry::from_json_file(path)?,
        None => {
            info!("📋 Using built-in nursery metric rules");
            MetricRegistry::nursery_defaults()
        }
    };

    let pipeline = Pipeline::open(config.relay.clone(), registry)?;
    let feed = SqliteChangeFeed::open(&config.capture.source_db_path, config.capture.resume_token)?
        .with_poll_interval(Duration::from_millis(config.relay.consumer_poll_interval_ms));
    let handle = pipeline.spawn(Box::new(feed), &config.capture);

    info!("✅ All tasks running");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    let report = handle.shutdown().await;
    if let Some(capture) = &report.capture {
        info!(
            "📊 Capture: {} events, {} dead-lettered (resume token: {:?})",
            capture.captured, capture.dead_lettered, capture.resume_token
        );
    }
    info!(
        "📊 Relay: {} published, {} duplicates dropped, {} dead-lettered",
        report.relay.published, report.relay.duplicates, report.relay.dead_lettered
    );
    info!(
        "📊 Windows: {} entries applied, {} late rebuilds",
        report.consumers.applied, report.consumers.late_rebuilds
    );

    let halted = pipeline.stream.halted_partitions();
    for (partition, reason) in &halted {
        error!("🛑 Partition {} is halted: {}", partition, reason);
    }

    info!("✅ Relay runtime stopped");
    Ok(())
}
