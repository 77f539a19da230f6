//! Window aggregation: fold the stream into per-owner DAY and WEEK metrics

pub mod cache;
pub mod consumer;
pub mod engine;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod timezone;
pub mod window;

pub use cache::{Summary, SummaryCache};
pub use consumer::{start_window_consumer, AggregationContext, ConsumerStats, SummaryService};
pub use engine::{ApplyOutcome, WindowAggregator};
pub use registry::{DurationUnit, FoldFn, MetricRegistry, MetricRule};
pub use scheduler::{maintenance_task, run_maintenance_once, MaintenanceReport, MaintenanceSettings};
pub use snapshot::SqliteSnapshotStore;
pub use timezone::{parse_utc_offset, OwnerTimezones};
pub use window::{AggregateWindow, WindowKey, WindowKind};
