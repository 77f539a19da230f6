//! Relay: deduplicate captured events and publish them to the ordered stream

pub mod dedup;
pub mod ingestion;
pub mod stream;

pub use dedup::{Admission, Deduplicator};
pub use ingestion::{start_relay_ingestion, RelayContext, RelayStats, RetryPolicy};
pub use stream::{
    PartitionStrategy, Published, SqliteEventStream, StreamCursor, StreamPublisher, DEFAULT_PARTITION,
};
