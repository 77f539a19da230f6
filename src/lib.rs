//! Change-event relay and window aggregation for nursery log tables
//!
//! Row changes are captured from an upstream feed, deduplicated, published
//! to a durable partitioned stream with gap-free sequences, and folded into
//! per-owner DAY and WEEK windows served from a write-through cache.

pub mod aggregate;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod sqlite_pragma;
pub mod types;

pub use error::{RelayError, RelayResult};
pub use types::{ChangeEvent, Operation, Payload, Scalar, StreamEntry};
