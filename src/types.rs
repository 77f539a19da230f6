//! Canonical event envelope shared by capture, relay and aggregation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Row-level change kind as reported by the source table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Operation::Insert),
            "UPDATE" => Some(Operation::Update),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// A single payload value. Nested structures are rejected at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Numeric view, coercing numeric text (`"150"` → 150.0).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) if f.is_finite() => Some(*f),
            Scalar::Text(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            Scalar::Int(i) => Some(*i != 0),
            Scalar::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    fn feed_hash(&self, hasher: &mut Sha256) {
        match self {
            Scalar::Null => hasher.update(b"n"),
            Scalar::Bool(b) => {
                hasher.update(b"b");
                hasher.update([*b as u8]);
            }
            Scalar::Int(i) => {
                hasher.update(b"i");
                hasher.update(i.to_le_bytes());
            }
            Scalar::Float(f) => {
                hasher.update(b"f");
                hasher.update(f.to_bits().to_le_bytes());
            }
            Scalar::Text(s) => {
                hasher.update(b"s");
                hasher.update((s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

/// Ordered so the content hash does not depend on field arrival order
pub type Payload = BTreeMap<String, Scalar>;

/// Hex SHA-256 over the operation and the canonical payload encoding.
pub fn content_hash(operation: Operation, payload: &Payload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_str().as_bytes());
    for (field, value) in payload {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
        value.feed_hash(&mut hasher);
    }
    hex::encode(hasher.finalize())
}

/// Normalized change notification, before a sequence is assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source row primary key
    pub id: String,
    pub content_hash: String,
    pub source_table: String,
    pub operation: Operation,
    pub entity_type: String,
    pub entity_owner_id: String,
    pub payload: Payload,
    /// Source-side change time
    pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        id: impl Into<String>,
        operation: Operation,
        entity_type: impl Into<String>,
        entity_owner_id: impl Into<String>,
        payload: Payload,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let content_hash = content_hash(operation, &payload);
        Self {
            id: id.into(),
            content_hash,
            source_table: "public.baby_logs".to_string(),
            operation,
            entity_type: entity_type.into(),
            entity_owner_id: entity_owner_id.into(),
            payload,
            observed_at,
        }
    }

    pub fn with_source_table(mut self, table: impl Into<String>) -> Self {
        self.source_table = table.into();
        self
    }

    /// Dedup key: one logical row version
    pub fn dedup_key(&self) -> (String, String) {
        (self.id.clone(), self.content_hash.clone())
    }
}

/// A published event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEntry {
    pub partition: String,
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    pub event: ChangeEvent,
}

/// Storage encoding for instants: microseconds since the epoch
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}
