//! Change notification normalization into `ChangeEvent`
//!
//! Wire format produced by the upstream realtime listener:
//!
//! ```text
//! {"operation":"INSERT","schema":"public","table":"baby_logs",
//!  "data":{"id":"A","baby_id":"b1","log_type":"feeding",
//!          "log_data":{"feedAmount":"150"},"logged_at":"2025-04-13T08:00:00Z"},
//!  "old":null,"timestamp":"2025-04-13T08:00:01Z"}
//! ```

use crate::error::{RelayError, RelayResult};
use crate::types::{ChangeEvent, Operation, Payload, Scalar};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

const OWNER_FIELDS: [&str; 4] = ["baby_id", "mom_id", "owner_id", "user_id"];
const TYPE_FIELDS: [&str; 2] = ["log_type", "entity_type"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub operation: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
    /// Commit time reported by the source
    #[serde(default)]
    pub timestamp: Option<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeNotification {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Turns raw notification bodies into events, filtering by table
#[derive(Debug, Clone)]
pub struct Normalizer {
    tables: HashSet<String>,
}

impl Normalizer {
    /// `tables` entries are `schema.table`; a bare `table` means `public.table`.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tables = tables
            .into_iter()
            .map(|t| {
                let t = t.as_ref().trim();
                if t.contains('.') {
                    t.to_string()
                } else {
                    format!("public.{}", t)
                }
            })
            .filter(|t| t != "public.")
            .collect();
        Self { tables }
    }

    pub fn accepts_table(&self, qualified: &str) -> bool {
        self.tables.is_empty() || self.tables.contains(qualified)
    }

    /// Normalize one raw body.
    ///
    /// Returns `Ok(None)` for tables outside the filter, `Err(MalformedEvent)`
    /// for anything that should go to the dead-letter sink.
    pub fn normalize(&self, raw: &str) -> RelayResult<Option<ChangeEvent>> {
        let notification: ChangeNotification = serde_json::from_str(raw)
            .map_err(|e| RelayError::MalformedEvent(format!("invalid notification json: {}", e)))?;

        let table = notification.qualified_table();
        if !self.accepts_table(&table) {
            log::debug!("Skipping notification for unwatched table {}", table);
            return Ok(None);
        }

        normalize_notification(&notification).map(Some)
    }
}

pub fn normalize_notification(n: &ChangeNotification) -> RelayResult<ChangeEvent> {
    let operation = Operation::from_str(&n.operation)
        .ok_or_else(|| malformed(format!("unknown operation '{}'", n.operation)))?;

    let row = match operation {
        Operation::Delete => n.old.as_ref().or(n.data.as_ref()),
        _ => n.data.as_ref(),
    }
    .and_then(Value::as_object)
    .ok_or_else(|| malformed(format!("{} notification without row image", operation.as_str())))?;

    let id = row
        .get("id")
        .and_then(key_to_string)
        .ok_or_else(|| malformed("row has no primary key".to_string()))?;

    let entity_owner_id = OWNER_FIELDS
        .iter()
        .find_map(|f| row.get(*f).and_then(key_to_string))
        .ok_or_else(|| malformed(format!("row {} has no owner id", id)))?;

    let entity_type = TYPE_FIELDS
        .iter()
        .find_map(|f| row.get(*f).and_then(Value::as_str))
        .map(canonical_entity_type)
        .ok_or_else(|| malformed(format!("row {} has no log type", id)))?;

    let payload = extract_payload(row.get("log_data"))
        .map_err(|reason| malformed(format!("row {}: {}", id, reason)))?;

    let observed_at = row
        .get("logged_at")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .or_else(|| n.timestamp.as_deref().and_then(parse_timestamp))
        .ok_or_else(|| malformed(format!("row {} has no parseable timestamp", id)))?;

    Ok(
        ChangeEvent::new(id, operation, entity_type, entity_owner_id, payload, observed_at)
            .with_source_table(n.qualified_table()),
    )
}

fn malformed(reason: String) -> RelayError {
    RelayError::MalformedEvent(reason)
}

fn key_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Lower-case with a few aliases the source tables use interchangeably.
pub fn canonical_entity_type(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "feed" => "feeding".to_string(),
        "bowel" => "diaper".to_string(),
        _ => lowered,
    }
}

fn extract_payload(log_data: Option<&Value>) -> Result<Payload, String> {
    let object: Map<String, Value> = match log_data {
        None | Some(Value::Null) => return Ok(Payload::new()),
        Some(Value::Object(map)) => map.clone(),
        // Some writers store log_data as a JSON string
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => return Err("log_data is not an object".to_string()),
        },
        Some(_) => return Err("log_data is not an object".to_string()),
    };

    let mut payload = Payload::new();
    for (field, value) in object {
        let scalar = match value {
            Value::Null => Scalar::Null,
            Value::Bool(b) => Scalar::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Scalar::Int(i),
                None => Scalar::Float(n.as_f64().ok_or_else(|| format!("{} out of range", field))?),
            },
            Value::String(s) => Scalar::Text(s),
            Value::Array(_) | Value::Object(_) => {
                return Err(format!("field '{}' is not a scalar", field));
            }
        };
        payload.insert(field, scalar);
    }
    Ok(payload)
}

/// RFC 3339, or a naive ISO timestamp interpreted as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
