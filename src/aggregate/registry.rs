//! Metric registry: how each entity type folds into window metrics
//!
//! Loaded from JSON keyed by entity type:
//!
//! ```json
//! {
//!   "feeding": [
//!     {"metric": "feed_total_ml", "fold": "sum", "fields": ["amount", "feedAmount"]},
//!     {"metric": "feed_count", "fold": "count"}
//!   ],
//!   "sleep": [
//!     {"metric": "sleep_total_hours", "fold": "duration",
//!      "start_field": "sleepStart", "end_field": "sleepEnd", "unit": "hours"}
//!   ]
//! }
//! ```

use super::window::Contribution;
use crate::error::{RelayError, RelayResult};
use crate::capture::normalizer::parse_timestamp;
use crate::types::{ChangeEvent, Payload};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A duration endpoint: wall-clock time of day or a full timestamp
#[derive(Debug, Clone, Copy, PartialEq)]
enum TimePoint {
    Clock(NaiveTime),
    Instant(DateTime<Utc>),
}

impl TimePoint {
    fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        ["%H:%M", "%H:%M:%S"]
            .iter()
            .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
            .map(TimePoint::Clock)
            .or_else(|| parse_timestamp(text).map(TimePoint::Instant))
    }

    fn minutes_until(&self, end: &TimePoint) -> Option<f64> {
        let elapsed = match (self, end) {
            (TimePoint::Clock(start), TimePoint::Clock(end)) => {
                let secs = (*end - *start).num_seconds();
                if secs < 0 {
                    secs + 24 * 3600
                } else {
                    secs
                }
            }
            (TimePoint::Instant(start), TimePoint::Instant(end)) if end >= start => {
                (*end - *start).num_seconds()
            }
            _ => return None,
        };
        Some(elapsed as f64 / 60.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationUnit {
    Minutes,
    Hours,
}

impl DurationUnit {
    fn from_minutes(&self, minutes: f64) -> f64 {
        match self {
            DurationUnit::Minutes => minutes,
            DurationUnit::Hours => minutes / 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fold", rename_all = "snake_case")]
pub enum FoldFn {
    /// 1 per event
    Count,
    /// First numeric field present, in order
    Sum { fields: Vec<String> },
    /// 1 when the field is truthy, 0 otherwise
    CountIf { field: String },
    /// Elapsed time between two clock or timestamp fields of one row;
    /// clock times wrap past midnight
    Duration {
        start_field: String,
        end_field: String,
        unit: DurationUnit,
    },
}

impl FoldFn {
    pub fn evaluate(&self, payload: &Payload) -> Option<f64> {
        match self {
            FoldFn::Count => Some(1.0),
            FoldFn::Sum { fields } => fields
                .iter()
                .find_map(|f| payload.get(f).and_then(|v| v.as_f64())),
            FoldFn::CountIf { field } => Some(
                if payload.get(field).and_then(|v| v.as_bool()).unwrap_or(false) {
                    1.0
                } else {
                    0.0
                },
            ),
            FoldFn::Duration {
                start_field,
                end_field,
                unit,
            } => {
                let start = payload.get(start_field)?.as_text()?;
                let end = payload.get(end_field)?.as_text()?;
                let minutes = TimePoint::parse(start)?.minutes_until(&TimePoint::parse(end)?)?;
                Some(unit.from_minutes(minutes))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub metric: String,
    #[serde(flatten)]
    pub fold: FoldFn,
}

impl MetricRule {
    pub fn new(metric: impl Into<String>, fold: FoldFn) -> Self {
        Self {
            metric: metric.into(),
            fold,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricRegistry {
    rules: BTreeMap<String, Vec<MetricRule>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: impl Into<String>, rule: MetricRule) -> &mut Self {
        self.rules.entry(entity_type.into()).or_default().push(rule);
        self
    }

    pub fn from_json_str(json: &str) -> RelayResult<Self> {
        let registry: MetricRegistry = serde_json::from_str(json)?;
        for (entity_type, rules) in &registry.rules {
            if rules.iter().any(|r| r.metric.trim().is_empty()) {
                return Err(RelayError::MalformedEvent(format!(
                    "metric registry: empty metric name under '{}'",
                    entity_type
                )));
            }
        }
        Ok(registry)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RelayResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let registry = Self::from_json_str(&json)?;
        log::info!(
            "📋 Loaded metric registry from {} ({} entity types)",
            path.as_ref().display(),
            registry.rules.len()
        );
        Ok(registry)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn rules_for(&self, entity_type: &str) -> &[MetricRule] {
        self.rules.get(entity_type).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Metric deltas one event contributes. Unknown entity types contribute nothing.
    pub fn evaluate(&self, event: &ChangeEvent) -> Contribution {
        let mut deltas = Contribution::new();
        for rule in self.rules_for(&event.entity_type) {
            match rule.fold.evaluate(&event.payload) {
                Some(value) => {
                    *deltas.entry(rule.metric.clone()).or_insert(0.0) += value;
                }
                None => log::debug!(
                    "{} {}: no value for {} ({:?})",
                    event.entity_type,
                    event.id,
                    rule.metric,
                    rule.fold
                ),
            }
        }
        deltas
    }

    /// Built-in rules for the nursery log tables
    pub fn nursery_defaults() -> Self {
        let mut registry = Self::new();
        let sum = |fields: &[&str]| FoldFn::Sum {
            fields: fields.iter().map(|f| f.to_string()).collect(),
        };

        registry
            .register("feeding", MetricRule::new("feed_total_ml", sum(&["amount", "feedAmount"])))
            .register("feeding", MetricRule::new("feed_count", FoldFn::Count))
            .register(
                "sleep",
                MetricRule::new(
                    "sleep_total_hours",
                    FoldFn::Duration {
                        start_field: "sleepStart".to_string(),
                        end_field: "sleepEnd".to_string(),
                        unit: DurationUnit::Hours,
                    },
                ),
            )
            .register("sleep", MetricRule::new("sleep_count", FoldFn::Count))
            .register("diaper", MetricRule::new("diaper_count", FoldFn::Count))
            .register(
                "diaper",
                MetricRule::new(
                    "diaper_solid_count",
                    FoldFn::CountIf {
                        field: "diaperSolid".to_string(),
                    },
                ),
            )
            .register(
                "cry",
                MetricRule::new("cry_total_minutes", sum(&["duration", "cryDuration"])),
            )
            .register("cry", MetricRule::new("cry_count", FoldFn::Count))
            .register(
                "outside",
                MetricRule::new("outside_total_minutes", sum(&["outsideDuration", "duration"])),
            )
            .register("biometric", MetricRule::new("steps_total", sum(&["steps"])))
            .register("biometric", MetricRule::new("biometric_sample_count", FoldFn::Count));

        registry
    }
}
