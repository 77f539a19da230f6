//! Calendar windows in an owner's local time
//!
//! A DAY window covers `[local midnight, next local midnight)`, a WEEK window
//! covers `[Monday 00:00, next Monday 00:00)`. Offsets are fixed, so every
//! local wall-clock instant maps to exactly one UTC instant.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowKind {
    #[serde(rename = "DAY")]
    Day,
    #[serde(rename = "WEEK")]
    Week,
}

impl WindowKind {
    pub const ALL: [WindowKind; 2] = [WindowKind::Day, WindowKind::Week];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Day => "DAY",
            WindowKind::Week => "WEEK",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DAY" => Some(WindowKind::Day),
            "WEEK" => Some(WindowKind::Week),
            _ => None,
        }
    }

    /// `[start, end)` local dates of the window containing `date`
    pub fn bounds(&self, date: NaiveDate) -> (NaiveDate, NaiveDate) {
        match self {
            WindowKind::Day => (date, date + Duration::days(1)),
            WindowKind::Week => {
                let start = date - Duration::days(date.weekday().num_days_from_monday() as i64);
                (start, start + Duration::days(7))
            }
        }
    }
}

/// UTC instant of local midnight starting `date`
pub fn local_midnight_utc(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let local = date.and_time(NaiveTime::MIN);
    Utc.from_utc_datetime(&(local - Duration::seconds(offset.local_minus_utc() as i64)))
}

pub fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub owner_id: String,
    pub kind: WindowKind,
    pub window_start: NaiveDate,
}

impl WindowKey {
    pub fn new(owner_id: impl Into<String>, kind: WindowKind, window_start: NaiveDate) -> Self {
        Self {
            owner_id: owner_id.into(),
            kind,
            window_start,
        }
    }

    /// Key of the `kind` window that holds `ts` for this owner
    pub fn containing(
        owner_id: &str,
        kind: WindowKind,
        ts: DateTime<Utc>,
        offset: FixedOffset,
    ) -> Self {
        let (start, _) = kind.bounds(local_date(ts, offset));
        Self::new(owner_id, kind, start)
    }

    pub fn window_end(&self) -> NaiveDate {
        self.kind.bounds(self.window_start).1
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.owner_id, self.kind.as_str(), self.window_start)
    }
}

/// Per-event metric deltas folded into a window
pub type Contribution = BTreeMap<String, f64>;

/// Running metrics for one owner and one calendar window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateWindow {
    pub entity_owner_id: String,
    pub window_kind: WindowKind,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub utc_offset_secs: i32,
    pub metrics: BTreeMap<String, f64>,
    /// Highest sequence applied, per partition
    pub last_applied: BTreeMap<String, u64>,
    /// What each event id currently contributes, so updates and deletes can
    /// be reversed exactly
    pub contributions: BTreeMap<String, Contribution>,
    pub computed_at: DateTime<Utc>,
    pub archived: bool,
}

impl AggregateWindow {
    pub fn new(key: &WindowKey, offset: FixedOffset, computed_at: DateTime<Utc>) -> Self {
        Self {
            entity_owner_id: key.owner_id.clone(),
            window_kind: key.kind,
            window_start: key.window_start,
            window_end: key.window_end(),
            utc_offset_secs: offset.local_minus_utc(),
            metrics: BTreeMap::new(),
            last_applied: BTreeMap::new(),
            contributions: BTreeMap::new(),
            computed_at,
            archived: false,
        }
    }

    pub fn key(&self) -> WindowKey {
        WindowKey::new(self.entity_owner_id.clone(), self.window_kind, self.window_start)
    }

    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_secs).unwrap_or_else(|| Utc.fix())
    }

    pub fn starts_at(&self) -> DateTime<Utc> {
        local_midnight_utc(self.window_start, self.offset())
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        local_midnight_utc(self.window_end, self.offset())
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.starts_at() && ts < self.ends_at()
    }

    pub fn last_applied_sequence(&self, partition: &str) -> Option<u64> {
        self.last_applied.get(partition).copied()
    }

    pub fn is_applied(&self, partition: &str, sequence: u64) -> bool {
        self.last_applied_sequence(partition)
            .is_some_and(|hw| sequence <= hw)
    }

    pub fn mark_applied(&mut self, partition: &str, sequence: u64) {
        let hw = self.last_applied.entry(partition.to_string()).or_insert(sequence);
        *hw = (*hw).max(sequence);
    }

    pub fn metric(&self, name: &str) -> f64 {
        self.metrics.get(name).copied().unwrap_or(0.0)
    }

    /// Replace whatever `id` contributed with `deltas`
    pub fn set_contribution(&mut self, id: &str, deltas: Contribution) {
        self.retract(id);
        for (metric, delta) in &deltas {
            *self.metrics.entry(metric.clone()).or_insert(0.0) += delta;
        }
        self.contributions.insert(id.to_string(), deltas);
    }

    /// Remove `id`'s contribution; false when it had none
    pub fn retract(&mut self, id: &str) -> bool {
        let Some(previous) = self.contributions.remove(id) else {
            return false;
        };
        for (metric, delta) in previous {
            if let Some(value) = self.metrics.get_mut(&metric) {
                *value -= delta;
                if value.abs() < 1e-9 {
                    *value = 0.0;
                }
            }
        }
        true
    }

    pub fn holds(&self, id: &str) -> bool {
        self.contributions.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_day_boundary_in_local_time() {
        let tz = offset(8);
        // 23:59:59 and 00:00:00 local on consecutive days
        let before = WindowKey::containing("b1", WindowKind::Day, ts("2025-04-13T15:59:59Z"), tz);
        let after = WindowKey::containing("b1", WindowKind::Day, ts("2025-04-13T16:00:00Z"), tz);

        assert_eq!(before.window_start, NaiveDate::from_ymd_opt(2025, 4, 13).unwrap());
        assert_eq!(after.window_start, NaiveDate::from_ymd_opt(2025, 4, 14).unwrap());
    }

    #[test]
    fn test_week_starts_monday() {
        // 2025-04-13 is a Sunday
        let sunday = NaiveDate::from_ymd_opt(2025, 4, 13).unwrap();
        let (start, end) = WindowKind::Week.bounds(sunday);
        assert_eq!(start, NaiveDate::from_ymd_opt(2025, 4, 7).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2025, 4, 14).unwrap());

        let monday = NaiveDate::from_ymd_opt(2025, 4, 14).unwrap();
        assert_eq!(WindowKind::Week.bounds(monday).0, monday);
    }

    #[test]
    fn test_window_instants_follow_offset() {
        let key = WindowKey::new("b1", WindowKind::Day, NaiveDate::from_ymd_opt(2025, 4, 13).unwrap());
        let window = AggregateWindow::new(&key, offset(8), Utc::now());
        assert_eq!(window.starts_at(), ts("2025-04-12T16:00:00Z"));
        assert_eq!(window.ends_at(), ts("2025-04-13T16:00:00Z"));
        assert!(window.contains(ts("2025-04-13T15:59:59Z")));
        assert!(!window.contains(ts("2025-04-13T16:00:00Z")));
    }

    #[test]
    fn test_contributions_reverse_exactly() {
        let key = WindowKey::new("b1", WindowKind::Day, NaiveDate::from_ymd_opt(2025, 4, 13).unwrap());
        let mut window = AggregateWindow::new(&key, offset(0), Utc::now());

        let delta = |v: f64| Contribution::from([("feed_total_ml".to_string(), v)]);
        window.set_contribution("A", delta(100.0));
        window.set_contribution("B", delta(50.0));
        window.set_contribution("A", delta(120.0));
        assert_eq!(window.metric("feed_total_ml"), 170.0);

        assert!(window.retract("A"));
        assert!(!window.retract("A"));
        assert_eq!(window.metric("feed_total_ml"), 50.0);
    }

    #[test]
    fn test_high_water_mark() {
        let key = WindowKey::new("b1", WindowKind::Day, NaiveDate::from_ymd_opt(2025, 4, 13).unwrap());
        let mut window = AggregateWindow::new(&key, offset(0), Utc::now());
        assert!(!window.is_applied("events", 0));

        window.mark_applied("events", 5);
        window.mark_applied("events", 3);
        assert_eq!(window.last_applied_sequence("events"), Some(5));
        assert!(window.is_applied("events", 5));
        assert!(!window.is_applied("events", 6));
        assert!(!window.is_applied("sleep", 0));
    }
}
