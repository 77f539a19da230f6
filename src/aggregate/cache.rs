use super::window::{local_midnight_utc, AggregateWindow, WindowKind};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Read-side view of a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub entity_owner_id: String,
    pub window_kind: WindowKind,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub utc_offset_secs: i32,
    pub metrics: BTreeMap<String, f64>,
    pub last_applied: BTreeMap<String, u64>,
    pub computed_at: DateTime<Utc>,
}

impl Summary {
    pub fn metric(&self, name: &str) -> f64 {
        self.metrics.get(name).copied().unwrap_or(0.0)
    }

    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_secs) else {
            return false;
        };
        ts >= local_midnight_utc(self.window_start, offset)
            && ts < local_midnight_utc(self.window_end, offset)
    }
}

impl From<&AggregateWindow> for Summary {
    fn from(window: &AggregateWindow) -> Self {
        Self {
            entity_owner_id: window.entity_owner_id.clone(),
            window_kind: window.window_kind,
            window_start: window.window_start,
            window_end: window.window_end,
            utc_offset_secs: window.utc_offset_secs,
            metrics: window.metrics.clone(),
            last_applied: window.last_applied.clone(),
            computed_at: window.computed_at,
        }
    }
}

/// Latest summary per `(owner, kind)`, written through on every window update
#[derive(Default)]
pub struct SummaryCache {
    entries: RwLock<HashMap<(String, WindowKind), Summary>>,
}

impl SummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `window` unless a newer window for the same owner and kind is
    /// already cached. Returns whether the cache changed.
    pub fn put(&self, window: &AggregateWindow) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            log::error!("❌ Summary cache lock poisoned");
            return false;
        };
        let key = (window.entity_owner_id.clone(), window.window_kind);
        match entries.get(&key) {
            Some(existing) if existing.window_start > window.window_start => false,
            Some(existing)
                if existing.window_start == window.window_start
                    && existing.computed_at > window.computed_at =>
            {
                false
            }
            _ => {
                entries.insert(key, Summary::from(window));
                true
            }
        }
    }

    /// Latest cached summary, current or not
    pub fn get(&self, owner_id: &str, kind: WindowKind) -> Option<Summary> {
        self.entries
            .read()
            .ok()?
            .get(&(owner_id.to_string(), kind))
            .cloned()
    }

    /// Cached summary only when its window covers `now`
    pub fn get_current(&self, owner_id: &str, kind: WindowKind, now: DateTime<Utc>) -> Option<Summary> {
        self.get(owner_id, kind).filter(|s| s.covers(now))
    }

    pub fn invalidate(&self, owner_id: &str, kind: WindowKind) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(&(owner_id.to_string(), kind));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
