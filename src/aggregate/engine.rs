//! Incremental window aggregation over stream entries
//!
//! Every entry touches the DAY and WEEK windows of its owner at
//! `observed_at`, plus whichever windows still hold an earlier version of
//! the same row. Each window keeps a per-partition high-water mark so
//! re-delivered entries are no-ops, and a per-event contribution so UPDATE
//! and DELETE reverse exactly what was added.

use super::registry::MetricRegistry;
use super::timezone::OwnerTimezones;
use super::window::{AggregateWindow, WindowKey, WindowKind};
use crate::types::{Operation, StreamEntry};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// What a single `apply` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Windows whose metrics or high-water marks changed
    pub updated: Vec<WindowKey>,
    /// Archived windows the entry belongs to; fold it into their snapshots
    /// with `fold_late`
    pub late: Vec<WindowKey>,
    /// Windows that start before the retention horizon and are gone for good
    pub expired: Vec<WindowKey>,
    /// Windows that had already applied this sequence
    pub skipped: usize,
}

impl ApplyOutcome {
    pub fn is_noop(&self) -> bool {
        self.updated.is_empty() && self.late.is_empty()
    }
}

pub struct WindowAggregator {
    registry: MetricRegistry,
    timezones: OwnerTimezones,
    grace: Duration,
    windows: HashMap<WindowKey, AggregateWindow>,
    /// Archived windows and their high-water marks
    archived: HashMap<WindowKey, BTreeMap<String, u64>>,
    /// (owner, event id) -> windows holding that event's contribution
    placements: HashMap<(String, String), BTreeSet<WindowKey>>,
    /// Windows starting before this date were forgotten and are never recreated
    horizon: Option<NaiveDate>,
    now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl WindowAggregator {
    pub fn new(registry: MetricRegistry, timezones: OwnerTimezones, grace: Duration) -> Self {
        Self::with_clock(registry, timezones, grace, Box::new(Utc::now))
    }

    pub fn with_clock(
        registry: MetricRegistry,
        timezones: OwnerTimezones,
        grace: Duration,
        now_fn: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            registry,
            timezones,
            grace,
            windows: HashMap::new(),
            archived: HashMap::new(),
            placements: HashMap::new(),
            horizon: None,
            now_fn,
        }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn timezones(&self) -> &OwnerTimezones {
        &self.timezones
    }

    pub fn apply(&mut self, entry: &StreamEntry) -> ApplyOutcome {
        let event = &entry.event;
        let owner = event.entity_owner_id.as_str();
        let offset = self.timezones.offset_for(owner);
        let placement_key = (owner.to_string(), event.id.clone());

        let targets: BTreeSet<WindowKey> = WindowKind::ALL
            .iter()
            .map(|kind| WindowKey::containing(owner, *kind, event.observed_at, offset))
            .collect();
        let prior = self
            .placements
            .get(&placement_key)
            .cloned()
            .unwrap_or_default();

        let deltas = match event.operation {
            Operation::Delete => None,
            Operation::Insert | Operation::Update => Some(self.registry.evaluate(event)),
        };

        let now = (self.now_fn)();
        let mut outcome = ApplyOutcome::default();

        for key in prior.union(&targets) {
            let is_target = targets.contains(key);

            if let Some(high_water) = self.archived.get(key) {
                let applied = high_water
                    .get(&entry.partition)
                    .is_some_and(|hw| entry.sequence <= *hw);
                if applied {
                    outcome.skipped += 1;
                } else {
                    log::info!(
                        "⏰ Late {} {} for archived window {} (seq {}#{})",
                        event.operation.as_str(),
                        event.id,
                        key,
                        entry.partition,
                        entry.sequence
                    );
                    outcome.late.push(key.clone());
                }
                continue;
            }

            if !self.windows.contains_key(key) && self.is_beyond_horizon(key) {
                log::warn!(
                    "⚠️  {} {} targets forgotten window {} (seq {}#{}), not folded",
                    event.operation.as_str(),
                    event.id,
                    key,
                    entry.partition,
                    entry.sequence
                );
                outcome.expired.push(key.clone());
                continue;
            }

            // A delete for a row this window never held needs no window
            if !self.windows.contains_key(key) && (deltas.is_none() || !is_target) {
                continue;
            }

            let window = self
                .windows
                .entry(key.clone())
                .or_insert_with(|| AggregateWindow::new(key, offset, now));

            if window.is_applied(&entry.partition, entry.sequence) {
                outcome.skipped += 1;
                continue;
            }

            match (&deltas, is_target) {
                (Some(deltas), true) => window.set_contribution(&event.id, deltas.clone()),
                _ => {
                    window.retract(&event.id);
                }
            }
            window.mark_applied(&entry.partition, entry.sequence);
            window.computed_at = now;
            outcome.updated.push(key.clone());
        }

        self.refresh_placement(placement_key, prior.union(&targets).cloned().collect());
        outcome
    }

    /// Recompute which windows hold an event after `candidates` may have changed
    fn refresh_placement(&mut self, placement_key: (String, String), candidates: Vec<WindowKey>) {
        let previous = self.placements.remove(&placement_key).unwrap_or_default();
        let holding: BTreeSet<WindowKey> = candidates
            .into_iter()
            .filter(|key| match self.windows.get(key) {
                Some(window) => window.holds(&placement_key.1),
                None => self.archived.contains_key(key) && previous.contains(key),
            })
            .collect();
        if !holding.is_empty() {
            self.placements.insert(placement_key, holding);
        }
    }

    pub fn window(&self, key: &WindowKey) -> Option<&AggregateWindow> {
        self.windows.get(key)
    }

    /// Live windows whose latest fold on `entry.partition` was `entry`
    ///
    /// Covers a re-delivered entry whose fold reached memory but whose
    /// snapshot write did not.
    pub fn windows_settled_by(&self, entry: &StreamEntry) -> Vec<AggregateWindow> {
        self.windows
            .values()
            .filter(|w| w.last_applied_sequence(&entry.partition) == Some(entry.sequence))
            .cloned()
            .collect()
    }

    pub fn windows(&self) -> impl Iterator<Item = &AggregateWindow> {
        self.windows.values()
    }

    pub fn is_archived(&self, key: &WindowKey) -> bool {
        self.archived.contains_key(key)
    }

    pub fn archived_count(&self) -> usize {
        self.archived.len()
    }

    /// Freeze windows whose end plus grace has passed.
    ///
    /// Returned windows carry `archived = true` and should be snapshotted;
    /// later entries for them surface as `ApplyOutcome::late`.
    pub fn archive_expired(&mut self, now: DateTime<Utc>) -> Vec<AggregateWindow> {
        let expired: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(_, w)| w.ends_at() + self.grace <= now)
            .map(|(k, _)| k.clone())
            .collect();

        let mut archived = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(mut window) = self.windows.remove(&key) {
                window.archived = true;
                self.archived.insert(key, window.last_applied.clone());
                archived.push(window);
            }
        }

        if !archived.is_empty() {
            log::info!("🗄️  Archived {} windows past grace", archived.len());
        }
        archived
    }

    /// Replace an archived window with a recomputed version
    pub fn install_rebuilt(&mut self, window: AggregateWindow) {
        let key = window.key();
        let owner = window.entity_owner_id.clone();

        for (placement_key, keys) in self.placements.iter_mut() {
            if placement_key.0 == owner && !window.holds(&placement_key.1) {
                keys.remove(&key);
            }
        }
        self.placements.retain(|_, keys| !keys.is_empty());
        for id in window.contributions.keys() {
            self.placements
                .entry((owner.clone(), id.clone()))
                .or_default()
                .insert(key.clone());
        }

        if window.archived {
            self.windows.remove(&key);
            self.archived.insert(key, window.last_applied.clone());
        } else {
            self.windows.insert(key, window);
        }
    }

    /// Load snapshotted windows after a restart
    pub fn restore(&mut self, windows: Vec<AggregateWindow>) {
        let count = windows.len();
        for window in windows {
            self.install_rebuilt(window);
        }
        log::info!(
            "♻️  Restored {} windows ({} live, {} archived)",
            count,
            self.windows.len(),
            self.archived.len()
        );
    }

    pub fn retention_horizon(&self) -> Option<NaiveDate> {
        self.horizon
    }

    /// Refuse to recreate windows starting before `horizon`. Never moves back.
    pub fn set_retention_horizon(&mut self, horizon: NaiveDate) {
        if self.horizon.map_or(true, |current| horizon > current) {
            self.horizon = Some(horizon);
        }
    }

    pub fn is_beyond_horizon(&self, key: &WindowKey) -> bool {
        self.horizon.is_some_and(|horizon| key.window_start < horizon)
    }

    /// Drop archived windows that started before `cutoff` and move the
    /// retention horizon up to it
    pub fn forget_archived_before(&mut self, cutoff: NaiveDate) -> usize {
        let before = self.archived.len();
        self.archived.retain(|key, _| key.window_start >= cutoff);
        for keys in self.placements.values_mut() {
            keys.retain(|key| key.window_start >= cutoff || self.windows.contains_key(key));
        }
        self.placements.retain(|_, keys| !keys.is_empty());
        self.set_retention_horizon(cutoff);
        before - self.archived.len()
    }

    /// Fold a late `entry` into the snapshot of an archived window.
    ///
    /// Starts from the snapshot's contributions and high-water marks, so
    /// entries purged from the stream keep counting. The result is not
    /// installed; call `install_rebuilt` once it is durable.
    pub fn fold_late(&self, snapshot: AggregateWindow, entry: &StreamEntry) -> AggregateWindow {
        let key = snapshot.key();
        let mut scratch = WindowAggregator::new(
            self.registry.clone(),
            self.timezones.clone(),
            self.grace,
        );
        let mut base = snapshot.clone();
        base.archived = false;
        scratch.install_rebuilt(base);

        let outcome = scratch.apply(entry);
        let mut window = match scratch.windows.remove(&key) {
            Some(window) => window,
            None => snapshot,
        };
        window.archived = true;
        if outcome.updated.contains(&key) {
            window.computed_at = (self.now_fn)();
            log::info!(
                "🔁 Folded late {}#{} into archived window {}",
                entry.partition,
                entry.sequence,
                key
            );
        }
        window
    }

    /// Fold `entries` into a scratch aggregator and return the `key` window
    ///
    /// Only sound for windows whose entries are all still retained, so keys
    /// behind the retention horizon yield `None`.
    pub fn rebuild_window<'a, I>(&self, key: &WindowKey, entries: I) -> Option<AggregateWindow>
    where
        I: IntoIterator<Item = &'a StreamEntry>,
    {
        if self.is_beyond_horizon(key) {
            return None;
        }
        let mut scratch = WindowAggregator::new(
            self.registry.clone(),
            self.timezones.clone(),
            self.grace,
        );
        let mut folded = 0usize;
        for entry in entries {
            if entry.event.entity_owner_id == key.owner_id {
                scratch.apply(entry);
                folded += 1;
            }
        }

        let mut window = scratch.windows.remove(key)?;
        window.archived = self.archived.contains_key(key);
        window.computed_at = (self.now_fn)();
        log::info!("🔁 Rebuilt window {} from {} entries", key, folded);
        Some(window)
    }
}
