//! Bounded, time-windowed duplicate suppression keyed by `(id, content_hash)`

use crate::types::{ChangeEvent, StreamEntry};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Seen inside the window; `sequence` is set once the first copy was published
    Duplicate { sequence: Option<u64> },
}

#[derive(Debug, Clone)]
struct Seen {
    content_hash: String,
    admitted_at: DateTime<Utc>,
    sequence: Option<u64>,
}

pub struct Deduplicator {
    window: Duration,
    max_per_id: usize,
    seen: HashMap<String, VecDeque<Seen>>,
    /// Admission order, oldest first, for pruning
    expiry: VecDeque<(DateTime<Utc>, String)>,
    duplicates_dropped: u64,
}

impl Deduplicator {
    pub fn new(window: Duration, max_per_id: usize) -> Self {
        Self {
            window,
            max_per_id: max_per_id.max(1),
            seen: HashMap::new(),
            expiry: VecDeque::new(),
            duplicates_dropped: 0,
        }
    }

    pub fn admit(&mut self, event: &ChangeEvent, now: DateTime<Utc>) -> Admission {
        self.prune(now);

        if let Some(versions) = self.seen.get(&event.id) {
            if let Some(prior) = versions
                .iter()
                .find(|s| s.content_hash == event.content_hash)
            {
                self.duplicates_dropped += 1;
                log::debug!(
                    "🔁 Duplicate {} {} (first admitted {})",
                    event.operation.as_str(),
                    event.id,
                    prior.admitted_at
                );
                return Admission::Duplicate {
                    sequence: prior.sequence,
                };
            }
        }

        self.remember(&event.id, &event.content_hash, now, None);
        Admission::Accepted
    }

    fn remember(&mut self, id: &str, hash: &str, at: DateTime<Utc>, sequence: Option<u64>) {
        let versions = self.seen.entry(id.to_string()).or_default();
        versions.push_back(Seen {
            content_hash: hash.to_string(),
            admitted_at: at,
            sequence,
        });
        while versions.len() > self.max_per_id {
            versions.pop_front();
        }
        self.expiry.push_back((at, id.to_string()));
    }

    /// Attach the stream sequence to an admitted event
    pub fn record_published(&mut self, id: &str, content_hash: &str, sequence: u64) {
        if let Some(seen) = self
            .seen
            .get_mut(id)
            .and_then(|v| v.iter_mut().rev().find(|s| s.content_hash == content_hash))
        {
            seen.sequence = Some(sequence);
        }
    }

    /// Drop an admission whose publish ultimately failed, so a redelivery is not
    /// mistaken for a duplicate
    pub fn forget(&mut self, id: &str, content_hash: &str) {
        if let Some(versions) = self.seen.get_mut(id) {
            versions.retain(|s| s.content_hash != content_hash);
            if versions.is_empty() {
                self.seen.remove(id);
            }
        }
    }

    /// Evict everything admitted at or before `now - window`
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let mut evicted = 0;

        while let Some((admitted_at, _)) = self.expiry.front() {
            if *admitted_at > cutoff {
                break;
            }
            if let Some((_, id)) = self.expiry.pop_front() {
                if let Some(versions) = self.seen.get_mut(&id) {
                    let before = versions.len();
                    versions.retain(|s| s.admitted_at > cutoff);
                    evicted += before - versions.len();
                    if versions.is_empty() {
                        self.seen.remove(&id);
                    }
                }
            }
        }

        evicted
    }

    /// Seed from recently published entries after a restart
    pub fn warm(&mut self, entries: &[StreamEntry]) {
        for entry in entries {
            let already = self
                .seen
                .get(&entry.event.id)
                .map(|v| v.iter().any(|s| s.content_hash == entry.event.content_hash))
                .unwrap_or(false);
            if !already {
                self.remember(
                    &entry.event.id,
                    &entry.event.content_hash,
                    entry.published_at,
                    Some(entry.sequence),
                );
            }
        }
        log::info!("🔥 Deduplicator warmed with {} published entries", entries.len());
    }

    /// Number of remembered `(id, hash)` pairs
    pub fn len(&self) -> usize {
        self.seen.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates_dropped
    }
}
