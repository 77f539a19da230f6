use chrono::{FixedOffset, Offset, Utc};
use std::collections::HashMap;

/// Parse `+08:00`, `-0530`, `+8`, `Z` or `UTC`
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Some(Utc.fix());
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };

    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// Per-owner UTC offsets used to cut day and week windows
#[derive(Debug, Clone)]
pub struct OwnerTimezones {
    default: FixedOffset,
    overrides: HashMap<String, FixedOffset>,
}

impl OwnerTimezones {
    pub fn new(default: FixedOffset) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    pub fn default_offset(&self) -> FixedOffset {
        self.default
    }

    pub fn set(&mut self, owner_id: impl Into<String>, offset: FixedOffset) {
        self.overrides.insert(owner_id.into(), offset);
    }

    /// Merge `owner=+08:00,owner2=-05:00` style overrides
    pub fn extend_from_pairs(&mut self, pairs: &str) -> Result<(), String> {
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (owner, offset) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected owner=offset, got '{}'", pair))?;
            let offset = parse_utc_offset(offset)
                .ok_or_else(|| format!("bad offset '{}' for owner {}", offset.trim(), owner.trim()))?;
            self.set(owner.trim(), offset);
        }
        Ok(())
    }

    pub fn offset_for(&self, owner_id: &str) -> FixedOffset {
        self.overrides.get(owner_id).copied().unwrap_or(self.default)
    }
}
