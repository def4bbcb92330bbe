//! Turns entry/exit events into partial updates of the `analytics` document.
//!
//! Counters are derived from the caller's local summary (`entries + 1`), not
//! incremented atomically at the store. Two clients that both enter from the
//! same stale summary write the same value and one increment is lost; this is
//! a known limitation of the shared-document model.

use chrono::{DateTime, Utc};

use crate::models::{AnalyticsDelta, AnalyticsSummary};

pub fn on_assign(summary: &AnalyticsSummary, now: DateTime<Utc>) -> AnalyticsDelta {
    AnalyticsDelta {
        entries: Some(summary.entries + 1),
        exits: None,
        durations: None,
        last_updated: now,
    }
}

/// Carries the whole durations map so the store-side merge replaces that field.
pub fn on_release(
    summary: &AnalyticsSummary,
    index: usize,
    duration: &str,
    now: DateTime<Utc>,
) -> AnalyticsDelta {
    let mut durations = summary.durations.clone();
    durations.insert(index, duration.to_string());
    AnalyticsDelta {
        entries: None,
        exits: Some(summary.exits + 1),
        durations: Some(durations),
        last_updated: now,
    }
}

pub fn on_reset(now: DateTime<Utc>) -> AnalyticsSummary {
    AnalyticsSummary {
        last_updated: Some(now),
        ..AnalyticsSummary::default()
    }
}

/// Field-level overwrite, the same merge a partial store write performs.
pub fn apply_delta(summary: &AnalyticsSummary, delta: &AnalyticsDelta) -> AnalyticsSummary {
    let mut next = summary.clone();
    if let Some(entries) = delta.entries {
        next.entries = entries;
    }
    if let Some(exits) = delta.exits {
        next.exits = exits;
    }
    if let Some(durations) = &delta.durations {
        next.durations = durations.clone();
    }
    next.last_updated = Some(delta.last_updated);
    next
}
