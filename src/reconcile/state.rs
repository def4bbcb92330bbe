use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    lot::{elapsed_display, lane},
    models::{AnalyticsSummary, LotSnapshot, Notification, Spot},
    store::Document,
};

/// Local, eventually consistent copy of the shared documents plus the
/// tick-derived elapsed strings.
#[derive(Debug, Clone)]
pub struct LotViewState {
    pub spots: LotSnapshot,
    pub analytics: AnalyticsSummary,
    /// Recomputed on every tick, never written to the store.
    pub elapsed: Vec<Option<String>>,
    pub spots_revision: u64,
    pub analytics_revision: u64,
}

impl LotViewState {
    /// All vacant, all zero: what the lot shows before the first push arrives.
    pub fn new(capacity: usize) -> Self {
        Self {
            spots: LotSnapshot::vacant(capacity),
            analytics: AnalyticsSummary::default(),
            elapsed: vec![None; capacity],
            spots_revision: 0,
            analytics_revision: 0,
        }
    }

    /// Replaces the local spots wholesale. Returns `false` for an empty push,
    /// which leaves the local copy alone.
    pub fn apply_spots(&mut self, document: &Document, now: DateTime<Utc>) -> Result<bool> {
        self.spots_revision = document.revision;
        let Some(value) = document.value.as_ref().filter(|v| !v.is_null()) else {
            return Ok(false);
        };
        let spots: Vec<Spot> = serde_json::from_value(value.clone())
            .with_context(|| format!("spots revision {} is malformed", document.revision))?;
        self.spots = LotSnapshot::normalized(spots, self.spots.capacity());
        self.refresh_elapsed(now);
        Ok(true)
    }

    pub fn apply_analytics(&mut self, document: &Document) -> Result<bool> {
        self.analytics_revision = document.revision;
        let Some(value) = document.value.as_ref().filter(|v| !v.is_null()) else {
            return Ok(false);
        };
        self.analytics = serde_json::from_value(value.clone())
            .with_context(|| format!("analytics revision {} is malformed", document.revision))?;
        Ok(true)
    }

    pub fn refresh_elapsed(&mut self, now: DateTime<Utc>) {
        self.elapsed = self
            .spots
            .spots()
            .iter()
            .map(|spot| elapsed_display(spot, now))
            .collect();
    }

    pub fn view(&self, lane_size: usize, notification: Option<Notification>) -> LotView {
        let spots = self
            .spots
            .spots()
            .iter()
            .enumerate()
            .map(|(index, spot)| SpotView {
                index,
                number: index + 1,
                lane: lane(index, lane_size),
                occupied: spot.occupied,
                occupied_since: spot.occupied_since,
                elapsed: self.elapsed.get(index).cloned().flatten(),
                last_duration: if spot.occupied {
                    None
                } else {
                    self.analytics.durations.get(&index).cloned()
                },
            })
            .collect();

        LotView {
            capacity: self.spots.capacity(),
            occupied: self.spots.occupied_count(),
            spots,
            analytics: self.analytics.clone(),
            notification,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotView {
    pub index: usize,
    pub number: usize,
    pub lane: usize,
    pub occupied: bool,
    pub occupied_since: Option<DateTime<Utc>>,
    pub elapsed: Option<String>,
    /// Only shown for a vacant spot that has been occupied before.
    pub last_duration: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LotView {
    pub capacity: usize,
    pub occupied: usize,
    pub spots: Vec<SpotView>,
    pub analytics: AnalyticsSummary,
    pub notification: Option<Notification>,
}
