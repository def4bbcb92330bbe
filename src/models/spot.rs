//! Spot records and the lot snapshot stored under the `spots` document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Spot {
    pub occupied: bool,
    /// Older clients wrote this field as `timestamp`.
    #[serde(
        default,
        alias = "timestamp",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub occupied_since: Option<DateTime<Utc>>,
}

impl Spot {
    pub fn vacant() -> Self {
        Self::default()
    }

    pub fn occupied_at(at: DateTime<Utc>) -> Self {
        Self {
            occupied: true,
            occupied_since: Some(at),
        }
    }
}

/// Ordered, index-addressed spot records. The index is the spot's identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LotSnapshot {
    spots: Vec<Spot>,
}

impl LotSnapshot {
    pub fn vacant(capacity: usize) -> Self {
        Self {
            spots: vec![Spot::vacant(); capacity],
        }
    }

    /// Coerces a pushed document into exactly `capacity` records.
    ///
    /// Short arrays are padded with vacant spots, long ones truncated, and a
    /// vacant spot never keeps an `occupied_since`.
    pub fn normalized(mut spots: Vec<Spot>, capacity: usize) -> Self {
        spots.resize(capacity, Spot::vacant());
        for spot in spots.iter_mut() {
            if !spot.occupied {
                spot.occupied_since = None;
            }
        }
        Self { spots }
    }

    pub fn capacity(&self) -> usize {
        self.spots.len()
    }

    pub fn spots(&self) -> &[Spot] {
        &self.spots
    }

    pub fn get(&self, index: usize) -> Option<&Spot> {
        self.spots.get(index)
    }

    pub fn occupied_count(&self) -> usize {
        self.spots.iter().filter(|spot| spot.occupied).count()
    }

    pub(crate) fn set(&mut self, index: usize, spot: Spot) {
        self.spots[index] = spot;
    }
}
