use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{LotSnapshot, Spot};

pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_LANE_SIZE: usize = 5;

/// Expected, user-facing refusals. Never a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Rejection {
    #[error("lot full")]
    LotFull,
    #[error("lot empty")]
    LotEmpty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub snapshot: LotSnapshot,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub snapshot: LotSnapshot,
    pub index: usize,
    pub duration: String,
}

/// First-fit: occupies the lowest-indexed vacant spot.
pub fn assign(snapshot: &LotSnapshot, now: DateTime<Utc>) -> Result<Assignment, Rejection> {
    let index = snapshot
        .spots()
        .iter()
        .position(|spot| !spot.occupied)
        .ok_or(Rejection::LotFull)?;

    let mut next = snapshot.clone();
    next.set(index, Spot::occupied_at(now));
    Ok(Assignment {
        snapshot: next,
        index,
    })
}

/// Vacates the highest-indexed occupied spot, regardless of when it was taken.
pub fn release(snapshot: &LotSnapshot, now: DateTime<Utc>) -> Result<Release, Rejection> {
    let index = snapshot
        .spots()
        .iter()
        .rposition(|spot| spot.occupied)
        .ok_or(Rejection::LotEmpty)?;

    let duration = match snapshot.spots()[index].occupied_since {
        Some(since) => format_elapsed(since, now),
        None => format_elapsed(now, now),
    };

    let mut next = snapshot.clone();
    next.set(index, Spot::vacant());
    Ok(Release {
        snapshot: next,
        index,
        duration,
    })
}

pub fn reset(capacity: usize) -> LotSnapshot {
    LotSnapshot::vacant(capacity)
}

/// One-based lane number; lanes group `lane_size` consecutive spots.
pub fn lane(index: usize, lane_size: usize) -> usize {
    index / lane_size.max(1) + 1
}

/// Live stay for an occupied spot, `None` when vacant.
pub fn elapsed_display(spot: &Spot, now: DateTime<Utc>) -> Option<String> {
    match (spot.occupied, spot.occupied_since) {
        (true, Some(since)) => Some(format_elapsed(since, now)),
        _ => None,
    }
}

/// Floors to whole minutes and seconds. A `since` in the future reads as zero.
pub fn format_elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let ms = (now - since).num_milliseconds().max(0);
    let mins = ms / 60_000;
    let secs = (ms % 60_000) / 1_000;
    format!("{mins}m {secs}s")
}
