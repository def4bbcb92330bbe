//! Aggregate counters stored under the `analytics` document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    #[serde(default)]
    pub entries: u64,
    #[serde(default)]
    pub exits: u64,
    /// Last known stay per spot index, e.g. `"2m 5s"`. Overwritten on each release.
    #[serde(default)]
    pub durations: BTreeMap<usize, String>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Field-level patch for the `analytics` document.
///
/// Only the `Some` fields are written, so a delta never touches fields it
/// does not carry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exits: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durations: Option<BTreeMap<usize, String>>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
}

impl AnalyticsDelta {
    /// The delta as the JSON object handed to a partial store write.
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => Ok(fields),
            other => Err(serde::ser::Error::custom(format!(
                "analytics delta serialized to non-object {other}"
            ))),
        }
    }
}
