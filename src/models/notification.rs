use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transient message describing the outcome of the last action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub message: String,
    pub expires_at: DateTime<Utc>,
}
