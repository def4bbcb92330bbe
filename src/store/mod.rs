//! Shared, subscribable document store holding the `spots` and `analytics` documents.
//!
//! Every connected client reads and writes the same two documents. Writes are
//! unconditional by default (last writer wins); `write_whole_if` is the opt-in
//! revision check for callers that want to detect a concurrent writer.

mod memory;
mod migrations;
mod sqlite;

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::watch;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DocumentPath {
    Spots,
    Analytics,
}

impl DocumentPath {
    pub const ALL: [DocumentPath; 2] = [DocumentPath::Spots, DocumentPath::Analytics];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentPath::Spots => "spots",
            DocumentPath::Analytics => "analytics",
        }
    }
}

impl FromStr for DocumentPath {
    type Err = StoreError;

    fn from_str(value: &str) -> StoreResult<Self> {
        match value {
            "spots" => Ok(DocumentPath::Spots),
            "analytics" => Ok(DocumentPath::Analytics),
            other => Err(StoreError::UnknownPath(other.to_string())),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current value at a path. `revision` counts accepted writes; 0 means never written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    pub value: Option<Value>,
    pub revision: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("revision conflict on {path}: expected {expected}, found {actual}")]
    Conflict {
        path: DocumentPath,
        expected: u64,
        actual: u64,
    },
    #[error("unknown document path '{0}'")]
    UnknownPath(String),
    #[error("document at {0} is not an object")]
    NotAnObject(DocumentPath),
    #[error("failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// The receiver already holds the current document; later writes show up
    /// through `changed()`. Intermediate values may be coalesced.
    fn subscribe(&self, path: DocumentPath) -> watch::Receiver<Document>;

    /// Replaces the whole document. Returns the new revision.
    async fn write_whole(&self, path: DocumentPath, value: Value) -> StoreResult<u64>;

    /// Merges top-level `fields` into the stored object, leaving other fields untouched.
    async fn write_partial(&self, path: DocumentPath, fields: Map<String, Value>)
        -> StoreResult<u64>;

    /// `write_whole`, but only if nobody has written since `expected_revision`.
    async fn write_whole_if(
        &self,
        path: DocumentPath,
        value: Value,
        expected_revision: u64,
    ) -> StoreResult<u64>;
}

pub(crate) fn merge_fields(
    path: DocumentPath,
    existing: Option<Value>,
    fields: Map<String, Value>,
) -> StoreResult<Value> {
    let mut target = match existing {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(object)) => object,
        Some(_) => return Err(StoreError::NotAnObject(path)),
    };
    for (key, value) in fields {
        target.insert(key, value);
    }
    Ok(Value::Object(target))
}

/// Publishes `next` unless the channel already holds a newer revision.
pub(crate) fn publish(sender: &watch::Sender<Document>, next: Document) {
    sender.send_if_modified(|current| {
        if next.revision > current.revision {
            *current = next;
            true
        } else {
            false
        }
    });
}
