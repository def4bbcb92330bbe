use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;

use super::{merge_fields, Document, DocumentPath, RemoteStore, StoreError, StoreResult};

/// Process-local store. Each path is a `watch` channel, so a write and its
/// broadcast happen under the channel's own lock.
pub struct MemoryStore {
    spots: watch::Sender<Document>,
    analytics: watch::Sender<Document>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spots: watch::Sender::new(Document::default()),
            analytics: watch::Sender::new(Document::default()),
            available: AtomicBool::new(true),
        })
    }

    /// While unavailable every write fails and subscribers see nothing new.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn current(&self, path: DocumentPath) -> Document {
        self.sender(path).borrow().clone()
    }

    fn sender(&self, path: DocumentPath) -> &watch::Sender<Document> {
        match path {
            DocumentPath::Spots => &self.spots,
            DocumentPath::Analytics => &self.analytics,
        }
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn subscribe(&self, path: DocumentPath) -> watch::Receiver<Document> {
        self.sender(path).subscribe()
    }

    async fn write_whole(&self, path: DocumentPath, value: Value) -> StoreResult<u64> {
        self.ensure_available()?;
        let mut revision = 0;
        self.sender(path).send_modify(|doc| {
            doc.revision += 1;
            doc.value = Some(value);
            revision = doc.revision;
        });
        Ok(revision)
    }

    async fn write_partial(
        &self,
        path: DocumentPath,
        fields: Map<String, Value>,
    ) -> StoreResult<u64> {
        self.ensure_available()?;
        let mut outcome = Ok(0);
        self.sender(path).send_if_modified(|doc| {
            match merge_fields(path, doc.value.clone(), fields) {
                Ok(merged) => {
                    doc.value = Some(merged);
                    doc.revision += 1;
                    outcome = Ok(doc.revision);
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome
    }

    async fn write_whole_if(
        &self,
        path: DocumentPath,
        value: Value,
        expected_revision: u64,
    ) -> StoreResult<u64> {
        self.ensure_available()?;
        let mut outcome = Ok(0);
        self.sender(path).send_if_modified(|doc| {
            if doc.revision != expected_revision {
                outcome = Err(StoreError::Conflict {
                    path,
                    expected: expected_revision,
                    actual: doc.revision,
                });
                return false;
            }
            doc.revision += 1;
            doc.value = Some(value);
            outcome = Ok(doc.revision);
            true
        });
        outcome
    }
}
