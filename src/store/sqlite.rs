use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::{error, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch};

use super::{
    merge_fields, migrations::run_migrations, publish, Document, DocumentPath, RemoteStore,
    StoreError, StoreResult,
};

type StoreTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct WorkerInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Durable single-file store. All SQLite access happens on one worker thread;
/// callers hand it closures and await the reply.
pub struct SqliteStore {
    worker: Arc<WorkerInner>,
    spots: watch::Sender<Document>,
    analytics: watch::Sender<Document>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Vec<(DocumentPath, Document)>>>();
        let path_for_thread = path.clone();

        let worker = thread::Builder::new()
            .name("parkgenius-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(
                            anyhow::Error::new(err).context("failed to open SQLite store")
                        ));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result = run_migrations(&mut conn)
                    .context("failed to run store migrations")
                    .and_then(|_| load_documents(&conn));
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(&mut conn),
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        let loaded = ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        let spots = watch::Sender::new(Document::default());
        let analytics = watch::Sender::new(Document::default());
        for (doc_path, document) in loaded {
            match doc_path {
                DocumentPath::Spots => spots.send_replace(document),
                DocumentPath::Analytics => analytics.send_replace(document),
            };
        }

        info!("Store opened at {}", path.display());

        Ok(Arc::new(Self {
            worker: Arc::new(WorkerInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            spots,
            analytics,
            path,
        }))
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn sender(&self, path: DocumentPath) -> &watch::Sender<Document> {
        match path {
            DocumentPath::Spots => &self.spots,
            DocumentPath::Analytics => &self.analytics,
        }
    }

    async fn execute<F, T>(&self, task: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = StoreCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        self.worker
            .sender
            .send(command)
            .map_err(|err| StoreError::Unavailable(format!("store thread gone: {err}")))?;

        reply_rx
            .await
            .map_err(|_| StoreError::Unavailable("store thread terminated unexpectedly".into()))?
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn to_i64(revision: u64) -> StoreResult<i64> {
    i64::try_from(revision)
        .map_err(|_| StoreError::Unavailable(format!("revision {revision} exceeds SQLite INTEGER range")))
}

fn load_documents(conn: &Connection) -> Result<Vec<(DocumentPath, Document)>> {
    let mut stmt = conn.prepare("SELECT path, body, revision FROM documents")?;
    let mut rows = stmt.query([])?;
    let mut documents = Vec::new();
    while let Some(row) = rows.next()? {
        let raw_path: String = row.get(0)?;
        let Ok(path) = raw_path.parse::<DocumentPath>() else {
            warn!("Ignoring unknown stored document '{raw_path}'");
            continue;
        };
        let body: Option<String> = row.get(1)?;
        let revision: i64 = row.get(2)?;
        let value = body
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .with_context(|| format!("stored {path} document is not valid JSON"))?;
        let revision =
            u64::try_from(revision).map_err(|_| anyhow!("{path} has negative revision {revision}"))?;
        documents.push((path, Document { value, revision }));
    }
    Ok(documents)
}

fn read_document(tx: &Transaction<'_>, path: DocumentPath) -> StoreResult<Document> {
    let row: Option<(Option<String>, i64)> = tx
        .query_row(
            "SELECT body, revision FROM documents WHERE path = ?1",
            params![path.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(backend)?;

    match row {
        None => Ok(Document::default()),
        Some((body, revision)) => Ok(Document {
            value: body.map(|raw| serde_json::from_str(&raw)).transpose()?,
            revision: u64::try_from(revision).unwrap_or_default(),
        }),
    }
}

fn write_document(
    tx: &Transaction<'_>,
    path: DocumentPath,
    value: &Value,
    revision: u64,
) -> StoreResult<()> {
    let body = serde_json::to_string(value)?;
    tx.execute(
        "INSERT INTO documents (path, body, revision, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(path) DO UPDATE SET
             body = excluded.body,
             revision = excluded.revision,
             updated_at = excluded.updated_at",
        params![path.as_str(), body, to_i64(revision)?, Utc::now().to_rfc3339()],
    )
    .map_err(backend)?;
    Ok(())
}

#[async_trait]
impl RemoteStore for SqliteStore {
    fn subscribe(&self, path: DocumentPath) -> watch::Receiver<Document> {
        self.sender(path).subscribe()
    }

    async fn write_whole(&self, path: DocumentPath, value: Value) -> StoreResult<u64> {
        let stored = value.clone();
        let revision = self
            .execute(move |conn| {
                let tx = conn.transaction().map_err(backend)?;
                let next = read_document(&tx, path)?.revision + 1;
                write_document(&tx, path, &stored, next)?;
                tx.commit().map_err(backend)?;
                Ok(next)
            })
            .await?;

        publish(
            self.sender(path),
            Document {
                value: Some(value),
                revision,
            },
        );
        Ok(revision)
    }

    async fn write_partial(
        &self,
        path: DocumentPath,
        fields: Map<String, Value>,
    ) -> StoreResult<u64> {
        let (merged, revision) = self
            .execute(move |conn| {
                let tx = conn.transaction().map_err(backend)?;
                let current = read_document(&tx, path)?;
                let merged = merge_fields(path, current.value, fields)?;
                let next = current.revision + 1;
                write_document(&tx, path, &merged, next)?;
                tx.commit().map_err(backend)?;
                Ok((merged, next))
            })
            .await?;

        publish(
            self.sender(path),
            Document {
                value: Some(merged),
                revision,
            },
        );
        Ok(revision)
    }

    async fn write_whole_if(
        &self,
        path: DocumentPath,
        value: Value,
        expected_revision: u64,
    ) -> StoreResult<u64> {
        let stored = value.clone();
        let revision = self
            .execute(move |conn| {
                let tx = conn.transaction().map_err(backend)?;
                let actual = read_document(&tx, path)?.revision;
                if actual != expected_revision {
                    return Err(StoreError::Conflict {
                        path,
                        expected: expected_revision,
                        actual,
                    });
                }
                write_document(&tx, path, &stored, actual + 1)?;
                tx.commit().map_err(backend)?;
                Ok(actual + 1)
            })
            .await?;

        publish(
            self.sender(path),
            Document {
                value: Some(value),
                revision,
            },
        );
        Ok(revision)
    }
}
