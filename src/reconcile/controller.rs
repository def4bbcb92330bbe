use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    analytics,
    lot::{self, Rejection},
    models::{AnalyticsDelta, AnalyticsSummary, LotSnapshot},
    notifier::SessionNotifier,
    settings::{heartbeat_every_ticks, LotSettings},
    store::{Document, DocumentPath, RemoteStore, StoreError},
};

use super::state::{LotView, LotViewState};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ActionOutcome {
    Assigned { index: usize, lane: usize },
    Released { index: usize, lane: usize, duration: String },
    Reset,
    Rejected { reason: Rejection },
    /// Only with conditional writes: someone else wrote `spots` first.
    Conflict,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum LotEvent {
    SpotsChanged { revision: u64 },
    AnalyticsChanged { revision: u64 },
    Tick { elapsed: Vec<Option<String>> },
}

struct SyncTasks {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for SyncTasks {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the local view of the lot: keeps it in step with the store, ticks
/// elapsed times, and turns Enter/Exit/Reset into store writes.
#[derive(Clone)]
pub struct LotController {
    client_id: Arc<str>,
    store: Arc<dyn RemoteStore>,
    settings: LotSettings,
    state: Arc<Mutex<LotViewState>>,
    notifier: SessionNotifier,
    events: broadcast::Sender<LotEvent>,
    tasks: Arc<Mutex<Option<SyncTasks>>>,
}

impl LotController {
    pub fn new(store: Arc<dyn RemoteStore>, settings: LotSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client_id: Uuid::new_v4().to_string().into(),
            state: Arc::new(Mutex::new(LotViewState::new(settings.capacity))),
            store,
            settings,
            notifier: SessionNotifier::new(),
            events,
            tasks: Arc::new(Mutex::new(None)),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn notifier(&self) -> &SessionNotifier {
        &self.notifier
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LotEvent> {
        self.events.subscribe()
    }

    pub async fn view(&self) -> LotView {
        let state = self.state.lock().await;
        state.view(self.settings.lane_size, self.notifier.current())
    }

    /// Subscribes to both documents and starts the tick. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut guard = self.tasks.lock().await;
        if guard.is_some() {
            log_warn!("client {} already syncing", self.client_id);
            return;
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(DocumentPath::ALL.len() + 1);
        for path in DocumentPath::ALL {
            handles.push(tokio::spawn(sync_document(
                path,
                self.store.subscribe(path),
                self.state.clone(),
                self.events.clone(),
                cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(tick_loop(
            self.settings.clone(),
            self.state.clone(),
            self.events.clone(),
            cancel.clone(),
        )));

        log_info!("client {} syncing lot of {} spots", self.client_id, self.settings.capacity);
        *guard = Some(SyncTasks { cancel, handles });
    }

    /// Stops both subscriptions and the tick, and waits for them to finish.
    pub async fn shutdown(&self) {
        let Some(mut tasks) = self.tasks.lock().await.take() else {
            return;
        };
        tasks.cancel.cancel();
        for handle in tasks.handles.drain(..) {
            if let Err(err) = handle.await {
                log_error!("sync task for client {} failed to join: {err}", self.client_id);
            }
        }
        log_info!("client {} stopped syncing", self.client_id);
    }

    pub async fn enter(&self) -> Result<ActionOutcome> {
        let now = Utc::now();
        let (spots, summary, revision) = self.local_copy().await;

        let assignment = match lot::assign(&spots, now) {
            Ok(assignment) => assignment,
            Err(rejection) => return Ok(self.reject(rejection)),
        };
        if !self.write_spots(&assignment.snapshot, revision).await? {
            return Ok(self.conflicted());
        }

        self.record(analytics::on_assign(&summary, now), "entry").await;

        let index = assignment.index;
        let lane = lot::lane(index, self.settings.lane_size);
        log_info!("client {} assigned spot {index} (lane {lane})", self.client_id);
        self.notifier.set(
            format!("Assigned to Spot {} (Lane {lane})", index + 1),
            self.settings.action_notice_ttl(),
        );
        Ok(ActionOutcome::Assigned { index, lane })
    }

    pub async fn exit(&self) -> Result<ActionOutcome> {
        let now = Utc::now();
        let (spots, summary, revision) = self.local_copy().await;

        let released = match lot::release(&spots, now) {
            Ok(released) => released,
            Err(rejection) => return Ok(self.reject(rejection)),
        };
        if !self.write_spots(&released.snapshot, revision).await? {
            return Ok(self.conflicted());
        }

        let index = released.index;
        self.record(
            analytics::on_release(&summary, index, &released.duration, now),
            "exit",
        )
        .await;

        let lane = lot::lane(index, self.settings.lane_size);
        log_info!(
            "client {} released spot {index} after {}",
            self.client_id,
            released.duration
        );
        self.notifier.set(
            format!("Spot {} released after {}", index + 1, released.duration),
            self.settings.action_notice_ttl(),
        );
        Ok(ActionOutcome::Released {
            index,
            lane,
            duration: released.duration,
        })
    }

    /// Unconditional: a reset never depends on what the lot held before.
    pub async fn reset(&self) -> Result<ActionOutcome> {
        let now = Utc::now();
        let fresh = lot::reset(self.settings.capacity);
        self.store
            .write_whole(DocumentPath::Spots, serde_json::to_value(&fresh)?)
            .await
            .context("failed to reset spots")?;
        self.store
            .write_whole(
                DocumentPath::Analytics,
                serde_json::to_value(analytics::on_reset(now))?,
            )
            .await
            .context("failed to reset analytics")?;

        log_info!("client {} reset the lot", self.client_id);
        self.notifier
            .set("Parking lot reset.", self.settings.reset_notice_ttl());
        Ok(ActionOutcome::Reset)
    }

    async fn local_copy(&self) -> (LotSnapshot, AnalyticsSummary, u64) {
        let state = self.state.lock().await;
        (
            state.spots.clone(),
            state.analytics.clone(),
            state.spots_revision,
        )
    }

    /// Returns `false` when a conditional write lost to another client.
    async fn write_spots(&self, snapshot: &LotSnapshot, revision: u64) -> Result<bool> {
        let value = serde_json::to_value(snapshot)?;
        let written = if self.settings.conditional_writes {
            self.store
                .write_whole_if(DocumentPath::Spots, value, revision)
                .await
        } else {
            self.store.write_whole(DocumentPath::Spots, value).await
        };

        match written {
            Ok(_) => Ok(true),
            Err(StoreError::Conflict {
                expected, actual, ..
            }) => {
                log_warn!(
                    "client {} lost spots write: based on revision {expected}, store at {actual}",
                    self.client_id
                );
                Ok(false)
            }
            Err(err) => Err(anyhow::Error::new(err).context("failed to write spots")),
        }
    }

    /// Runs after `spots` has committed, so a failure here must not undo the action.
    async fn record(&self, delta: AnalyticsDelta, what: &str) {
        let fields = match delta.to_fields() {
            Ok(fields) => fields,
            Err(err) => {
                log_error!("client {} could not encode {what} analytics: {err}", self.client_id);
                return;
            }
        };
        if let Err(err) = self
            .store
            .write_partial(DocumentPath::Analytics, fields)
            .await
        {
            log_warn!("client {} failed to record {what}: {err}", self.client_id);
        }
    }

    fn reject(&self, rejection: Rejection) -> ActionOutcome {
        let message = match rejection {
            Rejection::LotFull => "No spots available!",
            Rejection::LotEmpty => "All spots are already empty!",
        };
        log_debug!("client {} rejected: {rejection}", self.client_id);
        self.notifier.set(message, self.settings.action_notice_ttl());
        ActionOutcome::Rejected { reason: rejection }
    }

    fn conflicted(&self) -> ActionOutcome {
        self.notifier.set(
            "Parking lot changed, try again.",
            self.settings.action_notice_ttl(),
        );
        ActionOutcome::Conflict
    }
}

async fn sync_document(
    path: DocumentPath,
    mut rx: watch::Receiver<Document>,
    state: Arc<Mutex<LotViewState>>,
    events: broadcast::Sender<LotEvent>,
    cancel: CancellationToken,
) {
    loop {
        // First pass applies whatever the store held at subscribe time.
        let document = rx.borrow_and_update().clone();
        let applied = {
            let mut guard = state.lock().await;
            match path {
                DocumentPath::Spots => guard.apply_spots(&document, Utc::now()),
                DocumentPath::Analytics => guard.apply_analytics(&document),
            }
        };

        match applied {
            Ok(true) => {
                let event = match path {
                    DocumentPath::Spots => LotEvent::SpotsChanged {
                        revision: document.revision,
                    },
                    DocumentPath::Analytics => LotEvent::AnalyticsChanged {
                        revision: document.revision,
                    },
                };
                let _ = events.send(event);
            }
            Ok(false) => log_debug!("{path} push at revision {} was empty", document.revision),
            Err(err) => log_warn!("ignoring {path} push: {err:#}"),
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    log_warn!("{path} subscription closed by store");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn tick_loop(
    settings: LotSettings,
    state: Arc<Mutex<LotViewState>>,
    events: broadcast::Sender<LotEvent>,
    cancel: CancellationToken,
) {
    let mut interval = time::interval(settings.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let heartbeat_every = heartbeat_every_ticks();
    let mut ticks: u32 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let (elapsed, occupied) = {
                    let mut guard = state.lock().await;
                    guard.refresh_elapsed(Utc::now());
                    (guard.elapsed.clone(), guard.spots.occupied_count())
                };

                ticks = ticks.wrapping_add(1);
                if ticks % heartbeat_every == 0 {
                    log_debug!("tick {ticks}: {occupied}/{} occupied", settings.capacity);
                }
                let _ = events.send(LotEvent::Tick { elapsed });
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn fast_settings() -> LotSettings {
        LotSettings {
            tick_interval_ms: 20,
            ..LotSettings::default()
        }
    }

    async fn wait_until<F>(controller: &LotController, predicate: F) -> LotView
    where
        F: Fn(&LotView) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let view = controller.view().await;
                if predicate(&view) {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("controller never reached the expected state")
    }

    fn notice(view: &LotView) -> Option<&str> {
        view.notification.as_ref().map(|n| n.message.as_str())
    }

    #[tokio::test]
    async fn renders_vacant_lot_before_first_push() {
        let controller = LotController::new(MemoryStore::new(), LotSettings::default());
        let view = controller.view().await;
        assert_eq!(view.capacity, 10);
        assert_eq!(view.occupied, 0);
        assert!(view.spots.iter().all(|s| !s.occupied && s.elapsed.is_none()));
        assert_eq!(view.analytics.entries, 0);
        assert_eq!(view.analytics.exits, 0);
        assert!(view.notification.is_none());
    }

    #[tokio::test]
    async fn enter_writes_store_and_reconciles_from_push() {
        let store = MemoryStore::new();
        let controller = LotController::new(store.clone(), fast_settings());
        controller.start().await;

        let outcome = controller.enter().await.unwrap();
        assert_eq!(outcome, ActionOutcome::Assigned { index: 0, lane: 1 });

        let view = wait_until(&controller, |v| v.occupied == 1 && v.analytics.entries == 1).await;
        assert!(view.spots[0].occupied);
        assert_eq!(notice(&view), Some("Assigned to Spot 1 (Lane 1)"));
        assert_eq!(
            store.current(DocumentPath::Analytics).value.unwrap()["entries"],
            json!(1)
        );

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn fill_reject_and_drain_scenario() {
        let store = MemoryStore::new();
        let controller = LotController::new(store.clone(), fast_settings());
        controller.start().await;

        for i in 0..10 {
            let outcome = controller.enter().await.unwrap();
            assert_eq!(
                outcome,
                ActionOutcome::Assigned {
                    index: i,
                    lane: i / 5 + 1
                }
            );
            wait_until(&controller, |v| v.occupied == i + 1 && v.analytics.entries == (i + 1) as u64)
                .await;
        }

        let spots_before = store.current(DocumentPath::Spots);
        let outcome = controller.enter().await.unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Rejected {
                reason: Rejection::LotFull
            }
        );
        assert_eq!(store.current(DocumentPath::Spots), spots_before);
        assert_eq!(notice(&controller.view().await), Some("No spots available!"));

        let first = controller.exit().await.unwrap();
        let ActionOutcome::Released { index: 9, lane: 2, duration } = &first else {
            panic!("expected spot 10 to be released, got {first:?}");
        };
        let view = wait_until(&controller, |v| v.occupied == 9 && v.analytics.exits == 1).await;
        assert_eq!(
            notice(&view),
            Some(format!("Spot 10 released after {duration}").as_str())
        );
        assert_eq!(view.spots[9].last_duration.as_deref(), Some(duration.as_str()));

        for remaining in (0..9).rev() {
            let outcome = controller.exit().await.unwrap();
            assert!(matches!(outcome, ActionOutcome::Released { index, .. } if index == remaining));
            wait_until(&controller, |v| {
                v.occupied == remaining && v.analytics.exits == (10 - remaining) as u64
            })
            .await;
        }

        let view = controller.view().await;
        assert_eq!(view.analytics.entries, 10);
        assert_eq!(view.analytics.exits, 10);
        assert_eq!(
            view.analytics.durations.keys().copied().collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
        assert!(view.spots.iter().all(|s| !s.occupied && s.last_duration.is_some()));

        let outcome = controller.exit().await.unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::Rejected {
                reason: Rejection::LotEmpty
            }
        );

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn reset_clears_spots_and_analytics() {
        let store = MemoryStore::new();
        let controller = LotController::new(store.clone(), fast_settings());
        controller.start().await;

        controller.enter().await.unwrap();
        wait_until(&controller, |v| v.occupied == 1).await;
        controller.exit().await.unwrap();
        wait_until(&controller, |v| v.analytics.exits == 1).await;
        controller.enter().await.unwrap();
        wait_until(&controller, |v| v.occupied == 1 && v.analytics.entries == 2).await;

        assert_eq!(controller.reset().await.unwrap(), ActionOutcome::Reset);
        let view = wait_until(&controller, |v| {
            v.occupied == 0 && v.analytics.entries == 0 && v.analytics.durations.is_empty()
        })
        .await;
        assert_eq!(view.analytics.exits, 0);
        assert!(view.analytics.last_updated.is_some());
        assert_eq!(notice(&view), Some("Parking lot reset."));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn tick_shows_live_elapsed_time() {
        let store = MemoryStore::new();
        let since = Utc::now() - chrono::Duration::seconds(125);
        store
            .write_whole(
                DocumentPath::Spots,
                json!([{"occupied": true, "occupiedSince": since.timestamp_millis()}]),
            )
            .await
            .unwrap();

        let controller = LotController::new(store, fast_settings());
        let mut events = controller.subscribe_events();
        controller.start().await;

        let elapsed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(LotEvent::Tick { elapsed }) if elapsed[0].is_some() => return elapsed,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(err) => panic!("event stream ended: {err}"),
                }
            }
        })
        .await
        .expect("no tick with elapsed time");

        assert!(elapsed[0].as_deref().is_some_and(|e| e.starts_with("2m ")));
        assert_eq!(elapsed.len(), 10);
        assert!(elapsed[1..].iter().all(Option::is_none));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn stale_clients_lose_updates_under_last_writer_wins() {
        let store = MemoryStore::new();
        let a = LotController::new(store.clone(), fast_settings());
        // `b` never syncs, so it acts on the all-vacant default.
        let b = LotController::new(store.clone(), fast_settings());
        a.start().await;

        assert_eq!(a.enter().await.unwrap(), ActionOutcome::Assigned { index: 0, lane: 1 });
        wait_until(&a, |v| v.occupied == 1 && v.analytics.entries == 1).await;

        assert_eq!(b.enter().await.unwrap(), ActionOutcome::Assigned { index: 0, lane: 1 });

        let spots = store.current(DocumentPath::Spots);
        let occupied = spots
            .value
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .filter(|spot| spot["occupied"] == json!(true))
            .count();
        assert_eq!(occupied, 1);
        let analytics = store.current(DocumentPath::Analytics).value.unwrap();
        assert_eq!(analytics["entries"], json!(1));

        a.shutdown().await;
    }

    #[tokio::test]
    async fn conditional_writes_refuse_stale_snapshot() {
        let store = MemoryStore::new();
        let settings = LotSettings {
            conditional_writes: true,
            ..fast_settings()
        };
        let a = LotController::new(store.clone(), settings.clone());
        let b = LotController::new(store.clone(), settings);
        a.start().await;

        a.enter().await.unwrap();
        wait_until(&a, |v| v.occupied == 1 && v.analytics.entries == 1).await;

        assert_eq!(b.enter().await.unwrap(), ActionOutcome::Conflict);
        assert_eq!(notice(&b.view().await), Some("Parking lot changed, try again."));
        assert_eq!(store.current(DocumentPath::Spots).revision, 1);
        assert_eq!(store.current(DocumentPath::Analytics).revision, 1);

        b.start().await;
        wait_until(&b, |v| v.occupied == 1).await;
        assert_eq!(b.enter().await.unwrap(), ActionOutcome::Assigned { index: 1, lane: 1 });

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn unavailable_store_leaves_state_untouched() {
        let store = MemoryStore::new();
        let controller = LotController::new(store.clone(), fast_settings());
        controller.start().await;
        store.set_available(false);

        assert!(controller.enter().await.is_err());
        let view = controller.view().await;
        assert_eq!(view.occupied, 0);
        assert_eq!(view.analytics.entries, 0);
        assert_eq!(store.current(DocumentPath::Spots).revision, 0);

        controller.shutdown().await;
    }

    /// Accepts whole-document writes but refuses every field patch.
    struct PatchRefusingStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for PatchRefusingStore {
        fn subscribe(&self, path: DocumentPath) -> watch::Receiver<Document> {
            self.inner.subscribe(path)
        }

        async fn write_whole(
            &self,
            path: DocumentPath,
            value: serde_json::Value,
        ) -> crate::store::StoreResult<u64> {
            self.inner.write_whole(path, value).await
        }

        async fn write_partial(
            &self,
            path: DocumentPath,
            _fields: serde_json::Map<String, serde_json::Value>,
        ) -> crate::store::StoreResult<u64> {
            Err(StoreError::Unavailable(format!("{path} patches refused")))
        }

        async fn write_whole_if(
            &self,
            path: DocumentPath,
            value: serde_json::Value,
            expected_revision: u64,
        ) -> crate::store::StoreResult<u64> {
            self.inner.write_whole_if(path, value, expected_revision).await
        }
    }

    #[tokio::test]
    async fn failed_analytics_patch_still_reports_committed_action() {
        let inner = MemoryStore::new();
        let store = Arc::new(PatchRefusingStore {
            inner: inner.clone(),
        });
        let controller = LotController::new(store, fast_settings());
        controller.start().await;

        let outcome = controller.enter().await.unwrap();
        assert_eq!(outcome, ActionOutcome::Assigned { index: 0, lane: 1 });
        let view = wait_until(&controller, |v| v.occupied == 1).await;
        assert_eq!(notice(&view), Some("Assigned to Spot 1 (Lane 1)"));
        assert_eq!(inner.current(DocumentPath::Spots).revision, 1);
        assert_eq!(inner.current(DocumentPath::Analytics).revision, 0);

        // A retry moves on to the next spot instead of failing again.
        assert_eq!(
            controller.enter().await.unwrap(),
            ActionOutcome::Assigned { index: 1, lane: 1 }
        );
        wait_until(&controller, |v| v.occupied == 2).await;

        let outcome = controller.exit().await.unwrap();
        assert!(matches!(outcome, ActionOutcome::Released { index: 1, .. }));
        let view = wait_until(&controller, |v| v.occupied == 1).await;
        assert!(notice(&view).is_some_and(|m| m.starts_with("Spot 2 released after ")));
        assert_eq!(view.analytics.exits, 0);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_reconciliation() {
        let store = MemoryStore::new();
        let controller = LotController::new(store.clone(), fast_settings());
        controller.start().await;
        controller.shutdown().await;

        store
            .write_whole(DocumentPath::Spots, json!([{"occupied": true, "occupiedSince": 0}]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(controller.view().await.occupied, 0);

        // A second shutdown is harmless.
        controller.shutdown().await;
    }
}
