//! Single-slot, self-expiring user message.
//!
//! Only one expiry timer is ever live. Setting a new message aborts the
//! previous timer, and a generation counter keeps a timer that already woke
//! up from clearing a newer message.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle};

use crate::models::Notification;

const ENABLE_LOGS: bool = false;

use crate::log_debug;

#[derive(Default)]
struct ExpirySlot {
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Drop for ExpirySlot {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct NotifierInner {
    slot: Mutex<ExpirySlot>,
    current: watch::Sender<Option<Notification>>,
}

impl NotifierInner {
    fn lock(&self) -> MutexGuard<'_, ExpirySlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[derive(Clone)]
pub struct SessionNotifier {
    inner: Arc<NotifierInner>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                slot: Mutex::new(ExpirySlot::default()),
                current: watch::Sender::new(None),
            }),
        }
    }

    /// Replaces whatever is showing and restarts the expiry clock at `ttl`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set(&self, message: impl Into<String>, ttl: Duration) -> Notification {
        let notification = Notification {
            message: message.into(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };

        let mut slot = self.inner.lock();
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        slot.generation = slot.generation.wrapping_add(1);
        let generation = slot.generation;

        log_debug!("notification #{generation}: {}", notification.message);
        self.inner.current.send_replace(Some(notification.clone()));

        let inner = Arc::clone(&self.inner);
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut slot = inner.lock();
            if slot.generation == generation {
                slot.timer = None;
                inner.current.send_replace(None);
                log_debug!("notification #{generation} expired");
            }
        }));

        notification
    }

    pub fn clear(&self) {
        let mut slot = self.inner.lock();
        if let Some(previous) = slot.timer.take() {
            previous.abort();
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.inner.current.send_replace(None);
    }

    pub fn current(&self) -> Option<Notification> {
        self.inner.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Notification>> {
        self.inner.current.subscribe()
    }
}

impl Default for SessionNotifier {
    fn default() -> Self {
        Self::new()
    }
}
