//! Change-feed subscriptions.
//!
//! [`ChangeFeedManager`] owns every feed subscription a client holds, keyed
//! by list. Each subscription has a pump task that decodes raw payloads into
//! [`ChangeEvent`]s and hands them to a [`FeedListener`] (normally the
//! list's [`ReconciliationEngine`](crate::ReconciliationEngine)).
//!
//! ```text
//!   Unsubscribed ──subscribe──► Subscribing ──ok──► Active ──unsubscribe──► Unsubscribed
//!                                    ▲                 │
//!                                    │            transport drop
//!                                    └── delay ◄── Error
//! ```
//!
//! At most one subscription exists per list; subscribing an already-active
//! list returns the existing handle. After a transport drop the pump waits
//! the configured delay, resubscribes, and asks the listener to resync,
//! since events emitted while the feed was down are gone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use kaimono_types::{ChangeEvent, ListId};
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::engine::ReconciliationEngine;
use crate::error::ReconcileError;
use crate::store::{FeedMessage, FeedSink, RemoteStore, SubscriptionHandle};

/// Lifecycle of one list's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FeedState {
    Unsubscribed,
    Subscribing,
    Active,
    /// Transport dropped; a resubscribe is pending.
    Error,
}

/// Receives decoded feed traffic for one list.
#[async_trait]
pub trait FeedListener: Send + Sync {
    fn on_change(&self, event: ChangeEvent);

    /// Called after a resubscribe; anything sent while the feed was down
    /// was missed.
    async fn on_resync(&self);
}

#[async_trait]
impl FeedListener for ReconciliationEngine {
    fn on_change(&self, event: ChangeEvent) {
        self.on_remote_change(event);
    }

    async fn on_resync(&self) {
        if let Err(e) = self.load().await {
            warn!(list = %self.list_id(), "resync after resubscribe failed: {e}");
        }
    }
}

struct FeedEntry {
    state: FeedState,
    handle: Option<SubscriptionHandle>,
    sink: FeedSink,
    cancel: CancellationToken,
}

struct FeedInner {
    store: Arc<dyn RemoteStore>,
    resubscribe_delay: Duration,
    entries: Mutex<HashMap<ListId, FeedEntry>>,
    /// Serializes subscribe / resubscribe / unsubscribe.
    ops: tokio::sync::Mutex<()>,
}

impl FeedInner {
    fn set_state(&self, list_id: ListId, state: FeedState) {
        if let Some(entry) = self.entries.lock().get_mut(&list_id) {
            entry.state = state;
        }
    }

    /// Renew a dropped subscription. `Ok(false)` means the list was
    /// unsubscribed meanwhile and the pump should stop.
    async fn resubscribe(&self, list_id: ListId) -> Result<bool, ReconcileError> {
        let _ops = self.ops.lock().await;
        let sink = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&list_id) else {
                return Ok(false);
            };
            if entry.cancel.is_cancelled() {
                return Ok(false);
            }
            entry.state = FeedState::Subscribing;
            entry.sink.clone()
        };
        match self.store.subscribe(list_id, sink).await {
            Ok(handle) => {
                if let Some(entry) = self.entries.lock().get_mut(&list_id) {
                    entry.state = FeedState::Active;
                    entry.handle = Some(handle);
                }
                info!(list = %list_id, "Change feed resubscribed");
                Ok(true)
            }
            Err(e) => {
                self.set_state(list_id, FeedState::Error);
                Err(e.into())
            }
        }
    }
}

impl Drop for FeedInner {
    fn drop(&mut self) {
        for entry in self.entries.get_mut().values() {
            entry.cancel.cancel();
        }
    }
}

/// Owner of every change-feed subscription for one client.
#[derive(Clone)]
pub struct ChangeFeedManager {
    inner: Arc<FeedInner>,
}

impl ChangeFeedManager {
    pub fn new(store: Arc<dyn RemoteStore>, config: &ClientConfig) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                store,
                resubscribe_delay: config.resubscribe_delay(),
                entries: Mutex::new(HashMap::new()),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self, list_id: ListId) -> FeedState {
        self.inner
            .entries
            .lock()
            .get(&list_id)
            .map_or(FeedState::Unsubscribed, |e| e.state)
    }

    /// Lists with a subscription in any state but `Unsubscribed`.
    pub fn lists(&self) -> Vec<ListId> {
        self.inner.entries.lock().keys().copied().collect()
    }

    /// Subscribe `listener` to a list's changes.
    ///
    /// A list that already has a subscription keeps it; the existing handle
    /// is returned and `listener` is not registered.
    pub async fn subscribe(
        &self,
        list_id: ListId,
        listener: Arc<dyn FeedListener>,
    ) -> Result<SubscriptionHandle, ReconcileError> {
        let _ops = self.inner.ops.lock().await;
        if let Some(entry) = self.inner.entries.lock().get(&list_id) {
            if let Some(handle) = &entry.handle {
                debug!(list = %list_id, state = %entry.state, "already subscribed");
                return Ok(handle.clone());
            }
        }

        let (sink, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.inner.entries.lock().insert(
            list_id,
            FeedEntry {
                state: FeedState::Subscribing,
                handle: None,
                sink: sink.clone(),
                cancel: cancel.clone(),
            },
        );

        match self.inner.store.subscribe(list_id, sink).await {
            Ok(handle) => {
                if let Some(entry) = self.inner.entries.lock().get_mut(&list_id) {
                    entry.state = FeedState::Active;
                    entry.handle = Some(handle.clone());
                }
                tokio::spawn(pump(
                    Arc::downgrade(&self.inner),
                    list_id,
                    rx,
                    cancel,
                    listener,
                ));
                info!(list = %list_id, subscription = handle.id.0, "Change feed subscribed");
                Ok(handle)
            }
            Err(e) => {
                self.inner.entries.lock().remove(&list_id);
                warn!(list = %list_id, "Change feed subscribe failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Drop a list's subscription. Buffered and later events are discarded.
    pub async fn unsubscribe(&self, list_id: ListId) -> Result<(), ReconcileError> {
        let _ops = self.inner.ops.lock().await;
        let Some(entry) = self.inner.entries.lock().remove(&list_id) else {
            return Ok(());
        };
        entry.cancel.cancel();
        if let Some(handle) = entry.handle {
            self.inner.store.unsubscribe(&handle).await?;
        }
        info!(list = %list_id, "Change feed unsubscribed");
        Ok(())
    }

    /// Unsubscribe every list.
    pub async fn close(&self) {
        for list_id in self.lists() {
            if let Err(e) = self.unsubscribe(list_id).await {
                warn!(list = %list_id, "unsubscribe failed: {e}");
            }
        }
    }
}

async fn pump(
    inner: Weak<FeedInner>,
    list_id: ListId,
    mut rx: mpsc::UnboundedReceiver<FeedMessage>,
    cancel: CancellationToken,
    listener: Arc<dyn FeedListener>,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => msg,
        };
        match msg {
            Some(FeedMessage::Payload(raw)) => match ChangeEvent::decode(raw) {
                Ok(event) => listener.on_change(event),
                Err(e) => warn!(list = %list_id, "dropping malformed change event: {e}"),
            },
            Some(FeedMessage::Closed { reason }) => {
                warn!(list = %list_id, %reason, "Change feed dropped");
                if !recover(&inner, list_id, &cancel).await {
                    break;
                }
                listener.on_resync().await;
            }
            None => break,
        }
    }
    debug!(list = %list_id, "feed pump stopped");
}

/// Wait and resubscribe until it works or the subscription is cancelled.
async fn recover(inner: &Weak<FeedInner>, list_id: ListId, cancel: &CancellationToken) -> bool {
    loop {
        let Some(feed) = inner.upgrade() else {
            return false;
        };
        feed.set_state(list_id, FeedState::Error);
        let delay = feed.resubscribe_delay;
        drop(feed);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(feed) = inner.upgrade() else {
            return false;
        };
        match feed.resubscribe(list_id).await {
            Ok(resumed) => return resumed,
            Err(e) => warn!(list = %list_id, "resubscribe failed, retrying: {e}"),
        }
    }
}
