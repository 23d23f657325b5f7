//! One open list, wired end to end.

use std::sync::Arc;

use kaimono_types::{ListId, PrincipalId};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::engine::ReconciliationEngine;
use crate::error::ReconcileError;
use crate::store::RemoteStore;
use crate::subscriptions::{ChangeFeedManager, FeedState};
use crate::view::ViewSnapshot;

/// An engine plus its change-feed subscription for one list.
///
/// `open` subscribes before the initial load so nothing committed in
/// between is missed; `close` unsubscribes and closes the engine, after
/// which late events are dropped.
pub struct ListSession {
    engine: ReconciliationEngine,
    feeds: ChangeFeedManager,
}

impl ListSession {
    pub async fn open(
        store: Arc<dyn RemoteStore>,
        list_id: ListId,
        actor: PrincipalId,
        config: ClientConfig,
    ) -> Result<Self, ReconcileError> {
        let feeds = ChangeFeedManager::new(store.clone(), &config);
        Self::open_with(store, feeds, list_id, actor, config).await
    }

    /// Open using a feed manager shared with other sessions of this client.
    pub async fn open_with(
        store: Arc<dyn RemoteStore>,
        feeds: ChangeFeedManager,
        list_id: ListId,
        actor: PrincipalId,
        config: ClientConfig,
    ) -> Result<Self, ReconcileError> {
        let engine = ReconciliationEngine::new(store, list_id, actor, config);
        feeds.subscribe(list_id, Arc::new(engine.clone())).await?;
        if let Err(e) = engine.load().await {
            // Leave nothing subscribed behind a session the caller never got.
            if let Err(unsub) = feeds.unsubscribe(list_id).await {
                warn!(list = %list_id, "unsubscribe after failed open: {unsub}");
            }
            engine.close();
            return Err(e);
        }
        info!(list = %list_id, items = engine.snapshot().items.len(), "List session opened");
        Ok(Self { engine, feeds })
    }

    pub fn list_id(&self) -> ListId {
        self.engine.list_id()
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn view(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.engine.subscribe_view()
    }

    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.engine.snapshot()
    }

    pub fn feed_state(&self) -> FeedState {
        self.feeds.state(self.engine.list_id())
    }

    pub async fn close(self) -> Result<(), ReconcileError> {
        let list_id = self.engine.list_id();
        self.engine.close();
        self.feeds.unsubscribe(list_id).await?;
        info!(list = %list_id, "List session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        FeedSink, MemorySession, MemoryStore, PositionUpdate, StoreError, SubscriptionHandle,
    };
    use async_trait::async_trait;
    use kaimono_types::{CorrelationId, NewRecord, Principal, Record, RecordId, RecordPatch};

    #[tokio::test]
    async fn test_open_loads_and_subscribes() {
        let store = MemoryStore::new();
        let amy = Principal::new("amy", "Amy Park");
        let list = store.create_list(amy.id);
        let seed = store.session(&amy);
        seed.create_record(list, &NewRecord::new("Milk"), CorrelationId::new())
            .await
            .unwrap();

        let session = ListSession::open(Arc::new(store.session(&amy)), list, amy.id, ClientConfig::default())
            .await
            .unwrap();
        assert_eq!(session.snapshot().items.len(), 1);
        assert_eq!(session.feed_state(), FeedState::Active);
        assert_eq!(store.subscriber_count(list), 1);

        session.close().await.unwrap();
        assert_eq!(store.subscriber_count(list), 0);
    }

    #[tokio::test]
    async fn test_failed_initial_load_unsubscribes() {
        let store = MemoryStore::new();
        let amy = Principal::new("amy", "Amy Park");
        let list = store.create_list(amy.id);
        let client = Arc::new(store.session(&amy));
        // Subscribing answers without a round trip; the load's response is lost.
        client.lose_next_response(StoreError::transient("reset"));
        let err = ListSession::open(client, list, amy.id, ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
        assert_eq!(store.subscriber_count(list), 0);
    }

    #[tokio::test]
    async fn test_unshared_list_is_refused() {
        let store = MemoryStore::new();
        let owner = Principal::new("amy", "Amy Park");
        let outsider = Principal::new("eve", "Eve");
        let list = store.create_list(owner.id);
        let err = ListSession::open(
            Arc::new(store.session(&outsider)),
            list,
            outsider.id,
            ClientConfig::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, ReconcileError::Authorization(_)));
    }

    /// Subscribes fine, then fails every load and unsubscribe.
    struct Unreachable(MemorySession);

    #[async_trait]
    impl RemoteStore for Unreachable {
        async fn list_records(&self, _list_id: ListId) -> Result<Vec<Record>, StoreError> {
            Err(StoreError::transient("load timed out"))
        }

        async fn create_record(
            &self,
            list_id: ListId,
            payload: &NewRecord,
            token: CorrelationId,
        ) -> Result<Record, StoreError> {
            self.0.create_record(list_id, payload, token).await
        }

        async fn update_record(
            &self,
            id: RecordId,
            patch: &RecordPatch,
            token: CorrelationId,
        ) -> Result<Record, StoreError> {
            self.0.update_record(id, patch, token).await
        }

        async fn soft_delete_record(&self, id: RecordId, token: CorrelationId) -> Result<(), StoreError> {
            self.0.soft_delete_record(id, token).await
        }

        async fn batch_update_positions(
            &self,
            updates: &[PositionUpdate],
            token: CorrelationId,
        ) -> Result<(), StoreError> {
            self.0.batch_update_positions(updates, token).await
        }

        async fn soft_delete_done(
            &self,
            list_id: ListId,
            token: CorrelationId,
        ) -> Result<Vec<RecordId>, StoreError> {
            self.0.soft_delete_done(list_id, token).await
        }

        async fn subscribe(
            &self,
            list_id: ListId,
            sink: FeedSink,
        ) -> Result<SubscriptionHandle, StoreError> {
            self.0.subscribe(list_id, sink).await
        }

        async fn unsubscribe(&self, _handle: &SubscriptionHandle) -> Result<(), StoreError> {
            Err(StoreError::transient("unsubscribe timed out"))
        }
    }

    #[tokio::test]
    async fn test_failed_open_reports_load_error_when_unsubscribe_fails() {
        let store = MemoryStore::new();
        let amy = Principal::new("amy", "Amy Park");
        let list = store.create_list(amy.id);
        let client: Arc<dyn RemoteStore> = Arc::new(Unreachable(store.session(&amy)));
        let feeds = ChangeFeedManager::new(client.clone(), &ClientConfig::default());

        let err = ListSession::open_with(client, feeds.clone(), list, amy.id, ClientConfig::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err, ReconcileError::TransientNetwork("load timed out".into()));
        assert_eq!(feeds.state(list), FeedState::Unsubscribed);
    }
}
