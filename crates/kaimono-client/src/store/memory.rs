//! In-memory remote store.
//!
//! Used by tests and the simulator. One [`MemoryStore`] is the shared
//! "server"; each client talks to it through its own [`MemorySession`],
//! which carries the principal for access checks plus per-client knobs for
//! fault injection and response latency.
//!
//! Writes commit, publish their change events to every subscriber of the
//! list (the writer included, which is where echoes come from), and only
//! then wait out the configured latency before responding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kaimono_types::{
    ChangeEvent, CorrelationId, ListId, NewRecord, Principal, PrincipalId, Record, RecordId,
    RecordPatch,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    FeedMessage, FeedSink, PositionUpdate, RemoteStore, StoreError, SubscriptionHandle,
    SubscriptionId,
};

/// One live feed subscription.
struct FeedSlot {
    id: SubscriptionId,
    session: u64,
    sink: FeedSink,
}

#[derive(Default)]
struct Backend {
    /// Every row ever created, tombstoned ones included.
    records: HashMap<RecordId, Record>,
    acl: HashMap<ListId, HashSet<PrincipalId>>,
    feeds: HashMap<ListId, Vec<FeedSlot>>,
    next_subscription: u64,
}

impl Backend {
    fn check_access(&self, list_id: ListId, principal: PrincipalId) -> Result<(), StoreError> {
        match self.acl.get(&list_id) {
            Some(members) if members.contains(&principal) => Ok(()),
            _ => Err(StoreError::Unauthorized(format!(
                "{principal:?} has no access to list {list_id:?}"
            ))),
        }
    }

    fn visible(&self, list_id: ListId) -> Vec<Record> {
        let mut rows: Vec<Record> = self
            .records
            .values()
            .filter(|r| r.list_id == list_id && !r.deleted)
            .cloned()
            .collect();
        rows.sort_by_key(Record::sort_key);
        rows
    }

    /// Look up a live record the principal may touch.
    fn live_record(&self, id: RecordId, principal: PrincipalId) -> Result<&Record, StoreError> {
        let record = self
            .records
            .get(&id)
            .filter(|r| !r.deleted)
            .ok_or(StoreError::NotFound(id))?;
        self.check_access(record.list_id, principal)?;
        Ok(record)
    }

    /// Re-stamp and store a changed row, returning the update event.
    fn commit_update(&mut self, mut record: Record, token: CorrelationId) -> (Record, ChangeEvent) {
        let previous = self.records.get(&record.id).cloned();
        record.version += 1;
        record.updated_at = kaimono_types::now_millis().max(record.updated_at + 1);
        self.records.insert(record.id, record.clone());
        let event = if record.deleted {
            ChangeEvent::Delete { record: record.clone(), correlation: Some(token) }
        } else {
            ChangeEvent::Update { record: record.clone(), previous, correlation: Some(token) }
        };
        (record, event)
    }

    fn publish(&mut self, list_id: ListId, events: Vec<ChangeEvent>) {
        let Some(slots) = self.feeds.get_mut(&list_id) else {
            return;
        };
        for event in events {
            let payload = event.encode();
            slots.retain(|slot| slot.sink.send(FeedMessage::Payload(payload.clone())).is_ok());
        }
    }
}

/// The shared in-memory "server".
#[derive(Clone, Default)]
pub struct MemoryStore {
    backend: Arc<Mutex<Backend>>,
    next_session: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty list owned (and visible) to `owner`.
    pub fn create_list(&self, owner: PrincipalId) -> ListId {
        let list_id = ListId::new();
        self.backend.lock().acl.entry(list_id).or_default().insert(owner);
        list_id
    }

    /// Grant `principal` access to a list.
    pub fn share(&self, list_id: ListId, principal: PrincipalId) {
        self.backend.lock().acl.entry(list_id).or_default().insert(principal);
    }

    /// Revoke a principal's access to a list.
    pub fn revoke(&self, list_id: ListId, principal: PrincipalId) {
        if let Some(members) = self.backend.lock().acl.get_mut(&list_id) {
            members.remove(&principal);
        }
    }

    /// Open a client session acting as `principal`.
    pub fn session(&self, principal: &Principal) -> MemorySession {
        MemorySession {
            store: self.clone(),
            principal: principal.id,
            session: self.next_session.fetch_add(1, Ordering::Relaxed),
            faults: Mutex::new(VecDeque::new()),
            lost_responses: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// The canonical non-tombstoned set of a list, bypassing access checks.
    pub fn visible_records(&self, list_id: ListId) -> Vec<Record> {
        self.backend.lock().visible(list_id)
    }

    /// Any row by id, tombstoned or not.
    pub fn record(&self, id: RecordId) -> Option<Record> {
        self.backend.lock().records.get(&id).cloned()
    }

    /// Number of live feed subscriptions on a list.
    pub fn subscriber_count(&self, list_id: ListId) -> usize {
        self.backend.lock().feeds.get(&list_id).map_or(0, Vec::len)
    }

    /// Simulate a transport drop: every subscriber of the list gets
    /// `Closed` and its subscription is discarded.
    pub fn drop_feeds(&self, list_id: ListId, reason: &str) {
        let slots = self.backend.lock().feeds.remove(&list_id).unwrap_or_default();
        debug!(list = %list_id, count = slots.len(), reason, "Dropping feed subscriptions");
        for slot in slots {
            let _ = slot.sink.send(FeedMessage::Closed { reason: reason.to_string() });
        }
    }

    /// Push an arbitrary payload to every subscriber of a list.
    pub fn inject_raw(&self, list_id: ListId, payload: serde_json::Value) {
        let mut backend = self.backend.lock();
        if let Some(slots) = backend.feeds.get_mut(&list_id) {
            slots.retain(|slot| slot.sink.send(FeedMessage::Payload(payload.clone())).is_ok());
        }
    }
}

/// One client's connection to a [`MemoryStore`].
pub struct MemorySession {
    store: MemoryStore,
    principal: PrincipalId,
    session: u64,
    faults: Mutex<VecDeque<StoreError>>,
    lost_responses: Mutex<VecDeque<StoreError>>,
    latency: Mutex<Duration>,
}

impl MemorySession {
    pub fn principal(&self) -> PrincipalId {
        self.principal
    }

    /// Make the next store call fail with `error` before touching any data.
    pub fn fail_next(&self, error: StoreError) {
        self.faults.lock().push_back(error);
    }

    /// Let the next write commit (and publish), then fail the call with
    /// `error` as if the response had been lost in transit.
    pub fn lose_next_response(&self, error: StoreError) {
        self.lost_responses.lock().push_back(error);
    }

    /// Delay every response by `latency` (after the write has committed).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        match self.faults.lock().pop_front() {
            Some(err) => {
                debug!(session = self.session, "Injected store failure: {err}");
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn respond(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match self.lost_responses.lock().pop_front() {
            Some(err) => {
                debug!(session = self.session, "Dropping store response: {err}");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn commit_create(
        &self,
        list_id: ListId,
        payload: &NewRecord,
        token: CorrelationId,
    ) -> Result<Record, StoreError> {
        payload.validate().map_err(|e| StoreError::Rejected(e.to_string()))?;
        let mut backend = self.store.backend.lock();
        backend.check_access(list_id, self.principal)?;
        let position = backend.visible(list_id).len() as i64;
        let record = Record::create(RecordId::new(), list_id, payload, position, self.principal);
        backend.records.insert(record.id, record.clone());
        trace!(record = ?record.id, ?token, "create committed");
        backend.publish(
            list_id,
            vec![ChangeEvent::Insert { record: record.clone(), correlation: Some(token) }],
        );
        Ok(record)
    }

    fn commit_patch(
        &self,
        id: RecordId,
        patch: &RecordPatch,
        token: CorrelationId,
    ) -> Result<Record, StoreError> {
        patch.validate().map_err(|e| StoreError::Rejected(e.to_string()))?;
        let mut backend = self.store.backend.lock();
        let mut record = backend.live_record(id, self.principal)?.clone();
        patch.apply_to(&mut record);
        let (record, event) = backend.commit_update(record, token);
        backend.publish(record.list_id, vec![event]);
        Ok(record)
    }

    fn commit_delete(&self, id: RecordId, token: CorrelationId) -> Result<(), StoreError> {
        let mut backend = self.store.backend.lock();
        let mut record = backend.live_record(id, self.principal)?.clone();
        record.deleted = true;
        let (record, event) = backend.commit_update(record, token);
        backend.publish(record.list_id, vec![event]);
        Ok(())
    }

    fn commit_positions(
        &self,
        updates: &[PositionUpdate],
        token: CorrelationId,
    ) -> Result<(), StoreError> {
        let mut backend = self.store.backend.lock();
        // Validate everything before writing anything.
        let mut rows = Vec::with_capacity(updates.len());
        for update in updates {
            let mut record = backend.live_record(update.id, self.principal)?.clone();
            record.position = update.position;
            rows.push(record);
        }
        let mut by_list: HashMap<ListId, Vec<ChangeEvent>> = HashMap::new();
        for record in rows {
            let (record, event) = backend.commit_update(record, token);
            by_list.entry(record.list_id).or_default().push(event);
        }
        for (list_id, events) in by_list {
            backend.publish(list_id, events);
        }
        Ok(())
    }

    fn commit_delete_done(
        &self,
        list_id: ListId,
        token: CorrelationId,
    ) -> Result<Vec<RecordId>, StoreError> {
        let mut backend = self.store.backend.lock();
        backend.check_access(list_id, self.principal)?;
        let done: Vec<Record> = backend.visible(list_id).into_iter().filter(|r| r.done).collect();
        let mut ids = Vec::with_capacity(done.len());
        let mut events = Vec::with_capacity(done.len());
        for mut record in done {
            record.deleted = true;
            let (record, event) = backend.commit_update(record, token);
            ids.push(record.id);
            events.push(event);
        }
        backend.publish(list_id, events);
        Ok(ids)
    }
}

#[async_trait]
impl RemoteStore for MemorySession {
    async fn list_records(&self, list_id: ListId) -> Result<Vec<Record>, StoreError> {
        self.check_fault()?;
        let rows = {
            let backend = self.store.backend.lock();
            backend.check_access(list_id, self.principal)?;
            backend.visible(list_id)
        };
        self.respond().await?;
        Ok(rows)
    }

    async fn create_record(
        &self,
        list_id: ListId,
        payload: &NewRecord,
        token: CorrelationId,
    ) -> Result<Record, StoreError> {
        self.check_fault()?;
        let record = self.commit_create(list_id, payload, token)?;
        self.respond().await?;
        Ok(record)
    }

    async fn update_record(
        &self,
        id: RecordId,
        patch: &RecordPatch,
        token: CorrelationId,
    ) -> Result<Record, StoreError> {
        self.check_fault()?;
        let record = self.commit_patch(id, patch, token)?;
        self.respond().await?;
        Ok(record)
    }

    async fn soft_delete_record(&self, id: RecordId, token: CorrelationId) -> Result<(), StoreError> {
        self.check_fault()?;
        self.commit_delete(id, token)?;
        self.respond().await?;
        Ok(())
    }

    async fn batch_update_positions(
        &self,
        updates: &[PositionUpdate],
        token: CorrelationId,
    ) -> Result<(), StoreError> {
        self.check_fault()?;
        self.commit_positions(updates, token)?;
        self.respond().await?;
        Ok(())
    }

    async fn soft_delete_done(
        &self,
        list_id: ListId,
        token: CorrelationId,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.check_fault()?;
        let ids = self.commit_delete_done(list_id, token)?;
        self.respond().await?;
        Ok(ids)
    }

    async fn subscribe(
        &self,
        list_id: ListId,
        sink: FeedSink,
    ) -> Result<SubscriptionHandle, StoreError> {
        self.check_fault()?;
        let mut backend = self.store.backend.lock();
        backend.check_access(list_id, self.principal)?;
        let next_id = SubscriptionId(backend.next_subscription);
        let slots = backend.feeds.entry(list_id).or_default();
        // One subscription per session and list: a repeat subscribe takes
        // over the existing slot instead of doubling delivery.
        let id = match slots.iter_mut().find(|slot| slot.session == self.session) {
            Some(slot) => {
                slot.sink = sink;
                slot.id
            }
            None => {
                slots.push(FeedSlot { id: next_id, session: self.session, sink });
                backend.next_subscription += 1;
                next_id
            }
        };
        debug!(list = %list_id, subscription = id.0, session = self.session, "Feed subscribed");
        Ok(SubscriptionHandle { id, list_id })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StoreError> {
        let mut backend = self.store.backend.lock();
        if let Some(slots) = backend.feeds.get_mut(&handle.list_id) {
            slots.retain(|slot| slot.id != handle.id);
        }
        debug!(list = %handle.list_id, subscription = handle.id.0, "Feed unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn setup() -> (MemoryStore, MemorySession, ListId) {
        let store = MemoryStore::new();
        let amy = Principal::new("amy", "Amy Park");
        let list = store.create_list(amy.id);
        let session = store.session(&amy);
        (store, session, list)
    }

    fn decode(msg: FeedMessage) -> ChangeEvent {
        match msg {
            FeedMessage::Payload(v) => ChangeEvent::decode(v).expect("valid payload"),
            FeedMessage::Closed { reason } => panic!("unexpected close: {reason}"),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_id_version_and_position() {
        let (_store, session, list) = setup();
        let token = CorrelationId::new();
        let a = session.create_record(list, &NewRecord::new("Milk"), token).await.unwrap();
        let b = session.create_record(list, &NewRecord::new("Eggs"), token).await.unwrap();
        assert_eq!(a.version, 1);
        assert_eq!(a.position, 0);
        assert_eq!(b.position, 1);
        assert_ne!(a.id, RecordId::provisional(token));
    }

    #[tokio::test]
    async fn test_soft_delete_hides_but_retains_row() {
        let (store, session, list) = setup();
        let r = session.create_record(list, &NewRecord::new("Milk"), CorrelationId::new()).await.unwrap();
        session.soft_delete_record(r.id, CorrelationId::new()).await.unwrap();

        assert!(session.list_records(list).await.unwrap().is_empty());
        let row = store.record(r.id).expect("row retained");
        assert!(row.deleted);
        assert_eq!(row.version, 2);

        // Deleting again: the record is gone as far as the store is concerned.
        let err = session.soft_delete_record(r.id, CorrelationId::new()).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(r.id));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_publishes_with_token() {
        let (_store, session, list) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.subscribe(list, tx).await.unwrap();

        let r = session.create_record(list, &NewRecord::new("Milk"), CorrelationId::new()).await.unwrap();
        let token = CorrelationId::new();
        let updated = session.update_record(r.id, &RecordPatch::new().done(true), token).await.unwrap();
        assert_eq!(updated.version, 2);
        assert!(updated.done);

        assert!(matches!(decode(rx.recv().await.unwrap()), ChangeEvent::Insert { .. }));
        let event = decode(rx.recv().await.unwrap());
        assert_eq!(event.correlation(), Some(token));
        assert_eq!(event.previous().map(|p| p.done), Some(false));
    }

    #[tokio::test]
    async fn test_unshared_principal_is_unauthorized() {
        let (store, _session, list) = setup();
        let mallory = store.session(&Principal::new("mallory", "Mallory"));
        let err = mallory.list_records(list).await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_batch_positions_are_all_or_nothing() {
        let (store, session, list) = setup();
        let a = session.create_record(list, &NewRecord::new("a"), CorrelationId::new()).await.unwrap();
        let missing = RecordId::new();
        let err = session
            .batch_update_positions(
                &[PositionUpdate { id: a.id, position: 9 }, PositionUpdate { id: missing, position: 0 }],
                CorrelationId::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound(missing));
        assert_eq!(store.record(a.id).unwrap().position, 0);
    }

    #[tokio::test]
    async fn test_delete_done_only_touches_done_rows() {
        let (store, session, list) = setup();
        let t = CorrelationId::new();
        let keep = session.create_record(list, &NewRecord::new("keep"), t).await.unwrap();
        let gone = session.create_record(list, &NewRecord::new("gone").done(true), t).await.unwrap();
        let ids = session.soft_delete_done(list, t).await.unwrap();
        assert_eq!(ids, vec![gone.id]);
        let visible: Vec<RecordId> = store.visible_records(list).iter().map(|r| r.id).collect();
        assert_eq!(visible, vec![keep.id]);
    }

    #[tokio::test]
    async fn test_subscribe_is_deduplicated_per_session() {
        let (store, session, list) = setup();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let h1 = session.subscribe(list, tx1).await.unwrap();
        let h2 = session.subscribe(list, tx2).await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.subscriber_count(list), 1);

        session.unsubscribe(&h1).await.unwrap();
        assert_eq!(store.subscriber_count(list), 0);
    }

    #[tokio::test]
    async fn test_injected_fault_fails_once_without_writing() {
        let (store, session, list) = setup();
        session.fail_next(StoreError::transient("connection reset"));
        let err = session
            .create_record(list, &NewRecord::new("Milk"), CorrelationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
        assert!(store.visible_records(list).is_empty());

        session.create_record(list, &NewRecord::new("Milk"), CorrelationId::new()).await.unwrap();
        assert_eq!(store.visible_records(list).len(), 1);
    }

    #[tokio::test]
    async fn test_lost_response_still_commits() {
        let (store, session, list) = setup();
        session.lose_next_response(StoreError::transient("reset"));
        let err = session
            .create_record(list, &NewRecord::new("Milk"), CorrelationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
        assert_eq!(store.visible_records(list).len(), 1);
    }

    #[tokio::test]
    async fn test_drop_feeds_sends_closed() {
        let (store, session, list) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.subscribe(list, tx).await.unwrap();
        store.drop_feeds(list, "test drop");
        assert!(matches!(rx.recv().await, Some(FeedMessage::Closed { .. })));
        assert_eq!(store.subscriber_count(list), 0);
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_payload() {
        let (_store, session, list) = setup();
        let err = session
            .create_record(list, &NewRecord::new(""), CorrelationId::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }
}
