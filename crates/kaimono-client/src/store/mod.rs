//! The remote store boundary.
//!
//! [`RemoteStore`] is the capability the reconciliation core consumes: CRUD
//! on list records plus a change-feed subscription. The store owns record
//! identity, versions, tombstones, and row-level access control; the core
//! never second-guesses any of those.
//!
//! Feed traffic is pushed into a [`FeedSink`] as raw JSON payloads, the same
//! way a realtime transport would deliver them. Decoding into typed
//! [`ChangeEvent`](kaimono_types::ChangeEvent)s happens on the client side of
//! the boundary, in the change-feed pump.

pub mod memory;

use async_trait::async_trait;
use kaimono_types::{CorrelationId, ListId, NewRecord, Record, RecordId, RecordPatch};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use memory::{MemorySession, MemoryStore};

/// Failure reported by a [`RemoteStore`] call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("transport failure: {0}")]
    Transient(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("rejected by store: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}

/// Transport-level message on a change-feed subscription.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// One change payload, not yet decoded.
    Payload(serde_json::Value),
    /// The transport dropped; the subscription is gone and must be renewed.
    Closed { reason: String },
}

/// Where a store pushes feed traffic for one subscription.
pub type FeedSink = mpsc::UnboundedSender<FeedMessage>;

/// Store-assigned identifier of one feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Returned by [`RemoteStore::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub list_id: ListId,
}

/// New position for one record in a batch reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub id: RecordId,
    pub position: i64,
}

/// The capability surface of the remote store.
///
/// Every write carries the client's [`CorrelationId`]; implementations must
/// stamp it onto the change events that write produces.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Non-tombstoned records of a list, ordered by position.
    async fn list_records(&self, list_id: ListId) -> Result<Vec<Record>, StoreError>;

    /// Create a record. The store assigns id, version, timestamps, and a
    /// default position equal to the list's visible count.
    async fn create_record(
        &self,
        list_id: ListId,
        payload: &NewRecord,
        token: CorrelationId,
    ) -> Result<Record, StoreError>;

    /// Replace fields on a record and return the canonical row.
    async fn update_record(
        &self,
        id: RecordId,
        patch: &RecordPatch,
        token: CorrelationId,
    ) -> Result<Record, StoreError>;

    /// Set the tombstone on a record.
    async fn soft_delete_record(&self, id: RecordId, token: CorrelationId) -> Result<(), StoreError>;

    /// Rewrite positions for several records at once. All or nothing.
    async fn batch_update_positions(
        &self,
        updates: &[PositionUpdate],
        token: CorrelationId,
    ) -> Result<(), StoreError>;

    /// Tombstone every done record of a list; returns the affected ids.
    async fn soft_delete_done(
        &self,
        list_id: ListId,
        token: CorrelationId,
    ) -> Result<Vec<RecordId>, StoreError>;

    /// Start pushing change events for a list into `sink`.
    async fn subscribe(&self, list_id: ListId, sink: FeedSink)
        -> Result<SubscriptionHandle, StoreError>;

    /// Stop a subscription and release its server-side resources.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), StoreError>;
}
