//! Error taxonomy surfaced to callers of the reconciliation engine.

use kaimono_types::{RecordId, ValidationError};

use crate::ordering::OrderingError;
use crate::store::StoreError;

/// Why a list operation failed.
///
/// By the time one of these reaches the caller, the engine has already
/// rolled back or resynchronised its local view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    /// The round trip to the store failed. Safe to retry.
    #[error("network error: {0}")]
    TransientNetwork(String),
    /// The store refused the principal. Not retryable.
    #[error("permission denied: {0}")]
    Authorization(String),
    /// The target record no longer exists on the store.
    #[error("record {0} not found")]
    NotFound(RecordId),
    /// The request was rejected before (or by) the store.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The engine was closed; nothing was sent.
    #[error("list session closed")]
    Closed,
}

impl ReconcileError {
    /// Whether the caller may reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

impl From<ValidationError> for ReconcileError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<OrderingError> for ReconcileError {
    fn from(e: OrderingError) -> Self {
        Self::Validation(e.to_string())
    }
}

impl From<StoreError> for ReconcileError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Transient(msg) => Self::TransientNetwork(msg),
            StoreError::Unauthorized(msg) => Self::Authorization(msg),
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Rejected(msg) => Self::Validation(msg),
        }
    }
}
