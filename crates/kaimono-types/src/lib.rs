//! Shared identity, record, and change-feed types for kaimono.
//!
//! A pure leaf crate: typed IDs, principals, list records, and the wire
//! shape of change-feed events. The reconciliation core in `kaimono-client`
//! builds on these.
//!
//! # Relationships
//!
//! ```text
//! List (ListId) ← the partition every client shares
//!     └── holds Records (RecordId, minted by the remote store)
//!
//! Principal (PrincipalId)
//!     └── creates Records (Record::created_by)
//!
//! Write (CorrelationId) ← one per client mutation
//!     └── stamped on every ChangeEvent the write produces
//! ```

pub mod change;
pub mod ids;
pub mod principal;
pub mod record;

pub use change::{ChangeEvent, ChangeKind, DecodeError};
pub use ids::{CorrelationId, ListId, PrincipalId, RecordId};
pub use principal::Principal;
pub use record::{MAX_NOTE_LEN, MAX_TEXT_LEN, NewRecord, Record, RecordPatch, ValidationError};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
