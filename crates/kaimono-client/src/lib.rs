//! Optimistic list editing with real-time reconciliation.
//!
//! A client mutates its local copy of a shared list immediately, sends the
//! change to the [`RemoteStore`], and merges change-feed events from other
//! clients without flicker, duplication, or lost updates.
//!
//! ```text
//!   UI intent ──► ReconciliationEngine ──► LocalViewState ──► watch<ViewSnapshot>
//!                      │        ▲
//!                      ▼        │ on_remote_change
//!                 RemoteStore ──► ChangeFeedManager (pump per list)
//! ```
//!
//! Most callers want [`ListSession`], which wires an engine to its feed.

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod guard;
pub mod hooks;
pub mod names;
pub mod ordering;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod view;

pub use config::{ClientConfig, ConfigError};
pub use engine::{ApplyOutcome, Mutation, ReconciliationEngine, SkipReason};
pub use error::ReconcileError;
pub use guard::EchoMatch;
pub use hooks::{CommitChange, CommitNotice, PostCommitHook};
pub use names::PrincipalDirectory;
pub use ordering::OrderingError;
pub use session::ListSession;
pub use store::{
    FeedMessage, MemorySession, MemoryStore, PositionUpdate, RemoteStore, StoreError,
    SubscriptionHandle, SubscriptionId,
};
pub use subscriptions::{ChangeFeedManager, FeedListener, FeedState};
pub use view::{LocalViewState, ViewSnapshot};
