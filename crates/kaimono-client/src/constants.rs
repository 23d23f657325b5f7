//! Client configuration constants.
//!
//! Defaults for [`ClientConfig`](crate::ClientConfig); everything here can be
//! overridden from a config file.

use std::time::Duration;

/// How long a `toggle_done` keeps suppressing token-less events for its
/// record. Long enough to outlast the feed's echo latency, short enough that
/// a lost echo does not visibly delay convergence.
pub const TOGGLE_GUARD_TTL: Duration = Duration::from_millis(300);

/// Upper bound on any other mutation guard. These are normally released when
/// the store confirms the write; the expiry only matters if that confirmation
/// never arrives.
pub const MUTATION_GUARD_TTL: Duration = Duration::from_secs(10);

/// Pause between a change-feed transport drop and the resubscribe attempt.
pub const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Environment variable naming a RON config file for the binaries.
pub const CONFIG_ENV: &str = "KAIMONO_CONFIG";
