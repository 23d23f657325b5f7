//! Self-mutation guards.
//!
//! Every local write arms a guard keyed by its [`CorrelationId`]. Inbound
//! change events are checked against the live guards to decide whether they
//! are echoes of this client's own writes:
//!
//! - an event carrying a token that matches a live guard is an echo;
//! - an event carrying any other token is never an echo;
//! - a token-less event is an echo only if some live guard covers its
//!   record id (the timed heuristic, for stores that do not stamp tokens).
//!
//! Suppressed events are captured on their guard. If the write's response
//! is lost even though the store committed it, the engine replays the
//! captured echoes instead of rolling back.

use std::collections::HashMap;
use std::time::Duration;

use kaimono_types::{ChangeEvent, CorrelationId, RecordId};
use tokio::time::Instant;
use tracing::trace;

/// How a guard ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Dropped as soon as the store confirms (or rejects) the write; the
    /// expiry is only a fallback.
    OnConfirm,
    /// Lives for its full lifetime regardless of confirmation.
    OnExpiry,
}

/// Why an event was judged to be an echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMatch {
    /// The event carried the token of one of our in-flight writes.
    Token(CorrelationId),
    /// Token-less event for a record with an armed guard.
    Record(RecordId),
}

#[derive(Debug)]
struct Guard {
    records: Vec<RecordId>,
    expires_at: Instant,
    release: Release,
    captured: Vec<ChangeEvent>,
}

impl Guard {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// The guards of one engine instance.
#[derive(Debug, Default)]
pub struct GuardSet {
    guards: HashMap<CorrelationId, Guard>,
}

impl GuardSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a guard for `token`, covering `records` for token-less events.
    pub fn arm(&mut self, token: CorrelationId, records: Vec<RecordId>, ttl: Duration, release: Release) {
        trace!(?token, records = records.len(), ?ttl, ?release, "guard armed");
        self.guards.insert(
            token,
            Guard {
                records,
                expires_at: Instant::now() + ttl,
                release,
                captured: Vec::new(),
            },
        );
    }

    /// The store answered for `token`.
    ///
    /// Confirm-released guards are dropped; expiry-released guards stay
    /// armed. Returns the echoes captured so far either way.
    pub fn release(&mut self, token: CorrelationId) -> Vec<ChangeEvent> {
        match self.guards.get(&token).map(|g| g.release) {
            Some(Release::OnConfirm) => self
                .guards
                .remove(&token)
                .map(|g| g.captured)
                .unwrap_or_default(),
            Some(Release::OnExpiry) => self
                .guards
                .get_mut(&token)
                .map(|g| std::mem::take(&mut g.captured))
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Decide whether `event` is an echo; if so, capture it on its guard.
    pub fn check(&mut self, event: &ChangeEvent) -> Option<EchoMatch> {
        let now = Instant::now();
        let matched = match event.correlation() {
            Some(token) => self
                .guards
                .get_mut(&token)
                .filter(|g| g.live(now))
                .map(|g| (g, EchoMatch::Token(token))),
            None => {
                let id = event.record_id();
                self.guards
                    .values_mut()
                    .find(|g| g.live(now) && g.records.contains(&id))
                    .map(|g| (g, EchoMatch::Record(id)))
            }
        };
        let (guard, hit) = matched?;
        guard.captured.push(event.clone());
        Some(hit)
    }

    /// Drop expired guards.
    pub fn purge(&mut self) {
        let now = Instant::now();
        self.guards.retain(|_, g| g.live(now));
    }

    pub fn is_armed(&self, token: CorrelationId) -> bool {
        self.guards.get(&token).is_some_and(|g| g.live(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn clear(&mut self) {
        self.guards.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaimono_types::{ListId, NewRecord, PrincipalId, Record};

    const TTL: Duration = Duration::from_millis(300);

    fn update(id: RecordId, token: Option<CorrelationId>) -> ChangeEvent {
        let mut record = Record::create(id, ListId::new(), &NewRecord::new("Milk"), 0, PrincipalId::new());
        record.version = 2;
        ChangeEvent::Update { record, previous: None, correlation: token }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_match_is_echo() {
        let mut guards = GuardSet::new();
        let token = CorrelationId::new();
        let id = RecordId::new();
        guards.arm(token, vec![id], TTL, Release::OnConfirm);
        assert_eq!(guards.check(&update(id, Some(token))), Some(EchoMatch::Token(token)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_token_is_never_echo() {
        let mut guards = GuardSet::new();
        let id = RecordId::new();
        guards.arm(CorrelationId::new(), vec![id], TTL, Release::OnConfirm);
        // Same record, someone else's write.
        assert_eq!(guards.check(&update(id, Some(CorrelationId::new()))), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokenless_event_falls_back_to_record_id() {
        let mut guards = GuardSet::new();
        let id = RecordId::new();
        guards.arm(CorrelationId::new(), vec![id], TTL, Release::OnExpiry);
        assert_eq!(guards.check(&update(id, None)), Some(EchoMatch::Record(id)));
        assert_eq!(guards.check(&update(RecordId::new(), None)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_expires() {
        let mut guards = GuardSet::new();
        let token = CorrelationId::new();
        let id = RecordId::new();
        guards.arm(token, vec![id], TTL, Release::OnExpiry);
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        assert!(!guards.is_armed(token));
        assert_eq!(guards.check(&update(id, None)), None);
        guards.purge();
        assert!(guards.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_respects_mode_and_returns_captures() {
        let mut guards = GuardSet::new();
        let confirm = CorrelationId::new();
        let sticky = CorrelationId::new();
        let id = RecordId::new();
        guards.arm(confirm, vec![id], TTL, Release::OnConfirm);
        guards.arm(sticky, vec![id], TTL, Release::OnExpiry);

        guards.check(&update(id, Some(confirm)));
        assert_eq!(guards.release(confirm).len(), 1);
        assert!(!guards.is_armed(confirm));

        assert!(guards.release(sticky).is_empty());
        assert!(guards.is_armed(sticky));
    }
}
