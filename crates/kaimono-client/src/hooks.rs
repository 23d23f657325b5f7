//! Post-commit hooks.
//!
//! Side effects that should follow a local change (telling other
//! participants an item was added, analytics, ...) register a
//! [`PostCommitHook`]. Hooks run on their own task after the optimistic
//! commit; whatever they do, including failing or panicking, never reaches
//! the mutation that triggered them.

use std::sync::Arc;

use async_trait::async_trait;
use kaimono_types::{ListId, PrincipalId, Record, RecordId};
use parking_lot::RwLock;
use tracing::{error, warn};

/// What was just committed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitChange {
    /// A provisional record was appended.
    Added(Record),
    /// A record was patched (including `toggle_done`).
    Updated(Record),
    Removed(RecordId),
    /// The list was rearranged into this order.
    Reordered(Vec<RecordId>),
    ClearedDone(Vec<RecordId>),
}

/// Passed to every hook after a local commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitNotice {
    pub list_id: ListId,
    /// The principal this client acts as.
    pub actor: PrincipalId,
    pub change: CommitChange,
}

#[async_trait]
pub trait PostCommitHook: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn on_commit(&self, notice: &CommitNotice) -> anyhow::Result<()>;
}

/// Registered hooks of one engine.
#[derive(Default)]
pub struct HookSet {
    hooks: RwLock<Vec<Arc<dyn PostCommitHook>>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn PostCommitHook>) {
        self.hooks.write().push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }

    /// Fire every hook for `notice` without waiting for any of them.
    pub fn dispatch(&self, notice: CommitNotice) {
        let hooks = self.hooks.read().clone();
        if hooks.is_empty() {
            return;
        }
        let notice = Arc::new(notice);
        for hook in hooks {
            let notice = Arc::clone(&notice);
            let name = hook.name().to_string();
            let inner = tokio::spawn(async move { hook.on_commit(&notice).await });
            // A second task observes the first so a panic is logged, not lost.
            tokio::spawn(async move {
                match inner.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(hook = %name, "post-commit hook failed: {e:#}"),
                    Err(e) if e.is_panic() => error!(hook = %name, "post-commit hook panicked"),
                    Err(e) => warn!(hook = %name, "post-commit hook cancelled: {e}"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<CommitChange>);

    #[async_trait]
    impl PostCommitHook for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn on_commit(&self, notice: &CommitNotice) -> anyhow::Result<()> {
            let _ = self.0.send(notice.change.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl PostCommitHook for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_commit(&self, _notice: &CommitNotice) -> anyhow::Result<()> {
            anyhow::bail!("mail server down")
        }
    }

    struct Panicking;

    #[async_trait]
    impl PostCommitHook for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_commit(&self, _notice: &CommitNotice) -> anyhow::Result<()> {
            panic!("hook bug")
        }
    }

    fn notice(change: CommitChange) -> CommitNotice {
        CommitNotice { list_id: ListId::new(), actor: PrincipalId::new(), change }
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_hook_despite_failures() {
        let hooks = HookSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hooks.register(Arc::new(Panicking));
        hooks.register(Arc::new(Failing));
        hooks.register(Arc::new(Recorder(tx)));
        assert_eq!(hooks.len(), 3);

        let id = RecordId::new();
        hooks.dispatch(notice(CommitChange::Removed(id)));
        assert_eq!(rx.recv().await, Some(CommitChange::Removed(id)));
    }

    #[tokio::test]
    async fn test_cleared_hooks_are_not_called() {
        let hooks = HookSet::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hooks.register(Arc::new(Recorder(tx)));
        hooks.clear();
        hooks.dispatch(notice(CommitChange::Reordered(Vec::new())));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
