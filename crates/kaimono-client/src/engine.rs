//! The reconciliation engine.
//!
//! One [`ReconciliationEngine`] owns the local view of one list for one
//! client. Every mutating operation runs in two phases:
//!
//! 1. the optimistic change is applied to the view and published before the
//!    call returns;
//! 2. the store round trip runs on its own task, and its outcome (merge on
//!    success, rollback or refetch on failure) is reported through the
//!    returned [`Mutation`].
//!
//! Change-feed events are fed in through [`ReconciliationEngine::on_remote_change`]
//! and may interleave with phase 2 of any number of operations. State lives
//! behind a synchronous lock that is never held across an await point, so
//! every transition is atomic with respect to every other.
//!
//! ```text
//!   add/update/toggle/remove/reorder/clear_done
//!        │ optimistic commit ──► watch<ViewSnapshot> ──► UI
//!        │ arm guard (token)
//!        ▼
//!   spawn ─► RemoteStore ─► finish_* (merge / rollback / load)
//!
//!   ChangeFeed ─► on_remote_change ─► guard check ─► apply
//! ```

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kaimono_types::{
    ChangeEvent, ChangeKind, CorrelationId, ListId, NewRecord, PrincipalId, Record, RecordId,
    RecordPatch, now_millis,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::error::ReconcileError;
use crate::guard::{EchoMatch, GuardSet, Release};
use crate::hooks::{CommitChange, CommitNotice, HookSet, PostCommitHook};
use crate::ordering;
use crate::store::{PositionUpdate, RemoteStore, StoreError};
use crate::view::{LocalViewState, ViewSnapshot};

/// Remote confirmation of an operation whose optimistic part already landed.
///
/// Dropping a `Mutation` does not cancel the write; it only discards the
/// outcome.
#[must_use = "the optimistic change is already applied; await `confirmed()` to learn whether the store accepted it"]
pub struct Mutation<T> {
    rx: oneshot::Receiver<Result<T, ReconcileError>>,
}

impl<T> Mutation<T> {
    fn channel() -> (oneshot::Sender<Result<T, ReconcileError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn settled(result: Result<T, ReconcileError>) -> Self {
        let (tx, mutation) = Self::channel();
        let _ = tx.send(result);
        mutation
    }

    /// Wait for the store's verdict. By the time this resolves the local
    /// view already reflects it (merged, rolled back, or refetched).
    pub async fn confirmed(self) -> Result<T, ReconcileError> {
        self.rx.await.unwrap_or(Err(ReconcileError::Closed))
    }
}

/// What [`ReconciliationEngine::on_remote_change`] did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The view changed.
    Applied,
    /// Already reflected in the view (duplicate or redundant delivery).
    NoOp,
    /// Echo of one of this client's own writes.
    Suppressed(EchoMatch),
    /// Ignored (see reason).
    Skipped(SkipReason),
}

/// Why an event was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The engine is closed; late events are dropped.
    Closed,
    /// Event belongs to another list.
    ListMismatch { expected: ListId, got: ListId },
    /// Older than the row we already hold.
    Stale { local: u64, incoming: u64 },
    /// The record has been deleted; late updates cannot resurrect it.
    Tombstoned,
    /// A local removal of this record is in flight.
    PendingRemoval,
}

/// A change observed while a `load()` was in flight, replayed over its result.
#[derive(Debug, Clone)]
enum JournalEntry {
    Upsert(Record),
    Removed(RecordId),
}

#[derive(Debug)]
struct PendingPatch {
    token: CorrelationId,
    id: RecordId,
    patch: RecordPatch,
    /// Local clock when the patch was made; the patched row is shown as
    /// updated then.
    at: u64,
}

#[derive(Debug)]
struct PendingRemoval {
    token: CorrelationId,
    last_known: Option<Record>,
}

struct EngineState {
    view: LocalViewState,
    guards: GuardSet,
    /// Tokens of `add`s still in flight; each has a provisional row.
    pending_adds: HashSet<CorrelationId>,
    /// Optimistic patches not yet confirmed, oldest first.
    pending_patches: Vec<PendingPatch>,
    /// Latest store row for every record with pending patches. The view
    /// shows the base with the patches applied on top.
    bases: HashMap<RecordId, Record>,
    pending_removals: HashMap<RecordId, PendingRemoval>,
    load_generation: u64,
    loads_in_flight: usize,
    journal: Vec<(u64, JournalEntry)>,
    journal_seq: u64,
    closed: bool,
}

impl EngineState {
    fn new(list_id: ListId) -> Self {
        Self {
            view: LocalViewState::new(list_id),
            guards: GuardSet::new(),
            pending_adds: HashSet::new(),
            pending_patches: Vec::new(),
            bases: HashMap::new(),
            pending_removals: HashMap::new(),
            load_generation: 0,
            loads_in_flight: 0,
            journal: Vec::new(),
            journal_seq: 0,
            closed: false,
        }
    }

    fn is_provisional(&self, id: RecordId) -> bool {
        self.pending_adds.contains(&id.as_token())
    }

    fn record_journal(&mut self, entry: JournalEntry) {
        if self.loads_in_flight > 0 {
            self.journal_seq += 1;
            self.journal.push((self.journal_seq, entry));
        }
    }

    fn has_patches(&self, id: RecordId) -> bool {
        self.pending_patches.iter().any(|p| p.id == id)
    }

    /// Drop the patches of one write; returns the records they touched.
    fn drop_patches(&mut self, token: CorrelationId) -> Vec<RecordId> {
        let mut ids: Vec<RecordId> = self
            .pending_patches
            .iter()
            .filter(|p| p.token == token)
            .map(|p| p.id)
            .collect();
        ids.dedup();
        self.pending_patches.retain(|p| p.token != token);
        ids
    }

    /// Forget the base of a record with no patches left. The view keeps
    /// whatever it currently shows.
    fn release_base(&mut self, id: RecordId) {
        if !self.has_patches(id) {
            self.bases.remove(&id);
        }
    }

    fn forget_record(&mut self, id: RecordId) {
        self.pending_patches.retain(|p| p.id != id);
        self.bases.remove(&id);
    }

    /// Show `id` as its base with every pending patch applied.
    fn rebuild(&mut self, id: RecordId) {
        let Some(base) = self.bases.get(&id) else {
            return;
        };
        let mut row = base.clone();
        for pending in self.pending_patches.iter().filter(|p| p.id == id) {
            if pending.patch.apply_to(&mut row) {
                row.updated_at = row.updated_at.max(pending.at);
            }
        }
        self.view.upsert(row);
    }

    /// Record a newer store row for `id` and refresh the view from it.
    fn advance(&mut self, row: Record) {
        let id = row.id;
        match self.bases.get_mut(&id) {
            Some(base) => {
                if row.version >= base.version {
                    *base = row;
                }
                if self.has_patches(id) {
                    self.rebuild(id);
                } else if let Some(base) = self.bases.remove(&id) {
                    self.view.upsert(base);
                }
            }
            None => self.view.upsert(row),
        }
    }

    /// Store version of the row the view is built on.
    fn known_version(&self, id: RecordId) -> Option<u64> {
        self.bases
            .get(&id)
            .or_else(|| self.view.get(id))
            .map(|r| r.version)
    }

    /// Merge a row the store returned for one of our writes.
    /// Returns whether the view changed.
    fn merge_confirmed(&mut self, canonical: Record) -> bool {
        let id = canonical.id;
        self.record_journal(JournalEntry::Upsert(canonical.clone()));
        if self.view.is_tombstoned(id) {
            return false;
        }
        if let Some(removal) = self.pending_removals.get_mut(&id) {
            removal.last_known = Some(canonical);
            return false;
        }
        let newer_local = self.view.get(id).is_some_and(|r| r.version > canonical.version);
        if newer_local && !self.bases.contains_key(&id) {
            return false;
        }
        let before = self.view.get(id).cloned();
        self.advance(canonical);
        self.view.get(id) != before.as_ref()
    }

    /// Apply an event that has already passed the guard check.
    fn apply_event(&mut self, event: ChangeEvent) -> ApplyOutcome {
        let kind = event.kind();
        let incoming = match event {
            ChangeEvent::Insert { record, .. }
            | ChangeEvent::Update { record, .. }
            | ChangeEvent::Delete { record, .. } => record,
        };
        let id = incoming.id;

        if kind == ChangeKind::Delete || incoming.deleted {
            self.view.mark_tombstoned(id);
            self.forget_record(id);
            self.record_journal(JournalEntry::Removed(id));
            return match self.view.remove(id) {
                Some(_) => ApplyOutcome::Applied,
                None => ApplyOutcome::NoOp,
            };
        }
        if self.view.is_tombstoned(id) {
            return ApplyOutcome::Skipped(SkipReason::Tombstoned);
        }
        if let Some(removal) = self.pending_removals.get_mut(&id) {
            // Keep the rollback copy fresh in case the removal fails.
            if removal.last_known.as_ref().is_none_or(|r| r.version <= incoming.version) {
                removal.last_known = Some(incoming);
            }
            return ApplyOutcome::Skipped(SkipReason::PendingRemoval);
        }

        if let Some(local) = self.known_version(id) {
            if incoming.version < local {
                return ApplyOutcome::Skipped(SkipReason::Stale {
                    local,
                    incoming: incoming.version,
                });
            }
        }
        let before = self.view.get(id).cloned();
        self.record_journal(JournalEntry::Upsert(incoming.clone()));
        self.advance(incoming);
        match (before, self.view.get(id)) {
            (Some(before), Some(after)) if before.same_content(after) => ApplyOutcome::NoOp,
            _ => ApplyOutcome::Applied,
        }
    }

    /// Replace the view with a freshly loaded set, rebasing local work on top.
    ///
    /// `since` and `tombstones` are the journal and tombstone marks taken
    /// when the load started.
    fn rebase(&mut self, rows: Vec<Record>, since: u64, tombstones: u64) {
        let list_id = self.view.list_id();
        let listed: HashSet<RecordId> =
            rows.iter().filter(|r| !r.deleted).map(|r| r.id).collect();
        let provisionals: Vec<Record> = self
            .pending_adds
            .iter()
            .filter_map(|token| self.view.get(RecordId::provisional(*token)).cloned())
            .collect();

        let rows: Vec<Record> = rows
            .into_iter()
            .filter(|r| {
                r.list_id == list_id
                    && !r.deleted
                    && !self.view.is_tombstoned(r.id)
                    && !self.pending_removals.contains_key(&r.id)
            })
            .collect();
        self.view.reset(rows);

        let replay: Vec<JournalEntry> = self
            .journal
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(_, entry)| entry.clone())
            .collect();
        for entry in replay {
            match entry {
                JournalEntry::Upsert(record) => {
                    if self.view.is_tombstoned(record.id)
                        || self.pending_removals.contains_key(&record.id)
                    {
                        continue;
                    }
                    let newer_local =
                        self.view.get(record.id).is_some_and(|l| l.version > record.version);
                    if !newer_local {
                        self.view.upsert(record);
                    }
                }
                JournalEntry::Removed(id) => {
                    self.view.remove(id);
                }
            }
        }

        for record in provisionals {
            self.view.upsert(record);
        }
        let patched: Vec<RecordId> = self.bases.keys().copied().collect();
        for id in patched {
            match self.view.get(id).cloned() {
                Some(row) => self.advance(row),
                // Gone from the store; nothing left to patch.
                None => {
                    self.bases.remove(&id);
                }
            }
        }
        self.view.prune_tombstones(tombstones, &listed);
    }
}

fn committed_row(captured: &[ChangeEvent], kind: ChangeKind) -> Option<Record> {
    captured
        .iter()
        .rev()
        .find(|e| e.kind() == kind && !e.record().deleted)
        .map(|e| e.record().clone())
}

fn committed_removals(captured: &[ChangeEvent]) -> Vec<RecordId> {
    captured
        .iter()
        .filter(|e| e.kind() == ChangeKind::Delete || e.record().deleted)
        .map(ChangeEvent::record_id)
        .collect()
}

struct Inner {
    list_id: ListId,
    actor: PrincipalId,
    store: Arc<dyn RemoteStore>,
    config: ClientConfig,
    state: Mutex<EngineState>,
    view_tx: watch::Sender<Arc<ViewSnapshot>>,
    hooks: HookSet,
}

/// Keeps one client's view of one list consistent with the remote store.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ReconciliationEngine {
    inner: Arc<Inner>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        list_id: ListId,
        actor: PrincipalId,
        config: ClientConfig,
    ) -> Self {
        let (view_tx, _) = watch::channel(Arc::new(ViewSnapshot::empty(list_id)));
        Self {
            inner: Arc::new(Inner {
                list_id,
                actor,
                store,
                config,
                state: Mutex::new(EngineState::new(list_id)),
                view_tx,
                hooks: HookSet::new(),
            }),
        }
    }

    pub fn list_id(&self) -> ListId {
        self.inner.list_id
    }

    pub fn actor(&self) -> PrincipalId {
        self.inner.actor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The latest published view.
    pub fn snapshot(&self) -> Arc<ViewSnapshot> {
        self.inner.view_tx.borrow().clone()
    }

    /// Receive every view published from now on.
    pub fn subscribe_view(&self) -> watch::Receiver<Arc<ViewSnapshot>> {
        self.inner.view_tx.subscribe()
    }

    pub fn register_hook(&self, hook: Arc<dyn PostCommitHook>) {
        self.inner.hooks.register(hook);
    }

    /// Number of live self-mutation guards.
    pub fn armed_guards(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.guards.purge();
        state.guards.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Stop accepting operations and drop every later change event.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.guards.clear();
        self.inner.hooks.clear();
        info!(list = %self.inner.list_id, "Reconciliation engine closed");
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, EngineState>, ReconcileError> {
        let state = self.inner.state.lock();
        if state.closed {
            return Err(ReconcileError::Closed);
        }
        Ok(state)
    }

    fn publish(&self, state: &mut EngineState) {
        let snapshot = state.view.snapshot();
        trace!(list = %self.inner.list_id, revision = snapshot.revision, "view published");
        self.inner.view_tx.send_replace(Arc::new(snapshot));
    }

    fn fail(&self, state: &mut EngineState, err: &ReconcileError) {
        state.view.last_error = Some(err.clone());
        self.publish(state);
    }

    fn notify(&self, change: CommitChange) {
        self.inner.hooks.dispatch(CommitNotice {
            list_id: self.inner.list_id,
            actor: self.inner.actor,
            change,
        });
    }

    fn spawn_confirm<T, F>(&self, fut: F) -> Mutation<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ReconcileError>> + Send + 'static,
    {
        let (tx, mutation) = Mutation::channel();
        tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        mutation
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Replace the view with the store's current record set.
    ///
    /// Overlapping loads coalesce: only the most recently started one lands.
    /// Local work still in flight, and anything confirmed or received while
    /// the load was outstanding, is rebased on top of the loaded rows.
    pub async fn load(&self) -> Result<(), ReconcileError> {
        let (generation, since, tombstones) = {
            let mut state = self.lock_open()?;
            state.load_generation += 1;
            state.loads_in_flight += 1;
            state.view.is_loading = true;
            self.publish(&mut state);
            (state.load_generation, state.journal_seq, state.view.tombstone_mark())
        };
        debug!(list = %self.inner.list_id, generation, "load started");

        let result = self.inner.store.list_records(self.inner.list_id).await;

        let mut state = self.inner.state.lock();
        state.loads_in_flight -= 1;
        let outcome = if state.closed {
            Err(ReconcileError::Closed)
        } else if generation != state.load_generation {
            debug!(list = %self.inner.list_id, generation, "load superseded");
            Ok(())
        } else {
            state.view.is_loading = false;
            match result {
                Ok(rows) => {
                    let count = rows.len();
                    state.rebase(rows, since, tombstones);
                    state.view.last_error = None;
                    self.publish(&mut state);
                    debug!(list = %self.inner.list_id, generation, count, "load applied");
                    Ok(())
                }
                Err(e) => {
                    let err = ReconcileError::from(e);
                    warn!(list = %self.inner.list_id, generation, "load failed: {err}");
                    self.fail(&mut state, &err);
                    Err(err)
                }
            }
        };
        if state.loads_in_flight == 0 {
            state.journal.clear();
        }
        outcome
    }

    // ========================================================================
    // Add
    // ========================================================================

    /// Append a provisional record and create it on the store.
    ///
    /// Resolves with the canonical record, which has replaced the
    /// provisional one in the view.
    pub fn add(&self, payload: NewRecord) -> Result<Mutation<Record>, ReconcileError> {
        payload.validate()?;
        let token = CorrelationId::new();
        let provisional = {
            let mut state = self.lock_open()?;
            let position = state.view.len() as i64;
            let record =
                Record::provisional(token, self.inner.list_id, &payload, position, self.inner.actor);
            state.view.upsert(record.clone());
            state.pending_adds.insert(token);
            state.guards.arm(
                token,
                Vec::new(),
                self.inner.config.mutation_guard_ttl(),
                Release::OnConfirm,
            );
            self.publish(&mut state);
            record
        };
        debug!(list = %self.inner.list_id, ?token, text = %provisional.text, "add");
        self.notify(CommitChange::Added(provisional));

        let engine = self.clone();
        Ok(self.spawn_confirm(async move {
            let result = engine
                .inner
                .store
                .create_record(engine.inner.list_id, &payload, token)
                .await;
            engine.finish_add(token, result)
        }))
    }

    fn finish_add(
        &self,
        token: CorrelationId,
        result: Result<Record, StoreError>,
    ) -> Result<Record, ReconcileError> {
        let provisional_id = RecordId::provisional(token);
        let mut state = self.inner.state.lock();
        state.pending_adds.remove(&token);
        let captured = state.guards.release(token);
        let result = result.or_else(|e| {
            committed_row(&captured, ChangeKind::Insert).ok_or(e).inspect(|r| {
                warn!(record = %r.id, "create response lost; using committed echo")
            })
        });
        if state.closed {
            return result.map_err(Into::into);
        }

        match result {
            Ok(canonical) => {
                let newer_local = state
                    .view
                    .get(canonical.id)
                    .is_some_and(|r| r.version > canonical.version);
                if state.view.is_tombstoned(canonical.id) || newer_local {
                    state.view.remove(provisional_id);
                } else {
                    state.view.replace(provisional_id, canonical.clone());
                }
                state.record_journal(JournalEntry::Upsert(canonical.clone()));
                // Token-less insert echoes can trail the response; the id is
                // known only now.
                state.guards.arm(
                    token,
                    vec![canonical.id],
                    self.inner.config.toggle_guard_ttl(),
                    Release::OnExpiry,
                );
                self.publish(&mut state);
                debug!(list = %self.inner.list_id, record = %canonical.id, "add confirmed");
                Ok(canonical)
            }
            Err(e) => {
                state.view.remove(provisional_id);
                let err = ReconcileError::from(e);
                warn!(list = %self.inner.list_id, ?token, "add failed: {err}");
                self.fail(&mut state, &err);
                Err(err)
            }
        }
    }

    // ========================================================================
    // Update / toggle
    // ========================================================================

    /// Patch a record locally and on the store.
    ///
    /// A failed update is not rolled back: the local fields may diverge
    /// until the next `load()` or feed event for the record corrects them.
    pub fn update(&self, id: RecordId, patch: RecordPatch) -> Result<Mutation<Record>, ReconcileError> {
        patch.validate()?;
        self.patch_record(id, patch, self.inner.config.mutation_guard_ttl(), Release::OnConfirm)
    }

    /// Set the done flag. The echo guard lives for the short toggle window
    /// rather than until confirmation.
    pub fn toggle_done(&self, id: RecordId, done: bool) -> Result<Mutation<Record>, ReconcileError> {
        self.patch_record(
            id,
            RecordPatch::new().done(done),
            self.inner.config.toggle_guard_ttl(),
            Release::OnExpiry,
        )
    }

    fn patch_record(
        &self,
        id: RecordId,
        patch: RecordPatch,
        ttl: Duration,
        release: Release,
    ) -> Result<Mutation<Record>, ReconcileError> {
        let token = CorrelationId::new();
        let patched = {
            let mut state = self.lock_open()?;
            if state.is_provisional(id) {
                return Err(ReconcileError::Validation(format!(
                    "record {id} is still being created"
                )));
            }
            let Some(current) = state.view.get(id).cloned() else {
                return Err(ReconcileError::NotFound(id));
            };
            state.bases.entry(id).or_insert_with(|| current.clone());
            state.pending_patches.push(PendingPatch {
                token,
                id,
                patch: patch.clone(),
                at: now_millis(),
            });
            state.rebuild(id);
            state.guards.arm(token, vec![id], ttl, release);
            let patched = state.view.get(id).cloned().unwrap_or(current.clone());
            if !patched.same_content(&current) {
                self.publish(&mut state);
            }
            patched
        };
        debug!(list = %self.inner.list_id, record = %id, ?token, "update");
        self.notify(CommitChange::Updated(patched));

        let engine = self.clone();
        Ok(self.spawn_confirm(async move {
            let result = engine.inner.store.update_record(id, &patch, token).await;
            engine.finish_patch(token, id, result)
        }))
    }

    fn finish_patch(
        &self,
        token: CorrelationId,
        id: RecordId,
        result: Result<Record, StoreError>,
    ) -> Result<Record, ReconcileError> {
        let mut state = self.inner.state.lock();
        for patched in state.drop_patches(token) {
            state.release_base(patched);
        }
        let captured = state.guards.release(token);
        let result = result.or_else(|e| {
            committed_row(&captured, ChangeKind::Update).ok_or(e).inspect(|_| {
                warn!(record = %id, "update response lost; using committed echo")
            })
        });
        if state.closed {
            return result.map_err(Into::into);
        }

        match result {
            Ok(canonical) => {
                if state.merge_confirmed(canonical.clone()) {
                    self.publish(&mut state);
                }
                Ok(canonical)
            }
            Err(StoreError::NotFound(_)) => {
                // Gone on the store; stop showing it.
                state.view.remove(id);
                state.view.mark_tombstoned(id);
                state.forget_record(id);
                let err = ReconcileError::NotFound(id);
                debug!(list = %self.inner.list_id, record = %id, "update target vanished");
                self.fail(&mut state, &err);
                Err(err)
            }
            Err(e) => {
                let err = ReconcileError::from(e);
                warn!(list = %self.inner.list_id, record = %id, "update failed: {err}");
                self.fail(&mut state, &err);
                Err(err)
            }
        }
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Remove a record locally and tombstone it on the store.
    ///
    /// On failure the last known copy is restored. A record the store no
    /// longer has counts as removed.
    pub fn remove(&self, id: RecordId) -> Result<Mutation<()>, ReconcileError> {
        let token = CorrelationId::new();
        {
            let mut state = self.lock_open()?;
            if state.is_provisional(id) {
                return Err(ReconcileError::Validation(format!(
                    "record {id} is still being created"
                )));
            }
            if state.pending_removals.contains_key(&id) {
                return Ok(Mutation::settled(Ok(())));
            }
            let last_known = state.view.remove(id);
            let removed = last_known.is_some();
            state.pending_removals.insert(id, PendingRemoval { token, last_known });
            state.guards.arm(
                token,
                vec![id],
                self.inner.config.mutation_guard_ttl(),
                Release::OnConfirm,
            );
            if removed {
                self.publish(&mut state);
            }
        }
        debug!(list = %self.inner.list_id, record = %id, ?token, "remove");
        self.notify(CommitChange::Removed(id));

        let engine = self.clone();
        Ok(self.spawn_confirm(async move {
            let result = engine.inner.store.soft_delete_record(id, token).await;
            engine.finish_remove(token, id, result)
        }))
    }

    fn finish_remove(
        &self,
        token: CorrelationId,
        id: RecordId,
        result: Result<(), StoreError>,
    ) -> Result<(), ReconcileError> {
        let mut state = self.inner.state.lock();
        let captured = state.guards.release(token);
        let pending = match state.pending_removals.get(&id) {
            Some(p) if p.token == token => state.pending_removals.remove(&id),
            _ => None,
        };
        let failure = match result {
            Ok(()) | Err(StoreError::NotFound(_)) => None,
            Err(e) if committed_removals(&captured).contains(&id) => {
                warn!(record = %id, "delete response lost; using committed echo: {e}");
                None
            }
            Err(e) => Some(ReconcileError::from(e)),
        };
        if state.closed {
            return failure.map_or(Ok(()), Err);
        }

        let Some(err) = failure else {
            state.view.mark_tombstoned(id);
            state.forget_record(id);
            state.record_journal(JournalEntry::Removed(id));
            if state.view.remove(id).is_some() {
                self.publish(&mut state);
            }
            debug!(list = %self.inner.list_id, record = %id, "remove confirmed");
            return Ok(());
        };

        if let Some(record) = pending.and_then(|p| p.last_known) {
            if !state.view.is_tombstoned(id) && !state.view.contains(id) {
                state.advance(record);
            }
        }
        warn!(list = %self.inner.list_id, record = %id, "remove failed, restored: {err}");
        self.fail(&mut state, &err);
        Err(err)
    }

    // ========================================================================
    // Reorder
    // ========================================================================

    /// Rearrange the list into `ordered` (a full order or a leading subset).
    ///
    /// Records whose `add` is still in flight cannot be placed yet. Positions are rewritten as `0..N-1`; only rows whose position
    /// actually moved are sent. Any failure falls back to a full `load()`.
    pub fn reorder(&self, ordered: &[RecordId]) -> Result<Mutation<()>, ReconcileError> {
        let token = CorrelationId::new();
        let (order, updates) = {
            let mut state = self.lock_open()?;
            if let Some(id) = ordered.iter().find(|id| state.is_provisional(**id)) {
                return Err(ReconcileError::Validation(format!(
                    "record {id} is still being created"
                )));
            }
            let positions = ordering::assign_positions(&state.view.ids(), ordered)?;
            let mut updates = Vec::new();
            let mut moved = false;
            for (&id, &position) in &positions {
                let Some(current) = state.view.get(id).cloned() else {
                    continue;
                };
                if current.position == position {
                    continue;
                }
                moved = true;
                // Trailing provisional row: shown in place until its create
                // lands and the canonical row replaces it.
                if state.is_provisional(id) {
                    if let Some(record) = state.view.get_mut(id) {
                        record.position = position;
                    }
                    continue;
                }
                state.bases.entry(id).or_insert(current);
                state.pending_patches.push(PendingPatch {
                    token,
                    id,
                    patch: RecordPatch::new().position(position),
                    at: now_millis(),
                });
                state.rebuild(id);
                updates.push(PositionUpdate { id, position });
            }
            state.view.resort();
            if !updates.is_empty() {
                state.guards.arm(
                    token,
                    updates.iter().map(|u| u.id).collect(),
                    self.inner.config.mutation_guard_ttl(),
                    Release::OnConfirm,
                );
            }
            if moved {
                self.publish(&mut state);
            }
            (positions.keys().copied().collect::<Vec<_>>(), updates)
        };
        if updates.is_empty() {
            return Ok(Mutation::settled(Ok(())));
        }
        debug!(list = %self.inner.list_id, moved = updates.len(), ?token, "reorder");
        self.notify(CommitChange::Reordered(order));

        let engine = self.clone();
        Ok(self.spawn_confirm(async move {
            let result = engine.inner.store.batch_update_positions(&updates, token).await;
            engine.finish_reorder(token, result).await
        }))
    }

    async fn finish_reorder(
        &self,
        token: CorrelationId,
        result: Result<(), StoreError>,
    ) -> Result<(), ReconcileError> {
        let err = {
            let mut state = self.inner.state.lock();
            for id in state.drop_patches(token) {
                state.release_base(id);
            }
            let captured = state.guards.release(token);
            match result {
                Ok(()) => return Ok(()),
                // All-or-nothing on the store: any echo means it committed.
                Err(_) if !captured.is_empty() => return Ok(()),
                Err(e) => ReconcileError::from(e),
            }
        };
        warn!(list = %self.inner.list_id, "reorder failed, resynchronising: {err}");
        self.resync_after(&err).await;
        Err(err)
    }

    // ========================================================================
    // Clear done
    // ========================================================================

    /// Remove every done record locally and tombstone them on the store in
    /// one request. Resolves with the ids the store removed. Any failure
    /// falls back to a full `load()`.
    pub fn clear_done(&self) -> Result<Mutation<Vec<RecordId>>, ReconcileError> {
        let token = CorrelationId::new();
        let cleared: Vec<RecordId> = {
            let mut guard = self.lock_open()?;
            let state = &mut *guard;
            let pending_adds = &state.pending_adds;
            let gone = state.view.remove_where(|r| {
                r.done && !pending_adds.contains(&r.id.as_token())
            });
            let ids: Vec<RecordId> = gone.iter().map(|r| r.id).collect();
            for record in gone {
                state
                    .pending_removals
                    .insert(record.id, PendingRemoval { token, last_known: Some(record) });
            }
            state.guards.arm(
                token,
                ids.clone(),
                self.inner.config.mutation_guard_ttl(),
                Release::OnConfirm,
            );
            if !ids.is_empty() {
                self.publish(state);
            }
            ids
        };
        debug!(list = %self.inner.list_id, count = cleared.len(), ?token, "clear done");
        self.notify(CommitChange::ClearedDone(cleared.clone()));

        let engine = self.clone();
        Ok(self.spawn_confirm(async move {
            let result = engine
                .inner
                .store
                .soft_delete_done(engine.inner.list_id, token)
                .await;
            engine.finish_clear_done(token, cleared, result).await
        }))
    }

    async fn finish_clear_done(
        &self,
        token: CorrelationId,
        cleared: Vec<RecordId>,
        result: Result<Vec<RecordId>, StoreError>,
    ) -> Result<Vec<RecordId>, ReconcileError> {
        let (outcome, recovered) = {
            let mut state = self.inner.state.lock();
            let captured = state.guards.release(token);
            let mut removals = Vec::with_capacity(cleared.len());
            for id in &cleared {
                if state.pending_removals.get(id).is_some_and(|p| p.token == token) {
                    if let Some(removal) = state.pending_removals.remove(id) {
                        removals.push((*id, removal.last_known));
                    }
                }
            }
            let (outcome, recovered) = match result {
                Ok(ids) => (Ok(ids), false),
                Err(e) => {
                    let echoed = committed_removals(&captured);
                    if echoed.is_empty() {
                        (Err(ReconcileError::from(e)), false)
                    } else {
                        warn!(list = %self.inner.list_id, "clear-done response lost; using committed echoes");
                        (Ok(echoed), true)
                    }
                }
            };
            if state.closed {
                return outcome;
            }
            if let Ok(ids) = &outcome {
                let deleted: HashSet<RecordId> = ids.iter().copied().collect();
                for id in ids {
                    state.view.mark_tombstoned(*id);
                    state.record_journal(JournalEntry::Removed(*id));
                    state.view.remove(*id);
                }
                // Cleared locally but no longer done on the store (someone
                // unchecked it meanwhile): bring it back. After a lost
                // response the echoes are partial, so the reload decides.
                if !recovered {
                    for (id, last_known) in removals {
                        if deleted.contains(&id) || state.view.is_tombstoned(id) {
                            continue;
                        }
                        if let Some(record) = last_known {
                            state.advance(record);
                        }
                    }
                }
                self.publish(&mut state);
                debug!(list = %self.inner.list_id, count = ids.len(), "clear done confirmed");
            }
            (outcome, recovered)
        };

        match &outcome {
            Err(err) => {
                warn!(list = %self.inner.list_id, "clear done failed, resynchronising: {err}");
                self.resync_after(err).await;
            }
            Ok(_) if recovered => {
                if let Err(e) = self.load().await {
                    warn!(list = %self.inner.list_id, "resync load failed: {e}");
                }
            }
            Ok(_) => {}
        }
        outcome
    }

    /// Reload after a failed batch operation, keeping its error visible.
    async fn resync_after(&self, err: &ReconcileError) {
        if let Err(load_err) = self.load().await {
            warn!(list = %self.inner.list_id, "resync load failed: {load_err}");
        }
        let mut state = self.inner.state.lock();
        if !state.closed {
            self.fail(&mut state, err);
        }
    }

    // ========================================================================
    // Change feed
    // ========================================================================

    /// Merge one inbound change event.
    ///
    /// Never fails: echoes of our own writes are suppressed, stale or
    /// redundant events are ignored, and duplicates are no-ops.
    pub fn on_remote_change(&self, event: ChangeEvent) -> ApplyOutcome {
        let mut state = self.inner.state.lock();
        if state.closed {
            trace!(record = %event.record_id(), "event after close dropped");
            return ApplyOutcome::Skipped(SkipReason::Closed);
        }
        if event.list_id() != self.inner.list_id {
            return ApplyOutcome::Skipped(SkipReason::ListMismatch {
                expected: self.inner.list_id,
                got: event.list_id(),
            });
        }
        state.guards.purge();
        if let Some(hit) = state.guards.check(&event) {
            trace!(record = %event.record_id(), ?hit, "echo suppressed");
            return ApplyOutcome::Suppressed(hit);
        }

        let kind = event.kind();
        let id = event.record_id();
        let outcome = state.apply_event(event);
        if outcome == ApplyOutcome::Applied {
            self.publish(&mut state);
        }
        trace!(list = %self.inner.list_id, record = %id, %kind, ?outcome, "remote change");
        outcome
    }
}
