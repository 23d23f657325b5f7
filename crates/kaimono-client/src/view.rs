//! The local projection of one list.
//!
//! [`LocalViewState`] is what this client currently believes the list looks
//! like, optimistic changes included. It is owned by exactly one engine and
//! never shared; readers get immutable [`ViewSnapshot`]s instead.

use std::collections::{HashMap, HashSet};

use kaimono_types::{ListId, Record, RecordId};

use crate::error::ReconcileError;
use crate::ordering;

/// The mutable view behind an engine.
#[derive(Debug)]
pub struct LocalViewState {
    list_id: ListId,
    /// Kept in display order (`Record::sort_key`).
    items: Vec<Record>,
    /// Ids this client has seen tombstoned, with the sequence number they
    /// were marked at. Late updates for them are ignored.
    tombstones: HashMap<RecordId, u64>,
    tombstone_seq: u64,
    pub is_loading: bool,
    pub last_error: Option<ReconcileError>,
    revision: u64,
}

impl LocalViewState {
    pub fn new(list_id: ListId) -> Self {
        Self {
            list_id,
            items: Vec::new(),
            tombstones: HashMap::new(),
            tombstone_seq: 0,
            is_loading: false,
            last_error: None,
            revision: 0,
        }
    }

    pub fn list_id(&self) -> ListId {
        self.list_id
    }

    pub fn items(&self) -> &[Record] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.items.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.items.iter_mut().find(|r| r.id == id)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.items.iter().map(|r| r.id).collect()
    }

    /// Insert or replace by id, keeping display order.
    pub fn upsert(&mut self, record: Record) {
        match self.get_mut(record.id) {
            Some(slot) => *slot = record,
            None => self.items.push(record),
        }
        self.resort();
    }

    /// Put `record` where the row `id` was (or append if `id` is gone).
    pub fn replace(&mut self, id: RecordId, record: Record) {
        self.items.retain(|r| r.id != record.id || r.id == id);
        match self.get_mut(id) {
            Some(slot) => *slot = record,
            None => self.items.push(record),
        }
        self.resort();
    }

    pub fn remove(&mut self, id: RecordId) -> Option<Record> {
        let idx = self.items.iter().position(|r| r.id == id)?;
        Some(self.items.remove(idx))
    }

    /// Remove every record matching `pred`, returning them.
    pub fn remove_where(&mut self, pred: impl Fn(&Record) -> bool) -> Vec<Record> {
        let (gone, keep): (Vec<Record>, Vec<Record>) =
            std::mem::take(&mut self.items).into_iter().partition(|r| pred(r));
        self.items = keep;
        gone
    }

    /// Replace the whole record set.
    pub fn reset(&mut self, records: Vec<Record>) {
        self.items = records;
        self.resort();
    }

    pub fn resort(&mut self) {
        ordering::sort_records(&mut self.items);
    }

    pub fn mark_tombstoned(&mut self, id: RecordId) {
        self.tombstone_seq += 1;
        self.tombstones.entry(id).or_insert(self.tombstone_seq);
    }

    pub fn is_tombstoned(&self, id: RecordId) -> bool {
        self.tombstones.contains_key(&id)
    }

    /// Sequence number of the latest tombstone.
    pub fn tombstone_mark(&self) -> u64 {
        self.tombstone_seq
    }

    /// Forget tombstones marked at or before `mark` that a listing started
    /// after `mark` no longer contains.
    pub fn prune_tombstones(&mut self, mark: u64, listed: &HashSet<RecordId>) {
        self.tombstones.retain(|id, seq| *seq > mark || listed.contains(id));
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Freeze the current state into a new snapshot revision.
    pub fn snapshot(&mut self) -> ViewSnapshot {
        self.revision += 1;
        ViewSnapshot {
            list_id: self.list_id,
            items: self.items.clone(),
            pending_items: ordering::pending(&self.items),
            done_items: ordering::done(&self.items),
            is_loading: self.is_loading,
            last_error: self.last_error.clone(),
            revision: self.revision,
        }
    }
}

/// Immutable view handed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub list_id: ListId,
    /// Every visible record in position order.
    pub items: Vec<Record>,
    /// Not done; priority first.
    pub pending_items: Vec<Record>,
    /// Done; most recently updated first.
    pub done_items: Vec<Record>,
    pub is_loading: bool,
    pub last_error: Option<ReconcileError>,
    /// Increments with every published snapshot.
    pub revision: u64,
}

impl ViewSnapshot {
    pub fn empty(list_id: ListId) -> Self {
        Self {
            list_id,
            items: Vec::new(),
            pending_items: Vec::new(),
            done_items: Vec::new(),
            is_loading: false,
            last_error: None,
            revision: 0,
        }
    }

    /// `(done, total)`.
    pub fn progress(&self) -> (usize, usize) {
        (self.done_items.len(), self.items.len())
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.items.iter().find(|r| r.id == id)
    }

    pub fn find_text(&self, text: &str) -> Option<&Record> {
        self.items.iter().find(|r| r.text == text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaimono_types::{NewRecord, PrincipalId};

    fn rec(list: ListId, text: &str, position: i64) -> Record {
        Record::create(RecordId::new(), list, &NewRecord::new(text), position, PrincipalId::new())
    }

    #[test]
    fn test_upsert_keeps_position_order() {
        let list = ListId::new();
        let mut view = LocalViewState::new(list);
        view.upsert(rec(list, "b", 1));
        view.upsert(rec(list, "a", 0));
        let texts: Vec<&str> = view.items().iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_replace_swaps_id_and_drops_duplicate() {
        let list = ListId::new();
        let mut view = LocalViewState::new(list);
        let provisional = rec(list, "Milk", 0);
        let canonical = rec(list, "Milk", 0);
        view.upsert(provisional.clone());
        // Canonical row already arrived through the feed.
        view.upsert(canonical.clone());
        view.replace(provisional.id, canonical.clone());
        assert_eq!(view.ids(), vec![canonical.id]);
    }

    #[test]
    fn test_remove_where_returns_removed() {
        let list = ListId::new();
        let mut view = LocalViewState::new(list);
        let mut done = rec(list, "done", 0);
        done.done = true;
        view.upsert(done.clone());
        view.upsert(rec(list, "open", 1));
        let gone = view.remove_where(|r| r.done);
        assert_eq!(gone, vec![done]);
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_snapshot_derives_partitions_and_progress() {
        let list = ListId::new();
        let mut view = LocalViewState::new(list);
        let mut x = rec(list, "X", 0);
        x.priority = true;
        view.upsert(x);
        view.upsert(rec(list, "Y", 1));
        let snap = view.snapshot();
        assert_eq!(snap.revision, 1);
        assert_eq!(snap.pending_items.len(), 2);
        assert_eq!(snap.progress(), (0, 2));

        view.get_mut(snap.items[0].id).unwrap().done = true;
        let snap = view.snapshot();
        assert_eq!(snap.revision, 2);
        assert_eq!(snap.done_items[0].text, "X");
        assert_eq!(snap.progress(), (1, 2));
    }

    #[test]
    fn test_prune_keeps_tombstones_newer_than_mark() {
        let list = ListId::new();
        let mut view = LocalViewState::new(list);
        let (old, listed, fresh) = (RecordId::new(), RecordId::new(), RecordId::new());
        view.mark_tombstoned(old);
        view.mark_tombstoned(listed);
        let mark = view.tombstone_mark();
        view.mark_tombstoned(fresh);

        view.prune_tombstones(mark, &HashSet::from([listed]));
        assert!(!view.is_tombstoned(old));
        assert!(view.is_tombstoned(listed));
        assert!(view.is_tombstoned(fresh));
        assert_eq!(view.tombstone_count(), 2);
    }
}
