//! Position assignment and the pending/done view split.
//!
//! Positions are consecutive integers `0..N-1` in display order. A sparse
//! scheme would rewrite fewer rows per reorder, but dense positions keep
//! every reorder a pure function of its input and are trivially stable.

use std::collections::HashSet;

use indexmap::IndexMap;
use kaimono_types::{Record, RecordId};

/// A reorder request that does not describe a permutation of the list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderingError {
    #[error("record {0} is not on this list")]
    UnknownId(RecordId),
    #[error("record {0} appears more than once")]
    DuplicateId(RecordId),
}

/// Compute new positions for `current` rearranged as `target`.
///
/// `target` may name a subset (for example, only the pending items the UI
/// let the user drag); ids it leaves out keep their relative order and
/// follow the named ones. The result lists every id of `current` exactly
/// once, in the new order, mapped to its new position.
pub fn assign_positions(
    current: &[RecordId],
    target: &[RecordId],
) -> Result<IndexMap<RecordId, i64>, OrderingError> {
    let known: HashSet<RecordId> = current.iter().copied().collect();
    let mut seen = HashSet::with_capacity(target.len());
    for id in target {
        if !known.contains(id) {
            return Err(OrderingError::UnknownId(*id));
        }
        if !seen.insert(*id) {
            return Err(OrderingError::DuplicateId(*id));
        }
    }

    let rest = current.iter().filter(|id| !seen.contains(id));
    Ok(target
        .iter()
        .chain(rest)
        .enumerate()
        .map(|(position, id)| (*id, position as i64))
        .collect())
}

/// Sort records into display order in place.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by_key(Record::sort_key);
}

/// Not-done records: priority first, otherwise position order.
pub fn pending(items: &[Record]) -> Vec<Record> {
    let mut pending: Vec<Record> = items.iter().filter(|r| !r.done).cloned().collect();
    // Stable, so ties keep the incoming position order.
    pending.sort_by_key(|r| !r.priority);
    pending
}

/// Done records, most recently updated first.
pub fn done(items: &[Record]) -> Vec<Record> {
    let mut done: Vec<Record> = items.iter().filter(|r| r.done).cloned().collect();
    done.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    done
}
