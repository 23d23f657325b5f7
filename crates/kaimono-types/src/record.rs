//! List records and the payloads that create or change them.
//!
//! A [`Record`] is the unit of collaboration: one entry on a shared list.
//! Its identity, version, and timestamps are owned by the remote store;
//! clients only ever propose a [`NewRecord`] or a [`RecordPatch`].

use serde::{Deserialize, Serialize};

use crate::ids::{CorrelationId, ListId, PrincipalId, RecordId};

/// Longest accepted record text, in characters.
pub const MAX_TEXT_LEN: usize = 500;

/// Longest accepted quantity or notes value, in characters.
pub const MAX_NOTE_LEN: usize = 2000;

/// Payload rejected before it ever reaches the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("record text must not be empty")]
    EmptyText,
    #[error("{field} is too long ({len} > {max} characters)")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("patch changes nothing")]
    EmptyPatch,
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    Ok(())
}

fn check_text(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText);
    }
    check_len("text", text, MAX_TEXT_LEN)
}

/// Helper for `#[serde(skip_serializing_if)]` on bool fields.
fn is_false(v: &bool) -> bool {
    !v
}

/// One entry on a shared list, as the remote store knows it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    /// The list (partition) this record belongs to.
    pub list_id: ListId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub priority: bool,
    /// Sort index within the list. Need not be contiguous; ties fall back
    /// to creation time.
    pub position: i64,
    /// Bumped by the store on every successful write.
    pub version: u64,
    /// Soft-delete marker. Tombstoned rows never appear in listings.
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    pub created_by: PrincipalId,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis.
    pub updated_at: u64,
}

impl Record {
    /// Build the canonical row for a freshly created record.
    pub fn create(
        id: RecordId,
        list_id: ListId,
        payload: &NewRecord,
        position: i64,
        created_by: PrincipalId,
    ) -> Self {
        let now = crate::now_millis();
        Self {
            id,
            list_id,
            text: payload.text.clone(),
            quantity: payload.quantity.clone(),
            notes: payload.notes.clone(),
            done: payload.done,
            priority: payload.priority,
            position,
            version: 1,
            deleted: false,
            created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// The local stand-in shown while an `add` is still in flight.
    ///
    /// Version 0 marks it as never confirmed by the store.
    pub fn provisional(
        token: CorrelationId,
        list_id: ListId,
        payload: &NewRecord,
        position: i64,
        created_by: PrincipalId,
    ) -> Self {
        let mut record = Self::create(
            RecordId::provisional(token),
            list_id,
            payload,
            position,
            created_by,
        );
        record.version = 0;
        record
    }

    /// Stable ordering key: position, then creation time, then id.
    pub fn sort_key(&self) -> (i64, u64, RecordId) {
        (self.position, self.created_at, self.id)
    }

    /// Whether two rows agree on every user-visible field.
    ///
    /// Ignores `version` and `updated_at`, which the store re-stamps on writes
    /// that change nothing a user could see.
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.list_id == other.list_id
            && self.text == other.text
            && self.quantity == other.quantity
            && self.notes == other.notes
            && self.done == other.done
            && self.priority == other.priority
            && self.position == other.position
            && self.deleted == other.deleted
    }
}

/// Payload of an `add` intent. The store assigns id, version and position.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub priority: bool,
}

impl NewRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn quantity(mut self, quantity: impl Into<String>) -> Self {
        self.quantity = Some(quantity.into());
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    pub fn done(mut self, done: bool) -> Self {
        self.done = done;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        check_text(&self.text)?;
        if let Some(q) = &self.quantity {
            check_len("quantity", q, MAX_NOTE_LEN)?;
        }
        if let Some(n) = &self.notes {
            check_len("notes", n, MAX_NOTE_LEN)?;
        }
        Ok(())
    }
}

/// Field replacements for an existing record.
///
/// `None` leaves a field untouched. `quantity` and `notes` are doubly
/// optional so a patch can clear them (`Some(None)`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn quantity(mut self, quantity: Option<String>) -> Self {
        self.quantity = Some(quantity);
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn done(mut self, done: bool) -> Self {
        self.done = Some(done);
        self
    }

    pub fn priority(mut self, priority: bool) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }
        if let Some(text) = &self.text {
            check_text(text)?;
        }
        if let Some(Some(q)) = &self.quantity {
            check_len("quantity", q, MAX_NOTE_LEN)?;
        }
        if let Some(Some(n)) = &self.notes {
            check_len("notes", n, MAX_NOTE_LEN)?;
        }
        Ok(())
    }

    /// Replace the patched fields on `record`. Returns whether anything changed.
    ///
    /// Does not touch `version` or `updated_at`; stamping is the caller's job.
    pub fn apply_to(&self, record: &mut Record) -> bool {
        let before = record.clone();
        if let Some(text) = &self.text {
            record.text = text.clone();
        }
        if let Some(quantity) = &self.quantity {
            record.quantity = quantity.clone();
        }
        if let Some(notes) = &self.notes {
            record.notes = notes.clone();
        }
        if let Some(done) = self.done {
            record.done = done;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(position) = self.position {
            record.position = position;
        }
        !record.same_content(&before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::create(
            RecordId::new(),
            ListId::new(),
            &NewRecord::new("Milk").quantity("2 l"),
            0,
            PrincipalId::new(),
        )
    }

    #[test]
    fn test_create_stamps_version_one() {
        let r = sample();
        assert_eq!(r.version, 1);
        assert_eq!(r.text, "Milk");
        assert_eq!(r.quantity.as_deref(), Some("2 l"));
        assert!(!r.deleted);
        assert_eq!(r.created_at, r.updated_at);
    }

    #[test]
    fn test_provisional_uses_token_id_and_version_zero() {
        let token = CorrelationId::new();
        let r = Record::provisional(token, ListId::new(), &NewRecord::new("Eggs"), 3, PrincipalId::new());
        assert_eq!(r.id, RecordId::provisional(token));
        assert_eq!(r.version, 0);
        assert_eq!(r.position, 3);
    }

    #[test]
    fn test_validate_rejects_blank_text() {
        assert_eq!(NewRecord::new("   ").validate(), Err(ValidationError::EmptyText));
        assert_eq!(RecordPatch::new().text("").validate(), Err(ValidationError::EmptyText));
        assert!(NewRecord::new("Bread").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_long_fields() {
        let long = "x".repeat(MAX_TEXT_LEN + 1);
        assert!(matches!(
            NewRecord::new(long).validate(),
            Err(ValidationError::TooLong { field: "text", .. })
        ));
        let notes = "n".repeat(MAX_NOTE_LEN + 1);
        assert!(matches!(
            RecordPatch::new().notes(Some(notes)).validate(),
            Err(ValidationError::TooLong { field: "notes", .. })
        ));
    }

    #[test]
    fn test_empty_patch_is_invalid() {
        assert!(RecordPatch::new().is_empty());
        assert_eq!(RecordPatch::new().validate(), Err(ValidationError::EmptyPatch));
    }

    #[test]
    fn test_patch_apply_reports_change() {
        let mut r = sample();
        assert!(RecordPatch::new().done(true).apply_to(&mut r));
        assert!(r.done);
        // Same value again is not a change.
        assert!(!RecordPatch::new().done(true).apply_to(&mut r));
    }

    #[test]
    fn test_patch_can_clear_optional_fields() {
        let mut r = sample();
        assert!(RecordPatch::new().quantity(None).apply_to(&mut r));
        assert_eq!(r.quantity, None);
    }

    #[test]
    fn test_same_content_ignores_version_and_timestamps() {
        let a = sample();
        let mut b = a.clone();
        b.version += 3;
        b.updated_at += 1000;
        assert!(a.same_content(&b));
        b.priority = true;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_sort_key_breaks_position_ties_by_creation() {
        let mut a = sample();
        let mut b = sample();
        a.position = 1;
        b.position = 1;
        a.created_at = 10;
        b.created_at = 5;
        assert!(b.sort_key() < a.sort_key());
    }

    #[test]
    fn test_patch_serde_distinguishes_clear_from_untouched() {
        let patch = RecordPatch::new().text("Oat milk");
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "text": "Oat milk" }));
    }
}
