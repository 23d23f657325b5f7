//! Change-feed events as they cross the remote store boundary.
//!
//! The store delivers loosely-shaped JSON payloads. [`ChangeEvent::decode`]
//! is the one place those payloads become typed events; anything that fails
//! to decode is rejected here and never reaches the reconciliation core.
//!
//! Wire shape (`kind` tag, snake_case):
//!
//! ```text
//! { "kind": "update",
//!   "record": { ...Record... },
//!   "previous": { ...Record... },      // update only, optional
//!   "correlation": "0190..." }         // optional writer token
//! ```

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::ids::{CorrelationId, ListId, RecordId};
use crate::record::Record;

/// What happened to a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single committed change on a list, delivered by the change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert {
        record: Record,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<CorrelationId>,
    },
    Update {
        record: Record,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<Record>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<CorrelationId>,
    },
    Delete {
        record: Record,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation: Option<CorrelationId>,
    },
}

/// A feed payload that could not be turned into a [`ChangeEvent`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed change payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("change payload has a nil {0} id")]
    NilId(&'static str),
    #[error("update for {record} carries a previous row for {previous}")]
    PreviousMismatch { record: RecordId, previous: RecordId },
}

impl ChangeEvent {
    /// Decode and validate a raw feed payload.
    pub fn decode(raw: serde_json::Value) -> Result<Self, DecodeError> {
        let event: ChangeEvent = serde_json::from_value(raw)?;
        event.validate()?;
        Ok(event)
    }

    /// Encode for the wire.
    pub fn encode(&self) -> serde_json::Value {
        // A ChangeEvent is plain data with string keys; this cannot fail.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn validate(&self) -> Result<(), DecodeError> {
        let record = self.record();
        if record.id.is_nil() {
            return Err(DecodeError::NilId("record"));
        }
        if record.list_id.is_nil() {
            return Err(DecodeError::NilId("list"));
        }
        if let Self::Update { previous: Some(prev), .. } = self {
            if prev.id != record.id {
                return Err(DecodeError::PreviousMismatch {
                    record: record.id,
                    previous: prev.id,
                });
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert { .. } => ChangeKind::Insert,
            Self::Update { .. } => ChangeKind::Update,
            Self::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// The row after the change (for deletes: the tombstoned row).
    pub fn record(&self) -> &Record {
        match self {
            Self::Insert { record, .. }
            | Self::Update { record, .. }
            | Self::Delete { record, .. } => record,
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record().id
    }

    pub fn list_id(&self) -> ListId {
        self.record().list_id
    }

    /// Token of the write that produced this change, if the store sent one.
    pub fn correlation(&self) -> Option<CorrelationId> {
        match self {
            Self::Insert { correlation, .. }
            | Self::Update { correlation, .. }
            | Self::Delete { correlation, .. } => *correlation,
        }
    }

    pub fn previous(&self) -> Option<&Record> {
        match self {
            Self::Update { previous, .. } => previous.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::PrincipalId;
    use crate::record::NewRecord;
    use serde_json::json;

    fn record() -> Record {
        Record::create(RecordId::new(), ListId::new(), &NewRecord::new("Milk"), 0, PrincipalId::new())
    }

    #[test]
    fn test_wire_shape_uses_kind_tag() {
        let event = ChangeEvent::Delete { record: record(), correlation: None };
        let wire = event.encode();
        assert_eq!(wire["kind"], json!("delete"));
        assert!(wire.get("correlation").is_none());
        assert_eq!(ChangeEvent::decode(wire).unwrap(), event);
    }

    #[test]
    fn test_decode_keeps_correlation() {
        let token = CorrelationId::new();
        let event = ChangeEvent::Insert { record: record(), correlation: Some(token) };
        let decoded = ChangeEvent::decode(event.encode()).unwrap();
        assert_eq!(decoded.correlation(), Some(token));
        assert_eq!(decoded.kind(), ChangeKind::Insert);
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut wire = ChangeEvent::Insert { record: record(), correlation: None }.encode();
        wire["kind"] = json!("truncate");
        assert!(matches!(ChangeEvent::decode(wire), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_missing_record() {
        let wire = json!({ "kind": "update" });
        assert!(matches!(ChangeEvent::decode(wire), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_nil_ids() {
        let mut r = record();
        r.id = RecordId::nil();
        let wire = ChangeEvent::Insert { record: r, correlation: None }.encode();
        assert!(matches!(ChangeEvent::decode(wire), Err(DecodeError::NilId("record"))));
    }

    #[test]
    fn test_decode_rejects_mismatched_previous() {
        let wire = ChangeEvent::Update {
            record: record(),
            previous: Some(record()),
            correlation: None,
        }
        .encode();
        assert!(matches!(
            ChangeEvent::decode(wire),
            Err(DecodeError::PreviousMismatch { .. })
        ));
    }

    #[test]
    fn test_change_kind_strings() {
        assert_eq!(ChangeKind::Update.to_string(), "update");
        assert_eq!("delete".parse::<ChangeKind>().unwrap(), ChangeKind::Delete);
    }
}
