//! Typed identifiers.
//!
//! Every id is a UUIDv7 behind its own newtype so a `ListId` can never be
//! passed where a `RecordId` is expected. `Display` prints the full UUID
//! (logs, wire); `Debug` prints `Type(abcd1234)` for test output.
//!
//! Record ids are minted by the store, with one exception: a record whose
//! `add` is still in flight is shown under a provisional id made from the
//! write's [`CorrelationId`]. Both are v7 UUIDs drawn independently, so the
//! provisional id never collides with a stored one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! typed_id {
    ($(#[$meta:meta])* $T:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $T(uuid::Uuid);

        impl $T {
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// Leading 8 hex digits. Ambiguous; never use it as a key.
            pub fn short(&self) -> String {
                let mut hex = self.0.simple().to_string();
                hex.truncate(8);
                hex
            }

            /// `label` when present and non-empty, else [`short`](Self::short).
            pub fn display_or(&self, label: Option<&str>) -> String {
                label
                    .filter(|l| !l.is_empty())
                    .map_or_else(|| self.short(), str::to_owned)
            }

            pub fn nil() -> Self {
                Self(uuid::Uuid::nil())
            }

            pub fn is_nil(&self) -> bool {
                self.0.is_nil()
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($T), "({})"), self.short())
            }
        }
    };
}

typed_id! {
    /// One entry of a list.
    RecordId
}

typed_id! {
    /// A shared list; every record belongs to exactly one.
    ListId
}

typed_id! {
    /// Someone (or the system) acting on lists. Sentinels use UUIDv5.
    PrincipalId
}

typed_id! {
    /// Idempotency token sent with one write.
    ///
    /// The store stamps it onto the change events that write produces, so
    /// the writer can tell its own echoes apart from everyone else's.
    CorrelationId
}

const SENTINEL_NAMESPACE: uuid::Uuid = uuid::uuid!("5d0c7a52-93e1-4f6b-b8a2-0e4f1c7d9a36");

impl PrincipalId {
    /// Same value on every client.
    pub fn system() -> Self {
        Self(uuid::Uuid::new_v5(&SENTINEL_NAMESPACE, b"principal:system"))
    }
}

impl RecordId {
    /// Id shown for a record whose `add` (sent with `token`) is in flight.
    pub fn provisional(token: CorrelationId) -> Self {
        Self(token.0)
    }

    /// The token this id would have if it were provisional.
    pub fn as_token(&self) -> CorrelationId {
        CorrelationId(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_sort_by_creation() {
        let first = RecordId::new();
        let second = RecordId::new();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_short_prefixes_display() {
        let id = ListId::new();
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
    }

    #[test]
    fn test_from_str_accepts_display_form_only() {
        let id = PrincipalId::new();
        assert_eq!(id.to_string().parse::<PrincipalId>().unwrap(), id);
        assert!("shopping".parse::<PrincipalId>().is_err());
    }

    #[test]
    fn test_system_principal_is_stable() {
        assert_eq!(PrincipalId::system(), PrincipalId::system());
        assert!(!PrincipalId::system().is_nil());
    }

    #[test]
    fn test_provisional_id_maps_back_to_its_token() {
        let token = CorrelationId::new();
        assert_eq!(RecordId::provisional(token).as_token(), token);
    }

    #[test]
    fn test_display_or_skips_blank_labels() {
        let id = PrincipalId::new();
        assert_eq!(id.display_or(Some("Amy")), "Amy");
        assert_eq!(id.display_or(Some("")), id.short());
        assert_eq!(id.display_or(None), id.short());
    }

    #[test]
    fn test_debug_names_the_type() {
        assert_eq!(format!("{:?}", CorrelationId::nil()), "CorrelationId(00000000)");
    }
}
