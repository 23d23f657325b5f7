//! Who wrote a record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::PrincipalId;

/// A list member, or the system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    /// Login handle, e.g. "amy".
    pub username: String,
    /// Shown next to the records this principal created.
    pub display_name: String,
}

impl Principal {
    pub fn new(username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::with_id(PrincipalId::new(), username, display_name)
    }

    pub fn with_id(
        id: PrincipalId,
        username: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self { id, username: username.into(), display_name: display_name.into() }
    }

    pub fn system() -> Self {
        Self::with_id(PrincipalId::system(), "system", "System")
    }

    pub fn is_system(&self) -> bool {
        self.id == PrincipalId::system()
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <@{}>", self.display_name, self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_principal_gets_fresh_id() {
        let amy = Principal::new("amy", "Amy Park");
        let other = Principal::new("amy", "Amy Park");
        assert_ne!(amy.id, other.id);
        assert!(!amy.is_system());
        assert_eq!(amy.to_string(), "Amy Park <@amy>");
    }

    #[test]
    fn test_system_principal() {
        let system = Principal::system();
        assert!(system.is_system());
        assert_eq!(system, Principal::system());
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let ben = Principal::new("ben", "Ben Ito");
        let value = serde_json::to_value(&ben).unwrap();
        assert_eq!(value["username"], "ben");
        assert_eq!(value["id"], ben.id.to_string());
    }
}
