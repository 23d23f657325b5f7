//! Display names for record creators.

use std::collections::HashMap;

use kaimono_types::{Principal, PrincipalId, Record};
use parking_lot::RwLock;

/// Cache of `PrincipalId -> display name`.
///
/// Filled by whoever knows the list's members; unknown principals render
/// as their short id.
#[derive(Debug, Default)]
pub struct PrincipalDirectory {
    names: RwLock<HashMap<PrincipalId, String>>,
}

impl PrincipalDirectory {
    pub fn new() -> Self {
        let dir = Self::default();
        dir.insert(&Principal::system());
        dir
    }

    pub fn insert(&self, principal: &Principal) {
        self.names
            .write()
            .insert(principal.id, principal.display_name.clone());
    }

    pub fn extend<'a>(&self, principals: impl IntoIterator<Item = &'a Principal>) {
        let mut names = self.names.write();
        for p in principals {
            names.insert(p.id, p.display_name.clone());
        }
    }

    pub fn get(&self, id: PrincipalId) -> Option<String> {
        self.names.read().get(&id).cloned()
    }

    pub fn display_name(&self, id: PrincipalId) -> String {
        let names = self.names.read();
        id.display_or(names.get(&id).map(String::as_str))
    }

    /// Who created `record`, for display.
    pub fn creator_of(&self, record: &Record) -> String {
        self.display_name(record.created_by)
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }
}
