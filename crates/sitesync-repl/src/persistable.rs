//! Identity shared by every persisted replication object.

use crate::error::{ReplError, Result};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Identity of a persisted object. Two identities are equal when their ids are equal, whatever
/// their kind label says.
#[derive(Debug, Clone)]
pub struct Persistable {
    /// Unique identifier generated at creation.
    pub id: Uuid,
    /// Human-readable kind used in error messages (e.g. "task").
    pub kind: &'static str,
}

impl Persistable {
    /// Create a new identity with a random id.
    pub fn new(kind: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }

    /// Re-create an identity read back from storage.
    pub fn with_id(kind: &'static str, id: Uuid) -> Self {
        Self { id, kind }
    }
}

impl PartialEq for Persistable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Persistable {}

impl Hash for Persistable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Fail with `InvalidField` when a string field is empty.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ReplError::InvalidField {
            field,
            msg: "must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Unwrap an optional field or fail with `InvalidField`.
pub fn require_present<T>(field: &'static str, value: Option<T>) -> Result<T> {
    value.ok_or(ReplError::InvalidField {
        field,
        msg: "missing".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_equality_ignores_kind() {
        let a = Persistable::new("task");
        let b = Persistable::with_id("item", a.id);
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_ids_are_not_equal() {
        assert_ne!(Persistable::new("task"), Persistable::new("task"));
    }

    #[test]
    fn test_hash_follows_id() {
        let a = Persistable::new("task");
        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&Persistable::with_id("other", a.id)));
    }

    #[test]
    fn test_require_non_empty() {
        assert!(require_non_empty("name", "x").is_ok());
        assert!(matches!(
            require_non_empty("name", "  "),
            Err(ReplError::InvalidField { field: "name", .. })
        ));
    }

    #[test]
    fn test_require_present() {
        assert_eq!(require_present("n", Some(3)).unwrap(), 3);
        assert!(require_present::<u8>("n", None).is_err());
    }
}
