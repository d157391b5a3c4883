//! Canonical change-notification schema shared by both backend generations.
//!
//! Each backend speaks its own change-action vocabulary; watch loops map
//! raw records onto [`Event`] before delivery so subscribers never see a
//! generation-specific action.

use std::fmt;

/// Normalized change action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// The entry was created.
    Created,
    /// The entry's value was overwritten.
    Updated,
    /// The entry was removed, either explicitly or by TTL/lease expiry.
    Deleted,
}

impl Action {
    /// Map a generation-2 native action onto the normalized set.
    ///
    /// Returns `None` for actions that do not concern entry lifecycle
    /// (e.g. a raw `get` echoed on a watch stream).
    pub(crate) fn from_v2(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Created),
            "set" | "update" | "compareAndSwap" => Some(Self::Updated),
            "expire" | "delete" | "compareAndDelete" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Whether this action removed the entry.
    pub fn is_deleted(self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A membership change within a watched namespace.
///
/// Events are produced by the watch loops, never mutated, and consumed at
/// most once per subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// What happened to the entry.
    pub action: Action,
    /// Entry name relative to the watched namespace.
    pub name: String,
    /// Last-known address; for deletions, the value immediately prior to
    /// removal.
    pub addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_create_maps_to_created() {
        assert_eq!(Action::from_v2("create"), Some(Action::Created));
    }

    #[test]
    fn v2_overwrites_map_to_updated() {
        for action in ["set", "update", "compareAndSwap"] {
            assert_eq!(Action::from_v2(action), Some(Action::Updated));
        }
    }

    #[test]
    fn v2_removals_map_to_deleted() {
        for action in ["expire", "delete", "compareAndDelete"] {
            assert_eq!(Action::from_v2(action), Some(Action::Deleted));
            assert!(Action::from_v2(action).unwrap().is_deleted());
        }
    }

    #[test]
    fn v2_non_lifecycle_actions_are_dropped() {
        assert_eq!(Action::from_v2("get"), None);
        assert_eq!(Action::from_v2(""), None);
    }

    #[test]
    fn action_display_is_lowercase() {
        assert_eq!(Action::Created.to_string(), "created");
        assert_eq!(Action::Updated.to_string(), "updated");
        assert_eq!(Action::Deleted.to_string(), "deleted");
    }
}
