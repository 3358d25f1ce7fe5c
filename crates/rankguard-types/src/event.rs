//! Change notifications exchanged between rankguard instances.
//!
//! A [`NetworkEvent`] is what a transport carries after a local mutation.
//! Receivers compare `origin` with their own token to drop their own echo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::user::UserKey;

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    UserChanged { user: UserKey },
    GroupChanged { group: String },
    UserDeleted { user: UserKey },
    GroupDeleted { group: String },
    AllUsersChanged,
    AllGroupsChanged,
    AllChanged,
}

/// A change tagged with the instance that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub origin: String,
    pub change: Change,
    pub emitted_at: DateTime<Utc>,
}

impl NetworkEvent {
    pub fn new(origin: impl Into<String>, change: Change) -> Self {
        Self {
            origin: origin.into(),
            change,
            emitted_at: Utc::now(),
        }
    }

    /// Whether this event was produced by the instance holding `origin`.
    pub fn is_from(&self, origin: &str) -> bool {
        self.origin == origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_serializes_with_type_tag() {
        let change = Change::GroupDeleted {
            group: "vip".to_string(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["type"], "group_deleted");
        assert_eq!(json["group"], "vip");
    }

    #[test]
    fn event_roundtrips_user_key() {
        let event = NetworkEvent::new(
            "proxy-1",
            Change::UserChanged {
                user: UserKey::from("Steve"),
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: NetworkEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(back.is_from("proxy-1"));
        assert!(!back.is_from("proxy-2"));
    }
}
