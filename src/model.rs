use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A registered user as the directory stores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Profile {
    /// Display name if the user set one, otherwise the email.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

/// One message from exactly one sender identity to exactly one receiver
/// identity. Immutable once written, except for the `read` flag which only
/// ever transitions false -> true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectedMessage {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl DirectedMessage {
    /// True if this message travels between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// Display order: creation time ascending, ties broken by id.
    pub fn display_order(&self, other: &DirectedMessage) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Directory entry enriched for the conversation list: the most recent
/// message exchanged with that user (either direction) and how many of
/// their messages to us are still unread. Derived on demand, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub profile: Profile,
    pub last_message: Option<DirectedMessage>,
    pub unread: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(id: &str, at: i64) -> DirectedMessage {
        DirectedMessage {
            id: id.to_string(),
            sender_id: "a".to_string(),
            receiver_id: "b".to_string(),
            content: "hello".to_string(),
            created_at: Utc.timestamp_opt(at, 0).unwrap(),
            read: false,
        }
    }

    #[test]
    fn display_order_prefers_creation_time_then_id() {
        let earlier = message("z", 10);
        let later = message("a", 20);
        assert_eq!(earlier.display_order(&later), Ordering::Less);

        // Same second: the id decides.
        let tie_a = message("a", 10);
        let tie_b = message("b", 10);
        assert_eq!(tie_a.display_order(&tie_b), Ordering::Less);
    }

    #[test]
    fn is_between_ignores_direction() {
        let msg = message("m", 10);
        assert!(msg.is_between("a", "b"));
        assert!(msg.is_between("b", "a"));
        assert!(!msg.is_between("a", "c"));
    }
}
