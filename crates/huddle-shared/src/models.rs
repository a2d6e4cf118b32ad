//! Rows of the remote store, as seen by the client.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be decoded
//! straight from store rows and change-feed payloads, and written to the
//! local cache as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SYSTEM_NICKNAME;
use crate::types::{MessageId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A named chat room.  Immutable after creation, deleted only by its creator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub created_by: UserId,
    #[serde(default)]
    pub is_private: bool,
    /// Human-facing short numeric code.
    #[serde(default)]
    pub access_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.created_by == user_id
    }
}

// ---------------------------------------------------------------------------
// RoomParticipant
// ---------------------------------------------------------------------------

/// Membership record, one per (room, user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomParticipant {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub nickname: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    /// Synthetic entry generated on the client (membership notices).
    System,
}

impl MessageKind {
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }
}

/// A chat message.
///
/// The nickname is denormalised onto the row so history stays attributable
/// after a profile nickname changes.  `created_at` is assigned by the
/// server; optimistic copies only carry the client-side `sent_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub nickname: String,
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "MessageKind::is_text")]
    pub kind: MessageKind,
}

impl Message {
    /// A locally-authored message awaiting server confirmation.
    pub fn optimistic(
        room_id: RoomId,
        user_id: UserId,
        nickname: impl Into<String>,
        content: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::local(),
            room_id,
            user_id,
            nickname: nickname.into(),
            content: content.into(),
            created_at: None,
            sent_at: Some(sent_at),
            kind: MessageKind::Text,
        }
    }

    /// A client-side notice such as "alice was removed".
    pub fn system(room_id: RoomId, content: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::local(),
            room_id,
            user_id: UserId::system(),
            nickname: SYSTEM_NICKNAME.to_string(),
            content: content.into(),
            created_at: Some(at),
            sent_at: None,
            kind: MessageKind::System,
        }
    }

    /// Ordering key: the server timestamp, falling back to the local send time.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.created_at
            .or(self.sent_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Still waiting for its confirmed copy.
    pub fn is_optimistic(&self) -> bool {
        self.kind.is_text() && self.id.is_local()
    }
}

// ---------------------------------------------------------------------------
// RecentRoom
// ---------------------------------------------------------------------------

/// Per-user index of visited rooms with display preferences.
/// Unique on (user_id, room_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentRoom {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub last_accessed: DateTime<Utc>,
    pub emoji: String,
    pub nickname: String,
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn effective_timestamp_falls_back_to_sent_at() {
        let sent = Utc.timestamp_opt(100, 0).unwrap();
        let mut msg = Message::optimistic(RoomId::new(), UserId::new(), "a", "hi", sent);
        assert_eq!(msg.effective_timestamp(), sent);
        assert!(msg.is_optimistic());

        let created = Utc.timestamp_opt(105, 0).unwrap();
        msg.created_at = Some(created);
        assert_eq!(msg.effective_timestamp(), created);
    }

    #[test]
    fn message_decodes_from_server_row() {
        let room = RoomId::new();
        let user = UserId::new();
        let row = serde_json::json!({
            "id": "7c1e",
            "room_id": room.to_string(),
            "user_id": user.to_string(),
            "nickname": "alice",
            "content": "hello",
            "created_at": "2024-05-01T10:00:00Z",
        });
        let msg: Message = serde_json::from_value(row).unwrap();
        assert_eq!(msg.id.as_str(), "7c1e");
        assert_eq!(msg.kind, MessageKind::Text);
        assert!(msg.sent_at.is_none());
        assert!(!msg.is_optimistic());
    }

    #[test]
    fn system_messages_are_not_optimistic() {
        let msg = Message::system(RoomId::new(), "bob was removed", Utc::now());
        assert!(msg.user_id.is_system());
        assert!(!msg.is_optimistic());
    }
}
