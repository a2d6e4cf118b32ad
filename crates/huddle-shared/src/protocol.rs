use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{Message, RoomParticipant};
use crate::types::{MessageId, RoomId, UserId};

/// A filtered change-feed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Inserts and deletes on `messages` where `room_id = X`.
    Messages(RoomId),
    /// Changes on `room_participants` where `room_id = X`, plus membership
    /// broadcasts for the room.
    Participants(RoomId),
}

impl Topic {
    pub fn room_id(&self) -> RoomId {
        match self {
            Self::Messages(id) | Self::Participants(id) => *id,
        }
    }

    /// Channel name used on the push transport.
    pub fn channel_name(&self) -> String {
        match self {
            Self::Messages(id) => format!("room-messages:{id}"),
            Self::Participants(id) => format!("room-participants:{id}"),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.channel_name())
    }
}

/// Application-level membership broadcast.
///
/// A kick deletes the target's participant row like a voluntary leave does;
/// this notice is what lets subscribers tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipNotice {
    Kicked {
        room_id: RoomId,
        user_id: UserId,
        kicked_by: UserId,
    },
}

impl MembershipNotice {
    pub fn room_id(&self) -> RoomId {
        match self {
            Self::Kicked { room_id, .. } => *room_id,
        }
    }
}

/// Lifecycle of a single feed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// The server confirmed the subscription.
    Subscribed,
    /// The channel was closed by the server or the transport.
    Closed,
    Errored(String),
}

/// One push notification delivered on a [`Topic`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedEvent {
    MessageInserted(Message),
    MessageDeleted { room_id: RoomId, id: MessageId },
    ParticipantUpserted(RoomParticipant),
    ParticipantDeleted { room_id: RoomId, user_id: UserId },
    Membership(MembershipNotice),
    Status(ChannelStatus),
}

impl FeedEvent {
    /// Room the event belongs to, `None` for channel status changes.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::MessageInserted(m) => Some(m.room_id),
            Self::MessageDeleted { room_id, .. } => Some(*room_id),
            Self::ParticipantUpserted(p) => Some(p.room_id),
            Self::ParticipantDeleted { room_id, .. } => Some(*room_id),
            Self::Membership(n) => Some(n.room_id()),
            Self::Status(_) => None,
        }
    }

    /// Topic this event is published on.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::MessageInserted(_) | Self::MessageDeleted { .. } => {
                self.room_id().map(Topic::Messages)
            }
            Self::ParticipantUpserted(_)
            | Self::ParticipantDeleted { .. }
            | Self::Membership(_) => self.room_id().map(Topic::Participants),
            Self::Status(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kicked_notice_travels_on_participants_topic() {
        let room = RoomId::new();
        let event = FeedEvent::Membership(MembershipNotice::Kicked {
            room_id: room,
            user_id: UserId::new(),
            kicked_by: UserId::new(),
        });
        assert_eq!(event.topic(), Some(Topic::Participants(room)));
        assert_eq!(FeedEvent::Status(ChannelStatus::Subscribed).topic(), None);
    }

    #[test]
    fn notice_wire_format_is_tagged() {
        let notice = MembershipNotice::Kicked {
            room_id: RoomId::new(),
            user_id: UserId::new(),
            kicked_by: UserId::new(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "kicked");
        let back: MembershipNotice = serde_json::from_value(json).unwrap();
        assert_eq!(back, notice);
    }
}
