//! Live member list of a room and classification of participant changes.

use std::collections::{HashMap, HashSet};

use huddle_shared::{FeedEvent, MembershipNotice, RoomParticipant, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(RoomParticipant),
    /// Same member, new details (nickname).
    Updated(RoomParticipant),
    Left {
        user_id: UserId,
        nickname: Option<String>,
    },
    Kicked {
        user_id: UserId,
        kicked_by: UserId,
        nickname: Option<String>,
    },
}

impl MembershipChange {
    pub fn user_id(&self) -> UserId {
        match self {
            Self::Joined(p) | Self::Updated(p) => p.user_id,
            Self::Left { user_id, .. } | Self::Kicked { user_id, .. } => *user_id,
        }
    }
}

/// Active members keyed by user.
///
/// A kick is a row delete plus a notice, and the two may arrive in either
/// order.  Users kicked by notice are remembered so their row delete is
/// absorbed instead of surfacing a second, voluntary-looking departure.
/// Nicknames of departed members are kept so a kick notice arriving after
/// the delete can still name them.
#[derive(Debug, Clone, Default)]
pub struct MemberList {
    members: HashMap<UserId, RoomParticipant>,
    kicked: HashSet<UserId>,
    departed: HashMap<UserId, String>,
}

impl MemberList {
    pub fn new(participants: impl IntoIterator<Item = RoomParticipant>) -> Self {
        let members = participants
            .into_iter()
            .filter(|p| p.is_active)
            .map(|p| (p.user_id, p))
            .collect();
        Self {
            members,
            ..Self::default()
        }
    }

    /// Apply one feed event.  Non-membership events and changes that leave
    /// the list as it was yield `None`.
    pub fn apply(&mut self, event: &FeedEvent) -> Option<MembershipChange> {
        match event {
            FeedEvent::ParticipantUpserted(p) if p.is_active => {
                self.kicked.remove(&p.user_id);
                self.departed.remove(&p.user_id);
                match self.members.insert(p.user_id, p.clone()) {
                    None => Some(MembershipChange::Joined(p.clone())),
                    Some(previous) if previous != *p => Some(MembershipChange::Updated(p.clone())),
                    Some(_) => None,
                }
            }
            FeedEvent::ParticipantUpserted(p) => self.depart(p.user_id),
            FeedEvent::ParticipantDeleted { user_id, .. } => {
                if self.kicked.remove(user_id) {
                    return None;
                }
                self.depart(*user_id)
            }
            FeedEvent::Membership(MembershipNotice::Kicked {
                user_id, kicked_by, ..
            }) => {
                let removed = self.members.remove(user_id);
                if removed.is_some() {
                    // Row delete has not been seen yet.
                    self.kicked.insert(*user_id);
                }
                let nickname = match removed {
                    Some(p) => Some(p.nickname),
                    None => self.departed.remove(user_id),
                };
                Some(MembershipChange::Kicked {
                    user_id: *user_id,
                    kicked_by: *kicked_by,
                    nickname,
                })
            }
            _ => None,
        }
    }

    fn depart(&mut self, user_id: UserId) -> Option<MembershipChange> {
        let p = self.members.remove(&user_id)?;
        self.departed.insert(user_id, p.nickname.clone());
        Some(MembershipChange::Left {
            user_id,
            nickname: Some(p.nickname),
        })
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.members.contains_key(user_id)
    }

    pub fn get(&self, user_id: &UserId) -> Option<&RoomParticipant> {
        self.members.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in join order.
    pub fn members(&self) -> Vec<RoomParticipant> {
        let mut list: Vec<RoomParticipant> = self.members.values().cloned().collect();
        list.sort_by_key(|p| (p.joined_at, p.user_id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use huddle_shared::RoomId;

    fn participant(room: RoomId, user: UserId, nick: &str) -> RoomParticipant {
        RoomParticipant {
            room_id: room,
            user_id: user,
            nickname: nick.into(),
            is_active: true,
            joined_at: Utc::now(),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn classifies_join_update_and_leave() {
        let room = RoomId::new();
        let bob = UserId::new();
        let mut list = MemberList::default();

        let joined = participant(room, bob, "bob");
        assert_eq!(
            list.apply(&FeedEvent::ParticipantUpserted(joined.clone())),
            Some(MembershipChange::Joined(joined.clone()))
        );
        assert_eq!(list.apply(&FeedEvent::ParticipantUpserted(joined.clone())), None);

        let mut renamed = joined.clone();
        renamed.nickname = "robert".into();
        assert!(matches!(
            list.apply(&FeedEvent::ParticipantUpserted(renamed.clone())),
            Some(MembershipChange::Updated(_))
        ));

        let mut inactive = renamed;
        inactive.is_active = false;
        assert_eq!(
            list.apply(&FeedEvent::ParticipantUpserted(inactive)),
            Some(MembershipChange::Left {
                user_id: bob,
                nickname: Some("robert".into())
            })
        );
        assert!(list.is_empty());
    }

    #[test]
    fn delete_after_kick_is_absorbed() {
        let room = RoomId::new();
        let (owner, bob) = (UserId::new(), UserId::new());
        let mut list = MemberList::new([participant(room, owner, "o"), participant(room, bob, "bob")]);

        let change = list.apply(&FeedEvent::Membership(MembershipNotice::Kicked {
            room_id: room,
            user_id: bob,
            kicked_by: owner,
        }));
        assert_eq!(
            change,
            Some(MembershipChange::Kicked {
                user_id: bob,
                kicked_by: owner,
                nickname: Some("bob".into())
            })
        );
        assert_eq!(
            list.apply(&FeedEvent::ParticipantDeleted { room_id: room, user_id: bob }),
            None
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn kick_after_delete_still_reports_kick() {
        let room = RoomId::new();
        let (owner, bob) = (UserId::new(), UserId::new());
        let mut list = MemberList::new([participant(room, bob, "bob")]);

        assert!(matches!(
            list.apply(&FeedEvent::ParticipantDeleted { room_id: room, user_id: bob }),
            Some(MembershipChange::Left { .. })
        ));
        assert!(matches!(
            list.apply(&FeedEvent::Membership(MembershipNotice::Kicked {
                room_id: room,
                user_id: bob,
                kicked_by: owner,
            })),
            Some(MembershipChange::Kicked { nickname: Some(n), .. }) if n == "bob"
        ));
        // Removal stays idempotent.
        assert_eq!(
            list.apply(&FeedEvent::ParticipantDeleted { room_id: room, user_id: bob }),
            None
        );
    }
}
