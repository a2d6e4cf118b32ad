//! Room and membership records in the remote store.

use std::sync::Arc;

use rand::Rng;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use huddle_remote::{from_row, from_rows, ChangeFeed, Direction, Filter, Query, RowStore, Table};
use huddle_shared::constants::ACCESS_CODE_LEN;
use huddle_shared::{MembershipNotice, Room, RoomId, RoomParticipant, UserId};
use huddle_store::Clock;

use crate::error::{ClientError, Result};
use crate::recent::{object, RecentRoomIndex};

/// Attempts at a fresh access code before giving up on a collision.
const ACCESS_CODE_ATTEMPTS: usize = 3;

/// Random numeric room code, `ACCESS_CODE_LEN` digits, no leading zero.
pub fn generate_access_code() -> String {
    let mut rng = rand::thread_rng();
    let low = 10u32.pow(ACCESS_CODE_LEN as u32 - 1);
    rng.gen_range(low..low * 10).to_string()
}

/// Result of [`RoomDirectory::join_room`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant: RoomParticipant,
    /// The user already had a row for this room.
    pub already_joined: bool,
}

#[derive(Clone)]
pub struct RoomDirectory {
    store: Arc<dyn RowStore>,
    feed: Arc<dyn ChangeFeed>,
    recent: RecentRoomIndex,
    clock: Arc<dyn Clock>,
}

impl RoomDirectory {
    pub fn new(
        store: Arc<dyn RowStore>,
        feed: Arc<dyn ChangeFeed>,
        recent: RecentRoomIndex,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            feed,
            recent,
            clock,
        }
    }

    /// Create a room owned by `owner`.  A code is generated when none is
    /// given.  The owner's recent-room entry is best effort.
    #[instrument(skip_all, fields(owner = %owner.short()))]
    pub async fn create_room(
        &self,
        name: &str,
        owner: UserId,
        owner_nickname: &str,
        is_private: bool,
        access_code: Option<String>,
    ) -> Result<Room> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ClientError::InvalidInput("room name is empty".into()));
        }
        let generated = access_code.is_none();
        let mut code = access_code.unwrap_or_else(generate_access_code);

        let mut attempt = 1;
        let row = loop {
            let row = object(json!({
                "name": name,
                "created_by": owner,
                "is_private": is_private,
                "access_code": code,
            }));
            match self.store.insert(Table::Rooms, row).await {
                Ok(row) => break row,
                Err(e) if e.is_unique_violation() && generated && attempt < ACCESS_CODE_ATTEMPTS => {
                    debug!(attempt, "access code collision, regenerating");
                    code = generate_access_code();
                    attempt += 1;
                }
                Err(e) => {
                    warn!(error = %e, "room creation failed");
                    return Err(e.into());
                }
            }
        };
        let room: Room = from_row(row)?;
        info!(room = %room.id, "room created");

        if let Err(e) = self.recent.touch(owner, room.id, owner_nickname, None).await {
            warn!(room = %room.id, error = %e, "recent room update failed after create");
        }
        Ok(room)
    }

    /// Look a room up by id, falling back to its access code when the input
    /// is not an id.  `Ok(None)` when nothing matches.
    pub async fn get_room_by_id(&self, id_or_code: &str) -> Result<Option<Room>> {
        let key = id_or_code.trim();
        let by_id = Query::new(Table::Rooms).filter(Filter::eq("id", key)).limit(1);
        let rows = match self.store.select(&by_id).await {
            Ok(rows) => rows,
            Err(e) if e.is_malformed_identifier() => {
                debug!(key, "not a room id, trying access code");
                let by_code = Query::new(Table::Rooms)
                    .filter(Filter::eq("access_code", key))
                    .limit(1);
                self.store.select(&by_code).await?
            }
            Err(e) => {
                warn!(key, error = %e, "room lookup failed");
                return Err(e.into());
            }
        };

        let room = from_rows::<Room>(rows)?.into_iter().next();
        if room.is_none() {
            debug!(key, "room not found");
        }
        Ok(room)
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Option<Room>> {
        self.get_room_by_id(&room_id.to_string()).await
    }

    async fn require_room(&self, room_id: RoomId) -> Result<Room> {
        self.get_room(room_id)
            .await?
            .ok_or(ClientError::NotFound("room"))
    }

    pub async fn get_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
    ) -> Result<Option<RoomParticipant>> {
        let query = Query::new(Table::RoomParticipants)
            .filter(Filter::eq("room_id", room_id))
            .filter(Filter::eq("user_id", user_id))
            .limit(1);
        let rows = self.store.select(&query).await?;
        Ok(from_rows::<RoomParticipant>(rows)?.into_iter().next())
    }

    /// Join, or rejoin, a room.  Calling it again for the same user
    /// reactivates the existing row instead of adding one.
    #[instrument(skip_all, fields(room = %room_id, user = %user_id.short()))]
    pub async fn join_room(
        &self,
        room_id: RoomId,
        user_id: UserId,
        nickname: &str,
    ) -> Result<JoinOutcome> {
        self.require_room(room_id).await?;

        let outcome = match self.get_participant(room_id, user_id).await? {
            Some(_) => JoinOutcome {
                participant: self.reactivate(room_id, user_id, nickname).await?,
                already_joined: true,
            },
            None => {
                let row = object(json!({
                    "room_id": room_id,
                    "user_id": user_id,
                    "nickname": nickname,
                    "is_active": true,
                }));
                match self.store.insert(Table::RoomParticipants, row).await {
                    Ok(row) => JoinOutcome {
                        participant: from_row(row)?,
                        already_joined: false,
                    },
                    Err(e) if e.is_unique_violation() => {
                        debug!("concurrent join, reusing existing row");
                        JoinOutcome {
                            participant: self.reactivate(room_id, user_id, nickname).await?,
                            already_joined: true,
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if let Err(e) = self.recent.touch(user_id, room_id, nickname, None).await {
            warn!(error = %e, "recent room update failed after join");
        }
        info!(already_joined = outcome.already_joined, "joined room");
        Ok(outcome)
    }

    async fn reactivate(
        &self,
        room_id: RoomId,
        user_id: UserId,
        nickname: &str,
    ) -> Result<RoomParticipant> {
        let mut patch = object(json!({
            "is_active": true,
            "last_seen_at": self.clock.now(),
        }));
        if !nickname.trim().is_empty() {
            patch.insert("nickname".into(), json!(nickname));
        }
        self.update_participant(room_id, user_id, patch)
            .await?
            .ok_or(ClientError::NotFound("participant"))
    }

    async fn update_participant(
        &self,
        room_id: RoomId,
        user_id: UserId,
        patch: huddle_remote::Row,
    ) -> Result<Option<RoomParticipant>> {
        let filters = [Filter::eq("room_id", room_id), Filter::eq("user_id", user_id)];
        let rows = self
            .store
            .update(Table::RoomParticipants, &filters, patch)
            .await?;
        Ok(from_rows::<RoomParticipant>(rows)?.into_iter().next())
    }

    /// Leave a room: the participant row goes, then the recent-room entry.
    /// Only the first step can fail the call.  `Ok(false)` when the user
    /// held no membership row.
    #[instrument(skip_all, fields(room = %room_id, user = %user_id.short()))]
    pub async fn leave_room(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let filters = [Filter::eq("room_id", room_id), Filter::eq("user_id", user_id)];
        let removed = self
            .store
            .delete(Table::RoomParticipants, &filters)
            .await?;
        if let Err(e) = self.recent.remove(user_id, room_id).await {
            warn!(error = %e, "recent room removal failed after leave");
        }
        info!(removed = removed.len(), "left room");
        Ok(!removed.is_empty())
    }

    /// Delete a room.  Only its creator may; dependent rows go with it.
    #[instrument(skip_all, fields(room = %room_id, user = %user_id.short()))]
    pub async fn delete_room(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let room = self.require_room(room_id).await?;
        if !room.is_owned_by(&user_id) {
            warn!("delete refused, not the owner");
            return Err(ClientError::Unauthorized("delete this room"));
        }
        let deleted = self
            .store
            .delete(Table::Rooms, &[Filter::eq("id", room_id)])
            .await?;
        info!("room deleted");
        Ok(!deleted.is_empty())
    }

    /// Remove another member and tell the room they were kicked, as opposed
    /// to leaving on their own.
    #[instrument(skip_all, fields(room = %room_id, actor = %actor.short(), target = %target.short()))]
    pub async fn kick_member(&self, room_id: RoomId, actor: UserId, target: UserId) -> Result<()> {
        let room = self.require_room(room_id).await?;
        if !room.is_owned_by(&actor) {
            warn!("kick refused, not the owner");
            return Err(ClientError::Unauthorized("kick members"));
        }
        if actor == target {
            return Err(ClientError::InvalidInput("cannot kick yourself".into()));
        }

        let filters = [Filter::eq("room_id", room_id), Filter::eq("user_id", target)];
        let removed = self
            .store
            .delete(Table::RoomParticipants, &filters)
            .await?;
        if removed.is_empty() {
            return Err(ClientError::NotFound("participant"));
        }
        if let Err(e) = self.recent.remove(target, room_id).await {
            warn!(error = %e, "recent room removal failed after kick");
        }

        self.feed
            .broadcast(MembershipNotice::Kicked {
                room_id,
                user_id: target,
                kicked_by: actor,
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "kick notice not delivered");
                ClientError::from(e)
            })?;
        info!("member kicked");
        Ok(())
    }

    /// Active members, in join order.
    pub async fn list_participants(&self, room_id: RoomId) -> Result<Vec<RoomParticipant>> {
        let query = Query::new(Table::RoomParticipants)
            .filter(Filter::eq("room_id", room_id))
            .filter(Filter::eq("is_active", true))
            .order_by("joined_at", Direction::Asc);
        Ok(from_rows(self.store.select(&query).await?)?)
    }

    pub async fn update_nickname(
        &self,
        room_id: RoomId,
        user_id: UserId,
        nickname: &str,
    ) -> Result<Option<RoomParticipant>> {
        let nickname = nickname.trim();
        if nickname.is_empty() {
            return Err(ClientError::InvalidInput("nickname is empty".into()));
        }
        self.update_participant(room_id, user_id, object(json!({ "nickname": nickname })))
            .await
    }

    /// Mark a member inactive without removing their row.
    pub async fn set_inactive(&self, room_id: RoomId, user_id: UserId) -> Result<bool> {
        let patch = object(json!({
            "is_active": false,
            "last_seen_at": self.clock.now(),
        }));
        Ok(self
            .update_participant(room_id, user_id, patch)
            .await?
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_remote::MemoryBackend;
    use huddle_store::SystemClock;

    fn directory() -> (RoomDirectory, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let recent = RecentRoomIndex::new(backend.clone(), clock.clone());
        let directory = RoomDirectory::new(backend.clone(), backend.clone(), recent, clock);
        (directory, backend)
    }

    #[test]
    fn access_codes_are_six_digits() {
        for _ in 0..100 {
            let code = generate_access_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn create_assigns_code_and_indexes_owner() {
        let (directory, backend) = directory();
        let owner = UserId::new();
        let room = directory
            .create_room(" Lobby ", owner, "alice", false, None)
            .await
            .unwrap();
        assert_eq!(room.name, "Lobby");
        assert_eq!(room.access_code.as_deref().map(str::len), Some(6));
        assert_eq!(backend.rows(Table::RecentRooms).await.len(), 1);

        assert!(matches!(
            directory.create_room("  ", owner, "alice", false, None).await,
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn lookup_falls_back_to_access_code() {
        let (directory, _) = directory();
        let room = directory
            .create_room("r", UserId::new(), "a", false, Some("482913".into()))
            .await
            .unwrap();

        let by_id = directory.get_room_by_id(&room.id.to_string()).await.unwrap();
        assert_eq!(by_id.as_ref().map(|r| r.id), Some(room.id));

        let by_code = directory.get_room_by_id("482913").await.unwrap();
        assert_eq!(by_code.map(|r| r.id), Some(room.id));

        assert_eq!(directory.get_room_by_id("000000").await.unwrap(), None);
        assert_eq!(directory.get_room(RoomId::new()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn join_twice_is_idempotent() {
        let (directory, backend) = directory();
        let owner = UserId::new();
        let room = directory.create_room("r", owner, "o", false, None).await.unwrap();
        let alice = UserId::new();

        let first = directory.join_room(room.id, alice, "Alice").await.unwrap();
        let second = directory.join_room(room.id, alice, "Alice").await.unwrap();

        assert!(!first.already_joined);
        assert!(second.already_joined);
        assert_eq!(backend.rows(Table::RoomParticipants).await.len(), 1);
        assert!(second.participant.last_seen_at >= first.participant.last_seen_at);
    }

    #[tokio::test]
    async fn rejoin_reactivates_inactive_member() {
        let (directory, _) = directory();
        let room = directory
            .create_room("r", UserId::new(), "o", false, None)
            .await
            .unwrap();
        let bob = UserId::new();
        directory.join_room(room.id, bob, "bob").await.unwrap();
        assert!(directory.set_inactive(room.id, bob).await.unwrap());
        assert!(directory.list_participants(room.id).await.unwrap().is_empty());

        let outcome = directory.join_room(room.id, bob, "bobby").await.unwrap();
        assert!(outcome.already_joined);
        assert!(outcome.participant.is_active);
        assert_eq!(outcome.participant.nickname, "bobby");
    }

    #[tokio::test]
    async fn join_missing_room_is_not_found() {
        let (directory, _) = directory();
        let err = directory
            .join_room(RoomId::new(), UserId::new(), "x")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn leave_removes_participant_and_index_entry() {
        let (directory, backend) = directory();
        let room = directory
            .create_room("r", UserId::new(), "o", false, None)
            .await
            .unwrap();
        let bob = UserId::new();
        directory.join_room(room.id, bob, "bob").await.unwrap();

        assert!(directory.leave_room(room.id, bob).await.unwrap());
        assert!(backend.rows(Table::RoomParticipants).await.is_empty());
        // Owner's entry remains, bob's is gone.
        assert_eq!(backend.rows(Table::RecentRooms).await.len(), 1);
    }

    #[tokio::test]
    async fn leave_without_membership_reports_nothing_removed() {
        let (directory, backend) = directory();
        let owner = UserId::new();
        let room = directory.create_room("r", owner, "o", false, None).await.unwrap();

        assert!(!directory.leave_room(room.id, UserId::new()).await.unwrap());
        assert_eq!(backend.rows(Table::RecentRooms).await.len(), 1);

        let bob = UserId::new();
        directory.join_room(room.id, bob, "bob").await.unwrap();
        assert!(directory.leave_room(room.id, bob).await.unwrap());
        assert!(!directory.leave_room(room.id, bob).await.unwrap());
    }

    #[tokio::test]
    async fn only_owner_deletes_and_delete_cascades() {
        let (directory, backend) = directory();
        let owner = UserId::new();
        let room = directory.create_room("r", owner, "o", false, None).await.unwrap();
        let bob = UserId::new();
        directory.join_room(room.id, bob, "bob").await.unwrap();

        assert!(matches!(
            directory.delete_room(room.id, bob).await,
            Err(ClientError::Unauthorized(_))
        ));
        assert!(directory.delete_room(room.id, owner).await.unwrap());
        assert!(backend.rows(Table::RoomParticipants).await.is_empty());
        assert!(matches!(
            directory.delete_room(room.id, owner).await,
            Err(ClientError::NotFound("room"))
        ));
    }

    #[tokio::test]
    async fn kick_requires_owner_and_broadcasts() {
        let (directory, backend) = directory();
        let owner = UserId::new();
        let room = directory.create_room("r", owner, "o", false, None).await.unwrap();
        let bob = UserId::new();
        directory.join_room(room.id, bob, "bob").await.unwrap();

        assert!(matches!(
            directory.kick_member(room.id, bob, owner).await,
            Err(ClientError::Unauthorized(_))
        ));
        assert!(matches!(
            directory.kick_member(room.id, owner, owner).await,
            Err(ClientError::InvalidInput(_))
        ));

        let (mut events, _handle) = backend
            .subscribe(huddle_shared::Topic::Participants(room.id))
            .await
            .unwrap()
            .into_parts();
        events.recv().await;

        directory.kick_member(room.id, owner, bob).await.unwrap();
        assert!(directory.get_participant(room.id, bob).await.unwrap().is_none());

        assert!(matches!(
            events.recv().await,
            Some(huddle_shared::FeedEvent::ParticipantDeleted { .. })
        ));
        assert_eq!(
            events.recv().await,
            Some(huddle_shared::FeedEvent::Membership(MembershipNotice::Kicked {
                room_id: room.id,
                user_id: bob,
                kicked_by: owner,
            }))
        );
    }

    #[tokio::test]
    async fn nickname_updates_are_validated() {
        let (directory, _) = directory();
        let room = directory
            .create_room("r", UserId::new(), "o", false, None)
            .await
            .unwrap();
        let bob = UserId::new();
        directory.join_room(room.id, bob, "bob").await.unwrap();

        let updated = directory.update_nickname(room.id, bob, "rob").await.unwrap();
        assert_eq!(updated.map(|p| p.nickname), Some("rob".into()));
        assert!(directory.update_nickname(room.id, bob, " ").await.is_err());
    }
}
