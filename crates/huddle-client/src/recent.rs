//! Per-user index of visited rooms, unique on `(user_id, room_id)`.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use huddle_remote::{from_row, from_rows, Direction, Filter, Query, Row, RowStore, Table};
use huddle_shared::constants::DEFAULT_ROOM_EMOJI;
use huddle_shared::{RecentRoom, RoomId, UserId};
use huddle_store::Clock;

use crate::error::Result;

const CONFLICT_TARGET: &[&str] = &["user_id", "room_id"];

#[derive(Clone)]
pub struct RecentRoomIndex {
    store: Arc<dyn RowStore>,
    clock: Arc<dyn Clock>,
}

impl RecentRoomIndex {
    pub fn new(store: Arc<dyn RowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn key(user_id: UserId, room_id: RoomId) -> [Filter; 2] {
        [Filter::eq("user_id", user_id), Filter::eq("room_id", room_id)]
    }

    pub async fn get(&self, user_id: UserId, room_id: RoomId) -> Result<Option<RecentRoom>> {
        let query = Self::key(user_id, room_id)
            .into_iter()
            .fold(Query::new(Table::RecentRooms), Query::filter)
            .limit(1);
        let rows = self.store.select(&query).await?;
        Ok(from_rows::<RecentRoom>(rows)?.into_iter().next())
    }

    /// Record a visit.  `emoji` replaces the stored one when given; a new
    /// entry without one gets the default.
    pub async fn touch(
        &self,
        user_id: UserId,
        room_id: RoomId,
        nickname: &str,
        emoji: Option<&str>,
    ) -> Result<RecentRoom> {
        let emoji = match emoji {
            Some(e) => e.to_string(),
            None => match self.get(user_id, room_id).await? {
                Some(existing) => existing.emoji,
                None => DEFAULT_ROOM_EMOJI.to_string(),
            },
        };
        let row = object(json!({
            "user_id": user_id,
            "room_id": room_id,
            "nickname": nickname,
            "emoji": emoji,
            "last_accessed": self.clock.now(),
        }));
        let stored = self
            .store
            .upsert(Table::RecentRooms, row, CONFLICT_TARGET)
            .await?;
        debug!(user = %user_id.short(), room = %room_id, "recent room touched");
        Ok(from_row(stored)?)
    }

    /// Pinned entries first, then most recently accessed.
    pub async fn list(&self, user_id: UserId) -> Result<Vec<RecentRoom>> {
        let query = Query::new(Table::RecentRooms)
            .filter(Filter::eq("user_id", user_id))
            .order_by("is_pinned", Direction::Desc)
            .order_by("last_accessed", Direction::Desc);
        Ok(from_rows(self.store.select(&query).await?)?)
    }

    pub async fn set_pinned(&self, user_id: UserId, room_id: RoomId, pinned: bool) -> Result<bool> {
        self.patch(user_id, room_id, json!({ "is_pinned": pinned }))
            .await
    }

    /// `None` clears the custom name.
    pub async fn set_custom_name(
        &self,
        user_id: UserId,
        room_id: RoomId,
        name: Option<&str>,
    ) -> Result<bool> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        self.patch(user_id, room_id, json!({ "custom_name": name }))
            .await
    }

    pub async fn remove(&self, user_id: UserId, room_id: RoomId) -> Result<bool> {
        let removed = self
            .store
            .delete(Table::RecentRooms, &Self::key(user_id, room_id))
            .await?;
        Ok(!removed.is_empty())
    }

    async fn patch(&self, user_id: UserId, room_id: RoomId, patch: Value) -> Result<bool> {
        let updated = self
            .store
            .update(Table::RecentRooms, &Self::key(user_id, room_id), object(patch))
            .await?;
        Ok(!updated.is_empty())
    }
}

pub(crate) fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}
