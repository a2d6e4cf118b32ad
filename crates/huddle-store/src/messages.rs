//! Per-room message arrays under `room_messages_<roomId>`.
//!
//! Read-modify-write without transactions: two writers racing on the same
//! room resolve as last-write-wins, which is acceptable for a cache that can
//! always be rebuilt from the remote store.

use std::sync::Arc;

use tracing::debug;

use huddle_shared::constants::ROOM_MESSAGES_PREFIX;
use huddle_shared::{Message, MessageId, RoomId};

use crate::cache::LocalCache;
use crate::clock::Clock;
use crate::kv::KeyValueStore;

#[derive(Clone)]
pub struct MessageCache {
    cache: LocalCache,
    max_per_room: usize,
}

impl MessageCache {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, max_per_room: usize) -> Self {
        Self {
            cache: LocalCache::with_namespace(store, clock, ROOM_MESSAGES_PREFIX),
            max_per_room: max_per_room.max(1),
        }
    }

    /// Cached messages for a room, ascending by effective timestamp.
    pub fn load(&self, room_id: &RoomId) -> Vec<Message> {
        self.cache
            .get::<Vec<Message>>(&room_id.to_string())
            .unwrap_or_default()
    }

    /// Replace the room's cached array, keeping the newest entries.
    /// Optimistic entries are kept until [`Self::confirm_pending`] or
    /// [`Self::remove_message`] settles them.
    pub fn store(&self, room_id: &RoomId, messages: &[Message]) {
        let mut messages = messages.to_vec();
        messages.sort_by_key(|m| m.effective_timestamp());
        if messages.len() > self.max_per_room {
            let excess = messages.len() - self.max_per_room;
            messages.drain(0..excess);
        }
        self.cache.set(&room_id.to_string(), &messages, None);
    }

    /// Insert or overwrite one message by id.
    pub fn append(&self, room_id: &RoomId, message: &Message) {
        let mut messages = self.load(room_id);
        match messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message.clone(),
            None => messages.push(message.clone()),
        }
        self.store(room_id, &messages);
    }

    /// Swap the pending entry `local_id` for its confirmed copy.  Without a
    /// pending entry this is a plain [`Self::append`].
    pub fn confirm_pending(&self, room_id: &RoomId, local_id: &MessageId, confirmed: &Message) {
        let mut messages = self.load(room_id);
        messages.retain(|m| &m.id != local_id && m.id != confirmed.id);
        messages.push(confirmed.clone());
        debug!(room = %room_id, local = %local_id, message = %confirmed.id, "confirmed cached send");
        self.store(room_id, &messages);
    }

    /// Drop a message by id.  Returns `true` if it was cached.
    pub fn remove_message(&self, room_id: &RoomId, id: &MessageId) -> bool {
        let mut messages = self.load(room_id);
        let before = messages.len();
        messages.retain(|m| &m.id != id);
        let removed = messages.len() != before;
        if removed {
            debug!(room = %room_id, message = %id, "purged message from cache");
            self.store(room_id, &messages);
        }
        removed
    }

    pub fn clear_room(&self, room_id: &RoomId) {
        self.cache.remove(&room_id.to_string());
    }

    /// Drop every cached room.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::{MemoryStore, SqliteStore};
    use chrono::{TimeZone, Utc};
    use huddle_shared::UserId;

    fn message(room: RoomId, id: &str, secs: i64) -> Message {
        Message {
            id: MessageId::new(id),
            room_id: room,
            user_id: UserId::new(),
            nickname: "n".into(),
            content: format!("m{id}"),
            created_at: Some(Utc.timestamp_opt(secs, 0).unwrap()),
            sent_at: None,
            kind: Default::default(),
        }
    }

    fn cache(max: usize) -> (MessageCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = MessageCache::new(store.clone(), Arc::new(ManualClock::default()), max);
        (cache, store)
    }

    #[test]
    fn append_upserts_by_id_and_keys_by_room() {
        let (cache, store) = cache(10);
        let room = RoomId::new();
        cache.append(&room, &message(room, "1", 100));
        cache.append(&room, &message(room, "2", 50));

        let mut edited = message(room, "1", 100);
        edited.nickname = "renamed".into();
        cache.append(&room, &edited);

        let loaded = cache.load(&room);
        let ids: Vec<_> = loaded.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);
        assert_eq!(loaded[1].nickname, "renamed");
        assert!(store
            .get(&format!("room_messages_{room}"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn store_keeps_newest_entries() {
        let (cache, _) = cache(2);
        let room = RoomId::new();
        cache.store(
            &room,
            &[message(room, "c", 3), message(room, "a", 1), message(room, "b", 2)],
        );
        let ids: Vec<_> = cache.load(&room).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId::new("b"), MessageId::new("c")]);
    }

    #[test]
    fn pending_send_is_cached_until_confirmed() {
        let (cache, _) = cache(10);
        let room = RoomId::new();
        let pending = Message::optimistic(room, UserId::new(), "me", "hi", Utc::now());
        cache.append(&room, &message(room, "a", 1));
        cache.append(&room, &pending);

        let loaded = cache.load(&room);
        assert_eq!(loaded.len(), 2);
        assert!(loaded[1].is_optimistic());

        let confirmed = message(room, "srv", 2);
        cache.confirm_pending(&room, &pending.id, &confirmed);
        let ids: Vec<_> = cache.load(&room).into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId::new("a"), MessageId::new("srv")]);

        // Confirming again, or with the confirmed copy already cached, stays single.
        cache.confirm_pending(&room, &pending.id, &confirmed);
        assert_eq!(cache.load(&room).len(), 2);
    }

    #[test]
    fn remove_and_clear_room() {
        let (cache, _) = cache(10);
        let room = RoomId::new();
        let other = RoomId::new();
        cache.append(&room, &message(room, "1", 1));
        cache.append(&other, &message(other, "9", 1));

        assert!(cache.remove_message(&room, &MessageId::new("1")));
        assert!(!cache.remove_message(&room, &MessageId::new("1")));

        cache.clear_room(&other);
        assert!(cache.load(&other).is_empty());
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let room = RoomId::new();
        {
            let store = Arc::new(SqliteStore::open_at(&path).unwrap());
            let cache = MessageCache::new(store, Arc::new(ManualClock::default()), 10);
            cache.append(&room, &message(room, "1", 1));
        }
        let store = Arc::new(SqliteStore::open_at(&path).unwrap());
        let cache = MessageCache::new(store, Arc::new(ManualClock::default()), 10);
        assert_eq!(cache.load(&room).len(), 1);
    }

    #[test]
    fn unreadable_store_yields_empty_history() {
        let (cache, store) = cache(10);
        let room = RoomId::new();
        cache.append(&room, &message(room, "1", 1));
        store.set_failing(true);
        assert!(cache.load(&room).is_empty());
        cache.append(&room, &message(room, "2", 2));
    }
}
