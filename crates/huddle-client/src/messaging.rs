//! Sending, fetching and deleting room messages.
//!
//! The remote store is authoritative for which messages exist.  The local
//! cache fills in while offline and keeps attached metadata until the
//! remote copy is newer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use huddle_remote::{from_row, from_rows, Direction, Filter, Query, RowStore, Table};
use huddle_shared::{Message, MessageId, RoomId, UserId};
use huddle_store::MessageCache;

use crate::error::{ClientError, Result};
use crate::pagination::Paginator;
use crate::recent::{object, RecentRoomIndex};
use crate::reconcile::{merge_and_dedup, DedupPolicy};

/// Trimmed message body, or `InvalidInput` when nothing is left.
pub(crate) fn validate_content(content: &str) -> Result<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ClientError::InvalidInput("message is empty".into()));
    }
    Ok(content)
}

#[derive(Clone)]
pub struct MessagingService {
    store: Arc<dyn RowStore>,
    cache: MessageCache,
    recent: RecentRoomIndex,
    policy: DedupPolicy,
}

impl MessagingService {
    pub fn new(
        store: Arc<dyn RowStore>,
        cache: MessageCache,
        recent: RecentRoomIndex,
        policy: DedupPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            recent,
            policy,
        }
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    /// Write a message to the remote store and, once it is accepted, to the
    /// local cache.  A failed write is returned, never cached.
    #[instrument(skip_all, fields(room = %room_id, user = %user_id.short()))]
    pub async fn send_message(
        &self,
        room_id: RoomId,
        user_id: UserId,
        nickname: &str,
        content: &str,
    ) -> Result<Message> {
        let content = validate_content(content)?;
        let row = object(json!({
            "room_id": room_id,
            "user_id": user_id,
            "nickname": nickname,
            "content": content,
        }));
        let row = self.store.insert(Table::Messages, row).await.map_err(|e| {
            warn!(error = %e, "message send failed");
            ClientError::from(e)
        })?;
        let message: Message = from_row(row)?;
        debug!(message = %message.id, "message stored");

        self.cache.append(&room_id, &message);
        if let Err(e) = self.recent.touch(user_id, room_id, nickname, None).await {
            warn!(error = %e, "recent room update failed after send");
        }
        Ok(message)
    }

    /// The room's newest `limit` messages before `before`, ascending.
    ///
    /// Remote rows and cached rows are merged; the merged set is written back
    /// to the cache.  When the remote store is unreachable the cached view is
    /// returned on its own.
    #[instrument(skip_all, fields(room = %room_id, limit = limit))]
    pub async fn get_room_messages(
        &self,
        room_id: RoomId,
        limit: usize,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let mut query = Query::new(Table::Messages)
            .filter(Filter::eq("room_id", room_id))
            .order_by("created_at", Direction::Desc)
            .limit(limit);
        if let Some(before) = before {
            query = query.filter(Filter::lt("created_at", before));
        }

        let cached = self.cache.load(&room_id);
        let remote = match self.store.select(&query).await {
            Ok(rows) => from_rows::<Message>(rows)?,
            Err(e) if e.is_transport() => {
                warn!(error = %e, cached = cached.len(), "remote fetch failed, serving cache");
                return Ok(window(cached, limit, before));
            }
            Err(e) => return Err(e.into()),
        };

        let merged = merge_and_dedup(&cached, &remote, &self.policy);
        self.cache.store(&room_id, &merged);
        debug!(remote = remote.len(), cached = cached.len(), "merged history");
        Ok(window(merged, limit, before))
    }

    /// Newest-first pages of a room's history.
    pub fn history(&self, room_id: RoomId, page_size: usize) -> Paginator<Message> {
        let query = Query::new(Table::Messages)
            .filter(Filter::eq("room_id", room_id))
            .order_by("created_at", Direction::Desc);
        Paginator::new(Arc::clone(&self.store), query, page_size)
    }

    /// Delete a message.  Only its author may; the cache copy goes too.
    #[instrument(skip_all, fields(message = %id, user = %user_id.short()))]
    pub async fn delete_message(&self, id: &MessageId, user_id: UserId) -> Result<bool> {
        let lookup = Query::new(Table::Messages)
            .filter(Filter::eq("id", id.as_str()))
            .limit(1);
        let message = from_rows::<Message>(self.store.select(&lookup).await?)?
            .into_iter()
            .next()
            .ok_or(ClientError::NotFound("message"))?;
        if message.user_id != user_id {
            warn!("delete refused, not the author");
            return Err(ClientError::Unauthorized("delete this message"));
        }

        let filters = [
            Filter::eq("id", id.as_str()),
            Filter::eq("user_id", user_id),
        ];
        let deleted = self.store.delete(Table::Messages, &filters).await?;
        self.cache.remove_message(&message.room_id, id);
        info!(deleted = deleted.len(), "message deleted");
        Ok(!deleted.is_empty())
    }
}

/// Entries strictly before `before`, newest `limit` of them, ascending.
fn window(mut messages: Vec<Message>, limit: usize, before: Option<DateTime<Utc>>) -> Vec<Message> {
    if let Some(before) = before {
        messages.retain(|m| m.effective_timestamp() < before);
    }
    if messages.len() > limit {
        messages.drain(0..messages.len() - limit);
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use huddle_remote::{MemoryBackend, Row};
    use huddle_shared::MessageKind;
    use huddle_store::{Clock, KeyValueStore, ManualClock, MemoryStore};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        kv: Arc<MemoryStore>,
        messaging: MessagingService,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let kv = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let cache = MessageCache::new(kv.clone() as Arc<dyn KeyValueStore>, clock.clone(), 500);
        let recent = RecentRoomIndex::new(backend.clone(), clock);
        let policy = DedupPolicy::new(std::time::Duration::from_secs(10));
        let messaging = MessagingService::new(backend.clone(), cache, recent, policy);
        Fixture {
            backend,
            kv,
            messaging,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn message(room: RoomId, id: &str, content: &str, secs: i64, nickname: &str) -> Message {
        Message {
            id: MessageId::new(id),
            room_id: room,
            user_id: UserId::default(),
            nickname: nickname.into(),
            content: content.into(),
            created_at: Some(at(secs)),
            sent_at: None,
            kind: MessageKind::Text,
        }
    }

    async fn insert_remote(backend: &MemoryBackend, msg: &Message) {
        let row: Row = huddle_remote::to_row(msg).unwrap();
        backend.insert(Table::Messages, row).await.unwrap();
    }

    #[tokio::test]
    async fn merge_orders_by_time_and_takes_newest_fields() {
        let fx = fixture();
        let room = RoomId::new();
        fx.messaging.cache().store(
            &room,
            &[
                message(room, "1", "one", 100, "a"),
                message(room, "3", "three", 300, "old"),
            ],
        );
        insert_remote(&fx.backend, &message(room, "2", "two", 200, "a")).await;
        insert_remote(&fx.backend, &message(room, "3", "three", 305, "new")).await;

        let merged = fx.messaging.get_room_messages(room, 50, None).await.unwrap();
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(merged[2].nickname, "new");

        // The merged view is durable.
        assert_eq!(fx.messaging.cache().load(&room).len(), 3);
    }

    #[tokio::test]
    async fn cached_pending_send_merges_with_its_stored_copy() {
        let fx = fixture();
        let room = RoomId::new();
        let pending = Message::optimistic(room, UserId::default(), "a", "hi", at(400));
        fx.messaging.cache().append(&room, &pending);

        fx.backend.set_online(false);
        let offline = fx.messaging.get_room_messages(room, 20, None).await.unwrap();
        assert_eq!(offline.len(), 1);
        assert!(offline[0].is_optimistic());

        fx.backend.set_online(true);
        insert_remote(&fx.backend, &message(room, "srv", "hi", 402, "a")).await;
        let merged = fx.messaging.get_room_messages(room, 20, None).await.unwrap();
        let ids: Vec<&str> = merged.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["srv"]);
        let cached = fx.messaging.cache().load(&room);
        assert_eq!(cached.len(), 1);
        assert!(!cached[0].is_optimistic());
    }

    #[tokio::test]
    async fn offline_fetch_serves_cache() {
        let fx = fixture();
        let room = RoomId::new();
        fx.messaging
            .cache()
            .store(&room, &[message(room, "1", "one", 100, "a")]);
        fx.backend.set_online(false);

        let view = fx.messaging.get_room_messages(room, 20, None).await.unwrap();
        assert_eq!(view.len(), 1);
    }

    #[tokio::test]
    async fn limit_and_cursor_window_the_view() {
        let fx = fixture();
        let room = RoomId::new();
        for n in 1..=5 {
            insert_remote(&fx.backend, &message(room, &n.to_string(), &format!("m{n}"), n * 100, "a"))
                .await;
        }
        let view = fx
            .messaging
            .get_room_messages(room, 2, Some(at(450)))
            .await
            .unwrap();
        let ids: Vec<&str> = view.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4"]);
    }

    #[tokio::test]
    async fn send_writes_remote_then_cache() {
        let fx = fixture();
        let room = RoomId::new();
        let user = UserId::new();

        let sent = fx
            .messaging
            .send_message(room, user, "alice", "  hello ")
            .await
            .unwrap();
        assert_eq!(sent.content, "hello");
        assert_eq!(sent.nickname, "alice");
        assert!(!sent.id.is_local());
        assert_eq!(fx.messaging.cache().load(&room), vec![sent]);
        assert_eq!(fx.backend.rows(Table::RecentRooms).await.len(), 1);
    }

    #[tokio::test]
    async fn failed_send_is_reported_and_not_cached() {
        let fx = fixture();
        let room = RoomId::new();
        fx.backend.set_online(false);

        let err = fx
            .messaging
            .send_message(room, UserId::new(), "a", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(_)));
        assert!(fx.messaging.cache().load(&room).is_empty());

        assert!(matches!(
            fx.messaging.send_message(room, UserId::new(), "a", "   ").await,
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn cache_failures_do_not_fail_sends() {
        let fx = fixture();
        fx.kv.set_failing(true);
        let sent = fx
            .messaging
            .send_message(RoomId::new(), UserId::new(), "a", "hi")
            .await;
        assert!(sent.is_ok());
    }

    #[tokio::test]
    async fn delete_is_author_only_and_purges_cache() {
        let fx = fixture();
        let room = RoomId::new();
        let author = UserId::new();
        let sent = fx
            .messaging
            .send_message(room, author, "a", "oops")
            .await
            .unwrap();

        assert!(matches!(
            fx.messaging.delete_message(&sent.id, UserId::new()).await,
            Err(ClientError::Unauthorized(_))
        ));
        assert_eq!(fx.backend.rows(Table::Messages).await.len(), 1);

        assert!(fx.messaging.delete_message(&sent.id, author).await.unwrap());
        assert!(fx.backend.rows(Table::Messages).await.is_empty());
        assert!(fx.messaging.cache().load(&room).is_empty());

        assert!(matches!(
            fx.messaging.delete_message(&sent.id, author).await,
            Err(ClientError::NotFound("message"))
        ));
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let fx = fixture();
        let room = RoomId::new();
        for n in 1..=3 {
            insert_remote(&fx.backend, &message(room, &n.to_string(), &format!("m{n}"), n * 100, "a"))
                .await;
        }
        let mut pages = fx.messaging.history(room, 2);
        let first = pages.fetch_next_page().await.unwrap();
        let ids: Vec<&str> = first.rows.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);
        assert!(first.has_more);
        assert!(!pages.fetch_next_page().await.unwrap().has_more);
    }
}
