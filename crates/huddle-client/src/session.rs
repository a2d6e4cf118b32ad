//! Composition root: wires the stores, feed and services together and opens
//! room sessions.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use huddle_remote::{ChangeFeed, RealtimeFeed, RestStore, RowStore};
use huddle_shared::{Message, MessageId, Room, RoomId, RoomParticipant, UserId};
use huddle_store::{
    Clock, Database, KeyValueStore, LocalCache, MemoryStore, MessageCache, SqliteStore,
    SystemClock,
};

use crate::config::ClientConfig;
use crate::directory::RoomDirectory;
use crate::error::{ClientError, Result};
use crate::events::RoomEvent;
use crate::messaging::{validate_content, MessagingService};
use crate::pagination::Paginator;
use crate::recent::RecentRoomIndex;
use crate::subscription::{
    RoomSubscription, SubscriptionContext, SubscriptionOptions, SubscriptionState,
};

/// The signed-in user as supplied by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub nickname: String,
}

impl Identity {
    pub fn new(user_id: UserId, nickname: impl Into<String>) -> Self {
        Self {
            user_id,
            nickname: nickname.into(),
        }
    }
}

pub struct ChatClient {
    config: ClientConfig,
    feed: Arc<dyn ChangeFeed>,
    clock: Arc<dyn Clock>,
    cache: LocalCache,
    recent: RecentRoomIndex,
    directory: RoomDirectory,
    messaging: MessagingService,
}

impl ChatClient {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn RowStore>,
        feed: Arc<dyn ChangeFeed>,
        kv: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let recent = RecentRoomIndex::new(Arc::clone(&store), Arc::clone(&clock));
        let directory = RoomDirectory::new(
            Arc::clone(&store),
            Arc::clone(&feed),
            recent.clone(),
            Arc::clone(&clock),
        );
        let message_cache = MessageCache::new(
            Arc::clone(&kv),
            Arc::clone(&clock),
            config.cached_messages_per_room,
        );
        let messaging = MessagingService::new(
            store,
            message_cache,
            recent.clone(),
            config.dedup_policy(),
        );
        let cache = LocalCache::new(kv, Arc::clone(&clock));

        Self {
            config,
            feed,
            clock,
            cache,
            recent,
            directory,
            messaging,
        }
    }

    /// Client against the configured hosted backend, caching to SQLite.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let store = RestStore::new(&config.rest_url, &config.api_key)?;
        let feed = RealtimeFeed::new(&config.realtime_url, &config.api_key);
        let kv = open_cache_store(config.cache_path.clone());
        info!(rest = %config.rest_url, realtime = %config.realtime_url, "chat client configured");
        Ok(Self::new(
            config,
            Arc::new(store),
            Arc::new(feed),
            kv,
            Arc::new(SystemClock),
        ))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    pub fn messaging(&self) -> &MessagingService {
        &self.messaging
    }

    pub fn recent_rooms(&self) -> &RecentRoomIndex {
        &self.recent
    }

    /// General-purpose expiring cache in the app namespace.
    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// Open a room screen: seed the timeline from merged history and the
    /// member list from the store, then mount the live subscription.
    #[instrument(skip_all, fields(room = %room_id, user = %identity.user_id.short()))]
    pub async fn open_room(
        &self,
        room_id: RoomId,
        identity: Identity,
    ) -> Result<(RoomSession, mpsc::UnboundedReceiver<RoomEvent>)> {
        let room = self
            .directory
            .get_room(room_id)
            .await?
            .ok_or(ClientError::NotFound("room"))?;
        let messages = self
            .messaging
            .get_room_messages(room_id, self.config.page_size, None)
            .await?;
        let members = self.directory.list_participants(room_id).await?;
        debug!(messages = messages.len(), members = members.len(), "room seeded");

        let ctx = SubscriptionContext {
            room_id,
            user_id: identity.user_id,
            feed: Arc::clone(&self.feed),
            cache: self.messaging.cache().clone(),
            clock: Arc::clone(&self.clock),
            options: SubscriptionOptions::from_config(&self.config),
        };
        let (subscription, events) = RoomSubscription::mount(ctx, &messages, members).await;

        let session = RoomSession {
            room,
            identity,
            page_size: self.config.page_size,
            clock: Arc::clone(&self.clock),
            directory: self.directory.clone(),
            messaging: self.messaging.clone(),
            subscription,
        };
        Ok((session, events))
    }
}

/// SQLite at `path` (or the platform default), in memory when neither opens.
fn open_cache_store(path: Option<PathBuf>) -> Arc<dyn KeyValueStore> {
    let opened = path
        .map(Ok)
        .unwrap_or_else(Database::default_path)
        .and_then(|path| {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            debug!(path = %path.display(), "opening message cache");
            SqliteStore::open_at(&path)
        });
    match opened {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "cache database unavailable, caching in memory");
            Arc::new(MemoryStore::new())
        }
    }
}

/// One open room screen.  Dropping it unmounts the subscription.
pub struct RoomSession {
    room: Room,
    identity: Identity,
    page_size: usize,
    clock: Arc<dyn Clock>,
    directory: RoomDirectory,
    messaging: MessagingService,
    subscription: RoomSubscription,
}

impl RoomSession {
    pub fn room(&self) -> &Room {
        &self.room
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.subscription.messages()
    }

    pub fn members(&self) -> Vec<RoomParticipant> {
        self.subscription.members()
    }

    pub fn subscription(&self) -> &RoomSubscription {
        &self.subscription
    }

    /// Optimistic append, remote write, then confirm.  A failed write takes
    /// the optimistic entry back out and is returned.
    pub async fn send_message(&self, content: &str) -> Result<Message> {
        let content = validate_content(content)?;
        let local = Message::optimistic(
            self.room.id,
            self.identity.user_id,
            self.identity.nickname.as_str(),
            content,
            self.clock.now(),
        );
        let local_id = local.id.clone();
        self.subscription.push_optimistic(local)?;

        let sent = self
            .messaging
            .send_message(
                self.room.id,
                self.identity.user_id,
                &self.identity.nickname,
                content,
            )
            .await;
        match sent {
            Ok(confirmed) => {
                if let Err(e) = self.subscription.confirm(&local_id, confirmed.clone()) {
                    debug!(error = %e, "confirmation after unmount");
                }
                Ok(confirmed)
            }
            Err(e) => {
                let _ = self.subscription.discard(&local_id);
                Err(e)
            }
        }
    }

    pub async fn delete_message(&self, id: &MessageId) -> Result<bool> {
        let deleted = self
            .messaging
            .delete_message(id, self.identity.user_id)
            .await?;
        let _ = self.subscription.remove_message(id);
        Ok(deleted)
    }

    /// Older history, newest first, independent of the live timeline.
    pub fn history(&self) -> Paginator<Message> {
        self.messaging.history(self.room.id, self.page_size)
    }

    /// Owner only.  The target's own session closes on the kick notice.
    pub async fn kick(&self, target: UserId) -> Result<()> {
        self.directory
            .kick_member(self.room.id, self.identity.user_id, target)
            .await
    }

    /// Unmount, then remove the current user's membership.
    pub async fn leave(self) -> Result<bool> {
        self.subscription.close();
        self.directory
            .leave_room(self.room.id, self.identity.user_id)
            .await
    }

    pub async fn check_health(&self) -> Result<SubscriptionState> {
        self.subscription.check_health().await
    }

    pub async fn resubscribe(&self) -> Result<bool> {
        self.subscription.resubscribe().await
    }

    pub fn close(&self) {
        self.subscription.close();
    }
}
