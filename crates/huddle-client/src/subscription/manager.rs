//! Owns the channels, timeline, member list and seen-id set of one room.
//!
//! Every open of the channels runs under a fresh [`SessionId`].  Channel
//! tasks tag what they deliver with the session they were started for, and
//! anything tagged with a session other than the current one is dropped.
//! Unmounting replaces the session id before anything else, so no event
//! from before the unmount can reach the timeline afterwards.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use huddle_remote::{ChangeFeed, RemoteError, SubscriptionHandle};
use huddle_shared::{
    ChannelStatus, FeedEvent, Message, MessageId, RoomId, RoomParticipant, SessionId, Topic,
    UserId,
};
use huddle_store::{Clock, MessageCache};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::RoomEvent;
use crate::membership::{MemberList, MembershipChange};
use crate::reconcile::{Applied, DedupPolicy, SeenIds, Timeline};
use crate::subscription::state::{SubscriptionState, Transition};

/// Channels opened per session: messages and participants.
const CHANNELS_PER_SESSION: usize = 2;

/// Floor for the health-check period; `tokio::time::interval` rejects zero.
const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub health_check_interval: Duration,
    pub seen_ids_max: usize,
    pub seen_ids_retain: usize,
    pub announce_membership: bool,
    pub policy: DedupPolicy,
}

impl SubscriptionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            health_check_interval: config.health_check_interval,
            seen_ids_max: config.seen_ids_max,
            seen_ids_retain: config.seen_ids_retain,
            announce_membership: config.announce_membership,
            policy: config.dedup_policy(),
        }
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// Collaborators of one room subscription.
pub struct SubscriptionContext {
    pub room_id: RoomId,
    /// The signed-in user.
    pub user_id: UserId,
    pub feed: Arc<dyn ChangeFeed>,
    pub cache: MessageCache,
    pub clock: Arc<dyn Clock>,
    pub options: SubscriptionOptions,
}

struct Inner {
    state: SubscriptionState,
    session: SessionId,
    handles: Vec<SubscriptionHandle>,
    pumps: Vec<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
    /// Session a health check found still unconfirmed.  Seeing the same
    /// session unconfirmed on the next check fails it.
    unconfirmed: Option<SessionId>,
    seen: SeenIds,
    timeline: Timeline,
    members: MemberList,
}

/// Channels and tasks detached under the lock, released after it.
#[derive(Default)]
struct Teardown {
    handles: Vec<SubscriptionHandle>,
    pumps: Vec<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl Teardown {
    fn detach(inner: &mut Inner, with_health: bool) -> Self {
        Self {
            handles: mem::take(&mut inner.handles),
            pumps: mem::take(&mut inner.pumps),
            health_task: if with_health {
                inner.health_task.take()
            } else {
                None
            },
        }
    }

    fn run(self) {
        for pump in &self.pumps {
            pump.abort();
        }
        if let Some(task) = &self.health_task {
            task.abort();
        }
        for mut handle in self.handles {
            handle.unsubscribe();
        }
    }
}

enum CacheOp {
    Append(Message),
    Confirm { local_id: MessageId, message: Message },
    Remove(MessageId),
}

struct Shared {
    room_id: RoomId,
    me: UserId,
    feed: Arc<dyn ChangeFeed>,
    cache: MessageCache,
    clock: Arc<dyn Clock>,
    options: SubscriptionOptions,
    events: mpsc::UnboundedSender<RoomEvent>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    /// Returns whether the state changed.
    fn transition(&self, inner: &mut Inner, input: Transition) -> Result<bool> {
        let next = inner.state.next(input)?;
        if next == inner.state {
            return Ok(false);
        }
        debug!(room = %self.room_id, from = ?inner.state, to = ?next, ?input, "subscription state");
        inner.state = next;
        self.emit(RoomEvent::StateChanged(next));
        Ok(true)
    }

    fn shutdown(&self, inner: &mut Inner) -> Teardown {
        // Unmount is accepted from every state.
        let _ = self.transition(inner, Transition::Unmount);
        inner.session = SessionId::new();
        inner.seen.clear();
        Teardown::detach(inner, true)
    }

    fn deliver(&self, session: SessionId, event: FeedEvent) {
        let mut cache_ops = Vec::new();
        let teardown = {
            let mut inner = self.lock();
            if inner.session != session || inner.state.is_closed() {
                trace!(room = %self.room_id, %session, "dropping event from stale session");
                return;
            }
            self.handle(&mut inner, event, &mut cache_ops)
        };

        if let Some(teardown) = teardown {
            teardown.run();
            info!(room = %self.room_id, "removed from room, subscription closed");
        }
        for op in cache_ops {
            match op {
                CacheOp::Append(message) => self.cache.append(&self.room_id, &message),
                CacheOp::Confirm { local_id, message } => {
                    self.cache.confirm_pending(&self.room_id, &local_id, &message)
                }
                CacheOp::Remove(id) => {
                    self.cache.remove_message(&self.room_id, &id);
                }
            }
        }
    }

    fn handle(
        &self,
        inner: &mut Inner,
        event: FeedEvent,
        cache_ops: &mut Vec<CacheOp>,
    ) -> Option<Teardown> {
        match event {
            FeedEvent::Status(ChannelStatus::Subscribed) => {
                if let Err(e) = self.transition(inner, Transition::Confirmed) {
                    debug!(room = %self.room_id, error = %e, "ignoring confirmation");
                }
            }
            FeedEvent::Status(status) => {
                warn!(room = %self.room_id, ?status, "channel lost");
                let _ = self.transition(inner, Transition::HealthCheckFailed);
            }
            FeedEvent::MessageInserted(message) => {
                if message.room_id != self.room_id {
                    return None;
                }
                if !inner.seen.insert(&message.id) {
                    trace!(message = %message.id, "already processed");
                    return None;
                }
                match inner.timeline.apply(message.clone()) {
                    Applied::Added => {
                        self.emit(RoomEvent::MessageAdded(message.clone()));
                        self.emit(RoomEvent::ScrollToEnd);
                        cache_ops.push(CacheOp::Append(message));
                    }
                    Applied::Replaced { local_id } => {
                        self.emit(RoomEvent::MessageReconciled {
                            local_id: local_id.clone(),
                            message: message.clone(),
                        });
                        cache_ops.push(CacheOp::Confirm { local_id, message });
                    }
                    Applied::Updated => cache_ops.push(CacheOp::Append(message)),
                    Applied::Duplicate => {
                        trace!(message = %message.id, "duplicate of a timeline entry");
                    }
                }
            }
            FeedEvent::MessageDeleted { id, .. } => {
                if inner.timeline.remove(&id) {
                    self.emit(RoomEvent::MessageRemoved(id.clone()));
                }
                cache_ops.push(CacheOp::Remove(id));
            }
            other => {
                let change = inner.members.apply(&other)?;
                match &change {
                    MembershipChange::Kicked {
                        user_id, kicked_by, ..
                    } if *user_id == self.me => {
                        self.emit(RoomEvent::RemovedFromRoom {
                            kicked_by: *kicked_by,
                        });
                        return Some(self.shutdown(inner));
                    }
                    MembershipChange::Kicked {
                        user_id, nickname, ..
                    } => {
                        let name = nickname.clone().unwrap_or_else(|| user_id.short());
                        self.emit(RoomEvent::MembershipChanged(change.clone()));
                        if self.options.announce_membership {
                            let notice = Message::system(
                                self.room_id,
                                format!("{name} was removed from the room"),
                                self.clock.now(),
                            );
                            if inner.timeline.apply(notice.clone()) == Applied::Added {
                                self.emit(RoomEvent::MessageAdded(notice));
                                self.emit(RoomEvent::ScrollToEnd);
                            }
                        }
                    }
                    _ => self.emit(RoomEvent::MembershipChanged(change)),
                }
            }
        }
        None
    }

    fn stream_ended(&self, session: SessionId) {
        let mut inner = self.lock();
        if inner.session != session || !inner.state.is_live() {
            return;
        }
        warn!(room = %self.room_id, "feed stream ended");
        let _ = self.transition(&mut inner, Transition::HealthCheckFailed);
    }
}

async fn pump(shared: Weak<Shared>, session: SessionId, mut events: mpsc::UnboundedReceiver<FeedEvent>) {
    while let Some(event) = events.recv().await {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        strong.deliver(session, event);
    }
    if let Some(strong) = shared.upgrade() {
        strong.stream_ended(session);
    }
}

/// Open both channels for `session` and wire them to the timeline.  A
/// failure leaves the subscription `Degraded` for the health check to retry.
async fn open_channels(shared: &Arc<Shared>, session: SessionId) {
    let room_id = shared.room_id;
    let opened = async {
        let messages = shared.feed.subscribe(Topic::Messages(room_id)).await?;
        let participants = shared.feed.subscribe(Topic::Participants(room_id)).await?;
        Ok::<_, RemoteError>([messages, participants])
    }
    .await;

    let mut inner = shared.lock();
    if inner.session != session || inner.state.is_closed() {
        trace!(room = %room_id, %session, "discarding channels of a stale session");
        return;
    }
    match opened {
        Ok(subscriptions) => {
            for subscription in subscriptions {
                let (events, handle) = subscription.into_parts();
                inner.handles.push(handle);
                inner
                    .pumps
                    .push(tokio::spawn(pump(Arc::downgrade(shared), session, events)));
            }
            debug!(room = %room_id, %session, "channels open");
        }
        Err(e) => {
            warn!(room = %room_id, error = %e, "channel open failed");
            let _ = shared.transition(&mut inner, Transition::OpenFailed);
        }
    }
}

async fn resubscribe(shared: &Arc<Shared>) -> Result<bool> {
    let (session, teardown) = {
        let mut inner = shared.lock();
        match inner.state {
            SubscriptionState::Degraded => {}
            SubscriptionState::Closed => return Err(ClientError::SessionClosed),
            _ => return Ok(false),
        }
        shared.transition(&mut inner, Transition::Resubscribe)?;
        inner.session = SessionId::new();
        (inner.session, Teardown::detach(&mut inner, false))
    };
    teardown.run();
    info!(room = %shared.room_id, %session, "resubscribing");
    open_channels(shared, session).await;
    Ok(true)
}

async fn check_health(shared: &Arc<Shared>) -> Result<SubscriptionState> {
    let connected = shared.feed.health().await.is_connected();
    let degraded = {
        let mut inner = shared.lock();
        if inner.state.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        if matches!(
            inner.state,
            SubscriptionState::Subscribing | SubscriptionState::Resubscribing
        ) {
            let session = inner.session;
            if inner.unconfirmed == Some(session) {
                warn!(room = %shared.room_id, %session, "subscription never confirmed");
                shared.transition(&mut inner, Transition::HealthCheckFailed)?;
            } else {
                inner.unconfirmed = Some(session);
            }
        } else if inner.state == SubscriptionState::Active {
            let channels_alive = inner.handles.len() == CHANNELS_PER_SESSION
                && inner.handles.iter().all(SubscriptionHandle::is_active)
                && inner.pumps.iter().all(|p| !p.is_finished());
            if !(connected && channels_alive) {
                warn!(room = %shared.room_id, connected, channels_alive, "health check failed");
                shared.transition(&mut inner, Transition::HealthCheckFailed)?;
            }
        }
        inner.state == SubscriptionState::Degraded
    };
    if degraded {
        resubscribe(shared).await?;
    }
    Ok(shared.lock().state)
}

fn health_check_period(requested: Duration) -> Duration {
    requested.max(MIN_HEALTH_CHECK_INTERVAL)
}

fn spawn_health_check(shared: Weak<Shared>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(health_check_period(period));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(strong) = shared.upgrade() else {
                break;
            };
            if let Err(ClientError::SessionClosed) = check_health(&strong).await {
                break;
            }
        }
    })
}

/// The mounted subscription of one room screen.  Dropping it unmounts.
pub struct RoomSubscription {
    shared: Arc<Shared>,
}

impl RoomSubscription {
    /// Mount: seed the timeline and member list, then open the channels.
    /// Open failures do not fail the mount; the subscription starts
    /// `Degraded` and the health check retries.
    pub async fn mount(
        ctx: SubscriptionContext,
        messages: &[Message],
        members: Vec<RoomParticipant>,
    ) -> (Self, mpsc::UnboundedReceiver<RoomEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let options = ctx.options;
        let inner = Inner {
            state: SubscriptionState::Idle,
            session: SessionId::new(),
            handles: Vec::new(),
            pumps: Vec::new(),
            health_task: None,
            unconfirmed: None,
            seen: SeenIds::new(options.seen_ids_max, options.seen_ids_retain),
            timeline: Timeline::with_messages(options.policy, messages),
            members: MemberList::new(members),
        };
        let shared = Arc::new(Shared {
            room_id: ctx.room_id,
            me: ctx.user_id,
            feed: ctx.feed,
            cache: ctx.cache,
            clock: ctx.clock,
            options,
            events: events_tx,
            inner: Mutex::new(inner),
        });

        let session = {
            let mut inner = shared.lock();
            let _ = shared.transition(&mut inner, Transition::Mount);
            inner.health_task = Some(spawn_health_check(
                Arc::downgrade(&shared),
                shared.options.health_check_interval,
            ));
            inner.session
        };
        info!(room = %shared.room_id, %session, "mounting room subscription");
        open_channels(&shared, session).await;

        (Self { shared }, events_rx)
    }

    pub fn room_id(&self) -> RoomId {
        self.shared.room_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.lock().state
    }

    pub fn session_id(&self) -> SessionId {
        self.shared.lock().session
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Snapshot of the timeline, ascending.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock().timeline.messages().to_vec()
    }

    pub fn members(&self) -> Vec<RoomParticipant> {
        self.shared.lock().members.members()
    }

    /// Feed one channel event received under `session`.  Events from any
    /// session but the current one are dropped.
    pub fn deliver(&self, session: SessionId, event: FeedEvent) {
        self.shared.deliver(session, event);
    }

    /// One health check: an `Active` subscription with a dead connection or
    /// channel is degraded, as is one still unconfirmed from the previous
    /// check.  A degraded subscription is reopened.
    pub async fn check_health(&self) -> Result<SubscriptionState> {
        check_health(&self.shared).await
    }

    /// Reopen from `Degraded` under a new session.  `Ok(false)` when there is
    /// nothing to recover.
    pub async fn resubscribe(&self) -> Result<bool> {
        resubscribe(&self.shared).await
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.shared.lock();
        if inner.state.is_closed() {
            return Err(ClientError::SessionClosed);
        }
        Ok(inner)
    }

    /// Show a locally-authored message before the store has it.  The
    /// pending copy is cached too, until confirmed or discarded.
    pub fn push_optimistic(&self, message: Message) -> Result<()> {
        drop(self.lock_open()?);
        // Cached first so a fast echo finds the pending copy to replace.
        self.shared.cache.append(&self.shared.room_id, &message);
        let mut inner = self.lock_open()?;
        if inner.timeline.apply(message.clone()) == Applied::Added {
            self.shared.emit(RoomEvent::MessageAdded(message));
            self.shared.emit(RoomEvent::ScrollToEnd);
        }
        Ok(())
    }

    /// The store accepted the optimistic message `local_id` as `confirmed`.
    /// The cache is settled even after unmount.
    pub fn confirm(&self, local_id: &MessageId, confirmed: Message) -> Result<()> {
        self.shared
            .cache
            .confirm_pending(&self.shared.room_id, local_id, &confirmed);
        let mut inner = self.lock_open()?;
        inner.seen.insert(&confirmed.id);
        let had_local = inner.timeline.contains(local_id);
        match inner.timeline.confirm(local_id, confirmed.clone()) {
            Applied::Replaced { local_id } => self.shared.emit(RoomEvent::MessageReconciled {
                local_id,
                message: confirmed,
            }),
            Applied::Added => {
                self.shared.emit(RoomEvent::MessageAdded(confirmed));
                self.shared.emit(RoomEvent::ScrollToEnd);
            }
            Applied::Duplicate if had_local => {
                self.shared.emit(RoomEvent::MessageRemoved(local_id.clone()));
            }
            Applied::Updated | Applied::Duplicate => {}
        }
        Ok(())
    }

    /// Drop an optimistic entry whose write failed, from the timeline and
    /// the cache.
    pub fn discard(&self, local_id: &MessageId) -> Result<bool> {
        self.shared
            .cache
            .remove_message(&self.shared.room_id, local_id);
        self.remove_message(local_id)
    }

    pub fn remove_message(&self, id: &MessageId) -> Result<bool> {
        let mut inner = self.lock_open()?;
        let removed = inner.timeline.remove(id);
        if removed {
            self.shared.emit(RoomEvent::MessageRemoved(id.clone()));
        }
        Ok(removed)
    }

    /// Unmount.  Synchronous: once this returns no channel event or timer
    /// reaches the timeline.
    pub fn close(&self) {
        let teardown = {
            let mut inner = self.shared.lock();
            if inner.state.is_closed() {
                return;
            }
            self.shared.shutdown(&mut inner)
        };
        teardown.run();
        info!(room = %self.shared.room_id, "room subscription closed");
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.close();
    }
}
