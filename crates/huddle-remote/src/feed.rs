//! Push-channel contract: subscribe to a [`Topic`], receive [`FeedEvent`]s
//! until the returned handle is unsubscribed or dropped.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use huddle_shared::{ConnectionHealth, FeedEvent, MembershipNotice, Topic};

use crate::error::Result;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open one channel.  The first event on a healthy channel is
    /// `Status(Subscribed)`.
    async fn subscribe(&self, topic: Topic) -> Result<FeedSubscription>;

    /// Publish a membership notice on the room's participants topic.
    async fn broadcast(&self, notice: MembershipNotice) -> Result<()>;

    async fn health(&self) -> ConnectionHealth;
}

/// An open channel: the event stream plus the handle that closes it.
pub struct FeedSubscription {
    pub topic: Topic,
    events: mpsc::UnboundedReceiver<FeedEvent>,
    handle: SubscriptionHandle,
}

impl FeedSubscription {
    /// `cancel` is fired (or dropped) to stop the producer; the producer
    /// holds the matching receiver for as long as it runs.
    pub fn new(
        topic: Topic,
        events: mpsc::UnboundedReceiver<FeedEvent>,
        cancel: oneshot::Sender<()>,
    ) -> Self {
        Self {
            topic,
            events,
            handle: SubscriptionHandle {
                topic,
                cancel: Some(cancel),
            },
        }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<FeedEvent>, SubscriptionHandle) {
        (self.events, self.handle)
    }
}

/// Unsubscribe handle.  Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    topic: Topic,
    cancel: Option<oneshot::Sender<()>>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!(topic = %self.topic, "unsubscribing");
            let _ = cancel.send(());
        }
    }

    /// `false` once unsubscribed or once the producer has stopped.
    pub fn is_active(&self) -> bool {
        self.cancel.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
