//! In-process fan-out of feed events, one broadcast channel per topic.

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, trace, warn};

use huddle_shared::{ChannelStatus, FeedEvent, Topic};

use crate::feed::FeedSubscription;

const BROADCAST_CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct FeedHub {
    channels: DashMap<Topic, broadcast::Sender<FeedEvent>>,
}

impl FeedHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a subscription and spawn the task forwarding the topic's
    /// broadcast into it.  Must be called inside a tokio runtime.
    #[instrument(skip_all, fields(topic = %topic))]
    pub fn subscribe(&self, topic: Topic) -> FeedSubscription {
        let rx = self
            .channels
            .entry(topic)
            .or_insert_with(|| {
                info!("creating broadcast channel");
                broadcast::channel(BROADCAST_CHANNEL_CAPACITY).0
            })
            .subscribe();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(forward(topic, rx, events_tx, cancel_rx));
        FeedSubscription::new(topic, events_rx, cancel_tx)
    }

    /// Fan an event out to the subscribers of its topic.  Returns how many
    /// receivers got it.
    pub fn publish(&self, event: FeedEvent) -> usize {
        let Some(topic) = event.topic() else {
            return 0;
        };
        let Some(tx) = self.channels.get(&topic) else {
            trace!(topic = %topic, "no subscribers");
            return 0;
        };
        match tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(topic = %topic, "no active receivers, removing channel");
                drop(tx);
                self.channels
                    .remove_if(&topic, |_, tx| tx.receiver_count() == 0);
                0
            }
        }
    }

    /// Sever every live subscription, as a dropped connection would.
    pub fn close_all(&self) {
        let count = self.channels.len();
        self.channels.clear();
        if count > 0 {
            warn!(channels = count, "closed all feed channels");
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Live forwarders attached to `topic`.
    pub fn receiver_count(&self, topic: &Topic) -> usize {
        self.channels
            .get(topic)
            .map(|tx| tx.value().receiver_count())
            .unwrap_or(0)
    }
}

async fn forward(
    topic: Topic,
    mut rx: broadcast::Receiver<FeedEvent>,
    events: mpsc::UnboundedSender<FeedEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    if events
        .send(FeedEvent::Status(ChannelStatus::Subscribed))
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = &mut cancel => {
                debug!(topic = %topic, "forwarder cancelled");
                break;
            }
            received = rx.recv() => match received {
                Ok(event) => {
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(topic = %topic, skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    let _ = events.send(FeedEvent::Status(ChannelStatus::Closed));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::{MessageId, RoomId};

    #[tokio::test]
    async fn subscribers_receive_only_their_topic() {
        let hub = FeedHub::new();
        let room = RoomId::new();
        let other = RoomId::new();
        let (mut events, _handle) = hub.subscribe(Topic::Messages(room)).into_parts();

        assert_eq!(
            events.recv().await,
            Some(FeedEvent::Status(ChannelStatus::Subscribed))
        );

        hub.publish(FeedEvent::MessageDeleted {
            room_id: other,
            id: MessageId::new("x"),
        });
        hub.publish(FeedEvent::MessageDeleted {
            room_id: room,
            id: MessageId::new("y"),
        });

        match events.recv().await {
            Some(FeedEvent::MessageDeleted { id, .. }) => assert_eq!(id.as_str(), "y"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_all_reports_closed() {
        let hub = FeedHub::new();
        let room = RoomId::new();
        let (mut events, handle) = hub.subscribe(Topic::Participants(room)).into_parts();
        events.recv().await;

        hub.close_all();
        assert_eq!(
            events.recv().await,
            Some(FeedEvent::Status(ChannelStatus::Closed))
        );
        assert_eq!(events.recv().await, None);
        assert!(!handle.is_active());
    }

    #[tokio::test]
    async fn unsubscribe_stops_forwarding() {
        let hub = FeedHub::new();
        let room = RoomId::new();
        let (mut events, mut handle) = hub.subscribe(Topic::Messages(room)).into_parts();
        events.recv().await;

        handle.unsubscribe();
        assert_eq!(events.recv().await, None);
    }
}
