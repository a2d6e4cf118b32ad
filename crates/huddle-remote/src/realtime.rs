//! [`ChangeFeed`] over the hosted realtime service (Phoenix channels on a
//! websocket, protocol `vsn=1.0.0`).
//!
//! One socket per subscription.  The socket task joins the channel with a
//! `postgres_changes` filter for the room, keeps the heartbeat going, and
//! translates incoming frames into [`FeedEvent`]s.  A socket that dies
//! reports it on its own channel only; [`ChangeFeed::health`] reflects
//! whether the service accepted the latest subscribe connection.  Deleted-row events only
//! carry the old record's columns when the table uses `REPLICA IDENTITY FULL`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace, warn};

use huddle_shared::{
    ChannelStatus, ConnectionHealth, FeedEvent, MembershipNotice, Message, MessageId,
    RoomParticipant, Topic, UserId,
};

use crate::error::{RemoteError, Result};
use crate::feed::{ChangeFeed, FeedSubscription};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const BROADCAST_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const MEMBERSHIP_EVENT: &str = "membership";
const JOIN_REF: &str = "1";

/// One Phoenix frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

pub struct RealtimeFeed {
    endpoint: String,
    api_key: String,
    access_token: Option<String>,
    subscribe_refused: AtomicBool,
    live_sockets: Arc<AtomicUsize>,
    next_ref: AtomicU64,
}

/// Counts one running socket task until dropped.
struct LiveSocket(Arc<AtomicUsize>);

impl LiveSocket {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(count))
    }
}

impl Drop for LiveSocket {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RealtimeFeed {
    /// `realtime_url` is the service root, e.g. `wss://xyz.supabase.co/realtime/v1`.
    pub fn new(realtime_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let endpoint = format!(
            "{}/websocket?apikey={}&vsn=1.0.0",
            realtime_url.into().trim_end_matches('/'),
            api_key
        );
        Self {
            endpoint,
            api_key,
            access_token: None,
            subscribe_refused: AtomicBool::new(false),
            live_sockets: Arc::new(AtomicUsize::new(0)),
            next_ref: AtomicU64::new(1),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Socket tasks currently running.
    pub fn live_sockets(&self) -> usize {
        self.live_sockets.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<Socket> {
        match connect_async(self.endpoint.as_str()).await {
            Ok((socket, _)) => Ok(socket),
            Err(e) => {
                warn!(error = %e, "realtime connect failed");
                Err(RemoteError::WebSocket(e.to_string()))
            }
        }
    }

    fn join_frame(&self, topic: Topic) -> Frame {
        let table = match topic {
            Topic::Messages(_) => "messages",
            Topic::Participants(_) => "room_participants",
        };
        let token = self.access_token.as_deref().unwrap_or(&self.api_key);
        Frame {
            topic: channel_topic(topic),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": true },
                    "presence": { "key": "" },
                    "postgres_changes": [{
                        "event": "*",
                        "schema": "public",
                        "table": table,
                        "filter": format!("room_id=eq.{}", topic.room_id()),
                    }],
                },
                "access_token": token,
            }),
            reference: Some(JOIN_REF.to_string()),
        }
    }

    fn reference(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

pub fn channel_topic(topic: Topic) -> String {
    format!("realtime:{}", topic.channel_name())
}

fn encode(frame: &Frame) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(frame)?))
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    #[instrument(skip_all, fields(topic = %topic))]
    async fn subscribe(&self, topic: Topic) -> Result<FeedSubscription> {
        let connected = self.connect().await;
        self.subscribe_refused.store(connected.is_err(), Ordering::SeqCst);
        let mut socket = connected?;
        send_frame(&mut socket, &self.join_frame(topic)).await?;
        info!("join sent");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(run_socket(
            topic,
            socket,
            events_tx,
            cancel_rx,
            LiveSocket::new(&self.live_sockets),
        ));
        Ok(FeedSubscription::new(topic, events_rx, cancel_tx))
    }

    #[instrument(skip_all)]
    async fn broadcast(&self, notice: MembershipNotice) -> Result<()> {
        let topic = Topic::Participants(notice.room_id());
        let mut socket = self.connect().await?;
        send_frame(&mut socket, &self.join_frame(topic)).await?;
        tokio::time::timeout(BROADCAST_JOIN_TIMEOUT, wait_for_join(&mut socket))
            .await
            .map_err(|_| RemoteError::WebSocket("join timed out".to_string()))??;

        let frame = Frame {
            topic: channel_topic(topic),
            event: "broadcast".to_string(),
            payload: json!({
                "type": "broadcast",
                "event": MEMBERSHIP_EVENT,
                "payload": notice,
            }),
            reference: Some(self.reference()),
        };
        send_frame(&mut socket, &frame).await?;
        let _ = socket.close(None).await;
        debug!("membership notice sent");
        Ok(())
    }

    async fn health(&self) -> ConnectionHealth {
        if self.subscribe_refused.load(Ordering::SeqCst) {
            ConnectionHealth::Disconnected
        } else {
            ConnectionHealth::Connected
        }
    }
}

async fn send_frame(socket: &mut Socket, frame: &Frame) -> Result<()> {
    socket
        .send(encode(frame)?)
        .await
        .map_err(|e| RemoteError::WebSocket(e.to_string()))
}

async fn wait_for_join(socket: &mut Socket) -> Result<()> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| RemoteError::WebSocket(e.to_string()))?;
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };
        if frame.event == "phx_reply" && frame.reference.as_deref() == Some(JOIN_REF) {
            return if reply_ok(&frame) {
                Ok(())
            } else {
                Err(RemoteError::WebSocket(frame.payload.to_string()))
            };
        }
    }
    Err(RemoteError::Closed)
}

async fn run_socket(
    topic: Topic,
    socket: Socket,
    events: mpsc::UnboundedSender<FeedEvent>,
    mut cancel: oneshot::Receiver<()>,
    _live: LiveSocket,
) {
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut heartbeat_ref: u64 = 100;

    loop {
        tokio::select! {
            _ = &mut cancel => {
                debug!(topic = %topic, "leaving channel");
                let leave = Frame {
                    topic: channel_topic(topic),
                    event: "phx_leave".to_string(),
                    payload: json!({}),
                    reference: None,
                };
                if let Ok(msg) = encode(&leave) {
                    let _ = sink.send(msg).await;
                }
                let _ = sink.close().await;
                break;
            }
            _ = heartbeat.tick() => {
                heartbeat_ref += 1;
                let beat = Frame {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(heartbeat_ref.to_string()),
                };
                let sent = match encode(&beat) {
                    Ok(msg) => sink.send(msg).await.is_ok(),
                    Err(_) => false,
                };
                if !sent {
                    let _ = events.send(FeedEvent::Status(ChannelStatus::Errored(
                        "heartbeat failed".to_string(),
                    )));
                    break;
                }
                trace!(topic = %topic, "heartbeat");
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(event) = decode_frame(topic, &text) else {
                        continue;
                    };
                    let terminal = matches!(
                        event,
                        FeedEvent::Status(ChannelStatus::Closed | ChannelStatus::Errored(_))
                    );
                    if events.send(event).is_err() || terminal {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    let _ = events.send(FeedEvent::Status(ChannelStatus::Closed));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(topic = %topic, error = %e, "realtime socket error");
                    let _ = events.send(FeedEvent::Status(ChannelStatus::Errored(e.to_string())));
                    break;
                }
            }
        }
    }
}

fn reply_ok(frame: &Frame) -> bool {
    frame.payload.get("status").and_then(Value::as_str) == Some("ok")
}

/// Translate one text frame received on `topic`'s channel.  Frames for
/// other topics, heartbeat replies and unknown events yield `None`.
pub fn decode_frame(topic: Topic, text: &str) -> Option<FeedEvent> {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "undecodable realtime frame");
            return None;
        }
    };
    if frame.topic != channel_topic(topic) {
        return None;
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(JOIN_REF) => {
            Some(FeedEvent::Status(if reply_ok(&frame) {
                ChannelStatus::Subscribed
            } else {
                ChannelStatus::Errored(frame.payload.to_string())
            }))
        }
        "phx_error" => Some(FeedEvent::Status(ChannelStatus::Errored(
            frame.payload.to_string(),
        ))),
        "phx_close" => Some(FeedEvent::Status(ChannelStatus::Closed)),
        "postgres_changes" => decode_change(topic, &frame.payload),
        "broadcast" => {
            if frame.payload.get("event").and_then(Value::as_str) != Some(MEMBERSHIP_EVENT) {
                return None;
            }
            let inner = frame.payload.get("payload")?.clone();
            match serde_json::from_value::<MembershipNotice>(inner) {
                Ok(notice) if notice.room_id() == topic.room_id() => {
                    Some(FeedEvent::Membership(notice))
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "undecodable membership notice");
                    None
                }
            }
        }
        _ => None,
    }
}

fn decode_change(topic: Topic, payload: &Value) -> Option<FeedEvent> {
    let data = payload.get("data")?;
    let kind = data.get("type").and_then(Value::as_str)?;
    let table = data.get("table").and_then(Value::as_str)?;
    let record = data.get("record").cloned().unwrap_or(Value::Null);
    let old = data.get("old_record").cloned().unwrap_or(Value::Null);

    let decoded = match (table, kind) {
        ("messages", "INSERT") => serde_json::from_value::<Message>(record)
            .map(FeedEvent::MessageInserted)
            .map_err(|e| e.to_string()),
        ("messages", "DELETE") => old
            .get("id")
            .and_then(Value::as_str)
            .map(|id| FeedEvent::MessageDeleted {
                room_id: topic.room_id(),
                id: MessageId::new(id),
            })
            .ok_or_else(|| "delete without old id".to_string()),
        ("room_participants", "INSERT" | "UPDATE") => {
            serde_json::from_value::<RoomParticipant>(record)
                .map(FeedEvent::ParticipantUpserted)
                .map_err(|e| e.to_string())
        }
        ("room_participants", "DELETE") => old
            .get("user_id")
            .cloned()
            .ok_or_else(|| "delete without old user_id".to_string())
            .and_then(|v| serde_json::from_value::<UserId>(v).map_err(|e| e.to_string()))
            .map(|user_id| FeedEvent::ParticipantDeleted {
                room_id: topic.room_id(),
                user_id,
            }),
        _ => return None,
    };

    match decoded {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(table, kind, error = %e, "dropping change event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_shared::RoomId;

    fn frame(topic: Topic, event: &str, payload: Value, reference: Option<&str>) -> String {
        serde_json::to_string(&Frame {
            topic: channel_topic(topic),
            event: event.to_string(),
            payload,
            reference: reference.map(str::to_string),
        })
        .unwrap()
    }

    #[test]
    fn join_reply_maps_to_subscribed() {
        let topic = Topic::Messages(RoomId::new());
        let text = frame(topic, "phx_reply", json!({"status": "ok", "response": {}}), Some("1"));
        assert_eq!(
            decode_frame(topic, &text),
            Some(FeedEvent::Status(ChannelStatus::Subscribed))
        );

        let heartbeat_reply = frame(topic, "phx_reply", json!({"status": "ok"}), Some("7"));
        assert_eq!(decode_frame(topic, &heartbeat_reply), None);
    }

    #[test]
    fn message_insert_is_decoded() {
        let room = RoomId::new();
        let topic = Topic::Messages(room);
        let payload = json!({
            "data": {
                "type": "INSERT",
                "table": "messages",
                "record": {
                    "id": "m1", "room_id": room, "user_id": UserId::new(),
                    "nickname": "a", "content": "hi",
                    "created_at": "2024-05-01T10:00:00Z",
                },
            }
        });
        let text = frame(topic, "postgres_changes", payload, None);
        match decode_frame(topic, &text) {
            Some(FeedEvent::MessageInserted(m)) => assert_eq!(m.id.as_str(), "m1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn participant_delete_uses_old_record() {
        let room = RoomId::new();
        let user = UserId::new();
        let topic = Topic::Participants(room);
        let payload = json!({
            "data": { "type": "DELETE", "table": "room_participants",
                      "old_record": { "room_id": room, "user_id": user } }
        });
        let text = frame(topic, "postgres_changes", payload, None);
        assert_eq!(
            decode_frame(topic, &text),
            Some(FeedEvent::ParticipantDeleted {
                room_id: room,
                user_id: user
            })
        );
    }

    #[test]
    fn membership_broadcast_is_decoded() {
        let room = RoomId::new();
        let topic = Topic::Participants(room);
        let notice = MembershipNotice::Kicked {
            room_id: room,
            user_id: UserId::new(),
            kicked_by: UserId::new(),
        };
        let payload = json!({"type": "broadcast", "event": "membership", "payload": notice});
        let text = frame(topic, "broadcast", payload, None);
        assert_eq!(decode_frame(topic, &text), Some(FeedEvent::Membership(notice)));
    }

    #[test]
    fn frames_for_other_topics_are_ignored() {
        let topic = Topic::Messages(RoomId::new());
        let other = Topic::Messages(RoomId::new());
        let text = frame(other, "phx_close", json!({}), None);
        assert_eq!(decode_frame(topic, &text), None);
    }

    /// Nothing listens on port 1 of the loopback interface.
    fn refused_feed() -> RealtimeFeed {
        RealtimeFeed::new("ws://127.0.0.1:1", "key")
    }

    #[tokio::test]
    async fn failed_broadcast_leaves_health_alone() {
        let feed = refused_feed();
        let notice = MembershipNotice::Kicked {
            room_id: RoomId::new(),
            user_id: UserId::new(),
            kicked_by: UserId::new(),
        };
        assert!(feed.broadcast(notice).await.is_err());
        assert_eq!(feed.health().await, ConnectionHealth::Connected);
    }

    #[tokio::test]
    async fn refused_subscribe_reports_disconnected() {
        let feed = refused_feed();
        assert!(feed.subscribe(Topic::Messages(RoomId::new())).await.is_err());
        assert_eq!(feed.health().await, ConnectionHealth::Disconnected);
        assert_eq!(feed.live_sockets(), 0);
    }

    #[test]
    fn live_socket_guard_counts_running_tasks() {
        let count = Arc::new(AtomicUsize::new(0));
        let first = LiveSocket::new(&count);
        let second = LiveSocket::new(&count);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        drop(first);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
