//! In-process backend implementing both [`RowStore`] and [`ChangeFeed`].
//!
//! Mirrors the hosted schema closely enough for the client core to be
//! exercised end to end: server-assigned ids and timestamps, declared
//! unique constraints, UUID-typed columns, cascade deletes from `rooms`,
//! and change events published for `messages` and `room_participants`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use huddle_shared::{
    ConnectionHealth, FeedEvent, MembershipNotice, Message, MessageId, RoomId, RoomParticipant,
    Topic, UserId,
};

use crate::error::{RemoteError, Result};
use crate::feed::{ChangeFeed, FeedSubscription};
use crate::hub::FeedHub;
use crate::query::{from_row, Direction, Filter, FilterOp, Query, Row, Table};
use crate::store::RowStore;

pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
    hub: FeedHub,
    online: AtomicBool,
    subscriptions_enabled: AtomicBool,
    last_timestamp: Mutex<DateTime<Utc>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let tables = Table::ALL.iter().map(|t| (*t, Vec::new())).collect();
        Self {
            tables: RwLock::new(tables),
            hub: FeedHub::new(),
            online: AtomicBool::new(true),
            subscriptions_enabled: AtomicBool::new(true),
            last_timestamp: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    /// Take the whole backend off the network.  Every call fails with
    /// `Unavailable` and open channels are closed.
    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, AtomicOrdering::SeqCst);
        if was && !online {
            info!("memory backend going offline");
            self.hub.close_all();
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(AtomicOrdering::SeqCst)
    }

    /// Refuse new channel subscriptions while rows stay reachable.
    pub fn set_subscriptions_enabled(&self, enabled: bool) {
        self.subscriptions_enabled
            .store(enabled, AtomicOrdering::SeqCst);
    }

    /// Close every open channel without changing reachability.
    pub fn drop_connections(&self) {
        self.hub.close_all();
    }

    /// Live channel subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.hub.receiver_count(topic)
    }

    /// Snapshot of a table, in insertion order.
    pub async fn rows(&self, table: Table) -> Vec<Row> {
        self.tables
            .read()
            .await
            .get(&table)
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable)
        }
    }

    /// Strictly increasing server clock, so rows inserted back to back
    /// still order deterministically.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = match self.last_timestamp.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut now = Utc::now();
        if now <= *last {
            now = *last + Duration::microseconds(1);
        }
        *last = now;
        now
    }

    fn apply_defaults(&self, table: Table, row: &mut Row) {
        let now = Value::String(self.next_timestamp().to_rfc3339());
        let mut default = |column: &str, value: Value| {
            if row.get(column).map_or(true, Value::is_null) {
                row.insert(column.to_string(), value);
            }
        };
        match table {
            Table::Rooms => {
                default("id", Value::String(Uuid::new_v4().to_string()));
                default("created_at", now);
                default("is_private", Value::Bool(false));
            }
            Table::RoomParticipants => {
                default("joined_at", now.clone());
                default("last_seen_at", now);
                default("is_active", Value::Bool(true));
            }
            Table::Messages => {
                default("id", Value::String(Uuid::new_v4().to_string()));
                default("created_at", now);
            }
            Table::RecentRooms => {
                default("last_accessed", now);
                default("is_pinned", Value::Bool(false));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RowStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RowStore for MemoryBackend {
    async fn select(&self, query: &Query) -> Result<Vec<Row>> {
        self.ensure_online()?;
        validate_filters(query.table, &query.filters)?;

        let tables = self.tables.read().await;
        let mut rows: Vec<Row> = tables
            .get(&query.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_all(row, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            for order in &query.order {
                let left = a.get(&order.column).unwrap_or(&Value::Null);
                let right = b.get(&order.column).unwrap_or(&Value::Null);
                let ord = compare_values(left, right).unwrap_or(Ordering::Equal);
                let ord = match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        let offset = query.offset.unwrap_or(0);
        let rows = rows.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn insert(&self, table: Table, mut row: Row) -> Result<Row> {
        self.ensure_online()?;
        validate_row(table, &row)?;
        self.apply_defaults(table, &mut row);

        {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            check_unique(table, rows, &row, None)?;
            rows.push(row.clone());
        }

        debug!(table = %table, "row inserted");
        publish_change(&self.hub, table, &row, false);
        Ok(row)
    }

    async fn upsert(&self, table: Table, row: Row, on_conflict: &[&str]) -> Result<Row> {
        self.ensure_online()?;
        validate_row(table, &row)?;

        let merged = {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            let existing = rows.iter().position(|candidate| {
                !on_conflict.is_empty()
                    && on_conflict.iter().all(|col| {
                        match (candidate.get(*col), row.get(*col)) {
                            (Some(a), Some(b)) if !b.is_null() => {
                                compare_values(a, b) == Some(Ordering::Equal)
                            }
                            _ => false,
                        }
                    })
            });

            match existing {
                Some(index) => {
                    let mut merged = rows[index].clone();
                    for (key, value) in &row {
                        merged.insert(key.clone(), value.clone());
                    }
                    check_unique(table, rows, &merged, Some(index))?;
                    rows[index] = merged.clone();
                    merged
                }
                None => {
                    let mut fresh = row;
                    self.apply_defaults(table, &mut fresh);
                    check_unique(table, rows, &fresh, None)?;
                    rows.push(fresh.clone());
                    fresh
                }
            }
        };

        debug!(table = %table, "row upserted");
        publish_change(&self.hub, table, &merged, false);
        Ok(merged)
    }

    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<Vec<Row>> {
        self.ensure_online()?;
        validate_filters(table, filters)?;
        validate_row(table, &patch)?;

        let updated = {
            let mut tables = self.tables.write().await;
            let rows = tables.entry(table).or_default();
            let targets: Vec<usize> = rows
                .iter()
                .enumerate()
                .filter(|(_, row)| matches_all(row, filters))
                .map(|(i, _)| i)
                .collect();

            let mut updated = Vec::with_capacity(targets.len());
            for index in targets {
                let mut merged = rows[index].clone();
                for (key, value) in &patch {
                    merged.insert(key.clone(), value.clone());
                }
                check_unique(table, rows, &merged, Some(index))?;
                rows[index] = merged.clone();
                updated.push(merged);
            }
            updated
        };

        for row in &updated {
            publish_change(&self.hub, table, row, false);
        }
        Ok(updated)
    }

    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>> {
        self.ensure_online()?;
        validate_filters(table, filters)?;

        let mut removed: Vec<(Table, Row)> = Vec::new();
        let deleted = {
            let mut tables = self.tables.write().await;
            let deleted = drain_matching(&mut tables, table, filters);

            if table == Table::Rooms {
                for room in &deleted {
                    let Some(room_id) = room.get("id").cloned() else {
                        continue;
                    };
                    let by_room = [Filter::eq("room_id", room_id)];
                    for child in [Table::RoomParticipants, Table::Messages, Table::RecentRooms] {
                        for row in drain_matching(&mut tables, child, &by_room) {
                            removed.push((child, row));
                        }
                    }
                }
            }
            deleted
        };

        if !removed.is_empty() {
            info!(table = %table, cascaded = removed.len(), "cascade delete");
        }
        for row in &deleted {
            publish_change(&self.hub, table, row, true);
        }
        for (child, row) in &removed {
            publish_change(&self.hub, *child, row, true);
        }
        Ok(deleted)
    }

    async fn health(&self) -> ConnectionHealth {
        if self.is_online() {
            ConnectionHealth::Connected
        } else {
            ConnectionHealth::Disconnected
        }
    }
}

// ---------------------------------------------------------------------------
// ChangeFeed
// ---------------------------------------------------------------------------

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, topic: Topic) -> Result<FeedSubscription> {
        self.ensure_online()?;
        if !self.subscriptions_enabled.load(AtomicOrdering::SeqCst) {
            return Err(RemoteError::WebSocket("subscription refused".to_string()));
        }
        Ok(self.hub.subscribe(topic))
    }

    async fn broadcast(&self, notice: MembershipNotice) -> Result<()> {
        self.ensure_online()?;
        let delivered = self.hub.publish(FeedEvent::Membership(notice));
        debug!(delivered, "membership notice broadcast");
        Ok(())
    }

    async fn health(&self) -> ConnectionHealth {
        <Self as RowStore>::health(self).await
    }
}

// ---------------------------------------------------------------------------
// Row evaluation
// ---------------------------------------------------------------------------

fn drain_matching(
    tables: &mut HashMap<Table, Vec<Row>>,
    table: Table,
    filters: &[Filter],
) -> Vec<Row> {
    let Some(rows) = tables.get_mut(&table) else {
        return Vec::new();
    };
    let (gone, kept): (Vec<Row>, Vec<Row>) =
        rows.drain(..).partition(|row| matches_all(row, filters));
    *rows = kept;
    gone
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| {
        let value = row.get(&filter.column).unwrap_or(&Value::Null);
        let Some(ord) = compare_values(value, &filter.value) else {
            return filter.op == FilterOp::Neq;
        };
        match filter.op {
            FilterOp::Eq => ord == Ordering::Equal,
            FilterOp::Neq => ord != Ordering::Equal,
            FilterOp::Lt => ord == Ordering::Less,
            FilterOp::Lte => ord != Ordering::Greater,
            FilterOp::Gt => ord == Ordering::Greater,
            FilterOp::Gte => ord != Ordering::Less,
        }
    })
}

/// Column comparison: timestamps as instants, numbers numerically, UUIDs
/// case-insensitively, everything else by JSON equality or string order.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => {
            if let (Ok(dx), Ok(dy)) = (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                return Some(dx.cmp(&dy));
            }
            if let (Ok(ux), Ok(uy)) = (Uuid::parse_str(x), Uuid::parse_str(y)) {
                return Some(ux.cmp(&uy));
            }
            Some(x.cmp(y))
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

fn check_uuid(table: Table, column: &str, value: &Value) -> Result<()> {
    if !table.uuid_columns().contains(&column) {
        return Ok(());
    }
    match value {
        Value::Null => Ok(()),
        Value::String(s) if Uuid::parse_str(s).is_ok() => Ok(()),
        other => Err(RemoteError::MalformedIdentifier(format!(
            "invalid input syntax for type uuid: {other}"
        ))),
    }
}

fn validate_row(table: Table, row: &Row) -> Result<()> {
    row.iter()
        .try_for_each(|(column, value)| check_uuid(table, column, value))
}

fn validate_filters(table: Table, filters: &[Filter]) -> Result<()> {
    filters
        .iter()
        .try_for_each(|f| check_uuid(table, &f.column, &f.value))
}

fn check_unique(table: Table, rows: &[Row], candidate: &Row, skip: Option<usize>) -> Result<()> {
    for key in table.unique_keys() {
        let values: Option<Vec<&Value>> = key
            .iter()
            .map(|col| candidate.get(*col).filter(|v| !v.is_null()))
            .collect();
        let Some(values) = values else {
            continue;
        };
        let clash = rows.iter().enumerate().any(|(index, row)| {
            Some(index) != skip
                && key.iter().zip(&values).all(|(col, value)| {
                    row.get(*col)
                        .is_some_and(|v| compare_values(v, value) == Some(Ordering::Equal))
                })
        });
        if clash {
            return Err(RemoteError::UniqueViolation(format!(
                "{table} ({})",
                key.join(", ")
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

fn publish_change(hub: &FeedHub, table: Table, row: &Row, deleted: bool) {
    let event = match change_event(table, row, deleted) {
        Ok(Some(event)) => event,
        Ok(None) => return,
        Err(e) => {
            warn!(table = %table, error = %e, "could not build change event");
            return;
        }
    };
    hub.publish(event);
}

fn change_event(table: Table, row: &Row, deleted: bool) -> Result<Option<FeedEvent>> {
    let event = match (table, deleted) {
        (Table::Messages, false) => FeedEvent::MessageInserted(from_row::<Message>(row.clone())?),
        (Table::Messages, true) => FeedEvent::MessageDeleted {
            room_id: column::<RoomId>(row, "room_id")?,
            id: MessageId::new(column::<String>(row, "id")?),
        },
        (Table::RoomParticipants, false) => {
            FeedEvent::ParticipantUpserted(from_row::<RoomParticipant>(row.clone())?)
        }
        (Table::RoomParticipants, true) => FeedEvent::ParticipantDeleted {
            room_id: column::<RoomId>(row, "room_id")?,
            user_id: column::<UserId>(row, "user_id")?,
        },
        (Table::Rooms | Table::RecentRooms, _) => return Ok(None),
    };
    Ok(Some(event))
}

fn column<T: serde::de::DeserializeOwned>(row: &Row, name: &str) -> Result<T> {
    let value = row
        .get(name)
        .cloned()
        .ok_or_else(|| RemoteError::UnexpectedResponse(format!("missing column {name}")))?;
    Ok(serde_json::from_value(value)?)
}
