//! Table, filter and ordering model for [`RowStore`](crate::RowStore) queries.
//!
//! Rows travel as JSON objects so the same query can be evaluated in memory
//! or rendered as PostgREST query parameters.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{RemoteError, Result};

/// One row of a remote table.
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Rooms,
    RoomParticipants,
    Messages,
    RecentRooms,
}

impl Table {
    pub const ALL: [Table; 4] = [
        Table::Rooms,
        Table::RoomParticipants,
        Table::Messages,
        Table::RecentRooms,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rooms => "rooms",
            Self::RoomParticipants => "room_participants",
            Self::Messages => "messages",
            Self::RecentRooms => "recent_rooms",
        }
    }

    /// Declared unique constraints.  Null values never collide.
    pub fn unique_keys(&self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Rooms => &[&["id"], &["access_code"]],
            Self::RoomParticipants => &[&["room_id", "user_id"]],
            Self::Messages => &[&["id"]],
            Self::RecentRooms => &[&["user_id", "room_id"]],
        }
    }

    /// Columns typed as UUID on the server.
    pub fn uuid_columns(&self) -> &'static [&'static str] {
        match self {
            Self::Rooms => &["id", "created_by"],
            Self::RoomParticipants => &["room_id", "user_id"],
            Self::Messages => &["room_id", "user_id"],
            Self::RecentRooms => &["user_id", "room_id"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    /// PostgREST operator keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Serialize) -> Self {
        Self {
            column: column.into(),
            op,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(column, FilterOp::Lt, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Serialize) -> Self {
        Self::new(column, FilterOp::Gt, value)
    }

    /// Value rendered for a query string (`eq.<value>`).
    pub fn value_text(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            Value::Null => "null".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// A filtered, ordered, optionally ranged read.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rows `[offset, offset + limit)` under the query's order.
    pub fn range(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }
}

// ---------------------------------------------------------------------------
// Typed conversion
// ---------------------------------------------------------------------------

pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(RemoteError::UnexpectedResponse(format!(
            "expected an object, got {other}"
        ))),
    }
}

pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

pub fn from_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(from_row).collect()
}
