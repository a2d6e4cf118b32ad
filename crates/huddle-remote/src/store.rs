use async_trait::async_trait;

use huddle_shared::ConnectionHealth;

use crate::error::Result;
use crate::query::{Filter, Query, Row, Table};

/// Row CRUD against the remote relational store.
///
/// Server-side defaults apply on insert: `id` and timestamps the caller
/// leaves out are assigned by the store and come back in the returned row.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn select(&self, query: &Query) -> Result<Vec<Row>>;

    /// Insert one row.  Fails with `UniqueViolation` on a constraint clash.
    async fn insert(&self, table: Table, row: Row) -> Result<Row>;

    /// Insert, or merge into the row that matches on `on_conflict`.
    async fn upsert(&self, table: Table, row: Row, on_conflict: &[&str]) -> Result<Row>;

    /// Patch every row matching `filters`.  Returns the updated rows.
    async fn update(&self, table: Table, filters: &[Filter], patch: Row) -> Result<Vec<Row>>;

    /// Delete every row matching `filters`.  Returns the deleted rows.
    async fn delete(&self, table: Table, filters: &[Filter]) -> Result<Vec<Row>>;

    async fn health(&self) -> ConnectionHealth;
}
