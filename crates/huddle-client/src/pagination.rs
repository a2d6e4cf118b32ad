//! Successive bounded pages over one remote query.
//!
//! Page `n` covers rows `[n * page_size, n * page_size + page_size)` under the
//! query's ordering.  `has_more` is an approximation: a page that comes back
//! exactly full reports more rows, so when exactly `page_size` rows remain
//! the following fetch returns an empty final page.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;

use huddle_remote::{from_rows, Query, RowStore};

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub has_more: bool,
}

/// Cursor over a query.  Not internally synchronised; one consumer drives it.
pub struct Paginator<T> {
    store: Arc<dyn RowStore>,
    query: Query,
    page_size: usize,
    current_page: usize,
    has_more: bool,
    _rows: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Paginator<T> {
    /// Any range already on `query` is replaced by the paginator's own.
    pub fn new(store: Arc<dyn RowStore>, query: Query, page_size: usize) -> Self {
        Self {
            store,
            query,
            page_size: page_size.max(1),
            current_page: 0,
            has_more: true,
            _rows: PhantomData,
        }
    }

    pub async fn fetch_next_page(&mut self) -> Result<Page<T>> {
        if !self.has_more {
            return Ok(Page {
                rows: Vec::new(),
                has_more: false,
            });
        }

        let offset = self.current_page * self.page_size;
        let query = self.query.clone().range(offset, self.page_size);
        let rows = self.store.select(&query).await?;
        let has_more = rows.len() == self.page_size;
        let rows: Vec<T> = from_rows(rows).map_err(ClientError::from)?;

        debug!(
            table = %self.query.table,
            page = self.current_page,
            rows = rows.len(),
            has_more,
            "fetched page"
        );
        self.current_page += 1;
        self.has_more = has_more;
        Ok(Page { rows, has_more })
    }

    pub fn reset(&mut self) {
        self.current_page = 0;
        self.has_more = true;
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn current_page(&self) -> usize {
        self.current_page
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_remote::{Direction, Filter, MemoryBackend, Row, Table};
    use huddle_shared::{Message, RoomId, UserId};
    use serde_json::json;

    async fn seed(backend: &MemoryBackend, room: RoomId, count: usize) {
        let user = UserId::new();
        for n in 0..count {
            let row: Row = serde_json::from_value(json!({
                "room_id": room, "user_id": user,
                "nickname": "n", "content": format!("m{n}"),
            }))
            .unwrap();
            backend.insert(Table::Messages, row).await.unwrap();
        }
    }

    fn paginator(backend: Arc<MemoryBackend>, room: RoomId) -> Paginator<Message> {
        let query = Query::new(Table::Messages)
            .filter(Filter::eq("room_id", room))
            .order_by("created_at", Direction::Desc);
        Paginator::new(backend, query, 20)
    }

    #[tokio::test]
    async fn exactly_full_page_reports_more() {
        let backend = Arc::new(MemoryBackend::new());
        let room = RoomId::new();
        seed(&backend, room, 20).await;

        let mut pages = paginator(backend, room);
        let first = pages.fetch_next_page().await.unwrap();
        assert_eq!(first.rows.len(), 20);
        assert!(first.has_more);

        let second = pages.fetch_next_page().await.unwrap();
        assert!(second.rows.is_empty());
        assert!(!second.has_more);
    }

    #[tokio::test]
    async fn short_page_ends_pagination() {
        let backend = Arc::new(MemoryBackend::new());
        let room = RoomId::new();
        seed(&backend, room, 19).await;

        let mut pages = paginator(backend, room);
        let first = pages.fetch_next_page().await.unwrap();
        assert_eq!(first.rows.len(), 19);
        assert!(!first.has_more);
        assert_eq!(first.rows[0].content, "m18");
    }

    #[tokio::test]
    async fn exhausted_latch_skips_the_store_until_reset() {
        let backend = Arc::new(MemoryBackend::new());
        let room = RoomId::new();
        seed(&backend, room, 5).await;

        let mut pages = paginator(Arc::clone(&backend), room);
        pages.fetch_next_page().await.unwrap();
        assert!(!pages.has_more());

        backend.set_online(false);
        let page = pages.fetch_next_page().await.unwrap();
        assert!(page.rows.is_empty());

        backend.set_online(true);
        pages.reset();
        assert_eq!(pages.fetch_next_page().await.unwrap().rows.len(), 5);
    }
}
