use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use super::memory::MemoryStore;
use super::{PaperStore, StoreError};
use crate::models::{CrawlSession, Paper, PaperQueryLink, SearchQuery};

/// Wraps a [`MemoryStore`] and fails chosen writes with a backend error.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_upserts: bool,
    /// 1-based `save_query` call that fails.
    failing_query_save: Option<u32>,
    /// 1-based `save_session` call that fails.
    failing_session_save: Option<u32>,
    query_saves: AtomicU32,
    session_saves: AtomicU32,
}

fn disk_full() -> StoreError {
    StoreError::Backend(anyhow::anyhow!("disk full"))
}

impl FailingStore {
    pub fn rejecting_papers() -> Self {
        Self {
            fail_upserts: true,
            ..Default::default()
        }
    }

    pub fn failing_query_save(call: u32) -> Self {
        Self {
            failing_query_save: Some(call),
            ..Default::default()
        }
    }

    pub fn failing_session_save(call: u32) -> Self {
        Self {
            failing_session_save: Some(call),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PaperStore for FailingStore {
    async fn find_by_doi(&self, doi: &str) -> Result<Option<Paper>, StoreError> {
        self.inner.find_by_doi(doi).await
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<Paper>, StoreError> {
        self.inner.find_by_title(title).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Paper>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn upsert(&self, paper: &Paper) -> Result<(), StoreError> {
        if self.fail_upserts {
            return Err(disk_full());
        }
        self.inner.upsert(paper).await
    }

    async fn link_to_query(&self, p: &str, q: &str, d: u32) -> Result<bool, StoreError> {
        self.inner.link_to_query(p, q, d).await
    }

    async fn list_for_query(&self, q: &str) -> Result<Vec<Paper>, StoreError> {
        self.inner.list_for_query(q).await
    }

    async fn list_links(&self, q: &str) -> Result<Vec<PaperQueryLink>, StoreError> {
        self.inner.list_links(q).await
    }

    async fn save_query(&self, query: &SearchQuery) -> Result<(), StoreError> {
        let call = self.query_saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_query_save == Some(call) {
            return Err(disk_full());
        }
        self.inner.save_query(query).await
    }

    async fn get_query(&self, id: &str) -> Result<Option<SearchQuery>, StoreError> {
        self.inner.get_query(id).await
    }

    async fn save_session(&self, s: &CrawlSession) -> Result<(), StoreError> {
        let call = self.session_saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_session_save == Some(call) {
            return Err(disk_full());
        }
        self.inner.save_session(s).await
    }

    async fn session_for_query(&self, q: &str) -> Result<Option<CrawlSession>, StoreError> {
        self.inner.session_for_query(q).await
    }
}
