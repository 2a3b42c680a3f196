pub mod lance;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;

use crate::models::{CrawlSession, Paper, PaperQueryLink, SearchQuery};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),

    #[error("stored record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable storage for papers, their query links, queries and sessions.
///
/// Title lookups compare [`normalize_title`](crate::models::normalize_title) keys and DOI
/// lookups are case-insensitive, matching the in-memory dedup identity.
#[async_trait]
pub trait PaperStore: Send + Sync {
    async fn find_by_doi(&self, doi: &str) -> Result<Option<Paper>, StoreError>;

    async fn find_by_title(&self, title: &str) -> Result<Option<Paper>, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Paper>, StoreError>;

    /// Insert the paper, or replace the record with the same `id`.
    async fn upsert(&self, paper: &Paper) -> Result<(), StoreError>;

    /// Link a paper to a query at `depth`. Returns `false` if the pair was already linked,
    /// in which case the existing link (and its depth) is left untouched.
    async fn link_to_query(
        &self,
        paper_id: &str,
        query_id: &str,
        depth: u32,
    ) -> Result<bool, StoreError>;

    /// Papers linked to a query, ordered by discovery depth then link time.
    async fn list_for_query(&self, query_id: &str) -> Result<Vec<Paper>, StoreError>;

    async fn list_links(&self, query_id: &str) -> Result<Vec<PaperQueryLink>, StoreError>;

    async fn save_query(&self, query: &SearchQuery) -> Result<(), StoreError>;

    async fn get_query(&self, id: &str) -> Result<Option<SearchQuery>, StoreError>;

    async fn save_session(&self, session: &CrawlSession) -> Result<(), StoreError>;

    /// Most recently started session for a query.
    async fn session_for_query(&self, query_id: &str) -> Result<Option<CrawlSession>, StoreError>;
}

/// Order links the way `list_for_query` reports papers.
pub(crate) fn sort_links(links: &mut [PaperQueryLink]) {
    links.sort_by(|a, b| a.depth.cmp(&b.depth).then(a.linked_at.cmp(&b.linked_at)));
}
