use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{sort_links, PaperStore, StoreError};
use crate::models::{
    normalize_doi, normalize_title, CrawlSession, Paper, PaperQueryLink, SearchQuery,
};

#[derive(Default)]
struct Inner {
    /// Insertion ordered so lookups that match several records return the oldest.
    papers: Vec<Paper>,
    links: Vec<PaperQueryLink>,
    queries: HashMap<String, SearchQuery>,
    sessions: Vec<CrawlSession>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn paper_count(&self) -> usize {
        self.inner.read().await.papers.len()
    }
}

#[async_trait]
impl PaperStore for MemoryStore {
    async fn find_by_doi(&self, doi: &str) -> Result<Option<Paper>, StoreError> {
        let key = normalize_doi(doi).to_lowercase();
        let inner = self.inner.read().await;
        Ok(inner
            .papers
            .iter()
            .find(|p| p.doi_key().as_deref() == Some(key.as_str()))
            .cloned())
    }

    async fn find_by_title(&self, title: &str) -> Result<Option<Paper>, StoreError> {
        let key = normalize_title(title);
        if key.is_empty() {
            return Ok(None);
        }
        let inner = self.inner.read().await;
        Ok(inner
            .papers
            .iter()
            .find(|p| normalize_title(&p.title) == key)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Paper>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.papers.iter().find(|p| p.id == id).cloned())
    }

    async fn upsert(&self, paper: &Paper) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.papers.iter_mut().find(|p| p.id == paper.id) {
            Some(slot) => *slot = paper.clone(),
            None => inner.papers.push(paper.clone()),
        }
        Ok(())
    }

    async fn link_to_query(
        &self,
        paper_id: &str,
        query_id: &str,
        depth: u32,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .links
            .iter()
            .any(|l| l.paper_id == paper_id && l.query_id == query_id)
        {
            return Ok(false);
        }
        inner.links.push(PaperQueryLink {
            paper_id: paper_id.to_string(),
            query_id: query_id.to_string(),
            depth,
            linked_at: Utc::now(),
        });
        Ok(true)
    }

    async fn list_for_query(&self, query_id: &str) -> Result<Vec<Paper>, StoreError> {
        let links = self.list_links(query_id).await?;
        let inner = self.inner.read().await;
        Ok(links
            .iter()
            .filter_map(|l| inner.papers.iter().find(|p| p.id == l.paper_id).cloned())
            .collect())
    }

    async fn list_links(&self, query_id: &str) -> Result<Vec<PaperQueryLink>, StoreError> {
        let inner = self.inner.read().await;
        let mut links: Vec<PaperQueryLink> = inner
            .links
            .iter()
            .filter(|l| l.query_id == query_id)
            .cloned()
            .collect();
        sort_links(&mut links);
        Ok(links)
    }

    async fn save_query(&self, query: &SearchQuery) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.queries.insert(query.id.clone(), query.clone());
        Ok(())
    }

    async fn get_query(&self, id: &str) -> Result<Option<SearchQuery>, StoreError> {
        Ok(self.inner.read().await.queries.get(id).cloned())
    }

    async fn save_session(&self, session: &CrawlSession) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.sessions.iter_mut().find(|s| s.id == session.id) {
            Some(slot) => *slot = session.clone(),
            None => inner.sessions.push(session.clone()),
        }
        Ok(())
    }

    async fn session_for_query(&self, query_id: &str) -> Result<Option<CrawlSession>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sessions
            .iter()
            .filter(|s| s.query_id == query_id)
            .max_by_key(|s| s.started_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookups_are_normalized() {
        let store = MemoryStore::new();
        let paper = Paper::new("test", "Deep Learning, 2020!", Some("10.1/ABC")).unwrap();
        store.upsert(&paper).await.unwrap();

        let by_doi = store.find_by_doi("https://doi.org/10.1/abc").await.unwrap();
        assert_eq!(by_doi.map(|p| p.id), Some(paper.id.clone()));
        let by_title = store.find_by_title("deep learning 2020").await.unwrap();
        assert_eq!(by_title.map(|p| p.id), Some(paper.id.clone()));
        assert!(store.find_by_title("?").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_link_is_created_once() {
        let store = MemoryStore::new();
        let paper = Paper::new("test", "T", None).unwrap();
        store.upsert(&paper).await.unwrap();

        assert!(store.link_to_query(&paper.id, "q", 1).await.unwrap());
        assert!(!store.link_to_query(&paper.id, "q", 0).await.unwrap());
        assert!(store.link_to_query(&paper.id, "other", 2).await.unwrap());

        let links = store.list_links("q").await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].depth, 1);
        assert_eq!(store.list_for_query("q").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = MemoryStore::new();
        let mut paper = Paper::new("test", "T", None).unwrap();
        store.upsert(&paper).await.unwrap();
        paper.citation_count = 42;
        store.upsert(&paper).await.unwrap();

        assert_eq!(store.paper_count().await, 1);
        let stored = store.find_by_id(&paper.id).await.unwrap().unwrap();
        assert_eq!(stored.citation_count, 42);
    }
}
