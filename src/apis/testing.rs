use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{PaperSource, SearchPage, SourceError};
use crate::models::{ExternalId, Paper, SearchFilters};

pub enum SearchBehavior {
    Papers(Vec<Paper>),
    Fail,
    Unsupported,
    Hang,
    Panic,
}

/// Scripted source for engine tests.
pub struct FakeSource {
    name: &'static str,
    behavior: SearchBehavior,
    delay: Duration,
    lookups: HashMap<String, Paper>,
    pub requested_max: AtomicU32,
    pub lookup_calls: AtomicU32,
}

impl FakeSource {
    pub fn new(name: &'static str, behavior: SearchBehavior) -> Self {
        Self {
            name,
            behavior,
            delay: Duration::ZERO,
            lookups: HashMap::new(),
            requested_max: AtomicU32::new(0),
            lookup_calls: AtomicU32::new(0),
        }
    }

    pub fn returning(name: &'static str, papers: Vec<Paper>) -> Self {
        Self::new(name, SearchBehavior::Papers(papers))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve `paper` when looked up by `id` (compared case-insensitively).
    pub fn with_lookup(mut self, id: &str, paper: Paper) -> Self {
        self.lookups.insert(id.to_lowercase(), paper);
        self
    }
}

#[async_trait]
impl PaperSource for FakeSource {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolves(&self, id: &ExternalId) -> bool {
        !matches!(id, ExternalId::Arxiv(_))
    }

    async fn search(
        &self,
        _keywords: &[String],
        _filters: &SearchFilters,
        max_results: u32,
    ) -> Result<SearchPage, SourceError> {
        self.requested_max.store(max_results, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.behavior {
            SearchBehavior::Papers(papers) => Ok(SearchPage {
                papers: papers.clone(),
                total_results: Some(papers.len() as u64),
            }),
            SearchBehavior::Fail => Err(SourceError::Api {
                provider: self.name,
                status: 503,
                message: "unavailable".into(),
            }),
            SearchBehavior::Unsupported => Err(SourceError::Unsupported {
                provider: self.name,
                capability: "search",
            }),
            SearchBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(SearchPage::default())
            }
            SearchBehavior::Panic => panic!("{} exploded", self.name),
        }
    }

    async fn get_by_external_id(&self, id: &ExternalId) -> Result<Option<Paper>, SourceError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.lookups.get(&id.value().to_lowercase()).cloned())
    }
}
