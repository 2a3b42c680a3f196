use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{CrawlSession, SessionStatus};
use crate::store::{PaperStore, StoreError};

/// Owns the [`CrawlSession`] of one run. `complete` and `fail` consume the tracker,
/// so a finished session cannot be modified again.
pub struct SessionTracker {
    store: Arc<dyn PaperStore>,
    session: CrawlSession,
}

impl SessionTracker {
    /// Create a `running` session for the query and persist it.
    pub async fn start(store: Arc<dyn PaperStore>, query_id: &str) -> Result<Self, StoreError> {
        let session = CrawlSession {
            id: Uuid::new_v4().to_string(),
            query_id: query_id.to_string(),
            status: SessionStatus::Running,
            papers_found: 0,
            papers_analyzed: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        store.save_session(&session).await?;
        tracing::info!(session = %session.id, query = query_id, "Crawl session started");
        Ok(Self { store, session })
    }

    pub fn session(&self) -> &CrawlSession {
        &self.session
    }

    /// Note a non-fatal problem. It is persisted with the next checkpoint.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.session.errors.push(message.into());
    }

    pub fn set_papers_found(&mut self, count: u32) {
        self.session.papers_found = count;
    }

    pub fn add_analyzed(&mut self) {
        self.session.papers_analyzed += 1;
    }

    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        self.store.save_session(&self.session).await
    }

    /// Mark the session completed. If that cannot be persisted the session is marked
    /// failed instead (best effort) and the store error is returned.
    pub async fn complete(mut self) -> Result<CrawlSession, StoreError> {
        if let Err(e) = self.close(SessionStatus::Completed).await {
            self.session
                .errors
                .push(format!("failed to record completion: {}", e));
            if let Err(again) = self.close(SessionStatus::Failed).await {
                tracing::warn!(session = %self.session.id, "Failed to record session failure: {}", again);
            }
            return Err(e);
        }
        Ok(self.session)
    }

    /// Record the error that ended the run and mark the session failed.
    pub async fn fail(mut self, error: impl Into<String>) -> Result<CrawlSession, StoreError> {
        self.session.errors.push(error.into());
        self.close(SessionStatus::Failed).await?;
        Ok(self.session)
    }

    async fn close(&mut self, status: SessionStatus) -> Result<(), StoreError> {
        self.session.status = status;
        self.session.completed_at = Some(Utc::now());
        self.store.save_session(&self.session).await?;
        tracing::info!(
            session = %self.session.id,
            status = ?status,
            papers_found = self.session.papers_found,
            papers_analyzed = self.session.papers_analyzed,
            errors = self.session.errors.len(),
            "Crawl session finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::testing::FailingStore;

    #[tokio::test]
    async fn test_lifecycle_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let mut tracker = SessionTracker::start(store.clone(), "q").await.unwrap();
        let persisted = store.session_for_query("q").await.unwrap().unwrap();
        assert_eq!(persisted.status, SessionStatus::Running);

        tracker.set_papers_found(3);
        tracker.record_error("crossref: request timed out");
        tracker.checkpoint().await.unwrap();
        assert_eq!(store.session_for_query("q").await.unwrap().unwrap().papers_found, 3);

        let done = tracker.complete().await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.errors.len(), 1);
        assert_eq!(store.session_for_query("q").await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let store = Arc::new(MemoryStore::new());
        let tracker = SessionTracker::start(store.clone(), "q").await.unwrap();
        let failed = tracker.fail("store unavailable").await.unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(failed.status.is_terminal());
        assert_eq!(failed.errors, vec!["store unavailable"]);
    }

    #[tokio::test]
    async fn test_unrecorded_completion_falls_back_to_failed() {
        // Second session write (the completion) fails, the third succeeds.
        let store = Arc::new(FailingStore::failing_session_save(2));
        let tracker = SessionTracker::start(store.clone(), "q").await.unwrap();

        let err = tracker.complete().await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
        let persisted = store.session_for_query("q").await.unwrap().unwrap();
        assert_eq!(persisted.status, SessionStatus::Failed);
        assert!(persisted.completed_at.is_some());
        assert!(persisted.errors[0].starts_with("failed to record completion"));
    }
}
