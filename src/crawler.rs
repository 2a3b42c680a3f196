use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::apis::PaperSource;
use crate::dedup::{dedup_papers, Reconciler};
use crate::models::{CrawlSession, QueryStatus, SearchQuery};
use crate::references::{ExplorerLimits, ReferenceExplorer};
use crate::screening::{ResearchContext, ScreeningGate};
use crate::search::fan_out_search;
use crate::session::SessionTracker;
use crate::store::{PaperStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("query has no usable keywords")]
    InvalidQuery,
    #[error("crawl was cancelled")]
    Cancelled,
    #[error("persistence failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    /// Upper bound on a query's own `max_results`.
    pub max_results: u32,
    pub source_timeout: Duration,
    pub limits: ExplorerLimits,
    /// Run screening and analysis when a classifier is attached.
    pub analyze: bool,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            max_results: 200,
            source_timeout: Duration::from_secs(30),
            limits: ExplorerLimits::default(),
            analyze: true,
        }
    }
}

/// Runs queries end to end: search, merge, persist, expand references, screen.
pub struct Crawler {
    sources: Vec<Arc<dyn PaperSource>>,
    store: Arc<dyn PaperStore>,
    reconciler: Reconciler,
    gate: Option<ScreeningGate>,
    options: CrawlOptions,
}

impl Crawler {
    pub fn new(
        sources: Vec<Arc<dyn PaperSource>>,
        store: Arc<dyn PaperStore>,
        options: CrawlOptions,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            sources,
            store,
            gate: None,
            options,
        }
    }

    pub fn with_screening(mut self, gate: ScreeningGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn store(&self) -> &Arc<dyn PaperStore> {
        &self.store
    }

    pub fn sources(&self) -> &[Arc<dyn PaperSource>] {
        &self.sources
    }

    /// Execute one run of `query` and return its finished session.
    ///
    /// Source failures are recorded on the session and tolerated. Anything else (store
    /// failures, cancellation, an unusable query) fails the session and the query, and is
    /// returned to the caller.
    pub async fn run(
        &self,
        mut query: SearchQuery,
        cancel: &CancellationToken,
    ) -> Result<CrawlSession, CrawlError> {
        query.max_results = query.max_results.min(self.options.max_results);
        query.set_status(QueryStatus::Running);
        self.store.save_query(&query).await?;
        let mut tracker = match SessionTracker::start(self.store.clone(), &query.id).await {
            Ok(tracker) => tracker,
            Err(e) => {
                self.mark_failed(&mut query).await;
                return Err(e.into());
            }
        };

        let outcome = match self.execute(&query, &mut tracker, cancel).await {
            Ok(()) => {
                query.paper_count = tracker.session().papers_found;
                query.set_status(QueryStatus::Completed);
                self.store.save_query(&query).await.map_err(CrawlError::from)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => match tracker.complete().await {
                Ok(session) => Ok(session),
                Err(e) => {
                    // The tracker has already fallen back to a failed session.
                    tracing::error!(query = %query.id, "Crawl could not be recorded: {}", e);
                    self.mark_failed(&mut query).await;
                    Err(e.into())
                }
            },
            Err(e) => {
                tracing::error!(query = %query.id, "Crawl failed: {}", e);
                query.paper_count = tracker.session().papers_found;
                self.mark_failed(&mut query).await;
                if let Err(save) = tracker.fail(e.to_string()).await {
                    tracing::warn!("Failed to record session failure: {}", save);
                }
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, query: &mut SearchQuery) {
        query.set_status(QueryStatus::Failed);
        if let Err(save) = self.store.save_query(query).await {
            tracing::warn!("Failed to record query failure: {}", save);
        }
    }

    async fn execute(
        &self,
        query: &SearchQuery,
        tracker: &mut SessionTracker,
        cancel: &CancellationToken,
    ) -> Result<(), CrawlError> {
        if !query.has_keywords() {
            return Err(CrawlError::InvalidQuery);
        }

        let found =
            fan_out_search(&self.sources, query, self.options.source_timeout, cancel).await;
        if cancel.is_cancelled() {
            return Err(CrawlError::Cancelled);
        }
        for failure in &found.failures {
            tracker.record_error(format!("{}: {}", failure.source, failure.message));
        }
        let merged = dedup_papers(found.papers);
        tracing::info!(
            query = %query.id,
            papers = merged.len(),
            reported_total = found.reported_totals.iter().map(|(_, t)| t).sum::<u64>(),
            failed_sources = found.failures.len(),
            "Search phase finished"
        );

        let mut seeds = Vec::with_capacity(merged.len());
        for paper in merged {
            let stored = self.reconciler.reconcile(paper).await?;
            if self.store.link_to_query(&stored.id, &query.id, 0).await? {
                seeds.push(stored);
            }
        }
        self.refresh_found(query, tracker).await?;

        if query.include_references && query.max_reference_depth > 0 {
            let explorer = ReferenceExplorer::new(
                &self.sources,
                self.store.as_ref(),
                &self.reconciler,
                self.options.limits.clone(),
            );
            let report = explorer
                .explore(&query.id, seeds, query.max_reference_depth, cancel)
                .await?;
            tracing::info!(
                query = %query.id,
                levels = report.levels.len(),
                new_papers = report.new_papers(),
                "Reference expansion finished"
            );
            self.refresh_found(query, tracker).await?;
        }

        if let Some(gate) = self.gate.as_ref().filter(|_| self.options.analyze) {
            self.screen_and_analyze(gate, query, tracker, cancel).await?;
        }
        Ok(())
    }

    async fn screen_and_analyze(
        &self,
        gate: &ScreeningGate,
        query: &SearchQuery,
        tracker: &mut SessionTracker,
        cancel: &CancellationToken,
    ) -> Result<(), CrawlError> {
        let context = ResearchContext::from_query(query);
        for mut paper in self.store.list_for_query(&query.id).await? {
            if cancel.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            if paper.analysis.is_some() {
                continue;
            }
            let decision = gate.screen(&paper, &context).await;
            if !decision.should_analyze {
                tracing::debug!(id = %paper.id, reason = %decision.reason, "Screened out");
                continue;
            }
            paper.analysis = Some(gate.analyze(&paper, &context).await);
            paper.updated_at = Utc::now();
            self.store.upsert(&paper).await?;
            tracker.add_analyzed();
        }
        tracker.checkpoint().await?;
        Ok(())
    }

    async fn refresh_found(
        &self,
        query: &SearchQuery,
        tracker: &mut SessionTracker,
    ) -> Result<(), CrawlError> {
        let linked = self.store.list_links(&query.id).await?.len();
        tracker.set_papers_found(linked as u32);
        tracker.checkpoint().await?;
        Ok(())
    }
}
