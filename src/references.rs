use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::apis::PaperSource;
use crate::crawler::CrawlError;
use crate::dedup::{dedup_papers, Reconciler};
use crate::models::{ExternalId, IdentityKey, Paper};
use crate::store::PaperStore;

/// Bounds on the reference walk.
#[derive(Debug, Clone)]
pub struct ExplorerLimits {
    /// References taken from each frontier paper.
    pub per_paper: usize,
    /// Candidates fetched per level, across all frontier papers.
    pub per_level: usize,
    /// Pause between consecutive fetches within a level.
    pub request_delay: Duration,
}

impl Default for ExplorerLimits {
    fn default() -> Self {
        Self {
            per_paper: 10,
            per_level: 50,
            request_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelReport {
    pub depth: u32,
    pub candidates: usize,
    pub fetched: usize,
    pub new_papers: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExplorationReport {
    pub levels: Vec<LevelReport>,
}

impl ExplorationReport {
    pub fn new_papers(&self) -> usize {
        self.levels.iter().map(|l| l.new_papers).sum()
    }
}

/// Breadth-first expansion of a query's papers along their references.
pub struct ReferenceExplorer<'a> {
    sources: &'a [Arc<dyn PaperSource>],
    store: &'a dyn PaperStore,
    reconciler: &'a Reconciler,
    limits: ExplorerLimits,
}

/// Identities and DOIs of everything already linked to the query.
#[derive(Default)]
struct Known {
    identities: HashSet<IdentityKey>,
    dois: HashSet<String>,
}

impl Known {
    fn insert(&mut self, paper: &Paper) {
        self.identities.insert(paper.identity().clone());
        if let Some(doi) = paper.doi_key() {
            self.dois.insert(doi);
        }
    }

    fn contains(&self, paper: &Paper) -> bool {
        self.identities.contains(paper.identity())
            || paper.doi_key().is_some_and(|d| self.dois.contains(&d))
    }
}

impl<'a> ReferenceExplorer<'a> {
    pub fn new(
        sources: &'a [Arc<dyn PaperSource>],
        store: &'a dyn PaperStore,
        reconciler: &'a Reconciler,
        limits: ExplorerLimits,
    ) -> Self {
        Self {
            sources,
            store,
            reconciler,
            limits,
        }
    }

    /// Walk outward from `seeds` (the depth-0 papers) for at most `max_depth` levels.
    ///
    /// Each level stops the walk early if it discovers nothing new. Papers already linked
    /// to the query are never fetched or linked again, which also terminates cycles.
    pub async fn explore(
        &self,
        query_id: &str,
        seeds: Vec<Paper>,
        max_depth: u32,
        cancel: &CancellationToken,
    ) -> Result<ExplorationReport, CrawlError> {
        let mut known = Known::default();
        for paper in self.store.list_for_query(query_id).await? {
            known.insert(&paper);
        }

        let mut report = ExplorationReport::default();
        let mut frontier = seeds;
        let mut depth = 1;
        while depth <= max_depth && !frontier.is_empty() {
            let candidates = self.candidates(&frontier, &known);
            tracing::info!(depth, candidates = candidates.len(), "Exploring reference level");

            let mut fetched = Vec::new();
            for (i, id) in candidates.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(CrawlError::Cancelled);
                }
                if i > 0 && !self.limits.request_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.limits.request_delay) => {}
                        _ = cancel.cancelled() => return Err(CrawlError::Cancelled),
                    }
                }
                if let Some(paper) = self.resolve(id).await {
                    fetched.push(paper);
                }
            }

            let mut level = LevelReport {
                depth,
                candidates: candidates.len(),
                fetched: fetched.len(),
                new_papers: 0,
            };
            let mut discovered = Vec::new();
            for paper in dedup_papers(fetched) {
                if known.contains(&paper) {
                    continue;
                }
                let stored = self.reconciler.reconcile(paper).await?;
                if self.store.link_to_query(&stored.id, query_id, depth).await? {
                    known.insert(&stored);
                    discovered.push(stored);
                } else {
                    tracing::debug!(id = %stored.id, "Reference already linked to query");
                }
            }
            level.new_papers = discovered.len();
            report.levels.push(level);

            frontier = discovered;
            depth += 1;
        }
        Ok(report)
    }

    /// Up to `per_paper` references from each frontier paper, in frontier order, capped at
    /// `per_level`. Unresolvable ids and DOIs already known to the query are skipped.
    fn candidates(&self, frontier: &[Paper], known: &Known) -> Vec<ExternalId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for raw in frontier
            .iter()
            .flat_map(|p| p.references.iter().take(self.limits.per_paper))
        {
            let Some(id) = ExternalId::classify(raw) else {
                tracing::debug!(reference = %raw, "Skipping unresolvable reference id");
                continue;
            };
            if let ExternalId::Doi(doi) = &id {
                if known.dois.contains(&doi.to_lowercase()) {
                    continue;
                }
            }
            let dedup_key = match &id {
                ExternalId::Doi(doi) => ExternalId::Doi(doi.to_lowercase()),
                other => other.clone(),
            };
            if seen.insert(dedup_key) {
                out.push(id);
                if out.len() >= self.limits.per_level {
                    break;
                }
            }
        }
        out
    }

    /// Fetch a candidate from the first source that can resolve it. Sources that report
    /// the lookup as unsupported are skipped; misses and errors drop the candidate.
    async fn resolve(&self, id: &ExternalId) -> Option<Paper> {
        for source in self.sources.iter().filter(|s| s.resolves(id)) {
            match source.get_by_external_id(id).await {
                Ok(Some(paper)) => return Some(paper),
                Ok(None) => {
                    tracing::debug!(source = source.name(), %id, "Reference not found");
                    return None;
                }
                Err(e) if e.is_unsupported() => continue,
                Err(e) => {
                    tracing::debug!(source = e.provider(), %id, "Dropping reference: {}", e);
                    return None;
                }
            }
        }
        tracing::debug!(%id, "No source resolves reference");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::testing::{FakeSource, SearchBehavior};
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::Ordering;

    fn cited(title: &str, doi: &str, refs: &[&str]) -> Paper {
        let mut p = Paper::new("fake", title, Some(doi)).unwrap();
        for r in refs {
            p.add_reference(*r);
        }
        p
    }

    fn limits() -> ExplorerLimits {
        ExplorerLimits {
            request_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn seed(store: &MemoryStore, reconciler: &Reconciler, paper: Paper, query: &str) -> Paper {
        let stored = reconciler.reconcile(paper).await.unwrap();
        assert!(store.link_to_query(&stored.id, query, 0).await.unwrap());
        stored
    }

    #[tokio::test]
    async fn test_citation_cycle_terminates() {
        let x = cited("Paper X", "10.1/x", &["10.1/y"]);
        let y = cited("Paper Y", "10.1/y", &["10.1/X"]);
        let source = Arc::new(
            FakeSource::new("fake", SearchBehavior::Unsupported)
                .with_lookup("10.1/y", y)
                .with_lookup("10.1/x", x.clone()),
        );
        let sources: Vec<Arc<dyn PaperSource>> = vec![source.clone()];
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let seeded = seed(&store, &reconciler, x, "q").await;

        let explorer = ReferenceExplorer::new(&sources, store.as_ref(), &reconciler, limits());
        let report = explorer
            .explore("q", vec![seeded], 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.levels.len(), 2);
        assert_eq!(report.levels[0].new_papers, 1);
        assert_eq!(report.levels[1].new_papers, 0);
        // X is known, so depth 2 never fetches it.
        assert_eq!(source.lookup_calls.load(Ordering::SeqCst), 1);

        let links = store.list_links("q").await.unwrap();
        assert_eq!(links.iter().map(|l| l.depth).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_depth_cap_is_honored() {
        let a = cited("A", "10.1/a", &["10.1/b"]);
        let b = cited("B", "10.1/b", &["10.1/c"]);
        let c = cited("C", "10.1/c", &["10.1/d"]);
        let d = cited("D", "10.1/d", &[]);
        let sources: Vec<Arc<dyn PaperSource>> = vec![Arc::new(
            FakeSource::new("fake", SearchBehavior::Unsupported)
                .with_lookup("10.1/b", b)
                .with_lookup("10.1/c", c)
                .with_lookup("10.1/d", d),
        )];
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let seeded = seed(&store, &reconciler, a, "q").await;

        let explorer = ReferenceExplorer::new(&sources, store.as_ref(), &reconciler, limits());
        let report = explorer
            .explore("q", vec![seeded], 2, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.new_papers(), 2);
        let links = store.list_links("q").await.unwrap();
        assert!(links.iter().all(|l| l.depth <= 2));
        assert_eq!(links.len(), 3);
    }

    #[tokio::test]
    async fn test_candidate_caps() {
        let refs: Vec<String> = (0..15).map(|i| format!("10.1/r{}", i)).collect();
        let refs: Vec<&str> = refs.iter().map(String::as_str).collect();
        let frontier: Vec<Paper> = (0..8)
            .map(|i| cited(&format!("Seed {}", i), &format!("10.2/s{}", i), &refs))
            .collect();

        let sources: Vec<Arc<dyn PaperSource>> = Vec::new();
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let explorer = ReferenceExplorer::new(&sources, store.as_ref(), &reconciler, limits());

        // Every seed cites the same 15 works: only the first 10 of each are taken.
        let candidates = explorer.candidates(&frontier, &Known::default());
        assert_eq!(candidates.len(), 10);

        let distinct: Vec<Paper> = (0..8)
            .map(|i| {
                let refs: Vec<String> = (0..15).map(|j| format!("10.3/{}-{}", i, j)).collect();
                let refs: Vec<&str> = refs.iter().map(String::as_str).collect();
                cited(&format!("Other {}", i), &format!("10.4/o{}", i), &refs)
            })
            .collect();
        let candidates = explorer.candidates(&distinct, &Known::default());
        assert_eq!(candidates.len(), 50);
        assert_eq!(candidates[0], ExternalId::Doi("10.3/0-0".into()));
    }

    #[tokio::test]
    async fn test_unresolvable_and_failed_references_are_dropped() {
        let seed_paper = cited("Seed", "10.1/seed", &["not-an-id", "10.1/missing", "arxiv:2101.00001"]);
        let sources: Vec<Arc<dyn PaperSource>> =
            vec![Arc::new(FakeSource::new("fake", SearchBehavior::Unsupported))];
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let seeded = seed(&store, &reconciler, seed_paper, "q").await;

        let explorer = ReferenceExplorer::new(&sources, store.as_ref(), &reconciler, limits());
        let report = explorer
            .explore("q", vec![seeded], 3, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.levels.len(), 1);
        assert_eq!(report.levels[0].candidates, 2);
        assert_eq!(report.levels[0].fetched, 0);
    }

    #[tokio::test]
    async fn test_cancelled_walk_returns_error() {
        let seed_paper = cited("Seed", "10.1/seed", &["10.1/a"]);
        let sources: Vec<Arc<dyn PaperSource>> =
            vec![Arc::new(FakeSource::new("fake", SearchBehavior::Unsupported))];
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let explorer = ReferenceExplorer::new(&sources, store.as_ref(), &reconciler, limits());
        let err = explorer
            .explore("q", vec![seed_paper], 1, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Cancelled));
    }
}
