use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::apis::{PaperSource, SourceError};
use crate::models::{Paper, SearchQuery};

/// A source that contributed nothing because its call failed.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct FanOutResult {
    /// Concatenated results in source order. Duplicates are expected.
    pub papers: Vec<Paper>,
    pub failures: Vec<SourceFailure>,
    /// Total match counts as reported by each source that answered.
    pub reported_totals: Vec<(String, u64)>,
}

/// Per-source cap: the global cap split evenly, rounded up.
pub fn per_source_cap(max_results: u32, sources: usize) -> u32 {
    if sources == 0 {
        return max_results;
    }
    max_results.div_ceil(sources as u32).max(1)
}

/// Query every source in parallel and combine whatever succeeds.
///
/// Results are combined in the order of `sources`, not completion order. A failing or
/// timed-out source contributes nothing and is reported in `failures`.
pub async fn fan_out_search(
    sources: &[Arc<dyn PaperSource>],
    query: &SearchQuery,
    source_timeout: Duration,
    cancel: &CancellationToken,
) -> FanOutResult {
    let mut result = FanOutResult::default();
    if sources.is_empty() {
        return result;
    }

    let per_source = per_source_cap(query.max_results, sources.len());
    let mut handles = sources
        .iter()
        .map(|source| {
            let source = Arc::clone(source);
            let name = source.name();
            let keywords = query.keywords.clone();
            let filters = query.filters.clone();
            let handle = tokio::spawn(async move {
                let call = source.search(&keywords, &filters, per_source);
                match tokio::time::timeout(source_timeout, call).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(SourceError::Timeout {
                        provider: source.name(),
                    }),
                }
            });
            (name, handle)
        })
        .collect::<Vec<_>>()
        .into_iter();

    while let Some((name, handle)) = handles.next() {
        let abort = handle.abort_handle();
        let joined = tokio::select! {
            joined = handle => joined,
            _ = cancel.cancelled() => {
                abort.abort();
                for (_, rest) in handles.by_ref() {
                    rest.abort();
                }
                tracing::info!("Fan-out search cancelled");
                break;
            }
        };

        match joined {
            Ok(Ok(page)) => {
                let fetched = page.papers.len();
                let admitted: Vec<Paper> = page
                    .papers
                    .into_iter()
                    .filter(|p| query.filters.admits(p))
                    .collect();
                tracing::debug!(
                    source = name,
                    fetched,
                    admitted = admitted.len(),
                    total = ?page.total_results,
                    "Source search finished"
                );
                if let Some(total) = page.total_results {
                    result.reported_totals.push((name.to_string(), total));
                }
                result.papers.extend(admitted);
            }
            Ok(Err(e)) if e.is_unsupported() => {
                tracing::debug!(source = name, "Source does not support search");
            }
            Ok(Err(e)) => {
                tracing::warn!(source = e.provider(), "Source search failed: {}", e);
                result.failures.push(SourceFailure {
                    source: name.to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                tracing::warn!("Source task panicked: {}", e);
                result.failures.push(SourceFailure {
                    source: name.to_string(),
                    message: format!("task failed: {}", e),
                });
            }
        }
    }

    result
}
