pub mod arxiv;
pub mod crossref;
pub mod openalex;
pub mod ratelimit;
pub mod semantic_scholar;
#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::models::{ExternalId, Paper, SearchFilters};

/// One page of mapped search results plus the provider's reported match count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchPage {
    pub papers: Vec<Paper>,
    pub total_results: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{provider}: HTTP request failed: {source}")]
    Http {
        provider: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{provider}: request timed out")]
    Timeout { provider: &'static str },
    #[error("{provider}: rate limited (retry after {retry_after:?})")]
    RateLimited {
        provider: &'static str,
        retry_after: Duration,
    },
    #[error("{provider}: API error ({status}): {message}")]
    Api {
        provider: &'static str,
        status: u16,
        message: String,
    },
    #[error("{provider}: parse error: {message}")]
    Parse {
        provider: &'static str,
        message: String,
    },
    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },
}

impl SourceError {
    pub fn provider(&self) -> &'static str {
        match self {
            SourceError::Http { provider, .. }
            | SourceError::Timeout { provider }
            | SourceError::RateLimited { provider, .. }
            | SourceError::Api { provider, .. }
            | SourceError::Parse { provider, .. }
            | SourceError::Unsupported { provider, .. } => provider,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, SourceError::Unsupported { .. })
    }

    pub(crate) fn http(provider: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SourceError::Timeout { provider }
        } else if err.is_decode() {
            SourceError::Parse {
                provider,
                message: err.to_string(),
            }
        } else {
            SourceError::Http {
                provider,
                source: err,
            }
        }
    }
}

/// A bibliographic provider normalized into the canonical [`Paper`] shape.
///
/// Capabilities a provider lacks report [`SourceError::Unsupported`].
#[async_trait]
pub trait PaperSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `get_by_external_id` understands this identifier format.
    fn resolves(&self, id: &ExternalId) -> bool;

    async fn search(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
        max_results: u32,
    ) -> Result<SearchPage, SourceError>;

    async fn get_by_external_id(&self, _id: &ExternalId) -> Result<Option<Paper>, SourceError> {
        Err(SourceError::Unsupported {
            provider: self.name(),
            capability: "lookup by external id",
        })
    }

    async fn get_references(&self, _id: &ExternalId) -> Result<Vec<Paper>, SourceError> {
        Err(SourceError::Unsupported {
            provider: self.name(),
            capability: "reference listing",
        })
    }
}

/// Keywords trimmed, blanks dropped, joined by single spaces.
pub(crate) fn keyword_text(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeSource, SearchBehavior};
    use super::*;

    #[test]
    fn test_keyword_text() {
        let keywords = vec![" quantum ".to_string(), "".into(), "error correction".into()];
        assert_eq!(keyword_text(&keywords), "quantum error correction");
    }

    #[tokio::test]
    async fn test_default_capabilities_are_unsupported() {
        let source = FakeSource::new("fake", SearchBehavior::Fail);
        let err = source
            .get_references(&ExternalId::Doi("10.1/x".into()))
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(err.provider(), "fake");
        assert_eq!(SourceError::Timeout { provider: "crossref" }.provider(), "crossref");
    }
}
