use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Deduplication key of a paper: the case-folded DOI when known, else the normalized title.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum IdentityKey {
    Doi(String),
    Title(String),
}

impl IdentityKey {
    /// Compute the key for a DOI/title pair. `None` when neither yields anything usable.
    pub fn derive(doi: Option<&str>, title: &str) -> Option<Self> {
        if let Some(doi) = doi.map(normalize_doi).filter(|d| !d.is_empty()) {
            return Some(IdentityKey::Doi(doi.to_lowercase()));
        }
        let normalized = normalize_title(title);
        if normalized.is_empty() {
            None
        } else {
            Some(IdentityKey::Title(normalized))
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Doi(doi) => write!(f, "doi:{}", doi),
            IdentityKey::Title(title) => write!(f, "title:{}", title),
        }
    }
}

/// Lower-case, drop punctuation, collapse whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip resolver URL and `doi:` prefixes. Case is preserved.
pub fn normalize_doi(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if lower.starts_with(prefix) {
            return trimmed[prefix.len()..].trim().to_string();
        }
    }
    trimmed.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub affiliation: Option<String>,
    pub orcid: Option<String>,
}

impl Author {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            affiliation: None,
            orcid: None,
        }
    }
}

/// Canonical record for one academic work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paper {
    pub id: String,
    identity: IdentityKey,
    pub doi: Option<String>,
    pub title: String,
    /// Source name -> identifier within that source. Entries are never overwritten.
    pub external_ids: BTreeMap<String, String>,
    pub authors: Vec<Author>,
    pub abstract_text: Option<String>,
    pub keywords: BTreeSet<String>,
    pub publication_date: Option<NaiveDate>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub pages: Option<String>,
    pub publisher: Option<String>,
    pub citation_count: u32,
    pub reference_count: u32,
    pub influential_citation_count: Option<u32>,
    pub pdf_url: Option<String>,
    pub open_access_url: Option<String>,
    pub publisher_url: Option<String>,
    /// Identifiers of cited works, in first-seen order, without duplicates.
    pub references: Vec<String>,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub analysis: Option<PaperAnalysis>,
}

impl Paper {
    /// Create a paper from the minimum a source must provide. Returns `None` when
    /// neither the DOI nor the title produce an identity key.
    pub fn new(source: &str, title: impl Into<String>, doi: Option<&str>) -> Option<Self> {
        let title = title.into().split_whitespace().collect::<Vec<_>>().join(" ");
        let doi = doi.map(normalize_doi).filter(|d| !d.is_empty());
        let identity = IdentityKey::derive(doi.as_deref(), &title)?;
        let now = Utc::now();
        Some(Self {
            id: Uuid::new_v4().to_string(),
            identity,
            doi,
            title,
            external_ids: BTreeMap::new(),
            authors: Vec::new(),
            abstract_text: None,
            keywords: BTreeSet::new(),
            publication_date: None,
            year: None,
            venue: None,
            volume: None,
            issue: None,
            pages: None,
            publisher: None,
            citation_count: 0,
            reference_count: 0,
            influential_citation_count: None,
            pdf_url: None,
            open_access_url: None,
            publisher_url: None,
            references: Vec::new(),
            source: source.to_string(),
            discovered_at: now,
            updated_at: now,
            analysis: None,
        })
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    /// Record an identifier under `source` unless one is already present.
    pub fn add_external_id(&mut self, source: &str, id: impl Into<String>) {
        let id = id.into();
        if id.trim().is_empty() {
            return;
        }
        self.external_ids.entry(source.to_string()).or_insert(id);
    }

    /// Append a reference identifier, keeping the list free of duplicates.
    pub fn add_reference(&mut self, id: impl Into<String>) {
        let id = id.into();
        let id = id.trim();
        if !id.is_empty() && !self.references.iter().any(|r| r == id) {
            self.references.push(id.to_string());
        }
    }

    /// Set the publication date and keep `year` in step with it.
    pub fn set_publication_date(&mut self, date: NaiveDate) {
        self.publication_date = Some(date);
        self.year = Some(date.year());
    }

    /// Case-folded DOI, used for store lookups.
    pub fn doi_key(&self) -> Option<String> {
        self.doi.as_ref().map(|d| d.to_lowercase())
    }
}

/// Parse the partial dates providers return ("2021", "2021-05", "2021-05-17").
pub fn parse_partial_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let date_part = raw.get(..10).unwrap_or(raw);
    if let Ok(d) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        return Some(d);
    }
    let mut parts = raw.split('-');
    let year: i32 = parts.next()?.get(..4)?.parse().ok()?;
    let month: u32 = parts.next().and_then(|m| m.parse().ok()).unwrap_or(1);
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Identifier formats the sources can resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExternalId {
    Doi(String),
    SemanticScholar(String),
    OpenAlex(String),
    Arxiv(String),
}

impl ExternalId {
    /// Classify a raw reference identifier. `None` means it cannot be resolved.
    pub fn classify(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix("https://openalex.org/") {
            return Self::classify_openalex(rest);
        }
        if let Some(rest) = raw.strip_prefix("arxiv:") {
            return Some(ExternalId::Arxiv(rest.to_string()));
        }
        let doi = normalize_doi(raw);
        if doi.starts_with("10.") || doi.contains('/') {
            return Some(ExternalId::Doi(doi));
        }
        if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(ExternalId::SemanticScholar(raw.to_lowercase()));
        }
        Self::classify_openalex(raw)
    }

    fn classify_openalex(raw: &str) -> Option<Self> {
        let digits = raw.strip_prefix('W').or_else(|| raw.strip_prefix('w'))?;
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            Some(ExternalId::OpenAlex(format!("W{}", digits)))
        } else {
            None
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ExternalId::Doi(v)
            | ExternalId::SemanticScholar(v)
            | ExternalId::OpenAlex(v)
            | ExternalId::Arxiv(v) => v,
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::Doi(v) => write!(f, "doi:{}", v),
            ExternalId::SemanticScholar(v) => write!(f, "s2:{}", v),
            ExternalId::OpenAlex(v) => write!(f, "openalex:{}", v),
            ExternalId::Arxiv(v) => write!(f, "arxiv:{}", v),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub field: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub min_citations: Option<u32>,
}

impl SearchFilters {
    /// Whether a mapped paper satisfies the filters. Undated papers pass date bounds.
    pub fn admits(&self, paper: &Paper) -> bool {
        if let Some(min) = self.min_citations {
            if paper.citation_count < min {
                return false;
            }
        }
        let date = paper
            .publication_date
            .or_else(|| paper.year.and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)));
        if let (Some(from), Some(date)) = (self.date_from, date) {
            // A bare year is admitted if any part of it falls in range.
            let end = if paper.publication_date.is_some() {
                date
            } else {
                NaiveDate::from_ymd_opt(date.year(), 12, 31).unwrap_or(date)
            };
            if end < from {
                return false;
            }
        }
        if let (Some(to), Some(date)) = (self.date_to, date) {
            if date > to {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A research request as submitted by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub id: String,
    pub keywords: Vec<String>,
    pub filters: SearchFilters,
    pub include_references: bool,
    pub max_reference_depth: u32,
    /// Global cap on initial search results, split across sources.
    pub max_results: u32,
    pub status: QueryStatus,
    pub paper_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchQuery {
    pub fn new(keywords: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            keywords,
            filters: SearchFilters::default(),
            include_references: false,
            max_reference_depth: 1,
            max_results: 50,
            status: QueryStatus::Pending,
            paper_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_references(mut self, max_depth: u32) -> Self {
        self.include_references = true;
        self.max_reference_depth = max_depth;
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn has_keywords(&self) -> bool {
        self.keywords.iter().any(|k| !k.trim().is_empty())
    }

    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// One execution of a [`SearchQuery`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: String,
    pub query_id: String,
    pub status: SessionStatus,
    pub papers_found: u32,
    pub papers_analyzed: u32,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperQueryLink {
    pub paper_id: String,
    pub query_id: String,
    /// BFS level at which the paper was first discovered for the query.
    pub depth: u32,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperAnalysis {
    pub reading_decision: bool,
    pub reading_reason: String,
    pub relevance_score: f32,
    pub abstract_summary: Option<String>,
    pub key_findings: Vec<String>,
    pub methodology: Option<String>,
    pub limitations: Vec<String>,
    pub analyzed_at: DateTime<Utc>,
}

impl PaperAnalysis {
    /// Default used when the analysis reply is missing or unusable.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            reading_decision: true,
            reading_reason: reason.into(),
            relevance_score: 0.0,
            abstract_summary: None,
            key_findings: Vec::new(),
            methodology: None,
            limitations: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_normalization_ignores_case_and_punctuation() {
        assert_eq!(
            normalize_title("Deep Learning, 2020!"),
            normalize_title("deep learning 2020")
        );
        assert_eq!(normalize_title("  A   spaced\ttitle "), "a spaced title");
    }

    #[test]
    fn test_identity_prefers_doi() {
        let key = IdentityKey::derive(Some("https://doi.org/10.1/ABC"), "Anything").unwrap();
        assert_eq!(key, IdentityKey::Doi("10.1/abc".to_string()));
        assert_eq!(key.to_string(), "doi:10.1/abc");

        let key = IdentityKey::derive(None, "Deep Learning, 2020!").unwrap();
        assert_eq!(key, IdentityKey::Title("deep learning 2020".to_string()));

        assert!(IdentityKey::derive(Some("  "), "?!").is_none());
    }

    #[test]
    fn test_paper_identity_survives_doi_fill() {
        let mut paper = Paper::new("test", "Some Title", None).unwrap();
        paper.doi = Some("10.5/xyz".to_string());
        assert_eq!(paper.identity(), &IdentityKey::Title("some title".to_string()));
        assert_eq!(paper.doi_key().as_deref(), Some("10.5/xyz"));
    }

    #[test]
    fn test_external_id_classification() {
        assert_eq!(
            ExternalId::classify("10.1038/nature14539"),
            Some(ExternalId::Doi("10.1038/nature14539".into()))
        );
        assert_eq!(
            ExternalId::classify("https://doi.org/10.1/x"),
            Some(ExternalId::Doi("10.1/x".into()))
        );
        let s2 = "649def34f8be52c8b66281af98ae884c09aef38b";
        assert_eq!(
            ExternalId::classify(s2),
            Some(ExternalId::SemanticScholar(s2.into()))
        );
        assert_eq!(
            ExternalId::classify("https://openalex.org/W2741809807"),
            Some(ExternalId::OpenAlex("W2741809807".into()))
        );
        assert_eq!(
            ExternalId::classify("W2741809807"),
            Some(ExternalId::OpenAlex("W2741809807".into()))
        );
        assert_eq!(ExternalId::classify("abc123"), None);
        assert_eq!(ExternalId::classify(""), None);
    }

    #[test]
    fn test_add_reference_deduplicates() {
        let mut paper = Paper::new("test", "T", None).unwrap();
        paper.add_reference("10.1/a");
        paper.add_reference("10.1/b");
        paper.add_reference("10.1/a");
        paper.add_reference(" ");
        assert_eq!(paper.references, vec!["10.1/a", "10.1/b"]);
    }

    #[test]
    fn test_partial_dates() {
        assert_eq!(parse_partial_date("2021"), NaiveDate::from_ymd_opt(2021, 1, 1));
        assert_eq!(parse_partial_date("2021-05"), NaiveDate::from_ymd_opt(2021, 5, 1));
        assert_eq!(
            parse_partial_date("2021-05-17T00:00:00Z"),
            NaiveDate::from_ymd_opt(2021, 5, 17)
        );
        assert_eq!(parse_partial_date("n/a"), None);
    }

    #[test]
    fn test_filters_admit() {
        let mut paper = Paper::new("test", "T", None).unwrap();
        paper.citation_count = 3;
        paper.year = Some(2019);

        let filters = SearchFilters {
            min_citations: Some(5),
            ..Default::default()
        };
        assert!(!filters.admits(&paper));

        let filters = SearchFilters {
            date_from: NaiveDate::from_ymd_opt(2019, 6, 1),
            ..Default::default()
        };
        assert!(filters.admits(&paper));

        let filters = SearchFilters {
            date_to: NaiveDate::from_ymd_opt(2018, 12, 31),
            ..Default::default()
        };
        assert!(!filters.admits(&paper));

        let undated = Paper::new("test", "U", None).unwrap();
        assert!(filters.admits(&undated));
    }
}
