use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::apis::{self, PaperSource, SourceError};
use crate::crawler::CrawlOptions;
use crate::llm::{self, ChatClassifier};
use crate::references::ExplorerLimits;
use crate::screening::Classifier;

/// Adapter names in default priority order.
pub const DEFAULT_SOURCES: [&str; 4] = ["semantic_scholar", "openalex", "crossref", "arxiv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Lance,
    Memory,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub store_backend: StoreBackend,
    /// Enabled adapters. Order is priority: earlier sources win merge conflicts.
    pub source_names: Vec<String>,
    pub max_results: u32,
    pub request_timeout: Duration,
    pub reference_delay: Duration,
    pub semantic_scholar_api_key: Option<String>,
    pub openalex_email: Option<String>,
    pub crossref_email: Option<String>,
    pub classifier_api_key: Option<String>,
    pub classifier_base_url: Option<String>,
    pub classifier_model: String,
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_opt(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        None => default,
    }
}

/// Split a comma list into lower-cased names, dropping blanks and repeats.
fn parse_source_list(raw: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in raw.split(',').map(|s| s.trim().to_lowercase()) {
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let data_dir = env_opt("PAPER_CRAWL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs_or_default().join(".paper-crawl"));

        let store_backend = match env_opt("PAPER_CRAWL_STORE").as_deref() {
            Some("memory") => StoreBackend::Memory,
            Some("lance") | None => StoreBackend::Lance,
            Some(other) => {
                tracing::warn!("Unknown PAPER_CRAWL_STORE {:?}, using lance", other);
                StoreBackend::Lance
            }
        };

        let source_names = env_opt("PAPER_CRAWL_SOURCES")
            .map(|s| parse_source_list(&s))
            .filter(|names| !names.is_empty())
            .unwrap_or_else(|| DEFAULT_SOURCES.iter().map(|s| s.to_string()).collect());

        Self {
            data_dir,
            store_backend,
            source_names,
            max_results: env_parse("PAPER_CRAWL_MAX_RESULTS", 50),
            request_timeout: Duration::from_secs(env_parse("PAPER_CRAWL_REQUEST_TIMEOUT_SECS", 30)),
            reference_delay: Duration::from_millis(env_parse(
                "PAPER_CRAWL_REFERENCE_DELAY_MS",
                1000,
            )),
            semantic_scholar_api_key: env_opt("SEMANTIC_SCHOLAR_API_KEY"),
            openalex_email: env_opt("OPENALEX_EMAIL"),
            crossref_email: env_opt("CROSSREF_EMAIL"),
            classifier_api_key: env_opt("CLASSIFIER_API_KEY"),
            classifier_base_url: env_opt("CLASSIFIER_BASE_URL"),
            classifier_model: env_opt("CLASSIFIER_MODEL")
                .unwrap_or_else(|| llm::DEFAULT_MODEL.to_string()),
        }
    }

    fn build_source(&self, name: &str) -> Option<Result<Arc<dyn PaperSource>, SourceError>> {
        let timeout = self.request_timeout;
        let source: Result<Arc<dyn PaperSource>, SourceError> = match name {
            "semantic_scholar" => apis::semantic_scholar::SemanticScholarClient::new(
                self.semantic_scholar_api_key.clone(),
                timeout,
            )
            .map(|c| Arc::new(c) as Arc<dyn PaperSource>),
            "openalex" => apis::openalex::OpenAlexClient::new(self.openalex_email.clone(), timeout)
                .map(|c| Arc::new(c) as Arc<dyn PaperSource>),
            "crossref" => apis::crossref::CrossRefClient::new(self.crossref_email.clone(), timeout)
                .map(|c| Arc::new(c) as Arc<dyn PaperSource>),
            "arxiv" => apis::arxiv::ArxivClient::new(timeout)
                .map(|c| Arc::new(c) as Arc<dyn PaperSource>),
            _ => return None,
        };
        Some(source)
    }

    /// Build the enabled paper sources, in configured order.
    pub fn build_sources(&self) -> Vec<Arc<dyn PaperSource>> {
        let mut sources = Vec::new();
        for name in &self.source_names {
            match self.build_source(name) {
                Some(Ok(source)) => sources.push(source),
                Some(Err(e)) => tracing::warn!("Source {} disabled: {}", name, e),
                None => tracing::warn!("Unknown source {:?} in PAPER_CRAWL_SOURCES", name),
            }
        }
        sources
    }

    /// Build the screening classifier if an API key is configured.
    pub fn build_classifier(&self) -> Option<Arc<dyn Classifier>> {
        let key = self.classifier_api_key.as_deref()?;
        let client = match ChatClassifier::new(key, &self.classifier_model, self.request_timeout) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Screening disabled: {}", e);
                return None;
            }
        };
        let client = match &self.classifier_base_url {
            Some(url) => client.with_base_url(url),
            None => client,
        };
        Some(Arc::new(client))
    }

    pub fn crawl_options(&self) -> CrawlOptions {
        CrawlOptions {
            source_timeout: self.request_timeout,
            limits: ExplorerLimits {
                request_delay: self.reference_delay,
                ..Default::default()
            },
            analyze: self.classifier_api_key.is_some(),
            ..Default::default()
        }
    }

    /// Return a list of source status descriptions.
    pub fn source_status(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<SourceStatus> = DEFAULT_SOURCES
            .iter()
            .map(|name| {
                let note = match *name {
                    "semantic_scholar" if self.semantic_scholar_api_key.is_some() => "API key set",
                    "semantic_scholar" => "No API key (shared rate limit)",
                    "openalex" if self.openalex_email.is_some() => "Polite pool email set",
                    "openalex" => "No email (limited rate)",
                    "crossref" if self.crossref_email.is_some() => "Polite pool email set",
                    "crossref" => "No email (public pool)",
                    _ => "No API key required",
                };
                let priority = self.source_names.iter().position(|n| n == name);
                SourceStatus {
                    name: name.to_string(),
                    enabled: priority.is_some(),
                    priority: priority.map(|p| p as u32 + 1),
                    note: if priority.is_some() {
                        note.to_string()
                    } else {
                        "Disabled by PAPER_CRAWL_SOURCES".to_string()
                    },
                }
            })
            .collect();
        statuses.sort_by_key(|s| s.priority.unwrap_or(u32::MAX));
        statuses
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub enabled: bool,
    pub priority: Option<u32>,
    pub note: String,
}

fn dirs_or_default() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
