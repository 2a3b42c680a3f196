use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Datelike, NaiveDate};
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters,
    model::*, tool, tool_handler, tool_router,
    transport::stdio, ErrorData as McpError, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod apis;
mod config;
mod crawler;
mod dedup;
mod llm;
mod models;
mod references;
mod screening;
mod search;
mod session;
mod store;

use config::{Config, StoreBackend};
use crawler::Crawler;
use models::{parse_partial_date, ExternalId, Paper, SearchFilters, SearchQuery};
use screening::ScreeningGate;
use store::lance::LanceStore;
use store::memory::MemoryStore;
use store::PaperStore;

// ── Parameter structs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
struct CrawlParams {
    #[schemars(description = "Research topic keywords; every keyword should match")]
    keywords: Vec<String>,
    #[schemars(description = "Subject field filter (e.g. \"Computer Science\", \"quant-ph\")")]
    field: Option<String>,
    #[schemars(description = "Earliest publication date, YYYY, YYYY-MM or YYYY-MM-DD")]
    date_from: Option<String>,
    #[schemars(description = "Latest publication date, YYYY, YYYY-MM or YYYY-MM-DD")]
    date_to: Option<String>,
    #[schemars(description = "Minimum citation count")]
    min_citations: Option<u32>,
    #[schemars(description = "Follow references of the found papers (default false)")]
    include_references: Option<bool>,
    #[schemars(description = "How many reference levels to follow (default 1, max 3)")]
    max_reference_depth: Option<u32>,
    #[schemars(description = "Cap on initial search results across all sources")]
    max_results: Option<u32>,
    #[schemars(description = "Wait for the crawl to finish and return its session (default false)")]
    wait: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryIdParams {
    #[schemars(description = "Query ID returned by crawl")]
    query_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GetPaperParams {
    #[schemars(description = "Stored paper ID, DOI, Semantic Scholar ID, OpenAlex W-ID or arxiv:ID")]
    id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReferencesParams {
    #[schemars(description = "DOI, Semantic Scholar ID or OpenAlex W-ID of the citing paper")]
    id: String,
    #[schemars(description = "Specific source to query")]
    source: Option<String>,
}

#[derive(Serialize)]
struct QueryPaper {
    depth: u32,
    paper: Paper,
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Serialization error: {}", e), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn store_error(e: store::StoreError) -> McpError {
    McpError::internal_error(format!("Store error: {}", e), None)
}

fn parse_date_param(name: &str, raw: Option<&str>, end: bool) -> Result<Option<NaiveDate>, McpError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(None);
    };
    let date = parse_partial_date(raw)
        .ok_or_else(|| McpError::invalid_params(format!("Invalid {}: {}", name, raw), None))?;
    if !end || raw.len() >= 10 {
        return Ok(Some(date));
    }
    // Open-ended partial dates cover the whole year or month.
    let last = if raw.len() == 4 {
        NaiveDate::from_ymd_opt(date.year(), 12, 31)
    } else {
        date.checked_add_months(chrono::Months::new(1))
            .and_then(|d| d.pred_opt())
    };
    Ok(last.or(Some(date)))
}

// ── Server ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PaperCrawlServer {
    tool_router: ToolRouter<Self>,
    config: Arc<Config>,
    crawler: Arc<Crawler>,
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
    shutdown: CancellationToken,
}

#[tool_router]
impl PaperCrawlServer {
    pub async fn create() -> anyhow::Result<Self> {
        let config = Config::from_env();
        let sources = config.build_sources();

        let store: Arc<dyn PaperStore> = match config.store_backend {
            StoreBackend::Lance => Arc::new(
                LanceStore::create_or_open(&config.data_dir.join("lance"))
                    .await
                    .context("Failed to open paper store")?,
            ),
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
        };

        let mut crawler = Crawler::new(sources, store, config.crawl_options());
        match config.build_classifier() {
            Some(classifier) => crawler = crawler.with_screening(ScreeningGate::new(classifier)),
            None => tracing::info!("No CLASSIFIER_API_KEY, screening disabled"),
        }

        tracing::info!(
            "Initialized {} paper sources, store={:?}, data_dir={}",
            crawler.sources().len(),
            config.store_backend,
            config.data_dir.display()
        );

        Ok(Self {
            tool_router: Self::tool_router(),
            config: Arc::new(config),
            crawler: Arc::new(crawler),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    #[tool(description = "List paper sources with their status and merge priority")]
    async fn list_sources(&self) -> Result<CallToolResult, McpError> {
        json_result(&self.config.source_status())
    }

    #[tool(description = "Start a crawl: search all sources, merge duplicates, optionally follow references and screen papers. Returns the query ID.")]
    async fn crawl(
        &self,
        Parameters(params): Parameters<CrawlParams>,
    ) -> Result<CallToolResult, McpError> {
        let filters = SearchFilters {
            field: params.field.filter(|f| !f.trim().is_empty()),
            date_from: parse_date_param("date_from", params.date_from.as_deref(), false)?,
            date_to: parse_date_param("date_to", params.date_to.as_deref(), true)?,
            min_citations: params.min_citations,
        };
        let mut query = SearchQuery::new(params.keywords)
            .with_filters(filters)
            .with_max_results(params.max_results.unwrap_or(self.config.max_results).max(1));
        if params.include_references.unwrap_or(false) {
            query = query.with_references(params.max_reference_depth.unwrap_or(1).min(3));
        }
        if !query.has_keywords() {
            return Err(McpError::invalid_params("At least one keyword is required".to_string(), None));
        }

        let query_id = query.id.clone();
        let token = self.shutdown.child_token();
        self.running.lock().await.insert(query_id.clone(), token.clone());

        let crawler = self.crawler.clone();
        let running = self.running.clone();
        let task_query_id = query_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = crawler.run(query, &token).await;
            running.lock().await.remove(&task_query_id);
            outcome
        });

        if params.wait.unwrap_or(false) {
            let session = handle
                .await
                .map_err(|e| McpError::internal_error(format!("Crawl task failed: {}", e), None))?
                .map_err(|e| McpError::internal_error(format!("Crawl failed: {}", e), None))?;
            return json_result(&session);
        }
        json_result(&serde_json::json!({ "query_id": query_id, "status": "running" }))
    }

    #[tool(description = "Cancel a running crawl")]
    async fn cancel_crawl(
        &self,
        Parameters(params): Parameters<QueryIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let token = self.running.lock().await.get(&params.query_id).cloned();
        let text = match token {
            Some(token) => {
                token.cancel();
                format!("Cancellation requested for {}", params.query_id)
            }
            None => format!("No running crawl for {}", params.query_id),
        };
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(description = "Get a query and the status of its latest crawl session")]
    async fn get_session(
        &self,
        Parameters(params): Parameters<QueryIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let store = self.crawler.store();
        let query = store.get_query(&params.query_id).await.map_err(store_error)?;
        let Some(query) = query else {
            return Err(McpError::invalid_params(
                format!("Unknown query: {}", params.query_id),
                None,
            ));
        };
        let session = store
            .session_for_query(&params.query_id)
            .await
            .map_err(store_error)?;
        let finished = session.as_ref().is_some_and(|s| s.status.is_terminal());
        json_result(&serde_json::json!({ "query": query, "session": session, "finished": finished }))
    }

    #[tool(description = "List the papers found for a query with the reference depth at which each was discovered")]
    async fn get_query_papers(
        &self,
        Parameters(params): Parameters<QueryIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let store = self.crawler.store();
        let links = store.list_links(&params.query_id).await.map_err(store_error)?;
        let depths: HashMap<String, u32> =
            links.into_iter().map(|l| (l.paper_id, l.depth)).collect();
        let papers: Vec<QueryPaper> = store
            .list_for_query(&params.query_id)
            .await
            .map_err(store_error)?
            .into_iter()
            .map(|paper| QueryPaper {
                depth: depths.get(&paper.id).copied().unwrap_or(0),
                paper,
            })
            .collect();
        json_result(&papers)
    }

    #[tool(description = "Get a paper from the store by ID or DOI, falling back to a live source lookup")]
    async fn get_paper(
        &self,
        Parameters(params): Parameters<GetPaperParams>,
    ) -> Result<CallToolResult, McpError> {
        let store = self.crawler.store();
        if let Some(paper) = store.find_by_id(&params.id).await.map_err(store_error)? {
            return json_result(&paper);
        }

        let Some(id) = ExternalId::classify(&params.id) else {
            return Ok(CallToolResult::success(vec![Content::text(format!(
                "Paper not found: {}",
                params.id
            ))]));
        };
        if let ExternalId::Doi(doi) = &id {
            if let Some(paper) = store.find_by_doi(doi).await.map_err(store_error)? {
                return json_result(&paper);
            }
        }

        for src in self.crawler.sources().iter().filter(|s| s.resolves(&id)) {
            match src.get_by_external_id(&id).await {
                Ok(Some(paper)) => return json_result(&paper),
                Ok(None) => continue,
                Err(e) if e.is_unsupported() => continue,
                Err(e) => {
                    tracing::warn!("Source {} failed for get_paper: {}", src.name(), e);
                    continue;
                }
            }
        }

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Paper not found: {}",
            params.id
        ))]))
    }

    #[tool(description = "Get papers referenced by a given paper, fetched live from the first source that lists them")]
    async fn get_references(
        &self,
        Parameters(params): Parameters<ReferencesParams>,
    ) -> Result<CallToolResult, McpError> {
        let id = ExternalId::classify(&params.id).ok_or_else(|| {
            McpError::invalid_params(format!("Unrecognized paper ID: {}", params.id), None)
        })?;

        for src in self.crawler.sources().iter().filter(|s| s.resolves(&id)) {
            if let Some(target) = params.source.as_deref() {
                if !src.name().eq_ignore_ascii_case(target) {
                    continue;
                }
            }
            match src.get_references(&id).await {
                Ok(papers) if !papers.is_empty() => return json_result(&papers),
                Ok(_) => continue,
                Err(e) if e.is_unsupported() => continue,
                Err(e) => {
                    tracing::warn!("Source {} failed: {}", src.name(), e);
                    continue;
                }
            }
        }
        json_result(&Vec::<Paper>::new())
    }
}

#[tool_handler]
impl ServerHandler for PaperCrawlServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Crawl academic literature for a research topic. Queries Semantic Scholar, \
                 OpenAlex, CrossRef and arXiv in parallel, merges duplicate records, \
                 optionally follows references breadth-first and screens papers for \
                 relevance. Start with crawl, then poll get_session and get_query_papers."
                    .into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!("Starting paper-crawl MCP server");

    let server = PaperCrawlServer::create().await?;
    let shutdown = server.shutdown.clone();
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    shutdown.cancel();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_param_expands_partial_end_dates() {
        assert_eq!(parse_date_param("d", None, true).unwrap(), None);
        assert_eq!(
            parse_date_param("d", Some("2020"), false).unwrap(),
            NaiveDate::from_ymd_opt(2020, 1, 1)
        );
        assert_eq!(
            parse_date_param("d", Some("2020"), true).unwrap(),
            NaiveDate::from_ymd_opt(2020, 12, 31)
        );
        assert_eq!(
            parse_date_param("d", Some("2020-02"), true).unwrap(),
            NaiveDate::from_ymd_opt(2020, 2, 29)
        );
        assert_eq!(
            parse_date_param("d", Some("2020-02-10"), true).unwrap(),
            NaiveDate::from_ymd_opt(2020, 2, 10)
        );
        assert!(parse_date_param("d", Some("soon"), false).is_err());
    }
}
