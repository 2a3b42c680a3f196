use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::ratelimit::{RateLimitedClient, RatePolicy};
use super::{keyword_text, PaperSource, SearchPage, SourceError};
use crate::models::{parse_partial_date, Author, ExternalId, Paper, SearchFilters};

const NAME: &str = "openalex";
const BASE_URL: &str = "https://api.openalex.org";
const WORK_PREFIX: &str = "https://openalex.org/";
const SELECT: &str = "id,doi,display_name,authorships,abstract_inverted_index,publication_date,\
publication_year,primary_location,biblio,cited_by_count,referenced_works,referenced_works_count,\
open_access,keywords,concepts";

pub struct OpenAlexClient {
    client: RateLimitedClient,
    email: Option<String>,
}

impl OpenAlexClient {
    pub fn new(email: Option<String>, timeout: Duration) -> Result<Self, SourceError> {
        let ua = match email {
            Some(ref e) => format!("paper-crawl/0.1 (mailto:{})", e),
            None => "paper-crawl/0.1".to_string(),
        };
        let policy = RatePolicy::per_second(10.0).with_timeout(timeout);
        Ok(Self {
            client: RateLimitedClient::new(NAME, &ua, policy)?,
            email,
        })
    }

    fn mailto(&self) -> Vec<(&'static str, String)> {
        self.email
            .iter()
            .map(|e| ("mailto", e.clone()))
            .collect()
    }

    async fn list_works(&self, params: Vec<(&'static str, String)>) -> Result<OAResponse, SourceError> {
        let url = format!("{}/works", BASE_URL);
        let mut params = params;
        params.push(("select", SELECT.to_string()));
        params.extend(self.mailto());
        let resp: Option<OAResponse> = self
            .client
            .json(|http| http.get(&url).query(&params))
            .await?;
        Ok(resp.unwrap_or_default())
    }
}

#[derive(Deserialize, Default)]
struct OAResponse {
    meta: Option<OAMeta>,
    #[serde(default)]
    results: Vec<OAWork>,
}

#[derive(Deserialize, Default)]
struct OAMeta {
    count: Option<u64>,
}

#[derive(Deserialize)]
struct OAWork {
    id: Option<String>,
    doi: Option<String>,
    display_name: Option<String>,
    authorships: Option<Vec<OAAuthorship>>,
    abstract_inverted_index: Option<BTreeMap<String, Vec<u32>>>,
    publication_date: Option<String>,
    publication_year: Option<i32>,
    primary_location: Option<OALocation>,
    biblio: Option<OABiblio>,
    cited_by_count: Option<u32>,
    referenced_works: Option<Vec<String>>,
    referenced_works_count: Option<u32>,
    open_access: Option<OAOpenAccess>,
    keywords: Option<Vec<OAKeyword>>,
    concepts: Option<Vec<OAConcept>>,
}

#[derive(Deserialize)]
struct OAAuthorship {
    author: OAAuthor,
    institutions: Option<Vec<OAInstitution>>,
}

#[derive(Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
    orcid: Option<String>,
}

#[derive(Deserialize)]
struct OAInstitution {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OALocation {
    landing_page_url: Option<String>,
    pdf_url: Option<String>,
    source: Option<OASource>,
}

#[derive(Deserialize)]
struct OASource {
    display_name: Option<String>,
    host_organization_name: Option<String>,
}

#[derive(Deserialize)]
struct OABiblio {
    volume: Option<String>,
    issue: Option<String>,
    first_page: Option<String>,
    last_page: Option<String>,
}

#[derive(Deserialize)]
struct OAOpenAccess {
    oa_url: Option<String>,
}

#[derive(Deserialize)]
struct OAKeyword {
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct OAConcept {
    display_name: Option<String>,
    score: Option<f64>,
}

/// Concepts below this score are too loosely attached to count as keywords.
const MIN_CONCEPT_SCORE: f64 = 0.5;

fn short_work_id(id: &str) -> &str {
    id.strip_prefix(WORK_PREFIX).unwrap_or(id)
}

/// Rebuild abstract text from OpenAlex's token -> positions index.
fn inverted_index_to_text(index: &BTreeMap<String, Vec<u32>>) -> String {
    let mut positions: BTreeMap<u32, &str> = BTreeMap::new();
    for (token, ps) in index {
        for p in ps {
            positions.entry(*p).or_insert(token.as_str());
        }
    }
    positions.into_values().collect::<Vec<_>>().join(" ")
}

fn pages(biblio: &OABiblio) -> Option<String> {
    match (biblio.first_page.as_deref(), biblio.last_page.as_deref()) {
        (Some(first), Some(last)) if first != last => Some(format!("{}-{}", first, last)),
        (Some(first), _) => Some(first.to_string()),
        (None, Some(last)) => Some(last.to_string()),
        (None, None) => None,
    }
}

fn oa_to_paper(w: &OAWork) -> Option<Paper> {
    let mut paper = Paper::new(
        NAME,
        w.display_name.clone().unwrap_or_default(),
        w.doi.as_deref(),
    )?;

    if let Some(id) = &w.id {
        paper.add_external_id(NAME, short_work_id(id));
    }

    paper.authors = w
        .authorships
        .iter()
        .flatten()
        .filter_map(|a| {
            let name = a.author.display_name.as_deref()?.trim();
            if name.is_empty() {
                return None;
            }
            Some(Author {
                name: name.to_string(),
                affiliation: a
                    .institutions
                    .iter()
                    .flatten()
                    .find_map(|i| i.display_name.clone()),
                orcid: a
                    .author
                    .orcid
                    .as_deref()
                    .map(|o| o.trim_start_matches("https://orcid.org/").to_string()),
            })
        })
        .collect();

    paper.abstract_text = w
        .abstract_inverted_index
        .as_ref()
        .map(inverted_index_to_text)
        .filter(|s| !s.trim().is_empty());

    match w.publication_date.as_deref().and_then(parse_partial_date) {
        Some(date) => paper.set_publication_date(date),
        None => paper.year = w.publication_year,
    }

    if let Some(loc) = &w.primary_location {
        let source = loc.source.as_ref();
        paper.venue = source.and_then(|s| s.display_name.clone());
        paper.publisher = source.and_then(|s| s.host_organization_name.clone());
        paper.publisher_url = loc.landing_page_url.clone();
        paper.pdf_url = loc.pdf_url.clone();
    }
    if let Some(biblio) = &w.biblio {
        paper.volume = biblio.volume.clone();
        paper.issue = biblio.issue.clone();
        paper.pages = pages(biblio);
    }

    paper.citation_count = w.cited_by_count.unwrap_or(0);
    paper.open_access_url = w.open_access.as_ref().and_then(|oa| oa.oa_url.clone());

    for kw in w.keywords.iter().flatten() {
        if let Some(name) = &kw.display_name {
            paper.keywords.insert(name.to_lowercase());
        }
    }
    for concept in w.concepts.iter().flatten() {
        if concept.score.unwrap_or(0.0) >= MIN_CONCEPT_SCORE {
            if let Some(name) = &concept.display_name {
                paper.keywords.insert(name.to_lowercase());
            }
        }
    }

    for r in w.referenced_works.iter().flatten() {
        paper.add_reference(short_work_id(r));
    }
    paper.reference_count = w
        .referenced_works_count
        .unwrap_or(paper.references.len() as u32);

    Some(paper)
}

fn filter_param(filters: &SearchFilters) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(from) = filters.date_from {
        parts.push(format!("from_publication_date:{}", from.format("%Y-%m-%d")));
    }
    if let Some(to) = filters.date_to {
        parts.push(format!("to_publication_date:{}", to.format("%Y-%m-%d")));
    }
    if let Some(min) = filters.min_citations.filter(|m| *m > 0) {
        parts.push(format!("cited_by_count:>{}", min - 1));
    }
    (!parts.is_empty()).then(|| parts.join(","))
}

#[async_trait]
impl PaperSource for OpenAlexClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn resolves(&self, id: &ExternalId) -> bool {
        matches!(id, ExternalId::Doi(_) | ExternalId::OpenAlex(_))
    }

    async fn search(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
        max_results: u32,
    ) -> Result<SearchPage, SourceError> {
        // No free-text field filter on /works; the subject joins the search terms.
        let mut query = keyword_text(keywords);
        if let Some(field) = &filters.field {
            query = format!("{} {}", query, field);
        }
        let mut params = vec![
            ("search", query),
            ("per_page", max_results.clamp(1, 200).to_string()),
        ];
        if let Some(filter) = filter_param(filters) {
            params.push(("filter", filter));
        }
        let resp = self.list_works(params).await?;
        Ok(SearchPage {
            total_results: resp.meta.and_then(|m| m.count),
            papers: resp.results.iter().filter_map(oa_to_paper).collect(),
        })
    }

    async fn get_by_external_id(&self, id: &ExternalId) -> Result<Option<Paper>, SourceError> {
        let path = match id {
            ExternalId::OpenAlex(w) => w.clone(),
            ExternalId::Doi(doi) => format!("doi:{}", doi),
            _ => return Ok(None),
        };
        let url = format!("{}/works/{}", BASE_URL, path);
        let mailto = self.mailto();
        let work: Option<OAWork> = self
            .client
            .json(|http| http.get(&url).query(&mailto))
            .await?;
        Ok(work.as_ref().and_then(oa_to_paper))
    }

    async fn get_references(&self, id: &ExternalId) -> Result<Vec<Paper>, SourceError> {
        let work_id = match id {
            ExternalId::OpenAlex(w) => w.clone(),
            ExternalId::Doi(_) => match self.get_by_external_id(id).await? {
                Some(p) => match p.external_ids.get(NAME) {
                    Some(w) => w.clone(),
                    None => return Ok(vec![]),
                },
                None => return Ok(vec![]),
            },
            _ => return Ok(vec![]),
        };
        let resp = self
            .list_works(vec![
                ("filter", format!("cited_by:{}", work_id)),
                ("per_page", "100".to_string()),
            ])
            .await?;
        Ok(resp.results.iter().filter_map(oa_to_paper).collect())
    }
}
