use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::ratelimit::{RateLimitedClient, RatePolicy};
use super::{keyword_text, PaperSource, SearchPage, SourceError};
use crate::models::{parse_partial_date, Author, ExternalId, Paper, SearchFilters};

const NAME: &str = "semantic_scholar";
const BASE_URL: &str = "https://api.semanticscholar.org/graph/v1";
const FIELDS: &str = "paperId,externalIds,title,abstract,venue,year,publicationDate,journal,\
authors,citationCount,referenceCount,influentialCitationCount,openAccessPdf,url,fieldsOfStudy";
const REFERENCE_FIELDS: &str = "references.paperId,references.externalIds";

pub struct SemanticScholarClient {
    client: RateLimitedClient,
    api_key: Option<String>,
}

impl SemanticScholarClient {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self, SourceError> {
        let policy = RatePolicy::per_second(1.0).with_timeout(timeout);
        Ok(Self {
            client: RateLimitedClient::new(NAME, "paper-crawl/0.1", policy)?,
            api_key,
        })
    }

    fn add_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("x-api-key", key),
            None => req,
        }
    }

    fn path_id(id: &ExternalId) -> Option<String> {
        match id {
            ExternalId::Doi(doi) => Some(format!("DOI:{}", doi)),
            ExternalId::SemanticScholar(id) => Some(id.clone()),
            ExternalId::Arxiv(id) => Some(format!("ARXIV:{}", id)),
            ExternalId::OpenAlex(_) => None,
        }
    }
}

#[derive(Deserialize)]
struct S2SearchResponse {
    total: Option<u64>,
    data: Option<Vec<S2Paper>>,
}

#[derive(Deserialize)]
struct S2ReferenceResponse {
    data: Option<Vec<S2ReferenceEdge>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2ReferenceEdge {
    cited_paper: Option<S2Paper>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    title: Option<String>,
    authors: Option<Vec<S2Author>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    year: Option<i32>,
    publication_date: Option<String>,
    venue: Option<String>,
    journal: Option<S2Journal>,
    external_ids: Option<S2ExternalIds>,
    citation_count: Option<u32>,
    reference_count: Option<u32>,
    influential_citation_count: Option<u32>,
    open_access_pdf: Option<S2Pdf>,
    fields_of_study: Option<Vec<String>>,
    references: Option<Vec<S2Reference>>,
}

#[derive(Deserialize)]
struct S2Author {
    name: Option<String>,
    affiliations: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct S2Journal {
    name: Option<String>,
    volume: Option<String>,
    pages: Option<String>,
}

#[derive(Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Reference {
    paper_id: Option<String>,
    external_ids: Option<S2ExternalIds>,
}

#[derive(Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

fn non_empty(s: &Option<String>) -> Option<String> {
    s.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn s2_to_paper(p: &S2Paper) -> Option<Paper> {
    let ids = p.external_ids.as_ref();
    let doi = ids.and_then(|e| e.doi.as_deref());
    let mut paper = Paper::new(NAME, p.title.clone().unwrap_or_default(), doi)?;

    if let Some(id) = &p.paper_id {
        paper.add_external_id(NAME, id.as_str());
    }
    if let Some(arxiv) = ids.and_then(|e| e.arxiv.as_deref()) {
        paper.add_external_id("arxiv", arxiv);
    }

    paper.authors = p
        .authors
        .as_ref()
        .map(|authors| {
            authors
                .iter()
                .filter_map(|a| {
                    let name = a.name.as_deref()?.trim();
                    (!name.is_empty()).then(|| Author {
                        name: name.to_string(),
                        affiliation: a.affiliations.as_ref().and_then(|af| af.first().cloned()),
                        orcid: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    paper.abstract_text = non_empty(&p.abstract_text);
    match p.publication_date.as_deref().and_then(parse_partial_date) {
        Some(date) => paper.set_publication_date(date),
        None => paper.year = p.year,
    }

    let journal = p.journal.as_ref();
    paper.venue = journal
        .and_then(|j| non_empty(&j.name))
        .or_else(|| non_empty(&p.venue));
    paper.volume = journal.and_then(|j| non_empty(&j.volume));
    paper.pages = journal.and_then(|j| non_empty(&j.pages));

    paper.citation_count = p.citation_count.unwrap_or(0);
    paper.reference_count = p.reference_count.unwrap_or(0);
    paper.influential_citation_count = p.influential_citation_count;
    paper.pdf_url = p.open_access_pdf.as_ref().and_then(|pdf| non_empty(&pdf.url));
    paper.open_access_url = paper.pdf_url.clone();

    if let Some(fields) = &p.fields_of_study {
        paper.keywords.extend(fields.iter().map(|f| f.to_lowercase()));
    }

    for r in p.references.iter().flatten() {
        let doi = r.external_ids.as_ref().and_then(|e| e.doi.as_deref());
        match doi.or(r.paper_id.as_deref()) {
            Some(id) => paper.add_reference(id),
            None => continue,
        }
    }

    Some(paper)
}

fn year_range(filters: &SearchFilters) -> Option<String> {
    use chrono::Datelike;
    let from = filters.date_from.map(|d| d.year().to_string());
    let to = filters.date_to.map(|d| d.year().to_string());
    match (from, to) {
        (None, None) => None,
        (from, to) => Some(format!(
            "{}-{}",
            from.unwrap_or_default(),
            to.unwrap_or_default()
        )),
    }
}

#[async_trait]
impl PaperSource for SemanticScholarClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn resolves(&self, id: &ExternalId) -> bool {
        Self::path_id(id).is_some()
    }

    async fn search(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
        max_results: u32,
    ) -> Result<SearchPage, SourceError> {
        let url = format!("{}/paper/search", BASE_URL);
        let query = keyword_text(keywords);
        let mut params: Vec<(&str, String)> = vec![
            ("query", query),
            ("limit", max_results.clamp(1, 100).to_string()),
            ("fields", FIELDS.to_string()),
        ];
        if let Some(years) = year_range(filters) {
            params.push(("year", years));
        }
        if let Some(min) = filters.min_citations {
            params.push(("minCitationCount", min.to_string()));
        }
        if let Some(field) = &filters.field {
            params.push(("fieldsOfStudy", field.clone()));
        }

        let resp: Option<S2SearchResponse> = self
            .client
            .json(|http| self.add_auth(http.get(&url).query(&params)))
            .await?;
        let resp = resp.unwrap_or(S2SearchResponse {
            total: Some(0),
            data: None,
        });
        Ok(SearchPage {
            papers: resp.data.unwrap_or_default().iter().filter_map(s2_to_paper).collect(),
            total_results: resp.total,
        })
    }

    async fn get_by_external_id(&self, id: &ExternalId) -> Result<Option<Paper>, SourceError> {
        let Some(path_id) = Self::path_id(id) else {
            return Ok(None);
        };
        let url = format!("{}/paper/{}", BASE_URL, path_id);
        let fields = format!("{},{}", FIELDS, REFERENCE_FIELDS);
        let paper: Option<S2Paper> = self
            .client
            .json(|http| self.add_auth(http.get(&url).query(&[("fields", fields.as_str())])))
            .await?;
        Ok(paper.as_ref().and_then(s2_to_paper))
    }

    async fn get_references(&self, id: &ExternalId) -> Result<Vec<Paper>, SourceError> {
        let Some(path_id) = Self::path_id(id) else {
            return Ok(vec![]);
        };
        let url = format!("{}/paper/{}/references", BASE_URL, path_id);
        let fields = format!("citedPaper.{}", FIELDS.replace(',', ",citedPaper."));
        let resp: Option<S2ReferenceResponse> = self
            .client
            .json(|http| {
                self.add_auth(
                    http.get(&url)
                        .query(&[("fields", fields.as_str()), ("limit", "100")]),
                )
            })
            .await?;
        Ok(resp
            .and_then(|r| r.data)
            .unwrap_or_default()
            .iter()
            .filter_map(|edge| edge.cited_paper.as_ref())
            .filter_map(s2_to_paper)
            .collect())
    }
}
