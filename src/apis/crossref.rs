use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use super::ratelimit::{RateLimitedClient, RatePolicy};
use super::{keyword_text, PaperSource, SearchPage, SourceError};
use crate::models::{Author, ExternalId, Paper, SearchFilters};

const NAME: &str = "crossref";
const BASE_URL: &str = "https://api.crossref.org/works";
const SELECT: &str = "DOI,title,author,abstract,container-title,volume,issue,page,publisher,\
is-referenced-by-count,references-count,reference,published,link,subject,URL";

pub struct CrossRefClient {
    client: RateLimitedClient,
    email: Option<String>,
}

impl CrossRefClient {
    pub fn new(email: Option<String>, timeout: Duration) -> Result<Self, SourceError> {
        let ua = match email {
            Some(ref e) => format!("paper-crawl/0.1 (mailto:{})", e),
            None => "paper-crawl/0.1".to_string(),
        };
        let policy = RatePolicy::per_second(5.0).with_timeout(timeout);
        Ok(Self {
            client: RateLimitedClient::new(NAME, &ua, policy)?,
            email,
        })
    }
}

#[derive(Deserialize)]
struct CRResponse<T> {
    message: T,
}

#[derive(Deserialize)]
struct CRList {
    #[serde(rename = "total-results")]
    total_results: Option<u64>,
    #[serde(default)]
    items: Vec<CRItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CRItem {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    title: Option<Vec<String>>,
    author: Option<Vec<CRAuthor>>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    container_title: Option<Vec<String>>,
    volume: Option<String>,
    issue: Option<String>,
    page: Option<String>,
    publisher: Option<String>,
    is_referenced_by_count: Option<u32>,
    references_count: Option<u32>,
    reference: Option<Vec<CRReference>>,
    published: Option<CRDate>,
    link: Option<Vec<CRLink>>,
    subject: Option<Vec<String>>,
    #[serde(rename = "URL")]
    url: Option<String>,
}

#[derive(Deserialize)]
struct CRAuthor {
    given: Option<String>,
    family: Option<String>,
    name: Option<String>,
    #[serde(rename = "ORCID")]
    orcid: Option<String>,
    affiliation: Option<Vec<CRAffiliation>>,
}

#[derive(Deserialize)]
struct CRAffiliation {
    name: Option<String>,
}

#[derive(Deserialize)]
struct CRReference {
    #[serde(rename = "DOI")]
    doi: Option<String>,
}

#[derive(Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts")]
    date_parts: Option<Vec<Vec<Option<i32>>>>,
}

#[derive(Deserialize)]
struct CRLink {
    #[serde(rename = "URL")]
    url: Option<String>,
    #[serde(rename = "content-type")]
    content_type: Option<String>,
}

/// Drop JATS/XML tags CrossRef embeds in abstracts.
fn strip_markup(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_tag = false;
    for c in raw.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn published_date(date: &CRDate) -> Option<NaiveDate> {
    let parts = date.date_parts.as_ref()?.first()?;
    let year = (*parts.first()?)?;
    let month = parts.get(1).copied().flatten().unwrap_or(1) as u32;
    let day = parts.get(2).copied().flatten().unwrap_or(1) as u32;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn author_name(a: &CRAuthor) -> Option<String> {
    let name = match (&a.given, &a.family, &a.name) {
        (_, _, Some(name)) => name.clone(),
        (given, family, None) => format!(
            "{} {}",
            given.as_deref().unwrap_or(""),
            family.as_deref().unwrap_or("")
        ),
    };
    let name = name.trim().to_string();
    (!name.is_empty()).then_some(name)
}

fn item_to_paper(item: &CRItem) -> Option<Paper> {
    let title = item
        .title
        .as_ref()
        .and_then(|t| t.first())
        .cloned()
        .unwrap_or_default();
    let mut paper = Paper::new(NAME, title, item.doi.as_deref())?;

    if let Some(doi) = &paper.doi {
        let doi = doi.clone();
        paper.add_external_id(NAME, doi);
    }

    paper.authors = item
        .author
        .iter()
        .flatten()
        .filter_map(|a| {
            Some(Author {
                name: author_name(a)?,
                affiliation: a
                    .affiliation
                    .iter()
                    .flatten()
                    .find_map(|af| af.name.clone()),
                orcid: a.orcid.as_deref().map(|o| {
                    o.trim_start_matches("https://orcid.org/")
                        .trim_start_matches("http://orcid.org/")
                        .to_string()
                }),
            })
        })
        .collect();

    paper.abstract_text = item
        .abstract_text
        .as_deref()
        .map(strip_markup)
        .filter(|s| !s.is_empty());

    if let Some(date) = item.published.as_ref().and_then(published_date) {
        paper.set_publication_date(date);
    }

    paper.venue = item.container_title.as_ref().and_then(|t| t.first()).cloned();
    paper.volume = item.volume.clone();
    paper.issue = item.issue.clone();
    paper.pages = item.page.clone();
    paper.publisher = item.publisher.clone();
    paper.publisher_url = item.url.clone();
    paper.citation_count = item.is_referenced_by_count.unwrap_or(0);
    paper.reference_count = item.references_count.unwrap_or(0);

    paper.pdf_url = item
        .link
        .iter()
        .flatten()
        .find(|l| l.content_type.as_deref() == Some("application/pdf"))
        .and_then(|l| l.url.clone());

    for subject in item.subject.iter().flatten() {
        paper.keywords.insert(subject.to_lowercase());
    }
    for r in item.reference.iter().flatten() {
        if let Some(doi) = &r.doi {
            paper.add_reference(doi.as_str());
        }
    }

    Some(paper)
}

fn filter_param(filters: &SearchFilters) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(from) = filters.date_from {
        parts.push(format!("from-pub-date:{}", from.format("%Y-%m-%d")));
    }
    if let Some(to) = filters.date_to {
        parts.push(format!("until-pub-date:{}", to.format("%Y-%m-%d")));
    }
    (!parts.is_empty()).then(|| parts.join(","))
}

#[async_trait]
impl PaperSource for CrossRefClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn resolves(&self, id: &ExternalId) -> bool {
        matches!(id, ExternalId::Doi(_))
    }

    async fn search(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
        max_results: u32,
    ) -> Result<SearchPage, SourceError> {
        let mut params = vec![
            ("query", keyword_text(keywords)),
            ("rows", max_results.clamp(1, 100).to_string()),
            ("select", SELECT.to_string()),
        ];
        if let Some(filter) = filter_param(filters) {
            params.push(("filter", filter));
        }
        if let Some(email) = &self.email {
            params.push(("mailto", email.clone()));
        }
        let resp: Option<CRResponse<CRList>> = self
            .client
            .json(|http| http.get(BASE_URL).query(&params))
            .await?;
        let Some(resp) = resp else {
            return Ok(SearchPage::default());
        };
        Ok(SearchPage {
            total_results: resp.message.total_results,
            papers: resp.message.items.iter().filter_map(item_to_paper).collect(),
        })
    }

    async fn get_by_external_id(&self, id: &ExternalId) -> Result<Option<Paper>, SourceError> {
        let ExternalId::Doi(doi) = id else {
            return Ok(None);
        };
        let url = format!("{}/{}", BASE_URL, doi);
        let resp: Option<CRResponse<CRItem>> = self.client.json(|http| http.get(&url)).await?;
        Ok(resp.and_then(|r| item_to_paper(&r.message)))
    }
}
