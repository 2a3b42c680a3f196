use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::ratelimit::{RateLimitedClient, RatePolicy};
use super::{PaperSource, SearchPage, SourceError};
use crate::models::{parse_partial_date, Author, ExternalId, Paper, SearchFilters};

const NAME: &str = "arxiv";
const BASE_URL: &str = "https://export.arxiv.org/api/query";

pub struct ArxivClient {
    client: RateLimitedClient,
}

impl ArxivClient {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        // arXiv asks for no more than one request every three seconds.
        let policy = RatePolicy::per_second(1.0 / 3.0).with_timeout(timeout);
        Ok(Self {
            client: RateLimitedClient::new(NAME, "paper-crawl/0.1", policy)?,
        })
    }
}

/// Build the `search_query` expression: every keyword must match.
fn search_query(keywords: &[String], filters: &SearchFilters) -> String {
    let mut terms: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(|k| {
            if k.contains(' ') {
                format!("all:\"{}\"", k)
            } else {
                format!("all:{}", k)
            }
        })
        .collect();

    if let Some(field) = filters.field.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
        if field.contains(' ') {
            terms.push(format!("all:\"{}\"", field));
        } else {
            terms.push(format!("cat:{}", field));
        }
    }

    if filters.date_from.is_some() || filters.date_to.is_some() {
        let from = filters
            .date_from
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "19910101".to_string());
        let to = filters
            .date_to
            .map(|d| d.format("%Y%m%d").to_string())
            .unwrap_or_else(|| "29991231".to_string());
        terms.push(format!("submittedDate:[{}0000 TO {}2359]", from, to));
    }

    terms.join(" AND ")
}

#[async_trait]
impl PaperSource for ArxivClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn resolves(&self, id: &ExternalId) -> bool {
        matches!(id, ExternalId::Arxiv(_))
    }

    async fn search(
        &self,
        keywords: &[String],
        filters: &SearchFilters,
        max_results: u32,
    ) -> Result<SearchPage, SourceError> {
        let query = search_query(keywords, filters);
        let max = max_results.clamp(1, 200).to_string();
        let body = self
            .client
            .text(|http| {
                http.get(BASE_URL).query(&[
                    ("search_query", query.as_str()),
                    ("start", "0"),
                    ("max_results", max.as_str()),
                    ("sortBy", "relevance"),
                    ("sortOrder", "descending"),
                ])
            })
            .await?;
        match body {
            Some(xml) => parse_atom_feed(&xml),
            None => Ok(SearchPage::default()),
        }
    }

    async fn get_by_external_id(&self, id: &ExternalId) -> Result<Option<Paper>, SourceError> {
        let ExternalId::Arxiv(arxiv_id) = id else {
            return Ok(None);
        };
        let body = self
            .client
            .text(|http| http.get(BASE_URL).query(&[("id_list", arxiv_id.as_str())]))
            .await?;
        match body {
            Some(xml) => Ok(parse_atom_feed(&xml)?.papers.into_iter().next()),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct Entry {
    id_url: String,
    title: String,
    summary: String,
    published: String,
    authors: Vec<Author>,
    categories: Vec<String>,
    doi: String,
    journal_ref: String,
    link_pdf: String,
    link_abs: String,
}

impl Entry {
    fn read_link(&mut self, e: &BytesStart<'_>) {
        let mut href = String::new();
        let mut title_attr = String::new();
        for attr in e.attributes().flatten() {
            let val = String::from_utf8_lossy(&attr.value).to_string();
            match attr.key.as_ref() {
                b"href" => href = val,
                b"title" => title_attr = val,
                _ => {}
            }
        }
        if title_attr == "pdf" {
            self.link_pdf = href;
        } else if self.link_abs.is_empty() && href.contains("/abs/") {
            self.link_abs = href;
        }
    }

    fn read_category(&mut self, e: &BytesStart<'_>) {
        for attr in e.attributes().flatten() {
            if attr.key.as_ref() == b"term" {
                self.categories
                    .push(String::from_utf8_lossy(&attr.value).to_string());
            }
        }
    }

    fn into_paper(self) -> Option<Paper> {
        let (_, id) = self.id_url.trim().rsplit_once("/abs/")?;
        let id = id.trim().to_string();
        if id.is_empty() {
            return None;
        }
        let doi = Some(self.doi.trim()).filter(|d| !d.is_empty());
        let mut paper = Paper::new(NAME, self.title.replace('\n', " "), doi)?;
        paper.add_external_id(NAME, id);
        paper.authors = self.authors;
        let summary = self.summary.split_whitespace().collect::<Vec<_>>().join(" ");
        paper.abstract_text = Some(summary).filter(|s| !s.is_empty());
        if let Some(date) = parse_partial_date(&self.published) {
            paper.set_publication_date(date);
        }
        paper.venue = Some(self.journal_ref.trim().to_string()).filter(|j| !j.is_empty());
        paper.publisher_url = Some(self.link_abs).filter(|l| !l.is_empty());
        paper.pdf_url = Some(self.link_pdf).filter(|l| !l.is_empty());
        paper.open_access_url = paper.pdf_url.clone();
        paper.keywords.extend(self.categories);
        Some(paper)
    }
}

fn parse_atom_feed(xml: &str) -> Result<SearchPage, SourceError> {
    let mut reader = Reader::from_str(xml);
    let mut page = SearchPage::default();
    let mut entry: Option<Entry> = None;
    let mut current_tag = String::new();
    let mut in_author = false;
    let mut author = Author::named("");
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "entry" {
                    entry = Some(Entry::default());
                } else if let Some(en) = entry.as_mut() {
                    match tag.as_str() {
                        "author" => {
                            in_author = true;
                            author = Author::named("");
                        }
                        "link" => en.read_link(&e),
                        "category" => en.read_category(&e),
                        _ => {}
                    }
                }
                current_tag = tag;
            }
            Ok(Event::Empty(e)) => {
                if let Some(en) = entry.as_mut() {
                    match e.name().as_ref() {
                        b"link" => en.read_link(&e),
                        b"category" => en.read_category(&e),
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                match entry.as_mut() {
                    Some(en) => match current_tag.as_str() {
                        "title" => en.title.push_str(&text),
                        "summary" => en.summary.push_str(&text),
                        "id" if en.id_url.is_empty() => en.id_url = text,
                        "published" => en.published.push_str(&text),
                        "name" if in_author => author.name.push_str(&text),
                        "arxiv:affiliation" if in_author => {
                            author.affiliation = Some(text.trim().to_string())
                        }
                        "arxiv:doi" => en.doi.push_str(&text),
                        "arxiv:journal_ref" => en.journal_ref.push_str(&text),
                        _ => {}
                    },
                    None if current_tag == "opensearch:totalResults" => {
                        page.total_results = text.trim().parse().ok();
                    }
                    None => {}
                }
            }
            Ok(Event::End(e)) => {
                match e.name().as_ref() {
                    b"entry" => {
                        if let Some(en) = entry.take() {
                            // Failed requests come back as a feed with a single error entry.
                            if en.id_url.contains("/api/errors") {
                                let message = en.summary.split_whitespace().collect::<Vec<_>>();
                                return Err(SourceError::Api {
                                    provider: NAME,
                                    status: 400,
                                    message: message.join(" "),
                                });
                            }
                            match en.into_paper() {
                                Some(paper) => page.papers.push(paper),
                                None => tracing::debug!("Skipping arXiv entry without an abs id"),
                            }
                        }
                    }
                    b"author" if in_author => {
                        in_author = false;
                        let name = author.name.trim().to_string();
                        if let Some(en) = entry.as_mut().filter(|_| !name.is_empty()) {
                            en.authors.push(Author {
                                name,
                                affiliation: author.affiliation.take(),
                                orcid: None,
                            });
                        }
                    }
                    _ => {}
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceError::Parse {
                    provider: NAME,
                    message: format!("XML parse error: {}", e),
                })
            }
            _ => {}
        }
        buf.clear();
    }
    Ok(page)
}
